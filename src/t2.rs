//! Tier-2: packet headers and bodies.
//!
//! A packet carries, for one (layer, resolution, component, precinct),
//! each code-block's inclusion state (tag-tree coded on first inclusion),
//! zero bit-plane count, pass count, and codeword-segment lengths,
//! followed by the concatenated codeword bytes. Optional SOP/EPH markers
//! bracket the header. Packed-header side channels (PPM/PPT) move the
//! header bits into the main or tile-part header.

use crate::bio::{BioReader, BioWriter};
use crate::error::{Error, Result};
use crate::event::*;
use crate::index::PacketLengthCache;
use crate::math::floor_log2;
use crate::pi::PacketIter;
use crate::t1::{CblkSty, Segment};
use crate::tcd::{CblkDec, CblkEnc, Tcp, Tile};

/// Start-of-packet marker.
const SOP: u16 = 0xff91;
/// End-of-packet-header marker.
const EPH: u16 = 0xff92;

/// Byte span of one packet inside a tile's bit-stream.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PacketSpan {
  pub layno: u32,
  pub resno: u32,
  pub compno: u32,
  pub precno: u32,
  pub start: usize,
  pub len: usize,
}

/// A tile's packet stream plus its packet index.
pub(crate) struct TileBitstream {
  pub data: Vec<u8>,
  pub packets: Vec<PacketSpan>,
}

/// Maximum passes the decoder assigns to codeword segment `index`.
fn seg_maxpasses(sty: CblkSty, index: usize) -> u32 {
  if sty.contains(CblkSty::TERMALL) {
    1
  } else if sty.contains(CblkSty::LAZY) {
    if index == 0 {
      10
    } else if index % 2 == 1 {
      2
    } else {
      1
    }
  } else {
    109
  }
}

// --- encoder -----------------------------------------------------------

/// Write every packet of layers `0..numlayers` in iterator order.
/// Tag-trees and running per-block tier-2 state reset at entry, so the
/// same tile can be re-encoded during rate-allocation trials.
pub(crate) fn encode_packets(
  tile: &mut Tile<CblkEnc>,
  pi: &mut PacketIter,
  numlayers: u32,
  sop: bool,
  eph: bool,
  out: &mut Vec<u8>,
) -> Result<Vec<PacketSpan>> {
  // Reset per-call coding state.
  for tc in &mut tile.comps {
    for res in &mut tc.resolutions {
      for band in &mut res.bands {
        for prc in &mut band.precincts {
          prc.incl_tree.reset();
          prc.imsb_tree.reset();
          for (cblkno, cblk) in prc.cblks.iter_mut().enumerate() {
            cblk.numlenbits = 3;
            cblk.t2_passes = 0;
            let zbp = (band.numbps as i32 - cblk.numbps as i32).max(0);
            prc.imsb_tree.set_value(cblkno as u32, zbp);
            if let Some(first) = cblk.layers.iter().position(|l| l.numpasses > 0) {
              prc.incl_tree.set_value(cblkno as u32, first as i32);
            }
          }
        }
      }
    }
  }

  pi.restart();
  let mut spans = Vec::new();
  let mut packet_seq = 0u16;
  while let Some(p) = pi.next() {
    if p.layno >= numlayers {
      continue;
    }
    let start = out.len();
    encode_packet(tile, p.layno, p.resno, p.compno, p.precno, sop, eph, packet_seq, out)?;
    spans.push(PacketSpan {
      layno: p.layno,
      resno: p.resno,
      compno: p.compno,
      precno: p.precno,
      start,
      len: out.len() - start,
    });
    packet_seq = packet_seq.wrapping_add(1);
  }
  Ok(spans)
}

fn encode_packet(
  tile: &mut Tile<CblkEnc>,
  layno: u32,
  resno: u32,
  compno: u32,
  precno: u32,
  sop: bool,
  eph: bool,
  packet_seq: u16,
  out: &mut Vec<u8>,
) -> Result<()> {
  if sop {
    out.extend_from_slice(&SOP.to_be_bytes());
    out.extend_from_slice(&4u16.to_be_bytes());
    out.extend_from_slice(&packet_seq.to_be_bytes());
  }
  let res = &mut tile.comps[compno as usize].resolutions[resno as usize];
  let mut bio = BioWriter::new();
  // Non-empty packet bit.
  bio.put_bit(1);
  for band in &mut res.bands {
    let prc = match band.precincts.get_mut(precno as usize) {
      Some(prc) if !prc.cblks.is_empty() => prc,
      _ => continue,
    };
    for (cblkno, cblk) in prc.cblks.iter_mut().enumerate() {
      let layer = cblk.layers[layno as usize];
      if cblk.t2_passes == 0 {
        prc.incl_tree.encode(&mut bio, cblkno as u32, layno as i32 + 1);
      } else {
        bio.put_bit(u32::from(layer.numpasses > 0));
      }
      if layer.numpasses == 0 {
        continue;
      }
      if cblk.t2_passes == 0 {
        cblk.numlenbits = 3;
        prc.imsb_tree.encode(&mut bio, cblkno as u32, 999);
      }
      bio.put_numpasses(layer.numpasses);

      // Length-indicator increase over the terminated groups.
      let first = cblk.t2_passes as usize;
      let last = first + layer.numpasses as usize;
      let mut increment = 0i32;
      let mut nump = 0u32;
      let mut len = 0u32;
      for passno in first..last {
        let pass = &cblk.passes[passno];
        let prev_rate = if passno == 0 {
          0
        } else {
          cblk.passes[passno - 1].rate
        };
        nump += 1;
        len += pass.rate - prev_rate;
        if pass.term || passno + 1 == last {
          let need = if len > 0 { floor_log2(len) as i32 + 1 } else { 0 };
          increment =
            increment.max(need - (cblk.numlenbits as i32 + floor_log2(nump) as i32));
          len = 0;
          nump = 0;
        }
      }
      let increment = increment.max(0) as u32;
      bio.put_comma_code(increment);
      cblk.numlenbits += increment;

      // Segment lengths, grouped the same way.
      let mut nump = 0u32;
      let mut len = 0u32;
      for passno in first..last {
        let pass = &cblk.passes[passno];
        let prev_rate = if passno == 0 {
          0
        } else {
          cblk.passes[passno - 1].rate
        };
        nump += 1;
        len += pass.rate - prev_rate;
        if pass.term || passno + 1 == last {
          bio.put_bits(len, cblk.numlenbits + floor_log2(nump));
          len = 0;
          nump = 0;
        }
      }
      cblk.t2_passes += layer.numpasses;
    }
  }
  out.extend_from_slice(&bio.flush());
  if eph {
    out.extend_from_slice(&EPH.to_be_bytes());
  }
  // Packet body.
  for band in &res.bands {
    let prc = match band.precincts.get(precno as usize) {
      Some(prc) if !prc.cblks.is_empty() => prc,
      _ => continue,
    };
    for cblk in &prc.cblks {
      let layer = cblk.layers[layno as usize];
      if layer.numpasses == 0 {
        continue;
      }
      out.extend_from_slice(&cblk.data[layer.start as usize..(layer.start + layer.len) as usize]);
    }
  }
  Ok(())
}

// --- decoder -----------------------------------------------------------

struct PendingGroup {
  seg_idx: usize,
  numpasses: u32,
  len: u32,
}

/// Parse every packet of the tile's body `data` into per-code-block
/// segments. Header bits come from the packed-header stream when the tile
/// carries one. Truncation produces a warning, not an error: everything
/// parsed so far stays usable.
pub(crate) fn decode_packets(
  tile: &mut Tile<CblkDec>,
  pi: &mut PacketIter,
  data: &[u8],
  tcp: &Tcp,
  max_layers: u32,
  pl: &mut PacketLengthCache,
  events: &Events,
) -> Result<()> {
  let mut body_pos = 0usize;
  let mut header_pos = 0usize;
  let packed = tcp.packed_headers.as_deref();
  pi.restart();
  while let Some(p) = pi.next() {
    let skip_contribution = max_layers != 0 && p.layno >= max_layers;
    let declared = pl.next() as usize;
    if declared != 0 && skip_contribution && packed.is_none() {
      // A declared length lets us hop over the whole packet unparsed.
      if body_pos + declared > data.len() {
        event_msg!(
          events,
          EVT_WARNING,
          "packet stream truncated in tile; decoding what was read"
        );
        return Ok(());
      }
      body_pos += declared;
      continue;
    }
    let packet_start = body_pos;
    let res = match decode_packet(
      tile,
      tcp,
      p.layno,
      p.resno,
      p.compno,
      p.precno,
      data,
      &mut body_pos,
      packed,
      &mut header_pos,
      skip_contribution,
    ) {
      Ok(()) => {
        // Cross-check the declared length; on mismatch degrade to pure
        // header parsing for the rest of the stream.
        if declared != 0 && packed.is_none() && body_pos - packet_start != declared {
          event_msg!(
            events,
            EVT_WARNING,
            "declared packet length {} disagrees with parsed {}; ignoring the length index",
            declared,
            body_pos - packet_start
          );
          pl.invalidate();
        }
        continue;
      }
      Err(e) => e,
    };
    match res {
      Error::TruncatedPacketHeader | Error::UnexpectedEndOfStream => {
        event_msg!(
          events,
          EVT_WARNING,
          "packet stream truncated in tile; decoding what was read"
        );
        return Ok(());
      }
      other => return Err(other),
    }
  }
  Ok(())
}

fn decode_packet(
  tile: &mut Tile<CblkDec>,
  tcp: &Tcp,
  layno: u32,
  resno: u32,
  compno: u32,
  precno: u32,
  data: &[u8],
  body_pos: &mut usize,
  packed: Option<&[u8]>,
  header_pos: &mut usize,
  skip_contribution: bool,
) -> Result<()> {
  let cblksty = tcp.tccps[compno as usize].cblksty;
  let roishift = tcp.tccps[compno as usize].roishift;
  let res = &mut tile.comps[compno as usize].resolutions[resno as usize];

  // Header source: packed stream or the in-band bytes at the cursor.
  let (header, hpos): (&[u8], &mut usize) = match packed {
    Some(ph) => (ph, &mut *header_pos),
    None => (data, &mut *body_pos),
  };

  // Optional SOP before the header.
  if header.len() >= *hpos + 2 && header[*hpos] == 0xff && header[*hpos + 1] == 0x91 {
    if header.len() < *hpos + 6 {
      return Err(Error::TruncatedPacketHeader);
    }
    *hpos += 6;
  }

  let mut bio = BioReader::new(&header[*hpos..]);
  let mut pending: Vec<(usize, Vec<PendingGroup>)> = Vec::new();

  if bio.get_bit()? == 0 {
    // Empty packet.
    bio.align()?;
    let consumed = bio.bytes_read();
    *hpos += consumed;
    consume_eph(header, hpos);
    return Ok(());
  }

  let mut band_start = 0usize;
  for band in res.bands.iter_mut() {
    let prc = match band.precincts.get_mut(precno as usize) {
      Some(prc) if !prc.cblks.is_empty() => prc,
      _ => continue,
    };
    for (cblkno, cblk) in prc.cblks.iter_mut().enumerate() {
      let included = if !cblk.included {
        prc.incl_tree.decode(&mut bio, cblkno as u32, layno as i32 + 1)?
      } else {
        bio.get_bit()? != 0
      };
      if !included {
        continue;
      }
      if !cblk.included {
        // Zero bit-plane count via the second tag-tree.
        let mut zbp = 0i32;
        while !prc.imsb_tree.decode(&mut bio, cblkno as u32, zbp + 1)? {
          zbp += 1;
        }
        cblk.numbps = (band.numbps as i32 + roishift as i32 - zbp).max(0) as u32;
        cblk.numlenbits = 3;
        cblk.included = true;
      }
      let numpasses = bio.get_numpasses()?;
      let increment = bio.get_comma_code()?;
      cblk.numlenbits += increment;

      // Distribute the new passes over codeword segments.
      let mut groups: Vec<PendingGroup> = Vec::new();
      let mut remaining = numpasses;
      while remaining > 0 {
        let need_new = match cblk.segs.last() {
          Some(_) => {
            let idx = cblk.segs.len() - 1;
            let used: u32 = cblk.segs[idx].numpasses;
            used >= seg_maxpasses(cblksty, idx)
          }
          None => true,
        };
        if need_new {
          cblk.segs.push(Segment::default());
        }
        let idx = cblk.segs.len() - 1;
        let room = seg_maxpasses(cblksty, idx) - cblk.segs[idx].numpasses;
        let take = remaining.min(room);
        groups.push(PendingGroup {
          seg_idx: idx,
          numpasses: take,
          len: 0,
        });
        // Reserve the passes now so the next group sees the fill level.
        cblk.segs[idx].numpasses += take;
        remaining -= take;
      }
      for group in &mut groups {
        group.len = bio.get_bits(cblk.numlenbits + floor_log2(group.numpasses))?;
      }
      cblk.numpasses_total += numpasses;
      pending.push((band_start + cblkno, groups));
    }
    band_start += prc.cblks.len();
  }
  bio.align()?;
  let consumed = bio.bytes_read();
  *hpos += consumed;
  consume_eph(header, hpos);

  // With packed headers the SOP marker, if any, sits in the body stream.
  if packed.is_some()
    && data.len() >= *body_pos + 6
    && data[*body_pos] == 0xff
    && data[*body_pos + 1] == 0x91
  {
    *body_pos += 6;
  }

  // Body: codeword bytes in the same code-block order.
  for (flat_idx, groups) in pending {
    let cblk = flat_cblk_mut(res, precno, flat_idx);
    for group in groups {
      let len = group.len as usize;
      if *body_pos + len > data.len() {
        // Keep whatever bytes exist; the block decoder absorbs the rest.
        let avail = data.len().saturating_sub(*body_pos);
        if !skip_contribution {
          let seg = &mut cblk.segs[group.seg_idx];
          if seg.len == 0 {
            seg.start = cblk.data.len();
          }
          seg.len += avail;
          cblk.data.extend_from_slice(&data[*body_pos..*body_pos + avail]);
        }
        *body_pos = data.len();
        return Err(Error::UnexpectedEndOfStream);
      }
      if skip_contribution {
        let seg = &mut cblk.segs[group.seg_idx];
        seg.numpasses = seg.numpasses.saturating_sub(group.numpasses);
      } else {
        let seg = &mut cblk.segs[group.seg_idx];
        if seg.len == 0 {
          seg.start = cblk.data.len();
        }
        seg.len += len;
        cblk.data.extend_from_slice(&data[*body_pos..*body_pos + len]);
      }
      *body_pos += len;
    }
  }
  Ok(())
}

fn consume_eph(header: &[u8], hpos: &mut usize) {
  if header.len() >= *hpos + 2 && header[*hpos] == 0xff && header[*hpos + 1] == 0x92 {
    *hpos += 2;
  }
}

/// Index a precinct's code-block by its flat position across the
/// resolution's bands.
fn flat_cblk_mut<'t>(
  res: &'t mut crate::tcd::Resolution<CblkDec>,
  precno: u32,
  flat_idx: usize,
) -> &'t mut CblkDec {
  let mut base = 0usize;
  for band in res.bands.iter_mut() {
    if let Some(prc) = band.precincts.get_mut(precno as usize) {
      if prc.cblks.is_empty() {
        continue;
      }
      if flat_idx < base + prc.cblks.len() {
        return &mut prc.cblks[flat_idx - base];
      }
      base += prc.cblks.len();
    }
  }
  unreachable!("flat code-block index out of range");
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::image::{ComponentParams, Image};
  use crate::pi::ProgressionOrder;
  use crate::tcd::{CodingParams, RateControl, Tccp, Tcp, TileDecoder, TileEncoder};

  fn make_image(w: u32, h: u32, numcomps: usize) -> Image {
    let params: Vec<ComponentParams> = (0..numcomps)
      .map(|_| ComponentParams {
        dx: 1,
        dy: 1,
        w: 0,
        h: 0,
        x0: 0,
        y0: 0,
        prec: 8,
        sgnd: false,
      })
      .collect();
    let mut image = Image::new(0, 0, w, h, &params);
    image.alloc_components();
    for (c, comp) in image.comps.iter_mut().enumerate() {
      for (i, v) in comp.data.iter_mut().enumerate() {
        *v = (((i * 7 + c * 31) % 256) as i32 + (i / 97) as i32) & 0xff;
      }
    }
    image
  }

  fn make_tcp(numcomps: usize, numres: u32, numlayers: u32, sop: bool, eph: bool) -> Tcp {
    Tcp {
      prog_order: ProgressionOrder::Lrcp,
      numlayers,
      use_sop: sop,
      use_eph: eph,
      rate_control: RateControl::Fixed,
      tccps: (0..numcomps)
        .map(|_| Tccp {
          numresolutions: numres,
          stepsizes: crate::quant::calc_explicit_stepsizes(true, numres, 8),
          ..Default::default()
        })
        .collect(),
      ..Default::default()
    }
  }

  fn cp_one_tile(w: u32, h: u32) -> CodingParams {
    CodingParams {
      tx0: 0,
      ty0: 0,
      tdx: w,
      tdy: h,
      tw: 1,
      th: 1,
    }
  }

  /// The full tier pipeline round-trips bit-exactly through the packet
  /// layer for a reversible single tile.
  fn tile_round_trip(sop: bool, eph: bool, numlayers: u32) {
    let image = make_image(77, 53, 1);
    let cp = cp_one_tile(77, 53);
    let tcp = make_tcp(1, 3, numlayers, sop, eph);
    let events = Events::new();
    let mut enc = TileEncoder::new(0, &cp, &image, &tcp, &events);
    let bitstream = enc.encode().unwrap();
    assert!(!bitstream.packets.is_empty());

    let mut dec = TileDecoder::new(0, &cp, &image, &tcp, &events, 0, None, 0);
    dec.t2_decode(&bitstream.data, &mut crate::index::PacketLengthCache::new()).unwrap();
    dec.reconstruct().unwrap();
    assert_eq!(dec.tile.comps[0].data, image.comps[0].data);
  }

  #[test]
  fn packet_round_trip_plain() {
    tile_round_trip(false, false, 1);
  }

  #[test]
  fn packet_round_trip_sop_eph() {
    tile_round_trip(true, true, 1);
  }

  #[test]
  fn packet_round_trip_multiple_layers() {
    tile_round_trip(false, false, 3);
  }

  #[test]
  fn packet_count_matches_formula() {
    let image = make_image(128, 128, 1);
    let cp = cp_one_tile(128, 128);
    let tcp = make_tcp(1, 4, 2, false, false);
    let events = Events::new();
    let mut enc = TileEncoder::new(0, &cp, &image, &tcp, &events);
    let bitstream = enc.encode().unwrap();
    let expected = crate::tcd::packet_count(&enc.tile, tcp.numlayers);
    assert_eq!(bitstream.packets.len() as u64, expected);
  }

  #[test]
  fn truncated_stream_is_tolerated() {
    let image = make_image(64, 64, 1);
    let cp = cp_one_tile(64, 64);
    let tcp = make_tcp(1, 3, 1, false, false);
    let events = Events::new();
    let mut enc = TileEncoder::new(0, &cp, &image, &tcp, &events);
    let bitstream = enc.encode().unwrap();

    let cut = bitstream.data.len() / 2;
    let mut dec = TileDecoder::new(0, &cp, &image, &tcp, &events, 0, None, 0);
    dec.t2_decode(&bitstream.data[..cut], &mut crate::index::PacketLengthCache::new()).unwrap();
    dec.reconstruct().unwrap();
    assert_eq!(dec.tile.comps[0].data.len(), 64 * 64);
  }
}
