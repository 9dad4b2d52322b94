//! JP2 container: the boxed file format around the raw code-stream.
//!
//! Output always emits the mandated sequence jP, ftyp, jp2h (ihdr,
//! optional bpcc, colr, optional cdef/pclr/cmap/res), any uuid boxes,
//! then jp2c. The reader is tolerant after a good jp2c: trailing box
//! damage degrades to warnings.

use crate::cio::{Reader, Writer};
use crate::error::{Error, Result};
use crate::event::*;
use crate::image::{ChannelDef, ColorSpace, Image, Palette};

const BOX_JP: u32 = 0x6a50_2020;
const BOX_FTYP: u32 = 0x6674_7970;
const BOX_JP2H: u32 = 0x6a70_3268;
const BOX_IHDR: u32 = 0x6968_6472;
const BOX_BPCC: u32 = 0x6270_6363;
const BOX_COLR: u32 = 0x636f_6c72;
const BOX_PCLR: u32 = 0x7063_6c72;
const BOX_CMAP: u32 = 0x636d_6170;
const BOX_CDEF: u32 = 0x6364_6566;
const BOX_RES: u32 = 0x7265_7320;
const BOX_RESC: u32 = 0x7265_7363;
const BOX_RESD: u32 = 0x7265_7364;
const BOX_JP2C: u32 = 0x6a70_3263;
const BOX_UUID: u32 = 0x7575_6964;
const BOX_XML: u32 = 0x786d_6c20;
const BOX_ASOC: u32 = 0x6173_6f63;

const JP2_SIGNATURE: u32 = 0x0d0a_870a;
const BRAND_JP2: u32 = 0x6a70_3220;

/// Parsed box header: type plus the content span.
#[derive(Debug, Clone, Copy)]
struct BoxHeader {
  ty: u32,
  content_start: usize,
  content_len: usize,
}

/// Read one box header at the cursor. `jp2c_seen` gates the zero-length
/// "extends to end of file" rule.
fn read_box_header(r: &mut Reader<'_>, total_len: usize, jp2c_seen: bool) -> Result<BoxHeader> {
  let box_start = r.position();
  let len32 = r.read_u32()?;
  let ty = r.read_u32()?;
  let (content_start, content_len) = match len32 {
    0 => {
      // Last box runs to the end of the file, but only for the
      // code-stream box (or once the code-stream was already found).
      if ty != BOX_JP2C && !jp2c_seen {
        return Err(Error::CorruptJP2Box(format!(
          "zero-length box type 0x{:08x} before the code-stream",
          ty
        )));
      }
      (r.position(), total_len - r.position())
    }
    1 => {
      let xl = r.read_u64()?;
      if xl < 16 {
        return Err(Error::CorruptJP2Box(format!(
          "extended box length {} below header size",
          xl
        )));
      }
      (r.position(), (xl - 16) as usize)
    }
    2..=7 => {
      return Err(Error::CorruptJP2Box(format!(
        "box length {} below header size",
        len32
      )));
    }
    n => (r.position(), n as usize - 8),
  };
  if content_start + content_len > total_len {
    return Err(Error::CorruptJP2Box(format!(
      "box type 0x{:08x} at {} extends beyond its container",
      ty, box_start
    )));
  }
  Ok(BoxHeader {
    ty,
    content_start,
    content_len,
  })
}

/// A UUID box: 16-byte identifier plus opaque payload.
#[derive(Debug, Clone)]
pub struct UuidBox {
  pub id: [u8; 16],
  pub data: Vec<u8>,
}

/// Everything the container carries besides the code-stream itself.
#[derive(Debug, Default)]
pub(crate) struct Jp2File {
  /// Byte range of the code-stream inside the file.
  pub codestream: core::ops::Range<usize>,
  pub color_space: ColorSpace,
  pub icc_profile: Option<Vec<u8>>,
  pub palette: Option<Palette>,
  pub channel_defs: Vec<ChannelDef>,
  pub capture_resolution: Option<(f64, f64)>,
  pub uuids: Vec<UuidBox>,
  pub xml: Vec<Vec<u8>>,
}

/// True when the buffer opens with the JP2 signature box.
pub(crate) fn is_jp2(data: &[u8]) -> bool {
  data.len() >= 12
    && data[..4] == [0, 0, 0, 12]
    && data[4..8] == BOX_JP.to_be_bytes()
    && data[8..12] == JP2_SIGNATURE.to_be_bytes()
}

pub(crate) fn parse_jp2(data: &[u8], events: &Events) -> Result<Jp2File> {
  let mut r = Reader::new(data);
  let mut file = Jp2File::default();
  let mut jp2c_seen = false;
  let mut jp2h_seen = false;

  // Signature box must come first, ftyp second.
  let sig = read_box_header(&mut r, data.len(), false)?;
  if sig.ty != BOX_JP || sig.content_len != 4 {
    return Err(Error::CorruptJP2Box("missing JP2 signature box".into()));
  }
  if r.read_u32()? != JP2_SIGNATURE {
    return Err(Error::CorruptJP2Box("bad JP2 signature".into()));
  }
  let ftyp = read_box_header(&mut r, data.len(), false)?;
  if ftyp.ty != BOX_FTYP {
    return Err(Error::CorruptJP2Box("expected ftyp box".into()));
  }
  {
    let mut fr = Reader::new(r.take(ftyp.content_len)?);
    let brand = fr.read_u32()?;
    let _minv = fr.read_u32()?;
    let mut jp2_brand = brand == BRAND_JP2;
    while fr.remaining() >= 4 {
      jp2_brand |= fr.read_u32()? == BRAND_JP2;
    }
    if !jp2_brand {
      event_msg!(
        events,
        EVT_WARNING,
        "file brand is not 'jp2 '; attempting to read anyway"
      );
    }
  }

  while r.remaining() >= 8 {
    let hdr = match read_box_header(&mut r, data.len(), jp2c_seen) {
      Ok(hdr) => hdr,
      Err(err) => {
        if jp2c_seen {
          event_msg!(events, EVT_WARNING, "ignoring trailing box damage: {}", err);
          break;
        }
        return Err(err);
      }
    };
    r.seek(hdr.content_start)?;
    let content = r.take(hdr.content_len)?;
    match hdr.ty {
      BOX_JP2H => {
        read_jp2h(content, &mut file, events)?;
        jp2h_seen = true;
      }
      BOX_JP2C => {
        if !jp2h_seen {
          return Err(Error::CorruptJP2Box(
            "code-stream box before the jp2h header box".into(),
          ));
        }
        if !jp2c_seen {
          file.codestream = hdr.content_start..hdr.content_start + hdr.content_len;
          jp2c_seen = true;
        }
      }
      BOX_UUID => {
        if content.len() >= 16 {
          let mut id = [0u8; 16];
          id.copy_from_slice(&content[..16]);
          file.uuids.push(UuidBox {
            id,
            data: content[16..].to_vec(),
          });
        }
      }
      BOX_XML => file.xml.push(content.to_vec()),
      BOX_ASOC => {
        // Association boxes nest label/xml children; surface the raw
        // payload for the caller.
        file.xml.push(content.to_vec());
      }
      other => {
        event_msg!(events, EVT_INFO, "skipping box type 0x{:08x}", other);
      }
    }
  }
  if !jp2c_seen {
    return Err(Error::CorruptJP2Box("no code-stream box found".into()));
  }
  Ok(file)
}

fn read_jp2h(content: &[u8], file: &mut Jp2File, events: &Events) -> Result<()> {
  let mut r = Reader::new(content);
  let mut ihdr_seen = false;
  while r.remaining() >= 8 {
    let hdr = read_box_header(&mut r, content.len(), false)?;
    r.seek(hdr.content_start)?;
    let body = r.take(hdr.content_len)?;
    match hdr.ty {
      BOX_IHDR => {
        if body.len() < 14 {
          return Err(Error::CorruptJP2Box("short ihdr box".into()));
        }
        ihdr_seen = true;
      }
      BOX_BPCC => {
        // Per-component depths; the code-stream's SIZ is authoritative.
      }
      BOX_COLR => read_colr(body, file, events)?,
      BOX_PCLR => read_pclr(body, file)?,
      BOX_CMAP => read_cmap(body, file)?,
      BOX_CDEF => read_cdef(body, file)?,
      BOX_RES => read_res(body, file)?,
      other => {
        event_msg!(
          events,
          EVT_INFO,
          "skipping header sub-box type 0x{:08x}",
          other
        );
      }
    }
  }
  if !ihdr_seen {
    return Err(Error::CorruptJP2Box("jp2h without ihdr".into()));
  }
  Ok(())
}

fn read_colr(body: &[u8], file: &mut Jp2File, events: &Events) -> Result<()> {
  let mut r = Reader::new(body);
  let meth = r.read_u8()?;
  let _prec = r.read_u8()?;
  let _approx = r.read_u8()?;
  match meth {
    1 => {
      let enumcs = r.read_u32()?;
      file.color_space = ColorSpace::from_enumcs(enumcs);
      if file.color_space == ColorSpace::Unknown {
        event_msg!(events, EVT_WARNING, "unknown enumerated colour space {}", enumcs);
      }
    }
    2 => {
      file.icc_profile = Some(body[3..].to_vec());
    }
    other => {
      event_msg!(events, EVT_WARNING, "unsupported colr method {}", other);
    }
  }
  Ok(())
}

fn read_pclr(body: &[u8], file: &mut Jp2File) -> Result<()> {
  let mut r = Reader::new(body);
  let num_entries = r.read_u16()?;
  let num_cols = r.read_u8()? as usize;
  if num_entries == 0 || num_cols == 0 {
    return Err(Error::CorruptJP2Box("empty palette".into()));
  }
  let mut columns = Vec::with_capacity(num_cols);
  for _ in 0..num_cols {
    let b = r.read_u8()?;
    let depth = (b & 0x7f) + 1;
    if depth > 32 {
      return Err(Error::CorruptJP2Box(format!(
        "palette column depth {} unsupported",
        depth
      )));
    }
    columns.push((depth, b & 0x80 != 0));
  }
  let mut entries = Vec::with_capacity(num_entries as usize * num_cols);
  for _ in 0..num_entries {
    for &(depth, _) in &columns {
      let bytes = (usize::from(depth) + 7) / 8;
      entries.push(r.read_uint(bytes)? as i32);
    }
  }
  let palette = file.palette.get_or_insert_with(Palette::default);
  palette.num_entries = num_entries;
  palette.columns = columns;
  palette.entries = entries;
  Ok(())
}

fn read_cmap(body: &[u8], file: &mut Jp2File) -> Result<()> {
  let mut r = Reader::new(body);
  let palette = file.palette.get_or_insert_with(Palette::default);
  palette.cmap.clear();
  while r.remaining() >= 4 {
    let cmp = r.read_u16()?;
    let mtyp = r.read_u8()?;
    let pcol = r.read_u8()?;
    palette.cmap.push((cmp, mtyp, pcol));
  }
  Ok(())
}

fn read_cdef(body: &[u8], file: &mut Jp2File) -> Result<()> {
  let mut r = Reader::new(body);
  let n = r.read_u16()?;
  for _ in 0..n {
    let channel = r.read_u16()?;
    let typ = r.read_u16()?;
    let assoc = r.read_u16()?;
    file.channel_defs.push(ChannelDef {
      channel,
      typ,
      assoc,
    });
  }
  Ok(())
}

fn read_res(body: &[u8], file: &mut Jp2File) -> Result<()> {
  let mut r = Reader::new(body);
  while r.remaining() >= 8 {
    let hdr = read_box_header(&mut r, body.len(), false)?;
    r.seek(hdr.content_start)?;
    let sub = r.take(hdr.content_len)?;
    if (hdr.ty == BOX_RESC || hdr.ty == BOX_RESD) && sub.len() >= 10 {
      let vn = u16::from_be_bytes([sub[0], sub[1]]) as f64;
      let vd = u16::from_be_bytes([sub[2], sub[3]]) as f64;
      let hn = u16::from_be_bytes([sub[4], sub[5]]) as f64;
      let hd = u16::from_be_bytes([sub[6], sub[7]]) as f64;
      let ve = sub[8] as i8;
      let he = sub[9] as i8;
      if vd != 0.0 && hd != 0.0 {
        file.capture_resolution = Some((
          hn / hd * 10f64.powi(i32::from(he)),
          vn / vd * 10f64.powi(i32::from(ve)),
        ));
      }
    }
  }
  Ok(())
}

/// Copy container metadata onto a decoded image.
pub(crate) fn apply_metadata(file: &Jp2File, image: &mut Image) {
  image.color_space = file.color_space;
  image.icc_profile = file.icc_profile.clone();
  image.palette = file.palette.clone();
  image.channel_defs = file.channel_defs.clone();
  image.capture_resolution = file.capture_resolution;
  crate::image::apply_palette(image);
  crate::image::apply_channel_defs(image);
}

// --- writer ------------------------------------------------------------

fn begin_box(w: &mut Writer, ty: u32) -> usize {
  let pos = w.len();
  w.write_u32(0);
  w.write_u32(ty);
  pos
}

fn end_box(w: &mut Writer, pos: usize) {
  let len = (w.len() - pos) as u32;
  w.patch_u32(pos, len);
}

/// Wrap a code-stream into a JP2 file with the image's metadata.
pub(crate) fn write_jp2(codestream: &[u8], image: &Image, uuids: &[UuidBox]) -> Vec<u8> {
  let mut w = Writer::new();

  // Signature and file type.
  w.write_u32(12);
  w.write_u32(BOX_JP);
  w.write_u32(JP2_SIGNATURE);
  let p = begin_box(&mut w, BOX_FTYP);
  w.write_u32(BRAND_JP2);
  w.write_u32(0);
  w.write_u32(BRAND_JP2);
  end_box(&mut w, p);

  // Header super-box.
  let jp2h = begin_box(&mut w, BOX_JP2H);
  {
    let p = begin_box(&mut w, BOX_IHDR);
    w.write_u32(image.height());
    w.write_u32(image.width());
    w.write_u16(image.comps.len() as u16);
    let uniform_depth = image
      .comps
      .iter()
      .all(|c| c.prec == image.comps[0].prec && c.sgnd == image.comps[0].sgnd);
    let bpc = if uniform_depth {
      ((image.comps[0].prec - 1) as u8) | if image.comps[0].sgnd { 0x80 } else { 0 }
    } else {
      0xff
    };
    w.write_u8(bpc);
    w.write_u8(7); // compression type: code-stream
    w.write_u8(0); // colour space known
    w.write_u8(0); // no intellectual property box
    end_box(&mut w, p);

    if !uniform_depth {
      let p = begin_box(&mut w, BOX_BPCC);
      for comp in &image.comps {
        w.write_u8(((comp.prec - 1) as u8) | if comp.sgnd { 0x80 } else { 0 });
      }
      end_box(&mut w, p);
    }

    let p = begin_box(&mut w, BOX_COLR);
    match &image.icc_profile {
      Some(icc) => {
        w.write_u8(2);
        w.write_u8(0);
        w.write_u8(0);
        w.write_bytes(icc);
      }
      None => {
        w.write_u8(1);
        w.write_u8(0);
        w.write_u8(0);
        let enumcs = image.color_space.enumcs().unwrap_or_else(|| {
          if image.comps.len() >= 3 {
            16
          } else {
            17
          }
        });
        w.write_u32(enumcs);
      }
    }
    end_box(&mut w, p);

    if !image.channel_defs.is_empty() {
      let p = begin_box(&mut w, BOX_CDEF);
      w.write_u16(image.channel_defs.len() as u16);
      for def in &image.channel_defs {
        w.write_u16(def.channel);
        w.write_u16(def.typ);
        w.write_u16(def.assoc);
      }
      end_box(&mut w, p);
    }

    if let Some(palette) = &image.palette {
      let p = begin_box(&mut w, BOX_PCLR);
      w.write_u16(palette.num_entries);
      w.write_u8(palette.columns.len() as u8);
      for &(depth, sgnd) in &palette.columns {
        w.write_u8((depth - 1) | if sgnd { 0x80 } else { 0 });
      }
      for (i, &v) in palette.entries.iter().enumerate() {
        // Each entry takes ceil(depth / 8) bytes of its column.
        let depth = palette.columns[i % palette.columns.len()].0;
        w.write_uint(v as u32, (usize::from(depth) + 7) / 8);
      }
      end_box(&mut w, p);

      let p = begin_box(&mut w, BOX_CMAP);
      for &(cmp, mtyp, pcol) in &palette.cmap {
        w.write_u16(cmp);
        w.write_u8(mtyp);
        w.write_u8(pcol);
      }
      end_box(&mut w, p);
    }

    if let Some((hres, vres)) = image.capture_resolution {
      let p = begin_box(&mut w, BOX_RES);
      let sub = begin_box(&mut w, BOX_RESC);
      let (hn, he) = res_rational(hres);
      let (vn, ve) = res_rational(vres);
      w.write_u16(vn);
      w.write_u16(1);
      w.write_u16(hn);
      w.write_u16(1);
      w.write_u8(ve as u8);
      w.write_u8(he as u8);
      end_box(&mut w, sub);
      end_box(&mut w, p);
    }
  }
  end_box(&mut w, jp2h);

  for uuid in uuids {
    let p = begin_box(&mut w, BOX_UUID);
    w.write_bytes(&uuid.id);
    w.write_bytes(&uuid.data);
    end_box(&mut w, p);
  }

  let p = begin_box(&mut w, BOX_JP2C);
  w.write_bytes(codestream);
  end_box(&mut w, p);

  w.into_vec()
}

/// Approximate a pixels-per-metre value as n * 10^e with 16-bit n.
fn res_rational(v: f64) -> (u16, i8) {
  let mut n = v;
  let mut e = 0i8;
  while n > 65535.0 && e < 10 {
    n /= 10.0;
    e += 1;
  }
  while n != 0.0 && n < 6553.0 && e > -10 {
    n *= 10.0;
    e -= 1;
  }
  (n.round().min(65535.0) as u16, e)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::image::ComponentParams;

  fn rgba_image() -> Image {
    let params: Vec<ComponentParams> = (0..4)
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
    let mut image = Image::new(0, 0, 16, 16, &params);
    image.alloc_components();
    image.color_space = ColorSpace::Srgb;
    image.channel_defs = vec![
      ChannelDef {
        channel: 0,
        typ: 0,
        assoc: 1,
      },
      ChannelDef {
        channel: 1,
        typ: 0,
        assoc: 2,
      },
      ChannelDef {
        channel: 2,
        typ: 0,
        assoc: 3,
      },
      ChannelDef {
        channel: 3,
        typ: 1,
        assoc: 0,
      },
    ];
    image
  }

  #[test]
  fn wrapper_round_trip_with_cdef() {
    let image = rgba_image();
    let codestream = vec![0xffu8, 0x4f, 0xff, 0xd9];
    let data = write_jp2(&codestream, &image, &[]);
    assert!(is_jp2(&data));

    let events = Events::new();
    let parsed = parse_jp2(&data, &events).unwrap();
    assert_eq!(&data[parsed.codestream.clone()], &codestream[..]);
    assert_eq!(parsed.color_space, ColorSpace::Srgb);
    assert_eq!(parsed.channel_defs.len(), 4);
    let alpha = parsed.channel_defs.iter().find(|d| d.channel == 3).unwrap();
    assert_eq!((alpha.typ, alpha.assoc), (1, 0));
  }

  #[test]
  fn exactly_one_jp2h_with_ihdr_colr_cdef() {
    let image = rgba_image();
    let data = write_jp2(&[0xff, 0x4f], &image, &[]);
    let count = |needle: &[u8]| {
      data
        .windows(needle.len())
        .filter(|w| *w == needle)
        .count()
    };
    assert_eq!(count(b"jp2h"), 1);
    assert_eq!(count(b"ihdr"), 1);
    assert_eq!(count(b"colr"), 1);
    assert_eq!(count(b"cdef"), 1);
  }

  #[test]
  fn truncated_box_is_fatal_before_codestream() {
    let image = rgba_image();
    let data = write_jp2(&[0xff, 0x4f], &image, &[]);
    let events = Events::new();
    let err = parse_jp2(&data[..40], &events).unwrap_err();
    assert!(matches!(err, Error::CorruptJP2Box(_) | Error::UnexpectedEndOfStream));
  }

  #[test]
  fn uuid_boxes_round_trip() {
    let image = rgba_image();
    let uuid = UuidBox {
      id: *b"0123456789abcdef",
      data: vec![1, 2, 3, 4],
    };
    let data = write_jp2(&[0xff, 0x4f], &image, &[uuid]);
    let events = Events::new();
    let parsed = parse_jp2(&data, &events).unwrap();
    assert_eq!(parsed.uuids.len(), 1);
    assert_eq!(parsed.uuids[0].id, *b"0123456789abcdef");
    assert_eq!(parsed.uuids[0].data, vec![1, 2, 3, 4]);
  }

  #[test]
  fn zero_length_jp2c_extends_to_eof() {
    let image = rgba_image();
    let mut data = write_jp2(&[0xff, 0x4f, 0xff, 0xd9], &image, &[]);
    // Rewrite the jp2c length field to 0.
    let pos = data
      .windows(4)
      .position(|w| w == b"jp2c")
      .expect("has jp2c")
      - 4;
    data[pos..pos + 4].copy_from_slice(&[0, 0, 0, 0]);
    let events = Events::new();
    let parsed = parse_jp2(&data, &events).unwrap();
    assert_eq!(&data[parsed.codestream.clone()], &[0xff, 0x4f, 0xff, 0xd9]);
  }
}
