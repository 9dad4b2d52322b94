//! Code-stream layer: marker segments, main-header and tile-part state
//! machines, and whole-stream encode/decode drivers.
//!
//! Every marker is two bytes, 0xFF4F..=0xFFFF; all but SOC/SOD/EOC and the
//! in-bit-stream SOP/EPH carry a 16-bit length that counts itself. The
//! decoder enforces a per-marker allowed-state mask and treats main-header
//! violations as fatal.

use bitflags::bitflags;

use crate::cio::{Reader, Writer};
use crate::error::{Error, Result};
use crate::event::*;
use crate::image::{ColorSpace, ComponentParams, Image};
use crate::index::{PacketLengthCache, TlmIndex};
use crate::math::{ceil_div, ceil_div_pow2, Rect};
use crate::pi::ProgressionOrder;
use crate::quant::{expand_derived, QuantStyle, StepSize};
use crate::t1::CblkSty;
use crate::tcd::{CodingParams, MctMode, Poc, Tccp, Tcp, TileDecoder, TileEncoder};

bitflags! {
  /// Decoder states; each marker declares the states it may appear in.
  pub struct J2kState: u32 {
    const MHSOC = 0x0001;
    const MHSIZ = 0x0002;
    const MH = 0x0004;
    const TPHSOT = 0x0008;
    const TPH = 0x0010;
    const DATA = 0x0080;
    const NEOC = 0x0040;
    const EOC = 0x0100;
    const ERR = 0x8000;
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Marker {
  Soc,
  Sot,
  Sod,
  Eoc,
  Siz,
  Cap,
  Cod,
  Coc,
  Qcd,
  Qcc,
  Rgn,
  Poc,
  Tlm,
  Plm,
  Plt,
  Ppm,
  Ppt,
  Sop,
  Eph,
  Crg,
  Com,
  Mct,
  Mcc,
  Mco,
  Cbd,
  Unknown(u16),
}

impl From<u16> for Marker {
  fn from(v: u16) -> Self {
    match v {
      0xff4f => Marker::Soc,
      0xff90 => Marker::Sot,
      0xff93 => Marker::Sod,
      0xffd9 => Marker::Eoc,
      0xff51 => Marker::Siz,
      0xff50 => Marker::Cap,
      0xff52 => Marker::Cod,
      0xff53 => Marker::Coc,
      0xff5c => Marker::Qcd,
      0xff5d => Marker::Qcc,
      0xff5e => Marker::Rgn,
      0xff5f => Marker::Poc,
      0xff55 => Marker::Tlm,
      0xff57 => Marker::Plm,
      0xff58 => Marker::Plt,
      0xff60 => Marker::Ppm,
      0xff61 => Marker::Ppt,
      0xff91 => Marker::Sop,
      0xff92 => Marker::Eph,
      0xff63 => Marker::Crg,
      0xff64 => Marker::Com,
      0xff74 => Marker::Mct,
      0xff75 => Marker::Mcc,
      0xff77 => Marker::Mco,
      0xff78 => Marker::Cbd,
      other => Marker::Unknown(other),
    }
  }
}

impl Marker {
  pub fn code(self) -> u16 {
    match self {
      Marker::Soc => 0xff4f,
      Marker::Sot => 0xff90,
      Marker::Sod => 0xff93,
      Marker::Eoc => 0xffd9,
      Marker::Siz => 0xff51,
      Marker::Cap => 0xff50,
      Marker::Cod => 0xff52,
      Marker::Coc => 0xff53,
      Marker::Qcd => 0xff5c,
      Marker::Qcc => 0xff5d,
      Marker::Rgn => 0xff5e,
      Marker::Poc => 0xff5f,
      Marker::Tlm => 0xff55,
      Marker::Plm => 0xff57,
      Marker::Plt => 0xff58,
      Marker::Ppm => 0xff60,
      Marker::Ppt => 0xff61,
      Marker::Sop => 0xff91,
      Marker::Eph => 0xff92,
      Marker::Crg => 0xff63,
      Marker::Com => 0xff64,
      Marker::Mct => 0xff74,
      Marker::Mcc => 0xff75,
      Marker::Mco => 0xff77,
      Marker::Cbd => 0xff78,
      Marker::Unknown(v) => v,
    }
  }

  /// States in which this marker may legally appear.
  pub fn states(self) -> J2kState {
    match self {
      Marker::Soc => J2kState::MHSOC,
      Marker::Siz => J2kState::MHSIZ,
      Marker::Sot => J2kState::MH | J2kState::TPHSOT,
      Marker::Sod => J2kState::TPH,
      Marker::Eoc => J2kState::TPHSOT | J2kState::NEOC,
      Marker::Tlm | Marker::Plm | Marker::Ppm | Marker::Crg | Marker::Cap | Marker::Cbd => {
        J2kState::MH
      }
      Marker::Plt | Marker::Ppt => J2kState::TPH,
      Marker::Sop | Marker::Eph => J2kState::empty(),
      _ => J2kState::MH | J2kState::TPH,
    }
  }
}

/// Does Csiz require two-byte component indices?
fn wide_comps(numcomps: usize) -> bool {
  numcomps > 256
}

// --- decoder -----------------------------------------------------------

/// Decode-side options handed down from the facade.
#[derive(Debug, Clone, Default)]
pub(crate) struct DecodeOptions {
  pub reduce: u32,
  /// 0 = every layer.
  pub layers: u32,
  /// Decode window on the canvas.
  pub area: Option<Rect>,
  /// Component subset; empty = all.
  pub components: Vec<u32>,
  pub strict: bool,
}

/// A fully parsed code-stream: header state plus per-tile body bytes.
pub(crate) struct ParsedCodestream {
  pub image: Image,
  pub cp: CodingParams,
  pub tcps: Vec<Tcp>,
  pub tile_data: Vec<Vec<u8>>,
  pub tile_parts_seen: Vec<u32>,
  pub tlm: TlmIndex,
  pub plm: PacketLengthCache,
  pub ht_signalled: bool,
}

pub(crate) struct CodestreamDecoder<'e> {
  events: &'e Events,
  opts: DecodeOptions,
  state: J2kState,
  image: Image,
  cp: CodingParams,
  default_tcp: Tcp,
  tcps: Vec<Tcp>,
  tile_data: Vec<Vec<u8>>,
  tile_parts_seen: Vec<u32>,
  tile_parts_declared: Vec<u32>,
  tile_has_ppt: Vec<bool>,
  /// PPM segments keyed by Zppm, merged once the main header ends.
  ppm_segments: Vec<(u8, Vec<u8>)>,
  /// PPT segments of the current tile, keyed by Zppt.
  ppt_segments: Vec<(u8, Vec<u8>)>,
  /// Queue of per-tile-part packed headers merged out of PPM.
  ppm_records: Vec<Vec<u8>>,
  ppm_next: usize,
  tlm: TlmIndex,
  tlm_implicit_tile: u32,
  plm: PacketLengthCache,
  /// Raw MCT arrays by index, decoded as f32.
  mct_arrays: Vec<(u8, Vec<f32>)>,
  cur_tileno: u32,
  cur_part_end: usize,
  ht_signalled: bool,
  seen_cod: bool,
  seen_qcd: bool,
}

impl<'e> CodestreamDecoder<'e> {
  pub fn new(events: &'e Events, opts: DecodeOptions) -> Self {
    Self {
      events,
      opts,
      state: J2kState::MHSOC,
      image: Image::default(),
      cp: CodingParams::default(),
      default_tcp: Tcp::default(),
      tcps: Vec::new(),
      tile_data: Vec::new(),
      tile_parts_seen: Vec::new(),
      tile_parts_declared: Vec::new(),
      tile_has_ppt: Vec::new(),
      ppm_segments: Vec::new(),
      ppt_segments: Vec::new(),
      ppm_records: Vec::new(),
      ppm_next: 0,
      tlm: TlmIndex::new(),
      tlm_implicit_tile: 0,
      plm: PacketLengthCache::new(),
      mct_arrays: Vec::new(),
      cur_tileno: 0,
      cur_part_end: 0,
      ht_signalled: false,
      seen_cod: false,
      seen_qcd: false,
    }
  }

  /// Walk the whole code-stream, gathering header state and tile bodies.
  pub fn parse(mut self, data: &[u8]) -> Result<ParsedCodestream> {
    let mut r = Reader::new(data);
    loop {
      if self.state.contains(J2kState::EOC) {
        break;
      }
      if r.remaining() < 2 {
        if self.state.contains(J2kState::TPHSOT) || self.state.contains(J2kState::NEOC) {
          event_msg!(
            self.events,
            EVT_WARNING,
            "stream ended without EOC marker"
          );
          break;
        }
        return Err(Error::UnexpectedEndOfStream);
      }
      let code = r.read_u16()?;
      if code < 0xff00 {
        return Err(Error::InvalidMarker(u32::from(code)));
      }
      if (0xff30..=0xff3f).contains(&code) {
        // Reserved segment-less markers: skip.
        continue;
      }
      let marker = Marker::from(code);
      if matches!(marker, Marker::Sop | Marker::Eph) {
        // Packet delimiters live inside tile bodies, never here.
        return Err(Error::InvalidMarker(u32::from(code)));
      }
      let allowed = marker.states();
      let in_state = match marker {
        Marker::Unknown(_) => true,
        _ => allowed.intersects(self.state),
      };
      if !in_state {
        return Err(Error::CorruptCodeStream(format!(
          "marker 0x{:04x} not allowed in this position",
          code
        )));
      }
      match marker {
        Marker::Soc => {
          self.state = J2kState::MHSIZ;
        }
        Marker::Eoc => {
          self.state = J2kState::EOC;
        }
        Marker::Sod => {
          self.read_tile_data(&mut r)?;
        }
        _ => {
          let len = r.read_u16()? as usize;
          if len < 2 {
            return Err(Error::CorruptCodeStream(format!(
              "marker 0x{:04x} declares length {}",
              code, len
            )));
          }
          if len - 2 > r.remaining() {
            return Err(Error::CorruptCodeStream(format!(
              "marker 0x{:04x} overruns the stream",
              code
            )));
          }
          let payload = r.take(len - 2)?;
          self.handle_marker(marker, payload, r.position())?;
        }
      }
    }
    self.finish()
  }

  fn finish(mut self) -> Result<ParsedCodestream> {
    if !self.seen_cod || !self.seen_qcd {
      return Err(Error::CorruptCodeStream(
        "mandatory COD or QCD marker missing".into(),
      ));
    }
    // The TLM table must cover exactly the tile-parts that appeared;
    // otherwise seeking through it would land mid-stream.
    if self.tlm.is_valid() {
      let seen: u32 = self.tile_parts_seen.iter().sum();
      if self.tlm.entries().len() != seen as usize {
        event_msg!(
          self.events,
          EVT_WARNING,
          "TLM declares {} tile-parts but {} appeared; dropping the index",
          self.tlm.entries().len(),
          seen
        );
        self.tlm.invalidate();
      }
    }
    // A tile that never got a PPT keeps its PPM slice; PPT supersedes.
    Ok(ParsedCodestream {
      image: std::mem::take(&mut self.image),
      cp: self.cp.clone(),
      tcps: std::mem::take(&mut self.tcps),
      tile_data: std::mem::take(&mut self.tile_data),
      tile_parts_seen: std::mem::take(&mut self.tile_parts_seen),
      tlm: std::mem::replace(&mut self.tlm, TlmIndex::new()),
      plm: std::mem::replace(&mut self.plm, PacketLengthCache::new()),
      ht_signalled: self.ht_signalled,
    })
  }

  fn handle_marker(&mut self, marker: Marker, payload: &[u8], pos: usize) -> Result<()> {
    let mut r = Reader::new(payload);
    match marker {
      Marker::Siz => self.read_siz(&mut r)?,
      Marker::Cap => self.read_cap(&mut r)?,
      Marker::Cod => self.read_cod(&mut r)?,
      Marker::Coc => self.read_coc(&mut r)?,
      Marker::Qcd => self.read_qcd(&mut r, payload.len())?,
      Marker::Qcc => self.read_qcc(&mut r, payload.len())?,
      Marker::Rgn => self.read_rgn(&mut r)?,
      Marker::Poc => self.read_poc(&mut r, payload.len())?,
      Marker::Tlm => self.read_tlm(&mut r, payload.len())?,
      Marker::Plm => self.read_plm(&mut r, payload.len())?,
      Marker::Plt => self.read_plt(&mut r, payload.len())?,
      Marker::Ppm => self.read_ppm(&mut r, payload.len())?,
      Marker::Ppt => self.read_ppt(&mut r, payload.len())?,
      Marker::Crg => self.read_crg(&mut r)?,
      Marker::Com => self.read_com(&mut r, payload.len())?,
      Marker::Mct => self.read_mct(&mut r, payload.len())?,
      Marker::Mcc | Marker::Mco | Marker::Cbd => {
        // Collections and ordering are validated lazily when applied.
      }
      Marker::Sot => self.read_sot(&mut r, pos)?,
      Marker::Unknown(code) => {
        event_msg!(
          self.events,
          EVT_WARNING,
          "skipping unknown marker 0x{:04x}",
          code
        );
      }
      _ => {}
    }
    Ok(())
  }

  fn read_siz(&mut self, r: &mut Reader<'_>) -> Result<()> {
    let _rsiz = r.read_u16()?;
    let x1 = r.read_u32()?;
    let y1 = r.read_u32()?;
    let x0 = r.read_u32()?;
    let y0 = r.read_u32()?;
    let tdx = r.read_u32()?;
    let tdy = r.read_u32()?;
    let tx0 = r.read_u32()?;
    let ty0 = r.read_u32()?;
    let numcomps = r.read_u16()? as usize;
    if x0 >= x1 || y0 >= y1 {
      return Err(Error::CorruptCodeStream("degenerate image rectangle".into()));
    }
    if numcomps == 0 || numcomps > 16384 {
      return Err(Error::CorruptCodeStream(format!(
        "invalid component count {}",
        numcomps
      )));
    }
    if tdx == 0 || tdy == 0 {
      return Err(Error::CorruptCodeStream("zero tile size".into()));
    }
    if tx0 > x0 || ty0 > y0 {
      return Err(Error::CorruptCodeStream(
        "tile origin beyond image origin".into(),
      ));
    }
    let mut params = Vec::with_capacity(numcomps);
    for _ in 0..numcomps {
      let ssiz = r.read_u8()?;
      let dx = u32::from(r.read_u8()?);
      let dy = u32::from(r.read_u8()?);
      if dx == 0 || dy == 0 {
        return Err(Error::CorruptCodeStream("zero subsampling factor".into()));
      }
      let prec = u32::from(ssiz & 0x7f) + 1;
      if prec > 31 {
        return Err(Error::CorruptCodeStream(format!(
          "component precision {} exceeds the supported 31 bits",
          prec
        )));
      }
      params.push(ComponentParams {
        dx,
        dy,
        w: 0,
        h: 0,
        x0: 0,
        y0: 0,
        prec,
        sgnd: ssiz & 0x80 != 0,
      });
    }
    self.image = Image::new(x0, y0, x1, y1, &params);
    self.cp = CodingParams {
      tx0,
      ty0,
      tdx,
      tdy,
      tw: ceil_div(x1 - tx0, tdx),
      th: ceil_div(y1 - ty0, tdy),
    };
    let numtiles = self.cp.num_tiles() as usize;
    if numtiles > 65535 {
      return Err(Error::CorruptCodeStream(format!(
        "{} tiles exceed the 16-bit tile index",
        numtiles
      )));
    }
    self.default_tcp.tccps = vec![Tccp::default(); numcomps];
    self.tcps = vec![Tcp::default(); numtiles];
    for tcp in &mut self.tcps {
      tcp.tccps = vec![Tccp::default(); numcomps];
    }
    self.tile_data = vec![Vec::new(); numtiles];
    self.tile_parts_seen = vec![0; numtiles];
    self.tile_parts_declared = vec![0; numtiles];
    self.tile_has_ppt = vec![false; numtiles];
    self.state = J2kState::MH;
    Ok(())
  }

  fn read_cap(&mut self, r: &mut Reader<'_>) -> Result<()> {
    let pcap = r.read_u32()?;
    for bit in 0..32 {
      if pcap & (1 << bit) != 0 {
        let ccap = r.read_u16()?;
        let part = 32 - bit;
        if part == 15 {
          self.ht_signalled = true;
          event_msg!(
            self.events,
            EVT_WARNING,
            "capability marker signals an HT (Part 15) code-stream (Ccap 0x{:04x})",
            ccap
          );
        }
      }
    }
    Ok(())
  }

  /// SPcod/SPcoc body shared by COD and COC.
  fn read_spcod(&self, r: &mut Reader<'_>, has_precincts: bool, tccp: &mut Tccp) -> Result<()> {
    let numdecomps = u32::from(r.read_u8()?);
    if numdecomps > 32 {
      return Err(Error::CorruptCodeStream(format!(
        "{} decomposition levels out of range",
        numdecomps
      )));
    }
    tccp.numresolutions = numdecomps + 1;
    let cblkw = u32::from(r.read_u8()?) + 2;
    let cblkh = u32::from(r.read_u8()?) + 2;
    if !(2..=10).contains(&cblkw) || !(2..=10).contains(&cblkh) || cblkw + cblkh > 12 {
      return Err(Error::CorruptCodeStream(format!(
        "code-block size {}x{} out of range",
        cblkw, cblkh
      )));
    }
    tccp.cblkw = cblkw;
    tccp.cblkh = cblkh;
    tccp.cblksty = CblkSty::from_bits_truncate(r.read_u8()?);
    let qmfbid = r.read_u8()?;
    tccp.reversible = qmfbid == 1;
    tccp.prcw.clear();
    tccp.prch.clear();
    if has_precincts {
      for _ in 0..tccp.numresolutions {
        let b = r.read_u8()?;
        tccp.prcw.push(u32::from(b & 0x0f));
        tccp.prch.push(u32::from(b >> 4));
      }
    }
    Ok(())
  }

  fn read_cod(&mut self, r: &mut Reader<'_>) -> Result<()> {
    let scod = r.read_u8()?;
    let prog = r.read_u8()?;
    let numlayers = r.read_u16()?;
    let mct = r.read_u8()?;
    let order = ProgressionOrder::from_u8(prog).ok_or_else(|| {
      Error::CorruptCodeStream(format!("unknown progression order {}", prog))
    })?;
    if numlayers == 0 {
      return Err(Error::CorruptCodeStream("zero quality layers".into()));
    }
    let mut template = Tccp::default();
    self.read_spcod(r, scod & 0x01 != 0, &mut template)?;
    if template.cblksty.contains(CblkSty::HT) {
      self.ht_signalled = true;
    }
    let mct_mode = match mct {
      0 => MctMode::Off,
      1 => MctMode::On,
      2 => MctMode::Custom,
      other => {
        event_msg!(
          self.events,
          EVT_WARNING,
          "unknown multi-component transform {}; treating as none",
          other
        );
        MctMode::Off
      }
    };
    let apply = |tcp: &mut Tcp| {
      tcp.prog_order = order;
      tcp.numlayers = u32::from(numlayers);
      tcp.mct = mct_mode;
      tcp.use_sop = scod & 0x02 != 0;
      tcp.use_eph = scod & 0x04 != 0;
      for tccp in &mut tcp.tccps {
        let q = tccp.qntsty;
        let steps = tccp.stepsizes.clone();
        let gb = tccp.numgbits;
        let roi = tccp.roishift;
        *tccp = template.clone();
        tccp.qntsty = q;
        tccp.stepsizes = steps;
        tccp.numgbits = gb;
        tccp.roishift = roi;
      }
    };
    if self.state.contains(J2kState::MH) {
      apply(&mut self.default_tcp);
      for tcp in &mut self.tcps {
        apply(tcp);
      }
    } else {
      apply(&mut self.tcps[self.cur_tileno as usize]);
    }
    self.seen_cod = true;
    Ok(())
  }

  fn read_comp_index(&self, r: &mut Reader<'_>) -> Result<usize> {
    let idx = if wide_comps(self.image.comps.len()) {
      r.read_u16()? as usize
    } else {
      r.read_u8()? as usize
    };
    if idx >= self.image.comps.len() {
      return Err(Error::CorruptCodeStream(format!(
        "component index {} out of range",
        idx
      )));
    }
    Ok(idx)
  }

  fn read_coc(&mut self, r: &mut Reader<'_>) -> Result<()> {
    let compno = self.read_comp_index(r)?;
    let scoc = r.read_u8()?;
    let mut template = Tccp::default();
    self.read_spcod(r, scoc & 0x01 != 0, &mut template)?;
    let apply = |tcp: &mut Tcp| {
      let tccp = &mut tcp.tccps[compno];
      let q = tccp.qntsty;
      let steps = tccp.stepsizes.clone();
      let gb = tccp.numgbits;
      let roi = tccp.roishift;
      *tccp = template.clone();
      tccp.qntsty = q;
      tccp.stepsizes = steps;
      tccp.numgbits = gb;
      tccp.roishift = roi;
    };
    if self.state.contains(J2kState::MH) {
      apply(&mut self.default_tcp);
      for tcp in &mut self.tcps {
        apply(tcp);
      }
    } else {
      apply(&mut self.tcps[self.cur_tileno as usize]);
    }
    Ok(())
  }

  /// SQcd/SQcc body shared by QCD and QCC.
  fn read_sqcd(&self, r: &mut Reader<'_>, remaining: usize, tccp: &mut Tccp) -> Result<()> {
    let sqcd = r.read_u8()?;
    let qntsty = QuantStyle::from_u8(sqcd & 0x1f).ok_or_else(|| {
      Error::CorruptCodeStream(format!("unknown quantisation style {}", sqcd & 0x1f))
    })?;
    tccp.qntsty = qntsty;
    tccp.numgbits = u32::from(sqcd >> 5);
    tccp.stepsizes.clear();
    let body = remaining - 1;
    match qntsty {
      QuantStyle::NoQuant => {
        for _ in 0..body {
          let e = r.read_u8()?;
          tccp.stepsizes.push(StepSize {
            expn: i32::from(e >> 3),
            mant: 0,
          });
        }
      }
      QuantStyle::ScalarDerived | QuantStyle::ScalarExplicit => {
        for _ in 0..body / 2 {
          let v = r.read_u16()?;
          tccp.stepsizes.push(StepSize {
            expn: i32::from(v >> 11),
            mant: u32::from(v & 0x7ff),
          });
        }
      }
    }
    if tccp.stepsizes.is_empty() {
      return Err(Error::CorruptCodeStream("empty quantisation table".into()));
    }
    if qntsty == QuantStyle::ScalarDerived {
      let numbands = 3 * tccp.numresolutions.max(1) - 2;
      expand_derived(&mut tccp.stepsizes, numbands.max(97));
    }
    Ok(())
  }

  fn read_qcd(&mut self, r: &mut Reader<'_>, len: usize) -> Result<()> {
    let mut template = Tccp::default();
    // Resolution count comes from COD; carry it so derived expansion has
    // enough entries regardless of marker order.
    template.numresolutions = 33;
    self.read_sqcd(r, len, &mut template)?;
    let apply = |tcp: &mut Tcp| {
      for tccp in &mut tcp.tccps {
        tccp.qntsty = template.qntsty;
        tccp.numgbits = template.numgbits;
        tccp.stepsizes = template.stepsizes.clone();
      }
    };
    if self.state.contains(J2kState::MH) {
      apply(&mut self.default_tcp);
      for tcp in &mut self.tcps {
        apply(tcp);
      }
    } else {
      apply(&mut self.tcps[self.cur_tileno as usize]);
    }
    self.seen_qcd = true;
    Ok(())
  }

  fn read_qcc(&mut self, r: &mut Reader<'_>, len: usize) -> Result<()> {
    let compno = self.read_comp_index(r)?;
    let used = if wide_comps(self.image.comps.len()) { 2 } else { 1 };
    let mut template = Tccp::default();
    template.numresolutions = 33;
    self.read_sqcd(r, len - used, &mut template)?;
    let apply = |tcp: &mut Tcp| {
      let tccp = &mut tcp.tccps[compno];
      tccp.qntsty = template.qntsty;
      tccp.numgbits = template.numgbits;
      tccp.stepsizes = template.stepsizes.clone();
    };
    if self.state.contains(J2kState::MH) {
      apply(&mut self.default_tcp);
      for tcp in &mut self.tcps {
        apply(tcp);
      }
    } else {
      apply(&mut self.tcps[self.cur_tileno as usize]);
    }
    Ok(())
  }

  fn read_rgn(&mut self, r: &mut Reader<'_>) -> Result<()> {
    let compno = self.read_comp_index(r)?;
    let srgn = r.read_u8()?;
    let shift = u32::from(r.read_u8()?);
    if srgn != 0 {
      event_msg!(
        self.events,
        EVT_WARNING,
        "RGN style {} unsupported, ignoring region shift",
        srgn
      );
      return Ok(());
    }
    if self.state.contains(J2kState::MH) {
      self.default_tcp.tccps[compno].roishift = shift;
      for tcp in &mut self.tcps {
        tcp.tccps[compno].roishift = shift;
      }
    } else {
      self.tcps[self.cur_tileno as usize].tccps[compno].roishift = shift;
    }
    Ok(())
  }

  fn read_poc(&mut self, r: &mut Reader<'_>, len: usize) -> Result<()> {
    let wide = wide_comps(self.image.comps.len());
    let entry = if wide { 9 } else { 7 };
    let count = len / entry;
    let mut pocs = Vec::with_capacity(count);
    for _ in 0..count {
      let resno0 = u32::from(r.read_u8()?);
      let compno0 = if wide {
        u32::from(r.read_u16()?)
      } else {
        u32::from(r.read_u8()?)
      };
      let layno1 = u32::from(r.read_u16()?);
      let resno1 = u32::from(r.read_u8()?);
      let compno1 = if wide {
        u32::from(r.read_u16()?)
      } else {
        u32::from(r.read_u8()?)
      };
      let prog = r.read_u8()?;
      let order = ProgressionOrder::from_u8(prog).ok_or_else(|| {
        Error::CorruptCodeStream(format!("unknown POC progression {}", prog))
      })?;
      pocs.push(Poc {
        resno0,
        compno0,
        layno1,
        resno1,
        compno1,
        order,
      });
    }
    if self.state.contains(J2kState::MH) {
      self.default_tcp.pocs = pocs.clone();
      for tcp in &mut self.tcps {
        tcp.pocs = pocs.clone();
      }
    } else {
      self.tcps[self.cur_tileno as usize].pocs = pocs;
    }
    Ok(())
  }

  fn read_tlm(&mut self, r: &mut Reader<'_>, len: usize) -> Result<()> {
    let _ztlm = r.read_u8()?;
    let stlm = r.read_u8()?;
    let st = u32::from((stlm >> 4) & 0x3);
    let sp = u32::from((stlm >> 6) & 0x1);
    let body = r.take(len - 2)?;
    let mut implicit = self.tlm_implicit_tile;
    self.tlm.push_segment(body, st, sp, &mut implicit);
    self.tlm_implicit_tile = implicit;
    Ok(())
  }

  fn read_plm(&mut self, r: &mut Reader<'_>, len: usize) -> Result<()> {
    let _zplm = r.read_u8()?;
    let mut remaining = len - 1;
    while remaining > 0 {
      let nplm = r.read_u8()? as usize;
      remaining -= 1;
      let take = nplm.min(remaining);
      let body = r.take(take)?;
      self.plm.push_segment(body);
      remaining -= take;
    }
    Ok(())
  }

  fn read_plt(&mut self, r: &mut Reader<'_>, len: usize) -> Result<()> {
    let _zplt = r.read_u8()?;
    let body = r.take(len - 1)?;
    self.plm.push_segment(body);
    Ok(())
  }

  fn read_ppm(&mut self, r: &mut Reader<'_>, len: usize) -> Result<()> {
    let zppm = r.read_u8()?;
    let body = r.take(len - 1)?.to_vec();
    self.ppm_segments.push((zppm, body));
    Ok(())
  }

  /// PPM carries a sequence of (Nppm, data) records, one per tile-part,
  /// possibly split across segments; rebuild the record queue.
  fn merge_ppm(&mut self) {
    if self.ppm_segments.is_empty() {
      return;
    }
    self.ppm_segments.sort_by_key(|(z, _)| *z);
    let mut all = Vec::new();
    for (_, seg) in self.ppm_segments.drain(..) {
      all.extend_from_slice(&seg);
    }
    let mut pos = 0usize;
    while pos + 4 <= all.len() {
      let n = u32::from_be_bytes([all[pos], all[pos + 1], all[pos + 2], all[pos + 3]]) as usize;
      pos += 4;
      let end = (pos + n).min(all.len());
      self.ppm_records.push(all[pos..end].to_vec());
      pos = end;
    }
  }

  fn read_ppt(&mut self, r: &mut Reader<'_>, len: usize) -> Result<()> {
    let zppt = r.read_u8()?;
    let body = r.take(len - 1)?.to_vec();
    self.ppt_segments.push((zppt, body));
    Ok(())
  }

  fn merge_ppt(&mut self) {
    if self.ppt_segments.is_empty() {
      return;
    }
    self.ppt_segments.sort_by_key(|(z, _)| *z);
    let tcp = &mut self.tcps[self.cur_tileno as usize];
    let dst = tcp.packed_headers.get_or_insert_with(Vec::new);
    for (_, seg) in self.ppt_segments.drain(..) {
      dst.extend_from_slice(&seg);
    }
  }

  fn read_crg(&mut self, r: &mut Reader<'_>) -> Result<()> {
    for compno in 0..self.image.comps.len() {
      let xcrg = r.read_u16()?;
      let ycrg = r.read_u16()?;
      if xcrg != 0 || ycrg != 0 {
        event_msg!(
          self.events,
          EVT_INFO,
          "component {} registration offset ({}, {}) / 65536",
          compno,
          xcrg,
          ycrg
        );
      }
    }
    Ok(())
  }

  fn read_com(&mut self, r: &mut Reader<'_>, len: usize) -> Result<()> {
    let rcom = r.read_u16()?;
    let body = r.take(len - 2)?;
    if rcom == 1 {
      let text = String::from_utf8_lossy(body);
      event_msg!(self.events, EVT_INFO, "comment: {}", text);
    }
    Ok(())
  }

  fn read_mct(&mut self, r: &mut Reader<'_>, len: usize) -> Result<()> {
    let _zmct = r.read_u16()?;
    let imct = r.read_u16()?;
    let _ymct = r.read_u16()?;
    let index = (imct & 0xff) as u8;
    let elem_type = (imct >> 10) & 0x3;
    let body = r.take(len - 6)?;
    let mut values = Vec::new();
    match elem_type {
      0 => {
        for chunk in body.chunks_exact(2) {
          values.push(f32::from(i16::from_be_bytes([chunk[0], chunk[1]])));
        }
      }
      1 => {
        for chunk in body.chunks_exact(4) {
          values.push(i32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f32);
        }
      }
      2 => {
        for chunk in body.chunks_exact(4) {
          values.push(f32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
      }
      _ => {
        for chunk in body.chunks_exact(8) {
          let mut b = [0u8; 8];
          b.copy_from_slice(chunk);
          values.push(f64::from_be_bytes(b) as f32);
        }
      }
    }
    self.mct_arrays.push((index, values));
    // A square array matching the component count is a decorrelation
    // matrix for the decoder.
    let n = self.image.comps.len();
    if let Some((_, matrix)) = self
      .mct_arrays
      .iter()
      .find(|(_, v)| v.len() == n * n)
    {
      let matrix = matrix.clone();
      let apply = |tcp: &mut Tcp| {
        tcp.mct = MctMode::Custom;
        tcp.mct_matrix = Some(matrix.clone());
      };
      if self.state.contains(J2kState::MH) {
        apply(&mut self.default_tcp);
        for tcp in &mut self.tcps {
          apply(tcp);
        }
      } else {
        apply(&mut self.tcps[self.cur_tileno as usize]);
      }
    }
    Ok(())
  }

  fn read_sot(&mut self, r: &mut Reader<'_>, pos_after: usize) -> Result<()> {
    if self.state.contains(J2kState::MH) {
      // Main header ends at the first SOT.
      self.merge_ppm();
    }
    let isot = r.read_u16()? as u32;
    let psot = r.read_u32()? as usize;
    let tpsot = u32::from(r.read_u8()?);
    let tnsot = u32::from(r.read_u8()?);
    if isot as usize >= self.tcps.len() {
      return Err(Error::CorruptCodeStream(format!(
        "tile index {} beyond the {}-tile grid",
        isot,
        self.tcps.len()
      )));
    }
    if tpsot > 254 {
      return Err(Error::CorruptCodeStream(format!(
        "tile-part index {} out of range",
        tpsot
      )));
    }
    self.cur_tileno = isot;
    let declared = self.tile_parts_declared[isot as usize];
    if tnsot == 0 && tpsot == 0 {
      event_msg!(
        self.events,
        EVT_WARNING,
        "tile {} declares an unknown tile-part count; assuming parts follow until the next tile",
        isot
      );
    }
    if tnsot != 0 {
      self.tile_parts_declared[isot as usize] = tnsot;
    }
    if declared != 0 && tpsot >= declared {
      event_msg!(
        self.events,
        EVT_WARNING,
        "tile {} has undeclared extra tile-part {} (declared {}); continuing",
        isot,
        tpsot,
        declared
      );
    }
    // Psot counts from the first byte of the SOT marker (10 bytes before
    // the end of this payload plus the 2-byte marker).
    let sot_start = pos_after - 12;
    self.cur_part_end = if psot == 0 {
      usize::MAX
    } else {
      if psot < 14 {
        return Err(Error::CorruptCodeStream(format!(
          "tile-part length {} shorter than its header",
          psot
        )));
      }
      sot_start + psot
    };
    self.state = J2kState::TPH;
    Ok(())
  }

  fn read_tile_data(&mut self, r: &mut Reader<'_>) -> Result<()> {
    let tileno = self.cur_tileno as usize;
    let had_ppt = !self.ppt_segments.is_empty();
    if had_ppt && !self.tile_has_ppt[tileno] {
      // PPT supersedes any PPM slice already attached to this tile.
      self.tcps[tileno].packed_headers = None;
      self.tile_has_ppt[tileno] = true;
    }
    self.merge_ppt();
    // The next PPM record belongs to this tile-part, unless a PPT
    // supersedes packed headers for this tile.
    if !self.ppm_records.is_empty() {
      if !self.tile_has_ppt[tileno] {
        if let Some(rec) = self.ppm_records.get(self.ppm_next).cloned() {
          self.tcps[tileno]
            .packed_headers
            .get_or_insert_with(Vec::new)
            .extend_from_slice(&rec);
        }
      }
      self.ppm_next += 1;
    }

    let end = if self.cur_part_end == usize::MAX {
      // Unknown length: everything up to a trailing EOC.
      let data_end = r
        .peek(r.remaining())
        .and_then(|rest| {
          rest
            .windows(2)
            .rposition(|w| w == [0xff, 0xd9])
            .map(|p| r.position() + p)
        })
        .unwrap_or(r.position() + r.remaining());
      data_end
    } else {
      self.cur_part_end
    };
    let take = if end < r.position() {
      0
    } else {
      end - r.position()
    };
    let take = if take > r.remaining() {
      if self.opts.strict {
        return Err(Error::CorruptTilePart(format!(
          "tile {} part overruns the stream by {} bytes",
          self.cur_tileno,
          take - r.remaining()
        )));
      }
      event_msg!(
        self.events,
        EVT_WARNING,
        "tile {} part truncated; keeping {} of {} bytes",
        self.cur_tileno,
        r.remaining(),
        take
      );
      r.remaining()
    } else {
      take
    };
    let body = r.take(take)?;
    self.tile_data[tileno].extend_from_slice(body);
    self.tile_parts_seen[tileno] += 1;
    self.state = J2kState::TPHSOT | J2kState::NEOC;
    Ok(())
  }
}

// --- whole-stream decode driver ---------------------------------------

/// Decode a raw code-stream into an image.
pub(crate) fn decode_codestream(
  data: &[u8],
  opts: &DecodeOptions,
  events: &Events,
) -> Result<Image> {
  let decoder = CodestreamDecoder::new(events, opts.clone());
  let parsed = decoder.parse(data)?;
  if parsed.ht_signalled {
    return Err(Error::CorruptCodeStream(
      "HT (Part 15) block coding is not supported".into(),
    ));
  }
  decode_parsed(parsed, opts, events)
}

/// Per-tile decode result handed to the tile consumer: the tile index,
/// per-component `(rect, samples)` regions in image-relative reduced
/// coordinates, and the tile's reference-row span in the reduced canvas.
pub(crate) type TileConsumer<'a> =
  dyn FnMut(u32, Vec<(Rect, Vec<i32>)>, (u32, u32)) -> Result<()> + 'a;

/// Decode every selected tile of a parsed stream, shaping the header
/// image for the reduce/area settings and handing each decoded tile to
/// `consume`. Returns the shaped (still zero-filled) image.
pub(crate) fn decode_tiles(
  parsed: &mut ParsedCodestream,
  opts: &DecodeOptions,
  events: &Events,
  consume: &mut TileConsumer<'_>,
) -> Result<Image> {
  let mut image = std::mem::take(&mut parsed.image);
  let cp = parsed.cp.clone();
  let reduce = opts.reduce;

  // Output canvas under area restriction and resolution reduction.
  let canvas = match opts.area {
    Some(area) => {
      let clipped = area.intersection(&Rect::new(image.x0, image.y0, image.x1, image.y1));
      if clipped.is_empty() {
        return Err(Error::InvalidConfiguration(
          "decode area outside the image canvas".into(),
        ));
      }
      clipped
    }
    None => Rect::new(image.x0, image.y0, image.x1, image.y1),
  };
  for comp in &mut image.comps {
    let cx0 = ceil_div(canvas.x0, comp.dx);
    let cy0 = ceil_div(canvas.y0, comp.dy);
    let cx1 = ceil_div(canvas.x1, comp.dx);
    let cy1 = ceil_div(canvas.y1, comp.dy);
    comp.x0 = ceil_div_pow2(cx0, reduce);
    comp.y0 = ceil_div_pow2(cy0, reduce);
    comp.w = ceil_div_pow2(cx1, reduce) - comp.x0;
    comp.h = ceil_div_pow2(cy1, reduce) - comp.y0;
    comp.factor = reduce;
    comp.alloc_data();
  }

  for tileno in 0..cp.num_tiles() {
    let tile_rect = cp.tile_rect(tileno, &image);
    if tile_rect.intersection(&canvas).is_empty() {
      // The length index cannot stay in sync past unparsed tiles.
      parsed.plm.invalidate();
      continue;
    }
    if parsed.tile_data[tileno as usize].is_empty() {
      event_msg!(events, EVT_WARNING, "tile {} carries no data", tileno);
      parsed.plm.invalidate();
      continue;
    }
    let tcp = &parsed.tcps[tileno as usize];
    let window = opts
      .area
      .map(|_| Rect::new(canvas.x0, canvas.y0, canvas.x1, canvas.y1));
    let mut dec = TileDecoder::new(
      tileno,
      &cp,
      &image,
      tcp,
      events,
      reduce,
      window,
      opts.layers,
    );
    dec.t2_decode(&parsed.tile_data[tileno as usize], &mut parsed.plm)?;
    dec.reconstruct()?;

    let mut regions = Vec::with_capacity(image.comps.len());
    for compno in 0..image.comps.len() {
      let src_rect = dec.decoded_rect(compno);
      let comp = &image.comps[compno];
      let rel = Rect {
        x0: src_rect.x0.saturating_sub(comp.x0),
        y0: src_rect.y0.saturating_sub(comp.y0),
        x1: src_rect.x1.saturating_sub(comp.x0).min(comp.w),
        y1: src_rect.y1.saturating_sub(comp.y0).min(comp.h),
      };
      regions.push((rel, std::mem::take(&mut dec.tile.comps[compno].data)));
    }
    let ref_rows = (
      ceil_div_pow2(tile_rect.y0.max(canvas.y0), reduce)
        .saturating_sub(ceil_div_pow2(canvas.y0, reduce)),
      ceil_div_pow2(tile_rect.y1.min(canvas.y1), reduce)
        .saturating_sub(ceil_div_pow2(canvas.y0, reduce)),
    );
    consume(tileno, regions, ref_rows)?;
    for compno in 0..image.comps.len() {
      image.comps[compno].resno_decoded = parsed.tcps[tileno as usize].tccps[compno]
        .numresolutions
        .saturating_sub(1 + reduce);
    }
  }
  Ok(image)
}

pub(crate) fn decode_parsed(
  mut parsed: ParsedCodestream,
  opts: &DecodeOptions,
  events: &Events,
) -> Result<Image> {
  // Composite tiles straight into the image planes.
  let mut composites: Vec<(u32, Vec<(Rect, Vec<i32>)>)> = Vec::new();
  let mut image = decode_tiles(&mut parsed, opts, events, &mut |tileno, regions, _| {
    composites.push((tileno, regions));
    Ok(())
  })?;
  for (_, regions) in composites {
    for (compno, (rect, data)) in regions.into_iter().enumerate() {
      let comp = &mut image.comps[compno];
      if rect.is_empty() || rect.x0 >= comp.w {
        continue;
      }
      let sw = rect.width() as usize;
      for (row, chunk) in data.chunks(sw.max(1)).enumerate() {
        let y = rect.y0 as usize + row;
        if y >= comp.h as usize {
          break;
        }
        let dst_start = y * comp.w as usize + rect.x0 as usize;
        let n = sw.min(comp.w as usize - rect.x0 as usize);
        comp.data[dst_start..dst_start + n].copy_from_slice(&chunk[..n]);
      }
    }
  }

  // Component subset selection.
  if !opts.components.is_empty() {
    let mut keep: Vec<_> = opts.components.clone();
    keep.sort_unstable();
    keep.dedup();
    let comps = std::mem::take(&mut image.comps);
    image.comps = comps
      .into_iter()
      .enumerate()
      .filter(|(i, _)| keep.binary_search(&(*i as u32)).is_ok())
      .map(|(_, c)| c)
      .collect();
    if image.comps.is_empty() {
      return Err(Error::InvalidConfiguration(
        "component selection removed every component".into(),
      ));
    }
  }
  Ok(image)
}

// --- encoder -----------------------------------------------------------

/// Encode-side options beyond the coding parameters proper.
#[derive(Debug, Clone, Default)]
pub(crate) struct EncodeOptions {
  pub write_tlm: bool,
  pub write_plt: bool,
  /// Cut tile-parts between values of this progression variable.
  pub tp_flag: Option<char>,
  pub comment: Option<String>,
  pub rsiz: u16,
}

struct TilePartPlan {
  /// Packet index range of this part.
  packets: std::ops::Range<usize>,
  /// Byte range in the tile bit-stream.
  bytes: std::ops::Range<usize>,
}

pub(crate) fn encode_codestream(
  image: &Image,
  cp: &CodingParams,
  tcp: &Tcp,
  opts: &EncodeOptions,
  events: &Events,
) -> Result<Vec<u8>> {
  // Encode every tile first so tile-part lengths are exact.
  let mut tiles = Vec::with_capacity(cp.num_tiles() as usize);
  for tileno in 0..cp.num_tiles() {
    let mut enc = TileEncoder::new(tileno, cp, image, tcp, events);
    tiles.push(enc.encode()?);
  }

  // Split each tile at changes of the cut variable.
  let mut plans: Vec<Vec<TilePartPlan>> = Vec::with_capacity(tiles.len());
  for tile in &tiles {
    let mut parts: Vec<TilePartPlan> = Vec::new();
    let cut = |a: &crate::t2::PacketSpan, b: &crate::t2::PacketSpan| match opts.tp_flag {
      Some('R') => a.resno != b.resno,
      Some('L') => a.layno != b.layno,
      Some('C') => a.compno != b.compno,
      _ => false,
    };
    let mut start = 0usize;
    for i in 1..=tile.packets.len() {
      let boundary = i == tile.packets.len()
        || (parts.len() < 254 && cut(&tile.packets[i - 1], &tile.packets[i]));
      if boundary {
        let byte_start = tile.packets[start].start;
        let byte_end = tile
          .packets
          .get(i - 1)
          .map(|p| p.start + p.len)
          .unwrap_or(byte_start);
        parts.push(TilePartPlan {
          packets: start..i,
          bytes: byte_start..byte_end,
        });
        start = i;
      }
    }
    if parts.is_empty() {
      parts.push(TilePartPlan {
        packets: 0..0,
        bytes: 0..0,
      });
    }
    plans.push(parts);
  }

  let mut w = Writer::new();
  w.write_u16(Marker::Soc.code());
  write_siz(&mut w, image, cp, opts.rsiz);
  write_cod(&mut w, tcp);
  write_coc_qcc(&mut w, image, tcp);
  write_qcd(&mut w, tcp);
  if tcp.mct == MctMode::Custom {
    let n = image.comps.len();
    let matrix = tcp
      .mct_matrix
      .as_ref()
      .filter(|m| m.len() == n * n)
      .ok_or_else(|| {
        Error::InvalidConfiguration(
          "custom multi-component transform needs a square matrix".into(),
        )
      })?;
    let inverse = crate::mct::invert_matrix(matrix, n).ok_or_else(|| {
      Error::InvalidConfiguration(
        "custom multi-component transform matrix is singular".into(),
      )
    })?;
    write_mct_matrix(&mut w, &inverse);
  }
  if !tcp.pocs.is_empty() {
    write_poc(&mut w, image, tcp);
  }
  for (compno, tccp) in tcp.tccps.iter().enumerate() {
    if tccp.roishift > 0 {
      write_rgn(&mut w, image, compno as u32, tccp.roishift);
    }
  }
  if opts.write_tlm {
    write_tlm(&mut w, &tiles, &plans, opts);
  }
  let comment = opts
    .comment
    .clone()
    .unwrap_or_else(|| format!("jp2kit {}", env!("CARGO_PKG_VERSION")));
  write_com(&mut w, &comment);

  for (tileno, (tile, parts)) in tiles.iter().zip(&plans).enumerate() {
    let total = parts.len().min(255) as u32;
    for (part_idx, part) in parts.iter().enumerate() {
      let body = &tile.data[part.bytes.clone()];
      let plt = if opts.write_plt {
        Some(build_plt(&tile.packets[part.packets.clone()]))
      } else {
        None
      };
      // PLT bytes on the wire: marker (2) + length (2) + Zplt (1) + data.
      let plt_len = plt.as_ref().map(|p| p.len() + 5).unwrap_or(0);
      let psot = 12 + plt_len + 2 + body.len();
      w.write_u16(Marker::Sot.code());
      w.write_u16(10);
      w.write_u16(tileno as u16);
      w.write_u32(psot as u32);
      w.write_u8(part_idx as u8);
      w.write_u8(total as u8);
      if let Some(plt) = plt {
        w.write_u16(Marker::Plt.code());
        w.write_u16((plt.len() + 3) as u16);
        w.write_u8(part_idx as u8);
        w.write_bytes(&plt);
      }
      w.write_u16(Marker::Sod.code());
      w.write_bytes(body);
    }
  }
  w.write_u16(Marker::Eoc.code());
  Ok(w.into_vec())
}

fn write_siz(w: &mut Writer, image: &Image, cp: &CodingParams, rsiz: u16) {
  let numcomps = image.comps.len();
  w.write_u16(Marker::Siz.code());
  w.write_u16((38 + 3 * numcomps) as u16);
  w.write_u16(rsiz);
  w.write_u32(image.x1);
  w.write_u32(image.y1);
  w.write_u32(image.x0);
  w.write_u32(image.y0);
  w.write_u32(cp.tdx);
  w.write_u32(cp.tdy);
  w.write_u32(cp.tx0);
  w.write_u32(cp.ty0);
  w.write_u16(numcomps as u16);
  for comp in &image.comps {
    let ssiz = ((comp.prec - 1) as u8) | if comp.sgnd { 0x80 } else { 0 };
    w.write_u8(ssiz);
    w.write_u8(comp.dx as u8);
    w.write_u8(comp.dy as u8);
  }
}

fn write_spcod(w: &mut Writer, tccp: &Tccp) {
  w.write_u8((tccp.numresolutions - 1) as u8);
  w.write_u8((tccp.cblkw - 2) as u8);
  w.write_u8((tccp.cblkh - 2) as u8);
  w.write_u8(tccp.cblksty.bits());
  w.write_u8(if tccp.reversible { 1 } else { 0 });
  if tccp.has_precincts() {
    for resno in 0..tccp.numresolutions {
      let (px, py) = tccp.precinct_exp(resno);
      w.write_u8((px | (py << 4)) as u8);
    }
  }
}

fn write_cod(w: &mut Writer, tcp: &Tcp) {
  let tccp = &tcp.tccps[0];
  let mut scod = 0u8;
  if tccp.has_precincts() {
    scod |= 0x01;
  }
  if tcp.use_sop {
    scod |= 0x02;
  }
  if tcp.use_eph {
    scod |= 0x04;
  }
  let prc_bytes = if tccp.has_precincts() {
    tccp.numresolutions as usize
  } else {
    0
  };
  w.write_u16(Marker::Cod.code());
  w.write_u16((12 + prc_bytes) as u16);
  w.write_u8(scod);
  w.write_u8(tcp.prog_order.as_u8());
  w.write_u16(tcp.numlayers as u16);
  w.write_u8(match tcp.mct {
    MctMode::Off => 0,
    MctMode::On => 1,
    MctMode::Custom => 2,
  });
  write_spcod(w, tccp);
}

/// MCT marker carrying the decoder-side decorrelation matrix as f32.
fn write_mct_matrix(w: &mut Writer, matrix: &[f32]) {
  w.write_u16(Marker::Mct.code());
  w.write_u16((8 + 4 * matrix.len()) as u16);
  w.write_u16(0); // Zmct
  // Imct: array index 0, decorrelation array, IEEE single elements.
  w.write_u16((1 << 8) | (2 << 10));
  w.write_u16(0); // Ymct
  for &v in matrix {
    w.write_u32(v.to_bits());
  }
}

/// COC/QCC for components whose parameters differ from component 0.
fn write_coc_qcc(w: &mut Writer, image: &Image, tcp: &Tcp) {
  let base = &tcp.tccps[0];
  for (compno, tccp) in tcp.tccps.iter().enumerate().skip(1) {
    let coding_differs = tccp.numresolutions != base.numresolutions
      || tccp.cblkw != base.cblkw
      || tccp.cblkh != base.cblkh
      || tccp.cblksty != base.cblksty
      || tccp.reversible != base.reversible
      || tccp.prcw != base.prcw
      || tccp.prch != base.prch;
    if coding_differs {
      let wide = wide_comps(image.comps.len());
      let prc_bytes = if tccp.has_precincts() {
        tccp.numresolutions as usize
      } else {
        0
      };
      let comp_bytes = if wide { 2 } else { 1 };
      w.write_u16(Marker::Coc.code());
      w.write_u16((2 + comp_bytes + 1 + 5 + prc_bytes) as u16);
      w.write_uint(compno as u32, comp_bytes);
      w.write_u8(if tccp.has_precincts() { 1 } else { 0 });
      write_spcod(w, tccp);
    }
    let quant_differs = tccp.qntsty != base.qntsty
      || tccp.numgbits != base.numgbits
      || tccp.stepsizes != base.stepsizes;
    if quant_differs {
      let wide = wide_comps(image.comps.len());
      let comp_bytes = if wide { 2 } else { 1 };
      let body = sqcd_bytes(tccp);
      w.write_u16(Marker::Qcc.code());
      w.write_u16((2 + comp_bytes + body.len()) as u16);
      w.write_uint(compno as u32, comp_bytes);
      w.write_bytes(&body);
    }
  }
}

fn sqcd_bytes(tccp: &Tccp) -> Vec<u8> {
  let mut out = Vec::new();
  out.push(tccp.qntsty.as_u8() | ((tccp.numgbits as u8) << 5));
  let numbands = (3 * tccp.numresolutions - 2) as usize;
  match tccp.qntsty {
    QuantStyle::NoQuant => {
      for step in tccp.stepsizes.iter().take(numbands) {
        out.push((step.expn as u8) << 3);
      }
    }
    QuantStyle::ScalarDerived => {
      let step = tccp.stepsizes[0];
      out.extend_from_slice(&((step.expn as u16) << 11 | step.mant as u16).to_be_bytes());
    }
    QuantStyle::ScalarExplicit => {
      for step in tccp.stepsizes.iter().take(numbands) {
        out.extend_from_slice(&((step.expn as u16) << 11 | step.mant as u16).to_be_bytes());
      }
    }
  }
  out
}

fn write_qcd(w: &mut Writer, tcp: &Tcp) {
  let body = sqcd_bytes(&tcp.tccps[0]);
  w.write_u16(Marker::Qcd.code());
  w.write_u16((2 + body.len()) as u16);
  w.write_bytes(&body);
}

fn write_poc(w: &mut Writer, image: &Image, tcp: &Tcp) {
  let wide = wide_comps(image.comps.len());
  let entry = if wide { 9 } else { 7 };
  w.write_u16(Marker::Poc.code());
  w.write_u16((2 + entry * tcp.pocs.len()) as u16);
  for poc in &tcp.pocs {
    w.write_u8(poc.resno0 as u8);
    w.write_uint(poc.compno0, if wide { 2 } else { 1 });
    w.write_u16(poc.layno1 as u16);
    w.write_u8(poc.resno1 as u8);
    w.write_uint(poc.compno1, if wide { 2 } else { 1 });
    w.write_u8(poc.order.as_u8());
  }
}

fn write_rgn(w: &mut Writer, image: &Image, compno: u32, shift: u32) {
  let wide = wide_comps(image.comps.len());
  let comp_bytes = if wide { 2 } else { 1 };
  w.write_u16(Marker::Rgn.code());
  w.write_u16((2 + comp_bytes + 2) as u16);
  w.write_uint(compno, comp_bytes);
  w.write_u8(0);
  w.write_u8(shift as u8);
}

fn write_com(w: &mut Writer, text: &str) {
  let bytes = text.as_bytes();
  w.write_u16(Marker::Com.code());
  w.write_u16((4 + bytes.len()) as u16);
  w.write_u16(1);
  w.write_bytes(bytes);
}

fn write_tlm(
  w: &mut Writer,
  tiles: &[crate::t2::TileBitstream],
  plans: &[Vec<TilePartPlan>],
  opts: &EncodeOptions,
) {
  let mut records: Vec<(u16, u32)> = Vec::new();
  for (tileno, parts) in plans.iter().enumerate() {
    for part in parts {
      let body = part.bytes.len();
      let plt_len = if opts.write_plt {
        build_plt(&tiles[tileno].packets[part.packets.clone()]).len() + 5
      } else {
        0
      };
      records.push((tileno as u16, (12 + plt_len + 2 + body) as u32));
    }
  }
  w.write_u16(Marker::Tlm.code());
  w.write_u16((4 + 6 * records.len()) as u16);
  w.write_u8(0);
  // ST = 2 (16-bit tile indices), SP = 1 (32-bit lengths).
  w.write_u8((2 << 4) | (1 << 6));
  for (tileno, len) in records {
    w.write_u16(tileno);
    w.write_u32(len);
  }
}

/// 7-bit continuation coding of packet lengths.
fn build_plt(packets: &[crate::t2::PacketSpan]) -> Vec<u8> {
  let mut out = Vec::with_capacity(packets.len() * 2);
  for p in packets {
    let mut len = p.len as u32;
    let mut stack = [0u8; 5];
    let mut n = 0;
    loop {
      stack[n] = (len & 0x7f) as u8;
      len >>= 7;
      n += 1;
      if len == 0 {
        break;
      }
    }
    for i in (0..n).rev() {
      out.push(stack[i] | if i > 0 { 0x80 } else { 0 });
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::image::ComponentParams;
  use crate::tcd::RateControl;

  fn small_image(w: u32, h: u32, numcomps: usize) -> Image {
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
    for comp in &mut image.comps {
      for (i, v) in comp.data.iter_mut().enumerate() {
        *v = ((i % 251) as i32 + (i / 53) as i32) & 0xff;
      }
    }
    image
  }

  fn simple_tcp(numcomps: usize, numres: u32) -> Tcp {
    Tcp {
      numlayers: 1,
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

  fn one_tile_cp(w: u32, h: u32) -> CodingParams {
    CodingParams {
      tx0: 0,
      ty0: 0,
      tdx: w,
      tdy: h,
      tw: 1,
      th: 1,
    }
  }

  fn encode_simple(w: u32, h: u32) -> (Image, Vec<u8>) {
    let image = small_image(w, h, 1);
    let cp = one_tile_cp(w, h);
    let tcp = simple_tcp(1, 3);
    let events = Events::new();
    let data = encode_codestream(&image, &cp, &tcp, &EncodeOptions::default(), &events).unwrap();
    (image, data)
  }

  #[test]
  fn stream_starts_with_soc_siz_and_ends_with_eoc() {
    let (_, data) = encode_simple(40, 25);
    assert_eq!(&data[..4], &[0xff, 0x4f, 0xff, 0x51]);
    assert_eq!(&data[data.len() - 2..], &[0xff, 0xd9]);
  }

  #[test]
  fn decode_round_trip_lossless() {
    let (image, data) = encode_simple(40, 25);
    let events = Events::new();
    let decoded = decode_codestream(&data, &DecodeOptions::default(), &events).unwrap();
    assert_eq!(decoded.comps[0].data, image.comps[0].data);
    assert_eq!(decoded.comps[0].prec, 8);
  }

  #[test]
  fn missing_siz_is_fatal() {
    let events = Events::new();
    let data = [0xff, 0x4f, 0xff, 0x52, 0x00, 0x0c];
    let err = decode_codestream(&data, &DecodeOptions::default(), &events).unwrap_err();
    assert!(matches!(err, Error::CorruptCodeStream(_)));
  }

  #[test]
  fn missing_cod_is_fatal() {
    let (_, data) = encode_simple(16, 16);
    // Excise the COD marker segment wholesale.
    let cod_pos = data
      .windows(2)
      .position(|w| w == [0xff, 0x52])
      .expect("stream has COD");
    let len = u16::from_be_bytes([data[cod_pos + 2], data[cod_pos + 3]]) as usize;
    let mut mutated = data[..cod_pos].to_vec();
    mutated.extend_from_slice(&data[cod_pos + 2 + len..]);
    let events = Events::new();
    let err = decode_codestream(&mutated, &DecodeOptions::default(), &events).unwrap_err();
    assert!(matches!(err, Error::CorruptCodeStream(_)));
  }

  #[test]
  fn corrupt_sot_length_is_fatal_in_strict_mode() {
    let (_, data) = encode_simple(16, 16);
    let sot_pos = data
      .windows(2)
      .position(|w| w == [0xff, 0x90])
      .expect("stream has SOT");
    let mut mutated = data.clone();
    // Blow up Psot far past the stream end.
    mutated[sot_pos + 6] = 0x7f;
    mutated[sot_pos + 7] = 0xff;
    mutated[sot_pos + 8] = 0xff;
    mutated[sot_pos + 9] = 0xff;
    let events = Events::new();
    let opts = DecodeOptions {
      strict: true,
      ..Default::default()
    };
    let err = decode_codestream(&mutated, &opts, &events).unwrap_err();
    assert!(matches!(err, Error::CorruptTilePart(_)));
  }

  #[test]
  fn unknown_marker_in_main_header_is_skipped() {
    let (image, data) = encode_simple(16, 16);
    // Inject a benign unknown marker right after SIZ.
    let siz_pos = 4;
    let siz_len = u16::from_be_bytes([data[siz_pos + 2], data[siz_pos + 3]]) as usize;
    let insert_at = siz_pos + 2 + siz_len;
    let mut mutated = data[..insert_at].to_vec();
    mutated.extend_from_slice(&[0xff, 0x70, 0x00, 0x04, 0xab, 0xcd]);
    mutated.extend_from_slice(&data[insert_at..]);
    let events = Events::new();
    let decoded = decode_codestream(&mutated, &DecodeOptions::default(), &events).unwrap();
    assert_eq!(decoded.comps[0].data, image.comps[0].data);
  }

  #[test]
  fn tlm_and_plt_streams_still_decode() {
    let image = small_image(33, 21, 1);
    let cp = one_tile_cp(33, 21);
    let tcp = simple_tcp(1, 3);
    let events = Events::new();
    let opts = EncodeOptions {
      write_tlm: true,
      write_plt: true,
      ..Default::default()
    };
    let data = encode_codestream(&image, &cp, &tcp, &opts, &events).unwrap();
    assert!(data.windows(2).any(|w| w == [0xff, 0x55]), "has TLM");
    assert!(data.windows(2).any(|w| w == [0xff, 0x58]), "has PLT");
    let decoded = decode_codestream(&data, &DecodeOptions::default(), &events).unwrap();
    assert_eq!(decoded.comps[0].data, image.comps[0].data);
  }

  #[test]
  fn reduced_resolution_decode_shrinks_dims() {
    let (_, data) = encode_simple(64, 48);
    let events = Events::new();
    let opts = DecodeOptions {
      reduce: 1,
      ..Default::default()
    };
    let decoded = decode_codestream(&data, &opts, &events).unwrap();
    assert_eq!((decoded.comps[0].w, decoded.comps[0].h), (32, 24));
  }
}
