//! Public codec sessions: parameter surface, validation, profile
//! enforcement, and the JP2/J2K routing.
//!
//! Sessions are stateless between runs. Construction validates every
//! option; profiles overwrite conflicting options and say so through the
//! event manager rather than failing.

use crate::error::{Error, Result};
use crate::event::*;
use crate::image::Image;
use crate::j2k::{self, DecodeOptions, EncodeOptions};
use crate::jp2::{self, UuidBox};
use crate::math::Rect;
use crate::pi::ProgressionOrder;
use crate::quant::{calc_explicit_stepsizes, QuantStyle};
use crate::t1::CblkSty;
use crate::tcd::{CodingParams, MctMode, RateControl, Tccp, Tcp};

/// Container choice for the compressor, sniffed on decompression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecFormat {
  /// Raw code-stream.
  J2k,
  /// JP2 boxed file.
  Jp2,
}

/// Constrained broadcast/cinema/IMF operating points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
  None,
  /// Digital cinema 2K at 24 fps.
  Cinema2k24,
  /// Digital cinema 2K at 48 fps.
  Cinema2k48,
  /// Digital cinema 4K.
  Cinema4k,
  BroadcastSingle,
  BroadcastMulti,
  Imf2k,
  Imf4k,
  Imf8k,
}

impl Profile {
  fn rsiz(self) -> u16 {
    match self {
      Profile::None => 0,
      Profile::Cinema2k24 | Profile::Cinema2k48 => 3,
      Profile::Cinema4k => 4,
      Profile::BroadcastSingle => 0x0100,
      Profile::BroadcastMulti => 0x0200,
      Profile::Imf2k => 0x0400,
      Profile::Imf4k => 0x0500,
      Profile::Imf8k => 0x0600,
    }
  }
}

/// Maximum compressed frame size for a cinema code-stream at 24 fps.
const CINEMA_24_CS: usize = 1_302_083;
/// Same at 48 fps.
const CINEMA_48_CS: usize = 651_041;

/// Rate control as users express it.
#[derive(Debug, Clone, PartialEq)]
pub enum RateSpec {
  /// Per-layer compression ratios, e.g. 20.0 = 1:20, cumulative order.
  Ratios(Vec<f64>),
  /// Per-layer PSNR targets in dB.
  Psnr(Vec<f64>),
  /// No rate control: everything in the first layer.
  None,
}

#[derive(Debug, Clone)]
pub struct CompressParams {
  pub format: CodecFormat,
  pub progression: ProgressionOrder,
  pub num_resolutions: u32,
  pub cblk_w_exp: u32,
  pub cblk_h_exp: u32,
  pub mode_flags: CblkSty,
  pub num_layers: u32,
  pub rate: RateSpec,
  /// None = one tile covering the whole image.
  pub tile_size: Option<(u32, u32)>,
  pub tile_origin: (u32, u32),
  pub irreversible: bool,
  pub mct: MctMode,
  pub mct_matrix: Option<Vec<f32>>,
  pub roi_component: Option<u32>,
  pub roi_shift: u32,
  /// Per-resolution precinct exponents, finest first; empty = maximal.
  pub precincts: Vec<(u32, u32)>,
  pub use_sop: bool,
  pub use_eph: bool,
  pub guard_bits: u32,
  pub profile: Profile,
  pub write_tlm: bool,
  pub write_plt: bool,
  /// Tile-part cuts: 'R', 'L' or 'C'.
  pub tp_flag: Option<char>,
  pub comment: Option<String>,
}

impl Default for CompressParams {
  fn default() -> Self {
    Self {
      format: CodecFormat::Jp2,
      progression: ProgressionOrder::Lrcp,
      num_resolutions: 6,
      cblk_w_exp: 6,
      cblk_h_exp: 6,
      mode_flags: CblkSty::empty(),
      num_layers: 1,
      rate: RateSpec::None,
      tile_size: None,
      tile_origin: (0, 0),
      irreversible: false,
      mct: MctMode::On,
      mct_matrix: None,
      roi_component: None,
      roi_shift: 0,
      precincts: Vec::new(),
      use_sop: false,
      use_eph: false,
      guard_bits: 2,
      profile: Profile::None,
      write_tlm: false,
      write_plt: false,
      tp_flag: None,
      comment: None,
    }
  }
}

/// Compression session.
pub struct Compressor {
  params: CompressParams,
  events: Events,
}

impl Compressor {
  pub fn new(params: CompressParams, events: Events) -> Result<Self> {
    let mut params = params;
    apply_profile(&mut params, &events);
    validate(&params)?;
    Ok(Self { params, events })
  }

  pub fn events(&self) -> &Events {
    &self.events
  }

  /// Compress `image` into a JP2 file or raw code-stream.
  pub fn compress(&self, image: &Image) -> Result<Vec<u8>> {
    self.compress_with_uuids(image, &[])
  }

  pub fn compress_with_uuids(&self, image: &Image, uuids: &[UuidBox]) -> Result<Vec<u8>> {
    let p = &self.params;
    if image.comps.is_empty() || image.comps.len() > 16384 {
      return Err(Error::InvalidConfiguration(format!(
        "{} components unsupported",
        image.comps.len()
      )));
    }
    for comp in &image.comps {
      if comp.prec < 1 || comp.prec > 38 {
        return Err(Error::InvalidConfiguration(format!(
          "component precision {} out of range",
          comp.prec
        )));
      }
      if comp.data.len() != comp.w as usize * comp.h as usize {
        return Err(Error::InvalidConfiguration(
          "component buffer does not match its dimensions".into(),
        ));
      }
    }
    if let Some(roi_comp) = p.roi_component {
      if roi_comp as usize >= image.comps.len() {
        return Err(Error::InvalidConfiguration(format!(
          "ROI component {} out of range",
          roi_comp
        )));
      }
    }
    if p.tile_origin.0 > image.x0 || p.tile_origin.1 > image.y0 {
      return Err(Error::InvalidConfiguration(
        "tile origin must not exceed the image origin".into(),
      ));
    }

    let (tdx, tdy) = p
      .tile_size
      .unwrap_or((image.x1 - p.tile_origin.0, image.y1 - p.tile_origin.1));
    let cp = CodingParams {
      tx0: p.tile_origin.0,
      ty0: p.tile_origin.1,
      tdx,
      tdy,
      tw: crate::math::ceil_div(image.x1 - p.tile_origin.0, tdx),
      th: crate::math::ceil_div(image.y1 - p.tile_origin.1, tdy),
    };
    if cp.num_tiles() > 65535 {
      return Err(Error::InvalidConfiguration(format!(
        "{} tiles exceed the tile index range",
        cp.num_tiles()
      )));
    }

    let mct = if p.mct == MctMode::On && !image.mct_applicable() {
      if image.comps.len() >= 3 {
        event_msg!(
          self.events,
          EVT_WARNING,
          "multi-component transform disabled: first three components differ"
        );
      }
      MctMode::Off
    } else {
      p.mct
    };
    if p.mct == MctMode::Custom {
      let n = image.comps.len();
      match &p.mct_matrix {
        Some(m) if m.len() == n * n => {}
        _ => {
          return Err(Error::InvalidConfiguration(
            "custom multi-component transform needs an n x n matrix".into(),
          ))
        }
      }
    }

    let rate_control = self.to_rate_control(image);
    let tcp = Tcp {
      prog_order: p.progression,
      numlayers: p.num_layers,
      mct,
      mct_matrix: p.mct_matrix.clone(),
      pocs: Vec::new(),
      rate_control,
      use_sop: p.use_sop,
      use_eph: p.use_eph,
      tccps: image
        .comps
        .iter()
        .enumerate()
        .map(|(compno, comp)| Tccp {
          numresolutions: p.num_resolutions,
          cblkw: p.cblk_w_exp,
          cblkh: p.cblk_h_exp,
          cblksty: p.mode_flags & !CblkSty::HT,
          reversible: !p.irreversible,
          qntsty: if p.irreversible {
            QuantStyle::ScalarExplicit
          } else {
            QuantStyle::NoQuant
          },
          stepsizes: calc_explicit_stepsizes(!p.irreversible, p.num_resolutions, comp.prec),
          numgbits: p.guard_bits,
          prcw: p.precincts.iter().rev().map(|&(w, _)| w).collect(),
          prch: p.precincts.iter().rev().map(|&(_, h)| h).collect(),
          roishift: if p.roi_component == Some(compno as u32) {
            p.roi_shift
          } else {
            0
          },
        })
        .collect(),
      ..Default::default()
    };

    let opts = EncodeOptions {
      write_tlm: p.write_tlm,
      write_plt: p.write_plt,
      tp_flag: p.tp_flag,
      comment: p.comment.clone(),
      rsiz: p.profile.rsiz(),
    };
    let codestream = j2k::encode_codestream(image, &cp, &tcp, &opts, &self.events)?;

    if matches!(p.profile, Profile::Cinema2k24 | Profile::Cinema2k48 | Profile::Cinema4k) {
      let cap = match p.profile {
        Profile::Cinema2k48 => CINEMA_48_CS,
        _ => CINEMA_24_CS,
      };
      if codestream.len() > cap {
        event_msg!(
          self.events,
          EVT_WARNING,
          "cinema code-stream is {} bytes, above the {}-byte frame budget",
          codestream.len(),
          cap
        );
      }
    }

    Ok(match p.format {
      CodecFormat::J2k => codestream,
      CodecFormat::Jp2 => jp2::write_jp2(&codestream, image, uuids),
    })
  }

  /// Translate ratios/PSNR into cumulative byte or distortion targets.
  fn to_rate_control(&self, image: &Image) -> RateControl {
    let raw_bytes: f64 = image
      .comps
      .iter()
      .map(|c| c.w as f64 * c.h as f64 * f64::from(c.prec) / 8.0)
      .sum();
    match &self.params.rate {
      RateSpec::None => RateControl::Fixed,
      RateSpec::Psnr(quals) => RateControl::Quality(quals.clone()),
      RateSpec::Ratios(ratios) => RateControl::Rates(
        ratios
          .iter()
          .map(|&r| if r <= 0.0 { 0.0 } else { raw_bytes / r })
          .collect(),
      ),
    }
  }
}

fn validate(p: &CompressParams) -> Result<()> {
  if !(1..=33).contains(&p.num_resolutions) {
    return Err(Error::InvalidConfiguration(format!(
      "{} resolutions out of range 1..=33",
      p.num_resolutions
    )));
  }
  if !(2..=10).contains(&p.cblk_w_exp)
    || !(2..=10).contains(&p.cblk_h_exp)
    || p.cblk_w_exp + p.cblk_h_exp > 12
  {
    return Err(Error::InvalidConfiguration(format!(
      "code-block exponents ({}, {}) out of range",
      p.cblk_w_exp, p.cblk_h_exp
    )));
  }
  if !(1..=65535).contains(&p.num_layers) {
    return Err(Error::InvalidConfiguration(format!(
      "{} layers out of range 1..=65535",
      p.num_layers
    )));
  }
  match &p.rate {
    RateSpec::Ratios(v) if v.len() > p.num_layers as usize => {
      return Err(Error::InvalidConfiguration(
        "more rate targets than layers".into(),
      ));
    }
    RateSpec::Psnr(v) if v.len() > p.num_layers as usize => {
      return Err(Error::InvalidConfiguration(
        "more quality targets than layers".into(),
      ));
    }
    _ => {}
  }
  if let Some((tdx, tdy)) = p.tile_size {
    if tdx == 0 || tdy == 0 {
      return Err(Error::InvalidConfiguration("zero tile size".into()));
    }
  }
  for &(pw, ph) in &p.precincts {
    if pw > 15 || ph > 15 || pw == 0 || ph == 0 {
      return Err(Error::InvalidConfiguration(format!(
        "precinct exponents ({}, {}) out of range",
        pw, ph
      )));
    }
  }
  if p.roi_shift > 37 {
    return Err(Error::InvalidConfiguration(format!(
      "ROI shift {} out of range",
      p.roi_shift
    )));
  }
  if p.guard_bits > 7 {
    return Err(Error::InvalidConfiguration(format!(
      "{} guard bits out of range",
      p.guard_bits
    )));
  }
  if let Some(tp) = p.tp_flag {
    if !matches!(tp, 'R' | 'L' | 'C') {
      return Err(Error::InvalidConfiguration(format!(
        "tile-part cut flag {:?} not one of R, L, C",
        tp
      )));
    }
  }
  if p.mode_flags.contains(CblkSty::HT) {
    return Err(Error::InvalidConfiguration(
      "HT block coding is signalling-only; it cannot be selected for encoding".into(),
    ));
  }
  Ok(())
}

/// Force profile-mandated values over the user's choices, warning about
/// every replacement.
fn apply_profile(p: &mut CompressParams, events: &Events) {
  let mut replace =
    |what: &str, differs: bool| {
      if differs {
        event_msg!(
          events,
          EVT_WARNING,
          "profile overrides {}; using the mandated value",
          what
        );
      }
    };
  match p.profile {
    Profile::None => {}
    Profile::Cinema2k24 | Profile::Cinema2k48 | Profile::Cinema4k => {
      replace("progression order (CPRL)", p.progression != ProgressionOrder::Cprl);
      p.progression = ProgressionOrder::Cprl;
      replace("tiling (single tile)", p.tile_size.is_some());
      p.tile_size = None;
      p.tile_origin = (0, 0);
      replace("transform (irreversible 9/7)", !p.irreversible);
      p.irreversible = true;
      replace("code-block size (32x32)", p.cblk_w_exp != 5 || p.cblk_h_exp != 5);
      p.cblk_w_exp = 5;
      p.cblk_h_exp = 5;
      let resolutions = if p.profile == Profile::Cinema4k { 7 } else { 6 };
      if p.num_resolutions > resolutions {
        replace("resolution count", true);
        p.num_resolutions = resolutions;
      }
      replace("packet markers (off)", p.use_sop || p.use_eph);
      p.use_sop = false;
      p.use_eph = false;
      // Precincts: 128 at the lowest resolution, 256 elsewhere.
      let mut precincts = vec![(8u32, 8u32); p.num_resolutions as usize];
      if let Some(last) = precincts.last_mut() {
        *last = (7, 7);
      }
      replace("precinct sizes (256/128)", p.precincts != precincts);
      p.precincts = precincts;
      let cap = match p.profile {
        Profile::Cinema2k48 => CINEMA_48_CS,
        _ => CINEMA_24_CS,
      } as f64;
      // Frame-budget rate targets, split across the requested layers.
      let layers = p.num_layers.max(1);
      let ratios: Vec<f64> = (0..layers)
        .map(|l| {
          let budget = cap * (l as f64 + 1.0) / layers as f64;
          1.0f64.max(raw_estimate_ratio(budget))
        })
        .collect();
      replace("rate control (frame budget)", p.rate != RateSpec::Ratios(ratios.clone()));
      p.rate = RateSpec::Ratios(ratios);
      replace("multi-component transform (on)", p.mct == MctMode::Off);
      p.mct = MctMode::On;
    }
    Profile::BroadcastSingle | Profile::BroadcastMulti => {
      replace("tile-part cuts (per resolution)", p.tp_flag != Some('R'));
      p.tp_flag = Some('R');
      if p.num_resolutions > 6 {
        replace("resolution count", true);
        p.num_resolutions = 6;
      }
    }
    Profile::Imf2k | Profile::Imf4k | Profile::Imf8k => {
      replace("transform (irreversible 9/7)", !p.irreversible);
      p.irreversible = true;
      replace("code-block size (32x32)", p.cblk_w_exp != 5 || p.cblk_h_exp != 5);
      p.cblk_w_exp = 5;
      p.cblk_h_exp = 5;
      let max_res = match p.profile {
        Profile::Imf2k => 6,
        Profile::Imf4k => 7,
        _ => 8,
      };
      if p.num_resolutions > max_res {
        replace("resolution count", true);
        p.num_resolutions = max_res;
      }
    }
  }
}

/// Placeholder conversion: a byte budget expressed as a ratio against a
/// nominal 2K 12-bit 3-component frame.
fn raw_estimate_ratio(budget_bytes: f64) -> f64 {
  let raw = 2048.0 * 1080.0 * 3.0 * 12.0 / 8.0;
  raw / budget_bytes
}

#[derive(Debug, Clone, Default)]
pub struct DecompressParams {
  /// Discard this many finest resolutions.
  pub reduce: u32,
  /// Decode only the first N layers; 0 = all.
  pub layers: u32,
  /// Decode window on the canvas.
  pub area: Option<(u32, u32, u32, u32)>,
  /// Component subset; empty = all.
  pub components: Vec<u32>,
  /// Error out instead of degrading on truncation damage.
  pub strict: bool,
}

/// Decompression session.
pub struct Decompressor {
  params: DecompressParams,
  events: Events,
}

impl Decompressor {
  pub fn new(params: DecompressParams) -> Result<Self> {
    Self::with_events(params, Events::new())
  }

  pub fn with_events(params: DecompressParams, events: Events) -> Result<Self> {
    if params.reduce > 32 {
      return Err(Error::InvalidConfiguration(format!(
        "resolution reduction {} out of range",
        params.reduce
      )));
    }
    if let Some((x0, y0, x1, y1)) = params.area {
      if x0 >= x1 || y0 >= y1 {
        return Err(Error::InvalidConfiguration(
          "empty decode area".into(),
        ));
      }
    }
    Ok(Self { params, events })
  }

  pub fn events(&self) -> &Events {
    &self.events
  }

  /// Decode while streaming completed image strips through `sink`, and
  /// optionally retaining per-tile images in `tiles`. Strips are emitted
  /// strictly top-down, `strip_height` reference rows at a time.
  pub fn decompress_into_sink(
    &self,
    data: &[u8],
    sink: &mut dyn crate::cache::StripSink,
    strip_height: u32,
    tiles: Option<&mut crate::cache::TileCache>,
  ) -> Result<Image> {
    use crate::cache::{DecodedTile, StripCache};

    let opts = self.decode_options();
    let (body, meta) = match crate::detect_format(data) {
      Some(CodecFormat::Jp2) => {
        let file = jp2::parse_jp2(data, &self.events)?;
        (file.codestream.clone(), Some(file))
      }
      Some(CodecFormat::J2k) => (0..data.len(), None),
      None => {
        return Err(Error::CorruptCodeStream(
          "no JP2 signature or SOC marker at the start of the data".into(),
        ))
      }
    };
    let decoder = j2k::CodestreamDecoder::new(&self.events, opts.clone());
    let mut parsed = decoder.parse(&data[body])?;
    if parsed.ht_signalled {
      return Err(Error::CorruptCodeStream(
        "HT (Part 15) block coding is not supported".into(),
      ));
    }

    let mut decoded: Vec<(u32, DecodedTile, (u32, u32))> = Vec::new();
    let mut image =
      j2k::decode_tiles(&mut parsed, &opts, &self.events, &mut |tileno, regions, rows| {
        decoded.push((
          tileno,
          DecodedTile {
            tileno,
            regions,
          },
          rows,
        ));
        Ok(())
      })?;

    let strip_height = strip_height.max(1);
    let height = image.comps.first().map(|c| c.h).unwrap_or(0);
    let num_strips = crate::math::ceil_div(height.max(1), strip_height) as usize;
    let mut tiles_per_strip = vec![0u32; num_strips];
    for (_, _, (y0, y1)) in &decoded {
      let s0 = (*y0 / strip_height) as usize;
      let s1 = crate::math::ceil_div((*y1).max(y0 + 1), strip_height) as usize;
      for counter in tiles_per_strip.iter_mut().take(s1.min(num_strips)).skip(s0) {
        *counter += 1;
      }
    }
    let comp_dims: Vec<(u32, u32, u32)> = image
      .comps
      .iter()
      .map(|c| {
        let dy = c.dy / image.comps[0].dy.max(1);
        (c.w, c.h, dy.max(1))
      })
      .collect();
    let mut cache = StripCache::new(&comp_dims, strip_height, tiles_per_strip, sink);
    let mut tile_store = tiles;
    for (_, tile, rows) in decoded {
      cache.ingest(&tile, rows)?;
      if let Some(store) = tile_store.as_mut() {
        store.insert(tile);
      }
    }
    cache.flush_remaining()?;
    let planes = cache.into_planes();
    for (comp, plane) in image.comps.iter_mut().zip(planes) {
      comp.data = plane;
    }
    if let Some(meta) = meta {
      jp2::apply_metadata(&meta, &mut image);
    }
    Ok(image)
  }

  fn decode_options(&self) -> DecodeOptions {
    DecodeOptions {
      reduce: self.params.reduce,
      layers: self.params.layers,
      area: self
        .params
        .area
        .map(|(x0, y0, x1, y1)| Rect::new(x0, y0, x1, y1)),
      components: self.params.components.clone(),
      strict: self.params.strict,
    }
  }

  /// Decode a JP2 file or a raw code-stream, sniffed by magic bytes.
  pub fn decompress(&self, data: &[u8]) -> Result<Image> {
    let opts = self.decode_options();
    match crate::detect_format(data) {
      Some(CodecFormat::Jp2) => {
        let file = jp2::parse_jp2(data, &self.events)?;
        let mut image =
          j2k::decode_codestream(&data[file.codestream.clone()], &opts, &self.events)?;
        jp2::apply_metadata(&file, &mut image);
        Ok(image)
      }
      Some(CodecFormat::J2k) => j2k::decode_codestream(data, &opts, &self.events),
      None => Err(Error::CorruptCodeStream(
        "no JP2 signature or SOC marker at the start of the data".into(),
      )),
    }
  }
}
