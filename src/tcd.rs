//! Tile processor: geometry derivation and the per-tile coding pipeline.
//!
//! A tile owns per-component resolution ladders; each resolution owns its
//! bands, each band its precincts, each precinct its code-blocks. The
//! encoder runs shift -> MCT -> DWT -> tier-1 -> rate allocation -> tier-2;
//! the decoder runs the reverse, optionally into a sparse window instead
//! of a full plane.

use crate::dwt;
use crate::error::Result;
use crate::event::*;
use crate::image::Image;
use crate::math::{ceil_div, ceil_div_pow2, floor_div_pow2, Rect};
use crate::mct;
use crate::pi::{PacketIter, PiComponent, PiResolution, ProgSegment, ProgressionOrder};
use crate::quant::{band_gain, band_norm, QuantStyle, StepSize};
use crate::sparse::SparseArray;
use crate::t1::{CblkSty, EncodePass, Segment, T1};
use crate::t2;
use crate::tgt::TagTree;

use smallvec::SmallVec;

/// Progression-order change record (one POC marker entry).
#[derive(Debug, Clone, Copy)]
pub struct Poc {
  pub resno0: u32,
  pub compno0: u32,
  pub layno1: u32,
  pub resno1: u32,
  pub compno1: u32,
  pub order: ProgressionOrder,
}

/// Rate-allocation strategy for the encoder.
#[derive(Debug, Clone, PartialEq)]
pub enum RateControl {
  /// Cumulative compressed-size targets per layer, in bytes; 0 = no cap.
  Rates(Vec<f64>),
  /// Cumulative quality targets per layer, in dB.
  Quality(Vec<f64>),
  /// All passes distributed over layers without rate targets.
  Fixed,
}

/// Per-component tile coding parameters (the COD/COC + QCD/QCC surface).
#[derive(Debug, Clone)]
pub struct Tccp {
  pub numresolutions: u32,
  /// Code-block exponents.
  pub cblkw: u32,
  pub cblkh: u32,
  pub cblksty: CblkSty,
  /// true = reversible 5/3.
  pub reversible: bool,
  pub qntsty: QuantStyle,
  pub stepsizes: Vec<StepSize>,
  pub numgbits: u32,
  /// Per-resolution precinct exponents; empty = maximal (15).
  pub prcw: Vec<u32>,
  pub prch: Vec<u32>,
  pub roishift: u32,
}

impl Default for Tccp {
  fn default() -> Self {
    Self {
      numresolutions: 6,
      cblkw: 6,
      cblkh: 6,
      cblksty: CblkSty::empty(),
      reversible: true,
      qntsty: QuantStyle::NoQuant,
      stepsizes: Vec::new(),
      numgbits: 2,
      prcw: Vec::new(),
      prch: Vec::new(),
      roishift: 0,
    }
  }
}

impl Tccp {
  pub fn precinct_exp(&self, resno: u32) -> (u32, u32) {
    let w = self.prcw.get(resno as usize).copied().unwrap_or(15);
    let h = self.prch.get(resno as usize).copied().unwrap_or(15);
    (w, h)
  }

  /// Whether non-default precinct sizes are in use (Scod bit 0).
  pub fn has_precincts(&self) -> bool {
    !self.prcw.is_empty()
  }
}

/// Multi-component transform choice signalled in COD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MctMode {
  Off,
  /// RCT when reversible, ICT otherwise.
  On,
  /// Array-based transform from MCT/MCC markers.
  Custom,
}

/// Per-tile coding parameters (default TCP overlaid by tile-part markers).
#[derive(Debug, Clone)]
pub struct Tcp {
  pub prog_order: ProgressionOrder,
  pub numlayers: u32,
  pub mct: MctMode,
  /// Decode-side custom decorrelation matrix (row-major numcomps^2).
  pub mct_matrix: Option<Vec<f32>>,
  pub pocs: Vec<Poc>,
  pub tccps: Vec<Tccp>,
  pub rate_control: RateControl,
  pub use_sop: bool,
  pub use_eph: bool,
  /// Packed packet headers for this tile (PPT, or the tile's PPM slice).
  pub packed_headers: Option<Vec<u8>>,
  /// Declared number of tile-parts, 0 = unknown.
  pub num_tile_parts: u32,
}

impl Default for Tcp {
  fn default() -> Self {
    Self {
      prog_order: ProgressionOrder::Lrcp,
      numlayers: 1,
      mct: MctMode::Off,
      mct_matrix: None,
      pocs: Vec::new(),
      tccps: Vec::new(),
      rate_control: RateControl::Fixed,
      use_sop: false,
      use_eph: false,
      packed_headers: None,
      num_tile_parts: 0,
    }
  }
}

/// Image-wide coding parameters from SIZ plus the tile grid.
#[derive(Debug, Clone, Default)]
pub struct CodingParams {
  pub tx0: u32,
  pub ty0: u32,
  pub tdx: u32,
  pub tdy: u32,
  pub tw: u32,
  pub th: u32,
}

impl CodingParams {
  pub fn num_tiles(&self) -> u32 {
    self.tw * self.th
  }

  pub fn tile_rect(&self, tileno: u32, image: &Image) -> Rect {
    let tx = tileno % self.tw;
    let ty = tileno / self.tw;
    let x0 = self.tx0 + tx * self.tdx;
    let y0 = self.ty0 + ty * self.tdy;
    Rect {
      x0: x0.max(image.x0),
      y0: y0.max(image.y0),
      x1: x0.saturating_add(self.tdx).min(image.x1),
      y1: y0.saturating_add(self.tdy).min(image.y1),
    }
  }
}

// --- geometry ----------------------------------------------------------

/// Encoder-side code-block.
#[derive(Default)]
pub(crate) struct CblkEnc {
  pub rect: Rect,
  pub data: Vec<u8>,
  pub passes: Vec<EncodePass>,
  pub numbps: u32,
  pub numlenbits: u32,
  /// Passes committed to previous layers.
  pub numpasses_in_layers: u32,
  /// Running pass counter while tier-2 writes packets.
  pub t2_passes: u32,
  /// Per-layer slice: pass count and byte range.
  pub layers: Vec<CblkLayer>,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CblkLayer {
  pub numpasses: u32,
  pub start: u32,
  pub len: u32,
  pub distortion: f64,
}

/// Decoder-side code-block.
#[derive(Default)]
pub(crate) struct CblkDec {
  pub rect: Rect,
  /// Concatenated codeword bytes gathered from packet bodies.
  pub data: Vec<u8>,
  pub segs: SmallVec<[Segment; 4]>,
  pub numbps: u32,
  pub numlenbits: u32,
  pub numpasses_total: u32,
  pub included: bool,
}

pub(crate) struct Precinct<C> {
  pub rect: Rect,
  /// Code-block grid.
  pub cw: u32,
  pub ch: u32,
  pub cblks: Vec<C>,
  pub incl_tree: TagTree,
  pub imsb_tree: TagTree,
}

pub(crate) struct Band<C> {
  /// 0 = LL, 1 = HL, 2 = LH, 3 = HH.
  pub orient: u32,
  pub rect: Rect,
  pub numbps: u32,
  pub stepsize: f32,
  pub precincts: Vec<Precinct<C>>,
}

pub(crate) struct Resolution<C> {
  pub rect: Rect,
  pub pdx: u32,
  pub pdy: u32,
  pub pw: u32,
  pub ph: u32,
  pub bands: Vec<Band<C>>,
}

pub(crate) struct TileComp<C> {
  pub rect: Rect,
  pub numresolutions: u32,
  /// Resolutions to reconstruct (`numresolutions - reduce`, at least 1).
  pub shown: usize,
  /// The full resolution ladder; packets exist for all of it.
  pub resolutions: Vec<Resolution<C>>,
  pub data: Vec<i32>,
  pub window: Option<SparseArray>,
}

impl<C> TileComp<C> {
  pub fn stride(&self) -> usize {
    self.reduced_rect().width() as usize
  }

  /// Rect of the last reconstructed resolution.
  pub fn reduced_rect(&self) -> Rect {
    self.resolutions[self.shown - 1].rect
  }
}

pub(crate) struct Tile<C> {
  pub rect: Rect,
  pub comps: Vec<TileComp<C>>,
}

/// Build the full geometry hierarchy for one tile.
fn init_tile<C, F: FnMut(Rect) -> C>(
  tile_rect: Rect,
  image: &Image,
  tcp: &Tcp,
  reduce: u32,
  mut make_cblk: F,
) -> Tile<C> {
  let mut comps = Vec::with_capacity(image.comps.len());
  for (compno, comp) in image.comps.iter().enumerate() {
    let tccp = &tcp.tccps[compno];
    let tc_rect = Rect {
      x0: ceil_div(tile_rect.x0, comp.dx),
      y0: ceil_div(tile_rect.y0, comp.dy),
      x1: ceil_div(tile_rect.x1, comp.dx),
      y1: ceil_div(tile_rect.y1, comp.dy),
    };
    let numres = tccp.numresolutions;
    let shown = numres.saturating_sub(reduce).max(1) as usize;
    let mut resolutions = Vec::with_capacity(numres as usize);
    for resno in 0..numres {
      let level = numres - 1 - resno;
      let res_rect = tc_rect.ceil_div_pow2(level);
      let (pdx, pdy) = tccp.precinct_exp(resno);
      let (pw, ph) = if res_rect.is_empty() {
        (0, 0)
      } else {
        (
          ceil_div_pow2(res_rect.x1, pdx) - floor_div_pow2(res_rect.x0, pdx),
          ceil_div_pow2(res_rect.y1, pdy) - floor_div_pow2(res_rect.y0, pdy),
        )
      };
      let orients: &[u32] = if resno == 0 { &[0] } else { &[1, 2, 3] };
      let mut bands = Vec::with_capacity(orients.len());
      for &orient in orients {
        let band_level = if resno == 0 { level } else { level + 1 };
        let band_rect = dwt::band_window(band_level, orient, tc_rect);
        let bandno = if resno == 0 { 0 } else { (resno - 1) * 3 + orient };
        let gain = band_gain(tccp.reversible, orient);
        let numbps_nominal = (comp.prec + gain) as i32;
        let step = tccp
          .stepsizes
          .get(bandno as usize)
          .copied()
          .unwrap_or(StepSize {
            expn: numbps_nominal,
            mant: 0,
          });
        let stepsize = step.to_step(numbps_nominal);
        let band_numbps = (step.expn + tccp.numgbits as i32 - 1).max(0) as u32;

        // Precinct partition of the band; half-size cells above level 0.
        let (cbg_ex, cbg_ey) = if resno == 0 {
          (pdx, pdy)
        } else {
          (pdx.saturating_sub(1), pdy.saturating_sub(1))
        };
        let tl_prcx = floor_div_pow2(res_rect.x0, pdx) << pdx;
        let tl_prcy = floor_div_pow2(res_rect.y0, pdy) << pdy;
        let (tl_cbgx, tl_cbgy) = if resno == 0 {
          (tl_prcx, tl_prcy)
        } else {
          (ceil_div_pow2(tl_prcx, 1), ceil_div_pow2(tl_prcy, 1))
        };
        let cblkw = tccp.cblkw.min(cbg_ex);
        let cblkh = tccp.cblkh.min(cbg_ey);
        let mut precincts = Vec::with_capacity((pw * ph) as usize);
        for precno in 0..pw * ph {
          let cbg_rect = Rect {
            x0: tl_cbgx + (precno % pw) * (1 << cbg_ex),
            y0: tl_cbgy + (precno / pw) * (1 << cbg_ey),
            x1: tl_cbgx + (precno % pw + 1) * (1 << cbg_ex),
            y1: tl_cbgy + (precno / pw + 1) * (1 << cbg_ey),
          };
          let prc_rect = cbg_rect.intersection(&band_rect);
          let (cw, ch, tl_cblkx, tl_cblky) = if prc_rect.is_empty() {
            (0, 0, 0, 0)
          } else {
            (
              ceil_div_pow2(prc_rect.x1, cblkw) - floor_div_pow2(prc_rect.x0, cblkw),
              ceil_div_pow2(prc_rect.y1, cblkh) - floor_div_pow2(prc_rect.y0, cblkh),
              floor_div_pow2(prc_rect.x0, cblkw) << cblkw,
              floor_div_pow2(prc_rect.y0, cblkh) << cblkh,
            )
          };
          let mut cblks = Vec::with_capacity((cw * ch) as usize);
          for cblkno in 0..cw * ch {
            let cell = Rect {
              x0: tl_cblkx + (cblkno % cw) * (1 << cblkw),
              y0: tl_cblky + (cblkno / cw) * (1 << cblkh),
              x1: tl_cblkx + (cblkno % cw + 1) * (1 << cblkw),
              y1: tl_cblky + (cblkno / cw + 1) * (1 << cblkh),
            };
            cblks.push(make_cblk(cell.intersection(&prc_rect)));
          }
          precincts.push(Precinct {
            rect: prc_rect,
            cw,
            ch,
            cblks,
            incl_tree: TagTree::new(cw.max(1), ch.max(1)),
            imsb_tree: TagTree::new(cw.max(1), ch.max(1)),
          });
        }
        bands.push(Band {
          orient,
          rect: band_rect,
          numbps: band_numbps,
          stepsize,
          precincts,
        });
      }
      resolutions.push(Resolution {
        rect: res_rect,
        pdx,
        pdy,
        pw,
        ph,
        bands,
      });
    }
    comps.push(TileComp {
      rect: tc_rect,
      numresolutions: numres,
      shown: shown.min(numres as usize),
      resolutions,
      data: Vec::new(),
      window: None,
    });
  }
  Tile {
    rect: tile_rect,
    comps,
  }
}

/// The packet-iterator view of a tile.
fn pi_components<C>(tile: &Tile<C>, image: &Image) -> Vec<PiComponent> {
  tile
    .comps
    .iter()
    .zip(&image.comps)
    .map(|(tc, ic)| PiComponent {
      dx: ic.dx,
      dy: ic.dy,
      resolutions: tc
        .resolutions
        .iter()
        .map(|r| PiResolution {
          pdx: r.pdx,
          pdy: r.pdy,
          pw: r.pw,
          ph: r.ph,
          rect: r.rect,
        })
        .collect(),
    })
    .collect()
}

pub(crate) fn whole_tile_segments(tcp: &Tcp, numres: u32, numcomps: u32) -> Vec<ProgSegment> {
  if tcp.pocs.is_empty() {
    return vec![ProgSegment {
      order: tcp.prog_order,
      layno0: 0,
      layno1: tcp.numlayers,
      resno0: 0,
      resno1: numres,
      compno0: 0,
      compno1: numcomps,
    }];
  }
  tcp
    .pocs
    .iter()
    .map(|poc| ProgSegment {
      order: poc.order,
      layno0: 0,
      layno1: poc.layno1.min(tcp.numlayers),
      resno0: poc.resno0.min(numres),
      resno1: poc.resno1.min(numres),
      compno0: poc.compno0.min(numcomps),
      compno1: poc.compno1.min(numcomps),
    })
    .collect()
}

fn make_packet_iter<C>(tile: &Tile<C>, image: &Image, tcp: &Tcp) -> PacketIter {
  let comps = pi_components(tile, image);
  let numres = tile
    .comps
    .iter()
    .map(|c| c.numresolutions)
    .max()
    .unwrap_or(1);
  let segments = whole_tile_segments(tcp, numres, tile.comps.len() as u32);
  PacketIter::new(comps, tile.rect, tcp.numlayers, segments)
}

/// Offset of a band's top-left corner inside the deinterleaved resolution
/// plane: HL/HH shift right by the lower resolution's width, LH/HH shift
/// down by its height.
fn band_offset(lower: Option<Rect>, orient: u32) -> (u32, u32) {
  match lower {
    Some(lr) if orient != 0 => (
      if orient & 1 != 0 { lr.width() } else { 0 },
      if orient & 2 != 0 { lr.height() } else { 0 },
    ),
    _ => (0, 0),
  }
}

// --- encoder -----------------------------------------------------------

pub(crate) struct TileEncoder<'a> {
  pub tile: Tile<CblkEnc>,
  pub tileno: u32,
  image: &'a Image,
  tcp: &'a Tcp,
  events: &'a Events,
  /// Total distortion of the tile, accumulated during tier-1.
  dist_total: f64,
}

impl<'a> TileEncoder<'a> {
  pub fn new(
    tileno: u32,
    cp: &CodingParams,
    image: &'a Image,
    tcp: &'a Tcp,
    events: &'a Events,
  ) -> Self {
    let rect = cp.tile_rect(tileno, image);
    let tile = init_tile(rect, image, tcp, 0, |rect| CblkEnc {
      rect,
      layers: vec![CblkLayer::default(); tcp.numlayers as usize],
      ..Default::default()
    });
    Self {
      tile,
      tileno,
      image,
      tcp,
      events,
      dist_total: 0.0,
    }
  }

  /// Run the whole encoder pipeline and emit this tile's packet stream.
  pub fn encode(&mut self) -> Result<t2::TileBitstream> {
    self.copy_in_and_shift();
    self.forward_mct();
    self.forward_dwt();
    self.t1_encode();
    self.rate_allocate()?;
    self.t2_encode()
  }

  /// Pull samples from the image, apply the DC level shift and ROI
  /// up-shift, converting to floats for the irreversible path.
  fn copy_in_and_shift(&mut self) {
    for (compno, tc) in self.tile.comps.iter_mut().enumerate() {
      let comp = &self.image.comps[compno];
      let tccp = &self.tcp.tccps[compno];
      let shift = if comp.sgnd { 0 } else { 1i32 << (comp.prec - 1) };
      let rect = tc.reduced_rect();
      let (w, h) = (rect.width() as usize, rect.height() as usize);
      tc.data = vec![0; w * h];
      let src_stride = comp.w as usize;
      let off_x = (rect.x0 - comp.x0) as usize;
      let off_y = (rect.y0 - comp.y0) as usize;
      for y in 0..h {
        for x in 0..w {
          let v = comp.data[(off_y + y) * src_stride + off_x + x] - shift;
          let v = if tccp.roishift > 0 { v << tccp.roishift } else { v };
          tc.data[y * w + x] = if tccp.reversible {
            v
          } else {
            (v as f32).to_bits() as i32
          };
        }
      }
    }
  }

  fn forward_mct(&mut self) {
    match self.tcp.mct {
      MctMode::Off => {}
      MctMode::On => {
        if self.tile.comps.len() < 3 {
          return;
        }
        let reversible = self.tcp.tccps[0].reversible;
        let (d0, d1, d2) = match three_planes(&mut self.tile.comps) {
          Some(p) => p,
          None => {
            event_msg!(
              self.events,
              EVT_WARNING,
              "multi-component transform skipped: component geometry differs"
            );
            return;
          }
        };
        if reversible {
          mct::encode_rct(d0, d1, d2);
        } else {
          mct::encode_ict(d0, d1, d2);
        }
      }
      MctMode::Custom => {
        if let Some(matrix) = &self.tcp.mct_matrix {
          match all_planes(&mut self.tile.comps) {
            Some(mut planes) if planes.len() * planes.len() == matrix.len() => {
              mct::encode_custom(matrix, &mut planes);
            }
            _ => {
              event_msg!(
                self.events,
                EVT_WARNING,
                "custom transform skipped: matrix does not fit the components"
              );
            }
          }
        }
      }
    }
  }

  fn forward_dwt(&mut self) {
    for (compno, tc) in self.tile.comps.iter_mut().enumerate() {
      let tccp = &self.tcp.tccps[compno];
      let res_rects: Vec<Rect> = tc.resolutions.iter().map(|r| r.rect).collect();
      let stride = tc.stride();
      dwt::encode(&mut tc.data, stride, &res_rects, tccp.reversible);
    }
  }

  fn t1_encode(&mut self) {
    let mut t1 = T1::new();
    let mut dist_total = 0.0f64;
    let mct_on = self.tcp.mct == MctMode::On;
    for (compno, tc) in self.tile.comps.iter_mut().enumerate() {
      let tccp = &self.tcp.tccps[compno];
      let stride = tc.stride();
      let numres = tc.numresolutions;
      let mct_norm = if mct_on {
        mct::component_norm(!tccp.reversible, compno)
      } else {
        1.0
      };
      let res_rects: Vec<Rect> = tc.resolutions.iter().map(|r| r.rect).collect();
      let data = &tc.data;
      for (resno, res) in tc.resolutions.iter_mut().enumerate() {
        let lower = if resno > 0 {
          Some(res_rects[resno - 1])
        } else {
          None
        };
        let level = numres - 1 - resno as u32;
        for band in &mut res.bands {
          if band.rect.is_empty() {
            continue;
          }
          let (off_x, off_y) = band_offset(lower, band.orient);
          let band_level = if resno == 0 { level } else { level + 1 };
          let norm = band_norm(tccp.reversible, band_level, band.orient);
          let wmse_scale = if tccp.reversible {
            norm * norm * mct_norm * mct_norm
          } else {
            let s = f64::from(band.stepsize);
            norm * norm * s * s * mct_norm * mct_norm
          };
          for prc in &mut band.precincts {
            for cblk in &mut prc.cblks {
              if cblk.rect.is_empty() {
                continue;
              }
              let w = cblk.rect.width() as usize;
              let h = cblk.rect.height() as usize;
              let mut src = vec![0i32; w * h];
              for y in 0..h {
                for x in 0..w {
                  let px = (cblk.rect.x0 - band.rect.x0 + off_x) as usize + x;
                  let py = (cblk.rect.y0 - band.rect.y0 + off_y) as usize + y;
                  let raw = data[py * stride + px];
                  src[y * w + x] = if tccp.reversible {
                    raw
                  } else {
                    // Deadzone quantisation toward zero.
                    (f32::from_bits(raw as u32) / band.stepsize) as i32
                  };
                }
              }
              let enc = t1.encode_block(&src, w, h, band.orient, tccp.cblksty);
              cblk.numbps = enc.numbps;
              cblk.data = enc.data;
              cblk.passes = enc.passes;
              for pass in &mut cblk.passes {
                pass.distortion *= wmse_scale;
              }
              if let Some(last) = cblk.passes.last() {
                dist_total += last.distortion;
              }
            }
          }
        }
      }
    }
    self.dist_total = dist_total;
  }

  /// Select the pass prefix of every code-block for every layer.
  fn rate_allocate(&mut self) -> Result<()> {
    let numlayers = self.tcp.numlayers;
    match self.tcp.rate_control.clone() {
      RateControl::Fixed => {
        // No targets: the full pass list lands in the first layer.
        for layno in 0..numlayers {
          self.make_layer(layno, if layno == 0 { 0.0 } else { f64::MAX }, true);
        }
        Ok(())
      }
      RateControl::Rates(rates) => {
        let (min_slope, max_slope) = self.slope_range();
        for layno in 0..numlayers {
          let target = rates.get(layno as usize).copied().unwrap_or(0.0);
          if target <= 0.0 {
            self.make_layer(layno, 0.0, true);
            continue;
          }
          let thresh = self.search_threshold(layno, min_slope, max_slope, |bytes, _| {
            bytes as f64 <= target
          })?;
          self.make_layer(layno, thresh, true);
        }
        Ok(())
      }
      RateControl::Quality(quals) => {
        let max_se = self.max_square_error();
        let (min_slope, max_slope) = self.slope_range();
        for layno in 0..numlayers {
          let db = quals.get(layno as usize).copied().unwrap_or(0.0);
          if db <= 0.0 {
            self.make_layer(layno, 0.0, true);
            continue;
          }
          let dist_target = self.dist_total - max_se / 10f64.powf(db / 10.0);
          let thresh =
            self.search_threshold(layno, min_slope, max_slope, |_, dist| dist >= dist_target)?;
          self.make_layer(layno, thresh, true);
        }
        Ok(())
      }
    }
  }

  fn max_square_error(&self) -> f64 {
    self
      .image
      .comps
      .iter()
      .zip(&self.tile.comps)
      .map(|(c, tc)| {
        let peak = f64::from((1u64 << c.prec.min(31)) as u32 - 1);
        peak * peak * tc.reduced_rect().area() as f64
      })
      .sum()
  }

  /// Smallest and largest distortion-over-length slope over every pass.
  fn slope_range(&self) -> (f64, f64) {
    let mut min = f64::MAX;
    let mut max = 0.0f64;
    for_each_cblk(&self.tile, |cblk| {
      let mut prev_rate = 0u32;
      let mut prev_dist = 0.0;
      for pass in &cblk.passes {
        let dr = pass.rate.saturating_sub(prev_rate);
        let dd = pass.distortion - prev_dist;
        if dr > 0 && dd > 0.0 {
          let slope = dd / f64::from(dr);
          min = min.min(slope);
          max = max.max(slope);
        }
        prev_rate = pass.rate;
        prev_dist = pass.distortion;
      }
    });
    if max == 0.0 {
      (0.0, 0.0)
    } else {
      (min, max)
    }
  }

  /// Dichotomy over the slope threshold: the smallest threshold whose
  /// simulated layer set still satisfies `accept(bytes, distortion)`.
  fn search_threshold(
    &mut self,
    layno: u32,
    min_slope: f64,
    max_slope: f64,
    accept: impl Fn(usize, f64) -> bool,
  ) -> Result<f64> {
    if max_slope == 0.0 {
      return Ok(0.0);
    }
    let mut lo = min_slope;
    let mut hi = max_slope * 1.0001;
    let mut good = hi;
    for _ in 0..32 {
      let thresh = (lo + hi) / 2.0;
      self.make_layer(layno, thresh, false);
      let (bytes, dist) = self.simulate_t2(layno)?;
      if accept(bytes, dist) {
        good = thresh;
        hi = thresh;
      } else {
        lo = thresh;
      }
    }
    Ok(good)
  }

  /// Distortion achieved by layers up to `layno` under the current trial
  /// assignment plus the committed earlier layers.
  fn achieved_distortion(&self, layno: u32) -> f64 {
    let mut dist = 0.0;
    for_each_cblk(&self.tile, |cblk| {
      let passes = cblk.numpasses_in_layers + cblk.layers[layno as usize].numpasses;
      if passes > 0 {
        dist += cblk.passes[passes as usize - 1].distortion;
      }
    });
    dist
  }

  fn simulate_t2(&mut self, layno: u32) -> Result<(usize, f64)> {
    let mut pi = make_packet_iter(&self.tile, self.image, self.tcp);
    let mut sink = Vec::new();
    t2::encode_packets(&mut self.tile, &mut pi, layno + 1, false, false, &mut sink)?;
    Ok((sink.len(), self.achieved_distortion(layno)))
  }

  /// Assign to `layno` the maximal pass prefix whose slope is at or above
  /// `thresh` (0 = everything, MAX = nothing new). When `fin`, commit.
  fn make_layer(&mut self, layno: u32, thresh: f64, fin: bool) {
    for tc in &mut self.tile.comps {
      for res in &mut tc.resolutions {
        for band in &mut res.bands {
          for prc in &mut band.precincts {
            for cblk in &mut prc.cblks {
              let committed = cblk.numpasses_in_layers;
              let mut best = committed;
              if thresh == 0.0 {
                best = cblk.passes.len() as u32;
              } else if thresh != f64::MAX {
                let mut prev_rate = if committed > 0 {
                  cblk.passes[committed as usize - 1].rate
                } else {
                  0
                };
                let mut prev_dist = if committed > 0 {
                  cblk.passes[committed as usize - 1].distortion
                } else {
                  0.0
                };
                for (i, pass) in cblk.passes.iter().enumerate().skip(committed as usize) {
                  let dr = pass.rate.saturating_sub(prev_rate);
                  let dd = pass.distortion - prev_dist;
                  let take = if dr == 0 {
                    dd > 0.0
                  } else {
                    dd / f64::from(dr) >= thresh
                  };
                  if take {
                    best = i as u32 + 1;
                    prev_rate = pass.rate;
                    prev_dist = pass.distortion;
                  }
                }
              }
              let numpasses = best.saturating_sub(committed);
              let start = if committed > 0 {
                cblk.passes[committed as usize - 1].rate
              } else {
                0
              };
              let end = if best > 0 {
                cblk.passes[best as usize - 1].rate
              } else {
                0
              };
              let dist_hi = if best > 0 {
                cblk.passes[best as usize - 1].distortion
              } else {
                0.0
              };
              let dist_lo = if committed > 0 {
                cblk.passes[committed as usize - 1].distortion
              } else {
                0.0
              };
              cblk.layers[layno as usize] = CblkLayer {
                numpasses,
                start,
                len: end.saturating_sub(start),
                distortion: dist_hi - dist_lo,
              };
              if fin {
                cblk.numpasses_in_layers = best;
              }
            }
          }
        }
      }
    }
  }

  fn t2_encode(&mut self) -> Result<t2::TileBitstream> {
    let mut pi = make_packet_iter(&self.tile, self.image, self.tcp);
    let mut data = Vec::new();
    let spans = t2::encode_packets(
      &mut self.tile,
      &mut pi,
      self.tcp.numlayers,
      self.tcp.use_sop,
      self.tcp.use_eph,
      &mut data,
    )?;
    Ok(t2::TileBitstream {
      data,
      packets: spans,
    })
  }
}

fn for_each_cblk<F: FnMut(&CblkEnc)>(tile: &Tile<CblkEnc>, mut f: F) {
  for tc in &tile.comps {
    for res in &tc.resolutions {
      for band in &res.bands {
        for prc in &band.precincts {
          for cblk in &prc.cblks {
            f(cblk);
          }
        }
      }
    }
  }
}

/// Every component plane at once, for matrix transforms; None when the
/// sizes differ.
fn all_planes<C>(comps: &mut [TileComp<C>]) -> Option<Vec<&mut [i32]>> {
  let len0 = comps.first()?.data.len();
  if comps.iter().any(|c| c.data.len() != len0) {
    return None;
  }
  Some(comps.iter_mut().map(|c| c.data.as_mut_slice()).collect())
}

/// Split the first three component planes for an in-place transform;
/// None when their sizes differ.
fn three_planes<C>(comps: &mut [TileComp<C>]) -> Option<(&mut [i32], &mut [i32], &mut [i32])> {
  let (head, tail) = comps.split_at_mut(1);
  let (mid, rest) = tail.split_at_mut(1);
  let d0 = &mut head[0].data;
  let d1 = &mut mid[0].data;
  let d2 = &mut rest[0].data;
  if d0.len() != d1.len() || d0.len() != d2.len() {
    return None;
  }
  Some((d0, d1, d2))
}

// --- decoder -----------------------------------------------------------

pub(crate) struct TileDecoder<'a> {
  pub tile: Tile<CblkDec>,
  pub tileno: u32,
  image: &'a Image,
  tcp: &'a Tcp,
  events: &'a Events,
  /// Decode window in full-resolution tile-component coordinates.
  window: Option<Rect>,
  /// Layer cap; 0 = all layers.
  max_layers: u32,
}

impl<'a> TileDecoder<'a> {
  pub fn new(
    tileno: u32,
    cp: &CodingParams,
    image: &'a Image,
    tcp: &'a Tcp,
    events: &'a Events,
    reduce: u32,
    window: Option<Rect>,
    max_layers: u32,
  ) -> Self {
    let rect = cp.tile_rect(tileno, image);
    let tile = init_tile(rect, image, tcp, reduce, |rect| CblkDec {
      rect,
      ..Default::default()
    });
    Self {
      tile,
      tileno,
      image,
      tcp,
      events,
      window,
      max_layers,
    }
  }

  /// The decode window (canvas coordinates) mapped into a component's
  /// reduced grid and clipped to its reduced rect.
  fn comp_window_of(&self, compno: usize) -> Option<Rect> {
    let win = self.window?;
    let tc = &self.tile.comps[compno];
    let comp = &self.image.comps[compno];
    let full = Rect {
      x0: ceil_div(win.x0, comp.dx),
      y0: ceil_div(win.y0, comp.dy),
      x1: ceil_div(win.x1, comp.dx),
      y1: ceil_div(win.y1, comp.dy),
    };
    let reduce = (tc.numresolutions as usize - tc.shown) as u32;
    Some(full.ceil_div_pow2(reduce).intersection(&tc.reduced_rect()))
  }

  /// Parse this tile's packet stream into per-code-block segments.
  /// `pl` supplies declared packet lengths when PLT/PLM markers exist.
  pub fn t2_decode(&mut self, data: &[u8], pl: &mut crate::index::PacketLengthCache) -> Result<()> {
    let mut pi = make_packet_iter(&self.tile, self.image, self.tcp);
    t2::decode_packets(
      &mut self.tile,
      &mut pi,
      data,
      self.tcp,
      self.max_layers,
      pl,
      self.events,
    )
  }

  /// Tier-1 decode plus inverse transforms, producing the component
  /// planes clipped and shifted back to their nominal range.
  pub fn reconstruct(&mut self) -> Result<()> {
    self.t1_decode()?;
    self.inverse_dwt();
    self.collect_window();
    self.inverse_mct();
    self.shift_and_clip();
    Ok(())
  }

  fn t1_decode(&mut self) -> Result<()> {
    let mut t1 = T1::new();
    let tileno = self.tileno;
    let events = self.events;
    for compno in 0..self.tile.comps.len() {
      let tccp = &self.tcp.tccps[compno];
      let win = self.comp_window_of(compno);
      let tc = &mut self.tile.comps[compno];
      let rect = tc.reduced_rect();
      let (w, h) = (rect.width(), rect.height());
      if w == 0 || h == 0 {
        continue;
      }
      if win.is_some() {
        tc.window = Some(SparseArray::new(w, h, 64, 64));
      } else {
        tc.data = vec![0; w as usize * h as usize];
      }
      let stride = w as usize;
      let shown = tc.shown;
      let res_rects: Vec<Rect> = tc.resolutions.iter().map(|r| r.rect).collect();
      let TileComp {
        resolutions,
        data,
        window,
        ..
      } = tc;
      for (resno, res) in resolutions.iter_mut().enumerate().take(shown) {
        let lower = if resno > 0 {
          Some(res_rects[resno - 1])
        } else {
          None
        };
        for band in &mut res.bands {
          if band.rect.is_empty() {
            continue;
          }
          let (off_x, off_y) = band_offset(lower, band.orient);
          for prc in &mut band.precincts {
            for cblk in &mut prc.cblks {
              if cblk.rect.is_empty() || cblk.segs.is_empty() {
                continue;
              }
              if let Some(w) = win {
                // Only blocks feeding the grown window matter.
                let level = (shown - 1 - resno) as u32;
                let band_level = if resno == 0 { level } else { level + 1 };
                let margin = dwt::filter_margin(tccp.reversible) + 1;
                let bw = dwt::band_window(band_level, band.orient, w);
                let grown = Rect {
                  x0: bw.x0.saturating_sub(margin),
                  y0: bw.y0.saturating_sub(margin),
                  x1: bw.x1.saturating_add(margin),
                  y1: bw.y1.saturating_add(margin),
                };
                if grown.intersection(&cblk.rect).is_empty() {
                  continue;
                }
              }
              let cw = cblk.rect.width() as usize;
              let ch = cblk.rect.height() as usize;
              let decoded = t1.decode_block(
                cw,
                ch,
                band.orient,
                tccp.cblksty,
                cblk.numbps,
                &cblk.data,
                &cblk.segs,
              );
              let values = match decoded {
                Ok(v) => v,
                Err(err) => {
                  event_msg!(
                    events,
                    EVT_WARNING,
                    "tile {} code-block damaged, zeroed: {}",
                    tileno,
                    err
                  );
                  vec![0; cw * ch]
                }
              };
              // Undo ROI on the doubled-scale value, then either halve
              // out the reconstruction bit (reversible) or dequantise
              // keeping the half-step offset (irreversible).
              let roi_thresh = if tccp.roishift > 0 {
                1i32 << tccp.roishift
              } else {
                0
              };
              let mut out = vec![0i32; cw * ch];
              for (dst, &raw) in out.iter_mut().zip(&values) {
                let mut v = raw;
                if roi_thresh > 0 && v.abs() / 2 >= roi_thresh {
                  let mag = v.abs() >> tccp.roishift;
                  v = if v < 0 { -mag } else { mag };
                }
                *dst = if tccp.reversible {
                  v / 2
                } else {
                  (v as f32 * 0.5 * band.stepsize).to_bits() as i32
                };
              }
              let px = cblk.rect.x0 - band.rect.x0 + off_x;
              let py = cblk.rect.y0 - band.rect.y0 + off_y;
              match window {
                Some(sa) => {
                  sa.write(px, py, px + cw as u32, py + ch as u32, &out, cw as u32);
                }
                None => {
                  for y in 0..ch {
                    let dst = (py as usize + y) * stride + px as usize;
                    data[dst..dst + cw].copy_from_slice(&out[y * cw..(y + 1) * cw]);
                  }
                }
              }
            }
          }
        }
      }
    }
    Ok(())
  }

  fn inverse_dwt(&mut self) {
    for compno in 0..self.tile.comps.len() {
      let tccp = &self.tcp.tccps[compno];
      let win = self.comp_window_of(compno);
      let tc = &mut self.tile.comps[compno];
      let res_rects: Vec<Rect> = tc
        .resolutions
        .iter()
        .take(tc.shown)
        .map(|r| r.rect)
        .collect();
      let stride = tc.stride();
      match &mut tc.window {
        Some(sa) => {
          let target = win.unwrap_or_else(|| *res_rects.last().unwrap());
          dwt::decode_window(sa, &res_rects, tccp.reversible, target);
        }
        None => {
          dwt::decode(&mut tc.data, stride, &res_rects, tccp.reversible);
        }
      }
    }
  }

  /// Materialise the window region into `data` after a windowed DWT.
  fn collect_window(&mut self) {
    for compno in 0..self.tile.comps.len() {
      let win = self.comp_window_of(compno);
      let tc = &mut self.tile.comps[compno];
      if let Some(sa) = tc.window.take() {
        let rect = tc.reduced_rect();
        let win = win.unwrap_or(rect);
        let (w, h) = (win.width(), win.height());
        let mut out = vec![0i32; w as usize * h as usize];
        if w > 0 && h > 0 {
          sa.read(
            win.x0 - rect.x0,
            win.y0 - rect.y0,
            win.x1 - rect.x0,
            win.y1 - rect.y0,
            &mut out,
            w,
          );
        }
        tc.data = out;
      }
    }
  }

  fn inverse_mct(&mut self) {
    match self.tcp.mct {
      MctMode::Off => {}
      MctMode::On => {
        if self.tile.comps.len() < 3 {
          return;
        }
        let reversible = self.tcp.tccps[0].reversible;
        let (d0, d1, d2) = match three_planes(&mut self.tile.comps) {
          Some(p) => p,
          None => {
            event_msg!(
              self.events,
              EVT_WARNING,
              "inverse multi-component transform skipped: component geometry differs"
            );
            return;
          }
        };
        if reversible {
          mct::decode_rct(d0, d1, d2);
        } else {
          mct::decode_ict(d0, d1, d2);
        }
      }
      MctMode::Custom => {
        if let Some(matrix) = &self.tcp.mct_matrix {
          match all_planes(&mut self.tile.comps) {
            Some(mut planes) if planes.len() * planes.len() == matrix.len() => {
              mct::decode_custom(matrix, &mut planes);
            }
            _ => {
              event_msg!(
                self.events,
                EVT_WARNING,
                "custom inverse transform skipped: matrix does not fit the components"
              );
            }
          }
        }
      }
    }
  }

  fn shift_and_clip(&mut self) {
    for (compno, tc) in self.tile.comps.iter_mut().enumerate() {
      let comp = &self.image.comps[compno];
      let tccp = &self.tcp.tccps[compno];
      let shift = if comp.sgnd { 0 } else { 1i32 << (comp.prec - 1) };
      let (min, max) = if comp.sgnd {
        (
          -(1i64 << (comp.prec - 1)) as i32,
          ((1i64 << (comp.prec - 1)) - 1) as i32,
        )
      } else {
        (0, ((1i64 << comp.prec) - 1) as i32)
      };
      for v in &mut tc.data {
        let val = if tccp.reversible {
          *v
        } else {
          let f = f32::from_bits(*v as u32);
          if f >= 0.0 {
            (f + 0.5) as i32
          } else {
            (f - 0.5) as i32
          }
        };
        *v = (val + shift).max(min).min(max);
      }
    }
  }

  /// The decoded region of a component, in reduced coordinates.
  pub fn decoded_rect(&self, compno: usize) -> Rect {
    self
      .comp_window_of(compno)
      .unwrap_or_else(|| self.tile.comps[compno].reduced_rect())
  }
}

/// Number of packets a tile will emit, for diagnostics and validation.
pub(crate) fn packet_count<C>(tile: &Tile<C>, numlayers: u32) -> u64 {
  let mut count = 0u64;
  for tc in &tile.comps {
    for res in &tc.resolutions {
      count += u64::from(res.pw) * u64::from(res.ph) * u64::from(numlayers);
    }
  }
  count
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::image::{ComponentParams, Image};

  fn gray_image(w: u32, h: u32) -> Image {
    let mut image = Image::new(
      0,
      0,
      w,
      h,
      &[ComponentParams {
        dx: 1,
        dy: 1,
        w: 0,
        h: 0,
        x0: 0,
        y0: 0,
        prec: 8,
        sgnd: false,
      }],
    );
    image.alloc_components();
    image
  }

  fn default_tcp(numres: u32) -> Tcp {
    let mut tcp = Tcp::default();
    tcp.tccps = vec![Tccp {
      numresolutions: numres,
      stepsizes: crate::quant::calc_explicit_stepsizes(true, numres, 8),
      ..Default::default()
    }];
    tcp
  }

  #[test]
  fn geometry_counts_match_expected() {
    let image = gray_image(640, 480);
    let cp = CodingParams {
      tx0: 0,
      ty0: 0,
      tdx: 640,
      tdy: 480,
      tw: 1,
      th: 1,
    };
    let tcp = default_tcp(5);
    let events = Events::new();
    let enc = TileEncoder::new(0, &cp, &image, &tcp, &events);
    let tc = &enc.tile.comps[0];
    assert_eq!(tc.resolutions.len(), 5);
    assert_eq!(tc.resolutions[4].rect, Rect::new(0, 0, 640, 480));
    assert_eq!(tc.resolutions[0].rect, Rect::new(0, 0, 40, 30));
    assert_eq!(tc.resolutions[0].bands.len(), 1);
    assert_eq!(tc.resolutions[1].bands.len(), 3);
    // With maximal precincts, one precinct per resolution.
    for res in &tc.resolutions {
      assert_eq!((res.pw, res.ph), (1, 1));
    }
    assert_eq!(packet_count(&enc.tile, 1), 5);
  }

  #[test]
  fn band_rects_cover_resolution() {
    let image = gray_image(100, 100);
    let cp = CodingParams {
      tx0: 0,
      ty0: 0,
      tdx: 100,
      tdy: 100,
      tw: 1,
      th: 1,
    };
    let tcp = default_tcp(2);
    let events = Events::new();
    let enc = TileEncoder::new(0, &cp, &image, &tcp, &events);
    let res1 = &enc.tile.comps[0].resolutions[1];
    let (hl, lh, hh) = (&res1.bands[0], &res1.bands[1], &res1.bands[2]);
    assert_eq!((hl.orient, lh.orient, hh.orient), (1, 2, 3));
    assert_eq!(hl.rect, Rect::new(0, 0, 50, 50));
    assert_eq!(lh.rect, Rect::new(0, 0, 50, 50));
    assert_eq!(hh.rect, Rect::new(0, 0, 50, 50));
    let ll = &enc.tile.comps[0].resolutions[0].bands[0];
    assert_eq!(ll.rect, Rect::new(0, 0, 50, 50));
  }

  #[test]
  fn tile_grid_clipping() {
    let image = gray_image(100, 60);
    let cp = CodingParams {
      tx0: 0,
      ty0: 0,
      tdx: 64,
      tdy: 64,
      tw: 2,
      th: 1,
    };
    assert_eq!(cp.tile_rect(0, &image), Rect::new(0, 0, 64, 60));
    assert_eq!(cp.tile_rect(1, &image), Rect::new(64, 0, 100, 60));
  }

  #[test]
  fn code_block_grid_respects_exponents() {
    let image = gray_image(256, 256);
    let cp = CodingParams {
      tx0: 0,
      ty0: 0,
      tdx: 256,
      tdy: 256,
      tw: 1,
      th: 1,
    };
    let mut tcp = default_tcp(3);
    tcp.tccps[0].cblkw = 5;
    tcp.tccps[0].cblkh = 5;
    let events = Events::new();
    let enc = TileEncoder::new(0, &cp, &image, &tcp, &events);
    // Full-resolution bands are 128x128; with 32x32 blocks that is a 4x4
    // grid per band precinct.
    let res2 = &enc.tile.comps[0].resolutions[2];
    for band in &res2.bands {
      let prc = &band.precincts[0];
      assert_eq!((prc.cw, prc.ch), (4, 4));
      assert_eq!(prc.cblks.len(), 16);
      for cblk in &prc.cblks {
        assert!(cblk.rect.width() <= 32 && cblk.rect.height() <= 32);
      }
    }
  }
}
