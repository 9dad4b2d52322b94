//! Image and component model.
//!
//! All geometry lives on the JPEG 2000 canvas: a component covers the
//! canvas area `(x0, y0)..(x1, y1)` subsampled by `(dx, dy)`, and owns its
//! sample plane as `i32` regardless of declared precision.

use crate::math::ceil_div;

/// Colour space signalled by the `colr` box or assumed from the component
/// count when decoding a raw code-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorSpace {
  Unknown,
  Unspecified,
  Srgb,
  Gray,
  Sycc,
  Eycc,
  Cmyk,
}

impl Default for ColorSpace {
  fn default() -> Self {
    ColorSpace::Unspecified
  }
}

impl ColorSpace {
  pub(crate) fn enumcs(self) -> Option<u32> {
    match self {
      ColorSpace::Cmyk => Some(12),
      ColorSpace::Srgb => Some(16),
      ColorSpace::Gray => Some(17),
      ColorSpace::Sycc => Some(18),
      ColorSpace::Eycc => Some(24),
      _ => None,
    }
  }

  pub(crate) fn from_enumcs(v: u32) -> Self {
    match v {
      12 => ColorSpace::Cmyk,
      16 => ColorSpace::Srgb,
      17 => ColorSpace::Gray,
      18 => ColorSpace::Sycc,
      24 => ColorSpace::Eycc,
      _ => ColorSpace::Unknown,
    }
  }
}

/// Channel definition triple from the `cdef` box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelDef {
  pub channel: u16,
  /// 0 = colour, 1 = opacity, 2 = pre-multiplied opacity, 65535 = unspecified.
  pub typ: u16,
  /// 0 = whole image, otherwise 1-based colour index.
  pub assoc: u16,
}

/// Palette from the `pclr` box plus the `cmap` channel mapping.
#[derive(Debug, Clone, Default)]
pub struct Palette {
  pub num_entries: u16,
  /// Per-column (bit-depth, signed) pairs.
  pub columns: Vec<(u8, bool)>,
  /// `num_entries * columns.len()` lookup values, row-major.
  pub entries: Vec<i32>,
  /// Per output channel: (source component, mapping type, palette column).
  pub cmap: Vec<(u16, u8, u8)>,
}

/// Parameters to create one component.
#[derive(Debug, Clone, Copy)]
pub struct ComponentParams {
  pub dx: u32,
  pub dy: u32,
  pub w: u32,
  pub h: u32,
  pub x0: u32,
  pub y0: u32,
  pub prec: u32,
  pub sgnd: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ImageComponent {
  /// Horizontal / vertical canvas subsampling.
  pub dx: u32,
  pub dy: u32,
  /// Buffer dimensions (already subsampled, already reduced).
  pub w: u32,
  pub h: u32,
  /// Canvas origin.
  pub x0: u32,
  pub y0: u32,
  /// Bit depth in 1..=38.
  pub prec: u32,
  pub sgnd: bool,
  /// Highest resolution actually decoded, counting from 0.
  pub resno_decoded: u32,
  /// Resolution reduction applied while decoding.
  pub factor: u32,
  /// Declared alpha via cdef.
  pub alpha: bool,
  pub data: Vec<i32>,
}

impl ImageComponent {
  pub fn alloc_data(&mut self) {
    self.data = vec![0; self.w as usize * self.h as usize];
  }

  /// Clip samples to the representable range of `precision` bits.
  pub fn clip(&mut self, precision: u32) {
    let (min, max) = if self.sgnd {
      let max = (1i64 << (precision - 1)) - 1;
      (-max - 1, max)
    } else {
      (0, (1i64 << precision) - 1)
    };
    for v in &mut self.data {
      let val = *v as i64;
      *v = val.max(min).min(max) as i32;
    }
  }
}

#[derive(Debug, Clone, Default)]
pub struct Image {
  /// Canvas rectangle.
  pub x0: u32,
  pub y0: u32,
  pub x1: u32,
  pub y1: u32,
  pub comps: Vec<ImageComponent>,
  pub color_space: ColorSpace,
  pub icc_profile: Option<Vec<u8>>,
  pub palette: Option<Palette>,
  pub channel_defs: Vec<ChannelDef>,
  /// Capture resolution in pixels per metre, from the `res` box.
  pub capture_resolution: Option<(f64, f64)>,
}

impl Image {
  /// Create an image whose components all share the canvas offset.
  pub fn new(x0: u32, y0: u32, x1: u32, y1: u32, params: &[ComponentParams]) -> Self {
    let comps = params
      .iter()
      .map(|p| ImageComponent {
        dx: p.dx,
        dy: p.dy,
        w: p.w,
        h: p.h,
        x0: p.x0,
        y0: p.y0,
        prec: p.prec,
        sgnd: p.sgnd,
        ..Default::default()
      })
      .collect();
    Self {
      x0,
      y0,
      x1,
      y1,
      comps,
      ..Default::default()
    }
  }

  pub fn width(&self) -> u32 {
    self.x1 - self.x0
  }

  pub fn height(&self) -> u32 {
    self.y1 - self.y0
  }

  /// Derive every component's buffer rectangle from the canvas and its
  /// subsampling, allocating sample storage.
  pub fn alloc_components(&mut self) {
    let (x0, y0, x1, y1) = (self.x0, self.y0, self.x1, self.y1);
    for comp in &mut self.comps {
      comp.x0 = ceil_div(x0, comp.dx);
      comp.y0 = ceil_div(y0, comp.dy);
      comp.w = ceil_div(x1, comp.dx) - comp.x0;
      comp.h = ceil_div(y1, comp.dy) - comp.y0;
      comp.alloc_data();
    }
  }

  /// True when the first three components can be treated as one colour
  /// group (same subsampling and precision), the precondition for MCT.
  pub(crate) fn mct_applicable(&self) -> bool {
    if self.comps.len() < 3 {
      return false;
    }
    let c0 = &self.comps[0];
    self.comps[1..3]
      .iter()
      .all(|c| c.dx == c0.dx && c.dy == c0.dy && c.prec == c0.prec && c.sgnd == c0.sgnd)
  }
}

/// Expand palette indices into the mapped output channels.
///
/// Consumes the palette: afterwards the image carries direct sample values.
pub(crate) fn apply_palette(image: &mut Image) {
  let palette = match image.palette.take() {
    Some(p) if !p.cmap.is_empty() => p,
    _ => return,
  };
  let mut out_comps: Vec<ImageComponent> = Vec::with_capacity(palette.cmap.len());
  for &(cmp, mtyp, pcol) in &palette.cmap {
    let src = match image.comps.get(cmp as usize) {
      Some(c) => c,
      None => return,
    };
    let mut comp = src.clone();
    if mtyp == 1 {
      // Palette mapping: look indices up in the selected column.
      let (prec, sgnd) = palette
        .columns
        .get(pcol as usize)
        .map(|&(b, s)| (u32::from(b), s))
        .unwrap_or((comp.prec, comp.sgnd));
      comp.prec = prec;
      comp.sgnd = sgnd;
      let ncols = palette.columns.len();
      comp.data = src
        .data
        .iter()
        .map(|&idx| {
          let idx = (idx.max(0) as usize).min(palette.num_entries.saturating_sub(1) as usize);
          palette.entries[idx * ncols + pcol as usize]
        })
        .collect();
    }
    out_comps.push(comp);
  }
  image.comps = out_comps;
}

/// Mark alpha components according to the channel definitions.
pub(crate) fn apply_channel_defs(image: &mut Image) {
  for def in image.channel_defs.clone() {
    if let Some(comp) = image.comps.get_mut(def.channel as usize) {
      comp.alpha = def.typ == 1 || def.typ == 2;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn component_geometry_honors_subsampling() {
    let params = [
      ComponentParams {
        dx: 1,
        dy: 1,
        w: 0,
        h: 0,
        x0: 0,
        y0: 0,
        prec: 8,
        sgnd: false,
      },
      ComponentParams {
        dx: 2,
        dy: 2,
        w: 0,
        h: 0,
        x0: 0,
        y0: 0,
        prec: 8,
        sgnd: false,
      },
    ];
    let mut image = Image::new(0, 0, 11, 7, &params);
    image.alloc_components();
    assert_eq!((image.comps[0].w, image.comps[0].h), (11, 7));
    assert_eq!((image.comps[1].w, image.comps[1].h), (6, 4));
    assert_eq!(image.comps[1].data.len(), 24);
  }

  #[test]
  fn clip_respects_sign() {
    let mut comp = ImageComponent {
      w: 4,
      h: 1,
      prec: 8,
      sgnd: false,
      data: vec![-5, 0, 255, 300],
      ..Default::default()
    };
    comp.clip(8);
    assert_eq!(comp.data, vec![0, 0, 255, 255]);

    comp.sgnd = true;
    comp.data = vec![-200, -128, 127, 200];
    comp.clip(8);
    assert_eq!(comp.data, vec![-128, -128, 127, 127]);
  }

  #[test]
  fn palette_expansion() {
    let mut image = Image::default();
    image.comps.push(ImageComponent {
      w: 2,
      h: 2,
      prec: 2,
      data: vec![0, 1, 2, 1],
      ..Default::default()
    });
    image.palette = Some(Palette {
      num_entries: 3,
      columns: vec![(8, false), (8, false)],
      entries: vec![10, 20, 11, 21, 12, 22],
      cmap: vec![(0, 1, 0), (0, 1, 1)],
    });
    apply_palette(&mut image);
    assert_eq!(image.comps.len(), 2);
    assert_eq!(image.comps[0].data, vec![10, 11, 12, 11]);
    assert_eq!(image.comps[1].data, vec![20, 21, 22, 21]);
    assert_eq!(image.comps[0].prec, 8);
  }
}
