//! Discrete wavelet transforms.
//!
//! Lifting implementations of the reversible 5/3 and irreversible 9/7
//! filters. The whole-tile paths transform the tile-component plane in
//! place (coarser resolutions occupy the top-left corner, full stride).
//! The windowed inverse reconstructs only a grown window per resolution
//! out of a block-sparse store, which is how region-of-interest decoding
//! avoids allocating full planes.
//!
//! Irreversible samples live as f32 bit patterns inside the i32 plane.

use crate::math::{ceil_div_pow2, Rect};
use crate::sparse::SparseArray;

/// 9/7 lifting constants.
const ALPHA: f32 = -1.586_134_3;
const BETA: f32 = -0.052_980_118;
const GAMMA: f32 = 0.882_911_1;
const DELTA: f32 = 0.443_506_85;
const K: f32 = 1.230_174_1;

/// Window grow margin per resolution, in band samples.
pub(crate) fn filter_margin(reversible: bool) -> u32 {
  if reversible {
    1
  } else {
    2
  }
}

/// Sub-band rectangle for decomposition level `level` and orientation
/// `orient` (0 = LL, 1 = HL, 2 = LH, 3 = HH) of the region `rect`
/// (ITU-T T.800 B.5). `level == 0` only makes sense for orientation 0.
pub(crate) fn band_window(level: u32, orient: u32, rect: Rect) -> Rect {
  if level == 0 {
    debug_assert_eq!(orient, 0);
    return rect;
  }
  let xob = orient & 1;
  let yob = (orient >> 1) & 1;
  let ox = (1u32 << (level - 1)) * xob;
  let oy = (1u32 << (level - 1)) * yob;
  Rect {
    x0: ceil_div_pow2(rect.x0.saturating_sub(ox), level),
    y0: ceil_div_pow2(rect.y0.saturating_sub(oy), level),
    x1: ceil_div_pow2(rect.x1.saturating_sub(ox), level),
    y1: ceil_div_pow2(rect.y1.saturating_sub(oy), level),
  }
}

/// One lifting kernel: the sample representation plus the 1-D transforms
/// over an interleaved line. `cas` is the parity of the line's first
/// absolute coordinate (1 when it starts on a high-pass sample).
trait Kernel {
  type S: Copy + Default;
  fn load(raw: i32) -> Self::S;
  fn store(s: Self::S) -> i32;
  fn forward(a: &mut [Self::S], sn: i32, dn: i32, cas: usize);
  fn inverse(a: &mut [Self::S], sn: i32, dn: i32, cas: usize);
}

/// Clamped channel fetch: channel samples sit at `2i + parity`; indices
/// reflect at the line ends, which for lifting neighbours equals clamping.
#[inline]
fn ch<S: Copy>(a: &[S], parity: usize, i: i32, n: i32) -> S {
  let i = i.max(0).min(n - 1);
  a[2 * i as usize + parity]
}

struct Rev53;

impl Kernel for Rev53 {
  type S = i32;

  #[inline]
  fn load(raw: i32) -> i32 {
    raw
  }

  #[inline]
  fn store(s: i32) -> i32 {
    s
  }

  fn forward(a: &mut [i32], sn: i32, dn: i32, cas: usize) {
    if cas == 0 {
      if dn == 0 && sn <= 1 {
        return;
      }
      for i in 0..dn {
        a[2 * i as usize + 1] -= (ch(a, 0, i, sn) + ch(a, 0, i + 1, sn)) >> 1;
      }
      for i in 0..sn {
        a[2 * i as usize] += (ch(a, 1, i - 1, dn) + ch(a, 1, i, dn) + 2) >> 2;
      }
    } else {
      if sn == 0 && dn == 1 {
        a[0] *= 2;
        return;
      }
      if dn == 0 && sn <= 1 {
        return;
      }
      // High-pass channel at even positions, low-pass at odd.
      for i in 0..dn {
        a[2 * i as usize] -= (ch(a, 1, i - 1, sn) + ch(a, 1, i, sn)) >> 1;
      }
      for i in 0..sn {
        a[2 * i as usize + 1] += (ch(a, 0, i, dn) + ch(a, 0, i + 1, dn) + 2) >> 2;
      }
    }
  }

  fn inverse(a: &mut [i32], sn: i32, dn: i32, cas: usize) {
    if cas == 0 {
      if dn == 0 && sn <= 1 {
        return;
      }
      for i in 0..sn {
        a[2 * i as usize] -= (ch(a, 1, i - 1, dn) + ch(a, 1, i, dn) + 2) >> 2;
      }
      for i in 0..dn {
        a[2 * i as usize + 1] += (ch(a, 0, i, sn) + ch(a, 0, i + 1, sn)) >> 1;
      }
    } else {
      if sn == 0 && dn == 1 {
        a[0] /= 2;
        return;
      }
      if dn == 0 && sn <= 1 {
        return;
      }
      for i in 0..sn {
        a[2 * i as usize + 1] -= (ch(a, 0, i, dn) + ch(a, 0, i + 1, dn) + 2) >> 2;
      }
      for i in 0..dn {
        a[2 * i as usize] += (ch(a, 1, i - 1, sn) + ch(a, 1, i, sn)) >> 1;
      }
    }
  }
}

struct Irr97;

impl Irr97 {
  fn lift(a: &mut [f32], sn: i32, dn: i32, cas: usize, coef: f32, update_low: bool) {
    let (p, n, nn) = if update_low {
      (cas, sn, dn)
    } else {
      (1 - cas, dn, sn)
    };
    for i in 0..n {
      // A sample on even parity has neighbours (i-1, i) in the other
      // channel; on odd parity they are (i, i+1).
      let (j0, j1) = if p == 0 { (i - 1, i) } else { (i, i + 1) };
      let v = ch(a, 1 - p, j0, nn) + ch(a, 1 - p, j1, nn);
      a[2 * i as usize + p] += coef * v;
    }
  }
}

impl Kernel for Irr97 {
  type S = f32;

  #[inline]
  fn load(raw: i32) -> f32 {
    f32::from_bits(raw as u32)
  }

  #[inline]
  fn store(s: f32) -> i32 {
    s.to_bits() as i32
  }

  fn forward(a: &mut [f32], sn: i32, dn: i32, cas: usize) {
    if sn == 0 && dn == 1 {
      return;
    }
    if dn == 0 && sn <= 1 {
      return;
    }
    Self::lift(a, sn, dn, cas, ALPHA, false);
    Self::lift(a, sn, dn, cas, BETA, true);
    Self::lift(a, sn, dn, cas, GAMMA, false);
    Self::lift(a, sn, dn, cas, DELTA, true);
    for i in 0..sn {
      a[2 * i as usize + cas] *= 1.0 / K;
    }
    for i in 0..dn {
      a[2 * i as usize + 1 - cas] *= K;
    }
  }

  fn inverse(a: &mut [f32], sn: i32, dn: i32, cas: usize) {
    if sn == 0 && dn == 1 {
      return;
    }
    if dn == 0 && sn <= 1 {
      return;
    }
    for i in 0..sn {
      a[2 * i as usize + cas] *= K;
    }
    for i in 0..dn {
      a[2 * i as usize + 1 - cas] *= 1.0 / K;
    }
    Self::lift(a, sn, dn, cas, -DELTA, true);
    Self::lift(a, sn, dn, cas, -GAMMA, false);
    Self::lift(a, sn, dn, cas, -BETA, true);
    Self::lift(a, sn, dn, cas, -ALPHA, false);
  }
}

/// Per-level line counts: `(sn, dn, cas)` for one axis.
fn axis_split(lower: u32, upper: u32, origin: u32) -> (i32, i32, usize) {
  (lower as i32, (upper - lower) as i32, (origin & 1) as usize)
}

fn forward_level<Kn: Kernel>(data: &mut [i32], stride: usize, cur: Rect, lower: Rect, scratch: &mut Vec<Kn::S>) {
  let rw = cur.width() as usize;
  let rh = cur.height() as usize;
  if rw == 0 || rh == 0 {
    return;
  }
  let (sn_y, dn_y, cas_y) = axis_split(lower.height(), cur.height(), cur.y0);
  let (sn_x, dn_x, cas_x) = axis_split(lower.width(), cur.width(), cur.x0);

  // Vertical pass: each column is still a natural-order signal.
  scratch.resize(rh.max(rw), Kn::S::default());
  for x in 0..rw {
    for y in 0..rh {
      scratch[y] = Kn::load(data[y * stride + x]);
    }
    Kn::forward(&mut scratch[..rh], sn_y, dn_y, cas_y);
    // Deinterleave: low half on top, high half below.
    for i in 0..sn_y as usize {
      data[i * stride + x] = Kn::store(scratch[2 * i + cas_y]);
    }
    for i in 0..dn_y as usize {
      data[(sn_y as usize + i) * stride + x] = Kn::store(scratch[2 * i + 1 - cas_y]);
    }
  }

  // Horizontal pass over every row of both halves.
  for y in 0..rh {
    let row = &mut data[y * stride..y * stride + rw];
    for (i, v) in row.iter().enumerate() {
      scratch[i] = Kn::load(*v);
    }
    Kn::forward(&mut scratch[..rw], sn_x, dn_x, cas_x);
    for i in 0..sn_x as usize {
      row[i] = Kn::store(scratch[2 * i + cas_x]);
    }
    for i in 0..dn_x as usize {
      row[sn_x as usize + i] = Kn::store(scratch[2 * i + 1 - cas_x]);
    }
  }
}

fn inverse_level<Kn: Kernel>(data: &mut [i32], stride: usize, cur: Rect, lower: Rect, scratch: &mut Vec<Kn::S>) {
  let rw = cur.width() as usize;
  let rh = cur.height() as usize;
  if rw == 0 || rh == 0 {
    return;
  }
  let (sn_y, dn_y, cas_y) = axis_split(lower.height(), cur.height(), cur.y0);
  let (sn_x, dn_x, cas_x) = axis_split(lower.width(), cur.width(), cur.x0);
  scratch.resize(rh.max(rw), Kn::S::default());

  // Horizontal pass: rows hold [low | high] halves.
  for y in 0..rh {
    let row = &mut data[y * stride..y * stride + rw];
    for i in 0..sn_x as usize {
      scratch[2 * i + cas_x] = Kn::load(row[i]);
    }
    for i in 0..dn_x as usize {
      scratch[2 * i + 1 - cas_x] = Kn::load(row[sn_x as usize + i]);
    }
    Kn::inverse(&mut scratch[..rw], sn_x, dn_x, cas_x);
    for (i, v) in row.iter_mut().enumerate() {
      *v = Kn::store(scratch[i]);
    }
  }

  // Vertical pass: top rows are the low half, bottom rows the high half.
  for x in 0..rw {
    for i in 0..sn_y as usize {
      scratch[2 * i + cas_y] = Kn::load(data[i * stride + x]);
    }
    for i in 0..dn_y as usize {
      scratch[2 * i + 1 - cas_y] = Kn::load(data[(sn_y as usize + i) * stride + x]);
    }
    Kn::inverse(&mut scratch[..rh], sn_y, dn_y, cas_y);
    for y in 0..rh {
      data[y * stride + x] = Kn::store(scratch[y]);
    }
  }
}

/// Forward transform of a tile-component plane. `resolutions[0]` is the
/// coarsest level, the last entry the full component; `stride` is the full
/// component width.
pub(crate) fn encode(data: &mut [i32], stride: usize, resolutions: &[Rect], reversible: bool) {
  let mut scratch_i = Vec::new();
  let mut scratch_f = Vec::new();
  for l in (1..resolutions.len()).rev() {
    if reversible {
      forward_level::<Rev53>(data, stride, resolutions[l], resolutions[l - 1], &mut scratch_i);
    } else {
      forward_level::<Irr97>(data, stride, resolutions[l], resolutions[l - 1], &mut scratch_f);
    }
  }
}

/// Inverse transform up to `resolutions.len()` levels. The plane holds the
/// deinterleaved band layout; on return it holds samples of the last
/// resolution in the slice.
pub(crate) fn decode(data: &mut [i32], stride: usize, resolutions: &[Rect], reversible: bool) {
  let mut scratch_i = Vec::new();
  let mut scratch_f = Vec::new();
  for l in 1..resolutions.len() {
    if reversible {
      inverse_level::<Rev53>(data, stride, resolutions[l], resolutions[l - 1], &mut scratch_i);
    } else {
      inverse_level::<Irr97>(data, stride, resolutions[l], resolutions[l - 1], &mut scratch_f);
    }
  }
}

/// Relative, margin-grown window of `win` inside `band`, per axis:
/// `(x0, x1, y0, y1)` in band-local coordinates.
fn grown_band_window(win: Rect, band: Rect, margin: u32) -> (u32, u32, u32, u32) {
  let clip = win.intersection(&band);
  if clip.is_empty() {
    return (0, 0, 0, 0);
  }
  let x0 = (clip.x0 - band.x0).saturating_sub(margin);
  let y0 = (clip.y0 - band.y0).saturating_sub(margin);
  let x1 = (clip.x1 - band.x0).saturating_add(margin).min(band.width());
  let y1 = (clip.y1 - band.y0).saturating_add(margin).min(band.height());
  (x0, x1, y0, y1)
}

/// Interleaved (resolution-local) span covered by low span `(l0, l1)` and
/// high span `(h0, h1)`, clamped to `n`.
fn interleaved_span(l0: u32, l1: u32, h0: u32, h1: u32, n: u32) -> (u32, u32) {
  let lo = if l1 > l0 && h1 > h0 {
    (2 * l0).min(2 * h0 + 1)
  } else if l1 > l0 {
    2 * l0
  } else if h1 > h0 {
    2 * h0 + 1
  } else {
    return (0, 0);
  };
  let hi = (2 * l1).max(if h1 > h0 { 2 * h1 + 1 } else { 0 }).min(n);
  (lo.min(n), hi)
}

/// Windowed inverse transform over a sparse store laid out like the
/// whole-tile plane (per level: low half then high half on both axes).
/// `win` is the target window in final-resolution coordinates; only
/// samples within the per-level grown windows are reconstructed.
pub(crate) fn decode_window(sa: &mut SparseArray, resolutions: &[Rect], reversible: bool, win: Rect) {
  if resolutions.len() < 2 {
    return;
  }
  let margin = filter_margin(reversible);
  let tilec = *resolutions.last().unwrap();
  for l in 1..resolutions.len() {
    let cur = resolutions[l];
    let lower = resolutions[l - 1];
    let rw = cur.width();
    let rh = cur.height();
    if rw == 0 || rh == 0 {
      continue;
    }
    let nb = (resolutions.len() - l) as u32;
    let (sn_x, dn_x, cas_x) = axis_split(lower.width(), cur.width(), cur.x0);
    let (sn_y, dn_y, cas_y) = axis_split(lower.height(), cur.height(), cur.y0);

    let (ll_x0, ll_x1, ll_y0, ll_y1) =
      grown_band_window(band_window(nb, 0, win), band_window(nb, 0, tilec), margin);
    let (hl_x0, hl_x1, _, _) =
      grown_band_window(band_window(nb, 1, win), band_window(nb, 1, tilec), margin);
    let (_, _, lh_y0, lh_y1) =
      grown_band_window(band_window(nb, 2, win), band_window(nb, 2, tilec), margin);

    let (tr_x0, tr_x1) = interleaved_span(ll_x0, ll_x1, hl_x0, hl_x1, rw);
    let (tr_y0, tr_y1) = interleaved_span(ll_y0, ll_y1, lh_y0, lh_y1, rh);
    if tr_x0 >= tr_x1 || tr_y0 >= tr_y1 {
      continue;
    }

    // Horizontal pass for every row either half of the window needs.
    for j in 0..rh {
      let needed = (j >= ll_y0 && j < ll_y1)
        || (j >= sn_y as u32 + lh_y0 && j < sn_y as u32 + lh_y1);
      if !needed {
        continue;
      }
      let mut raw = vec![0i32; rw as usize];
      sa.read(0, j, rw, j + 1, &mut raw, rw);
      if reversible {
        let mut line = vec![0i32; rw as usize];
        for i in 0..sn_x as usize {
          line[2 * i + cas_x] = raw[i];
        }
        for i in 0..dn_x as usize {
          line[2 * i + 1 - cas_x] = raw[sn_x as usize + i];
        }
        Rev53::inverse(&mut line, sn_x, dn_x, cas_x);
        sa.write(tr_x0, j, tr_x1, j + 1, &line[tr_x0 as usize..tr_x1 as usize], rw);
      } else {
        let mut line = vec![0f32; rw as usize];
        for i in 0..sn_x as usize {
          line[2 * i + cas_x] = f32::from_bits(raw[i] as u32);
        }
        for i in 0..dn_x as usize {
          line[2 * i + 1 - cas_x] = f32::from_bits(raw[sn_x as usize + i] as u32);
        }
        Irr97::inverse(&mut line, sn_x, dn_x, cas_x);
        let out: Vec<i32> = line[tr_x0 as usize..tr_x1 as usize]
          .iter()
          .map(|v| v.to_bits() as i32)
          .collect();
        sa.write(tr_x0, j, tr_x1, j + 1, &out, rw);
      }
    }

    // Vertical pass over the window columns.
    for x in tr_x0..tr_x1 {
      if reversible {
        let mut col = vec![0i32; rh as usize];
        sa.read_column(x, 0, rh, &mut col);
        let mut line = vec![0i32; rh as usize];
        for i in 0..sn_y as usize {
          line[2 * i + cas_y] = col[i];
        }
        for i in 0..dn_y as usize {
          line[2 * i + 1 - cas_y] = col[sn_y as usize + i];
        }
        Rev53::inverse(&mut line, sn_y, dn_y, cas_y);
        sa.write_column(x, tr_y0, tr_y1, &line[tr_y0 as usize..tr_y1 as usize]);
      } else {
        let mut col = vec![0i32; rh as usize];
        sa.read_column(x, 0, rh, &mut col);
        let mut line = vec![0f32; rh as usize];
        for i in 0..sn_y as usize {
          line[2 * i + cas_y] = f32::from_bits(col[i] as u32);
        }
        for i in 0..dn_y as usize {
          line[2 * i + 1 - cas_y] = f32::from_bits(col[sn_y as usize + i] as u32);
        }
        Irr97::inverse(&mut line, sn_y, dn_y, cas_y);
        let out: Vec<i32> = line[tr_y0 as usize..tr_y1 as usize]
          .iter()
          .map(|v| v.to_bits() as i32)
          .collect();
        sa.write_column(x, tr_y0, tr_y1, &out);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use rand::{rngs::StdRng, Rng, SeedableRng};

  /// Dyadic resolution ladder for a tile-component rectangle.
  fn resolution_ladder(rect: Rect, numres: u32) -> Vec<Rect> {
    (0..numres)
      .map(|r| rect.ceil_div_pow2(numres - 1 - r))
      .collect()
  }

  fn random_plane(rng: &mut StdRng, rect: Rect) -> Vec<i32> {
    (0..rect.area()).map(|_| rng.gen_range(-1000..1000)).collect()
  }

  #[test]
  fn reversible_round_trip_various_geometry() {
    let mut rng = StdRng::seed_from_u64(11);
    for &(x0, y0, w, h, nres) in &[
      (0u32, 0u32, 64u32, 64u32, 4u32),
      (0, 0, 37, 23, 3),
      (3, 5, 33, 17, 4),
      (1, 0, 5, 1, 2),
      (0, 1, 1, 9, 3),
      (7, 7, 2, 2, 2),
    ] {
      let rect = Rect::new(x0, y0, x0 + w, y0 + h);
      let res = resolution_ladder(rect, nres);
      let stride = rect.width() as usize;
      let orig = random_plane(&mut rng, rect);
      let mut data = orig.clone();
      encode(&mut data, stride, &res, true);
      decode(&mut data, stride, &res, true);
      assert_eq!(data, orig, "geometry {:?} nres {}", rect, nres);
    }
  }

  #[test]
  fn irreversible_round_trip_close() {
    let mut rng = StdRng::seed_from_u64(5);
    let rect = Rect::new(2, 3, 2 + 49, 3 + 31);
    let res = resolution_ladder(rect, 4);
    let stride = rect.width() as usize;
    let orig: Vec<f32> = (0..rect.area()).map(|_| rng.gen_range(-255.0..255.0)).collect();
    let mut data: Vec<i32> = orig.iter().map(|v| v.to_bits() as i32).collect();
    encode(&mut data, stride, &res, false);
    decode(&mut data, stride, &res, false);
    for (got, want) in data.iter().zip(&orig) {
      let got = f32::from_bits(*got as u32);
      assert!((got - want).abs() < 0.01, "{} vs {}", got, want);
    }
  }

  #[test]
  fn windowed_decode_matches_whole_decode() {
    let mut rng = StdRng::seed_from_u64(23);
    let rect = Rect::new(5, 2, 5 + 70, 2 + 46);
    let res = resolution_ladder(rect, 4);
    let stride = rect.width() as usize;
    let orig = random_plane(&mut rng, rect);
    let mut bands = orig.clone();
    encode(&mut bands, stride, &res, true);

    // The forward output layout is exactly the sparse store layout.
    let mut sa = SparseArray::new(rect.width(), rect.height(), 16, 16);
    assert!(sa.write(0, 0, rect.width(), rect.height(), &bands, rect.width()));

    for &(wx0, wy0, wx1, wy1) in &[(5u32, 2u32, 25u32, 20u32), (40, 30, 75, 48), (30, 10, 31, 11)] {
      let win = Rect::new(wx0, wy0, wx1, wy1);
      let mut sa_run = SparseArray::new(rect.width(), rect.height(), 16, 16);
      assert!(sa_run.write(0, 0, rect.width(), rect.height(), &bands, rect.width()));
      decode_window(&mut sa_run, &res, true, win);

      let ww = win.width();
      let wh = win.height();
      let mut got = vec![0i32; (ww * wh) as usize];
      assert!(sa_run.read(
        win.x0 - rect.x0,
        win.y0 - rect.y0,
        win.x1 - rect.x0,
        win.y1 - rect.y0,
        &mut got,
        ww,
      ));
      for y in 0..wh {
        for x in 0..ww {
          let fx = (win.x0 - rect.x0 + x) as usize;
          let fy = (win.y0 - rect.y0 + y) as usize;
          assert_eq!(
            got[(y * ww + x) as usize],
            orig[fy * stride + fx],
            "window {:?} at ({}, {})",
            win,
            x,
            y
          );
        }
      }
    }
  }

  #[test]
  fn band_window_parity() {
    // One decomposition of [0, 9): low band gets the even positions.
    let r = Rect::new(0, 0, 9, 1);
    assert_eq!(band_window(1, 0, r), Rect::new(0, 0, 5, 1));
    assert_eq!(band_window(1, 1, r), Rect::new(0, 0, 4, 1));
    // Odd origin flips the split.
    let r = Rect::new(1, 0, 9, 1);
    assert_eq!(band_window(1, 0, r), Rect::new(1, 0, 5, 1));
    assert_eq!(band_window(1, 1, r), Rect::new(0, 0, 4, 1));
  }
}
