//! Multi-component transforms.
//!
//! RCT (reversible, integer) pairs with the 5/3 wavelet, ICT (irreversible
//! YCbCr) with the 9/7. A custom decorrelation matrix can replace either,
//! carried by the MCT/MCC/MCO marker family.

/// Component norms used by rate allocation for the reversible transform.
const MCT_NORMS_RCT: [f64; 3] = [1.732, 0.8292, 0.8292];
/// Same for the irreversible transform.
const MCT_NORMS_ICT: [f64; 3] = [1.732, 1.805, 1.573];

pub(crate) fn component_norm(irreversible: bool, compno: usize) -> f64 {
  let norms = if irreversible {
    &MCT_NORMS_ICT
  } else {
    &MCT_NORMS_RCT
  };
  norms.get(compno).copied().unwrap_or(1.0)
}

/// Forward reversible colour transform, in place.
pub(crate) fn encode_rct(c0: &mut [i32], c1: &mut [i32], c2: &mut [i32]) {
  for i in 0..c0.len() {
    let r = c0[i];
    let g = c1[i];
    let b = c2[i];
    let y = (r + g * 2 + b) >> 2;
    let u = b - g;
    let v = r - g;
    c0[i] = y;
    c1[i] = u;
    c2[i] = v;
  }
}

/// Inverse reversible colour transform, in place.
pub(crate) fn decode_rct(c0: &mut [i32], c1: &mut [i32], c2: &mut [i32]) {
  for i in 0..c0.len() {
    let y = c0[i];
    let u = c1[i];
    let v = c2[i];
    let g = y - ((u + v) >> 2);
    let r = v + g;
    let b = u + g;
    c0[i] = r;
    c1[i] = g;
    c2[i] = b;
  }
}

/// Forward irreversible colour transform over f32 bit patterns.
pub(crate) fn encode_ict(c0: &mut [i32], c1: &mut [i32], c2: &mut [i32]) {
  for i in 0..c0.len() {
    let r = f32::from_bits(c0[i] as u32);
    let g = f32::from_bits(c1[i] as u32);
    let b = f32::from_bits(c2[i] as u32);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let u = -0.16875 * r - 0.331260 * g + 0.5 * b;
    let v = 0.5 * r - 0.41869 * g - 0.08131 * b;
    c0[i] = y.to_bits() as i32;
    c1[i] = u.to_bits() as i32;
    c2[i] = v.to_bits() as i32;
  }
}

/// Inverse irreversible colour transform over f32 bit patterns.
pub(crate) fn decode_ict(c0: &mut [i32], c1: &mut [i32], c2: &mut [i32]) {
  for i in 0..c0.len() {
    let y = f32::from_bits(c0[i] as u32);
    let u = f32::from_bits(c1[i] as u32);
    let v = f32::from_bits(c2[i] as u32);
    let r = y + 1.402 * v;
    let g = y - 0.344_13 * u - 0.714_14 * v;
    let b = y + 1.772 * u;
    c0[i] = r.to_bits() as i32;
    c1[i] = g.to_bits() as i32;
    c2[i] = b.to_bits() as i32;
  }
}

/// Apply a custom `n x n` decorrelation matrix (row-major) to `n`
/// equally-sized integer planes.
pub(crate) fn encode_custom(matrix: &[f32], comps: &mut [&mut [i32]]) {
  let n = comps.len();
  debug_assert_eq!(matrix.len(), n * n);
  let len = comps[0].len();
  let mut sample = vec![0f32; n];
  for i in 0..len {
    for (c, comp) in comps.iter().enumerate() {
      sample[c] = comp[i] as f32;
    }
    for (r, comp) in comps.iter_mut().enumerate() {
      let mut acc = 0f32;
      for c in 0..n {
        acc += matrix[r * n + c] * sample[c];
      }
      comp[i] = acc.round() as i32;
    }
  }
}

/// Apply the inverse of a custom matrix given directly (the code-stream
/// carries the decode-side matrix).
pub(crate) fn decode_custom(matrix: &[f32], comps: &mut [&mut [i32]]) {
  encode_custom(matrix, comps);
}

/// Invert an `n x n` row-major matrix by Gauss-Jordan elimination with
/// partial pivoting. None for a singular matrix.
pub(crate) fn invert_matrix(m: &[f32], n: usize) -> Option<Vec<f32>> {
  debug_assert_eq!(m.len(), n * n);
  let mut a: Vec<f64> = m.iter().map(|&v| f64::from(v)).collect();
  let mut inv = vec![0f64; n * n];
  for i in 0..n {
    inv[i * n + i] = 1.0;
  }
  for col in 0..n {
    let pivot = (col..n).max_by(|&r1, &r2| {
      a[r1 * n + col]
        .abs()
        .partial_cmp(&a[r2 * n + col].abs())
        .unwrap_or(core::cmp::Ordering::Equal)
    })?;
    if a[pivot * n + col].abs() < 1e-9 {
      return None;
    }
    if pivot != col {
      for k in 0..n {
        a.swap(pivot * n + k, col * n + k);
        inv.swap(pivot * n + k, col * n + k);
      }
    }
    let diag = a[col * n + col];
    for k in 0..n {
      a[col * n + k] /= diag;
      inv[col * n + k] /= diag;
    }
    for row in 0..n {
      if row == col {
        continue;
      }
      let factor = a[row * n + col];
      if factor == 0.0 {
        continue;
      }
      for k in 0..n {
        a[row * n + k] -= factor * a[col * n + k];
        inv[row * n + k] -= factor * inv[col * n + k];
      }
    }
  }
  Some(inv.into_iter().map(|v| v as f32).collect())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rct_round_trip_is_exact() {
    let mut c0: Vec<i32> = (-64..64).collect();
    let mut c1: Vec<i32> = (-64..64).rev().collect();
    let mut c2: Vec<i32> = (0..128).map(|i| (i * 7) % 255 - 127).collect();
    let (o0, o1, o2) = (c0.clone(), c1.clone(), c2.clone());
    encode_rct(&mut c0, &mut c1, &mut c2);
    decode_rct(&mut c0, &mut c1, &mut c2);
    assert_eq!(c0, o0);
    assert_eq!(c1, o1);
    assert_eq!(c2, o2);
  }

  #[test]
  fn ict_round_trip_is_close() {
    let vals: Vec<f32> = (0..100).map(|i| i as f32 * 2.5 - 120.0).collect();
    let mut c0: Vec<i32> = vals.iter().map(|v| v.to_bits() as i32).collect();
    let mut c1 = c0.clone();
    let mut c2: Vec<i32> = vals.iter().map(|v| (-v).to_bits() as i32).collect();
    encode_ict(&mut c0, &mut c1, &mut c2);
    decode_ict(&mut c0, &mut c1, &mut c2);
    let f0: Vec<f32> = c0.iter().map(|v| f32::from_bits(*v as u32)).collect();
    let f1: Vec<f32> = c1.iter().map(|v| f32::from_bits(*v as u32)).collect();
    let f2: Vec<f32> = c2.iter().map(|v| f32::from_bits(*v as u32)).collect();
    for i in 0..vals.len() {
      assert!((f0[i] - vals[i]).abs() < 0.01);
      assert!((f1[i] - vals[i]).abs() < 0.01);
      assert!((f2[i] + vals[i]).abs() < 0.01);
    }
  }

  #[test]
  fn matrix_inversion_round_trips() {
    let m = [2.0f32, 0.0, 0.0, 1.0, 0.5, 0.0, 0.0, 0.0, 4.0];
    let inv = invert_matrix(&m, 3).unwrap();
    // m * inv == identity, within float tolerance.
    for r in 0..3 {
      for c in 0..3 {
        let mut acc = 0f32;
        for k in 0..3 {
          acc += m[r * 3 + k] * inv[k * 3 + c];
        }
        let want = if r == c { 1.0 } else { 0.0 };
        assert!((acc - want).abs() < 1e-5, "({}, {}) = {}", r, c, acc);
      }
    }
    let singular = [1.0f32, 2.0, 2.0, 4.0];
    assert!(invert_matrix(&singular, 2).is_none());
  }

  #[test]
  fn identity_custom_matrix() {
    let matrix = [1.0, 0.0, 0.0, 1.0];
    let mut a = vec![3, -5, 8];
    let mut b = vec![1, 2, 3];
    {
      let mut comps: Vec<&mut [i32]> = vec![&mut a, &mut b];
      encode_custom(&matrix, &mut comps);
    }
    assert_eq!(a, vec![3, -5, 8]);
    assert_eq!(b, vec![1, 2, 3]);
  }
}
