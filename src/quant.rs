//! Quantisation: per-band step sizes and magnitude-bit budgets.
//!
//! Step sizes travel as an (exponent, 11-bit mantissa) pair per band, or a
//! single pair for the scalar-derived style. The reversible path always
//! uses step 1 and signals exponents only.

/// Quantisation style from the SQcd/SQcc field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantStyle {
  /// Reversible: no quantisation, exponents only.
  NoQuant,
  /// One transmitted step, others derived dyadically.
  ScalarDerived,
  /// One transmitted step per band.
  ScalarExplicit,
}

impl QuantStyle {
  pub(crate) fn as_u8(self) -> u8 {
    match self {
      QuantStyle::NoQuant => 0,
      QuantStyle::ScalarDerived => 1,
      QuantStyle::ScalarExplicit => 2,
    }
  }

  pub(crate) fn from_u8(v: u8) -> Option<Self> {
    match v {
      0 => Some(QuantStyle::NoQuant),
      1 => Some(QuantStyle::ScalarDerived),
      2 => Some(QuantStyle::ScalarExplicit),
      _ => None,
    }
  }
}

/// Transmitted step size for one sub-band.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepSize {
  pub expn: i32,
  pub mant: u32,
}

impl StepSize {
  /// Quantise a real step into the (expn, mant) wire form. `numbps` is the
  /// nominal dynamic range of the band (precision + gain).
  pub fn from_step(step: f64, numbps: i32) -> Self {
    let fixed = (step * 8192.0).floor() as i32;
    let fixed = fixed.max(1);
    let log = 31 - (fixed as u32).leading_zeros() as i32;
    let p = log - 13;
    let n = 11 - log;
    let mant = (if n < 0 {
      (fixed >> -n) as u32
    } else {
      (fixed << n) as u32
    }) & 0x7ff;
    StepSize {
      expn: numbps - p,
      mant,
    }
  }

  /// Reconstruct the real step for a band of dynamic range `numbps`.
  pub fn to_step(self, numbps: i32) -> f32 {
    ((1.0 + self.mant as f64 / 2048.0) * 2f64.powi(numbps - self.expn)) as f32
  }
}

/// Log2 gain of a band orientation under the reversible transform
/// (0 for LL, 1 for HL/LH, 2 for HH); the 9/7 path has no gain.
#[inline]
pub(crate) fn band_gain(reversible: bool, orient: u32) -> u32 {
  if !reversible {
    0
  } else {
    match orient {
      0 => 0,
      1 | 2 => 1,
      _ => 2,
    }
  }
}

/// L2 norms of the synthesis basis per orientation and decomposition
/// level, reversible 5/3 filter.
const NORMS_53: [[f64; 10]; 4] = [
  [1.000, 1.500, 2.750, 5.375, 10.68, 21.34, 42.67, 85.33, 170.7, 341.3],
  [1.038, 1.592, 2.919, 5.703, 11.33, 22.64, 45.25, 90.48, 180.9, 180.9],
  [1.038, 1.592, 2.919, 5.703, 11.33, 22.64, 45.25, 90.48, 180.9, 180.9],
  [0.7186, 0.9218, 1.586, 3.043, 6.019, 12.01, 24.00, 47.97, 95.93, 95.93],
];

/// Same for the irreversible 9/7 filter.
const NORMS_97: [[f64; 10]; 4] = [
  [1.000, 1.965, 4.177, 8.403, 16.90, 33.84, 67.69, 135.3, 270.6, 540.9],
  [2.022, 3.989, 8.355, 17.04, 34.27, 68.63, 137.3, 274.6, 549.0, 549.0],
  [2.022, 3.989, 8.355, 17.04, 34.27, 68.63, 137.3, 274.6, 549.0, 549.0],
  [2.080, 3.865, 8.307, 17.18, 34.71, 69.59, 139.3, 278.6, 557.2, 557.2],
];

/// Basis norm for (level, orient); levels beyond the table saturate.
pub(crate) fn band_norm(reversible: bool, level: u32, orient: u32) -> f64 {
  let table = if reversible { &NORMS_53 } else { &NORMS_97 };
  let level = (level as usize).min(9);
  table[orient as usize][level]
}

/// Global band index -> (resolution, orientation within resolution).
#[inline]
pub(crate) fn band_coords(bandno: u32) -> (u32, u32) {
  if bandno == 0 {
    (0, 0)
  } else {
    ((bandno - 1) / 3 + 1, (bandno - 1) % 3 + 1)
  }
}

/// Default step sizes for an encoder tile component: unity steps for the
/// reversible path, norm-derived steps for the irreversible one.
pub(crate) fn calc_explicit_stepsizes(
  reversible: bool,
  num_resolutions: u32,
  prec: u32,
) -> Vec<StepSize> {
  let numbands = 3 * num_resolutions - 2;
  let mut steps = Vec::with_capacity(numbands as usize);
  for bandno in 0..numbands {
    let (resno, orient) = band_coords(bandno);
    let level = num_resolutions - 1 - resno;
    let gain = band_gain(reversible, orient);
    let step = if reversible {
      1.0
    } else {
      let norm = band_norm(false, level, orient);
      f64::from(1u32 << gain) / norm
    };
    steps.push(StepSize::from_step(step, (prec + gain) as i32));
  }
  steps
}

/// Fill the derived (scalar-implicit) step table from its first entry.
pub(crate) fn expand_derived(steps: &mut Vec<StepSize>, numbands: u32) {
  let base = steps[0];
  steps.truncate(1);
  for bandno in 1..numbands {
    steps.push(StepSize {
      expn: (base.expn - ((bandno as i32 - 1) / 3)).max(0),
      mant: base.mant,
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unity_step_round_trips_exactly() {
    let numbps = 10;
    let s = StepSize::from_step(1.0, numbps);
    assert_eq!(s.mant, 0);
    assert_eq!(s.expn, numbps);
    assert_eq!(s.to_step(numbps), 1.0);
  }

  #[test]
  fn steps_round_trip_within_mantissa_precision() {
    for &step in &[0.015625, 0.1, 0.5, 1.0, 1.5, 2.0, 3.75, 11.0] {
      let numbps = 12;
      let coded = StepSize::from_step(step, numbps);
      let back = f64::from(coded.to_step(numbps));
      let err = (back - step).abs() / step;
      assert!(err < 1.0 / 2048.0 + 1e-9, "step {} came back {}", step, back);
    }
  }

  #[test]
  fn derived_exponents_decrease_per_level() {
    let mut steps = vec![StepSize { expn: 9, mant: 3 }];
    expand_derived(&mut steps, 7);
    let expns: Vec<i32> = steps.iter().map(|s| s.expn).collect();
    assert_eq!(expns, vec![9, 9, 9, 9, 8, 8, 8]);
    assert!(steps.iter().all(|s| s.mant == 3));
  }

  #[test]
  fn reversible_defaults_are_unity() {
    let steps = calc_explicit_stepsizes(true, 5, 8);
    assert_eq!(steps.len(), 13);
    for (bandno, s) in steps.iter().enumerate() {
      let (_, orient) = band_coords(bandno as u32);
      let gain = band_gain(true, orient);
      assert_eq!(s.mant, 0);
      assert_eq!(s.expn, (8 + gain) as i32);
    }
  }
}
