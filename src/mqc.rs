//! MQ binary arithmetic coder (ITU-T T.800 annex C).
//!
//! The coder carries 19 adaptive contexts over a 47-entry probability state
//! table. Output is byte-stuffed: a byte following 0xFF only carries 7 data
//! bits. On decode, any byte demanded past the end of the segment reads as
//! 0xFF (C.3.5), so truncation never fails, it just feeds ones.

/// (Qe, NMPS, NLPS, SWITCH) per probability state.
const STATES: [(u32, u8, u8, u8); 47] = [
  (0x5601, 1, 1, 1),
  (0x3401, 2, 6, 0),
  (0x1801, 3, 9, 0),
  (0x0ac1, 4, 12, 0),
  (0x0521, 5, 29, 0),
  (0x0221, 38, 33, 0),
  (0x5601, 7, 6, 1),
  (0x5401, 8, 14, 0),
  (0x4801, 9, 14, 0),
  (0x3801, 10, 14, 0),
  (0x3001, 11, 17, 0),
  (0x2401, 12, 18, 0),
  (0x1c01, 13, 20, 0),
  (0x1601, 29, 21, 0),
  (0x5601, 15, 14, 1),
  (0x5401, 16, 14, 0),
  (0x5101, 17, 15, 0),
  (0x4801, 18, 16, 0),
  (0x3801, 19, 17, 0),
  (0x3401, 20, 18, 0),
  (0x3001, 21, 19, 0),
  (0x2801, 22, 19, 0),
  (0x2401, 23, 20, 0),
  (0x2201, 24, 21, 0),
  (0x1c01, 25, 22, 0),
  (0x1801, 26, 23, 0),
  (0x1601, 27, 24, 0),
  (0x1401, 28, 25, 0),
  (0x1201, 29, 26, 0),
  (0x1101, 30, 27, 0),
  (0x0ac1, 31, 28, 0),
  (0x09c1, 32, 29, 0),
  (0x08a1, 33, 30, 0),
  (0x0521, 34, 31, 0),
  (0x0441, 35, 32, 0),
  (0x02a1, 36, 33, 0),
  (0x0221, 37, 34, 0),
  (0x0141, 38, 35, 0),
  (0x0111, 39, 36, 0),
  (0x0085, 40, 37, 0),
  (0x0049, 41, 38, 0),
  (0x0025, 42, 39, 0),
  (0x0015, 43, 40, 0),
  (0x0009, 44, 41, 0),
  (0x0005, 45, 42, 0),
  (0x0001, 45, 43, 0),
  (0x5601, 46, 46, 0),
];

/// Number of named contexts used by the tier-1 coder.
pub(crate) const NUM_CTXS: usize = 19;
/// Zero-coding contexts occupy 0..9.
pub(crate) const CTX_ZC: usize = 0;
/// Sign-coding contexts occupy 9..14.
pub(crate) const CTX_SC: usize = 9;
/// Magnitude-refinement contexts occupy 14..17.
pub(crate) const CTX_MAG: usize = 14;
/// Uniform context.
pub(crate) const CTX_UNI: usize = 17;
/// Run-length (aggregation) context.
pub(crate) const CTX_AGG: usize = 18;

/// (state index, most probable symbol) per context.
type CtxStates = [(u8, u8); NUM_CTXS];

fn initial_states() -> CtxStates {
  let mut ctxs = [(0u8, 0u8); NUM_CTXS];
  ctxs[CTX_UNI] = (46, 0);
  ctxs[CTX_AGG] = (3, 0);
  ctxs[CTX_ZC] = (4, 0);
  ctxs
}

/// MQ encoder. Also hosts the raw (bypass) encoder of the lazy mode so the
/// two can interleave into one code-block byte stream.
pub(crate) struct MqcEncoder {
  c: u32,
  a: u32,
  ct: u32,
  /// out[0] is a scratch byte standing in for the "byte before the buffer"
  /// carry target; emitted data is out[1..].
  out: Vec<u8>,
  ctxs: CtxStates,
  /// `ct` value at the last raw byte boundary; `ct != raw_fresh_ct` means
  /// raw bits are pending.
  raw_fresh_ct: u32,
}

impl MqcEncoder {
  pub fn new() -> Self {
    Self {
      c: 0,
      a: 0x8000,
      ct: 12,
      out: vec![0],
      ctxs: initial_states(),
      raw_fresh_ct: 8,
    }
  }

  /// Restart the interval registers, keeping context states and output.
  pub fn restart(&mut self) {
    self.c = 0;
    self.a = 0x8000;
    self.ct = 12;
    if *self.out.last().unwrap() == 0xff {
      self.ct = 13;
    }
  }

  pub fn reset_states(&mut self) {
    self.ctxs = initial_states();
  }

  /// Bytes emitted so far.
  pub fn num_bytes(&self) -> usize {
    self.out.len() - 1
  }

  pub fn into_bytes(self) -> Vec<u8> {
    let mut out = self.out;
    out.remove(0);
    out
  }

  fn byte_out(&mut self) {
    let last = self.out.len() - 1;
    if self.out[last] == 0xff {
      self.out.push((self.c >> 20) as u8);
      self.c &= 0xfffff;
      self.ct = 7;
    } else if self.c & 0x800_0000 == 0 {
      self.out.push((self.c >> 19) as u8);
      self.c &= 0x7_ffff;
      self.ct = 8;
    } else {
      self.out[last] = self.out[last].wrapping_add(1);
      if self.out[last] == 0xff {
        self.c &= 0x7ff_ffff;
        self.out.push((self.c >> 20) as u8);
        self.c &= 0xfffff;
        self.ct = 7;
      } else {
        self.out.push((self.c >> 19) as u8);
        self.c &= 0x7_ffff;
        self.ct = 8;
      }
    }
  }

  fn renorm(&mut self) {
    loop {
      self.a <<= 1;
      self.c <<= 1;
      self.ct -= 1;
      if self.ct == 0 {
        self.byte_out();
      }
      if self.a & 0x8000 != 0 {
        break;
      }
    }
  }

  fn code_mps(&mut self, ctx: usize) {
    let (i, _) = self.ctxs[ctx];
    let (qe, nmps, _, _) = STATES[i as usize];
    self.a -= qe;
    if self.a & 0x8000 == 0 {
      if self.a < qe {
        self.a = qe;
      } else {
        self.c += qe;
      }
      self.ctxs[ctx].0 = nmps;
      self.renorm();
    } else {
      self.c += qe;
    }
  }

  fn code_lps(&mut self, ctx: usize) {
    let (i, mps) = self.ctxs[ctx];
    let (qe, _, nlps, switch) = STATES[i as usize];
    self.a -= qe;
    if self.a < qe {
      self.c += qe;
    } else {
      self.a = qe;
    }
    if switch != 0 {
      self.ctxs[ctx].1 = 1 - mps;
    }
    self.ctxs[ctx].0 = nlps;
    self.renorm();
  }

  pub fn encode(&mut self, ctx: usize, d: u32) {
    if d == u32::from(self.ctxs[ctx].1) {
      self.code_mps(ctx);
    } else {
      self.code_lps(ctx);
    }
  }

  fn set_bits(&mut self) {
    let tempc = self.c + self.a;
    self.c |= 0xffff;
    if self.c >= tempc {
      self.c -= 0x8000;
    }
  }

  /// Standard termination: shortest sequence such that appended zero bytes
  /// decode identically. A trailing 0xFF is dropped.
  pub fn flush(&mut self) {
    self.set_bits();
    self.c <<= self.ct;
    self.byte_out();
    self.c <<= self.ct;
    self.byte_out();
    if *self.out.last().unwrap() == 0xff {
      self.out.pop();
    }
  }

  /// Error-resilient termination: lands the decoder on a byte boundary.
  pub fn erterm(&mut self) {
    let mut k = 11 - self.ct as i32 + 1;
    while k > 0 {
      self.c <<= self.ct;
      self.ct = 0;
      self.byte_out();
      k -= self.ct as i32;
    }
    if *self.out.last().unwrap() != 0xff {
      self.byte_out();
    }
  }

  /// Code the 4-symbol segmentation sequence 1010 in the uniform context.
  pub fn segmark(&mut self) {
    for i in 1..5u32 {
      self.encode(CTX_UNI, i % 2);
    }
  }

  // --- raw (selective bypass) mode ------------------------------------

  pub fn bypass_init(&mut self) {
    self.c = 0;
    self.ct = 8;
    if *self.out.last().unwrap() == 0xff {
      self.ct = 7;
    }
    self.raw_fresh_ct = self.ct;
  }

  pub fn bypass_put(&mut self, d: u32) {
    self.c = (self.c << 1) | d;
    self.ct -= 1;
    if self.ct == 0 {
      self.out.push(self.c as u8);
      self.ct = if self.c as u8 == 0xff { 7 } else { 8 };
      self.c = 0;
      self.raw_fresh_ct = self.ct;
    }
  }

  /// Zero-pad any pending raw bits up to the byte boundary.
  pub fn bypass_flush(&mut self) {
    while self.ct != self.raw_fresh_ct {
      self.bypass_put(0);
    }
  }

  /// Upper bound on bytes a bypass flush would add, used when recording
  /// the rate of a non-terminated pass.
  pub fn bypass_pending_bytes(&self) -> usize {
    if self.ct != self.raw_fresh_ct {
      2
    } else {
      1
    }
  }
}

/// MQ decoder over a borrowed segment.
pub(crate) struct MqcDecoder<'a> {
  c: u32,
  a: u32,
  ct: u32,
  bp: usize,
  buf: &'a [u8],
  ctxs: CtxStates,
}

impl<'a> MqcDecoder<'a> {
  pub fn new(buf: &'a [u8]) -> Self {
    let mut d = Self {
      c: 0,
      a: 0,
      ct: 0,
      bp: 0,
      buf,
      ctxs: initial_states(),
    };
    d.c = u32::from(d.byte_at(0)) << 16;
    d.byte_in();
    d.c <<= 7;
    d.ct -= 7;
    d.a = 0x8000;
    d
  }

  /// Re-prime the interval registers on a fresh segment, keeping contexts.
  pub fn restart(&mut self, buf: &'a [u8]) {
    self.buf = buf;
    self.bp = 0;
    self.c = u32::from(self.byte_at(0)) << 16;
    self.byte_in();
    self.c <<= 7;
    self.ct -= 7;
    self.a = 0x8000;
  }

  pub fn reset_states(&mut self) {
    self.ctxs = initial_states();
  }

  /// Bytes consumed, counting the current one.
  pub fn num_bytes(&self) -> usize {
    (self.bp + 1).min(self.buf.len())
  }

  #[inline]
  fn byte_at(&self, i: usize) -> u8 {
    // Past-the-end bytes read as 0xFF (C.3.5).
    self.buf.get(i).copied().unwrap_or(0xff)
  }

  fn byte_in(&mut self) {
    if self.byte_at(self.bp) == 0xff {
      if self.byte_at(self.bp + 1) > 0x8f {
        self.c += 0xff00;
        self.ct = 8;
      } else {
        self.bp += 1;
        self.c += u32::from(self.byte_at(self.bp)) << 9;
        self.ct = 7;
      }
    } else {
      self.bp += 1;
      self.c += u32::from(self.byte_at(self.bp)) << 8;
      self.ct = 8;
    }
  }

  fn renorm(&mut self) {
    loop {
      if self.ct == 0 {
        self.byte_in();
      }
      self.a <<= 1;
      self.c <<= 1;
      self.ct -= 1;
      if self.a & 0x8000 != 0 {
        break;
      }
    }
  }

  pub fn decode(&mut self, ctx: usize) -> u32 {
    let (i, mps) = self.ctxs[ctx];
    let (qe, nmps, nlps, switch) = STATES[i as usize];
    let d;
    self.a -= qe;
    if (self.c >> 16) < qe {
      // LPS or MPS exchange on the lower sub-interval.
      if self.a < qe {
        self.a = qe;
        d = u32::from(mps);
        self.ctxs[ctx].0 = nmps;
      } else {
        self.a = qe;
        d = 1 - u32::from(mps);
        if switch != 0 {
          self.ctxs[ctx].1 = 1 - mps;
        }
        self.ctxs[ctx].0 = nlps;
      }
      self.renorm();
    } else {
      self.c -= qe << 16;
      if self.a & 0x8000 == 0 {
        if self.a < qe {
          d = 1 - u32::from(mps);
          if switch != 0 {
            self.ctxs[ctx].1 = 1 - mps;
          }
          self.ctxs[ctx].0 = nlps;
        } else {
          d = u32::from(mps);
          self.ctxs[ctx].0 = nmps;
        }
        self.renorm();
      } else {
        d = u32::from(mps);
      }
    }
    d
  }
}

/// Raw bit reader for bypassed passes.
pub(crate) struct RawDecoder<'a> {
  c: u32,
  ct: u32,
  bp: usize,
  buf: &'a [u8],
}

impl<'a> RawDecoder<'a> {
  pub fn new(buf: &'a [u8]) -> Self {
    Self {
      c: 0,
      ct: 0,
      bp: 0,
      buf,
    }
  }

  pub fn num_bytes(&self) -> usize {
    self.bp.min(self.buf.len())
  }

  pub fn decode(&mut self) -> u32 {
    if self.ct == 0 {
      if self.c == 0xff {
        if self.buf.get(self.bp).copied().unwrap_or(0xff) > 0x8f {
          self.c = 1;
          self.ct = 8;
        } else {
          self.c = u32::from(self.buf[self.bp]);
          self.bp += 1;
          self.ct = 7;
        }
      } else {
        self.c = u32::from(self.buf.get(self.bp).copied().unwrap_or(0xff));
        self.bp += 1;
        self.ct = 8;
      }
    }
    self.ct -= 1;
    (self.c >> self.ct) & 1
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use rand::{rngs::StdRng, Rng, SeedableRng};

  fn round_trip(bits: &[(usize, u32)]) {
    let mut enc = MqcEncoder::new();
    for &(ctx, d) in bits {
      enc.encode(ctx, d);
    }
    enc.flush();
    let bytes = enc.into_bytes();

    let mut dec = MqcDecoder::new(&bytes);
    for &(ctx, d) in bits {
      assert_eq!(dec.decode(ctx), d);
    }

    // Termination property: trailing zero bytes decode identically.
    let mut padded = bytes;
    padded.extend_from_slice(&[0, 0, 0, 0]);
    let mut dec = MqcDecoder::new(&padded);
    for &(ctx, d) in bits {
      assert_eq!(dec.decode(ctx), d);
    }
  }

  #[test]
  fn single_context_round_trip() {
    let bits: Vec<(usize, u32)> = (0..1000).map(|i| (CTX_UNI, (i % 3 == 0) as u32)).collect();
    round_trip(&bits);
  }

  #[test]
  fn random_contexts_round_trip() {
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..8 {
      let bits: Vec<(usize, u32)> = (0..5000)
        .map(|_| (rng.gen_range(0..NUM_CTXS), rng.gen_range(0..2u32)))
        .collect();
      round_trip(&bits);
    }
  }

  #[test]
  fn skewed_bits_force_stuffing() {
    // Long MPS runs drive Qe small and produce 0xFF-heavy output.
    let bits: Vec<(usize, u32)> = (0..20000).map(|_| (CTX_ZC, 0)).collect();
    round_trip(&bits);
  }

  #[test]
  fn erterm_lands_decodable() {
    let mut enc = MqcEncoder::new();
    let bits: Vec<(usize, u32)> = (0..257).map(|i| (CTX_AGG, (i & 1) as u32)).collect();
    for &(ctx, d) in &bits {
      enc.encode(ctx, d);
    }
    enc.erterm();
    let bytes = enc.into_bytes();
    let mut dec = MqcDecoder::new(&bytes);
    for &(ctx, d) in &bits {
      assert_eq!(dec.decode(ctx), d);
    }
  }

  #[test]
  fn truncated_segment_does_not_panic() {
    let mut enc = MqcEncoder::new();
    for i in 0..4096 {
      enc.encode(CTX_MAG, (i % 5 == 0) as u32);
    }
    enc.flush();
    let bytes = enc.into_bytes();
    let mut dec = MqcDecoder::new(&bytes[..bytes.len() / 2]);
    for _ in 0..4096 {
      let d = dec.decode(CTX_MAG);
      assert!(d <= 1);
    }
  }

  #[test]
  fn raw_round_trip() {
    let mut rng = StdRng::seed_from_u64(3);
    let bits: Vec<u32> = (0..999).map(|_| rng.gen_range(0..2u32)).collect();
    let mut enc = MqcEncoder::new();
    enc.bypass_init();
    for &b in &bits {
      enc.bypass_put(b);
    }
    enc.bypass_flush();
    let bytes = enc.into_bytes();
    let mut dec = RawDecoder::new(&bytes);
    for &b in &bits {
      assert_eq!(dec.decode(), b);
    }
  }

  #[test]
  fn segmark_reads_back_as_1010() {
    let mut enc = MqcEncoder::new();
    enc.segmark();
    enc.flush();
    let bytes = enc.into_bytes();
    let mut dec = MqcDecoder::new(&bytes);
    let mut v = 0;
    for _ in 0..4 {
      v = (v << 1) | dec.decode(CTX_UNI);
    }
    assert_eq!(v, 0xa);
  }
}
