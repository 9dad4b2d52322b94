//! Bit-level I/O for tier-2 packet headers.
//!
//! Fields are packed MSB-first. A byte equal to 0xFF is followed by a
//! 7-bit byte on the wire (the stuffing bit keeps two consecutive 0xFF
//! bytes from forming a marker inside a packet header).

use crate::error::{Error, Result};

/// Packet-header bit writer.
pub(crate) struct BioWriter {
  out: Vec<u8>,
  buf: u32,
  ct: u32,
}

impl BioWriter {
  pub fn new() -> Self {
    Self {
      out: Vec::new(),
      buf: 0,
      ct: 8,
    }
  }

  fn byteout(&mut self) {
    self.buf = (self.buf << 8) & 0xffff;
    self.ct = if self.buf == 0xff00 { 7 } else { 8 };
    self.out.push((self.buf >> 8) as u8);
  }

  pub fn put_bit(&mut self, b: u32) {
    debug_assert!(b <= 1);
    if self.ct == 0 {
      self.byteout();
    }
    self.ct -= 1;
    self.buf |= b << self.ct;
  }

  /// Write the `n` low bits of `v`, MSB first. `n <= 31`.
  pub fn put_bits(&mut self, v: u32, n: u32) {
    debug_assert!(n <= 31);
    for i in (0..n).rev() {
      self.put_bit((v >> i) & 1);
    }
  }

  /// `n` ones then a zero.
  pub fn put_comma_code(&mut self, n: u32) {
    for _ in 0..n {
      self.put_bit(1);
    }
    self.put_bit(0);
  }

  /// One-of-four coding for the per-block pass count, `1 <= n <= 164`.
  pub fn put_numpasses(&mut self, n: u32) {
    debug_assert!((1..=164).contains(&n));
    if n == 1 {
      self.put_bits(0, 1);
    } else if n == 2 {
      self.put_bits(2, 2);
    } else if n <= 5 {
      self.put_bits(0xc | (n - 3), 4);
    } else if n <= 36 {
      self.put_bits(0x1e0 | (n - 6), 9);
    } else {
      self.put_bits(0xff80 | (n - 37), 16);
    }
  }

  /// Pad to the byte boundary and return the produced bytes. A final 0xFF
  /// is followed by its stuffed zero byte so the reader stays aligned.
  pub fn flush(mut self) -> Vec<u8> {
    self.byteout();
    if self.ct == 7 {
      self.byteout();
    }
    self.out
  }
}

/// Packet-header bit reader.
pub(crate) struct BioReader<'a> {
  buf_bytes: &'a [u8],
  pos: usize,
  buf: u32,
  ct: u32,
}

impl<'a> BioReader<'a> {
  pub fn new(buf_bytes: &'a [u8]) -> Self {
    Self {
      buf_bytes,
      pos: 0,
      buf: 0,
      ct: 0,
    }
  }

  /// Bytes consumed so far, counting the partially read one.
  pub fn bytes_read(&self) -> usize {
    self.pos
  }

  fn bytein(&mut self) -> Result<()> {
    self.buf = (self.buf << 8) & 0xffff;
    self.ct = if self.buf == 0xff00 { 7 } else { 8 };
    let byte = *self
      .buf_bytes
      .get(self.pos)
      .ok_or(Error::TruncatedPacketHeader)?;
    self.pos += 1;
    self.buf |= u32::from(byte);
    Ok(())
  }

  pub fn get_bit(&mut self) -> Result<u32> {
    if self.ct == 0 {
      self.bytein()?;
    }
    self.ct -= 1;
    Ok((self.buf >> self.ct) & 1)
  }

  /// Read an `n`-bit MSB-first field, `n <= 31`.
  pub fn get_bits(&mut self, n: u32) -> Result<u32> {
    debug_assert!(n <= 31);
    let mut v = 0;
    for i in (0..n).rev() {
      v |= self.get_bit()? << i;
    }
    Ok(v)
  }

  pub fn get_comma_code(&mut self) -> Result<u32> {
    let mut n = 0;
    while self.get_bit()? != 0 {
      n += 1;
    }
    Ok(n)
  }

  pub fn get_numpasses(&mut self) -> Result<u32> {
    if self.get_bit()? == 0 {
      return Ok(1);
    }
    if self.get_bit()? == 0 {
      return Ok(2);
    }
    let n = self.get_bits(2)?;
    if n != 3 {
      return Ok(3 + n);
    }
    let n = self.get_bits(5)?;
    if n != 31 {
      return Ok(6 + n);
    }
    Ok(37 + self.get_bits(7)?)
  }

  /// Discard bits up to the byte boundary. If the last consumed byte was
  /// 0xFF the stuffed byte is consumed too, mirroring the writer's flush.
  pub fn align(&mut self) -> Result<()> {
    if (self.buf & 0xff) == 0xff {
      self.bytein()?;
    }
    self.ct = 0;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use rand::{rngs::StdRng, Rng, SeedableRng};

  #[test]
  fn bit_round_trip_with_stuffing() {
    let mut w = BioWriter::new();
    // All-ones forces 0xFF bytes and exercises stuffing.
    for _ in 0..64 {
      w.put_bit(1);
    }
    let bytes = w.flush();
    // Every 0xFF is followed by a byte with the top bit clear.
    for pair in bytes.windows(2) {
      if pair[0] == 0xff {
        assert_eq!(pair[1] & 0x80, 0);
      }
    }
    let mut r = BioReader::new(&bytes);
    for _ in 0..64 {
      assert_eq!(r.get_bit().unwrap(), 1);
    }
    r.align().unwrap();
  }

  #[test]
  fn random_fields_round_trip() {
    let mut rng = StdRng::seed_from_u64(7);
    let fields: Vec<(u32, u32)> = (0..500)
      .map(|_| {
        let n = rng.gen_range(1..=31);
        (rng.gen::<u32>() & ((1u32 << n) - 1), n)
      })
      .collect();
    let mut w = BioWriter::new();
    for &(v, n) in &fields {
      w.put_bits(v, n);
    }
    let bytes = w.flush();
    let mut r = BioReader::new(&bytes);
    for &(v, n) in &fields {
      assert_eq!(r.get_bits(n).unwrap(), v);
    }
    r.align().unwrap();
    assert_eq!(r.bytes_read(), bytes.len());
  }

  #[test]
  fn comma_and_numpasses_codes() {
    let mut w = BioWriter::new();
    for n in 0..20 {
      w.put_comma_code(n);
    }
    for n in 1..=164 {
      w.put_numpasses(n);
    }
    let bytes = w.flush();
    let mut r = BioReader::new(&bytes);
    for n in 0..20 {
      assert_eq!(r.get_comma_code().unwrap(), n);
    }
    for n in 1..=164 {
      assert_eq!(r.get_numpasses().unwrap(), n);
    }
  }

  #[test]
  fn truncated_read_fails() {
    let mut r = BioReader::new(&[0xab]);
    assert!(r.get_bits(8).is_ok());
    assert!(matches!(
      r.get_bits(1),
      Err(Error::TruncatedPacketHeader)
    ));
  }
}
