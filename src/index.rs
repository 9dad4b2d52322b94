//! Side-channel length indices: packet lengths (PLM/PLT) and tile-part
//! lengths (TLM).
//!
//! Both are advisory. The packet-length cache hands out declared lengths
//! in stream order and answers 0 when it has nothing, which sends the
//! caller back to parsing headers. The TLM index allows seeking straight
//! to a tile's first tile-part and is dropped whole on any inconsistency.

/// Accumulates PLM/PLT packet lengths, in packet order.
#[derive(Default)]
pub(crate) struct PacketLengthCache {
  lengths: Vec<u32>,
  next: usize,
  /// Carry for a multi-byte length split across marker segments.
  partial: u32,
  valid: bool,
}

impl PacketLengthCache {
  pub fn new() -> Self {
    Self {
      valid: true,
      ..Default::default()
    }
  }

  /// Feed the Iplm/Iplt bytes of one PLM/PLT segment (after the index
  /// byte). Lengths use a 7-bit continuation encoding.
  pub fn push_segment(&mut self, bytes: &[u8]) {
    for &b in bytes {
      self.partial = (self.partial << 7) | u32::from(b & 0x7f);
      if b & 0x80 == 0 {
        self.lengths.push(self.partial);
        self.partial = 0;
      }
    }
  }

  pub fn invalidate(&mut self) {
    self.valid = false;
    self.lengths.clear();
    self.next = 0;
  }

  /// Declared length of the next packet, 0 when unknown.
  pub fn next(&mut self) -> u32 {
    if !self.valid {
      return 0;
    }
    match self.lengths.get(self.next) {
      Some(&len) => {
        self.next += 1;
        len
      }
      None => 0,
    }
  }
}

/// One TLM entry: which tile and how long its tile-part is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TlmEntry {
  pub tileno: u32,
  pub length: u32,
}

/// Tile-part length table from TLM markers.
#[derive(Default)]
pub(crate) struct TlmIndex {
  entries: Vec<TlmEntry>,
  valid: bool,
}

impl TlmIndex {
  pub fn new() -> Self {
    Self {
      entries: Vec::new(),
      valid: true,
    }
  }

  /// Parse one TLM payload (after Ztlm). `st` and `sp` come from Stlm.
  pub fn push_segment(&mut self, bytes: &[u8], st: u32, sp: u32, next_implicit_tile: &mut u32) {
    if !self.valid {
      return;
    }
    let tile_bytes = st as usize;
    let len_bytes = if sp == 1 { 4 } else { 2 };
    let rec = tile_bytes + len_bytes;
    if rec == 0 || bytes.len() % rec != 0 {
      self.invalidate();
      return;
    }
    for chunk in bytes.chunks(rec) {
      let tileno = match tile_bytes {
        0 => {
          let t = *next_implicit_tile;
          *next_implicit_tile += 1;
          t
        }
        1 => u32::from(chunk[0]),
        _ => u32::from(u16::from_be_bytes([chunk[0], chunk[1]])),
      };
      let len = if len_bytes == 2 {
        u32::from(u16::from_be_bytes([chunk[tile_bytes], chunk[tile_bytes + 1]]))
      } else {
        u32::from_be_bytes([
          chunk[tile_bytes],
          chunk[tile_bytes + 1],
          chunk[tile_bytes + 2],
          chunk[tile_bytes + 3],
        ])
      };
      self.entries.push(TlmEntry {
        tileno,
        length: len,
      });
    }
  }

  pub fn is_valid(&self) -> bool {
    self.valid && !self.entries.is_empty()
  }

  pub fn invalidate(&mut self) {
    self.valid = false;
    self.entries.clear();
  }

  pub fn entries(&self) -> &[TlmEntry] {
    &self.entries
  }

  /// Byte offset (relative to the first SOT) of the first tile-part of
  /// `tileno`, walking the declared lengths. None when the index cannot
  /// answer.
  pub fn seek_offset(&self, tileno: u32) -> Option<u64> {
    if !self.is_valid() {
      return None;
    }
    let mut offset = 0u64;
    for entry in &self.entries {
      if entry.tileno == tileno {
        return Some(offset);
      }
      if entry.length == 0 {
        return None;
      }
      offset += u64::from(entry.length);
    }
    None
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn packet_lengths_concatenate_across_segments() {
    let mut cache = PacketLengthCache::new();
    // 0x85 0x02 encodes (5 << 7) | 2 = 642 over two bytes.
    cache.push_segment(&[0x0a, 0x85]);
    cache.push_segment(&[0x02, 0x7f]);
    assert_eq!(cache.next(), 0x0a);
    assert_eq!(cache.next(), 642);
    assert_eq!(cache.next(), 0x7f);
    assert_eq!(cache.next(), 0, "exhausted cache answers 0");
  }

  #[test]
  fn invalidated_cache_answers_zero() {
    let mut cache = PacketLengthCache::new();
    cache.push_segment(&[0x09]);
    cache.invalidate();
    assert_eq!(cache.next(), 0);
  }

  #[test]
  fn tlm_seek_walks_lengths() {
    let mut index = TlmIndex::new();
    let mut implicit = 0;
    // Two records: tile 0 len 100, tile 1 len 250 (st=1, sp=0).
    index.push_segment(&[0, 0, 100, 1, 0, 250], 1, 0, &mut implicit);
    // Third record for tile 2 in a later segment.
    index.push_segment(&[2, 0, 50], 1, 0, &mut implicit);
    assert_eq!(index.seek_offset(0), Some(0));
    assert_eq!(index.seek_offset(1), Some(100));
    assert_eq!(index.seek_offset(2), Some(350));
    assert_eq!(index.seek_offset(7), None);
  }

  #[test]
  fn tlm_zero_tile_bytes_numbers_implicitly() {
    let mut index = TlmIndex::new();
    let mut implicit = 0;
    index.push_segment(&[0, 10, 0, 20], 0, 0, &mut implicit);
    assert_eq!(
      index.entries(),
      &[
        TlmEntry {
          tileno: 0,
          length: 10
        },
        TlmEntry {
          tileno: 1,
          length: 20
        }
      ]
    );
  }

  #[test]
  fn tlm_bad_segment_invalidates() {
    let mut index = TlmIndex::new();
    let mut implicit = 0;
    index.push_segment(&[0, 0, 100, 9], 1, 0, &mut implicit);
    assert!(!index.is_valid());
    assert_eq!(index.seek_offset(0), None);
  }
}
