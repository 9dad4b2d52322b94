//! Composite-image assembly: tile retention and ordered strip emission.
//!
//! Decoded tiles land here in completion order. The strip cache writes
//! finished full-width strips through a caller-supplied sink strictly
//! top-down, whatever order tiles arrive in; a mutex over the strip table
//! and a monotone emit cursor make that safe under concurrent ingestion.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::math::{ceil_div, Rect};

/// What the tile cache keeps after a tile was composited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileRetention {
  None,
  All,
  Latest,
}

/// One decoded tile: per-component sample rectangles.
#[derive(Debug, Clone)]
pub struct DecodedTile {
  pub tileno: u32,
  /// Per component: the decoded region (in reduced component
  /// coordinates) and its samples.
  pub regions: Vec<(Rect, Vec<i32>)>,
}

/// Retains decoded tiles according to a strategy.
pub struct TileCache {
  retention: TileRetention,
  entries: HashMap<u32, DecodedTile>,
  latest: Option<u32>,
}

impl TileCache {
  pub fn new(retention: TileRetention) -> Self {
    Self {
      retention,
      entries: HashMap::new(),
      latest: None,
    }
  }

  pub fn insert(&mut self, tile: DecodedTile) {
    match self.retention {
      TileRetention::None => {}
      TileRetention::All => {
        self.entries.insert(tile.tileno, tile);
      }
      TileRetention::Latest => {
        if let Some(prev) = self.latest.take() {
          self.entries.remove(&prev);
        }
        self.latest = Some(tile.tileno);
        self.entries.insert(tile.tileno, tile);
      }
    }
  }

  pub fn get(&self, tileno: u32) -> Option<&DecodedTile> {
    self.entries.get(&tileno)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

/// Receives completed strips. Returning false aborts the decode with
/// `IoFailure`.
pub trait StripSink {
  fn write(&mut self, first_row: u32, num_rows: u32, planes: &[&[i32]]) -> bool;
}

/// Geometry of one component plane inside the strip cache.
#[derive(Debug, Clone, Copy)]
struct PlaneGeom {
  w: u32,
  h: u32,
  dy: u32,
}

struct StripState {
  /// Tiles that still owe samples to this strip.
  tiles_left: u32,
}

/// Composite assembly of decoded tiles with in-order strip emission.
pub struct StripCache<'a> {
  /// Canvas height in reference rows (component 0's grid).
  height: u32,
  strip_height: u32,
  planes: Vec<PlaneGeom>,
  data: Vec<Vec<i32>>,
  state: Mutex<StripStateTable>,
  sink: &'a mut dyn StripSink,
}

struct StripStateTable {
  strips: Vec<StripState>,
  /// Next strip to emit; strictly monotone.
  cursor: usize,
  failed: bool,
}

impl<'a> StripCache<'a> {
  /// `comp_dims`: per component (width, height, dy) of the decoded grid;
  /// `tile_rows_per_strip` maps each strip index to the number of tiles
  /// intersecting it.
  pub fn new(
    comp_dims: &[(u32, u32, u32)],
    strip_height: u32,
    tiles_per_strip: Vec<u32>,
    sink: &'a mut dyn StripSink,
  ) -> Self {
    let height = comp_dims.first().map(|d| d.1).unwrap_or(0);
    let planes: Vec<PlaneGeom> = comp_dims
      .iter()
      .map(|&(w, h, dy)| PlaneGeom { w, h, dy })
      .collect();
    let data = planes
      .iter()
      .map(|p| vec![0i32; p.w as usize * p.h as usize])
      .collect();
    let strips = tiles_per_strip
      .into_iter()
      .map(|tiles_left| StripState { tiles_left })
      .collect();
    Self {
      height,
      strip_height,
      planes,
      data,
      state: Mutex::new(StripStateTable {
        strips,
        cursor: 0,
        failed: false,
      }),
      sink,
    }
  }

  fn num_strips(&self) -> usize {
    ceil_div(self.height.max(1), self.strip_height) as usize
  }

  /// Strip indices a row range [y0, y1) (reference rows) intersects.
  fn strip_range(&self, y0: u32, y1: u32) -> (usize, usize) {
    (
      (y0 / self.strip_height) as usize,
      ceil_div(y1, self.strip_height) as usize,
    )
  }

  /// Ingest one decoded tile. `regions` are per-component rects in the
  /// component grid, with `origin` rows in reference coordinates.
  pub fn ingest(&mut self, tile: &DecodedTile, ref_rows: (u32, u32)) -> Result<()> {
    for (compno, (rect, samples)) in tile.regions.iter().enumerate() {
      let geom = self.planes[compno];
      let dst = &mut self.data[compno];
      let w = rect.width() as usize;
      for (row, chunk) in samples.chunks(w.max(1)).enumerate() {
        let y = rect.y0 as usize + row;
        if y >= geom.h as usize {
          break;
        }
        let start = y * geom.w as usize + rect.x0 as usize;
        let end = (start + w).min((y + 1) * geom.w as usize);
        dst[start..end].copy_from_slice(&chunk[..end - start]);
      }
    }

    let (s0, s1) = self.strip_range(ref_rows.0, ref_rows.1.max(ref_rows.0 + 1));
    let mut ready = Vec::new();
    {
      let mut table = self.state.lock().map_err(|_| Error::IoFailure)?;
      if table.failed {
        return Err(Error::IoFailure);
      }
      for s in s0..s1.min(table.strips.len()) {
        let strip = &mut table.strips[s];
        strip.tiles_left = strip.tiles_left.saturating_sub(1);
      }
      // Emit every complete strip at the cursor, in order.
      while table.cursor < table.strips.len() && table.strips[table.cursor].tiles_left == 0 {
        ready.push(table.cursor);
        table.cursor += 1;
      }
    }
    for s in ready {
      self.emit_strip(s)?;
    }
    Ok(())
  }

  fn emit_strip(&mut self, strip: usize) -> Result<()> {
    let y0 = strip as u32 * self.strip_height;
    let y1 = (y0 + self.strip_height).min(self.height);
    if y0 >= y1 {
      return Ok(());
    }
    let mut views: Vec<&[i32]> = Vec::with_capacity(self.planes.len());
    for (geom, data) in self.planes.iter().zip(&self.data) {
      // Component rows covered by these reference rows.
      let cy0 = ceil_div(y0, geom.dy).min(geom.h);
      let cy1 = ceil_div(y1, geom.dy).min(geom.h);
      views.push(&data[cy0 as usize * geom.w as usize..cy1 as usize * geom.w as usize]);
    }
    if !self.sink.write(y0, y1 - y0, &views) {
      if let Ok(mut table) = self.state.lock() {
        table.failed = true;
      }
      return Err(Error::IoFailure);
    }
    Ok(())
  }

  /// Flush any strips whose tiles never arrived (truncated streams).
  pub fn flush_remaining(&mut self) -> Result<()> {
    let (start, total) = {
      let mut table = self.state.lock().map_err(|_| Error::IoFailure)?;
      let start = table.cursor;
      let total = table.strips.len();
      table.cursor = total;
      (start, total)
    };
    for s in start..total.min(self.num_strips()) {
      self.emit_strip(s)?;
    }
    Ok(())
  }

  /// The assembled planes (for callers that want the whole image).
  pub fn into_planes(self) -> Vec<Vec<i32>> {
    self.data
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct RecordingSink {
    rows_seen: Vec<(u32, u32)>,
    checksum: i64,
  }

  impl StripSink for RecordingSink {
    fn write(&mut self, first_row: u32, num_rows: u32, planes: &[&[i32]]) -> bool {
      self.rows_seen.push((first_row, num_rows));
      self.checksum += planes.iter().flat_map(|p| p.iter()).map(|&v| i64::from(v)).sum::<i64>();
      true
    }
  }

  fn tile(tileno: u32, rect: Rect, value: i32) -> DecodedTile {
    DecodedTile {
      tileno,
      regions: vec![(rect, vec![value; rect.area() as usize])],
    }
  }

  #[test]
  fn strips_emit_top_down_despite_arrival_order() {
    let mut sink = RecordingSink {
      rows_seen: Vec::new(),
      checksum: 0,
    };
    // 8x8 image, two 8x4 tiles, strip height 4 -> one tile per strip.
    let mut cache = StripCache::new(&[(8, 8, 1)], 4, vec![1, 1], &mut sink);
    let bottom = tile(1, Rect::new(0, 4, 8, 8), 2);
    let top = tile(0, Rect::new(0, 0, 8, 4), 1);
    cache.ingest(&bottom, (4, 8)).unwrap();
    cache.ingest(&top, (0, 4)).unwrap();
    drop(cache);
    assert_eq!(sink.rows_seen, vec![(0, 4), (4, 4)]);
    assert_eq!(sink.checksum, (1 + 2) * 8 * 4);
  }

  #[test]
  fn strip_split_across_tiles_waits_for_both() {
    let mut sink = RecordingSink {
      rows_seen: Vec::new(),
      checksum: 0,
    };
    // Two 4x8 tiles side by side; every strip needs both.
    let mut cache = StripCache::new(&[(8, 8, 1)], 4, vec![2, 2], &mut sink);
    cache.ingest(&tile(0, Rect::new(0, 0, 4, 8), 5), (0, 8)).unwrap();
    assert!(sink_is_empty(&cache));
    cache.ingest(&tile(1, Rect::new(4, 0, 8, 8), 6), (0, 8)).unwrap();
    drop(cache);
    assert_eq!(sink.rows_seen, vec![(0, 4), (4, 4)]);
  }

  fn sink_is_empty(cache: &StripCache<'_>) -> bool {
    cache.state.lock().unwrap().cursor == 0
  }

  #[test]
  fn tile_cache_latest_keeps_one() {
    let mut cache = TileCache::new(TileRetention::Latest);
    cache.insert(tile(0, Rect::new(0, 0, 2, 2), 1));
    cache.insert(tile(1, Rect::new(0, 0, 2, 2), 2));
    assert!(cache.get(0).is_none());
    assert!(cache.get(1).is_some());
    assert_eq!(cache.len(), 1);
  }

  #[test]
  fn tile_cache_none_keeps_nothing() {
    let mut cache = TileCache::new(TileRetention::None);
    cache.insert(tile(0, Rect::new(0, 0, 2, 2), 1));
    assert!(cache.is_empty());
  }
}
