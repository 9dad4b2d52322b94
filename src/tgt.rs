//! Tag-trees.
//!
//! A quad-tree over a `w x h` leaf grid where every internal node holds the
//! minimum of its children. Tier-2 keeps two per precinct: one for first
//! inclusion layers, one for zero bit-plane counts.

use crate::bio::{BioReader, BioWriter};
use crate::error::Result;

/// Sentinel meaning "value not set yet"; any real value is far below it.
const UNSET: i32 = 999;

#[derive(Clone, Copy, Default)]
struct Node {
  value: i32,
  low: i32,
  known: bool,
  /// Index of the parent node; the root points at itself.
  parent: u32,
}

pub(crate) struct TagTree {
  leafs_w: u32,
  leafs_h: u32,
  nodes: Vec<Node>,
}

impl TagTree {
  pub fn new(leafs_w: u32, leafs_h: u32) -> Self {
    let mut tree = Self {
      leafs_w: 0,
      leafs_h: 0,
      nodes: Vec::new(),
    };
    tree.init(leafs_w, leafs_h);
    tree
  }

  /// Reshape for a new leaf grid, reusing storage, and reset.
  pub fn init(&mut self, leafs_w: u32, leafs_h: u32) {
    debug_assert!(leafs_w > 0 && leafs_h > 0);
    if self.leafs_w != leafs_w || self.leafs_h != leafs_h {
      self.leafs_w = leafs_w;
      self.leafs_h = leafs_h;
      self.rebuild();
    }
    self.reset();
  }

  fn rebuild(&mut self) {
    // Per-level grid sizes, halving up to the 1x1 root.
    let mut levels = Vec::with_capacity(8);
    let (mut w, mut h) = (self.leafs_w, self.leafs_h);
    loop {
      levels.push((w, h));
      if w * h <= 1 {
        break;
      }
      w = (w + 1) / 2;
      h = (h + 1) / 2;
    }
    let mut offsets = Vec::with_capacity(levels.len());
    let mut total = 0u32;
    for &(w, h) in &levels {
      offsets.push(total);
      total += w * h;
    }
    self.nodes = vec![Node::default(); total as usize];
    for (lvl, &(w, h)) in levels.iter().enumerate() {
      for y in 0..h {
        for x in 0..w {
          let idx = offsets[lvl] + y * w + x;
          let parent = if lvl + 1 < levels.len() {
            let (pw, _) = levels[lvl + 1];
            offsets[lvl + 1] + (y / 2) * pw + (x / 2)
          } else {
            idx
          };
          self.nodes[idx as usize].parent = parent;
        }
      }
    }
  }

  pub fn reset(&mut self) {
    for node in &mut self.nodes {
      node.value = UNSET;
      node.low = 0;
      node.known = false;
    }
  }

  /// Lower the leaf (and every ancestor above it) to `value`.
  pub fn set_value(&mut self, leaf: u32, value: i32) {
    let mut idx = leaf as usize;
    loop {
      let node = &mut self.nodes[idx];
      if node.value <= value {
        break;
      }
      node.value = value;
      let parent = node.parent as usize;
      if parent == idx {
        break;
      }
      idx = parent;
    }
  }

  fn path_to_root(&self, leaf: u32) -> Vec<usize> {
    let mut path = Vec::with_capacity(8);
    let mut idx = leaf as usize;
    loop {
      path.push(idx);
      let parent = self.nodes[idx].parent as usize;
      if parent == idx {
        break;
      }
      idx = parent;
    }
    path.reverse();
    path
  }

  pub fn encode(&mut self, bio: &mut BioWriter, leaf: u32, threshold: i32) {
    let mut low = 0;
    for idx in self.path_to_root(leaf) {
      let node = &mut self.nodes[idx];
      if low > node.low {
        node.low = low;
      } else {
        low = node.low;
      }
      while low < threshold {
        if low >= node.value {
          if !node.known {
            bio.put_bit(1);
            node.known = true;
          }
          break;
        }
        bio.put_bit(0);
        low += 1;
      }
      node.low = low;
    }
  }

  /// Returns true when the leaf's value is proven `< threshold`.
  pub fn decode(&mut self, bio: &mut BioReader<'_>, leaf: u32, threshold: i32) -> Result<bool> {
    let path = self.path_to_root(leaf);
    let mut low = 0;
    for &idx in &path {
      let node = &mut self.nodes[idx];
      if low > node.low {
        node.low = low;
      } else {
        low = node.low;
      }
      while low < threshold && low < node.value {
        if bio.get_bit()? != 0 {
          node.value = low;
        } else {
          low += 1;
        }
      }
      node.low = low;
    }
    Ok(self.nodes[*path.last().unwrap()].value < threshold)
  }

  /// Decoded leaf value; only meaningful once `decode` returned true.
  pub fn value(&self, leaf: u32) -> i32 {
    self.nodes[leaf as usize].value
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn transcode(tree_w: u32, tree_h: u32, values: &[i32], threshold: i32) -> Vec<(bool, i32)> {
    let mut enc_tree = TagTree::new(tree_w, tree_h);
    for (leaf, &v) in values.iter().enumerate() {
      enc_tree.set_value(leaf as u32, v);
    }
    let mut bio = BioWriter::new();
    for leaf in 0..values.len() as u32 {
      enc_tree.encode(&mut bio, leaf, threshold);
    }
    let bytes = bio.flush();

    let mut dec_tree = TagTree::new(tree_w, tree_h);
    let mut reader = BioReader::new(&bytes);
    let mut out = Vec::new();
    for leaf in 0..values.len() as u32 {
      let below = dec_tree.decode(&mut reader, leaf, threshold).unwrap();
      out.push((below, dec_tree.value(leaf)));
    }
    out
  }

  #[test]
  fn ancestors_track_minimum() {
    let mut tree = TagTree::new(4, 4);
    tree.set_value(5, 7);
    tree.set_value(6, 3);
    // The root is the last node; it must now hold the global minimum.
    let root = tree.nodes.len() - 1;
    assert_eq!(tree.nodes[root].value, 3);
  }

  #[test]
  fn decode_recovers_values_below_threshold() {
    let values = [3, 1, 4, 1, 5, 9, 2, 6, 5, 3, 5, 8];
    let decoded = transcode(4, 3, &values, 10);
    for (i, &(below, v)) in decoded.iter().enumerate() {
      assert!(below, "leaf {} should be below threshold", i);
      assert_eq!(v, values[i]);
    }
  }

  #[test]
  fn decode_reports_at_or_above_threshold() {
    let values = [3, 1, 4, 1, 5, 9, 2, 6];
    let threshold = 4;
    let decoded = transcode(4, 2, &values, threshold);
    for (i, &(below, v)) in decoded.iter().enumerate() {
      if values[i] < threshold {
        assert!(below);
        assert_eq!(v, values[i]);
      } else {
        assert!(!below);
      }
    }
  }

  #[test]
  fn incremental_thresholds_match_layer_usage() {
    // The tier-2 inclusion tree is interrogated once per layer with an
    // increasing threshold; values must resolve exactly at value+1.
    let values = [0, 2, 1, 3];
    let mut enc_tree = TagTree::new(2, 2);
    for (leaf, &v) in values.iter().enumerate() {
      enc_tree.set_value(leaf as u32, v);
    }
    let mut bio = BioWriter::new();
    for threshold in 1..=4 {
      for leaf in 0..4 {
        enc_tree.encode(&mut bio, leaf, threshold);
      }
    }
    let bytes = bio.flush();

    let mut dec_tree = TagTree::new(2, 2);
    let mut reader = BioReader::new(&bytes);
    for threshold in 1..=4 {
      for (leaf, &v) in values.iter().enumerate() {
        let below = dec_tree.decode(&mut reader, leaf as u32, threshold).unwrap();
        assert_eq!(below, v < threshold);
      }
    }
  }

  #[test]
  fn single_leaf_tree() {
    let decoded = transcode(1, 1, &[2], 5);
    assert_eq!(decoded, vec![(true, 2)]);
  }
}
