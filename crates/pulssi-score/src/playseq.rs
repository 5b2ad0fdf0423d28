//! Playing sequences: ordered lists of block indices.

use arrayvec::ArrayString;

/// An ordered list of block indices played back to back.
#[derive(Clone, Debug)]
pub struct Playseq {
    name: ArrayString<32>,
    entries: Vec<usize>,
}

impl Playseq {
    /// Create a playing sequence containing block 0.
    pub fn new() -> Self {
        Self {
            name: ArrayString::new(),
            entries: vec![0],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name.clear();
        let _ = self.name.try_push_str(name);
    }

    /// Number of positions.
    pub fn length(&self) -> usize {
        self.entries.len()
    }

    /// Block index at the given position, clamped to the last entry.
    pub fn at(&self, position: usize) -> usize {
        let last = self.entries.len().saturating_sub(1);
        self.entries.get(position.min(last)).copied().unwrap_or(0)
    }

    /// Set the block index at a position. Out-of-range writes are dropped.
    pub fn set(&mut self, position: usize, block: usize) {
        if let Some(entry) = self.entries.get_mut(position) {
            *entry = block;
        }
    }

    /// Append a block index.
    pub fn push(&mut self, block: usize) {
        self.entries.push(block);
    }

    /// Drop all positions. The sequence is unplayable until a push; loaders
    /// call this before filling in parsed entries.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for Playseq {
    fn default() -> Self {
        Self::new()
    }
}
