//! Per-track playback settings.

use arrayvec::ArrayString;

/// Mutable per-track state the engine consults: mute/solo flags and volume.
#[derive(Clone, Debug)]
pub struct Track {
    name: ArrayString<32>,
    volume: u8,
    muted: bool,
    solo: bool,
}

impl Track {
    pub fn new() -> Self {
        Self {
            name: ArrayString::new(),
            volume: 127,
            muted: false,
            solo: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name.clear();
        let _ = self.name.try_push_str(name);
    }

    /// Track volume, 0..127.
    pub fn volume(&self) -> u8 {
        self.volume
    }

    pub fn set_volume(&mut self, volume: u8) {
        self.volume = volume.min(127);
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    pub fn is_solo(&self) -> bool {
        self.solo
    }

    pub fn set_solo(&mut self, solo: bool) {
        self.solo = solo;
    }
}

impl Default for Track {
    fn default() -> Self {
        Self::new()
    }
}
