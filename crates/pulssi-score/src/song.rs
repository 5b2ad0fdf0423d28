//! Song structure: the arena owning blocks, sequences, instruments and tracks.

use std::sync::{Mutex, MutexGuard, PoisonError};

use arrayvec::ArrayString;

use crate::block::Block;
use crate::instrument::Instrument;
use crate::message::Message;
use crate::playseq::Playseq;
use crate::track::Track;

/// A complete song. Blocks, playing sequences, instruments and tracks live
/// in owning vectors; cells and cursors reference them by index. Out-of-range
/// indices are clamped by the accessors, never trusted.
#[derive(Clone, Debug)]
pub struct Song {
    name: ArrayString<32>,
    tempo: u32,
    ticks_per_line: u32,
    master_volume: u8,
    send_sync: bool,
    blocks: Vec<Block>,
    playseqs: Vec<Playseq>,
    /// Section array: playseq indices in macro order
    sections: Vec<usize>,
    instruments: Vec<Instrument>,
    tracks: Vec<Track>,
    messages: Vec<Message>,
}

impl Song {
    /// Create a playable one-block song with default settings.
    pub fn new() -> Self {
        let mut song = Self::empty();
        let _ = song.name.try_push_str("Untitled");
        song.blocks.push(Block::default());
        song.playseqs.push(Playseq::new());
        song.sections.push(0);
        song.check_max_tracks();
        song
    }

    /// Create a song with no blocks, sequences or sections. Loaders fill one
    /// in and must call [`Song::normalize`] before handing it to the engine.
    pub fn empty() -> Self {
        Self {
            name: ArrayString::new(),
            tempo: 120,
            ticks_per_line: 6,
            master_volume: 127,
            send_sync: false,
            blocks: Vec::new(),
            playseqs: Vec::new(),
            sections: Vec::new(),
            instruments: Vec::new(),
            tracks: Vec::new(),
            messages: Vec::new(),
        }
    }

    /// Restore the structural invariants the engine relies on: at least one
    /// block, playing sequence, section and track, and nonzero timing values.
    pub fn normalize(&mut self) {
        if self.blocks.is_empty() {
            self.blocks.push(Block::default());
        }
        if self.playseqs.is_empty() {
            self.playseqs.push(Playseq::new());
        }
        if self.sections.is_empty() {
            self.sections.push(0);
        }
        self.tempo = self.tempo.max(1);
        self.ticks_per_line = self.ticks_per_line.max(1);
        self.check_max_tracks();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name.clear();
        let _ = self.name.try_push_str(name);
    }

    /// Tempo in beats per minute. One line is one beat.
    pub fn tempo(&self) -> u32 {
        self.tempo
    }

    pub fn set_tempo(&mut self, tempo: u32) {
        self.tempo = tempo.max(1);
    }

    /// Ticks per line: how many engine ticks one line spans.
    pub fn ticks_per_line(&self) -> u32 {
        self.ticks_per_line
    }

    pub fn set_ticks_per_line(&mut self, ticks_per_line: u32) {
        self.ticks_per_line = ticks_per_line.max(1);
    }

    /// Master volume, 0..127.
    pub fn master_volume(&self) -> u8 {
        self.master_volume
    }

    pub fn set_master_volume(&mut self, master_volume: u8) {
        self.master_volume = master_volume.min(127);
    }

    /// Whether MIDI clock/start/stop should be sent on all outputs.
    pub fn send_sync(&self) -> bool {
        self.send_sync
    }

    pub fn set_send_sync(&mut self, send_sync: bool) {
        self.send_sync = send_sync;
    }

    // --- Counts ---

    pub fn blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn playseqs(&self) -> usize {
        self.playseqs.len()
    }

    pub fn sections(&self) -> usize {
        self.sections.len()
    }

    pub fn instruments(&self) -> usize {
        self.instruments.len()
    }

    pub fn messages(&self) -> usize {
        self.messages.len()
    }

    /// The widest track count over all blocks; the `tracks` vector is kept
    /// this long.
    pub fn max_tracks(&self) -> usize {
        self.tracks.len()
    }

    // --- Element access ---

    pub fn block(&self, number: usize) -> Option<&Block> {
        self.blocks.get(number)
    }

    pub fn block_mut(&mut self, number: usize) -> Option<&mut Block> {
        self.blocks.get_mut(number)
    }

    /// Playing sequence at `number`, clamped to the last one.
    pub fn playseq(&self, number: usize) -> &Playseq {
        let last = self.playseqs.len().saturating_sub(1);
        &self.playseqs[number.min(last)]
    }

    pub fn playseq_mut(&mut self, number: usize) -> &mut Playseq {
        let last = self.playseqs.len().saturating_sub(1);
        &mut self.playseqs[number.min(last)]
    }

    /// Playseq index stored in the section at `position`, clamped to the
    /// last section.
    pub fn section(&self, position: usize) -> usize {
        let last = self.sections.len().saturating_sub(1);
        self.sections[position.min(last)]
    }

    /// Point the section at `position` to a playing sequence.
    pub fn set_section(&mut self, position: usize, playseq: usize) {
        if let Some(section) = self.sections.get_mut(position) {
            *section = playseq;
        }
    }

    pub fn instrument(&self, number: usize) -> Option<&Instrument> {
        self.instruments.get(number)
    }

    pub fn instrument_mut(&mut self, number: usize) -> Option<&mut Instrument> {
        self.instruments.get_mut(number)
    }

    /// Track at `number`, clamped to the last one.
    pub fn track(&self, number: usize) -> &Track {
        let last = self.tracks.len().saturating_sub(1);
        &self.tracks[number.min(last)]
    }

    pub fn track_mut(&mut self, number: usize) -> &mut Track {
        let last = self.tracks.len().saturating_sub(1);
        &mut self.tracks[number.min(last)]
    }

    pub fn message(&self, number: usize) -> Option<&Message> {
        self.messages.get(number)
    }

    pub fn message_mut(&mut self, number: usize) -> Option<&mut Message> {
        self.messages.get_mut(number)
    }

    // --- Construction ---

    /// Add a block and return its index.
    pub fn add_block(&mut self, block: Block) -> usize {
        self.blocks.push(block);
        self.blocks.len() - 1
    }

    /// Add a playing sequence and return its index.
    pub fn add_playseq(&mut self, playseq: Playseq) -> usize {
        self.playseqs.push(playseq);
        self.playseqs.len() - 1
    }

    /// Append a section pointing at the given playseq.
    pub fn add_section(&mut self, playseq: usize) {
        self.sections.push(playseq);
    }

    /// Add an instrument and return its index.
    pub fn add_instrument(&mut self, instrument: Instrument) -> usize {
        self.instruments.push(instrument);
        self.instruments.len() - 1
    }

    /// Add a message and return its index.
    pub fn add_message(&mut self, message: Message) -> usize {
        self.messages.push(message);
        self.messages.len() - 1
    }

    /// Grow or shrink the track array to match the widest block.
    pub fn check_max_tracks(&mut self) {
        let max = self
            .blocks
            .iter()
            .map(Block::tracks)
            .max()
            .unwrap_or(1)
            .max(1);
        self.tracks.resize_with(max, Track::new);
    }
}

impl Default for Song {
    fn default() -> Self {
        Self::new()
    }
}

/// The advisory score lock. The engine holds the guard over a whole tick;
/// anything mutating blocks, playseqs, instruments, tempo or TPL must hold
/// it while doing so.
#[derive(Debug)]
pub struct SongLock {
    inner: Mutex<Song>,
}

impl SongLock {
    pub fn new(song: Song) -> Self {
        Self {
            inner: Mutex::new(song),
        }
    }

    /// Lock the song. A poisoned lock is recovered rather than propagated;
    /// the engine must always reach its shutdown path.
    pub fn lock(&self) -> MutexGuard<'_, Song> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
