//! Block and cell types for tracker scores.

use arrayvec::ArrayString;

/// A note cell: what sounds at a given (line, track).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NoteCell {
    /// Note number (0 = empty, 1..128 = note - 1 on the wire)
    pub note: u8,
    /// Instrument number (0 = none, 1-based otherwise)
    pub instrument: u8,
}

/// A command cell on one command page.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommandCell {
    /// Command byte (0 = empty)
    pub command: u8,
    /// Command argument
    pub value: u8,
}

/// A 2-D grid of note cells (`length` lines × `tracks` columns) plus
/// `command_pages` parallel layers of command cells.
#[derive(Clone, Debug)]
pub struct Block {
    name: ArrayString<32>,
    tracks: usize,
    length: usize,
    command_pages: usize,
    /// Note cells, row-major: notes[line * tracks + track]
    notes: Vec<NoteCell>,
    /// Command cells: commands[(page * length + line) * tracks + track]
    commands: Vec<CommandCell>,
}

impl Block {
    /// Create an empty block with the given dimensions.
    ///
    /// Every dimension is forced to at least 1; a zero-line block cannot
    /// be played or even addressed.
    pub fn new(tracks: usize, length: usize, command_pages: usize) -> Self {
        let tracks = tracks.max(1);
        let length = length.max(1);
        let command_pages = command_pages.max(1);
        Self {
            name: ArrayString::new(),
            tracks,
            length,
            command_pages,
            notes: vec![NoteCell::default(); tracks * length],
            commands: vec![CommandCell::default(); tracks * length * command_pages],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name.clear();
        let _ = self.name.try_push_str(name);
    }

    /// Number of lines.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Number of tracks (columns).
    pub fn tracks(&self) -> usize {
        self.tracks
    }

    /// Number of parallel command pages.
    pub fn command_pages(&self) -> usize {
        self.command_pages
    }

    fn note_index(&self, line: usize, track: usize) -> Option<usize> {
        (line < self.length && track < self.tracks).then(|| line * self.tracks + track)
    }

    fn command_index(&self, line: usize, track: usize, page: usize) -> Option<usize> {
        (line < self.length && track < self.tracks && page < self.command_pages)
            .then(|| (page * self.length + line) * self.tracks + track)
    }

    /// Note at (line, track); 0 for empty or out-of-range cells.
    pub fn note(&self, line: usize, track: usize) -> u8 {
        self.note_index(line, track).map_or(0, |i| self.notes[i].note)
    }

    /// Instrument at (line, track); 0 for empty or out-of-range cells.
    pub fn instrument(&self, line: usize, track: usize) -> u8 {
        self.note_index(line, track).map_or(0, |i| self.notes[i].instrument)
    }

    /// Command byte at (line, track, page); 0 for empty or out-of-range cells.
    pub fn command(&self, line: usize, track: usize, page: usize) -> u8 {
        self.command_index(line, track, page).map_or(0, |i| self.commands[i].command)
    }

    /// Command argument at (line, track, page); 0 for empty or out-of-range cells.
    pub fn command_value(&self, line: usize, track: usize, page: usize) -> u8 {
        self.command_index(line, track, page).map_or(0, |i| self.commands[i].value)
    }

    /// Set the note cell at (line, track). Out-of-range writes are dropped.
    pub fn set_note(&mut self, line: usize, track: usize, note: u8, instrument: u8) {
        if let Some(i) = self.note_index(line, track) {
            self.notes[i] = NoteCell { note, instrument };
        }
    }

    /// Set the command cell at (line, track, page). Out-of-range writes are dropped.
    pub fn set_command(&mut self, line: usize, track: usize, page: usize, command: u8, value: u8) {
        if let Some(i) = self.command_index(line, track, page) {
            self.commands[i] = CommandCell { command, value };
        }
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::new(4, 64, 1)
    }
}
