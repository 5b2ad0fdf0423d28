//! Per-track running state of the engine.

/// What the engine remembers about one track while playing. Negative values
/// are "none" sentinels throughout.
#[derive(Clone, Debug)]
pub struct TrackStatus {
    /// Track index this status belongs to
    pub track: usize,
    /// Instrument last played on the track, -1 = none
    pub instrument: i16,
    /// Current line inside the instrument's arpeggio, -1 = halted
    pub arpeggio_line: i32,
    /// Last non-zero command seen, for the previous-command command
    pub previous_command: u8,
    /// Sounding note number, -1 = silent
    pub note: i16,
    /// MIDI channel of the sounding note, -1 = unknown
    pub midi_channel: i16,
    /// MIDI interface of the sounding note, -1 = unknown
    pub midi_interface: i16,
    /// Resolved velocity of the sounding note, -1 = unknown
    pub volume: i16,
    /// Ticks left before the automatic note-off, -1 = not held
    pub hold: i16,
    /// Note the arpeggio offsets apply to
    pub base_note: u8,
}

impl TrackStatus {
    pub fn new(track: usize) -> Self {
        let mut status = Self {
            track,
            instrument: -1,
            arpeggio_line: -1,
            previous_command: 0,
            note: -1,
            midi_channel: -1,
            midi_interface: -1,
            volume: -1,
            hold: -1,
            base_note: 0,
        };
        status.reset();
        status
    }

    /// Forget everything about the track. Applied on soft stop, muting and
    /// recreation.
    pub fn reset(&mut self) {
        self.instrument = -1;
        self.arpeggio_line = -1;
        self.previous_command = 0;
        self.note = -1;
        self.midi_channel = -1;
        self.midi_interface = -1;
        self.volume = -1;
        self.hold = -1;
    }
}
