//! Instruments: the binding between notes in a score and a MIDI destination.

use arrayvec::ArrayString;

use crate::block::Block;

/// A MIDI instrument. `midi_interface` is the resolved output index (-1 when
/// the saved interface name matches no current output); the name string is
/// what persists and gets re-resolved when the output set changes.
#[derive(Clone, Debug)]
pub struct Instrument {
    name: ArrayString<32>,
    midi_interface: i32,
    midi_interface_name: String,
    midi_preset: u16,
    midi_channel: u8,
    default_velocity: u8,
    transpose: i8,
    hold: u8,
    arpeggio: Option<Block>,
    arpeggio_base_note: u8,
}

impl Instrument {
    pub fn new(name: &str) -> Self {
        let mut instrument_name = ArrayString::new();
        let _ = instrument_name.try_push_str(name);
        Self {
            name: instrument_name,
            midi_interface: 0,
            midi_interface_name: String::from("No output"),
            midi_preset: 0,
            midi_channel: 0,
            default_velocity: 127,
            transpose: 0,
            hold: 0,
            arpeggio: None,
            arpeggio_base_note: 49,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name.clear();
        let _ = self.name.try_push_str(name);
    }

    /// Resolved output index, or -1 when unresolved.
    pub fn midi_interface(&self) -> i32 {
        self.midi_interface
    }

    pub fn set_midi_interface(&mut self, interface: i32) {
        self.midi_interface = interface;
    }

    pub fn midi_interface_name(&self) -> &str {
        &self.midi_interface_name
    }

    pub fn set_midi_interface_name(&mut self, name: &str) {
        self.midi_interface_name = name.to_string();
    }

    pub fn midi_preset(&self) -> u16 {
        self.midi_preset
    }

    pub fn set_midi_preset(&mut self, preset: u16) {
        self.midi_preset = preset;
    }

    /// MIDI channel, 0..15.
    pub fn midi_channel(&self) -> u8 {
        self.midi_channel
    }

    pub fn set_midi_channel(&mut self, channel: u8) {
        self.midi_channel = channel & 0x0f;
    }

    /// Velocity used for notes without an explicit velocity command, 0..127.
    pub fn default_velocity(&self) -> u8 {
        self.default_velocity
    }

    pub fn set_default_velocity(&mut self, velocity: u8) {
        self.default_velocity = velocity.min(127);
    }

    /// Semitone offset added to every note played with this instrument.
    pub fn transpose(&self) -> i8 {
        self.transpose
    }

    pub fn set_transpose(&mut self, transpose: i8) {
        self.transpose = transpose;
    }

    /// Ticks a note is held before the automatic note-off; 0 = hold forever.
    pub fn hold(&self) -> u8 {
        self.hold
    }

    pub fn set_hold(&mut self, hold: u8) {
        self.hold = hold;
    }

    /// Optional one-track arpeggio block added on top of sounding notes.
    pub fn arpeggio(&self) -> Option<&Block> {
        self.arpeggio.as_ref()
    }

    pub fn set_arpeggio(&mut self, arpeggio: Option<Block>) {
        self.arpeggio = arpeggio;
    }

    /// The arpeggio note that maps to "no offset".
    pub fn arpeggio_base_note(&self) -> u8 {
        self.arpeggio_base_note
    }

    pub fn set_arpeggio_base_note(&mut self, note: u8) {
        self.arpeggio_base_note = note;
    }
}
