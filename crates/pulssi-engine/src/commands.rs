//! Command byte table and the note gating rule.
//!
//! Commands are stored in cells as raw bytes; everything from
//! [`MIDI_CONTROLLERS`] up addresses the MIDI controller whose number is
//! `command - MIDI_CONTROLLERS`.

/// Reuse the last non-zero command with this cell's value.
pub const PREVIOUS_COMMAND_VALUE: u8 = 0x01;
pub const PITCH_WHEEL: u8 = 0x02;
pub const PROGRAM_CHANGE: u8 = 0x03;
/// End the current block at the line boundary, continuing at line `value`.
pub const END_BLOCK: u8 = 0x04;
/// Jump to playing sequence position `value` at the line boundary.
pub const PLAYSEQ_POSITION: u8 = 0x05;
/// Send raw message `value` on the first tick of the line.
pub const SEND_MESSAGE: u8 = 0x06;
pub const HOLD: u8 = 0x07;
/// High nibble = delay ticks, low nibble = repeat interval.
pub const RETRIGGER: u8 = 0x08;
pub const DELAY: u8 = 0x09;
/// Velocity for a note cell, polyphonic aftertouch otherwise.
pub const VELOCITY: u8 = 0x0a;
pub const CHANNEL_PRESSURE: u8 = 0x0b;
/// Set ticks per line; value 0 stops playback at the line boundary.
pub const TICKS_PER_LINE: u8 = 0x0c;
/// Set tempo; value 0 stops playback at the line boundary.
pub const TEMPO: u8 = 0x0d;
pub const TRACK_VOLUME: u8 = 0x0e;
pub const INSTRUMENT_VOLUME: u8 = 0x0f;
/// First MIDI controller command; `command - MIDI_CONTROLLERS` is the
/// controller number.
pub const MIDI_CONTROLLERS: u8 = 0x10;

/// Whether a note gated by the given delay/retrigger settings fires on this
/// tick of the line.
pub fn should_play_note(tick: u32, delay: i32, repeat: i32) -> bool {
    let tick = tick as i32;
    (delay >= 0 && tick == delay)
        || (repeat == 0 && tick == 0)
        || (repeat > 0 && tick >= delay && (tick - delay) % repeat == 0)
}
