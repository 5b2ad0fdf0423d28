//! MIDI output trait and error types.

/// Error type for MIDI backend operations.
#[derive(Debug)]
pub enum MidiError {
    /// Failed to initialize the MIDI client
    ClientInit(String),
    /// Failed to connect to an output port
    Connect(String),
    /// No port matched the requested name
    NoPort(String),
}

impl std::fmt::Display for MidiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MidiError::ClientInit(msg) => write!(f, "MIDI client init error: {}", msg),
            MidiError::Connect(msg) => write!(f, "MIDI connect error: {}", msg),
            MidiError::NoPort(name) => write!(f, "No MIDI output port named '{}'", name),
        }
    }
}

impl std::error::Error for MidiError {}

/// A MIDI event sink.
///
/// The channel-voice and realtime methods have default implementations that
/// build the wire bytes and hand them to `write_raw`, so a backend only has
/// to move bytes. Sinks are fire-and-forget: implementations log failures
/// and swallow them.
pub trait MidiOutput: Send + Sync {
    /// Human-readable sink name, used to resolve instrument bindings.
    fn name(&self) -> &str;

    /// Whether the sink currently accepts events.
    fn is_enabled(&self) -> bool;

    /// Write raw bytes to the sink.
    fn write_raw(&self, data: &[u8]);

    /// Inform the sink of the engine's current tick. Only buffering sinks
    /// care; the default discards it.
    fn set_tick(&self, _tick: u64) {}

    /// Inform the sink of a tempo change in beats per minute. Only
    /// buffering sinks serialise this; the default discards it.
    fn tempo(&self, _tempo: u32) {}

    fn note_off(&self, channel: u8, note: u8, velocity: u8) {
        self.write_raw(&[0x80 | (channel & 0x0f), note & 0x7f, velocity & 0x7f]);
    }

    fn note_on(&self, channel: u8, note: u8, velocity: u8) {
        self.write_raw(&[0x90 | (channel & 0x0f), note & 0x7f, velocity & 0x7f]);
    }

    /// Polyphonic aftertouch for a single note.
    fn aftertouch(&self, channel: u8, note: u8, value: u8) {
        self.write_raw(&[0xa0 | (channel & 0x0f), note & 0x7f, value & 0x7f]);
    }

    fn controller(&self, channel: u8, number: u8, value: u8) {
        self.write_raw(&[0xb0 | (channel & 0x0f), number & 0x7f, value & 0x7f]);
    }

    fn program_change(&self, channel: u8, program: u8) {
        self.write_raw(&[0xc0 | (channel & 0x0f), program & 0x7f]);
    }

    fn channel_pressure(&self, channel: u8, value: u8) {
        self.write_raw(&[0xd0 | (channel & 0x0f), value & 0x7f]);
    }

    /// Pitch wheel with a coarse 0..127 value, 64 = centre. The fine byte
    /// goes out as zero.
    fn pitch_wheel(&self, channel: u8, value: u8) {
        self.write_raw(&[0xe0 | (channel & 0x0f), 0, value & 0x7f]);
    }

    /// MIDI realtime clock pulse.
    fn clock(&self) {
        self.write_raw(&[0xf8]);
    }

    /// MIDI realtime start.
    fn start(&self) {
        self.write_raw(&[0xfa]);
    }

    /// MIDI realtime continue.
    fn cont(&self) {
        self.write_raw(&[0xfb]);
    }

    /// MIDI realtime stop.
    fn stop(&self) {
        self.write_raw(&[0xfc]);
    }
}

/// A sink that discards everything. Always present at output index 0 so
/// unresolved instrument bindings have somewhere harmless to go.
#[derive(Debug, Default)]
pub struct NullOutput;

impl NullOutput {
    pub fn new() -> Self {
        Self
    }
}

impl MidiOutput for NullOutput {
    fn name(&self) -> &str {
        "No output"
    }

    fn is_enabled(&self) -> bool {
        true
    }

    fn write_raw(&self, _data: &[u8]) {}
}
