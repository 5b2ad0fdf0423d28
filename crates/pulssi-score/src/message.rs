//! Raw MIDI messages stored with a song, typically SysEx dumps.

use arrayvec::ArrayString;

/// A raw byte string the engine can send with the send-message command,
/// optionally auto-sent when a song is installed.
#[derive(Clone, Debug, Default)]
pub struct Message {
    name: ArrayString<32>,
    auto_send: bool,
    data: Vec<u8>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name.clear();
        let _ = self.name.try_push_str(name);
    }

    /// Whether the message is written to every output when a song is installed.
    pub fn is_auto_send(&self) -> bool {
        self.auto_send
    }

    pub fn set_auto_send(&mut self, auto_send: bool) {
        self.auto_send = auto_send;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn set_data(&mut self, data: Vec<u8>) {
        self.data = data;
    }
}
