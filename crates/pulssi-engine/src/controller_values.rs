//! Last-known controller values, the origins for sub-line interpolation.

/// Cache slot for the pitch wheel, after the 128 controller slots.
pub const SLOT_PITCH_WHEEL: usize = 128;
/// Cache slot for polyphonic aftertouch.
pub const SLOT_AFTERTOUCH: usize = 129;
/// Cache slot for channel pressure.
pub const SLOT_CHANNEL_PRESSURE: usize = 130;
/// Slots per channel: one per controller number plus the three above.
pub const SLOTS: usize = 131;

const CHANNELS: usize = 16;

/// Per-(interface, channel, slot) last written value. Rows appear and
/// disappear with output interfaces; unknown cells read as zero.
#[derive(Clone, Debug, Default)]
pub struct ControllerValues {
    rows: Vec<Vec<u8>>,
}

impl ControllerValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match the row count to the number of output interfaces. New rows
    /// start zeroed; removed rows are dropped.
    pub fn resize(&mut self, interfaces: usize) {
        self.rows.resize_with(interfaces, || vec![0; CHANNELS * SLOTS]);
    }

    /// Last value written for (interface, channel, slot); 0 if never written
    /// or out of range.
    pub fn get(&self, interface: usize, channel: usize, slot: usize) -> u8 {
        if channel >= CHANNELS || slot >= SLOTS {
            return 0;
        }
        self.rows
            .get(interface)
            .map_or(0, |row| row[channel * SLOTS + slot])
    }

    /// Record a value for (interface, channel, slot). Out-of-range writes
    /// are dropped.
    pub fn set(&mut self, interface: usize, channel: usize, slot: usize, value: u8) {
        if channel >= CHANNELS || slot >= SLOTS {
            return;
        }
        if let Some(row) = self.rows.get_mut(interface) {
            row[channel * SLOTS + slot] = value;
        }
    }
}
