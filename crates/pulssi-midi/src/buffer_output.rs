//! Buffering sink that serialises events as delta-timed bytes for SMF export.

use std::sync::Mutex;

use crate::traits::MidiOutput;

/// Serialises every event as `<varlen-delta><event-bytes>` where the delta is
/// the difference between the current and previous engine tick. SysEx
/// payloads get a variable-length payload length spliced in after the `0xF0`,
/// and tempo changes become `FF 51 03` meta events, so the accumulated bytes
/// are a Standard MIDI File track body.
#[derive(Debug, Default)]
pub struct BufferOutput {
    inner: Mutex<BufferInner>,
}

#[derive(Debug, Default)]
struct BufferInner {
    data: Vec<u8>,
    tick: u64,
    old_tick: u64,
}

impl BufferOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// The serialised track body so far.
    pub fn data(&self) -> Vec<u8> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).data.clone()
    }

    fn emit(&self, event: &[u8]) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let delta = inner.tick.saturating_sub(inner.old_tick);
        inner.old_tick = inner.tick;
        write_varlen(&mut inner.data, delta);
        inner.data.extend_from_slice(event);
    }
}

impl MidiOutput for BufferOutput {
    fn name(&self) -> &str {
        "Buffer"
    }

    fn is_enabled(&self) -> bool {
        true
    }

    fn set_tick(&self, tick: u64) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).tick = tick;
    }

    fn tempo(&self, tempo: u32) {
        let us = 60_000_000 / tempo.max(1);
        self.write_raw(&[
            0xff,
            0x51,
            0x03,
            (us >> 16) as u8,
            (us >> 8) as u8,
            us as u8,
        ]);
    }

    fn write_raw(&self, data: &[u8]) {
        if data.first() == Some(&0xf0) {
            // SysEx needs its payload length spliced in when written to a file
            let mut message = Vec::with_capacity(data.len() + 4);
            message.push(0xf0);
            write_varlen(&mut message, (data.len() - 1) as u64);
            message.extend_from_slice(&data[1..]);
            self.emit(&message);
        } else {
            self.emit(data);
        }
    }
}

/// Append a MIDI variable-length quantity: 7 bits per byte, high bit set on
/// all but the last byte.
pub fn write_varlen(out: &mut Vec<u8>, mut value: u64) {
    let mut stack = [0u8; 10];
    let mut count = 0;
    stack[0] = (value & 0x7f) as u8;
    count += 1;
    value >>= 7;
    while value != 0 {
        stack[count] = (value & 0x7f) as u8 | 0x80;
        count += 1;
        value >>= 7;
    }
    while count > 0 {
        count -= 1;
        out.push(stack[count]);
    }
}

/// Read a variable-length quantity, returning (value, bytes consumed).
pub fn read_varlen(data: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, &byte) in data.iter().enumerate() {
        value = (value << 7) | (byte & 0x7f) as u64;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}
