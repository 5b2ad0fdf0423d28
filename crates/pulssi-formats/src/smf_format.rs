//! Standard MIDI File export.
//!
//! The engine's export run produces a delta-timed track body through the
//! buffer sink; this module adds the outer SMF framing. The division is the
//! song's ticks-per-line, so one line is one quarter note and the tempo
//! meta event the run emits first makes the timing come out right.

use std::sync::Arc;

use pulssi_engine::Player;
use pulssi_midi::{BufferOutput, OutputSet};
use pulssi_score::Song;

/// Render a song into a complete format-0 Standard MIDI File.
pub fn song_to_smf(song: &Song) -> Vec<u8> {
    let buffer = Arc::new(BufferOutput::new());
    let outputs = Arc::new(OutputSet::with_primary(buffer.clone()));
    let division = song.ticks_per_line().min(0x7fff) as u16;

    let mut player = Player::new(song.clone(), outputs);
    player.play_without_scheduling();

    let mut body = buffer.data();
    body.extend_from_slice(&[0x00, 0xff, 0x2f, 0x00]); // end of track

    let mut smf = Vec::with_capacity(body.len() + 22);
    smf.extend_from_slice(b"MThd");
    smf.extend_from_slice(&6u32.to_be_bytes());
    smf.extend_from_slice(&0u16.to_be_bytes()); // format 0
    smf.extend_from_slice(&1u16.to_be_bytes()); // a single track
    smf.extend_from_slice(&division.to_be_bytes());
    smf.extend_from_slice(b"MTrk");
    smf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    smf.extend_from_slice(&body);
    smf
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulssi_score::{Block, Instrument, Playseq};

    fn one_note_song() -> Song {
        let mut song = Song::empty();
        song.set_tempo(120);
        song.set_ticks_per_line(6);

        let mut block = Block::new(1, 1, 1);
        block.set_note(0, 0, 49, 1);
        song.add_block(block);
        song.add_playseq(Playseq::new());
        song.add_section(0);

        let mut instrument = Instrument::new("lead");
        instrument.set_midi_channel(0);
        instrument.set_default_velocity(100);
        instrument.set_hold(1);
        song.add_instrument(instrument);

        song.normalize();
        song
    }

    #[test]
    fn export_frames_the_track_body() {
        let smf = song_to_smf(&one_note_song());

        // Header chunk: format 0, one track, division = 6 ticks per line
        assert_eq!(&smf[0..8], b"MThd\x00\x00\x00\x06");
        assert_eq!(&smf[8..14], &[0x00, 0x00, 0x00, 0x01, 0x00, 0x06]);
        assert_eq!(&smf[14..18], b"MTrk");

        let body_len = u32::from_be_bytes([smf[18], smf[19], smf[20], smf[21]]) as usize;
        let body = &smf[22..];
        assert_eq!(body.len(), body_len);

        assert_eq!(
            body,
            &[
                0x00, 0xff, 0x51, 0x03, 0x07, 0xa1, 0x20, // tempo 500000 us/beat
                0x00, 0x90, 0x30, 0x64, // note on
                0x01, 0x80, 0x30, 0x7f, // note off one tick later
                0x00, 0xff, 0x2f, 0x00, // end of track
            ]
        );
    }

    #[test]
    fn export_terminates_even_with_repeated_positions() {
        let mut song = one_note_song();
        // Two positions of the same block still end after one pass
        song.playseq_mut(0).push(0);
        let smf = song_to_smf(&song);
        // Two note on/off pairs in the body
        let note_ons = smf.windows(3).filter(|w| w[0] == 0x90).count();
        assert_eq!(note_ons, 2);
    }
}
