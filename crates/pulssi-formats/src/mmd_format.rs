//! Legacy OctaMED module import (`MMD0`, `MMD1`, `MMD2`).
//!
//! Conversion populates the in-memory song structure: blocks with their note
//! and command cells, playing sequences and sections, sample-derived
//! instruments (MIDI channel, preset, volume, transpose, and hold from the
//! instrument extension records) and timing. Sample waveform data is not
//! loaded; playback here is MIDI only. Fields with no counterpart are
//! dropped with a best-effort mapping of the command set.

use log::warn;

use pulssi_score::{Block, Instrument, Playseq, Song};

use pulssi_engine::commands;

use crate::FormatError;

/// Whether the bytes look like an OctaMED module.
pub fn is_mmd(data: &[u8]) -> bool {
    data.len() >= 4 && &data[0..3] == b"MMD" && matches!(data[3], b'0' | b'1' | b'2')
}

fn byte(data: &[u8], offset: usize) -> Result<u8, FormatError> {
    data.get(offset).copied().ok_or(FormatError::UnexpectedEof)
}

fn be_u16(data: &[u8], offset: usize) -> Result<u16, FormatError> {
    data.get(offset..offset + 2)
        .map(|bytes| u16::from_be_bytes([bytes[0], bytes[1]]))
        .ok_or(FormatError::UnexpectedEof)
}

fn be_u32(data: &[u8], offset: usize) -> Result<u32, FormatError> {
    data.get(offset..offset + 4)
        .map(|bytes| u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        .ok_or(FormatError::UnexpectedEof)
}

fn c_string(data: &[u8], offset: usize, max_len: usize) -> String {
    let slice = data
        .get(offset..data.len().min(offset + max_len))
        .unwrap_or(&[]);
    let end = slice.iter().position(|&b| b == 0).unwrap_or(slice.len());
    String::from_utf8_lossy(&slice[..end]).trim().to_string()
}

/// Convert an OctaMED module into a song.
pub fn load_mmd(data: &[u8]) -> Result<Song, FormatError> {
    if !is_mmd(data) {
        return Err(FormatError::InvalidHeader);
    }
    let version = data[3];

    let song_offset = be_u32(data, 8)? as usize;
    let block_array_offset = be_u32(data, 16)? as usize;
    let expansion_offset = be_u32(data, 32)? as usize;

    let mut song = Song::empty();

    // Song-wide settings live in a fixed-layout struct after the 63 sample
    // info records (8 bytes each)
    let default_tempo = be_u16(data, song_offset + 764)?;
    let play_transpose = byte(data, song_offset + 766)? as i8;
    let flags2 = byte(data, song_offset + 768)?;
    let secondary_tempo = byte(data, song_offset + 769)?;
    let master_volume = byte(data, song_offset + 786)?;
    let num_samples = byte(data, song_offset + 787)?.min(63) as usize;

    let tempo = if flags2 & 0x20 != 0 {
        // Tempo is real beats per minute
        default_tempo as u32
    } else {
        // Old-style tempo: 33 corresponds to 125 BPM
        (default_tempo as u32 * 125 / 33).max(1)
    };
    song.set_tempo(tempo.clamp(1, 999));
    song.set_ticks_per_line((secondary_tempo as u32).max(1));
    song.set_master_volume(((master_volume as u32 & 0x7f) * 2).min(127) as u8);

    // Sample info records become instruments
    for number in 0..num_samples {
        let base = song_offset + number * 8;
        let midi_channel = byte(data, base + 4)?;
        let midi_preset = byte(data, base + 5)?;
        let volume = byte(data, base + 6)?;
        let transpose = byte(data, base + 7)? as i8;

        let mut instrument = Instrument::new(&format!("Sample {}", number + 1));
        if midi_channel > 0 {
            instrument.set_midi_channel(midi_channel - 1);
        }
        instrument.set_midi_preset(midi_preset as u16);
        instrument.set_default_velocity(((volume as u32 & 0x7f) * 2).min(127) as u8);
        instrument.set_transpose(transpose.saturating_add(play_transpose));
        song.add_instrument(instrument);
    }

    // Blocks
    let num_blocks = be_u16(data, song_offset + 504)? as usize;
    for number in 0..num_blocks {
        let offset = be_u32(data, block_array_offset + number * 4)? as usize;
        let block = if version == b'0' {
            parse_mmd0_block(data, offset)?
        } else {
            parse_mmd1_block(data, offset)?
        };
        song.add_block(block);
    }

    // Sequencing
    if version == b'2' {
        parse_mmd2_sequences(data, song_offset, &mut song)?;
    } else {
        let song_length = be_u16(data, song_offset + 506)? as usize;
        let mut playseq = Playseq::new();
        playseq.clear();
        for position in 0..song_length.min(256) {
            playseq.push(byte(data, song_offset + 508 + position)? as usize);
        }
        if playseq.length() == 0 {
            playseq.push(0);
        }
        song.add_playseq(playseq);
        song.add_section(0);
    }

    // Instrument extensions (hold lives there) and the song name
    if expansion_offset != 0 {
        apply_expansion_data(data, expansion_offset, &mut song);
    }

    song.normalize();

    // Track volumes: 16 bytes for MMD0/1, a pointed-to array for MMD2
    if version == b'2' {
        let volumes_offset = be_u32(data, song_offset + 516)? as usize;
        let num_tracks = be_u16(data, song_offset + 520)? as usize;
        if volumes_offset != 0 {
            for track in 0..num_tracks.min(song.max_tracks()) {
                let volume = byte(data, volumes_offset + track)?;
                song.track_mut(track)
                    .set_volume(((volume as u32 & 0x7f) * 2).min(127) as u8);
            }
        }
    } else {
        for track in 0..song.max_tracks().min(16) {
            let volume = byte(data, song_offset + 770 + track)?;
            song.track_mut(track)
                .set_volume(((volume as u32 & 0x7f) * 2).min(127) as u8);
        }
    }

    Ok(song)
}

/// MMD0 block: track and line counts as bytes, then 3 bytes per cell with
/// the instrument number split across both header bytes.
fn parse_mmd0_block(data: &[u8], offset: usize) -> Result<Block, FormatError> {
    let tracks = byte(data, offset)? as usize;
    let lines = byte(data, offset + 1)? as usize + 1;
    let mut block = Block::new(tracks.max(1), lines, 1);

    let mut position = offset + 2;
    for line in 0..lines {
        for track in 0..tracks {
            let b0 = byte(data, position)?;
            let b1 = byte(data, position + 1)?;
            let b2 = byte(data, position + 2)?;
            position += 3;

            let note = b0 & 0x3f;
            let instrument = ((b0 & 0xc0) >> 2) | (b1 >> 4);
            let (command, value) = convert_command(b1 & 0x0f, b2);
            block.set_note(line, track, note, instrument);
            block.set_command(line, track, 0, command, value);
        }
    }
    Ok(block)
}

/// MMD1/MMD2 block: word-sized counts, a block info pointer, then 4 bytes
/// per cell.
fn parse_mmd1_block(data: &[u8], offset: usize) -> Result<Block, FormatError> {
    let tracks = be_u16(data, offset)? as usize;
    let lines = be_u16(data, offset + 2)? as usize + 1;
    let mut block = Block::new(tracks.max(1), lines, 1);

    let mut position = offset + 8;
    for line in 0..lines {
        for track in 0..tracks {
            let b0 = byte(data, position)?;
            let b1 = byte(data, position + 1)?;
            let b2 = byte(data, position + 2)?;
            let b3 = byte(data, position + 3)?;
            position += 4;

            let note = b0 & 0x7f;
            let instrument = b1 & 0x3f;
            let (command, value) = convert_command(b2, b3);
            block.set_note(line, track, note, instrument);
            block.set_command(line, track, 0, command, value);
        }
    }
    Ok(block)
}

/// MMD2 keeps sections and named playing sequences in pointed-to tables.
fn parse_mmd2_sequences(
    data: &[u8],
    song_offset: usize,
    song: &mut Song,
) -> Result<(), FormatError> {
    let num_sections = be_u16(data, song_offset + 506)? as usize;
    let playseq_table = be_u32(data, song_offset + 508)? as usize;
    let section_table = be_u32(data, song_offset + 512)? as usize;
    let num_playseqs = be_u16(data, song_offset + 522)? as usize;

    for section in 0..num_sections {
        let playseq_index = be_u16(data, section_table + section * 2)? as usize;
        song.add_section(playseq_index);
    }

    for number in 0..num_playseqs {
        let offset = be_u32(data, playseq_table + number * 4)? as usize;
        // 32-byte name, two reserved longwords, entry count, then entries
        let length = be_u16(data, offset + 40)? as usize;
        let mut playseq = Playseq::new();
        playseq.clear();
        playseq.set_name(&c_string(data, offset, 32));
        for position in 0..length {
            let entry = be_u16(data, offset + 42 + position * 2)?;
            // Values with the high bit set are markers, not block numbers
            if entry < 0x8000 {
                playseq.push(entry as usize);
            }
        }
        if playseq.length() == 0 {
            playseq.push(0);
        }
        song.add_playseq(playseq);
    }
    Ok(())
}

/// Pull hold values and the song name out of the expansion data. Anything
/// unreadable here is ignored; the module still plays without it.
fn apply_expansion_data(data: &[u8], offset: usize, song: &mut Song) {
    let extensions = (|| -> Result<(usize, usize, usize), FormatError> {
        let entries_offset = be_u32(data, offset + 4)? as usize;
        let entry_count = be_u16(data, offset + 8)? as usize;
        let entry_size = be_u16(data, offset + 10)? as usize;
        Ok((entries_offset, entry_count, entry_size))
    })();

    match extensions {
        Ok((entries_offset, entry_count, entry_size)) if entries_offset != 0 && entry_size > 0 => {
            for number in 0..entry_count.min(song.instruments()) {
                let base = entries_offset + number * entry_size;
                if let Ok(hold) = byte(data, base) {
                    if let Some(instrument) = song.instrument_mut(number) {
                        instrument.set_hold(hold);
                    }
                }
            }
        }
        Ok(_) => {}
        Err(_) => warn!("Truncated expansion data, instrument holds not loaded"),
    }

    if let (Ok(name_offset), Ok(name_len)) = (be_u32(data, offset + 44), be_u32(data, offset + 48))
    {
        if name_offset != 0 && name_len > 0 {
            let name = c_string(data, name_offset as usize, name_len as usize);
            if !name.is_empty() {
                song.set_name(&name);
            }
        }
    }
}

/// Map the legacy command set onto the engine's commands. Unknown commands
/// are dropped.
fn convert_command(command: u8, value: u8) -> (u8, u8) {
    match command {
        0x09 => (commands::TICKS_PER_LINE, value),
        0x0b => (commands::PLAYSEQ_POSITION, value),
        // Volume commands use the 0..64 scale
        0x0c => (commands::VELOCITY, ((value as u32 & 0x7f) * 2).min(127) as u8),
        0x0f => (commands::TEMPO, value),
        _ => (0, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_u16(data: &mut [u8], offset: usize, value: u16) {
        data[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    }

    fn put_u32(data: &mut [u8], offset: usize, value: u32) {
        data[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }

    /// A minimal MMD0 module: one sample on MIDI channel 1, one single-line
    /// one-track block playing it, one playseq entry.
    fn build_mmd0() -> Vec<u8> {
        let header_len = 52;
        let song_len = 788;
        let song_offset = header_len;
        let block_array_offset = song_offset + song_len;
        let block_offset = block_array_offset + 4;

        let mut data = vec![0u8; block_offset + 2 + 3];
        data[0..4].copy_from_slice(b"MMD0");
        put_u32(&mut data, 8, song_offset as u32);
        put_u32(&mut data, 16, block_array_offset as u32);

        // Sample 0: rep/replen 0, midich 1, preset 5, svol 50, strans 0
        data[song_offset + 4] = 1;
        data[song_offset + 5] = 5;
        data[song_offset + 6] = 50;

        put_u16(&mut data, song_offset + 504, 1); // numblocks
        put_u16(&mut data, song_offset + 506, 1); // songlen
        data[song_offset + 508] = 0; // playseq[0]
        put_u16(&mut data, song_offset + 764, 120); // deftempo
        data[song_offset + 768] = 0x20; // flags2: tempo is BPM
        data[song_offset + 769] = 6; // secondary tempo = ticks per line
        data[song_offset + 770] = 64; // track 0 volume
        data[song_offset + 786] = 64; // master volume
        data[song_offset + 787] = 1; // numsamples

        put_u32(&mut data, block_array_offset, block_offset as u32);

        // Block: 1 track, 1 line (stored as lines - 1)
        data[block_offset] = 1;
        data[block_offset + 1] = 0;
        // Cell: note 49, instrument 1, no command
        data[block_offset + 2] = 49;
        data[block_offset + 3] = 0x10;
        data[block_offset + 4] = 0;

        data
    }

    #[test]
    fn magic_detection() {
        assert!(is_mmd(b"MMD0xxxx"));
        assert!(is_mmd(b"MMD1xxxx"));
        assert!(is_mmd(b"MMD2xxxx"));
        assert!(!is_mmd(b"MMD3xxxx"));
        assert!(!is_mmd(b"RIFFxxxx"));
        assert!(!is_mmd(b"MM"));
    }

    #[test]
    fn mmd0_module_converts_to_a_song() {
        let song = load_mmd(&build_mmd0()).unwrap();

        assert_eq!(song.tempo(), 120);
        assert_eq!(song.ticks_per_line(), 6);
        assert_eq!(song.master_volume(), 127);

        assert_eq!(song.instruments(), 1);
        let instrument = song.instrument(0).unwrap();
        assert_eq!(instrument.midi_channel(), 0);
        assert_eq!(instrument.midi_preset(), 5);
        assert_eq!(instrument.default_velocity(), 100);

        assert_eq!(song.blocks(), 1);
        let block = song.block(0).unwrap();
        assert_eq!(block.tracks(), 1);
        assert_eq!(block.length(), 1);
        assert_eq!(block.note(0, 0), 49);
        assert_eq!(block.instrument(0, 0), 1);

        assert_eq!(song.playseqs(), 1);
        assert_eq!(song.playseq(0).length(), 1);
        assert_eq!(song.playseq(0).at(0), 0);
        assert_eq!(song.sections(), 1);

        assert_eq!(song.track(0).volume(), 127);
    }

    #[test]
    fn mmd1_block_uses_word_counts_and_four_byte_cells() {
        let mut data = build_mmd0();
        data[3] = b'1';

        // Rebuild the block in MMD1 layout at the same offset
        let block_offset = 52 + 788 + 4;
        data.truncate(block_offset);
        data.extend_from_slice(&1u16.to_be_bytes()); // tracks
        data.extend_from_slice(&1u16.to_be_bytes()); // lines - 1 = 1 → 2 lines
        data.extend_from_slice(&0u32.to_be_bytes()); // block info
        data.extend_from_slice(&[61, 2, 0x0f, 0x8c]); // note 61, instr 2, tempo 140
        data.extend_from_slice(&[0, 0, 0, 0]);

        let song = load_mmd(&data).unwrap();
        let block = song.block(0).unwrap();
        assert_eq!(block.tracks(), 1);
        assert_eq!(block.length(), 2);
        assert_eq!(block.note(0, 0), 61);
        assert_eq!(block.instrument(0, 0), 2);
        assert_eq!(block.command(0, 0, 0), 0x0d);
        assert_eq!(block.command_value(0, 0, 0), 0x8c);
    }

    #[test]
    fn mmd0_command_mapping_converts_volume_scale() {
        let mut data = build_mmd0();
        let block_offset = 52 + 788 + 4;
        // Command 0x0c (volume) value 32 → velocity command at 64
        data[block_offset + 3] = 0x10 | 0x0c;
        data[block_offset + 4] = 32;

        let song = load_mmd(&data).unwrap();
        let block = song.block(0).unwrap();
        assert_eq!(block.command(0, 0, 0), 0x0a);
        assert_eq!(block.command_value(0, 0, 0), 64);
    }

    #[test]
    fn mmd2_sections_and_playseq_tables() {
        let mut data = build_mmd0();
        data[3] = b'2';
        let song_offset = 52;

        // MMD2 blocks use the MMD1 cell layout, so rebuild the block
        let block_offset = 52 + 788 + 4;
        data.truncate(block_offset);
        data.extend_from_slice(&1u16.to_be_bytes()); // tracks
        data.extend_from_slice(&0u16.to_be_bytes()); // lines - 1
        data.extend_from_slice(&0u32.to_be_bytes()); // block info
        data.extend_from_slice(&[49, 1, 0, 0]);

        // Two sections pointing at playseq 0, one named playseq of two
        // positions, appended at the end of the module
        let section_table = data.len();
        data.extend_from_slice(&0u16.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());

        let playseq_offset = data.len();
        let mut playseq_bytes = vec![0u8; 42];
        playseq_bytes[0..4].copy_from_slice(b"main");
        playseq_bytes[40..42].copy_from_slice(&2u16.to_be_bytes());
        data.extend_from_slice(&playseq_bytes);
        data.extend_from_slice(&0u16.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());

        let playseq_table = data.len();
        data.extend_from_slice(&(playseq_offset as u32).to_be_bytes());

        put_u16(&mut data, song_offset + 506, 2); // numsections
        put_u32(&mut data, song_offset + 508, playseq_table as u32);
        put_u32(&mut data, song_offset + 512, section_table as u32);
        put_u32(&mut data, song_offset + 516, 0); // no trackvols array
        put_u16(&mut data, song_offset + 522, 1); // numpseqs

        let song = load_mmd(&data).unwrap();
        assert_eq!(song.sections(), 2);
        assert_eq!(song.section(0), 0);
        assert_eq!(song.section(1), 0);
        assert_eq!(song.playseqs(), 1);
        assert_eq!(song.playseq(0).name(), "main");
        assert_eq!(song.playseq(0).length(), 2);
        assert_eq!(song.block(0).unwrap().note(0, 0), 49);
        assert_eq!(song.block(0).unwrap().instrument(0, 0), 1);
    }

    #[test]
    fn truncated_module_is_an_error() {
        let mut data = build_mmd0();
        data.truncate(60);
        assert!(load_mmd(&data).is_err());
    }
}
