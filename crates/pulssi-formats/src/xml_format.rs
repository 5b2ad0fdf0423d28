//! The native XML song format.
//!
//! A song document looks like:
//!
//! ```xml
//! <song name="..." tempo="120" ticksperline="6" mastervolume="127" sendsync="0">
//!   <blocks>
//!     <block number="0" name="" commandpages="1" tracks="4" length="64">
//!       <note line="0" track="0" note="49" instrument="1"/>
//!       <command line="0" track="0" page="0" command="13" value="140"/>
//!     </block>
//!   </blocks>
//!   <sections><section number="0">0</section></sections>
//!   <playingsequences>
//!     <playingsequence number="0" name=""><position number="0">0</position></playingsequence>
//!   </playingsequences>
//!   <instruments>
//!     <instrument number="0" name="" midiinterface="..." midipreset="0"
//!                 midichannel="0" defaultvelocity="127" transpose="0" hold="0">
//!       <arpeggio basenote="49"><block .../></arpeggio>
//!     </instrument>
//!   </instruments>
//!   <tracks><track number="0" volume="127" mute="0" solo="0">NAME</track></tracks>
//!   <messages><message number="0" name="" autosend="0">F07E7F0901F7</message></messages>
//! </song>
//! ```
//!
//! Unknown elements are tolerated and skipped with a warning; the legacy
//! `trackvolumes` element is accepted as a synonym for track settings, with
//! the value's high bit meaning mute.

use std::str::FromStr;

use log::warn;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use pulssi_score::{Block, Instrument, Message, Playseq, Song};

use crate::FormatError;

/// Parse a song document. Malformed cells are skipped, best effort.
pub fn load_song(xml: &str) -> Result<Song, FormatError> {
    let mut reader = Reader::from_str(xml);
    let mut song = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                if e.name().as_ref() == b"song" {
                    song = Some(parse_song(&mut reader, &e)?);
                } else {
                    warn!(
                        "XML error: expected song, got {}",
                        String::from_utf8_lossy(e.name().as_ref())
                    );
                    reader.read_to_end(e.name())?;
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let mut song = song.ok_or_else(|| FormatError::Malformed("no song element".into()))?;
    song.normalize();
    Ok(song)
}

fn attr<T: FromStr>(start: &BytesStart, name: &[u8]) -> Option<T> {
    attr_string(start, name).and_then(|value| value.parse().ok())
}

fn attr_string(start: &BytesStart, name: &[u8]) -> Option<String> {
    start
        .attributes()
        .flatten()
        .find(|attribute| attribute.key.as_ref() == name)
        .and_then(|attribute| attribute.unescape_value().ok())
        .map(|value| value.into_owned())
}

fn parse_song(reader: &mut Reader<&[u8]>, start: &BytesStart) -> Result<Song, FormatError> {
    let mut song = Song::empty();
    if let Some(name) = attr_string(start, b"name") {
        song.set_name(&name);
    }
    if let Some(tempo) = attr(start, b"tempo") {
        song.set_tempo(tempo);
    }
    if let Some(ticks_per_line) = attr(start, b"ticksperline") {
        song.set_ticks_per_line(ticks_per_line);
    }
    if let Some(master_volume) = attr(start, b"mastervolume") {
        song.set_master_volume(master_volume);
    }
    song.set_send_sync(attr::<u32>(start, b"sendsync").unwrap_or(0) != 0);

    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.name().as_ref() {
                b"blocks" => parse_blocks(reader, &mut song)?,
                b"sections" => parse_sections(reader, &mut song)?,
                b"playingsequences" => parse_playseqs(reader, &mut song)?,
                b"instruments" => parse_instruments(reader, &mut song)?,
                b"tracks" => parse_tracks(reader, &mut song)?,
                b"trackvolumes" => parse_track_volumes(reader, &mut song)?,
                b"messages" => parse_messages(reader, &mut song)?,
                _ => {
                    warn!(
                        "Skipping unknown element {}",
                        String::from_utf8_lossy(e.name().as_ref())
                    );
                    reader.read_to_end(e.name())?;
                }
            },
            Event::End(e) if e.name().as_ref() == b"song" => break,
            Event::Eof => return Err(FormatError::UnexpectedEof),
            _ => {}
        }
    }
    Ok(song)
}

fn block_from_attrs(start: &BytesStart) -> Block {
    let tracks = attr(start, b"tracks").unwrap_or(4);
    let length = attr(start, b"length").unwrap_or(64);
    let command_pages = attr(start, b"commandpages").unwrap_or(1);
    let mut block = Block::new(tracks, length, command_pages);
    if let Some(name) = attr_string(start, b"name") {
        block.set_name(&name);
    }
    block
}

fn parse_blocks(reader: &mut Reader<&[u8]>, song: &mut Song) -> Result<(), FormatError> {
    loop {
        match reader.read_event()? {
            Event::Start(e) if e.name().as_ref() == b"block" => {
                let block = parse_block(reader, &e)?;
                song.add_block(block);
            }
            Event::Empty(e) if e.name().as_ref() == b"block" => {
                song.add_block(block_from_attrs(&e));
            }
            Event::End(e) if e.name().as_ref() == b"blocks" => break,
            Event::Eof => return Err(FormatError::UnexpectedEof),
            _ => {}
        }
    }
    Ok(())
}

fn parse_block(reader: &mut Reader<&[u8]>, start: &BytesStart) -> Result<Block, FormatError> {
    let mut block = block_from_attrs(start);
    loop {
        match reader.read_event()? {
            Event::Empty(e) => match e.name().as_ref() {
                b"note" => {
                    let line = attr(&e, b"line").unwrap_or(0);
                    let track = attr(&e, b"track").unwrap_or(0);
                    let note = attr(&e, b"note").unwrap_or(0);
                    let instrument = attr(&e, b"instrument").unwrap_or(0);
                    block.set_note(line, track, note, instrument);
                }
                b"command" => {
                    let line = attr(&e, b"line").unwrap_or(0);
                    let track = attr(&e, b"track").unwrap_or(0);
                    let page = attr(&e, b"page").unwrap_or(0);
                    let command = attr(&e, b"command").unwrap_or(0);
                    let value = attr(&e, b"value").unwrap_or(0);
                    block.set_command(line, track, page, command, value);
                }
                _ => {}
            },
            Event::Start(e) => {
                warn!(
                    "Skipping unknown element {}",
                    String::from_utf8_lossy(e.name().as_ref())
                );
                reader.read_to_end(e.name())?;
            }
            Event::End(e) if e.name().as_ref() == b"block" => break,
            Event::Eof => return Err(FormatError::UnexpectedEof),
            _ => {}
        }
    }
    Ok(block)
}

fn parse_sections(reader: &mut Reader<&[u8]>, song: &mut Song) -> Result<(), FormatError> {
    loop {
        match reader.read_event()? {
            Event::Start(e) if e.name().as_ref() == b"section" => {
                let text = reader.read_text(e.name())?;
                song.add_section(text.trim().parse().unwrap_or(0));
            }
            Event::End(e) if e.name().as_ref() == b"sections" => break,
            Event::Eof => return Err(FormatError::UnexpectedEof),
            _ => {}
        }
    }
    Ok(())
}

fn parse_playseqs(reader: &mut Reader<&[u8]>, song: &mut Song) -> Result<(), FormatError> {
    loop {
        match reader.read_event()? {
            Event::Start(e) if e.name().as_ref() == b"playingsequence" => {
                let mut playseq = Playseq::new();
                playseq.clear();
                if let Some(name) = attr_string(&e, b"name") {
                    playseq.set_name(&name);
                }
                loop {
                    match reader.read_event()? {
                        Event::Start(position) if position.name().as_ref() == b"position" => {
                            let text = reader.read_text(position.name())?;
                            playseq.push(text.trim().parse().unwrap_or(0));
                        }
                        Event::End(end) if end.name().as_ref() == b"playingsequence" => break,
                        Event::Eof => return Err(FormatError::UnexpectedEof),
                        _ => {}
                    }
                }
                if playseq.length() == 0 {
                    playseq.push(0);
                }
                song.add_playseq(playseq);
            }
            Event::End(e) if e.name().as_ref() == b"playingsequences" => break,
            Event::Eof => return Err(FormatError::UnexpectedEof),
            _ => {}
        }
    }
    Ok(())
}

fn parse_instruments(reader: &mut Reader<&[u8]>, song: &mut Song) -> Result<(), FormatError> {
    loop {
        match reader.read_event()? {
            Event::Start(e) if e.name().as_ref() == b"instrument" => {
                let instrument = parse_instrument(reader, &e)?;
                song.add_instrument(instrument);
            }
            Event::Empty(e) if e.name().as_ref() == b"instrument" => {
                song.add_instrument(instrument_from_attrs(&e));
            }
            Event::End(e) if e.name().as_ref() == b"instruments" => break,
            Event::Eof => return Err(FormatError::UnexpectedEof),
            _ => {}
        }
    }
    Ok(())
}

fn instrument_from_attrs(start: &BytesStart) -> Instrument {
    let mut instrument = Instrument::new(&attr_string(start, b"name").unwrap_or_default());
    if let Some(interface_name) = attr_string(start, b"midiinterface") {
        instrument.set_midi_interface_name(&interface_name);
    }
    if let Some(preset) = attr(start, b"midipreset") {
        instrument.set_midi_preset(preset);
    }
    if let Some(channel) = attr(start, b"midichannel") {
        instrument.set_midi_channel(channel);
    }
    if let Some(velocity) = attr(start, b"defaultvelocity") {
        instrument.set_default_velocity(velocity);
    }
    if let Some(transpose) = attr(start, b"transpose") {
        instrument.set_transpose(transpose);
    }
    if let Some(hold) = attr(start, b"hold") {
        instrument.set_hold(hold);
    }
    instrument
}

fn parse_instrument(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart,
) -> Result<Instrument, FormatError> {
    let mut instrument = instrument_from_attrs(start);
    loop {
        match reader.read_event()? {
            Event::Start(e) if e.name().as_ref() == b"arpeggio" => {
                if let Some(base_note) = attr(&e, b"basenote") {
                    instrument.set_arpeggio_base_note(base_note);
                }
                loop {
                    match reader.read_event()? {
                        Event::Start(block_start) if block_start.name().as_ref() == b"block" => {
                            let block = parse_block(reader, &block_start)?;
                            if instrument.arpeggio().is_none() {
                                instrument.set_arpeggio(Some(block));
                            }
                        }
                        Event::End(end) if end.name().as_ref() == b"arpeggio" => break,
                        Event::Eof => return Err(FormatError::UnexpectedEof),
                        _ => {}
                    }
                }
            }
            Event::Start(e) => {
                warn!(
                    "Skipping unknown element {}",
                    String::from_utf8_lossy(e.name().as_ref())
                );
                reader.read_to_end(e.name())?;
            }
            Event::End(e) if e.name().as_ref() == b"instrument" => break,
            Event::Eof => return Err(FormatError::UnexpectedEof),
            _ => {}
        }
    }
    Ok(instrument)
}

fn parse_tracks(reader: &mut Reader<&[u8]>, song: &mut Song) -> Result<(), FormatError> {
    // Blocks come first in the document, so the track array exists by now
    song.check_max_tracks();
    loop {
        match reader.read_event()? {
            Event::Start(e) if e.name().as_ref() == b"track" => {
                let number: usize = attr(&e, b"number").unwrap_or(0);
                let volume = attr(&e, b"volume");
                let mute = attr::<u32>(&e, b"mute").unwrap_or(0) != 0;
                let solo = attr::<u32>(&e, b"solo").unwrap_or(0) != 0;
                let name = reader.read_text(e.name())?;
                if number < song.max_tracks() {
                    let track = song.track_mut(number);
                    track.set_name(name.trim());
                    if let Some(volume) = volume {
                        track.set_volume(volume);
                    }
                    track.set_muted(mute);
                    track.set_solo(solo);
                }
            }
            Event::End(e) if e.name().as_ref() == b"tracks" => break,
            Event::Eof => return Err(FormatError::UnexpectedEof),
            _ => {}
        }
    }
    Ok(())
}

fn parse_track_volumes(reader: &mut Reader<&[u8]>, song: &mut Song) -> Result<(), FormatError> {
    song.check_max_tracks();
    loop {
        match reader.read_event()? {
            Event::Start(e) if e.name().as_ref() == b"trackvolume" => {
                let number: usize = attr(&e, b"track").unwrap_or(0);
                let text = reader.read_text(e.name())?;
                let value: u32 = text.trim().parse().unwrap_or(127);
                if number < song.max_tracks() {
                    let track = song.track_mut(number);
                    track.set_volume((value & 0x7f) as u8);
                    // Legacy encoding keeps the mute flag in the high bit
                    track.set_muted(value & 0x80 != 0);
                }
            }
            Event::End(e) if e.name().as_ref() == b"trackvolumes" => break,
            Event::Eof => return Err(FormatError::UnexpectedEof),
            _ => {}
        }
    }
    Ok(())
}

fn parse_messages(reader: &mut Reader<&[u8]>, song: &mut Song) -> Result<(), FormatError> {
    loop {
        match reader.read_event()? {
            Event::Start(e) if e.name().as_ref() == b"message" => {
                let mut message = Message::new();
                if let Some(name) = attr_string(&e, b"name") {
                    message.set_name(&name);
                }
                message.set_auto_send(attr::<u32>(&e, b"autosend").unwrap_or(0) != 0);
                let text = reader.read_text(e.name())?;
                message.set_data(parse_hex(text.trim()));
                song.add_message(message);
            }
            Event::End(e) if e.name().as_ref() == b"messages" => break,
            Event::Eof => return Err(FormatError::UnexpectedEof),
            _ => {}
        }
    }
    Ok(())
}

fn parse_hex(text: &str) -> Vec<u8> {
    let digits: Vec<u8> = text
        .bytes()
        .filter(|byte| byte.is_ascii_hexdigit())
        .collect();
    digits
        .chunks_exact(2)
        .map(|pair| {
            let high = (pair[0] as char).to_digit(16).unwrap_or(0) as u8;
            let low = (pair[1] as char).to_digit(16).unwrap_or(0) as u8;
            (high << 4) | low
        })
        .collect()
}

fn to_hex(data: &[u8]) -> String {
    data.iter().map(|byte| format!("{:02X}", byte)).collect()
}

/// Serialise a song into the XML document format.
pub fn save_song(song: &Song) -> Result<String, FormatError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    let mut root = BytesStart::new("song");
    root.push_attribute(("name", song.name()));
    root.push_attribute(("tempo", song.tempo().to_string().as_str()));
    root.push_attribute(("ticksperline", song.ticks_per_line().to_string().as_str()));
    root.push_attribute(("mastervolume", song.master_volume().to_string().as_str()));
    root.push_attribute(("sendsync", if song.send_sync() { "1" } else { "0" }));
    writer.write_event(Event::Start(root))?;

    writer.write_event(Event::Start(BytesStart::new("blocks")))?;
    for number in 0..song.blocks() {
        if let Some(block) = song.block(number) {
            write_block(&mut writer, block, number)?;
        }
    }
    writer.write_event(Event::End(BytesEnd::new("blocks")))?;

    writer.write_event(Event::Start(BytesStart::new("sections")))?;
    for number in 0..song.sections() {
        let mut element = BytesStart::new("section");
        element.push_attribute(("number", number.to_string().as_str()));
        writer.write_event(Event::Start(element))?;
        writer.write_event(Event::Text(BytesText::new(
            song.section(number).to_string().as_str(),
        )))?;
        writer.write_event(Event::End(BytesEnd::new("section")))?;
    }
    writer.write_event(Event::End(BytesEnd::new("sections")))?;

    writer.write_event(Event::Start(BytesStart::new("playingsequences")))?;
    for number in 0..song.playseqs() {
        let playseq = song.playseq(number);
        let mut element = BytesStart::new("playingsequence");
        element.push_attribute(("number", number.to_string().as_str()));
        element.push_attribute(("name", playseq.name()));
        writer.write_event(Event::Start(element))?;
        for position in 0..playseq.length() {
            let mut position_element = BytesStart::new("position");
            position_element.push_attribute(("number", position.to_string().as_str()));
            writer.write_event(Event::Start(position_element))?;
            writer.write_event(Event::Text(BytesText::new(
                playseq.at(position).to_string().as_str(),
            )))?;
            writer.write_event(Event::End(BytesEnd::new("position")))?;
        }
        writer.write_event(Event::End(BytesEnd::new("playingsequence")))?;
    }
    writer.write_event(Event::End(BytesEnd::new("playingsequences")))?;

    writer.write_event(Event::Start(BytesStart::new("instruments")))?;
    for number in 0..song.instruments() {
        if let Some(instrument) = song.instrument(number) {
            write_instrument(&mut writer, instrument, number)?;
        }
    }
    writer.write_event(Event::End(BytesEnd::new("instruments")))?;

    writer.write_event(Event::Start(BytesStart::new("tracks")))?;
    for number in 0..song.max_tracks() {
        let track = song.track(number);
        let mut element = BytesStart::new("track");
        element.push_attribute(("number", number.to_string().as_str()));
        element.push_attribute(("volume", track.volume().to_string().as_str()));
        element.push_attribute(("mute", if track.is_muted() { "1" } else { "0" }));
        element.push_attribute(("solo", if track.is_solo() { "1" } else { "0" }));
        writer.write_event(Event::Start(element))?;
        writer.write_event(Event::Text(BytesText::new(track.name())))?;
        writer.write_event(Event::End(BytesEnd::new("track")))?;
    }
    writer.write_event(Event::End(BytesEnd::new("tracks")))?;

    writer.write_event(Event::Start(BytesStart::new("messages")))?;
    for number in 0..song.messages() {
        if let Some(message) = song.message(number) {
            let mut element = BytesStart::new("message");
            element.push_attribute(("number", number.to_string().as_str()));
            element.push_attribute(("name", message.name()));
            element.push_attribute(("autosend", if message.is_auto_send() { "1" } else { "0" }));
            writer.write_event(Event::Start(element))?;
            writer.write_event(Event::Text(BytesText::new(to_hex(message.data()).as_str())))?;
            writer.write_event(Event::End(BytesEnd::new("message")))?;
        }
    }
    writer.write_event(Event::End(BytesEnd::new("messages")))?;

    writer.write_event(Event::End(BytesEnd::new("song")))?;

    String::from_utf8(writer.into_inner()).map_err(|e| FormatError::Malformed(e.to_string()))
}

fn write_block(
    writer: &mut Writer<Vec<u8>>,
    block: &Block,
    number: usize,
) -> Result<(), FormatError> {
    let mut element = BytesStart::new("block");
    element.push_attribute(("number", number.to_string().as_str()));
    element.push_attribute(("name", block.name()));
    element.push_attribute(("commandpages", block.command_pages().to_string().as_str()));
    element.push_attribute(("tracks", block.tracks().to_string().as_str()));
    element.push_attribute(("length", block.length().to_string().as_str()));
    writer.write_event(Event::Start(element))?;

    for line in 0..block.length() {
        for track in 0..block.tracks() {
            let note = block.note(line, track);
            let instrument = block.instrument(line, track);
            if note != 0 || instrument != 0 {
                let mut cell = BytesStart::new("note");
                cell.push_attribute(("line", line.to_string().as_str()));
                cell.push_attribute(("track", track.to_string().as_str()));
                cell.push_attribute(("note", note.to_string().as_str()));
                cell.push_attribute(("instrument", instrument.to_string().as_str()));
                writer.write_event(Event::Empty(cell))?;
            }
            for page in 0..block.command_pages() {
                let command = block.command(line, track, page);
                let value = block.command_value(line, track, page);
                if command != 0 || value != 0 {
                    let mut cell = BytesStart::new("command");
                    cell.push_attribute(("line", line.to_string().as_str()));
                    cell.push_attribute(("track", track.to_string().as_str()));
                    cell.push_attribute(("page", page.to_string().as_str()));
                    cell.push_attribute(("command", command.to_string().as_str()));
                    cell.push_attribute(("value", value.to_string().as_str()));
                    writer.write_event(Event::Empty(cell))?;
                }
            }
        }
    }

    writer.write_event(Event::End(BytesEnd::new("block")))?;
    Ok(())
}

fn write_instrument(
    writer: &mut Writer<Vec<u8>>,
    instrument: &Instrument,
    number: usize,
) -> Result<(), FormatError> {
    let mut element = BytesStart::new("instrument");
    element.push_attribute(("number", number.to_string().as_str()));
    element.push_attribute(("name", instrument.name()));
    if !instrument.midi_interface_name().is_empty() {
        element.push_attribute(("midiinterface", instrument.midi_interface_name()));
    }
    element.push_attribute(("midipreset", instrument.midi_preset().to_string().as_str()));
    element.push_attribute(("midichannel", instrument.midi_channel().to_string().as_str()));
    element.push_attribute((
        "defaultvelocity",
        instrument.default_velocity().to_string().as_str(),
    ));
    element.push_attribute(("transpose", instrument.transpose().to_string().as_str()));
    element.push_attribute(("hold", instrument.hold().to_string().as_str()));

    if let Some(arpeggio) = instrument.arpeggio() {
        writer.write_event(Event::Start(element))?;
        let mut arpeggio_element = BytesStart::new("arpeggio");
        arpeggio_element.push_attribute((
            "basenote",
            instrument.arpeggio_base_note().to_string().as_str(),
        ));
        writer.write_event(Event::Start(arpeggio_element))?;
        write_block(writer, arpeggio, 0)?;
        writer.write_event(Event::End(BytesEnd::new("arpeggio")))?;
        writer.write_event(Event::End(BytesEnd::new("instrument")))?;
    } else {
        writer.write_event(Event::Empty(element))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example_song() -> Song {
        let mut song = Song::empty();
        song.set_name("Example");
        song.set_tempo(140);
        song.set_ticks_per_line(8);
        song.set_master_volume(100);
        song.set_send_sync(true);

        let mut block = Block::new(2, 16, 2);
        block.set_name("intro");
        block.set_note(0, 0, 49, 1);
        block.set_command(3, 1, 1, 0x0d, 150);
        song.add_block(block);

        let mut playseq = Playseq::new();
        playseq.clear();
        playseq.push(0);
        playseq.push(0);
        playseq.set_name("main");
        song.add_playseq(playseq);
        song.add_section(0);

        let mut instrument = Instrument::new("strings");
        instrument.set_midi_interface_name("Synth Port A");
        instrument.set_midi_channel(3);
        instrument.set_default_velocity(90);
        instrument.set_transpose(-12);
        instrument.set_hold(4);
        let mut arpeggio = Block::new(1, 3, 1);
        arpeggio.set_note(1, 0, 52, 0);
        instrument.set_arpeggio(Some(arpeggio));
        instrument.set_arpeggio_base_note(49);
        song.add_instrument(instrument);

        let mut message = Message::new();
        message.set_name("reset");
        message.set_auto_send(true);
        message.set_data(vec![0xf0, 0x7e, 0x7f, 0x09, 0x01, 0xf7]);
        song.add_message(message);

        song.normalize();
        song.track_mut(1).set_muted(true);
        song.track_mut(0).set_volume(90);
        song
    }

    #[test]
    fn round_trip_preserves_the_song() {
        let original = example_song();
        let xml = save_song(&original).unwrap();
        let loaded = load_song(&xml).unwrap();

        assert_eq!(loaded.name(), "Example");
        assert_eq!(loaded.tempo(), 140);
        assert_eq!(loaded.ticks_per_line(), 8);
        assert_eq!(loaded.master_volume(), 100);
        assert!(loaded.send_sync());

        assert_eq!(loaded.blocks(), 1);
        let block = loaded.block(0).unwrap();
        assert_eq!(block.name(), "intro");
        assert_eq!(block.tracks(), 2);
        assert_eq!(block.length(), 16);
        assert_eq!(block.command_pages(), 2);
        assert_eq!(block.note(0, 0), 49);
        assert_eq!(block.instrument(0, 0), 1);
        assert_eq!(block.command(3, 1, 1), 0x0d);
        assert_eq!(block.command_value(3, 1, 1), 150);

        assert_eq!(loaded.playseqs(), 1);
        assert_eq!(loaded.playseq(0).name(), "main");
        assert_eq!(loaded.playseq(0).length(), 2);
        assert_eq!(loaded.sections(), 1);

        assert_eq!(loaded.instruments(), 1);
        let instrument = loaded.instrument(0).unwrap();
        assert_eq!(instrument.name(), "strings");
        assert_eq!(instrument.midi_interface_name(), "Synth Port A");
        assert_eq!(instrument.midi_channel(), 3);
        assert_eq!(instrument.default_velocity(), 90);
        assert_eq!(instrument.transpose(), -12);
        assert_eq!(instrument.hold(), 4);
        assert_eq!(instrument.arpeggio_base_note(), 49);
        let arpeggio = instrument.arpeggio().unwrap();
        assert_eq!(arpeggio.length(), 3);
        assert_eq!(arpeggio.note(1, 0), 52);

        assert_eq!(loaded.max_tracks(), 2);
        assert!(loaded.track(1).is_muted());
        assert_eq!(loaded.track(0).volume(), 90);

        assert_eq!(loaded.messages(), 1);
        let message = loaded.message(0).unwrap();
        assert_eq!(message.name(), "reset");
        assert!(message.is_auto_send());
        assert_eq!(message.data(), &[0xf0, 0x7e, 0x7f, 0x09, 0x01, 0xf7]);
    }

    #[test]
    fn unknown_elements_are_tolerated() {
        let xml = r#"<song name="x" tempo="120" ticksperline="6" mastervolume="127" sendsync="0">
            <widgets><widget kind="knob"/></widgets>
            <blocks><block number="0" tracks="1" length="4" commandpages="1"/></blocks>
        </song>"#;
        let song = load_song(xml).unwrap();
        assert_eq!(song.name(), "x");
        assert_eq!(song.blocks(), 1);
    }

    #[test]
    fn legacy_trackvolumes_decode_volume_and_mute() {
        let xml = r#"<song name="legacy" tempo="120" ticksperline="6" mastervolume="127" sendsync="0">
            <blocks><block number="0" tracks="2" length="4" commandpages="1"/></blocks>
            <trackvolumes>
                <trackvolume track="0">100</trackvolume>
                <trackvolume track="1">228</trackvolume>
            </trackvolumes>
        </song>"#;
        let song = load_song(xml).unwrap();
        assert_eq!(song.track(0).volume(), 100);
        assert!(!song.track(0).is_muted());
        // 228 = 0x80 | 100: muted at volume 100
        assert_eq!(song.track(1).volume(), 100);
        assert!(song.track(1).is_muted());
    }

    #[test]
    fn missing_attributes_fall_back_to_defaults() {
        let xml = "<song><blocks><block/></blocks></song>";
        let song = load_song(xml).unwrap();
        assert_eq!(song.tempo(), 120);
        assert_eq!(song.ticks_per_line(), 6);
        assert_eq!(song.master_volume(), 127);
        let block = song.block(0).unwrap();
        assert_eq!(block.tracks(), 4);
        assert_eq!(block.length(), 64);
    }

    #[test]
    fn not_a_song_document_is_an_error() {
        assert!(load_song("<banana/>").is_err());
        assert!(load_song("not xml at all").is_err());
    }

    #[test]
    fn hex_payload_parsing_ignores_whitespace() {
        assert_eq!(parse_hex("F0 7E 7F F7"), vec![0xf0, 0x7e, 0x7f, 0xf7]);
        assert_eq!(parse_hex("f07ef7"), vec![0xf0, 0x7e, 0xf7]);
        assert_eq!(parse_hex(""), Vec::<u8>::new());
    }
}
