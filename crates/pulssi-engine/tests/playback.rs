//! Integration tests: build small songs, play them through a recording sink
//! and check the emitted MIDI event stream.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use pulssi_engine::commands;
use pulssi_engine::{ExternalSync, Mode, Player, StateChange, TimerScheduler};
use pulssi_midi::{BufferOutput, MidiOutput, OutputSet};
use pulssi_score::{Block, Instrument, Playseq, Song};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MidiEvent {
    NoteOn(u8, u8, u8),
    NoteOff(u8, u8, u8),
    PitchWheel(u8, u8),
    Controller(u8, u8, u8),
    Aftertouch(u8, u8, u8),
    ChannelPressure(u8, u8),
    ProgramChange(u8, u8),
    Clock,
    Start,
    Continue,
    Stop,
    Tempo(u32),
}

/// A sink that records structured events stamped with the engine tick.
struct RecordingOutput {
    tick: AtomicU64,
    events: Mutex<Vec<(u64, MidiEvent)>>,
    ticks_seen: Mutex<Vec<u64>>,
}

impl RecordingOutput {
    fn new() -> Self {
        Self {
            tick: AtomicU64::new(0),
            events: Mutex::new(Vec::new()),
            ticks_seen: Mutex::new(Vec::new()),
        }
    }

    fn events(&self) -> Vec<(u64, MidiEvent)> {
        self.events.lock().unwrap().clone()
    }

    fn ticks_seen(&self) -> Vec<u64> {
        self.ticks_seen.lock().unwrap().clone()
    }

    fn record(&self, event: MidiEvent) {
        let tick = self.tick.load(Ordering::Relaxed);
        self.events.lock().unwrap().push((tick, event));
    }
}

impl MidiOutput for RecordingOutput {
    fn name(&self) -> &str {
        "record"
    }

    fn is_enabled(&self) -> bool {
        true
    }

    fn write_raw(&self, _data: &[u8]) {}

    fn set_tick(&self, tick: u64) {
        self.tick.store(tick, Ordering::Relaxed);
        self.ticks_seen.lock().unwrap().push(tick);
    }

    fn tempo(&self, tempo: u32) {
        self.record(MidiEvent::Tempo(tempo));
    }

    fn note_on(&self, channel: u8, note: u8, velocity: u8) {
        self.record(MidiEvent::NoteOn(channel, note, velocity));
    }

    fn note_off(&self, channel: u8, note: u8, velocity: u8) {
        self.record(MidiEvent::NoteOff(channel, note, velocity));
    }

    fn pitch_wheel(&self, channel: u8, value: u8) {
        self.record(MidiEvent::PitchWheel(channel, value));
    }

    fn controller(&self, channel: u8, number: u8, value: u8) {
        self.record(MidiEvent::Controller(channel, number, value));
    }

    fn aftertouch(&self, channel: u8, note: u8, value: u8) {
        self.record(MidiEvent::Aftertouch(channel, note, value));
    }

    fn channel_pressure(&self, channel: u8, value: u8) {
        self.record(MidiEvent::ChannelPressure(channel, value));
    }

    fn program_change(&self, channel: u8, program: u8) {
        self.record(MidiEvent::ProgramChange(channel, program));
    }

    fn clock(&self) {
        self.record(MidiEvent::Clock);
    }

    fn start(&self) {
        self.record(MidiEvent::Start);
    }

    fn cont(&self) {
        self.record(MidiEvent::Continue);
    }

    fn stop(&self) {
        self.record(MidiEvent::Stop);
    }
}

/// Build a song with one block and one instrument bound to the recording
/// output. The block is `length` lines by `tracks` tracks.
fn song_with_block(tracks: usize, length: usize) -> Song {
    let mut song = Song::empty();
    song.set_tempo(120);
    song.set_ticks_per_line(6);
    song.add_block(Block::new(tracks, length, 1));
    song.add_playseq(Playseq::new());
    song.add_section(0);

    let mut instrument = Instrument::new("lead");
    instrument.set_midi_interface_name("record");
    instrument.set_midi_channel(0);
    instrument.set_default_velocity(100);
    instrument.set_hold(1);
    song.add_instrument(instrument);

    song.normalize();
    song
}

fn player_with_recorder(song: Song) -> (Player, Arc<RecordingOutput>) {
    let recorder = Arc::new(RecordingOutput::new());
    let outputs = Arc::new(OutputSet::with_primary(recorder.clone()));
    (Player::new(song, outputs), recorder)
}

fn wait_until_stopped(player: &Player) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while player.is_running() {
        assert!(Instant::now() < deadline, "engine did not stop in time");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Every note-on on a (channel, note) pair must be preceded by a note-off
/// for the previous one.
fn assert_note_balance(events: &[(u64, MidiEvent)]) {
    let mut sounding: HashSet<(u8, u8)> = HashSet::new();
    for &(tick, event) in events {
        match event {
            MidiEvent::NoteOn(channel, note, _) => {
                assert!(
                    sounding.insert((channel, note)),
                    "note on while already sounding at tick {}: {:?}",
                    tick,
                    (channel, note)
                );
            }
            MidiEvent::NoteOff(channel, note, _) => {
                sounding.remove(&(channel, note));
            }
            _ => {}
        }
    }
    assert!(sounding.is_empty(), "notes left sounding: {:?}", sounding);
}

// --- S1: single block, one note, default timing ---

#[test]
fn single_note_plays_and_hold_releases_it() {
    let mut song = song_with_block(1, 1);
    song.block_mut(0).unwrap().set_note(0, 0, 49, 1);

    let (mut player, recorder) = player_with_recorder(song);
    player.set_kill_when_looped(true);
    player.play(Mode::PlayBlock, false);
    wait_until_stopped(&player);

    let events = recorder.events();
    assert_eq!(
        events,
        vec![
            (0, MidiEvent::NoteOn(0, 48, 100)),
            (1, MidiEvent::NoteOff(0, 48, 127)),
        ]
    );
    assert_note_balance(&events);
}

#[test]
fn ticks_are_strictly_increasing() {
    let mut song = song_with_block(1, 2);
    song.block_mut(0).unwrap().set_note(0, 0, 49, 1);

    let (mut player, recorder) = player_with_recorder(song);
    player.set_kill_when_looped(true);
    player.play(Mode::PlayBlock, false);
    wait_until_stopped(&player);

    let ticks = recorder.ticks_seen();
    // 2 lines x 6 ticks per line
    assert_eq!(ticks, (0..12).collect::<Vec<u64>>());
}

// --- S2: retrigger 0x23 ---

#[test]
fn retrigger_fires_on_delay_then_every_repeat() {
    let mut song = song_with_block(1, 1);
    song.set_ticks_per_line(8);
    {
        let block = song.block_mut(0).unwrap();
        block.set_note(0, 0, 61, 1);
        block.set_command(0, 0, 0, commands::RETRIGGER, 0x23);
    }
    // Let retriggered notes ring until the next one cuts them
    song.instrument_mut(0).unwrap().set_hold(0);

    let (mut player, recorder) = player_with_recorder(song);
    player.set_kill_when_looped(true);
    player.play(Mode::PlayBlock, false);
    wait_until_stopped(&player);

    let events = recorder.events();
    assert_eq!(
        events,
        vec![
            (2, MidiEvent::NoteOn(0, 60, 100)),
            (5, MidiEvent::NoteOff(0, 60, 127)),
            (5, MidiEvent::NoteOn(0, 60, 100)),
            (7, MidiEvent::NoteOff(0, 60, 127)),
        ]
    );
    assert_note_balance(&events);
}

// --- S3: pitch-wheel interpolation ---

#[test]
fn pitch_wheel_interpolates_to_the_exact_target() {
    let mut song = song_with_block(1, 1);
    song.set_ticks_per_line(4);
    song.block_mut(0)
        .unwrap()
        .set_command(0, 0, 0, commands::PITCH_WHEEL, 0xc0);
    // The cell instrument picks the channel without firing a note
    song.block_mut(0).unwrap().set_note(0, 0, 0, 1);

    let (mut player, recorder) = player_with_recorder(song);
    player.set_kill_when_looped(true);
    player.play(Mode::PlayBlock, false);
    wait_until_stopped(&player);

    assert_eq!(
        recorder.events(),
        vec![
            (0, MidiEvent::PitchWheel(0, 16)),
            (1, MidiEvent::PitchWheel(0, 32)),
            (2, MidiEvent::PitchWheel(0, 48)),
            (3, MidiEvent::PitchWheel(0, 64)),
        ]
    );
}

// --- S4: end-block jump ---

#[test]
fn end_block_jumps_to_the_given_line_of_the_next_position() {
    let mut song = Song::empty();
    song.set_tempo(120);
    song.set_ticks_per_line(2);

    let mut first = Block::new(1, 4, 1);
    first.set_command(2, 0, 0, commands::END_BLOCK, 1);
    song.add_block(first);

    let mut second = Block::new(1, 4, 1);
    second.set_note(0, 0, 50, 1); // must be skipped by the jump
    second.set_note(1, 0, 52, 1);
    song.add_block(second);

    let mut playseq = Playseq::new();
    playseq.clear();
    playseq.push(0);
    playseq.push(1);
    song.add_playseq(playseq);
    song.add_section(0);

    let mut instrument = Instrument::new("lead");
    instrument.set_midi_interface_name("record");
    instrument.set_default_velocity(100);
    instrument.set_hold(1);
    song.add_instrument(instrument);
    song.normalize();

    let (mut player, recorder) = player_with_recorder(song);
    let notifications = player.subscribe();
    player.set_kill_when_looped(true);
    player.play(Mode::PlaySong, false);
    wait_until_stopped(&player);

    let notes: Vec<MidiEvent> = recorder
        .events()
        .into_iter()
        .map(|(_, event)| event)
        .filter(|event| matches!(event, MidiEvent::NoteOn(..)))
        .collect();
    // Only the note on line 1 of the second block plays; line 0 is jumped over
    assert_eq!(notes, vec![MidiEvent::NoteOn(0, 51, 100)]);

    let changes: Vec<StateChange> = notifications.try_iter().map(|e| e.change).collect();
    assert!(changes.contains(&StateChange::Position(1)), "{:?}", changes);
    assert!(changes.contains(&StateChange::Block(1)), "{:?}", changes);
}

// --- S5: external sync ---

#[test]
fn external_sync_credits_buy_exactly_that_many_ticks() {
    let song = song_with_block(1, 4);

    let (mut player, _recorder) = player_with_recorder(song);
    player.set_external_sync(ExternalSync::MidiClock);
    player.play(Mode::PlayBlock, false);

    thread::sleep(Duration::from_millis(50));
    assert_eq!(player.ticks_so_far(), 0);

    for _ in 0..3 {
        player.external_sync(1);
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while player.ticks_so_far() < 3 {
        assert!(Instant::now() < deadline, "sync ticks were not processed");
        thread::sleep(Duration::from_millis(1));
    }
    thread::sleep(Duration::from_millis(50));
    assert_eq!(player.ticks_so_far(), 3);
    assert!(player.is_running());

    player.stop();
    assert!(!player.is_running());
}

// --- S6: SMF export ---

#[test]
fn export_run_produces_a_delta_timed_track_body() {
    let mut song = song_with_block(1, 1);
    song.block_mut(0).unwrap().set_note(0, 0, 49, 1);

    let buffer = Arc::new(BufferOutput::new());
    let outputs = Arc::new(OutputSet::with_primary(buffer.clone()));
    let mut player = Player::new(song, outputs);
    player.play_without_scheduling();

    assert_eq!(
        buffer.data(),
        vec![
            0x00, 0xff, 0x51, 0x03, 0x07, 0xa1, 0x20, // tempo 120 = 500000 us
            0x00, 0x90, 0x30, 0x64, // note on ch0 note 48 vel 100
            0x01, 0x80, 0x30, 0x7f, // note off one tick later
        ]
    );
}

// --- Solo / mute ---

#[test]
fn muted_tracks_produce_no_notes() {
    let mut song = song_with_block(2, 1);
    {
        let block = song.block_mut(0).unwrap();
        block.set_note(0, 0, 49, 1);
        block.set_note(0, 1, 61, 1);
    }
    song.track_mut(1).set_muted(true);

    let (mut player, recorder) = player_with_recorder(song);
    player.set_kill_when_looped(true);
    player.play(Mode::PlayBlock, false);
    wait_until_stopped(&player);

    let notes: Vec<MidiEvent> = recorder
        .events()
        .into_iter()
        .map(|(_, event)| event)
        .filter(|event| matches!(event, MidiEvent::NoteOn(..)))
        .collect();
    assert_eq!(notes, vec![MidiEvent::NoteOn(0, 48, 100)]);
}

#[test]
fn solo_silences_every_other_track() {
    let mut song = song_with_block(2, 1);
    {
        let block = song.block_mut(0).unwrap();
        block.set_note(0, 0, 49, 1);
        block.set_note(0, 1, 61, 1);
    }
    song.track_mut(0).set_solo(true);

    let (mut player, recorder) = player_with_recorder(song);
    player.set_kill_when_looped(true);
    player.play(Mode::PlayBlock, false);
    wait_until_stopped(&player);

    let notes: Vec<MidiEvent> = recorder
        .events()
        .into_iter()
        .map(|(_, event)| event)
        .filter(|event| matches!(event, MidiEvent::NoteOn(..)))
        .collect();
    assert_eq!(notes, vec![MidiEvent::NoteOn(0, 48, 100)]);
}

// --- Stop safety ---

#[test]
fn stop_silences_sounding_notes_and_nothing_follows() {
    let mut song = song_with_block(1, 4);
    song.block_mut(0).unwrap().set_note(0, 0, 49, 1);
    // Hold forever: only a stop can end the note
    song.instrument_mut(0).unwrap().set_hold(0);
    song.set_tempo(600);
    song.set_ticks_per_line(10);

    let (mut player, recorder) = player_with_recorder(song);
    player.set_scheduler(Some(Box::new(TimerScheduler::new())));
    player.play(Mode::PlayBlock, false);

    let deadline = Instant::now() + Duration::from_secs(5);
    while !recorder
        .events()
        .iter()
        .any(|(_, event)| matches!(event, MidiEvent::NoteOn(..)))
    {
        assert!(Instant::now() < deadline, "no note was played");
        thread::sleep(Duration::from_millis(1));
    }

    player.stop();

    let events = recorder.events();
    assert_note_balance(&events);
    let after_stop = events.len();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(recorder.events().len(), after_stop, "events after stop()");
}

// --- Arpeggio ---

#[test]
fn arpeggio_offsets_follow_the_sounding_note() {
    // Arpeggio block: base note 49 on line 0, 52 on line 1. With the cell
    // note at 49 this sounds 48 then 51 on successive lines.
    let mut song = song_with_block(1, 4);
    song.set_ticks_per_line(2);
    song.block_mut(0).unwrap().set_note(0, 0, 49, 1);

    let mut arpeggio = Block::new(1, 2, 1);
    arpeggio.set_note(0, 0, 49, 0);
    arpeggio.set_note(1, 0, 52, 0);
    {
        let instrument = song.instrument_mut(0).unwrap();
        instrument.set_arpeggio(Some(arpeggio));
        instrument.set_arpeggio_base_note(49);
        instrument.set_hold(1);
    }

    let (mut player, recorder) = player_with_recorder(song);
    player.set_kill_when_looped(true);
    player.play(Mode::PlayBlock, false);
    wait_until_stopped(&player);

    let notes: Vec<(u64, MidiEvent)> = recorder
        .events()
        .into_iter()
        .filter(|(_, event)| matches!(event, MidiEvent::NoteOn(..)))
        .collect();
    // Line 0 plays the base note; line 1 the +3 offset retriggered by the
    // arpeggio; lines 2/3 alternate again
    assert_eq!(
        notes,
        vec![
            (0, MidiEvent::NoteOn(0, 48, 100)),
            (2, MidiEvent::NoteOn(0, 51, 100)),
            (4, MidiEvent::NoteOn(0, 48, 100)),
            (6, MidiEvent::NoteOn(0, 51, 100)),
        ]
    );
}

// --- Continue keeps the cursor ---

#[test]
fn continue_block_resumes_from_the_current_line() {
    let mut song = song_with_block(1, 4);
    song.set_ticks_per_line(2);
    song.block_mut(0).unwrap().set_note(2, 0, 49, 1);

    let (mut player, recorder) = player_with_recorder(song);
    player.set_kill_when_looped(true);
    player.set_line(2);
    player.continue_block();
    wait_until_stopped(&player);

    let events = recorder.events();
    // Line 2's note plays immediately at tick 0 of the run
    assert_eq!(events.first(), Some(&(0, MidiEvent::NoteOn(0, 48, 100))));
}
