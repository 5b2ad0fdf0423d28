//! The player: engine loop, command interpreter and control surface.
//!
//! A [`Player`] owns the shared song and the engine's running state. Playback
//! happens on a dedicated worker thread that processes one tick per scheduler
//! pulse (or per external sync credit), interpreting note and command cells
//! into MIDI events on the output set.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use log::warn;

use pulssi_midi::{MidiOutput, OutputSet};
use pulssi_score::{Instrument, Song, SongLock};

use crate::commands::{self, should_play_note};
use crate::controller_values::{
    ControllerValues, SLOT_AFTERTOUCH, SLOT_CHANNEL_PRESSURE, SLOT_PITCH_WHEEL,
};
use crate::notify::{Notifier, StateChange, StateEvent};
use crate::scheduler::Scheduler;
use crate::track_status::TrackStatus;

/// What the engine is doing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Idle,
    PlaySong,
    PlayBlock,
}

/// Where tick pacing comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExternalSync {
    /// The engine paces itself with its scheduler (or runs flat out)
    Off,
    /// Each incoming MIDI clock pulse buys one tick
    MidiClock,
    /// Transport control comes from outside; ticks are still credited
    StartOnly,
}

/// A note-on queued within the current tick and flushed at tick end.
#[derive(Clone, Copy, Debug)]
struct NoteOn {
    interface: i16,
    channel: i16,
    note: i16,
    velocity: i16,
}

/// Per-track gating and velocity state accumulated while interpreting one
/// cell's command pages.
struct CommandContext {
    volume: i32,
    delay: i32,
    repeat: i32,
    hold: i32,
}

/// Everything guarded by the engine mutex.
struct EngineState {
    mode: Mode,
    section: usize,
    playseq: usize,
    position: usize,
    block: usize,
    line: usize,
    tick: u32,
    ticks_so_far: u64,
    post_command: u8,
    post_value: u8,
    postponed_notes: Vec<NoteOn>,
    solo: bool,
    sync_mode: ExternalSync,
    external_sync_ticks: u32,
    kill: bool,
    kill_when_looped: bool,
    track_statuses: Vec<TrackStatus>,
    controller_values: ControllerValues,
    playing_started: Instant,
    played_so_far: Duration,
}

impl EngineState {
    fn new() -> Self {
        Self {
            mode: Mode::Idle,
            section: 0,
            playseq: 0,
            position: 0,
            block: 0,
            line: 0,
            tick: 0,
            ticks_so_far: 0,
            post_command: 0,
            post_value: 0,
            postponed_notes: Vec::new(),
            solo: false,
            sync_mode: ExternalSync::Off,
            external_sync_ticks: 0,
            kill: false,
            kill_when_looped: false,
            track_statuses: Vec::new(),
            controller_values: ControllerValues::new(),
            playing_started: Instant::now(),
            played_so_far: Duration::ZERO,
        }
    }

    /// Match the status array to the song's track count. Existing entries
    /// keep their state; new tracks start silent.
    fn ensure_track_statuses(&mut self, max_tracks: usize) {
        self.track_statuses.truncate(max_tracks);
        for track in self.track_statuses.len()..max_tracks {
            self.track_statuses.push(TrackStatus::new(track));
        }
    }
}

/// The engine mutex plus the condvar external sync credits arrive on.
struct Shared {
    state: Mutex<EngineState>,
    sync_wakeup: Condvar,
}

fn interface_index(interface: i16) -> usize {
    if interface >= 0 {
        interface as usize
    } else {
        0
    }
}

fn channel_of(channel: i16) -> u8 {
    channel.max(0) as u8 & 0x0f
}

fn output_at<'a>(
    outputs: &'a [Arc<dyn MidiOutput>],
    index: usize,
) -> &'a Arc<dyn MidiOutput> {
    outputs.get(index).unwrap_or(&outputs[0])
}

/// Cell instrument references are clamped, never trusted.
fn resolve_instrument(song: &Song, number: usize) -> Option<&Instrument> {
    if song.instruments() == 0 {
        return None;
    }
    song.instrument(number.min(song.instruments() - 1))
}

/// Linear step from `origin` towards `target` on sub-line tick `tick`. The
/// exact target is emitted by the callers on the last tick of the line.
fn interpolated(origin: u8, target: u8, tick: u32, ticks_per_line: u32) -> u8 {
    let delta = (target as f32 - origin as f32) / ticks_per_line as f32;
    (origin as f32 + (tick + 1) as f32 * delta) as u8
}

/// The `< 0x80` immediate / `>= 0x80` interpolate convention for cache-backed
/// continuous controllers.
fn continuous_controller(
    values: &mut ControllerValues,
    interface: usize,
    channel: u8,
    slot: usize,
    value: u8,
    tick: u32,
    ticks_per_line: u32,
    mut emit: impl FnMut(u8),
) {
    if value < 0x80 {
        if tick == 0 {
            emit(value);
            values.set(interface, channel as usize, slot, value);
        }
    } else {
        let target = value - 0x80;
        if tick < ticks_per_line - 1 {
            let origin = values.get(interface, channel as usize, slot);
            emit(interpolated(origin, target, tick, ticks_per_line));
        } else {
            emit(target);
            values.set(interface, channel as usize, slot, target);
        }
    }
}

/// Silence every sounding note and reset all track state.
fn stop_notes_with(state: &mut EngineState, outputs: &[Arc<dyn MidiOutput>]) {
    for status in &mut state.track_statuses {
        if status.note != -1 {
            output_at(outputs, interface_index(status.midi_interface)).note_off(
                channel_of(status.midi_channel),
                status.note as u8,
                127,
            );
        }
        status.reset();
    }
}

/// Recompute (playseq, block) from the cursors, clamping everything into the
/// song, and publish what changed.
fn update_location(state: &mut EngineState, song: &Song, notifier: &Notifier, always_signal: bool) {
    let old_section = state.section;
    let old_playseq = state.playseq;
    let old_position = state.position;
    let old_block = state.block;

    if state.section >= song.sections() {
        state.section = 0;
    }

    let mut playseq = song.section(state.section);
    if playseq >= song.playseqs() {
        playseq = song.playseqs() - 1;
    }
    state.playseq = playseq;

    if state.position >= song.playseq(state.playseq).length() {
        state.position = 0;
    }

    let mut block = song.playseq(state.playseq).at(state.position);
    if block >= song.blocks() {
        block = song.blocks() - 1;
    }
    state.block = block;

    if state.section != old_section || always_signal {
        notifier.notify(StateChange::Section(state.section));
    }
    if state.playseq != old_playseq || always_signal {
        notifier.notify(StateChange::Playseq(state.playseq));
    }
    if state.position != old_position || always_signal {
        notifier.notify(StateChange::Position(state.position));
    }
    if state.block != old_block || always_signal {
        notifier.notify(StateChange::Block(state.block));
    }
}

/// Step to the next section, wrapping at the end. Returns whether it wrapped.
fn next_section(state: &mut EngineState, song: &Song, notifier: &Notifier) -> bool {
    let old_section = state.section;
    state.section += 1;

    let looped = state.section >= song.sections();
    if looped {
        state.section = 0;
    }

    if state.section != old_section {
        notifier.notify(StateChange::Section(state.section));
    }
    looped
}

/// Step to the next playseq position, spilling into the next section at the
/// end. Returns whether the song as a whole wrapped around.
fn next_position(state: &mut EngineState, song: &Song, notifier: &Notifier) -> bool {
    let old_position = state.position;
    state.position += 1;

    let looped = state.position >= song.playseq(state.playseq).length();
    if looped {
        state.position = 0;
    }

    if state.position != old_position {
        notifier.notify(StateChange::Position(state.position));
    }

    if looped {
        next_section(state, song, notifier)
    } else {
        false
    }
}

/// The engine worker: everything the playback thread needs, shared with the
/// owning [`Player`].
struct Worker {
    song: Arc<SongLock>,
    outputs: Arc<OutputSet>,
    shared: Arc<Shared>,
    notifier: Notifier,
    scheduler: Arc<Mutex<Option<Box<dyn Scheduler>>>>,
}

impl Worker {
    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The tick state machine. Runs until killed or until the song loops
    /// with `kill_when_looped` set, then silences everything.
    fn run(&self) {
        let mut scheduler_guard = self
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let has_scheduler = scheduler_guard.is_some();

        let started = match scheduler_guard.as_mut() {
            Some(scheduler) => scheduler.start(),
            None => Instant::now(),
        };

        let mut prev_sync_mode;
        let mut old_line;
        {
            let mut state = self.lock_state();
            state.tick = 0;
            state.ticks_so_far = 0;
            state.playing_started = started;
            prev_sync_mode = state.sync_mode;
            old_line = state.line;
        }
        let mut old_time: Option<u64> = None;

        loop {
            let mut state = self.lock_state();
            let sync_mode = state.sync_mode;

            if sync_mode != ExternalSync::Off {
                // One credit buys one tick; stop() posts a wakeup with none
                while state.external_sync_ticks == 0
                    && !state.kill
                    && state.sync_mode != ExternalSync::Off
                {
                    state = self
                        .shared
                        .sync_wakeup
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                if state.kill {
                    break;
                }
                if state.external_sync_ticks > 0 {
                    state.external_sync_ticks -= 1;
                }
            } else if has_scheduler {
                drop(state);
                let scheduler_changed = sync_mode != prev_sync_mode;
                prev_sync_mode = sync_mode;
                if let Some(scheduler) = scheduler_guard.as_mut() {
                    if let Err(e) = scheduler.wait_for_tick(&self.song, scheduler_changed) {
                        warn!("{}; stopping playback", e);
                        self.lock_state().kill = true;
                    }
                }
                state = self.lock_state();
                if state.kill {
                    break;
                }
            }

            let mut song = self.song.lock();

            // The score may have changed shape since the last tick
            if state.block >= song.blocks() {
                state.block = song.blocks() - 1;
            }
            let max_tracks = song.max_tracks();
            if state.track_statuses.len() != max_tracks {
                state.ensure_track_statuses(max_tracks);
            }

            let outputs = self.outputs.snapshot();

            for output in &outputs {
                output.set_tick(state.ticks_so_far);
            }

            // Send MIDI sync if requested
            if song.send_sync() {
                for output in &outputs {
                    output.clock();
                }
            }

            // The block may have shrunk under the cursor
            let block_length = song.block(state.block).map_or(1, |b| b.length());
            if state.line >= block_length {
                state.line %= block_length;
            }

            let (block_tracks, command_pages) = song
                .block(state.block)
                .map_or((0, 0), |b| (b.tracks(), b.command_pages()));

            for track in 0..block_tracks.min(max_tracks) {
                self.process_track(&mut state, &mut song, &outputs, track, command_pages);
            }

            // Play notes scheduled within this tick
            let postponed = std::mem::take(&mut state.postponed_notes);
            for note_on in postponed {
                output_at(&outputs, interface_index(note_on.interface)).note_on(
                    channel_of(note_on.channel),
                    note_on.note as u8,
                    note_on.velocity as u8,
                );
            }

            // Decrement hold times and stop notes whose time is up
            for status in &mut state.track_statuses {
                if status.hold >= 0 {
                    status.hold -= 1;
                    if status.hold < 0 && status.note != -1 {
                        output_at(&outputs, interface_index(status.midi_interface)).note_off(
                            channel_of(status.midi_channel),
                            status.note as u8,
                            127,
                        );
                        status.note = -1;
                    }
                }
            }

            // Next tick
            state.ticks_so_far += 1;
            state.tick += 1;
            state.tick %= song.ticks_per_line();

            let looped = if state.tick == 0 {
                self.advance_line(&mut state, &song)
            } else {
                false
            };

            let terminate = state.kill || (state.kill_when_looped && looped);
            let line_now = state.line;

            drop(song);
            drop(state);

            if terminate {
                break;
            }

            if line_now != old_line {
                self.notifier.notify(StateChange::Line(line_now));
                old_line = line_now;
            }

            if has_scheduler {
                let seconds = {
                    let state = self.lock_state();
                    (state.played_so_far + state.playing_started.elapsed()).as_secs()
                };
                if old_time != Some(seconds) {
                    self.notifier.notify(StateChange::Time(seconds));
                    old_time = Some(seconds);
                }
            }
        }

        // Termination epilogue: account the play time, stop the clock and
        // silence everything before the thread ends.
        {
            let mut state = self.lock_state();
            let elapsed = state.playing_started.elapsed();
            state.played_so_far += elapsed;
        }

        if let Some(scheduler) = scheduler_guard.as_mut() {
            scheduler.stop();
        }

        let line_now = {
            let mut state = self.lock_state();
            let outputs = self.outputs.snapshot();
            stop_notes_with(&mut state, &outputs);
            state.line
        };
        if line_now != old_line {
            self.notifier.notify(StateChange::Line(line_now));
        }
    }

    /// Handle the line-boundary work when the tick counter wraps: advance
    /// arpeggios, consume the latched post command, move the cursor.
    /// Returns whether the song (or block) looped around.
    fn advance_line(&self, state: &mut EngineState, song: &Song) -> bool {
        let mut looped = false;
        let mut change_block = false;

        state.line += 1;

        // Advance arpeggios
        for status in &mut state.track_statuses {
            if status.instrument >= 0 && status.arpeggio_line >= 0 {
                if let Some(arpeggio) = song
                    .instrument(status.instrument as usize)
                    .and_then(|i| i.arpeggio())
                {
                    status.arpeggio_line += 1;
                    status.arpeggio_line %= arpeggio.length() as i32;
                }
            }
        }

        match state.post_command {
            commands::END_BLOCK => {
                state.line = state.post_value as usize;
                if state.mode == Mode::PlaySong {
                    looped = next_position(state, song, &self.notifier);
                    change_block = true;
                }
            }
            commands::PLAYSEQ_POSITION => {
                let old_position = state.position;
                state.line = 0;
                state.position = state.post_value as usize;
                if state.position >= song.playseq(state.playseq).length() {
                    state.position = 0;
                    looped = next_section(state, song, &self.notifier);
                }
                if state.position != old_position {
                    self.notifier.notify(StateChange::Position(state.position));
                }
                change_block = true;
            }
            commands::TEMPO | commands::TICKS_PER_LINE => {
                // Zero-valued tempo/TPL commands mean stop at end of line
                state.kill = true;
            }
            _ => {
                let block_length = song.block(state.block).map_or(1, |b| b.length());
                if state.line >= block_length {
                    state.line = 0;
                    match state.mode {
                        Mode::PlaySong => {
                            looped = next_position(state, song, &self.notifier);
                            change_block = true;
                        }
                        Mode::PlayBlock => looped = true,
                        Mode::Idle => {}
                    }
                }
            }
        }
        state.post_command = 0;
        state.post_value = 0;

        if change_block {
            update_location(state, song, &self.notifier, false);
        }
        looped
    }

    /// Interpret one track's cell on the current tick: arpeggio resolution,
    /// retrigger gating, command pages and note firing.
    fn process_track(
        &self,
        state: &mut EngineState,
        song: &mut Song,
        outputs: &[Arc<dyn MidiOutput>],
        track: usize,
        command_pages: usize,
    ) {
        // Muted tracks are skipped; with any solo active only solo tracks play
        if song.track(track).is_muted() || (state.solo && !song.track(track).is_solo()) {
            return;
        }

        let line = state.line;
        let tick = state.tick;

        let (cell_note, cell_instrument, page_commands) = {
            let Some(block) = song.block(state.block) else {
                return;
            };
            let page_commands: Vec<(u8, u8)> = (0..command_pages)
                .map(|page| {
                    (
                        block.command(line, track, page),
                        block.command_value(line, track, page),
                    )
                })
                .collect();
            (
                block.note(line, track),
                block.instrument(line, track),
                page_commands,
            )
        };

        let mut ctx = CommandContext {
            volume: 127,
            delay: 0,
            repeat: -1,
            hold: -1,
        };

        let mut basenote = cell_note;
        let mut note = cell_note;

        if note != 0 {
            // A fresh note restarts the instrument's arpeggio
            if tick == 0 {
                state.track_statuses[track].arpeggio_line = 0;
            }
        } else {
            basenote = state.track_statuses[track].base_note;
        }

        // Resolve the arpeggio note, if any
        let arpeggio_instrument: i32 = if note != 0 && cell_instrument > 0 {
            cell_instrument as i32 - 1
        } else {
            state.track_statuses[track].instrument as i32
        };

        let mut arpeggio_commands: Vec<(u8, u8)> = Vec::new();
        let mut has_arpeggio = false;
        if arpeggio_instrument >= 0 && state.track_statuses[track].arpeggio_line >= 0 {
            let arpeggio_line = state.track_statuses[track].arpeggio_line as usize;
            if let Some(instrument) = resolve_instrument(song, arpeggio_instrument as usize) {
                if let Some(arpeggio) = instrument.arpeggio() {
                    has_arpeggio = true;
                    let arpeggio_note = arpeggio.note(arpeggio_line, 0);
                    note = if arpeggio_note != 0 {
                        // Offsets subtract as signed bytes, so base notes
                        // past 127 wrap rather than widen
                        (basenote as i32 + arpeggio_note as i8 as i32
                            - instrument.arpeggio_base_note() as i8 as i32)
                            as u8
                    } else {
                        0
                    };
                    arpeggio_commands = (0..arpeggio.command_pages())
                        .map(|page| {
                            (
                                arpeggio.command(arpeggio_line, 0, page),
                                arpeggio.command_value(arpeggio_line, 0, page),
                            )
                        })
                        .collect();
                }
            }
        }

        // Pre-scan commands so retrigger/delay can gate the note-off below
        if note != 0 {
            for &(page_command, value) in &page_commands {
                if page_command == 0 && value == 0 {
                    continue;
                }
                let mut command = page_command;
                if command == commands::PREVIOUS_COMMAND_VALUE {
                    if value != 0 {
                        command = state.track_statuses[track].previous_command;
                    }
                } else {
                    state.track_statuses[track].previous_command = command;
                }
                match command {
                    commands::RETRIGGER => {
                        ctx.delay = ((value & 0xf0) >> 4) as i32;
                        ctx.repeat = (value & 0x0f) as i32;
                    }
                    commands::DELAY => {
                        ctx.delay = value as i32;
                        ctx.repeat = -1;
                    }
                    _ => {}
                }
            }

            // A note about to fire silences whatever the track still sounds
            if should_play_note(tick, ctx.delay, ctx.repeat) {
                let status = &mut state.track_statuses[track];
                if status.note != -1 {
                    let interface = interface_index(status.midi_interface);
                    let channel = channel_of(status.midi_channel);
                    let old_note = status.note as u8;
                    status.note = -1;
                    output_at(outputs, interface).note_off(channel, old_note, 127);
                }
            }
        }

        // Arpeggio command pages first, then the block's own
        if has_arpeggio {
            for &(command, value) in &arpeggio_commands {
                self.handle_command(
                    state,
                    song,
                    outputs,
                    track,
                    note,
                    cell_instrument,
                    command,
                    value,
                    &mut ctx,
                );
            }
        }

        let had_volume = ctx.volume > 0;
        for &(command, value) in &page_commands {
            self.handle_command(
                state,
                song,
                outputs,
                track,
                note,
                cell_instrument,
                command,
                value,
                &mut ctx,
            );
        }

        // Remember the base note and instrument even when nothing fires now
        if basenote != 0 {
            let status = &mut state.track_statuses[track];
            status.base_note = basenote;
            if cell_instrument != 0 {
                status.instrument = cell_instrument as i16 - 1;
            }
        }

        // Fire the note through the gate
        if note != 0 && should_play_note(tick, ctx.delay, ctx.repeat) {
            let note = note - 1;
            let mut instrument_number = cell_instrument;
            if instrument_number == 0 {
                // Use the previous instrument when the cell has none
                instrument_number = (state.track_statuses[track].instrument + 1) as u8;
            }
            if instrument_number != 0 {
                self.play_note(
                    state,
                    song,
                    outputs,
                    instrument_number as usize - 1,
                    note,
                    ctx.volume as u8,
                    track,
                    true,
                );
                if let Some(instrument) = resolve_instrument(song, instrument_number as usize - 1) {
                    // No hold override means the instrument's own hold
                    let hold = if ctx.hold == -1 {
                        instrument.hold() as i32
                    } else {
                        ctx.hold
                    };
                    let status = &mut state.track_statuses[track];
                    status.hold = if hold == 0 { -1 } else { hold as i16 };
                    // Commands ate the volume: halt the arpeggio too
                    if had_volume && ctx.volume == 0 {
                        status.arpeggio_line = -1;
                    }
                }
            }
        }

        // No new note, but restating the instrument extends a held note
        if tick == 0 && note == 0 && cell_instrument > 0 && state.track_statuses[track].hold >= 0 {
            if let Some(instrument) = resolve_instrument(song, cell_instrument as usize - 1) {
                if instrument.midi_interface() == state.track_statuses[track].midi_interface as i32
                {
                    state.track_statuses[track].hold += instrument.hold() as i16;
                }
            }
        }
    }

    /// Resolve one (command, value) pair on the current tick into MIDI side
    /// effects and state updates.
    #[allow(clippy::too_many_arguments)]
    fn handle_command(
        &self,
        state: &mut EngineState,
        song: &mut Song,
        outputs: &[Arc<dyn MidiOutput>],
        track: usize,
        note: u8,
        instrument: u8,
        command: u8,
        value: u8,
        ctx: &mut CommandContext,
    ) {
        if command == 0 && value == 0 {
            return;
        }

        let ticks_per_line = song.ticks_per_line();
        let tick = state.tick;

        // The cell's instrument picks the MIDI destination; otherwise
        // whatever the track last played on
        let (midi_interface, midi_channel): (i32, i16) = if instrument != 0 {
            match resolve_instrument(song, instrument as usize - 1) {
                Some(instr) => (instr.midi_interface(), instr.midi_channel() as i16),
                None => {
                    let status = &state.track_statuses[track];
                    (status.midi_interface as i32, status.midi_channel)
                }
            }
        } else {
            let status = &state.track_statuses[track];
            (status.midi_interface as i32, status.midi_channel)
        };

        // Unknown interfaces route to the null output
        let interface = if midi_interface >= 0 {
            midi_interface as usize
        } else {
            0
        };
        let output = output_at(outputs, interface);

        // Substitute the previous command if asked to
        let command = if command == commands::PREVIOUS_COMMAND_VALUE {
            if value != 0 {
                state.track_statuses[track].previous_command
            } else {
                command
            }
        } else {
            state.track_statuses[track].previous_command = command;
            command
        };

        match command {
            commands::PITCH_WHEEL => {
                if midi_channel != -1 {
                    let channel = channel_of(midi_channel);
                    continuous_controller(
                        &mut state.controller_values,
                        interface,
                        channel,
                        SLOT_PITCH_WHEEL,
                        value,
                        tick,
                        ticks_per_line,
                        |v| output.pitch_wheel(channel, v),
                    );
                }
            }
            commands::PROGRAM_CHANGE => {
                if midi_channel != -1 && tick == 0 {
                    output.program_change(channel_of(midi_channel), value & 0x7f);
                }
            }
            commands::END_BLOCK => {
                // Takes effect at the line boundary
                if tick == ticks_per_line - 1 {
                    state.post_command = commands::END_BLOCK;
                    state.post_value = value;
                }
            }
            commands::PLAYSEQ_POSITION => {
                if tick == ticks_per_line - 1 {
                    state.post_command = commands::PLAYSEQ_POSITION;
                    state.post_value = value;
                }
            }
            commands::SEND_MESSAGE => {
                if tick == 0 {
                    if let Some(message) = song.message(value as usize) {
                        output.write_raw(message.data());
                    }
                }
            }
            commands::HOLD => {
                ctx.hold = value as i32;
            }
            commands::RETRIGGER => {
                ctx.delay = ((value & 0xf0) >> 4) as i32;
                ctx.repeat = (value & 0x0f) as i32;
            }
            commands::DELAY => {
                ctx.delay = value as i32;
                ctx.repeat = -1;
            }
            commands::VELOCITY => {
                if note != 0 {
                    ctx.volume = value as i32;
                    if midi_channel != -1 {
                        state.controller_values.set(
                            interface,
                            channel_of(midi_channel) as usize,
                            SLOT_AFTERTOUCH,
                            value,
                        );
                    }
                } else {
                    // Aftertouch for the sounding note; zero stops it
                    let status_channel = state.track_statuses[track].midi_channel;
                    if status_channel != -1 {
                        let channel = channel_of(status_channel);
                        let sounding = state.track_statuses[track].note;
                        if value < 0x80 {
                            if tick == 0 {
                                if value > 0 {
                                    output.aftertouch(channel, sounding as u8, value);
                                    state.controller_values.set(
                                        interface,
                                        channel as usize,
                                        SLOT_AFTERTOUCH,
                                        value,
                                    );
                                } else {
                                    output.note_off(channel, sounding as u8, 127);
                                    let status = &mut state.track_statuses[track];
                                    status.note = -1;
                                    status.arpeggio_line = -1;
                                }
                            }
                        } else {
                            let target = value - 0x80;
                            if tick < ticks_per_line - 1 {
                                let origin = state.controller_values.get(
                                    interface,
                                    channel as usize,
                                    SLOT_AFTERTOUCH,
                                );
                                output.aftertouch(
                                    channel,
                                    sounding as u8,
                                    interpolated(origin, target, tick, ticks_per_line),
                                );
                            } else {
                                output.aftertouch(channel, sounding as u8, target);
                                state.controller_values.set(
                                    interface,
                                    channel as usize,
                                    SLOT_AFTERTOUCH,
                                    target,
                                );
                            }
                        }
                    }
                }
            }
            commands::CHANNEL_PRESSURE => {
                if midi_channel != -1 {
                    let channel = channel_of(midi_channel);
                    continuous_controller(
                        &mut state.controller_values,
                        interface,
                        channel,
                        SLOT_CHANNEL_PRESSURE,
                        value,
                        tick,
                        ticks_per_line,
                        |v| output.channel_pressure(channel, v),
                    );
                }
            }
            commands::TICKS_PER_LINE => {
                if value == 0 {
                    // A zero value stops playback at the line boundary
                    if tick == ticks_per_line - 1 {
                        state.post_command = commands::TICKS_PER_LINE;
                    }
                } else {
                    song.set_ticks_per_line(value as u32);
                }
            }
            commands::TEMPO => {
                if value == 0 {
                    if tick == ticks_per_line - 1 {
                        state.post_command = commands::TEMPO;
                    }
                } else {
                    song.set_tempo(value as u32);
                    output.tempo(value as u32);
                }
            }
            commands::TRACK_VOLUME => {
                if value < 0x80 {
                    if tick == 0 {
                        song.track_mut(track).set_volume(value);
                    }
                } else {
                    let target = value - 0x80;
                    if tick < ticks_per_line - 1 {
                        let current = song.track(track).volume();
                        let delta = (target as f32 - current as f32) / ticks_per_line as f32;
                        song.track_mut(track)
                            .set_volume((current as f32 + (tick + 1) as f32 * delta) as u8);
                    } else {
                        song.track_mut(track).set_volume(target);
                    }
                }
            }
            commands::INSTRUMENT_VOLUME => {
                let target_instrument: i32 = if instrument != 0 {
                    instrument as i32 - 1
                } else {
                    state.track_statuses[track].instrument as i32
                };
                if target_instrument >= 0 {
                    let track_volume = song.track(track).volume();
                    if let Some(instr) = song.instrument_mut(target_instrument as usize) {
                        if value < 0x80 {
                            if tick == 0 {
                                instr.set_default_velocity(value);
                            }
                        } else {
                            let target = value - 0x80;
                            if tick < ticks_per_line - 1 {
                                let delta = (target as f32 - instr.default_velocity() as f32)
                                    / ticks_per_line as f32;
                                // The ramp rises from the track volume, not
                                // the instrument's own velocity
                                instr.set_default_velocity(
                                    (track_volume as f32 + (tick + 1) as f32 * delta) as u8,
                                );
                            } else {
                                instr.set_default_velocity(target);
                            }
                        }
                    }
                }
            }
            command if command >= commands::MIDI_CONTROLLERS => {
                if midi_channel != -1 {
                    let controller = command - commands::MIDI_CONTROLLERS;
                    let channel = channel_of(midi_channel);
                    continuous_controller(
                        &mut state.controller_values,
                        interface,
                        channel,
                        controller as usize,
                        value,
                        tick,
                        ticks_per_line,
                        |v| output.controller(channel, controller, v),
                    );
                }
            }
            _ => {}
        }
    }

    /// Play a note on a track: stop the old note, resolve the velocity from
    /// the instrument, cell, track and master volumes, and queue or emit the
    /// note-on.
    #[allow(clippy::too_many_arguments)]
    fn play_note(
        &self,
        state: &mut EngineState,
        song: &Song,
        outputs: &[Arc<dyn MidiOutput>],
        instrument_number: usize,
        note: u8,
        volume: u8,
        track: usize,
        postpone: bool,
    ) {
        // Muted and non-solo tracks stay silent
        if song.track(track).is_muted() || (state.solo && !song.track(track).is_solo()) {
            return;
        }

        // Stop whatever the track is still sounding
        {
            let status = &mut state.track_statuses[track];
            if status.note != -1 {
                let interface = interface_index(status.midi_interface);
                let channel = channel_of(status.midi_channel);
                let old_note = status.note as u8;
                status.note = -1;
                output_at(outputs, interface).note_off(channel, old_note, 127);
            }
        }

        let Some(instrument) = resolve_instrument(song, instrument_number) else {
            return;
        };

        let mut velocity: i32 = instrument.default_velocity() as i32 * volume as i32 / 127
            * song.track(track).volume() as i32
            / 127
            * song.master_volume() as i32
            / 127;
        // Signed wraparound reads as "as loud as possible"
        if velocity < 0 {
            velocity = 127;
        }

        let midi_channel = instrument.midi_channel() as i16;
        let midi_interface = instrument.midi_interface();
        let instrument_hold = instrument.hold();
        let transpose = instrument.transpose();

        let status = &mut state.track_statuses[track];
        status.instrument = instrument_number as i16;
        status.volume = velocity as i16;
        status.midi_channel = midi_channel;
        status.midi_interface = midi_interface as i16;
        status.hold = if instrument_hold > 0 {
            instrument_hold as i16
        } else {
            -1
        };

        if velocity != 0 {
            status.note = note as i16 + transpose as i16;
            let note_on = NoteOn {
                interface: status.midi_interface,
                channel: status.midi_channel,
                note: status.note,
                velocity: velocity as i16,
            };
            if postpone {
                state.postponed_notes.push(note_on);
            } else {
                output_at(outputs, interface_index(note_on.interface)).note_on(
                    channel_of(note_on.channel),
                    note_on.note as u8,
                    note_on.velocity as u8,
                );
            }
        } else {
            status.note = -1;
        }
    }
}

/// The playback engine's control surface. Owns the song, the worker thread
/// and all running state.
pub struct Player {
    song: Arc<SongLock>,
    outputs: Arc<OutputSet>,
    shared: Arc<Shared>,
    notifier: Notifier,
    scheduler: Arc<Mutex<Option<Box<dyn Scheduler>>>>,
    worker: Option<JoinHandle<()>>,
}

impl Player {
    /// Create a player over a song. The song is normalised so every cursor
    /// has somewhere valid to point.
    pub fn new(song: Song, outputs: Arc<OutputSet>) -> Self {
        let mut song = song;
        song.normalize();
        let player = Self {
            song: Arc::new(SongLock::new(song)),
            outputs,
            shared: Arc::new(Shared {
                state: Mutex::new(EngineState::new()),
                sync_wakeup: Condvar::new(),
            }),
            notifier: Notifier::new(),
            scheduler: Arc::new(Mutex::new(None)),
            worker: None,
        };
        player.init_song();
        player
    }

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The shared song. Editors lock it while mutating score structure.
    pub fn song(&self) -> &Arc<SongLock> {
        &self.song
    }

    pub fn outputs(&self) -> &Arc<OutputSet> {
        &self.outputs
    }

    /// Subscribe to engine state-change notifications.
    pub fn subscribe(&self) -> Receiver<StateEvent> {
        self.notifier.subscribe()
    }

    /// Replace the song and reset the engine to its beginning.
    pub fn set_song(&mut self, song: Song) {
        self.stop();
        {
            let mut current = self.song.lock();
            *current = song;
            current.normalize();
        }
        self.init_song();
    }

    fn init_song(&self) {
        self.remap_midi_outputs();
        self.check_solo();

        {
            let mut state = self.lock_state();
            state.section = 0;
            state.playseq = 0;
            state.position = 0;
            state.block = 0;
            state.line = 0;
        }

        // Send messages marked to be autosent
        {
            let song = self.song.lock();
            let outputs = self.outputs.snapshot();
            for number in 0..song.messages() {
                if let Some(message) = song.message(number) {
                    if message.is_auto_send() {
                        for output in &outputs {
                            output.write_raw(message.data());
                        }
                    }
                }
            }
        }

        self.notifier.notify(StateChange::Song);
        let mut state = self.lock_state();
        let song = self.song.lock();
        update_location(&mut state, &song, &self.notifier, true);
    }

    /// Install the scheduler used for self-paced playback. `None` runs the
    /// engine as fast as possible. Must be called while stopped.
    pub fn set_scheduler(&self, scheduler: Option<Box<dyn Scheduler>>) {
        *self
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = scheduler;
    }

    /// Make the engine stop when the song wraps around.
    pub fn set_kill_when_looped(&self, kill_when_looped: bool) {
        self.lock_state().kill_when_looped = kill_when_looped;
    }

    /// Switch the pacing source. Dropping out of external sync wakes the
    /// engine so it can pick up its scheduler again.
    pub fn set_external_sync(&self, sync_mode: ExternalSync) {
        let previous = {
            let mut state = self.lock_state();
            let previous = state.sync_mode;
            state.sync_mode = sync_mode;
            previous
        };
        if sync_mode == ExternalSync::Off && previous != ExternalSync::Off {
            self.external_sync(0);
        }
    }

    /// Add external tick credits and wake the engine. Credits are ignored
    /// while idle.
    pub fn external_sync(&self, ticks: u32) {
        {
            let mut state = self.lock_state();
            if state.mode != Mode::Idle {
                state.external_sync_ticks += ticks;
            }
        }
        self.shared.sync_wakeup.notify_all();
    }

    /// Start playback. `cont` keeps the cursor where it is instead of
    /// rewinding.
    pub fn play(&mut self, mode: Mode, cont: bool) {
        self.stop();

        let old_mode;
        let old_line;
        let line_now;
        {
            let mut state = self.lock_state();
            old_mode = state.mode;
            old_line = state.line;
            state.mode = mode;
            state.tick = 0;
            state.ticks_so_far = 0;
            state.kill = false;

            match mode {
                Mode::PlaySong => {
                    if !cont {
                        state.section = 0;
                        state.position = 0;
                        state.line = 0;
                    }
                    let song = self.song.lock();
                    update_location(&mut state, &song, &self.notifier, true);
                }
                Mode::PlayBlock => {
                    if !cont {
                        state.line = 0;
                    }
                }
                Mode::Idle => {}
            }
            line_now = state.line;

            // Start the play-time clock
            state.playing_started = Instant::now();
            if !cont {
                state.played_so_far = Duration::ZERO;
            }
        }

        if line_now != old_line {
            self.notifier.notify(StateChange::Line(line_now));
        }

        // MIDI start/continue goes out when the song wants sync
        if mode != Mode::Idle && self.song.lock().send_sync() {
            for output in self.outputs.snapshot() {
                if cont {
                    output.cont();
                } else {
                    output.start();
                }
            }
        }

        let worker = Worker {
            song: Arc::clone(&self.song),
            outputs: Arc::clone(&self.outputs),
            shared: Arc::clone(&self.shared),
            notifier: self.notifier.clone(),
            scheduler: Arc::clone(&self.scheduler),
        };
        self.worker = Some(thread::spawn(move || worker.run()));

        if mode != old_mode {
            self.notifier.notify(StateChange::Mode(mode));
        }
    }

    pub fn play_song(&mut self) {
        self.play(Mode::PlaySong, false);
    }

    pub fn play_block(&mut self) {
        self.play(Mode::PlayBlock, false);
    }

    pub fn continue_song(&mut self) {
        self.play(Mode::PlaySong, true);
    }

    pub fn continue_block(&mut self) {
        self.play(Mode::PlayBlock, true);
    }

    /// Stop playback and wait for the engine thread to finish. On a player
    /// that is not running this just silences hanging notes.
    pub fn stop(&mut self) {
        let was_playing = {
            let mut state = self.lock_state();
            let was_playing = state.mode != Mode::Idle;
            state.mode = Mode::Idle;
            was_playing
        };
        if was_playing {
            self.notifier.notify(StateChange::Mode(Mode::Idle));
        }

        if let Some(handle) = self.worker.take() {
            self.lock_state().kill = true;
            // Unblock an external-sync wait
            self.shared.sync_wakeup.notify_all();

            if self.song.lock().send_sync() {
                for output in self.outputs.snapshot() {
                    output.stop();
                }
            }

            let _ = handle.join();
            self.lock_state().kill = false;
        } else {
            self.stop_notes();
        }
    }

    /// Run the whole song synchronously with no pacing, for SMF export.
    /// Every instrument is forced onto output 0 so a buffer sink there
    /// catches the entire song; the tempo is announced to it first.
    pub fn play_without_scheduling(&mut self) {
        self.stop();
        self.set_scheduler(None);
        {
            let mut state = self.lock_state();
            state.mode = Mode::PlaySong;
            state.kill_when_looped = true;
            state.kill = false;

            let mut song = self.song.lock();
            for number in 0..song.instruments() {
                if let Some(instrument) = song.instrument_mut(number) {
                    instrument.set_midi_interface(0);
                }
            }
            self.outputs.get(0).tempo(song.tempo());
        }

        let worker = Worker {
            song: Arc::clone(&self.song),
            outputs: Arc::clone(&self.outputs),
            shared: Arc::clone(&self.shared),
            notifier: self.notifier.clone(),
            scheduler: Arc::clone(&self.scheduler),
        };
        worker.run();
        self.stop_notes();
    }

    /// Whether the engine thread is still alive.
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    // --- Cursor and state access ---

    pub fn mode(&self) -> Mode {
        self.lock_state().mode
    }

    pub fn section(&self) -> usize {
        self.lock_state().section
    }

    pub fn playseq(&self) -> usize {
        self.lock_state().playseq
    }

    pub fn position(&self) -> usize {
        self.lock_state().position
    }

    pub fn block(&self) -> usize {
        self.lock_state().block
    }

    pub fn line(&self) -> usize {
        self.lock_state().line
    }

    pub fn tick(&self) -> u32 {
        self.lock_state().tick
    }

    /// Ticks processed since the current run started.
    pub fn ticks_so_far(&self) -> u64 {
        self.lock_state().ticks_so_far
    }

    /// Move the section cursor, clamped to the song. Publishes the resulting
    /// value even when nothing moved.
    pub fn set_section(&self, section: i32) {
        let section = {
            let mut state = self.lock_state();
            let song = self.song.lock();
            let last = song.sections().saturating_sub(1) as i32;
            let section = section.clamp(0, last) as usize;
            state.section = section;
            section
        };
        self.notifier.notify(StateChange::Section(section));
    }

    /// Move the playseq cursor, clamped, then re-clamp the position into it.
    pub fn set_playseq(&self, playseq: i32) {
        let (playseq, position) = {
            let mut state = self.lock_state();
            let song = self.song.lock();
            let last = song.playseqs().saturating_sub(1) as i32;
            let playseq = playseq.clamp(0, last) as usize;
            state.playseq = playseq;
            (playseq, state.position as i32)
        };
        self.notifier.notify(StateChange::Playseq(playseq));
        self.set_position(position);
    }

    /// Move the position cursor, clamped to the current playseq.
    pub fn set_position(&self, position: i32) {
        let position = {
            let mut state = self.lock_state();
            let song = self.song.lock();
            let last = song.playseq(state.playseq).length().saturating_sub(1) as i32;
            let position = position.clamp(0, last) as usize;
            state.position = position;
            position
        };
        self.notifier.notify(StateChange::Position(position));
    }

    /// Move the block cursor, clamped to the song.
    pub fn set_block(&self, block: i32) {
        let block = {
            let mut state = self.lock_state();
            let song = self.song.lock();
            let last = song.blocks().saturating_sub(1) as i32;
            let block = block.clamp(0, last) as usize;
            state.block = block;
            block
        };
        self.notifier.notify(StateChange::Block(block));
    }

    /// Move the line cursor, clamped to the current block.
    pub fn set_line(&self, line: i32) {
        let line = {
            let mut state = self.lock_state();
            let song = self.song.lock();
            let length = song.block(state.block).map_or(1, |b| b.length()) as i32;
            let line = line.clamp(0, length - 1) as usize;
            state.line = line;
            line
        };
        self.notifier.notify(StateChange::Line(line));
    }

    /// Move the sub-line tick cursor, clamped to the ticks-per-line range.
    pub fn set_tick(&self, tick: i32) {
        let mut state = self.lock_state();
        let song = self.song.lock();
        let last = song.ticks_per_line().saturating_sub(1) as i32;
        state.tick = tick.clamp(0, last) as u32;
    }

    // --- Note and output control ---

    /// Silence every sounding note and reset all track state.
    pub fn stop_notes(&self) {
        let mut state = self.lock_state();
        let outputs = self.outputs.snapshot();
        stop_notes_with(&mut state, &outputs);
    }

    /// Silence tracks that are muted, or non-solo while solo is active.
    pub fn stop_muted(&self) {
        let mut state = self.lock_state();
        let song = self.song.lock();
        let outputs = self.outputs.snapshot();
        let solo = state.solo;
        for status in &mut state.track_statuses {
            let track = status.track;
            if song.track(track).is_muted() || (solo && !song.track(track).is_solo()) {
                if status.note != -1 {
                    output_at(&outputs, interface_index(status.midi_interface)).note_off(
                        channel_of(status.midi_channel),
                        status.note as u8,
                        127,
                    );
                }
                status.reset();
            }
        }
    }

    /// Hard panic button: note-off for every note on every channel of every
    /// output.
    pub fn stop_all_notes(&self) {
        let outputs = self.outputs.snapshot();
        for channel in 0..16u8 {
            for note in 0..128u8 {
                for output in &outputs {
                    output.note_off(channel, note, 127);
                }
            }
        }
    }

    /// Centre the pitch wheel on every channel of every output.
    pub fn reset_pitch(&self) {
        let outputs = self.outputs.snapshot();
        for channel in 0..16u8 {
            for output in &outputs {
                output.pitch_wheel(channel, 64);
            }
        }
    }

    /// Recompute the solo summary flag from the song's tracks.
    pub fn check_solo(&self) {
        let mut state = self.lock_state();
        let song = self.song.lock();
        state.solo = (0..song.max_tracks()).any(|track| song.track(track).is_solo());
    }

    /// Re-resolve every instrument's output index from its saved interface
    /// name (-1 when unresolved) and resize the running caches to the
    /// current output set.
    pub fn remap_midi_outputs(&self) {
        let mut state = self.lock_state();
        let mut song = self.song.lock();

        for number in 0..song.instruments() {
            let index = song
                .instrument(number)
                .and_then(|i| self.outputs.index_by_name(i.midi_interface_name()))
                .map(|i| i as i32)
                .unwrap_or(-1);
            if let Some(instrument) = song.instrument_mut(number) {
                instrument.set_midi_interface(index);
            }
        }

        let max_tracks = song.max_tracks();
        state.ensure_track_statuses(max_tracks);
        state.controller_values.resize(self.outputs.count());
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.stop();
    }
}
