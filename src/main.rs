//! pulssi CLI — headless song playback and SMF export.
//!
//! Usage:
//!   pulssi song.xml
//!   pulssi song.mmd --port "Synth"
//!   pulssi song.xml --export out.mid
//!   pulssi --list-ports

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use std::{env, fs, process, thread};

use pulssi_engine::{Player, StateChange, TimerScheduler};
use pulssi_formats::{is_mmd, load_mmd, load_song, song_to_smf, FormatError};
use pulssi_midi::{MidiOutput, MidirOutput, OutputSet};
use pulssi_score::Song;

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();

    if args.iter().any(|a| a == "--list-ports") {
        list_ports();
        return;
    }

    let path = args.get(1).unwrap_or_else(|| {
        eprintln!(
            "Usage: pulssi <song.xml|song.mmd> [--export out.mid] [--port NAME] [--list-ports]"
        );
        process::exit(1);
    });

    let export_path = args
        .iter()
        .position(|a| a == "--export")
        .and_then(|i| args.get(i + 1))
        .cloned();

    let port_name = args
        .iter()
        .position(|a| a == "--port")
        .and_then(|i| args.get(i + 1))
        .cloned();

    let data = fs::read(path).unwrap_or_else(|e| {
        eprintln!("Failed to read {}: {}", path, e);
        process::exit(1);
    });

    let song = load(&data).unwrap_or_else(|e| {
        eprintln!("Failed to parse {}: {}", path, e);
        process::exit(1);
    });

    println!("Song:     {}", song.name());
    println!(
        "Tempo:    {} BPM, {} ticks per line",
        song.tempo(),
        song.ticks_per_line()
    );
    println!("Blocks:   {}", song.blocks());
    println!("Sections: {}", song.sections());
    println!("Tracks:   {}", song.max_tracks());
    println!();

    match export_path {
        Some(export_path) => export(&song, &export_path),
        None => play(song, port_name),
    }
}

fn load(data: &[u8]) -> Result<Song, FormatError> {
    if is_mmd(data) {
        load_mmd(data)
    } else {
        load_song(&String::from_utf8_lossy(data))
    }
}

fn list_ports() {
    match MidirOutput::ports() {
        Ok(ports) if ports.is_empty() => println!("No MIDI output ports found."),
        Ok(ports) => {
            for port in ports {
                println!("{}", port);
            }
        }
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    }
}

fn export(song: &Song, path: &str) {
    println!("Exporting to {}...", path);
    let smf = song_to_smf(song);
    fs::write(path, &smf).unwrap_or_else(|e| {
        eprintln!("Failed to write {}: {}", path, e);
        process::exit(1);
    });
    println!("Wrote {} bytes.", smf.len());
}

fn play(song: Song, port_name: Option<String>) {
    let outputs = Arc::new(OutputSet::new());
    match port_name {
        Some(name) => match MidirOutput::connect(&name) {
            Ok(port) => {
                println!("Playing on {}.", port.name());
                outputs.add(Arc::new(port));
            }
            Err(e) => {
                eprintln!("{}", e);
                process::exit(1);
            }
        },
        None => println!("No --port given, playing on the null output."),
    }

    let mut player = Player::new(song, outputs);
    let notifications = player.subscribe();
    player.set_scheduler(Some(Box::new(TimerScheduler::new())));
    // Play the song through once rather than looping forever
    player.set_kill_when_looped(true);
    player.play_song();

    while player.is_running() {
        for event in notifications.try_iter() {
            if let StateChange::Line(line) = event.change {
                print!(
                    "\rSection: {:02} | Position: {:02} | Block: {:02} | Line: {:02}",
                    player.section(),
                    player.position(),
                    player.block(),
                    line
                );
                let _ = std::io::stdout().flush();
            }
        }
        thread::sleep(Duration::from_millis(10));
    }

    player.stop();
    println!("\nDone.");
}
