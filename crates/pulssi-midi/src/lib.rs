//! MIDI output sinks for the pulssi tracker.
//!
//! The engine emits through the [`MidiOutput`] trait; implementations here
//! cover discarding ([`NullOutput`]), buffering for SMF export
//! ([`BufferOutput`]) and real ports via midir ([`MidirOutput`]).
//! [`OutputSet`] is the shared registry the engine fans events out to.

mod buffer_output;
mod midir_output;
mod output_set;
mod traits;

pub use buffer_output::{read_varlen, write_varlen, BufferOutput};
pub use midir_output::MidirOutput;
pub use output_set::OutputSet;
pub use traits::{MidiError, MidiOutput, NullOutput};
