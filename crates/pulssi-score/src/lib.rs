//! Score data model for the pulssi tracker.
//!
//! This crate defines the in-memory song structure the playback engine
//! reads and format loaders populate: blocks of note/command cells, playing
//! sequences, sections, instruments, tracks and raw MIDI messages, plus the
//! advisory lock the engine holds over a whole tick.

mod block;
mod instrument;
mod message;
mod playseq;
mod song;
mod track;

pub use block::{Block, CommandCell, NoteCell};
pub use instrument::Instrument;
pub use message::Message;
pub use playseq::Playseq;
pub use song::{Song, SongLock};
pub use track::Track;
