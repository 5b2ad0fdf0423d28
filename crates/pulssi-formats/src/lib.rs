//! Song file formats for the pulssi tracker.
//!
//! Loads and saves the native XML song format, imports legacy `MMD0/1/2`
//! modules, and frames the engine's export output as a Standard MIDI File.

mod mmd_format;
mod smf_format;
mod xml_format;

pub use mmd_format::{is_mmd, load_mmd};
pub use smf_format::song_to_smf;
pub use xml_format::{load_song, save_song};

/// Error type for format parsing.
#[derive(Debug)]
pub enum FormatError {
    /// Invalid file header or magic bytes
    InvalidHeader,
    /// Unexpected end of file
    UnexpectedEof,
    /// Unsupported format version
    UnsupportedVersion,
    /// XML syntax error
    Xml(String),
    /// Structurally broken document
    Malformed(String),
}

impl std::fmt::Display for FormatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FormatError::InvalidHeader => write!(f, "Invalid file header"),
            FormatError::UnexpectedEof => write!(f, "Unexpected end of file"),
            FormatError::UnsupportedVersion => write!(f, "Unsupported format version"),
            FormatError::Xml(msg) => write!(f, "XML error: {}", msg),
            FormatError::Malformed(msg) => write!(f, "Malformed song: {}", msg),
        }
    }
}

impl std::error::Error for FormatError {}

impl From<quick_xml::Error> for FormatError {
    fn from(error: quick_xml::Error) -> Self {
        FormatError::Xml(error.to_string())
    }
}
