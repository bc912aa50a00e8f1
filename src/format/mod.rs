//! On-disk format codecs and autodetection
//!
//! Each supported file format implements [`MusicType`]: detection heuristics,
//! a reader producing the common [`Music`] model and a writer consuming it.
//! Formats with limited expressiveness surface
//! [`crate::Error::FormatLimitation`] rather than writing broken files.

mod dro;
mod imf;
mod opl_stream;

pub use dro::{DroDosboxV1, DRO_DOSBOX_V1};
pub use imf::{ImfIdSoftware, IMF_TYPE0, IMF_TYPE1, WLF_TYPE1};
pub use opl_stream::{OplDecoder, OplEncoder};

use std::collections::HashMap;
use std::io;

use bitflags::bitflags;

use crate::error::Result;
use crate::model::{Attribute, Music};

/// Confidence level when guessing a file format
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Certainty {
    /// Definitely not in this format
    DefinitelyNo,
    /// The checks were inconclusive, it could go either way
    Unsure,
    /// Everything checked out, but the format has no signature
    PossiblyYes,
    /// The format's signature matched
    DefinitelyYes,
}

bitflags! {
    /// Capability flags describing what a format can store
    ///
    /// Guidelines for warning about loss of fidelity before a conversion;
    /// writers still drop what they can and error (with
    /// [`crate::Error::FormatLimitation`]) on what they cannot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Caps: u32 {
        /// Can store OPL instruments
        const INST_OPL = 0x0001;
        /// Can store OPL rhythm-mode percussive instruments
        const INST_OPL_RHYTHM = 0x0002;
        /// Can store MIDI instruments
        const INST_MIDI = 0x0004;
        /// Can store sampled (PCM) instruments
        const INST_PCM = 0x0008;
        /// Song data (as opposed to a bare instrument bank)
        const HAS_EVENTS = 0x0020;
        /// Keeps patterns separate; if unset, patterns are flattened
        /// through the order list on write
        const HAS_PATTERNS = 0x0080;
        /// The loop destination can be stored
        const HAS_LOOP_DEST = 0x0100;
        /// Targets OPL2 hardware: 9 channels, or 6 plus percussion
        const HARDWARE_OPL2 = 0x0200;
        /// Targets OPL3 (or dual OPL2) hardware: 18 channels
        const HARDWARE_OPL3 = 0x0400;
    }
}

bitflags! {
    /// Flags affecting how a song is written out
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WriteFlags: u32 {
        /// Disable pitchbends
        const INTEGER_NOTES_ONLY = 0x01;
    }
}

/// Kinds of supplemental files a format may need alongside the song
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SuppKind {
    /// External instrument bank
    Instruments,
}

/// Opened supplemental data, keyed by kind
pub type SuppData = HashMap<SuppKind, Vec<u8>>;

/// Supplemental filenames required by a format
pub type SuppFilenames = HashMap<SuppKind, String>;

/// Interface to one music file format
pub trait MusicType: Sync {
    /// Short identifier, e.g. `"imf-idsoftware"`
    fn code(&self) -> &'static str;

    /// Human readable format name
    fn friendly_name(&self) -> &'static str;

    /// Known file extensions, without dots
    fn file_extensions(&self) -> &'static [&'static str];

    /// What this format can store
    fn caps(&self) -> Caps;

    /// Check whether the given file could be in this format
    ///
    /// Never fails; malformed content yields
    /// [`Certainty::DefinitelyNo`].
    fn is_instance(&self, content: &[u8]) -> Certainty;

    /// Read a song
    ///
    /// Recommended only after [`MusicType::is_instance`] returned better
    /// than `DefinitelyNo`, but a best effort is made regardless so files
    /// can be force-opened with a chosen handler.
    fn read(&self, content: &[u8], supps: &SuppData) -> Result<Music>;

    /// Write a song in this format
    fn write(
        &self,
        out: &mut dyn io::Write,
        supps: &SuppData,
        music: &Music,
        flags: WriteFlags,
    ) -> Result<()>;

    /// Supplemental files required to open the given content
    fn required_supps(&self, _content: Option<&[u8]>, _filename: &str) -> SuppFilenames {
        SuppFilenames::new()
    }

    /// Metadata fields this format can round-trip
    fn supported_attributes(&self) -> Vec<Attribute> {
        Vec::new()
    }
}

/// All built-in format handlers, in detection order
pub fn all_types() -> &'static [&'static dyn MusicType] {
    static TYPES: &[&dyn MusicType] = &[
        &dro::DRO_DOSBOX_V1,
        &imf::IMF_TYPE0,
        &imf::IMF_TYPE1,
        &imf::WLF_TYPE1,
    ];
    TYPES
}

/// Find a format handler by its code
pub fn by_code(code: &str) -> Option<&'static dyn MusicType> {
    all_types().iter().copied().find(|t| t.code() == code)
}

/// Pick the format handler for unidentified content
///
/// Preference order: the first `DefinitelyYes` wins outright and halts
/// further probing; otherwise the first `PossiblyYes`; otherwise the first
/// `Unsure`. Returns `None` when every handler says `DefinitelyNo`.
pub fn detect(content: &[u8]) -> Option<&'static dyn MusicType> {
    let mut possibly: Option<&'static dyn MusicType> = None;
    let mut unsure: Option<&'static dyn MusicType> = None;
    for &ty in all_types() {
        match ty.is_instance(content) {
            Certainty::DefinitelyYes => return Some(ty),
            Certainty::PossiblyYes => possibly = possibly.or(Some(ty)),
            Certainty::Unsure => unsure = unsure.or(Some(ty)),
            Certainty::DefinitelyNo => {}
        }
    }
    possibly.or(unsure)
}
