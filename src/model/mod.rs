//! In-memory song model shared by every format codec and synthesiser
//!
//! A [`Music`] aggregates a [`PatchBank`], per-track channel bindings, a list
//! of patterns and the order they play in. Format readers populate it, format
//! writers and the playback layer consume it through the event dispatcher.

mod attributes;
mod events;
mod music;
mod patch;

pub use attributes::{Attribute, AttributeKind, Metadata};
pub use events::{ConfigurationEvent, Effect, Event, GotoEvent, GotoKind, Pattern, Track, TrackEvent};
pub use music::{ChannelType, Music, TrackInfo};
pub use patch::{
    MidiPatch, OplOperator, OplPatch, Patch, PatchBank, PatchKind, PcmPatch, Rhythm, MIDI_PATCHES,
};
