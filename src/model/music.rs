//! Top-level in-memory representation of a song

use super::attributes::Metadata;
use super::events::Pattern;
use super::patch::PatchBank;
use crate::tempo::Tempo;

/// What type of channel a track plays through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    /// Track is allocated but produces no sound
    Unused,
    /// Placeholder: the track has not been bound to real hardware yet.
    ///
    /// Songs must have all `Any` tracks rebound to concrete channels before
    /// being passed to a format writer, so that individual writers need not
    /// perform channel mapping themselves.
    Any,
    /// OPL melodic channel
    Opl,
    /// OPL rhythm-mode percussion voice
    OplPerc,
    /// General MIDI channel
    Midi,
    /// PCM sample voice
    Pcm,
}

/// A track's channel binding, shared across all patterns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackInfo {
    /// What type of channel this track plays through
    pub channel_type: ChannelType,
    /// Channel index, interpreted according to `channel_type`:
    ///
    /// - `Opl`: 0-8 for chip 1, 9-17 for chip 2
    /// - `OplPerc`: 0 = hi-hat, 1 = top cymbal, 2 = tom-tom, 3 = snare,
    ///   4 = bass drum
    /// - `Midi`: 0-15, with 9 being percussion
    /// - `Pcm`: voice index starting at 0
    /// - `Any`: 0-255, placeholder only
    ///
    /// OPL rhythm mode occupies melodic channels 6-8, so a song must not play
    /// `Opl` events on those channels while `OplPerc` tracks are active.
    pub channel_index: usize,
}

/// In-memory representation of a single song
///
/// Assembled by a format reader or built programmatically. During playback it
/// is held behind a shared reference and treated as immutable; editing passes
/// such as [`crate::opl::opl_denormalise_perc`] run exclusively.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Music {
    /// All instruments used by the song
    pub patches: PatchBank,

    /// Channel allocation for every track.
    ///
    /// Every pattern has exactly as many tracks as there are entries here,
    /// and the allocation holds for all patterns.
    pub track_info: Vec<TrackInfo>,

    /// The song's patterns, referred to by index
    pub patterns: Vec<Pattern>,

    /// Which order the patterns play in; a value of 1 plays `patterns[1]`
    pub pattern_order: Vec<usize>,

    /// Index into `pattern_order` where playback resumes after the last
    /// entry, or `None` for no loop
    pub loop_dest: Option<usize>,

    /// Number of ticks in every track of every pattern
    pub ticks_per_track: u32,

    /// Song metadata (title, artist, comment)
    pub metadata: Metadata,

    /// The tempo the song starts with
    pub initial_tempo: Tempo,
}

impl Music {
    /// Index of the pattern played at the given order position
    pub fn pattern_at_order(&self, order_index: usize) -> Option<usize> {
        self.pattern_order.get(order_index).copied()
    }
}

impl Default for TrackInfo {
    fn default() -> Self {
        TrackInfo {
            channel_type: ChannelType::Unused,
            channel_index: 0,
        }
    }
}
