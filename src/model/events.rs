//! Song events and their containers

use crate::tempo::Tempo;

/// Alter the way the current note sounds on a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Effect {
    /// Bend the playing note to a new frequency in milliHertz
    Pitchbend(u32),
    /// Change the playing note's volume; 0 = silent, 255 = loud
    Volume(u8),
}

/// Kind of playback jump performed by a [`GotoEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GotoKind {
    /// Stay on the current pattern but change row
    CurrentPattern,
    /// Jump to the next entry in the order list
    NextPattern,
    /// Jump to a specific entry in the order list
    SpecificOrder,
}

/// Change the way playback progresses through the order list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GotoEvent {
    /// Kind of jump
    pub kind: GotoKind,
    /// Number of times to repeat the jump after the first encounter;
    /// 0 = jump once then ignore the event on later passes
    pub repeat: u32,
    /// Target entry in the order list; only meaningful for
    /// [`GotoKind::SpecificOrder`]
    pub target_order: usize,
    /// Target row in the destination pattern, 0 = first row
    pub target_row: u32,
}

/// Configure a global synthesiser parameter
///
/// These events can occur at any time and apply chip-wide rather than to one
/// channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigurationEvent {
    /// No operation; can carry a trailing delay at the end of a song
    Empty,
    /// Switch OPL3 mode on or off (off = OPL2 compatibility)
    EnableOpl3(bool),
    /// Extend the range of the OPL tremolo on one chip
    EnableDeepTremolo {
        /// Which chip's register to change, 0 or 1
        chip: u8,
        /// New state
        enable: bool,
    },
    /// Extend the range of the OPL vibrato on one chip
    EnableDeepVibrato {
        /// Which chip's register to change, 0 or 1
        chip: u8,
        /// New state
        enable: bool,
    },
    /// Switch OPL rhythm (percussion) mode on or off
    EnableRhythm(bool),
    /// Allow use of the wave-select registers
    EnableWaveSel(bool),
}

/// A single song event
///
/// Events carry no timing of their own; the [`TrackEvent`] wrapper adds the
/// delay in ticks since the previous event on the same track.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Change the playback speed
    Tempo(Tempo),
    /// Start playing a note; only one note sounds per track at a time
    NoteOn {
        /// Index into the song's patch bank
        instrument: usize,
        /// Note frequency; 440000 = 440 Hz
        millihertz: u32,
        /// Velocity 0-255, or `None` to use the patch's default volume
        velocity: Option<u8>,
    },
    /// Silence the note playing on this track
    NoteOff,
    /// Modify the playing note
    Effect(Effect),
    /// Jump to another position in the song
    Goto(GotoEvent),
    /// Change a global synthesiser parameter
    Configuration(ConfigurationEvent),
}

/// One event positioned within a track
#[derive(Debug, Clone, PartialEq)]
pub struct TrackEvent {
    /// Ticks since the previous event on this track (not absolute time)
    pub delay: u32,
    /// The event itself
    pub event: Event,
}

/// A finite sequence of timed events on one channel
///
/// The sum of all delays must not exceed the song's `ticks_per_track`; a
/// trailing silent gap is implied by the pattern length rather than stored.
pub type Track = Vec<TrackEvent>;

/// A set of parallel tracks played together, one entry per [`super::TrackInfo`]
pub type Pattern = Vec<Track>;
