//! Music library for DOS-era games
//!
//! Vintage game music is stored as sequences of timed events (note-on,
//! note-off, tempo changes, effects, instrument setup) targeting OPL2/OPL3
//! FM chips, General MIDI devices or sampled PCM waveforms, in dozens of
//! game-specific on-disk formats. This crate abstracts them all into one
//! in-memory model and offers format autodetection, conversion between
//! formats, and real-time synthesis to a PCM buffer.
//!
//! # Features
//! - Tracker-style song model: patterns x tracks x events, with an order
//!   list and loop point
//! - Event dispatch under four traversal orders, with jump handling and a
//!   position/time cursor
//! - Event-to-OPL-register and event-to-MIDI conversion with redundancy
//!   elimination and delay coalescing
//! - Soft playback: embedded FM synthesis plus a PCM sample voicer, with
//!   seek-by-time and seek-by-order
//! - Format codecs (id Software IMF, DOSBox DRO) and detection gating
//! - WAV rendering of whole songs
//!
//! # Quick start
//! ```no_run
//! use gamemusic::format;
//! use gamemusic::playback::Playback;
//!
//! # fn main() -> gamemusic::Result<()> {
//! let data = std::fs::read("song.imf")?;
//! let ty = format::detect(&data).expect("unknown format");
//! let music = ty.read(&data, &Default::default())?;
//!
//! let mut playback = Playback::new(44100, 2);
//! playback.set_song(music.into());
//! let mut buffer = vec![0i16; 4096];
//! playback.mix(&mut buffer);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod error;

pub mod dispatch;
#[cfg(feature = "export-wav")]
pub mod export;
#[cfg(feature = "formats")]
pub mod format;
pub mod midi;
pub mod model;
pub mod opl;
#[cfg(feature = "playback")]
pub mod playback;
pub mod synth;
pub mod tempo;

pub use error::{Error, Result};
pub use model::Music;
pub use tempo::Tempo;
