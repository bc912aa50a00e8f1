//! Shared handle for driving playback from an audio callback
//!
//! The audio thread calls [`SharedPlayback::mix`] while the UI thread seeks
//! or swaps songs; the internal lock serialises the mutating operations
//! against mixing, which is the contract `Playback` itself requires.

use std::sync::Arc;

use parking_lot::Mutex;

use super::{Playback, PlaybackPosition};
use crate::error::Result;
use crate::model::{Music, PatchBank};

/// Cloneable, thread-safe wrapper around a [`Playback`]
#[derive(Clone)]
pub struct SharedPlayback {
    inner: Arc<Mutex<Playback>>,
}

impl SharedPlayback {
    /// Wrap a playback helper for cross-thread use
    pub fn new(playback: Playback) -> Self {
        SharedPlayback {
            inner: Arc::new(Mutex::new(playback)),
        }
    }

    /// Synthesise into the caller's buffer; safe to call from the audio
    /// callback while another thread controls playback
    pub fn mix(&self, output: &mut [i16]) -> PlaybackPosition {
        self.inner.lock().mix(output)
    }

    /// Set the song to play
    pub fn set_song(&self, music: Arc<Music>) {
        self.inner.lock().set_song(music);
    }

    /// Set the MIDI translation patch bank
    pub fn set_bank_midi(&self, bank: Option<Arc<PatchBank>>) {
        self.inner.lock().set_bank_midi(bank);
    }

    /// Set the number of times the song should play
    pub fn set_loop_count(&self, count: u32) {
        self.inner.lock().set_loop_count(count);
    }

    /// Length of the current song in milliseconds
    pub fn length(&self) -> Result<u64> {
        self.inner.lock().length()
    }

    /// Jump to an order number
    pub fn seek_by_order(&self, dest_order: usize) {
        self.inner.lock().seek_by_order(dest_order);
    }

    /// Jump to a position in milliseconds; returns the position reached
    pub fn seek_by_time(&self, ms: u64) -> Result<u64> {
        self.inner.lock().seek_by_time(ms)
    }

    /// Run a closure with exclusive access to the playback state
    pub fn with<R>(&self, f: impl FnOnce(&mut Playback) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_is_cloneable_across_threads() {
        let shared = SharedPlayback::new(Playback::new(8000, 2));
        let other = shared.clone();
        let t = std::thread::spawn(move || {
            let mut buf = vec![0i16; 64];
            other.mix(&mut buf);
        });
        shared.set_loop_count(2);
        t.join().unwrap();
    }
}
