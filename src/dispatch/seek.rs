//! Silent event handler used for song length and seek-by-time
//!
//! Walks the song under `OrderRowTrack` without touching any synthesiser,
//! accumulating elapsed time. Seeking stops the traversal at the first event
//! at or past the target time; the returned position is then used to resume
//! live playback after a silent state reset.

use std::collections::HashMap;

use super::{EventDispatcher, EventHandler, EventOrder, JumpControl, Position};
use crate::error::Result;
use crate::model::{ConfigurationEvent, Effect, GotoEvent, Music};
use crate::tempo::Tempo;

/// Sound-free handler measuring elapsed time through a song
pub struct SeekHandler {
    loop_count: u32,
    us_target: f64,
    us_total: f64,
    us_per_tick: f64,
    tempo: Tempo,
    /// Times each goto event has been actioned, keyed by its cell
    goto_counts: HashMap<(usize, usize, GotoEvent), u32>,
}

impl SeekHandler {
    /// Prepare to examine a song
    ///
    /// `loop_count` is the number of times the song plays (1 = once). Zero
    /// means loop forever, which is treated as playing once so that length
    /// calculation terminates.
    pub fn new(music: &Music, loop_count: u32) -> Self {
        SeekHandler {
            loop_count: loop_count.max(1),
            us_target: f64::INFINITY,
            us_total: 0.0,
            us_per_tick: music.initial_tempo.us_per_tick,
            tempo: music.initial_tempo.clone(),
            goto_counts: HashMap::new(),
        }
    }

    /// Total length of the song in milliseconds
    pub fn total_length(&mut self, music: &Music) -> Result<u64> {
        self.us_target = f64::INFINITY;
        self.us_total = 0.0;
        self.us_per_tick = music.initial_tempo.us_per_tick;
        let loops = self.loop_count;
        EventDispatcher::new(music).handle_all_events(EventOrder::OrderRowTrack, self, loops)?;
        Ok((self.us_total / 1000.0) as u64)
    }

    /// Find the position of a moment in time
    ///
    /// Returns the position actually reached together with the tempo in
    /// effect there. Seeking is done to row granularity, so the reached time
    /// may differ from the target by a few milliseconds.
    pub fn seek_to(&mut self, music: &Music, ms_target: u64) -> Result<(Position, Tempo)> {
        self.us_target = ms_target as f64 * 1000.0;
        self.us_total = 0.0;
        self.us_per_tick = music.initial_tempo.us_per_tick;
        let loops = self.loop_count;
        let pos =
            EventDispatcher::new(music).handle_all_events(EventOrder::OrderRowTrack, self, loops)?;
        Ok((pos, self.tempo.clone()))
    }

    fn advance(&mut self, delay: u32) -> bool {
        self.us_total += delay as f64 * self.us_per_tick;
        self.us_total < self.us_target
    }
}

impl EventHandler for SeekHandler {
    fn end_of_pattern(&mut self, delay: u32) {
        self.us_total += delay as f64 * self.us_per_tick;
    }

    fn tempo_event(&mut self, delay: u32, _: usize, _: usize, tempo: &Tempo) -> Result<bool> {
        // The delay runs at the old tempo; the new one applies afterwards
        let keep = self.advance(delay);
        self.us_per_tick = tempo.us_per_tick;
        self.tempo = tempo.clone();
        Ok(keep)
    }

    fn note_on(
        &mut self,
        delay: u32,
        _: usize,
        _: usize,
        _: usize,
        _: u32,
        _: Option<u8>,
    ) -> Result<bool> {
        Ok(self.advance(delay))
    }

    fn note_off(&mut self, delay: u32, _: usize, _: usize) -> Result<bool> {
        Ok(self.advance(delay))
    }

    fn effect(&mut self, delay: u32, _: usize, _: usize, _: &Effect) -> Result<bool> {
        Ok(self.advance(delay))
    }

    fn goto_event(
        &mut self,
        delay: u32,
        track_index: usize,
        pattern_index: usize,
        ev: &GotoEvent,
        jump: &mut JumpControl,
    ) -> Result<bool> {
        let keep = self.advance(delay);
        let count = self
            .goto_counts
            .entry((pattern_index, track_index, *ev))
            .or_insert(0);
        if *count <= ev.repeat {
            *count += 1;
            jump.perform_goto(ev);
        }
        Ok(keep)
    }

    fn configuration(
        &mut self,
        delay: u32,
        _: usize,
        _: usize,
        _: &ConfigurationEvent,
    ) -> Result<bool> {
        Ok(self.advance(delay))
    }
}
