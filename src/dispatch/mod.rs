//! Event dispatch: walking a song and delivering events to a handler
//!
//! An [`EventHandler`] gets one callback per event variant plus end-of-track
//! and end-of-pattern markers, so downstream converters can flush trailing
//! silence. The [`EventDispatcher`] walks the song under one of four
//! [`EventOrder`] traversals, honours pattern jumps and keeps a
//! position/time cursor.

mod seek;

pub use seek::SeekHandler;

use crate::error::Result;
use crate::model::{ConfigurationEvent, Effect, Event, GotoEvent, GotoKind, Music, TrackEvent};
use crate::tempo::Tempo;

/// How to traverse a song's events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrder {
    /// All tracks of each pattern merged into one chronological stream,
    /// patterns visited in storage order (the order list is ignored).
    ///
    /// Events at the same tick are delivered note-offs first to minimise
    /// unnecessary polyphony. One `end_of_pattern` is issued per pattern.
    /// Best for single-track formats such as IMF or type-0 MIDI.
    PatternRowTrack,

    /// Each track processed in full before the next, patterns in storage
    /// order.
    ///
    /// `end_of_track` is issued between tracks and `end_of_pattern` after
    /// the last track. Best for type-1 MIDI style self-contained tracks.
    PatternTrackRow,

    /// Same merging as [`EventOrder::PatternRowTrack`] but following the
    /// order list, so a pattern may be visited several times. For targets
    /// with no concept of reusable patterns.
    OrderRowTrack,

    /// Same as [`EventOrder::PatternTrackRow`] but following the order list.
    OrderTrackRow,
}

/// Position within a song
///
/// Returned from [`EventDispatcher::handle_all_events`] so callers can learn
/// where processing stopped; the seek handler relies on this to resume
/// playback at the right row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Position {
    /// Index into the order list of the pattern being processed
    pub order_index: usize,
    /// Index into the pattern list pointed at by `order_index`
    pub pattern_index: usize,
    /// Order that will play after the current one finishes; may differ from
    /// `order_index + 1` after a goto event
    pub next_order_index: usize,
    /// Pattern index for `next_order_index`
    pub next_pattern_index: usize,
    /// First row processed in the current pattern; nonzero after a jump into
    /// the middle of a pattern
    pub start_row: u32,
    /// Current row, or the row of the last event processed
    pub row: u32,
    /// Number of complete passes over the song so far
    pub loops: u32,
    /// Microseconds from song start to the current position
    pub us: u64,
}

/// Dispatcher-owned slot for a jump requested by the handler
///
/// A goto event is not acted on by default; the handler's goto callback must
/// explicitly call [`JumpControl::perform_goto`] for the dispatcher to take
/// the jump before the next row. Skipping the call lets a handler see past a
/// jump to the end of the pattern, e.g. when drawing a song on screen.
#[derive(Debug, Default)]
pub struct JumpControl {
    pending: Option<GotoEvent>,
}

impl JumpControl {
    /// Request that the dispatcher action the given jump
    ///
    /// Counting repeats is the caller's job: a handler that wants a jump
    /// taken at most `ev.repeat + 1` times must track how often it has seen
    /// the event and stop calling this.
    pub fn perform_goto(&mut self, ev: &GotoEvent) {
        self.pending = Some(*ev);
    }

    fn take(&mut self) -> Option<GotoEvent> {
        self.pending.take()
    }
}

/// Callback interface for song events
///
/// Each callback returns `Ok(true)` to keep processing, `Ok(false)` to stop;
/// [`EventDispatcher::handle_all_events`] then returns the position reached.
/// Errors abort the traversal and propagate to the caller, which live
/// playback avoids by logging and dropping instead.
#[allow(unused_variables)]
pub trait EventHandler {
    /// End of one track reached (only in Track-Row traversals); `delay` is
    /// the remaining ticks of silence to the end of the track
    fn end_of_track(&mut self, delay: u32) {}

    /// End of a pattern reached; `delay` is the remaining ticks of silence
    /// to the end of the pattern
    fn end_of_pattern(&mut self, delay: u32) {}

    /// The tempo is changing. The delay is timed at the *old* tempo; the new
    /// tempo applies to subsequent delays.
    fn tempo_event(
        &mut self,
        delay: u32,
        track_index: usize,
        pattern_index: usize,
        tempo: &Tempo,
    ) -> Result<bool>;

    /// A note starts playing
    fn note_on(
        &mut self,
        delay: u32,
        track_index: usize,
        pattern_index: usize,
        instrument: usize,
        millihertz: u32,
        velocity: Option<u8>,
    ) -> Result<bool>;

    /// The note on this track stops playing
    fn note_off(&mut self, delay: u32, track_index: usize, pattern_index: usize) -> Result<bool>;

    /// An effect is applied to the playing note
    fn effect(
        &mut self,
        delay: u32,
        track_index: usize,
        pattern_index: usize,
        effect: &Effect,
    ) -> Result<bool>;

    /// A jump is requested; call [`JumpControl::perform_goto`] to take it
    fn goto_event(
        &mut self,
        delay: u32,
        track_index: usize,
        pattern_index: usize,
        ev: &GotoEvent,
        jump: &mut JumpControl,
    ) -> Result<bool>;

    /// A global synthesiser parameter changes
    fn configuration(
        &mut self,
        delay: u32,
        track_index: usize,
        pattern_index: usize,
        ev: &ConfigurationEvent,
    ) -> Result<bool>;
}

/// Deliver one event to the matching handler callback
pub fn deliver(
    handler: &mut dyn EventHandler,
    delay: u32,
    track_index: usize,
    pattern_index: usize,
    event: &Event,
    jump: &mut JumpControl,
) -> Result<bool> {
    match event {
        Event::Tempo(tempo) => handler.tempo_event(delay, track_index, pattern_index, tempo),
        Event::NoteOn {
            instrument,
            millihertz,
            velocity,
        } => handler.note_on(
            delay,
            track_index,
            pattern_index,
            *instrument,
            *millihertz,
            *velocity,
        ),
        Event::NoteOff => handler.note_off(delay, track_index, pattern_index),
        Event::Effect(effect) => handler.effect(delay, track_index, pattern_index, effect),
        Event::Goto(ev) => handler.goto_event(delay, track_index, pattern_index, ev, jump),
        Event::Configuration(ev) => handler.configuration(delay, track_index, pattern_index, ev),
    }
}

/// Outcome of processing one pattern
enum PatternOutcome {
    /// Ran to the end of the pattern
    Completed,
    /// A handler callback returned false
    Stopped,
    /// A pending jump was actioned at a row boundary
    Jump(GotoEvent),
}

/// Walks a [`Music`] and feeds its events to an [`EventHandler`]
pub struct EventDispatcher<'m> {
    music: &'m Music,
    tempo: Tempo,
    jump: JumpControl,
}

impl<'m> EventDispatcher<'m> {
    /// Create a dispatcher over the given song
    pub fn new(music: &'m Music) -> Self {
        EventDispatcher {
            tempo: music.initial_tempo.clone(),
            music,
            jump: JumpControl::default(),
        }
    }

    /// The tempo in effect at the current position
    pub fn tempo(&self) -> &Tempo {
        &self.tempo
    }

    /// Process every event in the song
    ///
    /// `target_loop_count` is the number of times the song should play: 1
    /// plays it once, 2 loops once, and 0 loops forever (in which case this
    /// only returns once a callback returns false). It is ignored by the
    /// Pattern traversals, which visit each pattern exactly once.
    ///
    /// Returns the position at which the last event was processed, which is
    /// the end of the song unless a callback stopped early.
    pub fn handle_all_events(
        &mut self,
        order: EventOrder,
        handler: &mut dyn EventHandler,
        target_loop_count: u32,
    ) -> Result<Position> {
        let mut pos = Position::default();
        self.tempo = self.music.initial_tempo.clone();

        match order {
            EventOrder::PatternRowTrack | EventOrder::PatternTrackRow => {
                let merged = order == EventOrder::PatternRowTrack;
                for pattern_index in 0..self.music.patterns.len() {
                    pos.pattern_index = pattern_index;
                    pos.start_row = 0;
                    let outcome = if merged {
                        self.process_pattern_merged(handler, pattern_index, &mut pos)?
                    } else {
                        self.process_pattern_tracks(handler, pattern_index, &mut pos)?
                    };
                    match outcome {
                        PatternOutcome::Stopped => return Ok(pos),
                        // Jumps make no sense in a storage-order walk
                        PatternOutcome::Jump(_) | PatternOutcome::Completed => {}
                    }
                }
            }
            EventOrder::OrderRowTrack | EventOrder::OrderTrackRow => {
                let merged = order == EventOrder::OrderRowTrack;
                loop {
                    if pos.order_index >= self.music.pattern_order.len() {
                        pos.loops += 1;
                        if target_loop_count != 0 && pos.loops >= target_loop_count {
                            break;
                        }
                        pos.order_index = self.music.loop_dest.unwrap_or(0);
                        pos.start_row = 0;
                        continue;
                    }
                    let pattern_index = self.music.pattern_order[pos.order_index];
                    pos.pattern_index = pattern_index;
                    pos.next_order_index = pos.order_index + 1;
                    pos.next_pattern_index = self
                        .music
                        .pattern_at_order(pos.next_order_index)
                        .unwrap_or(0);
                    let outcome = if merged {
                        self.process_pattern_merged(handler, pattern_index, &mut pos)?
                    } else {
                        self.process_pattern_tracks(handler, pattern_index, &mut pos)?
                    };
                    match outcome {
                        PatternOutcome::Stopped => return Ok(pos),
                        PatternOutcome::Jump(goto) => {
                            // The row holding the jump still plays out
                            pos.us += self.tempo.us_per_tick as u64;
                            match goto.kind {
                                GotoKind::CurrentPattern => {}
                                GotoKind::NextPattern => pos.order_index += 1,
                                GotoKind::SpecificOrder => pos.order_index = goto.target_order,
                            }
                            pos.start_row = goto.target_row;
                        }
                        PatternOutcome::Completed => {
                            pos.order_index += 1;
                            pos.start_row = 0;
                        }
                    }
                }
            }
        }
        Ok(pos)
    }

    /// Merge all tracks of a pattern into one chronological stream
    fn process_pattern_merged(
        &mut self,
        handler: &mut dyn EventHandler,
        pattern_index: usize,
        pos: &mut Position,
    ) -> Result<PatternOutcome> {
        struct Merged<'a> {
            abs_time: u32,
            track_index: usize,
            event: &'a TrackEvent,
        }

        let pattern = &self.music.patterns[pattern_index];
        let mut full: Vec<Merged<'_>> = Vec::new();
        for (track_index, track) in pattern.iter().enumerate() {
            let mut track_time = 0u32;
            for te in track {
                track_time += te.delay;
                full.push(Merged {
                    abs_time: track_time,
                    track_index,
                    event: te,
                });
            }
        }
        // Chronological, with note-offs first at equal times to minimise
        // unnecessary polyphony; the sort is stable so track order is kept.
        full.sort_by_key(|m| (m.abs_time, !matches!(m.event.event, Event::NoteOff) as u8));

        let mut track_time = pos.start_row;
        for me in &full {
            if me.abs_time < pos.start_row {
                continue;
            }
            if me.abs_time > track_time {
                // New row: action any pending jump before processing it
                if let Some(goto) = self.jump.take() {
                    return Ok(PatternOutcome::Jump(goto));
                }
            }
            let delta = me.abs_time - track_time;
            track_time = me.abs_time;
            pos.row = me.abs_time;
            pos.us += (delta as f64 * self.tempo.us_per_tick) as u64;
            let keep = deliver(
                handler,
                delta,
                me.track_index,
                pattern_index,
                &me.event.event,
                &mut self.jump,
            )?;
            if let Event::Tempo(tempo) = &me.event.event {
                // Takes effect after the delay carried with the event
                self.tempo = tempo.clone();
            }
            if !keep {
                return Ok(PatternOutcome::Stopped);
            }
        }
        if let Some(goto) = self.jump.take() {
            return Ok(PatternOutcome::Jump(goto));
        }
        debug_assert!(track_time <= self.music.ticks_per_track);
        let remain = self.music.ticks_per_track.saturating_sub(track_time);
        pos.us += (remain as f64 * self.tempo.us_per_tick) as u64;
        handler.end_of_pattern(remain);
        Ok(PatternOutcome::Completed)
    }

    /// Process the events of each track in isolation, track by track
    fn process_pattern_tracks(
        &mut self,
        handler: &mut dyn EventHandler,
        pattern_index: usize,
        pos: &mut Position,
    ) -> Result<PatternOutcome> {
        let pattern = &self.music.patterns[pattern_index];
        let mut max_track_time = 0u32;
        for (track_index, track) in pattern.iter().enumerate() {
            let mut track_time = 0u32;
            for te in track {
                track_time += te.delay;
                pos.row = track_time;
                pos.us += (te.delay as f64 * self.tempo.us_per_tick) as u64;
                let keep = deliver(
                    handler,
                    te.delay,
                    track_index,
                    pattern_index,
                    &te.event,
                    &mut self.jump,
                )?;
                if let Event::Tempo(tempo) = &te.event {
                    self.tempo = tempo.clone();
                }
                if !keep {
                    return Ok(PatternOutcome::Stopped);
                }
            }
            max_track_time = max_track_time.max(track_time);
            handler.end_of_track(self.music.ticks_per_track.saturating_sub(track_time));
        }
        handler.end_of_pattern(self.music.ticks_per_track.saturating_sub(max_track_time));
        // Jumps are only actioned once the whole pattern has been written out
        if let Some(goto) = self.jump.take() {
            return Ok(PatternOutcome::Jump(goto));
        }
        Ok(PatternOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChannelType, Patch, PcmPatch, TrackInfo};

    /// Handler that records every callback for inspection
    #[derive(Default)]
    struct Recorder {
        events: Vec<(u32, usize, String)>,
        end_of_tracks: Vec<u32>,
        end_of_patterns: Vec<u32>,
        take_jumps: bool,
        jump_calls: u32,
    }

    impl EventHandler for Recorder {
        fn end_of_track(&mut self, delay: u32) {
            self.end_of_tracks.push(delay);
        }
        fn end_of_pattern(&mut self, delay: u32) {
            self.end_of_patterns.push(delay);
        }
        fn tempo_event(&mut self, d: u32, t: usize, _p: usize, _: &Tempo) -> Result<bool> {
            self.events.push((d, t, "tempo".into()));
            Ok(true)
        }
        fn note_on(
            &mut self,
            d: u32,
            t: usize,
            _p: usize,
            i: usize,
            _hz: u32,
            _v: Option<u8>,
        ) -> Result<bool> {
            self.events.push((d, t, format!("on{i}")));
            Ok(true)
        }
        fn note_off(&mut self, d: u32, t: usize, _p: usize) -> Result<bool> {
            self.events.push((d, t, "off".into()));
            Ok(true)
        }
        fn effect(&mut self, d: u32, t: usize, _p: usize, _: &Effect) -> Result<bool> {
            self.events.push((d, t, "fx".into()));
            Ok(true)
        }
        fn goto_event(
            &mut self,
            d: u32,
            t: usize,
            _p: usize,
            ev: &GotoEvent,
            jump: &mut JumpControl,
        ) -> Result<bool> {
            self.events.push((d, t, "goto".into()));
            if self.take_jumps && self.jump_calls <= ev.repeat {
                self.jump_calls += 1;
                jump.perform_goto(ev);
            }
            Ok(true)
        }
        fn configuration(
            &mut self,
            d: u32,
            t: usize,
            _p: usize,
            _: &ConfigurationEvent,
        ) -> Result<bool> {
            self.events.push((d, t, "cfg".into()));
            Ok(true)
        }
    }

    fn on(instrument: usize) -> Event {
        Event::NoteOn {
            instrument,
            millihertz: 440_000,
            velocity: None,
        }
    }

    fn te(delay: u32, event: Event) -> TrackEvent {
        TrackEvent { delay, event }
    }

    fn two_track_song() -> Music {
        let mut music = Music::default();
        music.patches.push(Patch::pcm(PcmPatch::default()));
        music.track_info = vec![
            TrackInfo {
                channel_type: ChannelType::Pcm,
                channel_index: 0,
            },
            TrackInfo {
                channel_type: ChannelType::Pcm,
                channel_index: 1,
            },
        ];
        music.ticks_per_track = 16;
        music.patterns = vec![
            vec![
                vec![te(0, on(0)), te(8, Event::NoteOff)],
                vec![te(8, on(0)), te(4, Event::NoteOff)],
            ],
            vec![vec![te(2, on(0))], vec![]],
        ];
        music.pattern_order = vec![0, 1, 0];
        music
    }

    #[test]
    fn merged_traversal_delivers_all_events_in_order() {
        let music = two_track_song();
        let mut rec = Recorder::default();
        let pos = EventDispatcher::new(&music)
            .handle_all_events(EventOrder::PatternRowTrack, &mut rec, 1)
            .unwrap();
        // Pattern 0 has 4 events, pattern 1 has 1; storage order, once each
        assert_eq!(rec.events.len(), 5);
        // At tick 8 the note-off from track 0 precedes track 1's note-on
        let kinds: Vec<&str> = rec.events.iter().map(|e| e.2.as_str()).collect();
        assert_eq!(kinds, ["on0", "off", "on0", "off", "on0"]);
        // One end-of-pattern per pattern, with the trailing silence
        assert_eq!(rec.end_of_patterns, vec![4, 14]);
        // Both patterns visited once: 2 * 16 ticks at the default tempo
        assert_eq!(pos.us, 2 * 16 * 250_000);
    }

    #[test]
    fn noteoff_precedes_noteon_at_same_tick() {
        let music = two_track_song();
        let mut rec = Recorder::default();
        EventDispatcher::new(&music)
            .handle_all_events(EventOrder::PatternRowTrack, &mut rec, 1)
            .unwrap();
        // Both events land on tick 8: off (track 0) then on (track 1)
        assert_eq!(rec.events[1], (8, 0, "off".into()));
        assert_eq!(rec.events[2], (0, 1, "on0".into()));
    }

    #[test]
    fn track_traversal_keeps_tracks_separate() {
        let music = two_track_song();
        let mut rec = Recorder::default();
        EventDispatcher::new(&music)
            .handle_all_events(EventOrder::PatternTrackRow, &mut rec, 1)
            .unwrap();
        let kinds: Vec<(u32, usize)> = rec.events.iter().map(|e| (e.0, e.1)).collect();
        // Track 0 fully, then track 1 with its own delays
        assert_eq!(kinds, [(0, 0), (8, 0), (8, 1), (4, 1), (2, 0)]);
        // end_of_track after each track: 16-8=8, 16-12=4, then pattern 1
        assert_eq!(rec.end_of_tracks, vec![8, 4, 14, 16]);
        assert_eq!(rec.end_of_patterns, vec![4, 14]);
    }

    #[test]
    fn order_traversal_respects_order_list() {
        let music = two_track_song();
        let mut rec = Recorder::default();
        let pos = EventDispatcher::new(&music)
            .handle_all_events(EventOrder::OrderRowTrack, &mut rec, 1)
            .unwrap();
        // Pattern 0 twice plus pattern 1 once: 4 + 1 + 4 events
        assert_eq!(rec.events.len(), 9);
        assert_eq!(pos.loops, 1);
        // 3 patterns of 16 ticks at the default 250000 us/tick
        assert_eq!(pos.us, 3 * 16 * 250_000);
    }

    #[test]
    fn loop_count_repeats_the_song() {
        let music = two_track_song();
        let mut rec = Recorder::default();
        let pos = EventDispatcher::new(&music)
            .handle_all_events(EventOrder::OrderRowTrack, &mut rec, 2)
            .unwrap();
        assert_eq!(rec.events.len(), 18);
        assert_eq!(pos.loops, 2);
    }

    #[test]
    fn tempo_change_applies_after_its_delay() {
        let mut music = two_track_song();
        let mut fast = Tempo::default();
        fast.us_per_tick = 100_000.0;
        music.patterns = vec![vec![
            vec![te(8, Event::Tempo(fast)), te(8, Event::NoteOff)],
            vec![],
        ]];
        music.pattern_order = vec![0];
        let mut rec = Recorder::default();
        let pos = EventDispatcher::new(&music)
            .handle_all_events(EventOrder::OrderRowTrack, &mut rec, 1)
            .unwrap();
        // 8 ticks at 250ms, then 8 ticks at 100ms (to the note-off)
        assert_eq!(pos.us, 8 * 250_000 + 8 * 100_000);
    }

    #[test]
    fn goto_is_ignored_without_perform_goto() {
        let mut music = two_track_song();
        music.patterns[0][0].insert(
            1,
            te(
                4,
                Event::Goto(GotoEvent {
                    kind: GotoKind::CurrentPattern,
                    repeat: 0,
                    target_order: 0,
                    target_row: 0,
                }),
            ),
        );
        let mut rec = Recorder::default();
        EventDispatcher::new(&music)
            .handle_all_events(EventOrder::OrderRowTrack, &mut rec, 1)
            .unwrap();
        // The jump is delivered but not taken, so event count just grows by
        // the three goto deliveries (pattern 0 plays twice... plus once)
        assert_eq!(
            rec.events.iter().filter(|e| e.2 == "goto").count(),
            2 // pattern 0 is played twice in the order list
        );
    }

    #[test]
    fn goto_restarts_pattern_with_repeat_limit() {
        let mut music = two_track_song();
        // Jump back to row 0 once, at row 4 of pattern 1
        music.pattern_order = vec![1];
        music.patterns[1][0] = vec![
            te(2, on(0)),
            te(2, Event::Goto(GotoEvent {
                kind: GotoKind::CurrentPattern,
                repeat: 0,
                target_order: 0,
                target_row: 0,
            })),
            te(4, Event::NoteOff),
        ];
        let mut rec = Recorder {
            take_jumps: true,
            ..Recorder::default()
        };
        EventDispatcher::new(&music)
            .handle_all_events(EventOrder::OrderRowTrack, &mut rec, 1)
            .unwrap();
        let kinds: Vec<&str> = rec.events.iter().map(|e| e.2.as_str()).collect();
        // First pass reaches the goto and jumps (the note-off after it on
        // the same pass is never reached); second pass runs to the end.
        assert_eq!(kinds, ["on0", "goto", "on0", "goto", "off"]);
    }

    #[test]
    fn stop_returns_position() {
        struct StopAt8;
        impl EventHandler for StopAt8 {
            fn tempo_event(&mut self, _: u32, _: usize, _: usize, _: &Tempo) -> Result<bool> {
                Ok(true)
            }
            fn note_on(
                &mut self,
                _: u32,
                _: usize,
                _: usize,
                _: usize,
                _: u32,
                _: Option<u8>,
            ) -> Result<bool> {
                Ok(true)
            }
            fn note_off(&mut self, _: u32, _: usize, _: usize) -> Result<bool> {
                Ok(false)
            }
            fn effect(&mut self, _: u32, _: usize, _: usize, _: &Effect) -> Result<bool> {
                Ok(true)
            }
            fn goto_event(
                &mut self,
                _: u32,
                _: usize,
                _: usize,
                _: &GotoEvent,
                _: &mut JumpControl,
            ) -> Result<bool> {
                Ok(true)
            }
            fn configuration(
                &mut self,
                _: u32,
                _: usize,
                _: usize,
                _: &ConfigurationEvent,
            ) -> Result<bool> {
                Ok(true)
            }
        }
        let music = two_track_song();
        let pos = EventDispatcher::new(&music)
            .handle_all_events(EventOrder::OrderRowTrack, &mut StopAt8, 1)
            .unwrap();
        // The first note-off is at tick 8 of the first pattern
        assert_eq!(pos.order_index, 0);
        assert_eq!(pos.row, 8);
        assert_eq!(pos.us, 8 * 250_000);
    }
}
