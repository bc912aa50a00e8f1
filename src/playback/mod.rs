//! Song playback orchestration
//!
//! [`Playback`] ticks the pattern data at the tempo-derived frame rate,
//! fans events out to the OPL converter, MIDI-mapped synths and PCM voicer,
//! and mixes everything into a continuous stereo PCM stream with
//! seek-by-time and seek-by-order.

mod shared;

pub use shared::SharedPlayback;

use std::collections::HashMap;
use std::sync::Arc;

use log::warn;

use crate::dispatch::{deliver, EventHandler, JumpControl, SeekHandler};
use crate::error::Result;
use crate::model::{ChannelType, ConfigurationEvent, Event, GotoKind, Music, PatchBank};
use crate::opl::{OplConverter, OplEvent, OplSink, OplWrite, OplWriteFlags, OPL_FNUM_DEFAULT};
use crate::synth::{pcm_mix_s16, SynthOpl, SynthPcm};
use crate::tempo::{Tempo, US_PER_SEC};

/// Current playback point, reported from [`Playback::mix`]
#[derive(Debug, Clone)]
pub struct PlaybackPosition {
    /// Number of times the song has looped
    pub loops: u32,
    /// Order number; equals the order-list length once the song has ended
    pub order: usize,
    /// Row index within the pattern
    pub row: u32,
    /// True once the end of the song has been reached
    pub end: bool,
    /// Tempo at this point; may differ from the song's initial tempo
    pub tempo: Tempo,
}

impl PartialEq for PlaybackPosition {
    /// Positions compare by place in the song, not by tempo.
    fn eq(&self, other: &Self) -> bool {
        self.loops == other.loops && self.order == other.order && self.row == other.row
    }
}

/// Sink that buffers register writes for the frame being assembled
///
/// Delays are ignored: during live playback the orchestrator's frame clock
/// provides the timing, and writes are applied at the row they fire on.
#[derive(Default)]
struct RegisterSink {
    writes: Vec<OplWrite>,
}

impl OplSink for RegisterSink {
    fn write_next_pair(&mut self, ev: &OplEvent) -> Result<()> {
        if let Some(w) = ev.write {
            self.writes.push(w);
        }
        Ok(())
    }
}

/// Helper managing playback of a song
pub struct Playback {
    output_sample_rate: u32,
    output_channels: u8,
    music: Option<Arc<Music>>,
    bank_midi: Option<Arc<PatchBank>>,
    /// 0 = loop forever, 1 = play once, 2 = loop once, ...
    loop_count: u32,

    end: bool,
    loops: u32,
    order: usize,
    pattern: usize,
    row: u32,
    frame: u32,
    next_row: u32,
    next_order: usize,
    load_next_order: bool,
    tempo: Tempo,

    samples_per_frame: usize,
    /// One tick-frame of interleaved stereo audio
    frame_buffer: Vec<i16>,
    frame_buffer_pos: usize,

    /// Times each goto event has fired, keyed by (pattern, track, row)
    loop_events: HashMap<(usize, usize, u32), u32>,

    pcm: SynthPcm,
    pcm_midi: SynthPcm,
    opl: SynthOpl,
    opl_midi: SynthOpl,
    opl_conv: Option<OplConverter<RegisterSink>>,
    opl_conv_midi: Option<OplConverter<RegisterSink>>,
    jump: JumpControl,
}

impl Playback {
    /// Create a playback helper for the given output configuration
    ///
    /// Output is 16-bit; `channels` must be 1 or 2 (the internal mix is
    /// always stereo, mono output folds the left channel).
    pub fn new(sample_rate: u32, channels: u8) -> Self {
        debug_assert!(channels == 1 || channels == 2);
        Playback {
            output_sample_rate: sample_rate,
            output_channels: channels.clamp(1, 2),
            music: None,
            bank_midi: None,
            loop_count: 1,
            end: true,
            loops: 0,
            order: 0,
            pattern: 0,
            row: 0,
            frame: 0,
            next_row: 1,
            next_order: 0,
            load_next_order: false,
            tempo: Tempo::default(),
            samples_per_frame: 0,
            frame_buffer: Vec::new(),
            frame_buffer_pos: 0,
            loop_events: HashMap::new(),
            pcm: SynthPcm::new(sample_rate),
            pcm_midi: SynthPcm::new(sample_rate),
            opl: SynthOpl::new(sample_rate),
            opl_midi: SynthOpl::new(sample_rate),
            opl_conv: None,
            opl_conv_midi: None,
            jump: JumpControl::default(),
        }
    }

    /// Set the patch bank used to voice MIDI instruments
    ///
    /// The bank must hold OPL or PCM patches (the point is to translate
    /// MIDI programs into something audible). Takes effect from the next
    /// [`Playback::set_song`].
    pub fn set_bank_midi(&mut self, bank: Option<Arc<PatchBank>>) {
        self.bank_midi = bank;
    }

    /// Set the song to play, resetting playback to its start
    pub fn set_song(&mut self, music: Arc<Music>) {
        self.end = false;
        self.loops = 0;
        self.order = 0;
        self.next_order = 0; // incremented to 1 at end of pattern
        if music.pattern_order.is_empty() {
            warn!("playback: song has no pattern order entries");
            self.pattern = 0;
        } else {
            self.pattern = music.pattern_order[0];
        }
        if music.ticks_per_track == 0 {
            warn!("playback: song's ticks_per_track is zero");
        }
        self.row = 0;
        self.next_row = 1;
        self.frame = 0;
        self.loop_events.clear();

        self.tempo_change(music.initial_tempo.clone());

        self.opl.reset();
        let mut opl_conv = OplConverter::new(
            RegisterSink::default(),
            music.clone(),
            OPL_FNUM_DEFAULT,
            OplWriteFlags::empty(),
        );

        self.opl_midi.reset();
        let mut opl_conv_midi = OplConverter::new(
            RegisterSink::default(),
            music.clone(),
            OPL_FNUM_DEFAULT,
            OplWriteFlags::empty(),
        );
        opl_conv_midi.set_bank_midi(self.bank_midi.clone());

        self.pcm.reset(music.clone());
        self.pcm_midi.reset(music.clone());
        self.pcm_midi.set_bank_midi(self.bank_midi.clone());

        // Rhythm mode on or off up front, depending on rhythm tracks
        let rhythm = music
            .track_info
            .iter()
            .any(|ti| ti.channel_type == ChannelType::OplPerc);
        let _ = opl_conv.configuration(0, 0, 0, &ConfigurationEvent::EnableRhythm(rhythm));

        self.opl_conv = Some(opl_conv);
        self.opl_conv_midi = Some(opl_conv_midi);
        self.apply_register_writes();

        // Sanity checks while debugging song loaders
        #[cfg(debug_assertions)]
        for patch in music.patches.iter() {
            if let Some(pcm) = patch.as_pcm() {
                let samples = pcm.data.len() as u32 / (pcm.bit_depth as u32 / 8).max(1);
                debug_assert!(pcm.data.is_empty() || pcm.loop_start < samples);
                debug_assert!(pcm.loop_end <= samples);
            }
        }

        self.music = Some(music);
    }

    /// Set the number of times the song should play; 0 = loop forever
    pub fn set_loop_count(&mut self, count: u32) {
        self.loop_count = count;
    }

    /// Length of the song in milliseconds, honouring the loop count
    pub fn length(&mut self) -> Result<u64> {
        let Some(music) = self.music.clone() else {
            return Ok(0);
        };
        SeekHandler::new(&music, self.loop_count).total_length(&music)
    }

    /// Jump to the start of the given order number
    ///
    /// An out-of-range order immediately ends the song.
    pub fn seek_by_order(&mut self, dest_order: usize) {
        self.row = 0;
        self.next_row = 1;
        self.frame = 0;
        self.order = dest_order;
        self.next_order = 0; // incremented to 1 at end of pattern
        let Some(music) = &self.music else {
            return;
        };
        match music.pattern_at_order(dest_order) {
            Some(pattern) => {
                self.pattern = pattern;
                self.end = false;
            }
            None => {
                self.pattern = 0;
                self.end = true;
            }
        }
    }

    /// Jump to a point in the song given in milliseconds
    ///
    /// Playback resumes at the start of the nearest row, so the actual
    /// position (returned in milliseconds) can differ slightly from the
    /// request.
    pub fn seek_by_time(&mut self, ms: u64) -> Result<u64> {
        self.all_notes_off();

        let Some(music) = self.music.clone() else {
            return Ok(0);
        };
        let (pos, new_tempo) = SeekHandler::new(&music, self.loop_count).seek_to(&music, ms)?;

        if self.tempo != new_tempo {
            self.tempo_change(new_tempo);
        }
        self.frame = 0;
        self.row = pos.row;
        self.next_row = pos.row + 1; // pulled back into range later if needed
        self.order = pos.order_index;
        self.next_order = pos.next_order_index.saturating_sub(1);
        self.pattern = pos.pattern_index;
        self.end = music.pattern_order.len() <= self.order;
        self.loops = pos.loops;
        Ok(pos.us / 1000)
    }

    /// Synthesise and mix audio into the caller's buffer
    ///
    /// Audio is combined with whatever the buffer already holds using the
    /// saturating mix, so zero it before the first call. The buffer length
    /// is in samples (two per frame for stereo output).
    pub fn mix(&mut self, output: &mut [i16]) -> PlaybackPosition {
        if self.music.is_some() && !self.frame_buffer.is_empty() {
            let mut written = 0usize;
            while written < output.len() {
                if self.frame_buffer_pos >= self.frame_buffer.len() {
                    self.next_frame();
                }
                let remaining = output.len() - written;
                let take = match self.output_channels {
                    // Stereo: straight copy of the interleaved frame buffer
                    2 => {
                        let take =
                            remaining.min(self.frame_buffer.len() - self.frame_buffer_pos);
                        for i in 0..take {
                            let s = self.frame_buffer[self.frame_buffer_pos + i];
                            output[written + i] = pcm_mix_s16(output[written + i], s);
                        }
                        self.frame_buffer_pos += take;
                        take
                    }
                    // Mono: take the left sample of each frame
                    _ => {
                        let frames_left =
                            (self.frame_buffer.len() - self.frame_buffer_pos) / 2;
                        let take = remaining.min(frames_left);
                        for i in 0..take {
                            let s = self.frame_buffer[self.frame_buffer_pos + i * 2];
                            output[written + i] = pcm_mix_s16(output[written + i], s);
                        }
                        self.frame_buffer_pos += take * 2;
                        take
                    }
                };
                debug_assert!(take > 0);
                written += take;
            }
        }

        PlaybackPosition {
            loops: self.loops,
            order: self.order,
            row: self.row,
            end: self.end,
            tempo: self.tempo.clone(),
        }
    }

    /// Switch off every playing note; envelopes fade out naturally
    pub fn all_notes_off(&mut self) {
        let Some(music) = self.music.clone() else {
            return;
        };
        let Some(pattern) = music.patterns.get(self.pattern) else {
            return;
        };
        for track_index in 0..pattern.len() {
            self.deliver_to_synths(&music, track_index, &Event::NoteOff);
        }
        self.apply_register_writes();
    }

    /// Fan one event out to every synth interested in its track
    fn deliver_to_synths(&mut self, music: &Music, track_index: usize, event: &Event) {
        let Some(ti) = music.track_info.get(track_index) else {
            return;
        };
        let ct = ti.channel_type;
        let pattern = self.pattern;

        let mut send = move |handler: &mut dyn crate::dispatch::EventHandler,
                             jump: &mut JumpControl| {
            if let Err(e) = deliver(handler, 0, track_index, pattern, event, jump) {
                warn!("playback: dropping event on track {track_index}: {e}");
            }
        };

        if matches!(ct, ChannelType::Any | ChannelType::Opl | ChannelType::OplPerc) {
            if let Some(conv) = self.opl_conv.as_mut() {
                send(conv, &mut self.jump);
            }
        }
        if matches!(ct, ChannelType::Any | ChannelType::Midi) {
            if let Some(conv) = self.opl_conv_midi.as_mut() {
                send(conv, &mut self.jump);
            }
            send(&mut self.pcm_midi, &mut self.jump);
        }
        if matches!(ct, ChannelType::Any | ChannelType::Pcm) {
            send(&mut self.pcm, &mut self.jump);
        }
    }

    /// Move buffered register writes into the OPL emulators
    ///
    /// Draining keeps the sinks' capacity, so the audio path settles into a
    /// steady state with no allocation.
    fn apply_register_writes(&mut self) {
        if let Some(conv) = self.opl_conv.as_mut() {
            for w in conv.sink_mut().writes.drain(..) {
                self.opl.write(w.chip, w.reg, w.val);
            }
        }
        if let Some(conv) = self.opl_conv_midi.as_mut() {
            for w in conv.sink_mut().writes.drain(..) {
                self.opl_midi.write(w.chip, w.reg, w.val);
            }
        }
    }

    /// Assemble the next tick-frame into the frame buffer
    fn next_frame(&mut self) {
        if !self.end {
            if self.frame == 0 {
                // First frame of a row: dispatch all events on this row
                if let Some(music) = self.music.clone() {
                    if let Some(pattern) = music.patterns.get(self.pattern) {
                        for (track_index, track) in pattern.iter().enumerate() {
                            let mut track_pos = 0u32;
                            for te in track {
                                track_pos += te.delay;
                                if track_pos == self.row {
                                    self.deliver_to_synths(&music, track_index, &te.event);

                                    match &te.event {
                                        Event::Tempo(tempo) => {
                                            if *tempo != self.tempo {
                                                self.tempo_change(tempo.clone());
                                            }
                                        }
                                        Event::Goto(jump) => {
                                            let key =
                                                (self.pattern, track_index, self.row);
                                            let actual =
                                                self.loop_events.entry(key).or_insert(0);
                                            if *actual < jump.repeat + 1 {
                                                *actual += 1;
                                                match jump.kind {
                                                    GotoKind::CurrentPattern => {
                                                        self.next_row = jump.target_row;
                                                    }
                                                    GotoKind::NextPattern => {
                                                        self.next_order += 1;
                                                        self.next_row = jump.target_row;
                                                        self.load_next_order = true;
                                                    }
                                                    GotoKind::SpecificOrder => {
                                                        self.next_order = jump.target_order;
                                                        self.next_row = jump.target_row;
                                                        self.load_next_order = true;
                                                    }
                                                }
                                            }
                                        }
                                        _ => {}
                                    }
                                } else if track_pos > self.row {
                                    // Not up to this event yet
                                    break;
                                }
                            }
                        }
                        self.apply_register_writes();
                    }
                }
            }
            // Later frames update intra-row effects; none are modelled yet
        }

        // Silence the frame buffer, then mix every source into it
        self.frame_buffer.fill(0);
        self.pcm.mix(&mut self.frame_buffer);
        self.opl.mix(&mut self.frame_buffer);
        self.pcm_midi.mix(&mut self.frame_buffer);
        self.opl_midi.mix(&mut self.frame_buffer);

        self.frame_buffer_pos = 0;
        if self.end {
            return;
        }

        // Advance frame, row, order
        self.frame += 1;
        if self.frame < self.tempo.frames_per_tick {
            return;
        }
        self.frame = 0;
        self.row = self.next_row;
        self.next_row += 1;
        let music = match &self.music {
            Some(m) => m.clone(),
            None => return,
        };
        if self.row >= music.ticks_per_track {
            self.row = 0;
            self.next_row = 1;
            self.next_order += 1;
            self.load_next_order = true;
        }
        if self.load_next_order {
            self.load_next_order = false;
            self.order = self.next_order;
            if self.order >= music.pattern_order.len() {
                if self.loop_count == 0 || self.loops < self.loop_count - 1 {
                    self.order = music.loop_dest.unwrap_or(0);
                    self.loops += 1;
                    self.next_order = self.order; // incremented at end of pattern

                    // Looping resets the per-pattern jump counters
                    self.loop_events.clear();
                } else {
                    self.end = true;
                }
                self.all_notes_off();
            }
            match music.pattern_at_order(self.order) {
                Some(pattern) => self.pattern = pattern,
                None => self.end = true,
            }
        }
    }

    /// Recompute the frame clock after a tempo change
    fn tempo_change(&mut self, tempo: Tempo) {
        self.tempo = tempo;
        let samples_per_tick =
            (self.output_sample_rate as f64 * self.tempo.us_per_tick / US_PER_SEC) as usize;
        if samples_per_tick == 0 {
            warn!("playback: tempo too high, less than one sample per tick");
        }
        self.samples_per_frame =
            (samples_per_tick / self.tempo.frames_per_tick.max(1) as usize).max(1);
        self.frame_buffer = vec![0; self.samples_per_frame * 2]; // stereo
        self.frame_buffer_pos = self.frame_buffer.len();
    }
}
