//! Conversion of song events into MIDI channel messages

use std::sync::Arc;

use bitflags::bitflags;
use log::warn;

use super::util::{freq_to_midi_note, MIDI_BEND_CENTRE, MIDI_CHANNEL_COUNT};
use crate::dispatch::{EventDispatcher, EventHandler, EventOrder, JumpControl, Position};
use crate::error::Result;
use crate::model::{ChannelType, ConfigurationEvent, Effect, GotoEvent, Music};
use crate::tempo::Tempo;

/// Default attack velocity when a note has none
pub const MIDI_DEFAULT_ATTACK_VELOCITY: u8 = 127;
/// Default release velocity; using this allows better event optimisation
pub const MIDI_DEFAULT_RELEASE_VELOCITY: u8 = 127;

/// Sentinel for "no note sounding on this track"
const ACTIVE_NOTE_NONE: u8 = 0xFF;

bitflags! {
    /// Flags controlling conversion to MIDI data
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MidiFlags: u32 {
        /// Note aftertouch events are one byte short and handled as channel
        /// aftertouch
        const SHORT_AFTERTOUCH = 0x01;
        /// Channel 10 is an ordinary channel, not percussion
        const CHANNEL_10_NO_PERC = 0x02;
        /// Basic MIDI commands only: no sysex or meta events. Tempo changes
        /// are dropped; the host must rescale its tick clock instead.
        const BASIC_MIDI_ONLY = 0x04;
        /// Disable pitchbends
        const INTEGER_NOTES_ONLY = 0x08;
        /// Use the instrument index as the program number, instead of the
        /// MIDI patch stored in the instrument (for CMF-style formats that
        /// use patch-change events without MIDI instruments)
        const USE_PATCH_INDEX = 0x10;
        /// Embed the tempo as a meta event in the MIDI stream
        const EMBED_TEMPO = 0x20;
        /// Use .cmf extensions: controller 0x63 carries the deep
        /// tremolo/vibrato state and 0x67 the rhythm mode
        const CMF_EXTENSIONS = 0x40;
        /// Use AdLib .mus timing bytes (0xF8 overflow markers)
        const ADLIB_MUS = 0x80;
    }
}

/// Consumer of converted MIDI messages
#[allow(unused_variables)]
pub trait MidiSink {
    /// Stop sounding a note; `delay` is in ticks since the previous message
    fn note_off(&mut self, delay: u32, channel: u8, note: u8, velocity: u8) -> Result<()>;

    /// Start sounding a note
    fn note_on(&mut self, delay: u32, channel: u8, note: u8, velocity: u8) -> Result<()>;

    /// Change the instrument on a channel
    fn patch_change(&mut self, delay: u32, channel: u8, instrument: u8) -> Result<()>;

    /// Change a controller value on a channel
    fn controller(&mut self, delay: u32, channel: u8, controller: u8, value: u8) -> Result<()>;

    /// Bend all notes on a channel; 8192 = no bend
    fn pitchbend(&mut self, delay: u32, channel: u8, bend: u16) -> Result<()>;

    /// Change the song speed
    fn set_tempo(&mut self, delay: u32, tempo: &Tempo) -> Result<()>;

    /// End of one track reached
    fn end_of_track(&mut self) -> Result<()> {
        Ok(())
    }

    /// End of one pattern reached
    fn end_of_pattern(&mut self) -> Result<()> {
        Ok(())
    }

    /// End of the song, with any final delay
    fn end_of_song(&mut self, delay: u32) -> Result<()> {
        Ok(())
    }
}

/// Immediate conversion of incoming events into MIDI messages
pub struct MidiConverter<S: MidiSink> {
    sink: S,
    music: Arc<Music>,
    flags: MidiFlags,

    cached_delay: u32,
    us_per_tick: f64,
    /// Program currently selected on each MIDI channel, 0xFF = none
    current_patch: [u8; MIDI_CHANNEL_COUNT],
    /// Pitchbend currently applied to each MIDI channel
    current_pitchbend: [u16; MIDI_CHANNEL_COUNT],
    /// Note currently held by each track, 0xFF = none
    active_note: Vec<u8>,
    deep_tremolo: bool,
    deep_vibrato: bool,
    update_deep: bool,
}

impl<S: MidiSink> MidiConverter<S> {
    /// Prepare for event conversion
    pub fn new(sink: S, music: Arc<Music>, flags: MidiFlags) -> Self {
        let track_count = music.track_info.len();
        let cmf = flags.contains(MidiFlags::CMF_EXTENSIONS);
        MidiConverter {
            sink,
            music,
            flags,
            cached_delay: 0,
            us_per_tick: 0.0,
            current_patch: [0xFF; MIDI_CHANNEL_COUNT],
            current_pitchbend: [MIDI_BEND_CENTRE; MIDI_CHANNEL_COUNT],
            active_note: vec![ACTIVE_NOTE_NONE; track_count],
            deep_tremolo: cmf,
            deep_vibrato: cmf,
            update_deep: false,
        }
    }

    /// Access the sink, e.g. to recover an output buffer
    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Convert the whole song, then signal end-of-song with any final delay
    pub fn handle_all_events(&mut self, order: EventOrder, loop_count: u32) -> Result<Position> {
        let music = self.music.clone();
        let mut dispatcher = EventDispatcher::new(&music);
        let pos = dispatcher.handle_all_events(order, self, loop_count)?;
        self.sink.end_of_song(self.cached_delay)?;
        self.cached_delay = 0;
        Ok(pos)
    }

    /// MIDI channel for a track, or `None` if the track is not MIDI-bound
    fn midi_channel(&self, track_index: usize) -> Option<u8> {
        let ti = self.music.track_info.get(track_index)?;
        if !self.flags.contains(MidiFlags::USE_PATCH_INDEX)
            && ti.channel_type != ChannelType::Midi
        {
            return None;
        }
        Some(ti.channel_index as u8 & 0x0F)
    }

    fn take_delay(&mut self) -> u32 {
        std::mem::take(&mut self.cached_delay)
    }
}

impl<S: MidiSink> EventHandler for MidiConverter<S> {
    fn end_of_pattern(&mut self, delay: u32) {
        self.cached_delay += delay;
    }

    fn tempo_event(&mut self, delay: u32, _: usize, _: usize, tempo: &Tempo) -> Result<bool> {
        self.cached_delay += delay;
        if self.us_per_tick != tempo.us_per_tick {
            if !self.flags.contains(MidiFlags::BASIC_MIDI_ONLY) {
                let delay = self.take_delay();
                self.sink.set_tempo(delay, tempo)?;
            } else {
                warn!("midi: dropping tempo change, meta events disabled");
            }
            self.us_per_tick = tempo.us_per_tick;
        }
        Ok(true)
    }

    fn note_on(
        &mut self,
        delay: u32,
        track_index: usize,
        _: usize,
        instrument: usize,
        millihertz: u32,
        velocity: Option<u8>,
    ) -> Result<bool> {
        let Some(channel) = self.midi_channel(track_index) else {
            return Ok(true);
        };
        self.cached_delay += delay;

        // Figure out which MIDI program number to use
        let target_patch = if self.flags.contains(MidiFlags::USE_PATCH_INDEX) {
            instrument as u8
        } else {
            match self
                .music
                .patches
                .get(instrument)
                .and_then(|p| p.as_midi())
            {
                Some(midi) => midi.midi_patch,
                None => return Ok(true), // non-MIDI instrument, ignore
            }
        };

        if self.flags.contains(MidiFlags::CMF_EXTENSIONS) && self.update_deep {
            // CMF controller 0x63: bit 1 tremolo depth, bit 0 vibrato depth
            let val = ((self.deep_tremolo as u8) << 1) | self.deep_vibrato as u8;
            let delay = self.take_delay();
            self.sink.controller(delay, 0, 0x63, val)?;
            self.update_deep = false;
        }

        if target_patch != self.current_patch[channel as usize] {
            let delay = self.take_delay();
            self.sink.patch_change(delay, channel, target_patch)?;
            self.current_patch[channel as usize] = target_patch;
        }

        let (note, bend) = freq_to_midi_note(millihertz, None);

        // Default velocity if none given, otherwise squish into 7 bits
        let velocity = match velocity {
            None => MIDI_DEFAULT_ATTACK_VELOCITY,
            Some(v) => v >> 1,
        };

        // Silence any note still playing on this track first
        if self.active_note[track_index] != ACTIVE_NOTE_NONE {
            let active = self.active_note[track_index];
            let delay = self.take_delay();
            self.sink
                .note_off(delay, channel, active, MIDI_DEFAULT_RELEASE_VELOCITY)?;
        }

        // Off-grid pitch: issue a channel-wide bend before the note-on (or
        // reset a leftover bend from a previous note)
        if !self.flags.contains(MidiFlags::INTEGER_NOTES_ONLY)
            && bend != self.current_pitchbend[channel as usize]
        {
            let delay = self.take_delay();
            self.sink.pitchbend(delay, channel, bend)?;
            self.current_pitchbend[channel as usize] = bend;
        }

        let delay = self.take_delay();
        self.sink.note_on(delay, channel, note, velocity)?;
        self.active_note[track_index] = note;
        Ok(true)
    }

    fn note_off(&mut self, delay: u32, track_index: usize, pattern_index: usize) -> Result<bool> {
        let Some(channel) = self.midi_channel(track_index) else {
            return Ok(true);
        };
        self.cached_delay += delay;

        if self.active_note[track_index] == ACTIVE_NOTE_NONE {
            warn!(
                "midi: note-off on track {track_index} in pattern {pattern_index} \
                 with no note playing"
            );
            return Ok(true);
        }
        let active = self.active_note[track_index];
        let delay = self.take_delay();
        self.sink
            .note_off(delay, channel, active, MIDI_DEFAULT_RELEASE_VELOCITY)?;
        self.active_note[track_index] = ACTIVE_NOTE_NONE;
        Ok(true)
    }

    fn effect(
        &mut self,
        delay: u32,
        track_index: usize,
        _: usize,
        effect: &Effect,
    ) -> Result<bool> {
        let Some(channel) = self.midi_channel(track_index) else {
            return Ok(true);
        };
        self.cached_delay += delay;

        match effect {
            Effect::Pitchbend(millihertz) => {
                if self.flags.contains(MidiFlags::INTEGER_NOTES_ONLY) {
                    return Ok(true);
                }
                // With no note playing, the bend will happen at the next
                // note-on instead
                if self.active_note[track_index] == ACTIVE_NOTE_NONE {
                    return Ok(true);
                }
                // MIDI can only bend the whole channel; remember the bend so
                // the next note resets it
                let (_, bend) =
                    freq_to_midi_note(*millihertz, Some(self.active_note[track_index]));
                if bend != self.current_pitchbend[channel as usize] {
                    let delay = self.take_delay();
                    self.sink.pitchbend(delay, channel, bend)?;
                    self.current_pitchbend[channel as usize] = bend;
                }
            }
            Effect::Volume(_) => {
                // No defined MIDI behaviour; deliberately not emitted
            }
        }
        Ok(true)
    }

    fn goto_event(
        &mut self,
        delay: u32,
        _: usize,
        _: usize,
        _: &GotoEvent,
        _: &mut JumpControl,
    ) -> Result<bool> {
        // MIDI has no concept of jumps, EMIDI notwithstanding
        self.cached_delay += delay;
        Ok(true)
    }

    fn configuration(
        &mut self,
        delay: u32,
        _: usize,
        _: usize,
        ev: &ConfigurationEvent,
    ) -> Result<bool> {
        self.cached_delay += delay;
        match *ev {
            ConfigurationEvent::Empty => {}
            ConfigurationEvent::EnableRhythm(enable) => {
                // CMF rhythm mode rides on controller 0x67
                if self.flags.contains(MidiFlags::CMF_EXTENSIONS) {
                    let delay = self.take_delay();
                    self.sink.controller(delay, 0, 0x67, enable as u8)?;
                }
            }
            ConfigurationEvent::EnableDeepTremolo { enable, .. } => {
                if self.deep_tremolo != enable {
                    self.deep_tremolo = enable;
                    self.update_deep = true;
                }
            }
            ConfigurationEvent::EnableDeepVibrato { enable, .. } => {
                if self.deep_vibrato != enable {
                    self.deep_vibrato = enable;
                    self.update_deep = true;
                }
            }
            _ => {}
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Event, MidiPatch, Patch, TrackEvent, TrackInfo};

    #[derive(Debug, PartialEq)]
    enum Msg {
        Off(u32, u8, u8),
        On(u32, u8, u8, u8),
        Patch(u32, u8, u8),
        Ctrl(u32, u8, u8, u8),
        Bend(u32, u8, u16),
        Tempo(u32),
        EndOfSong(u32),
    }

    #[derive(Default)]
    struct Capture(Vec<Msg>);

    impl MidiSink for Capture {
        fn note_off(&mut self, d: u32, c: u8, n: u8, _v: u8) -> Result<()> {
            self.0.push(Msg::Off(d, c, n));
            Ok(())
        }
        fn note_on(&mut self, d: u32, c: u8, n: u8, v: u8) -> Result<()> {
            self.0.push(Msg::On(d, c, n, v));
            Ok(())
        }
        fn patch_change(&mut self, d: u32, c: u8, i: u8) -> Result<()> {
            self.0.push(Msg::Patch(d, c, i));
            Ok(())
        }
        fn controller(&mut self, d: u32, c: u8, ctl: u8, v: u8) -> Result<()> {
            self.0.push(Msg::Ctrl(d, c, ctl, v));
            Ok(())
        }
        fn pitchbend(&mut self, d: u32, c: u8, b: u16) -> Result<()> {
            self.0.push(Msg::Bend(d, c, b));
            Ok(())
        }
        fn set_tempo(&mut self, d: u32, _t: &Tempo) -> Result<()> {
            self.0.push(Msg::Tempo(d));
            Ok(())
        }
        fn end_of_song(&mut self, d: u32) -> Result<()> {
            self.0.push(Msg::EndOfSong(d));
            Ok(())
        }
    }

    fn midi_song(events: Vec<TrackEvent>) -> Arc<Music> {
        let mut music = Music::default();
        music.patches.push(Patch::midi(MidiPatch {
            midi_patch: 40,
            percussion: false,
        }));
        music.track_info = vec![TrackInfo {
            channel_type: ChannelType::Midi,
            channel_index: 3,
        }];
        music.ticks_per_track = 32;
        music.patterns = vec![vec![events]];
        music.pattern_order = vec![0];
        music.into()
    }

    fn on_event(delay: u32, millihertz: u32, velocity: Option<u8>) -> TrackEvent {
        TrackEvent {
            delay,
            event: Event::NoteOn {
                instrument: 0,
                millihertz,
                velocity,
            },
        }
    }

    #[test]
    fn note_on_emits_patch_change_then_note() {
        let music = midi_song(vec![
            on_event(4, 440_000, Some(200)),
            TrackEvent {
                delay: 8,
                event: Event::NoteOff,
            },
        ]);
        let mut conv = MidiConverter::new(Capture::default(), music, MidiFlags::empty());
        conv.handle_all_events(EventOrder::OrderRowTrack, 1).unwrap();
        let msgs = &conv.sink_mut().0;
        assert_eq!(
            msgs[..3],
            [
                Msg::Patch(4, 3, 40),
                Msg::On(0, 3, 69, 100),
                Msg::Off(8, 3, 69),
            ]
        );
        // Trailing silence reaches the end-of-song marker
        assert_eq!(*msgs.last().unwrap(), Msg::EndOfSong(20));
    }

    #[test]
    fn off_grid_pitch_bends_before_note_on() {
        let quarter_up = crate::midi::midi_to_freq(69.25);
        let music = midi_song(vec![on_event(0, quarter_up, None)]);
        let mut conv = MidiConverter::new(Capture::default(), music, MidiFlags::empty());
        conv.handle_all_events(EventOrder::OrderRowTrack, 1).unwrap();
        let msgs = &conv.sink_mut().0;
        let Msg::Bend(_, 3, bend) = msgs[1] else {
            panic!("expected pitchbend before note-on, got {msgs:?}");
        };
        assert!((bend as i32 - (8192 + 1024)).abs() <= 8);
        assert!(matches!(msgs[2], Msg::On(0, 3, 69, _)));
    }

    #[test]
    fn integer_notes_only_suppresses_bends() {
        let quarter_up = crate::midi::midi_to_freq(69.25);
        let music = midi_song(vec![on_event(0, quarter_up, None)]);
        let mut conv =
            MidiConverter::new(Capture::default(), music, MidiFlags::INTEGER_NOTES_ONLY);
        conv.handle_all_events(EventOrder::OrderRowTrack, 1).unwrap();
        assert!(!conv
            .sink_mut()
            .0
            .iter()
            .any(|m| matches!(m, Msg::Bend(..))));
    }

    #[test]
    fn retrigger_keys_off_previous_note() {
        let music = midi_song(vec![on_event(0, 440_000, None), on_event(4, 523_251, None)]);
        let mut conv = MidiConverter::new(Capture::default(), music, MidiFlags::empty());
        conv.handle_all_events(EventOrder::OrderRowTrack, 1).unwrap();
        let msgs = &conv.sink_mut().0;
        let off_pos = msgs.iter().position(|m| matches!(m, Msg::Off(..))).unwrap();
        let second_on = msgs
            .iter()
            .rposition(|m| matches!(m, Msg::On(..)))
            .unwrap();
        assert!(off_pos < second_on);
    }

    #[test]
    fn tempo_change_becomes_meta_event_unless_basic() {
        let mut fast = Tempo::default();
        fast.us_per_tick = 100_000.0;
        let events = vec![TrackEvent {
            delay: 2,
            event: Event::Tempo(fast),
        }];
        let music = midi_song(events);
        let mut conv = MidiConverter::new(Capture::default(), music.clone(), MidiFlags::empty());
        conv.handle_all_events(EventOrder::OrderRowTrack, 1).unwrap();
        assert!(conv.sink_mut().0.contains(&Msg::Tempo(2)));

        let mut conv =
            MidiConverter::new(Capture::default(), music, MidiFlags::BASIC_MIDI_ONLY);
        conv.handle_all_events(EventOrder::OrderRowTrack, 1).unwrap();
        assert!(!conv.sink_mut().0.iter().any(|m| matches!(m, Msg::Tempo(_))));
    }

    #[test]
    fn cmf_controllers_for_rhythm_and_depth() {
        let events = vec![
            TrackEvent {
                delay: 0,
                event: Event::Configuration(ConfigurationEvent::EnableDeepTremolo {
                    chip: 0,
                    enable: false,
                }),
            },
            TrackEvent {
                delay: 0,
                event: Event::Configuration(ConfigurationEvent::EnableRhythm(true)),
            },
            on_event(0, 440_000, None),
        ];
        let music = midi_song(events);
        let mut conv =
            MidiConverter::new(Capture::default(), music, MidiFlags::CMF_EXTENSIONS);
        conv.handle_all_events(EventOrder::OrderRowTrack, 1).unwrap();
        let msgs = &conv.sink_mut().0;
        // Rhythm mode controller fires immediately
        assert!(msgs.contains(&Msg::Ctrl(0, 0, 0x67, 1)));
        // Depth change is batched onto the next note-on: tremolo off,
        // vibrato still on (both default on under CMF extensions)
        assert!(msgs.contains(&Msg::Ctrl(0, 0, 0x63, 1)));
    }

    #[test]
    fn volume_effect_is_not_emitted() {
        let events = vec![
            on_event(0, 440_000, None),
            TrackEvent {
                delay: 2,
                event: Event::Effect(Effect::Volume(64)),
            },
        ];
        let music = midi_song(events);
        let mut conv = MidiConverter::new(Capture::default(), music, MidiFlags::empty());
        conv.handle_all_events(EventOrder::OrderRowTrack, 1).unwrap();
        // The effect only contributes its delay, carried by end-of-song
        assert_eq!(*conv.sink_mut().0.last().unwrap(), Msg::EndOfSong(32));
    }
}
