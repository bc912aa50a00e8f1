//! Shared machinery for formats that store raw OPL register data
//!
//! [`OplDecoder`] turns a stream of timed register writes back into the
//! event model: keyon edges become notes, frequency changes under a held
//! note become pitchbends, and instrument settings are captured into a
//! deduplicated patch bank at each note start. [`OplEncoder`] runs the
//! opposite direction through the event dispatcher and OPL converter.

use std::sync::Arc;

use log::warn;

use crate::dispatch::{EventHandler, EventOrder};
use crate::error::Result;
use crate::model::{
    ChannelType, ConfigurationEvent, Effect, Event, Music, OplOperator, OplPatch, Patch, Rhythm,
    TrackEvent, TrackInfo,
};
use crate::opl::{
    fnum_to_millihertz, log_volume_to_lin_velocity, op_offset_car, op_offset_mod, OplConverter,
    OplEvent, OplWriteFlags, BASE_ATCK_DCAY, BASE_CHAR_MULT, BASE_FEED_CONN, BASE_RHYTHM,
    BASE_SCAL_LEVL, BASE_SUST_RLSE, BASE_WAVE, OPLBIT_KEYON,
};
use crate::tempo::Tempo;

/// Melodic tracks per chip in the decoded layout
const MELODIC_TRACKS: usize = 9;
/// First percussion track (after both chips' melodic tracks)
const FIRST_PERC_TRACK: usize = MELODIC_TRACKS * 2;
/// Total decoded tracks: 9 melodic per chip plus 5 rhythm voices
const TOTAL_TRACKS: usize = FIRST_PERC_TRACK + 5;

/// Rhythm voice table: keyon bit position, source channel, patch role
const PERC_SOURCE: [(usize, Rhythm); 5] = [
    (7, Rhythm::HiHat),
    (8, Rhythm::TopCymbal),
    (8, Rhythm::TomTom),
    (7, Rhythm::SnareDrum),
    (6, Rhythm::BassDrum),
];

/// Builds a [`Music`] from a stream of timed OPL register writes
pub struct OplDecoder {
    fnum_conversion: f64,
    opl_state: [[u8; 256]; 2],
    last_tick: u32,
    patches: Vec<OplPatch>,
    tracks: Vec<Vec<TrackEvent>>,
    track_time: Vec<u32>,
}

impl OplDecoder {
    /// Create a decoder using the given fnum conversion factor
    pub fn new(fnum_conversion: f64) -> Self {
        OplDecoder {
            fnum_conversion,
            opl_state: [[0; 256]; 2],
            last_tick: 0,
            patches: Vec::new(),
            tracks: vec![Vec::new(); TOTAL_TRACKS],
            track_time: vec![0; TOTAL_TRACKS],
        }
    }

    /// Process one register write, preceded by `delay` ticks
    pub fn write(&mut self, delay: u32, chip: u8, reg: u8, val: u8) {
        let chip = (chip & 1) as usize;
        self.last_tick += delay;

        let opl_channel = (reg & 0x0F) as usize; // only for 0xA0/0xB0/0xC0
        match reg & 0xF0 {
            0x00 => {
                if reg == 0x01 && self.bits_changed(chip, reg, val, 0x20) {
                    self.push_config(ConfigurationEvent::EnableWaveSel(val & 0x20 != 0));
                } else if reg == 0x05 && self.bits_changed(chip, reg, val, 0x01) {
                    self.push_config(ConfigurationEvent::EnableOpl3(val & 0x01 != 0));
                }
            }
            0xA0 if opl_channel <= 8 => {
                let keyed =
                    self.opl_state[chip][0xB0 | opl_channel] & OPLBIT_KEYON != 0;
                if keyed && self.bits_changed(chip, reg, val, 0xFF) {
                    // Pitch moved while the note was sounding
                    let b0 = self.opl_state[chip][0xB0 | opl_channel];
                    self.push_pitchbend(chip, opl_channel, val, b0);
                }
            }
            0xB0 => {
                if reg == 0xBD {
                    self.decode_rhythm_register(chip, val);
                } else if opl_channel <= 8 {
                    if self.bits_changed(chip, reg, val, OPLBIT_KEYON) {
                        let track = chip * MELODIC_TRACKS + opl_channel;
                        if val & OPLBIT_KEYON != 0 {
                            self.push_note_on(chip, opl_channel, Rhythm::Melodic, track, val);
                        } else {
                            self.push_note_off(track);
                        }
                    } else if val & OPLBIT_KEYON != 0 && self.bits_changed(chip, reg, val, 0x1F) {
                        // Note already on and the pitch changed
                        let a0 = self.opl_state[chip][0xA0 | opl_channel];
                        self.push_pitchbend(chip, opl_channel, a0, val);
                    }
                }
            }
            _ => {}
        }

        self.opl_state[chip][reg as usize] = val;
    }

    /// Account trailing ticks not followed by any register write
    pub fn add_delay(&mut self, delay: u32) {
        self.last_tick += delay;
    }

    /// Finish decoding and assemble the song
    ///
    /// Produces a single pattern holding one track per used channel, with
    /// the captured patch bank and the given initial tempo.
    pub fn finish(self, initial_tempo: Tempo) -> Music {
        let mut music = Music::default();
        music.initial_tempo = initial_tempo;
        for patch in self.patches {
            music.patches.push(Patch::opl(patch));
        }

        let mut pattern = Vec::new();
        for (index, track) in self.tracks.into_iter().enumerate() {
            if track.is_empty() && index != 0 {
                continue; // unused channel; track 0 stays as the config home
            }
            music.track_info.push(Self::binding_for(index));
            pattern.push(track);
        }
        music.patterns = vec![pattern];

        music.pattern_order = vec![0];
        music.loop_dest = None;
        music.ticks_per_track = self.last_tick.max(1);
        music
    }

    fn binding_for(track_index: usize) -> TrackInfo {
        if track_index < FIRST_PERC_TRACK {
            TrackInfo {
                // Melodic tracks bind 1:1 onto channels 0-17
                channel_type: ChannelType::Opl,
                channel_index: track_index,
            }
        } else {
            TrackInfo {
                channel_type: ChannelType::OplPerc,
                channel_index: track_index - FIRST_PERC_TRACK,
            }
        }
    }

    fn bits_changed(&self, chip: usize, reg: u8, val: u8, mask: u8) -> bool {
        (self.opl_state[chip][reg as usize] ^ val) & mask != 0
    }

    /// Append an event to a track, with the delay since the track's last one
    fn push_event(&mut self, track: usize, event: Event) {
        let delay = self.last_tick - self.track_time[track];
        self.track_time[track] = self.last_tick;
        self.tracks[track].push(TrackEvent { delay, event });
    }

    fn push_config(&mut self, ev: ConfigurationEvent) {
        // Global events live on the first track, which is always OPL-bound
        self.push_event(0, Event::Configuration(ev));
    }

    /// Keyon and depth bits of register 0xBD
    fn decode_rhythm_register(&mut self, chip: usize, val: u8) {
        let old = self.opl_state[chip][BASE_RHYTHM as usize];
        let changed = old ^ val;
        if val & 0x20 != 0 {
            for p in 0..5 {
                let key_bit = 1u8 << p;
                // A voice (re)starts when rhythm mode just came on with its
                // bit set, or its keyon bit itself changed
                if (changed & 0x20 != 0 && val & key_bit != 0) || changed & key_bit != 0 {
                    let track = FIRST_PERC_TRACK + p;
                    if val & key_bit != 0 {
                        let (channel, rhythm) = PERC_SOURCE[p];
                        let b0 = self.opl_state[chip][0xB0 | channel];
                        self.push_note_on(chip, channel, rhythm, track, b0);
                    } else {
                        self.push_note_off(track);
                    }
                }
            }
        } else if changed & 0x20 != 0 {
            // Rhythm mode switched off: silence whatever was playing
            for p in 0..5 {
                if old & (1 << p) != 0 {
                    self.push_note_off(FIRST_PERC_TRACK + p);
                }
            }
        }
        if changed & 0x80 != 0 {
            self.push_config(ConfigurationEvent::EnableDeepTremolo {
                chip: chip as u8,
                enable: val & 0x80 != 0,
            });
        }
        if changed & 0x40 != 0 {
            self.push_config(ConfigurationEvent::EnableDeepVibrato {
                chip: chip as u8,
                enable: val & 0x40 != 0,
            });
        }
    }

    /// Capture the channel's current instrument settings
    fn current_patch(&self, chip: usize, opl_channel: usize) -> OplPatch {
        let op_settings = |op: u8| -> OplOperator {
            let s = &self.opl_state[chip];
            OplOperator {
                enable_tremolo: s[(BASE_CHAR_MULT | op) as usize] & 0x80 != 0,
                enable_vibrato: s[(BASE_CHAR_MULT | op) as usize] & 0x40 != 0,
                enable_sustain: s[(BASE_CHAR_MULT | op) as usize] & 0x20 != 0,
                enable_ksr: s[(BASE_CHAR_MULT | op) as usize] & 0x10 != 0,
                freq_mult: s[(BASE_CHAR_MULT | op) as usize] & 0x0F,
                scale_level: s[(BASE_SCAL_LEVL | op) as usize] >> 6,
                output_level: s[(BASE_SCAL_LEVL | op) as usize] & 0x3F,
                attack_rate: s[(BASE_ATCK_DCAY | op) as usize] >> 4,
                decay_rate: s[(BASE_ATCK_DCAY | op) as usize] & 0x0F,
                sustain_rate: s[(BASE_SUST_RLSE | op) as usize] >> 4,
                release_rate: s[(BASE_SUST_RLSE | op) as usize] & 0x0F,
                wave_select: s[(BASE_WAVE | op) as usize] & 0x07,
            }
        };
        let feed_conn = self.opl_state[chip][(BASE_FEED_CONN as usize) | opl_channel];
        OplPatch {
            modulator: op_settings(op_offset_mod(opl_channel)),
            carrier: op_settings(op_offset_car(opl_channel)),
            feedback: (feed_conn >> 1) & 0x07,
            connection: feed_conn & 1 != 0,
            rhythm: Rhythm::Melodic,
        }
    }

    /// Deduplicate a captured patch into the bank, returning its index
    fn save_patch(&mut self, patch: OplPatch) -> usize {
        if let Some(i) = self.patches.iter().position(|p| p.same_voice(&patch)) {
            return i;
        }
        self.patches.push(patch);
        self.patches.len() - 1
    }

    fn push_note_on(
        &mut self,
        chip: usize,
        opl_channel: usize,
        rhythm: Rhythm,
        track: usize,
        b0_val: u8,
    ) {
        let fnum = (((b0_val & 0x03) as u16) << 8) | self.opl_state[chip][0xA0 | opl_channel] as u16;
        let block = (b0_val >> 2) & 0x07;
        let millihertz = fnum_to_millihertz(fnum, block, self.fnum_conversion);

        let car_level =
            self.opl_state[chip][(BASE_SCAL_LEVL | op_offset_car(opl_channel)) as usize] & 0x3F;
        let velocity = log_volume_to_lin_velocity(63 - car_level as u32, 63) as u8;

        let mut patch = self.current_patch(chip, opl_channel);
        patch.rhythm = rhythm;
        if self.patches.is_empty() {
            warn!("opl-decode: note played before any instrument was set, capturing one");
        }
        let instrument = self.save_patch(patch);

        self.push_event(
            track,
            Event::NoteOn {
                instrument,
                millihertz,
                velocity: Some(velocity),
            },
        );
    }

    fn push_note_off(&mut self, track: usize) {
        self.push_event(track, Event::NoteOff);
    }

    fn push_pitchbend(&mut self, chip: usize, opl_channel: usize, a0_val: u8, b0_val: u8) {
        let fnum = (((b0_val & 0x03) as u16) << 8) | a0_val as u16;
        let block = (b0_val >> 2) & 0x07;
        let millihertz = fnum_to_millihertz(fnum, block, self.fnum_conversion);

        let track = chip * MELODIC_TRACKS + opl_channel;
        // The OPL pitch is spread over two registers; a bend already
        // recorded at this tick is updated rather than duplicated
        if self.track_time[track] == self.last_tick {
            if let Some(TrackEvent {
                event: Event::Effect(Effect::Pitchbend(hz)),
                ..
            }) = self.tracks[track].last_mut()
            {
                *hz = millihertz;
                return;
            }
        }
        self.push_event(track, Event::Effect(Effect::Pitchbend(millihertz)));
    }
}

/// Streams a song's events out as timed OPL register writes
pub struct OplEncoder;

impl OplEncoder {
    /// Convert `music` into register writes delivered to `sink`
    ///
    /// Rhythm mode is enabled up front when the song has rhythm tracks, the
    /// way playback does it, so percussive notes are accepted.
    pub fn encode<F>(
        music: &Music,
        fnum_conversion: f64,
        flags: OplWriteFlags,
        sink: F,
    ) -> Result<()>
    where
        F: FnMut(&OplEvent) -> Result<()>,
    {
        let shared: Arc<Music> = Arc::new(music.clone());
        let mut converter = OplConverter::new(sink, shared.clone(), fnum_conversion, flags);

        if let Some(track) = shared
            .track_info
            .iter()
            .position(|ti| ti.channel_type == ChannelType::OplPerc)
        {
            converter.configuration(0, track, 0, &ConfigurationEvent::EnableRhythm(true))?;
        }

        converter.handle_all_events(EventOrder::OrderRowTrack, 1)?;
        Ok(())
    }
}
