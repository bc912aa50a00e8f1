//! Conversion of song events into OPL register writes
//!
//! Used both for real-time playback (the writes feed an emulator) and for
//! saving songs into formats that store raw OPL data (the writes feed a file
//! encoder). Redundant register writes are filtered out against a cached
//! register file, and delays are coalesced so a single delay precedes the
//! next meaningful write.

use std::collections::HashMap;
use std::sync::Arc;

use bitflags::bitflags;
use log::warn;

use super::util::{
    lin_velocity_to_log_volume, millihertz_to_fnum, op_offset_car, op_offset_mod, BASE_ATCK_DCAY,
    BASE_CHAR_MULT, BASE_FEED_CONN, BASE_SCAL_LEVL, BASE_SUST_RLSE, BASE_WAVE, OPLBIT_KEYON,
    OPL_MAX_CHANNELS,
};
use crate::dispatch::{EventDispatcher, EventHandler, EventOrder, JumpControl, Position};
use crate::error::{Error, Result};
use crate::model::{
    ChannelType, ConfigurationEvent, Effect, GotoEvent, Music, OplPatch, PatchBank, TrackInfo,
    MIDI_PATCHES,
};
use crate::tempo::Tempo;

bitflags! {
    /// Flags controlling conversion to OPL data
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OplWriteFlags: u32 {
        /// Disable pitchbends
        const INTEGER_NOTES_ONLY = 0x01;
        /// Don't use the first channel (reserved for e.g. in-game AdLib SFX)
        const RESERVE_FIRST_CHAN = 0x02;
        /// Target is an OPL2 chip only; no OPL3 / dual OPL2 channels
        const OPL2_ONLY = 0x04;
    }
}

/// A single register write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OplWrite {
    /// Which OPL chip (register bank) to write to, 0 or 1
    pub chip: u8,
    /// OPL register
    pub reg: u8,
    /// Value to write
    pub val: u8,
}

/// One record delivered to an [`OplSink`]
///
/// The delay is in ticks and always occurs *before* the register write is
/// actioned. A record may carry a delay alone (trailing silence), a register
/// write, a tempo change, or a combination; a new tempo applies from this
/// record onwards, the delay in the same record already running at it.
#[derive(Debug, Clone, PartialEq)]
pub struct OplEvent {
    /// Ticks to wait before actioning the rest of the record
    pub delay: u32,
    /// Register write, if any
    pub write: Option<OplWrite>,
    /// New song tempo, if it changed
    pub tempo: Option<Tempo>,
}

/// Consumer of converted OPL data
pub trait OplSink {
    /// Handle the next reg/val pair, delay or tempo change
    fn write_next_pair(&mut self, ev: &OplEvent) -> Result<()>;
}

impl<F: FnMut(&OplEvent) -> Result<()>> OplSink for F {
    fn write_next_pair(&mut self, ev: &OplEvent) -> Result<()> {
        self(ev)
    }
}

/// Resolved target of a note: where on the chip it plays
struct OplTarget {
    chip: u8,
    channel: usize,
    write_mod: bool,
    write_car: bool,
}

/// Immediate conversion of incoming events into OPL register writes
///
/// Unsupported instruments (e.g. MIDI patches with no OPL bank installed)
/// don't raise errors; their notes are ignored so a mixed-instrument song can
/// be played in real time without splitting it up first.
pub struct OplConverter<S: OplSink> {
    sink: S,
    music: Arc<Music>,
    fnum_conversion: f64,
    flags: OplWriteFlags,
    /// Optional patch bank mapping MIDI programs onto OPL patches. When set,
    /// the converter handles MIDI tracks and mutes OPL ones; entries 0-127
    /// are melodic programs, 128-255 percussion notes.
    bank_midi: Option<Arc<PatchBank>>,

    cached_delay: u32,
    opl_set: [[bool; 256]; 2],
    opl_state: [[u8; 256]; 2],
    mode_opl3: bool,
    mode_rhythm: bool,

    /// OPL channel allocated to each MIDI track
    midi_channel_map: HashMap<usize, usize>,
}

impl<S: OplSink> OplConverter<S> {
    /// Set conversion parameters
    ///
    /// `fnum_conversion` is the frequency conversion constant, normally
    /// [`super::OPL_FNUM_DEFAULT`].
    pub fn new(sink: S, music: Arc<Music>, fnum_conversion: f64, flags: OplWriteFlags) -> Self {
        OplConverter {
            sink,
            music,
            fnum_conversion,
            flags,
            bank_midi: None,
            cached_delay: 0,
            opl_set: [[false; 256]; 2],
            opl_state: [[0; 256]; 2],
            mode_opl3: false,
            mode_rhythm: false,
            midi_channel_map: HashMap::new(),
        }
    }

    /// Set the OPL patches to use for MIDI instruments
    ///
    /// Supplying a bank makes the converter play MIDI tracks (through
    /// dynamically allocated OPL channels) and mute OPL tracks.
    pub fn set_bank_midi(&mut self, bank: Option<Arc<PatchBank>>) {
        self.bank_midi = bank;
    }

    /// Access the sink, e.g. to recover an output buffer
    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Convert the whole song, then flush any trailing delay
    pub fn handle_all_events(&mut self, order: EventOrder, loop_count: u32) -> Result<Position> {
        let music = self.music.clone();
        let mut dispatcher = EventDispatcher::new(&music);
        let pos = dispatcher.handle_all_events(order, self, loop_count)?;
        self.flush()?;
        Ok(pos)
    }

    /// Emit any accumulated trailing delay as a delay-only record
    pub fn flush(&mut self) -> Result<()> {
        let ev = OplEvent {
            delay: self.cached_delay,
            write: None,
            tempo: None,
        };
        self.cached_delay = 0;
        self.sink.write_next_pair(&ev)
    }

    /// Write a register value unless it is already current
    fn process_next_pair(&mut self, chip: u8, reg: u8, val: u8) -> Result<()> {
        let c = chip as usize;
        let r = reg as usize;
        if self.opl_set[c][r] && self.opl_state[c][r] == val {
            return Ok(());
        }
        let ev = OplEvent {
            delay: self.cached_delay,
            write: Some(OplWrite { chip, reg, val }),
            tempo: None,
        };
        self.cached_delay = 0;
        self.sink.write_next_pair(&ev)?;
        self.opl_state[c][r] = val;
        self.opl_set[c][r] = true;
        Ok(())
    }

    /// Program one operator's patch settings (modulator or carrier)
    ///
    /// For the carrier, a note velocity overrides the patch's output level,
    /// converted from the linear 0-255 range into the chip's logarithmic
    /// attenuation. Modulator-only percussion cannot have its volume set so
    /// the modulator always uses the patch level.
    fn write_op_settings(
        &mut self,
        chip: u8,
        channel: usize,
        carrier: bool,
        patch: &OplPatch,
        velocity: Option<u8>,
    ) -> Result<()> {
        let (op, o) = if carrier {
            (op_offset_car(channel), &patch.carrier)
        } else {
            (op_offset_mod(channel), &patch.modulator)
        };
        let mut output_level = o.output_level as u32;
        if carrier {
            if let Some(vel) = velocity {
                output_level = 63 - lin_velocity_to_log_volume(vel as u32, 63);
            }
        }
        let o = o.clone();

        self.process_next_pair(
            chip,
            BASE_CHAR_MULT | op,
            ((o.enable_tremolo as u8) << 7)
                | ((o.enable_vibrato as u8) << 6)
                | ((o.enable_sustain as u8) << 5)
                | ((o.enable_ksr as u8) << 4)
                | (o.freq_mult & 0x0F),
        )?;
        self.process_next_pair(
            chip,
            BASE_SCAL_LEVL | op,
            (o.scale_level << 6) | (output_level as u8 & 0x3F),
        )?;
        self.process_next_pair(
            chip,
            BASE_ATCK_DCAY | op,
            (o.attack_rate << 4) | (o.decay_rate & 0x0F),
        )?;
        self.process_next_pair(
            chip,
            BASE_SUST_RLSE | op,
            (o.sustain_rate << 4) | (o.release_rate & 0x0F),
        )?;
        self.process_next_pair(chip, BASE_WAVE | op, o.wave_select & 0x07)?;
        Ok(())
    }

    /// Resolve which chip, channel and operators a track's note uses
    ///
    /// Returns `None` when the note should be dropped (no free channel for a
    /// MIDI allocation, or an OPL3 channel without OPL3 hardware).
    fn get_opl_channel(
        &mut self,
        ti: &TrackInfo,
        track_index: usize,
    ) -> Result<Option<OplTarget>> {
        match ti.channel_type {
            ChannelType::OplPerc => {
                let (channel, write_mod, write_car) = match ti.channel_index {
                    4 => (6, true, true),   // bass drum (mod+car)
                    3 => (7, false, true),  // snare (car)
                    2 => (8, true, false),  // tom-tom (mod)
                    1 => (8, false, true),  // top cymbal (car)
                    0 => (7, true, false),  // hi-hat (mod)
                    other => {
                        return Err(Error::ChannelMismatch(format!(
                            "OPL percussion channel out of range: {other} is not in 0 <= x <= 4"
                        )))
                    }
                };
                Ok(Some(OplTarget {
                    chip: 0,
                    channel,
                    write_mod,
                    write_car,
                }))
            }
            ChannelType::Opl | ChannelType::Any => {
                if ti.channel_index == 0 && self.flags.contains(OplWriteFlags::RESERVE_FIRST_CHAN) {
                    return Err(Error::FormatLimitation(
                        "OPL channel 0 cannot be used in this format.  Please select a \
                         different channel."
                            .into(),
                    ));
                }
                let (chip, channel) = if ti.channel_index < 9 {
                    (0, ti.channel_index)
                } else if ti.channel_index < OPL_MAX_CHANNELS {
                    if self.flags.contains(OplWriteFlags::OPL2_ONLY) {
                        warn!(
                            "opl: channel {} requires a second chip, dropping note (OPL2 only)",
                            ti.channel_index
                        );
                        return Ok(None);
                    }
                    (1, ti.channel_index - 9)
                } else {
                    return Err(Error::OutOfRange(format!(
                        "OPL channel {} is out of range, this format only supports up to \
                         and including channel {}",
                        ti.channel_index,
                        if self.flags.contains(OplWriteFlags::OPL2_ONLY) {
                            8
                        } else {
                            17
                        }
                    )));
                };
                Ok(Some(OplTarget {
                    chip,
                    channel,
                    write_mod: true,
                    write_car: true,
                }))
            }
            ChannelType::Midi => {
                let max_channels = if self.flags.contains(OplWriteFlags::OPL2_ONLY) {
                    9
                } else {
                    OPL_MAX_CHANNELS
                };
                let raw = match self.midi_channel_map.get(&track_index) {
                    Some(&raw) => Some(raw),
                    None => {
                        // Allocate the lowest free OPL channel for this track
                        let mut in_use = [false; OPL_MAX_CHANNELS];
                        for &used in self.midi_channel_map.values() {
                            in_use[used] = true;
                        }
                        let free = (0..max_channels).find(|&c| !in_use[c]);
                        match free {
                            Some(c) => {
                                self.midi_channel_map.insert(track_index, c);
                                Some(c)
                            }
                            None => {
                                warn!(
                                    "opl: all {max_channels} channels in use for MIDI, \
                                     dropping a note"
                                );
                                None
                            }
                        }
                    }
                };
                Ok(raw.map(|raw| OplTarget {
                    chip: (raw >= 9) as u8,
                    channel: if raw >= 9 { raw - 9 } else { raw },
                    write_mod: true,
                    write_car: true,
                }))
            }
            _ => Ok(None),
        }
    }

    /// Free a MIDI track's OPL channel allocation
    fn clear_opl_channel(&mut self, track_index: usize) {
        self.midi_channel_map.remove(&track_index);
    }

    /// Resolve the OPL patch to sound for this note, if any
    ///
    /// With a MIDI bank installed only MIDI tracks sound, their programs
    /// mapped through the bank; otherwise only OPL tracks sound.
    fn resolve_patch(&self, ti: &TrackInfo, instrument: usize) -> Result<Option<OplPatch>> {
        let patch = self.music.patches.get(instrument).ok_or_else(|| {
            Error::BadPatch(format!(
                "Instrument bank too small - tried to play note with instrument #{} but \
                 patch bank only has {} instruments.",
                instrument + 1,
                self.music.patches.len()
            ))
        })?;

        if let Some(bank) = &self.bank_midi {
            if !matches!(ti.channel_type, ChannelType::Midi | ChannelType::Any) {
                return Ok(None);
            }
            let Some(inst_midi) = patch.as_midi() else {
                return Ok(None); // non-MIDI instrument on a MIDI channel
            };
            let mut target = inst_midi.midi_patch as usize;
            if inst_midi.percussion {
                target += MIDI_PATCHES;
            }
            match bank.get(target) {
                Some(p) => Ok(p.as_opl().cloned()),
                None => {
                    warn!(
                        "opl: dropping MIDI note, no entry in MIDI bank for {}patch #{}",
                        if inst_midi.percussion { "percussion " } else { "" },
                        inst_midi.midi_patch
                    );
                    Ok(None)
                }
            }
        } else {
            if !matches!(
                ti.channel_type,
                ChannelType::Opl | ChannelType::OplPerc | ChannelType::Any
            ) {
                return Ok(None);
            }
            if ti.channel_type == ChannelType::OplPerc && !self.mode_rhythm {
                warn!("opl: ignoring rhythm channel in non-rhythm mode");
                return Ok(None);
            }
            if ti.channel_type == ChannelType::Opl && !self.mode_opl3 && ti.channel_index >= 9 {
                warn!("opl: ignoring OPL3 channel in OPL2 mode");
                return Ok(None);
            }
            Ok(patch.as_opl().cloned())
        }
    }

    /// True when this converter should look at events on the given track
    fn wants_track(&self, ti: &TrackInfo) -> bool {
        match ti.channel_type {
            ChannelType::Opl | ChannelType::OplPerc | ChannelType::Any => self.bank_midi.is_none(),
            ChannelType::Midi => self.bank_midi.is_some(),
            _ => false,
        }
    }

    fn track_info(&self, track_index: usize) -> Result<TrackInfo> {
        self.music
            .track_info
            .get(track_index)
            .copied()
            .ok_or_else(|| {
                Error::OutOfRange(format!("track {track_index} has no channel binding"))
            })
    }
}

impl<S: OplSink> EventHandler for OplConverter<S> {
    fn end_of_pattern(&mut self, delay: u32) {
        self.cached_delay += delay;
    }

    fn tempo_event(&mut self, delay: u32, _: usize, _: usize, tempo: &Tempo) -> Result<bool> {
        debug_assert!(tempo.us_per_tick > 0.0);
        self.cached_delay += delay;
        let ev = OplEvent {
            delay: self.cached_delay,
            write: None,
            tempo: Some(tempo.clone()),
        };
        self.cached_delay = 0;
        self.sink.write_next_pair(&ev)?;
        Ok(true)
    }

    fn note_on(
        &mut self,
        delay: u32,
        track_index: usize,
        _pattern_index: usize,
        instrument: usize,
        millihertz: u32,
        velocity: Option<u8>,
    ) -> Result<bool> {
        // Cache the delay so it precedes whatever register write comes next
        self.cached_delay += delay;

        let ti = self.track_info(track_index)?;
        let Some(patch) = self.resolve_patch(&ti, instrument)? else {
            return Ok(true);
        };
        let Some(target) = self.get_opl_channel(&ti, track_index)? else {
            return Ok(true);
        };
        let chip = target.chip as usize;

        // If a note is still sounding here, key it off first so the new
        // settings produce a clean note instead of morphing the old one.
        if ti.channel_type == ChannelType::OplPerc {
            let key_bit = 1 << ti.channel_index;
            if self.opl_state[chip][0xBD] & key_bit != 0 {
                let val = self.opl_state[chip][0xBD] ^ key_bit;
                self.process_next_pair(target.chip, 0xBD, val)?;
            }
        } else {
            let reg = 0xB0 | target.channel as u8;
            if self.opl_state[chip][reg as usize] & OPLBIT_KEYON != 0 {
                let val = self.opl_state[chip][reg as usize] & !OPLBIT_KEYON;
                self.process_next_pair(target.chip, reg, val)?;
            }
        }

        // Always rewrite the patch in case the velocity has changed;
        // redundant register writes are dropped later anyway.
        if target.write_mod {
            self.write_op_settings(target.chip, target.channel, false, &patch, velocity)?;
        }
        if target.write_car {
            self.write_op_settings(target.chip, target.channel, true, &patch, velocity)?;
        }

        let (fnum, block) = millihertz_to_fnum(millihertz, self.fnum_conversion);
        debug_assert!(block <= 7);

        if ti.channel_type != ChannelType::OplPerc {
            // Feedback/connection/panning; ignored on percussive channels
            // L+R panning bits only exist on OPL3
            let panning = if self.mode_opl3 { 0x30 } else { 0x00 };
            self.process_next_pair(
                target.chip,
                BASE_FEED_CONN | target.channel as u8,
                panning | ((patch.feedback & 7) << 1) | (patch.connection as u8),
            )?;
        }

        // Frequency low byte, then keyon with block and fnum high bits.
        // Percussive voices key on through 0xBD instead.
        let keyon = if ti.channel_type != ChannelType::OplPerc {
            OPLBIT_KEYON
        } else {
            0
        };
        self.process_next_pair(target.chip, 0xA0 | target.channel as u8, (fnum & 0xFF) as u8)?;
        self.process_next_pair(
            target.chip,
            0xB0 | target.channel as u8,
            keyon | (block << 2) | ((fnum >> 8) & 0x03) as u8,
        )?;

        if ti.channel_type == ChannelType::OplPerc {
            // Keyon lives in the rhythm register, along with the mode bit
            let key_bit = 1 << ti.channel_index;
            let val = 0x20 | self.opl_state[chip][0xBD] | key_bit;
            self.process_next_pair(target.chip, 0xBD, val)?;
        }
        Ok(true)
    }

    fn note_off(&mut self, delay: u32, track_index: usize, _: usize) -> Result<bool> {
        self.cached_delay += delay;

        let ti = self.track_info(track_index)?;
        if !self.wants_track(&ti) {
            return Ok(true);
        }

        if ti.channel_type == ChannelType::OplPerc {
            let key_bit = 1u8 << ti.channel_index;
            let val = self.opl_state[0][0xBD] & !key_bit;
            self.process_next_pair(0, 0xBD, val)?;
        } else {
            let Some(target) = self.get_opl_channel(&ti, track_index)? else {
                return Ok(true);
            };
            let reg = 0xB0 | target.channel as u8;
            let val = self.opl_state[target.chip as usize][reg as usize] & !OPLBIT_KEYON;
            self.process_next_pair(target.chip, reg, val)?;
            self.clear_opl_channel(track_index);
        }
        Ok(true)
    }

    fn effect(
        &mut self,
        delay: u32,
        track_index: usize,
        _: usize,
        effect: &Effect,
    ) -> Result<bool> {
        self.cached_delay += delay;

        let ti = self.track_info(track_index)?;
        if !self.wants_track(&ti) {
            return Ok(true);
        }
        let Some(target) = self.get_opl_channel(&ti, track_index)? else {
            return Ok(true);
        };
        let chip = target.chip as usize;

        match effect {
            Effect::Pitchbend(millihertz) => {
                if self.flags.contains(OplWriteFlags::INTEGER_NOTES_ONLY) {
                    return Ok(true);
                }
                // Bend the whole channel; only one note plays on it and the
                // bend is reset on the next note anyway.
                let (fnum, block) = millihertz_to_fnum(*millihertz, self.fnum_conversion);
                self.process_next_pair(
                    target.chip,
                    0xA0 | target.channel as u8,
                    (fnum & 0xFF) as u8,
                )?;
                // Keep whatever keyon bit was set before, so rhythm
                // channels don't get a spurious melodic trigger
                let keyon = self.opl_state[chip][0xB0 | target.channel] & OPLBIT_KEYON;
                self.process_next_pair(
                    target.chip,
                    0xB0 | target.channel as u8,
                    keyon | (block << 2) | ((fnum >> 8) & 0x03) as u8,
                )?;
            }
            Effect::Volume(volume) => {
                // Only the carrier's output level controls channel volume
                if target.write_car {
                    let op = op_offset_car(target.channel);
                    let output_level = if *volume == 0 {
                        0x3F
                    } else {
                        (63.0 - 63.0 * (*volume as f64).ln() / 256_f64.ln()) as u32
                    };
                    let reg = BASE_SCAL_LEVL | op;
                    let val = self.opl_state[chip][reg as usize] & !0x3F;
                    self.process_next_pair(target.chip, reg, val | (output_level as u8 & 0x3F))?;
                }
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
        // Jumps are playback control; nothing reaches the chip
        self.cached_delay += delay;
        Ok(true)
    }

    fn configuration(
        &mut self,
        delay: u32,
        track_index: usize,
        _: usize,
        ev: &ConfigurationEvent,
    ) -> Result<bool> {
        self.cached_delay += delay;

        let ti = self.track_info(track_index)?;
        if !self.wants_track(&ti) {
            return Ok(true);
        }

        match *ev {
            ConfigurationEvent::Empty => {}
            ConfigurationEvent::EnableOpl3(enable) => {
                if enable != self.mode_opl3 {
                    self.process_next_pair(1, 0x05, enable as u8)?;
                    self.mode_opl3 = enable;
                }
            }
            ConfigurationEvent::EnableDeepTremolo { chip, enable } => {
                let chip = chip & 1;
                let cur = self.opl_state[chip as usize][0xBD];
                let val = if enable { cur | 0x80 } else { cur & 0x7F };
                self.process_next_pair(chip, 0xBD, val)?;
            }
            ConfigurationEvent::EnableDeepVibrato { chip, enable } => {
                let chip = chip & 1;
                let cur = self.opl_state[chip as usize][0xBD];
                let val = if enable { cur | 0x40 } else { cur & 0xBF };
                self.process_next_pair(chip, 0xBD, val)?;
            }
            ConfigurationEvent::EnableRhythm(enable) => {
                // Rhythm mode itself is enabled by the first rhythm note;
                // switching it off also silences all five percussion voices.
                if self.mode_rhythm && !enable {
                    let val0 = self.opl_state[0][0xBD] & !0x3F;
                    self.process_next_pair(0, 0xBD, val0)?;
                    let val1 = self.opl_state[1][0xBD] & !0x3F;
                    self.process_next_pair(1, 0xBD, val1)?;
                }
                self.mode_rhythm = enable;
            }
            ConfigurationEvent::EnableWaveSel(enable) => {
                self.process_next_pair(0, 0x01, if enable { 0x20 } else { 0x00 })?;
            }
        }
        Ok(true)
    }
}
