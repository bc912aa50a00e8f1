//! PCM sample voicer
//!
//! Plays looped samples at per-voice resampled rates, mixing every active
//! voice into a stereo 16-bit buffer. Each track is monophonic: a note-on
//! silences whatever the track was playing before.

use std::sync::Arc;

use log::warn;

use super::{pcm_mix_s16, pcm_u8_to_s16};
use crate::dispatch::{EventHandler, JumpControl};
use crate::error::{Error, Result};
use crate::model::{
    ChannelType, ConfigurationEvent, Effect, GotoEvent, Music, PatchBank, PcmPatch,
    MIDI_PATCHES,
};
use crate::tempo::Tempo;

/// How much to dampen the maximum possible volume by
const VOL_DAMPEN: i32 = 4;

/// Middle-C frequency in milliHertz; samples play at their base rate here
pub const FREQ_MIDDLE_C: u32 = 261_625;

/// Where an active voice's patch lives
#[derive(Clone, Copy)]
enum SampleSource {
    /// Index into the song's own patch bank
    Song(usize),
    /// Index into the installed MIDI patch bank
    Bank(usize),
}

/// One currently sounding sample
struct ActiveSample {
    /// Track that owns this voice
    track: usize,
    /// Which patch is sounding
    source: SampleSource,
    /// Playback rate in Hz, already scaled by the note's frequency
    sample_rate: f64,
    /// Position in output samples (not source samples)
    pos: u64,
    /// Volume 0-255
    vol: u8,
}

/// Soft synthesiser voicing PCM patches
pub struct SynthPcm {
    output_sample_rate: u32,
    music: Option<Arc<Music>>,
    bank_midi: Option<Arc<PatchBank>>,
    active: Vec<ActiveSample>,
}

impl SynthPcm {
    /// Create a voicer producing samples at the given output rate
    pub fn new(output_sample_rate: u32) -> Self {
        SynthPcm {
            output_sample_rate,
            music: None,
            bank_midi: None,
            active: Vec::new(),
        }
    }

    /// Set the samples to use for playing MIDI instruments
    ///
    /// A supplied bank makes the voicer play MIDI tracks and mute PCM ones.
    /// Entries 0-127 are GM programs, 128-255 percussion notes.
    pub fn set_bank_midi(&mut self, bank: Option<Arc<PatchBank>>) {
        self.bank_midi = bank;
    }

    /// Silence all voices and bind to a new song
    pub fn reset(&mut self, music: Arc<Music>) {
        self.music = Some(music);
        self.active.clear();
    }

    fn patch_of<'a>(
        music: &'a Music,
        bank_midi: &'a Option<Arc<PatchBank>>,
        source: SampleSource,
    ) -> Option<&'a PcmPatch> {
        match source {
            SampleSource::Song(i) => music.patches.get(i)?.as_pcm(),
            SampleSource::Bank(i) => bank_midi.as_ref()?.get(i)?.as_pcm(),
        }
    }

    /// Mix all active voices into `output` (interleaved stereo, saturating)
    pub fn mix(&mut self, output: &mut [i16]) {
        let frames = output.len() / 2;
        let Some(music) = &self.music else { return };
        let out_rate = self.output_sample_rate as f64;

        let mut i = 0;
        while i < self.active.len() {
            let sample = &mut self.active[i];
            let Some(patch) = Self::patch_of(music, &self.bank_midi, sample.source) else {
                self.active.swap_remove(i);
                continue;
            };
            let bytes_per_sample = match patch.bit_depth {
                8 => 1usize,
                16 => 2usize,
                other => {
                    warn!("synth-pcm: unsupported playback bit depth {other}");
                    self.active.swap_remove(i);
                    continue;
                }
            };
            let data_len = patch.data.len() / bytes_per_sample;
            if data_len == 0 {
                i += 1;
                continue;
            }
            // Length of the repeating region, in source samples
            let len_input = if patch.loop_end > 0 {
                (patch.loop_end as usize).min(data_len)
            } else {
                data_len
            } as u64;
            // Same region measured in output samples at the voice's rate
            let num_output_samples = (len_input as f64 * out_rate / sample.sample_rate) as u64;

            let mut complete = num_output_samples == 0;
            if !complete {
                for frame in output.chunks_exact_mut(2).take(frames) {
                    if sample.pos >= num_output_samples {
                        if patch.loop_end > 0 {
                            // Wrap to the loop start, rescaled to output rate
                            sample.pos =
                                (patch.loop_start as f64 * out_rate / sample.sample_rate) as u64;
                            if sample.pos >= num_output_samples {
                                warn!(
                                    "synth-pcm: silencing instrument with loop start \
                                     beyond end of sample"
                                );
                                complete = true;
                                break;
                            }
                        } else {
                            complete = true;
                            break;
                        }
                    }
                    let pos_input = (len_input * sample.pos / num_output_samples) as usize;
                    debug_assert!((pos_input as u64) < len_input);

                    let s = if bytes_per_sample == 1 {
                        pcm_u8_to_s16(patch.data[pos_input])
                    } else {
                        i16::from_ne_bytes([
                            patch.data[pos_input * 2],
                            patch.data[pos_input * 2 + 1],
                        ])
                    };
                    sample.pos += 1;

                    let s = ((s as i32 * sample.vol as i32 / 255) / VOL_DAMPEN) as i16;
                    frame[0] = pcm_mix_s16(frame[0], s);
                    frame[1] = pcm_mix_s16(frame[1], s);
                }
            }
            if complete {
                self.active.swap_remove(i);
            } else {
                i += 1;
            }
        }
    }

    /// Silence the voice owned by a track, if any
    fn silence_track(&mut self, track_index: usize) {
        self.active.retain(|s| s.track != track_index);
    }
}

impl EventHandler for SynthPcm {
    fn tempo_event(&mut self, _: u32, _: usize, _: usize, _: &Tempo) -> Result<bool> {
        // Tempo is the orchestrator's concern; nothing changes here
        Ok(true)
    }

    fn note_on(
        &mut self,
        _delay: u32,
        track_index: usize,
        _pattern_index: usize,
        instrument: usize,
        millihertz: u32,
        velocity: Option<u8>,
    ) -> Result<bool> {
        let Some(music) = self.music.clone() else {
            return Ok(true);
        };
        let patch = music.patches.get(instrument).ok_or_else(|| {
            Error::BadPatch(format!(
                "Instrument bank too small - tried to play note with instrument #{} but \
                 patch bank only has {} instruments.",
                instrument + 1,
                music.patches.len()
            ))
        })?;

        let ti = music
            .track_info
            .get(track_index)
            .copied()
            .ok_or_else(|| Error::OutOfRange(format!("track {track_index} has no binding")))?;

        let (source, base_rate, default_volume) = if let Some(bank) = &self.bank_midi {
            if !matches!(ti.channel_type, ChannelType::Midi | ChannelType::Any) {
                return Ok(true);
            }
            let Some(inst_midi) = patch.as_midi() else {
                return Ok(true); // non-MIDI instrument on a MIDI channel
            };
            let mut target = inst_midi.midi_patch as usize;
            if inst_midi.percussion {
                target += MIDI_PATCHES;
            }
            let Some(bank_patch) = bank.get(target) else {
                return Ok(true); // bank too small
            };
            let Some(pcm) = bank_patch.as_pcm() else {
                return Ok(true);
            };
            (
                SampleSource::Bank(target),
                pcm.sample_rate,
                bank_patch.default_volume,
            )
        } else {
            if !matches!(ti.channel_type, ChannelType::Pcm | ChannelType::Any) {
                return Ok(true);
            }
            let Some(pcm) = patch.as_pcm() else {
                return Ok(true); // no PCM settings, nothing to play
            };
            (
                SampleSource::Song(instrument),
                pcm.sample_rate,
                patch.default_volume,
            )
        };

        self.silence_track(track_index);

        self.active.push(ActiveSample {
            track: track_index,
            source,
            sample_rate: base_rate as f64 * millihertz as f64 / FREQ_MIDDLE_C as f64,
            pos: 0,
            vol: velocity.unwrap_or(default_volume),
        });
        Ok(true)
    }

    fn note_off(&mut self, _: u32, track_index: usize, _: usize) -> Result<bool> {
        self.silence_track(track_index);
        Ok(true)
    }

    fn effect(&mut self, _: u32, track_index: usize, _: usize, effect: &Effect) -> Result<bool> {
        let Some(music) = &self.music else {
            return Ok(true);
        };
        let bank = &self.bank_midi;
        if let Some(sample) = self.active.iter_mut().find(|s| s.track == track_index) {
            match effect {
                Effect::Pitchbend(millihertz) => {
                    if let Some(patch) = Self::patch_of(music, bank, sample.source) {
                        sample.sample_rate = patch.sample_rate as f64 * *millihertz as f64
                            / FREQ_MIDDLE_C as f64;
                    }
                }
                Effect::Volume(vol) => sample.vol = *vol,
            }
        }
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

    fn configuration(&mut self, _: u32, _: usize, _: usize, _: &ConfigurationEvent) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Patch, TrackInfo};

    /// 100-sample ramp looping in full, 8 kHz base rate
    fn ramp_patch(loop_end: u32) -> PcmPatch {
        PcmPatch {
            sample_rate: 8000,
            bit_depth: 8,
            num_channels: 1,
            loop_start: 0,
            loop_end,
            data: (0..100).map(|i| 0x80 + i as u8).collect(),
        }
    }

    fn pcm_song(patch: PcmPatch) -> Arc<Music> {
        let mut music = Music::default();
        music.patches.push(Patch::pcm(patch));
        music.track_info = vec![TrackInfo {
            channel_type: ChannelType::Pcm,
            channel_index: 0,
        }];
        music.ticks_per_track = 16;
        music.pattern_order = vec![0];
        music.patterns = vec![vec![vec![]]];
        music.into()
    }

    fn start_note(synth: &mut SynthPcm, millihertz: u32, velocity: Option<u8>) {
        synth.note_on(0, 0, 0, 0, millihertz, velocity).unwrap();
    }

    #[test]
    fn looped_sample_repeats_exactly() {
        let music = pcm_song(ramp_patch(100));
        let mut synth = SynthPcm::new(8000);
        synth.reset(music);
        start_note(&mut synth, FREQ_MIDDLE_C, Some(255));

        let mut buf = vec![0i16; 400]; // 200 stereo frames
        synth.mix(&mut buf);

        // At matching rates every output frame is one source sample; the
        // 100-sample loop plays twice
        for j in 0..200 {
            let expect = pcm_u8_to_s16(0x80 + (j % 100) as u8) / VOL_DAMPEN as i16;
            assert_eq!(buf[j * 2], expect, "frame {j}");
            assert_eq!(buf[j * 2 + 1], expect, "frame {j} right");
        }
        // Still running after two passes
        assert_eq!(synth.active.len(), 1);
    }

    #[test]
    fn unlooped_sample_finishes() {
        let music = pcm_song(ramp_patch(0));
        let mut synth = SynthPcm::new(8000);
        synth.reset(music);
        start_note(&mut synth, FREQ_MIDDLE_C, Some(255));

        let mut buf = vec![0i16; 400];
        synth.mix(&mut buf);
        // Plays its 100 samples once, then silence and voice removal
        assert_ne!(buf[0], 0);
        assert_eq!(buf[399], 0);
        assert!(synth.active.is_empty());
    }

    #[test]
    fn octave_up_doubles_playback_rate() {
        let music = pcm_song(ramp_patch(0));
        let mut synth = SynthPcm::new(8000);
        synth.reset(music);
        start_note(&mut synth, FREQ_MIDDLE_C * 2, Some(255));

        let mut buf = vec![0i16; 400];
        synth.mix(&mut buf);
        // 100 source samples at double rate last only 50 output frames
        assert_ne!(buf[49 * 2], 0);
        assert_eq!(buf[50 * 2], 0);
    }

    #[test]
    fn default_velocity_uses_patch_volume() {
        let mut music = Music::default();
        let mut patch = Patch::pcm(ramp_patch(100));
        patch.default_volume = 128;
        music.patches.push(patch);
        music.track_info = vec![TrackInfo {
            channel_type: ChannelType::Pcm,
            channel_index: 0,
        }];
        let music: Arc<Music> = music.into();
        let mut synth = SynthPcm::new(8000);
        synth.reset(music);
        start_note(&mut synth, FREQ_MIDDLE_C, None);
        assert_eq!(synth.active[0].vol, 128);
        // An explicit velocity overrides
        start_note(&mut synth, FREQ_MIDDLE_C, Some(9));
        assert_eq!(synth.active[0].vol, 9);
    }

    #[test]
    fn note_on_is_monophonic_per_track() {
        let music = pcm_song(ramp_patch(100));
        let mut synth = SynthPcm::new(8000);
        synth.reset(music);
        start_note(&mut synth, FREQ_MIDDLE_C, None);
        start_note(&mut synth, FREQ_MIDDLE_C * 2, None);
        assert_eq!(synth.active.len(), 1);
        synth.note_off(0, 0, 0).unwrap();
        assert!(synth.active.is_empty());
    }

    #[test]
    fn volume_and_pitchbend_effects_update_voice() {
        let music = pcm_song(ramp_patch(100));
        let mut synth = SynthPcm::new(8000);
        synth.reset(music);
        start_note(&mut synth, FREQ_MIDDLE_C, Some(255));
        synth.effect(0, 0, 0, &Effect::Volume(33)).unwrap();
        assert_eq!(synth.active[0].vol, 33);
        synth
            .effect(0, 0, 0, &Effect::Pitchbend(FREQ_MIDDLE_C * 2))
            .unwrap();
        assert!((synth.active[0].sample_rate - 16000.0).abs() < 1.0);
    }

    #[test]
    fn bad_instrument_index_is_an_error() {
        let music = pcm_song(ramp_patch(100));
        let mut synth = SynthPcm::new(8000);
        synth.reset(music);
        assert!(matches!(
            synth.note_on(0, 0, 0, 5, FREQ_MIDDLE_C, None),
            Err(Error::BadPatch(_))
        ));
    }

    #[test]
    fn pcm_track_filter() {
        // A PCM voicer without a MIDI bank ignores MIDI tracks
        let mut music = Music::default();
        music.patches.push(Patch::pcm(ramp_patch(100)));
        music.track_info = vec![TrackInfo {
            channel_type: ChannelType::Midi,
            channel_index: 0,
        }];
        let mut synth = SynthPcm::new(8000);
        synth.reset(music.into());
        start_note(&mut synth, FREQ_MIDDLE_C, None);
        assert!(synth.active.is_empty());
    }
}
