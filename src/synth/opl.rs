//! Interface to the OPL/FM synthesiser
//!
//! Thin adapter between register writes and PCM output: feeds an embedded
//! [`FmChip`] and mixes its output into the caller's stereo buffer with the
//! shared saturating mix, in fixed-size generation chunks.

use super::fm::FmChip;
use super::{pcm_clip_s16, pcm_mix_s16};

/// Samples generated per chunk
const OPL_FRAME_SIZE: usize = 512;

/// Soft OPL synthesiser rendering register writes into PCM
pub struct SynthOpl {
    output_sample_rate: u32,
    chip: FmChip,
    scratch: Vec<f64>,
}

impl SynthOpl {
    /// Create a synthesiser producing samples at the given output rate
    pub fn new(sample_rate: u32) -> Self {
        SynthOpl {
            output_sample_rate: sample_rate,
            chip: FmChip::new(sample_rate),
            scratch: vec![0.0; OPL_FRAME_SIZE],
        }
    }

    /// Reset the emulator to power-on state
    pub fn reset(&mut self) {
        self.chip = FmChip::new(self.output_sample_rate);
    }

    /// Write a value to an OPL register
    ///
    /// `chip` selects the register bank: 0, or 1 for the second OPL2 /
    /// the OPL3 extension bank.
    pub fn write(&mut self, chip: u8, reg: u8, val: u8) {
        self.chip.write(chip as usize, reg, val);
    }

    /// Synthesise audio and mix it into `output`
    ///
    /// `output` is interleaved stereo 16-bit; existing content is combined
    /// with the synthesised audio using the saturating mix, so callers must
    /// zero the buffer before the first source is mixed in.
    pub fn mix(&mut self, output: &mut [i16]) {
        let mut frames = output.len() / 2;
        let mut out_pos = 0;
        while frames > 0 {
            let count = frames.min(OPL_FRAME_SIZE);
            let chunk = &mut self.scratch[..count];
            self.chip.generate_into(chunk);
            for &sample in chunk.iter() {
                let s = pcm_clip_s16((sample * 32767.0) as i32);
                output[out_pos] = pcm_mix_s16(output[out_pos], s);
                output[out_pos + 1] = pcm_mix_s16(output[out_pos + 1], s);
                out_pos += 2;
            }
            frames -= count;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_a440(synth: &mut SynthOpl) {
        synth.write(0, 0x20, 0x21);
        synth.write(0, 0x23, 0x21);
        synth.write(0, 0x43, 0x00);
        synth.write(0, 0x63, 0xF4);
        synth.write(0, 0x83, 0x77);
        synth.write(0, 0xC0, 0x06);
        synth.write(0, 0xA0, 0x44);
        synth.write(0, 0xB0, 0x32);
    }

    #[test]
    fn mix_adds_into_existing_buffer() {
        let mut synth = SynthOpl::new(44100);
        key_a440(&mut synth);
        let mut buf = vec![0i16; 2048];
        synth.mix(&mut buf);
        assert!(buf.iter().any(|&s| s != 0));
        // Left and right carry the same mono signal
        for frame in buf.chunks_exact(2) {
            assert_eq!(frame[0], frame[1]);
        }
    }

    #[test]
    fn reset_silences_playback() {
        let mut synth = SynthOpl::new(44100);
        key_a440(&mut synth);
        let mut buf = vec![0i16; 1024];
        synth.mix(&mut buf);
        synth.reset();
        let mut silent = vec![0i16; 1024];
        synth.mix(&mut silent);
        assert!(silent.iter().all(|&s| s == 0));
    }
}
