//! WAV file export
//!
//! Streams a song through [`Playback::mix`] into a 16-bit PCM WAV file in
//! fixed-size chunks, optionally mixing on past the end of the song so
//! instrument envelopes can fade out.

use std::path::Path;

use crate::error::{Error, Result};
use crate::playback::Playback;

/// Samples rendered per chunk
const SAMPLES_PER_CHUNK: usize = 4096;

/// WAV rendering configuration
#[derive(Debug, Clone)]
pub struct WavConfig {
    /// Output sample rate in Hz
    pub sample_rate: u32,
    /// Output channels, 1 or 2
    pub channels: u16,
    /// Extra milliseconds rendered after the song ends, for release tails
    pub tail_ms: u32,
}

impl Default for WavConfig {
    fn default() -> Self {
        WavConfig {
            sample_rate: 44100,
            channels: 2,
            tail_ms: 250,
        }
    }
}

/// Render a song to a WAV file
///
/// The playback helper must already have a song set (and should be
/// constructed with the same sample rate and channel count as `config`).
/// Rendering runs from the current position until the song ends.
pub fn render_wav<P: AsRef<Path>>(
    playback: &mut Playback,
    output_path: P,
    config: &WavConfig,
) -> Result<()> {
    let spec = hound::WavSpec {
        channels: config.channels,
        sample_rate: config.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(output_path, spec)
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;

    let mut buffer = vec![0i16; SAMPLES_PER_CHUNK];
    let samples_per_ms = config.sample_rate as u64 * config.channels as u64 / 1000;
    let mut tail_samples = config.tail_ms as u64 * samples_per_ms;

    loop {
        buffer.fill(0);
        let pos = playback.mix(&mut buffer);
        for &sample in &buffer {
            writer
                .write_sample(sample)
                .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        }
        if pos.end {
            if tail_samples <= buffer.len() as u64 {
                break;
            }
            tail_samples -= buffer.len() as u64;
        }
    }

    writer
        .finalize()
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;
    Ok(())
}
