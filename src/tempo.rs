//! Playback speed and time signature handling
//!
//! The single authoritative field is `us_per_tick`; every other unit (BPM,
//! module speed/tempo, Hertz, milliseconds) is converted through it. Only
//! `us_per_tick` and `frames_per_tick` affect playback timing, the rest
//! assist with notation and format conversion.

/// Number of microseconds in one second
pub const US_PER_SEC: f64 = 1_000_000.0;

/// Playback speed and time signature of a song at one point in time
///
/// A *tick* is the smallest unit of time between two events. A tick is
/// subdivided into `frames_per_tick` effect frames, used by tracker formats
/// for intra-row effects such as retrig.
#[derive(Debug, Clone, PartialEq)]
pub struct Tempo {
    /// Number of beats in one bar (3 in 3/4 time); notation only
    pub beats_per_bar: u32,
    /// Note length of each beat (4 in 3/4 time); notation only
    pub beat_length: u32,
    /// Number of ticks in a single beat
    pub ticks_per_beat: u32,
    /// Number of microseconds per tick; controls the actual playback speed
    pub us_per_tick: f64,
    /// Number of effect frames per tick, always at least 1
    pub frames_per_tick: u32,
}

impl Default for Tempo {
    /// 120 BPM in 4/4 time, two ticks per beat, six frames per tick.
    fn default() -> Self {
        Tempo {
            beats_per_bar: 4,
            beat_length: 4,
            ticks_per_beat: 2,
            us_per_tick: 250_000.0,
            frames_per_tick: 6,
        }
    }
}

impl Tempo {
    /// Set the tempo in beats per minute
    ///
    /// `ticks_per_beat` must already be correct for the song; use
    /// [`Tempo::set_ticks_per_quarter_note`] first if needed.
    pub fn set_bpm(&mut self, bpm: u32) {
        debug_assert!(bpm > 0);
        self.us_per_tick = 60.0 * US_PER_SEC / (self.ticks_per_beat as f64 * bpm as f64);
    }

    /// Get the tempo as beats per minute
    pub fn bpm(&self) -> u32 {
        (60.0 * US_PER_SEC / (self.ticks_per_beat as f64 * self.us_per_tick)).round() as u32
    }

    /// Set the number of ticks in a quarter note
    ///
    /// Adjusts `ticks_per_beat` according to the current `beat_length`.
    pub fn set_ticks_per_quarter_note(&mut self, ticks: u32) {
        self.ticks_per_beat = self.beat_length / 4 * ticks;
    }

    /// Get the number of ticks in a quarter note
    pub fn ticks_per_quarter_note(&self) -> u32 {
        self.beat_length / 4 * self.ticks_per_beat
    }

    /// Set the number of microseconds in a quarter note
    pub fn set_us_per_quarter_note(&mut self, us: u32) {
        self.us_per_tick = us as f64 / self.ticks_per_quarter_note() as f64;
    }

    /// Get the number of microseconds in a quarter note
    pub fn us_per_quarter_note(&self) -> u32 {
        (self.us_per_tick * self.ticks_per_quarter_note() as f64) as u32
    }

    /// Set the tempo from .mod style speed and tempo values
    ///
    /// `tempo` gives `tempo * 2 / 5` ticks per second, and `speed` is the
    /// number of frames in each tick.
    pub fn set_module(&mut self, speed: u32, tempo: u32) {
        debug_assert!(speed > 0);
        debug_assert!(tempo > 0);
        let mod_ticks_per_sec = tempo as f64 * 2.0 / 5.0;
        self.us_per_tick = US_PER_SEC / mod_ticks_per_sec * speed as f64;
        self.frames_per_tick = speed;
    }

    /// Get the tempo as a .mod "speed" value
    pub fn module_speed(&self) -> u32 {
        self.frames_per_tick
    }

    /// Get the tempo as a .mod "tempo" value
    pub fn module_tempo(&self) -> u32 {
        debug_assert!(self.us_per_tick > 0.0);
        let mod_ticks_per_sec = (US_PER_SEC / self.us_per_tick) * self.frames_per_tick as f64;
        (mod_ticks_per_sec * 5.0 / 2.0).round() as u32
    }

    /// Set the tempo as ticks per second
    pub fn set_hertz(&mut self, hz: u32) {
        debug_assert!(hz > 0);
        self.us_per_tick = US_PER_SEC / hz as f64;
    }

    /// Get the tempo as ticks per second
    pub fn hertz(&self) -> u32 {
        debug_assert!(self.us_per_tick > 0.0);
        (US_PER_SEC / self.us_per_tick).round() as u32
    }

    /// Set the tempo as milliseconds per tick
    pub fn set_ms_per_tick(&mut self, ms: u32) {
        debug_assert!(ms > 0);
        self.us_per_tick = ms as f64 * 1000.0;
    }

    /// Get the tempo as milliseconds per tick
    pub fn ms_per_tick(&self) -> u32 {
        (self.us_per_tick / 1000.0).round() as u32
    }
}
