//! Two-bank OPL3-class FM synthesis core
//!
//! A register-compatible softsynth for the YM3812/YMF262 family: 18
//! two-operator channels across two register banks, ADSR envelopes, eight
//! waveforms, feedback, tremolo/vibrato LFOs and rhythm mode. Fidelity is
//! "good enough" rather than bit-exact with the hardware; the register
//! interface is the contract.

/// OPL frequency multiplier table, indexed by the MULT register field
const MULT_TABLE: [f64; 16] = [
    0.5, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 10.0, 12.0, 12.0, 15.0, 15.0,
];

/// Attenuation per output-level step, in decibels
const DB_PER_LEVEL_STEP: f64 = 0.75;

/// Tremolo LFO rate in Hertz
const TREMOLO_HZ: f64 = 3.7;
/// Vibrato LFO rate in Hertz
const VIBRATO_HZ: f64 = 6.1;

/// Overall output gain applied to each channel before mixing
const CHANNEL_GAIN: f64 = 0.25;

/// Envelope generator phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EnvPhase {
    Off,
    Attack,
    Decay,
    Sustain,
    Release,
}

/// One FM operator: phase accumulator plus envelope generator
#[derive(Debug, Clone)]
struct Operator {
    // Register-derived settings
    tremolo: bool,
    vibrato: bool,
    sustain_hold: bool,
    freq_mult: f64,
    total_level: f64, // linear gain from the output-level field
    attack_rate: u8,
    decay_rate: u8,
    sustain_level: f64, // linear target after decay
    release_rate: u8,
    wave: u8,

    // Runtime state
    phase: f64, // 0..1
    env: f64,   // linear 0..1
    env_phase: EnvPhase,
    last_out: [f64; 2], // feedback history
}

impl Operator {
    fn new() -> Self {
        Operator {
            tremolo: false,
            vibrato: false,
            sustain_hold: false,
            freq_mult: 1.0,
            total_level: 1.0,
            attack_rate: 0,
            decay_rate: 0,
            sustain_level: 1.0,
            release_rate: 0,
            wave: 0,
            phase: 0.0,
            env: 0.0,
            env_phase: EnvPhase::Off,
            last_out: [0.0; 2],
        }
    }

    fn key_on(&mut self) {
        self.phase = 0.0;
        self.env_phase = EnvPhase::Attack;
    }

    fn key_off(&mut self) {
        if self.env_phase != EnvPhase::Off {
            self.env_phase = EnvPhase::Release;
        }
    }

    /// Per-sample envelope multiplier for a 0-15 rate
    ///
    /// Rate 0 freezes the envelope; rate 15 is near-instant. The curve
    /// halves the time constant per rate step, in the right ballpark for
    /// the hardware without modelling its rate tables exactly.
    fn rate_coeff(rate: u8, sample_rate: f64) -> f64 {
        if rate == 0 {
            return 0.0;
        }
        let seconds = 4.0 * 0.5_f64.powi(rate as i32);
        1.0 - (-1.0 / (seconds * sample_rate)).exp()
    }

    /// Advance the envelope by one sample, returning the current level
    fn step_envelope(&mut self, sample_rate: f64) -> f64 {
        match self.env_phase {
            EnvPhase::Off => {}
            EnvPhase::Attack => {
                let k = Self::rate_coeff(self.attack_rate, sample_rate);
                self.env += (1.0 - self.env) * (k * 8.0).min(1.0);
                if self.env >= 0.999 {
                    self.env = 1.0;
                    self.env_phase = EnvPhase::Decay;
                }
            }
            EnvPhase::Decay => {
                let k = Self::rate_coeff(self.decay_rate, sample_rate);
                self.env -= self.env * k;
                if self.env <= self.sustain_level {
                    self.env = self.sustain_level;
                    self.env_phase = EnvPhase::Sustain;
                }
            }
            EnvPhase::Sustain => {
                if !self.sustain_hold {
                    // Percussive tone: keep decaying at the release rate
                    let k = Self::rate_coeff(self.release_rate, sample_rate);
                    self.env -= self.env * k;
                }
            }
            EnvPhase::Release => {
                let k = Self::rate_coeff(self.release_rate, sample_rate);
                self.env -= self.env * k;
            }
        }
        if self.env < 1.0e-4 && self.env_phase == EnvPhase::Release {
            self.env = 0.0;
            self.env_phase = EnvPhase::Off;
        }
        self.env
    }

    /// Waveform lookup on a 0..1 phase
    fn waveform(&self, phase: f64) -> f64 {
        use std::f64::consts::TAU;
        let p = phase - phase.floor();
        let s = (p * TAU).sin();
        match self.wave & 0x07 {
            0 => s,
            1 => s.max(0.0),                       // half sine
            2 => s.abs(),                          // absolute sine
            3 => {
                // quarter-sine pulses
                if p % 0.5 < 0.25 {
                    s.abs()
                } else {
                    0.0
                }
            }
            4 => {
                // alternating sine: double-rate sine in the first half
                if p < 0.5 {
                    (p * 2.0 * TAU).sin()
                } else {
                    0.0
                }
            }
            5 => {
                if p < 0.5 {
                    (p * 2.0 * TAU).sin().abs()
                } else {
                    0.0
                }
            }
            6 => {
                if p < 0.5 {
                    1.0
                } else {
                    -1.0
                } // square
            }
            _ => {
                // logarithmic sawtooth approximation
                let t = if p < 0.5 { p * 2.0 } else { -2.0 + p * 2.0 };
                t.signum() * (1.0 - t.abs()).powi(3)
            }
        }
    }

    /// Produce one sample given the channel frequency and phase modulation
    fn generate(
        &mut self,
        base_freq: f64,
        phase_mod: f64,
        lfo: (f64, f64),
        sample_rate: f64,
    ) -> f64 {
        let (trem, vib) = lfo;
        let vib_scale = if self.vibrato { vib } else { 1.0 };
        self.phase += base_freq * self.freq_mult * vib_scale / sample_rate;
        let env = self.step_envelope(sample_rate);
        let trem_scale = if self.tremolo { trem } else { 1.0 };
        let out = self.waveform(self.phase + phase_mod) * env * self.total_level * trem_scale;
        self.last_out[1] = self.last_out[0];
        self.last_out[0] = out;
        out
    }

    fn feedback_value(&self, feedback: u8) -> f64 {
        if feedback == 0 {
            return 0.0;
        }
        // Average of the last two outputs, scaled up to ~4 half-cycles
        (self.last_out[0] + self.last_out[1]) * 0.5 * 2.0_f64.powi(feedback as i32 - 7)
    }

    fn silent(&self) -> bool {
        self.env_phase == EnvPhase::Off
    }
}

/// One two-operator channel
#[derive(Debug, Clone)]
struct FmChannel {
    slots: [Operator; 2], // modulator, carrier
    fnum: u16,
    block: u8,
    key_on: bool,
    feedback: u8,
    additive: bool,
}

impl FmChannel {
    fn new() -> Self {
        FmChannel {
            slots: [Operator::new(), Operator::new()],
            fnum: 0,
            block: 0,
            key_on: false,
            feedback: 0,
            additive: false,
        }
    }

    /// Channel base frequency in Hertz
    fn frequency(&self) -> f64 {
        49716.0 * self.fnum as f64 * 2.0_f64.powi(self.block as i32 - 20)
    }

    fn set_key(&mut self, on: bool) {
        if on && !self.key_on {
            self.slots[0].key_on();
            self.slots[1].key_on();
        } else if !on && self.key_on {
            self.slots[0].key_off();
            self.slots[1].key_off();
        }
        self.key_on = on;
    }

    /// Generate one mono sample
    fn generate(&mut self, lfo: (f64, f64), sample_rate: f64) -> f64 {
        if self.slots[0].silent() && self.slots[1].silent() {
            return 0.0;
        }
        let freq = self.frequency();
        let fb = self.slots[0].feedback_value(self.feedback);
        let mod_out = self.slots[0].generate(freq, fb, lfo, sample_rate);
        if self.additive {
            let car = self.slots[1].generate(freq, 0.0, lfo, sample_rate);
            (mod_out + car) * 0.5
        } else {
            self.slots[1].generate(freq, mod_out, lfo, sample_rate)
        }
    }
}

/// Map a register operator offset to (channel, slot) within one bank
fn slot_for_offset(offset: u8) -> Option<(usize, usize)> {
    let group = offset / 8;
    let pos = offset % 8;
    if group > 2 || pos > 5 {
        return None;
    }
    let channel = group as usize * 3 + (pos % 3) as usize;
    let slot = (pos / 3) as usize;
    Some((channel, slot))
}

/// Rhythm voices: keyon bit in 0xBD, channel and which slots sound
const RHYTHM_SLOTS: [(u8, usize, [bool; 2]); 5] = [
    (0x10, 6, [true, true]),  // bass drum: both operators
    (0x08, 7, [false, true]), // snare: carrier
    (0x04, 8, [true, false]), // tom-tom: modulator
    (0x02, 8, [false, true]), // top cymbal: carrier
    (0x01, 7, [true, false]), // hi-hat: modulator
];

/// OPL3-class FM chip: two register banks of nine channels each
pub struct FmChip {
    sample_rate: u32,
    registers: [[u8; 256]; 2],
    channels: [FmChannel; 18],
    rhythm_mode: [bool; 2],
    tremolo_deep: [bool; 2],
    vibrato_deep: [bool; 2],
    lfo_phase: f64,
    /// 23-bit LFSR used to roughen the snare/hi-hat voices
    noise: u32,
}

impl FmChip {
    /// Create a chip producing samples at the given output rate
    pub fn new(sample_rate: u32) -> Self {
        FmChip {
            sample_rate,
            registers: [[0; 256]; 2],
            channels: std::array::from_fn(|_| FmChannel::new()),
            rhythm_mode: [false; 2],
            tremolo_deep: [false; 2],
            vibrato_deep: [false; 2],
            lfo_phase: 0.0,
            noise: 1,
        }
    }

    /// Reset all registers and silence every channel
    pub fn reset(&mut self) {
        *self = FmChip::new(self.sample_rate);
    }

    /// Write a value to a register on one bank
    pub fn write(&mut self, bank: usize, reg: u8, val: u8) {
        let bank = bank & 1;
        self.registers[bank][reg as usize] = val;
        self.apply_register(bank, reg, val);
    }

    /// Current value of a register, for tests and diagnostics
    pub fn register(&self, bank: usize, reg: u8) -> u8 {
        self.registers[bank & 1][reg as usize]
    }

    fn channel_index(bank: usize, channel: u8) -> Option<usize> {
        let channel = channel as usize;
        if channel > 8 {
            return None;
        }
        Some(bank * 9 + channel)
    }

    fn apply_register(&mut self, bank: usize, reg: u8, val: u8) {
        match reg & 0xF0 {
            0x20 | 0x30 => {
                if let Some((ch, slot)) = slot_for_offset(reg & 0x1F) {
                    let op = &mut self.channels[bank * 9 + ch].slots[slot];
                    op.tremolo = val & 0x80 != 0;
                    op.vibrato = val & 0x40 != 0;
                    op.sustain_hold = val & 0x20 != 0;
                    // KSR (bit 4) is not modelled
                    op.freq_mult = MULT_TABLE[(val & 0x0F) as usize];
                }
            }
            0x40 | 0x50 => {
                if let Some((ch, slot)) = slot_for_offset(reg & 0x1F) {
                    let op = &mut self.channels[bank * 9 + ch].slots[slot];
                    // Key scale level (bits 6-7) is not modelled
                    let level = (val & 0x3F) as f64;
                    op.total_level = 10f64.powf(-DB_PER_LEVEL_STEP * level / 20.0);
                }
            }
            0x60 | 0x70 => {
                if let Some((ch, slot)) = slot_for_offset(reg & 0x1F) {
                    let op = &mut self.channels[bank * 9 + ch].slots[slot];
                    op.attack_rate = val >> 4;
                    op.decay_rate = val & 0x0F;
                }
            }
            0x80 | 0x90 => {
                if let Some((ch, slot)) = slot_for_offset(reg & 0x1F) {
                    let op = &mut self.channels[bank * 9 + ch].slots[slot];
                    // Sustain level: 3 dB per step, 15 = effectively silent
                    let sl = (val >> 4) as f64;
                    op.sustain_level = if val >> 4 == 15 {
                        0.0
                    } else {
                        10f64.powf(-3.0 * sl / 20.0)
                    };
                    op.release_rate = val & 0x0F;
                }
            }
            0xA0 => {
                if let Some(ci) = Self::channel_index(bank, reg & 0x0F) {
                    let ch = &mut self.channels[ci];
                    ch.fnum = (ch.fnum & 0x300) | val as u16;
                }
            }
            0xB0 => {
                if reg == 0xBD {
                    self.apply_rhythm(bank, val);
                } else if let Some(ci) = Self::channel_index(bank, reg & 0x0F) {
                    let ch = &mut self.channels[ci];
                    ch.fnum = (ch.fnum & 0xFF) | (((val & 0x03) as u16) << 8);
                    ch.block = (val >> 2) & 0x07;
                    let rhythm_channel =
                        self.rhythm_mode[bank] && (6..=8).contains(&(reg & 0x0F));
                    if !rhythm_channel {
                        self.channels[ci].set_key(val & 0x20 != 0);
                    }
                }
            }
            0xC0 => {
                if let Some(ci) = Self::channel_index(bank, reg & 0x0F) {
                    let ch = &mut self.channels[ci];
                    ch.feedback = (val >> 1) & 0x07;
                    ch.additive = val & 0x01 != 0;
                    // OPL3 panning bits (4-5) collapse to mono here
                }
            }
            0xE0 | 0xF0 => {
                if let Some((ch, slot)) = slot_for_offset(reg & 0x1F) {
                    self.channels[bank * 9 + ch].slots[slot].wave = val & 0x07;
                }
            }
            _ => {}
        }
    }

    /// Handle the rhythm/depth register 0xBD
    fn apply_rhythm(&mut self, bank: usize, val: u8) {
        self.tremolo_deep[bank] = val & 0x80 != 0;
        self.vibrato_deep[bank] = val & 0x40 != 0;
        let mode = val & 0x20 != 0;
        if mode && !self.rhythm_mode[bank] {
            // Entering rhythm mode releases the melodic notes on 6-8
            for ch in 6..9 {
                self.channels[bank * 9 + ch].set_key(false);
            }
        }
        self.rhythm_mode[bank] = mode;
        if mode {
            for &(bit, ch, slots) in &RHYTHM_SLOTS {
                let channel = &mut self.channels[bank * 9 + ch];
                let keyed = val & bit != 0;
                for (slot, used) in slots.iter().enumerate() {
                    if !used {
                        continue;
                    }
                    let op = &mut channel.slots[slot];
                    if keyed && op.silent() {
                        op.key_on();
                    } else if !keyed {
                        op.key_off();
                    }
                }
            }
        } else {
            for ch in 6..9 {
                let channel = &mut self.channels[bank * 9 + ch];
                if !channel.key_on {
                    channel.slots[0].key_off();
                    channel.slots[1].key_off();
                }
            }
        }
    }

    fn step_noise(&mut self) -> f64 {
        let bit = (self.noise ^ (self.noise >> 14)) & 1;
        self.noise = (self.noise >> 1) | (bit << 22);
        if bit == 0 {
            -1.0
        } else {
            1.0
        }
    }

    /// Generate one mono sample across all channels of both banks
    fn generate(&mut self) -> f64 {
        let sample_rate = self.sample_rate as f64;
        self.lfo_phase += 1.0 / sample_rate;
        let noise = self.step_noise();
        let mut total = 0.0;
        for bank in 0..2 {
            use std::f64::consts::TAU;
            let trem_depth = if self.tremolo_deep[bank] { 0.5 } else { 0.15 };
            let vib_depth = if self.vibrato_deep[bank] { 0.008 } else { 0.004 };
            let trem = 1.0 - trem_depth * 0.5 * (1.0 + (self.lfo_phase * TREMOLO_HZ * TAU).sin());
            let vib = 1.0 + vib_depth * (self.lfo_phase * VIBRATO_HZ * TAU).sin();
            let lfo = (trem, vib);

            for ch in 0..9 {
                let ci = bank * 9 + ch;
                let rhythm_voice = self.rhythm_mode[bank] && (6..=8).contains(&ch);
                if !rhythm_voice {
                    total += self.channels[ci].generate(lfo, sample_rate) * CHANNEL_GAIN;
                }
            }
            if self.rhythm_mode[bank] {
                total += self.generate_rhythm(bank, lfo, noise, sample_rate);
            }
        }
        total
    }

    /// Rhythm voices on channels 6-8: single operators keyed from 0xBD,
    /// with noise folded into the snare and hi-hat
    fn generate_rhythm(&mut self, bank: usize, lfo: (f64, f64), noise: f64, sample_rate: f64) -> f64 {
        let mut total = 0.0;
        for &(bit, ch, slots) in &RHYTHM_SLOTS {
            let channel = &mut self.channels[bank * 9 + ch];
            let freq = channel.frequency();
            let noisy = bit == 0x08 || bit == 0x01; // snare, hi-hat
            for (slot, used) in slots.iter().enumerate() {
                if !used || channel.slots[slot].silent() {
                    continue;
                }
                let out = channel.slots[slot].generate(freq, 0.0, lfo, sample_rate);
                let out = if noisy { out * (0.5 + 0.5 * noise) } else { out };
                total += out * CHANNEL_GAIN;
            }
        }
        total
    }

    /// Generate `count` mono samples as f64 in roughly -1..1
    pub fn generate_into(&mut self, buffer: &mut [f64]) {
        for slot in buffer.iter_mut() {
            *slot = self.generate();
        }
    }
}
