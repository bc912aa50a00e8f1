//! Instrument definitions (patches) and the patch bank

use num_derive::FromPrimitive;

/// Number of melodic MIDI patches; percussion patches in a MIDI-mapping bank
/// are stored at `MIDI_PATCHES + note`
pub const MIDI_PATCHES: usize = 128;

/// Settings for a single OPL operator (cell)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OplOperator {
    /// Tremolo (amplitude modulation) enabled
    pub enable_tremolo: bool,
    /// Vibrato (frequency modulation) enabled
    pub enable_vibrato: bool,
    /// Sustain enabled (note holds at sustain level until key-off)
    pub enable_sustain: bool,
    /// KSR (envelope scaling by key number) enabled
    pub enable_ksr: bool,
    /// Frequency multiplication factor, 0-15
    pub freq_mult: u8,
    /// Key scale level, 0-3
    pub scale_level: u8,
    /// Output level, 0 (loudest) to 63 (softest attenuation steps)
    pub output_level: u8,
    /// Attack rate, 0-15
    pub attack_rate: u8,
    /// Decay rate, 0-15
    pub decay_rate: u8,
    /// Sustain rate, 0-15
    pub sustain_rate: u8,
    /// Release rate, 0-15
    pub release_rate: u8,
    /// Waveform select, 0-7
    pub wave_select: u8,
}

impl OplOperator {
    /// Compare operator settings ignoring the output level, which is
    /// rewritten at note-on when a velocity is present.
    fn same_settings(&self, other: &OplOperator) -> bool {
        self.enable_tremolo == other.enable_tremolo
            && self.enable_vibrato == other.enable_vibrato
            && self.enable_sustain == other.enable_sustain
            && self.enable_ksr == other.enable_ksr
            && self.freq_mult == other.freq_mult
            && self.scale_level == other.scale_level
            && self.attack_rate == other.attack_rate
            && self.decay_rate == other.decay_rate
            && self.sustain_rate == other.sustain_rate
            && self.release_rate == other.release_rate
            && self.wave_select == other.wave_select
    }
}

/// Which rhythm-mode voice an OPL patch is intended for
///
/// Single-operator rhythm instruments always keep their settings in the
/// matching operator field: modulator-only instruments in
/// [`OplPatch::modulator`], carrier-only in [`OplPatch::carrier`]. Formats
/// which cross-load them can be fixed up with
/// [`crate::opl::opl_normalise_perc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(i8)]
pub enum Rhythm {
    /// Not yet known, or used for multiple purposes
    Unknown = -1,
    /// Normal two-operator melodic instrument
    Melodic = 0,
    /// Hi-hat (modulator only)
    HiHat = 1,
    /// Top cymbal (carrier only)
    TopCymbal = 2,
    /// Tom-tom (modulator only)
    TomTom = 3,
    /// Snare drum (carrier only)
    SnareDrum = 4,
    /// Bass drum (both operators)
    BassDrum = 5,
}

impl Rhythm {
    /// True for rhythm instruments that use only the carrier operator
    pub fn carrier_only(self) -> bool {
        matches!(self, Rhythm::TopCymbal | Rhythm::SnareDrum)
    }

    /// True for rhythm instruments that use only the modulator operator
    pub fn modulator_only(self) -> bool {
        matches!(self, Rhythm::HiHat | Rhythm::TomTom)
    }

    /// Short name for error messages
    pub fn as_text(self) -> &'static str {
        match self {
            Rhythm::Unknown => "unknown",
            Rhythm::Melodic => "normal (non-rhythm) instrument",
            Rhythm::HiHat => "hi-hat",
            Rhythm::TopCymbal => "top cymbal",
            Rhythm::TomTom => "tom-tom",
            Rhythm::SnareDrum => "snare drum",
            Rhythm::BassDrum => "bass drum",
        }
    }
}

/// OPL (FM) instrument settings for one two-operator channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OplPatch {
    /// Modulator settings (operator 0)
    pub modulator: OplOperator,
    /// Carrier settings (operator 1)
    pub carrier: OplOperator,
    /// Feedback modulation factor for the channel, 0-7
    pub feedback: u8,
    /// Synth connection type: false = FM, true = additive
    pub connection: bool,
    /// Rhythm-mode role of this instrument
    pub rhythm: Rhythm,
}

impl Default for OplPatch {
    fn default() -> Self {
        OplPatch {
            modulator: OplOperator::default(),
            carrier: OplOperator::default(),
            feedback: 0,
            connection: false,
            rhythm: Rhythm::Melodic,
        }
    }
}

impl OplPatch {
    /// Compare two patches for the same audible voice, regardless of which
    /// rhythm role each is assigned to.
    ///
    /// Unused operators are skipped, and output levels are only compared on
    /// the modulator of two-operator patches (the carrier level is rewritten
    /// by note velocity).
    pub fn same_voice(&self, other: &OplPatch) -> bool {
        let car_used = !self.rhythm.modulator_only() || !other.rhythm.modulator_only();
        if car_used && !self.carrier.same_settings(&other.carrier) {
            return false;
        }
        let mod_used = !self.rhythm.carrier_only() || !other.rhythm.carrier_only();
        if mod_used && !self.modulator.same_settings(&other.modulator) {
            return false;
        }
        let two_op = matches!(
            self.rhythm,
            Rhythm::Unknown | Rhythm::Melodic | Rhythm::BassDrum
        );
        if two_op && self.modulator.output_level != other.modulator.output_level {
            return false;
        }
        self.feedback == other.feedback && self.connection == other.connection
    }
}

/// General MIDI instrument reference
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MidiPatch {
    /// 7-bit MIDI program number, 0-127
    pub midi_patch: u8,
    /// If true, `midi_patch` is a note number on MIDI channel 10
    pub percussion: bool,
}

/// Sampled (PCM) instrument
///
/// Invariants: `loop_start < data.len()` and `loop_end <= data.len()` (in
/// samples), with `loop_end == 0` meaning the sample does not loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PcmPatch {
    /// Sampling rate in Hertz at which the sample plays a middle-C
    pub sample_rate: u32,
    /// Sample size in bits, 8 or 16
    pub bit_depth: u8,
    /// Channel count, 1 = mono
    pub num_channels: u8,
    /// Offset of the first sample of the loop
    pub loop_start: u32,
    /// Offset just past the last sample of the loop, 0 = no loop
    pub loop_end: u32,
    /// Raw sample data: unsigned 8-bit, or signed 16-bit in host byte order
    pub data: Vec<u8>,
}

/// Type-specific portion of a patch
#[derive(Debug, Clone, PartialEq)]
pub enum PatchKind {
    /// OPL FM instrument
    Opl(OplPatch),
    /// General MIDI instrument
    Midi(MidiPatch),
    /// Sampled instrument
    Pcm(PcmPatch),
}

/// An instrument definition: sound settings plus name and default volume
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    /// Title of the instrument, possibly empty
    pub name: String,
    /// Volume used when a note carries no velocity; 0 = silent, 255 = full
    pub default_volume: u8,
    /// The actual sound settings
    pub kind: PatchKind,
}

impl Patch {
    /// Wrap an OPL patch with an empty name and full default volume
    pub fn opl(patch: OplPatch) -> Self {
        Patch {
            name: String::new(),
            default_volume: 255,
            kind: PatchKind::Opl(patch),
        }
    }

    /// Wrap a MIDI patch with an empty name and full default volume
    pub fn midi(patch: MidiPatch) -> Self {
        Patch {
            name: String::new(),
            default_volume: 255,
            kind: PatchKind::Midi(patch),
        }
    }

    /// Wrap a PCM patch with an empty name and full default volume
    pub fn pcm(patch: PcmPatch) -> Self {
        Patch {
            name: String::new(),
            default_volume: 255,
            kind: PatchKind::Pcm(patch),
        }
    }

    /// The OPL settings, if this is an OPL patch
    pub fn as_opl(&self) -> Option<&OplPatch> {
        match &self.kind {
            PatchKind::Opl(p) => Some(p),
            _ => None,
        }
    }

    /// The MIDI settings, if this is a MIDI patch
    pub fn as_midi(&self) -> Option<&MidiPatch> {
        match &self.kind {
            PatchKind::Midi(p) => Some(p),
            _ => None,
        }
    }

    /// The PCM settings, if this is a PCM patch
    pub fn as_pcm(&self) -> Option<&PcmPatch> {
        match &self.kind {
            PatchKind::Pcm(p) => Some(p),
            _ => None,
        }
    }
}

/// An ordered collection of patches, of possibly mixed kinds
///
/// Note-on events index into this bank. It is treated as immutable while a
/// song is playing; editing passes run single-threaded between playbacks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatchBank {
    patches: Vec<Patch>,
}

impl PatchBank {
    /// Create an empty bank
    pub fn new() -> Self {
        PatchBank::default()
    }

    /// Number of patches in the bank
    pub fn len(&self) -> usize {
        self.patches.len()
    }

    /// True if the bank holds no patches
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Patch at `index`, if in range
    pub fn get(&self, index: usize) -> Option<&Patch> {
        self.patches.get(index)
    }

    /// Mutable patch at `index`, if in range
    pub fn get_mut(&mut self, index: usize) -> Option<&mut Patch> {
        self.patches.get_mut(index)
    }

    /// Append a patch, returning its index
    pub fn push(&mut self, patch: Patch) -> usize {
        self.patches.push(patch);
        self.patches.len() - 1
    }

    /// Iterate over the patches in order
    pub fn iter(&self) -> std::slice::Iter<'_, Patch> {
        self.patches.iter()
    }

    /// Iterate mutably over the patches in order
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Patch> {
        self.patches.iter_mut()
    }
}

impl FromIterator<Patch> for PatchBank {
    fn from_iter<T: IntoIterator<Item = Patch>>(iter: T) -> Self {
        PatchBank {
            patches: iter.into_iter().collect(),
        }
    }
}

impl std::ops::Index<usize> for PatchBank {
    type Output = Patch;
    fn index(&self, index: usize) -> &Patch {
        &self.patches[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn rhythm_from_perc_channel() {
        // Percussion channel index + 1 maps onto the rhythm role
        assert_eq!(Rhythm::from_i8(0 + 1), Some(Rhythm::HiHat));
        assert_eq!(Rhythm::from_i8(3 + 1), Some(Rhythm::SnareDrum));
        assert_eq!(Rhythm::from_i8(4 + 1), Some(Rhythm::BassDrum));
        assert_eq!(Rhythm::from_i8(6), None);
    }

    #[test]
    fn same_voice_ignores_carrier_level() {
        let mut a = OplPatch::default();
        a.carrier.attack_rate = 15;
        let mut b = a.clone();
        b.carrier.output_level = 20;
        assert!(a.same_voice(&b));

        // But modulator level matters on a two-op patch
        b.modulator.output_level = 5;
        assert!(!a.same_voice(&b));
    }

    #[test]
    fn same_voice_skips_unused_operator() {
        let mut a = OplPatch {
            rhythm: Rhythm::HiHat,
            ..OplPatch::default()
        };
        a.modulator.freq_mult = 4;
        let mut b = a.clone();
        // Carrier differs but neither patch uses it
        b.carrier.decay_rate = 9;
        assert!(a.same_voice(&b));
    }
}
