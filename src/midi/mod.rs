//! MIDI support: note maths, variable-length integers and event conversion

mod converter;
mod util;

pub use converter::{
    MidiConverter, MidiFlags, MidiSink, MIDI_DEFAULT_ATTACK_VELOCITY,
    MIDI_DEFAULT_RELEASE_VELOCITY,
};
pub use util::{
    freq_to_midi, freq_to_midi_note, midi_to_freq, pitchbend_to_semitones, read_u28, read_u28_mus,
    semitones_to_pitchbend, write_u28, write_u28_mus, MIDI_BEND_CENTRE, MIDI_CHANNEL_COUNT,
    MIDI_MIDDLE_C,
};
