//! End-to-end playback tests across the public API

use std::sync::Arc;

use gamemusic::dispatch::{EventDispatcher, EventHandler, EventOrder, JumpControl};
use gamemusic::model::{
    ChannelType, ConfigurationEvent, Effect, Event, GotoEvent, Music, OplOperator, OplPatch,
    Patch, PcmPatch, Rhythm, TrackEvent, TrackInfo,
};
use gamemusic::playback::{Playback, SharedPlayback};
use gamemusic::Tempo;

fn melodic_patch() -> OplPatch {
    let op = OplOperator {
        freq_mult: 1,
        attack_rate: 15,
        decay_rate: 3,
        sustain_rate: 6,
        release_rate: 6,
        enable_sustain: true,
        ..OplOperator::default()
    };
    OplPatch {
        modulator: OplOperator {
            output_level: 20,
            ..op.clone()
        },
        carrier: op,
        feedback: 4,
        connection: false,
        rhythm: Rhythm::Melodic,
    }
}

/// A two-pattern song mixing OPL and PCM tracks
fn mixed_song() -> Arc<Music> {
    let mut music = Music::default();
    music.patches.push(Patch::opl(melodic_patch()));
    music.patches.push(Patch::pcm(PcmPatch {
        sample_rate: 8000,
        bit_depth: 8,
        num_channels: 1,
        loop_start: 0,
        loop_end: 64,
        data: (0u32..64).map(|i| (128 + (i % 32)) as u8).collect(),
    }));
    music.track_info = vec![
        TrackInfo {
            channel_type: ChannelType::Opl,
            channel_index: 0,
        },
        TrackInfo {
            channel_type: ChannelType::Pcm,
            channel_index: 0,
        },
    ];
    music.ticks_per_track = 32;
    let opl_track = vec![
        TrackEvent {
            delay: 0,
            event: Event::NoteOn {
                instrument: 0,
                millihertz: 440_000,
                velocity: Some(255),
            },
        },
        TrackEvent {
            delay: 16,
            event: Event::NoteOff,
        },
    ];
    let pcm_track = vec![
        TrackEvent {
            delay: 4,
            event: Event::NoteOn {
                instrument: 1,
                millihertz: 261_625,
                velocity: None,
            },
        },
        TrackEvent {
            delay: 20,
            event: Event::NoteOff,
        },
    ];
    music.patterns = vec![
        vec![opl_track.clone(), pcm_track.clone()],
        vec![opl_track, vec![]],
    ];
    music.pattern_order = vec![0, 1];
    music.initial_tempo.us_per_tick = 5_000.0;
    music.initial_tempo.frames_per_tick = 2;
    music.into()
}

#[test]
fn mixed_song_produces_audio_until_the_end() {
    let mut playback = Playback::new(22050, 2);
    playback.set_song(mixed_song());
    playback.set_loop_count(1);

    // 64 ticks at 5 ms = 320 ms = 7056 frames at 22050 Hz
    let mut buf = vec![0i16; 16384];
    let pos = playback.mix(&mut buf);
    assert!(buf.iter().any(|&s| s != 0));
    assert!(pos.end);
}

#[test]
fn song_length_matches_tick_arithmetic() {
    let mut playback = Playback::new(22050, 2);
    playback.set_song(mixed_song());
    playback.set_loop_count(1);
    // 2 patterns x 32 ticks x 5 ms
    assert_eq!(playback.length().unwrap(), 320);
}

#[test]
fn set_song_then_mix_is_idempotent() {
    let music = mixed_song();
    let mut playback = Playback::new(22050, 2);

    playback.set_song(music.clone());
    let mut first = vec![0i16; 8192];
    playback.mix(&mut first);

    playback.set_song(music);
    let mut second = vec![0i16; 8192];
    playback.mix(&mut second);

    assert_eq!(first, second);
}

#[test]
fn seek_by_time_then_mix_continues_playing() {
    let mut playback = Playback::new(22050, 2);
    playback.set_song(mixed_song());
    let reached = playback.seek_by_time(200).unwrap();
    assert!(reached >= 160, "reached {reached}");
    // A short mix stays inside the pattern the seek landed in
    let mut buf = vec![0i16; 512];
    let pos = playback.mix(&mut buf);
    assert_eq!(pos.order, 1);
}

#[test]
fn shared_playback_serialises_against_mixing() {
    let shared = SharedPlayback::new(Playback::new(22050, 2));
    shared.set_song(mixed_song());
    shared.set_loop_count(0);

    let mixer = shared.clone();
    let t = std::thread::spawn(move || {
        let mut buf = vec![0i16; 2048];
        for _ in 0..16 {
            mixer.mix(&mut buf);
            buf.fill(0);
        }
    });
    for order in [1usize, 0, 1, 0] {
        shared.seek_by_order(order);
    }
    t.join().unwrap();
}

/// Handler counting every delivered event
#[derive(Default)]
struct Counter {
    count: usize,
}

impl EventHandler for Counter {
    fn tempo_event(&mut self, _: u32, _: usize, _: usize, _: &Tempo) -> gamemusic::Result<bool> {
        self.count += 1;
        Ok(true)
    }
    fn note_on(
        &mut self,
        _: u32,
        _: usize,
        _: usize,
        _: usize,
        _: u32,
        _: Option<u8>,
    ) -> gamemusic::Result<bool> {
        self.count += 1;
        Ok(true)
    }
    fn note_off(&mut self, _: u32, _: usize, _: usize) -> gamemusic::Result<bool> {
        self.count += 1;
        Ok(true)
    }
    fn effect(&mut self, _: u32, _: usize, _: usize, _: &Effect) -> gamemusic::Result<bool> {
        self.count += 1;
        Ok(true)
    }
    fn goto_event(
        &mut self,
        _: u32,
        _: usize,
        _: usize,
        _: &GotoEvent,
        _: &mut JumpControl,
    ) -> gamemusic::Result<bool> {
        self.count += 1;
        Ok(true)
    }
    fn configuration(
        &mut self,
        _: u32,
        _: usize,
        _: usize,
        _: &ConfigurationEvent,
    ) -> gamemusic::Result<bool> {
        self.count += 1;
        Ok(true)
    }
}

#[test]
fn pattern_traversal_delivers_every_event_once() {
    let music = mixed_song();
    let mut counter = Counter::default();
    EventDispatcher::new(&music)
        .handle_all_events(EventOrder::PatternRowTrack, &mut counter, 1)
        .unwrap();
    let stored: usize = music
        .patterns
        .iter()
        .flat_map(|p| p.iter())
        .map(|t| t.len())
        .sum();
    assert_eq!(counter.count, stored);
}

#[test]
fn order_traversal_multiplies_by_order_list() {
    let mut music = (*mixed_song()).clone();
    music.pattern_order = vec![0, 1, 0];
    let music: Arc<Music> = music.into();
    let mut counter = Counter::default();
    EventDispatcher::new(&music)
        .handle_all_events(EventOrder::OrderRowTrack, &mut counter, 1)
        .unwrap();
    // Pattern 0 has 4 events and plays twice; pattern 1 has 2
    assert_eq!(counter.count, 4 * 2 + 2);
}

#[test]
fn track_delay_sums_stay_within_pattern_length() {
    let music = mixed_song();
    for pattern in &music.patterns {
        for track in pattern {
            let total: u32 = track.iter().map(|te| te.delay).sum();
            assert!(total <= music.ticks_per_track);
        }
    }
}
