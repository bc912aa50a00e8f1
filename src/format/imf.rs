//! id Software IMF format (Commander Keen, Wolfenstein 3D and friends)
//!
//! A bare stream of `(register, value, delay)` records targeting a single
//! OPL2 chip at a fixed tick rate. Type-0 files start straight into the
//! data; type-1 files carry a leading 16-bit data length. The tick rate is
//! not stored in the file: 560 Hz for most games, 700 Hz for the `.wlf`
//! variant.

use std::io;

use nom::number::complete::le_u16;
use nom::IResult;

use super::opl_stream::{OplDecoder, OplEncoder};
use super::{Caps, Certainty, MusicType, SuppData, WriteFlags};
use crate::error::{Error, Result};
use crate::model::{Music, PatchKind};
use crate::opl::{OplEvent, OplWriteFlags, OPL_FNUM_DEFAULT};
use crate::tempo::{Tempo, US_PER_SEC};

/// id Software IMF, headerless, 560 Hz
pub static IMF_TYPE0: ImfIdSoftware = ImfIdSoftware {
    code: "imf-idsoftware-type0",
    name: "id Software Music Format, type 0",
    extensions: &["imf"],
    type1: false,
    hertz: 560,
};

/// id Software IMF with a leading data length, 560 Hz
pub static IMF_TYPE1: ImfIdSoftware = ImfIdSoftware {
    code: "imf-idsoftware-type1",
    name: "id Software Music Format, type 1",
    extensions: &["imf"],
    type1: true,
    hertz: 560,
};

/// Wolfenstein 3D music: type 1 at 700 Hz
pub static WLF_TYPE1: ImfIdSoftware = ImfIdSoftware {
    code: "wlf-idsoftware-type1",
    name: "id Software Music Format, type 1 / 700 Hz",
    extensions: &["wlf"],
    type1: true,
    hertz: 700,
};

/// Handler for one IMF variant
pub struct ImfIdSoftware {
    code: &'static str,
    name: &'static str,
    extensions: &'static [&'static str],
    type1: bool,
    hertz: u32,
}

fn parse_length(input: &[u8]) -> IResult<&[u8], u16> {
    le_u16(input)
}

impl ImfIdSoftware {
    /// Sanity-check a run of records: plausible OPL registers only
    fn plausible_records(data: &[u8]) -> bool {
        for record in data.chunks(4).take(128) {
            if record.len() < 4 {
                return false;
            }
            let reg = record[0];
            // Register 0 appears in the customary opening record; anything
            // else must be a real OPL register family
            let valid = reg == 0
                || matches!(
                    reg & 0xF0,
                    0x00 | 0x20 | 0x30 | 0x40 | 0x50 | 0x60 | 0x70 | 0x80 | 0x90 | 0xA0 | 0xB0
                        | 0xC0 | 0xE0 | 0xF0
                );
            if !valid {
                return false;
            }
        }
        true
    }

    /// The song data region of the file, excluding any type-1 length prefix
    fn song_data<'a>(&self, content: &'a [u8]) -> Result<&'a [u8]> {
        if self.type1 {
            let (rest, len) = parse_length(content)
                .map_err(|_| Error::InvalidData("file too short for a type-1 IMF".into()))?;
            let len = len as usize;
            if len > rest.len() {
                return Err(Error::InvalidData(format!(
                    "type-1 IMF data length {len} exceeds file size"
                )));
            }
            Ok(&rest[..len])
        } else {
            Ok(content)
        }
    }

    fn tempo(&self) -> Tempo {
        let mut tempo = Tempo::default();
        tempo.set_hertz(self.hertz);
        tempo
    }
}

impl MusicType for ImfIdSoftware {
    fn code(&self) -> &'static str {
        self.code
    }

    fn friendly_name(&self) -> &'static str {
        self.name
    }

    fn file_extensions(&self) -> &'static [&'static str] {
        self.extensions
    }

    fn caps(&self) -> Caps {
        Caps::INST_OPL | Caps::INST_OPL_RHYTHM | Caps::HAS_EVENTS | Caps::HARDWARE_OPL2
    }

    fn is_instance(&self, content: &[u8]) -> Certainty {
        if self.type1 {
            let Ok((rest, len)) = parse_length(content) else {
                return Certainty::DefinitelyNo;
            };
            let len = len as usize;
            if len == 0 || len % 4 != 0 || len > rest.len() {
                return Certainty::DefinitelyNo;
            }
            if !Self::plausible_records(&rest[..len]) {
                return Certainty::DefinitelyNo;
            }
            Certainty::PossiblyYes
        } else {
            if content.is_empty() || content.len() % 4 != 0 {
                return Certainty::DefinitelyNo;
            }
            if !Self::plausible_records(content) {
                return Certainty::DefinitelyNo;
            }
            // No signature to go on; the customary silent opening record
            // tips the balance
            if content[0] == 0 && content[1] == 0 {
                Certainty::PossiblyYes
            } else {
                Certainty::Unsure
            }
        }
    }

    fn read(&self, content: &[u8], _supps: &SuppData) -> Result<Music> {
        let data = self.song_data(content)?;

        let mut decoder = OplDecoder::new(OPL_FNUM_DEFAULT);
        let mut pending = 0u32;
        for record in data.chunks_exact(4) {
            let reg = record[0];
            let val = record[1];
            let delay = u16::from_le_bytes([record[2], record[3]]) as u32;
            // IMF delays trail their register pair
            decoder.write(pending, 0, reg, val);
            pending = delay;
        }
        decoder.add_delay(pending);
        Ok(decoder.finish(self.tempo()))
    }

    fn write(
        &self,
        out: &mut dyn io::Write,
        _supps: &SuppData,
        music: &Music,
        flags: WriteFlags,
    ) -> Result<()> {
        for patch in music.patches.iter() {
            if !matches!(patch.kind, PatchKind::Opl(_)) {
                return Err(Error::FormatLimitation(
                    "This file format can only store OPL instruments.".into(),
                ));
            }
        }

        let mut opl_flags = OplWriteFlags::OPL2_ONLY;
        if flags.contains(WriteFlags::INTEGER_NOTES_ONLY) {
            opl_flags |= OplWriteFlags::INTEGER_NOTES_ONLY;
        }

        // Records as (reg, val, trailing delay in IMF ticks); the customary
        // opening record doubles as the carrier of any leading delay
        let mut records: Vec<(u8, u8, u32)> = vec![(0, 0, 0)];
        let imf_us_per_tick = US_PER_SEC / self.hertz as f64;
        let mut us_per_tick = music.initial_tempo.us_per_tick;
        let mut pending_us = 0.0f64;

        OplEncoder::encode(music, OPL_FNUM_DEFAULT, opl_flags, |ev: &OplEvent| {
            pending_us += ev.delay as f64 * us_per_tick;
            if let Some(tempo) = &ev.tempo {
                us_per_tick = tempo.us_per_tick;
            }
            if let Some(w) = ev.write {
                if w.chip != 0 {
                    // OPL2_ONLY already drops chip-1 notes; any stray write
                    // cannot be represented
                    return Err(Error::FormatLimitation(
                        "IMF files can only address a single OPL2 chip.".into(),
                    ));
                }
                // Convert accumulated time into whole IMF ticks, carrying
                // the remainder so long songs don't drift
                let ticks = (pending_us / imf_us_per_tick).round() as u32;
                pending_us -= ticks as f64 * imf_us_per_tick;
                if let Some(last) = records.last_mut() {
                    last.2 += ticks;
                }
                records.push((w.reg, w.val, 0));
            }
            Ok(())
        })?;

        // Trailing delay
        let ticks = (pending_us / imf_us_per_tick).round() as u32;
        if let Some(last) = records.last_mut() {
            last.2 += ticks;
        }

        let mut body: Vec<u8> = Vec::with_capacity(records.len() * 4);
        for (reg, val, delay) in records {
            let mut delay = delay;
            // Delays wider than 16 bits overflow into silent padding records
            while delay > u16::MAX as u32 {
                body.extend_from_slice(&[reg, val]);
                body.extend_from_slice(&u16::MAX.to_le_bytes());
                delay -= u16::MAX as u32;
            }
            body.extend_from_slice(&[reg, val]);
            body.extend_from_slice(&(delay as u16).to_le_bytes());
        }

        if self.type1 {
            if body.len() > u16::MAX as usize {
                return Err(Error::FormatLimitation(format!(
                    "Song too long for a type-1 IMF file ({} bytes of data, 65535 max).",
                    body.len()
                )));
            }
            out.write_all(&(body.len() as u16).to_le_bytes())?;
        }
        out.write_all(&body)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChannelType, Event};

    // Instrument setup plus one note, in the layout the games shipped
    fn sample_song_type0() -> Vec<u8> {
        let records: &[(u8, u8, u16)] = &[
            (0x00, 0x00, 0),
            (0x21, 0xae, 0),
            (0x41, 0x7f, 0),
            (0x61, 0xed, 0),
            (0x81, 0xcb, 0),
            (0xe1, 0x06, 0),
            (0x24, 0xa7, 0),
            (0x44, 0x1f, 0),
            (0x64, 0x65, 0),
            (0x84, 0x43, 0),
            (0xe4, 0x02, 0),
            (0xc1, 0x34, 0),
            (0xa1, 0x44, 0),
            (0xb1, 0x32, 0x10),
            (0xb1, 0x12, 0),
        ];
        let mut data = Vec::new();
        for &(reg, val, delay) in records {
            data.push(reg);
            data.push(val);
            data.extend_from_slice(&delay.to_le_bytes());
        }
        data
    }

    #[test]
    fn detect_type0() {
        let data = sample_song_type0();
        assert_eq!(IMF_TYPE0.is_instance(&data), Certainty::PossiblyYes);
        // Odd length cannot be an IMF
        assert_eq!(IMF_TYPE0.is_instance(&data[..7]), Certainty::DefinitelyNo);
        // Implausible register bytes
        let garbage = vec![0x1B, 0xFF, 0x00, 0x00];
        assert_eq!(IMF_TYPE0.is_instance(&garbage), Certainty::DefinitelyNo);
    }

    #[test]
    fn detect_type1() {
        let mut data = sample_song_type0();
        let len = data.len() as u16;
        let mut t1 = len.to_le_bytes().to_vec();
        t1.append(&mut data);
        assert_eq!(IMF_TYPE1.is_instance(&t1), Certainty::PossiblyYes);
        // Length beyond the end of the file
        let mut bad = t1.clone();
        bad.truncate(10);
        bad[0] = 0xFF;
        bad[1] = 0xFF;
        assert_eq!(IMF_TYPE1.is_instance(&bad), Certainty::DefinitelyNo);
    }

    #[test]
    fn read_recovers_note_and_tempo() {
        let data = sample_song_type0();
        let music = IMF_TYPE0.read(&data, &SuppData::new()).unwrap();
        assert_eq!(music.initial_tempo.hertz(), 560);
        assert_eq!(music.patches.len(), 1);
        // Channel 1 carries a note held for 0x10 ticks
        let track_index = music
            .track_info
            .iter()
            .position(|ti| ti.channel_type == ChannelType::Opl && ti.channel_index == 1)
            .unwrap();
        let track = &music.patterns[0][track_index];
        assert!(matches!(track[0].event, Event::NoteOn { .. }));
        assert_eq!(track[1].delay, 0x10);
        assert_eq!(track[1].event, Event::NoteOff);
    }

    #[test]
    fn wlf_variant_reads_at_700_hz() {
        let data = sample_song_type0();
        let len = (data.len() as u16).to_le_bytes();
        let mut t1 = len.to_vec();
        t1.extend_from_slice(&data);
        let music = WLF_TYPE1.read(&t1, &SuppData::new()).unwrap();
        assert_eq!(music.initial_tempo.hertz(), 700);
    }

    #[test]
    fn write_then_read_round_trips_events() {
        let data = sample_song_type0();
        let music = IMF_TYPE0.read(&data, &SuppData::new()).unwrap();

        let mut out = Vec::new();
        IMF_TYPE0
            .write(&mut out, &SuppData::new(), &music, WriteFlags::empty())
            .unwrap();
        assert_eq!(out.len() % 4, 0);

        let music2 = IMF_TYPE0.read(&out, &SuppData::new()).unwrap();
        assert_eq!(music2.patches, music.patches);
        // Same notes at the same ticks
        for (a, b) in music.patterns[0].iter().zip(music2.patterns[0].iter()) {
            let notes =
                |t: &Vec<crate::model::TrackEvent>| -> Vec<(u32, bool)> {
                    let mut at = 0;
                    t.iter()
                        .filter_map(|te| {
                            at += te.delay;
                            match te.event {
                                Event::NoteOn { .. } => Some((at, true)),
                                Event::NoteOff => Some((at, false)),
                                _ => None,
                            }
                        })
                        .collect()
                };
            assert_eq!(notes(a), notes(b));
        }
    }

    #[test]
    fn type1_rejects_oversized_song() {
        let data = sample_song_type0();
        let music = IMF_TYPE0.read(&data, &SuppData::new()).unwrap();
        let mut out = Vec::new();
        // Type-1 writing works for a short song
        IMF_TYPE1
            .write(&mut out, &SuppData::new(), &music, WriteFlags::empty())
            .unwrap();
        let stored_len = u16::from_le_bytes([out[0], out[1]]) as usize;
        assert_eq!(stored_len, out.len() - 2);
    }

    #[test]
    fn write_refuses_non_opl_patches() {
        let mut music = Music::default();
        music
            .patches
            .push(crate::model::Patch::pcm(Default::default()));
        let mut out = Vec::new();
        let err = IMF_TYPE0
            .write(&mut out, &SuppData::new(), &music, WriteFlags::empty())
            .unwrap_err();
        assert!(matches!(err, Error::FormatLimitation(_)));
    }
}
