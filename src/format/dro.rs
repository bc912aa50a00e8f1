//! DOSBox raw OPL capture, version 1 (.dro)
//!
//! Signature `DBRAWOPL`, header with song length in milliseconds and bytes
//! plus a hardware type, then a byte stream of register writes interleaved
//! with delay and chip-select escape codes. Delays are in milliseconds, so
//! the decoded song runs at a 1000 Hz tick rate.

use std::io;

use nom::bytes::complete::tag;
use nom::number::complete::le_u32;
use nom::IResult;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use super::opl_stream::{OplDecoder, OplEncoder};
use super::{Caps, Certainty, MusicType, SuppData, WriteFlags};
use crate::error::{Error, Result};
use crate::model::Music;
use crate::opl::{OplEvent, OplWriteFlags, OPL_FNUM_DEFAULT};
use crate::tempo::Tempo;

/// The one and only v1 handler instance
pub static DRO_DOSBOX_V1: DroDosboxV1 = DroDosboxV1;

const SIGNATURE: &[u8] = b"DBRAWOPL";

/// Escape codes in the data stream
const CMD_DELAY_SHORT: u8 = 0x00;
const CMD_DELAY_LONG: u8 = 0x01;
const CMD_CHIP_LOW: u8 = 0x02;
const CMD_CHIP_HIGH: u8 = 0x03;
const CMD_ESCAPE: u8 = 0x04;

/// OPL hardware the capture was made from
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
enum Hardware {
    Opl2 = 0,
    Opl3 = 1,
    DualOpl2 = 2,
}

struct Header {
    length_bytes: usize,
    data_offset: usize,
}

fn parse_header(input: &[u8]) -> IResult<&[u8], (u32, u32, u32)> {
    let (input, _) = tag(SIGNATURE)(input)?;
    let (input, length_ms) = le_u32(input)?;
    let (input, length_bytes) = le_u32(input)?;
    let (input, hardware) = le_u32(input)?;
    Ok((input, (length_ms, length_bytes, hardware)))
}

impl DroDosboxV1 {
    fn header(content: &[u8]) -> Result<Header> {
        let (_, (_ms, length_bytes, hardware)) = parse_header(content)
            .map_err(|_| Error::InvalidData("not a DOSBox raw OPL capture".into()))?;
        // Early DOSBox builds wrote the hardware type as a single byte, so
        // the following three bytes are already song data
        let data_offset = if Hardware::from_u32(hardware).is_some() {
            20
        } else {
            17
        };
        Ok(Header {
            length_bytes: length_bytes as usize,
            data_offset,
        })
    }
}

/// DOSBox raw OPL capture v1
pub struct DroDosboxV1;

impl MusicType for DroDosboxV1 {
    fn code(&self) -> &'static str {
        "dro-dosbox-v1"
    }

    fn friendly_name(&self) -> &'static str {
        "DOSBox Raw OPL version 1"
    }

    fn file_extensions(&self) -> &'static [&'static str] {
        &["dro"]
    }

    fn caps(&self) -> Caps {
        Caps::INST_OPL
            | Caps::INST_OPL_RHYTHM
            | Caps::HAS_EVENTS
            | Caps::HARDWARE_OPL2
            | Caps::HARDWARE_OPL3
    }

    fn is_instance(&self, content: &[u8]) -> Certainty {
        if content.len() < 20 || !content.starts_with(SIGNATURE) {
            return Certainty::DefinitelyNo;
        }
        // Version 2 files repeat the signature but carry a version field
        let ver = u16::from_le_bytes([content[8], content[9]]);
        if ver == 2 {
            return Certainty::DefinitelyNo;
        }
        Certainty::DefinitelyYes
    }

    fn read(&self, content: &[u8], _supps: &SuppData) -> Result<Music> {
        let header = Self::header(content)?;
        let end = content
            .len()
            .min(header.data_offset + header.length_bytes);
        let data = &content[header.data_offset.min(content.len())..end];

        let mut decoder = OplDecoder::new(OPL_FNUM_DEFAULT);
        let mut chip = 0u8;
        let mut pending_ms = 0u32;
        let mut pos = 0usize;
        while pos < data.len() {
            let code = data[pos];
            pos += 1;
            match code {
                CMD_DELAY_SHORT => {
                    let d = *data
                        .get(pos)
                        .ok_or_else(|| Error::InvalidData("truncated delay".into()))?;
                    pos += 1;
                    pending_ms += d as u32 + 1;
                }
                CMD_DELAY_LONG => {
                    if pos + 2 > data.len() {
                        return Err(Error::InvalidData("truncated long delay".into()));
                    }
                    pending_ms += u16::from_le_bytes([data[pos], data[pos + 1]]) as u32 + 1;
                    pos += 2;
                }
                CMD_CHIP_LOW => chip = 0,
                CMD_CHIP_HIGH => chip = 1,
                _ => {
                    let reg = if code == CMD_ESCAPE {
                        let r = *data
                            .get(pos)
                            .ok_or_else(|| Error::InvalidData("truncated escape".into()))?;
                        pos += 1;
                        r
                    } else {
                        code
                    };
                    let val = *data
                        .get(pos)
                        .ok_or_else(|| Error::InvalidData("truncated register write".into()))?;
                    pos += 1;
                    decoder.write(pending_ms, chip, reg, val);
                    pending_ms = 0;
                }
            }
        }
        decoder.add_delay(pending_ms);

        let mut tempo = Tempo::default();
        tempo.set_ms_per_tick(1);
        Ok(decoder.finish(tempo))
    }

    fn write(
        &self,
        out: &mut dyn io::Write,
        _supps: &SuppData,
        music: &Music,
        flags: WriteFlags,
    ) -> Result<()> {
        let mut opl_flags = OplWriteFlags::empty();
        if flags.contains(WriteFlags::INTEGER_NOTES_ONLY) {
            opl_flags |= OplWriteFlags::INTEGER_NOTES_ONLY;
        }

        let mut body: Vec<u8> = Vec::new();
        let mut total_ms = 0u32;
        let mut current_chip = 0u8;
        let mut used_high_chip = false;
        let mut us_per_tick = music.initial_tempo.us_per_tick;
        let mut pending_us = 0.0f64;

        OplEncoder::encode(music, OPL_FNUM_DEFAULT, opl_flags, |ev: &OplEvent| {
            pending_us += ev.delay as f64 * us_per_tick;
            if let Some(tempo) = &ev.tempo {
                us_per_tick = tempo.us_per_tick;
            }
            if let Some(w) = ev.write {
                let mut ms = (pending_us / 1000.0).round() as u32;
                pending_us -= ms as f64 * 1000.0;
                total_ms += ms;
                while ms > 0 {
                    if ms <= 256 {
                        body.push(CMD_DELAY_SHORT);
                        body.push((ms - 1) as u8);
                        ms = 0;
                    } else {
                        let chunk = ms.min(65536);
                        body.push(CMD_DELAY_LONG);
                        body.extend_from_slice(&((chunk - 1) as u16).to_le_bytes());
                        ms -= chunk;
                    }
                }
                if w.chip != current_chip {
                    body.push(if w.chip == 0 { CMD_CHIP_LOW } else { CMD_CHIP_HIGH });
                    current_chip = w.chip;
                }
                if w.chip == 1 {
                    used_high_chip = true;
                }
                if w.reg <= CMD_ESCAPE {
                    body.push(CMD_ESCAPE);
                }
                body.push(w.reg);
                body.push(w.val);
            }
            Ok(())
        })?;

        // Any trailing silence still counts towards the song length
        total_ms += (pending_us / 1000.0).round() as u32;

        out.write_all(SIGNATURE)?;
        out.write_all(&total_ms.to_le_bytes())?;
        out.write_all(&(body.len() as u32).to_le_bytes())?;
        let hardware = if used_high_chip {
            Hardware::Opl3
        } else {
            Hardware::Opl2
        };
        out.write_all(&(hardware as u32).to_le_bytes())?;
        out.write_all(&body)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChannelType, Event};

    fn sample_dro() -> Vec<u8> {
        let mut body: Vec<u8> = Vec::new();
        // Program channel 0 and key a note
        for &(reg, val) in &[
            (0x20u8, 0x01u8),
            (0x23, 0x01),
            (0x40, 0x18),
            (0x43, 0x00),
            (0x60, 0xF4),
            (0x63, 0xF4),
            (0x80, 0x74),
            (0x83, 0x74),
            (0xC0, 0x06),
            (0xA0, 0x44),
            (0xB0, 0x32),
        ] {
            body.push(reg);
            body.push(val);
        }
        // 100 ms then key off
        body.push(CMD_DELAY_SHORT);
        body.push(99);
        body.push(0xB0);
        body.push(0x12);

        let mut file = SIGNATURE.to_vec();
        file.extend_from_slice(&100u32.to_le_bytes());
        file.extend_from_slice(&(body.len() as u32).to_le_bytes());
        file.extend_from_slice(&0u32.to_le_bytes()); // OPL2
        file.extend_from_slice(&body);
        file
    }

    #[test]
    fn signature_detection() {
        assert_eq!(
            DRO_DOSBOX_V1.is_instance(&sample_dro()),
            Certainty::DefinitelyYes
        );
        assert_eq!(DRO_DOSBOX_V1.is_instance(b"XXRAWOPL"), Certainty::DefinitelyNo);
        // A v2 header is not ours
        let mut v2 = SIGNATURE.to_vec();
        v2.extend_from_slice(&[2, 0, 0, 0]);
        v2.extend_from_slice(&[0u8; 12]);
        assert_eq!(DRO_DOSBOX_V1.is_instance(&v2), Certainty::DefinitelyNo);
    }

    #[test]
    fn read_decodes_note_with_ms_delays() {
        let music = DRO_DOSBOX_V1.read(&sample_dro(), &SuppData::new()).unwrap();
        assert_eq!(music.initial_tempo.ms_per_tick(), 1);
        let track_index = music
            .track_info
            .iter()
            .position(|ti| ti.channel_type == ChannelType::Opl && ti.channel_index == 0)
            .unwrap();
        let track = &music.patterns[0][track_index];
        assert!(matches!(track[0].event, Event::NoteOn { .. }));
        assert_eq!(track[1].delay, 100);
        assert_eq!(track[1].event, Event::NoteOff);
    }

    #[test]
    fn single_byte_hardware_type_quirk() {
        let mut file = sample_dro();
        // Rewrite the hardware field as u8 + data: shift the body up 3
        let body: Vec<u8> = file[20..].to_vec();
        file.truncate(17);
        file[16] = 0xFF; // garbage u32 would be > 2
        file.extend_from_slice(&body);
        // Patch the stored byte length (unchanged) and reparse
        let music = DRO_DOSBOX_V1.read(&file, &SuppData::new()).unwrap();
        assert!(!music.patches.is_empty());
    }

    #[test]
    fn write_then_read_round_trips() {
        let music = DRO_DOSBOX_V1.read(&sample_dro(), &SuppData::new()).unwrap();
        let mut out = Vec::new();
        DRO_DOSBOX_V1
            .write(&mut out, &SuppData::new(), &music, WriteFlags::empty())
            .unwrap();
        assert!(out.starts_with(SIGNATURE));
        // Stored millisecond length survives
        let ms = u32::from_le_bytes([out[8], out[9], out[10], out[11]]);
        assert_eq!(ms, 100);

        let music2 = DRO_DOSBOX_V1.read(&out, &SuppData::new()).unwrap();
        let notes = |m: &Music| -> usize {
            m.patterns[0]
                .iter()
                .flat_map(|t| t.iter())
                .filter(|te| matches!(te.event, Event::NoteOn { .. }))
                .count()
        };
        assert_eq!(notes(&music), notes(&music2));
        assert_eq!(music2.patches, music.patches);
    }
}
