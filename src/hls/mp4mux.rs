// Copyright (C) 2024 SentryShot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fragmented MP4 (ISO/IEC 14496-12) box writer for HLS Parts (§4.B).
//!
//! Adapted from the `write_box!` pattern used by Scott Lamb's RTSP example
//! MP4 writers: a box reserves a 4-byte length placeholder, writes its body,
//! then backpatches the length once the body size is known.

use bytes::{BufMut, BytesMut};

use super::MuxedSample;
use crate::error::{wrap, Error, ErrorInt};

const VIDEO_TRACK_ID: u32 = 1;
const AUDIO_TRACK_ID: u32 = 2;
const VIDEO_TIMESCALE: u32 = 90_000;

#[derive(Clone, Debug)]
pub struct VideoParameters {
    pub sps: bytes::Bytes,
    pub pps: bytes::Bytes,
}

#[derive(Clone, Debug)]
pub struct AudioParameters {
    pub config: bytes::Bytes,
    pub sample_rate: u32,
    pub channels: u16,
}

macro_rules! write_box {
    ($buf:expr, $fourcc:expr, $b:block) => {{
        let _: &mut BytesMut = $buf;
        let pos_start = $buf.len();
        let fourcc: &[u8; 4] = $fourcc;
        $buf.put_u32(0); // length placeholder
        $buf.extend_from_slice(fourcc);
        let r = { $b };
        let pos_end = $buf.len();
        let len = u32::try_from(pos_end - pos_start).map_err(|_| {
            wrap!(ErrorInt::ProtocolMalformed {
                monitor_id: String::new(),
                description: "mp4 box exceeds u32 length".to_string(),
            })
        })?;
        $buf[pos_start..pos_start + 4].copy_from_slice(&len.to_be_bytes());
        r
    }};
}

/// Writes the `ftyp`, `moov` (with `mvex` for fragmentation), and the first
/// `moof`/`mdat` pair for `video`/`audio` in one Part.
pub fn write_part(
    monitor_id: &str,
    sequence_number: u32,
    video: &VideoParameters,
    audio: Option<&AudioParameters>,
    video_samples: &[MuxedSample],
    audio_samples: &[MuxedSample],
) -> Result<bytes::Bytes, Error> {
    let mut buf = BytesMut::new();
    if sequence_number == 1 {
        write_ftyp(&mut buf, monitor_id)?;
        write_moov(&mut buf, monitor_id, video, audio)?;
    }
    write_moof_mdat(
        &mut buf,
        monitor_id,
        sequence_number,
        video_samples,
        audio_samples,
    )?;
    Ok(buf.freeze())
}

fn write_ftyp(buf: &mut BytesMut, _monitor_id: &str) -> Result<(), Error> {
    write_box!(buf, b"ftyp", {
        buf.extend_from_slice(b"isom");
        buf.put_u32(0x200);
        buf.extend_from_slice(b"isom");
        buf.extend_from_slice(b"iso6");
        buf.extend_from_slice(b"avc1");
        buf.extend_from_slice(b"mp41");
    });
    Ok(())
}

fn write_moov(
    buf: &mut BytesMut,
    monitor_id: &str,
    video: &VideoParameters,
    audio: Option<&AudioParameters>,
) -> Result<(), Error> {
    write_box!(buf, b"moov", {
        write_box!(buf, b"mvhd", {
            buf.put_u32(0); // version/flags
            buf.put_u32(0); // creation_time
            buf.put_u32(0); // modification_time
            buf.put_u32(VIDEO_TIMESCALE);
            buf.put_u32(0); // duration (fragmented; unknown)
            buf.put_i32(0x0001_0000); // rate 1.0
            buf.put_i16(0x0100); // volume 1.0
            buf.put_u16(0); // reserved
            buf.put_u64(0); // reserved[2]
            for v in [0x0001_0000i32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
                buf.put_i32(v); // unity matrix
            }
            for _ in 0..6 {
                buf.put_u32(0); // pre_defined
            }
            buf.put_u32(VIDEO_TRACK_ID.max(AUDIO_TRACK_ID) + 1); // next_track_id
        });
        write_trak(buf, monitor_id, video)?;
        if let Some(audio) = audio {
            write_audio_trak(buf, monitor_id, audio)?;
        }
        write_box!(buf, b"mvex", {
            write_box!(buf, b"trex", {
                buf.put_u32(0);
                buf.put_u32(VIDEO_TRACK_ID);
                buf.put_u32(1); // default_sample_description_index
                buf.put_u32(0); // default_sample_duration
                buf.put_u32(0); // default_sample_size
                buf.put_u32(0); // default_sample_flags
            });
            if audio.is_some() {
                write_box!(buf, b"trex", {
                    buf.put_u32(0);
                    buf.put_u32(AUDIO_TRACK_ID);
                    buf.put_u32(1);
                    buf.put_u32(0);
                    buf.put_u32(0);
                    buf.put_u32(0);
                });
            }
        });
    });
    Ok(())
}

fn write_trak(buf: &mut BytesMut, _monitor_id: &str, video: &VideoParameters) -> Result<(), Error> {
    write_box!(buf, b"trak", {
        write_box!(buf, b"tkhd", {
            buf.put_u32(0x0000_0003); // version 0, flags: track enabled + in movie
            buf.put_u32(0);
            buf.put_u32(0);
            buf.put_u32(VIDEO_TRACK_ID);
            buf.put_u32(0);
            buf.put_u32(0); // duration
            buf.put_u64(0);
            buf.put_i16(0);
            buf.put_i16(0);
            buf.put_i16(0);
            buf.put_u16(0);
            for v in [0x0001_0000i32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
                buf.put_i32(v);
            }
            buf.put_u32(0); // width (fixed-point 16.16, unknown until SPS decode)
            buf.put_u32(0); // height
        });
        write_box!(buf, b"mdia", {
            write_box!(buf, b"mdhd", {
                buf.put_u32(0);
                buf.put_u32(0);
                buf.put_u32(0);
                buf.put_u32(VIDEO_TIMESCALE);
                buf.put_u32(0);
                buf.put_u16(0x55c4); // und
                buf.put_u16(0);
            });
            write_box!(buf, b"hdlr", {
                buf.put_u32(0);
                buf.put_u32(0);
                buf.extend_from_slice(b"vide");
                buf.put_u32(0);
                buf.put_u32(0);
                buf.put_u32(0);
                buf.extend_from_slice(b"video\0");
            });
            write_box!(buf, b"minf", {
                write_box!(buf, b"vmhd", {
                    buf.put_u32(1);
                    buf.put_u64(0);
                });
                write_dinf(buf)?;
                write_box!(buf, b"stbl", {
                    write_empty_sample_tables(buf)?;
                    write_box!(buf, b"stsd", {
                        buf.put_u32(0);
                        buf.put_u32(1);
                        write_avc1(buf, video)?;
                    });
                });
            });
        });
    });
    Ok(())
}

fn write_audio_trak(buf: &mut BytesMut, _monitor_id: &str, audio: &AudioParameters) -> Result<(), Error> {
    write_box!(buf, b"trak", {
        write_box!(buf, b"tkhd", {
            buf.put_u32(0x0000_0003);
            buf.put_u32(0);
            buf.put_u32(0);
            buf.put_u32(AUDIO_TRACK_ID);
            buf.put_u32(0);
            buf.put_u32(0);
            buf.put_u64(0);
            buf.put_i16(0);
            buf.put_i16(0);
            buf.put_i16(0x0100); // volume 1.0 for audio
            buf.put_u16(0);
            for v in [0x0001_0000i32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
                buf.put_i32(v);
            }
            buf.put_u32(0);
            buf.put_u32(0);
        });
        write_box!(buf, b"mdia", {
            write_box!(buf, b"mdhd", {
                buf.put_u32(0);
                buf.put_u32(0);
                buf.put_u32(0);
                buf.put_u32(audio.sample_rate);
                buf.put_u32(0);
                buf.put_u16(0x55c4);
                buf.put_u16(0);
            });
            write_box!(buf, b"hdlr", {
                buf.put_u32(0);
                buf.put_u32(0);
                buf.extend_from_slice(b"soun");
                buf.put_u32(0);
                buf.put_u32(0);
                buf.put_u32(0);
                buf.extend_from_slice(b"audio\0");
            });
            write_box!(buf, b"minf", {
                write_box!(buf, b"smhd", {
                    buf.put_u32(0);
                    buf.put_i16(0);
                    buf.put_u16(0);
                });
                write_dinf(buf)?;
                write_box!(buf, b"stbl", {
                    write_empty_sample_tables(buf)?;
                    write_box!(buf, b"stsd", {
                        buf.put_u32(0);
                        buf.put_u32(1);
                        write_mp4a(buf, audio)?;
                    });
                });
            });
        });
    });
    Ok(())
}

fn write_dinf(buf: &mut BytesMut) -> Result<(), Error> {
    write_box!(buf, b"dinf", {
        write_box!(buf, b"dref", {
            buf.put_u32(0);
            buf.put_u32(1);
            write_box!(buf, b"url ", {
                buf.put_u32(1); // self-contained flag
            });
        });
    });
    Ok(())
}

fn write_empty_sample_tables(buf: &mut BytesMut) -> Result<(), Error> {
    for fourcc in [b"stts", b"stsc", b"stsz", b"stco"] {
        write_box!(buf, fourcc, {
            buf.put_u32(0);
            if fourcc == b"stsz" {
                buf.put_u32(0); // sample_size
            }
            buf.put_u32(0); // entry_count
        });
    }
    Ok(())
}

fn write_avc1(buf: &mut BytesMut, video: &VideoParameters) -> Result<(), Error> {
    write_box!(buf, b"avc1", {
        buf.put_u32(0); // reserved[0..4]
        buf.put_u16(0); // reserved[4..6]
        buf.put_u16(1); // data_reference_index
        buf.put_u32(0); // pre_defined + reserved
        buf.put_u64(0);
        buf.put_u32(0);
        buf.put_u16(0); // width (unknown at this layer; filled by a higher-level remux when serving to clients that need it)
        buf.put_u16(0); // height
        buf.put_u32(0x0048_0000); // horizresolution 72dpi
        buf.put_u32(0x0048_0000); // vertresolution 72dpi
        buf.put_u32(0); // reserved
        buf.put_u16(1); // frame_count
        for _ in 0..32 {
            buf.put_u8(0); // compressorname
        }
        buf.put_u16(0x0018); // depth
        buf.put_i16(-1); // pre_defined
        write_box!(buf, b"avcC", {
            buf.put_u8(1); // configurationVersion
            buf.put_u8(video.sps.get(1).copied().unwrap_or(0)); // profile
            buf.put_u8(video.sps.get(2).copied().unwrap_or(0)); // profile compat
            buf.put_u8(video.sps.get(3).copied().unwrap_or(0)); // level
            buf.put_u8(0xff); // 6 reserved bits + lengthSizeMinusOne=3 (4-byte NAL lengths)
            buf.put_u8(0xe1); // 3 reserved bits + numOfSequenceParameterSets=1
            buf.put_u16(video.sps.len() as u16);
            buf.extend_from_slice(&video.sps);
            buf.put_u8(1); // numOfPictureParameterSets
            buf.put_u16(video.pps.len() as u16);
            buf.extend_from_slice(&video.pps);
        });
    });
    Ok(())
}

fn write_mp4a(buf: &mut BytesMut, audio: &AudioParameters) -> Result<(), Error> {
    write_box!(buf, b"mp4a", {
        buf.put_u32(0);
        buf.put_u16(0);
        buf.put_u16(1); // data_reference_index
        buf.put_u64(0); // reserved
        buf.put_u16(audio.channels);
        buf.put_u16(16); // samplesize
        buf.put_u32(0); // pre_defined + reserved
        buf.put_u32((audio.sample_rate as u32) << 16);
        write_box!(buf, b"esds", {
            buf.put_u32(0);
            write_descriptor(buf, 0x03, |buf| {
                buf.put_u16(1); // ES_ID
                buf.put_u8(0); // flags
                write_descriptor(buf, 0x04, |buf| {
                    buf.put_u8(0x40); // objectTypeIndication: Audio ISO/IEC 14496-3
                    buf.put_u8(0x15); // streamType=audio, upStream=0, reserved=1
                    buf.put_u8(0);
                    buf.put_u16(0); // bufferSizeDB
                    buf.put_u32(0); // maxBitrate
                    buf.put_u32(0); // avgBitrate
                    write_descriptor(buf, 0x05, |buf| {
                        buf.extend_from_slice(&audio.config);
                    });
                });
            });
        });
    });
    Ok(())
}

/// Writes a descriptor tag + varint length for everything `body` appends,
/// per ISO/IEC 14496-1 Table 1.
fn write_descriptor(buf: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    let pos_start = buf.len();
    buf.put_u8(tag);
    buf.extend_from_slice(&[0, 0, 0, 0]); // varint length placeholder (4-byte form)
    let body_start = buf.len();
    body(buf);
    let len = (buf.len() - body_start) as u32;
    let encoded = [
        0x80 | ((len >> 21) & 0x7f) as u8,
        0x80 | ((len >> 14) & 0x7f) as u8,
        0x80 | ((len >> 7) & 0x7f) as u8,
        (len & 0x7f) as u8,
    ];
    buf[pos_start + 1..pos_start + 5].copy_from_slice(&encoded);
}

fn write_moof_mdat(
    buf: &mut BytesMut,
    monitor_id: &str,
    sequence_number: u32,
    video_samples: &[MuxedSample],
    audio_samples: &[MuxedSample],
) -> Result<(), Error> {
    let mut data_offset_positions = Vec::new();
    write_box!(buf, b"moof", {
        write_box!(buf, b"mfhd", {
            buf.put_u32(0);
            buf.put_u32(sequence_number);
        });
        if !video_samples.is_empty() {
            data_offset_positions.push((VIDEO_TRACK_ID, write_traf(buf, VIDEO_TRACK_ID, video_samples)?));
        }
        if !audio_samples.is_empty() {
            data_offset_positions.push((AUDIO_TRACK_ID, write_traf(buf, AUDIO_TRACK_ID, audio_samples)?));
        }
    });
    let moof_len = buf.len();
    write_box!(buf, b"mdat", {
        for sample in video_samples.iter().chain(audio_samples.iter()) {
            buf.extend_from_slice(&sample.payload);
        }
    });
    let mdat_data_offset = (buf.len() - moof_len + 8) as i32;
    for (_track_id, pos) in data_offset_positions {
        buf[pos..pos + 4].copy_from_slice(&mdat_data_offset.to_be_bytes());
    }
    let _ = monitor_id;
    Ok(())
}

/// Writes `tfhd`+`tfdt`+`trun` for one track's samples in this fragment.
/// Returns the moof-relative byte offset of `trun`'s `data_offset` field so
/// the caller can backpatch it once the `mdat` offset is known.
fn write_traf(buf: &mut BytesMut, track_id: u32, samples: &[MuxedSample]) -> Result<usize, Error> {
    let mut data_offset_pos = 0;
    write_box!(buf, b"traf", {
        write_box!(buf, b"tfhd", {
            buf.put_u32(0x0002_0000); // default-base-is-moof
            buf.put_u32(track_id);
        });
        write_box!(buf, b"tfdt", {
            buf.put_u32(1 << 24); // version 1
            buf.put_u64(samples[0].dts.max(0) as u64);
        });
        write_box!(buf, b"trun", {
            const DATA_OFFSET: u32 = 0x0000_01;
            const SAMPLE_DURATION: u32 = 0x0000_100;
            const SAMPLE_SIZE: u32 = 0x0000_200;
            const SAMPLE_FLAGS: u32 = 0x0000_400;
            buf.put_u32(DATA_OFFSET | SAMPLE_DURATION | SAMPLE_SIZE | SAMPLE_FLAGS);
            buf.put_u32(samples.len() as u32);
            data_offset_pos = buf.len();
            buf.put_i32(0); // data_offset placeholder
            for (i, sample) in samples.iter().enumerate() {
                let duration = samples
                    .get(i + 1)
                    .map(|next| (next.dts - sample.dts).max(0))
                    .unwrap_or(0) as u32;
                buf.put_u32(duration);
                buf.put_u32(sample.payload.len() as u32);
                let is_non_sync = !sample.random_access;
                buf.put_u32(if is_non_sync { 0x0001_0000 } else { 0x0200_0000 });
            }
        });
    });
    Ok(data_offset_pos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_part_carries_init_segment() {
        let video = VideoParameters {
            sps: bytes::Bytes::from_static(&[0x67, 0x42, 0, 0x1e]),
            pps: bytes::Bytes::from_static(&[0x68, 0xce]),
        };
        let samples = vec![MuxedSample {
            pts: 0,
            dts: 0,
            random_access: true,
            payload: bytes::Bytes::from_static(&[1, 2, 3]),
        }];
        let part = write_part("cam1", 1, &video, None, &samples, &[]).unwrap();
        assert_eq!(&part[4..8], b"ftyp");
        assert!(part.windows(4).any(|w| w == b"moov"));
        assert!(part.windows(4).any(|w| w == b"moof"));
        assert!(part.windows(4).any(|w| w == b"avcC"));
    }

    #[test]
    fn later_parts_omit_init_segment() {
        let video = VideoParameters {
            sps: bytes::Bytes::from_static(&[0x67]),
            pps: bytes::Bytes::from_static(&[0x68]),
        };
        let samples = vec![MuxedSample {
            pts: 0,
            dts: 0,
            random_access: false,
            payload: bytes::Bytes::from_static(&[9]),
        }];
        let part = write_part("cam1", 2, &video, None, &samples, &[]).unwrap();
        assert_eq!(&part[4..8], b"moof");
    }
}
