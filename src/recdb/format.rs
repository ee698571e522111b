// Copyright (C) 2024 SentryShot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! On-disk `.meta` byte layout (§3, §6): a fixed header followed by
//! 33-byte Sample records, big-endian throughout.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{wrap, Error, ErrorInt};

pub const SAMPLE_SIZE: usize = 33;
pub const CURRENT_VERSION: u8 = 0;

const FLAG_IS_AUDIO: u8 = 1 << 0;
const FLAG_RANDOM_ACCESS: u8 = 1 << 1;

/// Recording Header, written once at the start of `.meta` (§3).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub video_sps: Bytes,
    pub video_pps: Bytes,
    pub audio_config: Bytes,
    pub start_time: i64,
}

impl Header {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.version);
        buf.put_u16(self.video_sps.len() as u16);
        buf.extend_from_slice(&self.video_sps);
        buf.put_u16(self.video_pps.len() as u16);
        buf.extend_from_slice(&self.video_pps);
        buf.put_u16(self.audio_config.len() as u16);
        buf.extend_from_slice(&self.audio_config);
        buf.put_i64(self.start_time);
        buf
    }

    pub fn encoded_len(&self) -> usize {
        1 + 2 + self.video_sps.len() + 2 + self.video_pps.len() + 2 + self.audio_config.len() + 8
    }

    /// Parses the header from the start of a `.meta` file, returning it and
    /// the number of bytes consumed (§4.C invariant: "header sizes within
    /// bounds").
    pub fn decode(path: &std::path::Path, data: &[u8]) -> Result<(Header, usize), Error> {
        let corrupt = |reason: &str| {
            wrap!(ErrorInt::CorruptRecording {
                path: path.to_path_buf(),
                reason: reason.to_string(),
            })
        };
        let mut cursor = data;
        if cursor.remaining() < 1 {
            return Err(corrupt("truncated before version byte"));
        }
        let version = cursor.get_u8();
        if version != CURRENT_VERSION {
            return Err(corrupt("unsupported version"));
        }
        let video_sps = read_field(&mut cursor, path)?;
        let video_pps = read_field(&mut cursor, path)?;
        let audio_config = read_field(&mut cursor, path)?;
        if cursor.remaining() < 8 {
            return Err(corrupt("truncated before start_time"));
        }
        let start_time = cursor.get_i64();
        let consumed = data.len() - cursor.remaining();
        Ok((
            Header {
                version,
                video_sps,
                video_pps,
                audio_config,
                start_time,
            },
            consumed,
        ))
    }
}

fn read_field(cursor: &mut &[u8], path: &std::path::Path) -> Result<Bytes, Error> {
    if cursor.remaining() < 2 {
        return Err(wrap!(ErrorInt::CorruptRecording {
            path: path.to_path_buf(),
            reason: "truncated before field length".to_string(),
        }));
    }
    let len = cursor.get_u16() as usize;
    if cursor.remaining() < len {
        return Err(wrap!(ErrorInt::CorruptRecording {
            path: path.to_path_buf(),
            reason: "truncated field body".to_string(),
        }));
    }
    let field = Bytes::copy_from_slice(&cursor[..len]);
    cursor.advance(len);
    Ok(field)
}

/// A persisted Sample record, fixed 33 bytes (§3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sample {
    pub is_audio: bool,
    pub random_access: bool,
    pub pts: i64,
    pub dts: i64,
    pub next_dts: i64,
    pub offset: u32,
    pub size: u32,
}

impl Sample {
    pub fn encode(&self, out: &mut BytesMut) {
        let mut flags = 0u8;
        if self.is_audio {
            flags |= FLAG_IS_AUDIO;
        }
        if self.random_access {
            flags |= FLAG_RANDOM_ACCESS;
        }
        out.put_u8(flags);
        out.put_i64(self.pts);
        out.put_i64(self.dts);
        out.put_i64(self.next_dts);
        out.put_u32(self.offset);
        out.put_u32(self.size);
    }

    pub fn decode(bytes: &[u8]) -> Option<Sample> {
        if bytes.len() != SAMPLE_SIZE {
            return None;
        }
        let flags = bytes[0];
        let mut cursor = &bytes[1..];
        let pts = cursor.get_i64();
        let dts = cursor.get_i64();
        let next_dts = cursor.get_i64();
        let offset = cursor.get_u32();
        let size = cursor.get_u32();
        Some(Sample {
            is_audio: flags & FLAG_IS_AUDIO != 0,
            random_access: flags & FLAG_RANDOM_ACCESS != 0,
            pts,
            dts,
            next_dts,
            offset,
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Scenario 2 (§8): exact byte layout for a header plus one audio and one
    // video sample, sorted into the mdat in the order they were written.
    #[test]
    fn matches_concrete_byte_scenario() {
        let header = Header {
            version: 0,
            video_sps: Bytes::from_static(&[0, 1]),
            video_pps: Bytes::from_static(&[2, 3, 4]),
            audio_config: Bytes::from_static(&[5, 6, 7, 8]),
            start_time: 1_000_000_000,
        };
        let mut expected = vec![0x00, 0x00, 0x02, 0x00, 0x01, 0x00, 0x03, 0x02, 0x03, 0x04, 0x00, 0x04, 0x05, 0x06,
            0x07, 0x08, 0x00, 0x00, 0x00, 0x00, 0x3b, 0x9a, 0xca, 0x00];
        assert_eq!(header.encode().to_vec(), expected);

        let audio = Sample {
            is_audio: true,
            random_access: false,
            pts: 1,
            dts: 0,
            next_dts: 2,
            offset: 0,
            size: 2,
        };
        let video = Sample {
            is_audio: false,
            random_access: true,
            pts: 100_000_000_000_000,
            dts: 200_000_000_000_000,
            next_dts: 300_000_000_000_000,
            offset: 2,
            size: 1,
        };
        let mut buf = BytesMut::new();
        audio.encode(&mut buf);
        video.encode(&mut buf);
        expected.extend_from_slice(&[
            0x01, // flags: is_audio
            0, 0, 0, 0, 0, 0, 0, 1, // pts = 1
            0, 0, 0, 0, 0, 0, 0, 0, // dts = 0
            0, 0, 0, 0, 0, 0, 0, 2, // next_dts = 2
            0, 0, 0, 0, // offset = 0
            0, 0, 0, 2, // size = 2
            0x02, // flags: random_access
        ]);
        expected.extend_from_slice(&video.pts.to_be_bytes());
        expected.extend_from_slice(&video.dts.to_be_bytes());
        expected.extend_from_slice(&video.next_dts.to_be_bytes());
        expected.extend_from_slice(&[0, 0, 0, 2]); // offset = 2
        expected.extend_from_slice(&[0, 0, 0, 1]); // size = 1

        let mut full = header.encode();
        full.extend_from_slice(&buf);
        assert_eq!(full.to_vec(), expected);
        assert_eq!(buf.len(), 2 * SAMPLE_SIZE);
    }

    #[test]
    fn roundtrips_through_decode() {
        let s = Sample {
            is_audio: false,
            random_access: true,
            pts: 42,
            dts: 40,
            next_dts: 50,
            offset: 7,
            size: 9,
        };
        let mut buf = BytesMut::new();
        s.encode(&mut buf);
        assert_eq!(Sample::decode(&buf).unwrap(), s);
    }
}
