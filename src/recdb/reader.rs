// Copyright (C) 2024 SentryShot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Random-access reader (§4.C "Reader contract"): binary-searches the fixed
//! 33-byte sample table and remuxes the requested window into fragmented MP4.

use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::format::{Header, Sample, SAMPLE_SIZE};
use crate::error::{wrap, Error, ErrorInt};
use crate::hls::mp4mux::{self, AudioParameters, VideoParameters};

pub struct RecordingReader {
    meta_path: PathBuf,
    mdat_path: PathBuf,
    header: Header,
    header_len: usize,
    samples: Vec<Sample>,
}

impl RecordingReader {
    /// Opens `<base>.meta`/`<base>.mdat` in shared read-only mode and
    /// validates the invariants checked on read (§4.C).
    pub async fn open(base: &Path) -> Result<RecordingReader, Error> {
        let meta_path = base.with_extension("meta");
        let mdat_path = base.with_extension("mdat");
        let data = tokio::fs::read(&meta_path).await.map_err(|e| {
            wrap!(ErrorInt::IoFatal {
                source_tag: crate::error::Source::RecDb,
                monitor_id: String::new(),
                description: format!("reading {}", meta_path.display()),
                cause: Some(e),
            })
        })?;
        let (header, header_len) = Header::decode(&meta_path, &data)?;

        let body = &data[header_len..];
        if body.len() % SAMPLE_SIZE != 0 {
            return Err(wrap!(ErrorInt::CorruptRecording {
                path: meta_path.clone(),
                reason: format!("trailing {} bytes not a multiple of {SAMPLE_SIZE}", body.len()),
            }));
        }
        let mut samples = Vec::with_capacity(body.len() / SAMPLE_SIZE);
        for chunk in body.chunks_exact(SAMPLE_SIZE) {
            let sample = Sample::decode(chunk).ok_or_else(|| {
                wrap!(ErrorInt::CorruptRecording {
                    path: meta_path.clone(),
                    reason: "malformed sample record".to_string(),
                })
            })?;
            samples.push(sample);
        }
        if samples.is_empty() {
            return Err(wrap!(ErrorInt::CorruptRecording {
                path: meta_path.clone(),
                reason: "recording has zero samples".to_string(),
            }));
        }

        let mdat_len = tokio::fs::metadata(&mdat_path)
            .await
            .map_err(|e| {
                wrap!(ErrorInt::IoFatal {
                    source_tag: crate::error::Source::RecDb,
                    monitor_id: String::new(),
                    description: format!("stat {}", mdat_path.display()),
                    cause: Some(e),
                })
            })?
            .len();
        for sample in &samples {
            let end = sample.offset as u64 + sample.size as u64;
            if end > mdat_len {
                return Err(wrap!(ErrorInt::CorruptRecording {
                    path: mdat_path.clone(),
                    reason: format!("sample range {end} exceeds mdat length {mdat_len}"),
                }));
            }
        }
        for pair in samples.windows(2) {
            if pair[1].dts < pair[0].dts {
                return Err(wrap!(ErrorInt::CorruptRecording {
                    path: meta_path.clone(),
                    reason: "samples not in non-decreasing dts order".to_string(),
                }));
            }
        }

        Ok(RecordingReader {
            meta_path,
            mdat_path,
            header,
            header_len,
            samples,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// First sample index with `dts >= start` whose `random_access` bit is
    /// set (step 2 of the reader contract).
    fn first_sample_at_or_after(&self, start: i64) -> usize {
        let idx = self.samples.partition_point(|s| s.dts < start);
        self.samples[idx..]
            .iter()
            .position(|s| s.random_access)
            .map(|offset| idx + offset)
            .unwrap_or(self.samples.len())
    }

    /// Streams a fragmented MP4 covering `[start, end)`, §4.C steps 2-3.
    pub async fn read_range(&self, start: Option<i64>, end: Option<i64>) -> Result<Bytes, Error> {
        let start = start.unwrap_or(i64::MIN);
        let end = end.unwrap_or(i64::MAX);
        let begin = self.first_sample_at_or_after(start);
        let mut mdat_file = tokio::fs::File::open(&self.mdat_path).await.map_err(|e| {
            wrap!(ErrorInt::IoFatal {
                source_tag: crate::error::Source::RecDb,
                monitor_id: String::new(),
                description: format!("opening {}", self.mdat_path.display()),
                cause: Some(e),
            })
        })?;

        let video = VideoParameters {
            sps: self.header.video_sps.clone(),
            pps: self.header.video_pps.clone(),
        };
        let audio = (!self.header.audio_config.is_empty()).then(|| AudioParameters {
            config: self.header.audio_config.clone(),
            sample_rate: 44_100,
            channels: 2,
        });

        let mut out = BytesMut::new();
        let mut sequence_number = 1u32;
        for sample in &self.samples[begin..] {
            if sample.dts >= end {
                break;
            }
            let mut payload = vec![0u8; sample.size as usize];
            mdat_file
                .seek(std::io::SeekFrom::Start(sample.offset as u64))
                .await
                .map_err(|e| self.io_fatal(e))?;
            mdat_file.read_exact(&mut payload).await.map_err(|e| self.io_fatal(e))?;

            let muxed = crate::hls::MuxedSample {
                pts: sample.pts,
                dts: sample.dts,
                random_access: sample.random_access,
                payload: Bytes::from(payload),
            };
            let part = if sample.is_audio {
                mp4mux::write_part("recdb", sequence_number, &video, audio.as_ref(), &[], &[muxed])?
            } else {
                mp4mux::write_part("recdb", sequence_number, &video, audio.as_ref(), &[muxed], &[])?
            };
            out.extend_from_slice(&part);
            sequence_number += 1;
        }
        Ok(out.freeze())
    }

    fn io_fatal(&self, cause: std::io::Error) -> Error {
        wrap!(ErrorInt::IoFatal {
            source_tag: crate::error::Source::RecDb,
            monitor_id: String::new(),
            description: format!("reading {}", self.mdat_path.display()),
            cause: Some(cause),
        })
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recdb::writer::Writer;

    #[tokio::test]
    async fn binary_search_finds_keyframe_at_or_after_start() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("rec");
        let header = Header {
            version: 0,
            video_sps: Bytes::from_static(&[0, 1]),
            video_pps: Bytes::from_static(&[2]),
            audio_config: Bytes::new(),
            start_time: 0,
        };
        let mut writer = Writer::create(&base, &header).await.unwrap();
        let segment = crate::hls::Segment {
            id: 1,
            start_pts: 0,
            end_pts: 3,
            parts: vec![crate::hls::Part {
                id: 1,
                is_independent: true,
                video: vec![
                    crate::hls::MuxedSample {
                        pts: 0,
                        dts: 0,
                        random_access: true,
                        payload: Bytes::from_static(&[1]),
                    },
                    crate::hls::MuxedSample {
                        pts: 1,
                        dts: 1,
                        random_access: false,
                        payload: Bytes::from_static(&[2]),
                    },
                    crate::hls::MuxedSample {
                        pts: 2,
                        dts: 2,
                        random_access: true,
                        payload: Bytes::from_static(&[3]),
                    },
                ],
                audio: vec![],
                mp4: Bytes::new(),
            }],
        };
        writer.write_segment(&base, &segment).await.unwrap();
        writer.finish().await.unwrap();

        let reader = RecordingReader::open(&base).await.unwrap();
        assert_eq!(reader.sample_count(), 3);
        assert_eq!(reader.first_sample_at_or_after(1), 2); // skips non-keyframe at dts=1
        let mp4 = reader.read_range(Some(2), None).await.unwrap();
        assert!(mp4.windows(4).any(|w| w == b"moof"));
    }
}
