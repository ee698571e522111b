// Copyright (C) 2024 SentryShot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Append-only `.meta`/`.mdat` writer (§4.C "Writer contract").
//!
//! Durability ordering: `.mdat` bytes are flushed before the corresponding
//! `.meta` record, so a reader recovering after a crash never references
//! bytes past the `.mdat` tail.

use std::path::{Path, PathBuf};

use bytes::BytesMut;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::format::{Header, Sample};
use crate::error::{wrap, Error, ErrorInt};
use crate::hls::Segment;

const FILE_MODE: u32 = 0o640;

/// One AU queued for persistence, tagged with its track and payload.
pub struct PendingSample {
    pub is_audio: bool,
    pub random_access: bool,
    pub pts: i64,
    pub dts: i64,
    pub next_dts: i64,
    pub payload: bytes::Bytes,
}

/// Owns the currently-open `.meta`/`.mdat` pair for one recording.
pub struct Writer {
    meta: File,
    mdat: File,
    mdat_offset: u32,
    sample_count: u64,
}

impl Writer {
    /// Creates `<base>.meta` and `<base>.mdat`, writing the header
    /// immediately so `.meta` is non-empty even before the first sample.
    pub async fn create(base: &Path, header: &Header) -> Result<Writer, Error> {
        let meta_path = base.with_extension("meta");
        let mdat_path = base.with_extension("mdat");
        let mut meta = open_new(&meta_path).await?;
        let mdat = open_new(&mdat_path).await?;
        let encoded = header.encode();
        meta.write_all(&encoded).await.map_err(|e| io_fatal(&meta_path, e))?;
        meta.flush().await.map_err(|e| io_fatal(&meta_path, e))?;
        Ok(Writer {
            meta,
            mdat,
            mdat_offset: 0,
            sample_count: 0,
        })
    }

    /// Appends every sample in `segment`, sorted by DTS for video tracks and
    /// PTS for audio tracks, merged in ascending timestamp order across
    /// tracks (§4.C).
    pub async fn write_segment(&mut self, base: &Path, segment: &Segment) -> Result<(), Error> {
        let mut samples: Vec<PendingSample> = Vec::new();
        for part in &segment.parts {
            for s in &part.video {
                samples.push(PendingSample {
                    is_audio: false,
                    random_access: s.random_access,
                    pts: s.pts,
                    dts: s.dts,
                    next_dts: s.dts,
                    payload: s.payload.clone(),
                });
            }
            for s in &part.audio {
                samples.push(PendingSample {
                    is_audio: true,
                    random_access: s.random_access,
                    pts: s.pts,
                    dts: s.pts,
                    next_dts: s.pts,
                    payload: s.payload.clone(),
                });
            }
        }
        samples.sort_by_key(|s| if s.is_audio { s.pts } else { s.dts });
        for (i, sample) in samples.iter().enumerate() {
            let next_dts = samples
                .get(i + 1)
                .map(|n| if sample.is_audio { n.pts } else { n.dts })
                .unwrap_or(sample.next_dts);
            self.write_sample(base, sample.is_audio, sample.random_access, sample.pts, sample.dts, next_dts, &sample.payload)
                .await?;
        }
        Ok(())
    }

    async fn write_sample(
        &mut self,
        base: &Path,
        is_audio: bool,
        random_access: bool,
        pts: i64,
        dts: i64,
        next_dts: i64,
        payload: &[u8],
    ) -> Result<(), Error> {
        let mdat_path = base.with_extension("mdat");
        let meta_path = base.with_extension("meta");
        // (i): mdat bytes land before the meta record becomes durable.
        self.mdat.write_all(payload).await.map_err(|e| io_fatal(&mdat_path, e))?;
        self.mdat.flush().await.map_err(|e| io_fatal(&mdat_path, e))?;

        let record = Sample {
            is_audio,
            random_access,
            pts,
            dts,
            next_dts,
            offset: self.mdat_offset,
            size: payload.len() as u32,
        };
        let mut buf = BytesMut::with_capacity(super::format::SAMPLE_SIZE);
        record.encode(&mut buf);
        self.meta.write_all(&buf).await.map_err(|e| io_fatal(&meta_path, e))?;
        self.meta.flush().await.map_err(|e| io_fatal(&meta_path, e))?;

        self.mdat_offset = self.mdat_offset.checked_add(payload.len() as u32).ok_or_else(|| {
            wrap!(ErrorInt::IoFatal {
                source_tag: crate::error::Source::RecDb,
                monitor_id: String::new(),
                description: "mdat exceeded u32 addressable size".to_string(),
                cause: None,
            })
        })?;
        self.sample_count += 1;
        Ok(())
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub async fn finish(mut self) -> Result<(), Error> {
        self.meta.flush().await.ok();
        self.mdat.flush().await.ok();
        Ok(())
    }
}

async fn open_new(path: &PathBuf) -> Result<File, Error> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(FILE_MODE)
            .open(path)
            .await
            .map_err(|e| io_fatal(path, e))
    }
    #[cfg(not(unix))]
    {
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .await
            .map_err(|e| io_fatal(path, e))
    }
}

fn io_fatal(path: &Path, cause: std::io::Error) -> Error {
    wrap!(ErrorInt::IoFatal {
        source_tag: crate::error::Source::RecDb,
        monitor_id: String::new(),
        description: format!("{} failed", path.display()),
        cause: Some(cause),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hls::{MuxedSample, Part};
    use bytes::Bytes;

    #[tokio::test]
    async fn writes_header_then_samples_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("rec");
        let header = Header {
            version: 0,
            video_sps: Bytes::from_static(&[0, 1]),
            video_pps: Bytes::from_static(&[2, 3, 4]),
            audio_config: Bytes::new(),
            start_time: 1,
        };
        let mut writer = Writer::create(&base, &header).await.unwrap();
        let segment = Segment {
            id: 1,
            start_pts: 0,
            end_pts: 1,
            parts: vec![Part {
                id: 1,
                is_independent: true,
                video: vec![MuxedSample {
                    pts: 0,
                    dts: 0,
                    random_access: true,
                    payload: Bytes::from_static(&[9]),
                }],
                audio: vec![],
                mp4: Bytes::new(),
            }],
        };
        writer.write_segment(&base, &segment).await.unwrap();
        assert_eq!(writer.sample_count(), 1);
        writer.finish().await.unwrap();

        let mdat = tokio::fs::read(base.with_extension("mdat")).await.unwrap();
        assert_eq!(mdat, vec![9]);
        let meta = tokio::fs::read(base.with_extension("meta")).await.unwrap();
        assert_eq!(meta.len(), header.encoded_len() + super::super::format::SAMPLE_SIZE);
    }
}
