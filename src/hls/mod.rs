// Copyright (C) 2024 SentryShot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! HLS live muxer (§4.B): buffers access units into fragmented-MP4 Parts and
//! Segments and fans them out to subscribers.

pub mod mp4mux;
pub mod playlist;

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::broadcast;

use crate::codec::{AccessUnit, CodecItem};
use crate::error::{wrap, Error, ErrorInt};
use mp4mux::{AudioParameters, VideoParameters};

/// Finalized segments kept available to late-joining subscribers and the
/// recorder task (§4.B "Ring buffer of N=6 finalized segments").
pub const RING_BUFFER_SEGMENTS: usize = 6;
pub const DEFAULT_SEGMENT_TARGET_MS: u64 = 2000;
pub const DEFAULT_PART_TARGET_MS: u64 = 300;

/// Bound on each subscriber's queue; falling behind this far disconnects the
/// subscriber with [`ErrorInt::OverflowedSubscriber`] instead of stalling
/// the producer (§4.B "Ordering & concurrency").
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = RING_BUFFER_SEGMENTS * 4;

#[derive(Clone, Debug)]
pub struct MuxedSample {
    pub pts: i64,
    pub dts: i64,
    pub random_access: bool,
    pub payload: Bytes,
}

impl From<&AccessUnit> for MuxedSample {
    fn from(au: &AccessUnit) -> Self {
        MuxedSample {
            pts: au.pts,
            dts: au.dts,
            random_access: au.random_access,
            payload: au.payload.clone(),
        }
    }
}

/// A sub-segment unit: one `moof`+`mdat` pair (§3 "HLS Segment").
#[derive(Clone, Debug)]
pub struct Part {
    pub id: u64,
    pub is_independent: bool,
    pub video: Vec<MuxedSample>,
    pub audio: Vec<MuxedSample>,
    pub mp4: Bytes,
}

/// An ordered run of Parts beginning with a keyframe, roughly
/// `segment_target` long (§3 "HLS Segment").
#[derive(Clone, Debug)]
pub struct Segment {
    pub id: u64,
    pub parts: Vec<Part>,
    pub start_pts: i64,
    pub end_pts: i64,
}

impl Segment {
    pub fn duration_ns(&self) -> i64 {
        self.end_pts - self.start_pts
    }

    pub fn sample_count(&self) -> usize {
        self.parts.iter().map(|p| p.video.len() + p.audio.len()).sum()
    }
}

struct PartBuilder {
    id: u64,
    is_independent: bool,
    video: Vec<MuxedSample>,
    audio: Vec<MuxedSample>,
    start_pts: Option<i64>,
}

impl PartBuilder {
    fn new(id: u64) -> Self {
        PartBuilder {
            id,
            is_independent: false,
            video: Vec::new(),
            audio: Vec::new(),
            start_pts: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.video.is_empty() && self.audio.is_empty()
    }

    fn push(&mut self, is_video: bool, sample: MuxedSample) {
        if self.start_pts.is_none() {
            self.start_pts = Some(sample.pts);
            self.is_independent = is_video && sample.random_access;
        }
        if is_video {
            self.video.push(sample);
        } else {
            self.audio.push(sample);
        }
    }

    fn duration_ns(&self, now_pts: i64) -> i64 {
        now_pts - self.start_pts.unwrap_or(now_pts)
    }
}

/// Turns an [`CodecItem`] stream into finalized [`Segment`]s and broadcasts
/// them to subscribers (§4.B).
pub struct Muxer {
    monitor_id: String,
    video_params: VideoParameters,
    audio_params: Option<AudioParameters>,
    part_target_ns: i64,
    segment_target_ns: i64,
    part: PartBuilder,
    segment_parts: Vec<Part>,
    segment_start_pts: Option<i64>,
    next_part_id: u64,
    next_segment_id: u64,
    ring: std::collections::VecDeque<Arc<Segment>>,
    tx: broadcast::Sender<Arc<Segment>>,
}

impl Muxer {
    pub fn new(
        monitor_id: &str,
        video_params: VideoParameters,
        audio_params: Option<AudioParameters>,
    ) -> (Self, broadcast::Receiver<Arc<Segment>>) {
        let (tx, rx) = broadcast::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let muxer = Muxer {
            monitor_id: monitor_id.to_string(),
            video_params,
            audio_params,
            part_target_ns: DEFAULT_PART_TARGET_MS as i64 * 1_000_000,
            segment_target_ns: DEFAULT_SEGMENT_TARGET_MS as i64 * 1_000_000,
            part: PartBuilder::new(0),
            segment_parts: Vec::new(),
            segment_start_pts: None,
            next_part_id: 1,
            next_segment_id: 1,
            ring: std::collections::VecDeque::with_capacity(RING_BUFFER_SEGMENTS),
            tx,
        };
        (muxer, rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Segment>> {
        self.tx.subscribe()
    }

    pub fn finalized_segments(&self) -> impl Iterator<Item = &Arc<Segment>> {
        self.ring.iter()
    }

    /// Feeds one access unit, finalizing the current Part and/or Segment if
    /// this sample crosses a boundary. Returns the newly finalized segment,
    /// if any.
    pub fn push(&mut self, item: CodecItem) -> Result<Option<Arc<Segment>>, Error> {
        let (is_video, au) = match &item {
            CodecItem::Video(au) => (true, au),
            CodecItem::Audio(au) => (false, au),
        };
        if self.segment_start_pts.is_none() && !(is_video && au.random_access) {
            // Wait for a video keyframe to begin the first segment (§3).
            return Ok(None);
        }
        let starts_new_part = is_video
            && au.random_access
            && !self.part.is_empty()
            && self.part.duration_ns(au.pts) > 0;
        let part_is_due = !self.part.is_empty() && self.part.duration_ns(au.pts) >= self.part_target_ns;
        let mut finalized = None;
        if starts_new_part || part_is_due {
            finalized = self.finalize_part(is_video && au.random_access, au.pts)?;
        }
        self.part.push(is_video, MuxedSample::from(au));
        Ok(finalized)
    }

    fn finalize_part(
        &mut self,
        next_starts_keyframe: bool,
        next_pts: i64,
    ) -> Result<Option<Arc<Segment>>, Error> {
        if self.part.is_empty() {
            return Ok(None);
        }
        let id = self.part.id;
        let old = std::mem::replace(&mut self.part, PartBuilder::new(self.next_part_id));
        self.next_part_id += 1;
        let mp4 = mp4mux::write_part(
            &self.monitor_id,
            id as u32,
            &self.video_params,
            self.audio_params.as_ref(),
            &old.video,
            &old.audio,
        )?;
        let part = Part {
            id,
            is_independent: old.is_independent,
            video: old.video,
            audio: old.audio,
            mp4,
        };
        if self.segment_start_pts.is_none() {
            self.segment_start_pts = Some(part.video.first().or(part.audio.first()).map(|s| s.pts).unwrap_or(next_pts));
        }
        let segment_duration = next_pts - self.segment_start_pts.unwrap();
        let should_close_segment =
            !self.segment_parts.is_empty() && next_starts_keyframe && segment_duration >= self.segment_target_ns;
        self.segment_parts.push(part);
        if should_close_segment {
            return Ok(Some(self.finalize_segment(next_pts)));
        }
        Ok(None)
    }

    fn finalize_segment(&mut self, end_pts: i64) -> Arc<Segment> {
        let id = self.next_segment_id;
        self.next_segment_id += 1;
        let parts = std::mem::take(&mut self.segment_parts);
        let start_pts = self.segment_start_pts.take().unwrap_or(end_pts);
        let segment = Arc::new(Segment {
            id,
            parts,
            start_pts,
            end_pts,
        });
        self.ring.push_back(segment.clone());
        while self.ring.len() > RING_BUFFER_SEGMENTS {
            self.ring.pop_front();
        }
        // A lagging subscriber is handled on the receive side (see
        // `recv_or_overflow`); broadcast::Sender::send never blocks here.
        let _ = self.tx.send(segment.clone());
        segment
    }
}

/// Receives the next finalized segment, translating a lagged receiver into
/// [`ErrorInt::OverflowedSubscriber`] per §4.B.
pub async fn recv_or_overflow(
    rx: &mut broadcast::Receiver<Arc<Segment>>,
) -> Result<Arc<Segment>, Error> {
    match rx.recv().await {
        Ok(segment) => Ok(segment),
        Err(broadcast::error::RecvError::Lagged(_)) => Err(wrap!(ErrorInt::OverflowedSubscriber)),
        Err(broadcast::error::RecvError::Closed) => Err(wrap!(ErrorInt::OverflowedSubscriber)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::AccessUnit;

    fn video_au(pts: i64, dts: i64, random_access: bool, payload: &[u8]) -> CodecItem {
        CodecItem::Video(AccessUnit {
            stream_id: 0,
            pts,
            dts,
            random_access,
            is_audio: false,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    #[test]
    fn segment_closes_on_keyframe_past_target() {
        let (mut muxer, _rx) = Muxer::new(
            "cam1",
            VideoParameters {
                sps: Bytes::from_static(&[0x67]),
                pps: Bytes::from_static(&[0x68]),
            },
            None,
        );
        let mut closed = None;
        for i in 0..10 {
            let pts = i * 250_000_000; // 250ms apart
            let is_kf = i == 0 || i == 9;
            let item = video_au(pts, pts, is_kf, &[i as u8]);
            if let Some(seg) = muxer.push(item).unwrap() {
                closed = Some(seg);
            }
        }
        let segment = closed.expect("segment should have closed by the second keyframe");
        assert!(segment.parts.first().unwrap().is_independent);
        assert!(segment.duration_ns() >= DEFAULT_SEGMENT_TARGET_MS as i64 * 1_000_000);
    }

    #[test]
    fn waits_for_first_keyframe_before_starting() {
        let (mut muxer, _rx) = Muxer::new(
            "cam1",
            VideoParameters {
                sps: Bytes::from_static(&[0x67]),
                pps: Bytes::from_static(&[0x68]),
            },
            None,
        );
        let result = muxer.push(video_au(0, 0, false, &[1])).unwrap();
        assert!(result.is_none());
        assert!(muxer.part.is_empty());
    }
}
