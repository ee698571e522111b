// Copyright (C) 2024 SentryShot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Codec-specific RTP depacketization (§4.A "RTP depacketization").
//!
//! Turns the packet stream from [`crate::rtsp::client`] into access units
//! with absolute PTS/DTS, following the same `Depacketizer` dispatch shape
//! as `retina::codec`.

pub mod aac;
pub mod h264;

use bytes::Bytes;

use crate::error::Error;
use crate::timestamp::Timestamp;

/// One received, demultiplexed RTP packet handed to a depacketizer.
#[derive(Debug)]
pub struct RtpPacket {
    pub stream_id: usize,
    pub timestamp: Timestamp,
    pub loss: u16,
    pub mark: bool,
    pub payload: Bytes,
}

/// One decodable unit: an H.264 frame (AVCC-encoded NAL list) or one audio
/// frame, per §3 "Access Unit".
#[derive(Clone, Debug)]
pub struct AccessUnit {
    pub stream_id: usize,
    pub pts: i64,
    pub dts: i64,
    pub random_access: bool,
    pub is_audio: bool,
    pub payload: Bytes,
}

#[derive(Debug)]
pub enum CodecItem {
    Video(AccessUnit),
    Audio(AccessUnit),
}

/// Turns a stream of [`RtpPacket`]s into [`CodecItem`]s. Mirrors
/// `retina::codec::Depacketizer`'s push/pull split: `push` buffers or
/// assembles, `pull` drains completed access units.
pub enum Depacketizer {
    H264(Box<h264::Depacketizer>),
    Aac(Box<aac::Depacketizer>),
}

impl Depacketizer {
    pub fn new_h264(monitor_id: &str, sprop_parameter_sets: Option<&str>) -> Result<Self, Error> {
        Ok(Depacketizer::H264(Box::new(h264::Depacketizer::new(
            monitor_id,
            sprop_parameter_sets,
        )?)))
    }

    pub fn new_aac(
        monitor_id: &str,
        clock_rate: u32,
        format_specific_params: Option<&str>,
    ) -> Result<Self, Error> {
        Ok(Depacketizer::Aac(Box::new(aac::Depacketizer::new(
            monitor_id,
            clock_rate,
            format_specific_params,
        )?)))
    }

    pub fn push(&mut self, pkt: RtpPacket) -> Result<(), Error> {
        match self {
            Depacketizer::H264(d) => d.push(pkt),
            Depacketizer::Aac(d) => d.push(pkt),
        }
    }

    pub fn pull(&mut self) -> Option<CodecItem> {
        match self {
            Depacketizer::H264(d) => d.pull().map(CodecItem::Video),
            Depacketizer::Aac(d) => d.pull().map(CodecItem::Audio),
        }
    }

    /// SPS/PPS for an H.264 track, once both have been seen either from
    /// `sprop-parameter-sets` or in-band (§4.B "video parameters").
    pub fn video_parameter_sets(&self) -> Option<(Bytes, Bytes)> {
        match self {
            Depacketizer::H264(d) => {
                let (sps, pps) = d.parameter_sets();
                Some((sps?.clone(), pps?.clone()))
            }
            Depacketizer::Aac(_) => None,
        }
    }

    pub fn audio_config(&self) -> Option<Bytes> {
        match self {
            Depacketizer::Aac(d) => Some(d.audio_config().clone()),
            Depacketizer::H264(_) => None,
        }
    }
}
