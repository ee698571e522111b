// Copyright (C) 2024 SentryShot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTP demultiplexing: validates sequence numbers/SSRC and extends the
//! wire timestamp into the nanosecond domain (§4.A "Timestamp domain").
//!
//! Adapted from `retina::client::rtp::StrictSequenceChecker`: it reports
//! packet loss via skipped sequence numbers but doesn't prohibit it, except
//! for losses large enough to be indistinguishable from a non-monotonic
//! sequence (more than `i16::MAX`).

use bytes::{Buf, Bytes};
use pretty_hex::PrettyHex;

use crate::codec::RtpPacket;
use crate::error::{bail, wrap, Error, ErrorInt};
use crate::timestamp::Timeline;

#[derive(Debug)]
pub struct RtpDemuxer {
    monitor_id: String,
    stream_id: usize,
    ssrc: Option<u32>,
    next_seq: Option<u16>,
    timeline: Timeline,
}

impl RtpDemuxer {
    pub fn new(monitor_id: &str, stream_id: usize, clock_rate: u32, start_ns: i64) -> Self {
        RtpDemuxer {
            monitor_id: monitor_id.to_string(),
            stream_id,
            ssrc: None,
            next_seq: None,
            timeline: Timeline::new(clock_rate, 0, start_ns),
        }
    }

    /// Parses one RTP packet payload (without the interleaved frame header)
    /// into a [`RtpPacket`], or `None` if it should be silently ignored
    /// (e.g. spurious data from a stale session).
    pub fn demux(&mut self, mut data: Bytes) -> Result<Option<RtpPacket>, Error> {
        let reader = rtp_rs::RtpReader::new(&data[..]).map_err(|e| {
            wrap!(ErrorInt::ProtocolMalformed {
                monitor_id: self.monitor_id.clone(),
                description: format!(
                    "corrupt RTP header while expecting seq={:04x?}: {:?}\n{:#?}",
                    self.next_seq,
                    e,
                    data.hex_dump(),
                ),
            })
        })?;
        let sequence_number = u16::from_be_bytes([data[2], data[3]]);
        let ssrc = reader.ssrc();
        let loss = sequence_number.wrapping_sub(self.next_seq.unwrap_or(sequence_number));

        if matches!(self.ssrc, Some(s) if s != ssrc) {
            bail!(wrap!(ErrorInt::ProtocolMalformed {
                monitor_id: self.monitor_id.clone(),
                description: format!(
                    "wrong ssrc; expecting ssrc={:08x?} seq={:04x?}",
                    self.ssrc, self.next_seq
                ),
            }));
        }
        if loss > 0x8000 {
            bail!(wrap!(ErrorInt::ProtocolMalformed {
                monitor_id: self.monitor_id.clone(),
                description: format!(
                    "out-of-order packet or large loss; expecting ssrc={:08x?} seq={:04x?}",
                    self.ssrc, self.next_seq
                ),
            }));
        }
        let timestamp = self
            .timeline
            .advance_to(reader.timestamp())
            .map_err(|description| {
                wrap!(ErrorInt::ProtocolMalformed {
                    monitor_id: self.monitor_id.clone(),
                    description,
                })
            })?;
        self.ssrc = Some(ssrc);
        let mark = reader.mark();
        let payload_start = reader.payload().as_ptr() as usize - data.as_ptr() as usize;
        let payload_len = reader.payload().len();
        data.truncate(payload_start + payload_len);
        data.advance(payload_start);
        self.next_seq = Some(sequence_number.wrapping_add(1));

        Ok(Some(RtpPacket {
            stream_id: self.stream_id,
            timestamp,
            loss,
            mark,
            payload: data,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtp_packet(seq: u16, ts: u32, mark: bool, payload: &[u8]) -> Bytes {
        let mut buf = vec![0x80, if mark { 0x80 } else { 0x00 }];
        buf.extend_from_slice(&seq.to_be_bytes());
        buf.extend_from_slice(&ts.to_be_bytes());
        buf.extend_from_slice(&1234u32.to_be_bytes()); // ssrc
        buf.extend_from_slice(payload);
        Bytes::from(buf)
    }

    #[test]
    fn demuxes_in_order_packets() {
        let mut d = RtpDemuxer::new("cam1", 0, 90_000, 0);
        let pkt = d.demux(rtp_packet(100, 0, true, &[1, 2, 3])).unwrap().unwrap();
        assert_eq!(&pkt.payload[..], &[1, 2, 3]);
        assert!(pkt.mark);
        assert_eq!(pkt.loss, 0);
    }

    #[test]
    fn rejects_wrong_ssrc() {
        let mut d = RtpDemuxer::new("cam1", 0, 90_000, 0);
        d.demux(rtp_packet(1, 0, false, &[1])).unwrap();
        let mut buf = vec![0x80, 0x00];
        buf.extend_from_slice(&2u16.to_be_bytes());
        buf.extend_from_slice(&90_000u32.to_be_bytes());
        buf.extend_from_slice(&9999u32.to_be_bytes()); // different ssrc
        buf.extend_from_slice(&[1]);
        assert!(d.demux(Bytes::from(buf)).is_err());
    }
}
