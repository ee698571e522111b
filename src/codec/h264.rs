// Copyright (C) 2024 SentryShot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! H.264 depacketization per [RFC 6184](https://datatracker.ietf.org/doc/html/rfc6184).
//!
//! Handles single-NAL, STAP-A, and FU-A packet types (§4.A); STAP-B/MTAP/FU-B
//! are rejected. DTS is reconstructed from the Sequence Parameter Set's
//! `pic_order_cnt_type`, using the "pause-dts" technique noted as
//! implementation-defined in the design notes: for `pic_order_cnt_type == 0`,
//! output is delayed by a small reorder window so each access unit's DTS is
//! an earlier access unit's PTS; for `pic_order_cnt_type == 2` DTS equals
//! PTS; `pic_order_cnt_type == 1` is unsupported.

use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};

use super::{AccessUnit, RtpPacket};
use crate::error::{bail, wrap, Error, ErrorInt};

const MAX_NALU_SIZE: usize = 3 * 1024 * 1024;
const MAX_NALS_PER_AU: usize = 20;
/// Default reorder depth for `pic_order_cnt_type == 0` streams that don't
/// advertise `max_num_reorder_frames` in VUI. Correct for the common
/// `IBPBP...` pattern (one B-frame between references); unusual encoder
/// configurations may need more (see design notes, open question).
const DEFAULT_REORDER_DEPTH: usize = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PicOrderCntType {
    Zero,
    One,
    Two,
    Unknown,
}

struct PendingAu {
    pts: i64,
    random_access: bool,
    nals: Vec<Bytes>,
}

pub struct Depacketizer {
    monitor_id: String,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    poc_type: PicOrderCntType,
    reorder_depth: usize,

    // In-progress access unit, accumulated until the RTP marker bit.
    current: Option<PendingAu>,

    // FU-A fragment reassembly.
    fu_buf: Option<BytesMut>,

    // Access units awaiting DTS assignment (oldest first) and the queue of
    // completed, DTS-stamped access units ready to `pull()`.
    reorder_queue: VecDeque<PendingAu>,
    ready: VecDeque<AccessUnit>,
}

impl Depacketizer {
    pub fn new(monitor_id: &str, sprop_parameter_sets: Option<&str>) -> Result<Self, Error> {
        let mut sps = None;
        let mut pps = None;
        if let Some(param) = sprop_parameter_sets {
            for (i, part) in param.split(',').enumerate() {
                use base64::Engine;
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(part.trim())
                    .map_err(|e| {
                        wrap!(ErrorInt::ProtocolMalformed {
                            monitor_id: monitor_id.to_string(),
                            description: format!("bad sprop-parameter-sets: {e}"),
                        })
                    })?;
                match i {
                    0 => sps = Some(Bytes::from(decoded)),
                    1 => pps = Some(Bytes::from(decoded)),
                    _ => {}
                }
            }
        }
        let poc_type = sps
            .as_deref()
            .and_then(parse_pic_order_cnt_type)
            .unwrap_or(PicOrderCntType::Unknown);
        if poc_type == PicOrderCntType::One {
            bail!(wrap!(ErrorInt::ProtocolMalformed {
                monitor_id: monitor_id.to_string(),
                description: "pic_order_cnt_type == 1 is unsupported".to_string(),
            }));
        }
        let reorder_depth = match poc_type {
            PicOrderCntType::Zero => DEFAULT_REORDER_DEPTH,
            _ => 0,
        };
        Ok(Depacketizer {
            monitor_id: monitor_id.to_string(),
            sps,
            pps,
            poc_type,
            reorder_depth,
            current: None,
            fu_buf: None,
            reorder_queue: VecDeque::new(),
            ready: VecDeque::new(),
        })
    }

    pub fn parameter_sets(&self) -> (Option<&Bytes>, Option<&Bytes>) {
        (self.sps.as_ref(), self.pps.as_ref())
    }

    pub fn push(&mut self, pkt: RtpPacket) -> Result<(), Error> {
        if pkt.payload.is_empty() {
            bail!(wrap!(ErrorInt::ProtocolMalformed {
                monitor_id: self.monitor_id.clone(),
                description: "ErrAnnexBEmptyNalu".to_string(),
            }));
        }
        let nal_header = pkt.payload[0];
        let nal_type = nal_header & 0x1F;
        match nal_type {
            1..=23 => self.push_nal(pkt.payload.clone())?,
            24 => self.push_stap_a(&pkt.payload)?,
            28 => self.push_fu_a(&pkt.payload)?,
            25 | 26 | 27 | 29 => {
                bail!(wrap!(ErrorInt::ProtocolMalformed {
                    monitor_id: self.monitor_id.clone(),
                    description: format!("Unsupported NAL aggregation/fragmentation type {nal_type}"),
                }))
            }
            _ => {
                bail!(wrap!(ErrorInt::ProtocolMalformed {
                    monitor_id: self.monitor_id.clone(),
                    description: format!("unexpected NAL type {nal_type}"),
                }))
            }
        }

        if pkt.mark {
            self.finish_au(pkt.timestamp.as_nanos())?;
        }
        Ok(())
    }

    fn push_nal(&mut self, nal: Bytes) -> Result<(), Error> {
        if nal.len() > MAX_NALU_SIZE {
            bail!(wrap!(ErrorInt::ProtocolMalformed {
                monitor_id: self.monitor_id.clone(),
                description: "NaluSizeTooBig".to_string(),
            }));
        }
        let nal_type = nal[0] & 0x1F;
        if nal_type == 7 {
            self.sps = Some(nal.clone());
            if let Some(poc) = parse_pic_order_cnt_type(&nal) {
                self.poc_type = poc;
                self.reorder_depth = if poc == PicOrderCntType::Zero {
                    DEFAULT_REORDER_DEPTH
                } else {
                    0
                };
            }
        } else if nal_type == 8 {
            self.pps = Some(nal.clone());
        }
        let au = self.current.get_or_insert_with(|| PendingAu {
            pts: 0,
            random_access: false,
            nals: Vec::new(),
        });
        if au.nals.len() >= MAX_NALS_PER_AU {
            bail!(wrap!(ErrorInt::ProtocolMalformed {
                monitor_id: self.monitor_id.clone(),
                description: format!("more than {MAX_NALS_PER_AU} NALs in one access unit"),
            }));
        }
        if nal_type == 5 {
            au.random_access = true;
        }
        au.nals.push(nal);
        Ok(())
    }

    fn push_stap_a(&mut self, payload: &Bytes) -> Result<(), Error> {
        let mut rest = &payload[1..];
        while !rest.is_empty() {
            if rest.len() < 2 {
                bail!(wrap!(ErrorInt::ProtocolMalformed {
                    monitor_id: self.monitor_id.clone(),
                    description: "truncated STAP-A NAL size".to_string(),
                }));
            }
            let size = u16::from_be_bytes([rest[0], rest[1]]) as usize;
            rest = &rest[2..];
            if rest.len() < size {
                bail!(wrap!(ErrorInt::ProtocolMalformed {
                    monitor_id: self.monitor_id.clone(),
                    description: "truncated STAP-A NAL payload".to_string(),
                }));
            }
            if size == 0 {
                bail!(wrap!(ErrorInt::ProtocolMalformed {
                    monitor_id: self.monitor_id.clone(),
                    description: "ErrAnnexBEmptyNalu".to_string(),
                }));
            }
            let nal = payload.slice_ref(&rest[..size]);
            rest = &rest[size..];
            self.push_nal(nal)?;
        }
        Ok(())
    }

    fn push_fu_a(&mut self, payload: &Bytes) -> Result<(), Error> {
        if payload.len() < 2 {
            bail!(wrap!(ErrorInt::ProtocolMalformed {
                monitor_id: self.monitor_id.clone(),
                description: "truncated FU-A header".to_string(),
            }));
        }
        let fu_indicator = payload[0];
        let fu_header = payload[1];
        let start = fu_header & 0x80 != 0;
        let end = fu_header & 0x40 != 0;
        let nal_type = fu_header & 0x1F;

        if start {
            let mut buf = BytesMut::with_capacity(payload.len() - 1);
            let reconstructed_header = (fu_indicator & 0xE0) | nal_type;
            buf.put_u8(reconstructed_header);
            buf.put_slice(&payload[2..]);
            self.fu_buf = Some(buf);
        } else {
            let Some(buf) = self.fu_buf.as_mut() else {
                bail!(wrap!(ErrorInt::ProtocolMalformed {
                    monitor_id: self.monitor_id.clone(),
                    description: "NonStartingPacketAndNoPrevious".to_string(),
                }));
            };
            buf.put_slice(&payload[2..]);
            if buf.len() > MAX_NALU_SIZE {
                bail!(wrap!(ErrorInt::ProtocolMalformed {
                    monitor_id: self.monitor_id.clone(),
                    description: "NaluSizeTooBig".to_string(),
                }));
            }
        }
        if end {
            let Some(buf) = self.fu_buf.take() else {
                bail!(wrap!(ErrorInt::ProtocolMalformed {
                    monitor_id: self.monitor_id.clone(),
                    description: "NonStartingPacketAndNoPrevious".to_string(),
                }));
            };
            self.push_nal(buf.freeze())?;
        }
        Ok(())
    }

    fn finish_au(&mut self, pts: i64) -> Result<(), Error> {
        let Some(mut au) = self.current.take() else {
            return Ok(());
        };
        au.pts = pts;
        if self.ready.is_empty() && self.reorder_queue.is_empty() {
            // First access unit of the stream is always a random access point
            // per §3's invariant, even if the encoder failed to mark it.
            au.random_access = true;
        }
        self.reorder_queue.push_back(au);
        while self.reorder_queue.len() > self.reorder_depth {
            let au = self.reorder_queue.pop_front().unwrap();
            let dts = if self.reorder_depth == 0 {
                au.pts
            } else if let Some(oldest) = self.reorder_queue.front() {
                oldest.pts.min(au.pts)
            } else {
                au.pts
            };
            if dts > au.pts {
                bail!(wrap!(ErrorInt::ProtocolMalformed {
                    monitor_id: self.monitor_id.clone(),
                    description: "DtsNotMonotonic".to_string(),
                }));
            }
            self.ready.push_back(to_access_unit(au, dts));
        }
        Ok(())
    }

    pub fn pull(&mut self) -> Option<AccessUnit> {
        self.ready.pop_front()
    }
}

fn to_access_unit(au: PendingAu, dts: i64) -> AccessUnit {
    let mut payload = BytesMut::new();
    for nal in &au.nals {
        payload.put_u32(nal.len() as u32);
        payload.put_slice(nal);
    }
    AccessUnit {
        stream_id: 0,
        pts: au.pts,
        dts,
        random_access: au.random_access,
        is_audio: false,
        payload: payload.freeze(),
    }
}

/// Extracts `pic_order_cnt_type` from a raw (non-RBSP-escaped) SPS NAL using
/// `h264-reader`'s bitstream parser, logging and returning `None` on any
/// parse failure rather than treating an unparsable SPS as fatal (a camera's
/// custom SPS extensions shouldn't block recording).
fn parse_pic_order_cnt_type(sps_nal: &[u8]) -> Option<PicOrderCntType> {
    use h264_reader::nal::sps::SeqParameterSet;
    use h264_reader::rbsp::decode_nal;

    if sps_nal.len() < 2 {
        return None;
    }
    // Strip the one-byte NAL header; `decode_nal` removes emulation
    // prevention bytes from the remaining RBSP before bit parsing.
    let rbsp = decode_nal(&sps_nal[1..]);
    let sps = SeqParameterSet::from_bytes(&rbsp[..]).ok()?;
    Some(match sps.pic_order_cnt {
        h264_reader::nal::sps::PicOrderCntType::TypeZero { .. } => PicOrderCntType::Zero,
        h264_reader::nal::sps::PicOrderCntType::TypeOne { .. } => PicOrderCntType::One,
        h264_reader::nal::sps::PicOrderCntType::TypeTwo => PicOrderCntType::Two,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp::Timestamp;

    fn pkt(payload: Vec<u8>, pts: i64, mark: bool) -> RtpPacket {
        RtpPacket {
            stream_id: 0,
            timestamp: Timestamp(pts),
            loss: 0,
            mark,
            payload: Bytes::from(payload),
        }
    }

    #[test]
    fn single_nal_idr_is_random_access() {
        let mut d = Depacketizer::new("cam1", None).unwrap();
        // nal_ref_idc=3, type=5 (IDR)
        d.push(pkt(vec![0x65, 0xAA, 0xBB], 1_000, true)).unwrap();
        let au = d.pull().unwrap();
        assert!(au.random_access);
        assert_eq!(au.dts, au.pts);
        // AVCC: 4-byte length + payload.
        assert_eq!(&au.payload[..4], &3u32.to_be_bytes());
    }

    #[test]
    fn empty_payload_rejected() {
        let mut d = Depacketizer::new("cam1", None).unwrap();
        assert!(d.push(pkt(vec![], 0, true)).is_err());
    }

    #[test]
    fn fu_a_without_start_fails() {
        let mut d = Depacketizer::new("cam1", None).unwrap();
        // FU-A indicator (type 28), header with neither S nor E, arbitrary type.
        let err = d.push(pkt(vec![0x7C, 0x05, 0xAA], 0, true));
        assert!(err.is_err());
    }

    #[test]
    fn fu_a_reassembles_fragmented_nal() {
        let mut d = Depacketizer::new("cam1", None).unwrap();
        // nal_ref_idc=2 in indicator, fragmenting a type=1 (non-IDR) NAL.
        let indicator = 0x5C; // 0b0101_1100: FU indicator, nal_ref_idc=2, type=28
        let start_hdr = 0x81u8; // S=1,E=0,R=0, type=1
        let end_hdr = 0x41u8; // S=0,E=1,R=0, type=1
        d.push(pkt(vec![indicator, start_hdr, 0x11, 0x22], 500, false))
            .unwrap();
        d.push(pkt(vec![indicator, end_hdr, 0x33, 0x44], 500, true))
            .unwrap();
        let au = d.pull().unwrap();
        // reconstructed header: (indicator & 0xE0) | 1 = 0x41
        assert_eq!(&au.payload[4..], &[0x41, 0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn stap_a_splits_into_two_nals_in_one_au() {
        let mut d = Depacketizer::new("cam1", None).unwrap();
        let mut payload = vec![24u8]; // STAP-A
        payload.extend_from_slice(&2u16.to_be_bytes());
        payload.extend_from_slice(&[0x67, 0x42]); // fake SPS-ish nal
        payload.extend_from_slice(&2u16.to_be_bytes());
        payload.extend_from_slice(&[0x68, 0x11]); // fake PPS-ish nal
        d.push(pkt(payload, 0, true)).unwrap();
        let au = d.pull().unwrap();
        // two 2-byte NALs, each with a 4-byte AVCC length prefix => 12 bytes.
        assert_eq!(au.payload.len(), 12);
    }
}
