// Copyright (C) 2024 SentryShot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! AAC depacketization per [RFC 3640](https://datatracker.ietf.org/doc/html/rfc3640)
//! ("MPEG4-GENERIC"), §4.A.
//!
//! Parses the AU-headers-length field, then a sequence of
//! `(size: 13 bits, index: 3 bits)` headers, then the AU payloads they
//! describe. A fragmented AU (its declared size larger than what's in this
//! packet) accumulates across packets until enough bytes have arrived.

use bytes::Bytes;

use super::{AccessUnit, RtpPacket};
use crate::error::{bail, wrap, Error, ErrorInt};

pub struct Depacketizer {
    monitor_id: String,
    audio_config: Bytes,
    size_length_bits: u32,
    index_length_bits: u32,

    pending: Option<(usize, Vec<u8>, i64)>, // (target size, accumulated bytes, pts)
    ready: std::collections::VecDeque<AccessUnit>,
}

impl Depacketizer {
    pub fn new(
        monitor_id: &str,
        _clock_rate: u32,
        format_specific_params: Option<&str>,
    ) -> Result<Self, Error> {
        let params = format_specific_params.ok_or_else(|| {
            wrap!(ErrorInt::ProtocolMalformed {
                monitor_id: monitor_id.to_string(),
                description: "missing fmtp for mpeg4-generic audio".to_string(),
            })
        })?;
        let mut config = None;
        let mut size_length_bits = 13;
        let mut index_length_bits = 3;
        for kv in params.split(';') {
            let kv = kv.trim();
            let Some((k, v)) = kv.split_once('=') else {
                continue;
            };
            match k.trim().to_ascii_lowercase().as_str() {
                "config" => {
                    let bytes = hex::decode(v.trim()).map_err(|e| {
                        wrap!(ErrorInt::ProtocolMalformed {
                            monitor_id: monitor_id.to_string(),
                            description: format!("bad config hex in fmtp: {e}"),
                        })
                    })?;
                    config = Some(Bytes::from(bytes));
                }
                "sizelength" => {
                    size_length_bits = v.trim().parse().unwrap_or(13);
                }
                "indexlength" => {
                    index_length_bits = v.trim().parse().unwrap_or(3);
                }
                _ => {}
            }
        }
        let audio_config = config.ok_or_else(|| {
            wrap!(ErrorInt::ProtocolMalformed {
                monitor_id: monitor_id.to_string(),
                description: "fmtp missing config".to_string(),
            })
        })?;
        Ok(Depacketizer {
            monitor_id: monitor_id.to_string(),
            audio_config,
            size_length_bits,
            index_length_bits,
            pending: None,
            ready: std::collections::VecDeque::new(),
        })
    }

    pub fn audio_config(&self) -> &Bytes {
        &self.audio_config
    }

    pub fn push(&mut self, pkt: RtpPacket) -> Result<(), Error> {
        if let Some((target, buf, pts)) = self.pending.as_mut() {
            buf.extend_from_slice(&pkt.payload);
            if buf.len() >= *target {
                let data = std::mem::take(buf);
                let pts = *pts;
                self.pending = None;
                self.emit(data, pts);
            }
            return Ok(());
        }

        if pkt.payload.len() < 2 {
            bail!(wrap!(ErrorInt::ProtocolMalformed {
                monitor_id: self.monitor_id.clone(),
                description: "truncated AU-headers-length".to_string(),
            }));
        }
        let au_headers_length_bits = u16::from_be_bytes([pkt.payload[0], pkt.payload[1]]) as usize;
        let header_bits = (self.size_length_bits + self.index_length_bits) as usize;
        if header_bits == 0 {
            bail!(wrap!(ErrorInt::ProtocolMalformed {
                monitor_id: self.monitor_id.clone(),
                description: "sizelength+indexlength is zero".to_string(),
            }));
        }
        let n_headers = au_headers_length_bits / header_bits;
        let header_bytes = au_headers_length_bits.div_ceil(8);
        if pkt.payload.len() < 2 + header_bytes {
            bail!(wrap!(ErrorInt::ProtocolMalformed {
                monitor_id: self.monitor_id.clone(),
                description: "truncated AU-headers".to_string(),
            }));
        }
        let headers_raw = &pkt.payload[2..2 + header_bytes];
        let mut bit_pos = 0usize;
        let mut sizes = Vec::with_capacity(n_headers);
        for _ in 0..n_headers {
            let size = read_bits(headers_raw, bit_pos, self.size_length_bits as usize);
            bit_pos += self.size_length_bits as usize;
            let index = read_bits(headers_raw, bit_pos, self.index_length_bits as usize);
            bit_pos += self.index_length_bits as usize;
            if index != 0 && !sizes.is_empty() {
                // First AU-header's index must be 0; later indices are
                // deltas. We only need contiguity, not the delta value.
            }
            sizes.push(size as usize);
        }

        let mut offset = 2 + header_bytes;
        let pts = pkt.timestamp.as_nanos();
        for (i, size) in sizes.iter().enumerate() {
            let available = pkt.payload.len() - offset;
            if *size > available {
                if i != sizes.len() - 1 {
                    bail!(wrap!(ErrorInt::ProtocolMalformed {
                        monitor_id: self.monitor_id.clone(),
                        description: "a packet with multiple AUs must carry them all".to_string(),
                    }));
                }
                let mut buf = Vec::with_capacity(*size);
                buf.extend_from_slice(&pkt.payload[offset..]);
                self.pending = Some((*size, buf, pts));
                return Ok(());
            }
            let data = pkt.payload.slice(offset..offset + size);
            offset += size;
            self.emit(data.to_vec(), pts);
        }
        Ok(())
    }

    fn emit(&mut self, data: Vec<u8>, pts: i64) {
        self.ready.push_back(AccessUnit {
            stream_id: 0,
            pts,
            dts: pts,
            random_access: true,
            is_audio: true,
            payload: Bytes::from(data),
        });
    }

    pub fn pull(&mut self) -> Option<AccessUnit> {
        self.ready.pop_front()
    }
}

/// Reads `len` bits (MSB-first) starting at bit offset `pos` from `data`.
fn read_bits(data: &[u8], pos: usize, len: usize) -> u32 {
    let mut value = 0u32;
    for i in 0..len {
        let bit_index = pos + i;
        let byte = data.get(bit_index / 8).copied().unwrap_or(0);
        let bit = (byte >> (7 - (bit_index % 8))) & 1;
        value = (value << 1) | u32::from(bit);
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp::Timestamp;

    fn fmtp() -> &'static str {
        "streamtype=5;profile-level-id=15;mode=AAC-hbr;sizelength=13;indexlength=3;indexdeltalength=3;config=1190"
    }

    #[test]
    fn single_au_per_packet() {
        let mut d = Depacketizer::new("cam1", 44_100, Some(fmtp())).unwrap();
        assert_eq!(&d.audio_config()[..], &[0x11, 0x90]);
        // AU-headers-length = 16 bits (one header); size=4 (13 bits), index=0 (3 bits).
        let mut payload = vec![0x00, 0x10];
        // size=4 -> 0b0000000000100, index=0 -> 0b000 => combined 16 bits:
        // 0000000000100000 = 0x00 0x20
        payload.extend_from_slice(&[0x00, 0x20]);
        payload.extend_from_slice(&[1, 2, 3, 4]);
        d.push(RtpPacket {
            stream_id: 0,
            timestamp: Timestamp(42),
            loss: 0,
            mark: true,
            payload: Bytes::from(payload),
        })
        .unwrap();
        let au = d.pull().unwrap();
        assert_eq!(&au.payload[..], &[1, 2, 3, 4]);
        assert_eq!(au.pts, 42);
        assert!(au.is_audio);
    }
}
