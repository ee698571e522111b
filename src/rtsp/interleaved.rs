// Copyright (C) 2024 SentryShot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interleaved RTSP/RTP framing (§4.A).
//!
//! After `PLAY`, the TCP socket carries a mix of RTP/RTCP frames (magic byte
//! `0x24`, channel id, 2-byte big-endian length, payload) and plain RTSP
//! response text (`RTSP/1.0 ...`). A reader peeks the first byte to tell
//! them apart.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{bail, wrap, Error, ErrorInt};

pub const MAX_INTERLEAVED_PAYLOAD: usize = 64 * 1024;
pub const MAX_RESPONSE_BODY: usize = 128 * 1024;

const INTERLEAVED_MAGIC: u8 = 0x24; // '$'

/// A message read off the interleaved socket: either a demultiplexed RTP/RTCP
/// frame or a complete RTSP response (headers + optional body).
#[derive(Debug)]
pub enum InterleavedItem {
    Frame { channel_id: u8, payload: Bytes },
    Response { raw: Bytes },
}

/// Reads one interleaved item from `reader`, which must be positioned at a
/// message boundary (i.e. immediately before either a `$` frame or an
/// `RTSP/1.0` status line).
pub async fn read_item<R: AsyncRead + Unpin>(
    reader: &mut R,
    monitor_id: &str,
) -> Result<InterleavedItem, Error> {
    let magic = read_u8(reader, monitor_id).await?;
    if magic == INTERLEAVED_MAGIC {
        let channel_id = read_u8(reader, monitor_id).await?;
        let mut len_buf = [0u8; 2];
        read_exact(reader, &mut len_buf, monitor_id).await?;
        let len = u16::from_be_bytes(len_buf) as usize;
        if len > MAX_INTERLEAVED_PAYLOAD {
            bail!(wrap!(ErrorInt::ProtocolMalformed {
                monitor_id: monitor_id.to_string(),
                description: format!(
                    "interleaved frame of {len} bytes exceeds {MAX_INTERLEAVED_PAYLOAD}"
                ),
            }));
        }
        let mut payload = BytesMut::zeroed(len);
        read_exact(reader, &mut payload, monitor_id).await?;
        return Ok(InterleavedItem::Frame {
            channel_id,
            payload: payload.freeze(),
        });
    }

    // Not a `$`: must be the start of an RTSP response status line. Read the
    // remainder of the headers, then the body if Content-Length says so.
    let mut raw = BytesMut::new();
    raw.extend_from_slice(&[magic]);
    read_headers(reader, &mut raw, monitor_id).await?;
    let content_length = parse_content_length(&raw, monitor_id)?;
    if let Some(len) = content_length {
        if len > MAX_RESPONSE_BODY {
            bail!(wrap!(ErrorInt::ProtocolMalformed {
                monitor_id: monitor_id.to_string(),
                description: format!("response body of {len} bytes exceeds {MAX_RESPONSE_BODY}"),
            }));
        }
        let mut body = BytesMut::zeroed(len);
        read_exact(reader, &mut body, monitor_id).await?;
        raw.extend_from_slice(&body);
    }
    Ok(InterleavedItem::Response { raw: raw.freeze() })
}

async fn read_headers<R: AsyncRead + Unpin>(
    reader: &mut R,
    raw: &mut BytesMut,
    monitor_id: &str,
) -> Result<(), Error> {
    // Accumulate until we see the blank line ("\r\n\r\n") terminating headers.
    loop {
        if raw.len() > MAX_RESPONSE_BODY {
            bail!(wrap!(ErrorInt::ProtocolMalformed {
                monitor_id: monitor_id.to_string(),
                description: "response headers exceeded size limit".to_string(),
            }));
        }
        if ends_with_blank_line(raw) {
            return Ok(());
        }
        let b = read_u8(reader, monitor_id).await?;
        raw.extend_from_slice(&[b]);
    }
}

fn ends_with_blank_line(raw: &[u8]) -> bool {
    raw.len() >= 4 && &raw[raw.len() - 4..] == b"\r\n\r\n"
}

fn parse_content_length(raw: &[u8], monitor_id: &str) -> Result<Option<usize>, Error> {
    let text = std::str::from_utf8(raw).map_err(|_| {
        wrap!(ErrorInt::ProtocolMalformed {
            monitor_id: monitor_id.to_string(),
            description: "response headers are not valid UTF-8".to_string(),
        })
    })?;
    for line in text.split("\r\n") {
        if let Some((key, value)) = line.split_once(':') {
            if key.trim().eq_ignore_ascii_case("content-length") {
                let n: usize = value.trim().parse().map_err(|_| {
                    wrap!(ErrorInt::ProtocolMalformed {
                        monitor_id: monitor_id.to_string(),
                        description: format!("bad Content-Length {value:?}"),
                    })
                })?;
                return Ok(Some(n));
            }
        }
    }
    Ok(None)
}

async fn read_u8<R: AsyncRead + Unpin>(reader: &mut R, monitor_id: &str) -> Result<u8, Error> {
    let mut b = [0u8; 1];
    read_exact(reader, &mut b, monitor_id).await?;
    Ok(b[0])
}

async fn read_exact<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    monitor_id: &str,
) -> Result<(), Error> {
    reader
        .read_exact(buf)
        .await
        .map(|_| ())
        .map_err(|e| {
            wrap!(ErrorInt::IoTransient {
                monitor_id: monitor_id.to_string(),
                description: "socket read failed".to_string(),
                cause: Some(e),
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn reads_interleaved_frame() {
        let mut data = vec![0x24, 0x00];
        data.extend_from_slice(&3u16.to_be_bytes());
        data.extend_from_slice(&[1, 2, 3]);
        let mut cur = Cursor::new(data);
        let item = read_item(&mut cur, "cam1").await.unwrap();
        match item {
            InterleavedItem::Frame {
                channel_id,
                payload,
            } => {
                assert_eq!(channel_id, 0);
                assert_eq!(&payload[..], &[1, 2, 3]);
            }
            _ => panic!("expected frame"),
        }
    }

    #[tokio::test]
    async fn rejects_oversized_frame() {
        let mut data = vec![0x24, 0x00];
        data.extend_from_slice(&(MAX_INTERLEAVED_PAYLOAD as u16 + 1).to_be_bytes());
        let mut cur = Cursor::new(data);
        assert!(read_item(&mut cur, "cam1").await.is_err());
    }

    #[tokio::test]
    async fn reads_response_with_body() {
        let body = b"v=0\r\n";
        let head = format!(
            "RTSP/1.0 200 OK\r\nCSeq: 1\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        let mut data = head.into_bytes();
        data.extend_from_slice(body);
        let mut cur = Cursor::new(data.clone());
        let item = read_item(&mut cur, "cam1").await.unwrap();
        match item {
            InterleavedItem::Response { raw } => assert_eq!(&raw[..], &data[..]),
            _ => panic!("expected response"),
        }
    }
}
