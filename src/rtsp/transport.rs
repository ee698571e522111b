// Copyright (C) 2024 SentryShot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP `Transport` header parsing and serialization.
//!
//! Only the subset needed to negotiate interleaved TCP delivery (§6) is
//! implemented; `RTP/AVP/UDP` is accepted on parse (a camera may echo it
//! back from a request) but this client always requests TCP.

use crate::error::{bail, wrap, Error, ErrorInt, Source};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// A parsed `Transport` header value, e.g.
/// `RTP/AVP/TCP;interleaved=0-1;ssrc=000D93FF`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transport {
    pub protocol: Protocol,
    pub interleaved: Option<(u8, u8)>,
    pub ssrc: Option<u32>,
}

impl Transport {
    pub fn tcp(channel_lo: u8) -> Self {
        Transport {
            protocol: Protocol::Tcp,
            interleaved: Some((channel_lo, channel_lo + 1)),
            ssrc: None,
        }
    }

    pub fn parse(monitor_id: &str, s: &str) -> Result<Transport, Error> {
        let mut parts = s.split(';');
        let proto = parts.next().unwrap_or("").trim();
        let protocol = match proto {
            "RTP/AVP/TCP" | "RTP/AVP/TCP/UNICAST" => Protocol::Tcp,
            "RTP/AVP/UDP" | "RTP/AVP" | "RTP/AVP/UDP/UNICAST" => Protocol::Udp,
            _ => bail!(wrap!(ErrorInt::ProtocolMalformed {
                monitor_id: monitor_id.to_string(),
                description: format!("unrecognized transport protocol {proto:?}"),
            })),
        };

        let mut interleaved = None;
        let mut ssrc = None;
        for part in parts {
            let part = part.trim();
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            match key {
                "interleaved" => {
                    let (lo, hi) = value.split_once('-').ok_or_else(|| {
                        wrap!(ErrorInt::ProtocolMalformed {
                            monitor_id: monitor_id.to_string(),
                            description: format!("bad interleaved range {value:?}"),
                        })
                    })?;
                    let lo: u8 = lo.trim().parse().map_err(|_| {
                        wrap!(ErrorInt::ProtocolMalformed {
                            monitor_id: monitor_id.to_string(),
                            description: format!("bad interleaved channel {lo:?}"),
                        })
                    })?;
                    let hi: u8 = hi.trim().parse().map_err(|_| {
                        wrap!(ErrorInt::ProtocolMalformed {
                            monitor_id: monitor_id.to_string(),
                            description: format!("bad interleaved channel {hi:?}"),
                        })
                    })?;
                    interleaved = Some((lo, hi));
                }
                "ssrc" => {
                    let cleaned: String = value.chars().filter(|c| !c.is_whitespace()).collect();
                    let parsed = u32::from_str_radix(&cleaned, 16).map_err(|_| {
                        wrap!(ErrorInt::ProtocolMalformed {
                            monitor_id: monitor_id.to_string(),
                            description: format!("bad ssrc {value:?}"),
                        })
                    })?;
                    ssrc = Some(parsed);
                }
                _ => {}
            }
        }

        Ok(Transport {
            protocol,
            interleaved,
            ssrc,
        })
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.protocol {
            Protocol::Tcp => f.write_str("RTP/AVP/TCP")?,
            Protocol::Udp => f.write_str("RTP/AVP/UDP")?,
        }
        if let Some((lo, hi)) = self.interleaved {
            write!(f, ";interleaved={lo}-{hi}")?;
        }
        if let Some(ssrc) = self.ssrc {
            write!(f, ";ssrc={ssrc:08X}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_reemits_per_scenario() {
        let t = Transport::parse("cam1", "RTP/AVP/TCP;interleaved=0-1;ssrc=     D93FF").unwrap();
        assert_eq!(t.protocol, Protocol::Tcp);
        assert_eq!(t.interleaved, Some((0, 1)));
        assert_eq!(t.ssrc, Some(0x000D_93FF));
        assert_eq!(t.to_string(), "RTP/AVP/TCP;interleaved=0-1;ssrc=000D93FF");
    }

    #[test]
    fn rejects_unknown_protocol() {
        assert!(Transport::parse("cam1", "RTP/AVP/SCTP;interleaved=0-1").is_err());
    }
}
