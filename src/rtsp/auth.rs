// Copyright (C) 2024 SentryShot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Digest and Basic authentication, retried once on a `401 Unauthorized`
//! response per the RTSP state machine (§4.A).

use crate::error::{wrap, Error, ErrorInt};

#[derive(Clone, Debug)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Remembers the challenge from a `401` so subsequent requests on the same
/// session can preemptively authenticate without another round trip.
#[derive(Debug)]
pub enum Authenticator {
    None,
    Basic { credentials: Credentials },
    Digest {
        credentials: Credentials,
        www_authenticate: String,
    },
}

impl Authenticator {
    pub fn new() -> Self {
        Authenticator::None
    }

    /// Consumes a `WWW-Authenticate` header from a `401` response and the
    /// credentials supplied for the session, choosing Digest over Basic
    /// when both are offered (cameras that support Digest always send it).
    pub fn challenge(
        monitor_id: &str,
        www_authenticate: &str,
        credentials: Credentials,
    ) -> Result<Authenticator, Error> {
        let scheme = www_authenticate
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();
        match scheme.as_str() {
            "digest" => Ok(Authenticator::Digest {
                credentials,
                www_authenticate: www_authenticate.to_string(),
            }),
            "basic" => Ok(Authenticator::Basic { credentials }),
            _ => Err(wrap!(ErrorInt::ProtocolMalformed {
                monitor_id: monitor_id.to_string(),
                description: format!("unsupported auth scheme in {www_authenticate:?}"),
            })),
        }
    }

    /// Builds the `Authorization` header value for `method`/`uri`, if this
    /// authenticator has been primed by a prior challenge.
    pub fn authorization(
        &mut self,
        monitor_id: &str,
        method: &str,
        uri: &str,
    ) -> Result<Option<String>, Error> {
        match self {
            Authenticator::None => Ok(None),
            Authenticator::Basic { credentials } => {
                use base64::Engine;
                let raw = format!("{}:{}", credentials.username, credentials.password);
                let encoded = base64::engine::general_purpose::STANDARD.encode(raw.as_bytes());
                Ok(Some(format!("Basic {encoded}")))
            }
            Authenticator::Digest {
                credentials,
                www_authenticate,
            } => {
                let mut prompt = digest_auth::parse(www_authenticate.as_str()).map_err(|e| {
                    wrap!(ErrorInt::ProtocolMalformed {
                        monitor_id: monitor_id.to_string(),
                        description: format!("bad WWW-Authenticate: {e}"),
                    })
                })?;
                let context = digest_auth::AuthContext::new_with_method(
                    &credentials.username,
                    &credentials.password,
                    uri,
                    Option::<&'static [u8]>::None,
                    digest_auth::HttpMethod::from(method),
                );
                let answer = prompt.respond(&context).map_err(|e| {
                    wrap!(ErrorInt::ProtocolMalformed {
                        monitor_id: monitor_id.to_string(),
                        description: format!("digest response failed: {e}"),
                    })
                })?;
                Ok(Some(answer.to_header_string()))
            }
        }
    }
}

impl Default for Authenticator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_auth_roundtrip() {
        let mut a = Authenticator::Basic {
            credentials: Credentials {
                username: "admin".into(),
                password: "hunter2".into(),
            },
        };
        let header = a.authorization("cam1", "DESCRIBE", "rtsp://x/y").unwrap();
        assert_eq!(header.as_deref(), Some("Basic YWRtaW46aHVudGVyMg=="));
    }

    #[test]
    fn unknown_scheme_rejected() {
        let err = Authenticator::challenge(
            "cam1",
            "NTLM realm=\"x\"",
            Credentials {
                username: "a".into(),
                password: "b".into(),
            },
        );
        assert!(err.is_err());
    }
}
