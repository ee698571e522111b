// Copyright (C) 2024 SentryShot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! SDP (RFC 4566) handling for a `DESCRIBE` response body: pulls the
//! session-level `a=control` plus, per `m=` section, the `a=rtpmap`/
//! `a=fmtp`/`a=control` attributes the RTSP client needs.

use std::io::Cursor;

use sdp::session_description::SessionDescription;

use crate::error::{wrap, Error, ErrorInt};

#[derive(Clone, Debug)]
pub struct MediaDescription {
    pub media: String, // "video" | "audio" | "application"
    pub payload_type: u8,
    pub control: Option<String>,
    pub encoding_name: Option<String>,
    pub clock_rate: Option<u32>,
    pub channels: Option<u16>,
    pub fmtp: Option<String>,
}

/// Parses the session-level `a=control` (if present) and each `m=` section.
pub fn parse(monitor_id: &str, body: &[u8]) -> Result<(Option<String>, Vec<MediaDescription>), Error> {
    let mut cursor = Cursor::new(body);
    let session = SessionDescription::unmarshal(&mut cursor).map_err(|e| {
        wrap!(ErrorInt::ProtocolMalformed {
            monitor_id: monitor_id.to_string(),
            description: format!("malformed SDP: {e}"),
        })
    })?;

    let session_control = session
        .attributes
        .iter()
        .find(|a| a.key == "control")
        .and_then(|a| a.value.clone());

    let mut medias = Vec::with_capacity(session.media_descriptions.len());
    for media in &session.media_descriptions {
        let Some(payload_type_str) = media.media_name.formats.first() else {
            continue;
        };
        let Ok(payload_type) = payload_type_str.parse::<u8>() else {
            continue;
        };

        let mut control = None;
        let mut rtpmap = None;
        let mut fmtp = None;
        for attr in &media.attributes {
            let Some(value) = &attr.value else { continue };
            match attr.key.as_str() {
                "control" => control = Some(value.clone()),
                "rtpmap" => {
                    if let Some((pt, rest)) = value.split_once(' ') {
                        if pt == payload_type_str {
                            rtpmap = Some(rest.to_string());
                        }
                    }
                }
                "fmtp" => {
                    if let Some((pt, rest)) = value.split_once(' ') {
                        if pt == payload_type_str {
                            fmtp = Some(rest.to_string());
                        }
                    }
                }
                _ => {}
            }
        }

        // "<encoding-name>/<clock-rate>[/<channels>]"
        let mut enc = rtpmap.as_deref().unwrap_or("").splitn(3, '/');
        let encoding_name = enc.next().filter(|s| !s.is_empty()).map(str::to_ascii_lowercase);
        let clock_rate = enc.next().and_then(|s| s.parse().ok());
        let channels = enc.next().and_then(|s| s.parse().ok());

        medias.push(MediaDescription {
            media: media.media_name.media.clone(),
            payload_type,
            control,
            encoding_name,
            clock_rate,
            channels,
            fmtp,
        });
    }

    Ok((session_control, medias))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_video_and_audio_sections() {
        let sdp = "v=0\r\n\
o=- 0 0 IN IP4 0.0.0.0\r\n\
s=cam\r\n\
t=0 0\r\n\
a=control:*\r\n\
m=video 0 RTP/AVP 96\r\n\
a=control:trackID=0\r\n\
a=rtpmap:96 H264/90000\r\n\
a=fmtp:96 packetization-mode=1;sprop-parameter-sets=Z0IAHpZUCg==,aM4xEg==\r\n\
m=audio 0 RTP/AVP 97\r\n\
a=control:trackID=1\r\n\
a=rtpmap:97 mpeg4-generic/44100/2\r\n\
a=fmtp:97 streamtype=5;sizelength=13;indexlength=3;indexdeltalength=3;config=1190\r\n";
        let (session_control, medias) = parse("cam1", sdp.as_bytes()).unwrap();
        assert_eq!(session_control.as_deref(), Some("*"));
        assert_eq!(medias.len(), 2);
        assert_eq!(medias[0].media, "video");
        assert_eq!(medias[0].control.as_deref(), Some("trackID=0"));
        assert_eq!(medias[0].encoding_name.as_deref(), Some("h264"));
        assert_eq!(medias[0].clock_rate, Some(90_000));
        assert_eq!(medias[1].media, "audio");
        assert_eq!(medias[1].clock_rate, Some(44_100));
        assert_eq!(medias[1].channels, Some(2));
    }

    #[test]
    fn skips_media_with_unparseable_payload_type() {
        let sdp = "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=cam\r\nt=0 0\r\nm=video 0 RTP/AVP banana\r\n";
        let (_, medias) = parse("cam1", sdp.as_bytes()).unwrap();
        assert!(medias.is_empty());
    }
}
