// Copyright (C) 2024 SentryShot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The RTSP/1.0 session state machine (§4.A):
//!
//! ```text
//! INIT --OPTIONS--> DESCRIBE --SETUP(video)--> SETUP(audio?) --PLAY--> STREAMING
//!                                                                        |
//! STREAMING --TEARDOWN/conn-drop/timeout--> CLOSED
//! ```

use std::time::Duration;

use bytes::Bytes;
use once_cell::sync::Lazy;
use rtsp_types::{HeaderName, Message, Method, Request, StatusCode, Version};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::auth::{Authenticator, Credentials};
use super::interleaved::{self, InterleavedItem};
use super::rtp::RtpDemuxer;
use super::{sdp, transport::Transport};
use crate::codec::{CodecItem, Depacketizer};
use crate::error::{bail, wrap, Error, ErrorInt};
use crate::hls::mp4mux::{AudioParameters, VideoParameters};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Custom headers without a named constant in `rtsp_types::headers`, built
/// once the way `moonfire_rtsp`'s own custom-header statics are.
static USER_AGENT: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::try_from("User-Agent").expect("valid header name"));
static AUTHORIZATION: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::try_from("Authorization").expect("valid header name"));
static WWW_AUTHENTICATE: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::try_from("WWW-Authenticate").expect("valid header name"));
static ACCEPT: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::try_from("Accept").expect("valid header name"));

type Response = rtsp_types::Response<Vec<u8>>;

fn parse_response(monitor_id: &str, raw: &Bytes) -> Result<Response, Error> {
    let (message, _consumed) = Message::parse(raw).map_err(|e| {
        wrap!(ErrorInt::ProtocolMalformed {
            monitor_id: monitor_id.to_string(),
            description: format!("malformed RTSP response: {e}"),
        })
    })?;
    match message {
        Message::Response(resp) => Ok(resp),
        _ => Err(wrap!(ErrorInt::ProtocolMalformed {
            monitor_id: monitor_id.to_string(),
            description: "expected an RTSP response".to_string(),
        })),
    }
}

fn method_name(method: &Method) -> &'static str {
    match method {
        Method::Options => "OPTIONS",
        Method::Describe => "DESCRIBE",
        Method::Setup => "SETUP",
        Method::Play => "PLAY",
        Method::Teardown => "TEARDOWN",
        Method::Pause => "PAUSE",
        Method::GetParameter => "GET_PARAMETER",
        Method::SetParameter => "SET_PARAMETER",
        _ => "OPTIONS",
    }
}

/// One negotiated media track: depacketizer plus the interleaved channel
/// its RTP/RTCP frames arrive on.
struct Track {
    rtp_channel: u8,
    demuxer: RtpDemuxer,
    depacketizer: Depacketizer,
    is_audio: bool,
    audio_sample_rate: u32,
    audio_channels: u16,
}

/// A connected RTSP client, not yet playing.
pub struct Client {
    monitor_id: String,
    url: url::Url,
    socket: BufReader<TcpStream>,
    cseq: u32,
    session_id: Option<String>,
    authenticator: Authenticator,
    credentials: Option<Credentials>,
}

impl Client {
    /// Opens the TCP connection and runs OPTIONS, DESCRIBE, SETUP (for each
    /// media the SDP offers a supported depacketizer for), and PLAY,
    /// returning a [`Session`] ready to stream.
    pub async fn connect(
        monitor_id: &str,
        url: url::Url,
        credentials: Option<Credentials>,
    ) -> Result<Session, Error> {
        let host = url.host_str().ok_or_else(|| {
            wrap!(ErrorInt::ProtocolMalformed {
                monitor_id: monitor_id.to_string(),
                description: "RTSP URL has no host".to_string(),
            })
        })?;
        let port = url.port().unwrap_or(554);
        let stream = timeout(REQUEST_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|_| {
                wrap!(ErrorInt::IoTransient {
                    monitor_id: monitor_id.to_string(),
                    description: format!("connect to {host}:{port} timed out"),
                    cause: None,
                })
            })?
            .map_err(|e| {
                wrap!(ErrorInt::IoTransient {
                    monitor_id: monitor_id.to_string(),
                    description: format!("connect to {host}:{port} failed"),
                    cause: Some(e),
                })
            })?;

        let mut client = Client {
            monitor_id: monitor_id.to_string(),
            url,
            socket: BufReader::new(stream),
            cseq: 0,
            session_id: None,
            authenticator: Authenticator::new(),
            credentials,
        };

        client.request(Method::Options, client.url.clone(), &[]).await?;
        let describe = client
            .request(
                Method::Describe,
                client.url.clone(),
                &[(ACCEPT.clone(), "application/sdp".to_string())],
            )
            .await?;
        let (session_control, medias) = sdp::parse(monitor_id, &describe.body()[..])?;
        let base = session_control
            .as_deref()
            .filter(|c| *c != "*")
            .map(|c| client.resolve_control(c))
            .unwrap_or_else(|| client.url.clone());

        let mut tracks = Vec::new();
        let mut next_channel = 0u8;
        for media in &medias {
            let is_audio = media.media == "audio";
            let depacketizer = match (media.media.as_str(), media.encoding_name.as_deref()) {
                ("video", Some("h264")) => {
                    let sprop = media.fmtp.as_deref().and_then(extract_sprop);
                    Depacketizer::new_h264(monitor_id, sprop.as_deref())?
                }
                ("audio", Some("mpeg4-generic")) => Depacketizer::new_aac(
                    monitor_id,
                    media.clock_rate.unwrap_or(44_100),
                    media.fmtp.as_deref(),
                )?,
                _ => continue, // unsupported media kind; skip rather than fail the whole session
            };
            let control = media.control.as_deref().unwrap_or("");
            let track_url = if control.is_empty() {
                base.clone()
            } else {
                resolve_control_against(&base, control)
            };
            let channel = next_channel;
            next_channel += 2;
            let transport = Transport::tcp(channel);
            let resp = client
                .request(
                    Method::Setup,
                    track_url,
                    &[(rtsp_types::headers::TRANSPORT, transport.to_string())],
                )
                .await?;
            if let Some(sid) = resp.header(&rtsp_types::headers::SESSION) {
                let sid = sid.as_str();
                client.session_id = Some(sid.split(';').next().unwrap_or(sid).to_string());
            }
            tracks.push(Track {
                rtp_channel: channel,
                demuxer: RtpDemuxer::new(
                    monitor_id,
                    tracks_len(&tracks),
                    media.clock_rate.unwrap_or(90_000),
                    0,
                ),
                depacketizer,
                is_audio,
                audio_sample_rate: media.clock_rate.unwrap_or(44_100),
                audio_channels: media.channels.unwrap_or(2),
            });
        }

        if tracks.is_empty() {
            bail!(wrap!(ErrorInt::ProtocolMalformed {
                monitor_id: monitor_id.to_string(),
                description: "no supported media (h264 video or mpeg4-generic audio) in SDP"
                    .to_string(),
            }));
        }

        client
            .request(
                Method::Play,
                client.url.clone(),
                &[(rtsp_types::headers::RANGE, "npt=0.000-".to_string())],
            )
            .await?;

        let video_params = tracks
            .iter()
            .find(|t| !t.is_audio)
            .and_then(|t| t.depacketizer.video_parameter_sets())
            .map(|(sps, pps)| VideoParameters { sps, pps })
            .ok_or_else(|| {
                wrap!(ErrorInt::ProtocolMalformed {
                    monitor_id: monitor_id.to_string(),
                    description: "no H.264 SPS/PPS available from SDP or stream".to_string(),
                })
            })?;
        let audio_params = tracks.iter().find(|t| t.is_audio).and_then(|t| {
            t.depacketizer.audio_config().map(|config| AudioParameters {
                config,
                sample_rate: t.audio_sample_rate,
                channels: t.audio_channels,
            })
        });

        Ok(Session {
            monitor_id: monitor_id.to_string(),
            client,
            tracks,
            video_params,
            audio_params,
        })
    }

    fn resolve_control(&self, control: &str) -> url::Url {
        resolve_control_against(&self.url, control)
    }

    async fn request(
        &mut self,
        method: Method,
        uri: url::Url,
        extra_headers: &[(HeaderName, String)],
    ) -> Result<Response, Error> {
        let resp = self.request_once(method.clone(), &uri, extra_headers).await?;
        if resp.status() == StatusCode::Unauthorized {
            let www_auth = resp
                .header(&WWW_AUTHENTICATE)
                .ok_or_else(|| {
                    wrap!(ErrorInt::ProtocolMalformed {
                        monitor_id: self.monitor_id.clone(),
                        description: "401 without WWW-Authenticate".to_string(),
                    })
                })?
                .as_str()
                .to_string();
            let credentials = self.credentials.clone().ok_or_else(|| {
                wrap!(ErrorInt::ProtocolMalformed {
                    monitor_id: self.monitor_id.clone(),
                    description: "server requires auth but no credentials configured".to_string(),
                })
            })?;
            self.authenticator = Authenticator::challenge(&self.monitor_id, &www_auth, credentials)?;
            let resp = self.request_once(method, &uri, extra_headers).await?;
            return self.check_status(resp);
        }
        self.check_status(resp)
    }

    fn check_status(&self, resp: Response) -> Result<Response, Error> {
        if resp.status() != StatusCode::Ok {
            bail!(wrap!(ErrorInt::ProtocolMalformed {
                monitor_id: self.monitor_id.clone(),
                description: format!("request failed with status {:?}", resp.status()),
            }));
        }
        Ok(resp)
    }

    async fn request_once(
        &mut self,
        method: Method,
        uri: &url::Url,
        extra_headers: &[(HeaderName, String)],
    ) -> Result<Response, Error> {
        self.cseq += 1;
        let mut builder = Request::builder(method.clone(), Version::V1_0)
            .request_uri(uri.clone())
            .header(rtsp_types::headers::CSEQ, self.cseq.to_string())
            .header(USER_AGENT.clone(), "sentryshot-core".to_string());
        if let Some(sid) = &self.session_id {
            builder = builder.header(rtsp_types::headers::SESSION, sid.clone());
        }
        if let Some(auth) =
            self.authenticator
                .authorization(&self.monitor_id, method_name(&method), uri.as_str())?
        {
            builder = builder.header(AUTHORIZATION.clone(), auth);
        }
        for (name, value) in extra_headers {
            builder = builder.header(name.clone(), value.clone());
        }
        let request = builder.build(Vec::new());

        let mut wire = Vec::new();
        request.write(&mut wire).map_err(|e| {
            wrap!(ErrorInt::ProtocolMalformed {
                monitor_id: self.monitor_id.clone(),
                description: format!("failed to serialize {} request: {e}", method_name(&method)),
            })
        })?;

        timeout(REQUEST_TIMEOUT, self.socket.write_all(&wire))
            .await
            .map_err(|_| {
                wrap!(ErrorInt::IoTransient {
                    monitor_id: self.monitor_id.clone(),
                    description: format!("{} request timed out writing", method_name(&method)),
                    cause: None,
                })
            })?
            .map_err(|e| {
                wrap!(ErrorInt::IoTransient {
                    monitor_id: self.monitor_id.clone(),
                    description: format!("{} request failed writing", method_name(&method)),
                    cause: Some(e),
                })
            })?;

        let item = timeout(
            REQUEST_TIMEOUT,
            interleaved::read_item(&mut self.socket, &self.monitor_id),
        )
        .await
        .map_err(|_| {
            wrap!(ErrorInt::IoTransient {
                monitor_id: self.monitor_id.clone(),
                description: format!("{} response timed out", method_name(&method)),
                cause: None,
            })
        })??;
        match item {
            InterleavedItem::Response { raw } => parse_response(&self.monitor_id, &raw),
            InterleavedItem::Frame { .. } => Err(wrap!(ErrorInt::ProtocolMalformed {
                monitor_id: self.monitor_id.clone(),
                description: "received interleaved RTP data before PLAY".to_string(),
            })),
        }
    }
}

fn tracks_len(tracks: &[Track]) -> usize {
    tracks.len()
}

fn resolve_control_against(base: &url::Url, control: &str) -> url::Url {
    if control.starts_with("rtsp://") {
        url::Url::parse(control).unwrap_or_else(|_| base.clone())
    } else {
        base.join(control).unwrap_or_else(|_| base.clone())
    }
}

/// Extracts `sprop-parameter-sets` from an H.264 `fmtp` attribute value.
fn extract_sprop(fmtp: &str) -> Option<String> {
    fmtp.split(';').find_map(|kv| {
        let (k, v) = kv.trim().split_once('=')?;
        (k.eq_ignore_ascii_case("sprop-parameter-sets")).then(|| v.to_string())
    })
}

/// A session in the STREAMING state: owns the socket and per-track
/// depacketizers, and demultiplexes interleaved RTP frames into
/// [`CodecItem`]s until cancelled or the connection drops.
pub struct Session {
    monitor_id: String,
    client: Client,
    tracks: Vec<Track>,
    video_params: VideoParameters,
    audio_params: Option<AudioParameters>,
}

impl Session {
    /// The negotiated video parameters, available as soon as the session is
    /// connected (§4.B, needed to construct the HLS muxer's init segment).
    pub fn video_parameters(&self) -> &VideoParameters {
        &self.video_params
    }

    pub fn audio_parameters(&self) -> Option<&AudioParameters> {
        self.audio_params.as_ref()
    }

    /// Runs the read loop until `cancel` fires or the socket errors,
    /// sending each decoded access unit on `tx`. On graceful cancellation,
    /// sends `TEARDOWN` best-effort before returning.
    pub async fn run(
        mut self,
        tx: mpsc::Sender<CodecItem>,
        mut cancel: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<(), Error> {
        loop {
            tokio::select! {
                biased;
                _ = &mut cancel => {
                    let _ = self.teardown().await;
                    return Ok(());
                }
                item = interleaved::read_item(&mut self.client.socket, &self.monitor_id) => {
                    match item? {
                        InterleavedItem::Frame { channel_id, payload } => {
                            self.handle_frame(channel_id, payload, &tx).await?;
                        }
                        InterleavedItem::Response { .. } => {
                            // Unsolicited response (e.g. to a keepalive GET_PARAMETER); ignore.
                        }
                    }
                }
            }
        }
    }

    async fn handle_frame(
        &mut self,
        channel_id: u8,
        payload: Bytes,
        tx: &mpsc::Sender<CodecItem>,
    ) -> Result<(), Error> {
        let Some(track) = self
            .tracks
            .iter_mut()
            .find(|t| t.rtp_channel == channel_id)
        else {
            return Ok(()); // RTCP channel (odd) or unknown; not handled further yet.
        };
        let Some(pkt) = track.demuxer.demux(payload)? else {
            return Ok(());
        };
        track.depacketizer.push(pkt)?;
        while let Some(item) = track.depacketizer.pull() {
            if tx.send(item).await.is_err() {
                bail!(wrap!(ErrorInt::OverflowedSubscriber));
            }
        }
        Ok(())
    }

    async fn teardown(&mut self) -> Result<(), Error> {
        let _ = timeout(
            Duration::from_secs(2),
            self.client
                .request(Method::Teardown, self.client.url.clone(), &[]),
        )
        .await;
        let _ = self.client.socket.get_mut().shutdown().await;
        Ok(())
    }
}
