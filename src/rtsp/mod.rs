// Copyright (C) 2024 SentryShot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP client (§4.A): negotiates an RTSP/1.0 session over one interleaved
//! TCP connection and demultiplexes it into access units.

pub mod auth;
pub mod client;
pub mod interleaved;
pub mod rtp;
pub mod sdp;
pub mod transport;

pub use auth::Credentials;
pub use client::{Client, Session};
