// Copyright (C) 2024 SentryShot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Custom on-disk recording format (§4.C): append-only `<id>.meta`/
//! `<id>.mdat` sidecar pair with a random-seek reader.

pub mod format;
pub mod reader;
pub mod writer;

pub use format::{Header, Sample};
pub use reader::RecordingReader;
pub use writer::Writer;
