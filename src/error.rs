// Copyright (C) 2024 SentryShot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Crate-wide error type.
//!
//! Follows the pattern used throughout `retina::client`: a public
//! [`Error`] that's cheap to move (a single `Box`) wrapping a private,
//! `non_exhaustive` [`ErrorInt`] with one variant per failure mode. Each
//! variant carries a `source` tag and, where applicable, a monitor id,
//! matching the taxonomy in the streaming core's error handling design.

use std::fmt;

/// The component that raised an error, used for structured logging and
/// for deciding recovery policy (§7 of the design doc).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Source {
    Rtsp,
    Hls,
    RecDb,
    Recorder,
    Watchdog,
    Disk,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Source::Rtsp => "rtsp",
            Source::Hls => "hls",
            Source::RecDb => "recdb",
            Source::Recorder => "recorder",
            Source::Watchdog => "watchdog",
            Source::Disk => "disk",
        })
    }
}

/// Recovery policy implied by an error kind, per the error taxonomy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recovery {
    /// Transient IO: recorder restarts with backoff.
    RestartWithBackoff,
    /// Disk full / permission denied: abort current op, retry next cycle.
    RetryNextCycle,
    /// Malformed protocol data: fatal to the stream, recorder restarts.
    FatalToStream,
    /// Affected recording is marked for prune; surfaced to the reader only.
    MarkForPrune,
    /// Watchdog fired: cancel and restart.
    CancelAndRestart,
    /// Subscriber fell behind: only that subscriber is affected.
    DropSubscriber,
    /// Config is invalid: fails startup, never reached at runtime.
    FailStartup,
}

pub struct Error(Box<ErrorInt>);

impl Error {
    pub fn source_tag(&self) -> Source {
        self.0.source_tag()
    }

    pub fn monitor_id(&self) -> Option<&str> {
        self.0.monitor_id()
    }

    pub fn recovery(&self) -> Recovery {
        self.0.recovery()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<ErrorInt> for Error {
    fn from(e: ErrorInt) -> Self {
        Error(Box::new(e))
    }
}

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum ErrorInt {
    #[error("[{monitor_id}] rtsp: transient io error: {description}")]
    IoTransient {
        monitor_id: String,
        description: String,
        #[source]
        cause: Option<std::io::Error>,
    },

    #[error("[{monitor_id}] {source_tag}: fatal io error: {description}")]
    IoFatal {
        source_tag: Source,
        monitor_id: String,
        description: String,
        #[source]
        cause: Option<std::io::Error>,
    },

    #[error("[{monitor_id}] rtsp: malformed protocol data: {description}")]
    ProtocolMalformed {
        monitor_id: String,
        description: String,
    },

    #[error("recdb: corrupt recording ({path}): {reason}")]
    CorruptRecording {
        path: std::path::PathBuf,
        reason: String,
    },

    #[error("[{monitor_id}] watchdog: no progress for {elapsed_secs}s (limit {limit_secs}s)")]
    WatchdogTimeout {
        monitor_id: String,
        elapsed_secs: u64,
        limit_secs: u64,
    },

    #[error("hls: subscriber overflowed its queue and was disconnected")]
    OverflowedSubscriber,

    #[error("config invalid: {description}")]
    ConfigInvalid { description: String },
}

impl ErrorInt {
    fn source_tag(&self) -> Source {
        match self {
            ErrorInt::IoTransient { .. } => Source::Rtsp,
            ErrorInt::IoFatal { source_tag, .. } => *source_tag,
            ErrorInt::ProtocolMalformed { .. } => Source::Rtsp,
            ErrorInt::CorruptRecording { .. } => Source::RecDb,
            ErrorInt::WatchdogTimeout { .. } => Source::Watchdog,
            ErrorInt::OverflowedSubscriber => Source::Hls,
            ErrorInt::ConfigInvalid { .. } => Source::Recorder,
        }
    }

    fn monitor_id(&self) -> Option<&str> {
        match self {
            ErrorInt::IoTransient { monitor_id, .. }
            | ErrorInt::IoFatal { monitor_id, .. }
            | ErrorInt::ProtocolMalformed { monitor_id, .. }
            | ErrorInt::WatchdogTimeout { monitor_id, .. } => Some(monitor_id),
            _ => None,
        }
    }

    fn recovery(&self) -> Recovery {
        match self {
            ErrorInt::IoTransient { .. } => Recovery::RestartWithBackoff,
            ErrorInt::IoFatal { .. } => Recovery::RetryNextCycle,
            ErrorInt::ProtocolMalformed { .. } => Recovery::FatalToStream,
            ErrorInt::CorruptRecording { .. } => Recovery::MarkForPrune,
            ErrorInt::WatchdogTimeout { .. } => Recovery::CancelAndRestart,
            ErrorInt::OverflowedSubscriber => Recovery::DropSubscriber,
            ErrorInt::ConfigInvalid { .. } => Recovery::FailStartup,
        }
    }
}

/// Shorthand for `return Err(...)` from an [`ErrorInt`] variant, mirroring
/// `retina`'s internal `bail!` macro.
macro_rules! bail {
    ($e:expr) => {
        return Err($crate::error::Error::from($e))
    };
}

/// Shorthand for constructing an [`Error`] from an [`ErrorInt`] in `map_err`
/// chains, mirroring `retina`'s internal `wrap!` macro.
macro_rules! wrap {
    ($e:expr) => {
        $crate::error::Error::from($e)
    };
}

pub(crate) use bail;
pub(crate) use wrap;
