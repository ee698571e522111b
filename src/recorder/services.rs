// Copyright (C) 2024 SentryShot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Lifecycle hook registry (§9 "Shared mutable state through a package-level
//! registry of hooks" / "Global singletons").
//!
//! Rather than a global `hooks` singleton, the supervisor owns a `Services`
//! value built once at startup and passed down the tree; hook invocation
//! always happens on the owning task, never shared across tasks.

use std::path::PathBuf;

/// Event fired when a recording closes (§4.D "Event emission").
#[derive(Clone, Debug)]
pub struct RecSaved {
    pub monitor_id: String,
    pub path: PathBuf,
    pub start_time: i64,
    pub end_time: i64,
    pub thumbnail_path: PathBuf,
}

/// Lifecycle callbacks the core invokes at well-defined points. The default
/// `NullServices` does nothing; production wiring and tests each supply
/// their own implementation.
pub trait Services: Send + Sync {
    fn monitor_started(&self, _monitor_id: &str) {}
    fn monitor_stopped(&self, _monitor_id: &str) {}
    fn recording_saved(&self, _event: &RecSaved) {}
}

#[derive(Default)]
pub struct NullServices;

impl Services for NullServices {}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingServices {
        pub saved: Mutex<Vec<RecSaved>>,
    }

    impl Services for RecordingServices {
        fn recording_saved(&self, event: &RecSaved) {
            self.saved.lock().unwrap().push(event.clone());
        }
    }
}
