// Copyright (C) 2024 SentryShot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! External process invocation capability (§9 "Duck-typed Process
//! abstraction over subprocess invocation").
//!
//! The recorder never calls `tokio::process::Command` directly; it goes
//! through an [`ExternalProcessRunner`] so tests can replay pre-canned
//! output instead of spawning a real encoder.

use std::process::ExitStatus;

use async_trait::async_trait;

use crate::error::{wrap, Error, ErrorInt, Source};

/// A subprocess invocation, analogous to the Go-side "Process" value
/// (binary name, args) the recorder uses to launch hardware-accelerated
/// encoders (§6 `hwaccel`/`videoEncoder`/`audioEncoder`).
#[derive(Clone, Debug)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
}

pub struct ProcessOutput {
    pub status: Option<ExitStatus>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[async_trait]
pub trait ExternalProcessRunner: Send + Sync {
    async fn run(&self, spec: &ProcessSpec) -> Result<ProcessOutput, Error>;
}

/// Spawns a real child process, per the `tokio::process` wiring the core
/// uses outside this crate's scope (§1 "Invocation of external encoders ...
/// we specify only the IPC contract").
pub struct TokioProcessRunner;

#[async_trait]
impl ExternalProcessRunner for TokioProcessRunner {
    async fn run(&self, spec: &ProcessSpec) -> Result<ProcessOutput, Error> {
        let output = tokio::process::Command::new(&spec.program)
            .args(&spec.args)
            .output()
            .await
            .map_err(|e| {
                wrap!(ErrorInt::IoFatal {
                    source_tag: Source::Recorder,
                    monitor_id: String::new(),
                    description: format!("spawning {}", spec.program),
                    cause: Some(e),
                })
            })?;
        Ok(ProcessOutput {
            status: Some(output.status),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Test double that replays pre-canned stdout/stderr instead of spawning a
/// process, per §9's strategy for the `ExternalProcessRunner` capability.
pub struct ReplayProcessRunner {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[async_trait]
impl ExternalProcessRunner for ReplayProcessRunner {
    async fn run(&self, _spec: &ProcessSpec) -> Result<ProcessOutput, Error> {
        Ok(ProcessOutput {
            status: None,
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replay_runner_returns_canned_output() {
        let runner = ReplayProcessRunner {
            stdout: b"ok".to_vec(),
            stderr: Vec::new(),
        };
        let spec = ProcessSpec {
            program: "ffmpeg".to_string(),
            args: vec!["-version".to_string()],
        };
        let out = runner.run(&spec).await.unwrap();
        assert_eq!(out.stdout, b"ok");
        assert!(out.status.is_none());
    }
}
