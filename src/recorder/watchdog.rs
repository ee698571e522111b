// Copyright (C) 2024 SentryShot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Watchdog supervisor (§4.D "Watchdog", §8 scenario 5): cancels the
//! recorder task if no new segment lands within `watchdog_interval`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(15);
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Tracks time since the muxer last advanced a segment and fires
/// `cancel_token` if `interval` elapses without a `kick()`.
pub struct Watchdog {
    interval: Duration,
    notify: Arc<Notify>,
}

impl Watchdog {
    pub fn new(interval: Duration) -> Self {
        Watchdog {
            interval,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Call each time the muxer advances a segment; resets the deadline.
    pub fn kick(&self) {
        self.notify.notify_one();
    }

    /// Runs until either `interval` passes with no `kick()` (returning
    /// `true`, meaning the caller should cancel and restart) or
    /// `cancel_token` fires first (returning `false`).
    pub async fn watch(&self, cancel_token: &CancellationToken) -> bool {
        loop {
            let deadline = Instant::now() + self.interval;
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => return false,
                _ = self.notify.notified() => continue,
                _ = tokio::time::sleep_until(deadline) => return true,
            }
        }
    }
}

/// Exponential backoff for STARTING retries, capped at [`MAX_BACKOFF`]
/// (§4.D "exponential backoff capped at 60 s").
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Backoff { attempt: 0 }
    }

    pub fn next_delay(&mut self) -> Duration {
        let secs = 1u64.checked_shl(self.attempt).unwrap_or(u64::MAX);
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_secs(secs).min(MAX_BACKOFF)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_after_interval_with_no_kick() {
        let watchdog = Watchdog::new(Duration::from_millis(10));
        let token = CancellationToken::new();
        let fired = watchdog.watch(&token).await;
        assert!(fired);
    }

    #[tokio::test(start_paused = true)]
    async fn kick_resets_the_deadline() {
        let watchdog = Watchdog::new(Duration::from_millis(10));
        let token = CancellationToken::new();
        let w = &watchdog;
        let t = &token;
        let watch_fut = w.watch(t);
        tokio::pin!(watch_fut);
        tokio::time::sleep(Duration::from_millis(5)).await;
        watchdog.kick();
        tokio::select! {
            _ = &mut watch_fut => panic!("should not have fired yet"),
            _ = tokio::time::sleep(Duration::from_millis(5)) => {}
        }
    }

    #[test]
    fn backoff_caps_at_max() {
        let mut b = Backoff::new();
        let mut last = Duration::ZERO;
        for _ in 0..10 {
            last = b.next_delay();
        }
        assert_eq!(last, MAX_BACKOFF);
    }
}
