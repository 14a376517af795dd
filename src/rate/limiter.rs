//! Cooperative per-peer throttle.
//!
//! Callers consult the limiter around I/O on a peer's connection; when the
//! peer's current bps exceeds the limit the caller is held for one window
//! period. This gives coarse backpressure, not strict shaping.

use super::Recorder;
use std::time::Duration;

/// Default limit: 100 MiB/s.
pub const DEFAULT_LIMIT_BPS: f64 = 100.0 * 1024.0 * 1024.0;

const OVER_LIMIT_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub struct Limiter {
    limit_bps: f64,
}

impl Limiter {
    pub fn new(limit_bps: f64) -> Self {
        Self { limit_bps }
    }

    fn disallow(&self, current_bps: f64) -> bool {
        current_bps > self.limit_bps
    }

    /// Pause briefly if the peer's send rate is over the limit.
    pub async fn try_limit_send(&self, recorder: &Recorder) {
        if self.disallow(recorder.stats().current_sent_bps) {
            tokio::time::sleep(OVER_LIMIT_PAUSE).await;
        }
    }

    /// Pause briefly if the peer's receive rate is over the limit.
    pub async fn try_limit_recv(&self, recorder: &Recorder) {
        if self.disallow(recorder.stats().current_received_bps) {
            tokio::time::sleep(OVER_LIMIT_PAUSE).await;
        }
    }
}

impl Default for Limiter {
    fn default() -> Self {
        Self::new(DEFAULT_LIMIT_BPS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, Instant};

    #[tokio::test(start_paused = true)]
    async fn under_limit_does_not_pause() {
        let limiter = Limiter::new(1000.0);
        let recorder = Recorder::new("10.0.0.1".to_string());

        let before = Instant::now();
        limiter.try_limit_send(&recorder).await;
        assert_eq!(Instant::now(), before);
        recorder.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn over_limit_pauses_one_window() {
        let limiter = Limiter::new(10.0);
        let recorder = Recorder::new("10.0.0.1".to_string());
        recorder.record_send(1_000_000);
        // Past one window rotation so the count lands in the bps ring.
        advance(Duration::from_millis(150)).await;
        assert!(recorder.stats().current_sent_bps > 10.0);

        let before = Instant::now();
        limiter.try_limit_send(&recorder).await;
        assert!(Instant::now() - before >= OVER_LIMIT_PAUSE);
        recorder.stop();
    }
}
