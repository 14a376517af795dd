//! Per-peer traffic accounting and cooperative rate limiting.

mod limiter;
mod recorder;
mod tracker;

pub use limiter::{Limiter, DEFAULT_LIMIT_BPS};
pub use recorder::{Recorder, Stats, WINDOW_PERIOD, WINDOW_QUEUE_SIZE};
pub use tracker::{IpTracker, HEARTBEAT_DEADLINE, SWEEP_INTERVAL};
