//! Channel-fed byte counters for one remote IP.
//!
//! Sessions report sent/received byte counts through buffered channels; a
//! single task per recorder drains them and maintains totals plus a sliding
//! window of recent 100 ms sums for bps estimation. Feeding a stopped
//! recorder is a silent no-op.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Window rotation period.
pub const WINDOW_PERIOD: Duration = Duration::from_millis(100);

/// Number of recent windows summed for the current-bps estimate.
pub const WINDOW_QUEUE_SIZE: usize = 10;

/// Capacity of each byte-count channel. Sends never block: counts are
/// dropped if the consumer falls this far behind.
const CHANNEL_CAPACITY: usize = 1000;

#[derive(Debug, Default)]
struct WindowRing {
    sent: [u64; WINDOW_QUEUE_SIZE],
    rcvd: [u64; WINDOW_QUEUE_SIZE],
    index: usize,
}

/// Aggregated counters for one peer IP.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stats {
    pub total_sent: u64,
    pub total_received: u64,
    pub current_sent: u64,
    pub current_received: u64,

    pub total_sent_bps: f64,
    pub total_received_bps: f64,
    pub current_sent_bps: f64,
    pub current_received_bps: f64,
}

pub struct Recorder {
    ip: String,
    started_at: Instant,
    /// Milliseconds since `started_at`, refreshed on every byte count.
    last_heartbeat: AtomicU64,

    total_sent: AtomicU64,
    total_rcvd: AtomicU64,
    window_sent: AtomicU64,
    window_rcvd: AtomicU64,
    windows: Mutex<WindowRing>,

    send_tx: mpsc::Sender<u64>,
    recv_tx: mpsc::Sender<u64>,
    stop: CancellationToken,
}

impl Recorder {
    pub fn new(ip: String) -> Arc<Self> {
        let (send_tx, send_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (recv_tx, recv_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let recorder = Arc::new(Self {
            ip,
            started_at: Instant::now(),
            last_heartbeat: AtomicU64::new(0),
            total_sent: AtomicU64::new(0),
            total_rcvd: AtomicU64::new(0),
            window_sent: AtomicU64::new(0),
            window_rcvd: AtomicU64::new(0),
            windows: Mutex::new(WindowRing::default()),
            send_tx,
            recv_tx,
            stop: CancellationToken::new(),
        });

        tokio::spawn(Arc::clone(&recorder).record_loop(send_rx, recv_rx));

        recorder
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    /// Report bytes written to the peer. Never blocks; dropped when the
    /// recorder is stopped or saturated.
    pub fn record_send(&self, n: u64) {
        let _ = self.send_tx.try_send(n);
    }

    /// Report bytes read from the peer.
    pub fn record_recv(&self, n: u64) {
        let _ = self.recv_tx.try_send(n);
    }

    /// Refresh the idle clock without reporting traffic.
    pub fn touch(&self) {
        self.last_heartbeat
            .store(self.started_at.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Time since the last byte count or [`touch`](Self::touch).
    pub fn idle_for(&self) -> Duration {
        let now = self.started_at.elapsed().as_millis() as u64;
        let last = self.last_heartbeat.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }

    /// Stop the consuming task. Subsequent reports are discarded.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn stats(&self) -> Stats {
        let uptime = self.started_at.elapsed().as_secs_f64().max(f64::EPSILON);
        let (current_sent_bps, current_received_bps) = {
            let ring = self.windows.lock();
            (
                ring.sent.iter().sum::<u64>() as f64,
                ring.rcvd.iter().sum::<u64>() as f64,
            )
        };

        let total_sent = self.total_sent.load(Ordering::Relaxed);
        let total_received = self.total_rcvd.load(Ordering::Relaxed);

        Stats {
            total_sent,
            total_received,
            current_sent: self.window_sent.load(Ordering::Relaxed),
            current_received: self.window_rcvd.load(Ordering::Relaxed),
            total_sent_bps: total_sent as f64 / uptime,
            total_received_bps: total_received as f64 / uptime,
            current_sent_bps,
            current_received_bps,
        }
    }

    async fn record_loop(
        self: Arc<Self>,
        mut send_rx: mpsc::Receiver<u64>,
        mut recv_rx: mpsc::Receiver<u64>,
    ) {
        let mut ticker = tokio::time::interval(WINDOW_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return,
                Some(sent) = send_rx.recv() => {
                    self.total_sent.fetch_add(sent, Ordering::Relaxed);
                    self.window_sent.fetch_add(sent, Ordering::Relaxed);
                    self.touch();
                }
                Some(rcvd) = recv_rx.recv() => {
                    self.total_rcvd.fetch_add(rcvd, Ordering::Relaxed);
                    self.window_rcvd.fetch_add(rcvd, Ordering::Relaxed);
                    self.touch();
                }
                _ = ticker.tick() => {
                    let mut ring = self.windows.lock();
                    let index = ring.index;
                    ring.sent[index] = self.window_sent.swap(0, Ordering::Relaxed);
                    ring.rcvd[index] = self.window_rcvd.swap(0, Ordering::Relaxed);
                    ring.index = (index + 1) % WINDOW_QUEUE_SIZE;
                }
            }
        }
    }
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("ip", &self.ip)
            .field("stats", &self.stats())
            .finish()
    }
}
