//! Process-wide map of per-IP recorders with idle eviction.

use super::Recorder;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Recorders idle for longer than this are evicted by the sweeper.
pub const HEARTBEAT_DEADLINE: Duration = Duration::from_secs(5 * 60);

/// Sweeper wakeup period.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Recorders keyed by remote IP string.
#[derive(Debug, Default)]
pub struct IpTracker {
    recorders: RwLock<HashMap<String, Arc<Recorder>>>,
}

impl IpTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get or create the recorder for `addr`'s IP, refreshing its idle
    /// clock either way.
    pub fn with_ip(&self, addr: SocketAddr) -> Arc<Recorder> {
        let ip = addr.ip().to_string();

        if let Some(recorder) = self.recorders.read().get(&ip) {
            recorder.touch();
            return Arc::clone(recorder);
        }

        let mut recorders = self.recorders.write();
        if let Some(recorder) = recorders.get(&ip) {
            recorder.touch();
            return Arc::clone(recorder);
        }

        let recorder = Recorder::new(ip.clone());
        recorder.touch();
        recorders.insert(ip, Arc::clone(&recorder));
        recorder
    }

    pub fn len(&self) -> usize {
        self.recorders.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.recorders.read().is_empty()
    }

    /// Drop and stop every recorder past the heartbeat deadline.
    pub fn clean(&self) {
        let mut recorders = self.recorders.write();
        let total = recorders.len();
        recorders.retain(|ip, recorder| {
            if recorder.idle_for() > HEARTBEAT_DEADLINE {
                log::info!("[rate] stop recorder {}", ip);
                recorder.stop();
                false
            } else {
                true
            }
        });
        let remain = recorders.len();
        if total != remain {
            log::info!("[rate] cleaned {} recorders, {} remain", total - remain, remain);
        }
    }

    /// Spawn the periodic eviction task. It exits once the tracker is
    /// dropped.
    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let tracker: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                match tracker.upgrade() {
                    Some(tracker) => tracker.clean(),
                    None => return,
                }
            }
        })
    }
}
