//! Warm-session pool for the redirector's outbound side.
//!
//! Holds a small set of client sessions to the downstream server and opens
//! streams on whichever has spare capacity, dialing a fresh session (via the
//! caller-supplied dialer, which owns connect + TLS + auth prelude) only
//! when none does. Idle sessions are closed by a sweeper.

use crate::async_stream::AsyncStream;
use crate::padding::PaddingCell;
use crate::session::{Session, Stream};
use async_trait::async_trait;
use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Produces connected, authenticated transports ready to speak the framed
/// protocol. For the redirector: TCP connect, TLS client handshake, then the
/// 34-byte auth prelude (digest + `padding_len = 0`).
#[async_trait]
pub trait SessionDialer: Send + Sync {
    async fn dial(&self) -> io::Result<Box<dyn AsyncStream>>;
}

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Sessions with no streams for this long are closed.
    pub idle_timeout: Duration,
    /// Sweeper wakeup period.
    pub sweep_interval: Duration,
    /// Stream capacity per pooled session.
    pub max_streams_per_session: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(5),
            max_streams_per_session: 4,
        }
    }
}

pub struct SessionPool {
    dialer: Arc<dyn SessionDialer>,
    padding: Arc<PaddingCell>,
    sessions: Mutex<Vec<Arc<Session>>>,
    config: PoolConfig,
}

impl SessionPool {
    pub fn new(
        dialer: Arc<dyn SessionDialer>,
        padding: Arc<PaddingCell>,
        config: PoolConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            dialer,
            padding,
            sessions: Mutex::new(Vec::new()),
            config,
        })
    }

    /// Open a stream on a pooled session, preferring the one most recently
    /// in use; dial a new session when all are at capacity. Dial failures
    /// propagate, there is no retry at this layer.
    pub async fn create_stream(&self) -> io::Result<Stream> {
        let reusable = {
            let mut sessions = self.sessions.lock().await;
            sessions.retain(|s| !s.is_closed());
            sessions
                .iter()
                .filter(|s| s.stream_count() < self.config.max_streams_per_session)
                .max_by_key(|s| s.idle_since())
                .cloned()
        };

        let session = match reusable {
            Some(session) => session,
            None => self.dial_session().await?,
        };

        session.open_stream().await
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    async fn dial_session(&self) -> io::Result<Arc<Session>> {
        let conn = self.dialer.dial().await?;
        let session = Session::client(conn, Arc::clone(&self.padding));

        let running = Arc::clone(&session);
        tokio::spawn(async move {
            if let Err(e) = running.run().await {
                log::debug!("pooled session ended: {}", e);
            }
        });

        self.sessions.lock().await.push(Arc::clone(&session));
        log::debug!("pool dialed a new downstream session");
        Ok(session)
    }

    /// Close and drop sessions that have sat idle past the timeout.
    pub async fn sweep(&self) {
        let stale: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock().await;
            let mut stale = Vec::new();
            sessions.retain(|s| {
                if s.is_closed() {
                    return false;
                }
                if s.stream_count() == 0 && s.idle_since().elapsed() > self.config.idle_timeout {
                    stale.push(Arc::clone(s));
                    return false;
                }
                true
            });
            stale
        };
        for session in stale {
            log::debug!("closing idle pooled session");
            let _ = session.close().await;
        }
    }

    /// Spawn the periodic idle sweeper; it exits when the pool is dropped.
    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let pool: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.sweep_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match pool.upgrade() {
                    Some(pool) => pool.sweep().await,
                    None => return,
                }
            }
        })
    }
}
