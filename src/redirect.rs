//! Same-protocol redirector.
//!
//! Speaks the identical inbound protocol as the server, but instead of
//! dialing destinations directly it forwards each accepted stream over a
//! pooled session to a downstream server: the destination record read from
//! the inbound stream is replayed onto the pooled stream, then bytes are
//! spliced.

use crate::async_stream::AsyncStream;
use crate::padding::PaddingCell;
use crate::rate::{IpTracker, Limiter};
use crate::server::password_digest;
use crate::session::{PoolConfig, Session, SessionDialer, SessionPool, Stream, StreamHandler};
use crate::socks_addr::{read_location, write_location};
use crate::tls;
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const AUTH_HEADER_SIZE: usize = 34;

/// Dials the downstream server: TCP, TLS without verification, then the
/// 34-byte auth prelude with `padding_len = 0`.
pub struct DownstreamDialer {
    downstream: String,
    server_name: ServerName<'static>,
    connector: TlsConnector,
    password_sha256: [u8; 32],
}

impl DownstreamDialer {
    pub fn new(downstream: String, password: &str) -> Self {
        let host = downstream
            .rsplit_once(':')
            .map(|(host, _)| host.trim_matches(['[', ']']))
            .unwrap_or(downstream.as_str());
        let server_name = ServerName::try_from(host.to_string())
            .unwrap_or_else(|_| ServerName::try_from("localhost").unwrap());

        Self {
            downstream,
            server_name,
            connector: TlsConnector::from(tls::new_insecure_client_config()),
            password_sha256: password_digest(password),
        }
    }
}

#[async_trait]
impl SessionDialer for DownstreamDialer {
    async fn dial(&self) -> io::Result<Box<dyn AsyncStream>> {
        let conn = TcpStream::connect(&self.downstream).await?;
        let mut tls_conn = self
            .connector
            .connect(self.server_name.clone(), conn)
            .await?;

        let mut prelude = [0u8; AUTH_HEADER_SIZE];
        prelude[..32].copy_from_slice(&self.password_sha256);
        // padding_len = 0: the session's own padding engine shapes the rest.
        tls_conn.write_all(&prelude).await?;
        tls_conn.flush().await?;

        Ok(Box::new(tls_conn))
    }
}

/// Shared state for the redirector's inbound side.
pub struct RedirectContext {
    password_sha256: [u8; 32],
    pub padding: Arc<PaddingCell>,
    pub tracker: Arc<IpTracker>,
    pub limiter: Option<Limiter>,
    pub pool: Arc<SessionPool>,
}

impl RedirectContext {
    pub fn new(
        password: &str,
        downstream: String,
        padding: Arc<PaddingCell>,
        tracker: Arc<IpTracker>,
    ) -> Self {
        let dialer = Arc::new(DownstreamDialer::new(downstream, password));
        let pool = SessionPool::new(dialer, Arc::clone(&padding), PoolConfig::default());
        Self {
            password_sha256: password_digest(password),
            padding,
            tracker,
            limiter: Some(Limiter::default()),
            pool,
        }
    }
}

/// Forwards each inbound stream over the pool.
struct PoolOutbound {
    pool: Arc<SessionPool>,
}

#[async_trait]
impl StreamHandler for PoolOutbound {
    async fn handle_stream(&self, session: Arc<Session>, mut stream: Stream) {
        let sid = stream.id();
        let destination = match read_location(&mut stream).await {
            Ok(destination) => destination,
            Err(e) => {
                log::debug!("stream {}: bad destination record: {}", sid, e);
                return;
            }
        };
        log::debug!("stream {} => downstream {}", sid, destination);

        let mut downstream = match self.pool.create_stream().await {
            Ok(downstream) => downstream,
            Err(e) => {
                log::warn!("stream {}: downstream session failed: {}", sid, e);
                let _ = session
                    .send_synack(sid, Some(&format!("downstream failed: {}", e)))
                    .await;
                return;
            }
        };

        // Replay the destination for the downstream server; UoT sentinels
        // pass through untouched, the downstream decides.
        if let Err(e) = write_location(&mut downstream, &destination).await {
            log::debug!("stream {}: destination relay failed: {}", sid, e);
            let _ = session.send_synack(sid, Some("downstream failed")).await;
            return;
        }

        if let Err(e) = session.send_synack(sid, None).await {
            log::debug!("stream {}: syn-ack failed: {}", sid, e);
            return;
        }

        let result = tokio::io::copy_bidirectional(&mut stream, &mut downstream).await;
        let _ = stream.shutdown().await;
        let _ = downstream.shutdown().await;

        if let Err(e) = result {
            log::debug!("stream {} relay ended: {}", sid, e);
        } else {
            log::debug!("stream {} relay finished", sid);
        }
    }
}

async fn authenticate<IO>(conn: &mut IO, expected: &[u8; 32]) -> io::Result<bool>
where
    IO: AsyncRead + Unpin,
{
    let mut header = [0u8; AUTH_HEADER_SIZE];
    conn.read_exact(&mut header).await?;
    if header[..32] != expected[..] {
        return Ok(false);
    }
    let padding_len = u16::from_be_bytes([header[32], header[33]]) as usize;
    if padding_len > 0 {
        let mut junk = vec![0u8; padding_len];
        conn.read_exact(&mut junk).await?;
    }
    Ok(true)
}

/// Drive one post-TLS inbound connection. Unlike the server there is no
/// fallback sink: a bad digest closes the connection immediately.
pub async fn serve_connection<IO>(
    ctx: &RedirectContext,
    mut conn: IO,
    peer: SocketAddr,
) -> io::Result<()>
where
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let authed = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        authenticate(&mut conn, &ctx.password_sha256),
    )
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "auth prelude timed out"))??;

    if !authed {
        log::warn!("auth failed for {}", peer);
        return Ok(());
    }

    let handler = Arc::new(PoolOutbound {
        pool: Arc::clone(&ctx.pool),
    });
    let session = Session::server(
        conn,
        handler,
        Arc::clone(&ctx.padding),
        Some(ctx.tracker.with_ip(peer)),
        ctx.limiter,
    );
    session.run().await
}

/// Accept loop for the redirector binary.
pub async fn run_redirect(
    listen: &str,
    ctx: Arc<RedirectContext>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let listener = TcpListener::bind(listen).await?;
    let acceptor = TlsAcceptor::from(tls::new_server_config("localhost")?);
    let tracker_sweeper = ctx.tracker.start_sweeper();
    let pool_sweeper = ctx.pool.start_sweeper();

    log::info!("listening on {}", listen);

    loop {
        let (conn, peer) = tokio::select! {
            _ = shutdown.cancelled() => {
                tracker_sweeper.abort();
                pool_sweeper.abort();
                return Ok(());
            }
            accepted = listener.accept() => accepted?,
        };

        let acceptor = acceptor.clone();
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            log::info!("new client from {}", peer);
            let tls_conn =
                match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(conn)).await {
                    Ok(Ok(tls_conn)) => tls_conn,
                    Ok(Err(e)) => {
                        log::debug!("tls handshake with {} failed: {}", peer, e);
                        return;
                    }
                    Err(_) => {
                        log::debug!("tls handshake with {} timed out", peer);
                        return;
                    }
                };
            if let Err(e) = serve_connection(&ctx, tls_conn, peer).await {
                log::debug!("session from {} ended: {}", peer, e);
            }
            log::debug!("client {} closed", peer);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Address, Location};
    use crate::server::{self, ServerContext};
    use tokio::io::duplex;
    use tokio::time::timeout;

    /// Dialer that skips TCP/TLS and connects straight to an in-memory
    /// downstream server speaking the real protocol.
    struct LoopbackDownstream {
        ctx: Arc<ServerContext>,
        password: String,
    }

    #[async_trait]
    impl SessionDialer for LoopbackDownstream {
        async fn dial(&self) -> io::Result<Box<dyn AsyncStream>> {
            let (mut client_io, server_io) = duplex(1 << 20);
            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                let _ = server::serve_connection(&ctx, server_io, "127.0.0.1:1".parse().unwrap())
                    .await;
            });

            let mut prelude = [0u8; AUTH_HEADER_SIZE];
            prelude[..32].copy_from_slice(&password_digest(&self.password));
            client_io.write_all(&prelude).await?;
            Ok(Box::new(client_io))
        }
    }

    #[tokio::test]
    async fn redirects_through_pool_to_downstream_server() {
        // Real echo endpoint the downstream server dials out to.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = conn.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });

        let padding = Arc::new(PaddingCell::default());
        let downstream_ctx = Arc::new(ServerContext::new(
            "pw",
            Arc::clone(&padding),
            IpTracker::new(),
        ));

        // Redirect context wired to the in-memory downstream.
        let dialer = Arc::new(LoopbackDownstream {
            ctx: downstream_ctx,
            password: "pw".to_string(),
        });
        let pool = SessionPool::new(dialer, Arc::clone(&padding), PoolConfig::default());
        let ctx = RedirectContext {
            password_sha256: password_digest("pw"),
            padding: Arc::clone(&padding),
            tracker: IpTracker::new(),
            limiter: None,
            pool,
        };

        // Inbound client -> redirector, sans TLS.
        let (mut client_io, redirect_io) = duplex(1 << 20);
        tokio::spawn(async move {
            let _ = serve_connection(&ctx, redirect_io, "127.0.0.1:2".parse().unwrap()).await;
        });

        let mut prelude = [0u8; AUTH_HEADER_SIZE];
        prelude[..32].copy_from_slice(&password_digest("pw"));
        client_io.write_all(&prelude).await.unwrap();

        let client = Session::client(client_io, Arc::new(PaddingCell::default()));
        let session = Arc::clone(&client);
        tokio::spawn(async move {
            let _ = session.run().await;
        });

        let mut stream = client.open_stream().await.unwrap();
        let destination = Location::new(
            Address::from(&echo_addr.ip().to_string()).unwrap(),
            echo_addr.port(),
        );
        write_location(&mut stream, &destination).await.unwrap();
        stream.write_all(b"hop hop").await.unwrap();

        let mut buf = [0u8; 7];
        timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"hop hop");
    }

    #[tokio::test]
    async fn bad_digest_is_closed_immediately() {
        let padding = Arc::new(PaddingCell::default());
        let ctx = RedirectContext::new(
            "pw",
            "127.0.0.1:8443".to_string(),
            Arc::clone(&padding),
            IpTracker::new(),
        );

        let (mut client_io, redirect_io) = duplex(1 << 16);
        tokio::spawn(async move {
            let _ = serve_connection(&ctx, redirect_io, "127.0.0.1:3".parse().unwrap()).await;
        });

        client_io.write_all(&[0u8; AUTH_HEADER_SIZE]).await.unwrap();

        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(5), client_io.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn dialer_extracts_sni_from_downstream() {
        let dialer = DownstreamDialer::new("proxy.example.net:8443".to_string(), "pw");
        assert_eq!(
            dialer.server_name,
            ServerName::try_from("proxy.example.net").unwrap()
        );
    }
}
