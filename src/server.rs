//! Inbound connection handling for the server binary.
//!
//! Per accepted connection: TLS, then the auth prelude (SHA-256 of the
//! shared secret, a 2-byte padding length, and that much junk), then a
//! server session whose streams each carry a destination record followed by
//! payload spliced to a direct outbound dial.

use crate::address::Location;
use crate::padding::PaddingCell;
use crate::rate::{IpTracker, Limiter};
use crate::session::{Session, Stream, StreamHandler};
use crate::socks_addr::read_location;
use crate::tls;
use crate::uot::{is_uot_destination, UotHandler};
use async_trait::async_trait;
use aws_lc_rs::digest::{digest, SHA256};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

/// Hard deadline covering the TLS handshake and the auth prelude.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Digest (32) + big-endian padding length (2).
const AUTH_HEADER_SIZE: usize = 34;

/// Shared state for every inbound connection; the composition root wires
/// the padding cell, tracker, and limiter here instead of using globals.
pub struct ServerContext {
    password_sha256: [u8; 32],
    pub padding: Arc<PaddingCell>,
    pub tracker: Arc<IpTracker>,
    pub limiter: Option<Limiter>,
    pub uot: Option<Arc<dyn UotHandler>>,
}

impl ServerContext {
    pub fn new(password: &str, padding: Arc<PaddingCell>, tracker: Arc<IpTracker>) -> Self {
        Self {
            password_sha256: password_digest(password),
            padding,
            tracker,
            limiter: Some(Limiter::default()),
            uot: None,
        }
    }
}

pub fn password_digest(password: &str) -> [u8; 32] {
    let digest = digest(&SHA256, password.as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_ref());
    out
}

enum AuthOutcome {
    Accepted,
    /// Digest mismatch; carries the bytes already consumed so a fallback
    /// sink could replay them.
    Rejected(Vec<u8>),
}

async fn authenticate<IO>(conn: &mut IO, expected: &[u8; 32]) -> io::Result<AuthOutcome>
where
    IO: AsyncRead + Unpin,
{
    let mut header = [0u8; AUTH_HEADER_SIZE];
    conn.read_exact(&mut header).await?;

    if header[..32] != expected[..] {
        return Ok(AuthOutcome::Rejected(header.to_vec()));
    }

    let padding_len = u16::from_be_bytes([header[32], header[33]]) as usize;
    if padding_len > 0 {
        let mut junk = vec![0u8; padding_len];
        conn.read_exact(&mut junk).await?;
    }
    Ok(AuthOutcome::Accepted)
}

/// Sink for connections that fail the digest check. Decoy proxying is not
/// implemented; the connection is dropped without writing a byte.
fn fallback<IO>(conn: IO, consumed: Vec<u8>, peer: SocketAddr)
where
    IO: Send + 'static,
{
    log::debug!("fallback: {} ({} prelude bytes)", peer, consumed.len());
    drop(conn);
}

/// Direct outbound dialer for server streams.
struct ProxyOutbound {
    uot: Option<Arc<dyn UotHandler>>,
}

#[async_trait]
impl StreamHandler for ProxyOutbound {
    async fn handle_stream(&self, session: Arc<Session>, mut stream: Stream) {
        let sid = stream.id();
        let destination = match read_location(&mut stream).await {
            Ok(destination) => destination,
            Err(e) => {
                log::debug!("stream {}: bad destination record: {}", sid, e);
                return;
            }
        };
        log::debug!("stream {} -> {}", sid, destination);

        if is_uot_destination(&destination) {
            self.handle_uot(session, stream, destination).await;
            return;
        }

        let mut outbound = match TcpStream::connect(destination.to_string()).await {
            Ok(outbound) => outbound,
            Err(e) => {
                log::debug!("stream {}: connect {} failed: {}", sid, destination, e);
                let _ = session
                    .send_synack(sid, Some(&format!("connect failed: {}", e)))
                    .await;
                return;
            }
        };

        if let Err(e) = session.send_synack(sid, None).await {
            log::debug!("stream {}: syn-ack failed: {}", sid, e);
            return;
        }

        let result = tokio::io::copy_bidirectional(&mut stream, &mut outbound).await;
        let _ = stream.shutdown().await;
        let _ = outbound.shutdown().await;

        match result {
            Ok((up, down)) => {
                log::debug!("stream {} done: {} up, {} down", sid, up, down);
            }
            Err(e) => log::debug!("stream {} ended: {}", sid, e),
        }
    }
}

impl ProxyOutbound {
    async fn handle_uot(&self, session: Arc<Session>, stream: Stream, destination: Location) {
        let sid = stream.id();
        match &self.uot {
            Some(uot) => {
                let _ = session.send_synack(sid, None).await;
                if let Err(e) = uot.relay(stream, destination).await {
                    log::debug!("stream {}: uot relay ended: {}", sid, e);
                }
            }
            None => {
                log::debug!("stream {}: udp-over-tcp not enabled", sid);
                let _ = session
                    .send_synack(sid, Some("udp-over-tcp is not enabled"))
                    .await;
            }
        }
    }
}

/// Drive one post-TLS connection to completion: auth prelude, then the
/// multiplexed session.
pub async fn serve_connection<IO>(
    ctx: &ServerContext,
    mut conn: IO,
    peer: SocketAddr,
) -> io::Result<()>
where
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let outcome = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        authenticate(&mut conn, &ctx.password_sha256),
    )
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "auth prelude timed out"))??;

    match outcome {
        AuthOutcome::Rejected(consumed) => {
            log::debug!("auth failed for {}", peer);
            fallback(conn, consumed, peer);
            Ok(())
        }
        AuthOutcome::Accepted => {
            log::debug!("auth success for {}", peer);
            let handler = Arc::new(ProxyOutbound {
                uot: ctx.uot.clone(),
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
    }
}

/// Accept loop: TCP, TLS with a self-signed certificate, then
/// [`serve_connection`] per connection. Returns on bind failure or when
/// `shutdown` fires.
pub async fn run_server(
    listen: &str,
    ctx: Arc<ServerContext>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let listener = TcpListener::bind(listen).await?;
    let acceptor = TlsAcceptor::from(tls::new_server_config("localhost")?);
    let sweeper = ctx.tracker.start_sweeper();

    log::info!("listening on {}", listen);

    loop {
        let (conn, peer) = tokio::select! {
            _ = shutdown.cancelled() => {
                sweeper.abort();
                return Ok(());
            }
            accepted = listener.accept() => accepted?,
        };

        let acceptor = acceptor.clone();
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            log::debug!("new connection from {}", peer);
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
            log::debug!("connection from {} closed", peer);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::frame::{Command, Frame, StringMap, FRAME_HEADER_SIZE};
    use crate::socks_addr::write_location;
    use bytes::Bytes;
    use tokio::io::{duplex, DuplexStream};
    use tokio::time::timeout;

    fn test_ctx(password: &str) -> Arc<ServerContext> {
        Arc::new(ServerContext::new(
            password,
            Arc::new(PaddingCell::default()),
            IpTracker::new(),
        ))
    }

    fn peer_addr() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn spawn_server(ctx: Arc<ServerContext>, io: DuplexStream) {
        tokio::spawn(async move {
            let _ = serve_connection(&ctx, io, peer_addr()).await;
        });
    }

    async fn write_prelude(io: &mut DuplexStream, password: &str, padding_len: u16) {
        io.write_all(&password_digest(password)).await.unwrap();
        io.write_all(&padding_len.to_be_bytes()).await.unwrap();
        if padding_len > 0 {
            io.write_all(&vec![0u8; padding_len as usize]).await.unwrap();
        }
    }

    #[tokio::test]
    async fn wrong_password_closes_without_a_reply() {
        let ctx = test_ctx("correct");
        let (mut client_io, server_io) = duplex(1 << 16);
        spawn_server(ctx, server_io);

        write_prelude(&mut client_io, "wrong", 0).await;

        // No ALERT, no settings; just EOF once the fallback drops the
        // connection.
        let mut buf = [0u8; 64];
        let n = timeout(Duration::from_secs(5), client_io.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn auth_prelude_padding_is_consumed() {
        let ctx = test_ctx("pw");
        let (mut client_io, server_io) = duplex(1 << 16);
        spawn_server(ctx, server_io);

        // 30 bytes of prelude junk, then a clean framed handshake.
        write_prelude(&mut client_io, "pw", 30).await;

        let mut settings = StringMap::new();
        settings.insert("v", "2");
        settings.insert("padding-md5", crate::padding::PaddingFactory::default().md5());
        let frame = Frame::with_data(Command::Settings, 0, Bytes::from(settings.to_bytes()));
        client_io.write_all(&frame.encode()).await.unwrap();

        // The reply proves the prelude junk was not parsed as frames.
        let mut header = [0u8; FRAME_HEADER_SIZE];
        timeout(Duration::from_secs(5), client_io.read_exact(&mut header))
            .await
            .unwrap()
            .unwrap();
        let (cmd, _, _) = Frame::decode_header(&header).unwrap();
        assert_eq!(cmd, Command::ServerSettings);
    }

    #[tokio::test]
    async fn proxies_stream_to_dialed_destination() {
        // Local echo endpoint standing in for the outbound destination.
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

        let ctx = test_ctx("pw");
        let (mut client_io, server_io) = duplex(1 << 20);
        spawn_server(Arc::clone(&ctx), server_io);

        // Client side of the tunnel, sans TLS: prelude, then a session.
        write_prelude(&mut client_io, "pw", 0).await;
        let padding = Arc::new(PaddingCell::default());
        let client = Session::client(client_io, padding);
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
        stream.write_all(b"through the tunnel").await.unwrap();

        let mut buf = [0u8; 18];
        timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"through the tunnel");
    }

    #[tokio::test]
    async fn unreachable_destination_fails_only_that_stream() {
        let ctx = test_ctx("pw");
        let (mut client_io, server_io) = duplex(1 << 20);
        spawn_server(ctx, server_io);

        write_prelude(&mut client_io, "pw", 0).await;
        let client = Session::client(client_io, Arc::new(PaddingCell::default()));
        let session = Arc::clone(&client);
        tokio::spawn(async move {
            let _ = session.run().await;
        });

        let mut stream = client.open_stream().await.unwrap();
        // Port 1 on loopback refuses immediately.
        let destination = Location::new(Address::from("127.0.0.1").unwrap(), 1);
        write_location(&mut stream, &destination).await.unwrap();

        let mut buf = [0u8; 16];
        let result = timeout(Duration::from_secs(10), stream.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(result, Err(_) | Ok(0)));
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn uot_destination_is_refused_without_helper() {
        let ctx = test_ctx("pw");
        let (mut client_io, server_io) = duplex(1 << 20);
        spawn_server(ctx, server_io);

        write_prelude(&mut client_io, "pw", 0).await;
        let client = Session::client(client_io, Arc::new(PaddingCell::default()));
        let session = Arc::clone(&client);
        tokio::spawn(async move {
            let _ = session.run().await;
        });

        let mut stream = client.open_stream().await.unwrap();
        let destination = Location::new(
            Address::from("sp.v2.udp-over-tcp.arpa").unwrap(),
            0,
        );
        write_location(&mut stream, &destination).await.unwrap();

        let mut buf = [0u8; 16];
        let err = timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.to_string().contains("udp-over-tcp"));
    }
}
