//! Per-connection multiplexer.
//!
//! One `Session` owns one authenticated TLS connection. A single recv loop
//! demultiplexes inbound frames to streams and drives the control protocol;
//! all outbound bytes funnel through the writer lock, which also owns the
//! pre-handshake staging buffer and the padding state, so a logical write
//! maps to one atomic group of records on the wire.
//!
//! The client and server sides share this type. The asymmetry: clients
//! allocate stream ids, stage their `SETTINGS` until the first flush, pad
//! their first packets, and arm the syn-ack dead-peer watcher; servers
//! accept `SYN`s (only after `SETTINGS`), answer handshakes, and feed the
//! per-peer traffic recorder.

use crate::frame::{Command, Frame, StringMap, FRAME_HEADER_SIZE, MAX_FRAME_PAYLOAD};
use crate::padding::{md5_hex, PaddingCell, PaddingFactory, CHECK_MARK};
use crate::rate::{Limiter, Recorder};
use crate::session::stream::{Stream, StreamEvent, STREAM_CHANNEL_BUFFER};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How long the client waits for a `SYNACK` before declaring the peer dead.
const SYNACK_TIMEOUT: Duration = Duration::from_secs(3);

/// Protocol version spoken by this implementation.
const PROTOCOL_VERSION: u8 = 2;

const CLIENT_NAME: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Server-side callback invoked in its own task for every accepted stream.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle_stream(&self, session: Arc<Session>, stream: Stream);
}

/// Write-side state, all guarded by the one writer lock so staging, the
/// packet counter, and the connection itself stay consistent across a
/// padding group.
struct WriteState {
    conn: Box<dyn AsyncWrite + Send + Unpin>,
    /// While on, frames are staged instead of written.
    buffering: bool,
    staging: BytesMut,
    pkt_counter: u32,
    send_padding: bool,
    /// Reused frame-encode buffer.
    scratch: BytesMut,
}

pub struct Session {
    writer: Mutex<WriteState>,
    /// Taken by the recv loop on `run`.
    reader: Mutex<Option<Box<dyn AsyncRead + Send + Unpin>>>,

    streams: parking_lot::RwLock<HashMap<u32, mpsc::Sender<StreamEvent>>>,
    stream_id: AtomicU32,

    outgoing_tx: mpsc::Sender<(u32, Bytes)>,
    outgoing_rx: Mutex<Option<mpsc::Receiver<(u32, Bytes)>>>,

    closed: Arc<AtomicBool>,
    die: CancellationToken,
    close_hook: parking_lot::Mutex<Option<Box<dyn FnOnce() + Send>>>,

    padding: Arc<PaddingCell>,
    is_client: bool,
    peer_version: AtomicU8,
    /// Client dead-peer watcher; re-armed per stream open, cancelled by any
    /// `SYNACK`.
    syn_watcher: parking_lot::Mutex<Option<JoinHandle<()>>>,
    /// `CLIENT_DEBUG_PADDING_SCHEME=1` suppresses scheme adoption.
    debug_padding: bool,

    handler: Option<Arc<dyn StreamHandler>>,
    recorder: Option<Arc<Recorder>>,
    limiter: Option<Limiter>,

    idle_since: parking_lot::Mutex<Instant>,
}

impl Session {
    /// Client session. The `SETTINGS` frame is staged immediately; it
    /// reaches the wire with the first unbuffered flush, coalesced with the
    /// first stream's `SYN` and destination record.
    pub fn client<IO>(conn: IO, padding: Arc<PaddingCell>) -> Arc<Self>
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut settings = StringMap::new();
        settings.insert("v", PROTOCOL_VERSION.to_string());
        settings.insert("client", CLIENT_NAME);
        settings.insert("padding-md5", padding.load().md5());

        let mut staging = BytesMut::new();
        Frame::with_data(Command::Settings, 0, Bytes::from(settings.to_bytes()))
            .encode_into(&mut staging);

        let debug_padding = std::env::var("CLIENT_DEBUG_PADDING_SCHEME")
            .map(|v| v == "1")
            .unwrap_or(false);

        Self::new(conn, padding, true, staging, debug_padding, None, None, None)
    }

    /// Server session for an authenticated inbound connection.
    pub fn server<IO>(
        conn: IO,
        handler: Arc<dyn StreamHandler>,
        padding: Arc<PaddingCell>,
        recorder: Option<Arc<Recorder>>,
        limiter: Option<Limiter>,
    ) -> Arc<Self>
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::new(
            conn,
            padding,
            false,
            BytesMut::new(),
            false,
            Some(handler),
            recorder,
            limiter,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new<IO>(
        conn: IO,
        padding: Arc<PaddingCell>,
        is_client: bool,
        staging: BytesMut,
        debug_padding: bool,
        handler: Option<Arc<dyn StreamHandler>>,
        recorder: Option<Arc<Recorder>>,
        limiter: Option<Limiter>,
    ) -> Arc<Self>
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(conn);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(STREAM_CHANNEL_BUFFER * 4);

        Arc::new(Self {
            writer: Mutex::new(WriteState {
                conn: Box::new(write_half),
                buffering: is_client,
                staging,
                pkt_counter: 0,
                send_padding: is_client,
                scratch: BytesMut::with_capacity(MAX_FRAME_PAYLOAD + FRAME_HEADER_SIZE),
            }),
            reader: Mutex::new(Some(Box::new(read_half))),
            streams: parking_lot::RwLock::new(HashMap::new()),
            stream_id: AtomicU32::new(0),
            outgoing_tx,
            outgoing_rx: Mutex::new(Some(outgoing_rx)),
            closed: Arc::new(AtomicBool::new(false)),
            die: CancellationToken::new(),
            close_hook: parking_lot::Mutex::new(None),
            padding,
            is_client,
            peer_version: AtomicU8::new(0),
            syn_watcher: parking_lot::Mutex::new(None),
            debug_padding,
            handler,
            recorder,
            limiter,
            idle_since: parking_lot::Mutex::new(Instant::now()),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn peer_version(&self) -> u8 {
        self.peer_version.load(Ordering::Relaxed)
    }

    /// Number of live streams; pool bookkeeping.
    pub fn stream_count(&self) -> usize {
        self.streams.read().len()
    }

    /// When this session last dropped to zero streams; pool bookkeeping.
    pub fn idle_since(&self) -> Instant {
        *self.idle_since.lock()
    }

    /// Invoked exactly once, by whichever caller closes the session first.
    pub fn set_close_hook(&self, hook: impl FnOnce() + Send + 'static) {
        *self.close_hook.lock() = Some(Box::new(hook));
    }

    /// Drive the session until the connection ends or the protocol aborts.
    /// Servers await this directly; clients (the pool) spawn it.
    pub async fn run(self: &Arc<Self>) -> io::Result<()> {
        let outgoing_rx = self
            .outgoing_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "session already running"))?;

        let writer_session = Arc::clone(self);
        let writer_task = tokio::spawn(async move {
            writer_session.process_outgoing(outgoing_rx).await;
        });

        let result = self.recv_loop().await;

        let _ = self.close().await;
        writer_task.abort();
        result
    }

    /// First caller wins: fires the hook, cancels the watcher, fails every
    /// stream, and shuts the connection down. Later callers get
    /// "already closed".
    pub async fn close(&self) -> io::Result<()> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "session already closed",
            ));
        }

        self.die.cancel();

        if let Some(hook) = self.close_hook.lock().take() {
            hook();
        }
        if let Some(watcher) = self.syn_watcher.lock().take() {
            watcher.abort();
        }

        let senders: Vec<_> = self.streams.write().drain().map(|(_, tx)| tx).collect();
        for tx in senders {
            // Dropping the sender also wakes the reader; the event is a
            // courtesy for pipes with spare capacity.
            let _ = tx.try_send(StreamEvent::Eof);
        }

        let mut writer = self.writer.lock().await;
        let _ = writer.conn.shutdown().await;
        Ok(())
    }

    /// Open a stream on a client session.
    pub async fn open_stream(self: &Arc<Self>) -> io::Result<Stream> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "session closed"));
        }

        let sid = self.stream_id.fetch_add(1, Ordering::Relaxed) + 1;

        // From the second stream on (and once the server has confirmed v2),
        // a missing SYNACK means the peer is gone: give it one deadline,
        // then tear the session down.
        if sid >= 2 && self.peer_version() >= PROTOCOL_VERSION {
            let session = Arc::downgrade(self);
            let watcher = tokio::spawn(async move {
                tokio::time::sleep(SYNACK_TIMEOUT).await;
                if let Some(session) = session.upgrade() {
                    log::warn!(
                        "no syn-ack within {:?}, closing session",
                        SYNACK_TIMEOUT
                    );
                    let _ = session.close().await;
                }
            });
            if let Some(previous) = self.syn_watcher.lock().replace(watcher) {
                previous.abort();
            }
        }

        // SYN goes out (or into staging) and buffering flips off under one
        // writer lock; the first payload write then flushes SETTINGS + SYN
        // + destination as a single padded group.
        self.write_frame_inner(Command::Syn, sid, &[], true).await?;

        let (event_tx, event_rx) = mpsc::channel(STREAM_CHANNEL_BUFFER);
        {
            let mut streams = self.streams.write();
            if self.is_closed() {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "session closed"));
            }
            streams.insert(sid, event_tx);
        }
        *self.idle_since.lock() = Instant::now();

        Ok(Stream::with_keepalive(
            sid,
            event_rx,
            self.outgoing_tx.clone(),
            Arc::clone(&self.closed),
            Arc::clone(self),
        ))
    }

    /// Answer a stream open (server, protocol v2). A non-empty `error`
    /// fails just that stream on the client.
    pub async fn send_synack(&self, sid: u32, error: Option<&str>) -> io::Result<()> {
        if self.peer_version() < PROTOCOL_VERSION {
            return Ok(());
        }
        let data = error.map(|e| e.as_bytes().to_vec()).unwrap_or_default();
        self.write_frame(Command::SynAck, sid, &data).await
    }

    /// Drain the stream write queue into framed writes. An empty payload is
    /// the stream's FIN signal.
    async fn process_outgoing(self: Arc<Self>, mut outgoing_rx: mpsc::Receiver<(u32, Bytes)>) {
        loop {
            let msg = tokio::select! {
                _ = self.die.cancelled() => return,
                msg = outgoing_rx.recv() => msg,
            };
            let Some((sid, data)) = msg else { return };

            if data.is_empty() {
                if let Err(e) = self.write_frame(Command::Fin, sid, &[]).await {
                    log::debug!("failed to send FIN for stream {}: {}", sid, e);
                }
                self.remove_stream(sid);
            } else if let Err(e) = self.write_frame(Command::Psh, sid, &data).await {
                log::debug!("write for stream {} failed: {}", sid, e);
                let _ = self.close().await;
                return;
            }
        }
    }

    fn remove_stream(&self, sid: u32) -> Option<mpsc::Sender<StreamEvent>> {
        let mut streams = self.streams.write();
        let removed = streams.remove(&sid);
        if streams.is_empty() {
            *self.idle_since.lock() = Instant::now();
        }
        removed
    }

    async fn recv_loop(self: &Arc<Self>) -> io::Result<()> {
        let mut reader = self
            .reader
            .lock()
            .await
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "recv loop already running"))?;

        let mut received_settings = false;
        let mut header = [0u8; FRAME_HEADER_SIZE];

        loop {
            let read = tokio::select! {
                _ = self.die.cancelled() => return Ok(()),
                read = reader.read_exact(&mut header) => read,
            };
            match read {
                Ok(_) => {}
                // Peer hung up between frames.
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            }

            let sid = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
            let length = u16::from_be_bytes([header[5], header[6]]);
            let cmd = match Command::try_from(header[0]) {
                Ok(cmd) => Some(cmd),
                // A bare unknown command is ignorable; one carrying payload
                // would desynchronise the framing, so it aborts.
                Err(_) if length == 0 => {
                    log::debug!("ignoring unknown command {}", header[0]);
                    None
                }
                Err(e) => return Err(e),
            };

            if let Some(recorder) = &self.recorder {
                recorder.record_recv(length as u64);
                if let Some(limiter) = &self.limiter {
                    limiter.try_limit_recv(recorder).await;
                }
            }

            let data = if length > 0 {
                let mut payload = BytesMut::zeroed(length as usize);
                tokio::select! {
                    _ = self.die.cancelled() => return Ok(()),
                    read = reader.read_exact(&mut payload) => { read?; }
                }
                payload.freeze()
            } else {
                Bytes::new()
            };

            let Some(cmd) = cmd else { continue };
            if !self.dispatch(cmd, sid, data, &mut received_settings).await? {
                return Ok(());
            }
        }
    }

    /// Handle one inbound frame. `Ok(false)` ends the recv loop cleanly.
    async fn dispatch(
        self: &Arc<Self>,
        cmd: Command,
        sid: u32,
        data: Bytes,
        received_settings: &mut bool,
    ) -> io::Result<bool> {
        match cmd {
            Command::Psh => {
                if data.is_empty() {
                    return Ok(true);
                }
                let tx = self.streams.read().get(&sid).cloned();
                if let Some(tx) = tx {
                    // Bounded pipe: slow stream consumers backpressure the
                    // whole connection, like the reference implementation.
                    let _ = tx.send(StreamEvent::Data(data)).await;
                } else {
                    log::trace!("payload for unknown stream {}", sid);
                }
            }

            Command::Syn => {
                if self.is_client {
                    log::warn!("peer sent SYN to a client session");
                    return Ok(true);
                }
                if !*received_settings {
                    self.write_frame(
                        Command::Alert,
                        0,
                        b"client did not send its settings",
                    )
                    .await?;
                    return Ok(false);
                }

                let stream = {
                    let mut streams = self.streams.write();
                    match streams.entry(sid) {
                        Entry::Occupied(_) => {
                            log::warn!("duplicate SYN for stream {}", sid);
                            None
                        }
                        Entry::Vacant(entry) => {
                            let (event_tx, event_rx) = mpsc::channel(STREAM_CHANNEL_BUFFER);
                            entry.insert(event_tx);
                            Some(Stream::new(
                                sid,
                                event_rx,
                                self.outgoing_tx.clone(),
                                Arc::clone(&self.closed),
                            ))
                        }
                    }
                };

                if let Some(stream) = stream {
                    *self.idle_since.lock() = Instant::now();
                    if let Some(handler) = &self.handler {
                        let handler = Arc::clone(handler);
                        let session = Arc::clone(self);
                        tokio::spawn(async move {
                            handler.handle_stream(session, stream).await;
                        });
                    }
                }
            }

            Command::SynAck => {
                if !self.is_client {
                    log::warn!("peer sent SYNACK to a server session");
                    return Ok(true);
                }
                if let Some(watcher) = self.syn_watcher.lock().take() {
                    watcher.abort();
                }
                if !data.is_empty() {
                    let message = String::from_utf8_lossy(&data).to_string();
                    log::debug!("stream {} refused by server: {}", sid, message);
                    if let Some(tx) = self.remove_stream(sid) {
                        let _ = tx.send(StreamEvent::Error(message)).await;
                    }
                    self.write_frame(Command::Fin, sid, &[]).await?;
                }
            }

            Command::Fin => {
                if let Some(tx) = self.remove_stream(sid) {
                    let _ = tx.send(StreamEvent::Eof).await;
                }
            }

            Command::Waste => {
                log::trace!("discarded {} bytes of padding", data.len());
            }

            Command::Settings => {
                if self.is_client {
                    return Ok(true);
                }
                *received_settings = true;

                let settings = StringMap::from_bytes(&data);
                let factory = self.padding.load();
                if settings
                    .get("padding-md5")
                    .is_some_and(|md5| md5 != factory.md5())
                {
                    self.write_frame(Command::UpdatePaddingScheme, 0, factory.raw_scheme())
                        .await?;
                }
                if let Some(v) = settings
                    .get("v")
                    .and_then(|s| s.parse::<u8>().ok())
                    .filter(|&v| v >= PROTOCOL_VERSION)
                {
                    self.peer_version.store(v, Ordering::Relaxed);
                    let mut reply = StringMap::new();
                    reply.insert("v", PROTOCOL_VERSION.to_string());
                    self.write_frame(Command::ServerSettings, 0, &reply.to_bytes())
                        .await?;
                }
            }

            Command::ServerSettings => {
                if !self.is_client {
                    return Ok(true);
                }
                let settings = StringMap::from_bytes(&data);
                if let Some(v) = settings.get("v").and_then(|s| s.parse::<u8>().ok()) {
                    self.peer_version.store(v, Ordering::Relaxed);
                }
            }

            Command::UpdatePaddingScheme => {
                if !self.is_client || self.debug_padding {
                    return Ok(true);
                }
                if self.padding.update_from_raw(&data) {
                    log::info!("padding scheme updated: {}", md5_hex(&data));
                } else {
                    log::warn!("padding scheme update rejected: {}", md5_hex(&data));
                }
            }

            Command::Alert => {
                log::error!("alert from peer: {}", String::from_utf8_lossy(&data));
                return Ok(false);
            }

            Command::HeartRequest => {
                self.write_frame(Command::HeartResponse, sid, &[]).await?;
            }

            Command::HeartResponse => {
                log::trace!("heartbeat response");
            }
        }

        Ok(true)
    }

    pub(crate) async fn write_frame(&self, cmd: Command, sid: u32, data: &[u8]) -> io::Result<()> {
        self.write_frame_inner(cmd, sid, data, false).await
    }

    async fn write_frame_inner(
        &self,
        cmd: Command,
        sid: u32,
        data: &[u8],
        unbuffer_after: bool,
    ) -> io::Result<()> {
        debug_assert!(data.len() <= MAX_FRAME_PAYLOAD);
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "session closed"));
        }

        if let (Some(limiter), Some(recorder)) = (&self.limiter, &self.recorder) {
            limiter.try_limit_send(recorder).await;
        }

        let written = {
            let mut writer = self.writer.lock().await;

            let mut scratch = std::mem::take(&mut writer.scratch);
            scratch.clear();
            scratch.put_u8(cmd as u8);
            scratch.put_u32(sid);
            scratch.put_u16(data.len() as u16);
            scratch.extend_from_slice(data);

            let result = self.write_conn(&mut writer, &scratch).await;
            writer.scratch = scratch;
            if unbuffer_after {
                writer.buffering = false;
            }
            result?
        };

        if let Some(recorder) = &self.recorder {
            if written > 0 {
                recorder.record_send(written as u64);
            }
        }
        Ok(())
    }

    /// Stage, flush, pad, and write under the held writer lock. Returns the
    /// bytes actually handed to the connection, padding included.
    async fn write_conn(&self, writer: &mut WriteState, bytes: &[u8]) -> io::Result<usize> {
        if writer.buffering {
            writer.staging.extend_from_slice(bytes);
            return Ok(0);
        }

        let flushed;
        let mut outgoing: &[u8] = bytes;
        if !writer.staging.is_empty() {
            let mut combined = writer.staging.split();
            combined.extend_from_slice(bytes);
            flushed = combined;
            outgoing = &flushed;
        }

        if writer.send_padding {
            writer.pkt_counter += 1;
            let factory = self.padding.load();
            if writer.pkt_counter < factory.stop() {
                let pkt = writer.pkt_counter;
                return Self::write_padded(&mut writer.conn, outgoing, &factory, pkt).await;
            }
            writer.send_padding = false;
        }

        writer.conn.write_all(outgoing).await?;
        writer.conn.flush().await?;
        Ok(outgoing.len())
    }

    /// Partition `payload` into the scheme's record sizes for packet `pkt`,
    /// inserting `WASTE` frames where real bytes run short (rules of the
    /// padding contract, applied in order per size).
    async fn write_padded(
        conn: &mut (dyn AsyncWrite + Send + Unpin),
        mut payload: &[u8],
        factory: &PaddingFactory,
        pkt: u32,
    ) -> io::Result<usize> {
        let sizes = factory.generate_record_payload_sizes(pkt);
        let mut written = 0usize;

        for size in sizes {
            let remain = payload.len();

            if size == CHECK_MARK {
                if remain == 0 {
                    break;
                }
                continue;
            }
            let size = size as usize;

            if remain > size {
                // All payload; the rest continues in the next record.
                conn.write_all(&payload[..size]).await?;
                written += size;
                payload = &payload[size..];
            } else if remain > 0 {
                // Final payload bytes, topped up with one WASTE frame in
                // the same record.
                let padding_len = size.saturating_sub(remain + FRAME_HEADER_SIZE);
                let mut record = BytesMut::with_capacity(remain + FRAME_HEADER_SIZE + padding_len);
                record.extend_from_slice(payload);
                if padding_len > 0 {
                    record.put_u8(Command::Waste as u8);
                    record.put_u32(0);
                    record.put_u16(padding_len as u16);
                    record.put_bytes(0, padding_len);
                }
                conn.write_all(&record).await?;
                written += record.len();
                payload = &[];
                break;
            } else {
                // Pure padding record.
                let mut record = BytesMut::with_capacity(FRAME_HEADER_SIZE + size);
                record.put_u8(Command::Waste as u8);
                record.put_u32(0);
                record.put_u16(size as u16);
                record.put_bytes(0, size);
                conn.write_all(&record).await?;
                written += record.len();
            }
        }

        // Sizes exhausted with payload left over: write it through unpadded.
        if !payload.is_empty() {
            conn.write_all(payload).await?;
            written += payload.len();
        }

        conn.flush().await?;
        Ok(written)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("is_client", &self.is_client)
            .field("closed", &self.is_closed())
            .field("peer_version", &self.peer_version())
            .field("streams", &self.stream_count())
            .finish()
    }
}
