//! One logical byte channel inside a session.
//!
//! Inbound bytes arrive through a bounded event pipe fed by the session's
//! recv loop. Outbound bytes are handed to the session's writer task, which
//! frames them as `PSH`; an empty payload is the FIN signal. `poll_shutdown`
//! waits for channel capacity so the FIN is queued after all pending data,
//! never silently dropped.

use crate::frame::MAX_FRAME_PAYLOAD;
use bytes::Bytes;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

/// Bound of the per-stream inbound pipe and the session's outgoing queue,
/// in messages (each up to one frame payload).
pub(crate) const STREAM_CHANNEL_BUFFER: usize = 16;

/// What the session delivers into a stream's inbound pipe.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Data(Bytes),
    /// Peer closed the stream.
    Eof,
    /// Stream-level failure (non-empty SYNACK); surfaced on the next read.
    Error(String),
}

#[derive(Debug)]
pub struct Stream {
    id: u32,

    events: mpsc::Receiver<StreamEvent>,
    read_buffer: Vec<u8>,
    eof: bool,
    /// Error delivered by the session, returned on every subsequent read.
    failed: Option<String>,

    data_tx: PollSender<(u32, Bytes)>,
    session_closed: Arc<AtomicBool>,
    stream_closed: bool,
    shutdown_in_progress: bool,

    /// Keeps a client session alive for as long as the stream exists.
    _session_keepalive: Option<Arc<dyn std::any::Any + Send + Sync>>,
}

impl Stream {
    pub(crate) fn new(
        id: u32,
        events: mpsc::Receiver<StreamEvent>,
        data_tx: mpsc::Sender<(u32, Bytes)>,
        session_closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            events,
            read_buffer: Vec::new(),
            eof: false,
            failed: None,
            data_tx: PollSender::new(data_tx),
            session_closed,
            stream_closed: false,
            shutdown_in_progress: false,
            _session_keepalive: None,
        }
    }

    pub(crate) fn with_keepalive<S: Send + Sync + 'static>(
        id: u32,
        events: mpsc::Receiver<StreamEvent>,
        data_tx: mpsc::Sender<(u32, Bytes)>,
        session_closed: Arc<AtomicBool>,
        session: Arc<S>,
    ) -> Self {
        let mut stream = Self::new(id, events, data_tx, session_closed);
        stream._session_keepalive = Some(session);
        stream
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    fn failed_error(msg: &str) -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionReset, format!("remote: {}", msg))
    }

    /// Best-effort FIN for the drop path, where blocking is not an option.
    fn send_fin_best_effort(&mut self) {
        if let Some(sender) = self.data_tx.get_ref() {
            let _ = sender.try_send((self.id, Bytes::new()));
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(msg) = &self.failed {
            return Poll::Ready(Err(Self::failed_error(msg)));
        }

        if !self.read_buffer.is_empty() {
            let n = std::cmp::min(self.read_buffer.len(), buf.remaining());
            buf.put_slice(&self.read_buffer[..n]);
            self.read_buffer.drain(..n);
            return Poll::Ready(Ok(()));
        }

        if self.eof {
            return Poll::Ready(Ok(()));
        }

        match Pin::new(&mut self.events).poll_recv(cx) {
            Poll::Ready(Some(StreamEvent::Data(data))) => {
                let n = std::cmp::min(data.len(), buf.remaining());
                buf.put_slice(&data[..n]);
                if n < data.len() {
                    self.read_buffer.extend_from_slice(&data[n..]);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Some(StreamEvent::Error(msg))) => {
                let err = Self::failed_error(&msg);
                self.failed = Some(msg);
                Poll::Ready(Err(err))
            }
            Poll::Ready(Some(StreamEvent::Eof)) | Poll::Ready(None) => {
                self.eof = true;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.stream_closed || self.shutdown_in_progress {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream closed",
            )));
        }
        if self.session_closed.load(Ordering::Relaxed) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "session closed",
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        match self.data_tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                // A frame length field is 2 bytes; larger writes continue on
                // the caller's next call.
                let n = std::cmp::min(buf.len(), MAX_FRAME_PAYLOAD);
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                let id = self.id;
                match self.data_tx.send_item((id, chunk)) {
                    Ok(()) => Poll::Ready(Ok(n)),
                    Err(_) => Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "session writer gone",
                    ))),
                }
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "session writer gone",
            ))),
            // Queue full: backpressure.
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are flushed by the session writer task.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.stream_closed {
            return Poll::Ready(Ok(()));
        }
        if self.session_closed.load(Ordering::Relaxed) {
            self.stream_closed = true;
            return Poll::Ready(Ok(()));
        }

        self.shutdown_in_progress = true;

        match self.data_tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let id = self.id;
                let result = self.data_tx.send_item((id, Bytes::new()));
                self.stream_closed = true;
                match result {
                    Ok(()) => Poll::Ready(Ok(())),
                    Err(_) => Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "session writer gone",
                    ))),
                }
            }
            Poll::Ready(Err(_)) => {
                self.stream_closed = true;
                Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "session writer gone",
                )))
            }
            // FIN queues behind pending data.
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if !self.stream_closed {
            self.stream_closed = true;
            self.send_fin_best_effort();
        }
    }
}
