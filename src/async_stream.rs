use tokio::io::{AsyncRead, AsyncWrite};

/// Object-safe alias for the byte streams this crate splices: TLS
/// connections, outbound TCP sockets, and multiplexed [`crate::Stream`]s.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}
