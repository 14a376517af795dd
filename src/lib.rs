//! anytls - an obfuscated TLS-tunnelled multiplexing proxy.
//!
//! A client authenticates over TLS with a shared secret and multiplexes
//! many logical byte streams over the single connection; each stream
//! carries a destination record and is spliced to an outbound dial. Record
//! sizes on the wire are disguised by a hot-swappable padding scheme, and
//! per-peer traffic is accounted and coarsely rate-limited.
//!
//! The crate ships two binaries: `anytls-server` (terminates streams with
//! direct outbound dials) and `anytls-redirect` (forwards streams over a
//! pooled session to a downstream server, same inbound protocol).

pub mod address;
pub mod async_stream;
pub mod frame;
pub mod padding;
pub mod rate;
pub mod redirect;
pub mod server;
pub mod session;
pub mod socks_addr;
pub mod tls;
pub mod uot;

pub use address::{Address, Location};
pub use padding::{PaddingCell, PaddingFactory};
pub use session::{Session, SessionPool, Stream, StreamHandler};
