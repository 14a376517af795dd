//! The stream-multiplexing session layer.

mod pool;
#[allow(clippy::module_inception)]
mod session;
mod stream;

pub use pool::{PoolConfig, SessionDialer, SessionPool};
pub use session::{Session, StreamHandler};
pub use stream::Stream;
