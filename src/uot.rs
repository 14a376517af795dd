//! UDP-over-TCP hand-off.
//!
//! UDP is not transported here. A destination whose text contains the magic
//! suffix marks the stream as a UoT carrier; the connection handler routes
//! it to an external helper behind [`UotHandler`]. Without one, such
//! streams are refused.

use crate::address::Location;
use crate::session::Stream;
use async_trait::async_trait;
use std::io;

/// Sentinel substring in a destination that selects the UoT path.
pub const UOT_MAGIC_SUFFIX: &str = "udp-over-tcp.arpa";

pub fn is_uot_destination(destination: &Location) -> bool {
    destination.to_string().contains(UOT_MAGIC_SUFFIX)
}

/// External UDP-over-TCP relay.
#[async_trait]
pub trait UotHandler: Send + Sync {
    async fn relay(&self, stream: Stream, destination: Location) -> io::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;

    #[test]
    fn magic_destinations_are_detected() {
        let uot = Location::new(
            Address::from("sp.v2.udp-over-tcp.arpa").unwrap(),
            0,
        );
        assert!(is_uot_destination(&uot));

        let plain = Location::new(Address::from("example.com").unwrap(), 443);
        assert!(!is_uot_destination(&plain));
    }
}
