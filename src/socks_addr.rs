//! SOCKS-style destination records.
//!
//! Each new stream begins with one of these records: an address-type byte
//! (IPv4 / domain / IPv6), the address bytes, and a big-endian port. Both
//! the server and the redirector read it off a freshly opened stream; the
//! redirector also writes it onto the pooled downstream stream.

use crate::address::{Address, Location};
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const ADDR_TYPE_IPV4: u8 = 1;
const ADDR_TYPE_DOMAIN_NAME: u8 = 3;
const ADDR_TYPE_IPV6: u8 = 4;

/// Read a destination record from the start of a stream.
pub async fn read_location<S>(stream: &mut S) -> std::io::Result<Location>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let address_type = stream.read_u8().await?;
    match address_type {
        ADDR_TYPE_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            Ok(Location::new(Address::Ipv4(Ipv4Addr::from(octets)), port))
        }
        ADDR_TYPE_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            Ok(Location::new(Address::Ipv6(Ipv6Addr::from(octets)), port))
        }
        ADDR_TYPE_DOMAIN_NAME => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            let port = stream.read_u16().await?;
            let name = std::str::from_utf8(&name).map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("failed to decode address: {}", e),
                )
            })?;
            // Some clients put literal IPs in the domain slot, so parse
            // rather than assuming a hostname.
            Ok(Location::new(Address::from(name)?, port))
        }
        other => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("unknown address type: {}", other),
        )),
    }
}

/// Write a destination record. Encoded into one buffer so the transport
/// sees a single write.
pub async fn write_location<S>(stream: &mut S, location: &Location) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    stream.write_all(&encode_location(location)).await
}

pub fn encode_location(location: &Location) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32);
    match location.address() {
        Address::Ipv4(addr) => {
            buf.push(ADDR_TYPE_IPV4);
            buf.extend_from_slice(&addr.octets());
        }
        Address::Ipv6(addr) => {
            buf.push(ADDR_TYPE_IPV6);
            buf.extend_from_slice(&addr.octets());
        }
        Address::Hostname(name) => {
            buf.push(ADDR_TYPE_DOMAIN_NAME);
            buf.push(name.len() as u8);
            buf.extend_from_slice(name.as_bytes());
        }
    }
    buf.extend_from_slice(&location.port().to_be_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(location: Location) -> Location {
        let encoded = encode_location(&location);
        read_location(&mut &encoded[..]).await.unwrap()
    }

    #[tokio::test]
    async fn ipv4_roundtrip() {
        let loc = Location::new(Address::from("192.168.1.1").unwrap(), 8080);
        assert_eq!(roundtrip(loc.clone()).await, loc);
    }

    #[tokio::test]
    async fn ipv6_roundtrip() {
        let loc = Location::new(Address::from("2001:db8::1").unwrap(), 443);
        assert_eq!(roundtrip(loc.clone()).await, loc);
    }

    #[tokio::test]
    async fn domain_roundtrip() {
        let loc = Location::new(Address::from("example.com").unwrap(), 80);
        assert_eq!(roundtrip(loc.clone()).await, loc);
    }

    #[tokio::test]
    async fn rejects_unknown_address_type() {
        let bytes = [9u8, 0, 0];
        let err = read_location(&mut &bytes[..]).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn literal_ip_in_domain_slot() {
        let mut encoded = vec![ADDR_TYPE_DOMAIN_NAME, 7];
        encoded.extend_from_slice(b"8.8.8.8");
        encoded.extend_from_slice(&53u16.to_be_bytes());
        let loc = read_location(&mut &encoded[..]).await.unwrap();
        assert!(matches!(loc.address(), Address::Ipv4(_)));
        assert_eq!(loc.port(), 53);
    }
}
