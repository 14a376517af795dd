use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

/// A destination host: literal IP or hostname.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Hostname(String),
}

impl Address {
    pub fn from(s: &str) -> std::io::Result<Self> {
        if let Ok(addr) = s.parse::<Ipv4Addr>() {
            return Ok(Address::Ipv4(addr));
        }
        if let Ok(addr) = s.parse::<Ipv6Addr>() {
            return Ok(Address::Ipv6(addr));
        }
        if s.is_empty() || s.bytes().any(|c| c.is_ascii_control() || c == b' ') {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("failed to parse address: {}", s),
            ));
        }
        Ok(Address::Hostname(s.to_string()))
    }

    pub fn hostname(&self) -> Option<&str> {
        match self {
            Address::Hostname(hostname) => Some(hostname),
            _ => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(addr) => addr.fmt(f),
            Address::Ipv6(addr) => addr.fmt(f),
            Address::Hostname(hostname) => hostname.fmt(f),
        }
    }
}

/// A destination endpoint: address plus port.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Location {
    address: Address,
    port: u16,
}

impl Location {
    pub fn new(address: Address, port: u16) -> Self {
        Self { address, port }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolve to a socket address, using the system resolver for hostnames.
    pub fn to_socket_addr(&self) -> std::io::Result<SocketAddr> {
        match self.address {
            Address::Ipv4(addr) => Ok(SocketAddr::new(IpAddr::V4(addr), self.port)),
            Address::Ipv6(addr) => Ok(SocketAddr::new(IpAddr::V6(addr), self.port)),
            Address::Hostname(ref d) => format!("{}:{}", d, self.port)
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::NotFound, "hostname lookup failed")
                }),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.address {
            Address::Ipv6(addr) => write!(f, "[{}]:{}", addr, self.port),
            other => write!(f, "{}:{}", other, self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4() {
        assert_eq!(
            Address::from("10.0.0.1").unwrap(),
            Address::Ipv4(Ipv4Addr::new(10, 0, 0, 1))
        );
    }

    #[test]
    fn parses_ipv6() {
        assert!(matches!(Address::from("::1").unwrap(), Address::Ipv6(_)));
    }

    #[test]
    fn parses_hostname() {
        assert_eq!(
            Address::from("example.com").unwrap(),
            Address::Hostname("example.com".to_string())
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(Address::from("").is_err());
        assert!(Address::from("has space").is_err());
    }

    #[test]
    fn location_display() {
        let v6 = Location::new(Address::from("::1").unwrap(), 443);
        assert_eq!(v6.to_string(), "[::1]:443");
        let host = Location::new(Address::from("example.com").unwrap(), 80);
        assert_eq!(host.to_string(), "example.com:80");
    }
}
