// src/transport/address.rs

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use super::ChannelError;

const SCHEME: &str = "tcp://";

/// Address of a backend channel, e.g. `tcp://127.0.0.1:40123`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelAddress {
    host: String,
    port: u16,
}

impl ChannelAddress {
    pub fn parse(raw: &str) -> Result<Self, ChannelError> {
        let malformed = || ChannelError::MalformedAddress(raw.to_string());

        let rest = raw.trim().strip_prefix(SCHEME).ok_or_else(malformed)?;
        let (host, port) = rest.rsplit_once(':').ok_or_else(malformed)?;

        if host.is_empty() || host.contains('/') {
            return Err(malformed());
        }
        let port: u16 = port.parse().map_err(|_| malformed())?;
        if port == 0 {
            return Err(malformed());
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        let host = match addr {
            SocketAddr::V4(v4) => v4.ip().to_string(),
            SocketAddr::V6(v6) => format!("[{}]", v6.ip()),
        };
        Self {
            host,
            port: addr.port(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, suitable for `TcpStream::connect`.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}{}:{}", self.host, self.port)
    }
}

impl FromStr for ChannelAddress {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_address() {
        let addr = ChannelAddress::parse("tcp://127.0.0.1:4100").unwrap();
        assert_eq!(addr.host(), "127.0.0.1");
        assert_eq!(addr.port(), 4100);
        assert_eq!(addr.authority(), "127.0.0.1:4100");
    }

    #[test]
    fn bracketed_ipv6_host_is_kept_intact() {
        let addr = ChannelAddress::parse("tcp://[::1]:9000").unwrap();
        assert_eq!(addr.host(), "[::1]");
        assert_eq!(addr.to_string(), "tcp://[::1]:9000");
    }

    #[test]
    fn rejects_other_schemes_and_bad_ports() {
        for raw in [
            "udp://127.0.0.1:80",
            "127.0.0.1:80",
            "tcp://127.0.0.1",
            "tcp://:80",
            "tcp://host:0",
            "tcp://host:99999",
            "tcp://host/path:80",
        ] {
            match ChannelAddress::parse(raw) {
                Err(ChannelError::MalformedAddress(echo)) => assert_eq!(echo, raw),
                other => panic!("expected MalformedAddress for {raw}, got {other:?}"),
            }
        }
    }

    #[test]
    fn socket_addr_formats_like_the_handshake_line() {
        let sock: SocketAddr = "127.0.0.1:5555".parse().unwrap();
        let addr = ChannelAddress::from_socket_addr(sock);
        assert_eq!(addr.to_string(), "tcp://127.0.0.1:5555");
        assert_eq!(ChannelAddress::parse(&addr.to_string()).unwrap(), addr);
    }
}
