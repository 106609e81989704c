//! Network addresses, normalized.
//!
//! Every address is carried as an IPv6 value; IPv4 peers ride in the
//! v4-mapped range (`::ffff:a.b.c.d`). Normalizing at the edges means one
//! address only ever has one byte representation, which matters because
//! connection identity is the hash of the normalized host and port.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use std::str::FromStr;

use crate::codec::{CodecError, Reader, Serializable, Writer};
use crate::crypto::hash::sha3;
use crate::crypto::types::Hash;
use crate::network::NetworkError;

/// A normalized peer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct IpAddress(Ipv6Addr);

impl IpAddress {
    pub const UNSPECIFIED: IpAddress = IpAddress(Ipv6Addr::UNSPECIFIED);

    pub fn from_ip(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Self(v4.to_ipv6_mapped()),
            IpAddr::V6(v6) => Self(v6),
        }
    }

    pub fn is_v4(&self) -> bool {
        self.0.to_ipv4_mapped().is_some()
    }

    pub fn octets(&self) -> [u8; 16] {
        self.0.octets()
    }
}

impl Default for IpAddress {
    fn default() -> Self {
        Self::UNSPECIFIED
    }
}

impl FromStr for IpAddress {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ip: IpAddr = s
            .parse()
            .map_err(|_| NetworkError::InvalidAddress(s.to_string()))?;

        Ok(Self::from_ip(ip))
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Mapped v4 addresses print as plain dotted quads.
        match self.0.to_ipv4_mapped() {
            Some(v4) => v4.fmt(f),
            None => self.0.fmt(f),
        }
    }
}

impl Serializable for IpAddress {
    fn write(&self, writer: &mut Writer) {
        writer.bytes(&self.0.octets());

        // Reserved flag bits travel with every address.
        writer.varint(0);
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let octets = reader.key::<16>()?;

        let _flags = reader.varint()?;

        Ok(Self(Ipv6Addr::from(octets)))
    }
}

/// Normalizes a host (optionally carrying a `scheme://` prefix or a
/// trailing `:port`) into its canonical string, the effective port, and
/// the connection identity `sha3(host ‖ varint(port))`.
///
/// An explicit `port` argument wins over a port embedded in the host
/// string; `default_port` fills the gap when neither is present.
pub fn normalize_host_port(
    host: &str,
    port: Option<u16>,
    default_port: u16,
) -> Result<(String, u16, Hash), NetworkError> {
    let mut host = host.trim();

    // The transport layer likes to prefix endpoints with `tcp://`.
    if let Some(position) = host.find("//") {
        host = &host[position + 2..];
    }

    let mut embedded_port = None;

    // `[v6]:port`, `v4:port` or `host:port` — but a bare v6 address also
    // contains colons, so only a parseable trailing number counts.
    if let Some(stripped) = host.strip_prefix('[') {
        if let Some((inner, rest)) = stripped.split_once(']') {
            if let Some(p) = rest.strip_prefix(':') {
                embedded_port = p.parse::<u16>().ok();
            }

            host = inner;
        }
    } else if let Some((head, tail)) = host.rsplit_once(':') {
        if !head.contains(':') {
            if let Ok(p) = tail.parse::<u16>() {
                embedded_port = Some(p);

                host = head;
            }
        }
    }

    let port = port.or(embedded_port).unwrap_or(default_port);

    // Addresses normalize through the v6 parser; anything unparseable is
    // treated as a DNS name and passed through lowercased.
    let canonical = match host.parse::<IpAddress>() {
        Ok(address) => address.to_string(),
        Err(_) if !host.is_empty() => host.to_ascii_lowercase(),
        Err(e) => return Err(e),
    };

    let mut writer = Writer::new();

    writer.bytes(canonical.as_bytes());

    writer.varint(u64::from(port));

    Ok((canonical, port, sha3(writer.data())))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
