//! Node addresses carrying auxiliary topology metadata.
//!
//! A [`TopologyAddress`] is the transport-level address of a node plus
//! optional site/rack/machine identifiers consumed by placement logic in
//! the cache layer above. The metadata is informational only: address
//! identity (equality, ordering, hashing) is defined exclusively by the
//! base socket address, so attaching or changing metadata can never
//! perturb membership-set semantics.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut};

/// Static topology metadata describing where a node is physically located.
///
/// All fields are optional; placement logic treats an absent identifier
/// as "unknown" rather than as a distinct location.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyMetadata {
    /// Site (data center) identifier.
    pub site: Option<String>,
    /// Rack identifier within the site.
    pub rack: Option<String>,
    /// Machine identifier within the rack.
    pub machine: Option<String>,
}

impl TopologyMetadata {
    /// Create empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the site identifier.
    pub fn with_site(mut self, site: impl Into<String>) -> Self {
        self.site = Some(site.into());
        self
    }

    /// Set the rack identifier.
    pub fn with_rack(mut self, rack: impl Into<String>) -> Self {
        self.rack = Some(rack.into());
        self
    }

    /// Set the machine identifier.
    pub fn with_machine(mut self, machine: impl Into<String>) -> Self {
        self.machine = Some(machine.into());
        self
    }

    /// Whether no identifier is set at all.
    pub fn is_empty(&self) -> bool {
        self.site.is_none() && self.rack.is_none() && self.machine.is_none()
    }
}

impl fmt::Display for TopologyMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "site={} rack={} machine={}",
            self.site.as_deref().unwrap_or("?"),
            self.rack.as_deref().unwrap_or("?"),
            self.machine.as_deref().unwrap_or("?")
        )
    }
}

/// A node address: base transport address plus optional topology metadata.
///
/// Only the base address participates in `Eq`/`Ord`/`Hash`; two addresses
/// built from the same socket address but different metadata compare equal.
#[derive(Debug, Clone)]
pub struct TopologyAddress {
    addr: SocketAddr,
    topology: Option<TopologyMetadata>,
}

impl TopologyAddress {
    /// Create an address without topology metadata.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            topology: None,
        }
    }

    /// Attach topology metadata to the address.
    pub fn with_topology(mut self, topology: TopologyMetadata) -> Self {
        self.topology = Some(topology);
        self
    }

    /// The base socket address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The topology metadata, if any.
    pub fn topology(&self) -> Option<&TopologyMetadata> {
        self.topology.as_ref()
    }

    /// Wire size of an encoded address.
    pub(crate) fn encoded_len(&self) -> usize {
        match self.addr.ip() {
            IpAddr::V4(_) => 1 + 4 + 2,
            IpAddr::V6(_) => 1 + 16 + 2,
        }
    }

    /// Encode the base address.
    ///
    /// Metadata is deliberately not carried on the wire: it is attached
    /// locally by each node's address generator and never needed by peers
    /// for routing.
    pub(crate) fn encode(&self, buf: &mut impl BufMut) {
        match self.addr.ip() {
            IpAddr::V4(ip) => {
                buf.put_u8(4);
                buf.put_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                buf.put_u8(6);
                buf.put_slice(&ip.octets());
            }
        }
        buf.put_u16(self.addr.port());
    }

    /// Decode a base address.
    pub(crate) fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 1 {
            return None;
        }
        let ip = match buf.get_u8() {
            4 => {
                if buf.remaining() < 4 {
                    return None;
                }
                let mut octets = [0u8; 4];
                buf.copy_to_slice(&mut octets);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            6 => {
                if buf.remaining() < 16 {
                    return None;
                }
                let mut octets = [0u8; 16];
                buf.copy_to_slice(&mut octets);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            _ => return None,
        };
        if buf.remaining() < 2 {
            return None;
        }
        let port = buf.get_u16();
        Some(Self::new(SocketAddr::new(ip, port)))
    }
}

impl PartialEq for TopologyAddress {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl Eq for TopologyAddress {}

impl PartialOrd for TopologyAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TopologyAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.addr.cmp(&other.addr)
    }
}

impl Hash for TopologyAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
    }
}

impl fmt::Display for TopologyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.topology {
            Some(topology) => write!(f, "{} ({})", self.addr, topology),
            None => write!(f, "{}", self.addr),
        }
    }
}

impl From<SocketAddr> for TopologyAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr)
    }
}

/// Produces the node's self-address, augmenting the transport's bind
/// address with the statically configured topology metadata.
#[derive(Debug, Clone, Default)]
pub struct TopologyAddressGenerator {
    topology: Option<TopologyMetadata>,
}

impl TopologyAddressGenerator {
    /// Create a generator attaching the given metadata.
    pub fn new(topology: Option<TopologyMetadata>) -> Self {
        Self { topology }
    }

    /// Generate the composite address for a base transport address.
    pub fn generate(&self, base: SocketAddr) -> TopologyAddress {
        match &self.topology {
            Some(topology) => TopologyAddress::new(base).with_topology(topology.clone()),
            None => TopologyAddress::new(base),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(addr: &TopologyAddress) -> u64 {
        let mut hasher = DefaultHasher::new();
        addr.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn metadata_does_not_affect_identity() {
        let base: SocketAddr = "10.0.0.1:7600".parse().unwrap();
        let plain = TopologyAddress::new(base);
        let tagged = TopologyAddress::new(base)
            .with_topology(TopologyMetadata::new().with_site("dc1").with_rack("r2"));
        let other_tag =
            TopologyAddress::new(base).with_topology(TopologyMetadata::new().with_site("dc2"));

        assert_eq!(plain, tagged);
        assert_eq!(tagged, other_tag);
        assert_eq!(hash_of(&tagged), hash_of(&other_tag));
        assert_eq!(tagged.cmp(&plain), Ordering::Equal);
    }

    #[test]
    fn different_base_addresses_differ() {
        let a = TopologyAddress::new("10.0.0.1:7600".parse().unwrap());
        let b = TopologyAddress::new("10.0.0.2:7600".parse().unwrap());
        assert_ne!(a, b);
    }

    #[test]
    fn generator_attaches_configured_metadata() {
        let generator = TopologyAddressGenerator::new(Some(
            TopologyMetadata::new().with_site("dc1").with_machine("m7"),
        ));
        let addr = generator.generate("127.0.0.1:0".parse().unwrap());
        let topology = addr.topology().unwrap();
        assert_eq!(topology.site.as_deref(), Some("dc1"));
        assert_eq!(topology.machine.as_deref(), Some("m7"));
        assert_eq!(topology.rack, None);
    }

    #[test]
    fn address_codec_preserves_base() {
        for raw in ["192.168.1.10:9000", "[2001:db8::1]:7600"] {
            let addr = TopologyAddress::new(raw.parse().unwrap());
            let mut buf = bytes::BytesMut::new();
            addr.encode(&mut buf);
            assert_eq!(buf.len(), addr.encoded_len());
            let decoded = TopologyAddress::decode(&mut buf.freeze()).unwrap();
            assert_eq!(decoded.addr(), addr.addr());
        }
    }
}
