use std::cmp::Ordering;
use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::TransportError;

/// The kind of cluster entity on the other end of a session. Policies and
/// protocol versions are keyed by this.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum EntityType {
    Monitor = 1,
    ObjectServer = 2,
    MetadataServer = 3,
    Client = 4,
}

/// `(type, id)` naming an entity independent of its network location.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct EntityName {
    pub entity_type: EntityType,
    pub id: u64,
}
impl Debug for EntityName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let t = match self.entity_type {
            EntityType::Monitor => "mon",
            EntityType::ObjectServer => "osd",
            EntityType::MetadataServer => "mds",
            EntityType::Client => "client",
        };
        write!(f, "{}.{}", t, self.id)
    }
}
impl EntityName {
    pub fn new(entity_type: EntityType, id: u64) -> EntityName {
        EntityName { entity_type, id }
    }

    pub const SERIALIZED_LEN: usize = 1 + 8;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(u32::from(self.entity_type) as u8);
        buf.put_u64_le(self.id);
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<EntityName, TransportError> {
        let raw_type = buf.try_get_u8()? as u32;
        let entity_type = EntityType::try_from(raw_type)
            .map_err(|_| TransportError::Decode(format!("invalid entity type {}", raw_type)))?;
        let id = buf.try_get_u64_le()?;
        Ok(EntityName { entity_type, id })
    }
}

/// A network endpoint plus a `nonce` distinguishing successive incarnations of
/// a process that reuses the same address. Two endpoints are the same peer only
/// if family, ip, port *and* nonce all match; the ordering below breaks
/// connection-race ties.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct EntityAddr {
    pub addr: SocketAddr,
    pub nonce: u32,
}
impl Debug for EntityAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.nonce)
    }
}
impl Hash for EntityAddr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self.addr {
            SocketAddr::V4(s) => s.ip().to_bits().hash(state),
            SocketAddr::V6(s) => s.ip().to_bits().hash(state),
        }
        self.addr.port().hash(state);
        self.nonce.hash(state);
    }
}
impl Ord for EntityAddr {
    fn cmp(&self, other: &Self) -> Ordering {
        self.family()
            .cmp(&other.family())
            .then_with(|| match (&self.addr, &other.addr) {
                (SocketAddr::V4(a), SocketAddr::V4(b)) => a.ip().cmp(b.ip()),
                (SocketAddr::V6(a), SocketAddr::V6(b)) => a.ip().cmp(b.ip()),
                _ => Ordering::Equal, // families differ, already decided above
            })
            .then_with(|| self.addr.port().cmp(&other.addr.port()))
            .then_with(|| self.nonce.cmp(&other.nonce))
    }
}
impl PartialOrd for EntityAddr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

const FAMILY_V4: u16 = 2;
const FAMILY_V6: u16 = 10;

impl EntityAddr {
    /// Fixed-size wire form: family:u16, port:u16, 16 ip bytes (v4 uses the
    /// first four, rest zero), nonce:u32. All little-endian.
    pub const SERIALIZED_LEN: usize = 2 + 2 + 16 + 4;

    pub fn new(addr: SocketAddr, nonce: u32) -> EntityAddr {
        EntityAddr { addr, nonce }
    }

    /// The `0.0.0.0:0` address an unbound client starts out with.
    pub fn blank() -> EntityAddr {
        EntityAddr {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            nonce: 0,
        }
    }

    pub fn family(&self) -> u16 {
        match self.addr {
            SocketAddr::V4(_) => FAMILY_V4,
            SocketAddr::V6(_) => FAMILY_V6,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn set_port(&mut self, port: u16) {
        self.addr.set_port(port);
    }

    pub fn is_blank_ip(&self) -> bool {
        match self.addr {
            SocketAddr::V4(s) => s.ip().is_unspecified(),
            SocketAddr::V6(s) => s.ip().is_unspecified(),
        }
    }

    /// Adopt another address' IP while keeping our port and nonce. Used both
    /// ways: an acceptor fills in a peer's blank IP from the socket, and a
    /// connector learns its own IP from the peer's echo.
    pub fn set_ip_from(&mut self, other: &EntityAddr) {
        let port = self.addr.port();
        self.addr = SocketAddr::new(other.addr.ip(), port);
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.family());
        buf.put_u16_le(self.addr.port());
        match self.addr {
            SocketAddr::V4(s) => {
                buf.put_slice(&s.ip().octets());
                buf.put_bytes(0, 12);
            }
            SocketAddr::V6(s) => {
                buf.put_slice(&s.ip().octets());
            }
        }
        buf.put_u32_le(self.nonce);
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<EntityAddr, TransportError> {
        let family = buf.try_get_u16_le()?;
        let port = buf.try_get_u16_le()?;
        let mut ip = [0u8; 16];
        if buf.remaining() < 16 {
            return Err(TransportError::Decode("short address".to_string()));
        }
        buf.copy_to_slice(&mut ip);
        let nonce = buf.try_get_u32_le()?;

        let addr = match family {
            FAMILY_V4 => {
                let octets: [u8; 4] = ip[..4].try_into().expect("slice of fixed length");
                SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port)
            }
            FAMILY_V6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port),
            n => {
                return Err(TransportError::Decode(format!("invalid address family {}", n)));
            }
        };
        Ok(EntityAddr { addr, nonce })
    }
}

/// Name plus address: everything needed to open a session to a peer.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct EntityInst {
    pub name: EntityName,
    pub addr: EntityAddr,
}
impl EntityInst {
    pub fn new(name: EntityName, addr: EntityAddr) -> EntityInst {
        EntityInst { name, addr }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;
    use std::str::FromStr;

    fn ea(addr: &str, nonce: u32) -> EntityAddr {
        EntityAddr::new(SocketAddr::from_str(addr).unwrap(), nonce)
    }

    #[rstest]
    #[case::v4(ea("1.2.3.4:6789", 7))]
    #[case::v4_blank(ea("0.0.0.0:0", 0))]
    #[case::v6(ea("[1111:2222::3333:4444]:888", 99))]
    fn test_addr_roundtrip(#[case] addr: EntityAddr) {
        let mut buf = BytesMut::new();
        addr.ser(&mut buf);
        assert_eq!(buf.len(), EntityAddr::SERIALIZED_LEN);
        let mut b: &[u8] = buf.as_ref();
        let deser = EntityAddr::try_deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(addr, deser);
    }

    #[rstest]
    #[case::literal_v4(ea("1.2.3.4:888", 9), vec![2,0, 0x78,3, 1,2,3,4, 0,0,0,0,0,0,0,0,0,0,0,0, 9,0,0,0])]
    fn test_addr_literal(#[case] addr: EntityAddr, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        addr.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
    }

    #[rstest]
    #[case::ip(ea("10.0.0.1:1", 1), ea("10.0.0.2:1", 1), Ordering::Less)]
    #[case::port(ea("10.0.0.1:2", 1), ea("10.0.0.1:1", 1), Ordering::Greater)]
    #[case::nonce_tiebreak(ea("10.0.0.1:1", 1), ea("10.0.0.1:1", 2), Ordering::Less)]
    #[case::family(ea("255.0.0.1:1", 1), ea("[::1]:1", 1), Ordering::Less)]
    #[case::equal(ea("10.0.0.1:1", 1), ea("10.0.0.1:1", 1), Ordering::Equal)]
    fn test_addr_ordering(#[case] a: EntityAddr, #[case] b: EntityAddr, #[case] expected: Ordering) {
        assert_eq!(a.cmp(&b), expected);
    }

    #[rstest]
    #[case::blank_v4("0.0.0.0:123", true)]
    #[case::blank_v6("[::]:123", true)]
    #[case::concrete("1.2.3.4:123", false)]
    fn test_blank_ip(#[case] addr: &str, #[case] expected: bool) {
        assert_eq!(ea(addr, 0).is_blank_ip(), expected);
    }

    #[rstest]
    #[case::v4(EntityName::new(EntityType::ObjectServer, 42))]
    #[case::client(EntityName::new(EntityType::Client, u64::MAX))]
    fn test_name_roundtrip(#[case] name: EntityName) {
        let mut buf = BytesMut::new();
        name.ser(&mut buf);
        assert_eq!(buf.len(), EntityName::SERIALIZED_LEN);
        let mut b: &[u8] = buf.as_ref();
        assert_eq!(EntityName::try_deser(&mut b).unwrap(), name);
        assert!(b.is_empty());
    }

    #[test]
    fn test_set_ip_from_keeps_port_and_nonce() {
        let mut blank = ea("0.0.0.0:6789", 7);
        blank.set_ip_from(&ea("9.8.7.6:1234", 1));
        assert_eq!(blank, ea("9.8.7.6:6789", 7));
    }
}
