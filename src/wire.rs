//! The handshake half of the wire protocol: banner, tag bytes, feature bits,
//! and the connect / connect_reply records exchanged until a session reaches
//! `READY`. The per-message envelope lives in [`crate::message`].

use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::entity::EntityType;
use crate::error::TransportError;

/// Sent first by each side, verbatim. A peer that opens with anything else is
/// not speaking this protocol.
pub const BANNER: &[u8] = b"msgr v010";

/// Feature bits negotiated during the handshake.
pub mod features {
    /// Message headers omit the sender address.
    pub const NOSRCADDR: u64 = 1 << 1;
    /// Reconnects exchange `in_seq` values so the sender can prune its
    /// retransmit queue before replaying.
    pub const RECONNECT_SEQ: u64 = 1 << 6;

    pub const SUPPORTED_DEFAULT: u64 = NOSRCADDR | RECONNECT_SEQ;
}

/// Single-byte frame and reply tags.
#[derive(Clone, Copy, Eq, PartialEq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Tag {
    Ready = 1,
    ResetSession = 2,
    Wait = 3,
    RetrySession = 4,
    RetryGlobal = 5,
    Close = 6,
    Msg = 7,
    Ack = 8,
    Keepalive = 9,
    BadProtoVer = 10,
    BadAuthorizer = 11,
    Features = 12,
    Seq = 13,
}

/// `flags` bit in connect / connect_reply: the sender declares (connect) or
/// the server decides (reply) that the channel is lossy.
pub const CONNECT_LOSSY: u8 = 1;

// Internal cluster protocols, one per entity type talking to its own kind,
// and the public protocols clients speak to each.
const MON_PROTOCOL: u32 = 15;
const OSD_PROTOCOL: u32 = 24;
const MDS_PROTOCOL: u32 = 32;
const MONC_PROTOCOL: u32 = 15;
const OSDC_PROTOCOL: u32 = 24;
const MDSC_PROTOCOL: u32 = 32;

/// Protocol version for a `(my_type, peer_type, direction)` triple. Entities of
/// the same type speak their internal protocol; everything else speaks the
/// public protocol of whichever side is the server. Returns 0 for pairs with
/// no defined protocol (e.g. client-to-client), which never matches.
pub fn proto_version(my_type: EntityType, peer_type: EntityType, connect: bool) -> u32 {
    use EntityType::*;
    if my_type == peer_type {
        return match my_type {
            Monitor => MON_PROTOCOL,
            ObjectServer => OSD_PROTOCOL,
            MetadataServer => MDS_PROTOCOL,
            Client => 0,
        };
    }
    let server_type = if connect { peer_type } else { my_type };
    match server_type {
        Monitor => MONC_PROTOCOL,
        ObjectServer => OSDC_PROTOCOL,
        MetadataServer => MDSC_PROTOCOL,
        Client => 0,
    }
}

/// The record a connector sends, possibly several times, after the banner and
/// address exchange. Followed on the wire by `authorizer_len` opaque bytes.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ConnectRecord {
    pub features: u64,
    pub host_type: u32,
    pub global_seq: u32,
    pub connect_seq: u32,
    pub protocol_version: u32,
    pub authorizer_protocol: u32,
    pub authorizer_len: u32,
    pub flags: u8,
}
impl ConnectRecord {
    pub const SERIALIZED_LEN: usize = 8 + 4 + 4 + 4 + 4 + 4 + 4 + 1;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.features);
        buf.put_u32_le(self.host_type);
        buf.put_u32_le(self.global_seq);
        buf.put_u32_le(self.connect_seq);
        buf.put_u32_le(self.protocol_version);
        buf.put_u32_le(self.authorizer_protocol);
        buf.put_u32_le(self.authorizer_len);
        buf.put_u8(self.flags);
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<ConnectRecord, TransportError> {
        Ok(ConnectRecord {
            features: buf.try_get_u64_le()?,
            host_type: buf.try_get_u32_le()?,
            global_seq: buf.try_get_u32_le()?,
            connect_seq: buf.try_get_u32_le()?,
            protocol_version: buf.try_get_u32_le()?,
            authorizer_protocol: buf.try_get_u32_le()?,
            authorizer_len: buf.try_get_u32_le()?,
            flags: buf.try_get_u8()?,
        })
    }
}

/// The acceptor's answer to a [`ConnectRecord`]. Followed on the wire by
/// `authorizer_len` opaque reply bytes.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ConnectReply {
    pub tag: Tag,
    pub features: u64,
    pub global_seq: u32,
    pub connect_seq: u32,
    pub protocol_version: u32,
    pub authorizer_len: u32,
    pub flags: u8,
}
impl ConnectReply {
    pub const SERIALIZED_LEN: usize = 1 + 8 + 4 + 4 + 4 + 4 + 1;

    pub fn new(tag: Tag) -> ConnectReply {
        ConnectReply {
            tag,
            features: 0,
            global_seq: 0,
            connect_seq: 0,
            protocol_version: 0,
            authorizer_len: 0,
            flags: 0,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.tag.into());
        buf.put_u64_le(self.features);
        buf.put_u32_le(self.global_seq);
        buf.put_u32_le(self.connect_seq);
        buf.put_u32_le(self.protocol_version);
        buf.put_u32_le(self.authorizer_len);
        buf.put_u8(self.flags);
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<ConnectReply, TransportError> {
        let raw_tag = buf.try_get_u8()?;
        let tag = Tag::try_from(raw_tag)
            .map_err(|_| TransportError::Decode(format!("invalid reply tag {}", raw_tag)))?;
        Ok(ConnectReply {
            tag,
            features: buf.try_get_u64_le()?,
            global_seq: buf.try_get_u32_le()?,
            connect_seq: buf.try_get_u32_le()?,
            protocol_version: buf.try_get_u32_le()?,
            authorizer_len: buf.try_get_u32_le()?,
            flags: buf.try_get_u8()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::minimal(ConnectRecord {
        features: 0, host_type: 4, global_seq: 1, connect_seq: 0,
        protocol_version: 24, authorizer_protocol: 0, authorizer_len: 0, flags: 0,
    })]
    #[case::full(ConnectRecord {
        features: features::SUPPORTED_DEFAULT, host_type: 2, global_seq: 77, connect_seq: 3,
        protocol_version: 24, authorizer_protocol: 2, authorizer_len: 16, flags: CONNECT_LOSSY,
    })]
    fn test_connect_record_roundtrip(#[case] record: ConnectRecord) {
        let mut buf = BytesMut::new();
        record.ser(&mut buf);
        assert_eq!(buf.len(), ConnectRecord::SERIALIZED_LEN);
        let mut b: &[u8] = buf.as_ref();
        assert_eq!(ConnectRecord::try_deser(&mut b).unwrap(), record);
        assert!(b.is_empty());
    }

    #[test]
    fn test_connect_record_literal() {
        let record = ConnectRecord {
            features: 0x42,
            host_type: 2,
            global_seq: 0x0102,
            connect_seq: 3,
            protocol_version: 24,
            authorizer_protocol: 0,
            authorizer_len: 0,
            flags: 1,
        };
        let mut buf = BytesMut::new();
        record.ser(&mut buf);
        assert_eq!(
            buf.as_ref(),
            &[
                0x42, 0, 0, 0, 0, 0, 0, 0, // features
                2, 0, 0, 0, // host_type
                2, 1, 0, 0, // global_seq
                3, 0, 0, 0, // connect_seq
                24, 0, 0, 0, // protocol_version
                0, 0, 0, 0, // authorizer_protocol
                0, 0, 0, 0, // authorizer_len
                1, // flags
            ]
        );
    }

    #[rstest]
    #[case::ready(ConnectReply { tag: Tag::Ready, features: features::SUPPORTED_DEFAULT, global_seq: 12, connect_seq: 1, protocol_version: 15, authorizer_len: 0, flags: 0 })]
    #[case::retry_global(ConnectReply { tag: Tag::RetryGlobal, features: 0, global_seq: 99, connect_seq: 0, protocol_version: 0, authorizer_len: 0, flags: 0 })]
    #[case::wait(ConnectReply::new(Tag::Wait))]
    fn test_connect_reply_roundtrip(#[case] reply: ConnectReply) {
        let mut buf = BytesMut::new();
        reply.ser(&mut buf);
        assert_eq!(buf.len(), ConnectReply::SERIALIZED_LEN);
        let mut b: &[u8] = buf.as_ref();
        assert_eq!(ConnectReply::try_deser(&mut b).unwrap(), reply);
        assert!(b.is_empty());
    }

    #[test]
    fn test_reply_bad_tag() {
        let mut buf = BytesMut::new();
        ConnectReply::new(Tag::Ready).ser(&mut buf);
        buf[0] = 200;
        let mut b: &[u8] = buf.as_ref();
        assert!(ConnectReply::try_deser(&mut b).is_err());
    }

    #[rstest]
    #[case::mon_internal(EntityType::Monitor, EntityType::Monitor, true, 15)]
    #[case::osd_internal(EntityType::ObjectServer, EntityType::ObjectServer, false, 24)]
    #[case::mds_internal(EntityType::MetadataServer, EntityType::MetadataServer, true, 32)]
    #[case::client_to_osd(EntityType::Client, EntityType::ObjectServer, true, 24)]
    #[case::osd_accepting_client(EntityType::ObjectServer, EntityType::Client, false, 24)]
    #[case::client_to_mon(EntityType::Client, EntityType::Monitor, true, 15)]
    #[case::mon_accepting_client(EntityType::Monitor, EntityType::Client, false, 15)]
    #[case::client_to_client(EntityType::Client, EntityType::Client, true, 0)]
    fn test_proto_version(
        #[case] my_type: EntityType,
        #[case] peer_type: EntityType,
        #[case] connect: bool,
        #[case] expected: u32,
    ) {
        assert_eq!(proto_version(my_type, peer_type, connect), expected);
    }
}
