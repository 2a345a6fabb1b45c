//! The per-message wire envelope and the in-memory message representation.
//!
//! On the wire a data message is `MSG tag, header, payload, middle, data,
//! footer`. Two header layouts exist: the current one carries only the sender's
//! entity name, the legacy one additionally embeds the sender's address; which
//! one a session uses is decided by the negotiated `NOSRCADDR` feature bit.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISCSI};

use crate::connection::Connection;
use crate::entity::{EntityAddr, EntityName, EntityType};
use crate::error::TransportError;
use crate::throttle::ThrottleDebit;

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub fn crc32c(data: &[u8]) -> u32 {
    CASTAGNOLI.checksum(data)
}

pub const PAGE_SIZE: usize = 4096;

// Message priorities; within a pipe, higher drains strictly first.
pub const PRIO_LOW: u8 = 64;
pub const PRIO_DEFAULT: u8 = 127;
pub const PRIO_HIGH: u8 = 196;
pub const PRIO_HIGHEST: u8 = 255;

/// Which header form a session writes and expects.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum HeaderLayout {
    /// Negotiated `NOSRCADDR`: the header carries the sender name only.
    NoSrcAddr,
    /// Legacy: the header additionally embeds the sender address.
    Legacy,
}
impl HeaderLayout {
    pub fn for_features(features: u64) -> HeaderLayout {
        if features & crate::wire::features::NOSRCADDR != 0 {
            HeaderLayout::NoSrcAddr
        } else {
            HeaderLayout::Legacy
        }
    }

    pub fn serialized_len(&self) -> usize {
        let base = 8 + 8 + 2 + 2 + 2 + 4 + 4 + 4 + 2 + EntityName::SERIALIZED_LEN + 2 + 2 + 4;
        match self {
            HeaderLayout::NoSrcAddr => base,
            HeaderLayout::Legacy => base + EntityAddr::SERIALIZED_LEN,
        }
    }
}

/// Message envelope. The CRC covers every header byte preceding it.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct MessageHeader {
    pub seq: u64,
    pub tid: u64,
    pub msg_type: u16,
    pub priority: u16,
    pub version: u16,
    pub front_len: u32,
    pub middle_len: u32,
    pub data_len: u32,
    pub data_off: u16,
    pub src: EntityName,
    pub compat_version: u16,
    pub reserved: u16,
}

impl MessageHeader {
    fn ser_fields(&self, buf: &mut impl BufMut, layout: HeaderLayout, src_addr: &EntityAddr) {
        buf.put_u64_le(self.seq);
        buf.put_u64_le(self.tid);
        buf.put_u16_le(self.msg_type);
        buf.put_u16_le(self.priority);
        buf.put_u16_le(self.version);
        buf.put_u32_le(self.front_len);
        buf.put_u32_le(self.middle_len);
        buf.put_u32_le(self.data_len);
        buf.put_u16_le(self.data_off);
        self.src.ser(buf);
        if layout == HeaderLayout::Legacy {
            src_addr.ser(buf);
        }
        buf.put_u16_le(self.compat_version);
        buf.put_u16_le(self.reserved);
    }

    /// Serialize including the trailing CRC over the preceding bytes.
    pub fn ser(&self, layout: HeaderLayout, src_addr: &EntityAddr) -> BytesMut {
        let mut buf = BytesMut::with_capacity(layout.serialized_len());
        self.ser_fields(&mut buf, layout, src_addr);
        let crc = crc32c(buf.as_ref());
        buf.put_u32_le(crc);
        buf
    }

    /// Decode and CRC-check a full header buffer of `layout.serialized_len()`
    /// bytes. A CRC mismatch here is fatal to the session; the framing itself
    /// can no longer be trusted.
    pub fn try_deser(
        raw: &[u8],
        layout: HeaderLayout,
    ) -> Result<(MessageHeader, Option<EntityAddr>), TransportError> {
        if raw.len() != layout.serialized_len() {
            return Err(TransportError::Decode(format!(
                "header length {} != {}",
                raw.len(),
                layout.serialized_len()
            )));
        }
        let crc_offset = raw.len() - 4;
        let expected = crc32c(&raw[..crc_offset]);

        let mut buf = raw;
        let header = MessageHeader {
            seq: buf.try_get_u64_le()?,
            tid: buf.try_get_u64_le()?,
            msg_type: buf.try_get_u16_le()?,
            priority: buf.try_get_u16_le()?,
            version: buf.try_get_u16_le()?,
            front_len: buf.try_get_u32_le()?,
            middle_len: buf.try_get_u32_le()?,
            data_len: buf.try_get_u32_le()?,
            data_off: buf.try_get_u16_le()?,
            src: EntityName::try_deser(&mut buf)?,
            compat_version: 0,
            reserved: 0,
        };
        let src_addr = match layout {
            HeaderLayout::NoSrcAddr => None,
            HeaderLayout::Legacy => Some(EntityAddr::try_deser(&mut buf)?),
        };
        let compat_version = buf.try_get_u16_le()?;
        let reserved = buf.try_get_u16_le()?;
        let actual = buf.try_get_u32_le()?;
        if actual != expected {
            return Err(TransportError::CrcMismatch { expected, actual });
        }

        let header = MessageHeader {
            compat_version,
            reserved,
            ..header
        };
        Ok((header, src_addr))
    }
}

pub const FOOTER_COMPLETE: u8 = 1;

/// Trailer after the data section: per-section CRCs (zero for absent
/// sections) and completion flags. A cleared `COMPLETE` bit marks a message
/// the sender gave up on mid-write; the receiver discards it silently.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct Footer {
    pub front_crc: u32,
    pub middle_crc: u32,
    pub data_crc: u32,
    pub sig: u64,
    pub flags: u8,
}
impl Footer {
    pub const SERIALIZED_LEN: usize = 4 + 4 + 4 + 8 + 1;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.front_crc);
        buf.put_u32_le(self.middle_crc);
        buf.put_u32_le(self.data_crc);
        buf.put_u64_le(self.sig);
        buf.put_u8(self.flags);
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<Footer, TransportError> {
        Ok(Footer {
            front_crc: buf.try_get_u32_le()?,
            middle_crc: buf.try_get_u32_le()?,
            data_crc: buf.try_get_u32_le()?,
            sig: buf.try_get_u64_le()?,
            flags: buf.try_get_u8()?,
        })
    }

    pub fn is_complete(&self) -> bool {
        self.flags & FOOTER_COMPLETE != 0
    }
}

/// Chunk lengths for a data read of `len` bytes declared at offset `off`:
/// a head chunk up to the next page boundary relative to `off`, then
/// page-sized chunks, then the remainder. With `off` page-aligned (or zero)
/// this is just page-sized chunks plus a tail.
pub fn aligned_chunk_lens(len: usize, off: usize) -> Vec<usize> {
    let mut lens = Vec::new();
    let mut left = len;
    let phase = off % PAGE_SIZE;
    if phase != 0 {
        let head = (PAGE_SIZE - phase).min(left);
        if head > 0 {
            lens.push(head);
            left -= head;
        }
    }
    while left >= PAGE_SIZE {
        lens.push(PAGE_SIZE);
        left -= PAGE_SIZE;
    }
    if left > 0 {
        lens.push(left);
    }
    lens
}

/// The data section as a list of chunks. Chunk boundaries are preserved from
/// receive (alignment) through send (one iovec per chunk).
#[derive(Clone, Default)]
pub struct BufferList {
    chunks: Vec<Bytes>,
}
impl BufferList {
    pub fn new() -> BufferList {
        BufferList { chunks: Vec::new() }
    }

    pub fn from_bytes(data: Bytes) -> BufferList {
        if data.is_empty() {
            BufferList::new()
        } else {
            BufferList { chunks: vec![data] }
        }
    }

    pub fn push(&mut self, chunk: Bytes) {
        if !chunk.is_empty() {
            self.chunks.push(chunk);
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    pub fn crc32c(&self) -> u32 {
        let mut digest = CASTAGNOLI.digest();
        for c in &self.chunks {
            digest.update(c);
        }
        digest.finalize()
    }

    /// Flatten into one contiguous buffer (copies; for consumers that need
    /// contiguous access, not for the send path).
    pub fn to_bytes(&self) -> Bytes {
        match self.chunks.len() {
            0 => Bytes::new(),
            1 => self.chunks[0].clone(),
            _ => {
                let mut out = BytesMut::with_capacity(self.len());
                for c in &self.chunks {
                    out.put_slice(c);
                }
                out.freeze()
            }
        }
    }
}
impl Debug for BufferList {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "BufferList({} bytes in {} chunks)", self.len(), self.chunks.len())
    }
}

/// A message in flight. Once handed to `send_message` the messenger owns it
/// exclusively until it is written out and acked (or discarded on a lossy
/// reset); on the receive side, clones share the inbound throttle debit,
/// which is released when the last clone drops.
#[derive(Clone)]
pub struct Message {
    pub header: MessageHeader,
    pub payload: Bytes,
    pub middle: Bytes,
    pub data: BufferList,

    pub connection: Option<Arc<Connection>>,
    pub(crate) policy_debit: Option<Arc<ThrottleDebit>>,
    pub(crate) dispatch_throttle_size: u64,
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "msg(type={} seq={} prio={} {}+{}+{})",
            self.header.msg_type,
            self.header.seq,
            self.header.priority,
            self.payload.len(),
            self.middle.len(),
            self.data.len(),
        )
    }
}

impl Message {
    pub fn new(msg_type: u16, payload: Bytes) -> Message {
        Message {
            header: MessageHeader {
                seq: 0,
                tid: 0,
                msg_type,
                priority: 0,
                version: 1,
                front_len: payload.len() as u32,
                middle_len: 0,
                data_len: 0,
                data_off: 0,
                src: EntityName::new(EntityType::Client, 0),
                compat_version: 1,
                reserved: 0,
            },
            payload,
            middle: Bytes::new(),
            data: BufferList::new(),
            connection: None,
            policy_debit: None,
            dispatch_throttle_size: 0,
        }
    }

    pub fn priority(&self) -> u8 {
        self.header.priority.min(u8::MAX as u16) as u8
    }

    pub fn set_priority(&mut self, priority: u8) {
        self.header.priority = priority as u16;
    }

    pub fn seq(&self) -> u64 {
        self.header.seq
    }

    pub fn set_data(&mut self, data: BufferList, data_off: u16) {
        self.header.data_len = data.len() as u32;
        self.header.data_off = data_off;
        self.data = data;
    }

    pub fn set_middle(&mut self, middle: Bytes) {
        self.header.middle_len = middle.len() as u32;
        self.middle = middle;
    }

    /// Total bytes charged against the throttlers for this message.
    pub fn throttle_size(&self) -> u64 {
        self.header.front_len as u64 + self.header.middle_len as u64 + self.header.data_len as u64
    }

    /// Refresh the section lengths from the buffers. The writer calls this
    /// right before framing so a codec that rewrote the payload stays honest.
    pub fn sync_section_lens(&mut self) {
        self.header.front_len = self.payload.len() as u32;
        self.header.middle_len = self.middle.len() as u32;
        self.header.data_len = self.data.len() as u32;
    }

    /// Footer with per-section CRCs; absent sections check out at zero.
    pub fn build_footer(&self) -> Footer {
        Footer {
            front_crc: if self.payload.is_empty() { 0 } else { crc32c(&self.payload) },
            middle_crc: if self.middle.is_empty() { 0 } else { crc32c(&self.middle) },
            data_crc: if self.data.is_empty() { 0 } else { self.data.crc32c() },
            sig: 0,
            flags: FOOTER_COMPLETE,
        }
    }

    pub(crate) fn take_dispatch_throttle_size(&mut self) -> u64 {
        std::mem::take(&mut self.dispatch_throttle_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::net::SocketAddr;
    use std::str::FromStr;

    fn sample_header() -> MessageHeader {
        MessageHeader {
            seq: 5,
            tid: 77,
            msg_type: 42,
            priority: 127,
            version: 3,
            front_len: 10,
            middle_len: 0,
            data_len: 4096,
            data_off: 512,
            src: EntityName::new(EntityType::ObjectServer, 12),
            compat_version: 2,
            reserved: 0,
        }
    }

    fn sender_addr() -> EntityAddr {
        EntityAddr::new(SocketAddr::from_str("10.0.0.1:6789").unwrap(), 7)
    }

    #[rstest]
    #[case::nosrcaddr(HeaderLayout::NoSrcAddr)]
    #[case::legacy(HeaderLayout::Legacy)]
    fn test_header_roundtrip(#[case] layout: HeaderLayout) {
        let header = sample_header();
        let buf = header.ser(layout, &sender_addr());
        assert_eq!(buf.len(), layout.serialized_len());

        let (deser, addr) = MessageHeader::try_deser(buf.as_ref(), layout).unwrap();
        assert_eq!(deser, header);
        match layout {
            HeaderLayout::NoSrcAddr => assert!(addr.is_none()),
            HeaderLayout::Legacy => assert_eq!(addr, Some(sender_addr())),
        }
    }

    #[test]
    fn test_header_crc_mismatch_is_fatal_kind() {
        let header = sample_header();
        let mut buf = header.ser(HeaderLayout::NoSrcAddr, &sender_addr());
        buf[0] ^= 0xff;
        match MessageHeader::try_deser(buf.as_ref(), HeaderLayout::NoSrcAddr) {
            Err(TransportError::CrcMismatch { .. }) => {}
            other => panic!("expected CrcMismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_header_layout_lengths_differ_by_addr() {
        assert_eq!(
            HeaderLayout::Legacy.serialized_len() - HeaderLayout::NoSrcAddr.serialized_len(),
            EntityAddr::SERIALIZED_LEN
        );
    }

    #[test]
    fn test_footer_roundtrip() {
        let footer = Footer {
            front_crc: 1,
            middle_crc: 0,
            data_crc: 3,
            sig: 0,
            flags: FOOTER_COMPLETE,
        };
        let mut buf = BytesMut::new();
        footer.ser(&mut buf);
        assert_eq!(buf.len(), Footer::SERIALIZED_LEN);
        let mut b: &[u8] = buf.as_ref();
        assert_eq!(Footer::try_deser(&mut b).unwrap(), footer);
    }

    #[test]
    fn test_crc32c_known_value() {
        // standard check value for CRC-32C
        assert_eq!(crc32c(b"123456789"), 0xE306_9283);
    }

    #[rstest]
    #[case::empty(0, 0, vec![])]
    #[case::small_aligned(100, 0, vec![100])]
    #[case::page_aligned(8192, 0, vec![4096, 4096])]
    #[case::page_plus_tail(5000, 0, vec![4096, 904])]
    #[case::offset_head(8192, 512, vec![3584, 4096, 512])]
    #[case::offset_small(100, 4090, vec![6, 94])]
    #[case::offset_page_multiple(4096, 8192, vec![4096])]
    fn test_aligned_chunk_lens(#[case] len: usize, #[case] off: usize, #[case] expected: Vec<usize>) {
        let lens = aligned_chunk_lens(len, off);
        assert_eq!(lens, expected);
        assert_eq!(lens.iter().sum::<usize>(), len);
    }

    #[test]
    fn test_footer_crcs_zero_for_absent_sections() {
        let m = Message::new(9, Bytes::new());
        let footer = m.build_footer();
        assert_eq!(footer.front_crc, 0);
        assert_eq!(footer.middle_crc, 0);
        assert_eq!(footer.data_crc, 0);
        assert!(footer.is_complete());
    }

    #[test]
    fn test_message_with_no_data_has_no_chunks() {
        let mut m = Message::new(9, Bytes::from_static(b"ping"));
        m.set_data(BufferList::new(), 0);
        assert!(m.data.chunks().is_empty());
        assert_eq!(m.header.data_len, 0);
    }

    #[test]
    fn test_buffer_list_crc_matches_flat() {
        let mut bl = BufferList::new();
        bl.push(Bytes::from_static(b"1234"));
        bl.push(Bytes::from_static(b"56789"));
        assert_eq!(bl.crc32c(), crc32c(b"123456789"));
        assert_eq!(bl.to_bytes().as_ref(), b"123456789");
        assert_eq!(bl.len(), 9);
    }
}
