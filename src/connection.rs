use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use rustc_hash::FxHashMap;

use crate::entity::{EntityAddr, EntityType};
use crate::pipe::Pipe;

/// Application-facing handle for a logical peer session. A Connection outlives
/// the pipes underneath it: a race-winning inbound connect swaps the pipe slot
/// while callers keep sending through the same handle.
///
/// The slot is guarded by the Connection's own lock, last in the lock order,
/// so a caller racing with a replacement sees either the old or the new pipe,
/// never a dangling one.
pub struct Connection {
    peer_addr: Mutex<EntityAddr>,
    peer_type: Mutex<Option<EntityType>>,
    features: AtomicU64,
    pipe: Mutex<Option<Arc<Pipe>>>,
    rx_buffers: Mutex<FxHashMap<u64, BytesMut>>,
}

impl Connection {
    pub fn new(peer_addr: EntityAddr, peer_type: Option<EntityType>) -> Arc<Connection> {
        Arc::new(Connection {
            peer_addr: Mutex::new(peer_addr),
            peer_type: Mutex::new(peer_type),
            features: AtomicU64::new(0),
            pipe: Mutex::new(None),
            rx_buffers: Mutex::new(FxHashMap::default()),
        })
    }

    pub fn peer_addr(&self) -> EntityAddr {
        *self.peer_addr.lock().expect("connection lock poisoned")
    }

    pub fn set_peer_addr(&self, addr: EntityAddr) {
        *self.peer_addr.lock().expect("connection lock poisoned") = addr;
    }

    pub fn peer_type(&self) -> Option<EntityType> {
        *self.peer_type.lock().expect("connection lock poisoned")
    }

    pub fn set_peer_type(&self, peer_type: EntityType) {
        *self.peer_type.lock().expect("connection lock poisoned") = Some(peer_type);
    }

    pub fn features(&self) -> u64 {
        self.features.load(Ordering::Acquire)
    }

    pub fn set_features(&self, features: u64) {
        self.features.store(features, Ordering::Release);
    }

    pub fn has_feature(&self, bit: u64) -> bool {
        self.features() & bit != 0
    }

    pub(crate) fn pipe(&self) -> Option<Arc<Pipe>> {
        self.pipe.lock().expect("connection lock poisoned").clone()
    }

    pub(crate) fn set_pipe(&self, pipe: Arc<Pipe>) {
        *self.pipe.lock().expect("connection lock poisoned") = Some(pipe);
    }

    /// Clear the slot, but only if it still points at `expected`; the reaper
    /// of a replaced pipe must not wipe out its successor's registration.
    pub(crate) fn clear_pipe_if(&self, expected: &Arc<Pipe>) {
        let mut slot = self.pipe.lock().expect("connection lock poisoned");
        if let Some(current) = slot.as_ref() {
            if Arc::ptr_eq(current, expected) {
                *slot = None;
            }
        }
    }

    /// Register a receive buffer for the message with transaction id `tid`.
    /// If the buffer is large enough when that message arrives, its data is
    /// read straight into it and delivered without a fresh allocation.
    pub fn post_rx_buffer(&self, tid: u64, buf: BytesMut) {
        self.rx_buffers
            .lock()
            .expect("connection lock poisoned")
            .insert(tid, buf);
    }

    /// Withdraw a posted buffer. A no-op if the reader already claimed it for
    /// an in-flight message.
    pub fn revoke_rx_buffer(&self, tid: u64) -> Option<BytesMut> {
        self.rx_buffers
            .lock()
            .expect("connection lock poisoned")
            .remove(&tid)
    }

    /// Claim the posted buffer for `tid` if it can hold `len` bytes.
    pub(crate) fn take_rx_buffer(&self, tid: u64, len: usize) -> Option<BytesMut> {
        let mut buffers = self.rx_buffers.lock().expect("connection lock poisoned");
        match buffers.get(&tid) {
            Some(buf) if buf.capacity() >= len => buffers.remove(&tid),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::str::FromStr;

    fn con() -> Arc<Connection> {
        Connection::new(
            EntityAddr::new(SocketAddr::from_str("10.0.0.2:6789").unwrap(), 9),
            Some(EntityType::ObjectServer),
        )
    }

    #[test]
    fn test_features() {
        let c = con();
        assert!(!c.has_feature(crate::wire::features::NOSRCADDR));
        c.set_features(crate::wire::features::NOSRCADDR);
        assert!(c.has_feature(crate::wire::features::NOSRCADDR));
    }

    #[test]
    fn test_rx_buffer_claim_requires_capacity() {
        let c = con();
        c.post_rx_buffer(7, BytesMut::with_capacity(100));
        assert!(c.take_rx_buffer(7, 200).is_none());
        assert!(c.take_rx_buffer(7, 50).is_some());
        // claimed: revoke finds nothing
        assert!(c.revoke_rx_buffer(7).is_none());
    }

    #[test]
    fn test_rx_buffer_revoke() {
        let c = con();
        c.post_rx_buffer(1, BytesMut::with_capacity(10));
        assert!(c.revoke_rx_buffer(1).is_some());
        assert!(c.take_rx_buffer(1, 1).is_none());
    }

    #[test]
    fn test_peer_type_update() {
        let c = con();
        c.set_peer_type(EntityType::Client);
        assert_eq!(c.peer_type(), Some(EntityType::Client));
    }
}
