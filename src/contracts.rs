//! The three seams to the rest of the system: message handling, session
//! authentication, and payload encoding. Everything behind them is opaque to
//! the transport.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;

use crate::connection::Connection;
use crate::entity::EntityType;
use crate::error::TransportError;
use crate::message::Message;

/// Receives everything the transport delivers. Runs on the dispatch task;
/// handlers must not block indefinitely, since the dispatch throttle is only
/// released when a handler returns.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    async fn dispatch(&self, msg: Message);

    /// A session reached READY (either side).
    async fn handle_connect(&self, con: Arc<Connection>);

    /// A durable session failed locally and will not recover on its own.
    async fn handle_reset(&self, con: Arc<Connection>);

    /// The peer reset the session, or a lossy session dropped its queue.
    async fn handle_remote_reset(&self, con: Arc<Connection>);
}

/// An authentication token attached to a connect record.
#[derive(Clone, Debug)]
pub struct Authorizer {
    pub protocol: u32,
    pub blob: Bytes,
}

/// Creates and verifies session authorizers. The transport never looks inside
/// the blobs.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AuthorizerProvider: Send + Sync + 'static {
    /// Token for an outbound handshake to `peer_type`. `force_new` is set on
    /// the one retry after a BADAUTHORIZER reply.
    async fn build(&self, peer_type: EntityType, force_new: bool) -> Option<Authorizer>;

    /// Verify an inbound token; returns the reply blob to send back, or
    /// `AuthRejected`.
    async fn verify(
        &self,
        peer_type: EntityType,
        protocol: u32,
        blob: Bytes,
    ) -> Result<Bytes, TransportError>;

    /// Check the acceptor's reply blob against the authorizer we sent.
    async fn verify_reply(&self, authorizer: &Authorizer, reply: Bytes) -> bool;
}

/// Accepts every peer and sends no tokens. The monitor bootstrap path and
/// tests run with this.
pub struct NullAuthorizer;

#[async_trait]
impl AuthorizerProvider for NullAuthorizer {
    async fn build(&self, _peer_type: EntityType, _force_new: bool) -> Option<Authorizer> {
        None
    }

    async fn verify(
        &self,
        _peer_type: EntityType,
        _protocol: u32,
        _blob: Bytes,
    ) -> Result<Bytes, TransportError> {
        Ok(Bytes::new())
    }

    async fn verify_reply(&self, _authorizer: &Authorizer, _reply: Bytes) -> bool {
        true
    }
}

/// Transforms message payloads at the boundary. The writer calls `encode`
/// right before framing; the reader calls `decode` after the frame passed its
/// CRC checks. A decode failure drops that one message, not the session.
#[cfg_attr(test, automock)]
pub trait MessageCodec: Send + Sync + 'static {
    fn encode(&self, msg: &mut Message) -> Result<(), TransportError>;

    fn decode(&self, msg: Message) -> Result<Message, TransportError>;
}

/// Passes payload bytes through untouched.
pub struct RawCodec;

impl MessageCodec for RawCodec {
    fn encode(&self, _msg: &mut Message) -> Result<(), TransportError> {
        Ok(())
    }

    fn decode(&self, msg: Message) -> Result<Message, TransportError> {
        Ok(msg)
    }
}
