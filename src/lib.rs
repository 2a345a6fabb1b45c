//! Peer-to-peer messaging transport for a distributed storage cluster:
//! long-lived, ordered, reliable message streams between cluster entities
//! (monitors, object servers, metadata servers, clients) over TCP.
//!
//! ## Design
//!
//! * One pipe per peer address owns the TCP connection and a
//!   reader/writer task pair. The reader parses frames and feeds the dispatch
//!   queue; the writer drains per-priority outbound queues, acks, and
//!   reconnects when the session faults.
//! * Delivery guarantees, per pipe and per priority class: FIFO, at-most-once
//!   upstream (duplicates from replays are suppressed by sequence number),
//!   and - for durable policies - at-least-once until the session is reset.
//!   There is no ordering across pipes.
//! * Sessions survive TCP connections. A reconnect resumes at the old
//!   sequence numbers and replays everything un-acked; when both sides carry
//!   the reconnect-seq feature they exchange receive counters first and prune
//!   the replay. Simultaneous connects are arbitrated by a race table keyed
//!   on address order and per-peer-type policy.
//! * Lossy policies trade all of that away: any fault tears the session down,
//!   queued messages are dropped, and the application hears about it through
//!   a `remote_reset` event.
//! * Two byte throttles bound memory: a per-peer-type one held for a
//!   message's lifetime, and a global one held until the dispatcher picks the
//!   message up.
//!
//! The transport does not interpret payloads, create or verify auth tokens,
//! or handle messages - those live behind the three traits in [`contracts`].
//!
//! ## Wire format
//!
//! Each side opens with a fixed banner and its addresses, then repeats
//! connect / connect_reply records (with optional authorizer blobs) until the
//! acceptor answers `READY` or `SEQ`. After that the stream is tagged frames:
//! `KEEPALIVE`, `ACK` (cumulative, little-endian u64), `MSG` (header,
//! payload, middle, data, footer with per-section CRC32Cs), and `CLOSE`.
//! Numbers are little-endian throughout; CRCs use the Castagnoli polynomial.

pub mod config;
pub mod connection;
pub mod contracts;
pub mod entity;
pub mod error;
pub mod message;
pub mod messenger;
pub mod policy;
pub mod throttle;
pub mod wire;

mod accepter;
mod dispatch_queue;
mod pipe;

pub use config::MessengerConfig;
pub use connection::Connection;
pub use contracts::{AuthorizerProvider, Dispatcher, MessageCodec, NullAuthorizer, RawCodec};
pub use entity::{EntityAddr, EntityInst, EntityName, EntityType};
pub use error::TransportError;
pub use message::Message;
pub use messenger::Messenger;
pub use policy::Policy;
pub use throttle::Throttler;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
