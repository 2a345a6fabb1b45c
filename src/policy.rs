use std::sync::Arc;

use crate::throttle::Throttler;
use crate::wire::features;

/// Per-peer-type session behavior.
#[derive(Clone)]
pub struct Policy {
    /// The session may drop un-acked messages on any fault; the peer learns of
    /// it via `remote_reset`. Sent messages are not retained.
    pub lossy: bool,

    /// This side wins connection races and never dials out.
    pub server: bool,

    /// When the outbound queue drains after a fault, sit idle instead of
    /// reconnecting until there is something to send.
    pub standby: bool,

    pub features_supported: u64,
    pub features_required: u64,

    /// Bytes of inbound message memory this peer type may hold; the charge is
    /// carried until the application releases the message.
    pub throttler: Option<Arc<Throttler>>,
}

impl Policy {
    /// A client talking to a stateful service: reconnect and replay on faults.
    pub fn lossless_client(features_required: u64) -> Policy {
        Policy {
            lossy: false,
            server: false,
            standby: false,
            features_supported: features::SUPPORTED_DEFAULT,
            features_required,
            throttler: None,
        }
    }

    /// A client whose requests can be regenerated; drop the session on faults.
    pub fn lossy_client(features_required: u64) -> Policy {
        Policy {
            lossy: true,
            server: false,
            standby: false,
            features_supported: features::SUPPORTED_DEFAULT,
            features_required,
            throttler: None,
        }
    }

    /// A service accepting sessions from clients it will never dial.
    pub fn stateless_server(features_required: u64) -> Policy {
        Policy {
            lossy: true,
            server: true,
            standby: false,
            features_supported: features::SUPPORTED_DEFAULT,
            features_required,
            throttler: None,
        }
    }

    /// A service keeping per-session state; the client reconnects and replays.
    pub fn stateful_server(features_required: u64) -> Policy {
        Policy {
            lossy: false,
            server: true,
            standby: true,
            features_supported: features::SUPPORTED_DEFAULT,
            features_required,
            throttler: None,
        }
    }

    /// Symmetric peers inside the cluster: durable in both directions.
    pub fn lossless_peer(features_required: u64) -> Policy {
        Policy {
            lossy: false,
            server: false,
            standby: false,
            features_supported: features::SUPPORTED_DEFAULT,
            features_required,
            throttler: None,
        }
    }
}

impl Default for Policy {
    fn default() -> Policy {
        Policy::lossless_peer(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_policies_win_races() {
        assert!(Policy::stateless_server(0).server);
        assert!(Policy::stateful_server(0).server);
        assert!(!Policy::lossless_client(0).server);
    }

    #[test]
    fn test_lossy_flags() {
        assert!(Policy::lossy_client(0).lossy);
        assert!(Policy::stateless_server(0).lossy);
        assert!(!Policy::stateful_server(0).lossy);
        assert!(!Policy::lossless_peer(0).lossy);
    }
}
