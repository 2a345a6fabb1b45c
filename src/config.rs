use std::time::Duration;

use anyhow::bail;

/// Start of the port range scanned when binding with port 0.
pub const PORT_START: u16 = 6800;
/// Last port (inclusive) of the scan range.
pub const PORT_LAST: u16 = 7300;

pub struct MessengerConfig {
    /// When binding without an address family, default to IPv6.
    pub bind_ipv6: bool,

    /// Disable Nagle on every session socket.
    pub tcp_nodelay: bool,

    /// Sleep after the first post-open fault before reconnecting; doubles on
    /// each subsequent fault of the same session.
    pub initial_backoff: Duration,

    /// Upper bound on the per-session backoff.
    pub max_backoff: Duration,

    /// Read timeout during handshake and steady state. `None` waits forever.
    pub timeout: Option<Duration>,

    /// Bytes admitted into memory while waiting for dispatch, across all pipes.
    pub dispatch_throttle_bytes: u64,

    /// Port range scanned when binding with port 0.
    pub port_range: (u16, u16),

    /// Upper bound on RETRY/RESET iterations within one connect attempt. The
    /// peer controls how often we loop; a misbehaving one must not make us
    /// spin forever.
    pub handshake_retry_limit: u32,
}

impl MessengerConfig {
    pub fn default_config() -> MessengerConfig {
        MessengerConfig {
            bind_ipv6: false,
            tcp_nodelay: true,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(15),
            timeout: Some(Duration::from_secs(900)),
            dispatch_throttle_bytes: 100 << 20,
            port_range: (PORT_START, PORT_LAST),
            handshake_retry_limit: 16,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port_range.0 > self.port_range.1 {
            bail!("port range start {} is after end {}", self.port_range.0, self.port_range.1);
        }
        if self.initial_backoff > self.max_backoff {
            bail!("initial backoff exceeds max backoff");
        }
        if self.handshake_retry_limit == 0 {
            bail!("handshake retry limit must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(MessengerConfig::default_config().validate().is_ok());
    }

    #[test]
    fn test_invalid_port_range() {
        let mut config = MessengerConfig::default_config();
        config.port_range = (7000, 6900);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_backoff() {
        let mut config = MessengerConfig::default_config();
        config.initial_backoff = Duration::from_secs(60);
        assert!(config.validate().is_err());
    }
}
