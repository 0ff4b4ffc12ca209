//! Session configuration.
//!
//! Plain structs with defaults; both sides accept a replacement config at
//! runtime, re-advertising the heartbeat budget when the cadence changes.

use std::time::Duration;

use tether_proto::session::MAX_TIMEOUT_MS;

/// Client-side tuning knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Enable the UDP companion flow.
    pub allow_udp: bool,
    /// Datagram read calls per update tick.
    pub max_udp_reads_per_update: u32,
    /// Stream read calls per update tick.
    pub max_tcp_reads_per_update: u32,
    /// Enter the reconnecting state when an established session drops.
    pub attempt_reconnect: bool,
    /// Give-up threshold for a first connect.
    pub max_connection_attempts: u32,
    /// Give-up threshold for a reconnect.
    pub max_reconnection_attempts: u32,
    /// Minimum gap between connect retries.
    pub connection_delay: Duration,
    /// Heartbeat cadence.
    pub aliveness_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            allow_udp: true,
            max_udp_reads_per_update: 256,
            max_tcp_reads_per_update: 4,
            attempt_reconnect: true,
            max_connection_attempts: 50,
            max_reconnection_attempts: 100,
            connection_delay: Duration::from_millis(200),
            aliveness_delay: Duration::from_millis(1000),
        }
    }
}

/// Server-side tuning knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Peers accepted per update tick; the rest wait in the OS backlog.
    pub backlog: u32,
    /// Datagram read calls per update tick.
    pub max_udp_reads_per_update: u32,
    /// Stream read calls per update tick, per peer.
    pub max_tcp_reads_per_update: u32,
    /// Enable the UDP companion flow.
    pub allow_udp: bool,
    /// Reject peers explicitly marked denied.
    pub use_denylist: bool,
    /// Reject peers not explicitly marked allowed.
    pub use_allowlist: bool,
    /// Heartbeat cadence.
    pub aliveness_delay: Duration,
    /// Retain disconnected peers, then fire the destroy hook when their
    /// flush delay lapses.
    pub flush_disconnected: bool,
    /// How long a disconnected peer's record (and user data) survives for
    /// identity resumption.
    pub disconnected_flush_delay: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            backlog: 32,
            max_udp_reads_per_update: 256,
            max_tcp_reads_per_update: 4,
            allow_udp: true,
            use_denylist: true,
            use_allowlist: false,
            aliveness_delay: Duration::from_millis(1000),
            flush_disconnected: true,
            disconnected_flush_delay: Duration::from_secs_f64(MAX_TIMEOUT_MS / 1000.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_defaults() {
        let config = ClientConfig::default();
        assert!(config.allow_udp);
        assert_eq!(config.max_udp_reads_per_update, 256);
        assert_eq!(config.max_tcp_reads_per_update, 4);
        assert!(config.attempt_reconnect);
        assert_eq!(config.max_connection_attempts, 50);
        assert_eq!(config.max_reconnection_attempts, 100);
        assert_eq!(config.connection_delay, Duration::from_millis(200));
        assert_eq!(config.aliveness_delay, Duration::from_millis(1000));
    }

    #[test]
    fn server_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.backlog, 32);
        assert!(config.use_denylist);
        assert!(!config.use_allowlist);
        assert!(config.flush_disconnected);
        assert!(config.disconnected_flush_delay > Duration::from_secs(900));
    }
}
