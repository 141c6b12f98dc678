//! Engine configuration.

use std::net::IpAddr;
use std::time::Duration;

use grasp_core::{DEF_TIMEOUT, GRASP_LISTEN_PORT};

/// Configuration of one GRASP engine instance.
///
/// Capacity limits follow the reference engine defaults; each limit has
/// a defined `ResourceExhausted` failure path when reached.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Address this engine answers discovery with and stamps on
    /// multicasts as the reply target.
    pub address: IpAddr,
    /// Port advertised in locators handed to peers.
    pub port: u16,
    /// Whether inbound discoveries may be relayed to other interfaces.
    pub relay: bool,
    /// Default timeout for blocking calls that pass `None`.
    pub default_timeout: Duration,
    /// How long discovery results (and registrations without an
    /// explicit TTL) stay valid.
    pub discovery_cache_ttl: Duration,
    /// Maximum concurrently registered ASAs.
    pub max_asas: usize,
    /// Maximum concurrently registered objectives.
    pub max_objectives: usize,
    /// Maximum concurrently tracked sessions.
    pub max_sessions: usize,
    /// Maximum cached flooded objectives; oldest are evicted.
    pub max_floods: usize,
    /// Depth of a negotiation listener's pending-request queue.
    pub listen_queue: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::from([0u8; 16]),
            port: GRASP_LISTEN_PORT,
            relay: false,
            default_timeout: DEF_TIMEOUT,
            discovery_cache_ttl: DEF_TIMEOUT * 10,
            max_asas: 100,
            max_objectives: 200,
            max_sessions: 1000,
            max_floods: 100,
            listen_queue: 5,
        }
    }
}

impl EngineConfig {
    /// Config for an engine reachable at `address`.
    pub fn with_address(address: IpAddr) -> Self {
        Self {
            address,
            ..Default::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Enable discovery relaying.
    pub fn with_relay(mut self) -> Self {
        self.relay = true;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_discovery_cache_ttl(mut self, ttl: Duration) -> Self {
        self.discovery_cache_ttl = ttl;
        self
    }
}
