//! Locators identifying where a peer ASA can be reached.
//!
//! The address kind is a sum type, so "exactly one of IP / FQDN / URI"
//! holds by construction. `Locator` is the engine/API form, carrying
//! expiry and divert status; `LocatorOption` is the wire form, where
//! expiry is derived from the enclosing message's TTL by the receiver.

use std::net::IpAddr;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::GRASP_LISTEN_PORT;

/// IANA protocol number for TCP, the GRASP default transport.
pub const PROTO_TCP: u8 = 6;
/// IANA protocol number for UDP.
pub const PROTO_UDP: u8 = 17;

/// The address carried by a locator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LocatorAddress {
    Ip(IpAddr),
    Fqdn(String),
    Uri(String),
}

impl LocatorAddress {
    /// The IP address, if this is an IP locator.
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Self::Ip(a) => Some(*a),
            _ => None,
        }
    }
}

impl std::fmt::Display for LocatorAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ip(a) => write!(f, "{a}"),
            Self::Fqdn(s) => write!(f, "{s}"),
            Self::Uri(s) => write!(f, "{s}"),
        }
    }
}

/// Locator of a discovered peer ASA, also used to tag flooded objectives.
#[derive(Debug, Clone, PartialEq)]
pub struct Locator {
    pub address: LocatorAddress,
    /// IANA transport protocol number.
    pub protocol: u8,
    pub port: u16,
    /// Interface index this locator was discovered on (0 = unknown).
    pub ifi: u32,
    /// Absolute time after which the locator is stale (`None` = never).
    pub expire: Option<Instant>,
    /// True if the peer redirected the requester here via a divert.
    pub diverted: bool,
}

impl Locator {
    /// Locator with GRASP defaults: TCP, the GRASP listen port, no
    /// interface, no expiry.
    pub fn new(address: LocatorAddress) -> Self {
        Self {
            address,
            protocol: PROTO_TCP,
            port: GRASP_LISTEN_PORT,
            ifi: 0,
            expire: None,
            diverted: false,
        }
    }

    /// IP-address locator with defaults.
    pub fn ip(addr: IpAddr) -> Self {
        Self::new(LocatorAddress::Ip(addr))
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_ifi(mut self, ifi: u32) -> Self {
        self.ifi = ifi;
        self
    }

    pub fn with_expire(mut self, expire: Instant) -> Self {
        self.expire = Some(expire);
        self
    }

    /// Whether the locator must be treated as absent at `now`.
    pub fn is_stale(&self, now: Instant) -> bool {
        matches!(self.expire, Some(e) if e <= now)
    }
}

/// Wire form of a locator, as carried in responses and floods.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocatorOption {
    pub address: LocatorAddress,
    pub protocol: u8,
    pub port: u16,
    pub ifi: u32,
}

impl LocatorOption {
    /// Promote to the API form, attaching receiver-side metadata.
    pub fn into_locator(self, expire: Option<Instant>, diverted: bool) -> Locator {
        Locator {
            address: self.address,
            protocol: self.protocol,
            port: self.port,
            ifi: self.ifi,
            expire,
            diverted,
        }
    }
}

impl From<&Locator> for LocatorOption {
    fn from(loc: &Locator) -> Self {
        Self {
            address: loc.address.clone(),
            protocol: loc.protocol,
            port: loc.port,
            ifi: loc.ifi,
        }
    }
}
