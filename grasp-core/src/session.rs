//! Nonces and the negotiation session state machine.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Opaque identity of a registered ASA, assigned at registration.
///
/// No two concurrently registered ASAs share a nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AsaNonce(pub u32);

impl fmt::Display for AsaNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "asa:{:08x}", self.0)
    }
}

/// Identity of one negotiation, discovery or synchronization session.
///
/// The source address disambiguates ids chosen independently by remote
/// initiators; locally initiated sessions carry no source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionNonce {
    pub id: u32,
    pub source: Option<IpAddr>,
}

impl SessionNonce {
    /// Nonce for a locally initiated session.
    pub fn local(id: u32) -> Self {
        Self { id, source: None }
    }

    /// Nonce for a session initiated by a remote peer.
    pub fn remote(id: u32, source: IpAddr) -> Self {
        Self {
            id,
            source: Some(source),
        }
    }
}

impl fmt::Display for SessionNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.source {
            Some(src) => write!(f, "session:{:08x}@{src}", self.id),
            None => write!(f, "session:{:08x}", self.id),
        }
    }
}

/// States of a negotiation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationState {
    /// Request sent or received; no counter-offer exchanged yet.
    Proposed,
    /// At least one counter-offer exchanged; steps may repeat.
    Negotiating,
    /// Terminal: both sides agreed.
    Accepted,
    /// Terminal: one side declined.
    Rejected,
    /// Terminal: a blocking call expired without a peer message.
    TimedOut,
    /// Terminal: the session was ended abruptly (invalid message,
    /// ASA deregistration).
    Aborted,
}

impl NegotiationState {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Accepted | Self::Rejected | Self::TimedOut | Self::Aborted
        )
    }

    /// Get valid transitions from current state.
    pub fn valid_transitions(&self) -> &'static [NegotiationState] {
        match self {
            Self::Proposed => &[
                Self::Negotiating,
                Self::Accepted,
                Self::Rejected,
                Self::TimedOut,
                Self::Aborted,
            ],
            Self::Negotiating => &[
                Self::Accepted,
                Self::Rejected,
                Self::TimedOut,
                Self::Aborted,
            ],
            Self::Accepted | Self::Rejected | Self::TimedOut | Self::Aborted => &[],
        }
    }

    /// Check if transition to target state is valid.
    pub fn can_transition_to(&self, target: NegotiationState) -> bool {
        self.valid_transitions().contains(&target)
    }
}
