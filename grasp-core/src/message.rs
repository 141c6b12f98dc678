//! Wire messages exchanged between GRASP engines.
//!
//! Messages are CBOR-encoded. Session ids are bare 32-bit values on the
//! wire; the receiving engine scopes them with the sender's address.
//! Objective values stay opaque CBOR byte blobs inside the message.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::{GraspError, GraspResult};
use crate::locator::LocatorOption;
use crate::objective::Objective;

/// One objective inside a flood, optionally tagged with the locator of
/// the ASA that originated it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloodItem {
    pub locator: Option<LocatorOption>,
    pub objective: Objective,
}

/// A GRASP protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Multicast query for providers of an objective.
    Discovery {
        session: u32,
        /// Address replies must be sent to.
        initiator: IpAddr,
        objective: Objective,
    },
    /// Unicast answer to a discovery.
    DiscoveryResponse {
        session: u32,
        initiator: IpAddr,
        /// How long the receiver may cache these locators, milliseconds.
        ttl_ms: u64,
        locators: Vec<LocatorOption>,
        /// True when the responder is relaying locators it learned from
        /// elsewhere rather than offering itself.
        divert: bool,
    },
    /// Unicast start of a negotiation session.
    RequestNegotiate { session: u32, objective: Objective },
    /// A proffered or counter-offered objective within a session.
    Negotiate { session: u32, objective: Objective },
    /// Ask the peer to keep its session open for this much longer.
    Wait { session: u32, extension_ms: u64 },
    /// Terminate a session: accept or decline with an optional reason.
    End {
        session: u32,
        accept: bool,
        reason: Option<String>,
    },
    /// Unicast request for the peer's synchronized objective value.
    RequestSynchronize { session: u32, objective: Objective },
    /// Reply carrying the synchronized objective.
    Synchronize { session: u32, objective: Objective },
    /// Multicast best-effort distribution of tagged objectives.
    Flood {
        session: u32,
        initiator: IpAddr,
        /// Validity of the flooded values, milliseconds (0 = no expiry).
        ttl_ms: u64,
        objectives: Vec<FloodItem>,
    },
    /// Abrupt session abort with diagnostic information.
    Invalid { session: u32, info: String },
}

impl Message {
    /// The session id this message belongs to.
    pub fn session(&self) -> u32 {
        match self {
            Self::Discovery { session, .. }
            | Self::DiscoveryResponse { session, .. }
            | Self::RequestNegotiate { session, .. }
            | Self::Negotiate { session, .. }
            | Self::Wait { session, .. }
            | Self::End { session, .. }
            | Self::RequestSynchronize { session, .. }
            | Self::Synchronize { session, .. }
            | Self::Flood { session, .. }
            | Self::Invalid { session, .. } => *session,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Discovery { .. } => "discovery",
            Self::DiscoveryResponse { .. } => "discovery-response",
            Self::RequestNegotiate { .. } => "request-negotiate",
            Self::Negotiate { .. } => "negotiate",
            Self::Wait { .. } => "wait",
            Self::End { .. } => "end",
            Self::RequestSynchronize { .. } => "request-synchronize",
            Self::Synchronize { .. } => "synchronize",
            Self::Flood { .. } => "flood",
            Self::Invalid { .. } => "invalid",
        }
    }

    /// Encode to CBOR bytes.
    pub fn encode(&self) -> GraspResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf)
            .map_err(|e| GraspError::Codec(e.to_string()))?;
        Ok(buf)
    }

    /// Decode from CBOR bytes.
    pub fn decode(bytes: &[u8]) -> GraspResult<Self> {
        ciborium::de::from_reader(bytes).map_err(|e| GraspError::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objective::ObjectiveFlags;

    fn sample_objective() -> Objective {
        Objective::new("EX-neg", ObjectiveFlags::negotiation())
            .unwrap()
            .with_value(vec![0x83, 0x01, 0x02, 0x03])
    }

    #[test]
    fn negotiate_message_round_trip() {
        let msg = Message::Negotiate {
            session: 0xc0ffee,
            objective: sample_objective(),
        };
        let bytes = msg.encode().unwrap();
        let back = Message::decode(&bytes).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.session(), 0xc0ffee);
    }

    #[test]
    fn end_message_carries_reason() {
        let msg = Message::End {
            session: 7,
            accept: false,
            reason: Some("too expensive".into()),
        };
        let back = Message::decode(&msg.encode().unwrap()).unwrap();
        match back {
            Message::End {
                accept: false,
                reason: Some(r),
                ..
            } => assert_eq!(r, "too expensive"),
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn flood_preserves_opaque_value() {
        let value = vec![0xa1, 0x61, 0x76, 0x18, 0x2a];
        let obj = Objective::new("EX-syn", ObjectiveFlags::synchronization())
            .unwrap()
            .with_value(value.clone());
        let msg = Message::Flood {
            session: 1,
            initiator: "fe80::1".parse().unwrap(),
            ttl_ms: 30_000,
            objectives: vec![FloodItem {
                locator: None,
                objective: obj,
            }],
        };
        match Message::decode(&msg.encode().unwrap()).unwrap() {
            Message::Flood { objectives, .. } => {
                assert_eq!(objectives[0].objective.value, value);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn truncated_input_is_a_codec_error() {
        let bytes = Message::Wait {
            session: 9,
            extension_ms: 500,
        }
        .encode()
        .unwrap();
        let err = Message::decode(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, crate::error::GraspError::Codec(_)));
    }
}
