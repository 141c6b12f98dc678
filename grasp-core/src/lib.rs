//! # grasp-core
//!
//! Core types for the GRASP (Generic Autonomic Signaling Protocol)
//! negotiation and discovery engine: objectives, locators, nonces,
//! session states, wire messages and error codes.
//!
//! This crate is pure data: no I/O, no engine state. The protocol
//! engine lives in `grasp-engine`.

pub mod error;
pub mod locator;
pub mod message;
pub mod objective;
pub mod session;

pub use error::{declined, GraspError, GraspResult};
pub use locator::{Locator, LocatorAddress, LocatorOption, PROTO_TCP, PROTO_UDP};
pub use message::{FloodItem, Message};
pub use objective::{Objective, ObjectiveFlags, TaggedObjective};
pub use session::{AsaNonce, NegotiationState, SessionNonce};

use std::time::Duration;

/// IANA-assigned GRASP listen port.
pub const GRASP_LISTEN_PORT: u16 = 7017;

/// Default timeout for blocking operations.
pub const DEF_TIMEOUT: Duration = Duration::from_millis(60_000);

/// Default objective loop count (relay hop limit).
pub const DEF_LOOP_COUNT: u8 = 6;

/// Discovery wait budget per remaining relay hop.
pub const DISC_TIMEOUT_UNIT: Duration = Duration::from_millis(100);

/// Maximum encoded message size accepted from the transport.
pub const MAX_MESSAGE_SIZE: usize = 2048;
