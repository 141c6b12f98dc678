//! The GRASP negotiation engine: registries, discovery, negotiation,
//! synchronization and flooding for Autonomic Service Agents on one
//! node.
//!
//! The engine is transport-agnostic. Embedders supply a
//! [`transport::Transport`] for sending and pump received datagrams
//! into [`engine::GraspEngine::handle_datagram`]; the in-process
//! [`transport::LinkHub`] wires several engines together for tests
//! and demos.

pub mod config;
pub mod engine;
pub mod registry;
pub mod transport;

mod discovery;
mod flood;
mod negotiation;
mod sessions;
mod synchronization;

pub use config::EngineConfig;
pub use engine::GraspEngine;
pub use negotiation::{IncomingNegotiation, NegotiationListener, NegotiationReply};
pub use registry::RegistrationOptions;
