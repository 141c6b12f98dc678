//! Transport boundary.
//!
//! The engine never opens sockets. It hands encoded datagrams to a
//! [`Transport`] and the embedding process feeds received datagrams back
//! through [`crate::GraspEngine::handle_datagram`]. [`LinkHub`] provides
//! an in-memory link for tests and multi-engine demos.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use grasp_core::{GraspError, GraspResult, Locator, LocatorAddress};
use tokio::sync::mpsc;

/// A received datagram, as handed to `GraspEngine::handle_datagram`.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub from: IpAddr,
    /// Interface the datagram arrived on (0 = unknown).
    pub ifi: u32,
    pub payload: Bytes,
}

/// Datagram sender used by the engine.
///
/// Sends are best-effort: an `Ok` means the transport accepted the
/// datagram, not that it was delivered.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send a datagram to one peer.
    async fn unicast(&self, to: &Locator, payload: Bytes) -> GraspResult<()>;

    /// Send a datagram to all link neighbors, optionally suppressing
    /// the interface a relayed message arrived on.
    async fn multicast(&self, payload: Bytes, exclude_ifi: Option<u32>) -> GraspResult<()>;
}

/// Transport that drops everything. Useful for exercising the
/// registry and cache layers without a network.
#[derive(Debug, Default)]
pub struct NullTransport;

#[async_trait]
impl Transport for NullTransport {
    async fn unicast(&self, _to: &Locator, _payload: Bytes) -> GraspResult<()> {
        Ok(())
    }

    async fn multicast(&self, _payload: Bytes, _exclude_ifi: Option<u32>) -> GraspResult<()> {
        Ok(())
    }
}

/// An in-memory link connecting engine instances by address.
///
/// Attach each engine with [`LinkHub::attach`]; the returned receiver
/// yields the datagrams addressed to that engine, which the test or
/// embedder pumps into `handle_datagram`.
#[derive(Debug, Default)]
pub struct LinkHub {
    nodes: Mutex<HashMap<IpAddr, mpsc::UnboundedSender<Datagram>>>,
}

impl LinkHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Join the link at `address`.
    pub fn attach(
        self: &Arc<Self>,
        address: IpAddr,
    ) -> (LinkTransport, mpsc::UnboundedReceiver<Datagram>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.nodes.lock().expect("link hub poisoned").insert(address, tx);
        (
            LinkTransport {
                hub: Arc::clone(self),
                address,
            },
            rx,
        )
    }

    fn deliver(&self, to: IpAddr, datagram: Datagram) -> GraspResult<()> {
        let nodes = self.nodes.lock().expect("link hub poisoned");
        match nodes.get(&to) {
            Some(tx) => tx
                .send(datagram)
                .map_err(|_| GraspError::Transport(format!("node {to} detached"))),
            None => Err(GraspError::Transport(format!("no route to {to}"))),
        }
    }

    fn broadcast(&self, from: IpAddr, payload: Bytes) {
        let nodes = self.nodes.lock().expect("link hub poisoned");
        for (addr, tx) in nodes.iter() {
            if *addr == from {
                continue;
            }
            // a detached node is not an error for multicast
            let _ = tx.send(Datagram {
                from,
                ifi: 1,
                payload: payload.clone(),
            });
        }
    }
}

/// One node's handle on a [`LinkHub`].
pub struct LinkTransport {
    hub: Arc<LinkHub>,
    address: IpAddr,
}

#[async_trait]
impl Transport for LinkTransport {
    async fn unicast(&self, to: &Locator, payload: Bytes) -> GraspResult<()> {
        let addr = match &to.address {
            LocatorAddress::Ip(a) => *a,
            other => {
                return Err(GraspError::Transport(format!(
                    "link transport cannot resolve {other}"
                )))
            }
        };
        self.hub.deliver(
            addr,
            Datagram {
                from: self.address,
                ifi: 1,
                payload,
            },
        )
    }

    async fn multicast(&self, payload: Bytes, _exclude_ifi: Option<u32>) -> GraspResult<()> {
        self.hub.broadcast(self.address, payload);
        Ok(())
    }
}
