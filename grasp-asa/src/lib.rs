//! ASA-facing API over a shared GRASP engine.
//!
//! An [`Asa`] is a registered agent handle. It scopes every engine
//! call to the agent's nonce and owns session handles with move
//! semantics, so misuse like driving a finished negotiation fails at
//! compile time rather than on the wire.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use grasp_core::{AsaNonce, GraspResult, Locator, Objective, TaggedObjective};
use grasp_engine::{GraspEngine, RegistrationOptions};

pub mod negotiation;

pub use negotiation::{Negotiation, Reply, Request, Requests};

/// A registered Autonomic Service Agent.
pub struct Asa {
    engine: Arc<GraspEngine>,
    name: String,
    nonce: AsaNonce,
}

impl Asa {
    /// Registers `name` with the engine and returns the agent handle.
    pub fn register(engine: Arc<GraspEngine>, name: &str) -> GraspResult<Self> {
        let nonce = engine.register_asa(name)?;
        Ok(Self {
            engine,
            name: name.to_owned(),
            nonce,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nonce(&self) -> AsaNonce {
        self.nonce
    }

    /// Deregisters the agent, tearing down its objectives, listeners
    /// and open sessions.
    pub fn deregister(self) -> GraspResult<()> {
        self.engine.deregister_asa(&self.name, self.nonce)
    }

    pub fn register_objective(
        &self,
        objective: Objective,
        opts: &RegistrationOptions,
    ) -> GraspResult<()> {
        self.engine
            .register_objective(self.nonce, objective, opts)
    }

    pub fn deregister_objective(&self, name: &str) -> GraspResult<()> {
        self.engine.deregister_objective(self.nonce, name)
    }

    /// Discovers providers of `objective`. With `flush` the cached
    /// results are discarded and a fresh network round forced.
    pub async fn discover(
        &self,
        objective: &Objective,
        timeout: Option<Duration>,
        flush: bool,
    ) -> GraspResult<Vec<Locator>> {
        self.engine
            .discover(self.nonce, objective, timeout, flush, None)
            .await
    }

    /// Proposes `objective` to `peer` and waits for its first move.
    pub async fn negotiate(
        &self,
        objective: &Objective,
        peer: &Locator,
        timeout: Option<Duration>,
    ) -> GraspResult<Reply> {
        let reply = self
            .engine
            .req_negotiate(self.nonce, objective, peer, timeout)
            .await?;
        debug!(asa = %self.name, objective = %objective.name, "negotiation opened");
        Ok(Reply::from_engine(&self.engine, self.nonce, reply))
    }

    /// Starts accepting negotiation requests for `objective`.
    pub fn listen_negotiate(&self, objective: &Objective) -> GraspResult<Requests> {
        let listener = self.engine.listen_negotiate(self.nonce, objective)?;
        Ok(Requests::new(Arc::clone(&self.engine), self.nonce, listener))
    }

    pub fn stop_negotiate(&self, name: &str) -> GraspResult<()> {
        self.engine.stop_negotiate(self.nonce, name)
    }

    /// Pulls the current value of `objective`, from the flood cache,
    /// a discovered provider, or the given `peer`.
    pub async fn synchronize(
        &self,
        objective: &Objective,
        peer: Option<&Locator>,
        timeout: Option<Duration>,
    ) -> GraspResult<Objective> {
        self.engine
            .synchronize(self.nonce, objective, peer, timeout)
            .await
    }

    /// Serves `objective`'s value to synchronization requests.
    pub fn listen_synchronize(&self, objective: &Objective) -> GraspResult<()> {
        self.engine.listen_synchronize(self.nonce, objective)
    }

    pub fn stop_synchronize(&self, name: &str) -> GraspResult<()> {
        self.engine.stop_synchronize(self.nonce, name)
    }

    /// Floods tagged objectives to all neighbors.
    pub async fn flood(
        &self,
        ttl: Option<Duration>,
        tagged: &[TaggedObjective],
    ) -> GraspResult<()> {
        self.engine.flood(self.nonce, ttl, tagged).await
    }

    /// The currently cached flooded objectives.
    pub fn get_flood(&self) -> GraspResult<Vec<TaggedObjective>> {
        self.engine.get_flood(self.nonce)
    }

    /// Expires one cached flood entry by objective name and source.
    pub fn expire_flood(&self, tagged: &TaggedObjective) -> GraspResult<()> {
        self.engine.expire_flood(self.nonce, tagged)
    }
}

impl std::fmt::Debug for Asa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Asa")
            .field("name", &self.name)
            .field("nonce", &self.nonce)
            .finish()
    }
}
