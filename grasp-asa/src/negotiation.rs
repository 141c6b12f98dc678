//! Session-scoped negotiation handles.
//!
//! A [`Negotiation`] wraps one open session. Calls that finish the
//! session consume the handle, so a closed negotiation cannot be
//! driven further by construction.

use std::sync::Arc;
use std::time::Duration;

use grasp_core::{AsaNonce, GraspResult, Locator, Objective, SessionNonce};
use grasp_engine::{GraspEngine, NegotiationListener, NegotiationReply};

/// The peer's move, from the caller's point of view.
#[derive(Debug)]
pub enum Reply {
    /// The peer countered; drive the session on through `negotiation`.
    Counter {
        negotiation: Negotiation,
        objective: Objective,
    },
    /// The peer accepted `objective`; the session is over.
    Accepted { objective: Objective },
    /// The peer declined; the session is over.
    Declined { reason: String },
}

impl Reply {
    pub(crate) fn from_engine(
        engine: &Arc<GraspEngine>,
        owner: AsaNonce,
        reply: NegotiationReply,
    ) -> Self {
        match reply {
            NegotiationReply::Counter { session, objective } => Reply::Counter {
                negotiation: Negotiation {
                    engine: Arc::clone(engine),
                    owner,
                    session,
                },
                objective,
            },
            NegotiationReply::Accepted { objective } => Reply::Accepted { objective },
            NegotiationReply::Declined { reason } => Reply::Declined { reason },
        }
    }
}

/// One open negotiation session.
pub struct Negotiation {
    engine: Arc<GraspEngine>,
    owner: AsaNonce,
    session: SessionNonce,
}

impl Negotiation {
    pub(crate) fn new(engine: Arc<GraspEngine>, owner: AsaNonce, session: SessionNonce) -> Self {
        Self {
            engine,
            owner,
            session,
        }
    }

    pub fn session(&self) -> SessionNonce {
        self.session
    }

    /// Counters with `objective` and waits for the peer's next move.
    pub async fn step(self, objective: &Objective, timeout: Option<Duration>) -> GraspResult<Reply> {
        let reply = self
            .engine
            .negotiate_step(self.owner, self.session, objective, timeout)
            .await?;
        Ok(Reply::from_engine(&self.engine, self.owner, reply))
    }

    /// Waits for the peer's next move without countering.
    pub async fn wait(self, timeout: Option<Duration>) -> GraspResult<Reply> {
        let reply = self
            .engine
            .negotiate_wait(self.owner, self.session, timeout)
            .await?;
        Ok(Reply::from_engine(&self.engine, self.owner, reply))
    }

    /// Accepts the objective as last proffered by the peer.
    pub async fn accept(self) -> GraspResult<()> {
        self.engine
            .end_negotiate(self.owner, self.session, true, None)
            .await
    }

    /// Declines and closes the session.
    pub async fn decline(self, reason: &str) -> GraspResult<()> {
        self.engine
            .end_negotiate(self.owner, self.session, false, Some(reason))
            .await
    }

    /// Asks the peer for more time before the next move.
    pub async fn grant_wait(&self, extension: Duration) -> GraspResult<()> {
        self.engine
            .send_wait(self.owner, self.session, extension)
            .await
    }

    /// Aborts the session, flagging the peer's last message as
    /// unacceptable.
    pub async fn abort(self, info: &str) -> GraspResult<()> {
        self.engine
            .send_invalid(self.owner, self.session, info)
            .await
    }
}

impl std::fmt::Debug for Negotiation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiation")
            .field("session", &self.session)
            .finish()
    }
}

/// An incoming negotiation ready for the responder to drive.
#[derive(Debug)]
pub struct Request {
    pub negotiation: Negotiation,
    pub objective: Objective,
    pub peer: Locator,
}

/// Accepts negotiation requests for one objective.
pub struct Requests {
    engine: Arc<GraspEngine>,
    owner: AsaNonce,
    inner: NegotiationListener,
}

impl Requests {
    pub(crate) fn new(engine: Arc<GraspEngine>, owner: AsaNonce, inner: NegotiationListener) -> Self {
        Self {
            engine,
            owner,
            inner,
        }
    }

    pub fn objective_name(&self) -> &str {
        self.inner.name()
    }

    /// Waits for the next request. Errors once listening has been
    /// stopped.
    pub async fn accept(&mut self) -> GraspResult<Request> {
        let incoming = self.inner.accept().await?;
        Ok(Request {
            negotiation: Negotiation::new(Arc::clone(&self.engine), self.owner, incoming.session),
            objective: incoming.objective,
            peer: incoming.peer,
        })
    }
}
