//! Negotiation: the initiator request, the responder listener, and
//! the stepwise exchange both sides drive until one of them ends the
//! session.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::debug;

use grasp_core::{
    AsaNonce, GraspError, GraspResult, Locator, Message, NegotiationState, Objective, SessionNonce,
};

use crate::engine::{log_send_error, GraspEngine};
use crate::sessions::SessionKind;

/// A negotiation request accepted off the wire, handed to the
/// listening ASA.
#[derive(Debug)]
pub struct IncomingNegotiation {
    pub session: SessionNonce,
    pub peer: Locator,
    pub objective: Objective,
}

/// The peer's answer to a proffered objective.
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationReply {
    /// The peer countered; the session stays open and the caller must
    /// answer with another step, a wait, or an end.
    Counter {
        session: SessionNonce,
        objective: Objective,
    },
    /// The peer accepted the objective as last proffered.
    Accepted { objective: Objective },
    /// The peer declined and the session is over.
    Declined { reason: String },
}

/// Receives negotiation requests for one objective. Dropped or
/// explicitly stopped, the objective stops being offered.
pub struct NegotiationListener {
    name: String,
    rx: mpsc::Receiver<IncomingNegotiation>,
}

impl NegotiationListener {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the next incoming request. Errors once the listener
    /// has been stopped via [`GraspEngine::stop_negotiate`].
    pub async fn accept(&mut self) -> GraspResult<IncomingNegotiation> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| GraspError::InvalidState("negotiation listener stopped".into()))
    }
}

impl GraspEngine {
    /// Opens a negotiation session with `peer` and proffers
    /// `objective`. Blocks until the peer counters, accepts, declines,
    /// or the timeout expires.
    pub async fn req_negotiate(
        &self,
        nonce: AsaNonce,
        objective: &Objective,
        peer: &Locator,
        timeout: Option<Duration>,
    ) -> GraspResult<NegotiationReply> {
        let registered = self.registry.owned_objective(nonce, &objective.name)?;
        if !registered.flags.negotiable {
            return Err(GraspError::InvalidArgument(format!(
                "objective {} is not negotiable",
                objective.name
            )));
        }
        let (snonce, rx) =
            self.sessions
                .open_local(nonce, peer.clone(), SessionKind::Negotiation)?;
        let request = Message::RequestNegotiate {
            session: snonce.id,
            objective: objective.clone(),
        };
        if let Err(e) = self.send_unicast(peer, &request).await {
            self.sessions.remove(snonce);
            return Err(e);
        }
        self.sessions.set_last_sent(snonce, objective.clone());
        let deadline = Instant::now() + self.timeout_or_default(timeout);
        self.await_reply(snonce, objective, deadline, rx).await
    }

    /// Sends a counter-offer on an open session and waits for the
    /// peer's next move.
    pub async fn negotiate_step(
        &self,
        nonce: AsaNonce,
        snonce: SessionNonce,
        objective: &Objective,
        timeout: Option<Duration>,
    ) -> GraspResult<NegotiationReply> {
        if objective.loop_count == 0 {
            let _ = self.sessions.transition(snonce, NegotiationState::Aborted);
            return Err(GraspError::ResourceExhausted(
                "negotiation loop count exhausted".into(),
            ));
        }
        let rx = self.sessions.take_receiver(nonce, snonce)?;
        let peer = match self.sessions.peer(nonce, snonce) {
            Ok(peer) => peer,
            Err(e) => {
                self.sessions.restore_receiver(snonce, rx);
                return Err(e);
            }
        };
        // A responder's first counter moves the session out of
        // Proposed.
        if self.sessions.state(snonce) == Some(NegotiationState::Proposed) {
            let _ = self
                .sessions
                .transition(snonce, NegotiationState::Negotiating);
        }
        let counter = Message::Negotiate {
            session: snonce.id,
            objective: objective.clone(),
        };
        if let Err(e) = self.send_unicast(&peer, &counter).await {
            self.sessions.restore_receiver(snonce, rx);
            return Err(e);
        }
        self.sessions.set_last_sent(snonce, objective.clone());
        let deadline = Instant::now() + self.timeout_or_default(timeout);
        self.await_reply(snonce, objective, deadline, rx).await
    }

    /// Waits for the peer's next move without sending anything. Used
    /// after granting a wait, or by a responder that needs the
    /// initiator to move first.
    pub async fn negotiate_wait(
        &self,
        nonce: AsaNonce,
        snonce: SessionNonce,
        timeout: Option<Duration>,
    ) -> GraspResult<NegotiationReply> {
        let rx = self.sessions.take_receiver(nonce, snonce)?;
        let deadline = Instant::now() + self.timeout_or_default(timeout);
        self.await_reply_raw(snonce, None, deadline, rx).await
    }

    /// Closes the session, accepting or declining the objective as
    /// last negotiated.
    pub async fn end_negotiate(
        &self,
        nonce: AsaNonce,
        snonce: SessionNonce,
        accept: bool,
        reason: Option<&str>,
    ) -> GraspResult<()> {
        let peer = self.sessions.peer(nonce, snonce)?;
        let to = if accept {
            NegotiationState::Accepted
        } else {
            NegotiationState::Rejected
        };
        self.sessions.transition(snonce, to)?;
        let end = Message::End {
            session: snonce.id,
            accept,
            reason: reason.map(str::to_owned),
        };
        self.send_unicast(&peer, &end).await
    }

    /// Asks the peer for more time without moving the negotiation.
    pub async fn send_wait(
        &self,
        nonce: AsaNonce,
        snonce: SessionNonce,
        extension: Duration,
    ) -> GraspResult<()> {
        let peer = self.sessions.peer(nonce, snonce)?;
        match self.sessions.state(snonce) {
            Some(s) if !s.is_terminal() => {}
            Some(_) => {
                return Err(GraspError::InvalidState(
                    "negotiation already finished".into(),
                ))
            }
            None => return Err(GraspError::NotFound(format!("session {snonce}"))),
        }
        let wait = Message::Wait {
            session: snonce.id,
            extension_ms: extension.as_millis() as u64,
        };
        self.send_unicast(&peer, &wait).await
    }

    /// Aborts the session, telling the peer its last message was
    /// unacceptable.
    pub async fn send_invalid(
        &self,
        nonce: AsaNonce,
        snonce: SessionNonce,
        info: &str,
    ) -> GraspResult<()> {
        let peer = self.sessions.peer(nonce, snonce)?;
        self.sessions
            .transition(snonce, NegotiationState::Aborted)?;
        let invalid = Message::Invalid {
            session: snonce.id,
            info: info.to_owned(),
        };
        self.send_unicast(&peer, &invalid).await
    }

    /// Starts accepting negotiation requests for `objective`, which
    /// the caller must have registered as negotiable.
    pub fn listen_negotiate(
        &self,
        nonce: AsaNonce,
        objective: &Objective,
    ) -> GraspResult<NegotiationListener> {
        let registered = self.registry.owned_objective(nonce, &objective.name)?;
        if !registered.flags.negotiable {
            return Err(GraspError::InvalidArgument(format!(
                "objective {} is not negotiable",
                objective.name
            )));
        }
        let (tx, rx) = mpsc::channel(self.config.listen_queue);
        self.registry
            .set_negotiation_listener(nonce, &objective.name, tx)?;
        Ok(NegotiationListener {
            name: objective.name.clone(),
            rx,
        })
    }

    /// Stops accepting negotiation requests for `name`.
    pub fn stop_negotiate(&self, nonce: AsaNonce, name: &str) -> GraspResult<()> {
        self.registry.clear_negotiation_listener(nonce, name)
    }

    pub(crate) async fn handle_request_negotiate(
        &self,
        from: IpAddr,
        session: u32,
        objective: Objective,
    ) {
        let peer = Locator::ip(from);
        let Some((owner, listener)) = self.registry.negotiation_listener(&objective.name) else {
            debug!(objective = %objective.name, %from, "declining: nobody listening");
            let decline = Message::End {
                session,
                accept: false,
                reason: Some(format!(
                    "objective {} not available for negotiation",
                    objective.name
                )),
            };
            log_send_error(
                "failed to decline negotiation request",
                self.send_unicast(&peer, &decline).await,
            );
            return;
        };
        let snonce = SessionNonce::remote(session, from);
        if let Err(e) = self.sessions.open_remote(owner, snonce, peer.clone()) {
            debug!(error = %e, %snonce, "rejecting negotiation request");
            let invalid = Message::Invalid {
                session,
                info: "session nonce clash".into(),
            };
            log_send_error(
                "failed to reject clashing session",
                self.send_unicast(&peer, &invalid).await,
            );
            return;
        }
        let incoming = IncomingNegotiation {
            session: snonce,
            peer: peer.clone(),
            objective,
        };
        if listener.try_send(incoming).is_err() {
            self.sessions.remove(snonce);
            let decline = Message::End {
                session,
                accept: false,
                reason: Some("negotiation listener busy".into()),
            };
            log_send_error(
                "failed to decline over-queued request",
                self.send_unicast(&peer, &decline).await,
            );
        }
    }

    async fn await_reply(
        &self,
        snonce: SessionNonce,
        proffered: &Objective,
        deadline: Instant,
        rx: mpsc::Receiver<Message>,
    ) -> GraspResult<NegotiationReply> {
        self.await_reply_raw(snonce, Some(proffered), deadline, rx)
            .await
    }

    async fn await_reply_raw(
        &self,
        snonce: SessionNonce,
        proffered: Option<&Objective>,
        mut deadline: Instant,
        mut rx: mpsc::Receiver<Message>,
    ) -> GraspResult<NegotiationReply> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let msg = match tokio::time::timeout(remaining, rx.recv()).await {
                Err(_) => {
                    let _ = self.sessions.transition(snonce, NegotiationState::TimedOut);
                    return Err(GraspError::Timeout);
                }
                Ok(None) => {
                    return Err(GraspError::InvalidState("session torn down".into()));
                }
                Ok(Some(msg)) => msg,
            };
            match msg {
                Message::Negotiate {
                    objective: mut counter,
                    ..
                } => {
                    if let Some(wanted) = proffered {
                        if counter.name != wanted.name {
                            let _ = self.sessions.transition(snonce, NegotiationState::Aborted);
                            return Err(GraspError::InvalidState(format!(
                                "peer countered with unrelated objective {}",
                                counter.name
                            )));
                        }
                    }
                    counter.loop_count = counter.loop_count.saturating_sub(1);
                    if self.sessions.state(snonce) == Some(NegotiationState::Proposed) {
                        let _ = self
                            .sessions
                            .transition(snonce, NegotiationState::Negotiating);
                    }
                    self.sessions.restore_receiver(snonce, rx);
                    return Ok(NegotiationReply::Counter {
                        session: snonce,
                        objective: counter,
                    });
                }
                Message::Wait { extension_ms, .. } => {
                    debug!(%snonce, extension_ms, "peer asked for more time");
                    deadline = Instant::now() + Duration::from_millis(extension_ms);
                }
                Message::End { accept: true, .. } => {
                    let _ = self.sessions.transition(snonce, NegotiationState::Accepted);
                    let objective = proffered
                        .cloned()
                        .or_else(|| self.sessions.last_sent(snonce))
                        .ok_or_else(|| {
                            GraspError::InvalidState("acceptance before any offer".into())
                        })?;
                    return Ok(NegotiationReply::Accepted { objective });
                }
                Message::End {
                    accept: false,
                    reason,
                    ..
                } => {
                    let _ = self.sessions.transition(snonce, NegotiationState::Rejected);
                    return Ok(NegotiationReply::Declined {
                        reason: reason.unwrap_or_default(),
                    });
                }
                Message::Invalid { info, .. } => {
                    let _ = self.sessions.transition(snonce, NegotiationState::Aborted);
                    return Err(GraspError::InvalidState(format!(
                        "peer aborted the session: {info}"
                    )));
                }
                other => {
                    debug!(kind = other.kind(), %snonce, "ignoring message mid-negotiation");
                }
            }
        }
    }
}
