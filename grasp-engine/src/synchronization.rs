//! Synchronization: one-shot value pulls over a unicast session, and
//! the listener side serving a registered value.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use tracing::debug;

use grasp_core::{declined, AsaNonce, GraspError, GraspResult, Locator, Message, Objective};

use crate::engine::{log_send_error, GraspEngine};
use crate::sessions::SessionKind;

impl GraspEngine {
    /// Pulls the current value of `objective` from a peer.
    ///
    /// Without an explicit `peer` the flood cache is consulted first;
    /// failing that, a discovery round finds a provider. Blocks until
    /// the value arrives, the provider declines, or the timeout runs
    /// out.
    pub async fn synchronize(
        &self,
        nonce: AsaNonce,
        objective: &Objective,
        peer: Option<&Locator>,
        timeout: Option<Duration>,
    ) -> GraspResult<Objective> {
        self.registry.ensure_asa(nonce)?;
        if !objective.flags.synchronizing {
            return Err(GraspError::InvalidArgument(format!(
                "objective {} is not synchronizable",
                objective.name
            )));
        }
        let target = match peer {
            Some(loc) => loc.clone(),
            None => {
                if let Some(flooded) = self.floods.first_value(&objective.name, Instant::now()) {
                    debug!(objective = %objective.name, "synchronized from flood cache");
                    return Ok(flooded);
                }
                self.discover(nonce, objective, timeout, false, None)
                    .await?
                    .into_iter()
                    .next()
                    .ok_or_else(|| {
                        GraspError::NotFound(format!("no provider of {}", objective.name))
                    })?
            }
        };

        let (snonce, mut rx) =
            self.sessions
                .open_local(nonce, target.clone(), SessionKind::Synchronization)?;
        let request = Message::RequestSynchronize {
            session: snonce.id,
            objective: objective.clone(),
        };
        if let Err(e) = self.send_unicast(&target, &request).await {
            self.sessions.remove(snonce);
            return Err(e);
        }

        let deadline = Instant::now() + self.timeout_or_default(timeout);
        let outcome = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, rx.recv()).await {
                Err(_) => break Err(GraspError::Timeout),
                Ok(None) => break Err(GraspError::InvalidState("session torn down".into())),
                Ok(Some(Message::Synchronize {
                    objective: value, ..
                })) if value.name == objective.name => break Ok(value),
                Ok(Some(Message::End {
                    accept: false,
                    reason,
                    ..
                })) => break Err(declined(reason.unwrap_or_default())),
                Ok(Some(Message::Invalid { info, .. })) => {
                    break Err(GraspError::InvalidState(format!(
                        "peer aborted the session: {info}"
                    )))
                }
                Ok(Some(other)) => {
                    debug!(kind = other.kind(), %snonce, "ignoring message mid-synchronization");
                }
            }
        };
        self.sessions.remove(snonce);
        outcome
    }

    /// Starts serving `objective` with the value it carries to anyone
    /// who asks. The caller must have registered the objective.
    pub fn listen_synchronize(&self, nonce: AsaNonce, objective: &Objective) -> GraspResult<()> {
        self.registry.owned_objective(nonce, &objective.name)?;
        self.registry.set_synch_value(nonce, objective.clone())
    }

    /// Stops serving `name` and forgets its value.
    pub fn stop_synchronize(&self, nonce: AsaNonce, name: &str) -> GraspResult<()> {
        self.registry.clear_synch_value(nonce, name)
    }

    pub(crate) async fn handle_request_synchronize(
        &self,
        from: IpAddr,
        session: u32,
        objective: Objective,
    ) {
        let peer = Locator::ip(from);
        let reply = match self.registry.synch_value(&objective.name) {
            Some(value) => Message::Synchronize {
                session,
                objective: value,
            },
            None => {
                debug!(objective = %objective.name, %from, "no value to synchronize");
                Message::End {
                    session,
                    accept: false,
                    reason: Some(format!(
                        "objective {} not available for synchronization",
                        objective.name
                    )),
                }
            }
        };
        log_send_error(
            "failed to answer synchronization request",
            self.send_unicast(&peer, &reply).await,
        );
    }
}
