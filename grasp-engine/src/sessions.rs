//! Session table shared by negotiation, discovery and synchronization.
//!
//! Each session owns an inbound message channel. Blocking API calls
//! borrow the receiver for the duration of one wait; the inbound
//! dispatcher pushes peer messages through the sender. State changes
//! happen under the table lock, so a timeout firing and a reply
//! arriving concurrently resolve deterministically: whichever writer
//! takes the lock first wins and the other outcome is discarded.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use grasp_core::{
    AsaNonce, GraspError, GraspResult, Locator, Message, NegotiationState, Objective, SessionNonce,
};
use tokio::sync::mpsc;

const SESSION_QUEUE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionKind {
    Negotiation,
    Discovery,
    Synchronization,
}

struct SessionRecord {
    owner: AsaNonce,
    peer: Locator,
    #[allow(dead_code)]
    kind: SessionKind,
    state: NegotiationState,
    tx: mpsc::Sender<Message>,
    /// Parked receiver; `None` while a blocking call is waiting on it.
    rx: Option<mpsc::Receiver<Message>>,
    /// The objective this side proffered last, so an acceptance can be
    /// resolved to a concrete value even from a pure wait.
    last_sent: Option<Objective>,
    ended_at: Option<Instant>,
}

struct Inner {
    sessions: HashMap<SessionNonce, SessionRecord>,
    /// Discovery session ids this engine has already relayed.
    relayed: HashSet<u32>,
}

pub(crate) struct SessionTable {
    limit: usize,
    inner: Mutex<Inner>,
}

impl SessionTable {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                relayed: HashSet::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("session table poisoned")
    }

    /// Open a locally initiated session with a fresh id. Returns the
    /// nonce and the inbound receiver for the caller's first wait.
    pub fn open_local(
        &self,
        owner: AsaNonce,
        peer: Locator,
        kind: SessionKind,
    ) -> GraspResult<(SessionNonce, mpsc::Receiver<Message>)> {
        let mut inner = self.lock();
        if inner.sessions.len() >= self.limit {
            return Err(GraspError::ResourceExhausted("session table full".into()));
        }
        let mut id = rand::random::<u32>();
        for _ in 0..64 {
            if id != 0 && !inner.sessions.contains_key(&SessionNonce::local(id)) {
                break;
            }
            id = rand::random::<u32>();
        }
        let nonce = SessionNonce::local(id);
        if inner.sessions.contains_key(&nonce) {
            return Err(GraspError::ResourceExhausted(
                "session id space saturated".into(),
            ));
        }
        let (tx, rx) = mpsc::channel(SESSION_QUEUE);
        inner.sessions.insert(
            nonce,
            SessionRecord {
                owner,
                peer,
                kind,
                state: NegotiationState::Proposed,
                tx,
                rx: None,
                last_sent: None,
                ended_at: None,
            },
        );
        Ok((nonce, rx))
    }

    /// Open a session for a request initiated by a remote peer. Fails
    /// with `Conflict` on a session id clash.
    pub fn open_remote(
        &self,
        owner: AsaNonce,
        nonce: SessionNonce,
        peer: Locator,
    ) -> GraspResult<()> {
        let mut inner = self.lock();
        if inner.sessions.len() >= self.limit {
            return Err(GraspError::ResourceExhausted("session table full".into()));
        }
        if inner.sessions.contains_key(&nonce) {
            return Err(GraspError::Conflict(format!("{nonce} clashes")));
        }
        let (tx, rx) = mpsc::channel(SESSION_QUEUE);
        inner.sessions.insert(
            nonce,
            SessionRecord {
                owner,
                peer,
                kind: SessionKind::Negotiation,
                state: NegotiationState::Proposed,
                tx,
                rx: Some(rx),
                last_sent: None,
                ended_at: None,
            },
        );
        Ok(())
    }

    /// Route an inbound message to its session, scoping the bare wire
    /// id first by sender address, then as a local session. Returns
    /// false when no live session matches.
    pub fn deliver(&self, id: u32, from: IpAddr, msg: Message) -> bool {
        let inner = self.lock();
        for nonce in [SessionNonce::remote(id, from), SessionNonce::local(id)] {
            if let Some(rec) = inner.sessions.get(&nonce) {
                if rec.state.is_terminal() {
                    return false;
                }
                return rec.tx.try_send(msg).is_ok();
            }
        }
        false
    }

    /// Borrow the inbound receiver for one blocking wait.
    pub fn take_receiver(
        &self,
        owner: AsaNonce,
        nonce: SessionNonce,
    ) -> GraspResult<mpsc::Receiver<Message>> {
        let mut inner = self.lock();
        let rec = inner
            .sessions
            .get_mut(&nonce)
            .filter(|r| r.owner == owner)
            .ok_or_else(|| GraspError::NotFound(format!("{nonce} unknown")))?;
        if rec.state.is_terminal() {
            return Err(GraspError::InvalidState(format!(
                "{nonce} already ended ({:?})",
                rec.state
            )));
        }
        rec.rx
            .take()
            .ok_or_else(|| GraspError::InvalidState(format!("{nonce} has a call in progress")))
    }

    /// Return a borrowed receiver. Dropped silently if the session
    /// ended meanwhile.
    pub fn restore_receiver(&self, nonce: SessionNonce, rx: mpsc::Receiver<Message>) {
        let mut inner = self.lock();
        if let Some(rec) = inner.sessions.get_mut(&nonce) {
            if !rec.state.is_terminal() {
                rec.rx = Some(rx);
            }
        }
    }

    pub fn state(&self, nonce: SessionNonce) -> Option<NegotiationState> {
        self.lock().sessions.get(&nonce).map(|r| r.state)
    }

    pub fn set_last_sent(&self, nonce: SessionNonce, objective: Objective) {
        if let Some(rec) = self.lock().sessions.get_mut(&nonce) {
            rec.last_sent = Some(objective);
        }
    }

    pub fn last_sent(&self, nonce: SessionNonce) -> Option<Objective> {
        self.lock()
            .sessions
            .get(&nonce)
            .and_then(|r| r.last_sent.clone())
    }

    /// The peer locator of a session owned by `owner`.
    pub fn peer(&self, owner: AsaNonce, nonce: SessionNonce) -> GraspResult<Locator> {
        self.lock()
            .sessions
            .get(&nonce)
            .filter(|r| r.owner == owner)
            .map(|r| r.peer.clone())
            .ok_or_else(|| GraspError::NotFound(format!("{nonce} unknown")))
    }

    /// Validated state transition; first writer wins.
    pub fn transition(&self, nonce: SessionNonce, to: NegotiationState) -> GraspResult<()> {
        let mut inner = self.lock();
        let rec = inner
            .sessions
            .get_mut(&nonce)
            .ok_or_else(|| GraspError::NotFound(format!("{nonce} unknown")))?;
        if !rec.state.can_transition_to(to) {
            return Err(GraspError::InvalidState(format!(
                "{nonce}: {:?} -> {to:?} not permitted",
                rec.state
            )));
        }
        tracing::debug!(%nonce, from = ?rec.state, to = ?to, "session transition");
        rec.state = to;
        if to.is_terminal() {
            rec.ended_at = Some(Instant::now());
        }
        Ok(())
    }

    /// Forget a session outright (discovery and synchronization
    /// sessions have no terminal-state contract to preserve).
    pub fn remove(&self, nonce: SessionNonce) {
        self.lock().sessions.remove(&nonce);
    }

    /// Tear down every session owned by a deregistered ASA. Dropping
    /// the records closes their channels, which wakes any blocked call.
    pub fn remove_for_owner(&self, owner: AsaNonce) {
        self.lock().sessions.retain(|_, r| r.owner != owner);
    }

    /// Record that a discovery session was relayed; returns false if it
    /// had been relayed before (loop prevention).
    pub fn mark_relayed(&self, id: u32) -> bool {
        let mut inner = self.lock();
        if inner.relayed.len() >= self.limit {
            inner.relayed.clear();
        }
        inner.relayed.insert(id)
    }

    /// Drop terminal sessions that ended more than `linger` ago.
    pub fn sweep(&self, now: Instant, linger: Duration) {
        self.lock()
            .sessions
            .retain(|_, r| match r.ended_at {
                Some(t) => now.saturating_duration_since(t) < linger,
                None => true,
            });
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }
}
