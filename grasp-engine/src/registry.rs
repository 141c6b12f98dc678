//! ASA and objective registries.
//!
//! Registrations carry an absolute expiry; every lookup treats expired
//! records as absent, and `sweep` reclaims them. All mutations are
//! all-or-nothing under one short-lived lock.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use grasp_core::{AsaNonce, GraspError, GraspResult, Objective};
use tokio::sync::mpsc;

use crate::negotiation::IncomingNegotiation;

/// Options for one objective registration.
#[derive(Debug, Clone, Default)]
pub struct RegistrationOptions {
    /// Validity of the registration; the engine default applies when
    /// `None`. A zero TTL registers a record that is already absent.
    pub ttl: Option<Duration>,
    /// Discoverable immediately, without waiting for a listener.
    pub discoverable: bool,
    /// Allow other ASAs to register the same objective name.
    pub overlap: bool,
    /// Restrict discovery of this registration to the local engine.
    pub local: bool,
}

/// A provider of an objective, as seen by the discovery engine.
#[derive(Debug, Clone)]
pub(crate) struct Provider {
    pub local: bool,
    pub expire: Instant,
}

struct ObjectiveEntry {
    objective: Objective,
    owner: AsaNonce,
    expire: Instant,
    discoverable: bool,
    overlap: bool,
    local: bool,
    /// Present while an ASA is listening for negotiation requests.
    neg_listener: Option<mpsc::Sender<IncomingNegotiation>>,
    /// Objective (with value) served to synchronization requests.
    synch_value: Option<Objective>,
}

impl ObjectiveEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expire > now
    }
}

struct Inner {
    asas: HashMap<AsaNonce, String>,
    objectives: Vec<ObjectiveEntry>,
}

pub(crate) struct Registry {
    max_asas: usize,
    max_objectives: usize,
    default_ttl: Duration,
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new(max_asas: usize, max_objectives: usize, default_ttl: Duration) -> Self {
        Self {
            max_asas,
            max_objectives,
            default_ttl,
            inner: Mutex::new(Inner {
                asas: HashMap::new(),
                objectives: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("registry lock poisoned")
    }

    /// Register an ASA under a fresh nonce.
    pub fn register_asa(&self, name: &str) -> GraspResult<AsaNonce> {
        if name.is_empty() {
            return Err(GraspError::InvalidArgument(
                "ASA name must not be empty".into(),
            ));
        }
        let mut inner = self.lock();
        if inner.asas.len() >= self.max_asas {
            return Err(GraspError::ResourceExhausted("ASA registry full".into()));
        }
        if inner.asas.values().any(|n| n == name) {
            return Err(GraspError::Conflict(format!("duplicate ASA name {name:?}")));
        }
        let nonce = allocate_nonce(|n| !inner.asas.contains_key(&AsaNonce(n)))?;
        inner.asas.insert(nonce, name.to_string());
        tracing::info!(%nonce, name, "ASA registered");
        Ok(nonce)
    }

    /// Remove an ASA and cascade removal of its objective registrations.
    /// The caller also tears down the ASA's sessions.
    pub fn deregister_asa(&self, name: &str, nonce: AsaNonce) -> GraspResult<()> {
        let mut inner = self.lock();
        match inner.asas.get(&nonce) {
            Some(n) if n == name => {}
            _ => {
                return Err(GraspError::NotFound(format!(
                    "no live registration of {name:?} under {nonce}"
                )))
            }
        }
        inner.asas.remove(&nonce);
        inner.objectives.retain(|o| o.owner != nonce);
        tracing::info!(%nonce, name, "ASA deregistered");
        Ok(())
    }

    /// Fail with `NotFound` unless the nonce names a live ASA.
    pub fn ensure_asa(&self, nonce: AsaNonce) -> GraspResult<()> {
        if self.lock().asas.contains_key(&nonce) {
            Ok(())
        } else {
            Err(GraspError::NotFound(format!("{nonce} is not registered")))
        }
    }

    /// Insert or refresh an objective registration.
    pub fn register_objective(
        &self,
        nonce: AsaNonce,
        objective: Objective,
        opts: &RegistrationOptions,
        now: Instant,
    ) -> GraspResult<()> {
        objective.flags.validate()?;
        let expire = now + opts.ttl.unwrap_or(self.default_ttl);

        let mut inner = self.lock();
        if !inner.asas.contains_key(&nonce) {
            return Err(GraspError::NotFound(format!("{nonce} is not registered")));
        }
        inner.objectives.retain(|o| o.is_live(now));

        for entry in inner.objectives.iter_mut() {
            if entry.objective.name != objective.name {
                continue;
            }
            if entry.owner == nonce {
                // re-registration refreshes the record in place
                entry.objective = objective;
                entry.expire = expire;
                entry.discoverable = entry.discoverable || opts.discoverable;
                entry.overlap = opts.overlap;
                entry.local = opts.local;
                return Ok(());
            }
            if !opts.overlap || !entry.overlap {
                return Err(GraspError::Conflict(format!(
                    "objective {:?} already registered by {}",
                    objective.name, entry.owner
                )));
            }
        }

        if inner.objectives.len() >= self.max_objectives {
            return Err(GraspError::ResourceExhausted(
                "objective registry full".into(),
            ));
        }
        tracing::debug!(%nonce, name = %objective.name, "objective registered");
        inner.objectives.push(ObjectiveEntry {
            objective,
            owner: nonce,
            expire,
            discoverable: opts.discoverable,
            overlap: opts.overlap,
            local: opts.local,
            neg_listener: None,
            synch_value: None,
        });
        Ok(())
    }

    /// Remove a live registration owned by `nonce`.
    pub fn deregister_objective(&self, nonce: AsaNonce, name: &str) -> GraspResult<()> {
        let now = Instant::now();
        let mut inner = self.lock();
        let before = inner.objectives.len();
        inner
            .objectives
            .retain(|o| !(o.owner == nonce && o.objective.name == name && o.is_live(now)));
        if inner.objectives.len() == before {
            return Err(GraspError::NotFound(format!(
                "objective {name:?} not registered by {nonce}"
            )));
        }
        Ok(())
    }

    /// Discoverable live providers of `name`.
    pub fn providers(&self, name: &str, now: Instant) -> Vec<Provider> {
        self.lock()
            .objectives
            .iter()
            .filter(|o| o.objective.name == name && o.discoverable && o.is_live(now))
            .map(|o| Provider {
                local: o.local,
                expire: o.expire,
            })
            .collect()
    }

    /// The live registration of `name` owned by `nonce`.
    pub fn owned_objective(&self, nonce: AsaNonce, name: &str) -> GraspResult<Objective> {
        let now = Instant::now();
        self.lock()
            .objectives
            .iter()
            .find(|o| o.owner == nonce && o.objective.name == name && o.is_live(now))
            .map(|o| o.objective.clone())
            .ok_or_else(|| {
                GraspError::NotFound(format!("objective {name:?} not registered by {nonce}"))
            })
    }

    /// Attach a negotiation listener; makes the registration
    /// discoverable, as listening implies availability.
    pub fn set_negotiation_listener(
        &self,
        nonce: AsaNonce,
        name: &str,
        tx: mpsc::Sender<IncomingNegotiation>,
    ) -> GraspResult<()> {
        let now = Instant::now();
        let mut inner = self.lock();
        let entry = inner
            .objectives
            .iter_mut()
            .find(|o| o.owner == nonce && o.objective.name == name && o.is_live(now))
            .ok_or_else(|| {
                GraspError::NotFound(format!("objective {name:?} not registered by {nonce}"))
            })?;
        if matches!(&entry.neg_listener, Some(t) if !t.is_closed()) {
            return Err(GraspError::Conflict(format!(
                "already listening for negotiation on {name:?}"
            )));
        }
        entry.neg_listener = Some(tx);
        entry.discoverable = true;
        Ok(())
    }

    /// The live negotiation listener for `name`, if any, with the
    /// nonce of the ASA listening.
    pub fn negotiation_listener(
        &self,
        name: &str,
    ) -> Option<(AsaNonce, mpsc::Sender<IncomingNegotiation>)> {
        let now = Instant::now();
        self.lock()
            .objectives
            .iter()
            .filter(|o| o.objective.name == name && o.is_live(now))
            .find_map(|o| {
                o.neg_listener
                    .clone()
                    .filter(|t| !t.is_closed())
                    .map(|t| (o.owner, t))
            })
    }

    pub fn clear_negotiation_listener(&self, nonce: AsaNonce, name: &str) -> GraspResult<()> {
        let mut inner = self.lock();
        let entry = inner
            .objectives
            .iter_mut()
            .find(|o| o.owner == nonce && o.objective.name == name && o.neg_listener.is_some())
            .ok_or_else(|| {
                GraspError::NotFound(format!("no negotiation listener for {name:?}"))
            })?;
        entry.neg_listener = None;
        Ok(())
    }

    /// Publish the objective value served to synchronization requests;
    /// makes the registration discoverable. Repeat calls refresh the
    /// value.
    pub fn set_synch_value(&self, nonce: AsaNonce, objective: Objective) -> GraspResult<()> {
        if !objective.flags.synchronizing {
            return Err(GraspError::InvalidArgument(format!(
                "objective {:?} is not a synchronization objective",
                objective.name
            )));
        }
        let now = Instant::now();
        let mut inner = self.lock();
        let entry = inner
            .objectives
            .iter_mut()
            .find(|o| {
                o.owner == nonce && o.objective.name == objective.name && o.is_live(now)
            })
            .ok_or_else(|| {
                GraspError::NotFound(format!(
                    "objective {:?} not registered by {nonce}",
                    objective.name
                ))
            })?;
        entry.synch_value = Some(objective);
        entry.discoverable = true;
        Ok(())
    }

    /// The value currently published for `name`, if any.
    pub fn synch_value(&self, name: &str) -> Option<Objective> {
        let now = Instant::now();
        self.lock()
            .objectives
            .iter()
            .filter(|o| o.objective.name == name && o.is_live(now))
            .find_map(|o| o.synch_value.clone())
    }

    pub fn clear_synch_value(&self, nonce: AsaNonce, name: &str) -> GraspResult<()> {
        let mut inner = self.lock();
        let entry = inner
            .objectives
            .iter_mut()
            .find(|o| o.owner == nonce && o.objective.name == name && o.synch_value.is_some())
            .ok_or_else(|| {
                GraspError::NotFound(format!("no synchronization listener for {name:?}"))
            })?;
        entry.synch_value = None;
        Ok(())
    }

    /// Drop expired registrations.
    pub fn sweep(&self, now: Instant) {
        self.lock().objectives.retain(|o| o.is_live(now));
    }
}

/// Draw a fresh nonzero 32-bit nonce. The space is effectively never
/// saturated, but the failure path is defined.
fn allocate_nonce(is_free: impl Fn(u32) -> bool) -> GraspResult<AsaNonce> {
    for _ in 0..64 {
        let n = rand::random::<u32>();
        if n != 0 && is_free(n) {
            return Ok(AsaNonce(n));
        }
    }
    Err(GraspError::ResourceExhausted("nonce space saturated".into()))
}
