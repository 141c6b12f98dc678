//! Flooding: unsolicited multicast of synchronization values, and the
//! cache of values heard from other nodes.

use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use grasp_core::{
    AsaNonce, FloodItem, GraspError, GraspResult, Locator, LocatorAddress, LocatorOption, Message,
    Objective, TaggedObjective,
};

use crate::engine::GraspEngine;

struct FloodEntry {
    objective: Objective,
    /// The advertised source; its `expire` governs entry lifetime.
    source: Locator,
}

/// Flooded values heard on the wire (and sent by local ASAs), oldest
/// first. One entry per objective name and source address.
pub(crate) struct FloodCache {
    limit: usize,
    inner: Mutex<Vec<FloodEntry>>,
}

impl FloodCache {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            limit,
            inner: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<FloodEntry>> {
        self.inner.lock().expect("flood cache poisoned")
    }

    pub(crate) fn insert(&self, tagged: TaggedObjective) {
        let mut entries = self.lock();
        entries.retain(|e| {
            !(e.objective.name == tagged.objective.name && e.source.address == tagged.source.address)
        });
        if entries.len() >= self.limit {
            entries.remove(0);
        }
        entries.push(FloodEntry {
            objective: tagged.objective,
            source: tagged.source,
        });
    }

    /// Every unexpired flooded value.
    pub(crate) fn all(&self, now: Instant) -> Vec<TaggedObjective> {
        self.lock()
            .iter()
            .filter(|e| !e.source.is_stale(now))
            .map(|e| TaggedObjective {
                objective: e.objective.clone(),
                source: e.source.clone(),
            })
            .collect()
    }

    /// The most recently heard unexpired value for `name`.
    pub(crate) fn first_value(&self, name: &str, now: Instant) -> Option<Objective> {
        self.lock()
            .iter()
            .rev()
            .find(|e| e.objective.name == name && !e.source.is_stale(now))
            .map(|e| e.objective.clone())
    }

    /// Expires live entries matching `name` and source address.
    /// Returns false when nothing matched.
    pub(crate) fn expire(&self, name: &str, source: &LocatorAddress, now: Instant) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| {
            !(e.objective.name == name && e.source.address == *source && !e.source.is_stale(now))
        });
        entries.len() < before
    }

    pub(crate) fn sweep(&self, now: Instant) {
        self.lock().retain(|e| !e.source.is_stale(now));
    }
}

impl GraspEngine {
    /// Floods the given tagged objectives to all neighbors and seeds
    /// the local cache with them. `ttl` of `None` floods values that
    /// never expire.
    pub async fn flood(
        &self,
        nonce: AsaNonce,
        ttl: Option<Duration>,
        tagged: &[TaggedObjective],
    ) -> GraspResult<()> {
        if tagged.is_empty() {
            return Err(GraspError::InvalidArgument("nothing to flood".into()));
        }
        for t in tagged {
            let registered = self.registry.owned_objective(nonce, &t.objective.name)?;
            if !registered.flags.synchronizing {
                return Err(GraspError::InvalidArgument(format!(
                    "objective {} is not synchronizable",
                    t.objective.name
                )));
            }
            if t.source.address.ip().is_none() {
                return Err(GraspError::InvalidArgument(
                    "flood sources must be IP locators".into(),
                ));
            }
        }
        let message = Message::Flood {
            session: rand::random(),
            initiator: self.config.address,
            ttl_ms: ttl.map_or(0, |d| d.as_millis() as u64),
            objectives: tagged
                .iter()
                .map(|t| FloodItem {
                    locator: Some(LocatorOption::from(&t.source)),
                    objective: t.objective.clone(),
                })
                .collect(),
        };
        self.send_multicast(&message, None).await?;
        // Seed our own cache so local consumers see it too.
        let expire = ttl.map(|d| Instant::now() + d);
        for t in tagged {
            let mut source = t.source.clone();
            source.expire = expire;
            self.floods.insert(TaggedObjective {
                objective: t.objective.clone(),
                source,
            });
        }
        debug!(count = tagged.len(), "flooded objectives");
        Ok(())
    }

    /// The currently cached flooded values. An empty result is a
    /// valid answer, not an error.
    pub fn get_flood(&self, nonce: AsaNonce) -> GraspResult<Vec<TaggedObjective>> {
        self.registry.ensure_asa(nonce)?;
        Ok(self.floods.all(Instant::now()))
    }

    /// Drops the cached flood entry matching the given objective name
    /// and source address.
    pub fn expire_flood(&self, nonce: AsaNonce, tagged: &TaggedObjective) -> GraspResult<()> {
        self.registry.ensure_asa(nonce)?;
        if self
            .floods
            .expire(&tagged.objective.name, &tagged.source.address, Instant::now())
        {
            Ok(())
        } else {
            Err(GraspError::NotFound(format!(
                "no flood entry for {} from {}",
                tagged.objective.name, tagged.source.address
            )))
        }
    }

    pub(crate) fn handle_flood(
        &self,
        from: IpAddr,
        initiator: IpAddr,
        ttl_ms: u64,
        items: Vec<FloodItem>,
    ) {
        if initiator == self.config.address {
            return; // our own flood echoed back
        }
        let expire = (ttl_ms > 0).then(|| Instant::now() + Duration::from_millis(ttl_ms));
        for item in items {
            let source = match item.locator {
                Some(opt) => opt.into_locator(expire, false),
                None => {
                    let mut loc = Locator::ip(initiator);
                    loc.expire = expire;
                    loc
                }
            };
            debug!(objective = %item.objective.name, %from, "caching flooded objective");
            self.floods.insert(TaggedObjective {
                objective: item.objective,
                source,
            });
        }
    }
}
