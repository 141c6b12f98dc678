//! Discovery: multicast solicitation, response handling, relaying,
//! and the per-objective locator cache.

use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use grasp_core::{
    AsaNonce, GraspResult, Locator, LocatorOption, Message, Objective, DISC_TIMEOUT_UNIT,
};

use crate::engine::{log_send_error, GraspEngine};
use crate::sessions::SessionKind;

/// Cached discovery results beyond this many objectives push the
/// least recently used entry out.
const CACHE_LIMIT: usize = 500;

struct CacheEntry {
    name: String,
    locators: Vec<Locator>,
}

/// Locators learned from discovery responses, keyed by objective
/// name. Kept in most-recently-used order so eviction drops the
/// stalest objective first.
pub(crate) struct DiscoveryCache {
    inner: Mutex<Vec<CacheEntry>>,
}

impl DiscoveryCache {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<CacheEntry>> {
        self.inner.lock().expect("discovery cache poisoned")
    }

    /// Unexpired locators for `name`. A hit refreshes the entry's
    /// recency.
    pub(crate) fn lookup(&self, name: &str, now: Instant) -> Vec<Locator> {
        let mut entries = self.lock();
        let Some(pos) = entries.iter().position(|e| e.name == name) else {
            return Vec::new();
        };
        let mut entry = entries.remove(pos);
        entry.locators.retain(|l| !l.is_stale(now));
        if entry.locators.is_empty() {
            return Vec::new();
        }
        let found = entry.locators.clone();
        entries.push(entry);
        found
    }

    /// Drops whatever is cached for `name`.
    pub(crate) fn flush(&self, name: &str) {
        self.lock().retain(|e| e.name != name);
    }

    /// Folds freshly received locators into the entry for `name`,
    /// replacing any cached locator with the same address and port.
    pub(crate) fn merge(&self, name: &str, locators: Vec<Locator>) {
        if locators.is_empty() {
            return;
        }
        let mut entries = self.lock();
        let mut entry = match entries.iter().position(|e| e.name == name) {
            Some(pos) => entries.remove(pos),
            None => CacheEntry {
                name: name.to_owned(),
                locators: Vec::new(),
            },
        };
        for loc in locators {
            entry
                .locators
                .retain(|old| !(old.address == loc.address && old.port == loc.port));
            entry.locators.push(loc);
        }
        entries.push(entry);
        if entries.len() > CACHE_LIMIT {
            entries.remove(0);
        }
    }

    pub(crate) fn sweep(&self, now: Instant) {
        let mut entries = self.lock();
        for entry in entries.iter_mut() {
            entry.locators.retain(|l| !l.is_stale(now));
        }
        entries.retain(|e| !e.locators.is_empty());
    }
}

impl GraspEngine {
    /// Discovers providers of `objective`.
    ///
    /// Cached or locally registered providers are returned
    /// immediately unless `flush` asks for a fresh network round. A
    /// network round multicasts a Discovery and collects responses
    /// until the timeout runs out; with no explicit timeout the wait
    /// scales with the objective's loop count.
    ///
    /// `relay_ifi` is set only when the engine itself rediscovers on
    /// behalf of a relayed request; it suppresses the caller check and
    /// keeps the solicitation off the interface it arrived on.
    pub async fn discover(
        &self,
        nonce: AsaNonce,
        objective: &Objective,
        timeout: Option<Duration>,
        flush: bool,
        relay_ifi: Option<u32>,
    ) -> GraspResult<Vec<Locator>> {
        if relay_ifi.is_none() {
            self.registry.ensure_asa(nonce)?;
        }
        let now = Instant::now();
        if flush {
            self.discoveries.flush(&objective.name);
        } else {
            let found = self.known_providers(&objective.name, now);
            if !found.is_empty() {
                return Ok(found);
            }
        }

        let (snonce, mut rx) =
            self.sessions
                .open_local(nonce, self.own_locator(), SessionKind::Discovery)?;
        let solicit = Message::Discovery {
            session: snonce.id,
            initiator: self.config.address,
            objective: objective.clone(),
        };
        if let Err(e) = self.send_multicast(&solicit, relay_ifi).await {
            self.sessions.remove(snonce);
            return Err(e);
        }

        // With zero hops left the network round collects nothing; the
        // wait collapses to whatever the caller explicitly asked for.
        let unit = DISC_TIMEOUT_UNIT * u32::from(objective.loop_count);
        let wait = match timeout {
            Some(t) => t.max(unit),
            None => unit,
        };
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, rx.recv()).await {
                Err(_) | Ok(None) => break,
                Ok(Some(Message::DiscoveryResponse {
                    session,
                    ttl_ms,
                    locators,
                    divert,
                    ..
                })) if session == snonce.id => {
                    let expire = Instant::now() + Duration::from_millis(ttl_ms);
                    let learned: Vec<Locator> = locators
                        .into_iter()
                        .map(|l| l.into_locator(Some(expire), divert))
                        .collect();
                    debug!(objective = %objective.name, count = learned.len(), divert,
                        "discovery response");
                    self.discoveries.merge(&objective.name, learned);
                }
                Ok(Some(other)) => {
                    debug!(kind = other.kind(), "ignoring message on discovery session");
                }
            }
        }
        self.sessions.remove(snonce);
        Ok(self.known_providers(&objective.name, Instant::now()))
    }

    /// Cached locators plus local registrations, deduplicated.
    fn known_providers(&self, name: &str, now: Instant) -> Vec<Locator> {
        let mut found = self.discoveries.lookup(name, now);
        let own = self.own_locator();
        for provider in self.registry.providers(name, now) {
            let already = found
                .iter()
                .any(|l| l.address == own.address && l.port == own.port);
            if !already {
                found.push(own.clone().with_expire(provider.expire));
            }
        }
        found
    }

    /// Answers or relays an incoming Discovery.
    pub(crate) async fn handle_discovery(
        self: &Arc<Self>,
        from: IpAddr,
        ifi: u32,
        session: u32,
        initiator: IpAddr,
        objective: Objective,
    ) {
        if initiator == self.config.address {
            return; // our own solicitation echoed back
        }
        let now = Instant::now();
        let reply_to = Locator::ip(from);

        let local = self
            .registry
            .providers(&objective.name, now)
            .into_iter()
            .filter(|p| !p.local)
            .collect::<Vec<_>>();
        if !local.is_empty() {
            let response = self.discovery_response(session, initiator, vec![self.own_locator()], false);
            log_send_error(
                "failed to answer discovery",
                self.send_unicast(&reply_to, &response).await,
            );
            return;
        }

        let cached = self.discoveries.lookup(&objective.name, now);
        if !cached.is_empty() {
            let response = self.discovery_response(session, initiator, cached, true);
            log_send_error(
                "failed to divert discovery",
                self.send_unicast(&reply_to, &response).await,
            );
            return;
        }

        if !self.config.relay || objective.loop_count <= 1 {
            return;
        }
        if !self.sessions.mark_relayed(session) {
            return; // already relayed this one
        }
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut relayed = objective;
            relayed.loop_count -= 1;
            debug!(objective = %relayed.name, session, ifi, "relaying discovery");
            let found = match engine
                .discover(AsaNonce(0), &relayed, None, false, Some(ifi))
                .await
            {
                Ok(found) => found,
                Err(e) => {
                    debug!(error = %e, "relayed discovery failed");
                    return;
                }
            };
            if found.is_empty() {
                return;
            }
            let response = engine.discovery_response(session, initiator, found, true);
            log_send_error(
                "failed to forward relayed discovery result",
                engine.send_unicast(&reply_to, &response).await,
            );
        });
    }

    fn discovery_response(
        &self,
        session: u32,
        initiator: IpAddr,
        locators: Vec<Locator>,
        divert: bool,
    ) -> Message {
        Message::DiscoveryResponse {
            session,
            initiator,
            ttl_ms: self.config.discovery_cache_ttl.as_millis() as u64,
            locators: locators.iter().map(LocatorOption::from).collect(),
            divert,
        }
    }
}
