//! The GRASP engine proper. One instance per node; ASAs register
//! against it and drive discovery, negotiation, synchronization and
//! flooding through the methods spread across the sibling modules.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use grasp_core::{
    AsaNonce, GraspError, GraspResult, Locator, Message, Objective, MAX_MESSAGE_SIZE,
};

use crate::config::EngineConfig;
use crate::discovery::DiscoveryCache;
use crate::flood::FloodCache;
use crate::registry::{Registry, RegistrationOptions};
use crate::sessions::SessionTable;
use crate::transport::Transport;

/// A GRASP instance. All state lives behind interior mutability, so
/// the engine is shared as `Arc<GraspEngine>` between ASAs and the
/// datagram pump feeding [`GraspEngine::handle_datagram`].
pub struct GraspEngine {
    pub(crate) config: EngineConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) registry: Registry,
    pub(crate) sessions: SessionTable,
    pub(crate) discoveries: DiscoveryCache,
    pub(crate) floods: FloodCache,
}

impl GraspEngine {
    pub fn new(config: EngineConfig, transport: Arc<dyn Transport>) -> Self {
        let registry = Registry::new(
            config.max_asas,
            config.max_objectives,
            config.discovery_cache_ttl,
        );
        let sessions = SessionTable::new(config.max_sessions);
        let floods = FloodCache::new(config.max_floods);
        Self {
            config,
            transport,
            registry,
            sessions,
            discoveries: DiscoveryCache::new(),
            floods,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Registers an ASA by name and hands back the nonce it must quote
    /// on every subsequent call.
    pub fn register_asa(&self, name: &str) -> GraspResult<AsaNonce> {
        let nonce = self.registry.register_asa(name)?;
        debug!(asa = name, %nonce, "ASA registered");
        Ok(nonce)
    }

    /// Deregisters an ASA and tears down everything it owns: its
    /// objectives, listeners, and any in-progress sessions.
    pub fn deregister_asa(&self, name: &str, nonce: AsaNonce) -> GraspResult<()> {
        self.registry.deregister_asa(name, nonce)?;
        self.sessions.remove_for_owner(nonce);
        debug!(asa = name, %nonce, "ASA deregistered");
        Ok(())
    }

    pub fn register_objective(
        &self,
        nonce: AsaNonce,
        objective: Objective,
        opts: &RegistrationOptions,
    ) -> GraspResult<()> {
        self.registry
            .register_objective(nonce, objective, opts, Instant::now())
    }

    pub fn deregister_objective(&self, nonce: AsaNonce, name: &str) -> GraspResult<()> {
        self.registry.deregister_objective(nonce, name)
    }

    /// The locator this engine answers unicast GRASP traffic on.
    pub(crate) fn own_locator(&self) -> Locator {
        Locator::ip(self.config.address).with_port(self.config.port)
    }

    pub(crate) fn timeout_or_default(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or(self.config.default_timeout)
    }

    pub(crate) async fn send_unicast(&self, to: &Locator, msg: &Message) -> GraspResult<()> {
        let payload = Bytes::from(msg.encode()?);
        self.transport.unicast(to, payload).await
    }

    pub(crate) async fn send_multicast(
        &self,
        msg: &Message,
        exclude_ifi: Option<u32>,
    ) -> GraspResult<()> {
        let payload = Bytes::from(msg.encode()?);
        self.transport.multicast(payload, exclude_ifi).await
    }

    /// Feeds one received datagram into the engine. Session-bound
    /// messages are routed to whichever blocking call is waiting on
    /// the session; the rest are handled inline.
    pub async fn handle_datagram(
        self: &Arc<Self>,
        from: IpAddr,
        ifi: u32,
        payload: &[u8],
    ) -> GraspResult<()> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(GraspError::Codec(format!(
                "datagram of {} bytes exceeds maximum of {}",
                payload.len(),
                MAX_MESSAGE_SIZE
            )));
        }
        let msg = Message::decode(payload)?;
        debug!(%from, ifi, kind = msg.kind(), session = msg.session(), "datagram received");
        match msg {
            Message::Discovery {
                session,
                initiator,
                objective,
            } => {
                self.handle_discovery(from, ifi, session, initiator, objective)
                    .await
            }
            Message::RequestNegotiate { session, objective } => {
                self.handle_request_negotiate(from, session, objective).await
            }
            Message::RequestSynchronize { session, objective } => {
                self.handle_request_synchronize(from, session, objective)
                    .await
            }
            Message::Flood {
                initiator,
                ttl_ms,
                objectives,
                ..
            } => {
                self.handle_flood(from, initiator, ttl_ms, objectives);
            }
            other => {
                // Everything else belongs to an open session.
                let session = other.session();
                if !self.sessions.deliver(session, from, other) {
                    debug!(%from, session, "dropping message for unknown session");
                }
            }
        }
        Ok(())
    }

    /// Drops expired registrations, cache entries and finished
    /// sessions. Called from [`GraspEngine::spawn_maintenance`], or
    /// directly by embedders running their own timer.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.registry.sweep(now);
        self.discoveries.sweep(now);
        self.floods.sweep(now);
        // Finished sessions linger so late callers see InvalidState
        // rather than NotFound.
        self.sessions.sweep(now, self.config.default_timeout);
    }

    /// Spawns the periodic maintenance task. The task runs until the
    /// returned handle is aborted or the runtime shuts down.
    pub fn spawn_maintenance(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                engine.sweep();
            }
        })
    }
}

impl std::fmt::Debug for GraspEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraspEngine")
            .field("address", &self.config.address)
            .field("port", &self.config.port)
            .finish()
    }
}

/// Convenience for embedders that do not care about transport errors
/// on best-effort replies.
pub(crate) fn log_send_error(context: &str, result: GraspResult<()>) {
    if let Err(e) = result {
        warn!(error = %e, "{context}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiation::NegotiationReply;
    use crate::transport::{Datagram, LinkHub, LinkTransport, Transport};
    use async_trait::async_trait;
    use bytes::Bytes;
    use grasp_core::{LocatorAddress, ObjectiveFlags, TaggedObjective};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn pump(engine: Arc<GraspEngine>, mut rx: mpsc::UnboundedReceiver<Datagram>) {
        tokio::spawn(async move {
            while let Some(d) = rx.recv().await {
                let _ = engine.handle_datagram(d.from, d.ifi, d.payload.as_ref()).await;
            }
        });
    }

    fn node(hub: &Arc<LinkHub>, addr: &str) -> Arc<GraspEngine> {
        let ip: IpAddr = addr.parse().unwrap();
        let (transport, rx) = hub.attach(ip);
        let engine = Arc::new(GraspEngine::new(
            EngineConfig::with_address(ip),
            Arc::new(transport),
        ));
        pump(Arc::clone(&engine), rx);
        engine
    }

    fn neg_objective(name: &str) -> Objective {
        Objective::new(
            name,
            ObjectiveFlags {
                discoverable: true,
                negotiable: true,
                ..Default::default()
            },
        )
        .unwrap()
        .with_loop_count(2)
    }

    fn synch_objective(name: &str, value: &[u8]) -> Objective {
        Objective::new(
            name,
            ObjectiveFlags {
                discoverable: true,
                synchronizing: true,
                ..Default::default()
            },
        )
        .unwrap()
        .with_value(value.to_vec())
        .with_loop_count(2)
    }

    fn discoverable() -> RegistrationOptions {
        RegistrationOptions {
            discoverable: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn discovery_reaches_a_remote_provider() {
        init_tracing();
        let hub = LinkHub::new();
        let a = node(&hub, "2001:db8::a");
        let b = node(&hub, "2001:db8::b");

        let asa_b = b.register_asa("provider").unwrap();
        b.register_objective(asa_b, neg_objective("EX1"), &discoverable())
            .unwrap();
        let listener = b.listen_negotiate(asa_b, &neg_objective("EX1")).unwrap();

        let asa_a = a.register_asa("seeker").unwrap();
        let found = a
            .discover(
                asa_a,
                &neg_objective("EX1"),
                Some(Duration::from_millis(300)),
                false,
                None,
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(
            found[0].address,
            LocatorAddress::Ip("2001:db8::b".parse().unwrap())
        );
        drop(listener);
    }

    #[tokio::test]
    async fn local_registration_is_discovered_without_a_network_round() {
        let hub = LinkHub::new();
        let a = node(&hub, "2001:db8::a");
        let asa = a.register_asa("self-provider").unwrap();
        a.register_objective(asa, neg_objective("EX1"), &discoverable())
            .unwrap();

        let found = a
            .discover(asa, &neg_objective("EX1"), None, false, None)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(
            found[0].address,
            LocatorAddress::Ip("2001:db8::a".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn discovery_without_providers_comes_back_empty() {
        let hub = LinkHub::new();
        let a = node(&hub, "2001:db8::a");
        let _b = node(&hub, "2001:db8::b");
        let asa = a.register_asa("seeker").unwrap();
        let found = a
            .discover(
                asa,
                &neg_objective("EX1").with_loop_count(1),
                Some(Duration::from_millis(150)),
                false,
                None,
            )
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    /// A node attached to two links, so a relay sits between segments
    /// that cannot hear each other's multicasts.
    struct TwoLinkTransport {
        near: LinkTransport,
        far: LinkTransport,
    }

    #[async_trait]
    impl Transport for TwoLinkTransport {
        async fn unicast(&self, to: &Locator, payload: Bytes) -> GraspResult<()> {
            match self.near.unicast(to, payload.clone()).await {
                Ok(()) => Ok(()),
                Err(_) => self.far.unicast(to, payload).await,
            }
        }

        async fn multicast(&self, payload: Bytes, exclude_ifi: Option<u32>) -> GraspResult<()> {
            if exclude_ifi != Some(1) {
                self.near.multicast(payload.clone(), None).await?;
            }
            if exclude_ifi != Some(2) {
                self.far.multicast(payload, None).await?;
            }
            Ok(())
        }
    }

    fn pump_ifi(engine: Arc<GraspEngine>, mut rx: mpsc::UnboundedReceiver<Datagram>, ifi: u32) {
        tokio::spawn(async move {
            while let Some(d) = rx.recv().await {
                let _ = engine.handle_datagram(d.from, ifi, d.payload.as_ref()).await;
            }
        });
    }

    #[tokio::test]
    async fn relay_bridges_discovery_across_links() {
        init_tracing();
        let near = LinkHub::new();
        let far = LinkHub::new();
        let a = node(&near, "2001:db8:1::a");
        let b = node(&far, "2001:db8:2::b");

        // the relay joins both links under one address
        let m_ip: IpAddr = "2001:db8:1::99".parse().unwrap();
        let (near_link, near_rx) = near.attach(m_ip);
        let (far_link, far_rx) = far.attach(m_ip);
        let m = Arc::new(GraspEngine::new(
            EngineConfig::with_address(m_ip).with_relay(),
            Arc::new(TwoLinkTransport {
                near: near_link,
                far: far_link,
            }),
        ));
        pump_ifi(Arc::clone(&m), near_rx, 1);
        pump_ifi(Arc::clone(&m), far_rx, 2);

        let asa_b = b.register_asa("far-provider").unwrap();
        b.register_objective(asa_b, neg_objective("EX1"), &discoverable())
            .unwrap();
        b.register_objective(asa_b, neg_objective("EX2"), &discoverable())
            .unwrap();

        let asa_a = a.register_asa("seeker").unwrap();
        let found = a
            .discover(
                asa_a,
                &neg_objective("EX1"),
                Some(Duration::from_millis(500)),
                false,
                None,
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(
            found[0].address,
            LocatorAddress::Ip("2001:db8:2::b".parse().unwrap())
        );
        assert!(found[0].diverted);

        // one hop left: the solicitation stops at the relay
        let found = a
            .discover(
                asa_a,
                &neg_objective("EX2").with_loop_count(1),
                Some(Duration::from_millis(200)),
                false,
                None,
            )
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn negotiation_accepted_outright() {
        init_tracing();
        let hub = LinkHub::new();
        let a = node(&hub, "2001:db8::a");
        let b = node(&hub, "2001:db8::b");

        let asa_b = b.register_asa("responder").unwrap();
        b.register_objective(asa_b, neg_objective("EX1"), &discoverable())
            .unwrap();
        let mut listener = b.listen_negotiate(asa_b, &neg_objective("EX1")).unwrap();
        let responder = {
            let b = Arc::clone(&b);
            tokio::spawn(async move {
                let incoming = listener.accept().await.unwrap();
                b.end_negotiate(asa_b, incoming.session, true, None)
                    .await
                    .unwrap();
            })
        };

        let asa_a = a.register_asa("initiator").unwrap();
        a.register_objective(asa_a, neg_objective("EX1"), &RegistrationOptions::default())
            .unwrap();
        let offer = neg_objective("EX1").with_value(vec![0x2a]);
        let reply = a
            .req_negotiate(
                asa_a,
                &offer,
                &Locator::ip("2001:db8::b".parse().unwrap()),
                Some(Duration::from_secs(2)),
            )
            .await
            .unwrap();
        match reply {
            NegotiationReply::Accepted { objective } => assert_eq!(objective.value, vec![0x2a]),
            other => panic!("expected acceptance, got {other:?}"),
        }
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn negotiation_counter_then_accept() {
        init_tracing();
        let hub = LinkHub::new();
        let a = node(&hub, "2001:db8::a");
        let b = node(&hub, "2001:db8::b");

        let asa_b = b.register_asa("responder").unwrap();
        b.register_objective(asa_b, neg_objective("EX1"), &discoverable())
            .unwrap();
        let mut listener = b.listen_negotiate(asa_b, &neg_objective("EX1")).unwrap();
        let responder = {
            let b = Arc::clone(&b);
            tokio::spawn(async move {
                let incoming = listener.accept().await.unwrap();
                let counter = incoming.objective.clone().with_value(vec![0x10]);
                let reply = b
                    .negotiate_step(
                        asa_b,
                        incoming.session,
                        &counter,
                        Some(Duration::from_secs(2)),
                    )
                    .await
                    .unwrap();
                match reply {
                    NegotiationReply::Accepted { objective } => {
                        assert_eq!(objective.value, vec![0x10])
                    }
                    other => panic!("expected acceptance of the counter, got {other:?}"),
                }
            })
        };

        let asa_a = a.register_asa("initiator").unwrap();
        a.register_objective(asa_a, neg_objective("EX1"), &RegistrationOptions::default())
            .unwrap();
        let offer = neg_objective("EX1").with_value(vec![0x20]);
        let reply = a
            .req_negotiate(
                asa_a,
                &offer,
                &Locator::ip("2001:db8::b".parse().unwrap()),
                Some(Duration::from_secs(2)),
            )
            .await
            .unwrap();
        let session = match reply {
            NegotiationReply::Counter { session, objective } => {
                assert_eq!(objective.value, vec![0x10]);
                // the loop count burned one hop on the way back
                assert_eq!(objective.loop_count, 1);
                session
            }
            other => panic!("expected a counter-offer, got {other:?}"),
        };
        a.end_negotiate(asa_a, session, true, None).await.unwrap();
        responder.await.unwrap();

        // the session is over; further steps are invalid
        let err = a
            .negotiate_step(asa_a, session, &offer, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, GraspError::InvalidState(_)));
    }

    #[tokio::test]
    async fn negotiation_declined_when_nobody_listens() {
        let hub = LinkHub::new();
        let a = node(&hub, "2001:db8::a");
        let _b = node(&hub, "2001:db8::b");

        let asa_a = a.register_asa("initiator").unwrap();
        a.register_objective(asa_a, neg_objective("EX1"), &RegistrationOptions::default())
            .unwrap();
        let reply = a
            .req_negotiate(
                asa_a,
                &neg_objective("EX1"),
                &Locator::ip("2001:db8::b".parse().unwrap()),
                Some(Duration::from_secs(2)),
            )
            .await
            .unwrap();
        match reply {
            NegotiationReply::Declined { reason } => {
                assert!(reason.contains("not available"), "reason: {reason}")
            }
            other => panic!("expected a decline, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn silent_responder_times_the_initiator_out() {
        let hub = LinkHub::new();
        let a = node(&hub, "2001:db8::a");
        let b = node(&hub, "2001:db8::b");

        let asa_b = b.register_asa("responder").unwrap();
        b.register_objective(asa_b, neg_objective("EX1"), &discoverable())
            .unwrap();
        // accepted off the queue but never answered
        let _listener = b.listen_negotiate(asa_b, &neg_objective("EX1")).unwrap();

        let asa_a = a.register_asa("initiator").unwrap();
        a.register_objective(asa_a, neg_objective("EX1"), &RegistrationOptions::default())
            .unwrap();
        let err = a
            .req_negotiate(
                asa_a,
                &neg_objective("EX1"),
                &Locator::ip("2001:db8::b".parse().unwrap()),
                Some(Duration::from_millis(150)),
            )
            .await
            .unwrap_err();
        assert_eq!(err, GraspError::Timeout);
    }

    #[tokio::test]
    async fn negotiate_wait_with_zero_timeout_returns_at_once() {
        init_tracing();
        let hub = LinkHub::new();
        let a = node(&hub, "2001:db8::a");
        let b = node(&hub, "2001:db8::b");

        let asa_b = b.register_asa("responder").unwrap();
        b.register_objective(asa_b, neg_objective("EX1"), &discoverable())
            .unwrap();
        let mut listener = b.listen_negotiate(asa_b, &neg_objective("EX1")).unwrap();

        let asa_a = a.register_asa("initiator").unwrap();
        a.register_objective(asa_a, neg_objective("EX1"), &RegistrationOptions::default())
            .unwrap();
        let initiator = {
            let a = Arc::clone(&a);
            tokio::spawn(async move {
                let _ = a
                    .req_negotiate(
                        asa_a,
                        &neg_objective("EX1"),
                        &Locator::ip("2001:db8::b".parse().unwrap()),
                        Some(Duration::from_millis(500)),
                    )
                    .await;
            })
        };

        let incoming = listener.accept().await.unwrap();
        // nothing is pending on the session; a zero timeout must not block
        let err = b
            .negotiate_wait(asa_b, incoming.session, Some(Duration::ZERO))
            .await
            .unwrap_err();
        assert_eq!(err, GraspError::Timeout);
        initiator.await.unwrap();
    }

    #[tokio::test]
    async fn wait_message_extends_the_deadline() {
        init_tracing();
        let hub = LinkHub::new();
        let a = node(&hub, "2001:db8::a");
        let b = node(&hub, "2001:db8::b");

        let asa_b = b.register_asa("responder").unwrap();
        b.register_objective(asa_b, neg_objective("EX1"), &discoverable())
            .unwrap();
        let mut listener = b.listen_negotiate(asa_b, &neg_objective("EX1")).unwrap();
        let responder = {
            let b = Arc::clone(&b);
            tokio::spawn(async move {
                let incoming = listener.accept().await.unwrap();
                b.send_wait(asa_b, incoming.session, Duration::from_millis(800))
                    .await
                    .unwrap();
                tokio::time::sleep(Duration::from_millis(300)).await;
                b.end_negotiate(asa_b, incoming.session, true, None)
                    .await
                    .unwrap();
            })
        };

        let asa_a = a.register_asa("initiator").unwrap();
        a.register_objective(asa_a, neg_objective("EX1"), &RegistrationOptions::default())
            .unwrap();
        // shorter than the responder's pause; only the wait keeps it alive
        let reply = a
            .req_negotiate(
                asa_a,
                &neg_objective("EX1"),
                &Locator::ip("2001:db8::b".parse().unwrap()),
                Some(Duration::from_millis(150)),
            )
            .await
            .unwrap();
        assert!(matches!(reply, NegotiationReply::Accepted { .. }));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn invalid_aborts_both_sides() {
        let hub = LinkHub::new();
        let a = node(&hub, "2001:db8::a");
        let b = node(&hub, "2001:db8::b");

        let asa_b = b.register_asa("responder").unwrap();
        b.register_objective(asa_b, neg_objective("EX1"), &discoverable())
            .unwrap();
        let mut listener = b.listen_negotiate(asa_b, &neg_objective("EX1")).unwrap();
        let responder = {
            let b = Arc::clone(&b);
            tokio::spawn(async move {
                let incoming = listener.accept().await.unwrap();
                b.send_invalid(asa_b, incoming.session, "malformed value")
                    .await
                    .unwrap();
                // own session is terminal too
                let err = b
                    .negotiate_step(
                        asa_b,
                        incoming.session,
                        &incoming.objective,
                        Some(Duration::from_millis(50)),
                    )
                    .await
                    .unwrap_err();
                assert!(matches!(err, GraspError::InvalidState(_)));
            })
        };

        let asa_a = a.register_asa("initiator").unwrap();
        a.register_objective(asa_a, neg_objective("EX1"), &RegistrationOptions::default())
            .unwrap();
        let err = a
            .req_negotiate(
                asa_a,
                &neg_objective("EX1"),
                &Locator::ip("2001:db8::b".parse().unwrap()),
                Some(Duration::from_secs(2)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GraspError::InvalidState(_)));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn unlinked_engines_are_independent() {
        let hub_a = LinkHub::new();
        let hub_b = LinkHub::new();
        let a = node(&hub_a, "2001:db8::a");
        let b = node(&hub_b, "2001:db8::b");

        let asa_a = a.register_asa("provider").unwrap();
        a.register_objective(asa_a, neg_objective("EX1"), &discoverable())
            .unwrap();

        let asa_b = b.register_asa("seeker").unwrap();
        let found = b
            .discover(
                asa_b,
                &neg_objective("EX1").with_loop_count(1),
                Some(Duration::from_millis(120)),
                false,
                None,
            )
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn synchronization_pulls_the_served_value() {
        let hub = LinkHub::new();
        let a = node(&hub, "2001:db8::a");
        let b = node(&hub, "2001:db8::b");

        let asa_b = b.register_asa("source").unwrap();
        let served = synch_objective("EX2", b"current");
        b.register_objective(asa_b, served.clone(), &discoverable())
            .unwrap();
        b.listen_synchronize(asa_b, &served).unwrap();

        let asa_a = a.register_asa("sink").unwrap();
        let value = a
            .synchronize(
                asa_a,
                &synch_objective("EX2", b""),
                Some(&Locator::ip("2001:db8::b".parse().unwrap())),
                Some(Duration::from_secs(2)),
            )
            .await
            .unwrap();
        assert_eq!(value.value, b"current");

        b.stop_synchronize(asa_b, "EX2").unwrap();
        let err = a
            .synchronize(
                asa_a,
                &synch_objective("EX2", b""),
                Some(&Locator::ip("2001:db8::b".parse().unwrap())),
                Some(Duration::from_secs(2)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GraspError::Declined { .. }));
    }

    #[tokio::test]
    async fn synchronization_discovers_its_provider() {
        let hub = LinkHub::new();
        let a = node(&hub, "2001:db8::a");
        let b = node(&hub, "2001:db8::b");

        let asa_b = b.register_asa("source").unwrap();
        let served = synch_objective("EX2", b"found-you");
        b.register_objective(asa_b, served.clone(), &discoverable())
            .unwrap();
        b.listen_synchronize(asa_b, &served).unwrap();

        let asa_a = a.register_asa("sink").unwrap();
        let value = a
            .synchronize(
                asa_a,
                &synch_objective("EX2", b""),
                None,
                Some(Duration::from_secs(2)),
            )
            .await
            .unwrap();
        assert_eq!(value.value, b"found-you");
    }

    #[tokio::test]
    async fn flooded_values_are_cached_and_expirable() {
        let hub = LinkHub::new();
        let a = node(&hub, "2001:db8::a");
        let b = node(&hub, "2001:db8::b");

        let asa_a = a.register_asa("flooder").unwrap();
        let objective = synch_objective("EX3", b"spread");
        a.register_objective(asa_a, objective.clone(), &discoverable())
            .unwrap();
        let tagged = TaggedObjective {
            objective,
            source: Locator::ip("2001:db8::a".parse().unwrap()),
        };
        a.flood(asa_a, Some(Duration::from_secs(30)), std::slice::from_ref(&tagged))
            .await
            .unwrap();

        // the flooder sees its own entry at once
        assert_eq!(a.get_flood(asa_a).unwrap().len(), 1);

        let asa_b = b.register_asa("observer").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let cached = b.get_flood(asa_b).unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].objective.value, b"spread");

        b.expire_flood(asa_b, &cached[0]).unwrap();
        assert!(b.get_flood(asa_b).unwrap().is_empty());
        assert!(matches!(
            b.expire_flood(asa_b, &tagged),
            Err(GraspError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn synchronize_prefers_the_flood_cache() {
        let hub = LinkHub::new();
        let a = node(&hub, "2001:db8::a");
        let b = node(&hub, "2001:db8::b");

        let asa_a = a.register_asa("flooder").unwrap();
        let objective = synch_objective("EX3", b"fresh");
        a.register_objective(asa_a, objective.clone(), &discoverable())
            .unwrap();
        a.flood(
            asa_a,
            None,
            &[TaggedObjective {
                objective,
                source: Locator::ip("2001:db8::a".parse().unwrap()),
            }],
        )
        .await
        .unwrap();

        let asa_b = b.register_asa("sink").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        // answered from the cache, no session needed
        let value = b
            .synchronize(asa_b, &synch_objective("EX3", b""), None, None)
            .await
            .unwrap();
        assert_eq!(value.value, b"fresh");
    }

    #[tokio::test]
    async fn deregistering_an_asa_wakes_its_blocked_calls() {
        let hub = LinkHub::new();
        let a = node(&hub, "2001:db8::a");
        let b = node(&hub, "2001:db8::b");

        let asa_b = b.register_asa("responder").unwrap();
        b.register_objective(asa_b, neg_objective("EX1"), &discoverable())
            .unwrap();
        let _listener = b.listen_negotiate(asa_b, &neg_objective("EX1")).unwrap();

        let asa_a = a.register_asa("initiator").unwrap();
        a.register_objective(asa_a, neg_objective("EX1"), &RegistrationOptions::default())
            .unwrap();
        let pending = {
            let a = Arc::clone(&a);
            tokio::spawn(async move {
                a.req_negotiate(
                    asa_a,
                    &neg_objective("EX1"),
                    &Locator::ip("2001:db8::b".parse().unwrap()),
                    Some(Duration::from_secs(10)),
                )
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        a.deregister_asa("initiator", asa_a).unwrap();
        let outcome = pending.await.unwrap();
        assert!(matches!(outcome, Err(GraspError::InvalidState(_))));
    }

    #[tokio::test]
    async fn oversized_datagrams_are_rejected() {
        let hub = LinkHub::new();
        let a = node(&hub, "2001:db8::a");
        let err = a
            .handle_datagram(
                "2001:db8::b".parse().unwrap(),
                1,
                &vec![0u8; MAX_MESSAGE_SIZE + 1],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GraspError::Codec(_)));
    }

    #[tokio::test]
    async fn session_nonce_scoping_separates_initiators() {
        // two initiators happen to pick ids; responder scopes by source
        let hub = LinkHub::new();
        let a = node(&hub, "2001:db8::a");
        let b = node(&hub, "2001:db8::b");
        let c = node(&hub, "2001:db8::c");

        let asa_c = c.register_asa("responder").unwrap();
        c.register_objective(asa_c, neg_objective("EX1"), &discoverable())
            .unwrap();
        let mut listener = c.listen_negotiate(asa_c, &neg_objective("EX1")).unwrap();
        let responder = {
            let c = Arc::clone(&c);
            tokio::spawn(async move {
                for _ in 0..2 {
                    let incoming = listener.accept().await.unwrap();
                    assert!(incoming.session.source.is_some());
                    c.end_negotiate(asa_c, incoming.session, true, None)
                        .await
                        .unwrap();
                }
            })
        };

        let peer = Locator::ip("2001:db8::c".parse().unwrap());
        for (engine, name) in [(&a, "first"), (&b, "second")] {
            let asa = engine.register_asa(name).unwrap();
            engine
                .register_objective(asa, neg_objective("EX1"), &RegistrationOptions::default())
                .unwrap();
            let reply = engine
                .req_negotiate(asa, &neg_objective("EX1"), &peer, Some(Duration::from_secs(2)))
                .await
                .unwrap();
            assert!(matches!(reply, NegotiationReply::Accepted { .. }));
        }
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn maintenance_sweeps_expired_registrations() {
        let hub = LinkHub::new();
        let a = node(&hub, "2001:db8::a");
        let asa = a.register_asa("short-lived").unwrap();
        a.register_objective(
            asa,
            neg_objective("EX1"),
            &RegistrationOptions {
                discoverable: true,
                ttl: Some(Duration::from_millis(50)),
                ..Default::default()
            },
        )
        .unwrap();
        let _task = a.spawn_maintenance(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(150)).await;
        let found = a
            .discover(asa, &neg_objective("EX1"), None, false, None)
            .await
            .unwrap();
        assert!(found.is_empty());
    }
}
