//! Orchestration gateway: sessions, events, routing, replies.
//!
//! One event loop per tenant session applies lifecycle events to the state
//! machine, routes inbound messages, and hands failures to the reconnect
//! supervisor. Replies flow back through the session's connection handle.

use crate::debounce::{DebounceAggregator, FlushHandler};
use crate::pipeline::ConversationPipeline;
use crate::registry::SessionRegistry;
use crate::router::{MessageRouter, RouteOutcome};
use crate::session::{ConnectionState, TenantSession};
use crate::supervisor::{ReconnectSupervisor, RetryDecision};
use async_trait::async_trait;
use nexo_platform::{
    ConnectionEvent, InboundMessage, OutboundMessage, PlatformConnector, SenderId, TenantId,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Snapshot for the external status surface.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    /// `None` when no session has ever been built for the tenant.
    pub state: Option<ConnectionState>,
    pub reconnecting: bool,
    pub attempts: u32,
}

/// Cheap-to-clone handle; all state lives behind the inner Arc.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    connector: Arc<dyn PlatformConnector>,
    registry: Arc<SessionRegistry>,
    supervisor: Arc<ReconnectSupervisor>,
    router: MessageRouter,
    debounce: DebounceAggregator,
}

impl Gateway {
    pub fn new(
        connector: Arc<dyn PlatformConnector>,
        supervisor: Arc<ReconnectSupervisor>,
        router: MessageRouter,
        pipeline: ConversationPipeline,
        debounce_window: Duration,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let replies = Arc::new(ReplySender {
            pipeline,
            registry: Arc::clone(&registry),
        });
        Self {
            inner: Arc::new(GatewayInner {
                connector,
                registry,
                supervisor,
                router,
                debounce: DebounceAggregator::new(debounce_window, replies),
            }),
        }
    }

    /// Idempotent session creation. Explicitly requesting a session is the
    /// one path that wipes a sticky permanent-failure marker.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn request_session(&self, tenant: &TenantId) {
        self.inner.supervisor.clear_permanent_failure(tenant);
        self.ensure_session(tenant);
    }

    pub fn pairing_artifact(&self, tenant: &TenantId) -> Option<String> {
        self.inner.registry.get(tenant)?.pairing_artifact()
    }

    /// Pure status read, no side effects.
    pub fn status(&self, tenant: &TenantId) -> ConnectionStatus {
        let state = if self.inner.supervisor.is_failed_permanently(tenant) {
            Some(ConnectionState::FailedPermanently)
        } else {
            self.inner.registry.get(tenant).map(|session| session.state())
        };
        ConnectionStatus {
            state,
            reconnecting: self.inner.supervisor.is_reconnecting(tenant),
            attempts: self.inner.supervisor.attempts_for(tenant),
        }
    }

    /// Status read that also kicks a reconnect when the session is absent and
    /// the attempt budget is not exhausted. Kept apart from `status` so plain
    /// reads stay side-effect free.
    pub async fn probe_status(&self, tenant: &TenantId) -> ConnectionStatus {
        if self.inner.registry.get(tenant).is_none()
            && !self.inner.supervisor.is_failed_permanently(tenant)
        {
            let decision = self.inner.supervisor.schedule_retry(tenant).await;
            self.act_on_retry_decision(tenant, decision);
        }
        self.status(tenant)
    }

    /// Returns the tenant's session; the caller that created it also starts
    /// the platform handshake, detached.
    fn ensure_session(&self, tenant: &TenantId) -> Arc<TenantSession> {
        let (session, created) = self.inner.registry.get_or_create(tenant);
        if created {
            let gateway = self.clone();
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                gateway.run_session(session).await;
            });
        }
        session
    }

    #[tracing::instrument(level = "info", skip_all, fields(tenant = %session.tenant()))]
    async fn run_session(self, session: Arc<TenantSession>) {
        let tenant = session.tenant().clone();
        let (tx, mut rx) = mpsc::channel::<ConnectionEvent>(EVENT_CHANNEL_CAPACITY);

        let connection = match self.inner.connector.connect(&tenant, tx).await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!(%tenant, %e, "platform connect failed");
                self.discard_and_maybe_retry(&tenant, &session).await;
                return;
            }
        };
        session.attach_connection(connection);

        loop {
            // A closed event stream without a terminal event still means the
            // connection is gone.
            let event = match rx.recv().await {
                Some(event) => event,
                None => ConnectionEvent::Disconnected {
                    reason: "event stream closed".to_string(),
                },
            };
            let terminal = self.handle_event(&session, &event).await;
            if terminal {
                self.discard_and_maybe_retry(&tenant, &session).await;
                return;
            }
        }
    }

    /// Apply one event. Returns true when the session is finished.
    async fn handle_event(&self, session: &Arc<TenantSession>, event: &ConnectionEvent) -> bool {
        let tenant = session.tenant();
        if let Some(transition) = session.apply(event) {
            tracing::info!(%tenant, from = %transition.from, to = %transition.to, "session transition");
            if transition.to == ConnectionState::Ready {
                self.inner.supervisor.on_ready(tenant);
            }
        }

        match event {
            ConnectionEvent::Message(message) => {
                self.handle_message(session, message).await;
                false
            }
            ConnectionEvent::AuthFailure { reason } => {
                tracing::warn!(%tenant, reason, "authentication failed");
                true
            }
            ConnectionEvent::Disconnected { reason } => {
                tracing::warn!(%tenant, reason, "connection lost");
                true
            }
            _ => false,
        }
    }

    async fn handle_message(&self, session: &Arc<TenantSession>, message: &InboundMessage) {
        let tenant = session.tenant();
        match self.inner.router.route(tenant, message).await {
            RouteOutcome::Dropped => {}
            RouteOutcome::AutoReply { reply } => {
                let Some(connection) = session.connection() else {
                    tracing::warn!(%tenant, "no live connection for auto-reply");
                    return;
                };
                if let Err(e) = connection
                    .send(&message.sender_id, OutboundMessage::text(reply))
                    .await
                {
                    tracing::warn!(%tenant, sender = %message.sender_id, %e, "auto-reply send failed");
                }
            }
            RouteOutcome::Debounce => {
                self.inner
                    .debounce
                    .enqueue(tenant, &message.sender_id, message.content.clone());
            }
        }
    }

    async fn discard_and_maybe_retry(&self, tenant: &TenantId, session: &Arc<TenantSession>) {
        self.inner.registry.remove(tenant, session);
        let decision = self.inner.supervisor.schedule_retry(tenant).await;
        self.act_on_retry_decision(tenant, decision);
    }

    fn act_on_retry_decision(&self, tenant: &TenantId, decision: RetryDecision) {
        match decision {
            RetryDecision::Scheduled { attempt, delay } => {
                tracing::info!(%tenant, attempt, "reconnecting after delay");
                let gateway = self.clone();
                let tenant = tenant.clone();
                // Capture the deadline now so the delay runs from scheduling,
                // not from the spawned task's first poll.
                let sleep = tokio::time::sleep(delay);
                tokio::spawn(async move {
                    sleep.await;
                    gateway.inner.supervisor.clear_pending(&tenant);
                    gateway.ensure_session(&tenant);
                });
            }
            RetryDecision::FailedPermanently { attempts } => {
                tracing::warn!(%tenant, attempts, "session failed permanently");
            }
            RetryDecision::Abandoned => {
                tracing::info!(%tenant, "tenant no longer exists, not reconnecting");
            }
            RetryDecision::AlreadyPending => {}
        }
    }
}

/// Debounce flush target: run the pipeline, send the reply through the
/// tenant's live connection. Send errors are logged, never retried.
struct ReplySender {
    pipeline: ConversationPipeline,
    registry: Arc<SessionRegistry>,
}

#[async_trait]
impl FlushHandler for ReplySender {
    async fn flush(&self, tenant: &TenantId, sender: &SenderId, text: String) {
        let reply = self.pipeline.process(tenant, sender, &text).await;
        let connection = self
            .registry
            .get(tenant)
            .and_then(|session| session.connection());
        let Some(connection) = connection else {
            tracing::warn!(%tenant, %sender, "no live connection, dropping reply");
            return;
        };
        if let Err(e) = connection.send(sender, OutboundMessage::text(reply)).await {
            tracing::warn!(%tenant, %sender, %e, "reply send failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectConfig;
    use crate::pipeline::CompletionBackend;
    use crate::repo::{HistoryRepo, RuleRepo, TenantRepo};
    use crate::store::{MemoryStore, PathStore};
    use anyhow::anyhow;
    use nexo_llm::{LlmError, Turn};
    use nexo_platform::PlatformConnection;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct MockConnection {
        sent: Arc<Mutex<Vec<(SenderId, String)>>>,
    }

    #[async_trait]
    impl PlatformConnection for MockConnection {
        async fn send(&self, recipient: &SenderId, message: OutboundMessage) -> anyhow::Result<()> {
            self.sent
                .lock()
                .expect("lock")
                .push((recipient.clone(), message.content));
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockConnector {
        senders: Mutex<Vec<mpsc::Sender<ConnectionEvent>>>,
        sent: Arc<Mutex<Vec<(SenderId, String)>>>,
        connects: AtomicUsize,
        fail_connect: AtomicBool,
    }

    impl MockConnector {
        fn event_sender(&self, index: usize) -> mpsc::Sender<ConnectionEvent> {
            self.senders.lock().expect("lock")[index].clone()
        }

        fn sent(&self) -> Vec<(SenderId, String)> {
            self.sent.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl PlatformConnector for MockConnector {
        async fn connect(
            &self,
            _tenant: &TenantId,
            events: mpsc::Sender<ConnectionEvent>,
        ) -> anyhow::Result<Arc<dyn PlatformConnection>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(anyhow!("bridge unreachable"));
            }
            self.senders.lock().expect("lock").push(events);
            Ok(Arc::new(MockConnection {
                sent: Arc::clone(&self.sent),
            }))
        }
    }

    struct CountingBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CompletionBackend for CountingBackend {
        async fn complete(
            &self,
            _system_context: &str,
            _history: &[Turn],
            _user_message: &str,
        ) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("respuesta generada".to_string())
        }
    }

    struct Fixture {
        gateway: Gateway,
        connector: Arc<MockConnector>,
        backend: Arc<CountingBackend>,
    }

    async fn fixture() -> Fixture {
        let store: Arc<dyn PathStore> = Arc::new(MemoryStore::new());
        store
            .set("tenants/t1", json!({ "name": "Pastas Rosa" }))
            .await
            .expect("seed tenant");
        RuleRepo::new(Arc::clone(&store))
            .add(
                &"t1".into(),
                &crate::repo::AutoReplyRule {
                    scope: crate::repo::RuleScope::Any,
                    trigger: "hello".to_string(),
                    reply: "Hi!".to_string(),
                },
            )
            .await
            .expect("seed rule");

        let connector = Arc::new(MockConnector::default());
        let backend = Arc::new(CountingBackend {
            calls: AtomicUsize::new(0),
        });
        let reconnect = ReconnectConfig::default();
        let supervisor = Arc::new(ReconnectSupervisor::new(
            TenantRepo::new(Arc::clone(&store)),
            reconnect.max_attempts,
            reconnect.delay(),
        ));
        let gateway = Gateway::new(
            connector.clone() as Arc<dyn PlatformConnector>,
            supervisor,
            MessageRouter::new(RuleRepo::new(Arc::clone(&store))),
            ConversationPipeline::new(
                TenantRepo::new(Arc::clone(&store)),
                HistoryRepo::new(Arc::clone(&store)),
                backend.clone(),
            ),
            Duration::from_secs(15),
        );
        Fixture {
            gateway,
            connector,
            backend,
        }
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    fn inbound(content: &str) -> ConnectionEvent {
        ConnectionEvent::Message(InboundMessage {
            message_id: "m1".into(),
            sender_id: SenderId::from("u1@c.us"),
            content: content.to_string(),
            from_self: false,
            is_status: false,
            received_at: chrono::Utc::now(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn request_session_reaches_ready_and_clears_artifact() {
        let fx = fixture().await;
        let tenant = TenantId::from("t1");

        fx.gateway.request_session(&tenant);
        settle().await;
        let events = fx.connector.event_sender(0);

        events
            .send(ConnectionEvent::PairingCode {
                code: "QR-1".to_string(),
            })
            .await
            .expect("send");
        settle().await;
        assert_eq!(fx.gateway.pairing_artifact(&tenant).as_deref(), Some("QR-1"));
        assert_eq!(
            fx.gateway.status(&tenant).state,
            Some(ConnectionState::PairingPending)
        );

        events.send(ConnectionEvent::Authenticated).await.expect("send");
        events.send(ConnectionEvent::Ready).await.expect("send");
        settle().await;
        let status = fx.gateway.status(&tenant);
        assert_eq!(status.state, Some(ConnectionState::Ready));
        assert_eq!(status.attempts, 0);
        assert_eq!(fx.gateway.pairing_artifact(&tenant), None);
    }

    #[tokio::test(start_paused = true)]
    async fn matched_rule_replies_immediately_without_completion() {
        let fx = fixture().await;
        let tenant = TenantId::from("t1");

        fx.gateway.request_session(&tenant);
        settle().await;
        let events = fx.connector.event_sender(0);
        events.send(ConnectionEvent::Ready).await.expect("send");
        events.send(inbound("hello there")).await.expect("send");
        settle().await;

        assert_eq!(
            fx.connector.sent(),
            vec![(SenderId::from("u1@c.us"), "Hi!".to_string())]
        );
        assert_eq!(fx.backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unmatched_message_is_debounced_then_answered() {
        let fx = fixture().await;
        let tenant = TenantId::from("t1");

        fx.gateway.request_session(&tenant);
        settle().await;
        let events = fx.connector.event_sender(0);
        events.send(ConnectionEvent::Ready).await.expect("send");
        events.send(inbound("quiero ravioles")).await.expect("send");
        settle().await;
        assert!(fx.connector.sent().is_empty(), "reply waits for the window");

        tokio::time::advance(Duration::from_secs(15)).await;
        settle().await;
        assert_eq!(
            fx.connector.sent(),
            vec![(SenderId::from("u1@c.us"), "respuesta generada".to_string())]
        );
        assert_eq!(fx.backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_discards_the_session_and_reconnects_after_the_delay() {
        let fx = fixture().await;
        let tenant = TenantId::from("t1");

        fx.gateway.request_session(&tenant);
        settle().await;
        let events = fx.connector.event_sender(0);
        events.send(ConnectionEvent::Ready).await.expect("send");
        events
            .send(ConnectionEvent::Disconnected {
                reason: "socket closed".to_string(),
            })
            .await
            .expect("send");
        settle().await;

        let status = fx.gateway.status(&tenant);
        assert_eq!(status.state, None, "failed session is discarded");
        assert!(status.reconnecting);
        assert_eq!(status.attempts, 1);

        tokio::time::advance(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(fx.connector.connects.load(Ordering::SeqCst), 2);
        assert!(!fx.gateway.status(&tenant).reconnecting);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_status_kicks_a_reconnect_for_an_absent_session() {
        let fx = fixture().await;
        let tenant = TenantId::from("t1");

        let status = fx.gateway.probe_status(&tenant).await;
        assert_eq!(status.state, None);
        assert!(status.reconnecting);

        tokio::time::advance(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(fx.connector.connects.load(Ordering::SeqCst), 1);
        assert!(fx.gateway.status(&tenant).state.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_connect_failures_become_permanent() {
        let fx = fixture().await;
        let tenant = TenantId::from("t1");
        fx.connector.fail_connect.store(true, Ordering::SeqCst);

        fx.gateway.request_session(&tenant);
        for _ in 0..8 {
            settle().await;
            tokio::time::advance(Duration::from_secs(3)).await;
        }
        settle().await;

        let status = fx.gateway.status(&tenant);
        assert_eq!(status.state, Some(ConnectionState::FailedPermanently));
        assert_eq!(status.attempts, 5);
        let connects = fx.connector.connects.load(Ordering::SeqCst);
        assert_eq!(connects, 6, "initial connect plus five retries");

        // Sticky until an explicit session request.
        fx.gateway.probe_status(&tenant).await;
        settle().await;
        assert_eq!(fx.connector.connects.load(Ordering::SeqCst), connects);

        fx.connector.fail_connect.store(false, Ordering::SeqCst);
        fx.gateway.request_session(&tenant);
        settle().await;
        assert_eq!(fx.gateway.status(&tenant).attempts, 0);
        assert!(fx.gateway.status(&tenant).state.is_some());
    }
}
