//! Per-tenant connection session and its state machine.

use nexo_platform::{ConnectionEvent, PlatformConnection, TenantId};
use serde::Serialize;
use std::sync::{Arc, Mutex};

/// Lifecycle of a tenant's platform connection.
///
/// `AuthFailed`, `Disconnected` and `FailedPermanently` are terminal for the
/// session object; recovery happens by discarding the session and building a
/// new one, never by transitioning back out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Initializing,
    PairingPending,
    Authenticated,
    Ready,
    AuthFailed,
    Disconnected,
    FailedPermanently,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::AuthFailed | Self::Disconnected | Self::FailedPermanently
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Initializing => "initializing",
            Self::PairingPending => "pairing_pending",
            Self::Authenticated => "authenticated",
            Self::Ready => "ready",
            Self::AuthFailed => "auth_failed",
            Self::Disconnected => "disconnected",
            Self::FailedPermanently => "failed_permanently",
        };
        f.write_str(name)
    }
}

/// Result of applying one event to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

fn next_state(current: ConnectionState, event: &ConnectionEvent) -> Option<ConnectionState> {
    use ConnectionState as S;
    if current.is_terminal() {
        return None;
    }
    match event {
        ConnectionEvent::PairingCode { .. } => match current {
            S::Initializing | S::PairingPending => Some(S::PairingPending),
            _ => None,
        },
        // A restored credential set can authenticate without a fresh pairing
        // code, so Initializing jumps straight to Authenticated.
        ConnectionEvent::Authenticated => match current {
            S::Initializing | S::PairingPending => Some(S::Authenticated),
            _ => None,
        },
        ConnectionEvent::Ready => match current {
            S::Initializing | S::PairingPending | S::Authenticated => Some(S::Ready),
            S::Ready => None,
            _ => None,
        },
        ConnectionEvent::AuthFailure { .. } => Some(S::AuthFailed),
        ConnectionEvent::Disconnected { .. } => Some(S::Disconnected),
        ConnectionEvent::Message(_) => None,
    }
}

struct SessionInner {
    state: ConnectionState,
    pairing_artifact: Option<String>,
    connection: Option<Arc<dyn PlatformConnection>>,
}

/// One tenant's live session. State, the pairing artifact and the connection
/// handle are owned here and only mutated through `apply` and the setters.
pub struct TenantSession {
    tenant: TenantId,
    inner: Mutex<SessionInner>,
}

impl TenantSession {
    pub fn new(tenant: TenantId) -> Self {
        Self {
            tenant,
            inner: Mutex::new(SessionInner {
                state: ConnectionState::Initializing,
                pairing_artifact: None,
                connection: None,
            }),
        }
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn pairing_artifact(&self) -> Option<String> {
        self.lock().pairing_artifact.clone()
    }

    pub fn connection(&self) -> Option<Arc<dyn PlatformConnection>> {
        self.lock().connection.clone()
    }

    pub fn attach_connection(&self, connection: Arc<dyn PlatformConnection>) {
        self.lock().connection = Some(connection);
    }

    /// Single entry point for lifecycle events. Returns the transition taken,
    /// or `None` when the event does not change state. Reaching `Ready`
    /// clears the pairing artifact; a pairing code stores it.
    pub fn apply(&self, event: &ConnectionEvent) -> Option<Transition> {
        let mut inner = self.lock();
        let to = next_state(inner.state, event)?;
        let transition = Transition {
            from: inner.state,
            to,
        };
        inner.state = to;
        match event {
            ConnectionEvent::PairingCode { code } => {
                inner.pairing_artifact = Some(code.clone());
            }
            ConnectionEvent::Ready => {
                inner.pairing_artifact = None;
            }
            _ => {}
        }
        Some(transition)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexo_platform::{InboundMessage, SenderId};

    fn pairing(code: &str) -> ConnectionEvent {
        ConnectionEvent::PairingCode {
            code: code.to_string(),
        }
    }

    #[test]
    fn happy_path_reaches_ready_and_clears_artifact() {
        let session = TenantSession::new("t1".into());
        assert_eq!(session.state(), ConnectionState::Initializing);

        let t = session.apply(&pairing("QR-1")).expect("transition");
        assert_eq!(t.to, ConnectionState::PairingPending);
        assert_eq!(session.pairing_artifact().as_deref(), Some("QR-1"));

        session.apply(&ConnectionEvent::Authenticated).expect("transition");
        assert_eq!(session.state(), ConnectionState::Authenticated);

        session.apply(&ConnectionEvent::Ready).expect("transition");
        assert_eq!(session.state(), ConnectionState::Ready);
        assert_eq!(session.pairing_artifact(), None);
    }

    #[test]
    fn refreshed_pairing_code_replaces_artifact() {
        let session = TenantSession::new("t1".into());
        session.apply(&pairing("QR-1")).expect("transition");
        session.apply(&pairing("QR-2")).expect("transition");
        assert_eq!(session.state(), ConnectionState::PairingPending);
        assert_eq!(session.pairing_artifact().as_deref(), Some("QR-2"));
    }

    #[test]
    fn restored_credentials_skip_pairing() {
        let session = TenantSession::new("t1".into());
        let t = session
            .apply(&ConnectionEvent::Authenticated)
            .expect("transition");
        assert_eq!(t.from, ConnectionState::Initializing);
        assert_eq!(t.to, ConnectionState::Authenticated);
    }

    #[test]
    fn failure_is_terminal() {
        let session = TenantSession::new("t1".into());
        session.apply(&pairing("QR-1")).expect("transition");
        session
            .apply(&ConnectionEvent::AuthFailure {
                reason: "bad credentials".to_string(),
            })
            .expect("transition");
        assert_eq!(session.state(), ConnectionState::AuthFailed);
        assert!(session.state().is_terminal());

        // No way out of a terminal state.
        assert_eq!(session.apply(&ConnectionEvent::Ready), None);
        assert_eq!(session.apply(&ConnectionEvent::Authenticated), None);
        assert_eq!(session.state(), ConnectionState::AuthFailed);
    }

    #[test]
    fn disconnect_from_ready_is_terminal() {
        let session = TenantSession::new("t1".into());
        session.apply(&ConnectionEvent::Authenticated).expect("transition");
        session.apply(&ConnectionEvent::Ready).expect("transition");
        session
            .apply(&ConnectionEvent::Disconnected {
                reason: "socket closed".to_string(),
            })
            .expect("transition");
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn message_events_do_not_change_state() {
        let session = TenantSession::new("t1".into());
        session.apply(&ConnectionEvent::Authenticated).expect("transition");
        session.apply(&ConnectionEvent::Ready).expect("transition");

        let message = ConnectionEvent::Message(InboundMessage {
            message_id: "m1".into(),
            sender_id: SenderId::from("u1@c.us"),
            content: "hola".to_string(),
            from_self: false,
            is_status: false,
            received_at: chrono::Utc::now(),
        });
        assert_eq!(session.apply(&message), None);
        assert_eq!(session.state(), ConnectionState::Ready);
    }
}
