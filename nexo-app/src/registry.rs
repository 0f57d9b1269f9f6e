//! Live-session registry, one slot per tenant.

use crate::session::TenantSession;
use dashmap::DashMap;
use nexo_platform::TenantId;
use std::sync::Arc;

/// Owns the set of live sessions. The map entry is the single point of
/// creation, so two concurrent callers for the same tenant always see the
/// same session.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<TenantId, Arc<TenantSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the tenant's session, creating it when absent. The second
    /// element is `true` only for the caller that actually created it, which
    /// is the caller responsible for starting the platform handshake.
    pub fn get_or_create(&self, tenant: &TenantId) -> (Arc<TenantSession>, bool) {
        let mut created = false;
        let session = self
            .sessions
            .entry(tenant.clone())
            .or_insert_with(|| {
                created = true;
                Arc::new(TenantSession::new(tenant.clone()))
            })
            .clone();
        (session, created)
    }

    pub fn get(&self, tenant: &TenantId) -> Option<Arc<TenantSession>> {
        self.sessions.get(tenant).map(|entry| entry.clone())
    }

    /// Drop the tenant's slot, but only if it still holds `session`. A retry
    /// may already have installed a replacement; that one must survive.
    pub fn remove(&self, tenant: &TenantId, session: &Arc<TenantSession>) {
        self.sessions
            .remove_if(tenant, |_, current| Arc::ptr_eq(current, session));
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}
