//! Reconnection policy: bounded attempts, fixed delay.

use crate::repo::TenantRepo;
use dashmap::{DashMap, DashSet};
use nexo_platform::TenantId;
use std::time::Duration;

/// What to do about a failed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// The tenant no longer exists in the store; never reconnect.
    Abandoned,
    /// A retry timer for this tenant is already running.
    AlreadyPending,
    /// Attempt budget exhausted. Sticky until `clear_permanent_failure`.
    FailedPermanently { attempts: u32 },
    /// Reconnect after `delay`.
    Scheduled { attempt: u32, delay: Duration },
}

pub struct ReconnectSupervisor {
    tenants: TenantRepo,
    max_attempts: u32,
    delay: Duration,
    attempts: DashMap<TenantId, u32>,
    failed: DashSet<TenantId>,
    pending: DashSet<TenantId>,
}

impl ReconnectSupervisor {
    pub fn new(tenants: TenantRepo, max_attempts: u32, delay: Duration) -> Self {
        Self {
            tenants,
            max_attempts,
            delay,
            attempts: DashMap::new(),
            failed: DashSet::new(),
            pending: DashSet::new(),
        }
    }

    /// Decide whether to reconnect `tenant`. The caller owns the actual timer:
    /// on `Scheduled` it must sleep for `delay`, call `clear_pending`, and
    /// re-create the session. The delay is intentionally fixed, not
    /// exponential.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn schedule_retry(&self, tenant: &TenantId) -> RetryDecision {
        if self.failed.contains(tenant) {
            return RetryDecision::FailedPermanently {
                attempts: self.attempts_for(tenant),
            };
        }
        // One timer per tenant, even under concurrent status polling.
        if !self.pending.insert(tenant.clone()) {
            return RetryDecision::AlreadyPending;
        }

        let exists = match self.tenants.exists(tenant).await {
            Ok(exists) => exists,
            Err(e) => {
                tracing::warn!(%tenant, %e, "tenant existence check failed, abandoning retries");
                false
            }
        };
        if !exists {
            self.attempts.remove(tenant);
            self.pending.remove(tenant);
            return RetryDecision::Abandoned;
        }

        let attempt = {
            let mut entry = self.attempts.entry(tenant.clone()).or_insert(0);
            if *entry >= self.max_attempts {
                None
            } else {
                *entry += 1;
                Some(*entry)
            }
        };
        let Some(attempt) = attempt else {
            self.failed.insert(tenant.clone());
            self.pending.remove(tenant);
            tracing::warn!(%tenant, attempts = self.max_attempts, "reconnect budget exhausted");
            return RetryDecision::FailedPermanently {
                attempts: self.max_attempts,
            };
        };

        tracing::info!(%tenant, attempt, delay_secs = self.delay.as_secs(), "reconnect scheduled");
        RetryDecision::Scheduled {
            attempt,
            delay: self.delay,
        }
    }

    /// Release the pending guard once the scheduled delay has elapsed.
    pub fn clear_pending(&self, tenant: &TenantId) {
        self.pending.remove(tenant);
    }

    /// A session reached `Ready`; the attempt counter starts over.
    pub fn on_ready(&self, tenant: &TenantId) {
        self.attempts.remove(tenant);
    }

    /// External intervention: an explicit session request wipes a sticky
    /// permanent failure and the counter.
    pub fn clear_permanent_failure(&self, tenant: &TenantId) {
        self.failed.remove(tenant);
        self.attempts.remove(tenant);
    }

    pub fn attempts_for(&self, tenant: &TenantId) -> u32 {
        self.attempts.get(tenant).map(|entry| *entry).unwrap_or(0)
    }

    pub fn is_reconnecting(&self, tenant: &TenantId) -> bool {
        self.pending.contains(tenant)
    }

    pub fn is_failed_permanently(&self, tenant: &TenantId) -> bool {
        self.failed.contains(tenant)
    }
}
