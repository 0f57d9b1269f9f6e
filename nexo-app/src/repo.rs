//! Typed repositories over the path-addressed store.

use crate::store::PathStore;
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use nexo_llm::Role;
use nexo_platform::{SenderId, TenantId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Bounded conversation memory per (tenant, end-user).
pub const MAX_HISTORY_TURNS: usize = 10;

/// A business tenant's profile, keyed by `tenants/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantProfile {
    pub name: String,
    #[serde(default)]
    pub sector: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Link handed out for booking-intent messages; optional.
    #[serde(default)]
    pub booking_url: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Clone)]
pub struct TenantRepo {
    store: Arc<dyn PathStore>,
}

impl TenantRepo {
    pub fn new(store: Arc<dyn PathStore>) -> Self {
        Self { store }
    }

    pub async fn fetch(&self, tenant: &TenantId) -> Result<Option<TenantProfile>> {
        let Some(value) = self.store.get(&format!("tenants/{tenant}")).await? else {
            return Ok(None);
        };
        let profile = serde_json::from_value(value)
            .map_err(|e| anyhow!("tenant profile {tenant} is malformed: {e}"))?;
        Ok(Some(profile))
    }

    pub async fn exists(&self, tenant: &TenantId) -> Result<bool> {
        Ok(self.store.get(&format!("tenants/{tenant}")).await?.is_some())
    }

    pub async fn list_active(&self) -> Result<Vec<TenantId>> {
        let Some(value) = self.store.get("tenants").await? else {
            return Ok(Vec::new());
        };
        let Some(map) = value.as_object() else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for (id, raw) in map {
            match serde_json::from_value::<TenantProfile>(raw.clone()) {
                Ok(profile) if profile.active => out.push(TenantId::from(id.as_str())),
                Ok(_) => {}
                Err(e) => tracing::warn!(tenant = %id, %e, "skipping malformed tenant profile"),
            }
        }
        Ok(out)
    }
}

/// Who an autoresponse rule applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RuleScope {
    Any,
    Sender(SenderId),
}

impl From<String> for RuleScope {
    fn from(value: String) -> Self {
        match value.as_str() {
            // "todos" is the legacy any-sender marker still present in
            // existing rule records.
            "any" | "todos" => Self::Any,
            _ => Self::Sender(SenderId::from(value)),
        }
    }
}

impl From<RuleScope> for String {
    fn from(value: RuleScope) -> Self {
        match value {
            RuleScope::Any => "any".to_string(),
            RuleScope::Sender(sender) => sender.into_inner(),
        }
    }
}

/// Tenant-configured trigger/response pair, evaluated before the AI pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoReplyRule {
    pub scope: RuleScope,
    pub trigger: String,
    pub reply: String,
}

#[derive(Clone)]
pub struct RuleRepo {
    store: Arc<dyn PathStore>,
}

impl RuleRepo {
    pub fn new(store: Arc<dyn PathStore>) -> Self {
        Self { store }
    }

    fn path(tenant: &TenantId) -> String {
        format!("rules/{tenant}")
    }

    /// Rules in stored order. Push keys are chronologically ordered, so key
    /// order is creation order.
    pub async fn list(&self, tenant: &TenantId) -> Result<Vec<AutoReplyRule>> {
        let Some(value) = self.store.get(&Self::path(tenant)).await? else {
            return Ok(Vec::new());
        };
        let entries: Vec<(String, Value)> = match value {
            Value::Object(map) => {
                let mut entries: Vec<(String, Value)> = map.into_iter().collect();
                entries.sort_by(|(a, _), (b, _)| a.cmp(b));
                entries
            }
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| (i.to_string(), item))
                .collect(),
            _ => return Ok(Vec::new()),
        };

        let mut rules = Vec::with_capacity(entries.len());
        for (key, raw) in entries {
            match serde_json::from_value::<AutoReplyRule>(raw) {
                Ok(rule) => rules.push(rule),
                Err(e) => {
                    tracing::warn!(tenant = %tenant, rule_key = %key, %e, "skipping malformed rule")
                }
            }
        }
        Ok(rules)
    }

    pub async fn add(&self, tenant: &TenantId, rule: &AutoReplyRule) -> Result<String> {
        self.store
            .push(&Self::path(tenant), serde_json::to_value(rule)?)
            .await
    }

    pub async fn edit(&self, tenant: &TenantId, key: &str, rule: &AutoReplyRule) -> Result<()> {
        self.store
            .update(
                &format!("{}/{key}", Self::path(tenant)),
                serde_json::to_value(rule)?,
            )
            .await
    }

    pub async fn remove(&self, tenant: &TenantId, key: &str) -> Result<()> {
        self.store
            .remove(&format!("{}/{key}", Self::path(tenant)))
            .await
    }
}

/// One role-tagged message in bounded history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn now(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Clone)]
pub struct HistoryRepo {
    store: Arc<dyn PathStore>,
}

impl HistoryRepo {
    pub fn new(store: Arc<dyn PathStore>) -> Self {
        Self { store }
    }

    fn path(tenant: &TenantId, sender: &SenderId) -> String {
        format!("conversations/{tenant}/{}", sanitize_path_key(sender))
    }

    pub async fn fetch(&self, tenant: &TenantId, sender: &SenderId) -> Result<Vec<ConversationTurn>> {
        let Some(value) = self.store.get(&Self::path(tenant, sender)).await? else {
            return Ok(Vec::new());
        };
        let Some(items) = value.as_array() else {
            return Ok(Vec::new());
        };
        // Tolerate malformed entries rather than losing the whole history.
        let mut turns = Vec::with_capacity(items.len());
        for item in items {
            match serde_json::from_value::<ConversationTurn>(item.clone()) {
                Ok(turn) => turns.push(turn),
                Err(e) => {
                    tracing::warn!(tenant = %tenant, %e, "skipping malformed history turn")
                }
            }
        }
        Ok(turns)
    }

    /// Append one turn and trim to the most recent `MAX_HISTORY_TURNS`.
    pub async fn append(
        &self,
        tenant: &TenantId,
        sender: &SenderId,
        turn: ConversationTurn,
    ) -> Result<()> {
        let mut turns = self.fetch(tenant, sender).await?;
        turns.push(turn);
        if turns.len() > MAX_HISTORY_TURNS {
            turns.drain(..turns.len() - MAX_HISTORY_TURNS);
        }
        self.store
            .set(&Self::path(tenant, sender), serde_json::to_value(&turns)?)
            .await
    }
}

/// Store keys cannot contain `. # $ [ ] / \ @ % & + * = ! ~`; platform sender
/// ids regularly do (`549115555@c.us`).
fn sanitize_path_key(key: &str) -> String {
    key.chars()
        .map(|ch| match ch {
            '.' | '#' | '$' | '[' | ']' | '@' | '%' | '&' | '+' | '*' | '=' | '/' | '\\' | '!'
            | '~' => '_',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn repo_store() -> Arc<dyn PathStore> {
        Arc::new(MemoryStore::new())
    }

    #[test]
    fn sanitize_path_key_replaces_forbidden_characters() {
        assert_eq!(sanitize_path_key("5491155550000@c.us"), "5491155550000_c_us");
        assert_eq!(sanitize_path_key("a#b$c[d]e/f\\g!h~i"), "a_b_c_d_e_f_g_h_i");
        assert_eq!(sanitize_path_key("plain-id_123"), "plain-id_123");
    }

    #[test]
    fn rule_scope_serde_round_trips() {
        let any: RuleScope = serde_json::from_value(json!("any")).expect("any scope");
        assert_eq!(any, RuleScope::Any);

        let sender: RuleScope =
            serde_json::from_value(json!("5491155550000@c.us")).expect("sender scope");
        assert_eq!(sender, RuleScope::Sender("5491155550000@c.us".into()));

        assert_eq!(serde_json::to_value(RuleScope::Any).expect("ser"), json!("any"));
    }

    #[test]
    fn legacy_todos_marker_reads_as_any_scope() {
        let legacy: RuleScope = serde_json::from_value(json!("todos")).expect("legacy scope");
        assert_eq!(legacy, RuleScope::Any);
        // Writes use the current marker.
        assert_eq!(
            serde_json::to_value(legacy).expect("ser"),
            json!("any")
        );
    }

    #[tokio::test]
    async fn tenant_fetch_and_exists() {
        let store = repo_store();
        store
            .set(
                "tenants/t1",
                json!({ "name": "Pastas Rosa", "sector": "gastronomía" }),
            )
            .await
            .expect("seed tenant");
        let repo = TenantRepo::new(store);

        let profile = repo
            .fetch(&"t1".into())
            .await
            .expect("fetch")
            .expect("profile present");
        assert_eq!(profile.name, "Pastas Rosa");
        assert!(profile.active, "active defaults to true");
        assert!(repo.exists(&"t1".into()).await.expect("exists"));
        assert!(!repo.exists(&"t2".into()).await.expect("exists"));
    }

    #[tokio::test]
    async fn list_active_skips_inactive_tenants() {
        let store = repo_store();
        store
            .set("tenants/t1", json!({ "name": "A", "active": true }))
            .await
            .expect("seed");
        store
            .set("tenants/t2", json!({ "name": "B", "active": false }))
            .await
            .expect("seed");
        let repo = TenantRepo::new(store);

        let active = repo.list_active().await.expect("list");
        assert_eq!(active, vec![TenantId::from("t1")]);
    }

    #[tokio::test]
    async fn rules_list_in_stored_order() {
        let store = repo_store();
        let repo = RuleRepo::new(store);
        let tenant = TenantId::from("t1");

        repo.add(
            &tenant,
            &AutoReplyRule {
                scope: RuleScope::Any,
                trigger: "hola".to_string(),
                reply: "¡Hola!".to_string(),
            },
        )
        .await
        .expect("add first");
        repo.add(
            &tenant,
            &AutoReplyRule {
                scope: RuleScope::Sender("u1".into()),
                trigger: "precio".to_string(),
                reply: "Lista de precios".to_string(),
            },
        )
        .await
        .expect("add second");

        let rules = repo.list(&tenant).await.expect("list");
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].trigger, "hola");
        assert_eq!(rules[1].trigger, "precio");
    }

    #[tokio::test]
    async fn rule_remove_deletes_by_key() {
        let store = repo_store();
        let repo = RuleRepo::new(store);
        let tenant = TenantId::from("t1");

        let key = repo
            .add(
                &tenant,
                &AutoReplyRule {
                    scope: RuleScope::Any,
                    trigger: "hola".to_string(),
                    reply: "¡Hola!".to_string(),
                },
            )
            .await
            .expect("add");
        repo.remove(&tenant, &key).await.expect("remove");
        assert!(repo.list(&tenant).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn history_append_trims_to_ten_turns() {
        let store = repo_store();
        let repo = HistoryRepo::new(store);
        let tenant = TenantId::from("t1");
        let sender = SenderId::from("5491155550000@c.us");

        for i in 0..11 {
            repo.append(&tenant, &sender, ConversationTurn::now(Role::User, format!("m{i}")))
                .await
                .expect("append");
        }

        let turns = repo.fetch(&tenant, &sender).await.expect("fetch");
        assert_eq!(turns.len(), MAX_HISTORY_TURNS);
        assert_eq!(turns[0].text, "m1", "oldest turn evicted first");
        assert_eq!(turns[9].text, "m10");
    }

    #[tokio::test]
    async fn history_is_isolated_per_sender() {
        let store = repo_store();
        let repo = HistoryRepo::new(store);
        let tenant = TenantId::from("t1");

        repo.append(
            &tenant,
            &"a@c.us".into(),
            ConversationTurn::now(Role::User, "from a"),
        )
        .await
        .expect("append");
        repo.append(
            &tenant,
            &"b@c.us".into(),
            ConversationTurn::now(Role::User, "from b"),
        )
        .await
        .expect("append");

        let a = repo.fetch(&tenant, &"a@c.us".into()).await.expect("fetch");
        let b = repo.fetch(&tenant, &"b@c.us".into()).await.expect("fetch");
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_eq!(a[0].text, "from a");
    }
}
