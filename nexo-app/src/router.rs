//! Inbound message routing: noise filter, rule fast path, debounce slow path.

use crate::repo::{AutoReplyRule, RuleRepo, RuleScope};
use nexo_platform::{InboundMessage, TenantId};

/// What to do with one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Self-originated echo or platform status broadcast; never processed.
    Dropped,
    /// A rule matched; send `reply` immediately, nothing else runs.
    AutoReply { reply: String },
    /// No rule matched; hand the text to the debounce layer.
    Debounce,
}

pub struct MessageRouter {
    rules: RuleRepo,
}

impl MessageRouter {
    pub fn new(rules: RuleRepo) -> Self {
        Self { rules }
    }

    /// Rule-set fetch failures degrade to "no rules": the message still
    /// reaches the slow path.
    #[tracing::instrument(level = "debug", skip(self, message), fields(tenant = %tenant))]
    pub async fn route(&self, tenant: &TenantId, message: &InboundMessage) -> RouteOutcome {
        if message.from_self || message.is_status {
            return RouteOutcome::Dropped;
        }

        let rules = match self.rules.list(tenant).await {
            Ok(rules) => rules,
            Err(e) => {
                tracing::warn!(%tenant, %e, "rule lookup failed, skipping autoresponses");
                Vec::new()
            }
        };

        match first_match(&rules, message) {
            Some(rule) => RouteOutcome::AutoReply {
                reply: rule.reply.clone(),
            },
            None => RouteOutcome::Debounce,
        }
    }
}

/// First rule in stored order whose scope covers the sender and whose trigger
/// is a case-insensitive substring of the message text.
fn first_match<'a>(rules: &'a [AutoReplyRule], message: &InboundMessage) -> Option<&'a AutoReplyRule> {
    let text = message.content.to_lowercase();
    rules.iter().find(|rule| {
        let in_scope = match &rule.scope {
            RuleScope::Any => true,
            RuleScope::Sender(sender) => *sender == message.sender_id,
        };
        in_scope && text.contains(&rule.trigger.to_lowercase())
    })
}
