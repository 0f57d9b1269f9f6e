use crate::traits::{PlatformConnection, PlatformConnector};
use crate::types::{ConnectionEvent, InboundMessage, OutboundMessage, SenderId, TenantId};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Connector for a multi-session WhatsApp bridge service.
///
/// The bridge keeps one browser-backed WhatsApp session per tenant and exposes
/// it over REST: opening a session starts the pairing handshake, lifecycle and
/// message events are long-polled per tenant, and sends go through the
/// session's `/send` endpoint.
#[derive(Clone)]
pub struct WhatsAppBridgeConnector {
    http: reqwest::Client,
    api_base_url: String,
    api_token: Option<String>,
    poll_interval: Duration,
    receive_timeout_seconds: u64,
}

impl WhatsAppBridgeConnector {
    pub fn new(api_base_url: &str) -> Result<Self> {
        let api_base_url = normalize_bridge_api_base_url(api_base_url)?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            api_base_url,
            api_token: None,
            poll_interval: Duration::from_millis(1000),
            receive_timeout_seconds: 20,
        })
    }

    pub fn with_api_token(mut self, api_token: Option<String>) -> Self {
        self.api_token = api_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(ToOwned::to_owned);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_receive_timeout_seconds(mut self, receive_timeout_seconds: u64) -> Self {
        self.receive_timeout_seconds = receive_timeout_seconds.max(1);
        self
    }

    fn api_url(&self, path: &str) -> Result<Url> {
        Url::parse(&format!("{}{}", self.api_base_url, path))
            .map_err(|e| anyhow!("invalid bridge API URL path {path:?}: {e}"))
    }

    fn authorized_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.api_token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn open_session(&self, tenant: &TenantId) -> Result<()> {
        let url = self.api_url(&format!("/v1/sessions/{tenant}"))?;
        let response = self.authorized_request(self.http.post(url)).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "bridge session open failed for {tenant}: status={} body={}",
                status,
                body
            ));
        }
        Ok(())
    }

    async fn receive_once(&self, tenant: &TenantId, after: Option<i64>) -> Result<Vec<BridgeEnvelope>> {
        let url = self.api_url(&format!("/v1/sessions/{tenant}/events"))?;
        let mut request = self
            .authorized_request(self.http.get(url))
            .query(&[("timeout", self.receive_timeout_seconds)]);
        if let Some(after) = after {
            request = request.query(&[("after", after)]);
        }
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        decode_bridge_events(tenant, status, &body)
    }

    #[tracing::instrument(level = "info", skip_all, fields(tenant = %tenant))]
    async fn run_poll_loop(&self, tenant: TenantId, tx: mpsc::Sender<ConnectionEvent>) -> Result<()> {
        let mut cursor: Option<i64> = None;

        loop {
            let envelopes = self.receive_once(&tenant, cursor).await?;
            let mut terminal = false;

            for envelope in envelopes {
                if let Some(seq) = envelope.seq {
                    match cursor {
                        Some(current) if current >= seq => {}
                        _ => cursor = Some(seq),
                    }
                }
                let Some(event) = convert_bridge_envelope(&envelope) else {
                    continue;
                };
                terminal = matches!(
                    event,
                    ConnectionEvent::AuthFailure { .. } | ConnectionEvent::Disconnected { .. }
                );
                tx.send(event)
                    .await
                    .map_err(|e| anyhow!("bridge event queue closed for {tenant}: {e}"))?;
                if terminal {
                    break;
                }
            }

            if terminal {
                tracing::info!("bridge session ended, stopping poll loop");
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl PlatformConnector for WhatsAppBridgeConnector {
    async fn connect(
        &self,
        tenant: &TenantId,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Result<Arc<dyn PlatformConnection>> {
        self.open_session(tenant).await?;

        let connector = self.clone();
        let tenant_for_loop = tenant.clone();
        tokio::spawn(async move {
            if let Err(error) = connector.run_poll_loop(tenant_for_loop, events).await {
                tracing::error!(%error, "bridge poll loop exited");
            }
        });

        Ok(Arc::new(BridgeConnection {
            connector: self.clone(),
            tenant: tenant.clone(),
        }))
    }
}

struct BridgeConnection {
    connector: WhatsAppBridgeConnector,
    tenant: TenantId,
}

#[async_trait]
impl PlatformConnection for BridgeConnection {
    async fn send(&self, recipient: &SenderId, message: OutboundMessage) -> Result<()> {
        let to = recipient.trim();
        if to.is_empty() {
            return Err(anyhow!("recipient (platform sender id) is required"));
        }
        let text = message.content.trim();
        if text.is_empty() {
            return Err(anyhow!("message content is empty"));
        }

        let url = self
            .connector
            .api_url(&format!("/v1/sessions/{}/send", self.tenant))?;
        let payload = serde_json::json!({
            "to": to,
            "message": text,
        });
        let response = self
            .connector
            .authorized_request(self.connector.http.post(url))
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "bridge send failed for {}: status={} body={}",
                self.tenant,
                status,
                body
            ));
        }
        Ok(())
    }
}

fn normalize_bridge_api_base_url(raw: &str) -> Result<String> {
    let normalized = raw.trim().trim_end_matches('/').to_string();
    if normalized.is_empty() {
        return Err(anyhow!("bridge api_base_url is required"));
    }
    let parsed =
        Url::parse(&normalized).map_err(|e| anyhow!("invalid bridge api_base_url: {e}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(normalized),
        other => Err(anyhow!(
            "invalid bridge api_base_url scheme: {other} (expected http or https)"
        )),
    }
}

/// Status is checked before the body is parsed, so a proxy's HTML error page
/// surfaces as the status+body message rather than a JSON decode error.
fn decode_bridge_events(
    tenant: &TenantId,
    status: reqwest::StatusCode,
    body: &str,
) -> Result<Vec<BridgeEnvelope>> {
    if !status.is_success() {
        return Err(anyhow!(
            "bridge receive failed for {tenant}: status={status} body={body}"
        ));
    }
    let payload: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| anyhow!("bridge events for {tenant} were not valid JSON: {e}"))?;
    Ok(parse_bridge_events_payload(payload))
}

fn parse_bridge_events_payload(body: serde_json::Value) -> Vec<BridgeEnvelope> {
    match body {
        serde_json::Value::Array(values) => values
            .into_iter()
            .filter_map(|value| serde_json::from_value(value).ok())
            .collect(),
        serde_json::Value::Object(map) => map
            .get("events")
            .and_then(|value| value.as_array())
            .map(|events| {
                events
                    .iter()
                    .cloned()
                    .filter_map(|value| serde_json::from_value(value).ok())
                    .collect()
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn convert_bridge_envelope(envelope: &BridgeEnvelope) -> Option<ConnectionEvent> {
    match envelope.kind.as_str() {
        "qr" => {
            let code = envelope
                .qr
                .as_deref()
                .map(str::trim)
                .filter(|code| !code.is_empty())?;
            Some(ConnectionEvent::PairingCode {
                code: code.to_string(),
            })
        }
        "authenticated" => Some(ConnectionEvent::Authenticated),
        "ready" => Some(ConnectionEvent::Ready),
        "auth_failure" => Some(ConnectionEvent::AuthFailure {
            reason: envelope_reason(envelope),
        }),
        "disconnected" => Some(ConnectionEvent::Disconnected {
            reason: envelope_reason(envelope),
        }),
        "message" => {
            let sender = envelope
                .from
                .as_deref()
                .map(str::trim)
                .filter(|from| !from.is_empty())?;
            let content = envelope.body.as_deref()?;
            let message_id = envelope
                .id
                .clone()
                .unwrap_or_else(|| format!("bridge:{sender}:{}", Utc::now().timestamp_millis()));
            Some(ConnectionEvent::Message(InboundMessage {
                message_id: message_id.into(),
                sender_id: sender.into(),
                content: content.to_string(),
                from_self: envelope.from_me.unwrap_or(false),
                is_status: envelope.is_status.unwrap_or(false)
                    || sender == "status@broadcast",
                received_at: Utc::now(),
            }))
        }
        other => {
            tracing::debug!(kind = %other, "ignoring unknown bridge event kind");
            None
        }
    }
}

fn envelope_reason(envelope: &BridgeEnvelope) -> String {
    envelope
        .reason
        .as_deref()
        .map(str::trim)
        .filter(|reason| !reason.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct BridgeEnvelope {
    #[serde(rename = "type")]
    kind: String,
    seq: Option<i64>,
    qr: Option<String>,
    reason: Option<String>,
    id: Option<String>,
    from: Option<String>,
    body: Option<String>,
    from_me: Option<bool>,
    is_status: Option<bool>,
}
