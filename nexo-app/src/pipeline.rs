//! Conversation pipeline: profile context, booking intent, AI reply, history.

use crate::repo::{ConversationTurn, HistoryRepo, TenantProfile, TenantRepo};
use async_trait::async_trait;
use nexo_llm::{GeminiClient, LlmError, Role, Turn};
use nexo_platform::{SenderId, TenantId};
use std::sync::Arc;

/// Reply when the tenant profile cannot be resolved.
pub const UNIDENTIFIED_BUSINESS_REPLY: &str = "Lo siento, no pude identificar el negocio al que estás contactando. Por favor, verifica el número o intenta más tarde.";

/// Reply when the AI call fails; never surfaces the error itself.
pub const FALLBACK_REPLY: &str =
    "Lo siento, no pude generar una respuesta en este momento. Por favor, intenta de nuevo más tarde.";

/// Booking intent bypasses the AI entirely.
const BOOKING_KEYWORDS: [&str; 3] = ["turno", "reservar", "cita"];

const DEFAULT_PERSONA: &str = "Siempre responde en español y sé amigable. No respondas preguntas que no estén relacionadas con el emprendimiento. \
    Si el usuario pregunta por turnos o reservas, indícale cómo agendar. Si la pregunta está fuera del alcance de la información \
    del negocio, amablemente indica que no puedes ayudar con eso.";

/// Seam over the completion service so the pipeline is testable without HTTP.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(
        &self,
        system_context: &str,
        history: &[Turn],
        user_message: &str,
    ) -> Result<String, LlmError>;
}

#[async_trait]
impl CompletionBackend for GeminiClient {
    async fn complete(
        &self,
        system_context: &str,
        history: &[Turn],
        user_message: &str,
    ) -> Result<String, LlmError> {
        GeminiClient::complete(self, system_context, history, user_message).await
    }
}

pub struct ConversationPipeline {
    tenants: TenantRepo,
    history: HistoryRepo,
    backend: Arc<dyn CompletionBackend>,
    persona: Option<String>,
}

impl ConversationPipeline {
    pub fn new(
        tenants: TenantRepo,
        history: HistoryRepo,
        backend: Arc<dyn CompletionBackend>,
    ) -> Self {
        Self {
            tenants,
            history,
            backend,
            persona: None,
        }
    }

    /// Replace the default persona instructions; the business context is
    /// always prepended.
    pub fn with_persona(mut self, persona: Option<String>) -> Self {
        self.persona = persona
            .as_deref()
            .map(str::trim)
            .filter(|persona| !persona.is_empty())
            .map(ToOwned::to_owned);
        self
    }

    /// Turn one aggregated end-user message into reply text. Always returns
    /// a sendable string; every failure degrades to a fixed Spanish reply.
    #[tracing::instrument(level = "info", skip(self, text), fields(tenant = %tenant, sender = %sender))]
    pub async fn process(&self, tenant: &TenantId, sender: &SenderId, text: &str) -> String {
        let profile = match self.tenants.fetch(tenant).await {
            Ok(profile) => profile,
            Err(e) => {
                tracing::warn!(%tenant, %e, "tenant profile lookup failed");
                None
            }
        };
        let Some(profile) = profile else {
            return UNIDENTIFIED_BUSINESS_REPLY.to_string();
        };

        if has_booking_intent(text) {
            tracing::info!(%tenant, %sender, "booking intent, skipping completion");
            return booking_reply(&profile);
        }

        let prior = match self.history.fetch(tenant, sender).await {
            Ok(turns) => turns,
            Err(e) => {
                tracing::warn!(%tenant, %sender, %e, "history lookup failed, continuing without it");
                Vec::new()
            }
        };
        let context_turns: Vec<Turn> = prior
            .iter()
            .map(|turn| Turn {
                role: turn.role,
                text: turn.text.clone(),
            })
            .collect();

        let reply = match self
            .backend
            .complete(&self.persona_context(&profile), &context_turns, text)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(%tenant, %sender, %e, "completion failed, sending fallback");
                return FALLBACK_REPLY.to_string();
            }
        };

        // History writes only happen for a successful exchange. Write errors
        // degrade to a shorter memory, never to a lost reply.
        if let Err(e) = self
            .history
            .append(tenant, sender, ConversationTurn::now(Role::User, text))
            .await
        {
            tracing::warn!(%tenant, %sender, %e, "failed to append user turn");
        }
        if let Err(e) = self
            .history
            .append(
                tenant,
                sender,
                ConversationTurn::now(Role::Assistant, reply.clone()),
            )
            .await
        {
            tracing::warn!(%tenant, %sender, %e, "failed to append assistant turn");
        }

        reply
    }

    /// Business context plus persona instructions, handed to the model as the
    /// system instruction.
    fn persona_context(&self, profile: &TenantProfile) -> String {
        let sector = profile.sector.as_deref().unwrap_or("general");
        let description = profile
            .description
            .as_deref()
            .unwrap_or("No se proporcionó descripción.");
        let persona = self.persona.as_deref().unwrap_or(DEFAULT_PERSONA);
        format!(
            "Eres un asistente virtual para el emprendimiento \"{}\". Su rubro es \"{sector}\" y su descripción es: \"{description}\". {persona}",
            profile.name
        )
    }
}

fn has_booking_intent(text: &str) -> bool {
    let lowered = text.to_lowercase();
    BOOKING_KEYWORDS
        .iter()
        .any(|keyword| lowered.contains(keyword))
}

fn booking_reply(profile: &TenantProfile) -> String {
    match profile.booking_url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => format!(
            "Para agendar un turno con {}, ingresá al siguiente enlace: {url}",
            profile.name
        ),
        _ => format!(
            "Para agendar un turno con {}, por favor visita nuestro sitio web o espera a que uno de nuestros agentes te contacte.",
            profile.name
        ),
    }
}
