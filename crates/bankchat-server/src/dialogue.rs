use std::collections::BTreeMap;
use std::sync::Arc;

use bankchat_contracts::{
    Channel, Envelope, FreeFormReply, GuidedPrompt, PromptValues, Sender, TerminalRedirect,
    TurnRequest,
};
use bankchat_kernel::{FlowTable, FlowTransition, StateCode, FREE_FORM_CODE};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::audit::{AuditJsonl, TurnAuditRecord};
use crate::store::{NewMessage, StoreBackend};
use crate::upstream::{
    CompletionFallback, CompletionRequest, Passage, Retriever, SpeechToText,
};

/// Assistant text stored and returned when the completion upstream is unavailable.
pub const DEGRADED_NOTICE: &str =
    "Сервис временно недоступен. Пожалуйста, повторите запрос позже.";
pub const DEGRADED_SYSTEM_NOTICE: &str = "completion_unavailable";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("malformed_code: code must be exactly 3 decimal digits")]
    MalformedCode,
    #[error("unmatched_code: code does not match any guided flow step")]
    UnmatchedCode,
    #[error("missing_field: {0}")]
    MissingField(&'static str),
    #[error("conflicting_fields: {0} does not match channel")]
    ConflictingFields(&'static str),
    #[error("malformed_audio: audio must be base64")]
    MalformedAudio,
    #[error("transcription_failed")]
    TranscriptionFailed,
    #[error("malformed_request: {0}")]
    MalformedRequest(String),
}

impl InputError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            InputError::MalformedCode => "malformed_code",
            InputError::UnmatchedCode => "unmatched_code",
            InputError::MissingField(_) => "missing_field",
            InputError::ConflictingFields(_) => "conflicting_fields",
            InputError::MalformedAudio => "malformed_audio",
            InputError::TranscriptionFailed => "transcription_failed",
            InputError::MalformedRequest(_) => "malformed_request",
        }
    }
}

#[derive(Debug, Error)]
pub enum TurnError {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error("persistence_failed: {0}")]
    Persistence(String),
}

impl TurnError {
    fn reason_code(&self) -> &'static str {
        match self {
            TurnError::Input(e) => e.reason_code(),
            TurnError::Persistence(_) => "persistence_failed",
        }
    }
}

enum Payload {
    Empty,
    Text(String),
    Audio(Vec<u8>),
}

struct Routed {
    envelope: Envelope,
    branch: &'static str,
    reason_code: String,
    message_id: Option<i64>,
}

pub struct DialogueRouter {
    table: &'static FlowTable,
    speech: Arc<dyn SpeechToText>,
    completion: CompletionFallback,
    retriever: Option<(Arc<dyn Retriever>, usize)>,
    store: Arc<Mutex<StoreBackend>>,
    audit: Arc<AuditJsonl>,
}

impl DialogueRouter {
    pub fn new(
        speech: Arc<dyn SpeechToText>,
        completion: CompletionFallback,
        retriever: Option<(Arc<dyn Retriever>, usize)>,
        store: Arc<Mutex<StoreBackend>>,
        audit: Arc<AuditJsonl>,
    ) -> Self {
        Self {
            table: FlowTable::global(),
            speech,
            completion,
            retriever,
            store,
            audit,
        }
    }

    pub async fn handle(&self, turn: TurnRequest) -> Result<Envelope, TurnError> {
        let result = self.route(&turn).await;
        let record = match &result {
            Ok(routed) => TurnAuditRecord::new(
                turn.user_id,
                &turn.code,
                turn.channel.as_str(),
                routed.branch,
                &routed.reason_code,
            )
            .with_message_id(routed.message_id),
            Err(e) => TurnAuditRecord::new(
                turn.user_id,
                &turn.code,
                turn.channel.as_str(),
                "rejected",
                e.reason_code(),
            ),
        };
        self.audit.append(record).await;
        result.map(|routed| routed.envelope)
    }

    async fn route(&self, turn: &TurnRequest) -> Result<Routed, TurnError> {
        let payload = payload_for_channel(turn)?;
        let canonical = match payload {
            Payload::Empty => None,
            Payload::Text(text) => Some(text),
            Payload::Audio(bytes) => Some(self.transcribe(&bytes).await?),
        };

        let code = StateCode::parse(&turn.code).map_err(|_| InputError::MalformedCode)?;
        if !code.is_free_form() {
            return self.advance_flow(code);
        }

        let text = canonical
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or(InputError::MissingField(match turn.channel {
                Channel::Text => "text",
                Channel::Audio => "audio",
            }))?;
        if turn.user_id < 1 {
            return Err(InputError::MissingField("user_id").into());
        }
        self.answer_free_form(turn, text).await
    }

    async fn transcribe(&self, audio: &[u8]) -> Result<String, InputError> {
        match self.speech.transcribe(audio).await {
            Ok(text) => Ok(text),
            Err(e) => {
                tracing::warn!(reason = e.reason_code(), error = %e, "transcription failed");
                Err(InputError::TranscriptionFailed)
            }
        }
    }

    fn advance_flow(&self, code: StateCode) -> Result<Routed, TurnError> {
        let transition = self.table.lookup(code).ok_or_else(|| {
            tracing::info!(code = %code, "guided turn rejected: no such flow step");
            InputError::UnmatchedCode
        })?;
        let (envelope, branch) = match transition {
            FlowTransition::Prompt { text, next } => (
                Envelope::Guided(GuidedPrompt {
                    message: text.to_string(),
                    redirect: false,
                    values: PromptValues::Next(next.to_string()),
                }),
                "guided_prompt",
            ),
            FlowTransition::Menu { text, options } => (
                Envelope::Guided(GuidedPrompt {
                    message: text.to_string(),
                    redirect: false,
                    values: PromptValues::Options(
                        options
                            .iter()
                            .map(|o| (o.code.to_string(), o.label.to_string()))
                            .collect::<BTreeMap<_, _>>(),
                    ),
                }),
                "guided_menu",
            ),
            FlowTransition::Terminal { redirect, title } => (
                Envelope::Redirect(TerminalRedirect {
                    redirect: redirect.to_string(),
                    title: title.to_string(),
                }),
                "terminal",
            ),
        };
        tracing::info!(code = %code, branch, "guided turn routed");
        Ok(Routed {
            envelope,
            branch,
            reason_code: code.to_string(),
            message_id: None,
        })
    }

    async fn answer_free_form(&self, turn: &TurnRequest, text: String) -> Result<Routed, TurnError> {
        let user_ts = Utc::now();
        let request = CompletionRequest {
            passages: self.ground(&text).await,
            user_text: text.clone(),
        };

        let (reply, notice, branch, reason_code) = match self.completion.complete(&request).await {
            Ok(reply) => (reply, None, "free_form", "completion_ok".to_string()),
            Err(e) => {
                tracing::warn!(reason = e.reason_code(), error = %e, "completion failed, answering degraded");
                (
                    DEGRADED_NOTICE.to_string(),
                    Some(DEGRADED_SYSTEM_NOTICE.to_string()),
                    "free_form_degraded",
                    format!("completion_{}", e.reason_code()),
                )
            }
        };
        let assistant_ts = Utc::now().max(user_ts);

        let user = NewMessage {
            chat_id: turn.chat_id,
            user_id: turn.user_id,
            text,
            timestamp: user_ts,
            channel: turn.channel,
            state_code: FREE_FORM_CODE.to_string(),
            sender: Sender::User,
        };
        let assistant = NewMessage {
            chat_id: turn.chat_id,
            user_id: turn.user_id,
            text: reply,
            timestamp: assistant_ts,
            channel: Channel::Text,
            state_code: FREE_FORM_CODE.to_string(),
            sender: Sender::Assistant,
        };
        let (user, assistant) = {
            let mut store = self.store.lock().await;
            store.append_exchange(user, assistant).map_err(|e| {
                tracing::error!(error = %e, "conversation log append failed");
                TurnError::Persistence(e)
            })?
        };

        tracing::info!(message_id = user.id, branch, "free-form turn recorded");
        Ok(Routed {
            envelope: Envelope::FreeForm(FreeFormReply {
                status: true,
                message: assistant.text,
                user_msg_time: user.timestamp,
                ai_msg_time: assistant.timestamp,
                message_id: user.id,
                notice,
            }),
            branch,
            reason_code,
            message_id: Some(user.id),
        })
    }

    async fn ground(&self, text: &str) -> Vec<Passage> {
        let Some((retriever, top_k)) = &self.retriever else {
            return Vec::new();
        };
        match retriever.search(text, *top_k).await {
            Ok(passages) => passages,
            Err(e) => {
                tracing::warn!(reason = e.reason_code(), error = %e, "retrieval failed, answering ungrounded");
                Vec::new()
            }
        }
    }
}

fn payload_for_channel(turn: &TurnRequest) -> Result<Payload, InputError> {
    match turn.channel {
        Channel::Text => {
            if turn.audio.is_some() {
                return Err(InputError::ConflictingFields("audio"));
            }
            Ok(turn
                .text
                .clone()
                .map(Payload::Text)
                .unwrap_or(Payload::Empty))
        }
        Channel::Audio => {
            if turn.text.is_some() {
                return Err(InputError::ConflictingFields("text"));
            }
            match turn.audio.as_deref() {
                None => Ok(Payload::Empty),
                Some(encoded) => {
                    let bytes = BASE64
                        .decode(encoded.trim())
                        .map_err(|_| InputError::MalformedAudio)?;
                    if bytes.is_empty() {
                        return Err(InputError::MalformedAudio);
                    }
                    Ok(Payload::Audio(bytes))
                }
            }
        }
    }
}
