use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bankchat_config::Config;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;

pub const SYSTEM_INSTRUCTION: &str = "Ты голосовой помощник банка. Отвечай кратко и по делу.";
const USER_PREFIX: &str = "Обращение: ";
const CONTEXT_HEADER: &str = "Справочные материалы банка:";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    #[error("timeout")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("http error {status}: {body}")]
    Http { status: u16, body: String },
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("circuit open")]
    CircuitOpen,
}

impl UpstreamError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            UpstreamError::Timeout => "timeout",
            UpstreamError::Transport(_) => "transport_error",
            UpstreamError::Http { .. } => "http_error",
            UpstreamError::MalformedResponse(_) => "malformed_response",
            UpstreamError::Unavailable(_) => "unavailable",
            UpstreamError::CircuitOpen => "circuit_open",
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout
        } else {
            UpstreamError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Passage {
    pub text: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub score: f64,
}

#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub user_text: String,
    pub passages: Vec<Passage>,
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, UpstreamError>;
}

#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(&self, audio: &[u8]) -> Result<String, UpstreamError>;
}

#[async_trait]
pub trait Retriever: Send + Sync {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<Passage>, UpstreamError>;
}

/// External services a turn may call; swapped for stubs in tests.
#[derive(Clone)]
pub struct Collaborators {
    pub speech: Arc<dyn SpeechToText>,
    pub completion: Arc<dyn CompletionProvider>,
    pub retriever: Option<Arc<dyn Retriever>>,
}

impl Collaborators {
    pub fn from_config(cfg: &Config) -> Result<Self, String> {
        let speech: Arc<dyn SpeechToText> = match cfg.speech.endpoint.as_deref() {
            Some(endpoint) if !endpoint.is_empty() => Arc::new(HttpSpeechToText::new(
                endpoint,
                &cfg.speech.language,
                Duration::from_millis(cfg.speech.timeout_ms),
            )?),
            _ => Arc::new(DisabledSpeechToText),
        };
        let retriever: Option<Arc<dyn Retriever>> = match cfg.retrieval.endpoint.as_deref() {
            Some(endpoint) if !endpoint.is_empty() => Some(Arc::new(HttpRetriever::new(
                endpoint,
                Duration::from_millis(cfg.retrieval.timeout_ms),
            )?)),
            _ => None,
        };
        Ok(Self {
            speech,
            completion: Arc::new(HttpCompletionClient::new(&cfg.completion)?),
            retriever,
        })
    }
}

pub struct HttpCompletionClient {
    endpoint: String,
    authorization: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
    client: Client,
}

impl HttpCompletionClient {
    pub fn new(cfg: &bankchat_config::Completion) -> Result<Self, String> {
        let key = cfg
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| "completion credential is not configured".to_string())?;
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            endpoint: cfg.endpoint.clone(),
            authorization: authorization_header(key),
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
            client,
        })
    }

    fn payload(&self, request: &CompletionRequest) -> Value {
        let mut messages = vec![json!({"role": "system", "content": SYSTEM_INSTRUCTION})];
        if !request.passages.is_empty() {
            messages.push(json!({"role": "system", "content": grounding_text(&request.passages)}));
        }
        messages.push(json!({
            "role": "user",
            "content": format!("{USER_PREFIX}{}", request.user_text),
        }));
        json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        })
    }
}

#[async_trait]
impl CompletionProvider for HttpCompletionClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, UpstreamError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::AUTHORIZATION, &self.authorization)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&self.payload(request))
            .send()
            .await
            .map_err(UpstreamError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| UpstreamError::MalformedResponse(e.to_string()))?;
        extract_reply(&body)
    }
}

fn authorization_header(key: &str) -> String {
    if key.to_lowercase().starts_with("bearer ") {
        key.to_string()
    } else {
        format!("Bearer {key}")
    }
}

fn grounding_text(passages: &[Passage]) -> String {
    let mut text = String::from(CONTEXT_HEADER);
    for passage in passages {
        text.push('\n');
        if !passage.title.is_empty() {
            text.push_str(&format!("[{}] ", passage.title));
        }
        text.push_str(&passage.text);
    }
    text
}

fn extract_reply(body: &Value) -> Result<String, UpstreamError> {
    let content = body
        .get("choices")
        .and_then(|v| v.get(0))
        .and_then(|v| v.get("message"))
        .and_then(|v| v.get("content"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            UpstreamError::MalformedResponse("choices[0].message.content missing".to_string())
        })?;
    let content = content.trim();
    if content.is_empty() {
        return Err(UpstreamError::MalformedResponse(
            "empty completion".to_string(),
        ));
    }
    Ok(content.to_string())
}

struct BreakerState {
    failure_streak: u64,
    open_until: Option<Instant>,
}

/// Single-attempt completion with a consecutive-failure circuit breaker.
pub struct CompletionFallback {
    provider: Arc<dyn CompletionProvider>,
    breaker_failures: u64,
    breaker_open: Duration,
    state: Mutex<BreakerState>,
}

impl CompletionFallback {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        breaker_failures: u64,
        breaker_open: Duration,
    ) -> Self {
        Self {
            provider,
            breaker_failures: breaker_failures.max(1),
            breaker_open: breaker_open.max(Duration::from_millis(1)),
            state: Mutex::new(BreakerState {
                failure_streak: 0,
                open_until: None,
            }),
        }
    }

    pub async fn complete(&self, request: &CompletionRequest) -> Result<String, UpstreamError> {
        {
            let state = self.state.lock().await;
            if let Some(until) = state.open_until {
                if until > Instant::now() {
                    return Err(UpstreamError::CircuitOpen);
                }
            }
        }

        let result = self.provider.complete(request).await;
        match &result {
            Ok(_) => self.record_success().await,
            Err(_) => self.record_failure().await,
        }
        result
    }

    async fn record_failure(&self) {
        let mut state = self.state.lock().await;
        state.failure_streak += 1;
        if state.failure_streak >= self.breaker_failures {
            state.open_until = Some(Instant::now() + self.breaker_open);
        }
    }

    async fn record_success(&self) {
        let mut state = self.state.lock().await;
        state.failure_streak = 0;
        state.open_until = None;
    }
}

pub struct HttpSpeechToText {
    endpoint: String,
    language: String,
    client: Client,
}

impl HttpSpeechToText {
    pub fn new(endpoint: &str, language: &str, timeout: Duration) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            language: language.to_string(),
            client,
        })
    }
}

#[derive(Deserialize)]
struct TranscriptBody {
    #[serde(default)]
    text: String,
}

#[async_trait]
impl SpeechToText for HttpSpeechToText {
    async fn transcribe(&self, audio: &[u8]) -> Result<String, UpstreamError> {
        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("language", self.language.as_str())])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(audio.to_vec())
            .send()
            .await
            .map_err(UpstreamError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Http {
                status: status.as_u16(),
                body,
            });
        }
        let body: TranscriptBody = response
            .json()
            .await
            .map_err(|e| UpstreamError::MalformedResponse(e.to_string()))?;
        let text = body.text.trim();
        if text.is_empty() {
            return Err(UpstreamError::MalformedResponse(
                "speech was not recognized".to_string(),
            ));
        }
        Ok(text.to_string())
    }
}

pub struct DisabledSpeechToText;

#[async_trait]
impl SpeechToText for DisabledSpeechToText {
    async fn transcribe(&self, _audio: &[u8]) -> Result<String, UpstreamError> {
        Err(UpstreamError::Unavailable(
            "speech.endpoint is not configured".to_string(),
        ))
    }
}

pub struct HttpRetriever {
    endpoint: String,
    client: Client,
}

impl HttpRetriever {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            client,
        })
    }
}

#[async_trait]
impl Retriever for HttpRetriever {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<Passage>, UpstreamError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({"query": query, "top_k": top_k}))
            .send()
            .await
            .map_err(UpstreamError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Http {
                status: status.as_u16(),
                body,
            });
        }
        let mut passages: Vec<Passage> = response
            .json()
            .await
            .map_err(|e| UpstreamError::MalformedResponse(e.to_string()))?;
        passages.sort_by(|a, b| b.score.total_cmp(&a.score));
        passages.truncate(top_k);
        Ok(passages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl CompletionProvider for Flaky {
        async fn complete(&self, _request: &CompletionRequest) -> Result<String, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(UpstreamError::Timeout)
            } else {
                Ok("ok".to_string())
            }
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            user_text: "привет".to_string(),
            passages: vec![],
        }
    }

    #[test]
    fn authorization_header_keeps_existing_bearer_prefix() {
        assert_eq!(authorization_header("abc"), "Bearer abc");
        assert_eq!(authorization_header("bearer abc"), "bearer abc");
        assert_eq!(authorization_header("Bearer abc"), "Bearer abc");
    }

    #[test]
    fn extract_reply_reads_first_choice() {
        let body = json!({"choices": [{"message": {"content": "  Добрый день  "}}]});
        assert_eq!(extract_reply(&body).unwrap(), "Добрый день");
    }

    #[test]
    fn extract_reply_rejects_missing_or_empty_content() {
        assert!(matches!(
            extract_reply(&json!({"choices": []})),
            Err(UpstreamError::MalformedResponse(_))
        ));
        assert!(matches!(
            extract_reply(&json!({"choices": [{"message": {"content": "   "}}]})),
            Err(UpstreamError::MalformedResponse(_))
        ));
    }

    #[test]
    fn payload_carries_system_instruction_and_prefixed_user_text() {
        let mut cfg = bankchat_config::Completion {
            endpoint: "http://127.0.0.1:1/v1/chat/completions".to_string(),
            api_key: Some("k".to_string()),
            api_key_env: None,
            model: "qwen/qwen-turbo".to_string(),
            timeout_ms: 1000,
            temperature: 0.7,
            max_tokens: 512,
            circuit_breaker_failures: 5,
            circuit_breaker_open_ms: 30_000,
        };
        let client = HttpCompletionClient::new(&cfg).unwrap();
        let payload = client.payload(&CompletionRequest {
            user_text: "курс евро".to_string(),
            passages: vec![Passage {
                text: "Курс обновляется ежедневно.".to_string(),
                title: "Тарифы".to_string(),
                score: 0.9,
            }],
        });
        let messages = payload["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["content"], SYSTEM_INSTRUCTION);
        assert!(messages[1]["content"]
            .as_str()
            .unwrap()
            .contains("[Тарифы] Курс обновляется ежедневно."));
        assert_eq!(messages[2]["content"], "Обращение: курс евро");
        assert_eq!(payload["max_tokens"], 512);

        cfg.api_key = Some("  ".to_string());
        assert!(HttpCompletionClient::new(&cfg).is_err());
    }

    #[tokio::test]
    async fn breaker_opens_after_consecutive_failures() {
        let provider = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let fallback = CompletionFallback::new(provider.clone(), 2, Duration::from_secs(60));

        assert_eq!(fallback.complete(&request()).await, Err(UpstreamError::Timeout));
        assert_eq!(fallback.complete(&request()).await, Err(UpstreamError::Timeout));
        assert_eq!(
            fallback.complete(&request()).await,
            Err(UpstreamError::CircuitOpen)
        );
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn breaker_half_opens_after_cool_down() {
        let provider = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let fallback = CompletionFallback::new(provider.clone(), 1, Duration::from_millis(20));
        assert!(fallback.complete(&request()).await.is_err());
        assert_eq!(
            fallback.complete(&request()).await,
            Err(UpstreamError::CircuitOpen)
        );
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(fallback.complete(&request()).await, Err(UpstreamError::Timeout));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn success_resets_failure_streak() {
        let failing = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let fallback = CompletionFallback::new(failing, 2, Duration::from_secs(60));
        assert!(fallback.complete(&request()).await.is_err());
        fallback.record_success().await;
        assert_eq!(fallback.complete(&request()).await, Err(UpstreamError::Timeout));
        assert_eq!(fallback.complete(&request()).await, Err(UpstreamError::Timeout));
        assert_eq!(fallback.complete(&request()).await, Err(UpstreamError::CircuitOpen));
    }

    #[tokio::test]
    async fn disabled_speech_always_fails() {
        let err = DisabledSpeechToText.transcribe(b"RIFF").await.unwrap_err();
        assert_eq!(err.reason_code(), "unavailable");
    }
}
