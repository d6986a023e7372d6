//! Prompt targets - the boundary to the API gateway.
//!
//! The gateway forwards each prompt to an AI generator. Its HTTP status is
//! the only signal used to decide whether a failed delivery is worth
//! retrying.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

/// A single prompt delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptRequest {
    pub prompt_id: String,
    pub prompt: String,
    pub generator: Option<String>,
    pub system_prompt: Option<String>,
}

/// A generator's answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetResponse {
    pub text: String,
    pub received_at: DateTime<Utc>,
}

/// Whether a failure is worth another attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Fatal,
}

/// Delivery failure as reported by the gateway
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TargetError {
    #[error("gateway returned {code}: {message}")]
    Status { code: u16, message: String },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Network(String),

    #[error("invalid request or response: {0}")]
    Invalid(String),
}

impl TargetError {
    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Self::Status {
            code,
            message: message.into(),
        }
    }

    /// 429/503/504, timeouts and dropped connections are transient; auth and
    /// validation failures (and anything else) are not.
    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::Status { code, .. } => match code {
                429 | 503 | 504 => ErrorClass::Retryable,
                _ => ErrorClass::Fatal,
            },
            Self::Timeout(_) | Self::Network(_) => ErrorClass::Retryable,
            Self::Invalid(_) => ErrorClass::Fatal,
        }
    }
}

/// Anything that can deliver a prompt to a generator
#[async_trait]
pub trait PromptTarget: Send + Sync {
    /// Deliver one prompt
    async fn send(&self, request: &PromptRequest) -> Result<TargetResponse, TargetError>;

    /// Name used in logs
    fn name(&self) -> &str {
        "target"
    }
}

/// HTTP client for the API gateway
#[cfg(feature = "gateway")]
pub struct GatewayTarget {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

#[cfg(feature = "gateway")]
impl GatewayTarget {
    /// Build a client from gateway configuration
    pub fn new(config: &crate::config::GatewayConfig) -> Result<Self, TargetError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| TargetError::Invalid(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("{}/ai/generate", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
        })
    }

    fn map_transport(err: reqwest::Error) -> TargetError {
        if err.is_timeout() {
            TargetError::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            TargetError::Network(err.to_string())
        } else {
            TargetError::Invalid(err.to_string())
        }
    }
}

#[cfg(feature = "gateway")]
#[async_trait]
impl PromptTarget for GatewayTarget {
    async fn send(&self, request: &PromptRequest) -> Result<TargetResponse, TargetError> {
        let body = serde_json::json!({
            "generator": request.generator,
            "prompt": request.prompt,
            "system_prompt": request.system_prompt,
        });

        let mut builder = self.client.post(&self.endpoint).json(&body);
        if let Some(ref key) = self.api_key {
            builder = builder.header("apikey", key);
        }

        let response = builder.send().await.map_err(Self::map_transport)?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TargetError::status(status.as_u16(), message));
        }

        let json: serde_json::Value = response.json().await.map_err(Self::map_transport)?;
        let text = json
            .get("text")
            .and_then(|v| v.as_str())
            .or_else(|| json.pointer("/choices/0/message/content").and_then(|v| v.as_str()))
            .ok_or_else(|| TargetError::Invalid("response has no text".into()))?;

        Ok(TargetResponse {
            text: text.to_string(),
            received_at: Utc::now(),
        })
    }

    fn name(&self) -> &str {
        "gateway"
    }
}

/// In-process target that echoes prompts, with scripted failures per prompt.
///
/// Used for dry runs and tests.
#[derive(Default)]
pub struct ScriptedTarget {
    failures: Mutex<HashMap<String, VecDeque<TargetError>>>,
    calls: AtomicUsize,
    started: Mutex<Vec<Instant>>,
    delay: Option<std::time::Duration>,
}

impl ScriptedTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait this long inside every call
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the next deliveries of `prompt` with `errors`, in order
    pub fn fail_with(self, prompt: &str, errors: impl IntoIterator<Item = TargetError>) -> Self {
        if let Ok(mut failures) = self.failures.lock() {
            failures
                .entry(prompt.to_string())
                .or_default()
                .extend(errors);
        }
        self
    }

    /// Total deliveries attempted
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// When each delivery started, in call order
    pub fn call_times(&self) -> Vec<Instant> {
        self.started.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PromptTarget for ScriptedTarget {
    async fn send(&self, request: &PromptRequest) -> Result<TargetResponse, TargetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut started) = self.started.lock() {
            started.push(Instant::now());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .failures
            .lock()
            .map_err(|_| TargetError::Invalid("script lock poisoned".into()))?
            .get_mut(&request.prompt)
            .and_then(|queue| queue.pop_front());
        if let Some(err) = scripted {
            return Err(err);
        }

        Ok(TargetResponse {
            text: format!("echo: {}", request.prompt),
            received_at: Utc::now(),
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(TargetError::status(429, "slow down").classify(), ErrorClass::Retryable);
        assert_eq!(TargetError::status(503, "").classify(), ErrorClass::Retryable);
        assert_eq!(TargetError::Timeout("t".into()).classify(), ErrorClass::Retryable);
        assert_eq!(TargetError::Network("reset".into()).classify(), ErrorClass::Retryable);

        assert_eq!(TargetError::status(401, "").classify(), ErrorClass::Fatal);
        assert_eq!(TargetError::status(403, "").classify(), ErrorClass::Fatal);
        assert_eq!(TargetError::status(422, "").classify(), ErrorClass::Fatal);
        assert_eq!(TargetError::status(500, "").classify(), ErrorClass::Fatal);
        assert_eq!(TargetError::Invalid("bug".into()).classify(), ErrorClass::Fatal);
    }

    #[tokio::test]
    async fn test_scripted_target() {
        let target = ScriptedTarget::new().fail_with("b", [TargetError::status(429, "")]);
        let req = |p: &str| PromptRequest {
            prompt_id: p.into(),
            prompt: p.into(),
            generator: None,
            system_prompt: None,
        };

        assert_eq!(target.send(&req("a")).await.unwrap().text, "echo: a");
        assert!(target.send(&req("b")).await.is_err());
        assert!(target.send(&req("b")).await.is_ok());
        assert_eq!(target.calls(), 3);
    }
}
