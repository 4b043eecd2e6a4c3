use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{MenderError, Result};

/* ============================= REQUEST ============================= */

/// One chat completion. Temperature stays low; the callers want JSON,
/// not prose.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ChatRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            temperature: 0.1,
            max_tokens: 2048,
        }
    }
}

/* ============================= CLIENT SEAM ============================= */

/// Seam for the LLM provider so tests can substitute scripted responses.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Returns the raw completion text.
    async fn complete(&self, request: &ChatRequest) -> Result<String>;

    /// Cheap reachability probe for the health endpoint.
    async fn healthy(&self) -> bool {
        true
    }

    fn model(&self) -> &str;
}

/* ============================= HTTP CLIENT ============================= */

/// Chat-completions client over a provider-compatible HTTP API.
pub struct HttpLlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

impl HttpLlmClient {
    pub fn new(base_url: &str, api_key: &str, model: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MenderError::Permanent(format!("http client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    async fn send(&self, request: &ChatRequest) -> Result<String> {
        let body = ChatBody {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            // 4xx is a contract problem; 5xx and friends are retryable.
            let text = response.text().await.unwrap_or_default();
            return if status.is_client_error() {
                Err(MenderError::Permanent(format!("llm rejected request: {status}")))
            } else {
                Err(MenderError::Llm(format!("llm upstream {status}: {text}")))
            };
        }

        let parsed: Value = response.json().await?;
        parsed["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| MenderError::Llm("completion missing message content".to_string()))
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    /// One retry on transport error, per the error-handling contract.
    async fn complete(&self, request: &ChatRequest) -> Result<String> {
        match self.send(request).await {
            Ok(text) => Ok(text),
            Err(e) if e.is_transient() => {
                warn!(error = %e, "llm_transport_retry");
                self.send(request).await
            }
            Err(e) => Err(e),
        }
    }

    async fn healthy(&self) -> bool {
        self.http
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map(|r| r.status().is_success() || r.status().is_client_error())
            .unwrap_or(false)
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/* ============================= JSON EXTRACTION ============================= */

/// Best-effort JSON extraction from a completion.
///
/// Tries the whole text first, then the substring between the first `{`
/// and the last `}` (models like to wrap JSON in markdown fences).
pub fn extract_json(raw: &str) -> Option<Value> {
    if let Ok(v) = serde_json::from_str::<Value>(raw.trim()) {
        return Some(v);
    }

    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }

    serde_json::from_str(&raw[start..=end]).ok()
}

/// Run a completion and parse JSON out of it, with one stricter retry on
/// parse failure. The raw text of the final failure is preserved in the
/// error for debugging.
pub async fn complete_json(llm: &dyn LlmClient, request: &ChatRequest) -> Result<Value> {
    let first = llm.complete(request).await?;
    if let Some(v) = extract_json(&first) {
        return Ok(v);
    }

    info!("llm_json_parse_retry");
    let strict = ChatRequest {
        system: format!(
            "{}\nRespond with a single JSON object only. No prose, no markdown fences.",
            request.system
        ),
        ..request.clone()
    };

    let second = llm.complete(&strict).await?;
    extract_json(&second).ok_or_else(|| {
        MenderError::Permanent(format!(
            "unparseable llm response after strict retry: {}",
            truncate(&second, 500)
        ))
    })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/* ============================= TEST DOUBLE ============================= */

/// Scripted fake for unit tests: pops canned responses in order, then
/// either repeats a default response or fails like an unreachable LLM.
#[cfg(test)]
pub struct ScriptedLlm {
    responses: std::sync::Mutex<Vec<String>>,
    fallback: Option<String>,
}

#[cfg(test)]
impl ScriptedLlm {
    pub fn new(responses: Vec<&str>) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            responses: std::sync::Mutex::new(
                responses.into_iter().rev().map(String::from).collect(),
            ),
            fallback: None,
        })
    }

    pub fn repeating(response: &str) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            responses: std::sync::Mutex::new(Vec::new()),
            fallback: Some(response.to_string()),
        })
    }
}

#[cfg(test)]
#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, _request: &ChatRequest) -> Result<String> {
        let popped = self.responses.lock().unwrap().pop();
        match popped {
            Some(r) => Ok(r),
            None => self
                .fallback
                .clone()
                .ok_or_else(|| MenderError::Llm("script exhausted".to_string())),
        }
    }

    fn model(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_pure_json() {
        let v = extract_json(r#"{"a": 1}"#).unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn test_extract_json_from_fenced_response() {
        let raw = "Here is the plan:\n```json\n{\"fix_commands\": []}\n```\nGood luck!";
        let v = extract_json(raw).unwrap();
        assert!(v.get("fix_commands").is_some());
    }

    #[test]
    fn test_extract_json_rejects_garbage() {
        assert!(extract_json("no braces here").is_none());
        assert!(extract_json("} backwards {").is_none());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo wörld", 4), "héll");
        assert_eq!(truncate("ok", 10), "ok");
    }
}
