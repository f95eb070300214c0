//! Reasoning Client
//!
//! Talks to an OpenAI-compatible chat completion endpoint. A call either
//! yields a parsed decision draft or a tagged failure; it never errors out
//! of the loop.

use crate::core::context::ReasoningContext;
use crate::core::decision::{FailureKind, RawDecision};
use crate::core::parser::parse_decision;
use crate::core::state::ReasoningConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub const SYSTEM_PROMPT: &str = r#"You are the decision step of an autonomous workspace assistant.
You are given a summary of recent file changes in the workspace, the open goals, and the outcomes of recent cycles.
Decide whether delegated action is warranted right now.

Reply with exactly one JSON object and nothing else:
{
  "reasoning": "short explanation of the decision",
  "decision": "act" | "wait" | "investigate",
  "confidence": number between 0.0 and 1.0,
  "action": null | {
    "type": "single-agent" | "multi-agent-swarm" | "internal",
    "description": "one line summary of the work",
    "prompt": "complete instruction for the coding agent",
    "priority": "low" | "medium" | "high" | "critical"
  }
}

Rules:
- "action" must be null unless "decision" is "act".
- Use "investigate" when something looks worth doing but you are not yet confident.
- Use "wait" when nothing needs doing.
- Prefer "single-agent"; use "multi-agent-swarm" only for broad work that splits cleanly.
"#;

/// Budget for the reachability ping, independent of the request timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ReasoningError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("endpoint returned an empty reply")]
    EmptyReply,
    #[error("malformed completion body: {0}")]
    Malformed(String),
}

impl ReasoningError {
    /// Transport-class failures back off; the rest retry immediately.
    pub fn is_transport(&self) -> bool {
        matches!(self, ReasoningError::Transport(_) | ReasoningError::Status { .. })
    }
}

/// The seam the orchestrator reasons through.
#[async_trait]
pub trait Reasoner: Send + Sync {
    /// One decision for one cycle. Retries and degradation happen inside;
    /// callers only ever see a draft or a tagged failure.
    async fn think(&self, summary: &str, context: &ReasoningContext) -> RawDecision;

    /// Last known reachability. While `false` the loop skips reasoning.
    fn is_available(&self) -> bool {
        true
    }

    /// Startup reachability check. Must not block for long.
    async fn probe(&self) -> bool {
        self.is_available()
    }

    /// Background health checking until `cancel` fires.
    async fn monitor(&self, cancel: CancellationToken) {
        cancel.cancelled().await;
    }
}

#[derive(Clone)]
pub struct Cortex {
    client: reqwest::Client,
    config: ReasoningConfig,
    healthy: Arc<AtomicBool>,
}

impl Cortex {
    pub fn new(config: ReasoningConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            config,
            // optimistic until the first probe says otherwise
            healthy: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn config(&self) -> &ReasoningConfig {
        &self.config
    }

    pub fn user_message(summary: &str, context: &ReasoningContext) -> String {
        format!(
            "## Observation\n{}\n\n## Context\n{}",
            summary,
            context.to_json()
        )
    }

    fn payload(&self, summary: &str, context: &ReasoningContext) -> Value {
        json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": Self::user_message(summary, context) }
            ],
            "temperature": self.config.temperature,
            "stream": false
        })
    }

    fn with_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    /// One round trip. Returns the assistant message content.
    async fn complete(&self, payload: &Value) -> Result<String, ReasoningError> {
        let res = self
            .with_auth(self.client.post(&self.config.endpoint))
            .json(payload)
            .send()
            .await
            .map_err(|e| ReasoningError::Transport(e.to_string()))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(ReasoningError::Status {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        let body: Value = res
            .json()
            .await
            .map_err(|e| ReasoningError::Malformed(e.to_string()))?;
        extract_content(&body)
    }

    /// Delay before retry `attempt` (0-based): base * 2^attempt, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_base_secs;
        let secs = base
            .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX))
            .min(self.config.backoff_cap_secs);
        Duration::from_secs(secs)
    }

    /// `.../v1/chat/completions` -> `.../v1/models`
    pub fn models_url(&self) -> String {
        match self.config.endpoint.strip_suffix("/chat/completions") {
            Some(base) => format!("{}/models", base),
            None => self.config.endpoint.clone(),
        }
    }

    /// Any HTTP answer counts as reachable; only transport errors do not.
    pub async fn ping(&self) -> bool {
        let reachable = self
            .with_auth(self.client.get(self.models_url()))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .is_ok();
        let was = self.healthy.swap(reachable, Ordering::SeqCst);
        if was != reachable {
            if reachable {
                info!(endpoint = %self.config.endpoint, "reasoning endpoint reachable");
            } else {
                warn!(endpoint = %self.config.endpoint, "reasoning endpoint unreachable; reasoning disabled");
            }
        }
        reachable
    }
}

#[async_trait]
impl Reasoner for Cortex {
    #[instrument(skip_all, fields(model = %self.config.model))]
    async fn think(&self, summary: &str, context: &ReasoningContext) -> RawDecision {
        let payload = self.payload(summary, context);
        let mut last = RawDecision::Failed {
            kind: FailureKind::Transport,
            detail: "no attempt made".to_string(),
        };

        for attempt in 0..=self.config.max_retries {
            match self.complete(&payload).await {
                Ok(content) => match parse_decision(&content) {
                    RawDecision::Parsed(draft) => {
                        self.healthy.store(true, Ordering::SeqCst);
                        debug!(attempt, "decision parsed");
                        return RawDecision::Parsed(draft);
                    }
                    failed => {
                        warn!(attempt, reply = %excerpt(&content), "unparseable decision");
                        last = failed;
                    }
                },
                Err(e) if e.is_transport() => {
                    warn!(attempt, error = %e, "reasoning request failed");
                    last = RawDecision::Failed {
                        kind: FailureKind::Transport,
                        detail: e.to_string(),
                    };
                    if attempt < self.config.max_retries {
                        tokio::time::sleep(self.backoff(attempt)).await;
                    }
                }
                Err(e) => {
                    warn!(attempt, error = %e, "unusable completion");
                    last = RawDecision::Failed {
                        kind: FailureKind::Parse,
                        detail: e.to_string(),
                    };
                }
            }
        }

        if matches!(
            last,
            RawDecision::Failed {
                kind: FailureKind::Transport,
                ..
            }
        ) {
            self.healthy.store(false, Ordering::SeqCst);
        }
        last
    }

    fn is_available(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn probe(&self) -> bool {
        self.ping().await
    }

    async fn monitor(&self, cancel: CancellationToken) {
        let interval = Duration::from_secs(self.config.health_interval_secs.max(1));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    self.ping().await;
                }
            }
        }
        debug!("health monitor stopped");
    }
}

fn extract_content(body: &Value) -> Result<String, ReasoningError> {
    let content = body
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .ok_or_else(|| ReasoningError::Malformed("no choices[0].message.content".to_string()))?;
    match content {
        Value::String(text) if !text.trim().is_empty() => Ok(text.clone()),
        Value::String(_) | Value::Null => Err(ReasoningError::EmptyReply),
        _ => Err(ReasoningError::Malformed("content is not a string".to_string())),
    }
}

fn excerpt(text: &str) -> String {
    text.chars().take(200).collect()
}
