//! Suggestion engine.
//!
//! Sends one context packet to the provider and validates the reply.
//! Transport failures are retried with backoff; a reply that fails
//! validation is re-asked `schema_retries` times with a stricter prompt.
//! Every provider call, re-asks and retries included, first takes a slot
//! from the run's rate window. Token reservations are made by the caller.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use super::{prompt, schema};
use crate::adapters::{Completion, LlmProvider, ProviderError};
use crate::config::LlmConfig;
use crate::core::chunker::estimate_tokens;
use crate::core::retrieval::ContextPacket;
use crate::core::{BudgetTracker, RetryPolicy};
use crate::domain::Suggestion;

/// Delay before the first transport retry
const TRANSPORT_RETRY_DELAY_MS: u64 = 2000;

/// Usage accumulated across the requests for one chunk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub requests: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.tokens_in + self.tokens_out
    }

    fn record(&mut self, system: &str, user: &str, completion: &Completion) {
        self.tokens_in += completion
            .tokens_in
            .unwrap_or_else(|| (estimate_tokens(system) + estimate_tokens(user)) as u64);
        self.tokens_out += completion
            .tokens_out
            .unwrap_or_else(|| estimate_tokens(&completion.text) as u64);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineOutput {
    pub suggestions: Vec<Suggestion>,
    pub notes: Option<String>,
    pub usage: Usage,
}

/// Per-chunk failure; the run continues without the chunk
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Response failed validation after {attempts} attempts: {reason}")]
    SchemaViolation { attempts: u32, reason: String, usage: Usage },

    #[error("Provider failed: {error}")]
    Provider { error: ProviderError, usage: Usage },
}

impl EngineError {
    pub fn usage(&self) -> Usage {
        match self {
            Self::SchemaViolation { usage, .. } | Self::Provider { usage, .. } => *usage,
        }
    }
}

pub struct SuggestionEngine {
    provider: Arc<dyn LlmProvider>,
    schema: Value,
    schema_retries: u32,
    max_output_tokens: u64,
    retry: RetryPolicy,
}

impl SuggestionEngine {
    pub fn new(provider: Arc<dyn LlmProvider>, settings: &LlmConfig) -> Self {
        Self {
            provider,
            schema: schema::response_schema(),
            schema_retries: settings.schema_retries,
            max_output_tokens: u64::from(settings.max_output_tokens),
            retry: RetryPolicy::new(settings.max_attempts, TRANSPORT_RETRY_DELAY_MS),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn model(&self) -> &str {
        self.provider.model()
    }

    /// Tokens to reserve before sending a packet: prompt plus the output cap
    pub fn estimate(&self, packet: &ContextPacket) -> u64 {
        let prompt_tokens = estimate_tokens(prompt::SYSTEM_PROMPT) + estimate_tokens(&prompt::user_prompt(packet));
        prompt_tokens as u64 + self.max_output_tokens
    }

    /// Ask for suggestions on one chunk
    pub async fn suggest(&self, packet: &ContextPacket, budget: &BudgetTracker) -> Result<EngineOutput, EngineError> {
        let base = prompt::user_prompt(packet);
        let mut user = base.clone();
        let mut usage = Usage::default();
        let attempts = self.schema_retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let completion = match self.complete(&user, budget, &mut usage).await {
                Ok(completion) => completion,
                Err(error) => return Err(EngineError::Provider { error, usage }),
            };

            match schema::validate(&completion.text, &packet.document, packet.start_line, packet.end_line) {
                Ok(validated) => {
                    debug!(
                        chunk = %packet.fingerprint,
                        suggestions = validated.suggestions.len(),
                        attempt,
                        "LLM response validated"
                    );
                    return Ok(EngineOutput {
                        suggestions: validated.suggestions,
                        notes: validated.notes,
                        usage,
                    });
                }
                Err(e) => {
                    warn!(chunk = %packet.fingerprint, attempt, error = %e, "LLM response failed validation");
                    last_error = e.to_string();
                    user = prompt::stricter(&base, &last_error);
                }
            }
        }

        Err(EngineError::SchemaViolation {
            attempts,
            reason: last_error,
            usage,
        })
    }

    /// One provider call with transport retries
    async fn complete(&self, user: &str, budget: &BudgetTracker, usage: &mut Usage) -> Result<Completion, ProviderError> {
        let mut attempt = 1;
        loop {
            budget.acquire_request_slot().await;
            usage.requests += 1;
            match self.provider.complete(prompt::SYSTEM_PROMPT, user, &self.schema).await {
                Ok(completion) => {
                    usage.record(prompt::SYSTEM_PROMPT, user, &completion);
                    return Ok(completion);
                }
                Err(e) if e.is_transient() && self.retry.should_retry(attempt) => {
                    let hint = match e {
                        ProviderError::RateLimited {
                            retry_after_ms: Some(ms),
                        } => Some(std::time::Duration::from_millis(ms)),
                        _ => None,
                    };
                    let delay = self.retry.delay_with_hint(attempt, hint);
                    warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "Retrying LLM request");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
