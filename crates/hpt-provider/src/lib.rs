//! External search provider adapter + response parser.
//!
//! The adapter sends a natural-language prompt to an AI web-search capable
//! model and hands back raw text; the parser turns that text into normalized
//! candidate records. A structural parse failure is one error for the whole
//! (builder, community, type) triple, never an exception.

use std::time::Duration;

use async_trait::async_trait;
use hpt_core::{CandidatePlan, PlanType};
use serde::Deserialize;
use thiserror::Error;
use tracing::info_span;

pub const CRATE_NAME: &str = "hpt-provider";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("search provider credential missing (set SEARCH_API_KEY)")]
    MissingCredential,
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("provider returned http status {status}")]
    HttpStatus { status: u16 },
    #[error("provider response contained no completion text")]
    EmptyCompletion,
    #[error("{0}")]
    Other(String),
}

/// Seam for the AI web-search call; owns no state beyond its client config.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, prompt: &str) -> Result<String, ProviderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: reqwest::StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl ProviderConfig {
    /// Reads provider settings from the environment. The credential is the
    /// only hard requirement; its absence must short-circuit before any core
    /// logic runs.
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("SEARCH_API_KEY")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or(ProviderError::MissingCredential)?;
        Ok(Self {
            api_key,
            base_url: std::env::var("SEARCH_API_BASE")
                .unwrap_or_else(|_| "https://api.perplexity.ai".to_string()),
            model: std::env::var("SEARCH_MODEL").unwrap_or_else(|_| "sonar-pro".to_string()),
            timeout: Duration::from_secs(
                std::env::var("HPT_HTTP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60),
            ),
            backoff: BackoffPolicy::default(),
        })
    }
}

/// Chat-completions client against a web-search capable model.
#[derive(Debug)]
pub struct WebSearchClient {
    client: reqwest::Client,
    config: ProviderConfig,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

impl WebSearchClient {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }

    pub fn from_env() -> Result<Self, ProviderError> {
        Self::new(ProviderConfig::from_env()?)
    }

    async fn post_completion(&self, prompt: &str) -> Result<String, ProviderError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": prompt}],
        });

        let span = info_span!("provider_search", model = %self.config.model);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;
        for attempt in 0..=self.config.backoff.max_retries {
            let result = self
                .client
                .post(&url)
                .bearer_auth(&self.config.api_key)
                .json(&body)
                .send()
                .await;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let parsed: CompletionResponse = resp.json().await?;
                        return parsed
                            .choices
                            .into_iter()
                            .next()
                            .and_then(|c| c.message.content)
                            .filter(|text| !text.trim().is_empty())
                            .ok_or(ProviderError::EmptyCompletion);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.config.backoff.max_retries
                    {
                        tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(ProviderError::HttpStatus {
                        status: status.as_u16(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.config.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(ProviderError::Request(err));
                }
            }
        }

        Err(match last_request_error {
            Some(err) => ProviderError::Request(err),
            None => ProviderError::EmptyCompletion,
        })
    }
}

#[async_trait]
impl SearchProvider for WebSearchClient {
    async fn search(&self, prompt: &str) -> Result<String, ProviderError> {
        self.post_completion(prompt).await
    }
}

/// Canned provider for tests: one response per listing type, either of which
/// can be forced to fail.
#[derive(Debug, Clone, Default)]
pub struct StaticProvider {
    pub now_response: Option<Result<String, String>>,
    pub plan_response: Option<Result<String, String>>,
}

impl StaticProvider {
    pub fn with_responses(now: impl Into<String>, plan: impl Into<String>) -> Self {
        Self {
            now_response: Some(Ok(now.into())),
            plan_response: Some(Ok(plan.into())),
        }
    }
}

#[async_trait]
impl SearchProvider for StaticProvider {
    async fn search(&self, prompt: &str) -> Result<String, ProviderError> {
        let slot = if prompt.contains("quick move-in") {
            &self.now_response
        } else {
            &self.plan_response
        };
        match slot {
            Some(Ok(text)) => Ok(text.clone()),
            Some(Err(message)) => Err(ProviderError::Other(message.clone())),
            None => Err(ProviderError::EmptyCompletion),
        }
    }
}

/// Prompt for one (builder, community, type) triple. The model is told to
/// answer with strict JSON so the parser's contract holds.
pub fn build_listing_prompt(company: &str, community: &str, plan_type: PlanType) -> String {
    let subject = match plan_type {
        PlanType::Now => "quick move-in homes available now",
        PlanType::Plan => "floor plans offered",
    };
    format!(
        "Search the web for {subject} by the home builder \"{company}\" in the \
         \"{community}\" community. Respond with ONLY a JSON object of the form \
         {{\"plans\": [...]}} and no prose. Each entry must have \"plan_name\" and \
         numeric \"price\", plus \"sqft\", \"stories\", \"beds\", \"baths\", \
         \"price_per_sqft\", \"design_number\"{address} when available. Use null \
         for unknown fields. If no listings are found, return {{\"plans\": []}}.",
        subject = subject,
        company = company,
        community = community,
        address = match plan_type {
            PlanType::Now => ", \"address\"",
            PlanType::Plan => "",
        },
    )
}

// ---------------------------------------------------------------------------
// Response parser
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("not JSON")]
    NotJson,
    #[error("invalid JSON: {0}")]
    Json(String),
    #[error("not an object")]
    NotAnObject,
    #[error("missing plans array")]
    MissingPlansArray,
}

/// Strips a surrounding markdown code fence (``` or ```json) if present.
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // drop the language tag, e.g. "json", whether or not a newline follows it
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest
            .trim_start_matches(|c: char| c.is_ascii_alphanumeric())
            .trim_start(),
    };
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// Normalizes raw provider output into candidate records.
///
/// A bare top-level array is accepted as the candidate list itself; an object
/// must carry the list under `plans` or `data`. An empty list is a valid
/// "no listings found" result, not an error.
pub fn parse_candidates(raw: &str) -> Result<Vec<CandidatePlan>, ParseError> {
    let text = strip_code_fence(raw);
    if !(text.starts_with('{') || text.starts_with('[')) {
        return Err(ParseError::NotJson);
    }

    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| ParseError::Json(e.to_string()))?;

    let items = match value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(map) => {
            let list = map
                .get("plans")
                .and_then(|v| v.as_array())
                .or_else(|| map.get("data").and_then(|v| v.as_array()));
            match list {
                Some(items) => items.clone(),
                None => return Err(ParseError::MissingPlansArray),
            }
        }
        _ => return Err(ParseError::NotAnObject),
    };

    // Structurally broken entries degrade to an empty candidate; the
    // reconciler rejects them per item instead of aborting the batch.
    Ok(items
        .into_iter()
        .map(|item| serde_json::from_value(item).unwrap_or_default())
        .collect())
}
