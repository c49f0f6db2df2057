// AI Analyzer HTTP client: given the tail of a failing/flaky run's log
// buffer plus its image tag, returns a markdown root-cause analysis.
// Failures degrade gracefully — the Worker never lets an AI failure
// alter the classified status.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Only the last this-many characters of the log buffer are sent,
/// keeping the request bounded regardless of how long a run's log is.
pub const MAX_LOG_CHARS: usize = 8_000;

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("AI analyzer request failed: {0}")]
    Request(String),

    #[error("AI analyzer returned an unexpected response: {0}")]
    InvalidResponse(String),
}

pub type Result<T> = std::result::Result<T, AnalyzerError>;

impl From<AnalyzerError> for crucible_common::CoreError {
    fn from(err: AnalyzerError) -> Self {
        crucible_common::CoreError::AiAnalysis(err.to_string())
    }
}

#[derive(Debug, Serialize)]
struct AnalyzeRequest<'a> {
    #[serde(rename = "logText")]
    log_text: &'a str,
    image: &'a str,
    #[serde(rename = "flakinessHint", skip_serializing_if = "Option::is_none")]
    flakiness_hint: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct AnalyzeResponse {
    analysis: String,
}

/// Client for the AI Analyzer.
#[async_trait]
pub trait AiAnalyzer: Send + Sync {
    /// Produces a markdown analysis for a `FAILED`/`UNSTABLE` run. Only
    /// called when the buffer is at least 50 characters long, per the
    /// Worker's pipeline.
    async fn analyze(
        &self,
        log_tail: &str,
        image: &str,
        flakiness_hint: Option<&str>,
    ) -> Result<String>;
}

/// Truncates a log buffer to its last [`MAX_LOG_CHARS`] characters,
/// respecting UTF-8 char boundaries.
pub fn tail_log(log_buffer: &str) -> &str {
    if log_buffer.chars().count() <= MAX_LOG_CHARS {
        return log_buffer;
    }
    let skip = log_buffer.chars().count() - MAX_LOG_CHARS;
    let byte_offset = log_buffer
        .char_indices()
        .nth(skip)
        .map(|(idx, _)| idx)
        .unwrap_or(0);
    &log_buffer[byte_offset..]
}

/// The fallback analysis string recorded when the AI call itself fails.
/// Never alters the classified status, per §7 `AI_ANALYSIS` policy.
pub fn fallback_analysis(reason: &str) -> String {
    format!("_AI analysis unavailable: {reason}_")
}

/// reqwest-backed implementation.
pub struct HttpAnalyzer {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAnalyzer {
    pub fn new(endpoint: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client builds with a concrete timeout");
        Self { client, endpoint }
    }
}

#[async_trait]
impl AiAnalyzer for HttpAnalyzer {
    #[tracing::instrument(skip(self, log_tail), fields(image = %image))]
    async fn analyze(
        &self,
        log_tail: &str,
        image: &str,
        flakiness_hint: Option<&str>,
    ) -> Result<String> {
        let body = AnalyzeRequest {
            log_text: tail_log(log_tail),
            image,
            flakiness_hint,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| AnalyzerError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AnalyzerError::Request(format!(
                "analyzer returned status {}",
                response.status()
            )));
        }

        let parsed: AnalyzeResponse = response
            .json()
            .await
            .map_err(|e| AnalyzerError::InvalidResponse(e.to_string()))?;

        Ok(parsed.analysis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_log_passes_short_buffers_through_unchanged() {
        assert_eq!(tail_log("short log"), "short log");
    }

    #[test]
    fn tail_log_truncates_to_the_last_max_chars() {
        let long_log: String = "a".repeat(MAX_LOG_CHARS + 500);
        let tail = tail_log(&long_log);
        assert_eq!(tail.chars().count(), MAX_LOG_CHARS);
        assert!(long_log.ends_with(tail));
    }

    #[test]
    fn fallback_analysis_mentions_the_reason() {
        let fallback = fallback_analysis("timed out");
        assert!(fallback.contains("timed out"));
    }
}
