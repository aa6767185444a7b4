//! Cross-encoder reranking against a chat-style scoring backend, with
//! z-score calibration, outlier rejection, and drift detection.
//!
//! Rolling score statistics survive restarts through the workspace
//! metadata table (`<model>_mean` / `<model>_std`); the engine loads
//! them at construction and persists them after each successful batch.

use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use serde_json::Value;

/// At most this many fused candidates are sent to the backend.
pub const RERANK_BATCH_LIMIT: usize = 10;
/// Candidate texts are truncated to this many characters in the prompt.
pub const CANDIDATE_TEXT_LIMIT: usize = 500;

const STATS_ALPHA: f64 = 0.15;
const DRIFT_THRESHOLD: f64 = 0.4;
const DRIFT_MIN_SAMPLES: u64 = 5;
const FROZEN_SPREAD_FLOOR: f64 = 0.001;
const OUTLIER_Z: f64 = 5.0;
const Z_CLAMP: f64 = 3.0;
const STD_FLOOR: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineTag {
    Ollama,
    OpenAi,
}

impl EngineTag {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "ollama" => Some(EngineTag::Ollama),
            "openai" => Some(EngineTag::OpenAi),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineTag::Ollama => "ollama",
            EngineTag::OpenAi => "openai",
        }
    }
}

/// Descriptor for a scoring backend. The `engine` tag selects the wire
/// format; a new backend is a new variant, not a new type hierarchy.
/// Transport knobs ride along so operators can tune flaky local
/// backends per model.
#[derive(Debug, Clone)]
pub struct RerankerModel {
    pub name: String,
    pub engine: EngineTag,
    pub base_url: String,
    pub api_key_env: String,
    pub timeout_secs: u64,
    /// Attempts per batch before the engine falls back to fused order.
    pub max_attempts: u32,
    /// Base delay between attempts; doubles each retry.
    pub retry_backoff_ms: u64,
}

impl RerankerModel {
    pub fn mean_key(&self) -> String {
        format!("{}_mean", self.name)
    }

    pub fn std_key(&self) -> String {
        format!("{}_std", self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchAnomaly {
    None,
    /// Near-zero variance around 0.5: the backend returned uniform
    /// scores, so the batch must not move the statistics.
    Frozen,
    /// The batch mean jumped away from the rolling mean; statistics
    /// restarted from this batch.
    DriftReset,
}

/// Rolling mean/std of raw backend scores across batches.
#[derive(Debug, Clone, Copy)]
pub struct RollingStats {
    pub mean: f64,
    pub std: f64,
    samples: u64,
    initialized: bool,
}

impl RollingStats {
    /// Neutral prior; the first real batch initializes directly.
    pub fn new() -> Self {
        Self {
            mean: 0.5,
            std: 0.15,
            samples: 0,
            initialized: false,
        }
    }

    /// Statistics restored from workspace metadata. Marked stable so
    /// drift detection is active from the first batch.
    pub fn from_persisted(mean: f64, std: f64) -> Self {
        Self {
            mean,
            std: std.max(STD_FLOOR),
            samples: DRIFT_MIN_SAMPLES,
            initialized: true,
        }
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Folds a raw score batch into the rolling statistics and returns
    /// the calibrated scores (None = outlier rejected) plus any anomaly.
    pub fn calibrate_batch(&mut self, raw: &[f64]) -> (Vec<Option<f64>>, BatchAnomaly) {
        if raw.is_empty() {
            return (Vec::new(), BatchAnomaly::None);
        }

        let n = raw.len() as f64;
        let batch_mean = raw.iter().sum::<f64>() / n;
        let batch_var = raw.iter().map(|x| (x - batch_mean).powi(2)).sum::<f64>() / n;
        let batch_std = batch_var.sqrt();
        let spread: f64 = raw.iter().map(|x| (x - 0.5).powi(2)).sum();

        let mut anomaly = BatchAnomaly::None;
        if spread < FROZEN_SPREAD_FLOOR {
            anomaly = BatchAnomaly::Frozen;
        } else if !self.initialized {
            self.mean = batch_mean;
            self.std = batch_std.max(STD_FLOOR);
            self.samples = 1;
            self.initialized = true;
        } else if self.samples >= DRIFT_MIN_SAMPLES
            && (batch_mean - self.mean).abs() > DRIFT_THRESHOLD
        {
            // Restart from this batch; the old regime is gone.
            self.mean = batch_mean;
            self.std = batch_std.max(STD_FLOOR);
            self.samples = 1;
            anomaly = BatchAnomaly::DriftReset;
        } else {
            self.mean = (1.0 - STATS_ALPHA) * self.mean + STATS_ALPHA * batch_mean;
            self.std = (1.0 - STATS_ALPHA) * self.std + STATS_ALPHA * batch_std.max(STD_FLOOR);
            self.samples += 1;
        }

        let std = self.std.max(STD_FLOOR);
        let normalized = raw
            .iter()
            .map(|x| {
                let z = (x - self.mean) / std;
                if z.abs() > OUTLIER_Z {
                    None
                } else {
                    Some(sigmoid(z.clamp(-Z_CLAMP, Z_CLAMP)))
                }
            })
            .collect();

        (normalized, anomaly)
    }
}

impl Default for RollingStats {
    fn default() -> Self {
        Self::new()
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

#[derive(Debug, Clone)]
pub struct RerankOutcome {
    /// Calibrated score per candidate, in candidate order; None marks
    /// an outlier-rejected entry.
    pub normalized: Vec<Option<f64>>,
    pub anomaly: BatchAnomaly,
    pub mean: f64,
    pub std: f64,
}

pub struct RerankClient {
    model: RerankerModel,
    agent: ureq::Agent,
    stats: RollingStats,
}

impl RerankClient {
    pub fn new(model: RerankerModel) -> Self {
        Self::with_stats(model, RollingStats::new())
    }

    pub fn with_persisted_stats(model: RerankerModel, mean: f64, std: f64) -> Self {
        Self::with_stats(model, RollingStats::from_persisted(mean, std))
    }

    fn with_stats(model: RerankerModel, stats: RollingStats) -> Self {
        let cfg = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(Duration::from_secs(model.timeout_secs.max(1))))
            .build();
        let agent: ureq::Agent = cfg.into();
        Self {
            model,
            agent,
            stats,
        }
    }

    pub fn model(&self) -> &RerankerModel {
        &self.model
    }

    pub fn stats(&self) -> RollingStats {
        self.stats
    }

    /// Replaces the rolling statistics wholesale; used on workspace
    /// switch, where the persisted regime belongs to another file.
    pub fn set_stats(&mut self, stats: RollingStats) {
        self.stats = stats;
    }

    /// Scores `texts` against `query` in one batch request. Backend or
    /// parse failures leave the rolling statistics untouched.
    pub fn score_batch(&mut self, query: &str, texts: &[String]) -> Result<RerankOutcome> {
        if texts.is_empty() {
            return Ok(RerankOutcome {
                normalized: Vec::new(),
                anomaly: BatchAnomaly::None,
                mean: self.stats.mean,
                std: self.stats.std,
            });
        }

        let raw = self.request_scores(query, texts)?;
        if raw.len() != texts.len() {
            return Err(anyhow!(
                "reranker returned {} scores for {} candidates",
                raw.len(),
                texts.len()
            ));
        }

        let (normalized, anomaly) = self.stats.calibrate_batch(&raw);
        Ok(RerankOutcome {
            normalized,
            anomaly,
            mean: self.stats.mean,
            std: self.stats.std,
        })
    }

    fn request_scores(&self, query: &str, texts: &[String]) -> Result<Vec<f64>> {
        let prompt = batch_prompt(query, texts);
        let base = self.model.base_url.trim_end_matches('/');

        let body = match self.model.engine {
            EngineTag::Ollama => {
                let url = format!("{base}/api/generate");
                let payload = serde_json::json!({
                    "model": self.model.name,
                    "prompt": prompt,
                    "stream": false,
                    "options": { "temperature": 0.0 }
                });
                let json = self.post_with_backoff(&url, &payload, None)?;
                json.get("response")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .ok_or_else(|| anyhow!("ollama generate: missing response"))?
            }
            EngineTag::OpenAi => {
                let url = format!("{base}/chat/completions");
                let payload = serde_json::json!({
                    "model": self.model.name,
                    "messages": [
                        {
                            "role": "system",
                            "content": "You score document chunks for relevance. Respond with only a JSON array of floats."
                        },
                        { "role": "user", "content": prompt }
                    ],
                    "temperature": 0.0,
                    "stream": false
                });
                let auth = resolve_api_key(&self.model.api_key_env)
                    .map(|key| format!("Bearer {key}"));
                let json = self.post_with_backoff(&url, &payload, auth.as_deref())?;
                extract_chat_completion_text(&json)
                    .ok_or_else(|| anyhow!("chat.completions: missing choices[0].message.content"))?
            }
        };

        parse_score_array(&body, texts.len())
    }

    /// One scoring POST, retried per the model descriptor's transport
    /// knobs. Busy backends (429/5xx) and transient transport failures
    /// back off and retry; anything else fails the batch immediately.
    fn post_with_backoff(
        &self,
        url: &str,
        payload: &Value,
        auth: Option<&str>,
    ) -> Result<Value> {
        let attempts = self.model.max_attempts.max(1);

        for attempt in 1..=attempts {
            if attempt > 1 {
                let backoff = self.model.retry_backoff_ms << (attempt - 2).min(16);
                std::thread::sleep(Duration::from_millis(backoff));
            }

            let mut request = self.agent.post(url);
            if let Some(token) = auth {
                request = request.header("Authorization", token);
            }

            match request.send_json(payload) {
                Ok(mut response) => {
                    let status = response.status().as_u16();
                    let body = response
                        .body_mut()
                        .read_to_string()
                        .context("read scoring response body")?;

                    if status < 400 {
                        return serde_json::from_str(&body).context("parse scoring response JSON");
                    }

                    let err = BackendError {
                        engine: self.model.engine,
                        status,
                        message: backend_error_message(self.model.engine, &body),
                    };
                    if attempt == attempts || !err.retryable() {
                        return Err(err.into());
                    }
                    tracing::debug!(status, attempt, "scoring backend busy; retrying");
                }
                Err(transport) => {
                    let transient = matches!(
                        transport,
                        ureq::Error::Timeout(_)
                            | ureq::Error::ConnectionFailed
                            | ureq::Error::HostNotFound
                    );
                    if attempt == attempts || !transient {
                        return Err(anyhow!(transport)).with_context(|| format!("POST {url}"));
                    }
                    tracing::debug!(attempt, "scoring backend unreachable; retrying");
                }
            }
        }

        Err(anyhow!(
            "scoring backend gave no usable response after {attempts} attempts"
        ))
    }
}

/// A scoring backend refused the batch.
#[derive(Debug)]
pub struct BackendError {
    pub engine: EngineTag,
    pub status: u16,
    pub message: String,
}

impl BackendError {
    fn retryable(&self) -> bool {
        self.status == 429 || self.status >= 500
    }
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(
                f,
                "{} scoring backend returned {}",
                self.engine.as_str(),
                self.status
            )
        } else {
            write!(
                f,
                "{} scoring backend returned {}: {}",
                self.engine.as_str(),
                self.status,
                self.message
            )
        }
    }
}

impl std::error::Error for BackendError {}

/// Ollama wraps failures as `{"error": "..."}`; OpenAI-compatible
/// servers nest them as `{"error": {"message": "..."}}`.
fn backend_error_message(engine: EngineTag, body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body.trim()).ok();
    let message = parsed.as_ref().and_then(|v| match engine {
        EngineTag::Ollama => v.get("error").and_then(Value::as_str),
        EngineTag::OpenAi => v.pointer("/error/message").and_then(Value::as_str),
    });
    truncate_chars(message.unwrap_or(body.trim()), 300)
}

fn resolve_api_key(env_name: &str) -> Option<String> {
    if env_name.trim().is_empty() {
        return None;
    }
    std::env::var(env_name).ok().filter(|v| !v.trim().is_empty())
}

fn batch_prompt(query: &str, texts: &[String]) -> String {
    let mut p = String::new();
    p.push_str("Rate how relevant each candidate passage is to the query.\n\n");
    p.push_str("Query:\n");
    p.push_str(query.trim());
    p.push_str("\n\nCandidates:\n");
    for (i, text) in texts.iter().enumerate() {
        p.push_str(&format!("[{i}] "));
        p.push_str(&truncate_chars(text, CANDIDATE_TEXT_LIMIT));
        p.push('\n');
    }
    p.push_str(&format!(
        "\nReturn only a JSON array of {} floats between 0 and 1, one per candidate, in order.\n",
        texts.len()
    ));
    p
}

/// Pulls the first JSON array of numbers out of the response text;
/// models often wrap it in prose or code fences.
fn parse_score_array(body: &str, expected: usize) -> Result<Vec<f64>> {
    let start = body
        .find('[')
        .ok_or_else(|| anyhow!("reranker response contains no JSON array"))?;
    let end = body
        .rfind(']')
        .ok_or_else(|| anyhow!("reranker response contains no closing bracket"))?;
    if end <= start {
        return Err(anyhow!("reranker response array is malformed"));
    }

    let scores: Vec<f64> = serde_json::from_str(&body[start..=end])
        .context("parse reranker score array")?;
    if scores.len() != expected {
        return Err(anyhow!(
            "reranker returned {} scores, expected {expected}",
            scores.len()
        ));
    }
    Ok(scores)
}

fn extract_chat_completion_text(json: &Value) -> Option<String> {
    let content = json.pointer("/choices/0/message/content")?;

    if let Some(s) = content.as_str() {
        return Some(s.to_string());
    }

    if let Some(arr) = content.as_array() {
        let mut buf = String::new();
        for item in arr {
            if let Some(t) = item.get("text").and_then(|v| v.as_str()) {
                if !buf.is_empty() {
                    buf.push('\n');
                }
                buf.push_str(t);
            }
        }
        if !buf.trim().is_empty() {
            return Some(buf);
        }
    }

    None
}

fn truncate_chars(input: &str, max_chars: usize) -> String {
    match input.char_indices().nth(max_chars) {
        Some((byte_end, _)) => input[..byte_end].to_string(),
        None => input.to_string(),
    }
}
