use std::env;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use emosense_contracts::wire::{
    EmotionLabel, ExchangeFailure, ExchangeRequest, ExchangeResponse, ExchangeResult,
};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;

use crate::capture::CapturedFrame;

pub const DEFAULT_ENDPOINT: &str = "http://localhost:8000/api/analyze";
pub const ENDPOINT_ENV: &str = "EMOSENSE_API_URL";

/// An exchange runs until the backend answers or the connection drops.
pub(crate) const EXCHANGE_TIMEOUT: Option<Duration> = None;

/// One request/response exchange with an inference backend.
///
/// Implementations never fail: when the exchange cannot be completed they
/// return [`ExchangeResult::fallback`].
pub trait InferenceClient: Send + Sync {
    fn name(&self) -> &str;
    fn analyze(&self, text: &str, frame: Option<&CapturedFrame>) -> ExchangeResult;
}

pub fn build_request(text: &str, frame: Option<&CapturedFrame>) -> ExchangeRequest {
    ExchangeRequest {
        text: text.to_string(),
        image: frame.map(|frame| frame.data_uri().to_string()),
    }
}

/// Posts exchanges as JSON to the local backend. No retries and no caching:
/// every call is exactly one attempt.
pub struct HttpInferenceClient {
    endpoint: String,
    // A setup failure turns every exchange into an unreachable fallback.
    http: std::result::Result<HttpClient, String>,
}

impl HttpInferenceClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: normalize_endpoint(&endpoint.into()),
            http: build_http_client().map_err(|err| err.to_string()),
        }
    }

    /// Uses `EMOSENSE_API_URL` when set and non-empty.
    pub fn from_env() -> Self {
        Self::new(env::var(ENDPOINT_ENV).unwrap_or_default())
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn exchange(&self, request: &ExchangeRequest) -> Result<ExchangeResponse> {
        let http = self
            .http
            .as_ref()
            .map_err(|message| anyhow!("http client setup failed: {message}"))?;
        let response = http
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .json(request)
            .send()
            .with_context(|| format!("backend request to {} failed", self.endpoint))?;
        let payload = response_json_or_error(response)?;
        parse_exchange_response(payload)
    }
}

impl InferenceClient for HttpInferenceClient {
    fn name(&self) -> &str {
        "http"
    }

    fn analyze(&self, text: &str, frame: Option<&CapturedFrame>) -> ExchangeResult {
        let request = build_request(text, frame);
        match self.exchange(&request) {
            Ok(response) => response.into(),
            Err(err) => ExchangeResult::fallback(classify_failure(&err)),
        }
    }
}

pub(crate) fn build_http_client() -> reqwest::Result<HttpClient> {
    HttpClient::builder().timeout(EXCHANGE_TIMEOUT).build()
}

fn normalize_endpoint(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        DEFAULT_ENDPOINT.to_string()
    } else {
        trimmed.to_string()
    }
}

fn response_json_or_error(response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .context("backend response body read failed")?;
    if !status.is_success() {
        bail!("backend request failed ({code}): {}", truncate_text(&body, 512));
    }
    let parsed: Value =
        serde_json::from_str(&body).context("backend returned invalid JSON payload")?;
    Ok(parsed)
}

pub(crate) fn parse_exchange_response(payload: Value) -> Result<ExchangeResponse> {
    serde_json::from_value(payload).context("backend returned a malformed exchange payload")
}

/// Decode problems are protocol violations; everything else means the
/// backend could not be reached in a usable state.
pub(crate) fn classify_failure(err: &anyhow::Error) -> ExchangeFailure {
    let message = error_chain_text(err, 512);
    let malformed = err
        .chain()
        .any(|cause| cause.downcast_ref::<serde_json::Error>().is_some());
    if malformed {
        ExchangeFailure::malformed(message)
    } else {
        ExchangeFailure::unreachable(message)
    }
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

/// Answers locally without a server, for smoke runs.
#[derive(Debug, Default)]
pub struct DryrunInferenceClient;

impl InferenceClient for DryrunInferenceClient {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn analyze(&self, text: &str, frame: Option<&CapturedFrame>) -> ExchangeResult {
        let mood = mood_from_text(text);
        let analysis = match frame {
            Some(frame) => format!("Dry run: text cue, {}x{} frame", frame.width(), frame.height()),
            None => "Dry run: text cue only".to_string(),
        };
        ExchangeResult {
            text: format!("I hear you. You seem {}.", mood.as_str().to_ascii_lowercase()),
            mood,
            analysis,
            failure: None,
        }
    }
}

fn mood_from_text(text: &str) -> EmotionLabel {
    const CUES: &[(&[&str], EmotionLabel)] = &[
        (&["tired", "exhausted", "sleepy", "drained"], EmotionLabel::Tired),
        (&["anxious", "nervous", "worried", "stressed"], EmotionLabel::Anxious),
        (&["angry", "furious", "annoyed"], EmotionLabel::Angry),
        (&["sad", "down", "lonely", "upset"], EmotionLabel::Sad),
        (&["scared", "afraid", "terrified"], EmotionLabel::Fear),
        (&["excited", "thrilled", "can't wait"], EmotionLabel::Excited),
        (&["happy", "great", "glad", "good"], EmotionLabel::Happy),
        (&["wow", "surprised", "unexpected"], EmotionLabel::Surprise),
        (&["gross", "disgusting"], EmotionLabel::Disgust),
    ];
    let lowered = text.to_ascii_lowercase();
    CUES.iter()
        .find(|(needles, _)| needles.iter().any(|needle| lowered.contains(needle)))
        .map(|(_, mood)| *mood)
        .unwrap_or(EmotionLabel::Neutral)
}
