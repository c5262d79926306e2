use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const FALLBACK_RESPONSE_TEXT: &str = "I cannot reach the local brain. Is 'server.py' running?";
pub const OFFLINE_ANALYSIS: &str = "Offline";
pub const JPEG_DATA_URI_PREFIX: &str = "data:image/jpeg;base64,";

/// Closed set of mood labels the backend may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EmotionLabel {
    Happy,
    Neutral,
    Sad,
    Anxious,
    Angry,
    Excited,
    Tired,
    Surprise,
    Disgust,
    Fear,
}

impl EmotionLabel {
    pub const ALL: [EmotionLabel; 10] = [
        EmotionLabel::Happy,
        EmotionLabel::Neutral,
        EmotionLabel::Sad,
        EmotionLabel::Anxious,
        EmotionLabel::Angry,
        EmotionLabel::Excited,
        EmotionLabel::Tired,
        EmotionLabel::Surprise,
        EmotionLabel::Disgust,
        EmotionLabel::Fear,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Happy => "Happy",
            Self::Neutral => "Neutral",
            Self::Sad => "Sad",
            Self::Anxious => "Anxious",
            Self::Angry => "Angry",
            Self::Excited => "Excited",
            Self::Tired => "Tired",
            Self::Surprise => "Surprise",
            Self::Disgust => "Disgust",
            Self::Fear => "Fear",
        }
    }
}

impl fmt::Display for EmotionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmotionLabel {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|label| label.as_str() == raw)
            .ok_or_else(|| format!("unknown mood label '{raw}'"))
    }
}

/// Body posted to the backend for one exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRequest {
    pub text: String,
    pub image: Option<String>,
}

/// Body the backend answers with. Every field is required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeResponse {
    pub response: String,
    pub mood: EmotionLabel,
    pub analysis: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeFailureKind {
    /// Transport failure or non-success status.
    Unreachable,
    /// Body missing fields or carrying an unknown mood.
    Malformed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeFailure {
    pub kind: ExchangeFailureKind,
    pub message: String,
}

impl ExchangeFailure {
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self {
            kind: ExchangeFailureKind::Unreachable,
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self {
            kind: ExchangeFailureKind::Malformed,
            message: message.into(),
        }
    }
}

impl fmt::Display for ExchangeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// What one exchange produced. Always renderable: when the exchange could
/// not be completed `failure` is set and the other fields hold the offline
/// fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeResult {
    pub text: String,
    pub mood: EmotionLabel,
    pub analysis: String,
    pub failure: Option<ExchangeFailure>,
}

impl ExchangeResult {
    pub fn fallback(failure: ExchangeFailure) -> Self {
        Self {
            text: FALLBACK_RESPONSE_TEXT.to_string(),
            mood: EmotionLabel::Neutral,
            analysis: OFFLINE_ANALYSIS.to_string(),
            failure: Some(failure),
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.failure.is_some()
    }
}

impl From<ExchangeResponse> for ExchangeResult {
    fn from(response: ExchangeResponse) -> Self {
        Self {
            text: response.response,
            mood: response.mood,
            analysis: response.analysis,
            failure: None,
        }
    }
}
