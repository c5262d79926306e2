use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::wire::EmotionLabel;

pub const WELCOME_TEXT: &str = "Hello. I am running locally. How are you feeling?";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Author {
    User,
    Assistant,
}

impl Author {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Turn {
    pub id: String,
    pub author: Author,
    pub text: String,
    pub created_at: DateTime<Utc>,
    /// Backend analysis tag; only set on assistant turns produced by an exchange.
    pub analysis: Option<String>,
}

/// Ordered chat turns plus the derived mood/pending state.
///
/// Turns only ever get appended; there is no API to edit or drop one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    session_id: String,
    turns: Vec<Turn>,
    mood: Option<EmotionLabel>,
    pending: bool,
    last_analysis: Option<String>,
    #[serde(skip)]
    next_seq: u64,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            turns: Vec::new(),
            mood: None,
            pending: false,
            last_analysis: None,
            next_seq: 1,
        }
    }

    /// A session opened with the assistant greeting already in place.
    pub fn with_greeting() -> Self {
        let mut session = Self::new();
        session.push_turn(Author::Assistant, WELCOME_TEXT.to_string(), None);
        session
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn last_turn(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn mood(&self) -> Option<EmotionLabel> {
        self.mood
    }

    pub fn pending(&self) -> bool {
        self.pending
    }

    pub fn last_analysis(&self) -> Option<&str> {
        self.last_analysis.as_deref()
    }

    // Mutators below belong to the session orchestrator, which keeps
    // `pending` true exactly while its exchange is in flight.

    #[doc(hidden)]
    pub fn push_user(&mut self, text: &str) -> anyhow::Result<&Turn> {
        if text.trim().is_empty() {
            bail!("user turn text must not be empty");
        }
        Ok(self.push_turn(Author::User, text.to_string(), None))
    }

    #[doc(hidden)]
    pub fn push_assistant(&mut self, text: &str, analysis: &str) -> &Turn {
        self.last_analysis = Some(analysis.to_string());
        self.push_turn(
            Author::Assistant,
            text.to_string(),
            Some(analysis.to_string()),
        )
    }

    #[doc(hidden)]
    pub fn set_pending(&mut self, pending: bool) {
        self.pending = pending;
    }

    /// Returns the previous mood when the value actually changed.
    #[doc(hidden)]
    pub fn set_mood(&mut self, mood: EmotionLabel) -> Option<Option<EmotionLabel>> {
        if self.mood == Some(mood) {
            return None;
        }
        Some(self.mood.replace(mood))
    }

    fn push_turn(&mut self, author: Author, text: String, analysis: Option<String>) -> &Turn {
        let turn = Turn {
            id: format!("turn-{}", self.next_seq),
            author,
            text,
            created_at: Utc::now(),
            analysis,
        };
        self.next_seq += 1;
        self.turns.push(turn);
        &self.turns[self.turns.len() - 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_ids_are_sequential_and_unique() -> anyhow::Result<()> {
        let mut session = Session::new();
        let first = session.push_user("hi")?.id.clone();
        let second = session.push_assistant("hello", "calm").id.clone();
        let third = session.push_user("again")?.id.clone();

        assert_eq!(first, "turn-1");
        assert_eq!(second, "turn-2");
        assert_eq!(third, "turn-3");
        assert_eq!(session.turns().len(), 3);
        Ok(())
    }

    #[test]
    fn blank_user_text_is_refused() {
        let mut session = Session::new();
        assert!(session.push_user("   \n\t").is_err());
        assert!(session.turns().is_empty());
    }

    #[test]
    fn greeting_session_starts_with_assistant_turn() {
        let session = Session::with_greeting();
        let turn = session.last_turn().cloned();
        assert_eq!(turn.as_ref().map(|t| t.author), Some(Author::Assistant));
        assert_eq!(turn.map(|t| t.text), Some(WELCOME_TEXT.to_string()));
        assert_eq!(session.mood(), None);
        assert_eq!(session.last_analysis(), None);
    }

    #[test]
    fn set_mood_reports_only_changes() {
        let mut session = Session::new();
        assert_eq!(session.set_mood(EmotionLabel::Happy), Some(None));
        assert_eq!(session.set_mood(EmotionLabel::Happy), None);
        assert_eq!(
            session.set_mood(EmotionLabel::Sad),
            Some(Some(EmotionLabel::Happy))
        );
        assert_eq!(session.mood(), Some(EmotionLabel::Sad));
    }

    #[test]
    fn session_ids_differ() {
        assert_ne!(Session::new().session_id(), Session::new().session_id());
    }
}
