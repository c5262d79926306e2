//! Session event log.
//!
//! Each line of the log is one compact JSON object stamped with `type`,
//! `session_id` and `ts`. The chat session records:
//!
//! | type | emitted when |
//! |------|--------------|
//! | `session_started` | the CLI opens a session |
//! | `capture_started` / `capture_stopped` | the camera stream opens or is released |
//! | `capture_failed` | the device refuses to open or dies right after opening |
//! | `capture_unavailable` | capture is enabled but no frame could be taken for a turn |
//! | `turn_appended` | a user or assistant turn joins the transcript |
//! | `exchange_started` / `exchange_settled` | a backend exchange begins or resolves |
//! | `submission_rejected` | a submission is blank or arrives while a reply is pending |
//! | `mood_changed` | the displayed mood label changes |

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Appends session events to a JSONL file shared by every clone.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    session_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: path.into(),
                session_id: session_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "session_id".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }

    /// Like [`EventWriter::emit`], taking a `json!` payload. Non-object
    /// payloads are stored under `data`.
    pub fn emit_json(&self, event_type: &str, payload: Value) -> anyhow::Result<Value> {
        self.emit(event_type, payload_fields(payload))
    }

    /// Emits an event where losing the line must never fail the caller.
    /// Write failures are reported on stderr instead.
    pub fn emit_best_effort(&self, event_type: &str, payload: Value) {
        if let Err(err) = self.emit_json(event_type, payload) {
            eprintln!(
                "emosense: failed to record {event_type} event in {}: {err:#}",
                self.inner.path.display()
            );
        }
    }
}

fn payload_fields(payload: Value) -> EventPayload {
    match payload {
        Value::Object(fields) => fields,
        Value::Null => EventPayload::new(),
        other => {
            let mut fields = EventPayload::new();
            fields.insert("data".to_string(), other);
            fields
        }
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
