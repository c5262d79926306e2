use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use emosense_contracts::events::EventWriter;
use emosense_contracts::session::Session;
use emosense_contracts::wire::{ExchangeFailure, ExchangeResult};
use serde_json::{json, Value};

use crate::capture::{CaptureConstraints, CaptureError, FrameSource};
use crate::inference::InferenceClient;

/// How a fallback (offline) result affects the session mood.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OfflineMoodPolicy {
    /// The fallback's Neutral replaces whatever was detected before.
    #[default]
    Overwrite,
    /// The last real reading survives an offline exchange.
    Preserve,
}

/// Where the current turn stands. Settling happens inside `poll`/`wait`,
/// which hand back a [`SettledTurn`] and leave the phase at `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    Capturing,
    AwaitingResponse,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted { turn_id: String },
    /// Blank text; nothing changed.
    Empty,
    /// An exchange is still in flight; nothing changed.
    Busy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettledTurn {
    pub user_turn_id: String,
    pub assistant_turn_id: String,
    pub image_attached: bool,
    pub result: ExchangeResult,
}

struct InFlightExchange {
    user_turn_id: String,
    image_attached: bool,
    started_at: Instant,
    receiver: Receiver<ExchangeResult>,
    handle: Option<thread::JoinHandle<()>>,
}

/// Drives one chat session: appends the user turn, pulls a frame, runs the
/// exchange off-thread and settles the assistant turn.
pub struct SessionOrchestrator {
    session: Session,
    client: Arc<dyn InferenceClient>,
    capture: Box<dyn FrameSource>,
    constraints: CaptureConstraints,
    capture_enabled: bool,
    mood_policy: OfflineMoodPolicy,
    events: Option<EventWriter>,
    phase: TurnPhase,
    in_flight: Option<InFlightExchange>,
}

impl SessionOrchestrator {
    pub fn new(client: Arc<dyn InferenceClient>, capture: Box<dyn FrameSource>) -> Self {
        Self {
            session: Session::new(),
            client,
            capture,
            constraints: CaptureConstraints::default(),
            capture_enabled: false,
            mood_policy: OfflineMoodPolicy::default(),
            events: None,
            phase: TurnPhase::Idle,
            in_flight: None,
        }
    }

    /// Continues an existing transcript. No exchange belongs to this
    /// orchestrator yet, so a carried-over `pending` flag is cleared.
    pub fn with_session(mut self, mut session: Session) -> Self {
        session.set_pending(false);
        self.session = session;
        self.phase = TurnPhase::Idle;
        self.in_flight = None;
        self
    }

    pub fn with_constraints(mut self, constraints: CaptureConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_mood_policy(mut self, policy: OfflineMoodPolicy) -> Self {
        self.mood_policy = policy;
        self
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    pub fn mood_policy(&self) -> OfflineMoodPolicy {
        self.mood_policy
    }

    pub fn client_name(&self) -> &str {
        self.client.name()
    }

    pub fn capture_enabled(&self) -> bool {
        self.capture_enabled
    }

    pub fn capture_active(&self) -> bool {
        self.capture.is_active()
    }

    /// Turns the camera on or off. A failed start keeps capture enabled but
    /// inactive, so turns go out without an image until a later start works.
    pub fn set_capture_enabled(&mut self, enabled: bool) -> Result<(), CaptureError> {
        self.capture_enabled = enabled;
        if enabled {
            self.capture.start(&self.constraints)
        } else {
            self.capture.stop();
            Ok(())
        }
    }

    /// Replaces the frame source, carrying over the enabled flag.
    pub fn replace_capture(&mut self, capture: Box<dyn FrameSource>) -> Result<(), CaptureError> {
        self.capture.stop();
        self.capture = capture;
        if self.capture_enabled {
            self.capture.start(&self.constraints)
        } else {
            Ok(())
        }
    }

    /// Starts a turn without waiting for the backend.
    pub fn submit(&mut self, text: &str) -> SubmitOutcome {
        if text.trim().is_empty() {
            self.emit("submission_rejected", json!({ "reason": "empty" }));
            return SubmitOutcome::Empty;
        }
        if self.session.pending() {
            self.emit("submission_rejected", json!({ "reason": "busy" }));
            return SubmitOutcome::Busy;
        }

        self.phase = TurnPhase::Capturing;
        let user_turn_id = match self.session.push_user(text) {
            Ok(turn) => turn.id.clone(),
            Err(_) => {
                self.phase = TurnPhase::Idle;
                return SubmitOutcome::Empty;
            }
        };
        self.session.set_pending(true);
        self.emit(
            "turn_appended",
            json!({ "turn_id": user_turn_id, "author": "user" }),
        );

        let frame = if self.capture_enabled {
            let frame = self.capture.capture();
            if frame.is_none() {
                self.emit(
                    "capture_unavailable",
                    json!({ "turn_id": user_turn_id, "active": self.capture.is_active() }),
                );
            }
            frame
        } else {
            None
        };
        let image_attached = frame.is_some();

        self.phase = TurnPhase::AwaitingResponse;
        self.emit(
            "exchange_started",
            json!({
                "turn_id": user_turn_id,
                "client": self.client.name(),
                "image_attached": image_attached,
            }),
        );

        let (tx, receiver) = mpsc::channel();
        let worker_tx = tx.clone();
        let client = Arc::clone(&self.client);
        let owned_text = text.to_string();
        let handle = match thread::Builder::new()
            .name("emosense-exchange".to_string())
            .spawn(move || {
                let result = client.analyze(&owned_text, frame.as_ref());
                let _ = worker_tx.send(result);
            }) {
            Ok(handle) => Some(handle),
            Err(err) => {
                let _ = tx.send(ExchangeResult::fallback(ExchangeFailure::unreachable(
                    format!("exchange thread spawn failed: {err}"),
                )));
                None
            }
        };

        self.in_flight = Some(InFlightExchange {
            user_turn_id: user_turn_id.clone(),
            image_attached,
            started_at: Instant::now(),
            receiver,
            handle,
        });
        SubmitOutcome::Accepted {
            turn_id: user_turn_id,
        }
    }

    /// Settles the in-flight turn if its exchange has finished.
    pub fn poll(&mut self) -> Option<SettledTurn> {
        let received = {
            let in_flight = self.in_flight.as_ref()?;
            match in_flight.receiver.try_recv() {
                Ok(result) => result,
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => worker_lost(),
            }
        };
        self.settle(received)
    }

    /// Blocks until the in-flight turn settles.
    pub fn wait(&mut self) -> Option<SettledTurn> {
        let received = {
            let in_flight = self.in_flight.as_ref()?;
            in_flight.receiver.recv().unwrap_or_else(|_| worker_lost())
        };
        self.settle(received)
    }

    /// Runs a whole turn. `None` when the submission was rejected.
    pub fn send(&mut self, text: &str) -> Option<SettledTurn> {
        match self.submit(text) {
            SubmitOutcome::Accepted { .. } => self.wait(),
            SubmitOutcome::Empty | SubmitOutcome::Busy => None,
        }
    }

    fn settle(&mut self, result: ExchangeResult) -> Option<SettledTurn> {
        let mut in_flight = self.in_flight.take()?;
        if let Some(handle) = in_flight.handle.take() {
            let _ = handle.join();
        }

        let assistant_turn_id = self
            .session
            .push_assistant(&result.text, &result.analysis)
            .id
            .clone();
        self.emit(
            "turn_appended",
            json!({ "turn_id": assistant_turn_id, "author": "assistant" }),
        );

        let apply_mood = !result.is_fallback() || self.mood_policy == OfflineMoodPolicy::Overwrite;
        if apply_mood {
            if let Some(previous) = self.session.set_mood(result.mood) {
                self.emit(
                    "mood_changed",
                    json!({
                        "from": previous.map(|mood| mood.as_str()),
                        "to": result.mood.as_str(),
                    }),
                );
            }
        }

        self.session.set_pending(false);
        self.phase = TurnPhase::Idle;
        self.emit(
            "exchange_settled",
            json!({
                "turn_id": in_flight.user_turn_id,
                "reply_turn_id": assistant_turn_id,
                "offline": result.is_fallback(),
                "failure_kind": result.failure.as_ref().map(|failure| failure.kind),
                "failure": result.failure.as_ref().map(|failure| failure.message.clone()),
                "mood": result.mood.as_str(),
                "analysis": result.analysis,
                "latency_ms": in_flight.started_at.elapsed().as_millis() as u64,
            }),
        );

        Some(SettledTurn {
            user_turn_id: in_flight.user_turn_id,
            assistant_turn_id,
            image_attached: in_flight.image_attached,
            result,
        })
    }

    fn emit(&self, event_type: &str, payload: Value) {
        if let Some(events) = &self.events {
            events.emit_best_effort(event_type, payload);
        }
    }
}

fn worker_lost() -> ExchangeResult {
    ExchangeResult::fallback(ExchangeFailure::unreachable(
        "exchange worker exited without a result",
    ))
}
