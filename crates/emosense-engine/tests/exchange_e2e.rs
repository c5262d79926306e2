use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use emosense_contracts::wire::{
    EmotionLabel, ExchangeFailureKind, FALLBACK_RESPONSE_TEXT, JPEG_DATA_URI_PREFIX,
    OFFLINE_ANALYSIS,
};
use emosense_engine::{
    FrameCapture, HttpInferenceClient, NoCameraDevice, OfflineMoodPolicy, SessionOrchestrator,
    TestPatternDevice,
};
use serde_json::{json, Value};

struct StubBackend {
    url: String,
    requests: mpsc::Receiver<Value>,
    handle: thread::JoinHandle<()>,
}

/// Serves `replies` in order, one connection each, then exits.
fn spawn_backend(replies: Vec<(u16, String)>) -> anyhow::Result<StubBackend> {
    spawn_slow_backend(Duration::ZERO, replies)
}

/// Like [`spawn_backend`], but waits `delay` after reading each request.
fn spawn_slow_backend(delay: Duration, replies: Vec<(u16, String)>) -> anyhow::Result<StubBackend> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        for (status, body) in replies {
            let Ok((stream, _)) = listener.accept() else {
                return;
            };
            let mut reader = BufReader::new(stream);
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap_or(0) == 0 {
                    break;
                }
                let line = line.trim_end();
                if line.is_empty() {
                    break;
                }
                if let Some((name, value)) = line.split_once(':') {
                    if name.eq_ignore_ascii_case("content-length") {
                        content_length = value.trim().parse().unwrap_or(0);
                    }
                }
            }
            let mut raw = vec![0u8; content_length];
            if reader.read_exact(&mut raw).is_err() {
                return;
            }
            let _ = tx.send(serde_json::from_slice(&raw).unwrap_or(Value::Null));
            thread::sleep(delay);

            let mut stream = reader.into_inner();
            let response = format!(
                "HTTP/1.1 {status} STUB\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes());
            let _ = stream.flush();
        }
    });
    Ok(StubBackend {
        url: format!("http://127.0.0.1:{port}/api/analyze"),
        requests: rx,
        handle,
    })
}

fn text_only_orchestrator(url: &str) -> SessionOrchestrator {
    SessionOrchestrator::new(
        Arc::new(HttpInferenceClient::new(url)),
        Box::new(FrameCapture::new(Box::new(NoCameraDevice))),
    )
}

#[test]
fn exhausted_scenario_without_camera() -> anyhow::Result<()> {
    let backend = spawn_backend(vec![(
        200,
        json!({
            "response": "That sounds tough.",
            "mood": "Tired",
            "analysis": "low energy tone",
        })
        .to_string(),
    )])?;
    let mut orchestrator = text_only_orchestrator(&backend.url);

    let settled = orchestrator.send("I'm exhausted");

    let body = backend.requests.recv()?;
    assert_eq!(body, json!({"text": "I'm exhausted", "image": null}));

    let session = orchestrator.session();
    assert_eq!(session.turns().len(), 2);
    assert_eq!(session.turns()[1].text, "That sounds tough.");
    assert_eq!(session.turns()[1].analysis.as_deref(), Some("low energy tone"));
    assert_eq!(session.mood(), Some(EmotionLabel::Tired));
    assert!(!session.pending());
    assert_eq!(settled.map(|turn| turn.result.is_fallback()), Some(false));

    let _ = backend.handle.join();
    Ok(())
}

#[test]
fn active_camera_sends_jpeg_data_uri() -> anyhow::Result<()> {
    let backend = spawn_backend(vec![(
        200,
        json!({"response": "ok", "mood": "Happy", "analysis": "calm"}).to_string(),
    )])?;
    let mut orchestrator = SessionOrchestrator::new(
        Arc::new(HttpInferenceClient::new(&backend.url)),
        Box::new(FrameCapture::new(Box::new(TestPatternDevice))),
    );
    orchestrator.set_capture_enabled(true)?;

    let settled = orchestrator.send("look at me");

    let body = backend.requests.recv()?;
    let image = body["image"].as_str().unwrap_or_default();
    assert!(image.starts_with(JPEG_DATA_URI_PREFIX), "unexpected image: {image:.40}");
    assert!(image.len() > JPEG_DATA_URI_PREFIX.len());
    assert_eq!(settled.map(|turn| turn.image_attached), Some(true));
    assert_eq!(orchestrator.session().mood(), Some(EmotionLabel::Happy));

    let _ = backend.handle.join();
    Ok(())
}

#[test]
fn server_error_and_bad_mood_fall_back() -> anyhow::Result<()> {
    let backend = spawn_backend(vec![
        (200, json!({"response": "ok", "mood": "Sad", "analysis": "x"}).to_string()),
        (500, "{\"detail\": \"boom\"}".to_string()),
        (200, json!({"response": "ok", "mood": "Bored", "analysis": "x"}).to_string()),
    ])?;
    let mut orchestrator =
        text_only_orchestrator(&backend.url).with_mood_policy(OfflineMoodPolicy::Preserve);

    orchestrator.send("one");
    let server_error = orchestrator.send("two");
    let bad_mood = orchestrator.send("three");

    let server_error = server_error.map(|turn| turn.result);
    assert_eq!(
        server_error.as_ref().and_then(|result| result.failure.as_ref()).map(|f| f.kind),
        Some(ExchangeFailureKind::Unreachable)
    );
    assert_eq!(
        server_error.map(|result| result.text),
        Some(FALLBACK_RESPONSE_TEXT.to_string())
    );
    assert_eq!(
        bad_mood
            .and_then(|turn| turn.result.failure)
            .map(|failure| failure.kind),
        Some(ExchangeFailureKind::Malformed)
    );

    let session = orchestrator.session();
    assert_eq!(session.turns().len(), 6);
    assert_eq!(session.mood(), Some(EmotionLabel::Sad));
    assert_eq!(session.last_analysis(), Some(OFFLINE_ANALYSIS));

    let _ = backend.handle.join();
    Ok(())
}

#[test]
fn unreachable_backend_yields_offline_turn() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    let mut orchestrator = text_only_orchestrator(&format!("http://127.0.0.1:{port}/api/analyze"));

    let settled = orchestrator.send("anyone there?");

    let session = orchestrator.session();
    assert_eq!(session.turns().len(), 2);
    assert_eq!(session.turns()[1].text, FALLBACK_RESPONSE_TEXT);
    assert_eq!(session.turns()[1].analysis.as_deref(), Some(OFFLINE_ANALYSIS));
    assert_eq!(session.mood(), Some(EmotionLabel::Neutral));
    assert_eq!(settled.map(|turn| turn.result.is_fallback()), Some(true));
    Ok(())
}

#[test]
fn slow_backend_reply_still_settles_online() -> anyhow::Result<()> {
    // Longer than reqwest's default request timeout.
    let backend = spawn_slow_backend(
        Duration::from_secs(32),
        vec![(
            200,
            json!({"response": "Take your time.", "mood": "Tired", "analysis": "slow"}).to_string(),
        )],
    )?;
    let mut orchestrator = text_only_orchestrator(&backend.url);

    let settled = orchestrator.send("still thinking?");

    assert_eq!(settled.as_ref().map(|turn| turn.result.is_fallback()), Some(false));
    let session = orchestrator.session();
    assert_eq!(session.turns()[1].text, "Take your time.");
    assert_eq!(session.mood(), Some(EmotionLabel::Tired));

    let _ = backend.handle.join();
    Ok(())
}
