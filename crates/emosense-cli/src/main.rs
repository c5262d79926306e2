use std::io::{self, ErrorKind, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use emosense_contracts::chat::{parse_intent, CHAT_HELP_COMMANDS};
use emosense_contracts::events::EventWriter;
use emosense_contracts::session::{Author, Session};
use emosense_engine::{
    DryrunInferenceClient, FrameCapture, HttpInferenceClient, InferenceClient,
    NoCameraDevice, OfflineMoodPolicy, SessionOrchestrator, SettledTurn, StillImageDevice,
    SubmitOutcome, TestPatternDevice, VideoDevice, DEFAULT_ENDPOINT, ENDPOINT_ENV,
};
use serde_json::{json, Value};

#[derive(Debug, Parser)]
#[command(name = "emosense", version, about = "Local webcam + chat client for the EmoSense backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive chat session.
    Chat(ChatArgs),
    /// Send a single turn and print the result as JSON.
    Ask(AskArgs),
}

#[derive(Debug, Args)]
struct BackendArgs {
    #[arg(long, env = ENDPOINT_ENV, default_value = DEFAULT_ENDPOINT)]
    endpoint: String,
    /// Answer locally without contacting a backend.
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[command(flatten)]
    backend: BackendArgs,
    /// Image file or directory played back as the camera feed.
    #[arg(long, conflicts_with = "test_pattern")]
    frames: Option<PathBuf>,
    /// Use a synthetic colour-bar feed as the camera.
    #[arg(long)]
    test_pattern: bool,
    /// Start with the camera switched off.
    #[arg(long)]
    no_camera: bool,
    /// Keep the last detected mood when the backend is offline.
    #[arg(long)]
    preserve_mood_offline: bool,
}

#[derive(Debug, Parser)]
struct AskArgs {
    #[command(flatten)]
    backend: BackendArgs,
    #[arg(long)]
    text: String,
    /// Image attached as the captured frame.
    #[arg(long)]
    image: Option<PathBuf>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("emosense error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Chat(args) => {
            run_chat(args)?;
            Ok(0)
        }
        Command::Ask(args) => run_ask(args),
    }
}

fn build_client(args: &BackendArgs) -> Arc<dyn InferenceClient> {
    if args.dry_run {
        Arc::new(DryrunInferenceClient)
    } else {
        Arc::new(HttpInferenceClient::new(args.endpoint.clone()))
    }
}

fn build_capture(device: Box<dyn VideoDevice>, events: Option<&EventWriter>) -> FrameCapture {
    let capture = FrameCapture::new(device);
    match events {
        Some(events) => capture.with_events(events.clone()),
        None => capture,
    }
}

fn chat_device(args: &ChatArgs) -> Box<dyn VideoDevice> {
    if let Some(path) = &args.frames {
        Box::new(StillImageDevice::new(path))
    } else if args.test_pattern {
        Box::new(TestPatternDevice)
    } else {
        Box::new(NoCameraDevice)
    }
}

fn run_chat(args: ChatArgs) -> Result<()> {
    let session = Session::with_greeting();
    let events = args
        .backend
        .events
        .as_ref()
        .map(|path| EventWriter::new(path, session.session_id()));
    let client = build_client(&args.backend);
    let capture = build_capture(chat_device(&args), events.as_ref());
    let policy = if args.preserve_mood_offline {
        OfflineMoodPolicy::Preserve
    } else {
        OfflineMoodPolicy::Overwrite
    };

    if let Some(events) = &events {
        events.emit_json(
            "session_started",
            json!({
                "client": client.name(),
                "endpoint": args.backend.endpoint,
                "mood_policy": format!("{policy:?}"),
            }),
        )?;
    }

    let mut orchestrator = SessionOrchestrator::new(client, Box::new(capture))
        .with_session(session)
        .with_mood_policy(policy);
    if let Some(events) = &events {
        orchestrator = orchestrator.with_events(events.clone());
    }
    if !args.no_camera {
        set_camera(&mut orchestrator, true);
    }

    if let Some(turn) = orchestrator.session().last_turn() {
        println!("assistant> {}", turn.text);
    }
    println!("EmoSense chat started. Type /help for commands.");

    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim_end_matches(['\n', '\r']);
        let intent = parse_intent(input);
        match intent.action.as_str() {
            "noop" => {}
            "help" => {
                println!("Commands: {}", CHAT_HELP_COMMANDS.join(" "));
            }
            "quit" => break,
            "show_mood" => match orchestrator.session().mood() {
                Some(mood) => println!("Detected mood: {mood}"),
                None => println!("No mood detected yet."),
            },
            "show_history" => print_history(orchestrator.session()),
            "set_camera" => {
                let enabled = intent
                    .command_args
                    .get("enabled")
                    .and_then(Value::as_bool)
                    .unwrap_or(!orchestrator.capture_enabled());
                set_camera(&mut orchestrator, enabled);
            }
            "set_frames" => {
                let path = intent
                    .command_args
                    .get("path")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if path.is_empty() {
                    println!("/frames requires a path");
                    continue;
                }
                let capture =
                    build_capture(Box::new(StillImageDevice::new(path)), events.as_ref());
                match orchestrator.replace_capture(Box::new(capture)) {
                    Ok(()) => println!("Camera feed set to {path}"),
                    Err(err) => eprintln!("emosense: camera unavailable ({err}); continuing text-only"),
                }
            }
            "submit" => {
                let text = intent.text.unwrap_or_default();
                match orchestrator.submit(&text) {
                    SubmitOutcome::Accepted { .. } => {
                        println!("Thinking...");
                        if let Some(settled) = orchestrator.wait() {
                            print_settled(&settled);
                        }
                    }
                    SubmitOutcome::Busy => println!("Still waiting on the previous reply."),
                    SubmitOutcome::Empty => {}
                }
            }
            _ => {
                let command = intent
                    .command_args
                    .get("command")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                println!("Unknown command: /{command}. Type /help for commands.");
            }
        }
    }

    orchestrator.set_capture_enabled(false).ok();
    Ok(())
}

fn run_ask(args: AskArgs) -> Result<i32> {
    let client = build_client(&args.backend);
    let session = Session::new();
    let events = args
        .backend
        .events
        .as_ref()
        .map(|path| EventWriter::new(path, session.session_id()));
    let device: Box<dyn VideoDevice> = match &args.image {
        Some(path) => Box::new(StillImageDevice::new(path)),
        None => Box::new(NoCameraDevice),
    };
    let capture = build_capture(device, events.as_ref());

    let mut orchestrator = SessionOrchestrator::new(client, Box::new(capture)).with_session(session);
    if let Some(events) = &events {
        orchestrator = orchestrator.with_events(events.clone());
    }
    if let Some(path) = &args.image {
        if let Err(err) = orchestrator.set_capture_enabled(true) {
            bail!("cannot use {} as the captured frame: {err}", path.display());
        }
    }

    let Some(settled) = orchestrator.send(&args.text) else {
        bail!("--text must not be empty");
    };
    let result = &settled.result;
    let output = json!({
        "response": result.text,
        "mood": result.mood.as_str(),
        "analysis": result.analysis,
        "offline": result.is_fallback(),
        "image_attached": settled.image_attached,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    if let Some(failure) = &result.failure {
        eprintln!("emosense: backend unavailable: {failure}");
        return Ok(2);
    }
    Ok(0)
}

fn set_camera(orchestrator: &mut SessionOrchestrator, enabled: bool) {
    match orchestrator.set_capture_enabled(enabled) {
        Ok(()) if enabled => println!("Camera on."),
        Ok(()) => println!("Camera off."),
        Err(err) => eprintln!("emosense: camera unavailable ({err}); continuing text-only"),
    }
}

fn print_settled(settled: &SettledTurn) {
    let result = &settled.result;
    println!("assistant> {}", result.text);
    println!("  [mood: {} | {}]", result.mood, result.analysis);
    if let Some(failure) = &result.failure {
        eprintln!("emosense: backend unavailable: {failure}");
    }
}

fn print_history(session: &Session) {
    for turn in session.turns() {
        let who = match turn.author {
            Author::User => "you",
            Author::Assistant => "assistant",
        };
        println!(
            "{} {:>9}> {}",
            turn.created_at.format("%H:%M:%S"),
            who,
            turn.text
        );
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{build_client, chat_device, Cli, Command, DEFAULT_ENDPOINT};

    #[test]
    fn chat_defaults_to_local_endpoint_and_no_device() {
        let cli = Cli::try_parse_from(["emosense", "chat"]).unwrap();
        let Command::Chat(args) = cli.command else {
            panic!("expected chat command");
        };
        if std::env::var_os("EMOSENSE_API_URL").is_none() {
            assert_eq!(args.backend.endpoint, DEFAULT_ENDPOINT);
        }
        assert!(!args.no_camera);
        assert_eq!(chat_device(&args).name(), "none");
        assert_eq!(build_client(&args.backend).name(), "http");
    }

    #[test]
    fn chat_device_flags() {
        let cli = Cli::try_parse_from(["emosense", "chat", "--test-pattern", "--dry-run"]).unwrap();
        let Command::Chat(args) = cli.command else {
            panic!("expected chat command");
        };
        assert_eq!(chat_device(&args).name(), "test-pattern");
        assert_eq!(build_client(&args.backend).name(), "dryrun");

        let cli = Cli::try_parse_from(["emosense", "chat", "--frames", "shots"]).unwrap();
        let Command::Chat(args) = cli.command else {
            panic!("expected chat command");
        };
        assert_eq!(chat_device(&args).name(), "stills:shots");
    }

    #[test]
    fn frames_and_test_pattern_conflict() {
        let parsed = Cli::try_parse_from([
            "emosense",
            "chat",
            "--frames",
            "shots",
            "--test-pattern",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn ask_requires_text() {
        assert!(Cli::try_parse_from(["emosense", "ask"]).is_err());
        let cli = Cli::try_parse_from([
            "emosense",
            "ask",
            "--text",
            "hi",
            "--endpoint",
            "http://127.0.0.1:9/api/analyze",
        ])
        .unwrap();
        let Command::Ask(args) = cli.command else {
            panic!("expected ask command");
        };
        assert_eq!(args.text, "hi");
        assert_eq!(args.backend.endpoint, "http://127.0.0.1:9/api/analyze");
        assert!(args.image.is_none());
    }
}
