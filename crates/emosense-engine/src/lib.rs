pub mod capture;
pub mod devices;
pub mod inference;
pub mod orchestrator;

pub use capture::{
    CaptureConstraints, CaptureError, CapturedFrame, FacingMode, FrameCapture, FrameSource,
    VideoDevice, VideoStream, JPEG_QUALITY,
};
pub use devices::{NoCameraDevice, StillImageDevice, TestPatternDevice};
pub use inference::{
    build_request, DryrunInferenceClient, HttpInferenceClient, InferenceClient, DEFAULT_ENDPOINT,
    ENDPOINT_ENV,
};
pub use orchestrator::{
    OfflineMoodPolicy, SessionOrchestrator, SettledTurn, SubmitOutcome, TurnPhase,
};
