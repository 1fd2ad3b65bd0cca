pub mod capture;
pub mod gate;
pub mod playback;
pub mod routing;
pub mod vad;

pub use capture::CpalCapture;
pub use gate::{CaptureBackend, CaptureConstraints, MediaGate, MediaHandle};
pub use playback::{fade_out, AudioOutput, RodioOutput, SilentOutput};
pub use routing::{AudioRoutingHint, NoRoutingHint};
pub use vad::{SpeechActivity, SpeechActivityMonitor, SpeechOnsetDetector, VadSettings};
