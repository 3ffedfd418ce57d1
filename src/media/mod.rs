//! Media Module - Capture und Pegelanalyse
//!
//! Dieses Modul verwaltet:
//! - Mikrofon-Capture hinter dem `MediaBackend`-Trait
//! - Mute über das Enabled-Flag statt über Stream-Teardown
//! - Sprech-Erkennung per geglätteter RMS-Abtastung
//! - Screen-Share-Lebenszyklus inklusive OS-seitigem Ende

mod audio;
pub mod backend;
mod manager;
mod speaking;

pub use audio::CpalBackend;
pub use backend::{
    MediaBackend, MediaError, MicrophoneConstraints, MicrophoneStream, ScreenStream, CHANNELS,
    FRAME_SIZE, SAMPLE_RATE,
};
pub use manager::MediaManager;
pub use speaking::{SpeakingMonitor, SPEAKING_THRESHOLD};
