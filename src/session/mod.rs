//! Session Module - Zustand und Koordinator
//!
//! Dieses Modul verwaltet:
//! - den Session-Zustand (Phase, Mute, Roster)
//! - den prozessweiten Voice Coordinator
//! - Events für die UI (Observer statt Polling)

mod coordinator;
mod state;

pub use coordinator::{SessionError, SessionEvent, Visibility, VoiceCoordinator};
pub use state::{ConnectionPhase, Participant, SessionState, DEFAULT_VOLUME};
