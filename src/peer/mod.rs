//! Peer Module - WebRTC-Verbindungen zu Remote-Teilnehmern
//!
//! Dieses Modul verwaltet:
//! - eine Peer Connection pro Remote-Teilnehmer
//! - Offer/Answer/Candidate-Austausch über den Signaling-Channel
//! - Playback-Sinks mit lokaler Lautstärke und Nur-lokal-Mute

mod link;
mod manager;

pub use link::{PeerLink, PlaybackSink};
pub use manager::{default_ice_servers, IceServerConfig, PeerManager};

use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum PeerError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),
}

// ============================================================================
// PEER EVENTS
// ============================================================================

/// Events aus den Peer-Verbindungen
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Lokaler ICE-Candidate, zu versenden über den Signaling-Channel
    IceCandidate { remote_id: String, candidate: String },

    /// Verbindung zu einem Peer steht
    LinkConnected { remote_id: String },

    /// Verbindung zu einem Peer endgültig fehlgeschlagen
    LinkFailed { remote_id: String },
}
