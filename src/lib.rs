//! Chorus - Voice-Room Session Coordinator
//!
//! Eine Bibliothek für die Teilnahme an Mehrparteien-Voice-Rooms:
//! - Signaling über einen austauschbaren Pub/Sub-Channel
//! - WebRTC-Mesh mit einer Peer Connection pro Remote-Teilnehmer
//! - Mikrofon-Capture mit Mute und Sprech-Erkennung
//! - Prozessweiter Koordinator mit Event-Benachrichtigung für die UI
//!
//! Die Bibliothek wird aus UI-Event-Handlern heraus aufgerufen; sie
//! bringt keine eigene Oberfläche und keinen eigenen Server mit.

pub mod media;
pub mod peer;
pub mod session;
pub mod settings;
pub mod signaling;

pub use media::{CpalBackend, MediaBackend, MediaError, MediaManager, MicrophoneConstraints};
pub use peer::{default_ice_servers, IceServerConfig, PeerError, PeerManager};
pub use session::{
    ConnectionPhase, Participant, SessionError, SessionEvent, SessionState, Visibility,
    VoiceCoordinator,
};
pub use settings::{SettingsStore, UserSettings};
pub use signaling::{
    generate_peer_id, LocalRouter, LocalTransport, PresenceMeta, SignalEnvelope, SignalKind,
    SignalingError, SignalingEvent, SignalingTransport, WebSocketSignaling,
};

/// Initialisiert das Logging für Embedder und Beispiele
///
/// Bewusst nicht automatisch: die einbettende Anwendung entscheidet,
/// ob und wie sie einen Subscriber installiert.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chorus=debug".parse().expect("static directive"))
                .add_directive("webrtc=warn".parse().expect("static directive")),
        )
        .init();
}
