//! Signaling Module - der Kontrakt zum Pub/Sub-Channel
//!
//! Dieses Modul definiert den Transport-Kontrakt für den Room-Channel:
//! - Join/Leave mit Presence-Events
//! - Adressierte Signal-Envelopes (SDP, ICE)
//! - Metadaten-Updates (Mute-Flag)
//!
//! Der konkrete Transport ist austauschbar: `websocket` für einen
//! gehosteten Channel-Server, `local` als In-Process-Router.

mod local;
mod messages;
mod websocket;

pub use local::{LocalRouter, LocalTransport};
pub use messages::*;
pub use websocket::WebSocketSignaling;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::broadcast;

/// Erzeugt eine frische Peer-ID für Transports ohne serverseitige
/// ID-Vergabe
pub fn generate_peer_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("Channel connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not joined to any room")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Join failed: {0}")]
    JoinFailed(String),

    #[error("Server error: {code} - {message}")]
    ServerError { code: i32, message: String },
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events, die ein Transport an seine Abonnenten liefert
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Ein Teilnehmer ist dem Raum beigetreten; beim eigenen Join werden
    /// bereits anwesende Mitglieder als einzelne Joins nachgeliefert
    PresenceJoined { peer_id: String, meta: PresenceMeta },

    /// Ein Teilnehmer hat den Raum verlassen
    PresenceLeft { peer_id: String },

    /// Ein Teilnehmer hat seine Metadaten aktualisiert
    MetadataUpdated { peer_id: String, meta: PresenceMeta },

    /// An uns adressiertes Peer-Signal
    Signal(SignalEnvelope),

    /// Verbindung zum Channel verloren
    Disconnected,

    /// Verbindung wiederhergestellt und Raum erneut beigetreten
    Reconnected,
}

// ============================================================================
// TRANSPORT CONTRACT
// ============================================================================

/// Bidirektionaler Pub/Sub-Channel mit Presence
///
/// `join`/`leave` sind asynchron (Handshake mit eigenem Timeout des
/// Transports); Sends sind non-blocking und schlagen fehl statt zu
/// warten, wenn der Channel nicht verfügbar ist.
pub trait SignalingTransport: Send + Sync {
    /// Stabile, extern vergebene ID des lokalen Teilnehmers
    fn local_id(&self) -> String;

    /// Tritt einem Raum bei und veröffentlicht die eigenen Metadaten
    fn join(
        &self,
        room_id: String,
        meta: PresenceMeta,
    ) -> BoxFuture<'_, Result<(), SignalingError>>;

    /// Verlässt den aktuellen Raum; ohne Raum ein No-Op
    fn leave(&self) -> BoxFuture<'_, Result<(), SignalingError>>;

    /// Sendet ein adressiertes Signal in den Raum
    fn send_signal(&self, envelope: SignalEnvelope) -> Result<(), SignalingError>;

    /// Veröffentlicht neue Presence-Metadaten (z.B. das Mute-Flag)
    fn update_metadata(&self, meta: PresenceMeta) -> Result<(), SignalingError>;

    /// Event-Stream des Transports
    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent>;
}
