//! Message Types für das Signaling-Protokoll
//!
//! Diese Strukturen bilden das Wire-Format des Room-Channels ab:
//! Join/Leave, Presence-Metadaten und die adressierten Signal-Envelopes
//! für den SDP/ICE-Austausch.

use serde::{Deserialize, Serialize};

// ============================================================================
// PRESENCE METADATA
// ============================================================================

/// Metadaten, die ein Teilnehmer über den Kanal veröffentlicht
///
/// `is_muted` ist die einzige Stelle, an der Remote-Peers den Mute-Status
/// erfahren; er wird nie aus dem Medientrack abgeleitet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMeta {
    #[serde(rename = "displayName")]
    pub display_name: String,
    pub tag: String,
    #[serde(rename = "isMuted")]
    pub is_muted: bool,
}

// ============================================================================
// SIGNAL ENVELOPE
// ============================================================================

/// Art eines Peer-zu-Peer-Signals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

/// Adressiertes Signal zwischen zwei Peers
///
/// `payload` trägt SDP bzw. den ICE-Candidate als JSON-String.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub kind: SignalKind,
    pub from: String,
    pub to: String,
    pub payload: String,
}

impl SignalEnvelope {
    pub fn new(kind: SignalKind, from: String, to: String, payload: String) -> Self {
        Self {
            kind,
            from,
            to,
            payload,
        }
    }
}

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

/// Raum beitreten
#[derive(Debug, Clone, Serialize)]
pub struct JoinPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "roomId")]
    pub room_id: String,
    #[serde(rename = "peerId")]
    pub peer_id: String,
    pub meta: PresenceMeta,
}

impl JoinPayload {
    pub fn new(room_id: String, peer_id: String, meta: PresenceMeta) -> Self {
        Self {
            msg_type: "join",
            room_id,
            peer_id,
            meta,
        }
    }
}

/// Raum verlassen
#[derive(Debug, Clone, Serialize)]
pub struct LeavePayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "peerId")]
    pub peer_id: String,
}

impl LeavePayload {
    pub fn new(peer_id: String) -> Self {
        Self {
            msg_type: "leave",
            peer_id,
        }
    }
}

/// Signal an einen anderen Peer weiterleiten
#[derive(Debug, Clone, Serialize)]
pub struct SignalPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub envelope: SignalEnvelope,
}

impl SignalPayload {
    pub fn new(envelope: SignalEnvelope) -> Self {
        Self {
            msg_type: "signal",
            envelope,
        }
    }
}

/// Eigene Presence-Metadaten aktualisieren
#[derive(Debug, Clone, Serialize)]
pub struct UpdateMetaPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "peerId")]
    pub peer_id: String,
    pub meta: PresenceMeta,
}

impl UpdateMetaPayload {
    pub fn new(peer_id: String, meta: PresenceMeta) -> Self {
        Self {
            msg_type: "update_meta",
            peer_id,
            meta,
        }
    }
}

/// Heartbeat
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "peerId")]
    pub peer_id: String,
}

impl HeartbeatPayload {
    pub fn new(peer_id: String) -> Self {
        Self {
            msg_type: "heartbeat",
            peer_id,
        }
    }
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

/// Mitglied eines Raums, wie es der Server im Join-Ack meldet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomMember {
    #[serde(rename = "peerId")]
    pub peer_id: String,
    pub meta: PresenceMeta,
}

/// Alle möglichen Server-Nachrichten
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Join bestätigt, inklusive der bereits anwesenden Mitglieder
    Joined {
        #[serde(rename = "roomId")]
        room_id: String,
        participants: Vec<RoomMember>,
        timestamp: i64,
    },

    /// Ein Peer ist dem Raum beigetreten
    PeerJoined {
        #[serde(rename = "peerId")]
        peer_id: String,
        meta: PresenceMeta,
        timestamp: i64,
    },

    /// Ein Peer hat den Raum verlassen
    PeerLeft {
        #[serde(rename = "peerId")]
        peer_id: String,
        timestamp: i64,
    },

    /// Ein Peer hat seine Metadaten aktualisiert
    MetaUpdated {
        #[serde(rename = "peerId")]
        peer_id: String,
        meta: PresenceMeta,
        timestamp: i64,
    },

    /// Weitergeleitetes Peer-Signal
    Signal {
        envelope: SignalEnvelope,
        timestamp: i64,
    },

    /// Fehler
    Error {
        code: i32,
        message: String,
        timestamp: i64,
    },

    /// Heartbeat Antwort
    Pong { timestamp: i64 },
}

// ============================================================================
// TESTS
// ============================================================================
