//! Session State - der Zustand einer Voice-Room-Teilnahme
//!
//! Reine Daten, keine Logik: Verbindungsphase, lokaler Mute-Status,
//! Mikrofon-Berechtigung und das Roster aller Teilnehmer.
//! Der Koordinator besitzt den Zustand exklusiv; Konsumenten erhalten
//! über `snapshot()` eine Kopie, niemals eine mutable Referenz.

use serde::{Deserialize, Serialize};

// ============================================================================
// CONNECTION PHASE
// ============================================================================

/// Verbindungsphase der Session
///
/// `Connecting` ist immer transient und wird entweder zu `Connected`
/// oder zurück zu `Disconnected` aufgelöst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    /// Keine aktive Session
    Disconnected,
    /// Beitritt läuft (Mikrofon + Channel-Join)
    Connecting,
    /// Session aktiv
    Connected,
}

// ============================================================================
// PARTICIPANT
// ============================================================================

/// Standard-Wiedergabelautstärke für neue Teilnehmer (0-100)
pub const DEFAULT_VOLUME: u8 = 100;

/// Ein Teilnehmer im Voice-Room
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    /// Stabile, extern vergebene ID
    pub id: String,
    pub display_name: String,
    /// Diskriminator im Stil "#0001"
    pub tag: String,
    /// Abgeleitet aus der Pegelanalyse, flüchtig
    pub is_speaking: bool,
    /// Vom Teilnehmer selbst gemeldet, nicht lokal erraten
    pub is_muted: bool,
    /// Nur-lokale Stummschaltung der Wiedergabe, wird nie übertragen
    pub locally_muted: bool,
    /// Wiedergabelautstärke 0-100, nur lokal
    pub volume: u8,
}

impl Participant {
    /// Erstellt einen neuen Teilnehmer mit Default-Wiedergabewerten
    pub fn new(id: String, display_name: String, tag: String, is_muted: bool) -> Self {
        Self {
            id,
            display_name,
            tag,
            is_speaking: false,
            is_muted,
            locally_muted: false,
            volume: DEFAULT_VOLUME,
        }
    }
}

// ============================================================================
// SESSION STATE
// ============================================================================

/// Gesamtzustand einer Voice-Session
///
/// Das Roster behält die Beitrittsreihenfolge bei (Anzeige-Reihenfolge
/// ist dennoch Sache der UI).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub phase: ConnectionPhase,
    /// Nur aussagekräftig solange `phase != Disconnected`
    pub room_id: Option<String>,
    /// Vom Benutzer gesteuert, unabhängig von der Verbindungsphase
    pub local_muted: bool,
    /// Tri-State: None = nie angefragt
    pub microphone_granted: Option<bool>,
    pub screen_sharing: bool,
    pub roster: Vec<Participant>,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            room_id: None,
            local_muted: false,
            microphone_granted: None,
            screen_sharing: false,
            roster: Vec::new(),
        }
    }

    /// Sucht einen Teilnehmer anhand seiner ID
    pub fn participant(&self, id: &str) -> Option<&Participant> {
        self.roster.iter().find(|p| p.id == id)
    }

    pub fn participant_mut(&mut self, id: &str) -> Option<&mut Participant> {
        self.roster.iter_mut().find(|p| p.id == id)
    }

    /// Fügt einen Teilnehmer hinzu; eine existierende ID wird ersetzt,
    /// behält aber ihre Position im Roster
    pub fn upsert_participant(&mut self, participant: Participant) {
        match self.roster.iter_mut().find(|p| p.id == participant.id) {
            Some(existing) => *existing = participant,
            None => self.roster.push(participant),
        }
    }

    /// Entfernt einen Teilnehmer; unbekannte IDs sind ein No-Op
    pub fn remove_participant(&mut self, id: &str) -> Option<Participant> {
        let idx = self.roster.iter().position(|p| p.id == id)?;
        Some(self.roster.remove(idx))
    }

    pub fn participant_count(&self) -> usize {
        self.roster.len()
    }

    /// Setzt alles auf den Ausgangszustand zurück; der lokale Mute-Wunsch
    /// und die Mikrofon-Berechtigung überleben die Session
    pub fn reset(&mut self) {
        self.phase = ConnectionPhase::Disconnected;
        self.room_id = None;
        self.screen_sharing = false;
        self.roster.clear();
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
