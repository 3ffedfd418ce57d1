//! Voice Coordinator - der Lebenszyklus einer Room-Teilnahme
//!
//! Ein prozessweiter Dienst, unabhängig von jeder UI-Ansicht: Ansichten
//! dürfen kommen und gehen, ein laufender Call bleibt bestehen. Jede
//! Mutation läuft über den Koordinator und löst eine Event-Benachrichtigung
//! aus; die UI rendert aus Snapshots, nie aus geteiltem Zustand.

use super::state::{ConnectionPhase, Participant, SessionState};
use crate::media::{MediaBackend, MediaError, MediaManager, SpeakingMonitor};
use crate::peer::{IceServerConfig, PeerError, PeerEvent, PeerManager};
use crate::settings::{SettingsError, SettingsStore};
use crate::signaling::{
    PresenceMeta, SignalEnvelope, SignalKind, SignalingError, SignalingEvent, SignalingTransport,
};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("No active session")]
    NotInSession,

    #[error("Connect attempt superseded")]
    Aborted,
}

// ============================================================================
// SESSION EVENTS
// ============================================================================

/// Sichtbarkeit des einbettenden Fensters/Tabs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Events, die der Koordinator an die UI liefert
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Zustand hat sich geändert; enthält den frischen Snapshot
    StateChanged(SessionState),

    /// Sprech-Status eines Teilnehmers hat gewechselt
    SpeakingChanged { peer_id: String, speaking: bool },

    /// Bildschirmfreigabe wurde beendet (explizit oder über die OS-UI)
    ScreenShareEnded,

    /// Nicht-fatale Störung (z.B. Mikrofon verweigert, Peer-Fehler)
    Warning(String),

    /// Session-Fehler
    Error(String),
}

// ============================================================================
// COORDINATOR
// ============================================================================

/// Singleton-Slot für den prozessweiten Koordinator
static COORDINATOR: OnceCell<Arc<VoiceCoordinator>> = OnceCell::new();

pub struct VoiceCoordinator {
    state: Arc<Mutex<SessionState>>,
    media: Arc<MediaManager>,
    peers: Arc<PeerManager>,
    transport: Arc<dyn SignalingTransport>,
    settings: Arc<SettingsStore>,
    events: broadcast::Sender<SessionEvent>,
    /// Monoton wachsender Zähler; ein Connect-Versuch, dessen Generation
    /// überholt wurde, installiert keine Ressourcen mehr
    attempt: AtomicU64,
    speaking: Mutex<Option<SpeakingMonitor>>,
    visibility: Mutex<Visibility>,
    /// Anzeigename und Tag, zur Connect-Zeit aus den Settings gelesen
    local_profile: Mutex<Option<(String, String)>>,
}

impl VoiceCoordinator {
    /// Erstellt den Koordinator und startet die Event-Pumpen
    ///
    /// Braucht eine laufende tokio-Runtime.
    pub fn new(
        transport: Arc<dyn SignalingTransport>,
        backend: Arc<dyn MediaBackend>,
        settings: Arc<SettingsStore>,
        ice_servers: Vec<IceServerConfig>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(100);

        let coordinator = Arc::new(Self {
            state: Arc::new(Mutex::new(SessionState::new())),
            media: Arc::new(MediaManager::new(backend)),
            peers: Arc::new(PeerManager::new(ice_servers)),
            transport,
            settings,
            events,
            attempt: AtomicU64::new(0),
            speaking: Mutex::new(None),
            visibility: Mutex::new(Visibility::Visible),
            local_profile: Mutex::new(None),
        });

        Self::spawn_signaling_pump(&coordinator);
        Self::spawn_peer_pump(&coordinator);

        coordinator
    }

    /// Komfort-Konstruktor mit cpal-Backend, Settings-Datenbank und
    /// Standard-STUN-Servern
    pub fn with_defaults(
        transport: Arc<dyn SignalingTransport>,
    ) -> Result<Arc<Self>, SettingsError> {
        let settings = Arc::new(SettingsStore::open()?);
        Ok(Self::new(
            transport,
            Arc::new(crate::media::CpalBackend::new()),
            settings,
            crate::peer::default_ice_servers(),
        ))
    }

    /// Installiert den prozessweiten Koordinator
    pub fn install(coordinator: Arc<Self>) -> Result<(), Arc<Self>> {
        COORDINATOR.set(coordinator)
    }

    /// Gibt den prozessweiten Koordinator zurück
    pub fn global() -> Option<Arc<Self>> {
        COORDINATOR.get().cloned()
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Kopie des aktuellen Zustands
    pub fn snapshot(&self) -> SessionState {
        self.state.lock().clone()
    }

    pub fn local_id(&self) -> String {
        self.transport.local_id()
    }

    // ========================================================================
    // CONNECT / DISCONNECT
    // ========================================================================

    /// Tritt einem Raum bei
    ///
    /// No-Op während eines laufenden Connects; ein Wechsel in einen
    /// anderen Raum trennt zuerst die bestehende Session. Ein
    /// verweigertes Mikrofon bricht den Beitritt nicht ab - die Session
    /// startet dann stumm und ohne Gerät.
    pub async fn connect(&self, room_id: &str) -> Result<SessionState, SessionError> {
        let needs_disconnect = {
            let state = self.state.lock();
            match state.phase {
                ConnectionPhase::Connecting => {
                    tracing::debug!("Connect ignored, already connecting");
                    return Ok(state.clone());
                }
                ConnectionPhase::Connected => {
                    if state.room_id.as_deref() == Some(room_id) {
                        return Ok(state.clone());
                    }
                    true
                }
                ConnectionPhase::Disconnected => false,
            }
        };

        if needs_disconnect {
            tracing::info!("Switching rooms, disconnecting first");
            self.disconnect().await;
        }

        let generation = self.attempt.fetch_add(1, Ordering::SeqCst) + 1;

        {
            let mut state = self.state.lock();
            state.phase = ConnectionPhase::Connecting;
            state.room_id = Some(room_id.to_string());
        }
        self.emit_state();

        tracing::info!("Connecting to room '{}'", room_id);

        // Settings zur Connect-Zeit lesen
        let settings = self.settings.load().unwrap_or_else(|e| {
            tracing::warn!("Falling back to default settings: {}", e);
            Default::default()
        });
        *self.local_profile.lock() = Some((settings.display_name.clone(), settings.tag.clone()));

        // Mikrofon anfordern; der Prompt kann beliebig lange offen stehen
        let mic_result = self
            .media
            .acquire_microphone(&settings.microphone_constraints());

        if self.attempt.load(Ordering::SeqCst) != generation {
            // Ein Disconnect kam dazwischen: frisch erworbenen Stream
            // sofort wieder freigeben statt ihn zu installieren. Läuft
            // bereits ein neuerer Versuch, gehört ihm das Mikrofon.
            if self.state.lock().phase == ConnectionPhase::Disconnected {
                self.media.release_microphone();
            }
            return Err(SessionError::Aborted);
        }

        let microphone_granted = match mic_result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Microphone unavailable, joining muted: {}", e);
                let _ = self.events.send(SessionEvent::Warning(format!(
                    "microphone unavailable: {}",
                    e
                )));
                false
            }
        };

        let local_muted = {
            let mut state = self.state.lock();
            if !microphone_granted {
                // Ohne Gerät startet die Session stumm
                state.local_muted = true;
            }
            state.microphone_granted = Some(microphone_granted);
            state.local_muted
        };
        self.media.set_muted(local_muted);

        // Raum beitreten
        let meta = self.local_meta(local_muted);
        if let Err(e) = self
            .transport
            .join(room_id.to_string(), meta.clone())
            .await
        {
            tracing::error!("Join failed: {}", e);
            // Rollback nur, solange kein neuerer Versuch läuft: nie in
            // Connecting hängen bleiben, aber auch nichts überschreiben
            if self.attempt.load(Ordering::SeqCst) == generation {
                self.media.release_microphone();
                self.state.lock().reset();
                self.emit_state();
            }
            let _ = self
                .events
                .send(SessionEvent::Error(format!("join failed: {}", e)));
            return Err(e.into());
        }

        if self.attempt.load(Ordering::SeqCst) != generation {
            if self.state.lock().phase == ConnectionPhase::Disconnected {
                let _ = self.transport.leave().await;
                self.media.release_microphone();
            }
            return Err(SessionError::Aborted);
        }

        // Lokalen Teilnehmer ins Roster aufnehmen
        {
            let mut state = self.state.lock();
            state.phase = ConnectionPhase::Connected;
            state.upsert_participant(Participant::new(
                self.transport.local_id(),
                meta.display_name,
                meta.tag,
                local_muted,
            ));
        }
        self.emit_state();

        if microphone_granted && *self.visibility.lock() == Visibility::Visible {
            self.start_speaking_monitor();
        }

        tracing::info!("Connected to room '{}'", room_id);
        Ok(self.snapshot())
    }

    /// Verlässt die Session; aus jedem Zustand heraus sicher aufrufbar
    pub async fn disconnect(&self) {
        // Laufende Connect-Versuche für veraltet erklären
        self.attempt.fetch_add(1, Ordering::SeqCst);

        if let Some(monitor) = self.speaking.lock().take() {
            monitor.stop();
        }

        self.peers.close_all().await;
        self.media.stop_screen_share();
        self.media.release_microphone();

        let was_active = self.state.lock().phase != ConnectionPhase::Disconnected;
        if was_active {
            if let Err(e) = self.transport.leave().await {
                tracing::warn!("Leave failed: {}", e);
            }
            self.state.lock().reset();
            self.emit_state();
            tracing::info!("Disconnected");
        }
    }

    // ========================================================================
    // MUTE
    // ========================================================================

    /// Kippt den lokalen Mute-Status und veröffentlicht ihn im Raum
    pub fn toggle_mute(&self) -> bool {
        let (muted, connected) = {
            let mut state = self.state.lock();
            state.local_muted = !state.local_muted;
            let muted = state.local_muted;

            let local_id = self.transport.local_id();
            if let Some(local) = state.participant_mut(&local_id) {
                local.is_muted = muted;
                if muted {
                    local.is_speaking = false;
                }
            }

            (muted, state.phase == ConnectionPhase::Connected)
        };

        self.media.set_muted(muted);

        if connected {
            // Remote-Seiten rendern das Mute-Icon aus den Metadaten,
            // nicht aus dem Medientrack
            let meta = self.local_meta(muted);
            if let Err(e) = self.transport.update_metadata(meta) {
                tracing::warn!("Failed to publish mute flag: {}", e);
            }
        }

        self.emit_state();
        muted
    }

    // ========================================================================
    // PLAYBACK CONTROLS (nur lokal)
    // ========================================================================

    /// Setzt die Wiedergabelautstärke eines Teilnehmers (0-100)
    pub fn set_participant_volume(&self, peer_id: &str, volume: u8) {
        let volume = volume.min(100);
        {
            let mut state = self.state.lock();
            if let Some(participant) = state.participant_mut(peer_id) {
                participant.volume = volume;
            }
        }
        self.peers.set_volume(peer_id, volume);
        self.emit_state();
    }

    /// Schaltet die Wiedergabe eines Teilnehmers nur lokal stumm
    pub fn toggle_local_mute(&self, peer_id: &str) -> bool {
        let muted = {
            let mut state = self.state.lock();
            match state.participant_mut(peer_id) {
                Some(participant) => {
                    participant.locally_muted = !participant.locally_muted;
                    participant.locally_muted
                }
                None => return false,
            }
        };
        self.peers.set_local_mute(peer_id, muted);
        self.emit_state();
        muted
    }

    // ========================================================================
    // VISIBILITY
    // ========================================================================

    /// Pausiert die Sprech-Erkennung im Hintergrund; Peer-Links und
    /// Mikrofon bleiben unangetastet, der Call läuft weiter
    pub fn set_visibility(&self, visibility: Visibility) {
        *self.visibility.lock() = visibility;

        match visibility {
            Visibility::Hidden => {
                if let Some(monitor) = self.speaking.lock().take() {
                    monitor.stop();
                    tracing::debug!("Speaking analysis paused (hidden)");
                }
            }
            Visibility::Visible => {
                let should_resume = {
                    let state = self.state.lock();
                    state.phase == ConnectionPhase::Connected
                        && state.microphone_granted == Some(true)
                };
                if should_resume && self.speaking.lock().is_none() {
                    self.start_speaking_monitor();
                    tracing::debug!("Speaking analysis resumed (visible)");
                }
            }
        }
    }

    // ========================================================================
    // SCREEN SHARE
    // ========================================================================

    /// Startet die Bildschirmfreigabe
    pub fn start_screen_share(&self) -> Result<(), SessionError> {
        if self.state.lock().phase != ConnectionPhase::Connected {
            return Err(SessionError::NotInSession);
        }

        let ended = self.media.start_screen_share().map_err(SessionError::from)?;

        {
            let mut state = self.state.lock();
            state.screen_sharing = true;
        }
        self.emit_state();

        // Auf das Ende warten - auch das OS-seitige über die native UI
        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        let media = Arc::clone(&self.media);
        tokio::spawn(async move {
            let mut ended = ended;
            while ended.changed().await.is_ok() {
                if *ended.borrow() {
                    media.stop_screen_share();
                    state.lock().screen_sharing = false;
                    let _ = events.send(SessionEvent::ScreenShareEnded);
                    let snapshot = state.lock().clone();
                    let _ = events.send(SessionEvent::StateChanged(snapshot));
                    break;
                }
            }
        });

        Ok(())
    }

    /// Beendet die Bildschirmfreigabe; der Watcher räumt den Zustand auf
    pub fn stop_screen_share(&self) {
        self.media.stop_screen_share();
    }

    // ========================================================================
    // EVENT PUMPS
    // ========================================================================

    fn spawn_signaling_pump(coordinator: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(coordinator);
        let mut rx = coordinator.transport.subscribe();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Some(coordinator) = weak.upgrade() else {
                            break;
                        };
                        coordinator.handle_signaling_event(event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // Verpasste Events; Presence wird mit dem nächsten
                        // Event wieder konsistent
                        tracing::warn!("Signaling pump lagged, missed {} events", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn spawn_peer_pump(coordinator: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(coordinator);
        let mut rx = coordinator.peers.subscribe();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Some(coordinator) = weak.upgrade() else {
                            break;
                        };
                        coordinator.handle_peer_event(event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("Peer pump lagged, missed {} events", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Verarbeitet Events vom Signaling-Channel
    async fn handle_signaling_event(&self, event: SignalingEvent) {
        // Nach dem Disconnect sind Channel-Events veraltet
        if self.state.lock().phase == ConnectionPhase::Disconnected {
            return;
        }

        let local_id = self.transport.local_id();

        match event {
            SignalingEvent::PresenceJoined { peer_id, meta } => {
                if peer_id == local_id {
                    return;
                }
                tracing::info!("Peer joined: {} ({})", meta.display_name, peer_id);

                {
                    let mut state = self.state.lock();
                    state.upsert_participant(Participant::new(
                        peer_id.clone(),
                        meta.display_name,
                        meta.tag,
                        meta.is_muted,
                    ));
                }
                self.emit_state();

                // Link anlegen; die lexikographisch kleinere ID bietet an
                match self.peers.ensure_link(&peer_id).await {
                    Ok(_) => {
                        if PeerManager::should_offer(&local_id, &peer_id) {
                            match self.peers.offer_to(&peer_id).await {
                                Ok(sdp) => {
                                    let envelope = SignalEnvelope::new(
                                        SignalKind::Offer,
                                        local_id,
                                        peer_id.clone(),
                                        sdp,
                                    );
                                    if let Err(e) = self.transport.send_signal(envelope) {
                                        tracing::warn!("Failed to send offer: {}", e);
                                    }
                                }
                                Err(e) => self.isolate_peer(&peer_id, &e.to_string()).await,
                            }
                        }
                    }
                    Err(e) => self.isolate_peer(&peer_id, &e.to_string()).await,
                }
            }

            SignalingEvent::PresenceLeft { peer_id } => {
                tracing::info!("Peer left: {}", peer_id);
                self.peers.close_link(&peer_id).await;
                let removed = self.state.lock().remove_participant(&peer_id).is_some();
                if removed {
                    self.emit_state();
                }
            }

            SignalingEvent::MetadataUpdated { peer_id, meta } => {
                if peer_id == local_id {
                    return;
                }
                let changed = {
                    let mut state = self.state.lock();
                    match state.participant_mut(&peer_id) {
                        Some(participant) => {
                            participant.display_name = meta.display_name;
                            participant.tag = meta.tag;
                            participant.is_muted = meta.is_muted;
                            if meta.is_muted {
                                participant.is_speaking = false;
                            }
                            true
                        }
                        None => false,
                    }
                };
                if changed {
                    self.emit_state();
                }
            }

            SignalingEvent::Signal(envelope) => {
                if envelope.to != local_id {
                    return;
                }
                self.handle_signal(envelope).await;
            }

            SignalingEvent::Disconnected => {
                tracing::warn!("Signaling channel lost");
                let _ = self
                    .events
                    .send(SessionEvent::Warning("signaling channel lost".to_string()));
            }

            SignalingEvent::Reconnected => {
                tracing::info!("Signaling channel restored");
                // Defensive Reconciliation: eigenen Zustand erneut
                // veröffentlichen
                let muted = self.state.lock().local_muted;
                let _ = self.transport.update_metadata(self.local_meta(muted));
            }
        }
    }

    /// Verarbeitet ein an uns adressiertes Peer-Signal
    async fn handle_signal(&self, envelope: SignalEnvelope) {
        let from = envelope.from.clone();

        match envelope.kind {
            SignalKind::Offer => match self.peers.handle_offer(&from, envelope.payload).await {
                Ok(answer_sdp) => {
                    let answer = SignalEnvelope::new(
                        SignalKind::Answer,
                        self.transport.local_id(),
                        from.clone(),
                        answer_sdp,
                    );
                    if let Err(e) = self.transport.send_signal(answer) {
                        tracing::warn!("Failed to send answer: {}", e);
                    }
                }
                Err(e) => self.isolate_peer(&from, &e.to_string()).await,
            },

            SignalKind::Answer => {
                if let Err(e) = self.peers.handle_answer(&from, envelope.payload).await {
                    self.isolate_peer(&from, &e.to_string()).await;
                }
            }

            SignalKind::IceCandidate => {
                // Nicht fatal: Candidates dürfen verspätet oder für schon
                // abgebaute Links eintreffen
                if let Err(e) = self.peers.handle_candidate(&from, envelope.payload).await {
                    tracing::warn!("Ignoring bad candidate from {}: {}", from, e);
                }
            }
        }
    }

    /// Verarbeitet Events aus den Peer-Verbindungen
    async fn handle_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::IceCandidate {
                remote_id,
                candidate,
            } => {
                let envelope = SignalEnvelope::new(
                    SignalKind::IceCandidate,
                    self.transport.local_id(),
                    remote_id,
                    candidate,
                );
                if let Err(e) = self.transport.send_signal(envelope) {
                    tracing::debug!("Dropping local candidate: {}", e);
                }
            }

            PeerEvent::LinkConnected { remote_id } => {
                tracing::info!("Link to {} established", remote_id);
            }

            PeerEvent::LinkFailed { remote_id } => {
                self.isolate_peer(&remote_id, "transport failed").await;
            }
        }
    }

    /// Ein fehlerhafter Peer wird isoliert entfernt; die Session und die
    /// übrigen Links bleiben unberührt
    async fn isolate_peer(&self, peer_id: &str, reason: &str) {
        tracing::warn!("Removing peer {}: {}", peer_id, reason);
        self.peers.close_link(peer_id).await;
        let removed = self.state.lock().remove_participant(peer_id).is_some();
        let _ = self.events.send(SessionEvent::Warning(format!(
            "peer {} removed: {}",
            peer_id, reason
        )));
        if removed {
            self.emit_state();
        }
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    fn start_speaking_monitor(&self) {
        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        let local_id = self.transport.local_id();

        let monitor = SpeakingMonitor::start(Arc::clone(&self.media), move |speaking| {
            {
                let mut state = state.lock();
                if let Some(local) = state.participant_mut(&local_id) {
                    local.is_speaking = speaking;
                }
            }
            let _ = events.send(SessionEvent::SpeakingChanged {
                peer_id: local_id.clone(),
                speaking,
            });
            let snapshot = state.lock().clone();
            let _ = events.send(SessionEvent::StateChanged(snapshot));
        });

        *self.speaking.lock() = Some(monitor);
    }

    fn local_meta(&self, is_muted: bool) -> PresenceMeta {
        let (display_name, tag) = self
            .local_profile
            .lock()
            .clone()
            .unwrap_or_else(|| ("User".to_string(), "#0000".to_string()));
        PresenceMeta {
            display_name,
            tag,
            is_muted,
        }
    }

    fn emit_state(&self) {
        let snapshot = self.state.lock().clone();
        let _ = self.events.send(SessionEvent::StateChanged(snapshot));
    }
}

impl std::fmt::Debug for VoiceCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceCoordinator")
            .field("state", &*self.state.lock())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::backend::mock::MockBackend;
    use crate::signaling::{LocalRouter, LocalTransport};
    use std::time::Duration;

    struct TestPeer {
        coordinator: Arc<VoiceCoordinator>,
        backend: Arc<MockBackend>,
    }

    fn peer_with_backend(
        router: &Arc<LocalRouter>,
        id: &str,
        backend: MockBackend,
    ) -> TestPeer {
        let backend = Arc::new(backend);
        let transport = LocalTransport::new(Arc::clone(router), id);
        let settings = Arc::new(SettingsStore::open_in_memory().unwrap());
        let coordinator = VoiceCoordinator::new(
            transport,
            Arc::clone(&backend) as Arc<dyn MediaBackend>,
            settings,
            Vec::new(),
        );
        TestPeer {
            coordinator,
            backend,
        }
    }

    fn peer(router: &Arc<LocalRouter>, id: &str) -> TestPeer {
        peer_with_backend(router, id, MockBackend::new())
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    #[tokio::test]
    async fn test_connect_disconnect_sequence() {
        let router = LocalRouter::new();
        let alice = peer(&router, "a");

        let state = alice.coordinator.connect("general").await.unwrap();
        assert_eq!(state.phase, ConnectionPhase::Connected);
        assert_eq!(state.room_id.as_deref(), Some("general"));
        assert_eq!(alice.backend.acquire_count(), 1);
        assert!(alice.coordinator.media.has_microphone());

        alice.coordinator.disconnect().await;
        let state = alice.coordinator.snapshot();
        assert_eq!(state.phase, ConnectionPhase::Disconnected);
        assert!(state.roster.is_empty());
        // Kein aktiver Stream nach dem letzten Disconnect
        assert!(!alice.coordinator.media.has_microphone());

        // Idempotent aus jedem Zustand
        alice.coordinator.disconnect().await;
        assert_eq!(
            alice.coordinator.snapshot().phase,
            ConnectionPhase::Disconnected
        );
    }

    #[tokio::test]
    async fn test_connect_while_connecting_is_noop() {
        let router = LocalRouter::new();
        let alice = peer(&router, "a");

        alice.coordinator.state.lock().phase = ConnectionPhase::Connecting;

        let state = alice.coordinator.connect("general").await.unwrap();
        assert_eq!(state.phase, ConnectionPhase::Connecting);
        // Kein Mikrofon-Prompt für den No-Op
        assert_eq!(alice.backend.acquire_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_to_same_room_is_noop() {
        let router = LocalRouter::new();
        let alice = peer(&router, "a");

        alice.coordinator.connect("general").await.unwrap();
        alice.coordinator.connect("general").await.unwrap();

        assert_eq!(alice.backend.acquire_count(), 1);
    }

    #[tokio::test]
    async fn test_switching_rooms_disconnects_first() {
        let router = LocalRouter::new();
        let alice = peer(&router, "a");

        alice.coordinator.connect("general").await.unwrap();
        let state = alice.coordinator.connect("gaming").await.unwrap();

        assert_eq!(state.phase, ConnectionPhase::Connected);
        assert_eq!(state.room_id.as_deref(), Some("gaming"));
        // Roster wurde beim Wechsel geleert und neu aufgebaut
        assert_eq!(state.participant_count(), 1);
    }

    #[tokio::test]
    async fn test_double_toggle_mute_restores_state() {
        let router = LocalRouter::new();
        let alice = peer(&router, "a");

        alice.coordinator.connect("general").await.unwrap();
        assert!(!alice.coordinator.snapshot().local_muted);

        let muted = alice.coordinator.toggle_mute();
        assert!(muted);
        let state = alice.coordinator.snapshot();
        assert!(state.local_muted);
        // Roster spiegelt den Mute-Status in jedem Schritt
        assert!(state.participant("a").unwrap().is_muted);

        let muted = alice.coordinator.toggle_mute();
        assert!(!muted);
        let state = alice.coordinator.snapshot();
        assert!(!state.local_muted);
        assert!(!state.participant("a").unwrap().is_muted);
    }

    #[tokio::test]
    async fn test_toggle_mute_broadcasts_exactly_once() {
        let router = LocalRouter::new();
        let alice = peer(&router, "a");

        alice.coordinator.connect("general").await.unwrap();
        alice.coordinator.toggle_mute();

        let updates: Vec<_> = router
            .meta_updates()
            .into_iter()
            .filter(|(id, _)| id == "a")
            .collect();
        assert_eq!(updates.len(), 1);
        assert!(updates[0].1.is_muted);
    }

    #[tokio::test]
    async fn test_denied_microphone_joins_muted() {
        let router = LocalRouter::new();
        let alice = peer_with_backend(&router, "a", MockBackend::denying_microphone());

        let state = alice.coordinator.connect("general").await.unwrap();

        assert_eq!(state.phase, ConnectionPhase::Connected);
        assert_eq!(state.microphone_granted, Some(false));
        assert!(state.local_muted);
        assert!(state.participant("a").unwrap().is_muted);
    }

    #[tokio::test]
    async fn test_glare_exactly_one_offer() {
        let router = LocalRouter::new();
        let alice = peer(&router, "a");
        let bob = peer(&router, "b");

        alice.coordinator.connect("general").await.unwrap();
        bob.coordinator.connect("general").await.unwrap();

        // Beide sehen sich gegenseitig im Roster
        wait_until(|| alice.coordinator.snapshot().participant_count() == 2).await;
        wait_until(|| bob.coordinator.snapshot().participant_count() == 2).await;
        wait_until(|| alice.coordinator.peers.has_link("b")).await;
        wait_until(|| bob.coordinator.peers.has_link("a")).await;

        // Aushandlung abwarten: genau ein Offer, von der kleineren ID
        wait_until(|| {
            router
                .sent_signals()
                .iter()
                .any(|s| s.kind == SignalKind::Answer)
        })
        .await;

        let offers: Vec<_> = router
            .sent_signals()
            .into_iter()
            .filter(|s| s.kind == SignalKind::Offer)
            .collect();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].from, "a");
        assert_eq!(offers[0].to, "b");

        alice.coordinator.disconnect().await;
        bob.coordinator.disconnect().await;
    }

    #[tokio::test]
    async fn test_remote_leave_removes_roster_and_link() {
        let router = LocalRouter::new();
        let alice = peer(&router, "a");
        let bob = peer(&router, "b");

        alice.coordinator.connect("general").await.unwrap();
        bob.coordinator.connect("general").await.unwrap();
        wait_until(|| alice.coordinator.peers.has_link("b")).await;

        bob.coordinator.disconnect().await;

        wait_until(|| alice.coordinator.snapshot().participant_count() == 1).await;
        wait_until(|| !alice.coordinator.peers.has_link("b")).await;
    }

    #[tokio::test]
    async fn test_leave_event_for_unknown_peer_is_noop() {
        let router = LocalRouter::new();
        let alice = peer(&router, "a");

        alice.coordinator.connect("general").await.unwrap();

        alice
            .coordinator
            .handle_signaling_event(SignalingEvent::PresenceLeft {
                peer_id: "ghost".to_string(),
            })
            .await;

        assert_eq!(alice.coordinator.snapshot().participant_count(), 1);
    }

    #[tokio::test]
    async fn test_candidate_for_unknown_peer_is_dropped() {
        let router = LocalRouter::new();
        let alice = peer(&router, "a");

        alice.coordinator.connect("general").await.unwrap();

        alice
            .coordinator
            .handle_signaling_event(SignalingEvent::Signal(SignalEnvelope::new(
                SignalKind::IceCandidate,
                "ghost".to_string(),
                "a".to_string(),
                "{\"candidate\":\"candidate:0\"}".to_string(),
            )))
            .await;

        // Kein Link, kein Panic, Session läuft weiter
        assert_eq!(
            alice.coordinator.snapshot().phase,
            ConnectionPhase::Connected
        );
    }

    #[tokio::test]
    async fn test_visibility_pauses_analysis_keeps_links() {
        let router = LocalRouter::new();
        let alice = peer(&router, "a");
        let bob = peer(&router, "b");

        alice.coordinator.connect("general").await.unwrap();
        bob.coordinator.connect("general").await.unwrap();
        wait_until(|| alice.coordinator.peers.has_link("b")).await;

        assert!(alice.coordinator.speaking.lock().is_some());
        let links_before = alice.coordinator.peers.link_count();

        alice.coordinator.set_visibility(Visibility::Hidden);
        assert!(alice.coordinator.speaking.lock().is_none());
        // Der Call bleibt im Hintergrund bestehen
        assert_eq!(alice.coordinator.peers.link_count(), links_before);
        assert!(alice.coordinator.media.has_microphone());

        alice.coordinator.set_visibility(Visibility::Visible);
        assert!(alice.coordinator.speaking.lock().is_some());
        assert_eq!(alice.coordinator.peers.link_count(), links_before);
    }

    #[tokio::test]
    async fn test_speaking_updates_roster() {
        let router = LocalRouter::new();
        let alice = peer(&router, "a");

        alice.coordinator.connect("general").await.unwrap();

        alice.backend.drive_level(0.8);
        wait_until(|| {
            alice
                .coordinator
                .snapshot()
                .participant("a")
                .map(|p| p.is_speaking)
                .unwrap_or(false)
        })
        .await;

        alice.backend.drive_level(0.0);
        wait_until(|| {
            !alice
                .coordinator
                .snapshot()
                .participant("a")
                .map(|p| p.is_speaking)
                .unwrap_or(true)
        })
        .await;
    }

    #[tokio::test]
    async fn test_screen_share_lifecycle() {
        let router = LocalRouter::new();
        let alice = peer(&router, "a");

        // Ohne Session kein Screen Share
        assert!(matches!(
            alice.coordinator.start_screen_share(),
            Err(SessionError::NotInSession)
        ));

        alice.coordinator.connect("general").await.unwrap();
        let mut events = alice.coordinator.subscribe();

        alice.coordinator.start_screen_share().unwrap();
        assert!(alice.coordinator.snapshot().screen_sharing);

        alice.coordinator.stop_screen_share();
        wait_until(|| !alice.coordinator.snapshot().screen_sharing).await;

        // ScreenShareEnded wurde gemeldet
        let mut seen_ended = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SessionEvent::ScreenShareEnded) {
                seen_ended = true;
            }
        }
        assert!(seen_ended);
    }

    #[tokio::test]
    async fn test_playback_controls_are_local_only() {
        let router = LocalRouter::new();
        let alice = peer(&router, "a");
        let bob = peer(&router, "b");

        alice.coordinator.connect("general").await.unwrap();
        bob.coordinator.connect("general").await.unwrap();
        wait_until(|| alice.coordinator.snapshot().participant_count() == 2).await;

        let meta_updates_before = router.meta_updates().len();

        alice.coordinator.set_participant_volume("b", 50);
        let locally_muted = alice.coordinator.toggle_local_mute("b");
        assert!(locally_muted);

        let state = alice.coordinator.snapshot();
        let b = state.participant("b").unwrap();
        assert_eq!(b.volume, 50);
        assert!(b.locally_muted);

        // Nichts davon wurde übertragen
        assert_eq!(router.meta_updates().len(), meta_updates_before);

        alice.coordinator.disconnect().await;
        bob.coordinator.disconnect().await;
    }

    #[tokio::test]
    async fn test_remote_mute_flag_follows_metadata() {
        let router = LocalRouter::new();
        let alice = peer(&router, "a");
        let bob = peer(&router, "b");

        alice.coordinator.connect("general").await.unwrap();
        bob.coordinator.connect("general").await.unwrap();
        wait_until(|| alice.coordinator.snapshot().participant_count() == 2).await;

        bob.coordinator.toggle_mute();

        wait_until(|| {
            alice
                .coordinator
                .snapshot()
                .participant("b")
                .map(|p| p.is_muted)
                .unwrap_or(false)
        })
        .await;

        alice.coordinator.disconnect().await;
        bob.coordinator.disconnect().await;
    }

    #[tokio::test]
    async fn test_join_failure_rolls_back_to_disconnected() {
        use futures::future::BoxFuture;

        /// Transport, dessen Join immer scheitert
        struct FailingTransport {
            events: broadcast::Sender<SignalingEvent>,
        }

        impl SignalingTransport for FailingTransport {
            fn local_id(&self) -> String {
                "a".to_string()
            }

            fn join(
                &self,
                _room_id: String,
                _meta: PresenceMeta,
            ) -> BoxFuture<'_, Result<(), SignalingError>> {
                Box::pin(async {
                    Err(SignalingError::JoinFailed("unreachable".to_string()))
                })
            }

            fn leave(&self) -> BoxFuture<'_, Result<(), SignalingError>> {
                Box::pin(async { Ok(()) })
            }

            fn send_signal(&self, _envelope: SignalEnvelope) -> Result<(), SignalingError> {
                Err(SignalingError::NotConnected)
            }

            fn update_metadata(&self, _meta: PresenceMeta) -> Result<(), SignalingError> {
                Err(SignalingError::NotConnected)
            }

            fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
                self.events.subscribe()
            }
        }

        let (events, _) = broadcast::channel(16);
        let backend = Arc::new(MockBackend::new());
        let coordinator = VoiceCoordinator::new(
            Arc::new(FailingTransport { events }),
            Arc::clone(&backend) as Arc<dyn MediaBackend>,
            Arc::new(SettingsStore::open_in_memory().unwrap()),
            Vec::new(),
        );

        let result = coordinator.connect("general").await;
        assert!(matches!(result, Err(SessionError::Signaling(_))));

        // Nie in Connecting hängen geblieben, keine Ressourcen offen
        let state = coordinator.snapshot();
        assert_eq!(state.phase, ConnectionPhase::Disconnected);
        assert!(!coordinator.media.has_microphone());
    }
}
