//! Peer Manager - ein Link pro Remote-Teilnehmer
//!
//! Verwaltet die Peer-Links einer Session und wickelt den
//! Offer/Answer/Candidate-Austausch ab. Fehler eines einzelnen Links
//! bleiben auf diesen Link beschränkt.

use super::link::PeerLink;
use super::{PeerError, PeerEvent};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use webrtc::ice_transport::ice_server::RTCIceServer;

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Konfiguration eines STUN/TURN-Servers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl From<IceServerConfig> for RTCIceServer {
    fn from(config: IceServerConfig) -> Self {
        RTCIceServer {
            urls: vec![config.url],
            username: config.username.unwrap_or_default(),
            credential: config.credential.unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        // Google STUN Server (kostenlos, für ~90% der Verbindungen)
        IceServerConfig {
            url: "stun:stun.l.google.com:19302".to_string(),
            username: None,
            credential: None,
        },
        IceServerConfig {
            url: "stun:stun1.l.google.com:19302".to_string(),
            username: None,
            credential: None,
        },
    ]
}

// ============================================================================
// PEER MANAGER
// ============================================================================

pub struct PeerManager {
    ice_servers: Vec<RTCIceServer>,
    links: Mutex<HashMap<String, Arc<PeerLink>>>,
    event_tx: broadcast::Sender<PeerEvent>,
}

impl PeerManager {
    pub fn new(ice_servers: Vec<IceServerConfig>) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            ice_servers: ice_servers.into_iter().map(Into::into).collect(),
            links: Mutex::new(HashMap::new()),
            event_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.event_tx.subscribe()
    }

    /// Glare-Regel: bei einem neu entdeckten Peer bietet immer die
    /// lexikographisch kleinere ID an, die andere Seite wartet auf das
    /// Offer. Vermeidet symmetrische Doppel-Offers ohne zentralen
    /// Schiedsrichter.
    pub fn should_offer(local_id: &str, remote_id: &str) -> bool {
        local_id < remote_id
    }

    pub fn has_link(&self, remote_id: &str) -> bool {
        self.links.lock().contains_key(remote_id)
    }

    pub fn link_count(&self) -> usize {
        self.links.lock().len()
    }

    /// Liefert den Link zu einer Remote-ID, falls vorhanden
    fn link(&self, remote_id: &str) -> Option<Arc<PeerLink>> {
        self.links.lock().get(remote_id).cloned()
    }

    /// Legt einen Link an, falls noch keiner existiert; ein bereits
    /// existierender Link wird wiederverwendet
    pub async fn ensure_link(&self, remote_id: &str) -> Result<Arc<PeerLink>, PeerError> {
        if let Some(existing) = self.link(remote_id) {
            return Ok(existing);
        }

        let link = PeerLink::connect(
            remote_id.to_string(),
            self.ice_servers.clone(),
            self.event_tx.clone(),
        )
        .await?;

        // Ein zweiter Link pro ID ersetzt den ersten statt ihn zu
        // duplizieren
        let replaced = self
            .links
            .lock()
            .insert(remote_id.to_string(), Arc::clone(&link));
        if let Some(old) = replaced {
            tracing::warn!("Replacing existing link to {}", remote_id);
            old.close().await;
        }

        Ok(link)
    }

    /// Erstellt ein Offer für einen Peer; legt den Link bei Bedarf an
    pub async fn offer_to(&self, remote_id: &str) -> Result<String, PeerError> {
        let link = self.ensure_link(remote_id).await?;
        link.create_offer_sdp().await
    }

    /// Verarbeitet ein eingehendes Offer und liefert das Answer-SDP
    pub async fn handle_offer(&self, from_id: &str, sdp: String) -> Result<String, PeerError> {
        let link = self.ensure_link(from_id).await?;
        link.apply_remote_offer(sdp).await?;
        link.create_answer_sdp().await
    }

    /// Verarbeitet ein Answer; ohne Link kein Fehler - der Link kann in
    /// einem Race bereits abgebaut worden sein
    pub async fn handle_answer(&self, from_id: &str, sdp: String) -> Result<(), PeerError> {
        match self.link(from_id) {
            Some(link) => link.apply_remote_answer(sdp).await,
            None => {
                tracing::warn!("Dropping answer from {}: no link", from_id);
                Ok(())
            }
        }
    }

    /// Verarbeitet einen Remote-Candidate; ohne Link wird er verworfen
    /// (Trickle-ICE darf nach dem Teardown noch eintreffen)
    pub async fn handle_candidate(
        &self,
        from_id: &str,
        candidate_json: String,
    ) -> Result<(), PeerError> {
        match self.link(from_id) {
            Some(link) => link.add_remote_candidate(candidate_json).await,
            None => {
                tracing::debug!("Dropping candidate from {}: no link", from_id);
                Ok(())
            }
        }
    }

    /// Schließt den Link zu einem Peer; idempotent
    pub async fn close_link(&self, remote_id: &str) {
        let removed = self.links.lock().remove(remote_id);
        if let Some(link) = removed {
            link.close().await;
            tracing::info!("Closed link to {}", remote_id);
        }
    }

    /// Schließt alle Links - beim Disconnect
    pub async fn close_all(&self) {
        let links: Vec<Arc<PeerLink>> = self.links.lock().drain().map(|(_, l)| l).collect();
        for link in links {
            link.close().await;
        }
    }

    /// Setzt die lokale Wiedergabelautstärke eines Peers
    pub fn set_volume(&self, remote_id: &str, volume: u8) {
        if let Some(link) = self.link(remote_id) {
            link.sink().set_volume(volume);
        }
    }

    /// Schaltet die Wiedergabe eines Peers nur lokal stumm
    pub fn set_local_mute(&self, remote_id: &str, muted: bool) {
        if let Some(link) = self.link(remote_id) {
            link.sink().set_muted(muted);
        }
    }
}

impl std::fmt::Debug for PeerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerManager")
            .field("link_count", &self.link_count())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> PeerManager {
        PeerManager::new(Vec::new())
    }

    #[test]
    fn test_should_offer_is_asymmetric() {
        assert!(PeerManager::should_offer("a", "b"));
        assert!(!PeerManager::should_offer("b", "a"));
        assert!(!PeerManager::should_offer("a", "a"));
    }

    #[tokio::test]
    async fn test_answer_without_link_is_silent() {
        let manager = manager();
        let result = manager
            .handle_answer("ghost", "v=0".to_string())
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_candidate_without_link_is_dropped() {
        let manager = manager();
        let result = manager
            .handle_candidate("ghost", "{\"candidate\":\"x\"}".to_string())
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_close_link_is_idempotent() {
        let manager = manager();
        manager.close_link("nobody").await;
        manager.close_link("nobody").await;
        assert_eq!(manager.link_count(), 0);
    }

    #[tokio::test]
    async fn test_ensure_link_reuses_existing() {
        let manager = manager();

        let first = manager.ensure_link("b").await.unwrap();
        let second = manager.ensure_link("b").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.link_count(), 1);

        manager.close_all().await;
        assert_eq!(manager.link_count(), 0);
    }

    #[tokio::test]
    async fn test_offer_answer_handshake() {
        let alice = manager();
        let bob = manager();

        // Alice bietet an, Bob antwortet
        let offer = alice.offer_to("b").await.unwrap();
        assert!(offer.contains("v=0"));

        let answer = bob.handle_offer("a", offer).await.unwrap();
        assert!(answer.contains("v=0"));

        alice.handle_answer("b", answer).await.unwrap();

        alice.close_all().await;
        bob.close_all().await;
    }

    #[tokio::test]
    async fn test_early_candidate_is_buffered() {
        let alice = manager();
        let bob = manager();

        let link = bob.ensure_link("a").await.unwrap();

        // Candidate vor der Remote-Description: wird gepuffert
        let candidate = serde_json::json!({
            "candidate": "candidate:1 1 udp 2130706431 127.0.0.1 54321 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0
        })
        .to_string();
        bob.handle_candidate("a", candidate).await.unwrap();

        // Danach regulärer Handshake
        let offer = alice.offer_to("b").await.unwrap();
        let answer = bob.handle_offer("a", offer).await.unwrap();
        assert!(answer.contains("v=0"));
        drop(link);

        alice.close_all().await;
        bob.close_all().await;
    }
}
