//! Peer Link - eine WebRTC-Verbindung zu einem Remote-Teilnehmer
//!
//! Besitzt die RTCPeerConnection samt Playback-Sink für eingehendes
//! Audio. Pro Remote-ID existiert höchstens ein Link; das stellt der
//! `PeerManager` sicher.

use super::{PeerError, PeerEvent};
use crate::media::{CHANNELS, SAMPLE_RATE};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

// ============================================================================
// PLAYBACK SINK
// ============================================================================

/// Lokale Wiedergabe-Einstellungen für einen Remote-Teilnehmer
///
/// Nur-lokale Zustände: werden nie über den Channel übertragen.
#[derive(Debug)]
pub struct PlaybackSink {
    volume: Mutex<u8>,
    muted: Mutex<bool>,
}

impl PlaybackSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            volume: Mutex::new(100),
            muted: Mutex::new(false),
        })
    }

    pub fn set_volume(&self, volume: u8) {
        *self.volume.lock() = volume.min(100);
    }

    pub fn volume(&self) -> u8 {
        *self.volume.lock()
    }

    pub fn set_muted(&self, muted: bool) {
        *self.muted.lock() = muted;
    }

    pub fn is_muted(&self) -> bool {
        *self.muted.lock()
    }

    /// Wiedergabe-Verstärkung 0.0-1.0
    pub fn gain(&self) -> f32 {
        if self.is_muted() {
            0.0
        } else {
            self.volume() as f32 / 100.0
        }
    }
}

// ============================================================================
// PEER LINK
// ============================================================================

pub struct PeerLink {
    remote_id: String,
    pc: Arc<RTCPeerConnection>,
    sink: Arc<PlaybackSink>,
    /// ICE-Candidates, die vor der Remote-Description eintreffen, werden
    /// gepuffert und nach `set_remote_description` nachgezogen
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
}

impl PeerLink {
    /// Baut die Peer Connection auf und registriert alle Handler
    pub(crate) async fn connect(
        remote_id: String,
        ice_servers: Vec<RTCIceServer>,
        event_tx: broadcast::Sender<PeerEvent>,
    ) -> Result<Arc<Self>, PeerError> {
        // Media Engine mit Standard-Codecs konfigurieren
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PeerError::WebRTC(e.to_string()))?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| PeerError::WebRTC(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| PeerError::WebRTC(e.to_string()))?,
        );

        // Lokalen Audio-Track anhängen, damit die Gegenseite Audio
        // aushandeln kann
        let audio_track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: SAMPLE_RATE,
                channels: CHANNELS,
                ..Default::default()
            },
            "audio".to_string(),
            "chorus".to_string(),
        ));

        pc.add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| PeerError::WebRTC(e.to_string()))?;

        let link = Arc::new(Self {
            remote_id,
            pc,
            sink: PlaybackSink::new(),
            pending_candidates: Mutex::new(Vec::new()),
        });

        link.setup_handlers(event_tx);

        Ok(link)
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn sink(&self) -> Arc<PlaybackSink> {
        Arc::clone(&self.sink)
    }

    /// Registriert die Event Handler der Peer Connection
    fn setup_handlers(&self, event_tx: broadcast::Sender<PeerEvent>) {
        // ICE Candidate Handler: Kandidaten gehen als JSON über den
        // Signaling-Channel an die Gegenseite
        let remote_id = self.remote_id.clone();
        let event_tx_clone = event_tx.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                if let Ok(json) = c.to_json() {
                    if let Ok(candidate_str) = serde_json::to_string(&json) {
                        let _ = event_tx_clone.send(PeerEvent::IceCandidate {
                            remote_id: remote_id.clone(),
                            candidate: candidate_str,
                        });
                    }
                }
            }
            Box::pin(async {})
        }));

        // Connection State Handler
        let remote_id = self.remote_id.clone();
        let event_tx_clone = event_tx.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                tracing::info!("Peer {} connection state: {:?}", remote_id, state);

                match state {
                    RTCPeerConnectionState::Connected => {
                        let _ = event_tx_clone.send(PeerEvent::LinkConnected {
                            remote_id: remote_id.clone(),
                        });
                    }
                    RTCPeerConnectionState::Failed => {
                        let _ = event_tx_clone.send(PeerEvent::LinkFailed {
                            remote_id: remote_id.clone(),
                        });
                    }
                    _ => {}
                }

                Box::pin(async {})
            }));

        // Track Handler für eingehendes Audio
        let remote_id = self.remote_id.clone();
        self.pc.on_track(Box::new(move |track, _, _| {
            let remote_id = remote_id.clone();
            Box::pin(async move {
                tracing::info!("Received track from {}: {:?}", remote_id, track.codec());

                // Pakete abziehen, damit der Jitter-Buffer nicht wächst;
                // Opus-Decode in die Ausgabe über den Sink fehlt noch
                tokio::spawn(async move {
                    while let Ok((_packet, _)) = track.read_rtp().await {}
                    tracing::debug!("Track from {} ended", remote_id);
                });
            })
        }));
    }

    /// Erstellt ein Offer und setzt es als Local Description
    pub async fn create_offer_sdp(&self) -> Result<String, PeerError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| PeerError::WebRTC(e.to_string()))?;

        // Local Description immer vor dem Versand setzen
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| PeerError::WebRTC(e.to_string()))?;

        Ok(offer.sdp)
    }

    /// Übernimmt ein Remote-Offer
    pub async fn apply_remote_offer(&self, sdp: String) -> Result<(), PeerError> {
        let offer =
            RTCSessionDescription::offer(sdp).map_err(|e| PeerError::InvalidSdp(e.to_string()))?;

        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| PeerError::WebRTC(e.to_string()))?;

        self.flush_pending_candidates().await;
        Ok(())
    }

    /// Erstellt ein Answer und setzt es als Local Description
    pub async fn create_answer_sdp(&self) -> Result<String, PeerError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| PeerError::WebRTC(e.to_string()))?;

        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| PeerError::WebRTC(e.to_string()))?;

        Ok(answer.sdp)
    }

    /// Übernimmt das Remote-Answer auf unser Offer
    pub async fn apply_remote_answer(&self, sdp: String) -> Result<(), PeerError> {
        let answer =
            RTCSessionDescription::answer(sdp).map_err(|e| PeerError::InvalidSdp(e.to_string()))?;

        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| PeerError::WebRTC(e.to_string()))?;

        self.flush_pending_candidates().await;
        Ok(())
    }

    /// Fügt einen Remote-Candidate hinzu; vor der Remote-Description
    /// wird er gepuffert
    pub async fn add_remote_candidate(&self, candidate_json: String) -> Result<(), PeerError> {
        let candidate: RTCIceCandidateInit = serde_json::from_str(&candidate_json)
            .map_err(|e| PeerError::InvalidCandidate(e.to_string()))?;

        if self.pc.remote_description().await.is_none() {
            self.pending_candidates.lock().push(candidate);
            return Ok(());
        }

        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| PeerError::WebRTC(e.to_string()))
    }

    async fn flush_pending_candidates(&self) {
        let pending: Vec<RTCIceCandidateInit> =
            std::mem::take(&mut *self.pending_candidates.lock());

        for candidate in pending {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                tracing::warn!(
                    "Failed to apply buffered candidate for {}: {}",
                    self.remote_id,
                    e
                );
            }
        }
    }

    /// Schließt die Verbindung; mehrfaches Schließen ist unkritisch
    pub async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::debug!("Closing link to {}: {}", self.remote_id, e);
        }
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("remote_id", &self.remote_id)
            .finish()
    }
}
