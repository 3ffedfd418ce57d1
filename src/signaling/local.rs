//! Local Router - In-Process-Transport ohne Server
//!
//! Ein Raum-Register im Prozess, das Presence-Events und Signale direkt
//! zwischen Transports desselben Routers zustellt. Gedacht für Tests und
//! Embedder, die mehrere Sessions im selben Prozess verdrahten.

use super::{PresenceMeta, SignalEnvelope, SignalingError, SignalingEvent, SignalingTransport};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

// ============================================================================
// ROUTER
// ============================================================================

struct Member {
    peer_id: String,
    meta: PresenceMeta,
    tx: broadcast::Sender<SignalingEvent>,
}

/// Raum-Register; alle Transports eines Routers sehen sich gegenseitig
pub struct LocalRouter {
    rooms: Mutex<HashMap<String, Vec<Member>>>,
    #[cfg(test)]
    sent_signals: Mutex<Vec<SignalEnvelope>>,
    #[cfg(test)]
    meta_updates: Mutex<Vec<(String, PresenceMeta)>>,
}

impl LocalRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rooms: Mutex::new(HashMap::new()),
            #[cfg(test)]
            sent_signals: Mutex::new(Vec::new()),
            #[cfg(test)]
            meta_updates: Mutex::new(Vec::new()),
        })
    }

    fn join(
        &self,
        room_id: &str,
        peer_id: &str,
        meta: PresenceMeta,
        tx: broadcast::Sender<SignalingEvent>,
    ) {
        let mut rooms = self.rooms.lock();
        let members = rooms.entry(room_id.to_string()).or_default();

        // Ein Rejoin derselben ID ersetzt das alte Mitglied
        members.retain(|m| m.peer_id != peer_id);

        // Bereits Anwesende als einzelne Presence-Joins an den Neuling
        for member in members.iter() {
            let _ = tx.send(SignalingEvent::PresenceJoined {
                peer_id: member.peer_id.clone(),
                meta: member.meta.clone(),
            });
        }

        // Den Neuling an alle Anwesenden
        for member in members.iter() {
            let _ = member.tx.send(SignalingEvent::PresenceJoined {
                peer_id: peer_id.to_string(),
                meta: meta.clone(),
            });
        }

        members.push(Member {
            peer_id: peer_id.to_string(),
            meta,
            tx,
        });

        tracing::debug!("Local router: {} joined {}", peer_id, room_id);
    }

    fn leave(&self, room_id: &str, peer_id: &str) {
        let mut rooms = self.rooms.lock();
        let Some(members) = rooms.get_mut(room_id) else {
            return;
        };

        members.retain(|m| m.peer_id != peer_id);
        for member in members.iter() {
            let _ = member.tx.send(SignalingEvent::PresenceLeft {
                peer_id: peer_id.to_string(),
            });
        }

        if members.is_empty() {
            rooms.remove(room_id);
        }

        tracing::debug!("Local router: {} left {}", peer_id, room_id);
    }

    fn signal(&self, room_id: &str, envelope: SignalEnvelope) {
        #[cfg(test)]
        self.sent_signals.lock().push(envelope.clone());

        let rooms = self.rooms.lock();
        let Some(members) = rooms.get(room_id) else {
            return;
        };

        // Zustellung nur an den Adressaten; ist er schon weg, verfällt
        // das Signal
        match members.iter().find(|m| m.peer_id == envelope.to) {
            Some(member) => {
                let _ = member.tx.send(SignalingEvent::Signal(envelope));
            }
            None => {
                tracing::debug!("Local router: dropping signal for absent peer {}", envelope.to);
            }
        }
    }

    fn update_meta(&self, room_id: &str, peer_id: &str, meta: PresenceMeta) {
        #[cfg(test)]
        self.meta_updates
            .lock()
            .push((peer_id.to_string(), meta.clone()));

        let mut rooms = self.rooms.lock();
        let Some(members) = rooms.get_mut(room_id) else {
            return;
        };

        for member in members.iter_mut() {
            if member.peer_id == peer_id {
                member.meta = meta.clone();
            }
        }

        for member in members.iter() {
            if member.peer_id != peer_id {
                let _ = member.tx.send(SignalingEvent::MetadataUpdated {
                    peer_id: peer_id.to_string(),
                    meta: meta.clone(),
                });
            }
        }
    }

    /// Alle über den Router gelaufenen Signale (Testauswertung)
    #[cfg(test)]
    pub fn sent_signals(&self) -> Vec<SignalEnvelope> {
        self.sent_signals.lock().clone()
    }

    /// Alle Metadaten-Updates (Testauswertung)
    #[cfg(test)]
    pub fn meta_updates(&self) -> Vec<(String, PresenceMeta)> {
        self.meta_updates.lock().clone()
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// Transport-Endpunkt eines Peers am `LocalRouter`
pub struct LocalTransport {
    router: Arc<LocalRouter>,
    peer_id: String,
    event_tx: broadcast::Sender<SignalingEvent>,
    joined_room: Mutex<Option<String>>,
}

impl LocalTransport {
    pub fn new(router: Arc<LocalRouter>, peer_id: impl Into<String>) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(100);
        Arc::new(Self {
            router,
            peer_id: peer_id.into(),
            event_tx,
            joined_room: Mutex::new(None),
        })
    }

    fn current_room(&self) -> Result<String, SignalingError> {
        self.joined_room
            .lock()
            .clone()
            .ok_or(SignalingError::NotConnected)
    }
}

impl SignalingTransport for LocalTransport {
    fn local_id(&self) -> String {
        self.peer_id.clone()
    }

    fn join(
        &self,
        room_id: String,
        meta: PresenceMeta,
    ) -> BoxFuture<'_, Result<(), SignalingError>> {
        Box::pin(async move {
            // Raumwechsel: alten Raum implizit verlassen
            if let Some(previous) = self.joined_room.lock().take() {
                self.router.leave(&previous, &self.peer_id);
            }

            self.router
                .join(&room_id, &self.peer_id, meta, self.event_tx.clone());
            *self.joined_room.lock() = Some(room_id);
            Ok(())
        })
    }

    fn leave(&self) -> BoxFuture<'_, Result<(), SignalingError>> {
        Box::pin(async move {
            if let Some(room) = self.joined_room.lock().take() {
                self.router.leave(&room, &self.peer_id);
            }
            Ok(())
        })
    }

    fn send_signal(&self, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        let room = self.current_room()?;
        self.router.signal(&room, envelope);
        Ok(())
    }

    fn update_metadata(&self, meta: PresenceMeta) -> Result<(), SignalingError> {
        let room = self.current_room()?;
        self.router.update_meta(&room, &self.peer_id, meta);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }
}

// ============================================================================
// TESTS
// ============================================================================
