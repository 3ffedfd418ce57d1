//! WebSocket Transport für einen gehosteten Room-Channel
//!
//! Verwaltet die WebSocket-Verbindung zum Channel-Server:
//! - Automatische Reconnection mit Backoff und Jitter
//! - Heartbeat-Keeping gegen Idle-Timeouts
//! - Event-basierte Zustellung der Server-Nachrichten

use super::messages::*;
use super::{SignalingError, SignalingEvent, SignalingTransport};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Heartbeat-Intervall; gehostete Channel-Server haben Idle-Timeouts
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// Timeout des Transports für den Join-Handshake
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
const RECONNECT_MAX_ATTEMPTS: u32 = 10;

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    /// Zuletzt beigetretener Raum samt Metadaten, für den Rejoin nach
    /// einer Reconnection
    joined_room: Option<(String, PresenceMeta)>,
}

// ============================================================================
// WEBSOCKET SIGNALING
// ============================================================================

/// WebSocket Client für die Kommunikation mit dem Channel-Server
pub struct WebSocketSignaling {
    server_url: String,
    peer_id: String,
    state: Arc<RwLock<ClientState>>,
    tx: Arc<RwLock<Option<mpsc::Sender<String>>>>,
    event_tx: broadcast::Sender<SignalingEvent>,
    join_ack: Arc<Mutex<Option<mpsc::Sender<Result<(), SignalingError>>>>>,
    closed: Arc<AtomicBool>,
}

impl WebSocketSignaling {
    /// Verbindet mit dem Channel-Server
    pub async fn connect(
        server_url: String,
        peer_id: String,
    ) -> Result<Arc<Self>, SignalingError> {
        // URL früh validieren statt beim ersten Send
        url::Url::parse(&server_url)
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (event_tx, _) = broadcast::channel(100);

        let client = Arc::new(Self {
            server_url,
            peer_id,
            state: Arc::new(RwLock::new(ClientState::default())),
            tx: Arc::new(RwLock::new(None)),
            event_tx,
            join_ack: Arc::new(Mutex::new(None)),
            closed: Arc::new(AtomicBool::new(false)),
        });

        Arc::clone(&client).open_socket().await?;
        Arc::clone(&client).start_heartbeat();

        Ok(client)
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Beendet den Transport endgültig; keine Reconnects mehr
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        *self.tx.write() = None;
        let mut state = self.state.write();
        state.is_connected = false;
        state.joined_room = None;
    }

    /// Baut die Socket-Verbindung auf und startet Read/Write-Tasks
    //
    // Explicit `BoxFuture` rather than `async fn` to erase the opaque return
    // type: open_socket and reconnect_loop form a recursive-async cycle
    // (open_socket spawns a read task -> reconnect_loop -> open_socket) which
    // otherwise defeats `Send` auto-trait inference for `tokio::spawn`.
    fn open_socket(self: Arc<Self>) -> BoxFuture<'static, Result<(), SignalingError>> {
        Box::pin(async move {
        let ws_url = format!("{}/ws", self.server_url.replace("http", "ws"));

        tracing::info!("Connecting to channel server: {}", ws_url);

        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<String>(100);
        *self.tx.write() = Some(tx);
        self.state.write().is_connected = true;

        // Write-Task
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        // Read-Task
        let client = Arc::clone(&self);
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        if let Ok(server_msg) = serde_json::from_str::<ServerMessage>(&text) {
                            client.handle_server_message(server_msg);
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            // Disconnect-Status setzen
            client.state.write().is_connected = false;
            *client.tx.write() = None;
            let _ = client.event_tx.send(SignalingEvent::Disconnected);

            if !client.closed.load(Ordering::SeqCst) {
                Arc::clone(&client).reconnect_loop().await;
            }
        });

        Ok(())
        })
    }

    /// Reconnection mit exponentiellem Backoff plus Jitter
    //
    // Explicit `BoxFuture` to break the recursive-async cycle with
    // `open_socket` (see the note on that method).
    fn reconnect_loop(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            if attempt > RECONNECT_MAX_ATTEMPTS {
                tracing::error!("Giving up on channel server after {} attempts", attempt - 1);
                return;
            }

            let backoff = RECONNECT_BASE_DELAY
                .saturating_mul(2u32.saturating_pow(attempt - 1))
                .min(RECONNECT_MAX_DELAY);
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
            tokio::time::sleep(backoff + jitter).await;

            if self.closed.load(Ordering::SeqCst) {
                return;
            }

            tracing::info!("Reconnecting to channel server (attempt {})", attempt);

            match Arc::clone(&self).open_socket().await {
                Ok(()) => {
                    // Letzten Raum erneut beitreten; die aktuellen
                    // Metadaten wandern gleich mit
                    let rejoin = self.state.read().joined_room.clone();
                    if let Some((room_id, meta)) = rejoin {
                        let _ = self.send_message(JoinPayload::new(
                            room_id,
                            self.peer_id.clone(),
                            meta,
                        ));
                    }
                    let _ = self.event_tx.send(SignalingEvent::Reconnected);
                    return;
                }
                Err(e) => {
                    tracing::warn!("Reconnect failed: {}", e);
                }
            }
        }
        })
    }

    /// Startet den Heartbeat-Task
    fn start_heartbeat(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                interval.tick().await;
                if self.closed.load(Ordering::SeqCst) {
                    break;
                }
                if self.is_connected() {
                    if let Err(e) = self.send_message(HeartbeatPayload::new(self.peer_id.clone()))
                    {
                        tracing::warn!("Failed to send heartbeat: {}", e);
                    }
                }
            }
        });
    }

    /// Serialisiert eine Nachricht, ergänzt den Timestamp und schiebt
    /// sie non-blocking in den Write-Task
    fn send_message<T: serde::Serialize>(&self, payload: T) -> Result<(), SignalingError> {
        let tx = self
            .tx
            .read()
            .clone()
            .ok_or(SignalingError::NotConnected)?;

        let timestamp = Utc::now().timestamp_millis();

        let mut value = serde_json::to_value(&payload)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert(
                "timestamp".to_string(),
                serde_json::Value::Number(timestamp.into()),
            );
        }

        let msg = serde_json::to_string(&value)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        // try_send ist non-blocking
        tx.try_send(msg)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    /// Verarbeitet eingehende Server-Nachrichten
    fn handle_server_message(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::Joined {
                room_id,
                participants,
                ..
            } => {
                tracing::info!(
                    "Joined room {} with {} existing participants",
                    room_id,
                    participants.len()
                );
                if let Some(ack) = self.join_ack.lock().take() {
                    let _ = ack.try_send(Ok(()));
                }
                // Bereits Anwesende als einzelne Presence-Joins melden
                for member in participants {
                    if member.peer_id != self.peer_id {
                        let _ = self.event_tx.send(SignalingEvent::PresenceJoined {
                            peer_id: member.peer_id,
                            meta: member.meta,
                        });
                    }
                }
            }

            ServerMessage::PeerJoined { peer_id, meta, .. } => {
                if peer_id != self.peer_id {
                    let _ = self
                        .event_tx
                        .send(SignalingEvent::PresenceJoined { peer_id, meta });
                }
            }

            ServerMessage::PeerLeft { peer_id, .. } => {
                let _ = self.event_tx.send(SignalingEvent::PresenceLeft { peer_id });
            }

            ServerMessage::MetaUpdated { peer_id, meta, .. } => {
                if peer_id != self.peer_id {
                    let _ = self
                        .event_tx
                        .send(SignalingEvent::MetadataUpdated { peer_id, meta });
                }
            }

            ServerMessage::Signal { envelope, .. } => {
                if envelope.to == self.peer_id {
                    let _ = self.event_tx.send(SignalingEvent::Signal(envelope));
                } else {
                    tracing::debug!("Ignoring signal addressed to {}", envelope.to);
                }
            }

            ServerMessage::Error { code, message, .. } => {
                tracing::error!("Channel server error {}: {}", code, message);
                if let Some(ack) = self.join_ack.lock().take() {
                    let _ = ack.try_send(Err(SignalingError::ServerError { code, message }));
                }
            }

            ServerMessage::Pong { .. } => {
                // Heartbeat-Response - nichts zu tun
            }
        }
    }
}

impl SignalingTransport for WebSocketSignaling {
    fn local_id(&self) -> String {
        self.peer_id.clone()
    }

    fn join(
        &self,
        room_id: String,
        meta: PresenceMeta,
    ) -> BoxFuture<'_, Result<(), SignalingError>> {
        Box::pin(async move {
            let (ack_tx, mut ack_rx) = mpsc::channel::<Result<(), SignalingError>>(1);
            *self.join_ack.lock() = Some(ack_tx);
            self.state.write().joined_room = Some((room_id.clone(), meta.clone()));

            if let Err(e) = self.send_message(JoinPayload::new(room_id, self.peer_id.clone(), meta))
            {
                self.state.write().joined_room = None;
                *self.join_ack.lock() = None;
                return Err(e);
            }

            // Auf das Join-Ack warten; das Timeout gehört dem Transport
            let result = tokio::select! {
                result = ack_rx.recv() => match result {
                    Some(Ok(())) => Ok(()),
                    Some(Err(e)) => Err(e),
                    None => Err(SignalingError::JoinFailed("no response".to_string())),
                },
                _ = tokio::time::sleep(JOIN_TIMEOUT) => {
                    Err(SignalingError::JoinFailed("timeout".to_string()))
                }
            };

            if result.is_err() {
                self.state.write().joined_room = None;
                *self.join_ack.lock() = None;
            }
            result
        })
    }

    fn leave(&self) -> BoxFuture<'_, Result<(), SignalingError>> {
        Box::pin(async move {
            if self.state.write().joined_room.take().is_some() {
                self.send_message(LeavePayload::new(self.peer_id.clone()))?;
            }
            Ok(())
        })
    }

    fn send_signal(&self, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        if self.state.read().joined_room.is_none() {
            return Err(SignalingError::NotConnected);
        }
        self.send_message(SignalPayload::new(envelope))
    }

    fn update_metadata(&self, meta: PresenceMeta) -> Result<(), SignalingError> {
        {
            let mut state = self.state.write();
            match state.joined_room.as_mut() {
                Some((_, stored)) => *stored = meta.clone(),
                None => return Err(SignalingError::NotConnected),
            }
        }
        self.send_message(UpdateMetaPayload::new(self.peer_id.clone(), meta))
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }
}

impl std::fmt::Debug for WebSocketSignaling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketSignaling")
            .field("server_url", &self.server_url)
            .field("peer_id", &self.peer_id)
            .field("state", &*self.state.read())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// Minimaler Channel-Server: beantwortet Join mit Joined und spielt
    /// danach ein Presence-Event ein
    async fn spawn_stub_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();

            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                    if value["type"] == "join" {
                        let joined = serde_json::json!({
                            "type": "joined",
                            "roomId": value["roomId"],
                            "participants": [],
                            "timestamp": 1
                        });
                        ws.send(Message::Text(joined.to_string())).await.unwrap();

                        let peer = serde_json::json!({
                            "type": "peer_joined",
                            "peerId": "remote",
                            "meta": {"displayName": "Remote", "tag": "#0002", "isMuted": false},
                            "timestamp": 2
                        });
                        ws.send(Message::Text(peer.to_string())).await.unwrap();
                    }
                }
            }
        });

        format!("http://{}", addr)
    }

    fn meta() -> PresenceMeta {
        PresenceMeta {
            display_name: "Local".to_string(),
            tag: "#0001".to_string(),
            is_muted: false,
        }
    }

    #[tokio::test]
    async fn test_join_handshake_and_presence() {
        let url = spawn_stub_server().await;

        let client = WebSocketSignaling::connect(url, "local".to_string())
            .await
            .unwrap();
        let mut events = client.subscribe();

        client
            .join("general".to_string(), meta())
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            SignalingEvent::PresenceJoined { peer_id, meta } => {
                assert_eq!(peer_id, "remote");
                assert_eq!(meta.display_name, "Remote");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        client.shutdown();
    }

    #[tokio::test]
    async fn test_send_without_join_fails() {
        let url = spawn_stub_server().await;

        let client = WebSocketSignaling::connect(url, "local".to_string())
            .await
            .unwrap();

        let result = client.send_signal(SignalEnvelope::new(
            SignalKind::Offer,
            "local".to_string(),
            "remote".to_string(),
            String::new(),
        ));
        assert!(matches!(result, Err(SignalingError::NotConnected)));

        client.shutdown();
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let result = WebSocketSignaling::connect(
            "not a url".to_string(),
            crate::signaling::generate_peer_id(),
        )
        .await;
        assert!(matches!(result, Err(SignalingError::ConnectionFailed(_))));
    }
}
