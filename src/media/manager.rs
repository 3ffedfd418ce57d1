//! Media Manager - Besitz der lokalen Capture-Streams
//!
//! Exklusiver Eigentümer von Mikrofon- und Screen-Stream. Andere
//! Komponenten erhalten Pegel und Frames nur über diese Fassade und
//! stoppen oder rekonfigurieren die Streams nie direkt.

use super::backend::{MediaBackend, MediaError, MicrophoneConstraints, MicrophoneStream, ScreenStream};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;

// ============================================================================
// MEDIA MANAGER
// ============================================================================

pub struct MediaManager {
    backend: Arc<dyn MediaBackend>,
    microphone: Mutex<Option<MicrophoneStream>>,
    screen: Mutex<Option<ScreenStream>>,
}

impl MediaManager {
    pub fn new(backend: Arc<dyn MediaBackend>) -> Self {
        Self {
            backend,
            microphone: Mutex::new(None),
            screen: Mutex::new(None),
        }
    }

    // ========================================================================
    // MIKROFON
    // ========================================================================

    /// Öffnet das Mikrofon; idempotent - ein bereits gehaltener Stream
    /// wird behalten, ohne erneut einen Berechtigungs-Prompt auszulösen
    pub fn acquire_microphone(
        &self,
        constraints: &MicrophoneConstraints,
    ) -> Result<(), MediaError> {
        let mut mic = self.microphone.lock();
        if mic.is_some() {
            tracing::debug!("Microphone already acquired, reusing stream");
            return Ok(());
        }

        let stream = self.backend.acquire_microphone(constraints)?;
        tracing::info!("Microphone acquired");
        *mic = Some(stream);
        Ok(())
    }

    pub fn has_microphone(&self) -> bool {
        self.microphone.lock().is_some()
    }

    /// Setzt Mute über das Enabled-Flag des Streams; der Stream selbst
    /// läuft weiter und das Gerät bleibt belegt
    pub fn set_muted(&self, muted: bool) {
        if let Some(mic) = self.microphone.lock().as_ref() {
            mic.set_enabled(!muted);
        }
        tracing::debug!("Capture muted: {}", muted);
    }

    /// Ohne Mikrofon gilt die Aufnahme als stumm
    pub fn is_muted(&self) -> bool {
        self.microphone
            .lock()
            .as_ref()
            .map(|mic| !mic.is_enabled())
            .unwrap_or(true)
    }

    /// Stoppt die Aufnahme und gibt die Hardware frei
    pub fn release_microphone(&self) {
        if self.microphone.lock().take().is_some() {
            tracing::info!("Microphone released");
        }
    }

    /// Aktueller Eingangspegel (roher RMS, 0.0-1.0); 0.0 ohne Mikrofon
    pub fn input_level(&self) -> f32 {
        self.microphone
            .lock()
            .as_ref()
            .map(|mic| mic.level())
            .unwrap_or(0.0)
    }

    /// Liest einen PCM-Frame vom Capture-Buffer
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        self.microphone.lock().as_ref().and_then(|mic| mic.read_frame())
    }

    // ========================================================================
    // SCREEN SHARE
    // ========================================================================

    /// Startet die Bildschirmfreigabe und liefert den Ended-Receiver
    pub fn start_screen_share(&self) -> Result<watch::Receiver<bool>, MediaError> {
        let mut screen = self.screen.lock();
        if let Some(existing) = screen.as_ref() {
            return Ok(existing.ended_receiver());
        }

        let stream = self.backend.start_screen_capture()?;
        tracing::info!("Screen share started");
        let receiver = stream.ended_receiver();
        *screen = Some(stream);
        Ok(receiver)
    }

    /// Beendet die Bildschirmfreigabe; idempotent
    pub fn stop_screen_share(&self) {
        if let Some(stream) = self.screen.lock().take() {
            stream.mark_ended();
            tracing::info!("Screen share stopped");
        }
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.screen.lock().is_some()
    }
}

impl std::fmt::Debug for MediaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaManager")
            .field("has_microphone", &self.has_microphone())
            .field("is_muted", &self.is_muted())
            .field("is_screen_sharing", &self.is_screen_sharing())
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

    #[tokio::test]
    async fn test_acquire_is_idempotent() {
        let backend = Arc::new(MockBackend::new());
        let manager = MediaManager::new(Arc::clone(&backend) as Arc<dyn MediaBackend>);

        manager
            .acquire_microphone(&MicrophoneConstraints::default())
            .unwrap();
        manager
            .acquire_microphone(&MicrophoneConstraints::default())
            .unwrap();

        // Kein zweiter Berechtigungs-Prompt
        assert_eq!(backend.acquire_count(), 1);
    }

    #[tokio::test]
    async fn test_release_allows_reacquire() {
        let backend = Arc::new(MockBackend::new());
        let manager = MediaManager::new(Arc::clone(&backend) as Arc<dyn MediaBackend>);

        manager
            .acquire_microphone(&MicrophoneConstraints::default())
            .unwrap();
        manager.release_microphone();
        assert!(!manager.has_microphone());

        manager
            .acquire_microphone(&MicrophoneConstraints::default())
            .unwrap();
        assert_eq!(backend.acquire_count(), 2);
    }

    #[tokio::test]
    async fn test_mute_keeps_microphone() {
        let backend = Arc::new(MockBackend::new());
        let manager = MediaManager::new(backend as Arc<dyn MediaBackend>);

        manager
            .acquire_microphone(&MicrophoneConstraints::default())
            .unwrap();
        assert!(!manager.is_muted());

        manager.set_muted(true);
        assert!(manager.is_muted());
        assert!(manager.has_microphone());
    }

    #[test]
    fn test_without_microphone_counts_as_muted() {
        let backend = Arc::new(MockBackend::new());
        let manager = MediaManager::new(backend as Arc<dyn MediaBackend>);

        assert!(manager.is_muted());
        assert!((manager.input_level() - 0.0).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_denied_microphone_surfaces_error() {
        let backend = Arc::new(MockBackend::denying_microphone());
        let manager = MediaManager::new(backend as Arc<dyn MediaBackend>);

        let result = manager.acquire_microphone(&MicrophoneConstraints::default());
        assert!(matches!(result, Err(MediaError::PermissionDenied)));
        assert!(!manager.has_microphone());
    }

    #[tokio::test]
    async fn test_screen_share_lifecycle() {
        let backend = Arc::new(MockBackend::new());
        let manager = MediaManager::new(backend as Arc<dyn MediaBackend>);

        let ended = manager.start_screen_share().unwrap();
        assert!(manager.is_screen_sharing());
        assert!(!*ended.borrow());

        manager.stop_screen_share();
        assert!(!manager.is_screen_sharing());
        assert!(*ended.borrow());

        // Idempotent
        manager.stop_screen_share();
    }
}
