//! Media Backend - Capture-Quellen hinter einem Trait
//!
//! Mikrofon- und Bildschirm-Capture stecken hinter `MediaBackend`, damit
//! der Koordinator ohne echte Hardware getestet werden kann. Die
//! Produktiv-Implementierung auf cpal-Basis liegt in `audio.rs`.

use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz ist der Opus-Standard)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

/// Frame Size in Samples (20ms @ 48kHz = 960 samples)
pub const FRAME_SIZE: usize = 960;

/// Buffer Size für den Capture-Ring-Buffer
const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum MediaError {
    /// Der Benutzer bzw. das OS hat den Zugriff verweigert
    #[error("Media access denied")]
    PermissionDenied,

    #[error("No usable capture device: {0}")]
    DeviceUnavailable(String),

    #[error("Capture backend error: {0}")]
    Backend(String),
}

// ============================================================================
// CONSTRAINTS
// ============================================================================

/// Aufnahme-Flags, zur Connect-Zeit aus den User-Settings gelesen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MicrophoneConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
}

impl Default for MicrophoneConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
        }
    }
}

// ============================================================================
// MICROPHONE STREAM
// ============================================================================

/// Geteilter Zustand zwischen Capture-Callback und Besitzer des Streams
pub struct MicrophoneShared {
    /// Mute wird über dieses Flag umgesetzt, der Stream läuft weiter.
    /// Den Stream zu stoppen würde das Gerät freigeben und beim nächsten
    /// Unmute eine erneute Freigabe erzwingen.
    enabled: Mutex<bool>,
    /// Roher RMS-Pegel 0.0-1.0 aus dem Capture-Callback
    level: Mutex<f32>,
    /// Ring-Buffer für aufgenommenes Audio (Raw PCM, 48kHz mono)
    buffer: Mutex<HeapRb<f32>>,
}

impl MicrophoneShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            enabled: Mutex::new(true),
            level: Mutex::new(0.0),
            buffer: Mutex::new(HeapRb::new(RING_BUFFER_SIZE)),
        })
    }

    pub fn set_enabled(&self, enabled: bool) {
        *self.enabled.lock() = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.lock()
    }

    pub fn set_level(&self, level: f32) {
        *self.level.lock() = level.min(1.0);
    }

    pub fn level(&self) -> f32 {
        *self.level.lock()
    }

    /// Schreibt aufgenommene Samples in den Ring-Buffer; ist er voll,
    /// verfallen überzählige Samples
    pub fn push_samples(&self, samples: &[f32]) {
        let mut buffer = self.buffer.lock();
        for sample in samples {
            let _ = buffer.try_push(*sample);
        }
    }

    /// Liest einen vollständigen Frame, falls genug Samples vorliegen
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        let mut buffer = self.buffer.lock();
        if buffer.occupied_len() >= FRAME_SIZE {
            let mut frame = Vec::with_capacity(FRAME_SIZE);
            for _ in 0..FRAME_SIZE {
                if let Some(sample) = buffer.try_pop() {
                    frame.push(sample);
                }
            }
            Some(frame)
        } else {
            None
        }
    }
}

impl std::fmt::Debug for MicrophoneShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicrophoneShared")
            .field("enabled", &self.is_enabled())
            .field("level", &self.level())
            .finish()
    }
}

/// Eine laufende Mikrofonaufnahme
///
/// Der Guard besitzt den Plattform-Stream; beim Drop wird die Hardware
/// freigegeben.
pub struct MicrophoneStream {
    shared: Arc<MicrophoneShared>,
    _guard: Box<dyn Send>,
}

impl MicrophoneStream {
    pub fn new(shared: Arc<MicrophoneShared>, guard: Box<dyn Send>) -> Self {
        Self {
            shared,
            _guard: guard,
        }
    }

    /// Schaltet die Aufnahme stumm ohne den Stream zu stoppen
    pub fn set_enabled(&self, enabled: bool) {
        self.shared.set_enabled(enabled);
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.is_enabled()
    }

    /// Aktueller Eingangspegel (roher RMS, 0.0-1.0)
    pub fn level(&self) -> f32 {
        self.shared.level()
    }

    /// Liest einen PCM-Frame für die Weitergabe an Peer-Verbindungen
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        self.shared.read_frame()
    }
}

impl std::fmt::Debug for MicrophoneStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicrophoneStream")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

// ============================================================================
// SCREEN STREAM
// ============================================================================

/// Eine laufende Bildschirmfreigabe
///
/// `ended_receiver` feuert auch dann, wenn die Freigabe über die
/// OS-eigene UI beendet wurde, nicht nur über `stop()`.
pub struct ScreenStream {
    ended_tx: watch::Sender<bool>,
    _guard: Box<dyn Send>,
}

impl ScreenStream {
    pub fn new(guard: Box<dyn Send>) -> Self {
        let (ended_tx, _) = watch::channel(false);
        Self {
            ended_tx,
            _guard: guard,
        }
    }

    /// Receiver für das Ende der Freigabe (true sobald beendet)
    pub fn ended_receiver(&self) -> watch::Receiver<bool> {
        self.ended_tx.subscribe()
    }

    /// Markiert die Freigabe als beendet; vom Backend aufgerufen wenn
    /// das OS die Quelle schließt
    pub fn mark_ended(&self) {
        let _ = self.ended_tx.send(true);
    }

    pub fn is_ended(&self) -> bool {
        *self.ended_tx.borrow()
    }
}

impl std::fmt::Debug for ScreenStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScreenStream")
            .field("ended", &self.is_ended())
            .finish()
    }
}

// ============================================================================
// BACKEND TRAIT
// ============================================================================

/// Capture-Quellen der Plattform
///
/// Implementierungen dürfen blockieren (Berechtigungs-Dialoge); der
/// Koordinator prüft nach der Rückkehr, ob der Versuch noch aktuell ist.
pub trait MediaBackend: Send + Sync {
    /// Öffnet das Mikrofon mit den gegebenen Constraints
    fn acquire_microphone(
        &self,
        constraints: &MicrophoneConstraints,
    ) -> Result<MicrophoneStream, MediaError>;

    /// Startet eine Bildschirmaufnahme
    fn start_screen_capture(&self) -> Result<ScreenStream, MediaError>;
}

// ============================================================================
// MOCK BACKEND (nur Tests)
// ============================================================================

#[cfg(test)]
pub(crate) mod mock {
    use super::*;

    /// Skriptbares Backend für Tests: Pegel steuerbar, Fehler erzwingbar
    pub struct MockBackend {
        pub deny_microphone: bool,
        pub deny_screen: bool,
        level: Arc<Mutex<f32>>,
        acquire_count: Mutex<u32>,
    }

    impl MockBackend {
        pub fn new() -> Self {
            Self {
                deny_microphone: false,
                deny_screen: false,
                level: Arc::new(Mutex::new(0.0)),
                acquire_count: Mutex::new(0),
            }
        }

        pub fn denying_microphone() -> Self {
            let mut backend = Self::new();
            backend.deny_microphone = true;
            backend
        }

        /// Simuliert Eingangspegel für die Sprech-Erkennung
        pub fn drive_level(&self, level: f32) {
            *self.level.lock() = level;
        }

        pub fn acquire_count(&self) -> u32 {
            *self.acquire_count.lock()
        }
    }

    impl MediaBackend for MockBackend {
        fn acquire_microphone(
            &self,
            _constraints: &MicrophoneConstraints,
        ) -> Result<MicrophoneStream, MediaError> {
            *self.acquire_count.lock() += 1;
            if self.deny_microphone {
                return Err(MediaError::PermissionDenied);
            }

            let shared = MicrophoneShared::new();
            let shared_clone = Arc::clone(&shared);
            let level = Arc::clone(&self.level);

            // Pump-Task spiegelt den skriptbaren Pegel in den Stream
            let pump = tokio::spawn(async move {
                let mut interval = tokio::time::interval(tokio::time::Duration::from_millis(5));
                loop {
                    interval.tick().await;
                    shared_clone.set_level(*level.lock());
                }
            });

            struct AbortOnDrop(tokio::task::JoinHandle<()>);
            impl Drop for AbortOnDrop {
                fn drop(&mut self) {
                    self.0.abort();
                }
            }

            Ok(MicrophoneStream::new(shared, Box::new(AbortOnDrop(pump))))
        }

        fn start_screen_capture(&self) -> Result<ScreenStream, MediaError> {
            if self.deny_screen {
                return Err(MediaError::PermissionDenied);
            }
            Ok(ScreenStream::new(Box::new(())))
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_microphone_stream_mute_keeps_stream() {
        let shared = MicrophoneShared::new();
        let stream = MicrophoneStream::new(Arc::clone(&shared), Box::new(()));

        assert!(stream.is_enabled());
        stream.set_enabled(false);
        assert!(!stream.is_enabled());

        // Pegel kommt weiterhin an, der Stream lebt
        shared.set_level(0.5);
        assert!((stream.level() - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_screen_stream_ended_notification() {
        let stream = ScreenStream::new(Box::new(()));
        let rx = stream.ended_receiver();

        assert!(!*rx.borrow());
        stream.mark_ended();
        assert!(*rx.borrow());
        assert!(stream.is_ended());
    }

    #[test]
    fn test_level_is_clamped() {
        let shared = MicrophoneShared::new();
        shared.set_level(3.0);
        assert!((shared.level() - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_read_frame_needs_full_frame() {
        let shared = MicrophoneShared::new();

        shared.push_samples(&vec![0.1; FRAME_SIZE / 2]);
        assert!(shared.read_frame().is_none());

        shared.push_samples(&vec![0.1; FRAME_SIZE]);
        let frame = shared.read_frame().unwrap();
        assert_eq!(frame.len(), FRAME_SIZE);
    }
}
