//! Sprech-Erkennung - Pegelabtastung mit Glättung
//!
//! Tastet den Eingangspegel des Mikrofons ~60 mal pro Sekunde ab,
//! glättet ihn exponentiell und meldet Übergänge zwischen Sprechen und
//! Stille. Das Anhalten stoppt nur die Abtastung; Stream und Gerät
//! bleiben unberührt (genutzt wenn das Fenster in den Hintergrund geht).

use super::manager::MediaManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Abtastintervall (~60 Hz)
const POLL_INTERVAL: Duration = Duration::from_millis(16);

/// Glättungsfaktor für den RMS-Pegel (Anteil des neuen Werts)
const SMOOTHING: f32 = 0.25;

/// Geglätteter Pegel über dem ein Teilnehmer als sprechend gilt
pub const SPEAKING_THRESHOLD: f32 = 0.02;

// ============================================================================
// SPEAKING MONITOR
// ============================================================================

/// Laufende Sprech-Erkennung; der Wert selbst ist das Cancel-Token
pub struct SpeakingMonitor {
    handle: JoinHandle<()>,
}

impl SpeakingMonitor {
    /// Startet die Abtastung; `on_change` wird bei jedem Übergang
    /// aufgerufen. Mehrfaches Starten nach einem Stopp ist erlaubt.
    pub fn start<F>(media: Arc<MediaManager>, on_change: F) -> Self
    where
        F: Fn(bool) + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(POLL_INTERVAL);
            let mut smoothed = 0.0f32;
            let mut speaking = false;

            loop {
                interval.tick().await;

                let level = media.input_level();
                smoothed += (level - smoothed) * SMOOTHING;

                let now_speaking = smoothed > SPEAKING_THRESHOLD && !media.is_muted();
                if now_speaking != speaking {
                    speaking = now_speaking;
                    on_change(speaking);
                }
            }
        });

        tracing::debug!("Speaking monitor started");
        Self { handle }
    }

    /// Hält die Abtastung an; mehrfaches Stoppen ist unkritisch
    pub fn stop(self) {
        self.handle.abort();
        tracing::debug!("Speaking monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for SpeakingMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// ============================================================================
// TESTS
// ============================================================================
