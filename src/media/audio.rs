//! Cpal Backend - Mikrofon-Capture über cpal
//!
//! Produktiv-Implementierung von `MediaBackend` für Desktop-Plattformen.
//! Liefert den RMS-Pegel für die Sprech-Erkennung und rohe PCM-Frames
//! für die Peer-Verbindungen.

use super::backend::{
    MediaBackend, MediaError, MicrophoneConstraints, MicrophoneShared, MicrophoneStream,
    ScreenStream, SAMPLE_RATE,
};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig, SupportedStreamConfigRange};
use std::sync::Arc;

// ============================================================================
// CONSTANTS
// ============================================================================

/// RMS-Schwelle unter der das Noise Gate greift
const NOISE_GATE_LEVEL: f32 = 0.008;

// ============================================================================
// CPAL BACKEND
// ============================================================================

/// `MediaBackend` auf cpal-Basis
pub struct CpalBackend {
    input_device: Option<Device>,
}

impl CpalBackend {
    pub fn new() -> Self {
        let host = cpal::default_host();
        let input_device = host.default_input_device();

        if input_device.is_none() {
            tracing::warn!("No audio input device found");
        }

        Self { input_device }
    }

    /// Findet die beste Input-Konfiguration
    fn find_best_input_config(device: &Device) -> Result<StreamConfig, MediaError> {
        let configs = device
            .supported_input_configs()
            .map_err(|e| MediaError::Backend(e.to_string()))?;

        Self::select_best_config(configs.collect())
    }

    /// Wählt die beste Konfiguration aus einer Liste
    fn select_best_config(
        configs: Vec<SupportedStreamConfigRange>,
    ) -> Result<StreamConfig, MediaError> {
        // Priorität: 48kHz > andere, F32 > andere
        let target_rate = cpal::SampleRate(SAMPLE_RATE);

        // Versuche exakt 48kHz zu finden
        for config in &configs {
            if config.min_sample_rate() <= target_rate
                && config.max_sample_rate() >= target_rate
                && config.sample_format() == SampleFormat::F32
            {
                return Ok(config.with_sample_rate(target_rate).into());
            }
        }

        // Fallback auf beste verfügbare F32-Konfiguration
        for config in &configs {
            if config.sample_format() == SampleFormat::F32 {
                let rate = if config.min_sample_rate() <= target_rate
                    && config.max_sample_rate() >= target_rate
                {
                    target_rate
                } else {
                    config.max_sample_rate()
                };
                return Ok(config.with_sample_rate(rate).into());
            }
        }

        // Nehme erste verfügbare Konfiguration
        if let Some(config) = configs.first() {
            return Ok(config.with_max_sample_rate().into());
        }

        Err(MediaError::DeviceUnavailable(
            "no suitable audio configuration found".to_string(),
        ))
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

// cpal::Stream ist nicht Send, daher wandert er in einen eigenen Guard
// der beim Drop den Stream stoppt
struct CaptureGuard {
    _stream: cpal::Stream,
}

unsafe impl Send for CaptureGuard {}

impl MediaBackend for CpalBackend {
    fn acquire_microphone(
        &self,
        constraints: &MicrophoneConstraints,
    ) -> Result<MicrophoneStream, MediaError> {
        let device = self.input_device.as_ref().ok_or_else(|| {
            MediaError::DeviceUnavailable("no audio input device".to_string())
        })?;

        let config = Self::find_best_input_config(device)?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels (echo_cancellation={}, noise_suppression={})",
            config.sample_rate.0,
            config.channels,
            constraints.echo_cancellation,
            constraints.noise_suppression
        );

        let shared = MicrophoneShared::new();
        let shared_cb = Arc::clone(&shared);
        let noise_suppression = constraints.noise_suppression;
        let target_sample_rate = SAMPLE_RATE;
        let source_sample_rate = config.sample_rate.0;

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    // Audio Level berechnen (RMS)
                    let rms: f32 =
                        (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32).sqrt();
                    shared_cb.set_level(rms);

                    if !shared_cb.is_enabled() {
                        return;
                    }

                    // Einfaches Noise Gate statt echter Rauschunterdrückung
                    if noise_suppression && rms < NOISE_GATE_LEVEL {
                        return;
                    }

                    // Resampling falls nötig (zu 48kHz)
                    let samples: Vec<f32> = if source_sample_rate != target_sample_rate {
                        // Einfaches Linear-Resampling
                        let ratio = target_sample_rate as f32 / source_sample_rate as f32;
                        let new_len = (data.len() as f32 * ratio) as usize;
                        (0..new_len)
                            .map(|i| {
                                let src_idx = i as f32 / ratio;
                                let idx = src_idx as usize;
                                let frac = src_idx - idx as f32;
                                let s1 = data.get(idx).copied().unwrap_or(0.0);
                                let s2 = data.get(idx + 1).copied().unwrap_or(s1);
                                s1 + (s2 - s1) * frac
                            })
                            .collect()
                    } else {
                        data.to_vec()
                    };

                    shared_cb.push_samples(&samples);
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| match e {
                cpal::BuildStreamError::DeviceNotAvailable => {
                    MediaError::DeviceUnavailable("device disappeared".to_string())
                }
                other => MediaError::Backend(other.to_string()),
            })?;

        stream
            .play()
            .map_err(|e| MediaError::Backend(e.to_string()))?;

        Ok(MicrophoneStream::new(
            shared,
            Box::new(CaptureGuard { _stream: stream }),
        ))
    }

    fn start_screen_capture(&self) -> Result<ScreenStream, MediaError> {
        // Desktop-Bildschirmaufnahme braucht ein plattformspezifisches
        // Backend; dieses Audio-Backend stellt keins bereit
        Err(MediaError::DeviceUnavailable(
            "screen capture not supported by the audio backend".to_string(),
        ))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_best_config_empty_fails() {
        let result = CpalBackend::select_best_config(Vec::new());
        assert!(matches!(result, Err(MediaError::DeviceUnavailable(_))));
    }

    #[test]
    fn test_screen_capture_unsupported() {
        let backend = CpalBackend::new();
        assert!(matches!(
            backend.start_screen_capture(),
            Err(MediaError::DeviceUnavailable(_))
        ));
    }
}
