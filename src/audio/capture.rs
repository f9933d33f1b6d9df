//! Microphone audio capture using cpal.
//!
//! Captures audio at the device's native sample rate and channel layout,
//! then downmixes and resamples to 16kHz mono for the outbound pipeline.

use super::{AudioInput, InputChannels};
use crate::config::AudioConfig;
use crate::error::{LiveError, Result};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info};

/// Microphone selected and configured, not yet streaming.
///
/// Captures at the device's native sample rate and downsamples to the
/// configured input rate (default 16kHz) for the session link.
pub struct CpalCapture {
    device: cpal::Device,
    stream_config: StreamConfig,
    /// The target sample rate sent to the agent (e.g., 16kHz).
    target_sample_rate: u32,
}

impl CpalCapture {
    /// Select the configured (or default) input device.
    ///
    /// Uses the device's default configuration for maximum compatibility,
    /// then converts to the target rate in software.
    ///
    /// # Errors
    ///
    /// Returns an error if no input device is available.
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(ref name) = config.input_device {
            host.input_devices()
                .map_err(|e| LiveError::Device(format!("cannot enumerate devices: {e}")))?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| LiveError::Device(format!("input device '{name}' not found")))?
        } else {
            host.default_input_device()
                .ok_or_else(|| LiveError::Device("no default input device".into()))?
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using input device: {device_name}");

        let default_config = device
            .default_input_config()
            .map_err(|e| LiveError::Device(format!("no default input config: {e}")))?;

        let native_rate = default_config.sample_rate();
        let native_channels = default_config.channels();

        let stream_config = StreamConfig {
            channels: native_channels,
            sample_rate: native_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        info!(
            "native input config: {}Hz, {} channels",
            native_rate, native_channels
        );

        if native_rate != config.input_sample_rate {
            info!(
                "will resample from {}Hz to {}Hz",
                native_rate, config.input_sample_rate
            );
        }

        Ok(Self {
            device,
            stream_config,
            target_sample_rate: config.input_sample_rate,
        })
    }

    /// Build the input stream, paused. This is where the OS grants or denies
    /// microphone access.
    ///
    /// # Errors
    ///
    /// Returns an error if the audio stream cannot be created.
    pub fn open(self, channels: InputChannels) -> Result<CaptureStream> {
        let native_rate = self.stream_config.sample_rate;
        let native_channels = self.stream_config.channels;
        let target_rate = self.target_sample_rate;
        let active = Arc::new(AtomicBool::new(false));
        let callback_active = Arc::clone(&active);
        let InputChannels { samples, faults } = channels;

        let stream = self
            .device
            .build_input_stream(
                &self.stream_config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    if !callback_active.load(Ordering::Acquire) {
                        return;
                    }

                    let mono = if native_channels > 1 {
                        to_mono(data, native_channels)
                    } else {
                        data.to_vec()
                    };

                    let block = if native_rate != target_rate {
                        resample(&mono, native_rate, target_rate)
                    } else {
                        mono
                    };

                    // Never block the audio thread on a slow consumer.
                    if samples.try_send(block).is_err() {
                        debug!("capture queue full, dropping block");
                    }
                },
                move |err| {
                    error!("audio input stream error: {err}");
                    let _ = faults.send(format!("microphone stream error: {err}"));
                },
                None,
            )
            .map_err(|e| LiveError::Device(format!("failed to build input stream: {e}")))?;

        // Some hosts start streams on creation.
        if let Err(e) = stream.pause() {
            debug!("input stream could not be paused before start: {e}");
        }

        info!(
            "microphone acquired: native {}Hz -> target {}Hz",
            native_rate, target_rate
        );

        Ok(CaptureStream { stream, active })
    }

    /// List available input devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_input_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| LiveError::Device(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }
}

/// A live microphone stream. Dropping it stops capture and releases the device.
pub struct CaptureStream {
    stream: cpal::Stream,
    active: Arc<AtomicBool>,
}

impl AudioInput for CaptureStream {
    fn resume(&mut self) -> Result<()> {
        self.active.store(true, Ordering::Release);
        self.stream
            .play()
            .map_err(|e| LiveError::Device(format!("failed to start input stream: {e}")))?;
        info!("audio capture started");
        Ok(())
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
        info!("microphone released");
    }
}

/// Convert interleaved multi-channel audio to mono by averaging channels.
pub(crate) fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Simple linear-interpolation resampler.
///
/// Converts audio from `src_rate` to `dst_rate`. Speech energy sits below
/// 8kHz, so no anti-alias filter is applied for 48kHz → 16kHz.
pub(crate) fn resample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() || dst_rate == 0 {
        return samples.to_vec();
    }

    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < samples.len() {
            samples[idx] as f64 * (1.0 - frac) + samples[idx + 1] as f64 * frac
        } else {
            samples[idx.min(samples.len() - 1)] as f64
        };

        output.push(sample as f32);
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_mono_averages_channels() {
        let stereo = [0.5, -0.5, 1.0, 0.0];
        assert_eq!(to_mono(&stereo, 2), vec![0.0, 0.5]);
    }

    #[test]
    fn resample_48k_to_16k_keeps_one_in_three() {
        let samples: Vec<f32> = (0..48).map(|i| i as f32).collect();
        let out = resample(&samples, 48_000, 16_000);
        assert_eq!(out.len(), 16);
        assert_eq!(out[0], 0.0);
        assert_eq!(out[1], 3.0);
        assert_eq!(out[15], 45.0);
    }

    #[test]
    fn resample_upsamples_with_interpolation() {
        let out = resample(&[0.0, 1.0], 16_000, 24_000);
        assert_eq!(out.len(), 3);
        assert!((out[1] - 2.0 / 3.0).abs() < 1e-6);
        // Past the last source sample the tail is held.
        assert_eq!(out[2], 1.0);
    }

    #[test]
    fn resample_same_rate_is_identity() {
        let samples = vec![0.1, 0.2, 0.3];
        assert_eq!(resample(&samples, 16_000, 16_000), samples);
        assert!(resample(&[], 48_000, 16_000).is_empty());
    }
}
