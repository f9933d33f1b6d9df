//! Audio playback to system speakers via cpal.
//!
//! One output stream runs for the whole session. Frames are placed on a
//! sample-indexed timeline and mixed into the stream when the device reaches
//! them; the count of rendered samples is the device clock.

use super::capture::{resample, to_mono};
use super::clock::DeviceClock;
use super::codec::AudioFrame;
use super::{AudioSink, PlaybackEvent, SourceId};
use crate::config::AudioConfig;
use crate::error::{LiveError, Result};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Device clock driven by the number of frames the output callback has rendered.
#[derive(Debug)]
pub struct RenderedClock {
    rendered: AtomicU64,
    sample_rate: u32,
}

impl RenderedClock {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            rendered: AtomicU64::new(0),
            sample_rate,
        }
    }

    /// Frames rendered so far.
    pub fn position(&self) -> u64 {
        self.rendered.load(Ordering::Acquire)
    }

    fn advance(&self, frames: u64) {
        self.rendered.fetch_add(frames, Ordering::AcqRel);
    }

    /// Convert a timeline offset into a frame index, rounding to the nearest frame.
    fn frame_at(&self, at: Duration) -> u64 {
        let rate = u128::from(self.sample_rate);
        ((at.as_nanos() * rate + 500_000_000) / 1_000_000_000) as u64
    }
}

impl DeviceClock for RenderedClock {
    fn now(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let nanos = u128::from(self.position()) * 1_000_000_000 / u128::from(self.sample_rate);
        Duration::from_nanos(nanos as u64)
    }
}

/// A frame placed on the output timeline.
struct TimelineSource {
    id: SourceId,
    /// First frame index on the device timeline.
    start: u64,
    samples: Vec<f32>,
}

impl TimelineSource {
    fn end(&self) -> u64 {
        self.start + self.samples.len() as u64
    }
}

/// Sources waiting for, or in the middle of, playback.
#[derive(Default)]
struct Timeline {
    sources: Vec<TimelineSource>,
}

impl Timeline {
    /// Mix every source overlapping `[base, base + frames)` into `out` and
    /// return the ids that finished within this block. Samples before `base`
    /// are never played.
    fn render(&mut self, out: &mut [f32], channels: usize, base: u64) -> Vec<SourceId> {
        out.fill(0.0);
        let frames = (out.len() / channels.max(1)) as u64;
        let block_end = base + frames;
        let mut finished = Vec::new();

        self.sources.retain(|src| {
            let from = src.start.max(base);
            let to = src.end().min(block_end);
            for t in from..to {
                let sample = src.samples[(t - src.start) as usize];
                let offset = (t - base) as usize * channels;
                for slot in &mut out[offset..offset + channels] {
                    *slot += sample;
                }
            }
            if src.end() <= block_end {
                finished.push(src.id);
                false
            } else {
                true
            }
        });

        finished
    }
}

/// Audio playback to system speakers via cpal.
pub struct CpalPlayback {
    _stream: cpal::Stream,
    timeline: Arc<Mutex<Timeline>>,
    clock: Arc<RenderedClock>,
    sample_rate: u32,
}

impl CpalPlayback {
    /// Acquire the output device and start a continuously running stream.
    ///
    /// # Errors
    ///
    /// Returns an error if no output device is available or the stream
    /// cannot be built.
    pub fn open(
        config: &AudioConfig,
        events: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(ref name) = config.output_device {
            host.output_devices()
                .map_err(|e| LiveError::Device(format!("cannot enumerate devices: {e}")))?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| LiveError::Device(format!("output device '{name}' not found")))?
        } else {
            host.default_output_device()
                .ok_or_else(|| LiveError::Device("no default output device".into()))?
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using output device: {device_name}");

        let stream_config = StreamConfig {
            channels: config.output_channels,
            sample_rate: config.output_sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let timeline = Arc::new(Mutex::new(Timeline::default()));
        let clock = Arc::new(RenderedClock::new(config.output_sample_rate));
        let channels = usize::from(config.output_channels.max(1));

        let cb_timeline = Arc::clone(&timeline);
        let cb_clock = Arc::clone(&clock);
        let cb_events = events.clone();

        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    let base = cb_clock.position();
                    let finished = match cb_timeline.lock() {
                        Ok(mut timeline) => timeline.render(data, channels, base),
                        Err(_) => {
                            data.fill(0.0);
                            Vec::new()
                        }
                    };
                    cb_clock.advance((data.len() / channels) as u64);
                    for id in finished {
                        let _ = cb_events.send(PlaybackEvent::Finished(id));
                    }
                },
                move |err| {
                    error!("audio output stream error: {err}");
                    let _ = events.send(PlaybackEvent::Fault(format!(
                        "speaker stream error: {err}"
                    )));
                },
                None,
            )
            .map_err(|e| LiveError::Device(format!("failed to build output stream: {e}")))?;

        stream
            .play()
            .map_err(|e| LiveError::Device(format!("failed to start output stream: {e}")))?;

        info!(
            "speaker acquired: {}Hz, {} channel(s)",
            config.output_sample_rate, config.output_channels
        );

        Ok(Self {
            _stream: stream,
            timeline,
            clock,
            sample_rate: config.output_sample_rate,
        })
    }

    /// List available output devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_output_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| LiveError::Device(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }

    fn lock_timeline(&self) -> std::sync::MutexGuard<'_, Timeline> {
        match self.timeline.lock() {
            Ok(t) => t,
            Err(p) => p.into_inner(),
        }
    }
}

impl AudioSink for CpalPlayback {
    fn schedule(&mut self, id: SourceId, frame: AudioFrame, start_at: Duration) -> Result<()> {
        let mono = if frame.channels > 1 {
            to_mono(&frame.samples, frame.channels)
        } else {
            frame.samples
        };
        let samples = resample(&mono, frame.sample_rate, self.sample_rate);

        // Keep the scheduled start even if the callback has already rendered
        // past it; `render` skips the elapsed head so the next frame still
        // lands exactly on this one's end.
        let start = self.clock.frame_at(start_at);
        self.lock_timeline()
            .sources
            .push(TimelineSource { id, start, samples });
        Ok(())
    }

    fn cancel_all(&mut self) {
        self.lock_timeline().sources.clear();
    }

    fn clock(&self) -> Arc<dyn DeviceClock> {
        Arc::clone(&self.clock) as Arc<dyn DeviceClock>
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        self.lock_timeline().sources.clear();
        info!("speaker released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(id: u64, start: u64, samples: Vec<f32>) -> TimelineSource {
        TimelineSource {
            id: SourceId(id),
            start,
            samples,
        }
    }

    #[test]
    fn render_places_sources_at_their_start() {
        let mut timeline = Timeline::default();
        timeline.sources.push(source(1, 2, vec![0.5, 0.5]));

        let mut out = [1.0f32; 6];
        let finished = timeline.render(&mut out, 1, 0);

        assert_eq!(out, [0.0, 0.0, 0.5, 0.5, 0.0, 0.0]);
        assert_eq!(finished, vec![SourceId(1)]);
        assert!(timeline.sources.is_empty());
    }

    #[test]
    fn render_spans_blocks_and_reports_on_last() {
        let mut timeline = Timeline::default();
        timeline.sources.push(source(7, 0, vec![0.1, 0.2, 0.3, 0.4, 0.5]));

        let mut first = [0.0f32; 3];
        assert!(timeline.render(&mut first, 1, 0).is_empty());
        assert_eq!(first, [0.1, 0.2, 0.3]);

        let mut second = [0.0f32; 3];
        assert_eq!(timeline.render(&mut second, 1, 3), vec![SourceId(7)]);
        assert_eq!(second, [0.4, 0.5, 0.0]);
    }

    #[test]
    fn render_back_to_back_sources_without_gap() {
        let mut timeline = Timeline::default();
        timeline.sources.push(source(1, 0, vec![0.25; 2]));
        timeline.sources.push(source(2, 2, vec![0.75; 2]));

        let mut out = [0.0f32; 4];
        let finished = timeline.render(&mut out, 1, 0);
        assert_eq!(out, [0.25, 0.25, 0.75, 0.75]);
        assert_eq!(finished, vec![SourceId(1), SourceId(2)]);
    }

    #[test]
    fn late_source_skips_rendered_head_without_overlapping_next() {
        let mut timeline = Timeline::default();
        // Scheduled at frame 2, but the device had already rendered up to 4.
        timeline.sources.push(source(1, 2, vec![0.1, 0.2, 0.3, 0.4]));
        timeline.sources.push(source(2, 6, vec![0.5, 0.5]));

        let mut out = [0.0f32; 4];
        let finished = timeline.render(&mut out, 1, 4);

        assert_eq!(out, [0.3, 0.4, 0.5, 0.5]);
        assert_eq!(finished, vec![SourceId(1), SourceId(2)]);
    }

    #[test]
    fn source_entirely_in_the_past_finishes_silently() {
        let mut timeline = Timeline::default();
        timeline.sources.push(source(3, 0, vec![0.9, 0.9]));

        let mut out = [0.0f32; 2];
        assert_eq!(timeline.render(&mut out, 1, 10), vec![SourceId(3)]);
        assert_eq!(out, [0.0, 0.0]);
    }

    #[test]
    fn render_duplicates_mono_across_channels() {
        let mut timeline = Timeline::default();
        timeline.sources.push(source(1, 0, vec![0.5]));
        let mut out = [0.0f32; 4];
        timeline.render(&mut out, 2, 0);
        assert_eq!(out, [0.5, 0.5, 0.0, 0.0]);
    }

    #[test]
    fn rendered_clock_tracks_frames() {
        let clock = RenderedClock::new(24_000);
        clock.advance(12_000);
        assert_eq!(clock.now(), Duration::from_millis(500));
        assert_eq!(clock.frame_at(Duration::from_millis(300)), 7_200);
    }
}
