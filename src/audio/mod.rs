//! Audio capture, playback scheduling, and the PCM16 wire codec.
//!
//! Devices sit behind [`AudioBackend`] so the session can be driven by cpal
//! in production and by in-memory fakes in tests. Device callbacks never
//! touch session state: they only enqueue [`InputChannels`] blocks and
//! [`PlaybackEvent`]s for the pipeline tasks to consume.

pub mod capture;
pub mod clock;
pub mod codec;
pub mod playback;
pub mod scheduler;

use crate::config::AudioConfig;
use crate::error::Result;
use clock::DeviceClock;
use codec::AudioFrame;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Identifier of one frame scheduled on an output device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub u64);

/// Messages from the output device back to the playback stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// The source has finished playing.
    Finished(SourceId),
    /// The output stream failed.
    Fault(String),
}

/// Where a microphone delivers its audio.
#[derive(Debug, Clone)]
pub struct InputChannels {
    /// Mono sample blocks at the configured input rate. Full queue = dropped block.
    pub samples: mpsc::Sender<Vec<f32>>,
    /// Stream failures reported by the device.
    pub faults: mpsc::UnboundedSender<String>,
}

/// An acquired microphone. Dropping it releases the device.
pub trait AudioInput: Send {
    /// Start delivering samples. Nothing is delivered before this call.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::Device`](crate::LiveError::Device) if the stream cannot start.
    fn resume(&mut self) -> Result<()>;
}

/// An acquired speaker that plays frames at given positions on its timeline.
/// Dropping it releases the device.
pub trait AudioSink: Send {
    /// Play `frame` starting at `start_at` on the device timeline and report
    /// [`PlaybackEvent::Finished`] with `id` once it has played.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::Device`](crate::LiveError::Device) if the device rejects the frame.
    fn schedule(&mut self, id: SourceId, frame: AudioFrame, start_at: Duration) -> Result<()>;

    /// Stop every scheduled source immediately. No completion is reported for them.
    fn cancel_all(&mut self);

    /// The clock of this device's timeline.
    fn clock(&self) -> Arc<dyn DeviceClock>;
}

/// Opens audio devices for one session.
pub trait AudioBackend: Send + Sync {
    /// Acquire the microphone. The stream stays paused until [`AudioInput::resume`].
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::Device`](crate::LiveError::Device) when no device is
    /// available or access is denied.
    fn open_input(&self, config: &AudioConfig, channels: InputChannels)
    -> Result<Box<dyn AudioInput>>;

    /// Acquire the speaker.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::Device`](crate::LiveError::Device) when no device is
    /// available or the output stream cannot be built.
    fn open_output(
        &self,
        config: &AudioConfig,
        events: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Result<Box<dyn AudioSink>>;
}

/// System audio devices via cpal.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn open_input(
        &self,
        config: &AudioConfig,
        channels: InputChannels,
    ) -> Result<Box<dyn AudioInput>> {
        let capture = capture::CpalCapture::new(config)?;
        Ok(Box::new(capture.open(channels)?))
    }

    fn open_output(
        &self,
        config: &AudioConfig,
        events: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Result<Box<dyn AudioSink>> {
        Ok(Box::new(playback::CpalPlayback::open(config, events)?))
    }
}
