//! Capture stage: microphone blocks to encoded frames on the link.

use super::Shutdown;
use super::stats::SessionStats;
use super::state::CloseReason;
use crate::audio::AudioInput;
use crate::audio::codec::{AudioFrame, encode};
use crate::link::outbound::{OutboundSender, SendOutcome};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Accumulates variable-size sample blocks into fixed-size mono frames.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_size: usize,
    sample_rate: u32,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(frame_size: usize, sample_rate: u32) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            frame_size,
            sample_rate,
            pending: Vec::with_capacity(frame_size),
        }
    }

    /// Append `block` and return every frame it completed, oldest first.
    pub fn push(&mut self, block: &[f32]) -> Vec<AudioFrame> {
        let mut frames = Vec::new();
        let mut rest = block;
        while !rest.is_empty() {
            let take = (self.frame_size - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.pending.len() == self.frame_size {
                let samples =
                    std::mem::replace(&mut self.pending, Vec::with_capacity(self.frame_size));
                frames.push(AudioFrame::mono(samples, self.sample_rate));
            }
        }
        frames
    }

    /// Samples waiting for the next frame to fill.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Everything the capture stage owns for one session.
pub(crate) struct CaptureStage {
    /// Held so the microphone is released when the stage ends.
    pub input: Box<dyn AudioInput>,
    pub samples: mpsc::Receiver<Vec<f32>>,
    pub faults: mpsc::UnboundedReceiver<String>,
    pub outbound: OutboundSender,
    pub assembler: FrameAssembler,
    pub shutdown: Shutdown,
    pub stats: Arc<SessionStats>,
}

pub(crate) async fn run_capture_stage(stage: CaptureStage) {
    let CaptureStage {
        input,
        mut samples,
        mut faults,
        outbound,
        mut assembler,
        shutdown,
        stats,
    } = stage;

    info!("capture stage started");
    'stage: loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            Some(msg) = faults.recv() => {
                warn!("microphone fault: {msg}");
                shutdown.trigger(CloseReason::Device(msg));
                break;
            }
            block = samples.recv() => {
                let Some(block) = block else {
                    shutdown.trigger(CloseReason::Device("microphone stream ended".into()));
                    break;
                };
                for frame in assembler.push(&block) {
                    stats.record_captured();
                    if shutdown.is_triggered() {
                        break 'stage;
                    }
                    match outbound.send(encode(&frame)) {
                        Ok(SendOutcome::Queued) => stats.record_sent(),
                        Ok(SendOutcome::Dropped) => stats.record_dropped(),
                        Err(e) => {
                            // The link reports its own close; capture just stops.
                            debug!("capture stopping: {e}");
                            break 'stage;
                        }
                    }
                }
            }
        }
    }

    if assembler.pending_len() > 0 {
        debug!(samples = assembler.pending_len(), "discarding partial frame");
    }
    drop(input);
    info!("capture stage stopped");
}
