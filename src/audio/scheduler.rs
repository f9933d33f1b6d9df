//! Gapless playback scheduling on a device timeline.
//!
//! Inbound agent audio arrives in bursts and with jitter. The scheduler
//! keeps a virtual playback clock marking where the last scheduled frame
//! ends, and starts each new frame at `max(playback_clock, device_now)`:
//! back-to-back while audio is queued, immediately once the device has
//! caught up. The clock never moves backwards, so frames never overlap.
//!
//! The scheduler is mutated through `&mut self` only and is owned by a
//! single task, so each read-then-advance of the clock is one critical
//! section.

use super::clock::DeviceClock;
use super::codec::AudioFrame;
use super::{AudioSink, SourceId};
use crate::error::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Outcome of scheduling one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scheduled {
    pub id: SourceId,
    /// Device time the frame starts playing.
    pub start_at: Duration,
    /// Device time the frame stops playing; the new playback clock.
    pub ends_at: Duration,
    /// Silence inserted because the device had already passed the playback
    /// clock while earlier frames were still active (underrun). `None` for
    /// the first frame of a turn, where silence is expected.
    pub gap: Option<Duration>,
    /// The frame went into an empty active set: a new agent turn started.
    pub started_turn: bool,
}

/// Outcome of a completion report from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Removed; other sources are still playing.
    Pending { remaining: usize },
    /// Removed the last active source.
    Drained,
    /// Not active (already completed or cancelled); nothing changed.
    Stale,
}

/// Owner of the playback clock and the set of active sources.
pub struct PlaybackScheduler {
    sink: Box<dyn AudioSink>,
    clock: Arc<dyn DeviceClock>,
    /// End of the last scheduled frame. `None` until first use.
    playback_clock: Option<Duration>,
    /// Sources scheduled and not yet finished, with their end times.
    active: HashMap<SourceId, Duration>,
    next_id: u64,
}

impl PlaybackScheduler {
    /// Schedule onto `sink`, reading time from the sink's own clock.
    pub fn new(sink: Box<dyn AudioSink>) -> Self {
        let clock = sink.clock();
        Self {
            sink,
            clock,
            playback_clock: None,
            active: HashMap::new(),
            next_id: 0,
        }
    }

    /// Place `frame` immediately after everything already scheduled, or at
    /// the current device time if that is later.
    ///
    /// # Errors
    ///
    /// Propagates the sink's device error. The playback clock and active set
    /// are left untouched in that case.
    pub fn schedule(&mut self, frame: AudioFrame) -> Result<Scheduled> {
        let now = self.clock.now();
        let clock = self.playback_clock.unwrap_or(now);
        let start_at = clock.max(now);
        let started_turn = self.active.is_empty();
        let gap = Some(now.saturating_sub(clock))
            .filter(|g| !started_turn && !g.is_zero());
        let duration = frame.duration();

        let id = SourceId(self.next_id);
        self.sink.schedule(id, frame, start_at)?;
        self.next_id += 1;

        let ends_at = start_at + duration;
        self.playback_clock = Some(ends_at);
        self.active.insert(id, ends_at);

        if let Some(gap) = gap {
            debug!(
                gap_ms = gap.as_secs_f64() * 1000.0,
                "playback clock behind device, starting immediately"
            );
        }

        Ok(Scheduled {
            id,
            start_at,
            ends_at,
            gap,
            started_turn,
        })
    }

    /// Record that `id` finished playing.
    pub fn complete(&mut self, id: SourceId) -> Completion {
        if self.active.remove(&id).is_none() {
            return Completion::Stale;
        }
        if self.active.is_empty() {
            Completion::Drained
        } else {
            Completion::Pending {
                remaining: self.active.len(),
            }
        }
    }

    /// Stop everything scheduled and clear the active set. Returns how many
    /// sources were cancelled.
    pub fn cancel_all(&mut self) -> usize {
        self.sink.cancel_all();
        let cancelled = self.active.len();
        self.active.clear();
        cancelled
    }

    /// End of the last scheduled frame, if anything has been scheduled.
    pub fn playback_clock(&self) -> Option<Duration> {
        self.playback_clock
    }

    /// Number of sources scheduled and not yet finished.
    pub fn active_sources(&self) -> usize {
        self.active.len()
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }
}
