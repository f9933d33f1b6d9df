//! Per-session pipeline counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the pipeline tasks.
#[derive(Debug, Default)]
pub struct SessionStats {
    frames_captured: AtomicU64,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    frames_received: AtomicU64,
    codec_errors: AtomicU64,
    underruns: AtomicU64,
    frames_played: AtomicU64,
}

/// Point-in-time copy of [`SessionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStatsSnapshot {
    /// Complete capture frames assembled from the microphone.
    pub frames_captured: u64,
    /// Capture frames queued on the link.
    pub frames_sent: u64,
    /// Capture frames discarded because the outbound queue was full.
    pub frames_dropped: u64,
    /// Agent audio chunks received.
    pub frames_received: u64,
    /// Agent audio chunks that failed to decode.
    pub codec_errors: u64,
    /// Agent frames started late because playback had fallen behind.
    pub underruns: u64,
    /// Agent frames that finished playing.
    pub frames_played: u64,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub(crate) fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl SessionStats {
    counter! {
        record_captured => frames_captured,
        record_sent => frames_sent,
        record_dropped => frames_dropped,
        record_received => frames_received,
        record_codec_error => codec_errors,
        record_underrun => underruns,
        record_played => frames_played,
    }

    pub fn snapshot(&self) -> SessionStatsSnapshot {
        SessionStatsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            codec_errors: self.codec_errors.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            frames_played: self.frames_played.load(Ordering::Relaxed),
        }
    }
}
