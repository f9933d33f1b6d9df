//! Outbound channel from the capture pipeline to the session link.
//!
//! Sending only ever enqueues. When the network falls behind and the queue
//! fills, new frames are dropped rather than stalling capture.

use crate::audio::codec::EncodedChunk;
use crate::error::{LiveError, Result};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Result of a non-blocking send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The chunk is queued for transmission.
    Queued,
    /// The queue was full; the chunk was discarded.
    Dropped,
}

/// Producer half of the outbound channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct OutboundSender {
    tx: mpsc::Sender<EncodedChunk>,
    closed: CancellationToken,
}

impl OutboundSender {
    /// Queue `chunk` without waiting for the network.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::Link`] once the link is closed; nothing is
    /// queued after that point.
    pub fn send(&self, chunk: EncodedChunk) -> Result<SendOutcome> {
        if self.closed.is_cancelled() {
            return Err(LiveError::Link("session link closed".into()));
        }
        match self.tx.try_send(chunk) {
            Ok(()) => Ok(SendOutcome::Queued),
            Err(TrySendError::Full(_)) => {
                debug!("outbound queue full, dropping frame");
                Ok(SendOutcome::Dropped)
            }
            Err(TrySendError::Closed(_)) => Err(LiveError::Link("session link closed".into())),
        }
    }

    /// Whether the link has stopped accepting frames.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }
}

/// Create an outbound channel whose sender refuses chunks once `closed` fires.
pub fn outbound_channel(
    capacity: usize,
    closed: CancellationToken,
) -> (OutboundSender, mpsc::Receiver<EncodedChunk>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (OutboundSender { tx, closed }, rx)
}
