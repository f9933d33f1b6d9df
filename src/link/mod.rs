//! Session link: the bidirectional channel to the remote conversational agent.
//!
//! A [`LinkConnector`] opens a session and returns a [`LinkHandle`]. The
//! handle splits into the outbound sender used by the capture pipeline, the
//! ordered stream of inbound [`LinkEvent`]s consumed by playback, and a
//! [`LinkCloser`] used during teardown.
//!
//! Implementations own the transport side through a [`LinkEndpoint`].

pub mod gemini;
pub mod outbound;

use crate::audio::codec::EncodedChunk;
use crate::config::LinkConfig;
use crate::error::Result;
use async_trait::async_trait;
use outbound::{OutboundSender, outbound_channel};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use gemini::GeminiLiveConnector;

/// Inbound events from the remote agent, in the order the agent sent them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// One chunk of agent speech.
    Audio(EncodedChunk),
    /// The agent finished its turn.
    TurnComplete,
    /// The agent stopped its turn early because the user started speaking.
    Interrupted,
    /// The link failed.
    Error(String),
    /// The remote side closed the session.
    Closed(Option<String>),
}

/// Opens sessions with a remote conversational agent.
#[async_trait]
pub trait LinkConnector: Send + Sync {
    /// Open a session. Resolves once the agent confirms the session is ready.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::Link`](crate::LiveError::Link) if the session
    /// cannot be opened.
    async fn open(&self, config: &LinkConfig) -> Result<LinkHandle>;
}

/// Transport-side ends of a link, owned by the connector's I/O task.
pub struct LinkEndpoint {
    /// Encoded capture chunks to transmit, in production order.
    pub outbound: mpsc::Receiver<EncodedChunk>,
    /// Where to deliver inbound events.
    pub events: mpsc::UnboundedSender<LinkEvent>,
    /// Fires when the session side closes the link. Cancel it when the
    /// transport ends so senders stop queuing.
    pub cancel: CancellationToken,
}

/// Session-side ends of an open link.
pub struct LinkHandle {
    outbound: OutboundSender,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    closer: LinkCloser,
}

impl LinkHandle {
    /// Create a connected handle/endpoint pair.
    pub fn pair(outbound_capacity: usize, close_timeout: Duration) -> (Self, LinkEndpoint) {
        let cancel = CancellationToken::new();
        let (outbound, outbound_rx) = outbound_channel(outbound_capacity, cancel.clone());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let handle = Self {
            outbound,
            events: events_rx,
            closer: LinkCloser {
                cancel: cancel.clone(),
                task: None,
                timeout: close_timeout,
            },
        };
        let endpoint = LinkEndpoint {
            outbound: outbound_rx,
            events: events_tx,
            cancel,
        };
        (handle, endpoint)
    }

    /// Attach the transport task so closing waits for it to wind down.
    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.closer.task = Some(task);
        self
    }

    /// Split into the outbound sender, inbound events, and closer.
    pub fn into_parts(
        self,
    ) -> (
        OutboundSender,
        mpsc::UnboundedReceiver<LinkEvent>,
        LinkCloser,
    ) {
        (self.outbound, self.events, self.closer)
    }
}

/// Closes a link and waits (bounded) for its transport task to finish.
pub struct LinkCloser {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    timeout: Duration,
}

impl LinkCloser {
    /// Close the link. Outbound sends fail from this point on.
    pub async fn close(mut self) {
        self.cancel.cancel();
        let Some(task) = self.task.take() else {
            return;
        };
        let abort = task.abort_handle();
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(())) => debug!("session link closed"),
            Ok(Err(e)) => warn!("session link task failed: {e}"),
            Err(_) => {
                warn!("session link did not close in time, aborting");
                abort.abort();
            }
        }
    }
}

impl Drop for LinkCloser {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
