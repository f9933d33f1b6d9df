//! Live duplex voice session.
//!
//! [`LiveSession`] wires the microphone, the session link and the speaker
//! together and drives the [`SessionState`] machine:
//!
//! ```text
//! mic -> capture stage -> encode -> outbound queue -> link
//! link -> playback stage -> decode -> scheduler -> speaker
//! ```
//!
//! Each direction runs as its own task. A supervisor task waits for the
//! first close reason (stop, remote close, link or device failure), joins
//! both stages, closes the link and only then publishes `Closed`.

pub mod capture;
pub mod playback;
pub mod state;
pub mod stats;

use crate::audio::scheduler::PlaybackScheduler;
use crate::audio::{AudioBackend, CpalBackend, InputChannels};
use crate::config::LiveConfig;
use crate::error::{LiveError, Result};
use crate::link::{GeminiLiveConnector, LinkCloser, LinkConnector};
use capture::{CaptureStage, FrameAssembler, run_capture_stage};
use playback::{PlaybackStage, run_playback_stage};
use state::{CloseReason, SessionEvent, SessionState, StateMachine};
use stats::{SessionStats, SessionStatsSnapshot};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Session-wide cancellation carrying the first close reason.
#[derive(Debug, Clone, Default)]
pub(crate) struct Shutdown {
    token: CancellationToken,
    reason: Arc<Mutex<Option<CloseReason>>>,
}

impl Shutdown {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record `reason` and cancel. Returns `false` if already triggered;
    /// the first reason wins.
    pub(crate) fn trigger(&self, reason: CloseReason) -> bool {
        let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(reason);
        drop(slot);
        self.token.cancel();
        true
    }

    pub(crate) async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    pub(crate) fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The close reason, `Stopped` if none was recorded yet.
    pub(crate) fn reason(&self) -> CloseReason {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or(CloseReason::Stopped)
    }
}

/// One live consult: microphone to agent, agent to speaker.
pub struct LiveSession {
    id: Uuid,
    config: LiveConfig,
    audio: Arc<dyn AudioBackend>,
    connector: Arc<dyn LinkConnector>,
    state: Arc<StateMachine>,
    stats: Arc<SessionStats>,
    shutdown: Shutdown,
    supervisor: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl LiveSession {
    pub fn new(
        config: LiveConfig,
        audio: Arc<dyn AudioBackend>,
        connector: Arc<dyn LinkConnector>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            audio,
            connector,
            state: Arc::new(StateMachine::new()),
            stats: Arc::new(SessionStats::default()),
            shutdown: Shutdown::new(),
            supervisor: tokio::sync::Mutex::new(None),
        }
    }

    /// System audio devices and the Gemini Live service.
    pub fn with_defaults(config: LiveConfig) -> Self {
        Self::new(config, Arc::new(CpalBackend), Arc::new(GeminiLiveConnector))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state.current()
    }

    /// Every state transition from now on, in order.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> SessionStatsSnapshot {
        self.stats.snapshot()
    }

    /// Wait until the session has closed and all resources are released.
    pub async fn wait_closed(&self) -> CloseReason {
        self.state.closed().await
    }

    /// Acquire devices, open the link and start streaming.
    ///
    /// Resolves once the session is `Listening`.
    ///
    /// # Errors
    ///
    /// - [`LiveError::Session`] if the session is not idle.
    /// - [`LiveError::Device`] if a device cannot be acquired. The session
    ///   stays `Idle` and no link is opened.
    /// - [`LiveError::Link`] if the link cannot be opened. The session closes.
    pub async fn start(&self) -> Result<()> {
        let mut slot = self.supervisor.lock().await;
        if self.state.current() != SessionState::Idle || self.shutdown.is_triggered() {
            return Err(LiveError::Session(format!(
                "cannot start a session that is {}",
                self.state.current()
            )));
        }
        self.config.validate()?;
        info!(session = %self.id, "starting live session");

        let audio_config = &self.config.audio;
        let (samples_tx, samples_rx) = mpsc::channel(audio_config.capture_queue_frames.max(1));
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();

        let mut input = self.audio.open_input(
            audio_config,
            InputChannels {
                samples: samples_tx,
                faults: faults_tx,
            },
        )?;
        let output = self.audio.open_output(audio_config, playback_tx)?;

        self.state.apply(SessionEvent::Start);

        let link = tokio::select! {
            biased;
            () = self.shutdown.cancelled() => {
                drop((input, output));
                self.state.apply(SessionEvent::Close(self.shutdown.reason()));
                return Err(LiveError::Session("session stopped while connecting".into()));
            }
            link = self.connector.open(&self.config.link) => link,
        };
        let link = match link {
            Ok(link) => link,
            Err(e) => {
                drop((input, output));
                self.fail(&e);
                return Err(e);
            }
        };
        let (outbound, link_events, closer) = link.into_parts();

        self.state.apply(SessionEvent::LinkOpened);
        if let Err(e) = input.resume() {
            drop((input, output));
            closer.close().await;
            self.fail(&e);
            return Err(e);
        }

        let capture = tokio::spawn(run_capture_stage(CaptureStage {
            input,
            samples: samples_rx,
            faults: faults_rx,
            outbound,
            assembler: FrameAssembler::new(audio_config.frame_size, audio_config.input_sample_rate),
            shutdown: self.shutdown.clone(),
            stats: Arc::clone(&self.stats),
        }));
        let playback = tokio::spawn(run_playback_stage(PlaybackStage {
            scheduler: PlaybackScheduler::new(output),
            playback_events: playback_rx,
            link_events,
            state: Arc::clone(&self.state),
            shutdown: self.shutdown.clone(),
            stats: Arc::clone(&self.stats),
        }));

        *slot = Some(tokio::spawn(supervise(
            self.id,
            capture,
            playback,
            closer,
            self.shutdown.clone(),
            Arc::clone(&self.state),
        )));
        Ok(())
    }

    /// Stop the session and wait until every resource is released.
    ///
    /// Idempotent; stopping an idle session closes it.
    pub async fn stop(&self) {
        if self.shutdown.trigger(CloseReason::Stopped) {
            info!(session = %self.id, "stopping live session");
        }
        let mut slot = self.supervisor.lock().await;
        if let Some(handle) = slot.take()
            && let Err(e) = handle.await
        {
            error!("session supervisor failed: {e}");
        }
        drop(slot);
        self.state.apply(SessionEvent::Close(self.shutdown.reason()));
    }

    fn fail(&self, err: &LiveError) {
        warn!(session = %self.id, "live session failed to start: {err}");
        self.shutdown.trigger(close_reason(err));
        self.state.apply(SessionEvent::Close(self.shutdown.reason()));
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.shutdown.trigger(CloseReason::Stopped);
    }
}

fn close_reason(err: &LiveError) -> CloseReason {
    match err {
        LiveError::Device(msg) => CloseReason::Device(msg.clone()),
        LiveError::Link(msg) => CloseReason::Link(msg.clone()),
        other => CloseReason::Link(other.to_string()),
    }
}

/// Wait for the first close reason, then tear down in order: capture,
/// playback, link. `Closed` is published last.
async fn supervise(
    id: Uuid,
    capture: JoinHandle<()>,
    playback: JoinHandle<()>,
    closer: LinkCloser,
    shutdown: Shutdown,
    state: Arc<StateMachine>,
) {
    shutdown.cancelled().await;
    let reason = shutdown.reason();
    info!(session = %id, %reason, "tearing down live session");

    for (stage, handle) in [("capture", capture), ("playback", playback)] {
        if let Err(e) = handle.await {
            error!("{stage} stage failed: {e}");
        }
    }
    closer.close().await;

    state.apply(SessionEvent::Close(reason));
    info!(session = %id, "live session closed");
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn first_trigger_wins() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());
        assert_eq!(shutdown.reason(), CloseReason::Stopped);

        assert!(shutdown.trigger(CloseReason::Link("reset".into())));
        assert!(!shutdown.trigger(CloseReason::Stopped));
        assert!(shutdown.is_triggered());
        assert_eq!(shutdown.reason(), CloseReason::Link("reset".into()));
    }

    #[tokio::test]
    async fn clones_share_cancellation() {
        let shutdown = Shutdown::new();
        let other = shutdown.clone();
        other.trigger(CloseReason::Device("mic".into()));
        shutdown.cancelled().await;
        assert_eq!(shutdown.reason(), CloseReason::Device("mic".into()));
    }

    #[test]
    fn errors_map_to_close_reasons() {
        assert_eq!(
            close_reason(&LiveError::Device("denied".into())),
            CloseReason::Device("denied".into())
        );
        assert_eq!(
            close_reason(&LiveError::Link("timeout".into())),
            CloseReason::Link("timeout".into())
        );
        assert!(matches!(
            close_reason(&LiveError::Config("bad".into())),
            CloseReason::Link(_)
        ));
    }
}
