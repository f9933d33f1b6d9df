//! Playback stage: agent audio from the link onto the speaker timeline.
//!
//! This task is the only owner of the [`PlaybackScheduler`], so scheduling,
//! completion and cancellation are serialised here.

use super::Shutdown;
use super::state::{CloseReason, SessionEvent, StateMachine};
use super::stats::SessionStats;
use crate::audio::PlaybackEvent;
use crate::audio::codec::{EncodedChunk, decode};
use crate::audio::scheduler::{Completion, PlaybackScheduler};
use crate::link::LinkEvent;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Agent speech is mono PCM16.
const AGENT_CHANNELS: u16 = 1;

pub(crate) struct PlaybackStage {
    pub scheduler: PlaybackScheduler,
    pub playback_events: mpsc::UnboundedReceiver<PlaybackEvent>,
    pub link_events: mpsc::UnboundedReceiver<LinkEvent>,
    pub state: Arc<StateMachine>,
    pub shutdown: Shutdown,
    pub stats: Arc<SessionStats>,
}

pub(crate) async fn run_playback_stage(stage: PlaybackStage) {
    let PlaybackStage {
        mut scheduler,
        mut playback_events,
        mut link_events,
        state,
        shutdown,
        stats,
    } = stage;

    info!("playback stage started");
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            Some(event) = playback_events.recv() => match event {
                PlaybackEvent::Finished(id) => match scheduler.complete(id) {
                    Completion::Drained => {
                        stats.record_played();
                        state.apply(SessionEvent::PlaybackDrained);
                    }
                    Completion::Pending { remaining } => {
                        stats.record_played();
                        debug!(remaining, "agent frame finished");
                    }
                    Completion::Stale => {}
                },
                PlaybackEvent::Fault(msg) => {
                    error!("speaker fault: {msg}");
                    shutdown.trigger(CloseReason::Device(msg));
                    break;
                }
            },
            event = link_events.recv() => match event {
                Some(LinkEvent::Audio(chunk)) => {
                    if let Err(reason) = play_chunk(&mut scheduler, &chunk, &state, &stats) {
                        shutdown.trigger(reason);
                        break;
                    }
                }
                Some(LinkEvent::TurnComplete) => debug!("agent turn complete"),
                Some(LinkEvent::Interrupted) => {
                    let cancelled = scheduler.cancel_all();
                    info!(cancelled, "agent interrupted, playback cancelled");
                    if cancelled > 0 {
                        state.apply(SessionEvent::PlaybackDrained);
                    }
                }
                Some(LinkEvent::Error(msg)) => {
                    error!("session link error: {msg}");
                    shutdown.trigger(CloseReason::Link(msg));
                    break;
                }
                Some(LinkEvent::Closed(reason)) => {
                    info!(?reason, "agent closed the session");
                    shutdown.trigger(CloseReason::LinkClosed(reason));
                    break;
                }
                None => {
                    shutdown.trigger(CloseReason::Link("session link dropped".into()));
                    break;
                }
            },
        }
    }

    let cancelled = scheduler.cancel_all();
    if cancelled > 0 {
        debug!(cancelled, "cancelled scheduled playback");
    }
    drop(scheduler);
    info!("playback stage stopped");
}

/// Decode and schedule one inbound chunk. A chunk that fails to decode is
/// dropped; a speaker failure ends the session.
fn play_chunk(
    scheduler: &mut PlaybackScheduler,
    chunk: &EncodedChunk,
    state: &StateMachine,
    stats: &SessionStats,
) -> Result<(), CloseReason> {
    stats.record_received();
    let frame = match decode(chunk, AGENT_CHANNELS) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("dropping undecodable agent audio: {e}");
            stats.record_codec_error();
            return Ok(());
        }
    };

    let scheduled = scheduler
        .schedule(frame)
        .map_err(|e| CloseReason::Device(e.to_string()))?;
    if scheduled.gap.is_some() {
        stats.record_underrun();
    }
    if scheduled.started_turn {
        state.apply(SessionEvent::AgentAudio);
    }
    debug!(
        id = scheduled.id.0,
        start_ms = scheduled.start_at.as_millis() as u64,
        "scheduled agent frame"
    );
    Ok(())
}
