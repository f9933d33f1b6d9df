//! MedPredict Live: real-time duplex voice consult with a remote agent.
//!
//! The microphone is streamed to a conversational agent while the agent's
//! synthesized speech is played back without gaps or overlaps:
//!
//! ```text
//! Microphone -> FrameAssembler -> PCM16 encode -> Session link
//! Session link -> PCM16 decode -> PlaybackScheduler -> Speaker
//! ```
//!
//! # Architecture
//!
//! - **Audio**: `cpal` capture and a timeline-driven output stream behind
//!   the [`audio::AudioBackend`] seam
//! - **Link**: the Gemini Live WebSocket protocol behind
//!   [`link::LinkConnector`]
//! - **Session**: [`LiveSession`] runs one capture task and one playback
//!   task and publishes [`SessionState`] transitions

pub mod audio;
pub mod config;
pub mod error;
pub mod link;
pub mod session;

pub use audio::codec::{AudioFrame, CodecError, EncodedChunk};
pub use config::LiveConfig;
pub use error::{LiveError, Result};
pub use session::LiveSession;
pub use session::state::{CloseReason, SessionState};
pub use session::stats::SessionStatsSnapshot;
