//! Gemini Live session link over WebSocket.
//!
//! The session opens with a `setup` message declaring the model, an audio
//! response modality and the system instruction, and is ready once the
//! server answers `setupComplete`. Capture chunks then stream out as
//! `realtimeInput` media chunks while `serverContent` messages stream agent
//! speech back as inline PCM data.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use super::{LinkConnector, LinkEndpoint, LinkEvent, LinkHandle};
use crate::audio::codec::{EncodedChunk, pcm_mime_type};
use crate::config::LinkConfig;
use crate::error::{LiveError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Inbound rate assumed when a chunk arrives without a mime tag.
const DEFAULT_OUTPUT_RATE: u32 = 24_000;

// ---------------------------------------------------------------------------
// Protocol types
// ---------------------------------------------------------------------------

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup {
    model: String,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
struct Content {
    parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize)]
struct TextPart {
    text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    media_chunks: Vec<MediaChunk>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaChunk {
    mime_type: String,
    data: String,
}

/// Messages received from the server. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    #[serde(default)]
    setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    server_content: Option<ServerContent>,
    #[serde(default)]
    go_away: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    #[serde(default)]
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    interrupted: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default)]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: Option<String>,
    data: String,
}

impl ClientMessage {
    fn setup(config: &LinkConfig) -> Self {
        let model = if config.model.starts_with("models/") {
            config.model.clone()
        } else {
            format!("models/{}", config.model)
        };
        let system_instruction = (!config.system_instruction.trim().is_empty()).then(|| Content {
            parts: vec![TextPart {
                text: config.system_instruction.clone(),
            }],
        });
        Self::Setup(Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_owned()],
            },
            system_instruction,
        })
    }

    fn audio(chunk: EncodedChunk) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: vec![MediaChunk {
                mime_type: chunk.mime_type,
                data: chunk.data,
            }],
        })
    }
}

/// Translate one server payload into link events, in message order.
fn translate_server_message(payload: &[u8]) -> Vec<LinkEvent> {
    let msg: ServerMessage = match serde_json::from_slice(payload) {
        Ok(m) => m,
        Err(e) => {
            debug!("ignoring unparseable server message: {e}");
            return Vec::new();
        }
    };

    if msg.go_away.is_some() {
        warn!("agent announced it will close the session soon");
    }

    let mut events = Vec::new();
    if let Some(content) = msg.server_content {
        if content.interrupted {
            events.push(LinkEvent::Interrupted);
        }
        let parts = content.model_turn.map(|turn| turn.parts).unwrap_or_default();
        for inline in parts.into_iter().filter_map(|part| part.inline_data) {
            let mime_type = inline
                .mime_type
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| pcm_mime_type(DEFAULT_OUTPUT_RATE));
            events.push(LinkEvent::Audio(EncodedChunk::new(inline.data, mime_type)));
        }
        if content.turn_complete {
            events.push(LinkEvent::TurnComplete);
        }
    }
    events
}

fn is_setup_complete(payload: &[u8]) -> bool {
    serde_json::from_slice::<ServerMessage>(payload)
        .map(|m| m.setup_complete.is_some())
        .unwrap_or(false)
}

/// Append the API key to the endpoint as the `key` query parameter.
fn endpoint_url(endpoint: &str, api_key: &str) -> Result<url::Url> {
    let mut url = url::Url::parse(endpoint)
        .map_err(|e| LiveError::Link(format!("invalid endpoint '{endpoint}': {e}")))?;
    url.query_pairs_mut().append_pair("key", api_key);
    Ok(url)
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Opens live sessions with the Gemini bidirectional streaming endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeminiLiveConnector;

#[async_trait]
impl LinkConnector for GeminiLiveConnector {
    async fn open(&self, config: &LinkConfig) -> Result<LinkHandle> {
        let api_key = config.resolve_api_key().ok_or_else(|| {
            LiveError::Link("no API key configured (set GEMINI_API_KEY or API_KEY)".into())
        })?;
        let url = endpoint_url(&config.endpoint, &api_key)?;
        let open_timeout = Duration::from_secs(config.open_timeout_secs);

        let (mut ws, _) = tokio::time::timeout(open_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| LiveError::Link("timed out connecting to agent".into()))?
            .map_err(|e| LiveError::Link(format!("connect: {e}")))?;

        let setup = serde_json::to_string(&ClientMessage::setup(config))
            .map_err(|e| LiveError::Link(format!("encode setup: {e}")))?;
        ws.send(Message::Text(setup))
            .await
            .map_err(|e| LiveError::Link(format!("send setup: {e}")))?;

        tokio::time::timeout(open_timeout, await_setup_complete(&mut ws))
            .await
            .map_err(|_| LiveError::Link("timed out waiting for session setup".into()))??;

        info!(model = %config.model, "live agent session open");

        let (handle, endpoint) = LinkHandle::pair(
            config.outbound_capacity,
            Duration::from_millis(config.close_timeout_ms),
        );
        let task = tokio::spawn(run_io(ws, endpoint));
        Ok(handle.with_task(task))
    }
}

/// Read until the server confirms setup.
async fn await_setup_complete(ws: &mut WsStream) -> Result<()> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) if is_setup_complete(text.as_bytes()) => return Ok(()),
            Some(Ok(Message::Binary(bytes))) if is_setup_complete(&bytes) => return Ok(()),
            Some(Ok(Message::Close(frame))) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "no reason given".into());
                return Err(LiveError::Link(format!("agent refused session: {reason}")));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(LiveError::Link(format!("read during setup: {e}"))),
            None => return Err(LiveError::Link("connection closed during setup".into())),
        }
    }
}

/// Pump frames between the socket and the session until either side closes.
async fn run_io(ws: WsStream, endpoint: LinkEndpoint) {
    let LinkEndpoint {
        mut outbound,
        events,
        cancel,
    } = endpoint;
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            // Inbound from the agent.
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        for event in translate_server_message(text.as_bytes()) {
                            let _ = events.send(event);
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        for event in translate_server_message(&bytes) {
                            let _ = events.send(event);
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty());
                        let _ = events.send(LinkEvent::Closed(reason));
                        break;
                    }
                    None => {
                        let _ = events.send(LinkEvent::Closed(None));
                        break;
                    }
                    Some(Err(e)) => {
                        let _ = events.send(LinkEvent::Error(format!("read error: {e}")));
                        break;
                    }
                    _ => {} // Ping/Pong frames handled by tungstenite.
                }
            }
            // Outbound from the capture pipeline.
            chunk = outbound.recv() => {
                let Some(chunk) = chunk else { break };
                let json = match serde_json::to_string(&ClientMessage::audio(chunk)) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("failed to encode audio message: {e}");
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    let _ = events.send(LinkEvent::Error(format!("send error: {e}")));
                    break;
                }
            }
        }
    }

    cancel.cancel();
    debug!("session link task finished");
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn setup_message_declares_audio_modality() {
        let config = LinkConfig {
            model: "gemini-test".into(),
            system_instruction: "Be brief.".into(),
            ..LinkConfig::default()
        };
        let json: serde_json::Value =
            serde_json::to_value(ClientMessage::setup(&config)).unwrap();

        assert_eq!(json["setup"]["model"], "models/gemini-test");
        assert_eq!(
            json["setup"]["generationConfig"]["responseModalities"],
            serde_json::json!(["AUDIO"])
        );
        assert_eq!(
            json["setup"]["systemInstruction"]["parts"][0]["text"],
            "Be brief."
        );
    }

    #[test]
    fn setup_omits_blank_instruction_and_keeps_prefixed_model() {
        let config = LinkConfig {
            model: "models/already-prefixed".into(),
            system_instruction: "  ".into(),
            ..LinkConfig::default()
        };
        let json = serde_json::to_value(ClientMessage::setup(&config)).unwrap();
        assert_eq!(json["setup"]["model"], "models/already-prefixed");
        assert!(json["setup"].get("systemInstruction").is_none());
    }

    #[test]
    fn audio_message_carries_mime_and_data() {
        let msg = ClientMessage::audio(EncodedChunk::new("AAEC", "audio/pcm;rate=16000"));
        let json = serde_json::to_value(msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "realtimeInput": {
                    "mediaChunks": [{ "mimeType": "audio/pcm;rate=16000", "data": "AAEC" }]
                }
            })
        );
    }

    #[test]
    fn model_turn_parts_become_audio_events_in_order() {
        let payload = br#"{
            "serverContent": {
                "modelTurn": { "parts": [
                    { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "AAAA" } },
                    { "text": "ignored" },
                    { "inlineData": { "data": "BBBB" } }
                ]},
                "turnComplete": true
            }
        }"#;

        let events = translate_server_message(payload);
        assert_eq!(
            events,
            vec![
                LinkEvent::Audio(EncodedChunk::new("AAAA", "audio/pcm;rate=24000")),
                LinkEvent::Audio(EncodedChunk::new("BBBB", "audio/pcm;rate=24000")),
                LinkEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn interrupted_is_reported_before_audio() {
        let payload = br#"{ "serverContent": { "interrupted": true } }"#;
        assert_eq!(
            translate_server_message(payload),
            vec![LinkEvent::Interrupted]
        );
    }

    #[test]
    fn garbage_and_unknown_messages_yield_nothing() {
        assert!(translate_server_message(b"not json").is_empty());
        assert!(translate_server_message(br#"{"usageMetadata": {"totalTokenCount": 3}}"#).is_empty());
    }

    #[test]
    fn setup_complete_detection() {
        assert!(is_setup_complete(br#"{"setupComplete": {}}"#));
        assert!(!is_setup_complete(br#"{"serverContent": {}}"#));
        assert!(!is_setup_complete(b"{"));
    }

    #[test]
    fn endpoint_url_appends_key() {
        let url = endpoint_url("wss://example.test/ws/live", "abc 123").unwrap();
        assert_eq!(url.as_str(), "wss://example.test/ws/live?key=abc+123");
        assert!(endpoint_url("not a url", "k").is_err());
    }

    #[tokio::test]
    async fn open_without_api_key_fails_fast() {
        let config = LinkConfig {
            api_key: Some(String::new()),
            endpoint: "ws://127.0.0.1:9/unused".into(),
            ..LinkConfig::default()
        };
        // Only meaningful when neither fallback variable is set.
        if crate::config::API_KEY_ENV_VARS
            .iter()
            .any(|var| std::env::var(var).is_ok())
        {
            return;
        }
        let err = GeminiLiveConnector.open(&config).await.err().unwrap();
        assert!(matches!(err, LiveError::Link(msg) if msg.contains("API key")));
    }
}
