/*
 * Conversation Graph Engine - Live WebSocket Ingress
 * Copyright (c) 2026 Conversation Graph Engine Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

//! `/ws/transcripts` — one connection per session. The first message must
//! be `session_meta`; everything after that is audio frames, optional
//! forwarded transcript events (for clients that run their own STT),
//! explicit flush/close requests, or nothing at all while the client just
//! listens for fan-out events. A read-half task and a write-half task are
//! joined by the session's own hub subscription, matching the pack's
//! realtime-voice handler shape.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{LlmConfigOverride, SttConfigOverride};
use crate::error::ProtocolError;
use crate::ingress::{authorized, new_session_id, AppState};
use crate::registry::SessionHandle;
use crate::session::spawn_session;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    SessionMeta {
        #[serde(default)]
        speaker_default: Option<String>,
        #[serde(default)]
        store_audio: bool,
        #[serde(default)]
        stt: Option<SttConfigOverride>,
        #[serde(default)]
        llm: Option<LlmConfigOverride>,
    },
    AudioFrame {
        /// Base64-encoded raw 16 kHz mono 16-bit PCM.
        data: String,
    },
    TranscriptEvent {
        event: Box<crate::types::TranscriptEvent>,
    },
    Flush,
    Close,
}

pub async fn upgrade(State(state): State<AppState>, headers: HeaderMap, ws: WebSocketUpgrade) -> Response {
    let auth_header = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    if !authorized(&state, auth_header) {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let session_id = new_session_id();

    // First message must be `session_meta`, per the NEW -> META_RECEIVED
    // transition; anything else closes the connection immediately.
    let first = match socket.recv().await {
        Some(Ok(Message::Text(text))) => text,
        _ => {
            let _ = send_protocol_error(&mut socket, ProtocolError::MissingSessionMeta).await;
            return;
        }
    };

    let meta = match serde_json::from_str::<ClientMessage>(&first) {
        Ok(ClientMessage::SessionMeta { speaker_default, store_audio, stt, llm }) => {
            (speaker_default.unwrap_or_else(|| "SPEAKER_00".to_string()), store_audio, stt, llm)
        }
        _ => {
            let _ = send_protocol_error(&mut socket, ProtocolError::MissingSessionMeta).await;
            return;
        }
    };

    let handle = spawn_session(
        session_id,
        state.config.clone(),
        state.store.clone(),
        state.limits.clone(),
        CancellationToken::new(),
    );
    state.registry.insert(handle.clone());
    let _ = handle.push_session_meta(meta.0, meta.1, meta.2, meta.3);

    let subscriber = match handle.subscribe(0).await {
        Ok(rx) => rx,
        Err(_) => {
            state.registry.remove(session_id);
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();

    let write_task = tokio::spawn(async move {
        let mut subscriber = subscriber;
        while let Some(event) = subscriber.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(t) => t,
                Err(_) => continue,
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => {
                if !dispatch_client_message(&text, &handle, session_id).await {
                    break;
                }
            }
            Message::Binary(bytes) => {
                let _ = handle.push_audio(bytes, std::time::Instant::now());
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    handle.close(std::time::Duration::from_secs(state.config.drain_timeout_seconds)).await;
    state.registry.remove(session_id);
    write_task.abort();
}

async fn dispatch_client_message(text: &str, handle: &SessionHandle, session_id: Uuid) -> bool {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::AudioFrame { data }) => {
            match base64::engine::general_purpose::STANDARD.decode(data) {
                Ok(bytes) => {
                    let _ = handle.push_audio(bytes, std::time::Instant::now());
                }
                Err(_) => tracing::warn!(session_id = %session_id, "dropped malformed base64 audio frame"),
            }
            true
        }
        Ok(ClientMessage::TranscriptEvent { event }) => {
            let _ = handle.push_transcript_event(*event);
            true
        }
        Ok(ClientMessage::Flush) => {
            let _ = handle.request_flush();
            true
        }
        Ok(ClientMessage::Close) => false,
        Ok(ClientMessage::SessionMeta { .. }) => true,
        Err(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "malformed client message");
            true
        }
    }
}

async fn send_protocol_error(socket: &mut WebSocket, err: ProtocolError) -> Result<(), axum::Error> {
    let payload = serde_json::json!({"event_type": "processing_status", "data": {"level": "error", "message": err.to_string(), "stage": "protocol"}});
    socket.send(Message::Text(payload.to_string())).await
}
