/*
 * Conversation Graph Engine - File Upload SSE Ingress
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

//! `POST /api/import/process-file` — uploads an audio file or an
//! already-transcribed export (VTT/SRT/plain text) and streams processing
//! progress back as Server-Sent Events, grounded on the pack's
//! `axum::response::sse::{Event, KeepAlive, Sse}` reference handler.
//! Detects client disconnect mid-stream and stops issuing further work for
//! that session rather than continuing to burn LLM/STT calls into a void.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Multipart, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::stream::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::ingress::{authorized, new_session_id, AppState};
use crate::session::spawn_session;
use crate::types::{TranscriptEvent, TranscriptKind, TranscriptMetadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceType {
    Audio,
    Text,
    Vtt,
    Srt,
    GoogleMeet,
}

fn detect_source_type(declared: Option<&str>, filename: &str) -> SourceType {
    match declared {
        Some("audio") => return SourceType::Audio,
        Some("text") => return SourceType::Text,
        Some("vtt") => return SourceType::Vtt,
        Some("srt") => return SourceType::Srt,
        // Google Meet's own export is plain text with speaker-prefixed
        // lines; treated the same as a plain-text transcript.
        Some("google_meet") => return SourceType::GoogleMeet,
        _ => {}
    }
    let lower = filename.to_ascii_lowercase();
    if lower.ends_with(".vtt") {
        SourceType::Vtt
    } else if lower.ends_with(".srt") {
        SourceType::Srt
    } else if lower.ends_with(".wav") || lower.ends_with(".mp3") || lower.ends_with(".m4a") || lower.ends_with(".flac") {
        SourceType::Audio
    } else {
        SourceType::Text
    }
}

/// Strips VTT/SRT cue numbering and timestamp lines, keeping only the
/// spoken text, one cue per line. Plain string splitting: the formats are
/// simple enough that no crate in the pack specializes in them.
fn extract_cue_text(body: &str) -> Vec<String> {
    body.lines()
        .map(str::trim)
        .filter(|line| {
            !line.is_empty()
                && *line != "WEBVTT"
                && !line.contains("-->")
                && line.parse::<u64>().is_err()
        })
        .map(str::to_string)
        .collect()
}

pub async fn process_file(State(state): State<AppState>, headers: HeaderMap, mut multipart: Multipart) -> Response {
    let auth_header = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    if !authorized(&state, auth_header) {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }

    let mut filename = String::new();
    let mut declared_type: Option<String> = None;
    let mut bytes: Vec<u8> = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(f)) => f,
            Ok(None) => break,
            Err(_) => return (StatusCode::BAD_REQUEST, "malformed multipart body").into_response(),
        };
        match field.name() {
            Some("source_type") => {
                declared_type = field.text().await.ok();
            }
            Some("file") => {
                filename = field.file_name().unwrap_or("upload").to_string();
                bytes = match field.bytes().await {
                    Ok(b) => b.to_vec(),
                    Err(_) => return (StatusCode::BAD_REQUEST, "could not read upload").into_response(),
                };
            }
            _ => {}
        }
    }

    if bytes.len() > state.config.max_body_bytes {
        return (StatusCode::PAYLOAD_TOO_LARGE, "file exceeds max_body_bytes").into_response();
    }
    if bytes.is_empty() {
        return (StatusCode::BAD_REQUEST, "no file field in upload").into_response();
    }

    let source_type = detect_source_type(declared_type.as_deref(), &filename);
    let session_id = new_session_id();
    let (event_tx, event_rx) = mpsc::channel::<Event>(64);

    let handle = spawn_session(
        session_id,
        state.config.clone(),
        state.store.clone(),
        state.limits.clone(),
        CancellationToken::new(),
    );
    state.registry.insert(handle.clone());
    let _ = handle.push_session_meta("SPEAKER_00".to_string(), false, None, None);

    let subscriber = match handle.subscribe(0).await {
        Ok(rx) => rx,
        Err(_) => {
            state.registry.remove(session_id);
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed to start session").into_response();
        }
    };

    tokio::spawn(forward_hub_to_sse(subscriber, event_tx.clone()));
    tokio::spawn(drive_file(session_id, source_type, filename, bytes, handle.clone(), state, event_tx));

    let stream: ReceiverStream<Event> = ReceiverStream::new(event_rx);
    Sse::new(stream.map(Ok::<Event, Infallible>)).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))).into_response()
}

async fn forward_hub_to_sse(mut subscriber: mpsc::Receiver<crate::hub::HubEvent>, tx: mpsc::Sender<Event>) {
    while let Some(hub_event) = subscriber.recv().await {
        let Ok(json) = serde_json::to_string(&hub_event) else { continue };
        // `send` (not `try_send`): client disconnect is detected here via
        // the receiver being dropped, which is the signal to stop pushing
        // further work for this session (Scenario 6).
        if tx.send(Event::default().data(json)).await.is_err() {
            break;
        }
    }
}

/// A synthetic status frame sent straight onto `event_tx`, ahead of
/// anything the session's own `Hub` has to say — the upload/analyze steps
/// happen before a session even has transcript events to publish about.
async fn send_status(event_tx: &mpsc::Sender<Event>, stage: &str, extra: serde_json::Value) -> bool {
    let mut data = serde_json::json!({"level": "info", "stage": stage});
    if let (Some(obj), Some(extra_obj)) = (data.as_object_mut(), extra.as_object()) {
        obj.extend(extra_obj.clone());
    }
    let payload = serde_json::json!({"event_type": "processing_status", "data": data});
    event_tx.send(Event::default().data(payload.to_string())).await.is_ok()
}

async fn drive_file(
    session_id: Uuid,
    source_type: SourceType,
    filename: String,
    bytes: Vec<u8>,
    handle: crate::registry::SessionHandle,
    state: AppState,
    event_tx: mpsc::Sender<Event>,
) {
    if !send_status(&event_tx, "upload", serde_json::json!({})).await {
        return;
    }

    match source_type {
        SourceType::Audio => {
            if event_tx.is_closed() {
                return;
            }
            if !send_status(&event_tx, "analyze", serde_json::json!({"chunks_total": 1})).await {
                return;
            }
            // One-shot mode: a single POST of the whole file, no VAD, no
            // rolling buffer — pushing the raw bytes through the live
            // `SttDriver`/`AudioBuffer` pipeline would truncate anything
            // past its two-second cap and bound the call by the live
            // timeout instead of `timeout_seconds_file`.
            match crate::stt::transcribe_file(&state.config.stt, bytes, &filename).await {
                Ok(result) if !result.text.trim().is_empty() => {
                    let event = TranscriptEvent {
                        event_id: Uuid::new_v4(),
                        session_id,
                        conversation_id: Uuid::nil(),
                        sequence_number: 0,
                        kind: TranscriptKind::Final,
                        text: result.text,
                        speaker_id: None,
                        speaker_confidence: None,
                        diarization_version: 1,
                        word_timings: None,
                        segment_start_ms: 0,
                        segment_end_ms: 0,
                        received_at: chrono::Utc::now(),
                        metadata: TranscriptMetadata::default(),
                    };
                    let _ = handle.push_transcript_event(event);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, stage = "transcribe", "one-shot file transcription failed");
                }
            }
        }
        SourceType::Text | SourceType::Vtt | SourceType::Srt | SourceType::GoogleMeet => {
            let text = String::from_utf8_lossy(&bytes).to_string();
            let lines = if source_type == SourceType::Vtt || source_type == SourceType::Srt {
                extract_cue_text(&text)
            } else {
                text.lines().map(str::to_string).filter(|l| !l.trim().is_empty()).collect::<Vec<_>>()
            };

            if !send_status(&event_tx, "analyze", serde_json::json!({"chunks_total": lines.len()})).await {
                return;
            }

            for (i, line) in lines.into_iter().enumerate() {
                if event_tx.is_closed() {
                    tracing::info!(session_id = %session_id, "client disconnected mid-upload, stopping further processing");
                    break;
                }
                let event = TranscriptEvent {
                    event_id: Uuid::new_v4(),
                    session_id,
                    conversation_id: Uuid::nil(),
                    sequence_number: i as u64,
                    kind: TranscriptKind::Final,
                    text: line,
                    speaker_id: None,
                    speaker_confidence: None,
                    diarization_version: 1,
                    word_timings: None,
                    segment_start_ms: 0,
                    segment_end_ms: 0,
                    received_at: chrono::Utc::now(),
                    metadata: TranscriptMetadata::default(),
                };
                if handle.push_transcript_event(event).is_err() {
                    break;
                }
            }
        }
    }

    handle.close(std::time::Duration::from_secs(state.config.drain_timeout_seconds)).await;
    state.registry.remove(session_id);
}

use futures::StreamExt;
