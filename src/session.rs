/*
 * Conversation Graph Engine - Session Owner Task
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

//! The single task that owns one session end to end: it is the only
//! writer of that session's `AudioBuffer`, diarization window,
//! accumulator, and running graph (the ownership rule in the data model).
//! Everything else — ingress adapters, the registry — only ever talks to
//! it through the bounded channels in `SessionHandle`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::accumulator::Accumulator;
use crate::config::{AppConfig, LlmConfigOverride, SttConfigOverride};
use crate::diarize::DiarizationReconciler;
use crate::graph::GraphBuilder;
use crate::http_clients::OutboundLimits;
use crate::hub::{Hub, HubEvent, HubPayload, StatusLevel};
use crate::registry::SessionHandle;
use crate::store::EventStore;
use crate::stt::{FlushReason, SttDriver};
use crate::types::{Chunk, TranscriptEvent, TranscriptKind, TranscriptMetadata};

/// Messages a `SessionHandle` can deliver into the owner task. Everything
/// here is either fire-and-forget (bounded, drops on backpressure from the
/// caller's side) or a request/reply pair via a oneshot channel.
pub enum SessionInbound {
    SessionMeta {
        speaker_default: String,
        store_audio: bool,
        stt_override: Option<SttConfigOverride>,
        llm_override: Option<LlmConfigOverride>,
    },
    AudioFrame {
        frame_bytes: Vec<u8>,
        t_received: Instant,
    },
    ForwardedTranscript(Box<TranscriptEvent>),
    FlushRequested,
    Subscribe {
        since_seq: u64,
        reply: oneshot::Sender<mpsc::Receiver<HubEvent>>,
    },
    CloseRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    New,
    MetaReceived,
    Running,
    Draining,
    Closed,
    Failed,
}

/// Internal-only event produced by a spawned LLM call once it completes,
/// looped back into the owner task's own select so the run loop never
/// blocks waiting on a call that may coalesce more chunks in the meantime.
enum LlmOutcome {
    /// `corrective` is `true` when this call was itself the one-shot retry
    /// issued after a prior malformed response, so a second malformed
    /// response is never retried again.
    Success { content: String, corrective: bool },
    Failure,
}

const IDLE_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Spawns the owner task for a brand-new session and returns the handle
/// other code uses to talk to it.
pub fn spawn_session(
    session_id: Uuid,
    app_config: Arc<AppConfig>,
    store: EventStore,
    limits: OutboundLimits,
    registry_cancel_parent: CancellationToken,
) -> SessionHandle {
    let (inbound_tx, inbound_rx) = mpsc::channel(crate::registry::audio_queue_capacity());
    let cancel = registry_cancel_parent.child_token();
    let handle = SessionHandle::new(session_id, inbound_tx, cancel.clone());

    tokio::spawn(run_session(session_id, app_config, store, limits, cancel, inbound_rx));

    handle
}

async fn run_session(
    session_id: Uuid,
    app_config: Arc<AppConfig>,
    store: EventStore,
    limits: OutboundLimits,
    cancel: CancellationToken,
    mut inbound_rx: mpsc::Receiver<SessionInbound>,
) {
    let mut state = SessionState::New;
    let mut hub = Hub::new(session_id);
    let mut sequence_number: u64 = 0;
    let conversation_id = Uuid::new_v4();
    let mut speaker_default = "SPEAKER_00".to_string();
    // The session owner is the sole issuer of transcript event sequence
    // numbers; the store only double-checks monotonicity, it does not
    // assign them (spec's "the store just checks... or rejects").
    let mut event_sequence: u64 = 0;

    let mut stt = SttDriver::new(app_config.stt.clone());
    let mut diarizer = DiarizationReconciler::new(app_config.diarization.clone());
    let mut accumulator = Accumulator::new(session_id, app_config.accumulator.clone());
    let mut graph = GraphBuilder::new(conversation_id, app_config.llm.clone());

    let (llm_done_tx, mut llm_done_rx) = mpsc::channel::<LlmOutcome>(4);
    let mut idle_ticker = tokio::time::interval(IDLE_CHECK_INTERVAL);

    if let Err(e) = store
        .ensure_conversation(&crate::types::Conversation {
            conversation_id,
            source_type: "live".into(),
            participants: vec![],
            started_at: chrono::Utc::now(),
            event_count: 0,
            node_count: 0,
        })
        .await
    {
        tracing::error!(session_id = %session_id, error = %e, "failed to create conversation row");
        return;
    }
    state = SessionState::Running;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                break;
            }

            maybe_msg = inbound_rx.recv() => {
                match maybe_msg {
                    Some(msg) => {
                        if !handle_inbound(
                            msg,
                            session_id,
                            conversation_id,
                            &store,
                            &mut hub,
                            &mut sequence_number,
                            &mut event_sequence,
                            &app_config,
                            &mut speaker_default,
                            &mut stt,
                            &mut diarizer,
                            &mut accumulator,
                            &mut graph,
                            &limits,
                            &llm_done_tx,
                            &mut state,
                        ).await {
                            break;
                        }
                    }
                    None => break,
                }
            }

            Some(outcome) = llm_done_rx.recv() => {
                handle_llm_outcome(
                    outcome,
                    session_id,
                    &store,
                    &mut hub,
                    &mut sequence_number,
                    &mut graph,
                    &limits,
                    &llm_done_tx,
                ).await;
            }

            _ = idle_ticker.tick() => {
                maybe_flush_stt(
                    session_id, conversation_id, &store, &mut hub, &mut sequence_number, &mut event_sequence,
                    &speaker_default, &mut stt, &mut diarizer, &mut accumulator, &mut graph, &limits, &llm_done_tx,
                ).await;

                if let Some(chunk) = accumulator.check_idle() {
                    enqueue_chunk(session_id, chunk, &mut graph, &limits, &llm_done_tx, &mut hub, &mut sequence_number).await;
                } else if accumulator.is_idle_overdue() {
                    publish(&mut hub, &mut sequence_number, HubPayload::ProcessingStatus {
                        level: StatusLevel::Info,
                        message: "waiting for more transcript".into(),
                        stage: "waiting".into(),
                    });
                }
            }
        }

        if state == SessionState::Draining && graph.is_in_flight() {
            // T_cancel_grace: let an in-flight call complete so its output
            // is persisted, but abort it if it has already run past the
            // grace window rather than wait on it indefinitely.
            if let Some(elapsed) = graph.call_elapsed() {
                if elapsed >= Duration::from_secs(app_config.cancel_grace_seconds) {
                    tracing::warn!(session_id = %session_id, ?elapsed, "aborting in-flight llm call past cancel grace period");
                    graph.abort_in_flight();
                    publish(&mut hub, &mut sequence_number, HubPayload::ProcessingStatus {
                        level: StatusLevel::Warning,
                        message: "llm call aborted after shutdown grace period elapsed".into(),
                        stage: "graph".into(),
                    });
                }
            }
        }

        if state == SessionState::Draining && !graph.is_in_flight() {
            publish(&mut hub, &mut sequence_number, HubPayload::Done {
                conversation_id,
                node_count: graph.nodes().len() as u64,
            });
            break;
        }
    }

    diarizer.stop();
    state = if state == SessionState::Failed { SessionState::Failed } else { SessionState::Closed };
    tracing::info!(session_id = %session_id, final_state = ?state, "session owner task exiting");
}

#[allow(clippy::too_many_arguments)]
async fn handle_inbound(
    msg: SessionInbound,
    session_id: Uuid,
    conversation_id: Uuid,
    store: &EventStore,
    hub: &mut Hub,
    sequence_number: &mut u64,
    event_sequence: &mut u64,
    app_config: &Arc<AppConfig>,
    speaker_default: &mut String,
    stt: &mut SttDriver,
    diarizer: &mut DiarizationReconciler,
    accumulator: &mut Accumulator,
    graph: &mut GraphBuilder,
    limits: &OutboundLimits,
    llm_done_tx: &mpsc::Sender<LlmOutcome>,
    state: &mut SessionState,
) -> bool {
    match msg {
        SessionInbound::SessionMeta { speaker_default: default, store_audio: _, stt_override, llm_override } => {
            *speaker_default = default;
            *stt = SttDriver::new(app_config.stt.overlay(stt_override.as_ref()));
            *graph = GraphBuilder::new(graph.conversation_id(), app_config.llm.overlay(llm_override.as_ref()));
            true
        }
        SessionInbound::AudioFrame { frame_bytes, .. } => {
            let overflowed = stt.push_frame(&frame_bytes);
            if overflowed {
                tracing::warn!(session_id = %session_id, "audio buffer overflow, dropped oldest frame");
            }
            maybe_flush_stt(
                session_id, conversation_id, store, hub, sequence_number, event_sequence, speaker_default,
                stt, diarizer, accumulator, graph, limits, llm_done_tx,
            )
            .await;
            true
        }
        SessionInbound::ForwardedTranscript(mut event) => {
            // The session owner is the sole authority on which conversation
            // this session belongs to and the sole issuer of sequence
            // numbers; a forwarded event's own fields are whatever the
            // ingress adapter happened to fill in before the session
            // owned it.
            event.conversation_id = conversation_id;
            *event_sequence += 1;
            event.sequence_number = *event_sequence;
            if let Err(e) = store.append_transcript_event(&event).await {
                tracing::error!(session_id = %session_id, error = %e, "failed to persist forwarded transcript event");
            }
            emit_transcript(hub, sequence_number, &event);
            if event.kind == TranscriptKind::Final {
                if let Some(chunk) = accumulator.push_final(event.event_id, event.speaker_id.clone(), event.text.clone()) {
                    enqueue_chunk(session_id, chunk, graph, limits, llm_done_tx, hub, sequence_number).await;
                }
            }
            true
        }
        SessionInbound::FlushRequested => {
            force_flush_stt(
                session_id, conversation_id, store, hub, sequence_number, event_sequence, speaker_default,
                stt, diarizer, accumulator, graph, limits, llm_done_tx,
            )
            .await;
            true
        }
        SessionInbound::Subscribe { since_seq, reply } => {
            let (_id, rx) = hub.subscribe(since_seq);
            let _ = reply.send(rx);
            true
        }
        SessionInbound::CloseRequested => {
            *state = SessionState::Draining;
            force_flush_stt(
                session_id, conversation_id, store, hub, sequence_number, event_sequence, speaker_default,
                stt, diarizer, accumulator, graph, limits, llm_done_tx,
            )
            .await;
            // Keep the loop running even if a call is now in flight: the
            // post-select Draining check races it against T_cancel_grace
            // and the `llm_done_rx` branch still needs to be polled so a
            // call that settles in time is merged rather than dropped.
            true
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn maybe_flush_stt(
    session_id: Uuid,
    conversation_id: Uuid,
    store: &EventStore,
    hub: &mut Hub,
    sequence_number: &mut u64,
    event_sequence: &mut u64,
    speaker_default: &str,
    stt: &mut SttDriver,
    diarizer: &mut DiarizationReconciler,
    accumulator: &mut Accumulator,
    graph: &mut GraphBuilder,
    limits: &OutboundLimits,
    llm_done_tx: &mpsc::Sender<LlmOutcome>,
) {
    let reason = stt.should_flush();
    if let Some(reason) = reason {
        run_flush(
            session_id, conversation_id, store, hub, sequence_number, event_sequence, speaker_default, stt,
            diarizer, accumulator, graph, limits, llm_done_tx, reason,
        )
        .await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn force_flush_stt(
    session_id: Uuid,
    conversation_id: Uuid,
    store: &EventStore,
    hub: &mut Hub,
    sequence_number: &mut u64,
    event_sequence: &mut u64,
    speaker_default: &str,
    stt: &mut SttDriver,
    diarizer: &mut DiarizationReconciler,
    accumulator: &mut Accumulator,
    graph: &mut GraphBuilder,
    limits: &OutboundLimits,
    llm_done_tx: &mpsc::Sender<LlmOutcome>,
) {
    run_flush(
        session_id, conversation_id, store, hub, sequence_number, event_sequence, speaker_default, stt,
        diarizer, accumulator, graph, limits, llm_done_tx, FlushReason::SessionClose,
    )
    .await;
}

#[allow(clippy::too_many_arguments)]
async fn run_flush(
    session_id: Uuid,
    conversation_id: Uuid,
    store: &EventStore,
    hub: &mut Hub,
    sequence_number: &mut u64,
    event_sequence: &mut u64,
    speaker_default: &str,
    stt: &mut SttDriver,
    diarizer: &mut DiarizationReconciler,
    accumulator: &mut Accumulator,
    graph: &mut GraphBuilder,
    limits: &OutboundLimits,
    llm_done_tx: &mpsc::Sender<LlmOutcome>,
    _reason: FlushReason,
) {
    let timeout = Duration::from_secs(10);
    let result = match stt.flush(timeout).await {
        Ok(Some(r)) => r,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!(session_id = %session_id, error = %e, stage = "transcribe", "stt flush failed, continuing");
            publish(hub, sequence_number, HubPayload::ProcessingStatus {
                level: StatusLevel::Warning,
                message: format!("transcription failed: {e}"),
                stage: "transcribe".into(),
            });
            return;
        }
    };

    if result.text.trim().is_empty() {
        // Empty transcript from the provider: the flush is a no-op, no
        // event recorded.
        return;
    }

    let event_id = Uuid::new_v4();
    let (speaker_id, speaker_confidence) = result
        .segments
        .as_ref()
        .and_then(|s| s.first())
        .map(|s| (s.speaker.clone(), Some(1.0_f32)))
        .unwrap_or_else(|| (Some(speaker_default.to_string()), None));

    *event_sequence += 1;
    let event = TranscriptEvent {
        event_id,
        session_id,
        conversation_id,
        sequence_number: *event_sequence,
        kind: TranscriptKind::Final,
        text: result.text.clone(),
        speaker_id: speaker_id.clone(),
        speaker_confidence,
        diarization_version: 1,
        word_timings: None,
        segment_start_ms: 0,
        segment_end_ms: 0,
        received_at: chrono::Utc::now(),
        metadata: TranscriptMetadata { provider: None, model: None, latency_ms: Some(result.provider_latency_ms) },
    };

    if let Err(e) = store.append_transcript_event(&event).await {
        tracing::error!(session_id = %session_id, error = %e, stage = "persist", "failed to persist transcript event");
        publish(hub, sequence_number, HubPayload::ProcessingStatus {
            level: StatusLevel::Error,
            message: format!("persistence failure: {e}"),
            stage: "persist".into(),
        });
    }
    emit_transcript(hub, sequence_number, &event);

    diarizer.track(event_id, event.segment_start_ms, event.segment_end_ms, speaker_id.clone());
    if let Some(segments) = result.segments.as_ref() {
        let reconciliation = diarizer.reconcile(segments);
        for update in reconciliation.updates {
            if let Err(e) = store.append_speaker_update(&update).await {
                tracing::error!(session_id = %session_id, error = %e, "failed to persist speaker update");
            }
            publish(hub, sequence_number, HubPayload::SpeakerUpdate {
                event_id: update.event_id,
                speaker_id: update.new_speaker_id,
                confidence: update.new_confidence,
                diarization_version: update.diarization_version,
            });
        }
    }

    if let Some(chunk) = accumulator.push_final(event_id, speaker_id, result.text) {
        enqueue_chunk(session_id, chunk, graph, limits, llm_done_tx, hub, sequence_number).await;
    }
}

fn emit_transcript(hub: &mut Hub, sequence_number: &mut u64, event: &TranscriptEvent) {
    let payload = match event.kind {
        TranscriptKind::Partial => HubPayload::TranscriptPartial {
            event_id: event.event_id,
            text: event.text.clone(),
            speaker_id: event.speaker_id.clone(),
            speaker_confidence: event.speaker_confidence,
            t_start_ms: event.segment_start_ms,
            t_end_ms: event.segment_end_ms,
        },
        TranscriptKind::Final => HubPayload::TranscriptFinal {
            event_id: event.event_id,
            text: event.text.clone(),
            speaker_id: event.speaker_id.clone(),
            speaker_confidence: event.speaker_confidence,
            t_start_ms: event.segment_start_ms,
            t_end_ms: event.segment_end_ms,
        },
    };
    publish(hub, sequence_number, payload);
}

fn publish(hub: &mut Hub, sequence_number: &mut u64, payload: HubPayload) {
    *sequence_number = hub.publish(payload);
}

async fn enqueue_chunk(
    session_id: Uuid,
    chunk: Chunk,
    graph: &mut GraphBuilder,
    limits: &OutboundLimits,
    llm_done_tx: &mpsc::Sender<LlmOutcome>,
    hub: &mut Hub,
    sequence_number: &mut u64,
) {
    let chunk_dict_snapshot: std::collections::HashMap<String, String> = graph.chunk_dict().clone();
    publish(hub, sequence_number, HubPayload::ChunkDict { chunks: chunk_dict_snapshot });

    let should_call = graph.enqueue(chunk);
    if should_call {
        start_llm_call(session_id, graph, limits, llm_done_tx, false).await;
    }
}

async fn start_llm_call(
    session_id: Uuid,
    graph: &mut GraphBuilder,
    limits: &OutboundLimits,
    llm_done_tx: &mpsc::Sender<LlmOutcome>,
    corrective: bool,
) {
    let batch = graph.drain_pending();
    let batch_text = batch.iter().map(|c| c.text.as_str()).collect::<Vec<_>>().join("\n\n");

    let http_out = limits.http_out.clone();
    let llm_in_flight = limits.llm_in_flight.clone();
    let tx = llm_done_tx.clone();
    let client = graph.http_client();
    let config = graph.llm_config().clone();

    // The call itself borrows nothing from `graph`; it is spawned so the
    // run loop keeps draining inbound messages (and coalescing further
    // chunks) while it is outstanding.
    let handle = tokio::spawn(async move {
        let outcome = match crate::graph::call_llm(&client, &config, &batch_text, &llm_in_flight, &http_out, corrective).await {
            Ok(content) => LlmOutcome::Success { content, corrective },
            Err(e) => {
                tracing::warn!(error = %e, stage = "llm", "llm call failed");
                LlmOutcome::Failure
            }
        };
        let _ = tx.send(outcome).await;
    });
    graph.set_call_handle(handle);
    tracing::debug!(session_id = %session_id, "llm call started");
}

async fn handle_llm_outcome(
    outcome: LlmOutcome,
    session_id: Uuid,
    store: &EventStore,
    hub: &mut Hub,
    sequence_number: &mut u64,
    graph: &mut GraphBuilder,
    limits: &OutboundLimits,
    llm_done_tx: &mpsc::Sender<LlmOutcome>,
) {
    match outcome {
        LlmOutcome::Success { content, corrective } => match graph.merge(&content, chrono::Utc::now()) {
            Ok(delta) => {
                for node in delta.nodes {
                    if let Err(e) = store.upsert_node(&node).await {
                        tracing::error!(session_id = %session_id, error = %e, "failed to persist node");
                    }
                }
                publish(hub, sequence_number, HubPayload::ExistingJson { nodes: graph.nodes() });
            }
            Err(_) if !corrective => {
                tracing::warn!(session_id = %session_id, "llm response was not valid json, retrying once with corrective prompt");
                start_llm_call(session_id, graph, limits, llm_done_tx, true).await;
                return;
            }
            Err(_) => {
                // Already the corrective retry: the spec's retry-once
                // policy is exhausted, skip this batch for good.
                tracing::warn!(session_id = %session_id, "llm response still malformed after corrective retry, skipping batch");
                publish(hub, sequence_number, HubPayload::ProcessingStatus {
                    level: StatusLevel::Warning,
                    message: "llm returned malformed json twice, skipping batch".into(),
                    stage: "analyze".into(),
                });
            }
        },
        LlmOutcome::Failure => {
            publish(hub, sequence_number, HubPayload::ProcessingStatus {
                level: StatusLevel::Warning,
                message: "graph update failed for this batch, skipping".into(),
                stage: "graph".into(),
            });
        }
    }

    if graph.finish_call() {
        start_llm_call(session_id, graph, limits, llm_done_tx, false).await;
    }
}
