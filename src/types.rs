/*
 * Conversation Graph Engine - Domain Types
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

//! Entities that flow through the ingestion pipeline: raw audio, transcript
//! events, diarization revisions, chunks, and the conversation graph itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single word with provider-reported timing, carried on a transcript event
/// when the STT provider returns word-level timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WordTiming {
    pub word: String,
    pub start_ms: u64,
    pub end_ms: u64,
    pub conf: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptKind {
    Partial,
    Final,
}

/// Telemetry recorded alongside a transcript event: which provider/model
/// produced it and how long the round trip took.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscriptMetadata {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub latency_ms: Option<u64>,
}

/// An append-only row. Once written, no field is ever mutated; speaker
/// revisions are carried by [`SpeakerUpdate`] rows instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub event_id: Uuid,
    pub session_id: Uuid,
    pub conversation_id: Uuid,
    pub sequence_number: u64,
    pub kind: TranscriptKind,
    pub text: String,
    pub speaker_id: Option<String>,
    pub speaker_confidence: Option<f32>,
    pub diarization_version: u32,
    pub word_timings: Option<Vec<WordTiming>>,
    pub segment_start_ms: u64,
    pub segment_end_ms: u64,
    pub received_at: DateTime<Utc>,
    pub metadata: TranscriptMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeakerUpdateReason {
    Initial,
    OverlapRefined,
    ClusterMerge,
    Reset,
}

/// A revision to the speaker assigned to an existing [`TranscriptEvent`].
/// Also append-only: readers resolve the current speaker as the update with
/// the highest `diarization_version` for a given `event_id`, falling back to
/// the event's own `speaker_id` when no update exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakerUpdate {
    pub event_id: Uuid,
    pub new_speaker_id: String,
    pub new_confidence: f32,
    pub diarization_version: u32,
    pub reason: SpeakerUpdateReason,
}

/// A contiguous batch of finalized transcript text submitted as one LLM
/// request. Immutable once emitted; `event_ids` references only `final`
/// events (partials are display-only, invariant 4 of the data model).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub session_id: Uuid,
    pub text: String,
    pub event_ids: Vec<Uuid>,
    pub speaker_segments: Vec<SpeakerSegment>,
    pub sequence_number: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakerSegment {
    pub speaker_id: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    Supports,
    Rebuts,
    Clarifies,
    Asks,
    Tangent,
    ReturnToThread,
    Contextual,
    TemporalNext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeRelation {
    pub related_node_name: String,
    pub relation_type: RelationType,
    pub relation_text: String,
}

/// A topical unit in the conversation graph. Names are unique within a
/// conversation (invariant 5): the LLM worker either inserts a new node or
/// overwrites an existing node's fields by `(conversation_id, node_name)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_id: Uuid,
    pub conversation_id: Uuid,
    pub node_name: String,
    pub summary: String,
    pub chunk_id: String,
    pub speaker_id: Option<String>,
    pub source_excerpt: String,
    pub predecessor_id: Option<String>,
    pub successor_id: Option<String>,
    pub edge_relations: Vec<EdgeRelation>,
    pub is_bookmark: bool,
    pub is_contextual_progress: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: Uuid,
    pub source_type: String,
    pub participants: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub event_count: u64,
    pub node_count: u64,
}

/// Transient per-connection state. Owned exclusively by the session's
/// single reader/writer task (see `session.rs`).
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: Uuid,
    pub conversation_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub speaker_default: String,
    pub store_audio: bool,
}
