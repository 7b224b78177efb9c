/*
 * Conversation Graph Engine - LLM Graph Builder
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

//! Turns accumulated text chunks into graph deltas via an LLM call, one
//! session at a time. At most one LLM call is ever in flight per session;
//! chunks that arrive while a call is running are queued and coalesced
//! into the next call rather than firing one request per chunk.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::types::{Chunk, EdgeRelation, Node};

/// One parsed LLM response, pre-merge.
#[derive(Debug, Deserialize)]
struct LlmGraphResponse {
    #[serde(default)]
    nodes: Vec<LlmNode>,
}

#[derive(Debug, Deserialize)]
struct LlmNode {
    node_name: String,
    summary: String,
    #[serde(default)]
    source_excerpt: String,
    #[serde(default)]
    speaker_id: Option<String>,
    #[serde(default)]
    predecessor_id: Option<String>,
    #[serde(default)]
    successor_id: Option<String>,
    #[serde(default)]
    edge_relations: Vec<EdgeRelation>,
    #[serde(default)]
    is_bookmark: bool,
    #[serde(default)]
    is_contextual_progress: bool,
}

/// Result of running one coalesced batch of chunks through the LLM.
pub struct GraphDelta {
    pub nodes: Vec<Node>,
}

/// Per-session running graph state plus the at-most-one-in-flight
/// scheduling discipline. Owned exclusively by the session owner task.
pub struct GraphBuilder {
    conversation_id: Uuid,
    config: LlmConfig,
    client: reqwest::Client,
    nodes_by_name: HashMap<String, Node>,
    chunk_dict: HashMap<String, String>,
    pending_chunks: VecDeque<Chunk>,
    in_flight: bool,
    /// `chunk_id` of the batch currently in flight, set by `drain_pending`
    /// and consumed by `merge`. Needed because `pending_chunks` may already
    /// hold the *next* coalesced batch by the time the response for this
    /// one comes back.
    in_flight_chunk_id: String,
    /// When the in-flight call's request was sent, so a close request can
    /// tell how much of `T_cancel_grace` has already elapsed.
    call_started_at: Option<Instant>,
    /// Handle of the spawned call task, so it can be aborted if the
    /// shutdown grace period runs out before it settles.
    call_handle: Option<tokio::task::JoinHandle<()>>,
}

impl GraphBuilder {
    pub fn new(conversation_id: Uuid, config: LlmConfig) -> Self {
        Self {
            conversation_id,
            config,
            client: reqwest::Client::new(),
            nodes_by_name: HashMap::new(),
            chunk_dict: HashMap::new(),
            pending_chunks: VecDeque::new(),
            in_flight: false,
            in_flight_chunk_id: String::new(),
            call_started_at: None,
            call_handle: None,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// How long the in-flight call has been running, if one is in flight.
    pub fn call_elapsed(&self) -> Option<Duration> {
        self.call_started_at.map(|t| t.elapsed())
    }

    /// Records the task handle of the call just spawned for the current
    /// in-flight batch, so it can later be aborted.
    pub fn set_call_handle(&mut self, handle: tokio::task::JoinHandle<()>) {
        self.call_handle = Some(handle);
    }

    pub fn chunk_dict(&self) -> &HashMap<String, String> {
        &self.chunk_dict
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.nodes_by_name.values().cloned().collect()
    }

    pub fn llm_config(&self) -> &LlmConfig {
        &self.config
    }

    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    pub fn http_client(&self) -> reqwest::Client {
        self.client.clone()
    }

    /// Enqueues a chunk. Returns `true` when the caller should kick off a
    /// new LLM call (nothing is currently in flight); otherwise the chunk
    /// just joins the queue and will be picked up by the next call once
    /// the running one returns.
    pub fn enqueue(&mut self, chunk: Chunk) -> bool {
        self.chunk_dict.insert(chunk.chunk_id.clone(), chunk.text.clone());
        self.pending_chunks.push_back(chunk);
        if self.in_flight {
            false
        } else {
            self.in_flight = true;
            true
        }
    }

    /// Drains every chunk queued since the last call started — this is the
    /// coalescing step: one LLM request covers everything that piled up
    /// while the previous request was running. Remembers the batch's last
    /// `chunk_id` so a later `merge` can tag nodes correctly even if more
    /// chunks have coalesced into `pending_chunks` by the time the
    /// response comes back.
    pub fn drain_pending(&mut self) -> Vec<Chunk> {
        let batch: Vec<Chunk> = self.pending_chunks.drain(..).collect();
        if let Some(last) = batch.last() {
            self.in_flight_chunk_id = last.chunk_id.clone();
        }
        self.call_started_at = Some(Instant::now());
        batch
    }

    /// Called once the in-flight call (success, failure, or skip) has been
    /// fully handled. Returns `true` if more chunks arrived meanwhile and
    /// another call should be started immediately.
    pub fn finish_call(&mut self) -> bool {
        self.call_started_at = None;
        self.call_handle = None;
        if self.pending_chunks.is_empty() {
            self.in_flight = false;
            false
        } else {
            true
        }
    }

    /// Aborts the in-flight call's task and discards its batch without
    /// attempting a restart. Used when `T_cancel_grace` elapses during
    /// shutdown and the call has to be given up on rather than awaited.
    pub fn abort_in_flight(&mut self) {
        if let Some(handle) = self.call_handle.take() {
            handle.abort();
        }
        self.in_flight = false;
        self.call_started_at = None;
        self.pending_chunks.clear();
        self.in_flight_chunk_id.clear();
    }

    /// Merges a successful LLM response into the running graph by
    /// `node_name`: existing nodes are overwritten in place (idempotent
    /// upsert), new names are inserted.
    pub fn merge(&mut self, delta_source: &str, now: chrono::DateTime<chrono::Utc>) -> Result<GraphDelta, LlmError> {
        let parsed: LlmGraphResponse = parse_llm_json(delta_source)?;
        let mut touched = Vec::with_capacity(parsed.nodes.len());

        for n in parsed.nodes {
            let created_at = self
                .nodes_by_name
                .get(&n.node_name)
                .map(|existing| existing.created_at)
                .unwrap_or(now);

            let node = Node {
                node_id: self
                    .nodes_by_name
                    .get(&n.node_name)
                    .map(|existing| existing.node_id)
                    .unwrap_or_else(Uuid::new_v4),
                conversation_id: self.conversation_id,
                node_name: n.node_name.clone(),
                summary: n.summary,
                chunk_id: self.in_flight_chunk_id.clone(),
                speaker_id: n.speaker_id,
                source_excerpt: n.source_excerpt,
                predecessor_id: n.predecessor_id,
                successor_id: n.successor_id,
                edge_relations: n.edge_relations,
                is_bookmark: n.is_bookmark,
                is_contextual_progress: n.is_contextual_progress,
                created_at,
                updated_at: now,
            };
            self.nodes_by_name.insert(n.node_name, node.clone());
            touched.push(node);
        }

        Ok(GraphDelta { nodes: touched })
    }
}

/// Standalone so a call can be spawned off the session's running
/// `GraphBuilder` without holding a borrow of it across `.await` points.
pub async fn call_llm(
    client: &reqwest::Client,
    config: &LlmConfig,
    batch_text: &str,
    llm_in_flight: &Arc<Semaphore>,
    http_out: &Arc<Semaphore>,
    corrective: bool,
) -> Result<String, LlmError> {
    let _llm_permit = llm_in_flight.acquire().await.map_err(|_| LlmError::Timeout(Duration::ZERO))?;
    let _http_permit = http_out.acquire().await.map_err(|_| LlmError::Timeout(Duration::ZERO))?;

    let system_prompt = if corrective {
        "Return only a single JSON object matching the schema. No prose, no markdown fences."
    } else {
        "You extract a conversation graph from transcript text. Respond with a single JSON object \
         of the shape {\"nodes\": [{\"node_name\", \"summary\", \"source_excerpt\", \"speaker_id\", \
         \"predecessor_id\", \"successor_id\", \"edge_relations\", \"is_bookmark\", \"is_contextual_progress\"}]}."
    };

    let body = serde_json::json!({
        "model": config.model,
        "messages": [
            {"role": "system", "content": system_prompt},
            {"role": "user", "content": batch_text},
        ],
        "response_format": {"type": "json_object"},
        "temperature": config.temperature,
        "max_tokens": config.max_tokens,
    });

    let timeout = Duration::from_secs(config.request_timeout_seconds);
    let request = client.post(&config.http_url).json(&body).send();
    let response = tokio::time::timeout(timeout, request)
        .await
        .map_err(|_| LlmError::Timeout(timeout))??
        .error_for_status()?;

    let value: Value = response.json().await?;
    let content = value
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Ok(content)
}

fn parse_llm_json(raw: &str) -> Result<LlmGraphResponse, LlmError> {
    let trimmed = strip_markdown_fence(raw);
    serde_json::from_str(trimmed).map_err(|_| LlmError::InvalidJson)
}

fn strip_markdown_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("```json") {
        rest.trim_end_matches("```").trim()
    } else if let Some(rest) = trimmed.strip_prefix("```") {
        rest.trim_end_matches("```").trim()
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn config() -> LlmConfig {
        LlmConfig {
            http_url: "http://localhost:11434/v1/chat/completions".into(),
            model: "llama3".into(),
            request_timeout_seconds: 45,
            temperature: 0.2,
            max_tokens: 1500,
        }
    }

    fn sample_chunk(session_id: Uuid) -> Chunk {
        Chunk {
            chunk_id: "chunk-0".into(),
            session_id,
            text: "hello world.".into(),
            event_ids: vec![],
            speaker_segments: vec![],
            sequence_number: 1,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn enqueue_first_chunk_requests_a_call() {
        let mut builder = GraphBuilder::new(Uuid::new_v4(), config());
        let session_id = Uuid::new_v4();
        assert!(builder.enqueue(sample_chunk(session_id)));
    }

    #[test]
    fn enqueue_while_in_flight_does_not_request_another_call() {
        let mut builder = GraphBuilder::new(Uuid::new_v4(), config());
        let session_id = Uuid::new_v4();
        assert!(builder.enqueue(sample_chunk(session_id)));
        assert!(!builder.enqueue(sample_chunk(session_id)));
    }

    #[test]
    fn finish_call_restarts_when_chunks_queued_during_the_call() {
        let mut builder = GraphBuilder::new(Uuid::new_v4(), config());
        let session_id = Uuid::new_v4();
        builder.enqueue(sample_chunk(session_id));
        builder.drain_pending();
        builder.enqueue(sample_chunk(session_id));
        assert!(builder.finish_call());
    }

    #[test]
    fn finish_call_clears_in_flight_when_queue_empty() {
        let mut builder = GraphBuilder::new(Uuid::new_v4(), config());
        let session_id = Uuid::new_v4();
        builder.enqueue(sample_chunk(session_id));
        builder.drain_pending();
        assert!(!builder.finish_call());
        assert!(!builder.is_in_flight());
    }

    #[test]
    fn merge_inserts_new_node_and_preserves_created_at_on_update() {
        let mut builder = GraphBuilder::new(Uuid::new_v4(), config());
        let first = r#"{"nodes":[{"node_name":"topic-a","summary":"first pass"}]}"#;
        let delta = builder.merge(first, Utc::now()).unwrap();
        assert_eq!(delta.nodes.len(), 1);
        let created_at = builder.nodes_by_name.get("topic-a").unwrap().created_at;

        let second = r#"{"nodes":[{"node_name":"topic-a","summary":"revised"}]}"#;
        builder.merge(second, Utc::now()).unwrap();
        let updated = builder.nodes_by_name.get("topic-a").unwrap();
        assert_eq!(updated.summary, "revised");
        assert_eq!(updated.created_at, created_at);
    }

    #[test]
    fn merge_rejects_invalid_json() {
        let mut builder = GraphBuilder::new(Uuid::new_v4(), config());
        let err = builder.merge("not json", Utc::now());
        assert!(matches!(err, Err(LlmError::InvalidJson)));
    }

    #[test]
    fn merge_tags_nodes_with_the_in_flight_batchs_chunk_id_not_a_later_one() {
        let mut builder = GraphBuilder::new(Uuid::new_v4(), config());
        let session_id = Uuid::new_v4();
        let mut first_batch_chunk = sample_chunk(session_id);
        first_batch_chunk.chunk_id = "chunk-a".into();
        builder.enqueue(first_batch_chunk);
        builder.drain_pending();

        // A second chunk coalesces while the first batch's call is still
        // outstanding; it must not leak into the first batch's node tags.
        let mut second_batch_chunk = sample_chunk(session_id);
        second_batch_chunk.chunk_id = "chunk-b".into();
        builder.enqueue(second_batch_chunk);

        let delta = builder.merge(r#"{"nodes":[{"node_name":"topic-a","summary":"s"}]}"#, Utc::now()).unwrap();
        assert_eq!(delta.nodes[0].chunk_id, "chunk-a");
    }

    #[test]
    fn strips_markdown_code_fence_before_parsing() {
        let mut builder = GraphBuilder::new(Uuid::new_v4(), config());
        let fenced = "```json\n{\"nodes\":[{\"node_name\":\"t\",\"summary\":\"s\"}]}\n```";
        let delta = builder.merge(fenced, Utc::now()).unwrap();
        assert_eq!(delta.nodes.len(), 1);
    }

    #[tokio::test]
    async fn abort_in_flight_clears_state_and_drops_the_pending_batch() {
        let mut builder = GraphBuilder::new(Uuid::new_v4(), config());
        let session_id = Uuid::new_v4();
        builder.enqueue(sample_chunk(session_id));
        builder.drain_pending();
        assert!(builder.call_elapsed().is_some());

        builder.enqueue(sample_chunk(session_id));
        builder.set_call_handle(tokio::spawn(async {}));

        builder.abort_in_flight();
        assert!(!builder.is_in_flight());
        assert!(builder.call_elapsed().is_none());
        // finish_call must not think there's a queued batch to restart.
        assert!(!builder.finish_call());
    }
}
