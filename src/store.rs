/*
 * Conversation Graph Engine - Append-only Event Store
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

//! Two storage concerns in one pool: a durable, never-mutated log of
//! transcript events and speaker updates, and a mutable derived store for
//! nodes and conversations. `TranscriptEvent` rows are never updated or
//! deleted; speaker revisions are expressed as `SpeakerUpdate` rows per the
//! append-only-with-revisions design note.

use chrono::Utc;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use uuid::Uuid;

use crate::error::StoreError;
use crate::types::{
    Conversation, EdgeRelation, Node, SpeakerUpdate, SpeakerUpdateReason, TranscriptEvent,
    TranscriptKind, TranscriptMetadata, WordTiming,
};

#[derive(Clone)]
pub struct EventStore {
    pool: SqlitePool,
}

impl EventStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        // A `:memory:` database is private per connection; a pool of more
        // than one would hand out connections that never saw the
        // migrations run on the first one.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 8 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
            StoreError::Backend(sqlx::Error::Configuration(e.to_string().into()))
        })?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
            StoreError::Backend(sqlx::Error::Configuration(e.to_string().into()))
        })?;
        Ok(Self { pool })
    }

    pub async fn ensure_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO conversations (conversation_id, source_type, participants, started_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT(conversation_id) DO NOTHING
            "#,
        )
        .bind(conversation.conversation_id.to_string())
        .bind(&conversation.source_type)
        .bind(serde_json::to_string(&conversation.participants).unwrap_or_default())
        .bind(conversation.started_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Checks `sequence_number > max(session)` and inserts, per the
    /// contract in the design doc: the store rejects out-of-order writes,
    /// the session owner is what actually guarantees monotonicity by
    /// issuing sequence numbers one at a time.
    pub async fn append_transcript_event(&self, e: &TranscriptEvent) -> Result<u64, StoreError> {
        let max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(sequence_number) FROM transcript_events WHERE session_id = $1",
        )
        .bind(e.session_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        let max = max.unwrap_or(-1);
        if (e.sequence_number as i64) <= max {
            return Err(StoreError::SequenceViolation {
                got: e.sequence_number,
                max: max.max(0) as u64,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO transcript_events
                (event_id, session_id, conversation_id, sequence_number, kind, text,
                 speaker_id, speaker_confidence, diarization_version, word_timings,
                 segment_start_ms, segment_end_ms, received_at, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(e.event_id.to_string())
        .bind(e.session_id.to_string())
        .bind(e.conversation_id.to_string())
        .bind(e.sequence_number as i64)
        .bind(match e.kind {
            TranscriptKind::Partial => "partial",
            TranscriptKind::Final => "final",
        })
        .bind(&e.text)
        .bind(&e.speaker_id)
        .bind(e.speaker_confidence)
        .bind(e.diarization_version as i64)
        .bind(e.word_timings.as_ref().and_then(|w| serde_json::to_string(w).ok()))
        .bind(e.segment_start_ms as i64)
        .bind(e.segment_end_ms as i64)
        .bind(e.received_at.to_rfc3339())
        .bind(serde_json::to_string(&e.metadata).unwrap_or_default())
        .execute(&self.pool)
        .await?;

        Ok(e.sequence_number)
    }

    pub async fn append_speaker_update(&self, u: &SpeakerUpdate) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO speaker_updates
                (event_id, new_speaker_id, new_confidence, diarization_version, reason, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(u.event_id.to_string())
        .bind(&u.new_speaker_id)
        .bind(u.new_confidence)
        .bind(u.diarization_version as i64)
        .bind(match u.reason {
            SpeakerUpdateReason::Initial => "initial",
            SpeakerUpdateReason::OverlapRefined => "overlap_refined",
            SpeakerUpdateReason::ClusterMerge => "cluster_merge",
            SpeakerUpdateReason::Reset => "reset",
        })
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Upserts by `(conversation_id, node_name)`, preserving `created_at`
    /// and bumping `updated_at` — invariant 5 of the data model.
    pub async fn upsert_node(&self, n: &Node) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO nodes
                (node_id, conversation_id, node_name, summary, chunk_id, speaker_id,
                 source_excerpt, predecessor_id, successor_id, edge_relations,
                 is_bookmark, is_contextual_progress, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13)
            ON CONFLICT(conversation_id, node_name) DO UPDATE SET
                summary = excluded.summary,
                chunk_id = excluded.chunk_id,
                speaker_id = excluded.speaker_id,
                source_excerpt = excluded.source_excerpt,
                predecessor_id = excluded.predecessor_id,
                successor_id = excluded.successor_id,
                edge_relations = excluded.edge_relations,
                is_bookmark = excluded.is_bookmark,
                is_contextual_progress = excluded.is_contextual_progress,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(n.node_id.to_string())
        .bind(n.conversation_id.to_string())
        .bind(&n.node_name)
        .bind(&n.summary)
        .bind(&n.chunk_id)
        .bind(&n.speaker_id)
        .bind(&n.source_excerpt)
        .bind(&n.predecessor_id)
        .bind(&n.successor_id)
        .bind(serde_json::to_string(&n.edge_relations).unwrap_or_default())
        .bind(n.is_bookmark)
        .bind(n.is_contextual_progress)
        .bind(n.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn nodes_for_conversation(&self, conversation_id: Uuid) -> Result<Vec<Node>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT node_id, conversation_id, node_name, summary, chunk_id, speaker_id,
                   source_excerpt, predecessor_id, successor_id, edge_relations,
                   is_bookmark, is_contextual_progress, created_at, updated_at
            FROM nodes WHERE conversation_id = $1 ORDER BY created_at ASC
            "#,
        )
        .bind(conversation_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut nodes = Vec::with_capacity(rows.len());
        for row in rows {
            let edge_relations: Vec<EdgeRelation> =
                serde_json::from_str(row.get::<String, _>("edge_relations").as_str()).unwrap_or_default();
            nodes.push(Node {
                node_id: Uuid::parse_str(row.get::<String, _>("node_id").as_str()).unwrap_or_default(),
                conversation_id,
                node_name: row.get("node_name"),
                summary: row.get("summary"),
                chunk_id: row.get("chunk_id"),
                speaker_id: row.get("speaker_id"),
                source_excerpt: row.get("source_excerpt"),
                predecessor_id: row.get("predecessor_id"),
                successor_id: row.get("successor_id"),
                edge_relations,
                is_bookmark: row.get("is_bookmark"),
                is_contextual_progress: row.get("is_contextual_progress"),
                created_at: chrono::DateTime::parse_from_rfc3339(row.get::<String, _>("created_at").as_str())
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                updated_at: chrono::DateTime::parse_from_rfc3339(row.get::<String, _>("updated_at").as_str())
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            });
        }
        Ok(nodes)
    }

    /// Replay support for subscriber reconnect: every `final` transcript
    /// event (plus its resolved current speaker) with `sequence_number >
    /// since_seq`.
    pub async fn load_session_tail(
        &self,
        session_id: Uuid,
        since_seq: u64,
    ) -> Result<Vec<TranscriptEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, session_id, conversation_id, sequence_number, kind, text,
                   speaker_id, speaker_confidence, diarization_version, word_timings,
                   segment_start_ms, segment_end_ms, received_at, metadata
            FROM transcript_events
            WHERE session_id = $1 AND sequence_number > $2
            ORDER BY sequence_number ASC
            "#,
        )
        .bind(session_id.to_string())
        .bind(since_seq as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let word_timings: Option<Vec<WordTiming>> = row
                .get::<Option<String>, _>("word_timings")
                .and_then(|s| serde_json::from_str(&s).ok());
            let metadata: TranscriptMetadata =
                serde_json::from_str(row.get::<String, _>("metadata").as_str()).unwrap_or_default();
            events.push(TranscriptEvent {
                event_id: Uuid::parse_str(row.get::<String, _>("event_id").as_str()).unwrap_or_default(),
                session_id,
                conversation_id: Uuid::parse_str(row.get::<String, _>("conversation_id").as_str())
                    .unwrap_or_default(),
                sequence_number: row.get::<i64, _>("sequence_number") as u64,
                kind: if row.get::<String, _>("kind") == "final" {
                    TranscriptKind::Final
                } else {
                    TranscriptKind::Partial
                },
                text: row.get("text"),
                speaker_id: row.get("speaker_id"),
                speaker_confidence: row.get("speaker_confidence"),
                diarization_version: row.get::<i64, _>("diarization_version") as u32,
                word_timings,
                segment_start_ms: row.get::<i64, _>("segment_start_ms") as u64,
                segment_end_ms: row.get::<i64, _>("segment_end_ms") as u64,
                received_at: chrono::DateTime::parse_from_rfc3339(row.get::<String, _>("received_at").as_str())
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                metadata,
            });
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TranscriptMetadata;

    fn sample_event(session_id: Uuid, seq: u64) -> TranscriptEvent {
        TranscriptEvent {
            event_id: Uuid::new_v4(),
            session_id,
            conversation_id: Uuid::new_v4(),
            sequence_number: seq,
            kind: TranscriptKind::Final,
            text: "hello".into(),
            speaker_id: Some("SPEAKER_00".into()),
            speaker_confidence: Some(0.9),
            diarization_version: 1,
            word_timings: None,
            segment_start_ms: 0,
            segment_end_ms: 1000,
            received_at: Utc::now(),
            metadata: TranscriptMetadata::default(),
        }
    }

    #[tokio::test]
    async fn append_rejects_non_monotonic_sequence() {
        let store = EventStore::in_memory().await.unwrap();
        let session_id = Uuid::new_v4();
        store.append_transcript_event(&sample_event(session_id, 1)).await.unwrap();
        let err = store.append_transcript_event(&sample_event(session_id, 1)).await;
        assert!(matches!(err, Err(StoreError::SequenceViolation { .. })));
    }

    #[tokio::test]
    async fn load_session_tail_returns_only_newer_events() {
        let store = EventStore::in_memory().await.unwrap();
        let session_id = Uuid::new_v4();
        for seq in 1..=3 {
            store.append_transcript_event(&sample_event(session_id, seq)).await.unwrap();
        }
        let tail = store.load_session_tail(session_id, 1).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].sequence_number, 2);
        assert_eq!(tail[1].sequence_number, 3);
    }

    #[tokio::test]
    async fn upsert_node_is_idempotent() {
        let store = EventStore::in_memory().await.unwrap();
        let conversation_id = Uuid::new_v4();
        let node = Node {
            node_id: Uuid::new_v4(),
            conversation_id,
            node_name: "topic-a".into(),
            summary: "first pass".into(),
            chunk_id: "chunk-1".into(),
            speaker_id: None,
            source_excerpt: "...".into(),
            predecessor_id: None,
            successor_id: None,
            edge_relations: vec![],
            is_bookmark: false,
            is_contextual_progress: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.upsert_node(&node).await.unwrap();
        store.upsert_node(&node).await.unwrap();

        let nodes = store.nodes_for_conversation(conversation_id).await.unwrap();
        assert_eq!(nodes.len(), 1);
    }
}
