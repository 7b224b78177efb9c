/*
 * Conversation Graph Engine - Session Hub
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

//! Fans outbound events out to every subscriber of a session. Per the
//! design note "do not use broadcast primitives that block the producer on
//! the slowest consumer", each subscriber gets its own bounded `mpsc`
//! channel; a subscriber that falls behind is dropped, the producer never
//! blocks on it.

use serde::Serialize;
use uuid::Uuid;

use crate::types::Node;

const DEFAULT_SUBSCRIBER_QUEUE: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type", content = "data", rename_all = "snake_case")]
pub enum HubPayload {
    TranscriptPartial {
        event_id: Uuid,
        text: String,
        speaker_id: Option<String>,
        speaker_confidence: Option<f32>,
        t_start_ms: u64,
        t_end_ms: u64,
    },
    TranscriptFinal {
        event_id: Uuid,
        text: String,
        speaker_id: Option<String>,
        speaker_confidence: Option<f32>,
        t_start_ms: u64,
        t_end_ms: u64,
    },
    SpeakerUpdate {
        event_id: Uuid,
        speaker_id: String,
        confidence: f32,
        diarization_version: u32,
    },
    ExistingJson {
        nodes: Vec<Node>,
    },
    ChunkDict {
        chunks: std::collections::HashMap<String, String>,
    },
    ProcessingStatus {
        level: StatusLevel,
        message: String,
        stage: String,
    },
    Done {
        conversation_id: Uuid,
        node_count: u64,
    },
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLevel {
    Info,
    Warning,
    Error,
}

/// An envelope carrying the ordering fields every outbound event shares.
#[derive(Debug, Clone, Serialize)]
pub struct HubEvent {
    pub session_id: Uuid,
    pub sequence_number: u64,
    #[serde(flatten)]
    pub payload: HubPayload,
}

struct Subscriber {
    id: Uuid,
    tx: tokio::sync::mpsc::Sender<HubEvent>,
}

/// Per-session fan-out point. Owned by the session's owner task; only that
/// task ever calls `publish`, so the ordering guarantees in the design doc
/// (final-after-partials, speaker_update-never-before-final,
/// existing_json-after-its-events) fall out of call order rather than
/// needing an explicit reorder buffer.
pub struct Hub {
    session_id: Uuid,
    sequence: u64,
    subscribers: Vec<Subscriber>,
    /// Bounded replay ring for subscribers that reconnect mid-session.
    replay: std::collections::VecDeque<HubEvent>,
    replay_capacity: usize,
}

impl Hub {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            sequence: 0,
            subscribers: Vec::new(),
            replay: std::collections::VecDeque::new(),
            replay_capacity: 1024,
        }
    }

    /// Registers a new subscriber and returns its receiver plus an opaque
    /// id usable with [`Hub::unsubscribe`]. Events with `sequence_number >
    /// since_seq` already retained in the replay ring are delivered
    /// immediately, covering the reconnect case.
    pub fn subscribe(&mut self, since_seq: u64) -> (Uuid, tokio::sync::mpsc::Receiver<HubEvent>) {
        let (tx, rx) = tokio::sync::mpsc::channel(DEFAULT_SUBSCRIBER_QUEUE);
        for event in self.replay.iter().filter(|e| e.sequence_number > since_seq) {
            let _ = tx.try_send(event.clone());
        }
        let id = Uuid::new_v4();
        self.subscribers.push(Subscriber { id, tx });
        (id, rx)
    }

    pub fn unsubscribe(&mut self, id: Uuid) {
        self.subscribers.retain(|s| s.id != id);
    }

    /// Publishes one event, assigning it the next monotonic sequence
    /// number. A subscriber whose queue is full is dropped rather than
    /// allowed to stall the producer.
    pub fn publish(&mut self, payload: HubPayload) -> u64 {
        self.sequence += 1;
        let event = HubEvent {
            session_id: self.session_id,
            sequence_number: self.sequence,
            payload,
        };

        self.replay.push_back(event.clone());
        if self.replay.len() > self.replay_capacity {
            self.replay.pop_front();
        }

        self.subscribers.retain(|s| match s.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(session_id = %self.session_id, subscriber = %s.id, "subscriber queue overflow, disconnecting");
                false
            }
            Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => false,
        });

        event.sequence_number
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn current_sequence(&self) -> u64 {
        self.sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_delivers_to_subscriber_in_order() {
        let mut hub = Hub::new(Uuid::new_v4());
        let (_id, mut rx) = hub.subscribe(0);

        hub.publish(HubPayload::ProcessingStatus {
            level: StatusLevel::Info,
            message: "first".into(),
            stage: "transcribe".into(),
        });
        hub.publish(HubPayload::ProcessingStatus {
            level: StatusLevel::Info,
            message: "second".into(),
            stage: "transcribe".into(),
        });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.sequence_number, 1);
        assert_eq!(second.sequence_number, 2);
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_not_blocking() {
        let mut hub = Hub::new(Uuid::new_v4());
        let (_id, _rx) = hub.subscribe(0);
        assert_eq!(hub.subscriber_count(), 1);

        for i in 0..(DEFAULT_SUBSCRIBER_QUEUE + 10) {
            hub.publish(HubPayload::ProcessingStatus {
                level: StatusLevel::Info,
                message: format!("msg-{i}"),
                stage: "transcribe".into(),
            });
        }

        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn reconnect_replays_only_events_after_since_seq() {
        let mut hub = Hub::new(Uuid::new_v4());
        for i in 0..5 {
            hub.publish(HubPayload::ProcessingStatus {
                level: StatusLevel::Info,
                message: format!("msg-{i}"),
                stage: "transcribe".into(),
            });
        }

        let (_id, mut rx) = hub.subscribe(3);
        let first = rx.recv().await.unwrap();
        assert_eq!(first.sequence_number, 4);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.sequence_number, 5);
    }
}
