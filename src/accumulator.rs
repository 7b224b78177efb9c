/*
 * Conversation Graph Engine - Transcript Accumulator
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

//! Segments the append-only `final`-event stream into LLM-sized chunks by
//! a sliding-window rule: word-count threshold plus sentence-terminal
//! punctuation, or an idle timeout, whichever comes first. Retains a small
//! word overlap across chunk boundaries for context continuity.

use std::time::Instant;

use chrono::Utc;
use uuid::Uuid;

use crate::config::AccumulatorConfig;
use crate::types::{Chunk, SpeakerSegment};

struct BufferedEvent {
    event_id: Uuid,
    speaker_id: Option<String>,
    text: String,
}

pub struct Accumulator {
    config: AccumulatorConfig,
    session_id: Uuid,
    buffer: Vec<BufferedEvent>,
    next_sequence: u64,
    next_chunk_index: u64,
    last_activity: Instant,
    overlap_tail: Vec<BufferedEvent>,
}

fn word_count(events: &[BufferedEvent]) -> usize {
    events.iter().map(|e| e.text.split_whitespace().count()).sum()
}

fn ends_with_sentence_terminal(text: &str) -> bool {
    matches!(text.trim_end().chars().last(), Some('.') | Some('!') | Some('?'))
}

fn clone_event(e: &BufferedEvent) -> BufferedEvent {
    BufferedEvent { event_id: e.event_id, speaker_id: e.speaker_id.clone(), text: e.text.clone() }
}

impl Accumulator {
    pub fn new(session_id: Uuid, config: AccumulatorConfig) -> Self {
        Self {
            config,
            session_id,
            buffer: Vec::new(),
            next_sequence: 0,
            next_chunk_index: 0,
            last_activity: Instant::now(),
            overlap_tail: Vec::new(),
        }
    }

    /// Feeds one `final` event plus its (possibly reconciled) speaker into
    /// the rolling buffer. Returns a chunk if the word-count + punctuation
    /// boundary rule fires immediately.
    pub fn push_final(&mut self, event_id: Uuid, speaker_id: Option<String>, text: String) -> Option<Chunk> {
        let boundary_candidate = ends_with_sentence_terminal(&text);
        self.buffer.push(BufferedEvent { event_id, speaker_id, text });
        self.last_activity = Instant::now();

        if boundary_candidate && word_count(&self.buffer) >= self.config.chunk_target_words {
            Some(self.emit_chunk())
        } else {
            None
        }
    }

    /// Called periodically by the session owner; fires the idle-timeout
    /// boundary when buffered text has sat unflushed for `T_idle`.
    pub fn check_idle(&mut self) -> Option<Chunk> {
        if self.buffer.is_empty() {
            return None;
        }
        if self.last_activity.elapsed().as_secs_f32() >= self.config.idle_timeout_seconds {
            Some(self.emit_chunk())
        } else {
            None
        }
    }

    pub fn is_idle_overdue(&self) -> bool {
        !self.buffer.is_empty() && self.last_activity.elapsed().as_secs_f32() >= self.config.idle_timeout_seconds
    }

    fn emit_chunk(&mut self) -> Chunk {
        let mut all_events: Vec<BufferedEvent> =
            self.overlap_tail.drain(..).map(|e| clone_event(&e)).collect();
        all_events.append(&mut self.buffer);

        let text = format_chunk_text(&all_events);
        let event_ids = all_events.iter().map(|e| e.event_id).collect();
        let speaker_segments = all_events
            .iter()
            .map(|e| SpeakerSegment { speaker_id: e.speaker_id.clone(), text: e.text.clone() })
            .collect();

        let chunk_id = format!("chunk-{}", self.next_chunk_index);
        self.next_chunk_index += 1;
        self.next_sequence += 1;

        // Retain the trailing `chunk_overlap_words` worth of events for
        // the next chunk's context continuity.
        let mut overlap = Vec::new();
        let mut words_kept = 0usize;
        for e in all_events.iter().rev() {
            let w = e.text.split_whitespace().count();
            if words_kept >= self.config.chunk_overlap_words {
                break;
            }
            overlap.push(clone_event(e));
            words_kept += w;
        }
        overlap.reverse();
        self.overlap_tail = overlap;

        Chunk {
            chunk_id,
            session_id: self.session_id,
            text,
            event_ids,
            speaker_segments,
            sequence_number: self.next_sequence,
            created_at: Utc::now(),
        }
    }
}

fn format_chunk_text(events: &[BufferedEvent]) -> String {
    let has_any_speaker = events.iter().any(|e| e.speaker_id.is_some());
    events
        .iter()
        .map(|e| {
            if has_any_speaker {
                format!("[{}]: {}", e.speaker_id.as_deref().unwrap_or("unknown"), e.text)
            } else {
                e.text.clone()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> AccumulatorConfig {
        AccumulatorConfig { chunk_target_words: 3, chunk_overlap_words: 1, idle_timeout_seconds: 6.0 }
    }

    #[test]
    fn emits_chunk_on_word_count_plus_terminal_punctuation() {
        let mut acc = Accumulator::new(Uuid::new_v4(), small_config());
        assert!(acc.push_final(Uuid::new_v4(), None, "one two".into()).is_none());
        let chunk = acc.push_final(Uuid::new_v4(), None, "three four.".into());
        assert!(chunk.is_some());
        let chunk = chunk.unwrap();
        assert_eq!(chunk.event_ids.len(), 2);
        assert_eq!(chunk.chunk_id, "chunk-0");
    }

    #[test]
    fn no_boundary_without_terminal_punctuation() {
        let mut acc = Accumulator::new(Uuid::new_v4(), small_config());
        assert!(acc.push_final(Uuid::new_v4(), None, "one two three four".into()).is_none());
    }

    #[test]
    fn speaker_prefixed_lines_when_any_event_has_a_speaker() {
        let mut acc = Accumulator::new(Uuid::new_v4(), small_config());
        acc.push_final(Uuid::new_v4(), Some("SPEAKER_00".into()), "hi".into());
        let chunk = acc.push_final(Uuid::new_v4(), None, "there now.".into()).unwrap();
        assert!(chunk.text.contains("[SPEAKER_00]: hi"));
    }

    #[test]
    fn plain_text_when_no_event_has_a_speaker() {
        let mut acc = Accumulator::new(Uuid::new_v4(), small_config());
        acc.push_final(Uuid::new_v4(), None, "hi".into());
        let chunk = acc.push_final(Uuid::new_v4(), None, "there now.".into()).unwrap();
        assert!(!chunk.text.contains('['));
    }

    #[test]
    fn overlap_carried_into_next_chunk() {
        let mut acc = Accumulator::new(Uuid::new_v4(), small_config());
        acc.push_final(Uuid::new_v4(), None, "one two three.".into());
        let first = acc.push_final(Uuid::new_v4(), None, "four.".into());
        assert!(first.is_some());
        // overlap_tail should carry at least the last event into chunk 2
        assert!(!acc.overlap_tail.is_empty());
    }
}
