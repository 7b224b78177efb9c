/*
 * Conversation Graph Engine - Diarization Reconciler
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

//! Late-binds speaker labels to transcript events within a bounded
//! alignment window. Diarization misses (no segment overlaps enough) are
//! not an error — the event simply keeps its default speaker.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::config::DiarizationConfig;
use crate::stt::RawDiarizedSegment;
use crate::types::{SpeakerUpdate, SpeakerUpdateReason};

struct PendingEvent {
    event_id: Uuid,
    segment_start_ms: u64,
    segment_end_ms: u64,
    current_speaker: Option<String>,
    diarization_version: u32,
    received_at: Instant,
}

/// Outcome of reconciling one newly-arrived diarized segment set against
/// the alignment window.
pub struct Reconciliation {
    pub updates: Vec<SpeakerUpdate>,
}

/// A sliding alignment window of recent transcript events still eligible
/// for a speaker revision (invariant 3: no revision after `W_reconcile`).
pub struct DiarizationReconciler {
    config: DiarizationConfig,
    window: VecDeque<PendingEvent>,
    stopped: bool,
}

impl DiarizationReconciler {
    pub fn new(config: DiarizationConfig) -> Self {
        Self { config, window: VecDeque::new(), stopped: false }
    }

    /// Registers a freshly-emitted transcript event as eligible for
    /// revision until it ages out of the window.
    pub fn track(&mut self, event_id: Uuid, segment_start_ms: u64, segment_end_ms: u64, initial_speaker: Option<String>) {
        if self.stopped {
            return;
        }
        self.window.push_back(PendingEvent {
            event_id,
            segment_start_ms,
            segment_end_ms,
            current_speaker: initial_speaker,
            diarization_version: 1,
            received_at: Instant::now(),
        });
    }

    fn evict_expired(&mut self) {
        let window_dur = Duration::from_secs_f32(self.config.reconcile_window_seconds);
        while let Some(front) = self.window.front() {
            if front.received_at.elapsed() > window_dur {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Aligns a batch of provider-reported diarized segments against every
    /// still-eligible event in the window, emitting a `SpeakerUpdate` for
    /// each event whose best-overlap speaker differs from its current one.
    pub fn reconcile(&mut self, segments: &[RawDiarizedSegment]) -> Reconciliation {
        self.evict_expired();
        if self.stopped {
            return Reconciliation { updates: vec![] };
        }

        let mut updates = Vec::new();
        for pending in self.window.iter_mut() {
            let mut best: Option<(&RawDiarizedSegment, f32)> = None;
            for seg in segments {
                let ratio = overlap_ratio(
                    pending.segment_start_ms,
                    pending.segment_end_ms,
                    seg.start_ms,
                    seg.end_ms,
                );
                if ratio > best.map(|(_, r)| r).unwrap_or(0.0) {
                    best = Some((seg, ratio));
                }
            }

            if let Some((seg, ratio)) = best {
                if ratio > self.config.assign_overlap_threshold {
                    if let Some(ref speaker) = seg.speaker {
                        let changed = pending.current_speaker.as_deref() != Some(speaker.as_str());
                        if changed {
                            pending.diarization_version += 1;
                            pending.current_speaker = Some(speaker.clone());
                            updates.push(SpeakerUpdate {
                                event_id: pending.event_id,
                                new_speaker_id: speaker.clone(),
                                new_confidence: ratio.min(1.0),
                                diarization_version: pending.diarization_version,
                                reason: SpeakerUpdateReason::OverlapRefined,
                            });
                        }
                    }
                }
            }
        }
        Reconciliation { updates }
    }

    /// On session close the reconciler stops accepting new segments and
    /// evicts its window without emitting further updates.
    pub fn stop(&mut self) {
        self.stopped = true;
        self.window.clear();
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }
}

fn overlap_ratio(a_start: u64, a_end: u64, b_start: u64, b_end: u64) -> f32 {
    let overlap_start = a_start.max(b_start);
    let overlap_end = a_end.min(b_end);
    if overlap_end <= overlap_start {
        return 0.0;
    }
    let overlap = (overlap_end - overlap_start) as f32;
    let a_len = (a_end.saturating_sub(a_start)).max(1) as f32;
    overlap / a_len
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DiarizationConfig {
        DiarizationConfig { reconcile_window_seconds: 2.0, assign_overlap_threshold: 0.3 }
    }

    #[test]
    fn overlap_above_threshold_emits_revision() {
        let mut reconciler = DiarizationReconciler::new(config());
        let event_id = Uuid::new_v4();
        reconciler.track(event_id, 0, 3000, Some("SPEAKER_00".into()));

        let segments = vec![RawDiarizedSegment {
            start_ms: 0,
            end_ms: 3000,
            text: "hi".into(),
            speaker: Some("SPEAKER_01".into()),
        }];
        let out = reconciler.reconcile(&segments);
        assert_eq!(out.updates.len(), 1);
        assert_eq!(out.updates[0].new_speaker_id, "SPEAKER_01");
        assert_eq!(out.updates[0].diarization_version, 2);
    }

    #[test]
    fn overlap_below_threshold_is_not_an_error_and_emits_nothing() {
        let mut reconciler = DiarizationReconciler::new(config());
        let event_id = Uuid::new_v4();
        reconciler.track(event_id, 0, 3000, Some("SPEAKER_00".into()));

        let segments = vec![RawDiarizedSegment {
            start_ms: 2900,
            end_ms: 3100,
            text: "barely".into(),
            speaker: Some("SPEAKER_01".into()),
        }];
        let out = reconciler.reconcile(&segments);
        assert!(out.updates.is_empty());
    }

    #[test]
    fn stop_clears_window_and_suppresses_further_updates() {
        let mut reconciler = DiarizationReconciler::new(config());
        let event_id = Uuid::new_v4();
        reconciler.track(event_id, 0, 3000, Some("SPEAKER_00".into()));
        reconciler.stop();

        let segments = vec![RawDiarizedSegment {
            start_ms: 0,
            end_ms: 3000,
            text: "hi".into(),
            speaker: Some("SPEAKER_01".into()),
        }];
        let out = reconciler.reconcile(&segments);
        assert!(out.updates.is_empty());
        assert_eq!(reconciler.window_len(), 0);
    }
}
