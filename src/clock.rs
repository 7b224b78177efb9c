/*
 * Conversation Graph Engine - Monotonic Clock
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

//! The server's monotonic clock is the only basis for reconciliation
//! alignment; client-reported timestamps are advisory only (invariant 7).

use std::time::Instant;

/// A process-local monotonic timestamp. Not comparable across processes or
/// after a restart — only ever used to measure elapsed wall-clock within a
/// single running server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MonotonicInstant(Instant);

impl MonotonicInstant {
    pub fn now() -> Self {
        Self(Instant::now())
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.0.elapsed()
    }

    pub fn duration_since(&self, earlier: MonotonicInstant) -> std::time::Duration {
        self.0.duration_since(earlier.0)
    }
}
