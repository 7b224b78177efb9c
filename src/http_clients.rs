/*
 * Conversation Graph Engine - Shared Outbound HTTP Resources
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

//! Process-wide caps shared by every session: a fairness bound on total
//! outbound HTTP calls (STT + LLM combined) and a tighter bound on
//! concurrent LLM calls specifically, per the design doc's "mandatory
//! backpressure/fairness caps".

use std::sync::Arc;

use tokio::sync::Semaphore;

/// Held by `AppState`; cloned (as `Arc`) into every session owner task.
#[derive(Clone)]
pub struct OutboundLimits {
    pub http_out: Arc<Semaphore>,
    pub llm_in_flight: Arc<Semaphore>,
}

impl OutboundLimits {
    pub fn new(http_out_permits: usize, llm_in_flight_permits: usize) -> Self {
        Self {
            http_out: Arc::new(Semaphore::new(http_out_permits)),
            llm_in_flight: Arc::new(Semaphore::new(llm_in_flight_permits)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permits_are_bounded() {
        let limits = OutboundLimits::new(2, 1);
        let _a = limits.http_out.clone().acquire_owned().await.unwrap();
        let _b = limits.http_out.clone().acquire_owned().await.unwrap();
        assert_eq!(limits.http_out.available_permits(), 0);
    }
}
