/*
 * Conversation Graph Engine - Ingress Adapters
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

//! The two edges clients actually talk to: a live WebSocket for streaming
//! microphone audio, and an SSE endpoint for uploading a file (audio or an
//! already-transcribed VTT/SRT/text export) and watching it get processed.

pub mod sse;
pub mod ws;

use std::sync::Arc;

use uuid::Uuid;

use crate::config::AppConfig;
use crate::http_clients::OutboundLimits;
use crate::registry::SessionRegistry;
use crate::store::EventStore;

/// Shared state every handler in this module reaches through `axum::State`.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub store: EventStore,
    pub config: Arc<AppConfig>,
    pub limits: OutboundLimits,
}

impl AppState {
    pub fn new(registry: Arc<SessionRegistry>, store: EventStore, config: Arc<AppConfig>, limits: OutboundLimits) -> Self {
        Self { registry, store, config, limits }
    }
}

fn authorized(state: &AppState, header: Option<&str>) -> bool {
    match &state.config.auth_token {
        None => true,
        Some(expected) => match header {
            Some(h) => h.strip_prefix("Bearer ").map(|t| t == expected).unwrap_or(false),
            None => false,
        },
    }
}

pub(crate) fn new_session_id() -> Uuid {
    Uuid::new_v4()
}
