/*
 * Conversation Graph Engine - Error Taxonomy
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

//! Error kinds named after the taxonomy in the design doc, not generic
//! wrappers. Recoverable kinds are surfaced to subscribers as
//! `processing_status` events (see `hub.rs`); fatal kinds drive a session
//! into `FAILED`.

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sequence_number {got} is not greater than current max {max} for session")]
    SequenceViolation { got: u64, max: u64 },

    #[error("storage backend error: {0}")]
    Backend(#[from] sqlx::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SttError {
    #[error("transport error calling STT provider: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("STT provider timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("STT response missing required `text` field")]
    MissingText,

    #[error("STT response was not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("transport error calling LLM provider: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("LLM provider timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("LLM response was not valid JSON after retry")]
    InvalidJson,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("session {0} not found")]
    NotFound(uuid::Uuid),

    #[error("audio ingress backpressure overflow for session {0}")]
    Backpressure(uuid::Uuid),

    #[error("session {0} is already closing")]
    AlreadyClosing(uuid::Uuid),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("first message must be session_meta")]
    MissingSessionMeta,

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unauthorized: bearer token did not match")]
    Unauthorized,
}

/// A fatal, unrecoverable error for a single session. The owner task
/// returns this from its run loop; the registry reacts by emitting a
/// terminal `processing_status{level:error}` and tearing the session down.
#[derive(Debug, thiserror::Error)]
pub enum FatalSessionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("unrecoverable storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("session invariant violated: {0}")]
    InvariantViolation(String),
}
