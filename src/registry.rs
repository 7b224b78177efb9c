/*
 * Conversation Graph Engine - Session Registry
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

//! A process-wide `session_id -> SessionHandle` map. Insert/remove go
//! through a single lock (spec's "Shared-resource policy"); once a handle
//! is cloned out, further reads and sends are lock-free.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::RegistryError;
use crate::hub::HubEvent;
use crate::session::SessionInbound;

const AUDIO_QUEUE_CAPACITY: usize = 64;

/// A cloneable, lock-free (after lookup) reference to a running session's
/// owner task. All state mutation happens inside that task; this handle
/// only ever sends onto bounded channels into it.
#[derive(Clone)]
pub struct SessionHandle {
    pub session_id: Uuid,
    inbound_tx: mpsc::Sender<SessionInbound>,
    cancel: CancellationToken,
    closing: Arc<std::sync::atomic::AtomicBool>,
}

impl SessionHandle {
    pub fn new(session_id: Uuid, inbound_tx: mpsc::Sender<SessionInbound>, cancel: CancellationToken) -> Self {
        Self {
            session_id,
            inbound_tx,
            cancel,
            closing: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    /// Non-blocking; fails only on backpressure overflow (the bounded
    /// audio queue is full), per spec.
    pub fn push_audio(&self, frame_bytes: Vec<u8>, t_received: std::time::Instant) -> Result<(), RegistryError> {
        self.inbound_tx
            .try_send(SessionInbound::AudioFrame { frame_bytes, t_received })
            .map_err(|_| RegistryError::Backpressure(self.session_id))
    }

    pub fn push_transcript_event(&self, raw: crate::types::TranscriptEvent) -> Result<(), RegistryError> {
        self.inbound_tx
            .try_send(SessionInbound::ForwardedTranscript(Box::new(raw)))
            .map_err(|_| RegistryError::Backpressure(self.session_id))
    }

    /// Delivers the connection's one-time `session_meta` message. Sent as
    /// a regular inbound message (not a constructor argument) so the
    /// owner task can be spawned before the first client frame arrives.
    pub fn push_session_meta(
        &self,
        speaker_default: String,
        store_audio: bool,
        stt_override: Option<crate::config::SttConfigOverride>,
        llm_override: Option<crate::config::LlmConfigOverride>,
    ) -> Result<(), RegistryError> {
        self.inbound_tx
            .try_send(SessionInbound::SessionMeta {
                speaker_default,
                store_audio,
                stt_override,
                llm_override,
            })
            .map_err(|_| RegistryError::Backpressure(self.session_id))
    }

    pub fn request_flush(&self) -> Result<(), RegistryError> {
        self.inbound_tx
            .try_send(SessionInbound::FlushRequested)
            .map_err(|_| RegistryError::Backpressure(self.session_id))
    }

    /// Registers a fan-out subscriber. Delegated to the owner task since
    /// only it touches the `Hub`.
    pub async fn subscribe(&self, since_seq: u64) -> Result<mpsc::Receiver<HubEvent>, RegistryError> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.inbound_tx
            .send(SessionInbound::Subscribe { since_seq, reply: reply_tx })
            .await
            .map_err(|_| RegistryError::NotFound(self.session_id))?;
        reply_rx.await.map_err(|_| RegistryError::NotFound(self.session_id))
    }

    /// Idempotent teardown: flushes pending audio, waits up to `T_drain`
    /// for in-flight LLM calls, then cancels.
    pub async fn close(&self, drain_timeout: Duration) {
        if self.closing.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        let _ = self.inbound_tx.send(SessionInbound::CloseRequested).await;
        let _ = tokio::time::timeout(drain_timeout, self.cancel.cancelled()).await;
        self.cancel.cancel();
    }
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<Uuid, SessionHandle>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self { sessions: Mutex::new(HashMap::new()) }
    }

    pub fn insert(&self, handle: SessionHandle) {
        self.sessions.lock().insert(handle.session_id, handle);
    }

    pub fn get(&self, session_id: Uuid) -> Option<SessionHandle> {
        self.sessions.lock().get(&session_id).cloned()
    }

    pub fn remove(&self, session_id: Uuid) -> Option<SessionHandle> {
        self.sessions.lock().remove(&session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn audio_queue_capacity() -> usize {
    AUDIO_QUEUE_CAPACITY
}
