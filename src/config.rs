/*
 * Conversation Graph Engine - Configuration
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

//! Process-level defaults read once from the environment, plus the frozen
//! per-session snapshot composed from those defaults overlaid with
//! per-request overrides. The snapshot never changes after a session
//! starts, which keeps reconnect/replay behavior reproducible (design note
//! in the spec: "Dynamic LLM configuration").

use std::env;

#[derive(Debug, Clone)]
pub struct SttConfig {
    pub vad_enabled: bool,
    pub vad_min_seconds: f32,
    pub vad_max_seconds: f32,
    pub vad_silence_ms: u64,
    pub fixed_interval_seconds: f32,
    pub http_url: String,
    pub model: Option<String>,
    pub language: Option<String>,
    pub timeout_seconds_live: u64,
    pub timeout_seconds_file: u64,
    pub pool_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub http_url: String,
    pub model: String,
    pub request_timeout_seconds: u64,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct AccumulatorConfig {
    pub chunk_target_words: usize,
    pub chunk_overlap_words: usize,
    pub idle_timeout_seconds: f32,
}

#[derive(Debug, Clone)]
pub struct DiarizationConfig {
    pub reconcile_window_seconds: f32,
    pub assign_overlap_threshold: f32,
}

/// Process-wide defaults, read once at startup from the environment
/// variables named in the spec's external-interfaces section.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub auth_token: Option<String>,
    pub max_body_bytes: usize,
    pub database_url: String,
    pub stt: SttConfig,
    pub llm: LlmConfig,
    pub accumulator: AccumulatorConfig,
    pub diarization: DiarizationConfig,
    pub http_out_permits: usize,
    pub llm_in_flight_permits: usize,
    pub drain_timeout_seconds: u64,
    pub cancel_grace_seconds: u64,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<bool>().ok())
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl AppConfig {
    /// Load defaults from the process environment, following the donor's
    /// convention of env-var-with-fallback rather than a config file.
    pub fn load() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let stt = SttConfig {
            vad_enabled: env_bool("STT_VAD_ENABLED", true),
            vad_min_seconds: env_parse("STT_VAD_MIN_SECONDS", 0.5),
            vad_max_seconds: env_parse("STT_VAD_MAX_SECONDS", 5.0),
            vad_silence_ms: env_parse("STT_VAD_SILENCE_MS", 300),
            fixed_interval_seconds: env_parse("STT_FIXED_INTERVAL_SECONDS", 1.2),
            http_url: env_or("STT_DEFAULT_URL", "http://localhost:9000/transcribe"),
            model: env::var("STT_DEFAULT_MODEL").ok(),
            language: env::var("STT_DEFAULT_LANGUAGE").ok(),
            timeout_seconds_live: 10,
            timeout_seconds_file: 120,
            pool_enabled: env_bool("STT_HTTP_POOL_ENABLED", true),
        };

        let llm = LlmConfig {
            http_url: env_or("LLM_DEFAULT_URL", "http://localhost:11434/v1/chat/completions"),
            model: env_or("LLM_DEFAULT_MODEL", "llama3"),
            request_timeout_seconds: env_parse("LLM_REQUEST_TIMEOUT_SECONDS", 45),
            temperature: 0.2,
            max_tokens: 1500,
        };

        let accumulator = AccumulatorConfig {
            chunk_target_words: 200,
            chunk_overlap_words: 30,
            idle_timeout_seconds: 6.0,
        };

        let diarization = DiarizationConfig {
            reconcile_window_seconds: 2.0,
            assign_overlap_threshold: 0.3,
        };

        Ok(Self {
            bind_addr: env_or("BIND_ADDR", "0.0.0.0:8080"),
            auth_token: env::var("AUTH_TOKEN").ok(),
            max_body_bytes: env_parse("MAX_BODY_BYTES", 52_428_800),
            database_url: env_or("DATABASE_URL", "sqlite://conversation_graph.db"),
            stt,
            llm,
            accumulator,
            diarization,
            http_out_permits: 32,
            llm_in_flight_permits: 8,
            drain_timeout_seconds: 3,
            cancel_grace_seconds: 1,
        })
    }
}

/// Per-request overrides accepted in `session_meta` or the file-upload form.
/// Overlaid onto [`AppConfig`] defaults once, at session start, to produce
/// the frozen snapshot each session runs with for its entire lifetime.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct SttConfigOverride {
    pub vad_enabled: Option<bool>,
    pub model: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct LlmConfigOverride {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl SttConfig {
    pub fn overlay(&self, over: Option<&SttConfigOverride>) -> Self {
        let mut snap = self.clone();
        if let Some(o) = over {
            if let Some(v) = o.vad_enabled {
                snap.vad_enabled = v;
            }
            if let Some(ref m) = o.model {
                snap.model = Some(m.clone());
            }
            if let Some(ref l) = o.language {
                snap.language = Some(l.clone());
            }
        }
        snap
    }
}

impl LlmConfig {
    pub fn overlay(&self, over: Option<&LlmConfigOverride>) -> Self {
        let mut snap = self.clone();
        if let Some(o) = over {
            if let Some(ref m) = o.model {
                snap.model = m.clone();
            }
            if let Some(t) = o.temperature {
                snap.temperature = t;
            }
            if let Some(mt) = o.max_tokens {
                snap.max_tokens = mt;
            }
        }
        snap
    }
}
