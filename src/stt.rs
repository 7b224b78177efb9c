/*
 * Conversation Graph Engine - Speech-to-Text Driver
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

//! Buffers raw PCM, decides flush boundaries (VAD or fixed interval), and
//! POSTs the buffered audio to an external STT HTTP provider. Mirrors the
//! donor's rolling-buffer-plus-periodic-flush shape, generalized to also
//! support voice-activity-aware flushing.

use std::collections::VecDeque;
use std::io::Cursor;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::config::SttConfig;
use crate::error::SttError;

const SAMPLE_RATE: u32 = 16_000;
const BYTES_PER_SAMPLE: usize = 2;

/// Two seconds of mono 16-bit PCM @ 16 kHz — the hard cap on buffered
/// bytes per the "Backpressure bound" testable property.
pub const MAX_BUFFER_BYTES: usize = 2 * SAMPLE_RATE as usize * BYTES_PER_SAMPLE;

/// A raw diarized segment as reported by the provider, before it is
/// reconciled against transcript events.
#[derive(Debug, Clone)]
pub struct RawDiarizedSegment {
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
    pub speaker: Option<String>,
}

pub struct SttResult {
    pub text: String,
    pub segments: Option<Vec<RawDiarizedSegment>>,
    pub provider_latency_ms: u64,
}

/// In-memory ring of PCM bytes scoped to one session, mutated only by the
/// STT driver (per the data model's `AudioBuffer` ownership rule).
pub struct AudioBuffer {
    bytes: VecDeque<u8>,
    pub started_at: Instant,
    pub last_voice_at: Option<Instant>,
}

impl Default for AudioBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBuffer {
    pub fn new() -> Self {
        Self { bytes: VecDeque::new(), started_at: Instant::now(), last_voice_at: None }
    }

    /// Appends frame bytes, dropping the oldest bytes if the two-second
    /// cap would otherwise be exceeded (per-session bounded queue,
    /// overflow drops the oldest frame).
    pub fn push(&mut self, frame: &[u8]) -> bool {
        let mut overflowed = false;
        for &b in frame {
            if self.bytes.len() >= MAX_BUFFER_BYTES {
                self.bytes.pop_front();
                overflowed = true;
            }
            self.bytes.push_back(b);
        }
        overflowed
    }

    pub fn duration_seconds(&self) -> f32 {
        (self.bytes.len() / BYTES_PER_SAMPLE) as f32 / SAMPLE_RATE as f32
    }

    pub fn len_bytes(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn drain_to_vec(&mut self) -> Vec<u8> {
        self.bytes.drain(..).collect()
    }

    /// RMS energy of the newest `window_ms` of buffered audio, used by the
    /// VAD trailing-silence check.
    pub fn trailing_rms(&self, window_ms: u64) -> f32 {
        let window_samples = (window_ms as u32 * SAMPLE_RATE / 1000) as usize;
        let window_bytes = window_samples * BYTES_PER_SAMPLE;
        let start = self.bytes.len().saturating_sub(window_bytes);
        let mut sum_sq = 0f64;
        let mut n = 0usize;
        let tail: Vec<u8> = self.bytes.iter().skip(start).copied().collect();
        for chunk in tail.chunks_exact(2) {
            let sample = i16::from_le_bytes([chunk[0], chunk[1]]) as f64;
            sum_sq += sample * sample;
            n += 1;
        }
        if n == 0 {
            return 0.0;
        }
        (sum_sq / n as f64).sqrt() as f32
    }
}

/// Energy threshold below which a window is considered silence. Chosen
/// conservatively for 16-bit PCM; providers' own VAD would replace this in
/// a production deployment, but the contract only requires a trailing-
/// silence decision, not a specific algorithm.
const SILENCE_RMS_THRESHOLD: f32 = 200.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    VadSilence,
    VadMaxDuration,
    FixedInterval,
    SessionClose,
}

pub struct SttDriver {
    config: SttConfig,
    client: reqwest::Client,
    buffer: AudioBuffer,
    last_fixed_flush: Instant,
}

impl SttDriver {
    pub fn new(config: SttConfig) -> Self {
        let client = if config.pool_enabled {
            reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_seconds_live))
                .build()
                .unwrap_or_default()
        } else {
            reqwest::Client::new()
        };
        Self { config, client, buffer: AudioBuffer::new(), last_fixed_flush: Instant::now() }
    }

    pub fn push_frame(&mut self, frame: &[u8]) -> bool {
        let overflowed = self.buffer.push(frame);
        if self.trailing_is_voice() {
            self.buffer.last_voice_at = Some(Instant::now());
        }
        overflowed
    }

    fn trailing_is_voice(&self) -> bool {
        self.buffer.trailing_rms(self.config.vad_silence_ms) > SILENCE_RMS_THRESHOLD
    }

    /// Decides whether the current buffer should be flushed right now,
    /// per the flush policy in the design doc.
    pub fn should_flush(&self) -> Option<FlushReason> {
        if self.buffer.is_empty() {
            return None;
        }
        let duration = self.buffer.duration_seconds();

        if self.config.vad_enabled {
            if duration >= self.config.vad_max_seconds {
                return Some(FlushReason::VadMaxDuration);
            }
            if duration >= self.config.vad_min_seconds {
                let silent_for = self
                    .buffer
                    .last_voice_at
                    .map(|t| t.elapsed())
                    .unwrap_or_else(|| self.buffer.started_at.elapsed());
                if silent_for >= Duration::from_millis(self.config.vad_silence_ms) {
                    return Some(FlushReason::VadSilence);
                }
            }
            None
        } else if self.last_fixed_flush.elapsed() >= Duration::from_secs_f32(self.config.fixed_interval_seconds) {
            Some(FlushReason::FixedInterval)
        } else {
            None
        }
    }

    /// Sends the buffered audio to the STT provider and clears it. Used
    /// both for periodic flushes and the unconditional flush-on-close.
    pub async fn flush(&mut self, timeout: Duration) -> Result<Option<SttResult>, SttError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let pcm = self.buffer.drain_to_vec();
        self.last_fixed_flush = Instant::now();
        let wav = encode_wav(&pcm);

        let result = tokio::time::timeout(timeout, self.post_audio(wav)).await;
        match result {
            Ok(inner) => inner.map(Some),
            Err(_) => Err(SttError::Timeout(timeout)),
        }
    }

    async fn post_audio(&self, wav_bytes: Vec<u8>) -> Result<SttResult, SttError> {
        let start = Instant::now();
        let mut form = reqwest::multipart::Form::new().part(
            "file",
            reqwest::multipart::Part::bytes(wav_bytes)
                .file_name("audio.wav")
                .mime_str("audio/wav")
                .map_err(|e| SttError::Transport(e))?,
        );
        if let Some(ref model) = self.config.model {
            form = form.text("model", model.clone());
        }
        if let Some(ref language) = self.config.language {
            form = form.text("language", language.clone());
        }

        let response = self
            .client
            .post(&self.config.http_url)
            .multipart(form)
            .send()
            .await?
            .error_for_status()?;

        let body: Value = response.json().await?;
        let latency_ms = start.elapsed().as_millis() as u64;
        parse_stt_response(&body, latency_ms)
    }

    pub fn buffer_len_bytes(&self) -> usize {
        self.buffer.len_bytes()
    }
}

/// One-shot file-upload transcription: a single POST of the whole file,
/// bypassing the live `AudioBuffer`/VAD pipeline entirely (which would
/// otherwise cap the buffered audio at two seconds) and bounded by
/// `timeout_seconds_file` rather than the live-mode timeout.
pub async fn transcribe_file(config: &SttConfig, file_bytes: Vec<u8>, file_name: &str) -> Result<SttResult, SttError> {
    let client = reqwest::Client::new();
    let start = Instant::now();

    let mut form = reqwest::multipart::Form::new()
        .part("file", reqwest::multipart::Part::bytes(file_bytes).file_name(file_name.to_string()));
    if let Some(ref model) = config.model {
        form = form.text("model", model.clone());
    }
    if let Some(ref language) = config.language {
        form = form.text("language", language.clone());
    }

    let timeout = Duration::from_secs(config.timeout_seconds_file);
    let request = client.post(&config.http_url).multipart(form).send();
    let response = tokio::time::timeout(timeout, request)
        .await
        .map_err(|_| SttError::Timeout(timeout))??
        .error_for_status()?;

    let body: Value = response.json().await?;
    let latency_ms = start.elapsed().as_millis() as u64;
    parse_stt_response(&body, latency_ms)
}

fn encode_wav(pcm: &[u8]) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).expect("valid wav spec");
        for chunk in pcm.chunks_exact(2) {
            let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
            writer.write_sample(sample).ok();
        }
        writer.finalize().ok();
    }
    cursor.into_inner()
}

/// Supports all three response shapes named in the external interface:
/// `{segments:[...]}`, `{text, timestamps:[...], speakers:[...]}`, and a
/// plain `{text}`.
fn parse_stt_response(body: &Value, latency_ms: u64) -> Result<SttResult, SttError> {
    let text = body
        .get("text")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(SttError::MissingText)?;

    let raw_segments = body
        .get("segments")
        .or_else(|| body.get("timestamps"))
        .and_then(Value::as_array);

    let segments = raw_segments.map(|arr| {
        arr.iter()
            .filter_map(|s| {
                let start = s.get("start").and_then(Value::as_f64)?;
                let end = s.get("end").and_then(Value::as_f64)?;
                let seg_text = s.get("text").and_then(Value::as_str).unwrap_or_default().to_string();
                let speaker = s.get("speaker").and_then(Value::as_str).map(str::to_string);
                Some(RawDiarizedSegment {
                    start_ms: (start * 1000.0) as u64,
                    end_ms: (end * 1000.0) as u64,
                    text: seg_text,
                    speaker,
                })
            })
            .collect::<Vec<_>>()
    });

    // If none of the segments carry a speaker, the contract says segments
    // should be treated as absent.
    let segments = segments.filter(|s| s.iter().any(|seg| seg.speaker.is_some()));

    Ok(SttResult { text, segments, provider_latency_ms: latency_ms })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_buffer_caps_at_two_seconds() {
        let mut buf = AudioBuffer::new();
        let frame = vec![0u8; MAX_BUFFER_BYTES + 100];
        let overflowed = buf.push(&frame);
        assert!(overflowed);
        assert_eq!(buf.len_bytes(), MAX_BUFFER_BYTES);
    }

    #[test]
    fn parse_stt_response_plain_text() {
        let body = serde_json::json!({"text": "hello there"});
        let result = parse_stt_response(&body, 10).unwrap();
        assert_eq!(result.text, "hello there");
        assert!(result.segments.is_none());
    }

    #[test]
    fn parse_stt_response_missing_text_errors() {
        let body = serde_json::json!({"segments": []});
        let err = parse_stt_response(&body, 10);
        assert!(matches!(err, Err(SttError::MissingText)));
    }

    #[test]
    fn parse_stt_response_segments_without_speaker_becomes_none() {
        let body = serde_json::json!({
            "text": "hi",
            "segments": [{"start": 0.0, "end": 1.0, "text": "hi"}]
        });
        let result = parse_stt_response(&body, 10).unwrap();
        assert!(result.segments.is_none());
    }

    #[test]
    fn parse_stt_response_segments_with_speaker_kept() {
        let body = serde_json::json!({
            "text": "hi there",
            "segments": [
                {"start": 0.0, "end": 3.0, "text": "Hi", "speaker": "SPEAKER_00"},
                {"start": 3.0, "end": 6.0, "text": "Hello", "speaker": "SPEAKER_01"}
            ]
        });
        let result = parse_stt_response(&body, 10).unwrap();
        let segments = result.segments.unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].speaker.as_deref(), Some("SPEAKER_00"));
    }
}
