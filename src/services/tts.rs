//! TTS Adapter
//!
//! Posts text to the TTS endpoint and materializes whatever shape the reply
//! takes (raw audio bytes, a URL, a local path, or base64) into a WAV file.

use crate::error::{Result, RjError};
use base64::Engine;
use bytes::Bytes;
use serde_json::Value;
use std::path::Path;
use tracing::debug;

const URL_KEYS: &[&str] = &["audio_url", "url", "file_url", "download_url"];
const PATH_KEYS: &[&str] = &["audio_path", "file_path", "path", "output_path"];
const BASE64_KEYS: &[&str] = &["audio_base64", "wav_base64", "base64", "audio"];

/// The decoded reply of the TTS endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum TtsPayload {
    Bytes(Bytes),
    Url(String),
    LocalPath(String),
    Base64(String),
}

/// Total decode of a JSON reply into a payload, in key-priority order.
pub fn payload_from_json(value: &Value) -> Result<TtsPayload> {
    let obj = value.as_object().ok_or_else(|| RjError::TtsUnsupportedPayload {
        keys_seen: Vec::new(),
    })?;

    for key in URL_KEYS {
        if let Some(url) = obj.get(*key).and_then(Value::as_str) {
            return Ok(TtsPayload::Url(url.to_string()));
        }
    }
    for key in PATH_KEYS {
        if let Some(path) = obj.get(*key).and_then(Value::as_str) {
            return Ok(TtsPayload::LocalPath(path.to_string()));
        }
    }
    for key in BASE64_KEYS {
        if let Some(data) = obj.get(*key).and_then(Value::as_str) {
            return Ok(TtsPayload::Base64(data.to_string()));
        }
    }

    Err(RjError::TtsUnsupportedPayload {
        keys_seen: obj.keys().cloned().collect(),
    })
}

pub struct TtsClient {
    client: reqwest::Client,
    base_url: String,
}

impl TtsClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Synthesize `text` into a WAV at `out`.
    pub async fn synthesize(&self, text: &str, out: &Path) -> Result<()> {
        let url = format!("{}/generate", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(|e| RjError::Tts(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RjError::Tts(format!("endpoint returned {}: {}", status, body)));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let payload = if content_type.starts_with("audio/") {
            let bytes = response
                .bytes()
                .await
                .map_err(|e| RjError::Tts(format!("reading audio body: {}", e)))?;
            TtsPayload::Bytes(bytes)
        } else {
            let value: Value = response
                .json()
                .await
                .map_err(|e| RjError::Tts(format!("parsing JSON body: {}", e)))?;
            payload_from_json(&value)?
        };

        self.materialize(payload, out).await
    }

    async fn materialize(&self, payload: TtsPayload, out: &Path) -> Result<()> {
        match payload {
            TtsPayload::Bytes(bytes) => {
                debug!("TTS: writing {} body bytes", bytes.len());
                tokio::fs::write(out, &bytes).await?;
            }
            TtsPayload::Url(url) => {
                debug!("TTS: fetching {}", url);
                let bytes = self
                    .client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| RjError::Tts(format!("fetching {}: {}", url, e)))?
                    .bytes()
                    .await
                    .map_err(|e| RjError::Tts(format!("reading {}: {}", url, e)))?;
                tokio::fs::write(out, &bytes).await?;
            }
            TtsPayload::LocalPath(path) => {
                debug!("TTS: copying {}", path);
                tokio::fs::copy(&path, out).await?;
            }
            TtsPayload::Base64(data) => {
                let encoded = strip_data_uri(&data);
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(encoded.as_bytes())
                    .map_err(|e| RjError::Tts(format!("invalid base64 payload: {}", e)))?;
                tokio::fs::write(out, &bytes).await?;
            }
        }
        Ok(())
    }
}

fn strip_data_uri(data: &str) -> &str {
    if data.starts_with("data:") {
        data.split_once(',').map(|(_, rest)| rest).unwrap_or(data)
    } else {
        data
    }
}
