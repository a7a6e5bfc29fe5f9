//! Commentary Generator
//!
//! Composes a host prompt from recent-track context and calls the
//! chat-completion endpoint. Falls back to a deterministic hand-off line when
//! the key is missing, the call fails, or the reply is empty, so the show
//! never stops for a model outage.

use crate::config::Config;
use crate::error::{Result, RjError};
use crate::models::Track;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::{info, warn};

/// How many past outputs are kept for phrase-frequency diagnostics.
const HISTORY_LEN: usize = 6;

const SYSTEM_PROMPT: &str = "You are a charismatic late-night radio host. Keep it rhythmic, \
broadcast-ready, and PG-13. Two to four sentences, no stage directions, no emoji.";

/// A track the station already played, as the prompt sees it.
#[derive(Debug, Clone)]
pub struct PlayedTrack {
    pub title: String,
    pub artist: String,
}

pub struct CommentaryGenerator {
    client: reqwest::Client,
    api_key: Option<String>,
    model: String,
    base_url: String,
    station_name: String,
    history: Mutex<VecDeque<String>>,
}

impl CommentaryGenerator {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: config.llm_api_key.clone(),
            model: config.llm_model.clone(),
            base_url: config.llm_base_url.clone(),
            station_name: config.station_name.clone(),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LEN)),
        }
    }

    /// Produce the next break's text. Never fails; the deterministic fallback
    /// covers every error path.
    pub async fn generate(&self, recent: &[PlayedTrack], upcoming: Option<&Track>) -> String {
        let text = match &self.api_key {
            None => {
                info!("Commentary: no API key, using fallback line");
                self.fallback_line(recent, upcoming)
            }
            Some(key) => match self.request_commentary(key, recent, upcoming).await {
                Ok(text) => text,
                Err(e) => {
                    warn!("Commentary call failed, using fallback: {}", e);
                    self.fallback_line(recent, upcoming)
                }
            },
        };
        self.remember(&text);
        text
    }

    pub fn fallback_line(&self, recent: &[PlayedTrack], upcoming: Option<&Track>) -> String {
        let last = recent
            .last()
            .map(|t| format!("{} by {}", t.title, t.artist))
            .unwrap_or_else(|| "that last track".to_string());
        let next = upcoming
            .map(|t| format!("{} by {}", t.title, t.artist))
            .unwrap_or_else(|| "our next song".to_string());
        format!(
            "That was {}. Now we roll into {}. You are listening to {}.",
            last, next, self.station_name
        )
    }

    async fn request_commentary(
        &self,
        api_key: &str,
        recent: &[PlayedTrack],
        upcoming: Option<&Track>,
    ) -> Result<String> {
        let recent_list = if recent.is_empty() {
            "nothing yet, the night is young".to_string()
        } else {
            recent
                .iter()
                .map(|t| format!("{} by {}", t.title, t.artist))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let next_line = upcoming
            .map(|t| format!("{} by {}", t.title, t.artist))
            .unwrap_or_else(|| "a surprise drop".to_string());

        let user_prompt = format!(
            "Station: {station}. Recently played: {recent}. Up next: {next}. \
Treat the next one as a {vibe}. Hand the listeners over to it.",
            station = self.station_name,
            recent = recent_list,
            next = next_line,
            vibe = vibe_tag(upcoming),
        );

        let url = format!(
            "{}/chat/completions",
            self.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&serde_json::json!({
                "model": self.model,
                "messages": [
                    { "role": "system", "content": SYSTEM_PROMPT },
                    { "role": "user", "content": user_prompt },
                ],
                "temperature": 1.5,
                "max_tokens": 2000,
            }))
            .send()
            .await
            .map_err(|e| RjError::Commentary(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RjError::Commentary(format!(
                "endpoint returned {}: {}",
                status, body
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RjError::Commentary(format!("malformed reply: {}", e)))?;

        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .trim()
            .to_string();

        if content.is_empty() {
            return Err(RjError::Commentary("empty completion".to_string()));
        }
        Ok(content)
    }

    fn remember(&self, text: &str) {
        let mut history = self.history.lock().expect("history mutex poisoned");
        if history.len() == HISTORY_LEN {
            history.pop_front();
        }
        history.push_back(text.to_string());
    }

    pub fn history(&self) -> Vec<String> {
        self.history
            .lock()
            .expect("history mutex poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Word frequencies across the retained history. Diagnostics only.
    pub fn phrase_frequencies(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for text in self.history() {
            for word in text.split_whitespace() {
                let word: String = word
                    .chars()
                    .filter(|c| c.is_alphanumeric())
                    .collect::<String>()
                    .to_lowercase();
                if word.len() > 3 {
                    *counts.entry(word).or_insert(0) += 1;
                }
            }
        }
        counts
    }
}

/// Genre-vibe tag derived from the upcoming track's energy and mood.
pub fn vibe_tag(upcoming: Option<&Track>) -> &'static str {
    let Some(track) = upcoming else {
        return "rhythmic momentum";
    };
    let mood = track.mood.to_lowercase();
    if track.energy >= 0.8 {
        "high-energy anthem"
    } else if mood.contains("chill") {
        "smooth laid-back"
    } else if mood.contains("dark") {
        "moody late-night cut"
    } else {
        "rhythmic momentum"
    }
}
