//! Distress phrase detection
//!
//! Scans transcripts for configured phrases. A match fires at most once per
//! listening cycle; the state machine re-arms the engine when the session
//! it started is closed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

/// Lower-cased recognition text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript(String);

impl Transcript {
    pub fn new(text: &str) -> Self {
        Self(text.to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

/// A detected distress phrase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistressEvent {
    /// The configured phrase that matched
    pub matched_phrase: String,

    /// When the match was observed
    pub occurred_at: DateTime<Utc>,
}

/// Phrase scanner with per-cycle debounce
#[derive(Debug, Clone)]
pub struct DetectionEngine {
    phrases: Vec<String>,
    fired: bool,
}

impl DetectionEngine {
    /// Create an engine; phrases are matched in the given order
    pub fn new(phrases: Vec<String>) -> Self {
        let phrases: Vec<String> = phrases
            .into_iter()
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();

        debug!("Detection engine armed with {} phrase(s)", phrases.len());

        Self {
            phrases,
            fired: false,
        }
    }

    pub fn phrases(&self) -> &[String] {
        &self.phrases
    }

    /// First configured phrase contained in the transcript
    pub fn scan<'a>(&'a self, transcript: &Transcript) -> Option<&'a str> {
        if transcript.is_empty() {
            return None;
        }

        self.phrases
            .iter()
            .find(|phrase| transcript.as_str().contains(phrase.as_str()))
            .map(|p| p.as_str())
    }

    /// Feed a transcript; yields an event only on the first match of a cycle
    pub fn on_transcript(&mut self, text: &str) -> Option<DistressEvent> {
        let transcript = Transcript::new(text);
        trace!("Transcript: {}", transcript.as_str());

        if self.fired {
            return None;
        }

        let matched = self.scan(&transcript)?.to_string();
        self.fired = true;

        info!("Distress phrase detected: \"{}\"", matched);

        Some(DistressEvent {
            matched_phrase: matched,
            occurred_at: Utc::now(),
        })
    }

    /// Whether a match has already fired in this cycle
    pub fn is_latched(&self) -> bool {
        self.fired
    }

    /// Start a new listening cycle
    pub fn rearm(&mut self) {
        if self.fired {
            debug!("Detection engine re-armed");
        }
        self.fired = false;
    }
}
