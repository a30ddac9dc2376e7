//! Transcript replay: feed a JSONL file of chat messages through the engine
//! and print what it decided for each line.

use std::path::Path;

use anyhow::{Context, Result};
use elsie_backend::config::EngineConfig;
use elsie_backend::roleplay::{IncomingMessage, LifecycleState, MessageOutcome, ResponseType};
use elsie_backend::runtime::BackendRuntimeBuilder;
use serde::{Deserialize, Serialize};

use crate::api::ApiClient;

#[derive(Debug, Clone)]
pub struct TranscriptLine {
    pub line: usize,
    pub message: IncomingMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayedDecision {
    pub line: usize,
    pub session_key: Option<String>,
    pub state: LifecycleState,
    pub should_respond: bool,
    pub response_type: ResponseType,
    pub rule: String,
    pub reasoning: String,
}

impl ReplayedDecision {
    fn from_outcome(line: usize, outcome: &MessageOutcome) -> Self {
        Self {
            line,
            session_key: outcome.session_key.clone(),
            state: outcome.session.lifecycle_state,
            should_respond: outcome.decision.should_respond,
            response_type: outcome.decision.response_type,
            rule: outcome.decision.rule.as_str().to_string(),
            reasoning: outcome.decision.reasoning.clone(),
        }
    }
}

/// One `IncomingMessage` JSON object per line. Blank lines and lines
/// starting with `#` are skipped.
pub fn parse_transcript(text: &str) -> Result<Vec<TranscriptLine>> {
    let mut lines = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let message: IncomingMessage = serde_json::from_str(trimmed)
            .with_context(|| format!("Invalid message on line {}", index + 1))?;
        lines.push(TranscriptLine {
            line: index + 1,
            message,
        });
    }
    Ok(lines)
}

pub fn load_transcript(path: &Path) -> Result<Vec<TranscriptLine>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read transcript {}", path.display()))?;
    parse_transcript(&text)
}

/// Runs the transcript through a fresh in-process engine. Nothing is
/// journaled or dispatched.
pub async fn replay_offline(
    config: EngineConfig,
    transcript: &[TranscriptLine],
) -> Result<Vec<ReplayedDecision>> {
    let runtime = BackendRuntimeBuilder::detached(config).build()?;
    let mut decisions = Vec::with_capacity(transcript.len());
    for entry in transcript {
        let outcome = runtime.engine.process(&entry.message).await;
        decisions.push(ReplayedDecision::from_outcome(entry.line, &outcome));
    }
    Ok(decisions)
}

pub async fn replay_remote(
    client: &ApiClient,
    transcript: &[TranscriptLine],
) -> Result<Vec<ReplayedDecision>> {
    let mut decisions = Vec::with_capacity(transcript.len());
    for entry in transcript {
        let outcome = client
            .send_message(&entry.message)
            .await
            .with_context(|| format!("Backend rejected line {}", entry.line))?;
        decisions.push(ReplayedDecision::from_outcome(entry.line, &outcome));
    }
    Ok(decisions)
}
