use std::collections::BTreeSet;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::addressing::{speech_segments, AddressingAnalyzer, AddressingType, TermMatch};
use super::character::{
    bracketed_names, emote_spans, extract_character_names, extract_speaker, Character,
    CharacterDirectory, CharacterProfile,
};
use super::message::IncomingMessage;
use super::noisy_or;
use super::session::Session;
use super::themes::{expertise_domains, expertise_matches, ThemeLexicon};
use super::tone::{
    classify_tone, contains_phrase, normalize_for_lookup, score_vulnerability, EmotionalTone,
};
use crate::config::EngineConfig;

/// Routine in-scene actions that invite a quiet service gesture.
const SERVICE_MARKERS: &[(&str, f32)] = &[
    ("sits at the bar", 0.6),
    ("takes a seat at the bar", 0.6),
    ("sits down at the bar", 0.6),
    ("pulls up a stool", 0.55),
    ("approaches the bar", 0.55),
    ("walks up to the bar", 0.55),
    ("leans on the bar", 0.45),
    ("leans against the bar", 0.45),
    ("taps the bar", 0.5),
    ("empty glass", 0.55),
    ("glass is empty", 0.55),
    ("raises a glass", 0.4),
    ("raises his glass", 0.4),
    ("raises her glass", 0.4),
    ("raises their glass", 0.4),
    ("orders", 0.5),
    ("another round", 0.55),
    ("refill", 0.5),
    ("signals for a drink", 0.6),
    ("looks around for service", 0.55),
];

/// Per-message signal bundle. Created fresh for every message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextualCues {
    pub speaker: Option<Character>,
    pub addressed_targets: Vec<Character>,
    pub addressing_type: AddressingType,
    pub addressing_confidence: f32,
    pub emotional_tone: EmotionalTone,
    pub vulnerability_score: f32,
    #[serde(default)]
    pub vulnerability_markers: Vec<String>,
    /// Themes across the recent turn window, this message included.
    pub conversation_themes: BTreeSet<String>,
    /// Themes carried by this message alone.
    #[serde(default)]
    pub message_themes: BTreeSet<String>,
    #[serde(default)]
    pub expertise_domains: BTreeSet<String>,
    pub expertise_matches: BTreeSet<String>,
    pub elsie_directly_addressed: bool,
    #[serde(default)]
    pub other_character_addressed: bool,
    #[serde(default)]
    pub group_term: Option<TermMatch>,
    #[serde(default)]
    pub mentioned_characters: Vec<String>,
    #[serde(default)]
    pub is_dialogue: bool,
    /// Confidence that the message is in-character roleplay.
    #[serde(default)]
    pub roleplay_signal: f32,
    /// Confidence that the message implies a routine service moment.
    #[serde(default)]
    pub service_signal: f32,
    /// Extraction failed and every field is at its unknown value.
    #[serde(default)]
    pub degraded: bool,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl ContextualCues {
    /// Maximal-unknown bundle used when extraction fails.
    pub fn unknown() -> Self {
        Self {
            speaker: None,
            addressed_targets: Vec::new(),
            addressing_type: AddressingType::None,
            addressing_confidence: 0.0,
            emotional_tone: EmotionalTone::neutral(),
            vulnerability_score: 0.0,
            vulnerability_markers: Vec::new(),
            conversation_themes: BTreeSet::new(),
            message_themes: BTreeSet::new(),
            expertise_domains: BTreeSet::new(),
            expertise_matches: BTreeSet::new(),
            elsie_directly_addressed: false,
            other_character_addressed: false,
            group_term: None,
            mentioned_characters: Vec::new(),
            is_dialogue: false,
            roleplay_signal: 0.0,
            service_signal: 0.0,
            degraded: true,
            notes: Vec::new(),
        }
    }

    pub fn speaker_name(&self) -> Option<&str> {
        self.speaker
            .as_ref()
            .map(|character| character.display_name.as_str())
    }

    /// Short `key=value` rendering for decision reasoning.
    pub fn summary(&self) -> String {
        let tags = |set: &BTreeSet<String>| {
            if set.is_empty() {
                "-".to_string()
            } else {
                set.iter().cloned().collect::<Vec<_>>().join("|")
            }
        };
        format!(
            "speaker={} addressing={}({:.2}) elsie_addressed={} tone={}({:.2}) vulnerability={:.2} themes={} expertise={}",
            self.speaker_name().unwrap_or("unknown"),
            self.addressing_type.as_str(),
            self.addressing_confidence,
            self.elsie_directly_addressed,
            self.emotional_tone.label.as_str(),
            self.emotional_tone.intensity,
            self.vulnerability_score,
            tags(&self.conversation_themes),
            tags(&self.expertise_matches),
        )
    }
}

/// Strongest service marker in the text.
pub fn service_signal(text: &str) -> f32 {
    let normalized = normalize_for_lookup(text);
    SERVICE_MARKERS
        .iter()
        .filter(|(phrase, _)| contains_phrase(&normalized, phrase))
        .map(|(_, weight)| *weight)
        .fold(0.0, f32::max)
}

/// Confidence that a message is in-character roleplay, from its markup.
pub fn roleplay_signal(text: &str, has_speaker_marker: bool, reserved: &[String]) -> f32 {
    let emotes = emote_spans(text).len();
    let quoted = text.contains('"') || text.contains('“');
    let bracketed = !bracketed_names(text, reserved).is_empty();
    noisy_or([
        match emotes {
            0 => 0.0,
            1 => 0.5,
            _ => 0.65,
        },
        if has_speaker_marker { 0.55 } else { 0.0 },
        if quoted { 0.35 } else { 0.0 },
        if bracketed && !has_speaker_marker {
            0.3
        } else {
            0.0
        },
    ])
}

/// Builds [`ContextualCues`] for one message against a read-only session view.
#[derive(Debug, Clone)]
pub struct CueBuilder {
    profile: CharacterProfile,
    directory: CharacterDirectory,
    analyzer: AddressingAnalyzer,
    lexicon: ThemeLexicon,
    reserved_tags: Vec<String>,
    max_message_chars: usize,
}

impl CueBuilder {
    pub fn new(config: &EngineConfig, reserved_tags: Vec<String>) -> Self {
        let profile = CharacterProfile::from_config(config);
        let directory = CharacterDirectory::from_config(config);
        Self {
            analyzer: AddressingAnalyzer::new(profile.clone(), directory.clone()),
            lexicon: ThemeLexicon::with_extra(&config.theme_keywords),
            profile,
            directory,
            reserved_tags,
            max_message_chars: config.max_message_chars.max(1),
        }
    }

    pub fn profile(&self) -> &CharacterProfile {
        &self.profile
    }

    pub fn directory(&self) -> &CharacterDirectory {
        &self.directory
    }

    pub fn lexicon(&self) -> &ThemeLexicon {
        &self.lexicon
    }

    fn validate(&self, text: &str) -> Result<()> {
        let length = text.chars().count();
        if length > self.max_message_chars {
            bail!(
                "message is {} characters, limit is {}",
                length,
                self.max_message_chars
            );
        }
        if let Some(bad) = text
            .chars()
            .find(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
        {
            bail!("message contains control character U+{:04X}", bad as u32);
        }
        Ok(())
    }

    pub fn build(&self, message: &IncomingMessage, session: &Session) -> Result<ContextualCues> {
        let text = message.raw_text.as_str();
        self.validate(text)?;
        let at = message.timestamp;
        let mut notes = Vec::new();

        let marker = extract_speaker(text, &self.reserved_tags)
            .filter(|marker| !self.profile.refers_to_self(&marker.name));
        let body = marker
            .as_ref()
            .map(|marker| marker.body.as_str())
            .unwrap_or(text);

        let speaker_name = match &marker {
            Some(marker) => Some(self.directory.canonical_name(&marker.name)),
            None => session
                .character_for_author(&message.author_id)
                .map(str::to_string),
        };
        if marker.is_none() && speaker_name.is_some() {
            notes.push("speaker remembered from earlier marker".to_string());
        }
        let speaker = speaker_name
            .as_deref()
            .map(|name| self.resolve_character(name, session, at));

        let roster = session.roster();
        let addressing =
            self.analyzer
                .analyze(body, &roster, speaker_name.as_deref(), message.is_direct_message);
        notes.extend(addressing.notes.iter().cloned());

        let emotional_tone = classify_tone(body);
        let vulnerability = score_vulnerability(body, &emotional_tone);

        let message_themes = self.lexicon.detect(body);
        let mut conversation_themes = session.conversation_themes();
        conversation_themes.extend(message_themes.iter().cloned());

        let service = service_signal(body);
        let topical = service <= 0.0 && !addressing.other_character_addressed();
        let domains = expertise_domains(
            &self.profile,
            &self.directory,
            speaker_name.as_deref(),
            topical,
        );
        let matches = expertise_matches(&domains, &conversation_themes);

        let addressed_targets = addressing
            .targets
            .iter()
            .map(|name| self.resolve_character(name, session, at))
            .collect();

        let mentioned_characters = extract_character_names(body, &self.profile, &self.reserved_tags)
            .into_iter()
            .map(|name| self.directory.canonical_name(&name))
            .collect();

        let has_speech = !speech_segments(body).is_empty();
        let is_dialogue = marker.is_some() || has_speech;

        Ok(ContextualCues {
            speaker,
            addressed_targets,
            addressing_type: addressing.addressing_type,
            addressing_confidence: addressing.confidence,
            emotional_tone,
            vulnerability_score: vulnerability.score,
            vulnerability_markers: vulnerability.markers,
            conversation_themes,
            message_themes,
            expertise_domains: domains,
            expertise_matches: matches,
            elsie_directly_addressed: addressing.elsie_directly_addressed,
            other_character_addressed: addressing.other_character_addressed(),
            group_term: addressing.group.clone(),
            mentioned_characters,
            is_dialogue,
            roleplay_signal: roleplay_signal(text, marker.is_some(), &self.reserved_tags),
            service_signal: service,
            degraded: false,
            notes,
        })
    }

    fn resolve_character(&self, name: &str, session: &Session, at: DateTime<Utc>) -> Character {
        if self.profile.is_name(name) {
            return self.profile.as_character(at);
        }
        match session.find_participant(name) {
            Some(existing) => existing.clone(),
            None => self.directory.character(name, at),
        }
    }
}
