use once_cell::sync::Lazy;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use super::character::{extract_character_names, is_plausible_name, CharacterProfile};

/// Recognized end-of-scene phrases, matched on word boundaries.
pub const END_SCENE_PHRASES: &[&str] = &[
    "end scene",
    "scene complete",
    "fade to black",
    "curtain falls",
    "roll credits",
    "the end",
    "scene ends",
];

/// Single keyword that ends a scene only when it is the whole payload.
pub const END_SCENE_KEYWORD: &str = "end";

static END_SCENE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    let alternatives = END_SCENE_PHRASES
        .iter()
        .map(|phrase| phrase.replace(' ', r"\s+"))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?i)\b(?:{})\b", alternatives)).expect("valid end-scene pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectorAction {
    StartScene,
    EndScene,
    PuppetCharacter,
    None,
}

impl DirectorAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StartScene => "start_scene",
            Self::EndScene => "end_scene",
            Self::PuppetCharacter => "puppet_character",
            Self::None => "none",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectorCommand {
    pub action: DirectorAction,
    #[serde(default)]
    pub target_character: Option<String>,
    /// Message text after the director tag (and puppet tag, if any).
    #[serde(default)]
    pub payload_text: String,
    /// Names found in a StartScene body.
    #[serde(default)]
    pub roster_seed: Vec<String>,
    /// Tag present but the remainder could not be parsed.
    #[serde(default)]
    pub malformed: bool,
}

impl DirectorCommand {
    pub fn none(text: &str) -> Self {
        Self {
            action: DirectorAction::None,
            target_character: None,
            payload_text: text.to_string(),
            roster_seed: Vec::new(),
            malformed: false,
        }
    }

    pub fn is_director(&self) -> bool {
        self.action != DirectorAction::None
    }

    fn start(payload: &str, roster_seed: Vec<String>, malformed: bool) -> Self {
        Self {
            action: DirectorAction::StartScene,
            target_character: None,
            payload_text: payload.to_string(),
            roster_seed,
            malformed,
        }
    }

    fn end(payload: &str) -> Self {
        Self {
            action: DirectorAction::EndScene,
            target_character: None,
            payload_text: payload.to_string(),
            roster_seed: Vec::new(),
            malformed: false,
        }
    }
}

/// True when the payload ends a scene: the bare keyword, or any listed
/// phrase on word boundaries ("the end of the bar" is not an ending).
pub fn is_end_of_scene(payload: &str) -> bool {
    let bare = payload
        .trim()
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase();
    if bare == END_SCENE_KEYWORD {
        return true;
    }

    for found in END_SCENE_PATTERN.find_iter(payload) {
        let phrase = found.as_str().to_lowercase();
        if phrase.starts_with("the") && phrase.ends_with("end") {
            let rest = payload[found.end()..].trim_start().to_lowercase();
            if rest.starts_with("of ") || rest == "of" {
                continue;
            }
        }
        return true;
    }
    false
}

/// Parses out-of-band director commands.
#[derive(Debug, Clone)]
pub struct CommandInterpreter {
    tags: Vec<String>,
}

impl CommandInterpreter {
    pub fn new(tags: &[String]) -> Self {
        let tags: Vec<String> = tags
            .iter()
            .map(|tag| tag.trim().trim_matches(['[', ']']).trim().to_string())
            .filter(|tag| !tag.is_empty())
            .collect();
        let tags = if tags.is_empty() {
            vec!["DGM".to_string()]
        } else {
            tags
        };
        Self { tags }
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Bracket contents that are never character names: director tags and
    /// the bare end keyword.
    pub fn reserved_tokens(&self) -> Vec<String> {
        let mut reserved = self.tags.clone();
        reserved.push(END_SCENE_KEYWORD.to_string());
        reserved
    }

    fn is_director_tag(&self, candidate: &str) -> bool {
        let candidate = candidate.trim();
        self.tags
            .iter()
            .any(|tag| tag.eq_ignore_ascii_case(candidate))
    }

    pub fn interpret(&self, text: &str, profile: &CharacterProfile) -> DirectorCommand {
        let trimmed = text.trim_start();
        let Some(after_open) = trimmed.strip_prefix('[') else {
            return DirectorCommand::none(text);
        };
        let Some(close) = after_open.find(']') else {
            return DirectorCommand::none(text);
        };
        if !self.is_director_tag(&after_open[..close]) {
            return DirectorCommand::none(text);
        }

        let rest = &after_open[close + 1..];
        let second = rest.trim_start_matches([' ', '\t']);
        if let Some(after_second_open) = second.strip_prefix('[') {
            return self.interpret_second_tag(after_second_open, profile);
        }

        let payload = rest.trim();
        if payload.is_empty() {
            return DirectorCommand::start(payload, Vec::new(), true);
        }
        if is_end_of_scene(payload) {
            return DirectorCommand::end(payload);
        }
        let roster_seed = extract_character_names(payload, profile, &self.reserved_tokens());
        DirectorCommand::start(payload, roster_seed, false)
    }

    fn interpret_second_tag(
        &self,
        after_open: &str,
        profile: &CharacterProfile,
    ) -> DirectorCommand {
        let Some(close) = after_open.find(']') else {
            return DirectorCommand::start(after_open.trim(), Vec::new(), true);
        };
        let tag = after_open[..close].trim();
        let remainder = after_open[close + 1..].trim();

        if is_end_of_scene(tag) {
            return DirectorCommand::end(remainder);
        }
        if tag.is_empty() || self.is_director_tag(tag) || !is_plausible_name(tag) {
            return DirectorCommand::start(remainder, Vec::new(), true);
        }
        if profile.refers_to_self(tag) {
            // The AI character cannot be puppeted; keep the line as scene narration.
            return DirectorCommand::start(remainder, Vec::new(), true);
        }

        DirectorCommand {
            action: DirectorAction::PuppetCharacter,
            target_character: Some(tag.to_string()),
            payload_text: remainder.to_string(),
            roster_seed: vec![tag.to_string()],
            malformed: false,
        }
    }
}

impl Default for CommandInterpreter {
    fn default() -> Self {
        Self::new(&["DGM".to_string()])
    }
}
