use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;

static BRACKETED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([^\[\]\n]{1,64})\]").expect("valid bracket pattern"));
static EMOTE_SPAN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\*+([^*\n]+)\*+").expect("valid emote pattern"));
static SPEAKER_BRACKET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^\s*\[([^\[\]\n]{1,48})\]\s*(.*)$").expect("valid speaker bracket pattern")
});
static SPEAKER_ANGLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^\s*<([^<>\n]{1,48})>\s*(.*)$").expect("valid speaker angle pattern")
});
static SPEAKER_COLON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^\s*\**([A-Z][A-Za-z'’.\-]*(?:\s+[A-Z][A-Za-z'’.\-]*){0,2})\**\s*:\s+(.*)$")
        .expect("valid speaker colon pattern")
});

/// Capitalized words that are never character names.
const STOPWORDS: &[&str] = &[
    "a", "about", "after", "again", "ah", "all", "also", "an", "and", "another", "anyone", "as",
    "at", "back", "before", "both", "but", "by", "each", "eventually", "everybody", "everyone",
    "finally", "for", "from", "he", "her", "here", "hers", "him", "his", "hmm", "i", "i'd", "i'll",
    "i'm", "i've", "if", "in", "it", "its", "just", "later", "maybe", "meanwhile", "my", "no",
    "nobody", "nothing", "now", "oh", "ok", "okay", "on", "once", "one", "or", "our", "outside",
    "perhaps", "quickly", "quietly", "she", "slowly", "so", "some", "someone", "somebody",
    "something", "soon", "still", "suddenly", "that", "the", "their", "them", "then", "there",
    "these", "they", "this", "those", "though", "to", "uh", "um", "upon", "we", "well", "what",
    "when", "where", "while", "who", "with", "without", "yes", "yet", "you", "your",
];

/// Action verbs that commonly open an emote span in capitalized form.
const EMOTE_VERBS: &[&str] = &[
    "approaches", "arrives", "asks", "begins", "beckons", "blinks", "bows", "chuckles", "claps",
    "cleans", "closes", "comes", "continues", "cries", "dances", "drinks", "drops", "enters",
    "exits", "finishes", "frowns", "gestures", "gets", "giggles", "glances", "grabs", "grins",
    "groans", "hands", "heads", "hugs", "hums", "laughs", "leans", "leaves", "lifts", "listens",
    "looks", "motions", "moves", "nods", "nudges", "offers", "opens", "orders", "pauses", "picks",
    "places", "points", "polishes", "pours", "pulls", "pushes", "puts", "raises", "reaches",
    "replies", "rests", "returns", "rolls", "runs", "rushes", "salutes", "says", "sets", "settles",
    "shakes", "shrugs", "sighs", "sings", "sips", "sits", "slams", "slides", "slips", "slumps",
    "smiles", "smirks", "sniffs", "stands", "stares", "starts", "steps", "stops", "stretches",
    "strolls", "takes", "taps", "tilts", "turns", "waits", "walks", "wanders", "watches", "waves",
    "whispers", "winks", "wipes", "yawns",
];

/// Leading "Word:" prefixes that are not speakers.
const NON_SPEAKER_PREFIXES: &[&str] = &[
    "answer", "edit", "fyi", "note", "ooc", "ps", "question", "re", "reminder", "tldr", "update",
    "warning",
];

/// Honorifics dropped when deriving a short alias for multi-word names.
const HONORIFICS: &[&str] = &[
    "admiral", "captain", "chief", "commander", "doctor", "dr", "ensign", "lieutenant", "miss",
    "mr", "mrs", "ms", "sir",
];

/// Lowercase, trimmed, possessive-free form used for all name comparisons.
pub fn normalize_name(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches(|c: char| !c.is_alphanumeric());
    let without_possessive = strip_possessive(trimmed);
    without_possessive
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub(crate) fn strip_possessive(word: &str) -> &str {
    word.strip_suffix("'s")
        .or_else(|| word.strip_suffix("’s"))
        .or_else(|| word.strip_suffix("'S"))
        .unwrap_or(word)
}

pub(crate) fn is_stopword(word: &str) -> bool {
    let lowered = word.to_lowercase();
    STOPWORDS.contains(&lowered.as_str())
}

fn is_emote_verb(word: &str) -> bool {
    let lowered = word.to_lowercase();
    EMOTE_VERBS.contains(&lowered.as_str())
}

fn starts_uppercase(word: &str) -> bool {
    word.chars().next().is_some_and(|c| c.is_uppercase())
}

fn is_name_word(word: &str) -> bool {
    starts_uppercase(word)
        && word.chars().count() >= 2
        && word
            .chars()
            .all(|c| c.is_alphabetic() || matches!(c, '\'' | '’' | '-' | '.'))
}

/// A candidate name: up to four capitalized words, not a bare stopword.
pub fn is_plausible_name(candidate: &str) -> bool {
    let words: Vec<&str> = candidate.split_whitespace().collect();
    if words.is_empty() || words.len() > 4 || candidate.chars().count() > 40 {
        return false;
    }
    if !words.iter().all(|word| is_name_word(word)) {
        return false;
    }
    !(words.len() == 1 && is_stopword(words[0]))
}

/// A character detected in a scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub display_name: String,
    #[serde(default)]
    pub aliases: BTreeSet<String>,
    pub last_seen_at: DateTime<Utc>,
}

impl Character {
    pub fn new(display_name: &str, seen_at: DateTime<Utc>) -> Self {
        let display_name = display_name.trim().to_string();
        let mut aliases = BTreeSet::new();
        let key = normalize_name(&display_name);
        let words: Vec<&str> = key.split_whitespace().collect();
        if words.len() > 1 {
            for word in &words {
                if word.len() >= 3 && !HONORIFICS.contains(word) {
                    aliases.insert(word.to_string());
                }
            }
        }
        aliases.insert(key);
        Self {
            display_name,
            aliases,
            last_seen_at: seen_at,
        }
    }

    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for alias in aliases {
            let alias = normalize_name(alias.as_ref());
            if !alias.is_empty() {
                self.aliases.insert(alias);
            }
        }
        self
    }

    /// Roster key.
    pub fn key(&self) -> String {
        normalize_name(&self.display_name)
    }

    pub fn matches(&self, candidate: &str) -> bool {
        let candidate = normalize_name(candidate);
        !candidate.is_empty() && self.aliases.contains(&candidate)
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.last_seen_at {
            self.last_seen_at = at;
        }
    }
}

/// The AI-controlled character: its names, role titles and expertise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterProfile {
    pub name: String,
    pub aliases: Vec<String>,
    pub role_titles: Vec<String>,
    pub expertise: BTreeSet<String>,
}

impl CharacterProfile {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            name: config.character_name.clone(),
            aliases: config.character_aliases.clone(),
            role_titles: config.role_titles.clone(),
            expertise: config
                .character_expertise
                .iter()
                .map(|tag| tag.trim().to_lowercase())
                .filter(|tag| !tag.is_empty())
                .collect(),
        }
    }

    /// Lowercase personal names (name + aliases).
    pub fn names(&self) -> Vec<String> {
        std::iter::once(&self.name)
            .chain(self.aliases.iter())
            .map(|name| normalize_name(name))
            .filter(|name| !name.is_empty())
            .collect()
    }

    pub fn titles(&self) -> Vec<String> {
        self.role_titles
            .iter()
            .map(|title| normalize_name(title))
            .filter(|title| !title.is_empty())
            .collect()
    }

    pub fn is_name(&self, candidate: &str) -> bool {
        let candidate = normalize_name(candidate);
        self.names().iter().any(|name| *name == candidate)
    }

    /// Role title, optionally preceded by "the", "miss", "mr" and the like.
    pub fn is_title(&self, candidate: &str) -> bool {
        let candidate = normalize_name(candidate);
        let stripped = ["the ", "miss ", "ms ", "mr ", "mrs ", "my ", "dear "]
            .iter()
            .find_map(|prefix| candidate.strip_prefix(prefix))
            .unwrap_or(&candidate);
        self.titles().iter().any(|title| title == stripped)
    }

    pub fn refers_to_self(&self, candidate: &str) -> bool {
        self.is_name(candidate) || self.is_title(candidate)
    }

    pub fn as_character(&self, at: DateTime<Utc>) -> Character {
        Character::new(&self.name, at).with_aliases(&self.aliases)
    }
}

impl Default for CharacterProfile {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

#[derive(Debug, Clone)]
pub struct KnownCharacter {
    pub name: String,
    pub aliases: BTreeSet<String>,
    pub expertise: BTreeSet<String>,
}

/// Characters configured ahead of time, with their expertise domains.
#[derive(Debug, Clone, Default)]
pub struct CharacterDirectory {
    known: Vec<KnownCharacter>,
}

impl CharacterDirectory {
    pub fn from_config(config: &EngineConfig) -> Self {
        let known = config
            .known_characters
            .iter()
            .filter(|entry| !entry.name.trim().is_empty())
            .map(|entry| {
                let mut aliases: BTreeSet<String> = entry
                    .aliases
                    .iter()
                    .map(|alias| normalize_name(alias))
                    .filter(|alias| !alias.is_empty())
                    .collect();
                aliases.insert(normalize_name(&entry.name));
                KnownCharacter {
                    name: entry.name.trim().to_string(),
                    aliases,
                    expertise: entry
                        .expertise
                        .iter()
                        .map(|tag| tag.trim().to_lowercase())
                        .filter(|tag| !tag.is_empty())
                        .collect(),
                }
            })
            .collect();
        Self { known }
    }

    pub fn lookup(&self, name: &str) -> Option<&KnownCharacter> {
        let key = normalize_name(name);
        self.known.iter().find(|entry| entry.aliases.contains(&key))
    }

    /// Configured display name when known, else the input trimmed.
    pub fn canonical_name(&self, name: &str) -> String {
        self.lookup(name)
            .map(|entry| entry.name.clone())
            .unwrap_or_else(|| name.trim().to_string())
    }

    pub fn expertise_for(&self, name: &str) -> BTreeSet<String> {
        self.lookup(name)
            .map(|entry| entry.expertise.clone())
            .unwrap_or_default()
    }

    pub fn character(&self, name: &str, at: DateTime<Utc>) -> Character {
        match self.lookup(name) {
            Some(entry) => Character::new(&entry.name, at).with_aliases(&entry.aliases),
            None => Character::new(name, at),
        }
    }
}

/// Text inside asterisk-bounded emote spans.
pub fn emote_spans(text: &str) -> Vec<&str> {
    EMOTE_SPAN
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .filter(|span| !span.is_empty())
        .collect()
}

/// Text with emote spans removed, leaving spoken or narrated content.
pub fn strip_emotes(text: &str) -> String {
    EMOTE_SPAN.replace_all(text, " ").into_owned()
}

/// `[Name]` tokens, skipping excluded tags (director tags, end keywords).
pub fn bracketed_names(text: &str, excluded: &[String]) -> Vec<String> {
    let mut names = Vec::new();
    for caps in BRACKETED.captures_iter(text) {
        let Some(inner) = caps.get(1) else {
            continue;
        };
        let candidate = inner.as_str().trim();
        if excluded
            .iter()
            .any(|tag| tag.eq_ignore_ascii_case(candidate))
        {
            continue;
        }
        if is_plausible_name(candidate) {
            push_unique(&mut names, candidate.to_string());
        }
    }
    names
}

/// Capitalized words inside emote spans, joined into multi-word names when
/// adjacent. The AI character's own names and titles are skipped.
pub fn emote_names(text: &str, profile: &CharacterProfile) -> Vec<String> {
    let mut names = Vec::new();
    for span in emote_spans(text) {
        let mut current: Vec<String> = Vec::new();
        for raw in span.split_whitespace() {
            let word = raw.trim_matches(|c: char| !c.is_alphanumeric() && c != '\'' && c != '’');
            let word = word.trim_end_matches(['\'', '’']);
            let possessive = strip_possessive(word) != word;
            let word = strip_possessive(word);
            let breaks_after = possessive
                || raw.ends_with([',', '.', '!', '?', ';', ':', ')', '"'])
                || raw.starts_with(['(', '"']);

            let candidate = is_name_word(word)
                && !is_stopword(word)
                && !is_emote_verb(word)
                && !profile.refers_to_self(word);

            if candidate {
                current.push(word.to_string());
            } else {
                flush_name(&mut current, &mut names, profile);
            }
            if breaks_after {
                flush_name(&mut current, &mut names, profile);
            }
        }
        flush_name(&mut current, &mut names, profile);
    }
    names
}

fn flush_name(current: &mut Vec<String>, names: &mut Vec<String>, profile: &CharacterProfile) {
    if current.is_empty() {
        return;
    }
    let joined = current.join(" ");
    current.clear();
    if is_plausible_name(&joined) && !profile.refers_to_self(&joined) {
        push_unique(names, joined);
    }
}

/// Both notations, bracketed first, deduplicated case-insensitively.
pub fn extract_character_names(
    text: &str,
    profile: &CharacterProfile,
    excluded_tags: &[String],
) -> Vec<String> {
    let mut names = Vec::new();
    for name in bracketed_names(text, excluded_tags)
        .into_iter()
        .chain(emote_names(text, profile))
    {
        if !profile.refers_to_self(&name) {
            push_unique(&mut names, name);
        }
    }
    names
}

pub(crate) fn push_unique(names: &mut Vec<String>, name: String) {
    let key = normalize_name(&name);
    if key.is_empty() {
        return;
    }
    if !names.iter().any(|existing| normalize_name(existing) == key) {
        names.push(name);
    }
}

/// Explicit leading speaker marker and the text after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeakerMarker {
    pub name: String,
    pub body: String,
}

/// `[Name] ...`, `<Name> ...` or `Name: ...` at the very start of a message.
pub fn extract_speaker(text: &str, excluded_tags: &[String]) -> Option<SpeakerMarker> {
    for pattern in [&*SPEAKER_BRACKET, &*SPEAKER_ANGLE] {
        if let Some(caps) = pattern.captures(text) {
            let name = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
            let body = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
            if excluded_tags.iter().any(|tag| tag.eq_ignore_ascii_case(name)) {
                return None;
            }
            if is_plausible_name(name) {
                return Some(SpeakerMarker {
                    name: name.to_string(),
                    body: body.trim().to_string(),
                });
            }
            return None;
        }
    }

    let caps = SPEAKER_COLON.captures(text)?;
    let name = caps.get(1)?.as_str().trim();
    let body = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
    let lowered = name.to_lowercase();
    if NON_SPEAKER_PREFIXES.contains(&lowered.as_str()) || !is_plausible_name(name) {
        return None;
    }
    Some(SpeakerMarker {
        name: name.to_string(),
        body: body.trim().to_string(),
    })
}
