//! Who is being spoken to.
//!
//! Classification is structural: a name or collective term only counts as
//! an address when it sits in a vocative slot (a comma-isolated clause, a
//! sentence opener used imperatively, a trailing tag on a second-person
//! sentence) or is the target of a directed emote. Anywhere else, including
//! possessives and prepositional objects, it is a contextual mention.

use once_cell::sync::Lazy;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use super::character::{
    emote_spans, is_plausible_name, is_stopword, normalize_name, strip_emotes, Character,
    CharacterDirectory, CharacterProfile,
};
use super::clamp01;

static QUOTED_SPEECH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""([^"\n]+)"|“([^”\n]+)”"#).expect("valid quote pattern"));

/// Collective address phrases, longest first. Bare "all" is only an address
/// in a vocative slot.
const GROUP_PHRASES: &[&[&str]] = &[
    &["ladies", "and", "gentlemen"],
    &["all", "of", "you"],
    &["you", "all"],
    &["you", "guys"],
    &["you", "lot"],
    &["y'all"],
    &["everyone"],
    &["everybody"],
    &["folks"],
    &["guys"],
    &["gang"],
    &["team"],
    &["crew"],
    &["people"],
    &["friends"],
    &["all"],
];

/// Words that may precede a vocative without changing its meaning.
const VOCATIVE_FILLERS: &[&str] = &[
    "actually", "afternoon", "again", "ah", "alright", "also", "and", "anyway", "apparently",
    "aye", "back", "basically", "besides", "bless", "but", "cheers", "clearly", "come", "dear",
    "evening", "excuse", "finally", "first", "frankly", "good", "goodnight", "great", "greetings",
    "hello", "hey", "heya", "hi", "hiya", "hmm", "honestly", "howdy", "however", "indeed",
    "instead", "later", "listen", "look", "love", "luckily", "me", "meanwhile", "miss", "missed",
    "morning", "my", "nice", "night", "no", "now", "obviously", "oh", "ok", "okay", "personally",
    "please", "plus", "right", "sadly", "see", "seriously", "so", "sorry", "still", "sure", "thank",
    "thanks", "then", "there", "today", "tomorrow", "tonight", "uh", "um", "unfortunately", "wait",
    "welcome", "well", "wow", "yeah", "yep", "yes", "yesterday", "yo",
];

const GREETINGS: &[&str] = &[
    "afternoon", "cheers", "evening", "goodnight", "greetings", "hello", "hey", "heya", "hi",
    "hiya", "howdy", "morning", "night", "welcome", "yo",
];

/// Verbs after which a following "you" belongs to the greeting ("thank you").
const YOU_TAKING_FILLERS: &[&str] = &["bless", "love", "miss", "missed", "see", "thank"];

/// Words that, following a sentence-initial name, make it a subject.
const SUBJECT_FOLLOWERS: &[&str] = &[
    "also", "always", "and", "are", "aren't", "around", "at", "can", "can't", "could", "did",
    "didn't", "do", "does", "don't", "else", "had", "has", "have", "here", "in", "is", "isn't",
    "just", "might", "must", "never", "on", "or", "over", "really", "seemed", "should", "still",
    "there", "too", "was", "wasn't", "were", "who", "will", "won't", "would",
];

const PREPOSITIONS: &[&str] = &[
    "about", "above", "across", "after", "against", "among", "around", "at", "before", "behind",
    "beside", "between", "by", "for", "from", "into", "like", "near", "of", "onto", "over",
    "than", "through", "to", "toward", "towards", "under", "upon", "with", "without",
];

/// Emote verbs that direct the action at whoever follows a preposition.
const DIRECTED_VERBS: &[&str] = &[
    "beckon", "beckons", "call", "calls", "gesture", "gestures", "glance", "glances", "grin",
    "grins", "head", "heads", "hold", "holds", "lean", "leans", "lift", "lifts", "look", "looks",
    "motion", "motions", "nod", "nods", "pass", "passes", "point", "points", "push", "pushes",
    "raise", "raises", "shout", "shouts", "signal", "signals", "slide", "slides", "smile",
    "smiles", "speak", "speaks", "step", "steps", "talk", "talks", "turn", "turns", "walk",
    "walks", "wave", "waves", "whisper", "whispers", "wink", "winks",
];

/// Emote verbs that take their target as a direct object.
const TRANSITIVE_VERBS: &[&str] = &[
    "ask", "asks", "beckon", "beckons", "greet", "greets", "hand", "hands", "hug", "hugs",
    "nudge", "nudges", "offer", "offers", "pass", "passes", "poke", "pokes", "salute", "salutes",
    "tap", "taps", "tell", "tells", "thank", "thanks", "toast", "toasts",
];

const DIRECTING_PREPOSITIONS: &[&str] = &["at", "to", "toward", "towards"];

const EMOTE_GROUP_WORDS: &[&str] = &[
    "all", "crowd", "everybody", "everyone", "gang", "group", "others", "room", "table",
];

const TARGET_ARTICLES: &[&str] = &["the", "a", "an", "his", "her", "their", "my", "our"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressingType {
    DirectAddressIndividual,
    DirectAddressGroup,
    ContextualMention,
    None,
}

impl AddressingType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DirectAddressIndividual => "direct_address_individual",
            Self::DirectAddressGroup => "direct_address_group",
            Self::ContextualMention => "contextual_mention",
            Self::None => "none",
        }
    }
}

/// Grammatical slot a term occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TermPosition {
    Vocative,
    EmoteTarget,
    Possessive,
    Object,
    Embedded,
    Subject,
}

impl TermPosition {
    pub fn is_address(self) -> bool {
        matches!(self, Self::Vocative | Self::EmoteTarget)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermMatch {
    pub term: String,
    pub position: TermPosition,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    SelfRef,
    Group(String),
    Character(String),
}

#[derive(Debug, Clone)]
struct Token {
    raw: String,
    lower: String,
    possessive: bool,
}

fn tokenize(text: &str) -> Vec<Token> {
    text.split_whitespace()
        .filter_map(|raw| {
            let cleaned = raw
                .trim_matches(|c: char| !c.is_alphanumeric() && c != '\'' && c != '’')
                .replace('’', "'");
            let cleaned = cleaned.trim_matches('\'');
            if cleaned.is_empty() {
                return None;
            }
            let (word, possessive) = match cleaned
                .strip_suffix("'s")
                .or_else(|| cleaned.strip_suffix("'S"))
            {
                Some(stem) if !stem.is_empty() => (stem.to_string(), true),
                _ => (cleaned.to_string(), false),
            };
            Some(Token {
                lower: word.to_lowercase(),
                raw: word,
                possessive,
            })
        })
        .collect()
}

fn sentences(text: &str) -> Vec<&str> {
    text.split(['.', '!', '?', ';', '\n'])
        .map(str::trim)
        .filter(|sentence| !sentence.is_empty())
        .collect()
}

fn clauses(sentence: &str) -> Vec<&str> {
    sentence
        .split([',', ':', '—', '–'])
        .map(str::trim)
        .filter(|clause| !clause.is_empty())
        .collect()
}

/// Spoken parts of a message: quoted speech when present, plus unquoted
/// narration when the message carries no emotes.
pub fn speech_segments(text: &str) -> Vec<String> {
    let has_emotes = !emote_spans(text).is_empty();
    let quoted: Vec<String> = QUOTED_SPEECH
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .map(|m| m.as_str().trim().to_string())
        .filter(|segment| !segment.is_empty())
        .collect();

    if quoted.is_empty() {
        let plain = strip_emotes(text);
        return if plain.trim().is_empty() {
            Vec::new()
        } else {
            vec![plain.trim().to_string()]
        };
    }

    let mut segments = quoted;
    if !has_emotes {
        let remainder = QUOTED_SPEECH.replace_all(text, " , ");
        if !remainder.trim().trim_matches(|c: char| !c.is_alphanumeric()).is_empty() {
            segments.push(remainder.trim().to_string());
        }
    }
    segments
}

/// Group phrase starting at `index`, returned with its token length.
fn group_phrase_at(tokens: &[Token], index: usize, allow_bare_all: bool) -> Option<(String, usize)> {
    for phrase in GROUP_PHRASES {
        if !allow_bare_all && phrase.len() == 1 && phrase[0] == "all" {
            continue;
        }
        let end = index + phrase.len();
        if end > tokens.len() {
            continue;
        }
        if tokens[index..end]
            .iter()
            .zip(phrase.iter())
            .all(|(token, word)| token.lower == *word)
        {
            return Some((phrase.join(" "), phrase.len()));
        }
    }
    None
}

/// Strip greeting/filler words from the front of a clause, reporting
/// whether a greeting was among them.
fn strip_fillers(tokens: &[Token]) -> (&[Token], bool) {
    let mut index = 0;
    let mut greeted = false;
    while index < tokens.len() {
        let word = tokens[index].lower.as_str();
        if word == "you"
            && index > 0
            && YOU_TAKING_FILLERS.contains(&tokens[index - 1].lower.as_str())
        {
            index += 1;
            continue;
        }
        if !VOCATIVE_FILLERS.contains(&word) {
            break;
        }
        if GREETINGS.contains(&word) {
            greeted = true;
        }
        index += 1;
    }
    (&tokens[index..], greeted)
}

fn joined_lower(tokens: &[Token]) -> String {
    tokens
        .iter()
        .map(|token| token.lower.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

fn joined_raw(tokens: &[Token]) -> String {
    tokens
        .iter()
        .map(|token| token.raw.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Result of addressing analysis for one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressingAnalysis {
    pub addressing_type: AddressingType,
    pub confidence: f32,
    /// Addressed characters in order; the AI character first when addressed.
    pub targets: Vec<String>,
    pub elsie_directly_addressed: bool,
    /// Best group-term evidence, vocative or not.
    pub group: Option<TermMatch>,
    /// Other characters addressed directly.
    pub individuals: Vec<TermMatch>,
    /// Names and group terms present only as mentions.
    pub mentions: Vec<TermMatch>,
    pub notes: Vec<String>,
}

impl AddressingAnalysis {
    pub fn none() -> Self {
        Self {
            addressing_type: AddressingType::None,
            confidence: 0.0,
            targets: Vec::new(),
            elsie_directly_addressed: false,
            group: None,
            individuals: Vec::new(),
            mentions: Vec::new(),
            notes: Vec::new(),
        }
    }

    pub fn group_vocative(&self) -> bool {
        self.group
            .as_ref()
            .is_some_and(|group| group.position.is_address())
    }

    /// Another character, not the AI, is being spoken to.
    pub fn other_character_addressed(&self) -> bool {
        !self.individuals.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
struct Evidence {
    self_confidence: f32,
    self_notes: Vec<String>,
    group: Option<TermMatch>,
    individuals: Vec<TermMatch>,
    mentions: Vec<TermMatch>,
}

impl Evidence {
    fn add_target(&mut self, target: Target, position: TermPosition, confidence: f32, note: &str) {
        match target {
            Target::SelfRef => {
                if confidence > self.self_confidence {
                    self.self_confidence = confidence;
                }
                self.self_notes.push(note.to_string());
            }
            Target::Group(term) => {
                let better = self
                    .group
                    .as_ref()
                    .map_or(true, |existing| confidence > existing.confidence);
                if better {
                    self.group = Some(TermMatch {
                        term,
                        position,
                        confidence,
                    });
                }
            }
            Target::Character(name) => {
                let key = normalize_name(&name);
                if let Some(existing) = self
                    .individuals
                    .iter_mut()
                    .find(|existing| normalize_name(&existing.term) == key)
                {
                    existing.confidence = existing.confidence.max(confidence);
                } else {
                    self.individuals.push(TermMatch {
                        term: name,
                        position,
                        confidence,
                    });
                }
            }
        }
    }

    fn add_mention(&mut self, term: String, position: TermPosition, confidence: f32) {
        if !self
            .mentions
            .iter()
            .any(|existing| existing.term.eq_ignore_ascii_case(&term))
        {
            self.mentions.push(TermMatch {
                term,
                position,
                confidence,
            });
        }
    }
}

/// Speaker/addressing analyzer bound to one AI character.
#[derive(Debug, Clone)]
pub struct AddressingAnalyzer {
    profile: CharacterProfile,
    directory: CharacterDirectory,
}

impl AddressingAnalyzer {
    pub fn new(profile: CharacterProfile, directory: CharacterDirectory) -> Self {
        Self { profile, directory }
    }

    pub fn profile(&self) -> &CharacterProfile {
        &self.profile
    }

    pub fn analyze(
        &self,
        text: &str,
        roster: &[Character],
        speaker: Option<&str>,
        is_direct_message: bool,
    ) -> AddressingAnalysis {
        let mut evidence = Evidence::default();

        for segment in speech_segments(text) {
            for sentence in sentences(&segment) {
                self.scan_sentence(sentence, roster, &mut evidence);
            }
        }
        for span in emote_spans(text) {
            self.scan_emote(span, roster, &mut evidence);
        }

        if let Some(speaker) = speaker {
            let key = normalize_name(speaker);
            evidence
                .individuals
                .retain(|matched| normalize_name(&matched.term) != key);
        }

        self.classify(evidence, is_direct_message)
    }

    fn classify(&self, evidence: Evidence, is_direct_message: bool) -> AddressingAnalysis {
        let mut analysis = AddressingAnalysis::none();
        analysis.group = evidence.group.clone();
        analysis.mentions = evidence.mentions.clone();
        analysis.individuals = evidence.individuals.clone();

        let self_confidence = if is_direct_message {
            analysis.notes.push("direct message".to_string());
            1.0
        } else {
            evidence.self_confidence
        };

        if self_confidence > 0.0 {
            analysis.addressing_type = AddressingType::DirectAddressIndividual;
            analysis.confidence = clamp01(self_confidence);
            analysis.elsie_directly_addressed = true;
            analysis.targets.push(self.profile.name.clone());
            analysis
                .targets
                .extend(evidence.individuals.iter().map(|m| m.term.clone()));
            analysis.notes.extend(evidence.self_notes);
            return analysis;
        }

        if let Some(group) = evidence.group.as_ref().filter(|g| g.position.is_address()) {
            analysis.addressing_type = AddressingType::DirectAddressGroup;
            analysis.confidence = clamp01(group.confidence);
            analysis
                .notes
                .push(format!("group term '{}' in vocative slot", group.term));
            return analysis;
        }

        if !evidence.individuals.is_empty() {
            analysis.addressing_type = AddressingType::DirectAddressIndividual;
            analysis.confidence = evidence
                .individuals
                .iter()
                .map(|m| m.confidence)
                .fold(0.0, f32::max);
            analysis.targets = evidence.individuals.iter().map(|m| m.term.clone()).collect();
            analysis.notes.push(format!(
                "addressed other character(s): {}",
                analysis.targets.join(", ")
            ));
            return analysis;
        }

        let strongest_mention = evidence
            .group
            .iter()
            .chain(evidence.mentions.iter())
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence));
        if let Some(mention) = strongest_mention {
            analysis.addressing_type = AddressingType::ContextualMention;
            analysis.confidence = clamp01(mention.confidence);
            analysis.notes.push(format!(
                "'{}' appears as {:?} rather than vocative",
                mention.term, mention.position
            ));
        }
        analysis
    }

    fn scan_sentence(&self, sentence: &str, roster: &[Character], evidence: &mut Evidence) {
        let sentence_clauses = clauses(sentence);
        let multi_clause = sentence_clauses.len() > 1;
        let mut vocative_hits: Vec<String> = Vec::new();

        // Comma-isolated clauses holding only (fillers +) a target.
        for (index, clause) in sentence_clauses.iter().enumerate() {
            let tokens = tokenize(clause);
            let (rest, greeted) = strip_fillers(&tokens);
            if rest.is_empty() || rest.len() > 4 || rest.iter().any(|t| t.possessive) {
                continue;
            }
            let allow_unknown = multi_clause || index > 0 || greeted;
            let Some(target) = self.resolve_target(rest, roster, true, allow_unknown) else {
                continue;
            };
            let confidence = match &target {
                Target::SelfRef => 0.95,
                Target::Group(_) if greeted => 0.9,
                Target::Group(_) => 0.8,
                Target::Character(_) => 0.85,
            };
            vocative_hits.push(joined_lower(rest));
            evidence.add_target(target, TermPosition::Vocative, confidence, "vocative clause");
        }

        let tokens = tokenize(sentence);
        if tokens.is_empty() {
            return;
        }

        // Sentence opener used imperatively: "Elsie make me a drink".
        let (rest, _) = strip_fillers(&tokens);
        if let Some((target, length)) = self.longest_target_at(rest, 0, roster, false) {
            let next = rest.get(length);
            let opener_possessive = rest[..length].iter().any(|t| t.possessive);
            let is_subject = match next {
                None => false,
                Some(token) => is_subject_follower(token),
            };
            if !opener_possessive && next.is_some() && !is_subject {
                let confidence = match &target {
                    Target::SelfRef => 0.8,
                    _ => 0.75,
                };
                vocative_hits.push(joined_lower(&rest[..length]));
                evidence.add_target(target, TermPosition::Vocative, confidence, "sentence opener");
            }
        }

        // Trailing tag on a second-person sentence: "are you ready, everyone".
        let has_second_person = tokens
            .iter()
            .any(|t| matches!(t.lower.as_str(), "you" | "your" | "you're" | "yours"));
        if has_second_person && tokens.len() > 1 {
            for length in (1..=3).rev() {
                if length >= tokens.len() {
                    continue;
                }
                let start = tokens.len() - length;
                let tail = &tokens[start..];
                let before = &tokens[start - 1];
                if tail.iter().any(|t| t.possessive)
                    || PREPOSITIONS.contains(&before.lower.as_str())
                {
                    continue;
                }
                if tail.len() == 1 && tail[0].lower == "all" {
                    continue;
                }
                if let Some(target) = self.resolve_target(tail, roster, false, false) {
                    vocative_hits.push(joined_lower(tail));
                    let confidence = match &target {
                        Target::SelfRef => 0.8,
                        _ => 0.75,
                    };
                    evidence.add_target(target, TermPosition::Vocative, confidence, "trailing tag");
                    break;
                }
            }
        }

        self.scan_mentions(&tokens, roster, &vocative_hits, evidence);
    }

    /// Non-vocative occurrences of group terms, the AI's own names and
    /// roster names.
    fn scan_mentions(
        &self,
        tokens: &[Token],
        roster: &[Character],
        vocative_hits: &[String],
        evidence: &mut Evidence,
    ) {
        let mut index = 0;
        while index < tokens.len() {
            let group = group_phrase_at(tokens, index, false);
            let matched = match &group {
                Some((term, length)) => Some((term.clone(), *length)),
                None => self
                    .longest_target_at(tokens, index, roster, false)
                    .and_then(|(target, length)| match target {
                        Target::SelfRef | Target::Character(_) => {
                            Some((joined_raw(&tokens[index..index + length]), length))
                        }
                        Target::Group(_) => None,
                    }),
            };

            let Some((term, length)) = matched else {
                index += 1;
                continue;
            };
            let lowered = joined_lower(&tokens[index..index + length]);
            if !vocative_hits.iter().any(|hit| *hit == lowered) {
                let (position, confidence) = mention_position(tokens, index, length);
                if group.is_some() {
                    let better = evidence.group.as_ref().map_or(true, |existing| {
                        !existing.position.is_address() && confidence > existing.confidence
                    });
                    if better {
                        evidence.group = Some(TermMatch {
                            term: term.clone(),
                            position,
                            confidence,
                        });
                    }
                }
                evidence.add_mention(term, position, confidence);
            }
            index += length;
        }
    }

    fn scan_emote(&self, span: &str, roster: &[Character], evidence: &mut Evidence) {
        let tokens = tokenize(span);
        for (index, token) in tokens.iter().enumerate() {
            let word = token.lower.as_str();
            let mut target = None;
            if DIRECTED_VERBS.contains(&word) {
                let window_end = (index + 5).min(tokens.len());
                if let Some(offset) = tokens[index + 1..window_end]
                    .iter()
                    .position(|t| DIRECTING_PREPOSITIONS.contains(&t.lower.as_str()))
                {
                    target = self.emote_target(&tokens, index + offset + 2, roster);
                }
            }
            if target.is_none() && TRANSITIVE_VERBS.contains(&word) {
                target = self.emote_target(&tokens, index + 1, roster);
            }
            let Some(target) = target else {
                continue;
            };
            let confidence = match &target {
                Target::SelfRef => 0.9,
                Target::Group(_) => 0.8,
                Target::Character(_) => 0.85,
            };
            evidence.add_target(target, TermPosition::EmoteTarget, confidence, "directed emote");
        }
    }

    fn emote_target(&self, tokens: &[Token], start: usize, roster: &[Character]) -> Option<Target> {
        let mut start = start;
        while tokens
            .get(start)
            .is_some_and(|t| TARGET_ARTICLES.contains(&t.lower.as_str()))
        {
            start += 1;
        }
        let first = tokens.get(start)?;
        if EMOTE_GROUP_WORDS.contains(&first.lower.as_str()) {
            return Some(Target::Group(first.lower.clone()));
        }
        let end = (start + 3).min(tokens.len());
        for stop in (start + 1..=end).rev() {
            let slice = &tokens[start..stop];
            if let Some(target) = self.resolve_target(slice, roster, false, true) {
                return Some(target);
            }
        }
        None
    }

    fn longest_target_at(
        &self,
        tokens: &[Token],
        index: usize,
        roster: &[Character],
        allow_unknown: bool,
    ) -> Option<(Target, usize)> {
        for length in (1..=4).rev() {
            let end = index + length;
            if end > tokens.len() {
                continue;
            }
            if let Some(target) =
                self.resolve_target(&tokens[index..end], roster, false, allow_unknown)
            {
                return Some((target, length));
            }
        }
        None
    }

    /// Map a short token run onto a target: the AI character, a group, a
    /// known character, or (when allowed) a capitalized unknown name.
    fn resolve_target(
        &self,
        tokens: &[Token],
        roster: &[Character],
        allow_bare_all: bool,
        allow_unknown: bool,
    ) -> Option<Target> {
        if tokens.is_empty() {
            return None;
        }
        let lowered = joined_lower(tokens);
        let raw = joined_raw(tokens);

        if self.profile.is_name(&lowered) || self.profile.is_title(&lowered) {
            return Some(Target::SelfRef);
        }

        if let Some((term, length)) = group_phrase_at(tokens, 0, allow_bare_all) {
            if length == tokens.len() {
                return Some(Target::Group(term));
            }
        }

        if let Some(character) = roster.iter().find(|c| c.matches(&lowered)) {
            return Some(Target::Character(character.display_name.clone()));
        }
        if let Some(known) = self.directory.lookup(&lowered) {
            return Some(Target::Character(known.name.clone()));
        }

        if allow_unknown
            && is_plausible_name(&raw)
            && !tokens.iter().any(|t| {
                is_stopword(&t.lower)
                    || VOCATIVE_FILLERS.contains(&t.lower.as_str())
                    || t.lower.ends_with("ly")
            })
        {
            return Some(Target::Character(raw));
        }
        None
    }
}

impl Default for AddressingAnalyzer {
    fn default() -> Self {
        Self::new(CharacterProfile::default(), CharacterDirectory::default())
    }
}

fn is_subject_follower(token: &Token) -> bool {
    let word = token.lower.as_str();
    if SUBJECT_FOLLOWERS.contains(&word) {
        return true;
    }
    // Third-person verb forms: "knows", "seems", "makes".
    word.len() > 3 && word.ends_with('s') && !word.ends_with("ss") && !word.ends_with("us")
}

/// Position and confidence of a non-vocative occurrence.
fn mention_position(tokens: &[Token], index: usize, length: usize) -> (TermPosition, f32) {
    let last = &tokens[index + length - 1];
    if last.possessive {
        return (TermPosition::Possessive, 0.95);
    }
    if index == 0 {
        return (TermPosition::Subject, 0.85);
    }
    let previous = tokens[index - 1].lower.as_str();
    if PREPOSITIONS.contains(&previous) {
        (TermPosition::Object, 0.9)
    } else {
        (TermPosition::Embedded, 0.88)
    }
}

/// Best collective-address signal in a message, vocative or not.
pub fn detect_group_address(text: &str) -> Option<TermMatch> {
    AddressingAnalyzer::default()
        .analyze(text, &[], None, false)
        .group
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn analyze(text: &str) -> AddressingAnalysis {
        AddressingAnalyzer::default().analyze(text, &[], None, false)
    }

    fn roster(names: &[&str]) -> Vec<Character> {
        names
            .iter()
            .map(|name| Character::new(name, Utc::now()))
            .collect()
    }

    #[test]
    fn possessive_collective_is_a_contextual_mention() {
        let analysis = analyze("I'm having trouble living up to everyone's expectations.");
        assert_eq!(analysis.addressing_type, AddressingType::ContextualMention);
        assert!(analysis.confidence >= 0.85);
        assert!(!analysis.group_vocative());
        assert_eq!(
            analysis.group.as_ref().map(|g| g.position),
            Some(TermPosition::Possessive)
        );
    }

    #[test]
    fn object_collective_is_a_contextual_mention() {
        let analysis = analyze("I made this cake for everyone.");
        assert_eq!(analysis.addressing_type, AddressingType::ContextualMention);
        assert!(analysis.confidence >= 0.85);

        let analysis = analyze("Everyone is staring at me tonight.");
        assert_eq!(analysis.addressing_type, AddressingType::ContextualMention);
    }

    #[test]
    fn vocative_collectives_are_group_address() {
        for text in [
            "Hey everyone, drinks are on me!",
            "Good evening, everyone.",
            "Everyone, listen up.",
            "Everyone listen up!",
            "Thank you all!",
            "Are you ready for this, folks?",
            "Evening, all.",
            "*turns to the crowd* Who's up for a song?",
        ] {
            let analysis = analyze(text);
            assert_eq!(
                analysis.addressing_type,
                AddressingType::DirectAddressGroup,
                "{text}"
            );
            assert!(analysis.confidence >= 0.75, "{text}");
        }
    }

    #[test]
    fn bare_all_outside_a_vocative_is_ignored() {
        let analysis = analyze("We all went home early.");
        assert_eq!(analysis.addressing_type, AddressingType::None);
    }

    #[test]
    fn elsie_addressed_by_name_title_or_emote() {
        for text in [
            "Elsie, what do you recommend tonight?",
            "Hi Elsie!",
            "Elsie make me something strong",
            "Could you pour me another one, Elsie?",
            "Bartender, another round!",
            "*waves at Elsie*",
            "*slides an empty glass toward the bartender*",
            "*hands Elsie a credit chip*",
        ] {
            let analysis = analyze(text);
            assert!(analysis.elsie_directly_addressed, "{text}");
            assert_eq!(
                analysis.addressing_type,
                AddressingType::DirectAddressIndividual,
                "{text}"
            );
            assert_eq!(analysis.targets.first().map(String::as_str), Some("Elsie"));
        }
    }

    #[test]
    fn elsie_addressed_wins_over_group_terms() {
        let analysis = analyze("Hey everyone! Elsie, a round for the table please.");
        assert!(analysis.elsie_directly_addressed);
        assert_eq!(
            analysis.addressing_type,
            AddressingType::DirectAddressIndividual
        );
    }

    #[test]
    fn mentioning_elsie_is_not_addressing_her() {
        let analysis = analyze("I heard Elsie makes the best drinks on the station.");
        assert!(!analysis.elsie_directly_addressed);
        assert_eq!(analysis.addressing_type, AddressingType::ContextualMention);

        let analysis = analyze("Elsie's cocktails are legendary.");
        assert!(!analysis.elsie_directly_addressed);
    }

    #[test]
    fn other_characters_addressed_directly() {
        let roster = roster(&["John", "Mary"]);
        let analyzer = AddressingAnalyzer::default();

        let analysis = analyzer.analyze("John, did you fix the warp coil?", &roster, None, false);
        assert_eq!(
            analysis.addressing_type,
            AddressingType::DirectAddressIndividual
        );
        assert!(!analysis.elsie_directly_addressed);
        assert_eq!(analysis.targets, vec!["John"]);
        assert!(analysis.other_character_addressed());

        let analysis = analyzer.analyze("*nods to Mary*", &roster, None, false);
        assert_eq!(analysis.targets, vec!["Mary"]);

        let analysis = analyzer.analyze("Thanks, Reyes.", &roster, None, false);
        assert_eq!(analysis.targets, vec!["Reyes"]);
    }

    #[test]
    fn speaker_is_not_their_own_target() {
        let roster = roster(&["John"]);
        let analysis =
            AddressingAnalyzer::default().analyze("John, here. Reporting in.", &roster, Some("John"), false);
        assert!(analysis.individuals.is_empty());
    }

    #[test]
    fn interjections_are_not_names() {
        for text in ["Sure, that works.", "Tonight, we drink.", "Honestly, no idea."] {
            let analysis = analyze(text);
            assert_eq!(analysis.addressing_type, AddressingType::None, "{text}");
        }
    }

    #[test]
    fn direct_messages_always_address_elsie() {
        let analysis = AddressingAnalyzer::default().analyze("what's on tap?", &[], None, true);
        assert!(analysis.elsie_directly_addressed);
        assert_eq!(analysis.confidence, 1.0);
    }

    #[test]
    fn speech_segments_prefer_quotes_when_emotes_present() {
        let segments = speech_segments("*leans on the bar* \"Elsie, surprise me.\"");
        assert_eq!(segments, vec!["Elsie, surprise me."]);
        let segments = speech_segments("Could you \"borrow\" that, John?");
        assert_eq!(segments.len(), 2);
    }

    #[test]
    fn detect_group_address_reports_position() {
        let signal = detect_group_address("Hello everyone!").expect("group signal");
        assert_eq!(signal.position, TermPosition::Vocative);
        assert!(detect_group_address("Nothing collective here.").is_none());
    }
}
