use std::collections::{BTreeMap, BTreeSet};

use super::character::{CharacterDirectory, CharacterProfile};
use super::tone::{contains_phrase, normalize_for_lookup};

const BUILTIN_THEMES: &[(&str, &[&str])] = &[
    (
        "drinks",
        &[
            "drink", "drinks", "cocktail", "cocktails", "whiskey", "whisky", "wine", "beer", "ale",
            "synthehol", "brandy", "rum", "vodka", "gin", "tequila", "bourbon", "scotch", "shot",
            "shots", "on the rocks", "neat", "mixer", "pour", "glass", "bottle", "on tap", "round",
            "bartender's choice", "nightcap",
        ],
    ),
    (
        "hospitality",
        &[
            "table", "seat", "menu", "order", "tab", "reservation", "service", "host", "guest",
            "guests", "welcome", "snack", "snacks", "appetizer", "kitchen", "special", "specials",
        ],
    ),
    (
        "stellar_cartography",
        &[
            "star chart", "star charts", "stellar", "cartography", "nebula", "nebulae", "galaxy",
            "constellation", "constellations", "star system", "binary star", "pulsar", "quasar",
            "astrometrics", "sector", "coordinates", "navigation", "stars",
        ],
    ),
    (
        "engineering",
        &[
            "warp core", "warp coil", "plasma", "conduit", "reactor", "engine", "engines",
            "dilithium", "shields", "power grid", "eps", "jefferies tube", "deflector", "repair",
            "diagnostic", "diagnostics", "antimatter",
        ],
    ),
    (
        "medical",
        &[
            "sickbay", "medical", "doctor", "injury", "injured", "wound", "hypospray", "medicine",
            "fever", "symptoms", "diagnosis", "surgery", "bleeding",
        ],
    ),
    (
        "tactical",
        &[
            "phaser", "phasers", "torpedo", "torpedoes", "tactical", "weapons", "red alert",
            "security", "hostile", "enemy", "battle", "combat", "ambush",
        ],
    ),
    (
        "science",
        &[
            "anomaly", "sensor", "sensors", "scan", "scans", "experiment", "hypothesis", "data",
            "particle", "subspace", "research", "lab",
        ],
    ),
    (
        "music",
        &[
            "music", "song", "songs", "sing", "singing", "piano", "guitar", "violin", "band",
            "melody", "tune", "jazz", "karaoke", "dance", "dancing", "playlist",
        ],
    ),
    (
        "personal",
        &[
            "family", "mother", "father", "sister", "brother", "friend", "friendship", "home",
            "relationship", "feelings", "memories", "childhood",
        ],
    ),
];

/// Keyword lexicon mapping topic tags to trigger phrases.
#[derive(Debug, Clone)]
pub struct ThemeLexicon {
    tags: BTreeMap<String, BTreeSet<String>>,
}

impl ThemeLexicon {
    pub fn builtin() -> Self {
        let tags = BUILTIN_THEMES
            .iter()
            .map(|(tag, keywords)| {
                (
                    tag.to_string(),
                    keywords.iter().map(|keyword| keyword.to_string()).collect(),
                )
            })
            .collect();
        Self { tags }
    }

    /// Built-in lexicon plus configured keywords (new tags allowed).
    pub fn with_extra(extra: &BTreeMap<String, Vec<String>>) -> Self {
        let mut lexicon = Self::builtin();
        for (tag, keywords) in extra {
            let tag = tag.trim().to_lowercase();
            if tag.is_empty() {
                continue;
            }
            let entry = lexicon.tags.entry(tag).or_default();
            for keyword in keywords {
                let keyword = normalize_for_lookup(keyword).trim().to_string();
                if !keyword.is_empty() {
                    entry.insert(keyword);
                }
            }
        }
        lexicon
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.tags.keys().map(String::as_str)
    }

    pub fn detect(&self, text: &str) -> BTreeSet<String> {
        let normalized = normalize_for_lookup(text);
        self.tags
            .iter()
            .filter(|(_, keywords)| {
                keywords
                    .iter()
                    .any(|keyword| contains_phrase(&normalized, keyword))
            })
            .map(|(tag, _)| tag.clone())
            .collect()
    }
}

impl Default for ThemeLexicon {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Tags present in both the known expertise domains and the live themes.
/// Either side alone yields nothing.
pub fn expertise_matches(
    domains: &BTreeSet<String>,
    conversation_themes: &BTreeSet<String>,
) -> BTreeSet<String> {
    domains.intersection(conversation_themes).cloned().collect()
}

/// Expertise domains in scope for a message: whatever the speaking character
/// is known for, plus the AI character's own when `topical` is set. Routine
/// bar traffic shares vocabulary with drinks and hospitality, so the caller
/// clears `topical` for service gestures and character-to-character lines.
pub fn expertise_domains(
    profile: &CharacterProfile,
    directory: &CharacterDirectory,
    speaker: Option<&str>,
    topical: bool,
) -> BTreeSet<String> {
    let mut domains = if topical {
        profile.expertise.clone()
    } else {
        BTreeSet::new()
    };
    if let Some(speaker) = speaker {
        domains.extend(directory.expertise_for(speaker));
    }
    domains
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, KnownCharacterConfig};

    #[test]
    fn detects_multiple_tags() {
        let lexicon = ThemeLexicon::builtin();
        let tags = lexicon.detect("Pour me a whiskey and tell me about that nebula.");
        assert!(tags.contains("drinks"));
        assert!(tags.contains("stellar_cartography"));
        assert!(!tags.contains("engineering"));
    }

    #[test]
    fn multi_word_keywords_match_on_word_edges() {
        let lexicon = ThemeLexicon::builtin();
        assert!(lexicon.detect("The warp core is unstable").contains("engineering"));
        assert!(lexicon.detect("I'm worried about the warpcore").is_empty());
    }

    #[test]
    fn extra_keywords_extend_and_add_tags() {
        let mut extra = BTreeMap::new();
        extra.insert("Gaming".to_string(), vec!["Dom Jot".to_string()]);
        extra.insert("drinks".to_string(), vec!["Romulan ale".to_string()]);
        let lexicon = ThemeLexicon::with_extra(&extra);
        assert!(lexicon.detect("Anyone up for dom-jot?").contains("gaming"));
        assert!(lexicon.tags().any(|tag| tag == "gaming"));
        assert!(lexicon.detect("A romulan ale, please").contains("drinks"));
    }

    #[test]
    fn expertise_requires_both_sides() {
        let domains: BTreeSet<String> = ["drinks".to_string()].into_iter().collect();
        let themes: BTreeSet<String> = ["engineering".to_string()].into_iter().collect();
        assert!(expertise_matches(&domains, &themes).is_empty());
        assert!(expertise_matches(&BTreeSet::new(), &themes).is_empty());
        assert!(expertise_matches(&domains, &BTreeSet::new()).is_empty());

        let themes: BTreeSet<String> = ["drinks".to_string(), "music".to_string()]
            .into_iter()
            .collect();
        assert_eq!(
            expertise_matches(&domains, &themes),
            ["drinks".to_string()].into_iter().collect()
        );
    }

    #[test]
    fn speaker_expertise_joins_the_domains() {
        let mut config = EngineConfig::default();
        config.known_characters.push(KnownCharacterConfig {
            name: "Reyes".to_string(),
            aliases: Vec::new(),
            expertise: vec!["engineering".to_string()],
        });
        let profile = CharacterProfile::from_config(&config);
        let directory = CharacterDirectory::from_config(&config);
        let domains = expertise_domains(&profile, &directory, Some("Reyes"), true);
        assert!(domains.contains("engineering"));
        assert!(domains.contains("drinks"));
        assert!(!expertise_domains(&profile, &directory, None, true).contains("engineering"));
    }

    #[test]
    fn own_expertise_only_counts_for_topical_lines() {
        let mut config = EngineConfig::default();
        config.known_characters.push(KnownCharacterConfig {
            name: "Reyes".to_string(),
            aliases: Vec::new(),
            expertise: vec!["engineering".to_string()],
        });
        let profile = CharacterProfile::from_config(&config);
        let directory = CharacterDirectory::from_config(&config);

        let domains = expertise_domains(&profile, &directory, Some("Reyes"), false);
        assert_eq!(domains, ["engineering".to_string()].into_iter().collect());
        assert!(expertise_domains(&profile, &directory, None, false).is_empty());
    }
}
