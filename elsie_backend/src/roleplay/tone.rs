//! Emotional tone and vulnerability scoring.
//!
//! Both are lexicon heuristics that return graded scores instead of
//! booleans so the resolver can weigh them against other cues.

use serde::{Deserialize, Serialize};

use super::{clamp01, noisy_or};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToneLabel {
    Distressed,
    Sad,
    Anxious,
    Angry,
    Joyful,
    Warm,
    Neutral,
}

impl ToneLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Distressed => "distressed",
            Self::Sad => "sad",
            Self::Anxious => "anxious",
            Self::Angry => "angry",
            Self::Joyful => "joyful",
            Self::Warm => "warm",
            Self::Neutral => "neutral",
        }
    }

    fn valence(self) -> f32 {
        match self {
            Self::Distressed => -0.9,
            Self::Sad => -0.7,
            Self::Anxious => -0.5,
            Self::Angry => -0.6,
            Self::Joyful => 0.8,
            Self::Warm => 0.5,
            Self::Neutral => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionalTone {
    pub label: ToneLabel,
    /// -1 (negative) .. 1 (positive)
    pub valence: f32,
    pub intensity: f32,
}

impl EmotionalTone {
    pub fn neutral() -> Self {
        Self {
            label: ToneLabel::Neutral,
            valence: 0.0,
            intensity: 0.0,
        }
    }

    pub fn is_negative(&self) -> bool {
        self.valence < 0.0
    }
}

const TONE_LEXICON: &[(ToneLabel, &[(&str, f32)])] = &[
    (
        ToneLabel::Distressed,
        &[
            ("can't take", 0.7),
            ("can't do this", 0.7),
            ("falling apart", 0.7),
            ("breaking down", 0.7),
            ("help me", 0.5),
            ("desperate", 0.6),
            ("hopeless", 0.7),
            ("overwhelmed", 0.6),
            ("panic", 0.5),
            ("terrified", 0.6),
        ],
    ),
    (
        ToneLabel::Sad,
        &[
            ("sad", 0.45),
            ("lonely", 0.55),
            ("alone", 0.35),
            ("miss them", 0.5),
            ("lost", 0.3),
            ("grief", 0.6),
            ("crying", 0.55),
            ("tears", 0.4),
            ("heartbroken", 0.65),
            ("depressed", 0.6),
            ("sighs", 0.25),
            ("hurts", 0.4),
        ],
    ),
    (
        ToneLabel::Anxious,
        &[
            ("worried", 0.45),
            ("nervous", 0.45),
            ("anxious", 0.5),
            ("afraid", 0.45),
            ("scared", 0.5),
            ("trouble", 0.3),
            ("stressed", 0.45),
            ("what if", 0.3),
            ("not sure i can", 0.45),
            ("expectations", 0.25),
            ("pressure", 0.35),
        ],
    ),
    (
        ToneLabel::Angry,
        &[
            ("angry", 0.5),
            ("furious", 0.7),
            ("hate", 0.5),
            ("sick of", 0.5),
            ("fed up", 0.5),
            ("slams", 0.45),
            ("damn", 0.3),
            ("unfair", 0.35),
        ],
    ),
    (
        ToneLabel::Joyful,
        &[
            ("happy", 0.45),
            ("great", 0.3),
            ("wonderful", 0.45),
            ("amazing", 0.45),
            ("celebrate", 0.5),
            ("cheers", 0.35),
            ("laughs", 0.35),
            ("excited", 0.45),
            ("fantastic", 0.45),
            ("love it", 0.4),
        ],
    ),
    (
        ToneLabel::Warm,
        &[
            ("thank", 0.3),
            ("thanks", 0.3),
            ("smiles", 0.25),
            ("welcome", 0.3),
            ("good to see", 0.35),
            ("glad", 0.3),
            ("hugs", 0.35),
        ],
    ),
];

/// Markers of distress, self-doubt or confession with their weights.
const VULNERABILITY_MARKERS: &[(&str, f32)] = &[
    ("having trouble", 0.45),
    ("living up to", 0.4),
    ("expectations", 0.25),
    ("not good enough", 0.55),
    ("i'm a failure", 0.6),
    ("i failed", 0.5),
    ("i messed up", 0.45),
    ("i screwed up", 0.45),
    ("my fault", 0.45),
    ("i don't know what to do", 0.55),
    ("i can't do this", 0.55),
    ("i can't take", 0.5),
    ("i feel", 0.2),
    ("i'm scared", 0.45),
    ("i'm afraid", 0.4),
    ("i'm worried", 0.35),
    ("i'm lonely", 0.5),
    ("i'm tired of", 0.35),
    ("nobody understands", 0.5),
    ("no one understands", 0.5),
    ("i miss", 0.35),
    ("can i tell you something", 0.45),
    ("i have to confess", 0.5),
    ("to be honest", 0.2),
    ("i never told anyone", 0.55),
    ("i don't belong", 0.5),
    ("what's the point", 0.5),
    ("hopeless", 0.5),
    ("overwhelmed", 0.4),
    ("struggling", 0.4),
    ("doubt myself", 0.5),
    ("let everyone down", 0.5),
    ("let them down", 0.45),
    ("disappointed in me", 0.45),
];

/// Lowercased, apostrophe-normalized text padded with spaces so phrase
/// lookups respect word edges.
pub(crate) fn normalize_for_lookup(text: &str) -> String {
    let lowered = text.to_lowercase().replace('’', "'");
    let cleaned: String = lowered
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '\'' {
                c
            } else {
                ' '
            }
        })
        .collect();
    format!(" {} ", cleaned.split_whitespace().collect::<Vec<_>>().join(" "))
}

pub(crate) fn contains_phrase(normalized: &str, phrase: &str) -> bool {
    normalized.contains(&format!(" {} ", phrase))
}

fn punctuation_intensity(text: &str) -> f32 {
    let exclamations = text.matches('!').count() as f32;
    let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
    let upper_ratio = if letters.len() >= 8 {
        letters.iter().filter(|c| c.is_uppercase()).count() as f32 / letters.len() as f32
    } else {
        0.0
    };
    let shouting = if upper_ratio > 0.6 { 0.2 } else { 0.0 };
    clamp01((exclamations * 0.05).min(0.15) + shouting)
}

/// Label, valence and intensity from lexicon hits. Ties favour the more
/// negative category.
pub fn classify_tone(text: &str) -> EmotionalTone {
    let normalized = normalize_for_lookup(text);
    let mut best: Option<(ToneLabel, f32)> = None;

    for (label, entries) in TONE_LEXICON {
        let score = noisy_or(
            entries
                .iter()
                .filter(|(phrase, _)| contains_phrase(&normalized, phrase))
                .map(|(_, weight)| *weight),
        );
        if score <= 0.0 {
            continue;
        }
        let replace = match best {
            None => true,
            Some((current, current_score)) => {
                score > current_score
                    || (score == current_score && label.valence() < current.valence())
            }
        };
        if replace {
            best = Some((*label, score));
        }
    }

    match best {
        None => EmotionalTone::neutral(),
        Some((label, score)) => {
            let intensity = clamp01(score + punctuation_intensity(text));
            EmotionalTone {
                label,
                valence: label.valence() * intensity.max(0.3),
                intensity,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct VulnerabilityAssessment {
    pub score: f32,
    pub markers: Vec<String>,
}

/// Noisy-or over matched vulnerability markers, nudged by a negative tone.
pub fn score_vulnerability(text: &str, tone: &EmotionalTone) -> VulnerabilityAssessment {
    let normalized = normalize_for_lookup(text);
    let markers: Vec<(&str, f32)> = VULNERABILITY_MARKERS
        .iter()
        .filter(|(phrase, _)| contains_phrase(&normalized, phrase))
        .copied()
        .collect();

    if markers.is_empty() {
        return VulnerabilityAssessment::default();
    }

    let tone_boost = if tone.is_negative() {
        0.15 * tone.intensity
    } else {
        0.0
    };
    let score = noisy_or(markers.iter().map(|(_, weight)| *weight).chain([tone_boost]));

    VulnerabilityAssessment {
        score,
        markers: markers.iter().map(|(phrase, _)| phrase.to_string()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutral_text_has_no_tone() {
        let tone = classify_tone("The shuttle docks at bay three.");
        assert_eq!(tone.label, ToneLabel::Neutral);
        assert_eq!(tone.intensity, 0.0);
    }

    #[test]
    fn negative_categories_are_detected() {
        let tone = classify_tone("I'm so lonely since she left, the tears won't stop.");
        assert_eq!(tone.label, ToneLabel::Sad);
        assert!(tone.valence < 0.0);

        let tone = classify_tone("I'm worried about the pressure they're putting on me.");
        assert_eq!(tone.label, ToneLabel::Anxious);
    }

    #[test]
    fn exclamations_raise_intensity() {
        let calm = classify_tone("This is wonderful.");
        let loud = classify_tone("This is wonderful!!!");
        assert_eq!(calm.label, ToneLabel::Joyful);
        assert!(loud.intensity > calm.intensity);
    }

    #[test]
    fn confession_scores_as_vulnerable() {
        let text = "I'm having trouble living up to everyone's expectations.";
        let tone = classify_tone(text);
        let assessment = score_vulnerability(text, &tone);
        assert!(assessment.score > 0.7, "score {}", assessment.score);
        assert!(assessment.markers.contains(&"having trouble".to_string()));
        assert!(assessment.markers.contains(&"living up to".to_string()));
    }

    #[test]
    fn ordinary_chatter_is_not_vulnerable() {
        let text = "Hey everyone, drinks are on me!";
        let assessment = score_vulnerability(text, &classify_tone(text));
        assert_eq!(assessment.score, 0.0);
        assert!(assessment.markers.is_empty());
    }

    #[test]
    fn phrase_lookup_respects_word_edges() {
        let normalized = normalize_for_lookup("Unexpectations aside, I'm fine.");
        assert!(!contains_phrase(&normalized, "expectations"));
        assert!(contains_phrase(&normalized, "i'm fine"));
    }
}
