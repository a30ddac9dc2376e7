use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use super::character::{emote_spans, is_plausible_name, is_stopword, CharacterProfile};
use super::session::{LifecyclePolicy, Session, SessionEvent};
use super::tone::{contains_phrase, normalize_for_lookup};

/// Narrative closing phrases and how strongly each signals the scene is over.
const SOFT_CLOSE_PHRASES: &[(&str, f32)] = &[
    ("end of session", 0.95),
    ("that's all for tonight", 0.9),
    ("session over", 0.9),
    ("the bar closes", 0.9),
    ("everyone leaves", 0.9),
    ("everyone heads home", 0.9),
    ("good night everyone", 0.85),
    ("goodnight everyone", 0.85),
    ("good night all", 0.85),
    ("that's it for tonight", 0.85),
    ("the bar is closed", 0.85),
    ("see you all later", 0.8),
    ("see you all tomorrow", 0.8),
    ("lights out", 0.8),
    ("calling it a night", 0.75),
    ("see you later", 0.55),
    ("i should go", 0.5),
];

/// Confidence reported when departures leave an engaged scene empty.
pub const EMPTIED_ROSTER_CONFIDENCE: f32 = 0.85;

static NAMED_DEPARTURE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"([A-Z][A-Za-z'’\-]+(?:\s+[A-Z][A-Za-z'’\-]+)?)\s+(?:[a-z]+ly\s+)?(?:leaves|exits|departs|walks out|heads out|heads home|storms out|slips out|steps out|wanders off|takes (?:his|her|their) leave|disappears|logs off)\b",
    )
    .expect("valid departure pattern")
});

static BARE_DEPARTURE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(?:[a-z]+ly\s+)?(?:leaves|exits|departs|walks out|heads out|heads home|storms out|slips out|steps out|wanders off|takes (?:his|her|their) leave|disappears|logs off)\b",
    )
    .expect("valid bare departure pattern")
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoftCloseMatch {
    pub phrase: String,
    pub confidence: f32,
}

/// Strongest closing phrase in the text, if any.
pub fn detect_soft_close(text: &str) -> Option<SoftCloseMatch> {
    let normalized = normalize_for_lookup(text);
    SOFT_CLOSE_PHRASES
        .iter()
        .filter(|(phrase, _)| contains_phrase(&normalized, phrase))
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(phrase, confidence)| SoftCloseMatch {
            phrase: phrase.to_string(),
            confidence: *confidence,
        })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Departures {
    pub named: Vec<String>,
    /// An emote like `*leaves*` with no subject: the speaker is leaving.
    pub speaker_departed: bool,
}

impl Departures {
    pub fn is_empty(&self) -> bool {
        self.named.is_empty() && !self.speaker_departed
    }
}

pub fn detect_departures(text: &str, profile: &CharacterProfile) -> Departures {
    let mut departures = Departures::default();
    for span in emote_spans(text) {
        if BARE_DEPARTURE.is_match(span) {
            departures.speaker_departed = true;
        }
        for caps in NAMED_DEPARTURE.captures_iter(span) {
            let Some(name) = caps.get(1).map(|m| m.as_str().trim()) else {
                continue;
            };
            let first_word = name.split_whitespace().next().unwrap_or_default();
            if is_stopword(first_word) || !is_plausible_name(name) || profile.refers_to_self(name)
            {
                continue;
            }
            if !departures.named.iter().any(|n| n.eq_ignore_ascii_case(name)) {
                departures.named.push(name.to_string());
            }
        }
    }
    departures
}

/// Watches messages and the clock for reasons to close a scene.
#[derive(Debug, Clone)]
pub struct ExitMonitor {
    policy: LifecyclePolicy,
    profile: CharacterProfile,
}

impl ExitMonitor {
    pub fn new(policy: LifecyclePolicy, profile: CharacterProfile) -> Self {
        Self { policy, profile }
    }

    /// Exit events raised by one message in an engaged scene, in the order
    /// they should be applied. `speaker` is the message's resolved character.
    pub fn evaluate(
        &self,
        session: &Session,
        text: &str,
        speaker: Option<&str>,
        at: DateTime<Utc>,
    ) -> Vec<SessionEvent> {
        if !session.is_engaged() {
            return Vec::new();
        }
        let mut events = Vec::new();

        let departures = detect_departures(text, &self.profile);
        let mut leaving = departures.named.clone();
        if departures.speaker_departed {
            if let Some(speaker) = speaker {
                leaving.push(speaker.to_string());
            }
        }
        leaving.retain(|name| session.find_participant(name).is_some());

        if !leaving.is_empty() {
            let remaining = session
                .participants
                .values()
                .filter(|character| !leaving.iter().any(|name| character.matches(name)))
                .count();
            events.push(SessionEvent::Departure {
                characters: leaving,
                at,
            });
            if remaining == 0 {
                events.push(SessionEvent::SoftClose {
                    confidence: EMPTIED_ROSTER_CONFIDENCE,
                    phrase: "everyone has left the scene".to_string(),
                    at,
                });
            }
        }

        if let Some(found) = detect_soft_close(text) {
            if found.confidence >= self.policy.soft_close_threshold {
                events.push(SessionEvent::SoftClose {
                    confidence: found.confidence,
                    phrase: found.phrase,
                    at,
                });
            } else {
                tracing::debug!(
                    "Closing phrase '{}' below threshold ({:.2} < {:.2})",
                    found.phrase,
                    found.confidence,
                    self.policy.soft_close_threshold
                );
            }
        }

        events
    }

    pub fn check_timeout(&self, session: &Session, now: DateTime<Utc>) -> Option<SessionEvent> {
        session
            .is_idle(now, self.policy.inactivity_timeout)
            .then_some(SessionEvent::InactivityTimeout { now })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roleplay::character::Character;
    use crate::roleplay::message::ChannelRef;
    use crate::roleplay::session::advance;
    use chrono::Duration;

    fn engaged(names: &[&str]) -> Session {
        let now = Utc::now();
        advance(
            &Session::new("c1", ChannelRef::with_id("c1")),
            &SessionEvent::DirectorStart {
                characters: names.iter().map(|n| Character::new(n, now)).collect(),
                at: now,
            },
            &LifecyclePolicy::default(),
        )
    }

    fn monitor() -> ExitMonitor {
        ExitMonitor::new(LifecyclePolicy::default(), CharacterProfile::default())
    }

    #[test]
    fn soft_close_phrases_carry_confidence() {
        let found = detect_soft_close("Well, that's all for tonight, folks!").expect("match");
        assert_eq!(found.phrase, "that's all for tonight");
        assert!(found.confidence >= 0.9);
        assert!(detect_soft_close("*The bar closes for the night*").is_some());
        assert!(detect_soft_close("I'll have another drink").is_none());
    }

    #[test]
    fn named_and_bare_departures_are_found() {
        let profile = CharacterProfile::default();
        let found = detect_departures("*John quietly leaves the bar*", &profile);
        assert_eq!(found.named, vec!["John"]);
        assert!(!found.speaker_departed);

        let found = detect_departures("*waves goodbye* \"Night!\" *heads out*", &profile);
        assert!(found.named.is_empty());
        assert!(found.speaker_departed);

        let found = detect_departures("*Elsie leaves the bar* *The door exits*", &profile);
        assert!(found.is_empty());
    }

    #[test]
    fn departure_of_last_character_reports_soft_close() {
        let session = engaged(&["John"]);
        let events = monitor().evaluate(&session, "*John walks out*", None, Utc::now());
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], SessionEvent::Departure { .. }));
        match &events[1] {
            SessionEvent::SoftClose { confidence, .. } => {
                assert_eq!(*confidence, EMPTIED_ROSTER_CONFIDENCE)
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn partial_departure_keeps_scene_open() {
        let session = engaged(&["John", "Mary"]);
        let events = monitor().evaluate(&session, "*leaves*", Some("Mary"), Utc::now());
        assert_eq!(events.len(), 1);
        let after = advance(&session, &events[0], &LifecyclePolicy::default());
        assert_eq!(after.roster_names(), vec!["John"]);
    }

    #[test]
    fn low_confidence_phrases_do_not_close() {
        let session = engaged(&["John"]);
        assert!(monitor()
            .evaluate(&session, "See you later, Mary.", None, Utc::now())
            .is_empty());
        assert!(monitor()
            .evaluate(&Session::new("c2", ChannelRef::with_id("c2")), "End of session.", None, Utc::now())
            .is_empty());
    }

    #[test]
    fn timeout_check_matches_policy() {
        let session = engaged(&["John"]);
        let started = session.last_activity_at.expect("activity timestamp");
        assert!(monitor()
            .check_timeout(&session, started + Duration::minutes(5))
            .is_none());
        assert!(matches!(
            monitor().check_timeout(&session, started + Duration::minutes(45)),
            Some(SessionEvent::InactivityTimeout { .. })
        ));
    }
}
