use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::character::{normalize_name, Character};
use super::message::ChannelRef;
use crate::config::EngineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Inactive,
    Monitoring,
    Active,
}

impl LifecycleState {
    pub fn as_db_str(self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Monitoring => "monitoring",
            Self::Active => "active",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value {
            "monitoring" => Self::Monitoring,
            "active" => Self::Active,
            _ => Self::Inactive,
        }
    }

    pub fn is_engaged(self) -> bool {
        !matches!(self, Self::Inactive)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenedBy {
    DirectorCommand,
    ImplicitDetection,
}

/// One line of scene history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneTurn {
    #[serde(default)]
    pub speaker: Option<String>,
    #[serde(default)]
    pub author_id: Option<String>,
    pub text: String,
    #[serde(default)]
    pub themes: BTreeSet<String>,
    pub is_dialogue: bool,
    pub is_puppet: bool,
    pub at: DateTime<Utc>,
}

/// Per-channel scene state. Owned by the registry; everyone else sees copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub channel_id: String,
    pub channel: ChannelRef,
    pub lifecycle_state: LifecycleState,
    /// Keyed by normalized display name.
    pub participants: BTreeMap<String, Character>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub opened_by: Option<OpenedBy>,
    /// author_id -> character display name
    #[serde(default)]
    pub author_characters: BTreeMap<String, String>,
    #[serde(default)]
    pub recent_turns: VecDeque<SceneTurn>,
}

impl Session {
    pub fn new(channel_id: &str, channel: ChannelRef) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            channel,
            lifecycle_state: LifecycleState::Inactive,
            participants: BTreeMap::new(),
            started_at: None,
            last_activity_at: None,
            opened_by: None,
            author_characters: BTreeMap::new(),
            recent_turns: VecDeque::new(),
        }
    }

    pub fn is_engaged(&self) -> bool {
        self.lifecycle_state.is_engaged()
    }

    pub fn roster(&self) -> Vec<Character> {
        self.participants.values().cloned().collect()
    }

    pub fn roster_names(&self) -> Vec<String> {
        self.participants
            .values()
            .map(|character| character.display_name.clone())
            .collect()
    }

    pub fn find_participant(&self, name: &str) -> Option<&Character> {
        let key = normalize_name(name);
        self.participants
            .get(&key)
            .or_else(|| self.participants.values().find(|c| c.matches(name)))
    }

    pub fn character_for_author(&self, author_id: &str) -> Option<&str> {
        self.author_characters.get(author_id).map(String::as_str)
    }

    /// Union of theme tags across the recent turn window.
    pub fn conversation_themes(&self) -> BTreeSet<String> {
        self.recent_turns
            .iter()
            .flat_map(|turn| turn.themes.iter().cloned())
            .collect()
    }

    pub fn dialogue_density(&self) -> usize {
        self.recent_turns
            .iter()
            .filter(|turn| turn.is_dialogue && !turn.is_puppet)
            .count()
    }

    fn open(&mut self, opened_by: OpenedBy, at: DateTime<Utc>) {
        self.lifecycle_state = LifecycleState::Monitoring;
        self.opened_by = Some(opened_by);
        self.started_at = Some(at);
        self.last_activity_at = Some(at);
    }

    fn close(&mut self, at: DateTime<Utc>) {
        self.lifecycle_state = LifecycleState::Inactive;
        self.participants.clear();
        self.author_characters.clear();
        self.recent_turns.clear();
        self.opened_by = None;
        self.started_at = None;
        self.last_activity_at = Some(at);
    }

    fn add_characters(&mut self, characters: &[Character], at: DateTime<Utc>) {
        for character in characters {
            let key = character.key();
            if key.is_empty() {
                continue;
            }
            let existing_key = self
                .participants
                .iter()
                .find(|(_, existing)| existing.matches(&character.display_name))
                .map(|(key, _)| key.clone());
            match existing_key.and_then(|key| self.participants.get_mut(&key)) {
                Some(existing) => {
                    existing.aliases.extend(character.aliases.iter().cloned());
                    existing.touch(at);
                }
                None => {
                    let mut character = character.clone();
                    character.touch(at);
                    self.participants.insert(key, character);
                }
            }
        }
    }

    fn remove_characters(&mut self, names: &[String]) {
        for name in names {
            self.participants
                .retain(|_, character| !character.matches(name));
            self.author_characters
                .retain(|_, character| normalize_name(character) != normalize_name(name));
        }
    }

    fn push_turn(&mut self, turn: SceneTurn, window: usize) {
        self.recent_turns.push_back(turn);
        while self.recent_turns.len() > window.max(1) {
            self.recent_turns.pop_front();
        }
    }

    fn mark_activity(&mut self, at: DateTime<Utc>) {
        if self.last_activity_at.map_or(true, |last| at > last) {
            self.last_activity_at = Some(at);
        }
    }

    /// Whether the inactivity timeout has elapsed at `now`.
    pub fn is_idle(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        if !self.is_engaged() {
            return false;
        }
        match self.last_activity_at.or(self.started_at) {
            Some(last) => now - last >= timeout,
            None => true,
        }
    }
}

/// A message's contribution to an engaged scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneActivity {
    pub turn: SceneTurn,
    /// Characters detected in the message.
    #[serde(default)]
    pub characters: Vec<Character>,
    /// Explicit speaker marker, remembered for the author.
    #[serde(default)]
    pub speaker_marker: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    DirectorStart {
        characters: Vec<Character>,
        at: DateTime<Utc>,
    },
    DirectorEnd {
        at: DateTime<Utc>,
    },
    Puppet {
        character: Character,
        turn: SceneTurn,
    },
    ImplicitTrigger {
        confidence: f32,
        characters: Vec<Character>,
        at: DateTime<Utc>,
    },
    Activity(SceneActivity),
    ElsieAddressed {
        at: DateTime<Utc>,
    },
    Departure {
        characters: Vec<String>,
        at: DateTime<Utc>,
    },
    SoftClose {
        confidence: f32,
        phrase: String,
        at: DateTime<Utc>,
    },
    InactivityTimeout {
        now: DateTime<Utc>,
    },
}

impl SessionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DirectorStart { .. } => "director_start",
            Self::DirectorEnd { .. } => "director_end",
            Self::Puppet { .. } => "puppet",
            Self::ImplicitTrigger { .. } => "implicit_trigger",
            Self::Activity(_) => "activity",
            Self::ElsieAddressed { .. } => "elsie_addressed",
            Self::Departure { .. } => "departure",
            Self::SoftClose { .. } => "soft_close",
            Self::InactivityTimeout { .. } => "inactivity_timeout",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LifecyclePolicy {
    pub implicit_trigger_threshold: f32,
    pub soft_close_threshold: f32,
    pub dialogue_density_threshold: usize,
    pub recent_turn_window: usize,
    pub inactivity_timeout: Duration,
}

impl LifecyclePolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            implicit_trigger_threshold: config.implicit_trigger_threshold,
            soft_close_threshold: config.soft_close_threshold,
            dialogue_density_threshold: config.dialogue_density_threshold.max(1),
            recent_turn_window: config.recent_turn_window.max(1),
            inactivity_timeout: Duration::seconds(
                i64::try_from(config.inactivity_timeout_secs).unwrap_or(i64::MAX / 1000),
            ),
        }
    }
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Apply one lifecycle event. Pure: the input session is untouched and the
/// caller stores the result.
pub fn advance(session: &Session, event: &SessionEvent, policy: &LifecyclePolicy) -> Session {
    let mut next = session.clone();
    match event {
        SessionEvent::DirectorStart { characters, at } => {
            if !next.is_engaged() {
                next.open(OpenedBy::DirectorCommand, *at);
            }
            next.add_characters(characters, *at);
            next.mark_activity(*at);
        }
        SessionEvent::DirectorEnd { at } => {
            next.close(*at);
        }
        SessionEvent::Puppet { character, turn } => {
            if !next.is_engaged() {
                next.open(OpenedBy::DirectorCommand, turn.at);
            }
            next.add_characters(std::slice::from_ref(character), turn.at);
            next.push_turn(turn.clone(), policy.recent_turn_window);
            next.mark_activity(turn.at);
        }
        SessionEvent::ImplicitTrigger {
            confidence,
            characters,
            at,
        } => {
            if !next.is_engaged() && *confidence > policy.implicit_trigger_threshold {
                next.open(OpenedBy::ImplicitDetection, *at);
                next.add_characters(characters, *at);
            }
        }
        SessionEvent::Activity(activity) => {
            if !next.is_engaged() {
                return next;
            }
            let at = activity.turn.at;
            next.add_characters(&activity.characters, at);
            if let (Some(author), Some(speaker)) =
                (activity.turn.author_id.as_ref(), activity.speaker_marker.as_ref())
            {
                next.author_characters
                    .insert(author.clone(), speaker.clone());
            }
            next.push_turn(activity.turn.clone(), policy.recent_turn_window);
            next.mark_activity(at);
            if next.lifecycle_state == LifecycleState::Monitoring
                && next.dialogue_density() >= policy.dialogue_density_threshold
            {
                next.lifecycle_state = LifecycleState::Active;
            }
        }
        SessionEvent::ElsieAddressed { at } => {
            if next.lifecycle_state == LifecycleState::Monitoring {
                next.lifecycle_state = LifecycleState::Active;
                next.mark_activity(*at);
            }
        }
        SessionEvent::Departure { characters, at } => {
            if next.is_engaged() {
                next.remove_characters(characters);
                next.mark_activity(*at);
            }
        }
        SessionEvent::SoftClose { confidence, at, .. } => {
            if next.is_engaged() && *confidence >= policy.soft_close_threshold {
                next.close(*at);
            }
        }
        SessionEvent::InactivityTimeout { now } => {
            if next.is_idle(*now, policy.inactivity_timeout) {
                next.close(*now);
            }
        }
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> LifecyclePolicy {
        LifecyclePolicy::default()
    }

    fn fresh() -> Session {
        Session::new("c1", ChannelRef::with_id("c1"))
    }

    fn character(name: &str, at: DateTime<Utc>) -> Character {
        Character::new(name, at)
    }

    fn dialogue(text: &str, author: &str, at: DateTime<Utc>) -> SessionEvent {
        SessionEvent::Activity(SceneActivity {
            turn: SceneTurn {
                speaker: None,
                author_id: Some(author.to_string()),
                text: text.to_string(),
                themes: BTreeSet::new(),
                is_dialogue: true,
                is_puppet: false,
                at,
            },
            characters: Vec::new(),
            speaker_marker: None,
        })
    }

    fn assert_invariant(session: &Session) {
        if session.lifecycle_state == LifecycleState::Inactive {
            assert!(session.participants.is_empty());
            assert!(session.recent_turns.is_empty());
            assert!(session.author_characters.is_empty());
        }
    }

    #[test]
    fn director_start_opens_monitoring_with_roster() {
        let now = Utc::now();
        let before = fresh();
        let after = advance(
            &before,
            &SessionEvent::DirectorStart {
                characters: vec![character("John", now)],
                at: now,
            },
            &policy(),
        );
        assert_eq!(before.lifecycle_state, LifecycleState::Inactive);
        assert_eq!(after.lifecycle_state, LifecycleState::Monitoring);
        assert_eq!(after.opened_by, Some(OpenedBy::DirectorCommand));
        assert_eq!(after.roster_names(), vec!["John"]);
        assert_eq!(after.started_at, Some(now));
    }

    #[test]
    fn director_start_on_engaged_scene_adds_characters() {
        let now = Utc::now();
        let mut session = advance(
            &fresh(),
            &SessionEvent::DirectorStart {
                characters: vec![character("John", now)],
                at: now,
            },
            &policy(),
        );
        session.lifecycle_state = LifecycleState::Active;
        let after = advance(
            &session,
            &SessionEvent::DirectorStart {
                characters: vec![character("Mary", now), character("john", now)],
                at: now,
            },
            &policy(),
        );
        assert_eq!(after.lifecycle_state, LifecycleState::Active);
        assert_eq!(after.participants.len(), 2);
    }

    #[test]
    fn end_is_idempotent_and_clears_everything() {
        let now = Utc::now();
        let mut session = fresh();
        for event in [
            SessionEvent::DirectorStart {
                characters: vec![character("John", now)],
                at: now,
            },
            dialogue("\"Hello\"", "u1", now),
        ] {
            session = advance(&session, &event, &policy());
        }
        assert!(!session.participants.is_empty());

        let end = SessionEvent::DirectorEnd { at: now };
        let once = advance(&session, &end, &policy());
        let twice = advance(&once, &end, &policy());
        for state in [&once, &twice] {
            assert_eq!(state.lifecycle_state, LifecycleState::Inactive);
            assert_invariant(state);
        }
        assert_eq!(once.participants, twice.participants);
    }

    #[test]
    fn implicit_trigger_respects_threshold() {
        let now = Utc::now();
        let weak = advance(
            &fresh(),
            &SessionEvent::ImplicitTrigger {
                confidence: 0.6,
                characters: vec![character("John", now)],
                at: now,
            },
            &policy(),
        );
        assert_eq!(weak.lifecycle_state, LifecycleState::Inactive);
        assert_invariant(&weak);

        let strong = advance(
            &fresh(),
            &SessionEvent::ImplicitTrigger {
                confidence: 0.75,
                characters: vec![character("John", now)],
                at: now,
            },
            &policy(),
        );
        assert_eq!(strong.lifecycle_state, LifecycleState::Monitoring);
        assert_eq!(strong.opened_by, Some(OpenedBy::ImplicitDetection));
    }

    #[test]
    fn activity_on_inactive_session_is_ignored() {
        let now = Utc::now();
        let mut event = dialogue("*John waves*", "u1", now);
        if let SessionEvent::Activity(activity) = &mut event {
            activity.characters.push(character("John", now));
        }
        let after = advance(&fresh(), &event, &policy());
        assert_eq!(after, fresh());
    }

    #[test]
    fn dialogue_density_promotes_to_active() {
        let now = Utc::now();
        let mut session = advance(
            &fresh(),
            &SessionEvent::DirectorStart {
                characters: Vec::new(),
                at: now,
            },
            &policy(),
        );
        for index in 0..2 {
            session = advance(&session, &dialogue("\"Hi\"", "u1", now), &policy());
            assert_eq!(
                session.lifecycle_state,
                LifecycleState::Monitoring,
                "turn {index}"
            );
        }
        session = advance(&session, &dialogue("\"Hi\"", "u2", now), &policy());
        assert_eq!(session.lifecycle_state, LifecycleState::Active);
    }

    #[test]
    fn elsie_addressed_promotes_monitoring_only() {
        let now = Utc::now();
        let inactive = advance(&fresh(), &SessionEvent::ElsieAddressed { at: now }, &policy());
        assert_eq!(inactive.lifecycle_state, LifecycleState::Inactive);

        let monitoring = advance(
            &fresh(),
            &SessionEvent::DirectorStart {
                characters: Vec::new(),
                at: now,
            },
            &policy(),
        );
        let active = advance(&monitoring, &SessionEvent::ElsieAddressed { at: now }, &policy());
        assert_eq!(active.lifecycle_state, LifecycleState::Active);
    }

    #[test]
    fn history_window_is_bounded() {
        let now = Utc::now();
        let policy = LifecyclePolicy {
            recent_turn_window: 3,
            ..LifecyclePolicy::default()
        };
        let mut session = advance(
            &fresh(),
            &SessionEvent::DirectorStart {
                characters: Vec::new(),
                at: now,
            },
            &policy,
        );
        for index in 0..5 {
            session = advance(&session, &dialogue(&format!("line {index}"), "u1", now), &policy);
        }
        assert_eq!(session.recent_turns.len(), 3);
        assert_eq!(session.recent_turns[0].text, "line 2");
    }

    #[test]
    fn speaker_markers_are_remembered_per_author() {
        let now = Utc::now();
        let mut session = advance(
            &fresh(),
            &SessionEvent::DirectorStart {
                characters: Vec::new(),
                at: now,
            },
            &policy(),
        );
        let mut event = dialogue("[Mary] Hello", "u7", now);
        if let SessionEvent::Activity(activity) = &mut event {
            activity.speaker_marker = Some("Mary".to_string());
            activity.characters.push(character("Mary", now));
        }
        session = advance(&session, &event, &policy());
        assert_eq!(session.character_for_author("u7"), Some("Mary"));
        assert!(session.find_participant("mary").is_some());
    }

    #[test]
    fn departures_remove_characters() {
        let now = Utc::now();
        let session = advance(
            &fresh(),
            &SessionEvent::DirectorStart {
                characters: vec![character("John", now), character("Mary", now)],
                at: now,
            },
            &policy(),
        );
        let after = advance(
            &session,
            &SessionEvent::Departure {
                characters: vec!["john".to_string()],
                at: now,
            },
            &policy(),
        );
        assert_eq!(after.roster_names(), vec!["Mary"]);
        assert!(after.is_engaged());
    }

    #[test]
    fn soft_close_requires_high_confidence() {
        let now = Utc::now();
        let session = advance(
            &fresh(),
            &SessionEvent::DirectorStart {
                characters: vec![character("John", now)],
                at: now,
            },
            &policy(),
        );
        let weak = advance(
            &session,
            &SessionEvent::SoftClose {
                confidence: 0.5,
                phrase: "bye".to_string(),
                at: now,
            },
            &policy(),
        );
        assert!(weak.is_engaged());
        let strong = advance(
            &session,
            &SessionEvent::SoftClose {
                confidence: 0.9,
                phrase: "that's all for tonight".to_string(),
                at: now,
            },
            &policy(),
        );
        assert_eq!(strong.lifecycle_state, LifecycleState::Inactive);
        assert_invariant(&strong);
    }

    #[test]
    fn inactivity_timeout_closes_only_idle_scenes() {
        let start = Utc::now();
        let session = advance(
            &fresh(),
            &SessionEvent::DirectorStart {
                characters: vec![character("John", start)],
                at: start,
            },
            &policy(),
        );
        let early = advance(
            &session,
            &SessionEvent::InactivityTimeout {
                now: start + Duration::minutes(10),
            },
            &policy(),
        );
        assert!(early.is_engaged());
        let late = advance(
            &session,
            &SessionEvent::InactivityTimeout {
                now: start + Duration::minutes(31),
            },
            &policy(),
        );
        assert_eq!(late.lifecycle_state, LifecycleState::Inactive);
        assert_invariant(&late);
    }

    #[test]
    fn puppet_opens_scene_and_records_line() {
        let now = Utc::now();
        let turn = SceneTurn {
            speaker: Some("Reyes".to_string()),
            author_id: Some("director".to_string()),
            text: "Red alert.".to_string(),
            themes: BTreeSet::new(),
            is_dialogue: true,
            is_puppet: true,
            at: now,
        };
        let after = advance(
            &fresh(),
            &SessionEvent::Puppet {
                character: character("Reyes", now),
                turn,
            },
            &policy(),
        );
        assert_eq!(after.lifecycle_state, LifecycleState::Monitoring);
        assert_eq!(after.roster_names(), vec!["Reyes"]);
        assert_eq!(after.recent_turns.len(), 1);
        assert_eq!(after.dialogue_density(), 0);
        assert!(after.author_characters.is_empty());
    }

    #[test]
    fn lifecycle_db_strings_round_trip() {
        for state in [
            LifecycleState::Inactive,
            LifecycleState::Monitoring,
            LifecycleState::Active,
        ] {
            assert_eq!(LifecycleState::from_db(state.as_db_str()), state);
        }
    }
}
