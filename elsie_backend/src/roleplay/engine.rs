use std::sync::Arc;

use chrono::{DateTime, Utc};
use flume::Sender;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use super::character::Character;
use super::commands::{CommandInterpreter, DirectorAction, DirectorCommand};
use super::cues::{ContextualCues, CueBuilder};
use super::decision::{DecisionContext, Engagement, PriorityResolver, ResponseDecision};
use super::exit::ExitMonitor;
use super::message::{ChannelRef, IncomingMessage};
use super::registry::SessionRegistry;
use super::session::{
    advance, LifecyclePolicy, LifecycleState, SceneActivity, SceneTurn, Session, SessionEvent,
};
use crate::config::EngineConfig;

/// Emitted for the journal and live observers. Never awaited on the
/// decision path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    DecisionMade {
        session_key: Option<String>,
        channel: ChannelRef,
        author_id: String,
        message_text: String,
        command: DirectorCommand,
        decision: ResponseDecision,
        cues: ContextualCues,
        at: DateTime<Utc>,
    },
    SessionChanged {
        session_key: String,
        from: LifecycleState,
        to: LifecycleState,
        reason: String,
        session: Session,
        at: DateTime<Utc>,
    },
}

impl EngineEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::DecisionMade { .. } => "decision_made",
            Self::SessionChanged { .. } => "session_changed",
        }
    }
}

/// Everything produced for one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageOutcome {
    pub decision: ResponseDecision,
    pub cues: ContextualCues,
    pub command: DirectorCommand,
    pub session_key: Option<String>,
    /// Session as stored after this message.
    pub session: Session,
}

/// Per-message pipeline over a shared [`SessionRegistry`].
pub struct RoleplayEngine {
    interpreter: CommandInterpreter,
    cue_builder: CueBuilder,
    resolver: PriorityResolver,
    exit_monitor: ExitMonitor,
    policy: LifecyclePolicy,
    registry: Arc<SessionRegistry>,
    events: Option<Sender<EngineEvent>>,
    sweep_interval: std::time::Duration,
}

impl RoleplayEngine {
    pub fn new(config: &EngineConfig, events: Option<Sender<EngineEvent>>) -> Self {
        Self::with_registry(config, Arc::new(SessionRegistry::new()), events)
    }

    pub fn with_registry(
        config: &EngineConfig,
        registry: Arc<SessionRegistry>,
        events: Option<Sender<EngineEvent>>,
    ) -> Self {
        let interpreter = CommandInterpreter::new(&config.director_tags);
        let cue_builder = CueBuilder::new(config, interpreter.reserved_tokens());
        let policy = LifecyclePolicy::from_config(config);
        let exit_monitor = ExitMonitor::new(policy.clone(), cue_builder.profile().clone());
        Self {
            resolver: PriorityResolver::from_config(config),
            interpreter,
            cue_builder,
            exit_monitor,
            policy,
            registry,
            events,
            sweep_interval: std::time::Duration::from_secs(config.sweep_interval_secs.max(1)),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn resolver(&self) -> &PriorityResolver {
        &self.resolver
    }

    /// Decide for one message. Holds the channel's lock from session read to
    /// write-back, so messages in one channel are handled one at a time.
    pub async fn process(&self, message: &IncomingMessage) -> MessageOutcome {
        let channel = message.channel();
        let command = self
            .interpreter
            .interpret(&message.raw_text, self.cue_builder.profile());

        let Some(key) = channel.session_key() else {
            return self.process_unidentified(message, channel, command);
        };

        let handle = self.registry.handle(&key, &channel).await;
        let mut session = handle.lock().await;
        let mut transitions = Vec::new();
        let at = message.timestamp;

        if let Some(timeout) = self.exit_monitor.check_timeout(&session, at) {
            self.apply(&key, &mut session, &timeout, at, &mut transitions);
        }

        let cues = self.build_cues(message, &session);
        let speaking_state = if command.is_director() {
            self.apply_director(&key, &channel, &command, &mut session, at, &mut transitions);
            session.lifecycle_state
        } else {
            self.apply_message(&key, &channel, message, &cues, &mut session, &mut transitions)
        };

        if session.is_engaged() {
            self.registry.claim(&key, &channel, at);
        }
        let engagement = self.registry.engagement_for(Some(&key), &channel);
        if !session.is_engaged() {
            self.registry.release(&key, at);
        }

        let mut warnings = Vec::new();
        if let Engagement::Unknown { channel: bound } = &engagement {
            tracing::warn!(
                "Cannot compare {} with engaged channel {}; allowing message",
                channel.label(),
                bound.label()
            );
            warnings.push(format!(
                "channel identity not comparable with {}; cross-channel check skipped",
                bound.label()
            ));
        }

        let decision = self.resolver.resolve(&DecisionContext {
            command: &command,
            cues: &cues,
            lifecycle: speaking_state,
            engagement: &engagement,
            is_direct_message: message.is_direct_message,
            warnings: &warnings,
        });
        let snapshot = session.clone();
        drop(session);

        for transition in transitions {
            self.emit(transition);
        }
        self.finish(Some(key), channel, message, command, decision, cues, snapshot)
    }

    /// No id and no name: nothing to key a session on, so run against a
    /// throwaway `Inactive` session and fail open.
    fn process_unidentified(
        &self,
        message: &IncomingMessage,
        channel: ChannelRef,
        command: DirectorCommand,
    ) -> MessageOutcome {
        tracing::warn!(
            "Message from {} has no channel identity; processing without a session",
            message.author_id
        );
        let session = Session::new("", channel.clone());
        let cues = self.build_cues(message, &session);
        let engagement = self.registry.engagement_for(None, &channel);
        let warnings =
            vec!["channel identity unavailable; processed without session state".to_string()];
        let decision = self.resolver.resolve(&DecisionContext {
            command: &command,
            cues: &cues,
            lifecycle: session.lifecycle_state,
            engagement: &engagement,
            is_direct_message: message.is_direct_message,
            warnings: &warnings,
        });
        self.finish(None, channel, message, command, decision, cues, session)
    }

    fn build_cues(&self, message: &IncomingMessage, session: &Session) -> ContextualCues {
        match self.cue_builder.build(message, session) {
            Ok(cues) => cues,
            Err(e) => {
                tracing::warn!("Cue extraction failed, treating message as unknown: {}", e);
                let mut cues = ContextualCues::unknown();
                cues.notes.push(format!("cue extraction failed: {}", e));
                cues
            }
        }
    }

    fn apply_director(
        &self,
        key: &str,
        channel: &ChannelRef,
        command: &DirectorCommand,
        session: &mut Session,
        at: DateTime<Utc>,
        transitions: &mut Vec<EngineEvent>,
    ) {
        let directory = self.cue_builder.directory();
        let event = match command.action {
            DirectorAction::EndScene => SessionEvent::DirectorEnd { at },
            DirectorAction::PuppetCharacter => {
                let name = command
                    .target_character
                    .as_deref()
                    .map(|name| directory.canonical_name(name))
                    .unwrap_or_default();
                SessionEvent::Puppet {
                    character: directory.character(&name, at),
                    turn: SceneTurn {
                        speaker: Some(name),
                        author_id: None,
                        text: command.payload_text.clone(),
                        themes: self.cue_builder.lexicon().detect(&command.payload_text),
                        is_dialogue: true,
                        is_puppet: true,
                        at,
                    },
                }
            }
            DirectorAction::StartScene | DirectorAction::None => SessionEvent::DirectorStart {
                characters: command
                    .roster_seed
                    .iter()
                    .map(|name| directory.character(&directory.canonical_name(name), at))
                    .collect(),
                at,
            },
        };
        if command.malformed {
            tracing::warn!(
                "Malformed director command in {}; treating as scene start",
                channel.label()
            );
        }
        self.apply(key, session, &event, at, transitions);
    }

    /// Apply a regular message. Returns the state that decides eligibility:
    /// the scene as it stood before any exit this message triggered.
    fn apply_message(
        &self,
        key: &str,
        channel: &ChannelRef,
        message: &IncomingMessage,
        cues: &ContextualCues,
        session: &mut Session,
        transitions: &mut Vec<EngineEvent>,
    ) -> LifecycleState {
        let at = message.timestamp;
        if cues.degraded {
            return session.lifecycle_state;
        }
        let characters = self.scene_characters(cues, at);

        if !session.is_engaged() && !message.is_direct_message {
            let bound_elsewhere = !matches!(
                self.registry.engagement_for(Some(key), channel),
                Engagement::Unbound | Engagement::Here
            );
            if cues.roleplay_signal > self.policy.implicit_trigger_threshold && !bound_elsewhere {
                let trigger = SessionEvent::ImplicitTrigger {
                    confidence: cues.roleplay_signal,
                    characters: characters.clone(),
                    at,
                };
                self.apply(key, session, &trigger, at, transitions);
            } else if bound_elsewhere && cues.roleplay_signal > self.policy.implicit_trigger_threshold
            {
                tracing::debug!(
                    "Roleplay markup in {} ignored while engaged elsewhere",
                    channel.label()
                );
            }
        }
        if !session.is_engaged() {
            return session.lifecycle_state;
        }

        if cues.elsie_directly_addressed {
            self.apply(key, session, &SessionEvent::ElsieAddressed { at }, at, transitions);
        }
        let activity = SessionEvent::Activity(SceneActivity {
            turn: SceneTurn {
                speaker: cues.speaker_name().map(str::to_string),
                author_id: Some(message.author_id.clone()),
                text: message.raw_text.clone(),
                themes: cues.message_themes.clone(),
                is_dialogue: cues.is_dialogue,
                is_puppet: false,
                at,
            },
            characters,
            speaker_marker: cues.speaker_name().map(str::to_string),
        });
        self.apply(key, session, &activity, at, transitions);
        let speaking_state = session.lifecycle_state;

        let exits =
            self.exit_monitor
                .evaluate(session, &message.raw_text, cues.speaker_name(), at);
        for exit in exits {
            self.apply(key, session, &exit, at, transitions);
        }
        speaking_state
    }

    /// Speaker plus characters named in brackets or emotes. Addressed-only
    /// names are left out until they show up themselves.
    fn scene_characters(&self, cues: &ContextualCues, at: DateTime<Utc>) -> Vec<Character> {
        let profile = self.cue_builder.profile();
        let directory = self.cue_builder.directory();
        let mut characters: Vec<Character> = Vec::new();
        if let Some(speaker) = cues.speaker.as_ref() {
            if !profile.is_name(&speaker.display_name) {
                characters.push(speaker.clone());
            }
        }
        for name in &cues.mentioned_characters {
            if profile.refers_to_self(name) || characters.iter().any(|c| c.matches(name)) {
                continue;
            }
            characters.push(directory.character(name, at));
        }
        characters
    }

    fn apply(
        &self,
        key: &str,
        session: &mut Session,
        event: &SessionEvent,
        at: DateTime<Utc>,
        transitions: &mut Vec<EngineEvent>,
    ) {
        let next = advance(session, event, &self.policy);
        if next.lifecycle_state != session.lifecycle_state {
            tracing::info!(
                "Session {} {} -> {} ({})",
                key,
                session.lifecycle_state.as_db_str(),
                next.lifecycle_state.as_db_str(),
                event.kind()
            );
            transitions.push(EngineEvent::SessionChanged {
                session_key: key.to_string(),
                from: session.lifecycle_state,
                to: next.lifecycle_state,
                reason: event.kind().to_string(),
                session: next.clone(),
                at,
            });
        }
        *session = next;
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        session_key: Option<String>,
        channel: ChannelRef,
        message: &IncomingMessage,
        command: DirectorCommand,
        decision: ResponseDecision,
        cues: ContextualCues,
        session: Session,
    ) -> MessageOutcome {
        tracing::debug!(
            "Decision for {}: {} respond={} ({:.2})",
            channel.label(),
            decision.response_type.as_db_str(),
            decision.should_respond,
            decision.confidence
        );
        self.emit(EngineEvent::DecisionMade {
            session_key: session_key.clone(),
            channel,
            author_id: message.author_id.clone(),
            message_text: message.raw_text.clone(),
            command: command.clone(),
            decision: decision.clone(),
            cues: cues.clone(),
            at: message.timestamp,
        });
        MessageOutcome {
            decision,
            cues,
            command,
            session_key,
            session,
        }
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.events {
            if tx.send(event).is_err() {
                tracing::debug!("Engine event receiver dropped");
            }
        }
    }

    /// Close every engaged session idle past the timeout at `now`, then evict
    /// `Inactive` sessions nobody holds. Takes the same per-channel lock as
    /// [`process`](Self::process). Returns how many closed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut closed = 0;
        for key in self.registry.keys().await {
            let Some(handle) = self.registry.existing(&key).await else {
                continue;
            };
            let mut session = handle.lock().await;
            let Some(timeout) = self.exit_monitor.check_timeout(&session, now) else {
                continue;
            };
            let mut transitions = Vec::new();
            self.apply(&key, &mut session, &timeout, now, &mut transitions);
            if !session.is_engaged() {
                self.registry.release(&key, now);
                closed += 1;
            }
            drop(session);
            for transition in transitions {
                self.emit(transition);
            }
        }
        if closed > 0 {
            tracing::info!("Inactivity sweep closed {} session(s)", closed);
        }
        self.registry.prune_inactive().await;
        closed
    }

    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                engine.sweep(Utc::now()).await;
            }
        })
    }
}
