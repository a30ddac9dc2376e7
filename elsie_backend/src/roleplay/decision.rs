//! Priority resolver: an ordered table of (guard, handler) rules. The first
//! rule whose guard holds decides; nothing after it runs.

use serde::{Deserialize, Serialize};

use super::addressing::AddressingType;
use super::clamp01;
use super::commands::{DirectorAction, DirectorCommand};
use super::cues::ContextualCues;
use super::message::ChannelRef;
use super::session::LifecycleState;
use crate::config::EngineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    None,
    ActiveDialogue,
    SubtleService,
    SupportiveListen,
    TechnicalExpertise,
    GroupAcknowledgment,
    CrossChannelBusy,
    DgmSceneStart,
    DgmSceneEnd,
}

impl ResponseType {
    pub fn as_db_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ActiveDialogue => "active_dialogue",
            Self::SubtleService => "subtle_service",
            Self::SupportiveListen => "supportive_listen",
            Self::TechnicalExpertise => "technical_expertise",
            Self::GroupAcknowledgment => "group_acknowledgment",
            Self::CrossChannelBusy => "cross_channel_busy",
            Self::DgmSceneStart => "dgm_scene_start",
            Self::DgmSceneEnd => "dgm_scene_end",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value {
            "active_dialogue" => Self::ActiveDialogue,
            "subtle_service" => Self::SubtleService,
            "supportive_listen" => Self::SupportiveListen,
            "technical_expertise" => Self::TechnicalExpertise,
            "group_acknowledgment" => Self::GroupAcknowledgment,
            "cross_channel_busy" => Self::CrossChannelBusy,
            "dgm_scene_start" => Self::DgmSceneStart,
            "dgm_scene_end" => Self::DgmSceneEnd,
            _ => Self::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleId {
    DirectorOverride,
    CrossChannel,
    DirectAddress,
    EmotionalSupport,
    GroupAddress,
    TechnicalExpertise,
    OtherCharacterAddressed,
    Default,
}

impl RuleId {
    pub const ALL: [RuleId; 8] = [
        RuleId::DirectorOverride,
        RuleId::CrossChannel,
        RuleId::DirectAddress,
        RuleId::EmotionalSupport,
        RuleId::GroupAddress,
        RuleId::TechnicalExpertise,
        RuleId::OtherCharacterAddressed,
        RuleId::Default,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DirectorOverride => "director_override",
            Self::CrossChannel => "cross_channel",
            Self::DirectAddress => "direct_address",
            Self::EmotionalSupport => "emotional_support",
            Self::GroupAddress => "group_address",
            Self::TechnicalExpertise => "technical_expertise",
            Self::OtherCharacterAddressed => "other_character_addressed",
            Self::Default => "default",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|rule| rule.as_str() == normalized)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseDecision {
    pub should_respond: bool,
    pub response_type: ResponseType,
    pub confidence: f32,
    pub approach: String,
    pub tone: String,
    pub reasoning: String,
    pub rule: RuleId,
}

/// Where the AI character is currently engaged, relative to the message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Engagement {
    Unbound,
    Here,
    Elsewhere { channel: ChannelRef },
    /// Bound somewhere, but the identities cannot be compared.
    Unknown { channel: ChannelRef },
}

/// Everything a rule may look at. Read-only.
#[derive(Debug, Clone, Copy)]
pub struct DecisionContext<'a> {
    pub command: &'a DirectorCommand,
    pub cues: &'a ContextualCues,
    pub lifecycle: LifecycleState,
    pub engagement: &'a Engagement,
    pub is_direct_message: bool,
    pub warnings: &'a [String],
}

impl DecisionContext<'_> {
    /// Eligible to speak: scene Active, addressed directly, or a DM.
    pub fn eligible(&self) -> bool {
        self.lifecycle == LifecycleState::Active
            || self.cues.elsie_directly_addressed
            || self.is_direct_message
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolverPolicy {
    pub vulnerability_threshold: f32,
    pub service_threshold: f32,
}

impl ResolverPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            vulnerability_threshold: clamp01(config.vulnerability_threshold),
            service_threshold: 0.5,
        }
    }
}

impl Default for ResolverPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Speak {
    Never,
    Always,
    IfEligible,
}

struct Verdict {
    response_type: ResponseType,
    confidence: f32,
    approach: &'static str,
    tone: &'static str,
    explanation: String,
    speak: Speak,
}

type Guard = fn(&DecisionContext<'_>, &ResolverPolicy) -> bool;
type Handler = fn(&DecisionContext<'_>, &ResolverPolicy) -> Verdict;

#[derive(Clone, Copy)]
struct Rule {
    id: RuleId,
    guard: Guard,
    handler: Handler,
}

fn rule(id: RuleId) -> Rule {
    match id {
        RuleId::DirectorOverride => Rule {
            id,
            guard: |ctx, _| ctx.command.is_director(),
            handler: director_override,
        },
        RuleId::CrossChannel => Rule {
            id,
            guard: |ctx, _| matches!(ctx.engagement, Engagement::Elsewhere { .. }),
            handler: cross_channel,
        },
        RuleId::DirectAddress => Rule {
            id,
            guard: |ctx, _| ctx.cues.elsie_directly_addressed,
            handler: direct_address,
        },
        RuleId::EmotionalSupport => Rule {
            id,
            guard: |ctx, policy| {
                ctx.cues.vulnerability_score > policy.vulnerability_threshold
                    && ctx.cues.addressing_type != AddressingType::DirectAddressGroup
            },
            handler: emotional_support,
        },
        RuleId::GroupAddress => Rule {
            id,
            guard: |ctx, _| ctx.cues.addressing_type == AddressingType::DirectAddressGroup,
            handler: group_address,
        },
        RuleId::TechnicalExpertise => Rule {
            id,
            guard: |ctx, _| live_expertise(ctx.cues).next().is_some(),
            handler: technical_expertise,
        },
        RuleId::OtherCharacterAddressed => Rule {
            id,
            guard: |ctx, _| ctx.cues.other_character_addressed && !ctx.cues.elsie_directly_addressed,
            handler: other_character_addressed,
        },
        RuleId::Default => Rule {
            id,
            guard: |_, _| true,
            handler: default_rule,
        },
    }
}

/// Matched tags that the current message itself carries.
fn live_expertise(cues: &ContextualCues) -> impl Iterator<Item = &String> {
    cues.expertise_matches
        .iter()
        .filter(|tag| cues.message_themes.contains(*tag))
}

fn director_override(ctx: &DecisionContext<'_>, _: &ResolverPolicy) -> Verdict {
    let command = ctx.command;
    let malformed = if command.malformed {
        " (malformed payload treated as scene start)"
    } else {
        ""
    };
    match command.action {
        DirectorAction::EndScene => Verdict {
            response_type: ResponseType::DgmSceneEnd,
            confidence: 1.0,
            approach: "scene_end",
            tone: "none",
            explanation: "director ended the scene".to_string(),
            speak: Speak::Never,
        },
        DirectorAction::PuppetCharacter => Verdict {
            response_type: ResponseType::None,
            confidence: 1.0,
            approach: "silent_puppet",
            tone: "none",
            explanation: format!(
                "director puppeted {}; line recorded verbatim",
                command.target_character.as_deref().unwrap_or("unknown")
            ),
            speak: Speak::Never,
        },
        DirectorAction::StartScene | DirectorAction::None => Verdict {
            response_type: ResponseType::DgmSceneStart,
            confidence: 1.0,
            approach: "scene_setup",
            tone: "none",
            explanation: format!(
                "director set the scene with roster [{}]{}",
                command.roster_seed.join(", "),
                malformed
            ),
            speak: Speak::Never,
        },
    }
}

fn cross_channel(ctx: &DecisionContext<'_>, _: &ResolverPolicy) -> Verdict {
    let label = match ctx.engagement {
        Engagement::Elsewhere { channel } => channel.label(),
        _ => "another channel".to_string(),
    };
    Verdict {
        response_type: ResponseType::CrossChannelBusy,
        confidence: 1.0,
        approach: "busy_elsewhere",
        tone: "none",
        explanation: format!("engaged in a scene in {}", label),
        speak: Speak::Never,
    }
}

fn direct_address(ctx: &DecisionContext<'_>, policy: &ResolverPolicy) -> Verdict {
    let cues = ctx.cues;
    let tone = if cues.vulnerability_score > policy.vulnerability_threshold {
        "gentle"
    } else if cues.emotional_tone.is_negative() {
        "calm"
    } else {
        "warm"
    };
    let how = if ctx.is_direct_message {
        "direct message"
    } else {
        "addressed by name, title or directed emote"
    };
    Verdict {
        response_type: ResponseType::ActiveDialogue,
        confidence: clamp01(cues.addressing_confidence.max(0.5)),
        approach: "direct_reply",
        tone,
        explanation: how.to_string(),
        speak: Speak::Always,
    }
}

fn emotional_support(ctx: &DecisionContext<'_>, policy: &ResolverPolicy) -> Verdict {
    let cues = ctx.cues;
    let mention = if cues.addressing_type == AddressingType::ContextualMention {
        "; collective term is a contextual mention"
    } else {
        ""
    };
    Verdict {
        response_type: ResponseType::SupportiveListen,
        confidence: clamp01(cues.vulnerability_score),
        approach: "supportive_listen",
        tone: "gentle",
        explanation: format!(
            "vulnerability {:.2} > {:.2} (markers: {}){}",
            cues.vulnerability_score,
            policy.vulnerability_threshold,
            cues.vulnerability_markers.join(", "),
            mention
        ),
        speak: Speak::IfEligible,
    }
}

fn group_address(ctx: &DecisionContext<'_>, _: &ResolverPolicy) -> Verdict {
    let term = ctx
        .cues
        .group_term
        .as_ref()
        .map(|group| group.term.as_str())
        .unwrap_or("group");
    Verdict {
        response_type: ResponseType::GroupAcknowledgment,
        confidence: clamp01(ctx.cues.addressing_confidence),
        approach: "group_acknowledgment",
        tone: "friendly",
        explanation: format!("collective '{}' used as a vocative", term),
        speak: Speak::IfEligible,
    }
}

fn technical_expertise(ctx: &DecisionContext<'_>, _: &ResolverPolicy) -> Verdict {
    let live: Vec<&str> = live_expertise(ctx.cues).map(String::as_str).collect();
    Verdict {
        response_type: ResponseType::TechnicalExpertise,
        confidence: clamp01(0.6 + 0.1 * live.len() as f32),
        approach: "share_expertise",
        tone: "knowledgeable",
        explanation: format!("expertise domain matches live theme: {}", live.join(", ")),
        speak: Speak::IfEligible,
    }
}

fn other_character_addressed(ctx: &DecisionContext<'_>, _: &ResolverPolicy) -> Verdict {
    let names: Vec<&str> = ctx
        .cues
        .addressed_targets
        .iter()
        .map(|character| character.display_name.as_str())
        .collect();
    Verdict {
        response_type: ResponseType::None,
        confidence: clamp01(ctx.cues.addressing_confidence),
        approach: "stay_out",
        tone: "none",
        explanation: format!("message is directed at {}", names.join(", ")),
        speak: Speak::Never,
    }
}

fn default_rule(ctx: &DecisionContext<'_>, policy: &ResolverPolicy) -> Verdict {
    let cues = ctx.cues;
    if cues.degraded {
        return Verdict {
            response_type: ResponseType::None,
            confidence: 1.0,
            approach: "observe",
            tone: "none",
            explanation: "cue extraction failed; staying silent".to_string(),
            speak: Speak::Never,
        };
    }
    if ctx.lifecycle == LifecycleState::Active && cues.service_signal >= policy.service_threshold {
        return Verdict {
            response_type: ResponseType::SubtleService,
            confidence: clamp01(cues.service_signal),
            approach: "subtle_service",
            tone: "attentive",
            explanation: format!("routine service moment ({:.2})", cues.service_signal),
            speak: Speak::IfEligible,
        };
    }
    Verdict {
        response_type: ResponseType::None,
        confidence: 0.5,
        approach: "observe",
        tone: "none",
        explanation: "no rule matched; observing".to_string(),
        speak: Speak::Never,
    }
}

/// Ordered rule table. `director_override` is always first and `default`
/// always last; the configured order arranges the rest and omitted rules
/// are disabled.
#[derive(Clone)]
pub struct PriorityResolver {
    rules: Vec<Rule>,
    policy: ResolverPolicy,
}

impl std::fmt::Debug for PriorityResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityResolver")
            .field("order", &self.order())
            .field("policy", &self.policy)
            .finish()
    }
}

impl PriorityResolver {
    pub fn new(order: &[RuleId], policy: ResolverPolicy) -> Self {
        let mut ids = vec![RuleId::DirectorOverride];
        for id in order {
            if matches!(id, RuleId::DirectorOverride | RuleId::Default) || ids.contains(id) {
                continue;
            }
            ids.push(*id);
        }
        ids.push(RuleId::Default);
        Self {
            rules: ids.into_iter().map(rule).collect(),
            policy,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        let mut order = Vec::new();
        for name in &config.rule_order {
            match RuleId::parse(name) {
                Some(id) => order.push(id),
                None => tracing::warn!("Ignoring unknown rule '{}' in rule_order", name),
            }
        }
        Self::new(&order, ResolverPolicy::from_config(config))
    }

    pub fn default_order() -> Vec<RuleId> {
        RuleId::ALL.to_vec()
    }

    pub fn order(&self) -> Vec<RuleId> {
        self.rules.iter().map(|rule| rule.id).collect()
    }

    pub fn policy(&self) -> &ResolverPolicy {
        &self.policy
    }

    pub fn resolve(&self, ctx: &DecisionContext<'_>) -> ResponseDecision {
        let Some(rule) = self
            .rules
            .iter()
            .find(|rule| (rule.guard)(ctx, &self.policy))
        else {
            // Unreachable while the default rule is pinned last.
            return self.finish(ctx, RuleId::Default, default_rule(ctx, &self.policy));
        };
        tracing::debug!("Rule '{}' matched", rule.id.as_str());
        self.finish(ctx, rule.id, (rule.handler)(ctx, &self.policy))
    }

    fn finish(&self, ctx: &DecisionContext<'_>, id: RuleId, verdict: Verdict) -> ResponseDecision {
        let eligible = ctx.eligible();
        let should_respond = match verdict.speak {
            Speak::Never => false,
            Speak::Always => true,
            Speak::IfEligible => eligible,
        };

        let mut reasoning = format!(
            "[{}] {}; state={} {}",
            id.as_str(),
            verdict.explanation,
            ctx.lifecycle.as_db_str(),
            ctx.cues.summary()
        );
        if verdict.speak == Speak::IfEligible && !eligible {
            reasoning.push_str(&format!(
                "; withheld: scene is {} and {} was not addressed",
                ctx.lifecycle.as_db_str(),
                "the AI character"
            ));
        }
        for warning in ctx.warnings {
            reasoning.push_str("; warning: ");
            reasoning.push_str(warning);
        }

        ResponseDecision {
            should_respond,
            response_type: verdict.response_type,
            confidence: clamp01(verdict.confidence),
            approach: verdict.approach.to_string(),
            tone: verdict.tone.to_string(),
            reasoning,
            rule: id,
        }
    }
}

impl Default for PriorityResolver {
    fn default() -> Self {
        Self::new(&Self::default_order(), ResolverPolicy::default())
    }
}
