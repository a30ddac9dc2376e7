//! Scene orchestration core: decides, per incoming message, whether the AI
//! character acts in a roleplay scene and how.
//!
//! Pipeline per message: command interpreter, session lookup, addressing
//! analysis, cue building, exit checks, then the priority resolver.

pub mod addressing;
pub mod character;
pub mod commands;
pub mod cues;
pub mod decision;
pub mod engine;
pub mod exit;
pub mod message;
pub mod registry;
pub mod session;
pub mod themes;
pub mod tone;

pub use addressing::{AddressingAnalysis, AddressingType};
pub use character::{Character, CharacterProfile};
pub use commands::{CommandInterpreter, DirectorAction, DirectorCommand};
pub use cues::{ContextualCues, CueBuilder};
pub use decision::{Engagement, PriorityResolver, ResponseDecision, ResponseType, RuleId};
pub use engine::{EngineEvent, MessageOutcome, RoleplayEngine};
pub use exit::ExitMonitor;
pub use message::{ChannelMatch, ChannelRef, IncomingMessage};
pub use registry::{EngagementBinding, SessionRegistry};
pub use session::{advance, LifecyclePolicy, LifecycleState, OpenedBy, Session, SessionEvent};

pub(crate) fn clamp01(value: f32) -> f32 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Combine independent evidence weights: 1 - prod(1 - w).
pub(crate) fn noisy_or<I>(weights: I) -> f32
where
    I: IntoIterator<Item = f32>,
{
    let miss = weights
        .into_iter()
        .fold(1.0_f32, |acc, weight| acc * (1.0 - clamp01(weight)));
    clamp01(1.0 - miss)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp01_handles_out_of_range_and_nan() {
        assert_eq!(clamp01(1.7), 1.0);
        assert_eq!(clamp01(-0.2), 0.0);
        assert_eq!(clamp01(f32::NAN), 0.0);
    }

    #[test]
    fn noisy_or_accumulates_without_exceeding_one() {
        assert_eq!(noisy_or(Vec::<f32>::new()), 0.0);
        let combined = noisy_or([0.5, 0.5]);
        assert!((combined - 0.75).abs() < 1e-6);
        assert!(noisy_or([0.9, 0.9, 0.9]) <= 1.0);
    }
}
