use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as SessionLock, RwLock};

use super::decision::Engagement;
use super::message::{ChannelMatch, ChannelRef};
use super::session::Session;

/// The channel the AI character is currently performing in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementBinding {
    pub key: String,
    pub channel: ChannelRef,
    pub since: DateTime<Utc>,
}

/// The binding plus engaged sessions queued behind it, in the order they
/// asked for it.
#[derive(Debug, Default)]
struct Engagements {
    bound: Option<EngagementBinding>,
    waiting: Vec<EngagementBinding>,
}

/// Thread-safe table of per-channel sessions.
///
/// Each session sits behind its own async lock; holding it is the critical
/// section for one channel. The outer map lock is only held long enough to
/// find or insert a handle, so different channels never wait on each other.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionLock<Session>>>>,
    engagements: Mutex<Engagements>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_engagements(&self) -> MutexGuard<'_, Engagements> {
        // Plain values; a panic elsewhere cannot leave them torn.
        self.engagements
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Handle for the channel's session, creating an `Inactive` one on first use.
    pub async fn handle(&self, key: &str, channel: &ChannelRef) -> Arc<SessionLock<Session>> {
        if let Some(existing) = self.sessions.read().await.get(key) {
            return existing.clone();
        }
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(key.to_string())
            .or_insert_with(|| {
                tracing::debug!("Registered session for {}", channel.label());
                Arc::new(SessionLock::new(Session::new(key, channel.clone())))
            })
            .clone()
    }

    pub async fn existing(&self, key: &str) -> Option<Arc<SessionLock<Session>>> {
        self.sessions.read().await.get(key).cloned()
    }

    pub async fn snapshot(&self, key: &str) -> Option<Session> {
        let handle = self.existing(key).await?;
        let session = handle.lock().await;
        Some(session.clone())
    }

    /// Copies of every session, ordered by key.
    pub async fn snapshots(&self) -> Vec<Session> {
        let handles: Vec<Arc<SessionLock<Session>>> = {
            let sessions = self.sessions.read().await;
            let mut entries: Vec<_> = sessions.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            entries.into_iter().map(|(_, handle)| handle.clone()).collect()
        };
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            out.push(handle.lock().await.clone());
        }
        out
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Drop `Inactive` sessions that no task is holding. Returns how many
    /// went.
    pub async fn prune_inactive(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        // With the write lock held nobody can clone a handle, so a count of
        // one means the map owns the only reference.
        sessions.retain(|_, handle| {
            if Arc::strong_count(handle) > 1 {
                return true;
            }
            handle
                .try_lock()
                .map(|session| session.is_engaged())
                .unwrap_or(true)
        });
        let pruned = before - sessions.len();
        if pruned > 0 {
            tracing::debug!("Evicted {} idle session(s)", pruned);
        }
        pruned
    }

    pub fn binding(&self) -> Option<EngagementBinding> {
        self.lock_engagements().bound.clone()
    }

    /// Engaged sessions queued for the binding, oldest first.
    pub fn waiting(&self) -> Vec<String> {
        self.lock_engagements()
            .waiting
            .iter()
            .map(|entry| entry.key.clone())
            .collect()
    }

    /// Where the AI character is engaged relative to `channel`.
    pub fn engagement_for(&self, key: Option<&str>, channel: &ChannelRef) -> Engagement {
        let Some(binding) = self.binding() else {
            return Engagement::Unbound;
        };
        if key == Some(binding.key.as_str()) {
            return Engagement::Here;
        }
        match channel.compare(&binding.channel) {
            ChannelMatch::Same => Engagement::Here,
            ChannelMatch::Different => Engagement::Elsewhere {
                channel: binding.channel,
            },
            ChannelMatch::Unknown => Engagement::Unknown {
                channel: binding.channel,
            },
        }
    }

    /// Take the binding for `key` if it is free, otherwise queue behind the
    /// current holder. Returns whether `key` holds it afterwards.
    pub fn claim(&self, key: &str, channel: &ChannelRef, at: DateTime<Utc>) -> bool {
        let mut guard = self.lock_engagements();
        let engagements = &mut *guard;
        let entry = EngagementBinding {
            key: key.to_string(),
            channel: channel.clone(),
            since: at,
        };
        match &engagements.bound {
            Some(current) if current.key == key => true,
            Some(current) => {
                if !engagements.waiting.iter().any(|waiting| waiting.key == key) {
                    tracing::debug!(
                        "{} waiting on engagement in {}",
                        channel.label(),
                        current.channel.label()
                    );
                    engagements.waiting.push(entry);
                }
                false
            }
            None => {
                tracing::info!("Engaged in {}", channel.label());
                engagements.bound = Some(entry);
                true
            }
        }
    }

    /// Drop `key` from the queue, and if it holds the binding pass it to the
    /// longest-waiting engaged session. Returns whether `key` held it.
    pub fn release(&self, key: &str, at: DateTime<Utc>) -> bool {
        let mut engagements = self.lock_engagements();
        engagements.waiting.retain(|entry| entry.key != key);
        if !engagements
            .bound
            .as_ref()
            .is_some_and(|current| current.key == key)
        {
            return false;
        }
        if let Some(released) = engagements.bound.take() {
            tracing::info!("Released engagement in {}", released.channel.label());
        }
        if !engagements.waiting.is_empty() {
            let mut next = engagements.waiting.remove(0);
            next.since = at;
            tracing::info!("Engagement handed to {}", next.channel.label());
            engagements.bound = Some(next);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roleplay::session::LifecycleState;

    #[tokio::test]
    async fn one_session_per_key() {
        let registry = SessionRegistry::new();
        let channel = ChannelRef::with_id("c1");
        let first = registry.handle("c1", &channel).await;
        let second = registry.handle("c1", &channel).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len().await, 1);

        first.lock().await.lifecycle_state = LifecycleState::Monitoring;
        let snapshot = registry.snapshot("c1").await.expect("session");
        assert_eq!(snapshot.lifecycle_state, LifecycleState::Monitoring);
        assert!(registry.snapshot("missing").await.is_none());
    }

    #[tokio::test]
    async fn concurrent_handles_share_one_session() {
        let registry = Arc::new(SessionRegistry::new());
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let handle = registry.handle("busy", &ChannelRef::with_id("busy")).await;
                let mut session = handle.lock().await;
                let key = format!("a{}", session.author_characters.len());
                session.author_characters.insert(key, "x".into());
            }));
        }
        for task in tasks {
            task.await.expect("task");
        }
        assert_eq!(registry.keys().await, vec!["busy"]);
        let session = registry.snapshot("busy").await.expect("session");
        assert_eq!(session.author_characters.len(), 16);
    }

    #[test]
    fn binding_is_claimed_once_and_released_by_owner() {
        let registry = SessionRegistry::new();
        let bar = ChannelRef::new(Some("c1"), Some("bar"));
        let deck = ChannelRef::new(Some("c2"), Some("deck"));
        let now = Utc::now();

        assert_eq!(registry.engagement_for(Some("c1"), &bar), Engagement::Unbound);
        assert!(registry.claim("c1", &bar, now));
        assert!(!registry.claim("c2", &deck, now));
        assert!(registry.claim("c1", &bar, now));

        assert_eq!(registry.engagement_for(Some("c1"), &bar), Engagement::Here);
        assert!(matches!(
            registry.engagement_for(Some("c2"), &deck),
            Engagement::Elsewhere { .. }
        ));

        assert!(!registry.release("c2", now));
        assert!(registry.release("c1", now));
        assert!(registry.binding().is_none());
        assert!(registry.claim("c2", &deck, now));
    }

    #[test]
    fn released_binding_passes_to_the_oldest_waiting_session() {
        let registry = SessionRegistry::new();
        let now = Utc::now();
        let bar = ChannelRef::with_id("c1");
        let deck = ChannelRef::with_id("c2");
        let holodeck = ChannelRef::with_id("c3");

        assert!(registry.claim("c1", &bar, now));
        assert!(!registry.claim("c2", &deck, now));
        assert!(!registry.claim("c3", &holodeck, now));
        assert!(!registry.claim("c2", &deck, now));
        assert_eq!(registry.waiting(), vec!["c2", "c3"]);

        let later = now + chrono::Duration::minutes(3);
        assert!(registry.release("c1", later));
        let binding = registry.binding().expect("handed off");
        assert_eq!(binding.key, "c2");
        assert_eq!(binding.since, later);
        assert!(matches!(
            registry.engagement_for(Some("c4"), &ChannelRef::with_id("c4")),
            Engagement::Elsewhere { .. }
        ));

        // A waiting session that closes leaves the queue without the binding.
        assert!(!registry.release("c3", later));
        assert!(registry.waiting().is_empty());
        assert!(registry.release("c2", later));
        assert!(registry.binding().is_none());
    }

    #[tokio::test]
    async fn prune_keeps_engaged_and_held_sessions() {
        let registry = SessionRegistry::new();
        let idle = registry.handle("idle", &ChannelRef::with_id("idle")).await;
        drop(idle);
        let scene = registry.handle("scene", &ChannelRef::with_id("scene")).await;
        scene.lock().await.lifecycle_state = LifecycleState::Monitoring;
        drop(scene);
        let held = registry.handle("held", &ChannelRef::with_id("held")).await;

        assert_eq!(registry.prune_inactive().await, 1);
        assert_eq!(registry.keys().await, vec!["held", "scene"]);

        drop(held);
        assert_eq!(registry.prune_inactive().await, 1);
        assert_eq!(registry.keys().await, vec!["scene"]);
    }

    #[test]
    fn engagement_falls_back_to_names_then_unknown() {
        let registry = SessionRegistry::new();
        registry.claim("name:bar", &ChannelRef::with_name("Bar"), Utc::now());
        assert_eq!(
            registry.engagement_for(Some("c9"), &ChannelRef::new(Some("c9"), Some("bar"))),
            Engagement::Here
        );
        assert!(matches!(
            registry.engagement_for(Some("name:deck"), &ChannelRef::with_name("deck")),
            Engagement::Elsewhere { .. }
        ));
        assert!(matches!(
            registry.engagement_for(None, &ChannelRef::default()),
            Engagement::Unknown { .. }
        ));
    }
}
