use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

use crate::roleplay::{EngineEvent, LifecycleState, ResponseType, RuleId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: String,
    pub session_key: Option<String>,
    pub channel_label: String,
    pub author_id: String,
    pub message_text: String,
    pub director_action: String,
    pub response_type: ResponseType,
    pub should_respond: bool,
    pub confidence: f32,
    pub rule: RuleId,
    pub approach: String,
    pub tone: String,
    pub reasoning: String,
    pub cues: serde_json::Value,
    pub decided_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub id: String,
    pub session_key: String,
    pub from_state: LifecycleState,
    pub to_state: LifecycleState,
    pub reason: String,
    pub participants: Vec<String>,
    pub changed_at: DateTime<Utc>,
}

/// Append-only SQLite log of decisions and lifecycle transitions.
pub struct DecisionJournal {
    conn: Mutex<Connection>,
}

fn parse_timestamp(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    row.get::<_, String>(index)?.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
    })
}

impl DecisionJournal {
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Journal lock poisoned: {}", e))
    }

    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open journal at {}", path.display()))?;
        let journal = Self {
            conn: Mutex::new(conn),
        };
        journal.ensure_schema()?;
        Ok(journal)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS decisions (
                id TEXT PRIMARY KEY,
                session_key TEXT,
                channel_label TEXT NOT NULL,
                author_id TEXT NOT NULL,
                message_text TEXT NOT NULL,
                director_action TEXT NOT NULL,
                response_type TEXT NOT NULL,
                should_respond INTEGER NOT NULL,
                confidence REAL NOT NULL,
                rule TEXT NOT NULL,
                approach TEXT NOT NULL,
                tone TEXT NOT NULL,
                reasoning TEXT NOT NULL,
                cues_json TEXT NOT NULL,
                decided_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS session_transitions (
                id TEXT PRIMARY KEY,
                session_key TEXT NOT NULL,
                from_state TEXT NOT NULL,
                to_state TEXT NOT NULL,
                reason TEXT NOT NULL,
                participants_json TEXT NOT NULL,
                changed_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_decisions_session ON decisions(session_key, decided_at DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_transitions_session ON session_transitions(session_key, changed_at DESC)",
            [],
        )?;

        Ok(())
    }

    /// Persist one engine event. Returns the new row id.
    pub fn record(&self, event: &EngineEvent) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let conn = self.lock_conn()?;
        match event {
            EngineEvent::DecisionMade {
                session_key,
                channel,
                author_id,
                message_text,
                command,
                decision,
                cues,
                at,
            } => {
                let cues_json =
                    serde_json::to_string(cues).context("Failed to serialize cues")?;
                conn.execute(
                    "INSERT INTO decisions (id, session_key, channel_label, author_id, message_text,
                        director_action, response_type, should_respond, confidence, rule, approach,
                        tone, reasoning, cues_json, decided_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                    params![
                        id,
                        session_key,
                        channel.label(),
                        author_id,
                        message_text,
                        command.action.as_str(),
                        decision.response_type.as_db_str(),
                        decision.should_respond,
                        decision.confidence as f64,
                        decision.rule.as_str(),
                        decision.approach,
                        decision.tone,
                        decision.reasoning,
                        cues_json,
                        at.to_rfc3339(),
                    ],
                )?;
            }
            EngineEvent::SessionChanged {
                session_key,
                from,
                to,
                reason,
                session,
                at,
            } => {
                let participants = serde_json::to_string(&session.roster_names())?;
                conn.execute(
                    "INSERT INTO session_transitions (id, session_key, from_state, to_state, reason,
                        participants_json, changed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        id,
                        session_key,
                        from.as_db_str(),
                        to.as_db_str(),
                        reason,
                        participants,
                        at.to_rfc3339(),
                    ],
                )?;
            }
        }
        Ok(id)
    }

    /// Newest first. `session_key` narrows to one channel.
    pub fn recent_decisions(
        &self,
        session_key: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DecisionRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_key, channel_label, author_id, message_text, director_action,
                    response_type, should_respond, confidence, rule, approach, tone, reasoning,
                    cues_json, decided_at
             FROM decisions
             WHERE (?1 IS NULL OR session_key = ?1)
             ORDER BY decided_at DESC, rowid DESC
             LIMIT ?2",
        )?;

        let rows = stmt
            .query_map(params![session_key, limit as i64], |row| {
                let cues_json: String = row.get(13)?;
                Ok(DecisionRecord {
                    id: row.get(0)?,
                    session_key: row.get(1)?,
                    channel_label: row.get(2)?,
                    author_id: row.get(3)?,
                    message_text: row.get(4)?,
                    director_action: row.get(5)?,
                    response_type: ResponseType::from_db(&row.get::<_, String>(6)?),
                    should_respond: row.get(7)?,
                    confidence: row.get::<_, f64>(8)? as f32,
                    rule: RuleId::parse(&row.get::<_, String>(9)?).unwrap_or(RuleId::Default),
                    approach: row.get(10)?,
                    tone: row.get(11)?,
                    reasoning: row.get(12)?,
                    cues: serde_json::from_str(&cues_json).unwrap_or(serde_json::Value::Null),
                    decided_at: parse_timestamp(row, 14)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    pub fn recent_transitions(
        &self,
        session_key: Option<&str>,
        limit: usize,
    ) -> Result<Vec<TransitionRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_key, from_state, to_state, reason, participants_json, changed_at
             FROM session_transitions
             WHERE (?1 IS NULL OR session_key = ?1)
             ORDER BY changed_at DESC, rowid DESC
             LIMIT ?2",
        )?;

        let rows = stmt
            .query_map(params![session_key, limit as i64], |row| {
                let participants: String = row.get(5)?;
                Ok(TransitionRecord {
                    id: row.get(0)?,
                    session_key: row.get(1)?,
                    from_state: LifecycleState::from_db(&row.get::<_, String>(2)?),
                    to_state: LifecycleState::from_db(&row.get::<_, String>(3)?),
                    reason: row.get(4)?,
                    participants: serde_json::from_str(&participants).unwrap_or_default(),
                    changed_at: parse_timestamp(row, 6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    pub fn count_decisions(&self) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM decisions", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::roleplay::{IncomingMessage, RoleplayEngine};

    async fn journal_with_events(path: &Path) -> DecisionJournal {
        let journal = DecisionJournal::new(path).expect("journal init");
        let (tx, rx) = flume::unbounded();
        let engine = RoleplayEngine::new(&EngineConfig::default(), Some(tx));
        for (channel, text) in [
            ("c1", "[DGM] The doors slide open. *John enters.*"),
            ("c1", "Elsie, what do you recommend tonight?"),
            ("c2", "Hi Elsie!"),
            ("c1", "[DGM][END]"),
        ] {
            engine
                .process(&IncomingMessage::new(channel, "u1", text))
                .await;
        }
        for event in rx.try_iter() {
            journal.record(&event).expect("record event");
        }
        journal
    }

    #[tokio::test]
    async fn decisions_are_queryable_by_channel() {
        let dir = tempfile::tempdir().expect("tempdir");
        let journal = journal_with_events(&dir.path().join("journal.db")).await;

        assert_eq!(journal.count_decisions().expect("count"), 4);
        let c1 = journal.recent_decisions(Some("c1"), 10).expect("query c1");
        assert_eq!(c1.len(), 3);
        assert_eq!(c1[0].response_type, ResponseType::DgmSceneEnd);
        assert_eq!(c1[0].director_action, "end_scene");
        assert_eq!(c1[0].rule, RuleId::DirectorOverride);

        let c2 = journal.recent_decisions(Some("c2"), 10).expect("query c2");
        assert_eq!(c2.len(), 1);
        assert_eq!(c2[0].response_type, ResponseType::CrossChannelBusy);
        assert!(c2[0].cues.get("addressing_type").is_some());

        assert_eq!(journal.recent_decisions(None, 2).expect("limit").len(), 2);
    }

    #[tokio::test]
    async fn transitions_record_the_roster() {
        let dir = tempfile::tempdir().expect("tempdir");
        let journal = journal_with_events(&dir.path().join("journal.db")).await;

        let transitions = journal.recent_transitions(Some("c1"), 10).expect("transitions");
        let states: Vec<(LifecycleState, LifecycleState)> = transitions
            .iter()
            .rev()
            .map(|t| (t.from_state, t.to_state))
            .collect();
        assert_eq!(
            states,
            vec![
                (LifecycleState::Inactive, LifecycleState::Monitoring),
                (LifecycleState::Monitoring, LifecycleState::Active),
                (LifecycleState::Active, LifecycleState::Inactive),
            ]
        );
        assert_eq!(transitions.last().map(|t| t.participants.clone()), Some(vec!["John".to_string()]));
        assert!(transitions[0].participants.is_empty());
    }

    #[test]
    fn reopening_keeps_existing_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("journal.db");
        {
            let journal = DecisionJournal::new(&path).expect("journal init");
            assert_eq!(journal.count_decisions().expect("count"), 0);
        }
        let journal = DecisionJournal::new(&path).expect("journal reopen");
        assert!(journal.recent_transitions(None, 5).expect("query").is_empty());
    }
}
