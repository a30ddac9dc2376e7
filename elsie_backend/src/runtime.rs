use std::sync::Arc;

use anyhow::Result;
use flume::Sender;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::dispatch::{BroadcastSink, Dispatcher, ResponseRequest, ResponseSink};
use crate::journal::DecisionJournal;
use crate::roleplay::{EngineEvent, IncomingMessage, MessageOutcome, RoleplayEngine};

const RESPONSE_BROADCAST_CAPACITY: usize = 256;

pub struct BackendRuntime {
    pub config: EngineConfig,
    pub engine: Arc<RoleplayEngine>,
    pub journal: Option<Arc<DecisionJournal>>,
    pub dispatcher: Dispatcher,
    pub responses: Arc<BroadcastSink>,
}

pub struct BackendRuntimeBuilder {
    config: EngineConfig,
    event_tx: Option<Sender<EngineEvent>>,
    sinks: Vec<Arc<dyn ResponseSink>>,
    open_journal: bool,
}

impl BackendRuntimeBuilder {
    pub fn new(config: EngineConfig, event_tx: Sender<EngineEvent>) -> Self {
        Self {
            config,
            event_tx: Some(event_tx),
            sinks: Vec::new(),
            open_journal: true,
        }
    }

    /// Engine only: no event channel and no journal file. Used for offline
    /// replay.
    pub fn detached(config: EngineConfig) -> Self {
        Self {
            config,
            event_tx: None,
            sinks: Vec::new(),
            open_journal: false,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ResponseSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn build(self) -> Result<BackendRuntime> {
        let config = self.config;
        let responses = Arc::new(BroadcastSink::new(RESPONSE_BROADCAST_CAPACITY));
        let mut dispatcher = Dispatcher::from_config(&config, responses.clone())?;
        for sink in self.sinks {
            tracing::info!("Registered response sink '{}'", sink.name());
            dispatcher = dispatcher.with_sink(sink);
        }

        let journal = if self.open_journal {
            match DecisionJournal::new(&config.journal_path) {
                Ok(journal) => Some(Arc::new(journal)),
                Err(e) => {
                    tracing::warn!("Failed to open decision journal: {:#}", e);
                    None
                }
            }
        } else {
            None
        };

        let engine = Arc::new(RoleplayEngine::new(&config, self.event_tx));
        tracing::info!(
            "Engine ready for '{}' (rule order: {:?})",
            config.character_name,
            engine
                .resolver()
                .order()
                .iter()
                .map(|rule| rule.as_str())
                .collect::<Vec<_>>()
        );

        Ok(BackendRuntime {
            config,
            engine,
            journal,
            dispatcher,
            responses,
        })
    }
}

impl BackendRuntime {
    pub fn bootstrap(config: EngineConfig, event_tx: Sender<EngineEvent>) -> Result<Self> {
        BackendRuntimeBuilder::new(config, event_tx).build()
    }

    /// Decide, then hand positive decisions to the sinks without waiting.
    pub async fn handle_message(&self, message: &IncomingMessage) -> MessageOutcome {
        let outcome = self.engine.process(message).await;
        if let Some(request) = ResponseRequest::from_outcome(message, &outcome) {
            self.dispatcher.spawn_dispatch(request);
        }
        outcome
    }

    /// Must be called from inside a tokio runtime.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        tracing::info!(
            "Inactivity sweep every {}s (timeout {}s)",
            self.config.sweep_interval_secs,
            self.config.inactivity_timeout_secs
        );
        self.engine.spawn_sweeper()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roleplay::ResponseType;

    #[tokio::test]
    async fn positive_decisions_reach_the_broadcast_sink() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = EngineConfig::default();
        config.journal_path = dir.path().join("journal.db").to_string_lossy().to_string();
        let (tx, rx) = flume::unbounded();
        let runtime = BackendRuntime::bootstrap(config, tx).expect("runtime");
        assert!(runtime.journal.is_some());
        let mut responses = runtime.responses.subscribe();

        let outcome = runtime
            .handle_message(&IncomingMessage::new("c1", "u1", "Hi Elsie!"))
            .await;
        assert_eq!(outcome.decision.response_type, ResponseType::ActiveDialogue);
        let request = responses.recv().await.expect("response request");
        assert_eq!(request.message_text, "Hi Elsie!");
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[tokio::test]
    async fn detached_runtime_has_no_journal() {
        let runtime = BackendRuntimeBuilder::detached(EngineConfig::default())
            .build()
            .expect("runtime");
        assert!(runtime.journal.is_none());
        let outcome = runtime
            .handle_message(&IncomingMessage::new("c1", "u1", "just chatting"))
            .await;
        assert!(!outcome.decision.should_respond);
    }
}
