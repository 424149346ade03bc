use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::pipeline::RewritePipeline;
use crate::registry::SessionRegistry;
use crate::state::{AgentState, StateStore};

/// What a dispatched line produced: the reply for the requester, and whether
/// the connection should close after the reply is flushed.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub reply: String,
    pub close: bool,
}

impl DispatchOutcome {
    fn reply(text: impl Into<String>) -> Self {
        Self {
            reply: text.into(),
            close: false,
        }
    }
}

/// A decoded command line: a slash command from the fixed table, an unknown
/// slash command, or a free-text rewrite request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Info,
    Data,
    History,
    Clients,
    Reload,
    Quit,
    Unknown(String),
    Rewrite(String),
}

impl Command {
    /// Classify a single non-empty line. Slash commands match
    /// case-insensitively; anything else is a rewrite request.
    pub fn parse(line: &str) -> Command {
        if let Some(rest) = line.strip_prefix('/') {
            match rest.to_ascii_lowercase().as_str() {
                "help" => Command::Help,
                "info" => Command::Info,
                "data" => Command::Data,
                "history" => Command::History,
                "clients" => Command::Clients,
                "reload" => Command::Reload,
                "quit" => Command::Quit,
                _ => Command::Unknown(line.to_string()),
            }
        } else {
            Command::Rewrite(line.to_string())
        }
    }
}

const HELP_TEXT: &str = "available commands:
  /help      this help
  /info      agent version, age and mutation count
  /data      stored data keys
  /history   last 10 rewrite requests
  /clients   connected sessions
  /reload    ask the operator to restart with the current artifact
  /quit      disconnect

anything else is treated as a rewrite request, for example:
  add a function to compute fibonacci numbers
  add a prime check command
  cache rewrite responses in the data store";

const FAREWELL_TEXT: &str = "goodbye";

/// Interprets decoded lines and applies their side effects: state reads and
/// writes, broadcasts to other sessions, and pipeline invocations.
pub struct Dispatcher {
    state: Arc<RwLock<AgentState>>,
    store: Arc<StateStore>,
    registry: Arc<SessionRegistry>,
    pipeline: Arc<RewritePipeline>,
}

impl Dispatcher {
    pub fn new(
        state: Arc<RwLock<AgentState>>,
        store: Arc<StateStore>,
        registry: Arc<SessionRegistry>,
        pipeline: Arc<RewritePipeline>,
    ) -> Self {
        Self {
            state,
            store,
            registry,
            pipeline,
        }
    }

    pub async fn dispatch(&self, session_id: &str, line: &str) -> DispatchOutcome {
        match Command::parse(line) {
            Command::Help => DispatchOutcome::reply(HELP_TEXT),
            Command::Info => self.handle_info().await,
            Command::Data => self.handle_data().await,
            Command::History => self.handle_history().await,
            Command::Clients => self.handle_clients(),
            Command::Reload => self.handle_reload(session_id),
            Command::Quit => DispatchOutcome {
                reply: FAREWELL_TEXT.to_string(),
                close: true,
            },
            Command::Unknown(text) => {
                DispatchOutcome::reply(format!("unknown command: {text} (try /help)"))
            }
            Command::Rewrite(request) => self.handle_rewrite(session_id, &request).await,
        }
    }

    async fn handle_info(&self) -> DispatchOutcome {
        let state = self.state.read().await;
        DispatchOutcome::reply(format!(
            "agent info:\n  version: {}\n  created: {}\n  mutations applied: {}\n  connected sessions: {}",
            state.version,
            state.created_at.format("%Y-%m-%d %H:%M:%S"),
            state.mutation_count,
            self.registry.len(),
        ))
    }

    async fn handle_data(&self) -> DispatchOutcome {
        let state = self.state.read().await;
        if state.data_store.is_empty() {
            return DispatchOutcome::reply("data store is empty");
        }
        let mut keys: Vec<&String> = state.data_store.keys().collect();
        keys.sort();
        let mut out = String::from("stored data:");
        for key in keys {
            let value = state.data_store[key].to_string();
            let shown: String = value.chars().take(100).collect();
            let ellipsis = if value.chars().count() > 100 { "..." } else { "" };
            out.push_str(&format!("\n  {key}: {shown}{ellipsis}"));
        }
        DispatchOutcome::reply(out)
    }

    async fn handle_history(&self) -> DispatchOutcome {
        let state = self.state.read().await;
        let records = state.history();
        if records.is_empty() {
            return DispatchOutcome::reply("no rewrite requests yet");
        }
        let mut out = String::from("recent rewrite requests:");
        for record in records {
            out.push_str(&format!(
                "\n  {} [{}] {}",
                record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                record.actor,
                record.text
            ));
        }
        DispatchOutcome::reply(out)
    }

    fn handle_clients(&self) -> DispatchOutcome {
        let ids = self.registry.ids();
        if ids.is_empty() {
            return DispatchOutcome::reply("no connected sessions");
        }
        let mut out = format!("{} connected session(s):", ids.len());
        for id in ids {
            out.push_str(&format!("\n  {id}"));
        }
        DispatchOutcome::reply(out)
    }

    fn handle_reload(&self, session_id: &str) -> DispatchOutcome {
        let notified = self.registry.broadcast(
            &format!("* session {session_id} requested a reload"),
            Some(session_id),
        );
        info!(session = %session_id, notified, "reload requested");
        DispatchOutcome::reply(
            "reload requested - restart the process to pick up the current artifact",
        )
    }

    /// Free-text rewrite: record history, announce to the other sessions, run
    /// the pipeline, and report back. Failures go to the requester only.
    async fn handle_rewrite(&self, session_id: &str, request: &str) -> DispatchOutcome {
        {
            let mut state = self.state.write().await;
            state.push_history(session_id, request);
        }
        self.registry.broadcast(
            &format!("* session {session_id} requested a rewrite: {request}"),
            Some(session_id),
        );
        info!(session = %session_id, request = %request, "rewrite requested");

        match self.pipeline.run(request, &self.state, &self.store).await {
            Ok(outcome) => {
                self.registry.broadcast(
                    &format!(
                        "* rewrite complete (mutation #{}), restart to apply",
                        outcome.mutation_count
                    ),
                    Some(session_id),
                );
                DispatchOutcome::reply(format!(
                    "rewrite committed\n  backup: {}\n  restart the process to apply the new artifact",
                    outcome.backup_path.display()
                ))
            }
            Err(e) => {
                warn!(session = %session_id, error = %e, "rewrite failed");
                DispatchOutcome::reply(format!("rewrite failed: {e}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use crate::pipeline::Rewriter;
    use async_trait::async_trait;
    use std::fs;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct StubRewriter {
        reply: Result<String, ()>,
    }

    #[async_trait]
    impl Rewriter for StubRewriter {
        async fn rewrite(&self, _current: &str, _request: &str) -> Result<String, LlmError> {
            match &self.reply {
                Ok(text) => Ok(text.clone()),
                Err(()) => Err(LlmError::Api {
                    status: 503,
                    message: "down".to_string(),
                }),
            }
        }
    }

    fn dispatcher_with(reply: Result<String, ()>) -> (Dispatcher, Arc<SessionRegistry>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("agent.rs");
        fs::write(&artifact, "fn main() {}\n").unwrap();

        let state = Arc::new(RwLock::new(AgentState::default()));
        let store = Arc::new(StateStore::new(dir.path().join("state.json")));
        let registry = Arc::new(SessionRegistry::new());
        let pipeline = Arc::new(RewritePipeline::new(
            artifact,
            dir.path().join("backups"),
            Arc::new(StubRewriter { reply }),
        ));
        let dispatcher = Dispatcher::new(state, store, registry.clone(), pipeline);
        (dispatcher, registry, dir)
    }

    fn register(registry: &SessionRegistry, id: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(id.to_string(), tx);
        rx
    }

    #[test]
    fn test_command_parse_case_insensitive() {
        assert_eq!(Command::parse("/HELP"), Command::Help);
        assert_eq!(Command::parse("/Info"), Command::Info);
        assert_eq!(Command::parse("/quit"), Command::Quit);
        assert_eq!(Command::parse("/history"), Command::History);
    }

    #[test]
    fn test_command_parse_unknown_keeps_offending_text() {
        match Command::parse("/frobnicate") {
            Command::Unknown(text) => assert_eq!(text, "/frobnicate"),
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn test_command_parse_free_text() {
        match Command::parse("aggiungi una funzione per calcolare il fattoriale") {
            Command::Rewrite(text) => assert!(text.contains("fattoriale")),
            other => panic!("expected Rewrite, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_help_lists_commands() {
        let (dispatcher, _registry, _dir) = dispatcher_with(Ok(String::new()));
        let outcome = dispatcher.dispatch("peer", "/help").await;
        assert!(outcome.reply.contains("/info"));
        assert!(outcome.reply.contains("/quit"));
        assert!(!outcome.close);
    }

    #[tokio::test]
    async fn test_info_reports_mutation_count_and_sessions() {
        let (dispatcher, registry, _dir) = dispatcher_with(Ok(String::new()));
        let _rx = register(&registry, "a");
        let outcome = dispatcher.dispatch("a", "/info").await;
        assert!(outcome.reply.contains("mutations applied: 0"));
        assert!(outcome.reply.contains("connected sessions: 1"));
    }

    #[tokio::test]
    async fn test_data_shows_default_keys() {
        let (dispatcher, _registry, _dir) = dispatcher_with(Ok(String::new()));
        let outcome = dispatcher.dispatch("a", "/data").await;
        assert!(outcome.reply.contains("sample_data"));
        assert!(outcome.reply.contains("settings"));
    }

    #[tokio::test]
    async fn test_quit_closes_with_farewell() {
        let (dispatcher, _registry, _dir) = dispatcher_with(Ok(String::new()));
        let outcome = dispatcher.dispatch("a", "/quit").await;
        assert_eq!(outcome.reply, "goodbye");
        assert!(outcome.close);
    }

    #[tokio::test]
    async fn test_unknown_command_names_offender() {
        let (dispatcher, _registry, _dir) = dispatcher_with(Ok(String::new()));
        let outcome = dispatcher.dispatch("a", "/bogus").await;
        assert!(outcome.reply.contains("/bogus"));
        assert!(!outcome.close);
    }

    #[tokio::test]
    async fn test_reload_broadcasts_to_others_only() {
        let (dispatcher, registry, _dir) = dispatcher_with(Ok(String::new()));
        let mut rx_self = register(&registry, "requester");
        let mut rx_other = register(&registry, "other");

        let outcome = dispatcher.dispatch("requester", "/reload").await;
        assert!(outcome.reply.contains("reload requested"));
        assert!(rx_other.try_recv().unwrap().contains("requested a reload"));
        assert!(rx_self.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rewrite_success_broadcasts_and_reports_backup() {
        let (dispatcher, registry, _dir) =
            dispatcher_with(Ok("#[BEGIN]\nfn main() { v2(); }\n#[END]".to_string()));
        let mut rx_other = register(&registry, "other");

        let outcome = dispatcher.dispatch("requester", "make it v2").await;
        assert!(outcome.reply.contains("rewrite committed"));
        assert!(outcome.reply.contains("backup:"));
        assert!(!outcome.close);

        // Other session sees the request notice then the completion notice
        assert!(rx_other.try_recv().unwrap().contains("requested a rewrite"));
        assert!(rx_other.try_recv().unwrap().contains("rewrite complete"));
    }

    #[tokio::test]
    async fn test_rewrite_failure_reported_to_requester_only() {
        let (dispatcher, registry, _dir) = dispatcher_with(Err(()));
        let mut rx_other = register(&registry, "other");

        let outcome = dispatcher.dispatch("requester", "break things").await;
        assert!(outcome.reply.contains("rewrite failed"));

        // Request notice was broadcast, but no failure broadcast follows
        assert!(rx_other.try_recv().unwrap().contains("requested a rewrite"));
        assert!(rx_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rewrite_records_history() {
        let (dispatcher, _registry, _dir) = dispatcher_with(Err(()));
        dispatcher.dispatch("peer", "remember me").await;

        let outcome = dispatcher.dispatch("peer", "/history").await;
        assert!(outcome.reply.contains("remember me"));
        assert!(outcome.reply.contains("[peer]"));
    }
}
