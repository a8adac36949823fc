//! Orchestrator: the agent loop that turns one user query into one answer.
//!
//! Each query runs:
//! 1. **AwaitingModel**: send the transcript and the current tool manifest
//!    to the model
//! 2. **Invoking**: if the model asked for tools, run them all concurrently
//!    and append every result in request order
//! 3. Back to AwaitingModel until the model answers (**Answering**) or a
//!    failure or the round limit stops the query (**Failed**)
//!
//! Tool failures are data for the model. Model-endpoint failures end the
//! query; credential and handshake failures end the orchestrator until it
//! is re-established.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::inference::errors::InferenceError;
use crate::inference::gateway::Gateway;
use crate::inference::types::{ModelTurn, ToolDefinition};
use crate::mcp_client::client::McpClient;
use crate::mcp_client::errors::McpError;

use super::conversation::Transcript;
use super::errors::AgentError;
use super::tool_router::{backoff_delay, ToolRouter};
use super::types::{Answer, Failure, FailureKind, LoopState};

/// Upper bound on a single gateway backoff sleep.
const MAX_GATEWAY_BACKOFF: Duration = Duration::from_secs(30);

type LoopError = (FailureKind, String);

// ─── Orchestrator ───────────────────────────────────────────────────────────

/// Owns the conversation, the model gateway and every server session.
pub struct Orchestrator {
    gateway: Arc<dyn Gateway>,
    mcp: McpClient,
    router: ToolRouter,
    config: AgentConfig,
    transcript: Transcript,
    state: LoopState,
    /// Set by a failure that makes further queries pointless.
    poisoned: Option<LoopError>,
}

impl Orchestrator {
    /// Build an orchestrator over already-started servers.
    pub fn new(gateway: Arc<dyn Gateway>, mcp: McpClient, config: AgentConfig) -> Self {
        Self {
            gateway,
            mcp,
            router: ToolRouter::from_config(&config),
            config,
            transcript: Transcript::new(),
            state: LoopState::Idle,
            poisoned: None,
        }
    }

    /// Replace the tool router (tests shorten its backoff).
    pub fn with_router(mut self, router: ToolRouter) -> Self {
        self.router = router;
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn mcp(&self) -> &McpClient {
        &self.mcp
    }

    pub fn mcp_mut(&mut self) -> &mut McpClient {
        &mut self.mcp
    }

    /// The failure kind that currently blocks new queries, if any.
    pub fn poisoned_by(&self) -> Option<FailureKind> {
        self.poisoned.as_ref().map(|(kind, _)| *kind)
    }

    /// Clear a blocking failure and bring servers back.
    ///
    /// Optionally swaps in a new gateway (e.g. with fresh credentials).
    /// Degraded or dead sessions are recovered and servers that are not
    /// running are started again. Returns the servers that still failed.
    pub async fn reestablish(
        &mut self,
        gateway: Option<Arc<dyn Gateway>>,
    ) -> Vec<(String, McpError)> {
        if let Some(gateway) = gateway {
            self.gateway = gateway;
        }
        if let Some((kind, _)) = self.poisoned.take() {
            tracing::info!(cleared = %kind, "re-establishing orchestrator");
        }
        self.state = LoopState::Idle;

        let mut failures = self.mcp.recover_sessions().await;
        failures.extend(self.mcp.start_all().await);
        failures
    }

    /// Close every server session.
    pub async fn shutdown(&mut self) {
        self.mcp.shutdown_all().await;
        self.state = LoopState::Idle;
    }

    // ─── Queries ────────────────────────────────────────────────────────

    /// Answer one user query.
    pub async fn answer(&mut self, query: &str) -> Result<Answer, Failure> {
        self.answer_with_cancel(query, &CancellationToken::new())
            .await
    }

    /// Answer one user query; cancelling `cancel` aborts the model request
    /// and every tool call in flight.
    pub async fn answer_with_cancel(
        &mut self,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Answer, Failure> {
        if let Some((kind, message)) = self.poisoned.clone() {
            return Err(self.fail(
                kind,
                format!("orchestrator unusable after earlier failure: {message}"),
            ));
        }
        if cancel.is_cancelled() {
            return Err(self.fail(FailureKind::Cancelled, "query cancelled before it started"));
        }
        if self.mcp.known_server_count() > 0 && self.mcp.running_server_count() == 0 {
            return Err(self.fail(
                FailureKind::NoServersAvailable,
                format!(
                    "none of the configured servers is available ({})",
                    self.mcp.configured_servers().join(", ")
                ),
            ));
        }

        match self.run_loop(query, cancel).await {
            Ok(answer) => {
                self.state = LoopState::Answering;
                tracing::info!(
                    rounds = answer.rounds,
                    tool_calls = answer.tool_calls,
                    chars = answer.text.len(),
                    "query answered"
                );
                Ok(answer)
            }
            Err((kind, message)) => Err(self.fail(kind, message)),
        }
    }

    async fn run_loop(
        &mut self,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Answer, LoopError> {
        self.transcript.push_user(query).map_err(transcript_error)?;

        let mut rounds = 0;
        let mut tool_calls = 0;

        loop {
            self.state = LoopState::AwaitingModel;
            let registry = self.mcp.registry();
            let manifest = registry.manifest();

            let (text, calls) = match self.converse_with_retry(&manifest, cancel).await? {
                ModelTurn::FinalAnswer(text) => {
                    self.transcript
                        .push_assistant(text.clone())
                        .map_err(transcript_error)?;
                    return Ok(Answer {
                        text,
                        rounds,
                        tool_calls,
                    });
                }
                ModelTurn::ToolRequests { text, calls } => (text, calls),
            };

            if rounds >= self.config.max_tool_rounds {
                return Err((
                    FailureKind::IterationLimitExceeded,
                    format!(
                        "model still requesting tools after {rounds} rounds (limit {})",
                        self.config.max_tool_rounds
                    ),
                ));
            }
            rounds += 1;
            tool_calls += calls.len();

            self.state = LoopState::Invoking;
            tracing::info!(
                round = rounds,
                calls = calls.len(),
                tools = ?calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                "invoking tools"
            );
            self.transcript
                .push_tool_calls(text, calls.clone())
                .map_err(transcript_error)?;

            let results = self
                .router
                .dispatch_tool_calls(&registry, &calls, cancel)
                .await;
            self.transcript
                .push_tool_results(&results, self.config.max_tool_result_chars)
                .map_err(transcript_error)?;

            if cancel.is_cancelled() {
                return Err((
                    FailureKind::Cancelled,
                    format!("query cancelled during tool round {rounds}"),
                ));
            }

            self.recover_servers().await?;
        }
    }

    /// One model round trip, retrying rate limits and network failures.
    async fn converse_with_retry(
        &self,
        manifest: &[ToolDefinition],
        cancel: &CancellationToken,
    ) -> Result<ModelTurn, LoopError> {
        let mut attempt: u32 = 0;

        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err((FailureKind::Cancelled, "query cancelled while waiting on the model".into()));
                }
                outcome = self.gateway.converse(self.transcript.messages(), manifest) => outcome,
            };

            let err = match outcome {
                Ok(turn) => return Ok(turn),
                Err(e) => e,
            };

            if !err.is_retriable() || attempt >= self.config.gateway_retries {
                return Err((gateway_failure_kind(&err), err.to_string()));
            }

            let delay = err
                .retry_after()
                .unwrap_or_else(|| {
                    backoff_delay(self.config.gateway_retry_base(), attempt, MAX_GATEWAY_BACKOFF)
                })
                .min(MAX_GATEWAY_BACKOFF);
            attempt += 1;
            tracing::warn!(
                attempt,
                max_retries = self.config.gateway_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "model request failed, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err((FailureKind::Cancelled, "query cancelled while waiting to retry the model".into()));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Give Degraded sessions their reconnect and drop dead ones.
    ///
    /// Fails the query when servers are configured but none is left.
    async fn recover_servers(&mut self) -> Result<(), LoopError> {
        let failures = self.mcp.recover_sessions().await;
        for (server, e) in &failures {
            tracing::warn!(server = %server, error = %e, "server dropped after failed reconnect");
        }

        if self.mcp.known_server_count() == 0 || self.mcp.running_server_count() > 0 {
            return Ok(());
        }

        let kind = if failures
            .iter()
            .any(|(_, e)| matches!(e, McpError::HandshakeFailed { .. }))
        {
            FailureKind::Handshake
        } else {
            FailureKind::Connection
        };
        let detail = if failures.is_empty() {
            "all sessions closed".to_string()
        } else {
            failures
                .iter()
                .map(|(server, e)| format!("{server}: {e}"))
                .collect::<Vec<_>>()
                .join("; ")
        };
        Err((kind, format!("no tool servers remain available ({detail})")))
    }

    fn fail(&mut self, kind: FailureKind, message: impl Into<String>) -> Failure {
        let message = message.into();
        self.state = LoopState::Failed;
        if kind.is_fatal_to_session() && self.poisoned.is_none() {
            self.poisoned = Some((kind, message.clone()));
        }
        tracing::error!(
            kind = %kind,
            error = %message,
            transcript_len = self.transcript.len(),
            "query failed"
        );
        Failure {
            kind,
            message,
            transcript: self.transcript.snapshot(),
        }
    }
}

fn gateway_failure_kind(err: &InferenceError) -> FailureKind {
    match err {
        InferenceError::RateLimited { .. } => FailureKind::RateLimit,
        InferenceError::Network { .. } => FailureKind::Network,
        InferenceError::Auth { .. } => FailureKind::Auth,
        InferenceError::MalformedReply { .. } => FailureKind::MalformedReply,
        InferenceError::Rejected { .. } | InferenceError::ConfigError { .. } => {
            FailureKind::GatewayRejected
        }
    }
}

fn transcript_error(err: AgentError) -> LoopError {
    (FailureKind::Transcript, err.to_string())
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;
    use crate::inference::types::Role;
    use crate::mcp_client::session::{SessionOptions, SessionState};
    use crate::mcp_client::types::ServerConfig;
    use crate::test_support::{
        departing_peer, tool_turn, wait_for_close, MockBehavior, MockConnector, MockHandle,
        MockServer, ScriptedGateway,
    };

    fn agent_config() -> AgentConfig {
        AgentConfig {
            max_tool_rounds: 10,
            call_timeout_ms: 2_000,
            timeout_retries: 0,
            gateway_retries: 2,
            gateway_retry_base_ms: 1,
            ..AgentConfig::default()
        }
    }

    /// Start an McpClient whose servers are the given mocks.
    async fn client_with(
        servers: Vec<MockServer>,
        degraded_after: u32,
    ) -> (McpClient, MockConnector, Vec<MockHandle>) {
        let connector = MockConnector::default();
        let mut configs = BTreeMap::new();
        let mut handles = Vec::new();
        for server in servers {
            let descriptor = server.descriptor();
            configs.insert(descriptor.name.clone(), descriptor.config.clone());
            handles.push(connector.register(server));
        }
        let options = SessionOptions {
            handshake_timeout: Duration::from_secs(2),
            degraded_after_timeouts: degraded_after,
        };
        let mut client =
            McpClient::with_connector(configs, options, Arc::new(connector.clone()));
        client.start_all().await;
        (client, connector, handles)
    }

    fn orchestrator(
        gateway: &Arc<ScriptedGateway>,
        client: McpClient,
        config: AgentConfig,
    ) -> Orchestrator {
        let router = ToolRouter::from_config(&config).with_retry_base_delay(Duration::from_millis(1));
        Orchestrator::new(Arc::clone(gateway) as Arc<dyn Gateway>, client, config)
            .with_router(router)
    }

    fn auth_error() -> InferenceError {
        InferenceError::Auth {
            status: 401,
            body: "invalid key".into(),
        }
    }

    fn rate_limited() -> InferenceError {
        InferenceError::RateLimited {
            status: 429,
            retry_after_secs: None,
            body: "slow down".into(),
        }
    }

    #[tokio::test]
    async fn test_q3_roadmap_scenario() {
        let (client, _connector, handles) = client_with(
            vec![
                MockServer::new("filesystem").tool("read_file", MockBehavior::reply("file body")),
                MockServer::new("chat-history")
                    .tool("chat_search", MockBehavior::reply("Decision: ship Q3 roadmap in August")),
            ],
            3,
        )
        .await;
        let gateway = Arc::new(ScriptedGateway::new(vec![
            Ok(tool_turn(&[(
                "c1",
                "chat_search",
                json!({"query": "Q3 roadmap decision"}),
            )])),
            Ok(ModelTurn::FinalAnswer("The team decided to ship in August.".into())),
        ]));
        let mut orch = orchestrator(&gateway, client, agent_config());

        let answer = orch
            .answer("What did the team decide about the Q3 roadmap?")
            .await
            .unwrap();
        assert_eq!(answer.text, "The team decided to ship in August.");
        assert_eq!(answer.rounds, 1);
        assert_eq!(orch.state(), LoopState::Answering);

        let roles: Vec<Role> = orch.transcript().messages().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
        );

        // Handles follow the order the mocks were given.
        let chat = &handles[1];
        assert_eq!(
            chat.calls(),
            vec![("chat_search".to_string(), json!({"query": "Q3 roadmap decision"}))]
        );
        assert_eq!(handles[0].call_count(), 0);

        let (second_transcript, manifest) = gateway.request(1);
        assert_eq!(manifest.len(), 2);
        assert_eq!(
            second_transcript[2].content.as_deref(),
            Some("Decision: ship Q3 roadmap in August")
        );
        assert_eq!(second_transcript[2].tool_call_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn test_auth_on_first_turn_invokes_no_tool() {
        let (client, _connector, handles) = client_with(
            vec![MockServer::new("fs").tool("read_file", MockBehavior::reply("x"))],
            3,
        )
        .await;
        let gateway = Arc::new(ScriptedGateway::new(vec![Err(auth_error())]));
        let mut orch = orchestrator(&gateway, client, agent_config());

        let failure = orch.answer("hello").await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Auth);
        assert_eq!(failure.transcript.len(), 1);
        assert_eq!(handles[0].call_count(), 0);
        assert_eq!(gateway.call_count(), 1, "auth errors are never retried");
        assert_eq!(orch.state(), LoopState::Failed);
        assert_eq!(orch.poisoned_by(), Some(FailureKind::Auth));
    }

    #[tokio::test]
    async fn test_auth_failure_blocks_until_reestablished() {
        let (client, _connector, _handles) = client_with(vec![], 3).await;
        let gateway = Arc::new(ScriptedGateway::new(vec![Err(auth_error())]));
        let mut orch = orchestrator(&gateway, client, agent_config());

        orch.answer("first").await.unwrap_err();
        let again = orch.answer("second").await.unwrap_err();
        assert_eq!(again.kind, FailureKind::Auth);
        assert_eq!(gateway.call_count(), 1, "blocked query never reaches the model");

        let fresh = Arc::new(ScriptedGateway::new(vec![Ok(ModelTurn::FinalAnswer(
            "hi".into(),
        ))]));
        let failures = orch
            .reestablish(Some(Arc::clone(&fresh) as Arc<dyn Gateway>))
            .await;
        assert!(failures.is_empty());
        assert_eq!(orch.poisoned_by(), None);

        let answer = orch.answer("third").await.unwrap();
        assert_eq!(answer.text, "hi");
    }

    #[tokio::test]
    async fn test_one_timeout_among_three_concurrent_calls() {
        let (client, _connector, handles) = client_with(
            vec![MockServer::new("srv")
                .tool("alpha", MockBehavior::delayed(Duration::from_millis(30), "A"))
                .tool("stuck", MockBehavior::Hang)
                .tool("beta", MockBehavior::reply("B"))],
            3,
        )
        .await;
        let gateway = Arc::new(ScriptedGateway::new(vec![
            Ok(tool_turn(&[
                ("1", "alpha", json!({})),
                ("2", "stuck", json!({})),
                ("3", "beta", json!({})),
            ])),
            Ok(ModelTurn::FinalAnswer("partial results".into())),
        ]));
        let config = AgentConfig {
            call_timeout_ms: 150,
            ..agent_config()
        };
        let mut orch = orchestrator(&gateway, client, config);

        let answer = orch.answer("do three things").await.unwrap();
        assert_eq!(answer.text, "partial results");
        assert_eq!(answer.tool_calls, 3);
        assert_eq!(gateway.call_count(), 2, "loop went back to the model");
        assert_eq!(handles[0].call_count(), 3);

        let (transcript, _) = gateway.request(1);
        let results: Vec<_> = transcript.iter().filter(|m| m.role == Role::Tool).collect();
        let ids: Vec<&str> = results
            .iter()
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert!(!results[0].is_error);
        assert!(results[1].is_error);
        assert!(results[1]
            .content
            .as_deref()
            .unwrap()
            .starts_with("Error [timeout]"));
        assert!(!results[2].is_error);
    }

    #[tokio::test]
    async fn test_round_limit_stops_before_extra_round() {
        let (client, _connector, handles) = client_with(
            vec![MockServer::new("srv").tool("again", MockBehavior::reply("more"))],
            3,
        )
        .await;
        let gateway = Arc::new(ScriptedGateway::repeating(tool_turn(&[(
            "c",
            "again",
            json!({}),
        )])));
        let config = AgentConfig {
            max_tool_rounds: 5,
            ..agent_config()
        };
        let mut orch = orchestrator(&gateway, client, config);

        let failure = orch.answer("loop forever").await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::IterationLimitExceeded);
        assert_eq!(handles[0].call_count(), 5, "no 6th round is invoked");
        assert_eq!(gateway.call_count(), 6);
        // user + 5 × (tool-call message + result)
        assert_eq!(failure.transcript.len(), 11);
        assert_eq!(orch.poisoned_by(), None);
    }

    #[tokio::test]
    async fn test_unknown_tool_goes_back_to_model() {
        let (client, _connector, handles) = client_with(
            vec![MockServer::new("srv").tool("real", MockBehavior::reply("ok"))],
            3,
        )
        .await;
        let gateway = Arc::new(ScriptedGateway::new(vec![
            Ok(tool_turn(&[("x", "imaginary", json!({}))])),
            Ok(ModelTurn::FinalAnswer("that tool does not exist".into())),
        ]));
        let mut orch = orchestrator(&gateway, client, agent_config());

        let answer = orch.answer("use the imaginary tool").await.unwrap();
        assert_eq!(answer.text, "that tool does not exist");
        assert_eq!(handles[0].call_count(), 0);

        let tool_msg = &orch.transcript().messages()[2];
        assert!(tool_msg.is_error);
        assert!(tool_msg
            .content
            .as_deref()
            .unwrap()
            .starts_with("Error [unknown_tool]"));
    }

    #[tokio::test]
    async fn test_rate_limit_retried_then_answered() {
        let (client, _connector, _handles) = client_with(vec![], 3).await;
        let gateway = Arc::new(ScriptedGateway::new(vec![
            Err(rate_limited()),
            Ok(ModelTurn::FinalAnswer("eventually".into())),
        ]));
        let mut orch = orchestrator(&gateway, client, agent_config());

        let answer = orch.answer("hi").await.unwrap();
        assert_eq!(answer.text, "eventually");
        assert_eq!(gateway.call_count(), 2);
    }

    #[tokio::test]
    async fn test_rate_limit_exhausted_fails_turn_only() {
        let (client, _connector, _handles) = client_with(vec![], 3).await;
        let gateway = Arc::new(ScriptedGateway::new(vec![
            Err(rate_limited()),
            Err(rate_limited()),
            Err(rate_limited()),
            Ok(ModelTurn::FinalAnswer("recovered".into())),
        ]));
        let mut orch = orchestrator(&gateway, client, agent_config());

        let failure = orch.answer("hi").await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::RateLimit);
        assert_eq!(gateway.call_count(), 3, "one attempt plus two retries");
        assert_eq!(orch.poisoned_by(), None);

        assert_eq!(orch.answer("hi again").await.unwrap().text, "recovered");
    }

    #[tokio::test]
    async fn test_malformed_reply_not_retried() {
        let (client, _connector, _handles) = client_with(vec![], 3).await;
        let gateway = Arc::new(ScriptedGateway::new(vec![Err(
            InferenceError::MalformedReply {
                reason: "empty".into(),
            },
        )]));
        let mut orch = orchestrator(&gateway, client, agent_config());

        let failure = orch.answer("hi").await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::MalformedReply);
        assert_eq!(gateway.call_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_tool_round() {
        let (client, _connector, handles) = client_with(
            vec![MockServer::new("srv").tool("hang", MockBehavior::Hang)],
            1,
        )
        .await;
        let gateway = Arc::new(ScriptedGateway::new(vec![Ok(tool_turn(&[(
            "c1",
            "hang",
            json!({}),
        )]))]));
        let config = AgentConfig {
            call_timeout_ms: 10_000,
            ..agent_config()
        };
        let mut orch = orchestrator(&gateway, client, config);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let failure = orch.answer_with_cancel("wait", &cancel).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Cancelled);
        // The call is still answered in the transcript.
        let last = failure.transcript.last().unwrap();
        assert_eq!(last.tool_call_id.as_deref(), Some("c1"));
        assert!(last.content.as_deref().unwrap().starts_with("Error [cancelled]"));

        // Cancellation never degrades, even with a threshold of one.
        let session = orch.mcp().session("srv").unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handles[0].cancellations().len(), 1);
    }

    #[tokio::test]
    async fn test_no_servers_available() {
        let connector = MockConnector::default();
        let mut configs = BTreeMap::new();
        configs.insert(
            "ghost".to_string(),
            ServerConfig {
                command: "ghost".into(),
                args: vec![],
                env: Default::default(),
                cwd: None,
            },
        );
        let mut client =
            McpClient::with_connector(configs, SessionOptions::default(), Arc::new(connector));
        assert_eq!(client.start_all().await.len(), 1);

        let gateway = Arc::new(ScriptedGateway::new(vec![]));
        let mut orch = orchestrator(&gateway, client, agent_config());

        let failure = orch.answer("anything").await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::NoServersAvailable);
        assert_eq!(gateway.call_count(), 0);
        assert!(failure.transcript.is_empty());
    }

    #[tokio::test]
    async fn test_only_server_exiting_between_queries() {
        let (mut client, _connector, _handles) = client_with(vec![], 3).await;
        let (session, leave) = departing_peer("web", None).await;
        let session = client.attach_session(session);

        let gateway = Arc::new(ScriptedGateway::new(vec![]));
        let mut orch = orchestrator(&gateway, client, agent_config());

        drop(leave);
        wait_for_close(&session).await;

        let failure = orch.answer("search again").await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::NoServersAvailable);
        assert_eq!(gateway.call_count(), 0);
    }

    #[tokio::test]
    async fn test_no_servers_configured_still_answers() {
        let (client, _connector, _handles) = client_with(vec![], 3).await;
        let gateway = Arc::new(ScriptedGateway::new(vec![Ok(ModelTurn::FinalAnswer(
            "plain answer".into(),
        ))]));
        let mut orch = orchestrator(&gateway, client, agent_config());

        assert_eq!(orch.answer("hi").await.unwrap().text, "plain answer");
        assert!(gateway.request(0).1.is_empty());
    }

    #[tokio::test]
    async fn test_degraded_server_reconnected_between_rounds() {
        let (client, _connector, handles) = client_with(
            vec![MockServer::new("srv")
                .tool("stuck", MockBehavior::Hang)
                .tool("ok", MockBehavior::reply("fine"))],
            1,
        )
        .await;
        let gateway = Arc::new(ScriptedGateway::new(vec![
            Ok(tool_turn(&[("1", "stuck", json!({}))])),
            Ok(tool_turn(&[("2", "ok", json!({}))])),
            Ok(ModelTurn::FinalAnswer("done".into())),
        ]));
        let config = AgentConfig {
            call_timeout_ms: 100,
            ..agent_config()
        };
        let mut orch = orchestrator(&gateway, client, config);

        let answer = orch.answer("go").await.unwrap();
        assert_eq!(answer.rounds, 2);
        assert_eq!(handles[0].connections(), 2, "degraded session was replaced");
        assert_eq!(
            orch.transcript().messages()[4].content.as_deref(),
            Some("fine")
        );
    }

    #[tokio::test]
    async fn test_failed_reconnect_of_last_server_fails_turn() {
        let (client, connector, _handles) = client_with(
            vec![MockServer::new("srv").tool("stuck", MockBehavior::Hang)],
            1,
        )
        .await;
        connector.remove("srv");
        let gateway = Arc::new(ScriptedGateway::new(vec![Ok(tool_turn(&[(
            "1",
            "stuck",
            json!({}),
        )]))]));
        let config = AgentConfig {
            call_timeout_ms: 100,
            ..agent_config()
        };
        let mut orch = orchestrator(&gateway, client, config);

        let failure = orch.answer("go").await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Connection);
        assert_eq!(gateway.call_count(), 1);
        assert_eq!(orch.mcp().running_server_count(), 0);

        // Next query is refused up front.
        let next = orch.answer("again").await.unwrap_err();
        assert_eq!(next.kind, FailureKind::NoServersAvailable);
    }
}
