//! MCP Client: owns every server session and the current tool registry.
//!
//! Orchestrates server lifecycle, registry rebuilds, and recovery of
//! sessions that degraded or died mid-conversation. This is the primary API
//! used by the orchestrator.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use futures::future::join_all;

use super::errors::McpError;
use super::registry::ToolRegistry;
use super::session::{ServerConnector, ServerSession, SessionOptions, SessionState, StdioConnector};
use super::types::{ServerConfig, ServerDescriptor};

// ─── McpClient ───────────────────────────────────────────────────────────────

/// High-level MCP client that manages multiple servers.
pub struct McpClient {
    /// Server configurations (for startup and reconnects), by name.
    configs: BTreeMap<String, ServerConfig>,
    /// Live sessions. The registry only holds weak references to these.
    sessions: HashMap<String, Arc<ServerSession>>,
    /// Snapshot handed out to dispatchers; replaced wholesale on change.
    registry: Arc<ToolRegistry>,
    connector: Arc<dyn ServerConnector>,
    options: SessionOptions,
}

impl McpClient {
    /// Create a client that launches servers as child processes.
    pub fn new(configs: BTreeMap<String, ServerConfig>, options: SessionOptions) -> Self {
        Self::with_connector(configs, options, Arc::new(StdioConnector))
    }

    /// Create a client that opens sessions through `connector`.
    pub fn with_connector(
        configs: BTreeMap<String, ServerConfig>,
        options: SessionOptions,
        connector: Arc<dyn ServerConnector>,
    ) -> Self {
        Self {
            configs,
            sessions: HashMap::new(),
            registry: Arc::new(ToolRegistry::new()),
            connector,
            options,
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Start all configured servers concurrently and build the tool registry.
    ///
    /// Servers that are already running are left alone. Returns the servers
    /// that failed to start (partial startup is OK).
    pub async fn start_all(&mut self) -> Vec<(String, McpError)> {
        let pending: Vec<ServerDescriptor> = self
            .configs
            .iter()
            .filter(|(name, _)| !self.is_server_running(name))
            .map(|(name, config)| ServerDescriptor::new(name, config.clone()))
            .collect();

        let connector = Arc::clone(&self.connector);
        let options = self.options.clone();
        let attempts = join_all(pending.iter().map(|d| connector.connect(d, &options))).await;

        let mut errors = Vec::new();
        for (descriptor, outcome) in pending.iter().zip(attempts) {
            match outcome {
                Ok(session) => {
                    tracing::info!(
                        server = %descriptor.name,
                        tools = session.list_tools().len(),
                        "server started"
                    );
                    self.sessions
                        .insert(descriptor.name.clone(), Arc::new(session));
                }
                Err(e) => {
                    tracing::error!(server = %descriptor.name, error = %e, "server failed to start");
                    errors.push((descriptor.name.clone(), e));
                }
            }
        }

        self.rebuild_registry();
        errors
    }

    /// Start a specific server by name.
    pub async fn start_server(&mut self, name: &str) -> Result<(), McpError> {
        let config = self.configs.get(name).ok_or(McpError::ConfigError {
            reason: format!("no configuration for server '{name}'"),
        })?;
        let descriptor = ServerDescriptor::new(name, config.clone());

        let session = self.connector.connect(&descriptor, &self.options).await?;
        if let Some(old) = self.sessions.insert(name.to_string(), Arc::new(session)) {
            old.close().await;
        }
        self.rebuild_registry();
        Ok(())
    }

    /// Add a session that was connected outside the client.
    pub fn attach_session(&mut self, session: ServerSession) -> Arc<ServerSession> {
        let session = Arc::new(session);
        self.sessions
            .insert(session.name().to_string(), Arc::clone(&session));
        self.rebuild_registry();
        session
    }

    /// Shut down all servers gracefully.
    pub async fn shutdown_all(&mut self) {
        let sessions: Vec<Arc<ServerSession>> = self.sessions.drain().map(|(_, s)| s).collect();
        join_all(sessions.iter().map(|s| s.close())).await;
        self.rebuild_registry();
        tracing::info!(count = sessions.len(), "all servers shut down");
    }

    /// Shut down a specific server.
    pub async fn shutdown_server(&mut self, name: &str) {
        if let Some(session) = self.sessions.remove(name) {
            session.close().await;
        }
        self.rebuild_registry();
    }

    // ─── Registry ────────────────────────────────────────────────────────

    /// The current registry snapshot.
    ///
    /// Holders keep a consistent view even if the client rebuilds afterwards.
    pub fn registry(&self) -> Arc<ToolRegistry> {
        Arc::clone(&self.registry)
    }

    /// Rebuild the registry from the current sessions and swap it in.
    pub fn rebuild_registry(&mut self) {
        let sessions: Vec<Arc<ServerSession>> = self.sessions.values().cloned().collect();
        let registry = ToolRegistry::build(&sessions);
        tracing::debug!(
            tools = registry.len(),
            servers = registry.server_names().len(),
            "tool registry rebuilt"
        );
        self.registry = Arc::new(registry);
    }

    // ─── Recovery ────────────────────────────────────────────────────────

    /// Replace Degraded sessions and drop Closed ones.
    ///
    /// Each Degraded session gets exactly one reconnect attempt: on success
    /// the fresh session takes its place, on failure the server is removed.
    /// The registry is rebuilt if anything changed. Returns the reconnects
    /// that failed.
    pub async fn recover_sessions(&mut self) -> Vec<(String, McpError)> {
        let mut names: Vec<String> = self.sessions.keys().cloned().collect();
        names.sort();

        let mut errors = Vec::new();
        let mut changed = false;

        for name in names {
            let Some(session) = self.sessions.get(&name).cloned() else {
                continue;
            };
            match session.state() {
                SessionState::Ready | SessionState::Connecting => {}
                SessionState::Closed => {
                    tracing::warn!(
                        server = %name,
                        reason = ?session.close_reason(),
                        "removing closed session"
                    );
                    self.sessions.remove(&name);
                    session.close().await;
                    changed = true;
                }
                SessionState::Degraded => {
                    changed = true;
                    if let Err(e) = self.reconnect(&name).await {
                        errors.push((name, e));
                    }
                }
            }
        }

        if changed {
            self.rebuild_registry();
        }
        errors
    }

    /// Close the session for `name` and open a fresh one for the same
    /// descriptor. The server is left out if the new session fails.
    async fn reconnect(&mut self, name: &str) -> Result<(), McpError> {
        let old = self.sessions.remove(name);
        let descriptor = match (&old, self.configs.get(name)) {
            (_, Some(config)) => ServerDescriptor::new(name, config.clone()),
            (Some(old), None) => old.descriptor().clone(),
            (None, None) => {
                return Err(McpError::ConfigError {
                    reason: format!("no configuration for server '{name}'"),
                })
            }
        };
        if let Some(old) = old {
            old.close().await;
        }

        tracing::info!(server = %name, "reconnecting degraded server");
        match self.connector.connect(&descriptor, &self.options).await {
            Ok(session) => {
                tracing::info!(server = %name, "server reconnected");
                self.sessions.insert(name.to_string(), Arc::new(session));
                Ok(())
            }
            Err(e) => {
                tracing::error!(server = %name, error = %e, "reconnect failed, server removed");
                Err(e)
            }
        }
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// Get the session for a server, if one exists.
    pub fn session(&self, name: &str) -> Option<Arc<ServerSession>> {
        self.sessions.get(name).cloned()
    }

    /// Number of servers whose tools are currently offered (Ready or Degraded).
    pub fn running_server_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| s.state().is_usable())
            .count()
    }

    /// Number of servers the client is expected to serve: configured ones
    /// plus any attached without a configuration.
    pub fn known_server_count(&self) -> usize {
        self.configs
            .keys()
            .chain(self.sessions.keys())
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Get the number of registered tools.
    pub fn tool_count(&self) -> usize {
        self.registry.len()
    }

    /// Check if a specific server is running.
    pub fn is_server_running(&self, name: &str) -> bool {
        self.sessions
            .get(name)
            .map(|s| s.state().is_usable())
            .unwrap_or(false)
    }

    /// Get a sorted list of running server names.
    pub fn running_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.state().is_usable())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Get names of all configured servers (including those that failed to start).
    pub fn configured_servers(&self) -> Vec<String> {
        self.configs.keys().cloned().collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
