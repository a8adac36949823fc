//! Tool registry: aggregates tool definitions across all MCP servers.
//!
//! Provides:
//! - One flat namespace of presented tool names, with deterministic
//!   disambiguation when several servers advertise the same raw name
//! - Lookup from a presented name back to the owning session
//! - Validation that a tool call matches the registered schema
//! - The manifest handed to the model each turn
//!
//! A registry is an immutable snapshot. When the set of live sessions changes
//! the client builds a new one and swaps it in.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::errors::McpError;
use super::session::ServerSession;
use super::types::{McpToolDefinition, ToolCallResult, ToolErrorKind};
use crate::inference::types::{ToolCall, ToolDefinition};

/// Joins a server name and a raw tool name when the raw name is ambiguous.
pub const QUALIFIED_SEPARATOR: &str = "__";

// ─── Entries ─────────────────────────────────────────────────────────────────

/// A tool as presented to the model.
#[derive(Debug, Clone)]
pub struct ToolEntry {
    /// Name the model sees and uses. Unique within a registry.
    pub presented_name: String,
    /// Name the owning server knows the tool by.
    pub raw_name: String,
    /// Owning server.
    pub server: String,
    pub definition: McpToolDefinition,
    /// Non-owning: the client owns sessions, the registry only points at them.
    session: Weak<ServerSession>,
}

impl ToolEntry {
    /// The owning session, if it is still alive.
    pub fn session(&self) -> Option<Arc<ServerSession>> {
        self.session.upgrade()
    }
}

/// A tool whose presented name differs from its raw name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRename {
    pub server: String,
    pub original: String,
    pub presented: String,
}

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Aggregated tool registry across all live MCP servers.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    /// `presented_name → entry`, ordered so the manifest is stable.
    tools: BTreeMap<String, ToolEntry>,
    renames: Vec<ToolRename>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge the manifests of every usable (Ready or Degraded) session.
    pub fn build(sessions: &[Arc<ServerSession>]) -> Self {
        let manifests: Vec<(String, Weak<ServerSession>, Vec<McpToolDefinition>)> = sessions
            .iter()
            .filter(|s| s.state().is_usable())
            .map(|s| {
                (
                    s.name().to_string(),
                    Arc::downgrade(s),
                    s.list_tools().to_vec(),
                )
            })
            .collect();
        Self::from_manifests(manifests)
    }

    /// Build from `(server, session, tools)` triples.
    pub(crate) fn from_manifests(
        mut manifests: Vec<(String, Weak<ServerSession>, Vec<McpToolDefinition>)>,
    ) -> Self {
        manifests.sort_by(|a, b| a.0.cmp(&b.0));

        let pairs: Vec<(&str, &str)> = manifests
            .iter()
            .flat_map(|(server, _, tools)| {
                tools
                    .iter()
                    .map(move |t| (server.as_str(), t.name.as_str()))
            })
            .collect();
        let presented = assign_presented_names(&pairs);

        let mut tools = BTreeMap::new();
        let mut renames = Vec::new();
        let mut names = presented.into_iter();

        for (server, session, defs) in &manifests {
            for def in defs {
                // One presented name per (server, tool) pair, in the same order.
                let Some(presented_name) = names.next() else {
                    break;
                };
                if presented_name != def.name {
                    renames.push(ToolRename {
                        server: server.clone(),
                        original: def.name.clone(),
                        presented: presented_name.clone(),
                    });
                }
                tools.insert(
                    presented_name.clone(),
                    ToolEntry {
                        presented_name,
                        raw_name: def.name.clone(),
                        server: server.clone(),
                        definition: def.clone(),
                        session: session.clone(),
                    },
                );
            }
        }

        for rename in &renames {
            tracing::info!(
                server = %rename.server,
                original = %rename.original,
                presented = %rename.presented,
                "tool name collision resolved"
            );
        }

        Self { tools, renames }
    }

    /// Look up a tool by its presented name.
    pub fn get_tool(&self, name: &str) -> Option<&ToolEntry> {
        self.tools.get(name)
    }

    /// Find the live session owning a presented tool name.
    pub fn resolve(&self, name: &str) -> Result<Arc<ServerSession>, McpError> {
        let entry = self.tools.get(name).ok_or(McpError::UnknownTool {
            name: name.to_string(),
        })?;
        entry.session().ok_or(McpError::SessionClosed {
            name: entry.server.clone(),
            reason: "session has been dropped".into(),
        })
    }

    /// Renames applied while building this registry.
    pub fn renames(&self) -> &[ToolRename] {
        &self.renames
    }

    /// Return all registered tool names, sorted.
    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.keys().map(|k| k.as_str()).collect()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Count tools belonging to a specific server.
    pub fn tools_for_server(&self, server_name: &str) -> usize {
        self.tools
            .values()
            .filter(|e| e.server == server_name)
            .count()
    }

    /// Return all unique server names, sorted.
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .values()
            .map(|e| e.server.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        names.sort();
        names
    }

    /// Validate a tool call: tool exists and arguments match schema.
    ///
    /// A structural check only: arguments form an object and every
    /// required top-level field is present. Full JSON Schema validation is
    /// deferred to the server itself.
    pub fn validate_tool_call(
        &self,
        tool_name: &str,
        arguments: &serde_json::Value,
    ) -> Result<(), McpError> {
        let entry = self.get_tool(tool_name).ok_or(McpError::UnknownTool {
            name: tool_name.to_string(),
        })?;

        let Some(args_obj) = arguments.as_object() else {
            return Err(McpError::InvalidArguments {
                tool: tool_name.to_string(),
                reason: format!("arguments must be a JSON object, got {arguments}"),
            });
        };

        if let Some(required) = entry
            .definition
            .input_schema
            .get("required")
            .and_then(|r| r.as_array())
        {
            for field_name in required.iter().filter_map(|f| f.as_str()) {
                if !args_obj.contains_key(field_name) {
                    return Err(McpError::InvalidArguments {
                        tool: tool_name.to_string(),
                        reason: format!("missing required field: '{field_name}'"),
                    });
                }
            }
        }

        Ok(())
    }

    /// Route one tool request to its owning session.
    ///
    /// Never fails: unknown tools, invalid arguments and dropped sessions
    /// come back as failed results so the model can react to them. The
    /// result is labelled with the presented name.
    pub async fn dispatch(
        &self,
        call: &ToolCall,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ToolCallResult {
        let Some(entry) = self.tools.get(&call.name) else {
            tracing::warn!(tool = %call.name, call_id = %call.id, "model requested unknown tool");
            return ToolCallResult::failure(
                &call.id,
                &call.name,
                ToolErrorKind::UnknownTool,
                format!(
                    "no tool named '{}' is available; use one of the listed tools",
                    call.name
                ),
                0,
            );
        };

        if let Err(e) = self.validate_tool_call(&call.name, &call.arguments) {
            return ToolCallResult::failure(&call.id, &call.name, e.tool_error_kind(), e.to_string(), 0);
        }

        let Some(session) = entry.session() else {
            return ToolCallResult::failure(
                &call.id,
                &call.name,
                ToolErrorKind::SessionUnavailable,
                format!("server '{}' is no longer connected", entry.server),
                0,
            );
        };

        tracing::debug!(
            tool = %call.name,
            server = %entry.server,
            raw_name = %entry.raw_name,
            call_id = %call.id,
            "dispatching tool call"
        );

        let mut result = session
            .invoke(&call.id, &entry.raw_name, call.arguments.clone(), timeout, cancel)
            .await;
        result.tool_name = call.name.clone();
        result
    }

    /// The tool list offered to the model, sorted by presented name.
    pub fn manifest(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|entry| ToolDefinition {
                name: entry.presented_name.clone(),
                description: entry.definition.description.clone(),
                input_schema: entry.definition.input_schema.clone(),
            })
            .collect()
    }

    /// Generate a concise capability summary.
    ///
    /// Lists available servers with tool counts, e.g.
    /// `Available capabilities (5 tools across 2 servers): chat (2), web (3).`
    pub fn capability_summary(&self) -> String {
        if self.is_empty() {
            return "No MCP tools currently available.".to_string();
        }

        let server_names = self.server_names();
        let server_parts: Vec<String> = server_names
            .iter()
            .map(|name| format!("{name} ({})", self.tools_for_server(name)))
            .collect();

        let mut summary = format!(
            "Available capabilities ({} tools across {} servers): {}.",
            self.len(),
            server_names.len(),
            server_parts.join(", "),
        );

        if !self.renames.is_empty() {
            let renamed: Vec<String> = self
                .renames
                .iter()
                .map(|r| format!("{} -> {}", r.original, r.presented))
                .collect();
            summary.push_str(&format!("\nRenamed to avoid collisions: {}.", renamed.join(", ")));
        }

        summary
    }
}

// ─── Naming ──────────────────────────────────────────────────────────────────

/// Assign a unique presented name to every `(server, raw_name)` pair.
///
/// Input must already be ordered by server name; the output is parallel to
/// the input. Raw names advertised by exactly one server are kept, names
/// shared between servers become `server__tool`, and anything still taken
/// gets `_2`, `_3`, ... appended.
pub(crate) fn assign_presented_names(pairs: &[(&str, &str)]) -> Vec<String> {
    let mut owners: HashMap<&str, HashSet<&str>> = HashMap::new();
    for &(server, raw) in pairs {
        owners.entry(raw).or_default().insert(server);
    }

    let mut taken: HashSet<String> = HashSet::new();
    let mut presented = Vec::with_capacity(pairs.len());

    for &(server, raw) in pairs {
        let shared = owners.get(raw).map(|s| s.len() > 1).unwrap_or(false);
        let base = if shared {
            format!("{server}{QUALIFIED_SEPARATOR}{raw}")
        } else {
            raw.to_string()
        };

        let mut candidate = base.clone();
        let mut n = 2;
        while taken.contains(&candidate) {
            candidate = format!("{base}_{n}");
            n += 1;
        }
        taken.insert(candidate.clone());
        presented.push(candidate);
    }

    presented
}
