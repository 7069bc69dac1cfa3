//! The closed tool registry and the handler-side contract.
//!
//! Handlers are vertical-owned. The engine hands each one a `ToolContext`
//! carrying the session binding, the auth engine, and the audit log; the
//! handler performs its own `authorize`, its domain operation, and exactly
//! one audit append before returning.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use cadenza_audit::AuditLog;
use cadenza_auth::AuthEngine;
use cadenza_core::error::EngineError;

/// Catalog entry sent to the model in the session-start configuration.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema for the tool's arguments.
    pub input_schema: serde_json::Value,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// Failure a handler can report. Converted by the dispatcher into a
/// structured error settlement; never session-fatal.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("Tool failed: {0}")]
    Failed(String),
}

impl ToolError {
    /// Machine-readable code for the error settlement payload.
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::InvalidArguments(_) => "invalid_arguments",
            ToolError::Engine(e) => e.code(),
            ToolError::Failed(_) => "tool_failed",
        }
    }
}

/// Everything a handler needs, bound per conversation. Session context is
/// explicit here; there is no process-wide current session.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub auth: Arc<AuthEngine>,
    pub audit: Arc<AuditLog>,
    cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(
        session_id: impl Into<String>,
        auth: Arc<AuthEngine>,
        audit: Arc<AuditLog>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            auth,
            audit,
            cancel,
        }
    }

    /// Long-running handlers may poll this at their own safe points.
    /// The dispatcher itself only checks before the handler starts.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A business tool. Implementations live in the vertical, not the engine.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(
        &self,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Tool '{0}' is already registered")]
    Duplicate(String),
}

/// Canonical tool-name form: lowercase, whitespace stripped. Applied once at
/// registration and to each model-supplied name before lookup.
pub fn normalize_name(raw: &str) -> String {
    raw.to_lowercase().chars().filter(|c| !c.is_whitespace()).collect()
}

struct RegisteredTool {
    spec: ToolSpec,
    handler: Arc<dyn ToolHandler>,
}

/// Closed tool routing table, fully populated before the first dispatch.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its normalized name. Duplicates are a startup
    /// error, not a silent overwrite.
    pub fn register(
        &mut self,
        spec: ToolSpec,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<(), RegistryError> {
        let key = normalize_name(&spec.name);
        if self.tools.contains_key(&key) {
            return Err(RegistryError::Duplicate(spec.name));
        }
        tracing::debug!(tool = %key, "Registered tool");
        self.tools.insert(key, RegisteredTool { spec, handler });
        Ok(())
    }

    /// Resolve a model-supplied name to its handler.
    pub fn resolve(&self, raw_name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools
            .get(&normalize_name(raw_name))
            .map(|t| Arc::clone(&t.handler))
    }

    /// The catalog advertised to the model at session start.
    pub fn specs(&self) -> Vec<&ToolSpec> {
        self.tools.values().map(|t| &t.spec).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
