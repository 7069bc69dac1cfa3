//! Per-conversation dispatch of tool invocations.
//!
//! Every dispatch is a tracked tokio task keyed by the model's correlation
//! id. The invariant: exactly one `Settlement` per dispatched invocation,
//! never zero, never more than one, in whatever order handlers finish.
//! Cancellation is observed only at dispatch boundaries; a handler that has
//! started runs to completion so its audit write always lands.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cadenza_audit::AuditLog;
use cadenza_auth::AuthEngine;

use crate::registry::{ToolContext, ToolRegistry};

/// A tool call as the model issued it.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    /// Model-supplied id; settlements and `ToolResult` frames carry it back.
    pub correlation_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub started_at: DateTime<Utc>,
}

impl ToolInvocation {
    pub fn new(
        correlation_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            tool_name: tool_name.into(),
            arguments,
            started_at: Utc::now(),
        }
    }
}

/// How a dispatch ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Completed(serde_json::Value),
    Failed { code: String, message: String },
    Cancelled,
}

/// The one-and-only outcome of a dispatch.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub correlation_id: String,
    pub disposition: Disposition,
}

impl Settlement {
    /// JSON payload for the `ToolResult` frame sent back to the model.
    /// Failures are structured, never raw error strings.
    pub fn payload(&self) -> serde_json::Value {
        match &self.disposition {
            Disposition::Completed(value) => value.clone(),
            Disposition::Failed { code, message } => {
                json!({"error": {"code": code, "message": message}})
            }
            Disposition::Cancelled => json!({
                "error": {
                    "code": "cancelled",
                    "message": "Dispatch cancelled before the handler started"
                }
            }),
        }
    }

    pub fn is_error(&self) -> bool {
        !matches!(self.disposition, Disposition::Completed(_))
    }
}

/// One dispatcher per conversation, bound to its session and cancellation
/// token at stream start.
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    ctx: ToolContext,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<Settlement>,
    pending: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl Dispatcher {
    /// Bind a dispatcher to a conversation. The returned receiver yields
    /// settlements in completion order. The channel is unbounded: a settling
    /// task must never block on a slow reader, or `shutdown` could wait on a
    /// task that is waiting on the drain. Backlog is capped by the number of
    /// in-flight dispatches.
    pub fn bind(
        registry: Arc<ToolRegistry>,
        auth: Arc<AuthEngine>,
        audit: Arc<AuditLog>,
        session_id: impl Into<String>,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<Settlement>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = ToolContext::new(session_id, auth, audit, cancel.clone());
        (
            Self {
                registry,
                ctx,
                cancel,
                tx,
                pending: Arc::new(Mutex::new(HashMap::new())),
            },
            rx,
        )
    }

    /// Dispatch one invocation and return immediately. Unknown names and
    /// already-cancelled conversations settle without spawning.
    pub async fn dispatch(&self, invocation: ToolInvocation) {
        let correlation_id = invocation.correlation_id.clone();

        if self.cancel.is_cancelled() {
            self.settle(correlation_id, Disposition::Cancelled);
            return;
        }

        let Some(handler) = self.registry.resolve(&invocation.tool_name) else {
            tracing::warn!(tool = %invocation.tool_name, "Unknown tool invoked");
            self.settle(
                correlation_id,
                Disposition::Failed {
                    code: "unknown_tool".into(),
                    message: format!("No tool named '{}'", invocation.tool_name),
                },
            );
            return;
        };

        tracing::debug!(
            correlation_id = %correlation_id,
            tool = %invocation.tool_name,
            "Dispatching tool"
        );

        let ctx = self.ctx.clone();
        let cancel = self.cancel.clone();
        let tx = self.tx.clone();
        let pending = Arc::clone(&self.pending);
        let tool_name = invocation.tool_name.clone();
        let arguments = invocation.arguments;
        let id = correlation_id.clone();

        let task = tokio::spawn(async move {
            // Last cancellation boundary. Past this point the handler runs
            // to completion, including its audit append.
            let disposition = if cancel.is_cancelled() {
                Disposition::Cancelled
            } else {
                let work = tokio::spawn(async move { handler.call(&ctx, arguments).await });
                match work.await {
                    Ok(Ok(payload)) => Disposition::Completed(payload),
                    Ok(Err(e)) => {
                        tracing::warn!(tool = %tool_name, error = %e, "Tool failed");
                        Disposition::Failed {
                            code: e.code().into(),
                            message: e.to_string(),
                        }
                    }
                    // JoinError here means the handler panicked (or was
                    // aborted, which this dispatcher never does).
                    Err(join_err) => {
                        tracing::error!(tool = %tool_name, error = %join_err, "Tool handler fault");
                        Disposition::Failed {
                            code: "handler_fault".into(),
                            message: "Tool handler terminated abnormally".into(),
                        }
                    }
                }
            };

            let _ = tx.send(Settlement {
                correlation_id: id.clone(),
                disposition,
            });
            pending.lock().await.remove(&id);
        });

        self.pending.lock().await.insert(correlation_id, task);
    }

    /// Dispatches not yet settled.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Closing-time drain: cancel the token, then wait until every tracked
    /// dispatch has sent its settlement. Running handlers finish; handlers
    /// that never started settle cancelled.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut pending = self.pending.lock().await;
            pending.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn settle(&self, correlation_id: String, disposition: Disposition) {
        let _ = self.tx.send(Settlement {
            correlation_id,
            disposition,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ToolError, ToolHandler, ToolSpec};
    use async_trait::async_trait;
    use cadenza_audit::{AuditDraft, Outcome};
    use cadenza_auth::{hash_answer, Authorization, KnowledgeQuestion, MemoryDirectory, SubjectProfile};
    use cadenza_core::config::{SessionConfig, StepUpConfig};
    use cadenza_core::trust::TrustLevel;
    use cadenza_store::MemorySessionStore;
    use std::collections::HashSet;

    fn auth_engine() -> Arc<AuthEngine> {
        let directory = MemoryDirectory::new().with_subject(SubjectProfile {
            subject_id: "SUBJ-1".into(),
            identity_hint: "+15550100".into(),
            knowledge: vec![KnowledgeQuestion {
                id: "first_pet".into(),
                prompt: "What was the name of your first pet?".into(),
                answer_hash: hash_answer("Rex"),
            }],
        });
        Arc::new(AuthEngine::new(
            Arc::new(MemorySessionStore::new()),
            Arc::new(directory),
            Arc::new(AuditLog::in_memory()),
            SessionConfig::default(),
            StepUpConfig::default(),
        ))
    }

    /// Authorizes against the session (touching it), audits, returns JSON.
    struct BalanceTool;

    #[async_trait]
    impl ToolHandler for BalanceTool {
        async fn call(
            &self,
            ctx: &ToolContext,
            _arguments: serde_json::Value,
        ) -> Result<serde_json::Value, ToolError> {
            let auth = ctx.auth.authorize(&ctx.session_id, TrustLevel::Identified).await?;
            match auth {
                Authorization::Authorized { .. } => {}
                _ => return Err(ToolError::Engine(
                    cadenza_core::error::EngineError::Unauthorized("balance read denied".into()),
                )),
            }
            ctx.audit
                .append(
                    AuditDraft::new(
                        ctx.session_id.clone(),
                        "balance_read",
                        Outcome::Success,
                        TrustLevel::Identified,
                    )
                    .sensitive(),
                )
                .map_err(|e| ToolError::Failed(e.to_string()))?;
            Ok(serde_json::json!({"balance": 1234.56, "currency": "USD"}))
        }
    }

    struct PanicTool;

    #[async_trait]
    impl ToolHandler for PanicTool {
        async fn call(
            &self,
            _ctx: &ToolContext,
            _arguments: serde_json::Value,
        ) -> Result<serde_json::Value, ToolError> {
            panic!("boom");
        }
    }

    struct SlowAuditedTool;

    #[async_trait]
    impl ToolHandler for SlowAuditedTool {
        async fn call(
            &self,
            ctx: &ToolContext,
            _arguments: serde_json::Value,
        ) -> Result<serde_json::Value, ToolError> {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            ctx.audit
                .append(AuditDraft::new(
                    ctx.session_id.clone(),
                    "slow_work",
                    Outcome::Success,
                    TrustLevel::Identified,
                ))
                .map_err(|e| ToolError::Failed(e.to_string()))?;
            Ok(serde_json::json!({"done": true}))
        }
    }

    async fn bound_dispatcher(
        registry: ToolRegistry,
    ) -> (
        Dispatcher,
        mpsc::UnboundedReceiver<Settlement>,
        Arc<AuthEngine>,
        String,
    ) {
        let auth = auth_engine();
        let session = auth.create_session("+15550100").await.unwrap();
        let audit = auth.audit_log();
        let (dispatcher, rx) = Dispatcher::bind(
            Arc::new(registry),
            Arc::clone(&auth),
            audit,
            session.session_id.clone(),
            CancellationToken::new(),
        );
        (dispatcher, rx, auth, session.session_id)
    }

    fn balance_registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                ToolSpec::new("get_balance", "Read the balance", serde_json::json!({})),
                Arc::new(BalanceTool),
            )
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn fifty_concurrent_dispatches_settle_exactly_once_each() {
        let (dispatcher, mut rx, _auth, _session) = bound_dispatcher(balance_registry()).await;

        for i in 0..50 {
            dispatcher
                .dispatch(ToolInvocation::new(
                    format!("corr-{i}"),
                    "get_balance",
                    serde_json::json!({}),
                ))
                .await;
        }

        // All 50 settle despite touch contention on the shared session.
        let mut seen = HashSet::new();
        for _ in 0..50 {
            let settlement = rx.recv().await.expect("settlement");
            assert!(matches!(settlement.disposition, Disposition::Completed(_)));
            assert!(seen.insert(settlement.correlation_id), "duplicate settlement");
        }
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv())
                .await
                .is_err(),
            "more settlements than dispatches"
        );
        assert_eq!(dispatcher.pending_count().await, 0);
    }

    #[tokio::test]
    async fn unknown_tool_fails_fast_with_structured_error() {
        let (dispatcher, mut rx, _auth, _session) = bound_dispatcher(balance_registry()).await;
        dispatcher
            .dispatch(ToolInvocation::new("corr-1", "close_account", serde_json::json!({})))
            .await;

        let settlement = rx.recv().await.unwrap();
        assert_eq!(settlement.correlation_id, "corr-1");
        let payload = settlement.payload();
        assert_eq!(payload["error"]["code"], "unknown_tool");
    }

    #[tokio::test]
    async fn panicking_handler_becomes_handler_fault_settlement() {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                ToolSpec::new("explode", "always panics", serde_json::json!({})),
                Arc::new(PanicTool),
            )
            .unwrap();
        let (dispatcher, mut rx, _auth, _session) = bound_dispatcher(registry).await;

        dispatcher
            .dispatch(ToolInvocation::new("corr-1", "explode", serde_json::json!({})))
            .await;

        let settlement = rx.recv().await.unwrap();
        assert_eq!(settlement.payload()["error"]["code"], "handler_fault");
    }

    #[tokio::test]
    async fn handler_error_carries_machine_readable_code() {
        let (dispatcher, mut rx, auth, session_id) = bound_dispatcher(balance_registry()).await;
        auth.terminate(&session_id, cadenza_core::trust::TerminationReason::Ended)
            .await
            .unwrap();

        dispatcher
            .dispatch(ToolInvocation::new("corr-1", "get_balance", serde_json::json!({})))
            .await;

        // NoSession from authorize surfaces as the handler's unauthorized error.
        let settlement = rx.recv().await.unwrap();
        assert!(settlement.is_error());
        assert_eq!(settlement.payload()["error"]["code"], "unauthorized");
    }

    #[tokio::test]
    async fn dispatch_after_cancellation_settles_cancelled() {
        let (dispatcher, mut rx, _auth, _session) = bound_dispatcher(balance_registry()).await;
        dispatcher.shutdown().await;

        dispatcher
            .dispatch(ToolInvocation::new("corr-1", "get_balance", serde_json::json!({})))
            .await;

        let settlement = rx.recv().await.unwrap();
        assert_eq!(settlement.disposition, Disposition::Cancelled);
    }

    #[tokio::test]
    async fn started_handler_completes_and_audits_through_shutdown() {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                ToolSpec::new("slow_work", "sleeps then audits", serde_json::json!({})),
                Arc::new(SlowAuditedTool),
            )
            .unwrap();
        let (dispatcher, mut rx, auth, _session) = bound_dispatcher(registry).await;

        dispatcher
            .dispatch(ToolInvocation::new("corr-1", "slow_work", serde_json::json!({})))
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        // Shutdown mid-flight: the running handler still finishes.
        dispatcher.shutdown().await;

        let settlement = rx.recv().await.unwrap();
        assert!(matches!(settlement.disposition, Disposition::Completed(_)));
        assert!(auth
            .audit_log()
            .records()
            .iter()
            .any(|r| r.action == "slow_work"));
    }

    #[tokio::test]
    async fn shutdown_returns_with_a_large_unread_settlement_backlog() {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                ToolSpec::new("slow_work", "sleeps then audits", serde_json::json!({})),
                Arc::new(SlowAuditedTool),
            )
            .unwrap();
        let (dispatcher, mut rx, _auth, _session) = bound_dispatcher(registry).await;

        for i in 0..100 {
            dispatcher
                .dispatch(ToolInvocation::new(
                    format!("corr-{i}"),
                    "slow_work",
                    serde_json::json!({}),
                ))
                .await;
        }

        // Nothing reads settlements until shutdown has returned; the backlog
        // must not wedge the settling tasks shutdown is waiting on.
        tokio::time::timeout(std::time::Duration::from_secs(5), dispatcher.shutdown())
            .await
            .expect("shutdown must not hang behind unread settlements");

        let mut settled = 0;
        while rx.try_recv().is_ok() {
            settled += 1;
        }
        assert_eq!(settled, 100);
        assert_eq!(dispatcher.pending_count().await, 0);
    }

    #[tokio::test]
    async fn settlements_arrive_in_completion_order_not_dispatch_order() {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                ToolSpec::new("slow_work", "sleeps then audits", serde_json::json!({})),
                Arc::new(SlowAuditedTool),
            )
            .unwrap();
        registry
            .register(
                ToolSpec::new("get_balance", "Read the balance", serde_json::json!({})),
                Arc::new(BalanceTool),
            )
            .unwrap();
        let (dispatcher, mut rx, _auth, _session) = bound_dispatcher(registry).await;

        dispatcher
            .dispatch(ToolInvocation::new("corr-slow", "slow_work", serde_json::json!({})))
            .await;
        dispatcher
            .dispatch(ToolInvocation::new("corr-fast", "get_balance", serde_json::json!({})))
            .await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.correlation_id, "corr-fast");
        assert_eq!(second.correlation_id, "corr-slow");
    }
}
