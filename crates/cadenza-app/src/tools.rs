//! Demo banking tools exercising the guarded-handler interface.
//!
//! Each handler authorizes against its own required trust level, does its
//! (stubbed) domain work, and appends exactly one audit record. Insufficient
//! authorization is not an error: the structured denial, including the next
//! step, goes back to the model as the tool's payload so the conversation
//! can walk the caller through a step-up.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use cadenza_audit::{AuditDraft, Outcome};
use cadenza_auth::Authorization;
use cadenza_core::trust::TrustLevel;
use cadenza_tools::{ToolContext, ToolError, ToolHandler, ToolRegistry, ToolSpec};

fn denial_payload(denied: &Authorization) -> Result<serde_json::Value, ToolError> {
    serde_json::to_value(denied).map_err(|e| ToolError::Failed(e.to_string()))
}

fn audit(ctx: &ToolContext, action: &str, level: TrustLevel) -> Result<(), ToolError> {
    ctx.audit
        .append(
            AuditDraft::new(ctx.session_id.clone(), action, Outcome::Success, level).sensitive(),
        )
        .map_err(|e| ToolError::Failed(e.to_string()))?;
    Ok(())
}

/// Read-only balance check. Identified is enough.
pub struct GetBalance;

#[async_trait]
impl ToolHandler for GetBalance {
    async fn call(
        &self,
        ctx: &ToolContext,
        _arguments: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        match ctx.auth.authorize(&ctx.session_id, TrustLevel::Identified).await? {
            Authorization::Authorized { level } => {
                audit(ctx, "balance_read", level)?;
                Ok(json!({
                    "account": "checking",
                    "balance": 2543.17,
                    "currency": "USD",
                }))
            }
            denied => denial_payload(&denied),
        }
    }
}

/// Money movement. Verified (possession factor) required; a denial carries
/// the verify-code guidance from the auth engine.
pub struct TransferFunds;

#[async_trait]
impl ToolHandler for TransferFunds {
    async fn call(
        &self,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        let amount = arguments
            .get("amount")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| ToolError::InvalidArguments("'amount' must be a number".into()))?;
        let to_account = arguments
            .get("to_account")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArguments("'to_account' is required".into()))?
            .to_string();

        match ctx.auth.authorize(&ctx.session_id, TrustLevel::Verified).await? {
            Authorization::Authorized { level } => {
                audit(ctx, "funds_transfer", level)?;
                Ok(json!({
                    "transferred": amount,
                    "to_account": to_account,
                    "confirmation": format!("TXN-{}", &ctx.session_id[8..16.min(ctx.session_id.len())]),
                }))
            }
            denied => denial_payload(&denied),
        }
    }
}

/// Profile mutation. Enhanced (knowledge factor) required.
pub struct UpdateContactInfo;

#[async_trait]
impl ToolHandler for UpdateContactInfo {
    async fn call(
        &self,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        let email = arguments
            .get("email")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArguments("'email' is required".into()))?
            .to_string();

        match ctx.auth.authorize(&ctx.session_id, TrustLevel::Enhanced).await? {
            Authorization::Authorized { level } => {
                audit(ctx, "contact_info_update", level)?;
                Ok(json!({"updated": true, "email": email}))
            }
            denied => denial_payload(&denied),
        }
    }
}

/// The demo catalog. Registration failures here are programming errors, so
/// the binary bails at startup.
pub fn demo_registry() -> anyhow::Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(
        ToolSpec::new(
            "get_balance",
            "Read the caller's account balance.",
            json!({"type": "object", "properties": {}}),
        ),
        Arc::new(GetBalance),
    )?;
    registry.register(
        ToolSpec::new(
            "transfer_funds",
            "Transfer money to another account. Requires code verification.",
            json!({
                "type": "object",
                "properties": {
                    "amount": {"type": "number"},
                    "to_account": {"type": "string"}
                },
                "required": ["amount", "to_account"]
            }),
        ),
        Arc::new(TransferFunds),
    )?;
    registry.register(
        ToolSpec::new(
            "update_contact_info",
            "Update the caller's contact details. Requires a security question.",
            json!({
                "type": "object",
                "properties": {"email": {"type": "string"}},
                "required": ["email"]
            }),
        ),
        Arc::new(UpdateContactInfo),
    )?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_audit::AuditLog;
    use cadenza_auth::{hash_answer, AuthEngine, KnowledgeQuestion, MemoryDirectory, SubjectProfile};
    use cadenza_core::config::{SessionConfig, StepUpConfig};
    use cadenza_store::MemorySessionStore;
    use tokio_util::sync::CancellationToken;

    async fn context() -> ToolContext {
        let directory = MemoryDirectory::new().with_subject(SubjectProfile {
            subject_id: "SUBJ-1".into(),
            identity_hint: "+15550100".into(),
            knowledge: vec![KnowledgeQuestion {
                id: "first_pet".into(),
                prompt: "What was the name of your first pet?".into(),
                answer_hash: hash_answer("Rex"),
            }],
        });
        let audit = Arc::new(AuditLog::in_memory());
        let auth = Arc::new(AuthEngine::new(
            Arc::new(MemorySessionStore::new()),
            Arc::new(directory),
            Arc::clone(&audit),
            SessionConfig::default(),
            StepUpConfig::default(),
        ));
        let session = auth.create_session("+15550100").await.unwrap();
        ToolContext::new(session.session_id, auth, audit, CancellationToken::new())
    }

    #[tokio::test]
    async fn balance_read_passes_at_identified() {
        let ctx = context().await;
        let payload = GetBalance.call(&ctx, json!({})).await.unwrap();
        assert_eq!(payload["currency"], "USD");
        assert!(ctx.audit.records().iter().any(|r| r.action == "balance_read"));
    }

    #[tokio::test]
    async fn transfer_denied_returns_step_up_guidance() {
        let ctx = context().await;
        let payload = TransferFunds
            .call(&ctx, json!({"amount": 100.0, "to_account": "savings"}))
            .await
            .unwrap();
        assert_eq!(payload["status"], "insufficient_level");
        assert_eq!(payload["next_step"], "verify_code");
    }

    #[tokio::test]
    async fn transfer_rejects_malformed_arguments() {
        let ctx = context().await;
        let err = TransferFunds
            .call(&ctx, json!({"to_account": "savings"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
