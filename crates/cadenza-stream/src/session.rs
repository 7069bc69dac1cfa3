//! The stream session: one conversation's event pump.
//!
//! A single task owns the transport and processes inbound frames in strict
//! arrival order. Tool invocations are handed to the dispatcher and overlap
//! the conversation; settlements flow back out as `ToolResult` frames in
//! completion order. Barge-in flushes the playback queue only; in-flight
//! dispatches are already authorized and run to completion.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cadenza_auth::AuthEngine;
use cadenza_core::error::{EngineError, EngineResult};
use cadenza_core::trust::TerminationReason;
use cadenza_tools::{Dispatcher, Settlement, ToolInvocation, ToolRegistry, ToolSpec};
use cadenza_voice::PlaybackQueue;

use crate::frame::{AudioFormat, InboundFrame, OutboundFrame};
use crate::transport::ModelTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Initializing,
    ContentActive,
    Closing,
    Closed,
}

/// Per-conversation stream parameters.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub model_id: String,
    pub system_prompt: String,
    pub audio_format: AudioFormat,
}

/// One live conversation against the model. Owns the transport, the
/// dispatcher binding, and the audio bridge handles; tears all of them down
/// on close.
pub struct StreamSession<T: ModelTransport> {
    transport: T,
    auth: Arc<AuthEngine>,
    session_id: String,
    config: StreamConfig,
    catalog: Vec<ToolSpec>,
    dispatcher: Dispatcher,
    settlements: mpsc::UnboundedReceiver<Settlement>,
    playback: PlaybackQueue,
    audio_in: mpsc::Receiver<Vec<u8>>,
    state: StreamState,
}

impl<T: ModelTransport> StreamSession<T> {
    /// Bind a conversation: the dispatcher gets its own cancellation token,
    /// derived from nothing outside this stream's lifecycle.
    pub fn new(
        transport: T,
        registry: Arc<ToolRegistry>,
        auth: Arc<AuthEngine>,
        session_id: impl Into<String>,
        config: StreamConfig,
        playback: PlaybackQueue,
        audio_in: mpsc::Receiver<Vec<u8>>,
    ) -> Self {
        let session_id = session_id.into();
        let catalog: Vec<ToolSpec> = registry.specs().into_iter().cloned().collect();
        let (dispatcher, settlements) = Dispatcher::bind(
            registry,
            Arc::clone(&auth),
            auth.audit_log(),
            session_id.clone(),
            CancellationToken::new(),
        );
        Self {
            transport,
            auth,
            session_id,
            config,
            catalog,
            dispatcher,
            settlements,
            playback,
            audio_in,
            state: StreamState::Initializing,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Run the pump to completion. Returns `Ok` on a clean end of stream and
    /// `Err(TransportFault)` when the connection failed; either way the
    /// owning session is terminated and every dispatch has settled.
    pub async fn run(self) -> EngineResult<()> {
        let StreamSession {
            mut transport,
            auth,
            session_id,
            config,
            catalog,
            dispatcher,
            mut settlements,
            playback,
            mut audio_in,
            state: _,
        } = self;

        tracing::info!(session_id = %session_id, model = %config.model_id, "Stream starting");

        let start = OutboundFrame::SessionStart {
            model_id: config.model_id,
            system_prompt: config.system_prompt,
            tools: catalog,
            audio_format: config.audio_format,
        };
        if let Err(e) = transport.send(start).await {
            close(
                TerminationReason::TransportFault,
                &mut transport,
                &dispatcher,
                &mut settlements,
                &playback,
                &auth,
                &session_id,
            )
            .await;
            return Err(EngineError::TransportFault(e.to_string()));
        }

        let mut audio_open = true;
        let reason = loop {
            tokio::select! {
                inbound = transport.recv() => match inbound {
                    Ok(Some(frame)) => {
                        handle_inbound(frame, &dispatcher, &playback).await;
                    }
                    Ok(None) => break TerminationReason::Ended,
                    Err(e) => {
                        tracing::warn!(session_id = %session_id, error = %e, "Transport fault");
                        break TerminationReason::TransportFault;
                    }
                },
                Some(settlement) = settlements.recv() => {
                    let frame = OutboundFrame::ToolResult {
                        correlation_id: settlement.correlation_id.clone(),
                        payload: settlement.payload(),
                    };
                    if let Err(e) = transport.send(frame).await {
                        tracing::warn!(session_id = %session_id, error = %e, "Transport fault");
                        break TerminationReason::TransportFault;
                    }
                },
                chunk = audio_in.recv(), if audio_open => match chunk {
                    Some(data) => {
                        if let Err(e) = transport.send(OutboundFrame::AudioIn { data }).await {
                            tracing::warn!(session_id = %session_id, error = %e, "Transport fault");
                            break TerminationReason::TransportFault;
                        }
                    }
                    // Bridge released its sender; keep the pump running.
                    None => audio_open = false,
                },
            }
        };

        close(
            reason,
            &mut transport,
            &dispatcher,
            &mut settlements,
            &playback,
            &auth,
            &session_id,
        )
        .await;

        match reason {
            TerminationReason::TransportFault => Err(EngineError::TransportFault(
                "Model stream failed".into(),
            )),
            _ => Ok(()),
        }
    }
}

async fn handle_inbound(frame: InboundFrame, dispatcher: &Dispatcher, playback: &PlaybackQueue) {
    match frame {
        InboundFrame::AudioOut { data } => playback.push(data),
        InboundFrame::Transcript { role, text } => {
            tracing::debug!(?role, %text, "Transcript");
        }
        InboundFrame::ToolInvocation {
            correlation_id,
            name,
            arguments,
        } => {
            dispatcher
                .dispatch(ToolInvocation::new(correlation_id, name, arguments))
                .await;
        }
        InboundFrame::Interruption => {
            // Flush audio only; already-dispatched work finishes and audits.
            tracing::debug!("Barge-in");
            playback.clear();
        }
        InboundFrame::Usage {
            input_tokens,
            output_tokens,
        } => {
            tracing::info!(input_tokens, output_tokens, "Model usage");
        }
        InboundFrame::ContentStart
        | InboundFrame::ContentEnd
        | InboundFrame::CompletionStart
        | InboundFrame::CompletionEnd => {
            tracing::trace!(?frame, "Lifecycle marker");
        }
    }
}

/// Closing sequence: stop new dispatches, let running handlers settle, flush
/// their results best-effort, release the bridge, terminate the session.
async fn close<T: ModelTransport>(
    reason: TerminationReason,
    transport: &mut T,
    dispatcher: &Dispatcher,
    settlements: &mut mpsc::UnboundedReceiver<Settlement>,
    playback: &PlaybackQueue,
    auth: &AuthEngine,
    session_id: &str,
) {
    tracing::info!(session_id, ?reason, "Stream closing");

    dispatcher.shutdown().await;
    while let Ok(settlement) = settlements.try_recv() {
        let frame = OutboundFrame::ToolResult {
            correlation_id: settlement.correlation_id.clone(),
            payload: settlement.payload(),
        };
        // The transport may already be gone; results were still audited.
        let _ = transport.send(frame).await;
    }
    playback.clear();

    match auth.terminate(session_id, reason).await {
        Ok(()) => {}
        Err(EngineError::NotFound(_)) => {}
        Err(e) => tracing::warn!(session_id, error = %e, "Session termination failed"),
    }

    tracing::info!(session_id, "Stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Role;
    use crate::transport::channel_pair;
    use async_trait::async_trait;
    use cadenza_audit::{AuditDraft, Outcome};
    use cadenza_auth::{hash_answer, KnowledgeQuestion, MemoryDirectory, SubjectProfile};
    use cadenza_core::config::{AudioConfig, SessionConfig, StepUpConfig};
    use cadenza_core::trust::TrustLevel;
    use cadenza_store::{MemorySessionStore, SessionStore};
    use cadenza_tools::{ToolContext, ToolError, ToolHandler};
    use serde_json::json;

    struct QuickTool;

    #[async_trait]
    impl ToolHandler for QuickTool {
        async fn call(
            &self,
            ctx: &ToolContext,
            _arguments: serde_json::Value,
        ) -> Result<serde_json::Value, ToolError> {
            ctx.audit
                .append(AuditDraft::new(
                    ctx.session_id.clone(),
                    "balance_read",
                    Outcome::Success,
                    TrustLevel::Identified,
                ))
                .map_err(|e| ToolError::Failed(e.to_string()))?;
            Ok(json!({"balance": 42}))
        }
    }

    struct SlowTool;

    #[async_trait]
    impl ToolHandler for SlowTool {
        async fn call(
            &self,
            ctx: &ToolContext,
            _arguments: serde_json::Value,
        ) -> Result<serde_json::Value, ToolError> {
            tokio::time::sleep(std::time::Duration::from_millis(80)).await;
            ctx.audit
                .append(AuditDraft::new(
                    ctx.session_id.clone(),
                    "slow_transfer",
                    Outcome::Success,
                    TrustLevel::Identified,
                ))
                .map_err(|e| ToolError::Failed(e.to_string()))?;
            Ok(json!({"transferred": true}))
        }
    }

    struct Fixture {
        auth: Arc<AuthEngine>,
        store: Arc<MemorySessionStore>,
        session_id: String,
        registry: Arc<ToolRegistry>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemorySessionStore::new());
        let directory = MemoryDirectory::new().with_subject(SubjectProfile {
            subject_id: "SUBJ-1".into(),
            identity_hint: "+15550100".into(),
            knowledge: vec![KnowledgeQuestion {
                id: "first_pet".into(),
                prompt: "What was the name of your first pet?".into(),
                answer_hash: hash_answer("Rex"),
            }],
        });
        let auth = Arc::new(AuthEngine::new(
            store.clone() as Arc<dyn SessionStore>,
            Arc::new(directory),
            Arc::new(cadenza_audit::AuditLog::in_memory()),
            SessionConfig::default(),
            StepUpConfig::default(),
        ));
        let session = auth.create_session("+15550100").await.unwrap();

        let mut registry = ToolRegistry::new();
        registry
            .register(
                cadenza_tools::ToolSpec::new("get_balance", "Read the balance", json!({})),
                Arc::new(QuickTool),
            )
            .unwrap();
        registry
            .register(
                cadenza_tools::ToolSpec::new("slow_transfer", "Slow transfer", json!({})),
                Arc::new(SlowTool),
            )
            .unwrap();

        Fixture {
            auth,
            store,
            session_id: session.session_id,
            registry: Arc::new(registry),
        }
    }

    fn stream_config() -> StreamConfig {
        StreamConfig {
            model_id: "speech-duplex-v1".into(),
            system_prompt: "You are a concise assistant.".into(),
            audio_format: AudioFormat::output_of(&AudioConfig::default()),
        }
    }

    #[tokio::test]
    async fn session_start_advertises_catalog_then_clean_close() {
        let fx = fixture().await;
        let (transport, mut harness) = channel_pair(32);
        let playback = PlaybackQueue::new();
        let (_audio_tx, audio_rx) = mpsc::channel(8);

        let session = StreamSession::new(
            transport,
            fx.registry.clone(),
            fx.auth.clone(),
            fx.session_id.clone(),
            stream_config(),
            playback.clone(),
            audio_rx,
        );
        assert_eq!(session.state(), StreamState::Initializing);
        let pump = tokio::spawn(session.run());

        let Some(OutboundFrame::SessionStart { tools, audio_format, .. }) = harness.sent().await
        else {
            panic!("expected SessionStart first");
        };
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert!(names.contains(&"get_balance"));
        assert!(names.contains(&"slow_transfer"));
        assert_eq!(audio_format.sample_rate, 24000);

        // Model hangs up cleanly.
        drop(harness.inbound);
        pump.await.unwrap().unwrap();

        let record = fx.store.fetch(&fx.session_id).await.unwrap().unwrap();
        assert_eq!(record.terminated, Some(TerminationReason::Ended));
    }

    #[tokio::test]
    async fn tool_invocation_settles_as_tool_result_frame() {
        let fx = fixture().await;
        let (transport, mut harness) = channel_pair(32);
        let (_audio_tx, audio_rx) = mpsc::channel(8);

        let pump = tokio::spawn(
            StreamSession::new(
                transport,
                fx.registry.clone(),
                fx.auth.clone(),
                fx.session_id.clone(),
                stream_config(),
                PlaybackQueue::new(),
                audio_rx,
            )
            .run(),
        );
        let _ = harness.sent().await; // SessionStart

        // Markers and transcripts must not disturb the pump.
        harness.push(InboundFrame::CompletionStart).await;
        harness
            .push(InboundFrame::Transcript {
                role: Role::User,
                text: "what's my balance".into(),
            })
            .await;
        harness
            .push(InboundFrame::ToolInvocation {
                correlation_id: "corr-1".into(),
                name: "get_balance".into(),
                arguments: json!({}),
            })
            .await;
        harness
            .push(InboundFrame::Usage {
                input_tokens: 10,
                output_tokens: 4,
            })
            .await;

        let Some(OutboundFrame::ToolResult { correlation_id, payload }) = harness.sent().await
        else {
            panic!("expected ToolResult");
        };
        assert_eq!(correlation_id, "corr-1");
        assert_eq!(payload["balance"], 42);

        drop(harness.inbound);
        pump.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn barge_in_flushes_playback_but_running_dispatch_completes() {
        let fx = fixture().await;
        let (transport, mut harness) = channel_pair(32);
        let playback = PlaybackQueue::new();
        let (_audio_tx, audio_rx) = mpsc::channel(8);

        let pump = tokio::spawn(
            StreamSession::new(
                transport,
                fx.registry.clone(),
                fx.auth.clone(),
                fx.session_id.clone(),
                stream_config(),
                playback.clone(),
                audio_rx,
            )
            .run(),
        );
        let _ = harness.sent().await; // SessionStart

        for i in 0..3u8 {
            harness
                .push(InboundFrame::AudioOut {
                    data: vec![i; 16],
                })
                .await;
        }
        harness
            .push(InboundFrame::ToolInvocation {
                correlation_id: "corr-slow".into(),
                name: "slow_transfer".into(),
                arguments: json!({}),
            })
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(playback.len(), 3);

        harness.push(InboundFrame::Interruption).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(playback.is_empty(), "barge-in must flush queued audio");

        // The pre-interruption dispatch still settles and audits.
        let Some(OutboundFrame::ToolResult { correlation_id, payload }) = harness.sent().await
        else {
            panic!("expected ToolResult");
        };
        assert_eq!(correlation_id, "corr-slow");
        assert_eq!(payload["transferred"], true);
        assert!(fx
            .auth
            .audit_log()
            .records()
            .iter()
            .any(|r| r.action == "slow_transfer"));

        drop(harness.inbound);
        pump.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn captured_audio_is_forwarded_to_the_model() {
        let fx = fixture().await;
        let (transport, mut harness) = channel_pair(32);
        let (audio_tx, audio_rx) = mpsc::channel(8);

        let pump = tokio::spawn(
            StreamSession::new(
                transport,
                fx.registry.clone(),
                fx.auth.clone(),
                fx.session_id.clone(),
                stream_config(),
                PlaybackQueue::new(),
                audio_rx,
            )
            .run(),
        );
        let _ = harness.sent().await; // SessionStart

        audio_tx.send(vec![9, 9, 9]).await.unwrap();
        assert_eq!(
            harness.sent().await,
            Some(OutboundFrame::AudioIn {
                data: vec![9, 9, 9]
            })
        );

        // Releasing the capture side must not end the stream.
        drop(audio_tx);
        harness
            .push(InboundFrame::Transcript {
                role: Role::Assistant,
                text: "still here".into(),
            })
            .await;

        drop(harness.inbound);
        pump.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn transport_fault_terminates_session_with_fault_reason() {
        let fx = fixture().await;
        let (transport, mut harness) = channel_pair(32);
        let (_audio_tx, audio_rx) = mpsc::channel(8);

        let pump = tokio::spawn(
            StreamSession::new(
                transport,
                fx.registry.clone(),
                fx.auth.clone(),
                fx.session_id.clone(),
                stream_config(),
                PlaybackQueue::new(),
                audio_rx,
            )
            .run(),
        );
        let _ = harness.sent().await; // SessionStart

        harness.fail("model connection reset").await;

        let result = pump.await.unwrap();
        assert!(matches!(result, Err(EngineError::TransportFault(_))));

        let record = fx.store.fetch(&fx.session_id).await.unwrap().unwrap();
        assert_eq!(record.terminated, Some(TerminationReason::TransportFault));
    }
}
