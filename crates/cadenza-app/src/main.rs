//! Cadenza demo binary.
//!
//! `demo` wires the full engine together and scripts a conversation against
//! the channel transport: a balance read at Identified, a transfer denied
//! pending a step-up code, verification, and the retried transfer.
//! `verify-audit` replays the persisted audit chain.

mod tools;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cadenza_audit::AuditLog;
use cadenza_auth::{hash_answer, AuthEngine, KnowledgeQuestion, MemoryDirectory, SubjectProfile};
use cadenza_core::config::AppConfig;
use cadenza_store::{MemorySessionStore, SessionStore, SurrealSessionStore};
use cadenza_stream::{
    channel_pair, AudioFormat, InboundFrame, ModelHarness, OutboundFrame, StreamConfig,
    StreamSession,
};
use cadenza_voice::AudioBridge;

#[derive(Parser)]
#[command(name = "cadenza", about = "Cadenza: progressive-trust voice agent engine")]
struct Cli {
    /// Path to config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Verbose logging (overrides RUST_LOG)
    #[arg(long)]
    debug: bool,

    /// Capture and play real audio (requires the `device` feature)
    #[arg(long)]
    live_audio: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scripted end-to-end demo conversation
    Demo,

    /// Verify the integrity chain of the persisted audit log
    VerifyAudit,
}

fn init_tracing(debug: bool) {
    let fallback = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .init();
}

async fn make_store(config: &AppConfig) -> Result<Arc<dyn SessionStore>> {
    match config.store.mode.as_str() {
        "memory" => Ok(Arc::new(MemorySessionStore::new())),
        "surreal" => Ok(Arc::new(
            SurrealSessionStore::new()
                .await
                .context("Failed to open SurrealDB session store")?,
        )),
        other => bail!("Unknown store mode '{other}' (expected 'memory' or 'surreal')"),
    }
}

fn demo_directory() -> MemoryDirectory {
    MemoryDirectory::new().with_subject(SubjectProfile {
        subject_id: "SUBJ-AVERY".into(),
        identity_hint: "+15550100".into(),
        knowledge: vec![KnowledgeQuestion {
            id: "first_pet".into(),
            prompt: "What was the name of your first pet?".into(),
            answer_hash: hash_answer("Rex"),
        }],
    })
}

/// Skip non-result frames until the next `ToolResult`.
async fn next_tool_result(harness: &mut ModelHarness) -> Result<(String, serde_json::Value)> {
    loop {
        match harness.sent().await {
            Some(OutboundFrame::ToolResult {
                correlation_id,
                payload,
            }) => return Ok((correlation_id, payload)),
            Some(_) => continue,
            None => bail!("Stream ended before a tool result arrived"),
        }
    }
}

#[cfg(feature = "device")]
fn start_device_io(
    config: &AppConfig,
    bridge: &Arc<AudioBridge>,
) -> Result<cadenza_voice::device::DeviceIo> {
    cadenza_voice::device::DeviceIo::start(&config.audio, Arc::clone(bridge))
}

async fn run_demo(config: AppConfig, live_audio: bool) -> Result<()> {
    let store = make_store(&config).await?;
    let audit = Arc::new(
        AuditLog::open(Path::new(&config.audit.log_dir)).context("Failed to open audit log")?,
    );
    let auth = Arc::new(AuthEngine::new(
        Arc::clone(&store),
        Arc::new(demo_directory()),
        Arc::clone(&audit),
        config.session.clone(),
        config.step_up.clone(),
    ));
    let registry = Arc::new(tools::demo_registry()?);

    // Inbound call: the caller id resolves, so the session starts Identified.
    let session = auth.create_session("+15550100").await?;
    let session_id = session.session_id.clone();
    tracing::info!(session_id = %session_id, level = %session.trust_level, "Caller connected");

    let (transport, mut harness) = channel_pair(64);
    let (bridge, capture_rx) = AudioBridge::new(32);
    let bridge = Arc::new(bridge);
    let playback = bridge.playback();

    #[cfg(feature = "device")]
    let _device_io = if live_audio {
        Some(start_device_io(&config, &bridge)?)
    } else {
        None
    };
    #[cfg(not(feature = "device"))]
    {
        if live_audio {
            bail!("Built without the 'device' feature; --live-audio is unavailable");
        }
    }

    let stream_config = StreamConfig {
        model_id: config.model.model_id.clone(),
        system_prompt: "You are a concise banking assistant.".into(),
        audio_format: AudioFormat::output_of(&config.audio),
    };
    let pump = tokio::spawn(
        StreamSession::new(
            transport,
            registry,
            Arc::clone(&auth),
            session_id.clone(),
            stream_config,
            playback,
            capture_rx,
        )
        .run(),
    );

    let Some(OutboundFrame::SessionStart { tools, .. }) = harness.sent().await else {
        bail!("Expected SessionStart as the first frame");
    };
    tracing::info!("Session started with {} tools in the catalog", tools.len());

    // 1. Balance read passes at Identified.
    harness
        .push(InboundFrame::ToolInvocation {
            correlation_id: "demo-1".into(),
            name: "get_balance".into(),
            arguments: serde_json::json!({}),
        })
        .await;
    let (_, payload) = next_tool_result(&mut harness).await?;
    tracing::info!(balance = %payload["balance"], "Balance read succeeded");

    // 2. Transfer is denied pending a step-up code.
    harness
        .push(InboundFrame::ToolInvocation {
            correlation_id: "demo-2".into(),
            name: "transfer_funds".into(),
            arguments: serde_json::json!({"amount": 250.0, "to_account": "savings"}),
        })
        .await;
    let (_, payload) = next_tool_result(&mut harness).await?;
    if payload["status"] != "insufficient_level" {
        bail!("Expected a step-up denial, got {payload}");
    }
    tracing::info!(next_step = %payload["next_step"], "Transfer held for verification");

    // The code was delivered out of band; the demo reads it where the
    // delivery channel would.
    let code = store
        .fetch(&session_id)
        .await?
        .and_then(|s| s.pending_step_up)
        .map(|p| p.expected_proof)
        .context("No pending step-up code")?;
    let verified = auth.verify_step_up(&session_id, &code).await?;
    tracing::info!(level = %verified.trust_level, "Step-up verified");

    // 3. The retried transfer goes through.
    harness
        .push(InboundFrame::ToolInvocation {
            correlation_id: "demo-3".into(),
            name: "transfer_funds".into(),
            arguments: serde_json::json!({"amount": 250.0, "to_account": "savings"}),
        })
        .await;
    let (_, payload) = next_tool_result(&mut harness).await?;
    tracing::info!(confirmation = %payload["confirmation"], "Transfer completed");

    // Hang up; the pump terminates the session and settles everything.
    drop(harness.inbound);
    pump.await??;

    audit
        .verify()
        .context("Audit chain verification failed")?;
    tracing::info!(
        records = audit.len(),
        "Demo complete; audit chain verified"
    );
    Ok(())
}

fn verify_audit(config: AppConfig) -> Result<()> {
    let audit = AuditLog::open(Path::new(&config.audit.log_dir))
        .context("Failed to open audit log")?;
    audit.verify().context("Audit chain verification failed")?;
    println!("{} records, chain intact", audit.len());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config_path = cli
        .config
        .unwrap_or_else(|| PathBuf::from("cadenza.toml"));
    let config = AppConfig::load(&config_path)?;

    match cli.command {
        Commands::Demo => run_demo(config, cli.live_audio).await,
        Commands::VerifyAudit => verify_audit(config),
    }
}
