//! Logical frames exchanged with the speech model.
//!
//! Audio payloads serialize as base64 strings; everything else is plain
//! tagged JSON. Transports may re-encode these however their wire protocol
//! requires.

use serde::{Deserialize, Serialize};

use cadenza_core::config::AudioConfig;
use cadenza_tools::ToolSpec;

/// PCM format advertised at session start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl AudioFormat {
    /// The model's output format (what the playback side receives).
    pub fn output_of(config: &AudioConfig) -> Self {
        Self {
            sample_rate: config.output_sample_rate,
            channels: config.channels,
            bits_per_sample: 16,
        }
    }

    /// The capture format (what the model receives).
    pub fn input_of(config: &AudioConfig) -> Self {
        Self {
            sample_rate: config.input_sample_rate,
            channels: config.channels,
            bits_per_sample: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Engine → model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    SessionStart {
        model_id: String,
        system_prompt: String,
        tools: Vec<ToolSpec>,
        audio_format: AudioFormat,
    },
    TextIn {
        role: Role,
        text: String,
    },
    AudioIn {
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
    ToolResult {
        correlation_id: String,
        payload: serde_json::Value,
    },
    ContentStart,
    ContentEnd,
}

/// Model → engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    AudioOut {
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
    Transcript {
        role: Role,
        text: String,
    },
    ToolInvocation {
        correlation_id: String,
        name: String,
        arguments: serde_json::Value,
    },
    ContentStart,
    ContentEnd,
    CompletionStart,
    CompletionEnd,
    /// The user started speaking over model audio.
    Interruption,
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD.decode(raw).map_err(serde::de::Error::custom)
    }
}
