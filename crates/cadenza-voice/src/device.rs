//! cpal device I/O for the audio bridge.
//!
//! Input callback: f32 device samples downmixed to mono, converted to 16-bit
//! PCM, forwarded in fixed-size frames through the bridge's capture feed.
//! Output: a feeder thread moves playback-queue chunks into a small ring
//! buffer the output callback drains; the ring is kept short so a barge-in
//! flush is audible within a few chunks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::{traits::*, HeapRb};

use cadenza_core::config::AudioConfig;

use crate::bridge::{AudioBridge, PlaybackQueue};

/// Live device streams. Capture and playback stop when this is dropped.
pub struct DeviceIo {
    _input: cpal::Stream,
    _output: cpal::Stream,
}

impl DeviceIo {
    pub fn start(config: &AudioConfig, bridge: Arc<AudioBridge>) -> Result<Self> {
        let input = start_input(config, Arc::clone(&bridge))?;
        let output = start_output(config, bridge.playback())?;
        Ok(Self {
            _input: input,
            _output: output,
        })
    }
}

fn start_input(config: &AudioConfig, bridge: Arc<AudioBridge>) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .context("No audio input device available")?;

    if let Ok(desc) = device.description() {
        tracing::info!("Audio input device: {:?}", desc);
    }

    let supported = find_input_config(&device, config.input_sample_rate)?;
    let channels = supported.channels() as usize;
    tracing::info!(
        "Capture config: {}Hz, {} channels, {:?}",
        supported.sample_rate(),
        channels,
        supported.sample_format()
    );

    let chunk_size = config.chunk_size;
    let mut pending: Vec<i16> = Vec::with_capacity(chunk_size);

    let stream = device
        .build_input_stream(
            &supported.into(),
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                for frame in data.chunks(channels.max(1)) {
                    let sample = (frame[0].clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                    pending.push(sample);
                    if pending.len() == chunk_size {
                        let mut bytes = Vec::with_capacity(chunk_size * 2);
                        for s in &pending {
                            bytes.extend_from_slice(&s.to_le_bytes());
                        }
                        bridge.push_capture(bytes);
                        pending.clear();
                    }
                }
            },
            |err| {
                tracing::error!("Audio capture error: {err}");
            },
            None,
        )
        .context("Failed to build input stream")?;

    stream.play().context("Failed to start audio capture")?;
    Ok(stream)
}

fn start_output(config: &AudioConfig, playback: PlaybackQueue) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .context("No audio output device available")?;

    let supported = find_output_config(&device, config.output_sample_rate)?;
    let channels = supported.channels() as usize;
    tracing::info!(
        "Playback config: {}Hz, {} channels, {:?}",
        supported.sample_rate(),
        channels,
        supported.sample_format()
    );

    // Short ring: no more than four chunks sit past the flushable queue.
    let rb = HeapRb::<f32>::new(config.chunk_size * 4);
    let (mut prod, mut cons) = rb.split();

    std::thread::spawn(move || loop {
        match playback.pop() {
            Some(chunk) => {
                for pair in chunk.chunks_exact(2) {
                    let sample = i16::from_le_bytes([pair[0], pair[1]]) as f32 / i16::MAX as f32;
                    while prod.try_push(sample).is_err() {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                }
            }
            None => std::thread::sleep(Duration::from_millis(10)),
        }
    });

    let stream = device
        .build_output_stream(
            &supported.into(),
            move |out: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for frame in out.chunks_mut(channels.max(1)) {
                    let sample = cons.try_pop().unwrap_or(0.0);
                    for slot in frame {
                        *slot = sample;
                    }
                }
            },
            |err| {
                tracing::error!("Audio playback error: {err}");
            },
            None,
        )
        .context("Failed to build output stream")?;

    stream.play().context("Failed to start audio playback")?;
    Ok(stream)
}

fn find_input_config(
    device: &cpal::Device,
    target_rate: u32,
) -> Result<cpal::SupportedStreamConfig> {
    let configs = device
        .supported_input_configs()
        .context("Failed to query input configs")?;

    let mut best: Option<cpal::SupportedStreamConfigRange> = None;
    for cfg in configs {
        if cfg.sample_format() == cpal::SampleFormat::F32
            && cfg.min_sample_rate() <= target_rate
            && cfg.max_sample_rate() >= target_rate
        {
            if cfg.channels() == 1 {
                return Ok(cfg.with_sample_rate(target_rate));
            }
            best = Some(cfg);
        }
    }

    if let Some(cfg) = best {
        return Ok(cfg.with_sample_rate(target_rate));
    }

    device
        .default_input_config()
        .context("No supported input config")
}

fn find_output_config(
    device: &cpal::Device,
    target_rate: u32,
) -> Result<cpal::SupportedStreamConfig> {
    let configs = device
        .supported_output_configs()
        .context("Failed to query output configs")?;

    let mut best: Option<cpal::SupportedStreamConfigRange> = None;
    for cfg in configs {
        if cfg.sample_format() == cpal::SampleFormat::F32
            && cfg.min_sample_rate() <= target_rate
            && cfg.max_sample_rate() >= target_rate
        {
            if cfg.channels() == 1 {
                return Ok(cfg.with_sample_rate(target_rate));
            }
            best = Some(cfg);
        }
    }

    if let Some(cfg) = best {
        return Ok(cfg.with_sample_rate(target_rate));
    }

    device
        .default_output_config()
        .context("No supported output config")
}
