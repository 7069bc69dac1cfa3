//! Capture feed and playback queue.
//!
//! Capture side: the producer only enqueues. `push_capture` uses `try_send`
//! and drops the frame when the channel is full, so a stalled consumer can
//! never block the device callback. Playback side: FIFO within an
//! uninterrupted segment; `clear` empties buffered-but-unplayed frames on
//! barge-in.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

/// Buffered audio awaiting the output device. Cloning shares the queue, so
/// the stream session and the output writer see the same frames.
#[derive(Clone, Default)]
pub struct PlaybackQueue {
    chunks: Arc<Mutex<VecDeque<Vec<u8>>>>,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue one model audio chunk, in arrival order.
    pub fn push(&self, chunk: Vec<u8>) {
        self.chunks.lock().unwrap().push_back(chunk);
    }

    /// Next chunk for the output device, FIFO.
    pub fn pop(&self) -> Option<Vec<u8>> {
        self.chunks.lock().unwrap().pop_front()
    }

    /// Barge-in: discard everything buffered but not yet played.
    pub fn clear(&self) {
        let mut chunks = self.chunks.lock().unwrap();
        let discarded = chunks.len();
        chunks.clear();
        if discarded > 0 {
            tracing::debug!(discarded, "Playback queue flushed");
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.lock().unwrap().is_empty()
    }
}

/// One conversation's audio plumbing: a capture feed into the stream session
/// and a shared playback queue out of it.
pub struct AudioBridge {
    playback: PlaybackQueue,
    capture_tx: mpsc::Sender<Vec<u8>>,
    dropped_frames: Arc<AtomicU64>,
}

impl AudioBridge {
    /// Create a bridge whose capture channel buffers at most `capacity`
    /// frames. Returns the receiver the stream session drains.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (capture_tx, capture_rx) = mpsc::channel(capacity);
        (
            Self {
                playback: PlaybackQueue::new(),
                capture_tx,
                dropped_frames: Arc::new(AtomicU64::new(0)),
            },
            capture_rx,
        )
    }

    /// Shared handle to the playback queue.
    pub fn playback(&self) -> PlaybackQueue {
        self.playback.clone()
    }

    /// Forward one captured frame. Never blocks: a full channel drops the
    /// frame and counts it.
    pub fn push_capture(&self, frame: Vec<u8>) {
        if self.capture_tx.try_send(frame).is_err() {
            let dropped = self.dropped_frames.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped % 100 == 1 {
                tracing::warn!(dropped, "Capture frames dropped (consumer behind)");
            }
        }
    }

    /// Frames dropped because the consumer fell behind.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }
}
