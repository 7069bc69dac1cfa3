//! The transport seam between the engine and the model service.
//!
//! Implementations own physical framing (websocket chunks, HTTP/2 event
//! streams, vendor SDKs); the engine only ever sees logical frames. The
//! channel-backed transport here drives tests and local demos.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::frame::{InboundFrame, OutboundFrame};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,
    #[error("Transport fault: {0}")]
    Fault(String),
}

/// Duplex connection to the model.
#[async_trait]
pub trait ModelTransport: Send {
    async fn send(&mut self, frame: OutboundFrame) -> Result<(), TransportError>;

    /// `Ok(None)` is a clean end of stream; `Err` is a transport fault.
    /// Both move the owning session to Closing.
    async fn recv(&mut self) -> Result<Option<InboundFrame>, TransportError>;
}

/// In-process transport over tokio channels.
pub struct ChannelTransport {
    tx: mpsc::Sender<OutboundFrame>,
    rx: mpsc::Receiver<Result<InboundFrame, TransportError>>,
}

/// The far side of a [`ChannelTransport`]: a scriptable stand-in for the
/// model service.
pub struct ModelHarness {
    pub outbound: mpsc::Receiver<OutboundFrame>,
    pub inbound: mpsc::Sender<Result<InboundFrame, TransportError>>,
}

impl ModelHarness {
    /// Deliver a frame as if the model sent it.
    pub async fn push(&self, frame: InboundFrame) {
        let _ = self.inbound.send(Ok(frame)).await;
    }

    /// Inject a transport fault.
    pub async fn fail(&self, message: impl Into<String>) {
        let _ = self
            .inbound
            .send(Err(TransportError::Fault(message.into())))
            .await;
    }

    /// Next frame the engine sent.
    pub async fn sent(&mut self) -> Option<OutboundFrame> {
        self.outbound.recv().await
    }
}

/// A connected transport/harness pair.
pub fn channel_pair(capacity: usize) -> (ChannelTransport, ModelHarness) {
    let (out_tx, out_rx) = mpsc::channel(capacity);
    let (in_tx, in_rx) = mpsc::channel(capacity);
    (
        ChannelTransport {
            tx: out_tx,
            rx: in_rx,
        },
        ModelHarness {
            outbound: out_rx,
            inbound: in_tx,
        },
    )
}

#[async_trait]
impl ModelTransport for ChannelTransport {
    async fn send(&mut self, frame: OutboundFrame) -> Result<(), TransportError> {
        self.tx.send(frame).await.map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Result<Option<InboundFrame>, TransportError> {
        match self.rx.recv().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_moves_frames_both_ways() {
        let (mut transport, mut harness) = channel_pair(8);

        transport
            .send(OutboundFrame::ContentStart)
            .await
            .unwrap();
        assert_eq!(harness.sent().await, Some(OutboundFrame::ContentStart));

        harness.push(InboundFrame::Interruption).await;
        assert_eq!(transport.recv().await.unwrap(), Some(InboundFrame::Interruption));
    }

    #[tokio::test]
    async fn dropped_harness_is_clean_end_of_stream() {
        let (mut transport, harness) = channel_pair(8);
        drop(harness);
        assert!(matches!(transport.recv().await, Ok(None)));
        assert!(matches!(
            transport.send(OutboundFrame::ContentEnd).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn injected_fault_surfaces_on_recv() {
        let (mut transport, harness) = channel_pair(8);
        harness.fail("model gone").await;
        assert!(matches!(transport.recv().await, Err(TransportError::Fault(_))));
    }
}
