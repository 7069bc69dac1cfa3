//! Duplex streaming against a remote speech model.
//!
//! The engine contracts on logical frames only; how they are framed on the
//! wire is the transport implementation's concern. One `StreamSession` owns
//! one conversation: its session record, its dispatcher, and its audio
//! bridge handles.

pub mod frame;
pub mod session;
pub mod transport;

pub use frame::{AudioFormat, InboundFrame, OutboundFrame, Role};
pub use session::{StreamConfig, StreamSession, StreamState};
pub use transport::{channel_pair, ChannelTransport, ModelHarness, ModelTransport, TransportError};
