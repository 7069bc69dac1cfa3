//! Audio bridge between a physical device and a stream session.
//!
//! The bridge moves bytes and reacts to signals; it never decides when
//! barge-in happens. Queue semantics live in `bridge` and compile
//! everywhere; actual device I/O is behind the `device` feature.

pub mod bridge;

#[cfg(feature = "device")]
pub mod device;

pub use bridge::{AudioBridge, PlaybackQueue};
