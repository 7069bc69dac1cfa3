//! Progressive-trust authentication engine.
//!
//! Sessions start at the lowest trust level their identification supports and
//! only ever move upward, one verified factor at a time. Every trust-affecting
//! operation is audited before it is considered complete.

pub mod directory;
pub mod engine;

pub use directory::{hash_answer, KnowledgeQuestion, MemoryDirectory, SubjectDirectory, SubjectProfile};
pub use engine::{AuthEngine, Authorization, NextStep, StepUpChallenge};
