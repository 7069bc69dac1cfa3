//! Tool registry and dispatch.
//!
//! The registry is closed at startup: every tool a model may invoke is
//! registered before the first conversation, names normalized once. The
//! dispatcher executes invocations concurrently with the live conversation
//! and guarantees exactly one settlement per dispatch, whatever happens
//! inside the handler.

pub mod dispatcher;
pub mod registry;

pub use dispatcher::{Dispatcher, Disposition, Settlement, ToolInvocation};
pub use registry::{
    normalize_name, RegistryError, ToolContext, ToolError, ToolHandler, ToolRegistry, ToolSpec,
};
