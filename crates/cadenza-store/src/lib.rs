pub mod error;
pub mod memory;
pub mod schema;
pub mod surreal;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use memory::MemorySessionStore;
pub use schema::{ChallengeKind, PendingStepUp, Session};
pub use surreal::SurrealSessionStore;
pub use traits::SessionStore;
