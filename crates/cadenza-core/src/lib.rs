pub mod config;
pub mod error;
pub mod trust;

pub use config::AppConfig;
pub use error::{EngineError, EngineResult};
pub use trust::{AuthFactor, TerminationReason, TrustLevel};
