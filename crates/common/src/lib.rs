//! vmrunner Common Library
//!
//! Shared types and the pure pieces of the VM reconciliation flow: status
//! normalization, action gating, presentation derivation.

pub mod error;
pub mod gate;
pub mod status;
pub mod types;

// Re-export commonly used types
pub use error::{Error, Result};
pub use gate::GateDecision;
pub use status::{classify, default_rules, normalize_payload, FieldRule};
pub use types::*;

/// vmrunner version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
