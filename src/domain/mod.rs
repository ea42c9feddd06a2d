//! Domain layer - Identifiers, value objects and errors shared by the engine

pub mod shared;

// Re-export commonly used types
pub use shared::{Result, SipError};
