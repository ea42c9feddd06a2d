//! Shared kernel - Common types used across the engine

pub mod error;
pub mod result;
pub mod value_objects;

pub use error::SipError;
pub use result::Result;
pub use value_objects::*;
