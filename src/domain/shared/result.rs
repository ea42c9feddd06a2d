//! Engine result type

use super::error::SipError;

/// Standard result type for engine operations
pub type Result<T> = std::result::Result<T, SipError>;
