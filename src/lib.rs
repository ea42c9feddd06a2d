//! sipflow - SIP transaction, dialog and refresher engine
//!
//! A single-threaded [`Provider`](infrastructure::protocols::sip::Provider)
//! owns every transaction, dialog and refresher. It is driven by an async
//! [`Stack`](infrastructure::protocols::sip::Stack) loop fed by transports,
//! resolvers and timers, and reports to the application through
//! [`SipEvent`](infrastructure::protocols::sip::SipEvent)s.

pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use domain::shared::error::SipError;
pub use domain::shared::result::Result;
