//! Infrastructure layer - Technical implementations
//!
//! This layer contains the SIP engine: transactions, dialogs, refreshers
//! and the transports and resolvers feeding them.

pub mod protocols;
