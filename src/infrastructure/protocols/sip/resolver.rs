//! Name resolution for channel destinations

use crate::domain::shared::error::SipError;
use async_trait::async_trait;
use std::net::SocketAddr;
use tracing::debug;

/// Asynchronous host lookup. Results are posted back to the stack loop.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, SipError>;
}

/// A/AAAA lookup through the system resolver
#[derive(Debug, Default, Clone)]
pub struct TokioResolver;

#[async_trait]
impl Resolver for TokioResolver {
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, SipError> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| SipError::TransportError(format!("Lookup of {} failed: {}", host, e)))?
            .collect();
        debug!("Resolved {}:{} to {:?}", host, port, addrs);
        if addrs.is_empty() {
            return Err(SipError::TransportError(format!("No address for {}", host)));
        }
        Ok(addrs)
    }
}
