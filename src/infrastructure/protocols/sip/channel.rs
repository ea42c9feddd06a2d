//! Channels and the channel pool
//!
//! A channel is one network association towards a destination. Channels are
//! shared: every transaction bound to the same destination and transport
//! holds a reference on the same pool entry, and the last release closes it.

use super::message::SipMessage;
use crate::domain::shared::error::SipError;
use crate::domain::shared::value_objects::{ChannelKey, ResolveToken};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, info, warn};

/// One transport association
pub trait Channel: Send {
    /// Hand a message to the transport. Must not block.
    fn send(&mut self, message: &SipMessage) -> Result<(), SipError>;

    /// Reliable channels disable retransmission timers
    fn is_reliable(&self) -> bool;

    fn close(&mut self) {}
}

/// Opens channels once a destination address is known
pub trait ChannelFactory: Send {
    fn open(&mut self, key: &ChannelKey, addr: SocketAddr) -> Result<Box<dyn Channel>, SipError>;
}

/// Resolution the driver has to run before a channel can be opened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveRequest {
    pub token: ResolveToken,
    pub host: String,
    pub port: u16,
}

enum ChannelState {
    Resolving(ResolveToken),
    Ready {
        channel: Box<dyn Channel>,
        addr: SocketAddr,
    },
    /// Peer went away; reopened on the next send
    Disconnected { addr: SocketAddr },
}

struct PoolEntry {
    state: ChannelState,
    refs: usize,
}

/// Reference counted channel table keyed by destination and transport
pub struct ChannelPool {
    entries: HashMap<ChannelKey, PoolEntry>,
    factory: Box<dyn ChannelFactory>,
    pending: Vec<ResolveRequest>,
    next_token: u64,
}

impl ChannelPool {
    pub fn new(factory: Box<dyn ChannelFactory>) -> Self {
        Self {
            entries: HashMap::new(),
            factory,
            pending: Vec::new(),
            next_token: 0,
        }
    }

    /// Take a reference on the channel for `key`, opening it (or starting
    /// its resolution) when no entry exists yet
    pub fn acquire(&mut self, key: &ChannelKey) -> Result<(), SipError> {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.refs += 1;
            return Ok(());
        }

        let host = key.host.trim_start_matches('[').trim_end_matches(']');
        let state = match host.parse::<IpAddr>() {
            Ok(ip) => {
                let addr = SocketAddr::new(ip, key.port);
                let channel = self.open(key, addr)?;
                ChannelState::Ready { channel, addr }
            }
            Err(_) => {
                self.next_token += 1;
                let token = ResolveToken(self.next_token);
                debug!("Resolving {} for channel {}", key.host, key);
                self.pending.push(ResolveRequest {
                    token,
                    host: key.host.clone(),
                    port: key.port,
                });
                ChannelState::Resolving(token)
            }
        };
        self.entries.insert(key.clone(), PoolEntry { state, refs: 1 });
        Ok(())
    }

    fn open(&mut self, key: &ChannelKey, addr: SocketAddr) -> Result<Box<dyn Channel>, SipError> {
        let channel = self.factory.open(key, addr).map_err(|e| {
            warn!("Cannot open channel {} to {}: {}", key, addr, e);
            SipError::ChannelUnavailable(format!("{}: {}", key, e))
        })?;
        info!("Opened channel {} to {}", key, addr);
        Ok(channel)
    }

    /// Drop one reference; the last one closes the channel. Releasing an
    /// entry that is already gone is a no-op.
    pub fn release(&mut self, key: &ChannelKey) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 {
            self.close_entry(key);
        }
    }

    fn close_entry(&mut self, key: &ChannelKey) {
        if let Some(mut entry) = self.entries.remove(key) {
            if let ChannelState::Ready { channel, .. } = &mut entry.state {
                channel.close();
            }
            debug!("Closed channel {}", key);
        }
    }

    /// Discard an unusable channel regardless of its references
    pub fn fail(&mut self, key: &ChannelKey) {
        if self.entries.contains_key(key) {
            warn!("Discarding failed channel {}", key);
            self.close_entry(key);
        }
    }

    /// The peer closed the association; keep the entry and reopen lazily
    pub fn mark_disconnected(&mut self, key: &ChannelKey) {
        if let Some(entry) = self.entries.get_mut(key) {
            if let ChannelState::Ready { channel, addr } = &mut entry.state {
                channel.close();
                let addr = *addr;
                entry.state = ChannelState::Disconnected { addr };
                info!("Channel {} disconnected", key);
            }
        }
    }

    pub fn contains(&self, key: &ChannelKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_ready(&self, key: &ChannelKey) -> bool {
        self.entries
            .get(key)
            .is_some_and(|e| !matches!(e.state, ChannelState::Resolving(_)))
    }

    pub fn is_reliable(&self, key: &ChannelKey) -> bool {
        match self.entries.get(key).map(|e| &e.state) {
            Some(ChannelState::Ready { channel, .. }) => channel.is_reliable(),
            _ => key.transport.is_reliable(),
        }
    }

    pub fn refs(&self, key: &ChannelKey) -> usize {
        self.entries.get(key).map_or(0, |e| e.refs)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Send on a pooled channel, rebuilding a disconnected one first
    pub fn send(&mut self, key: &ChannelKey, message: &SipMessage) -> Result<(), SipError> {
        let reopen = match self.entries.get(key).map(|e| &e.state) {
            None => {
                return Err(SipError::ChannelUnavailable(format!("No channel {}", key)));
            }
            Some(ChannelState::Resolving(_)) => {
                return Err(SipError::ChannelUnavailable(format!(
                    "Channel {} is still resolving",
                    key
                )));
            }
            Some(ChannelState::Disconnected { addr }) => Some(*addr),
            Some(ChannelState::Ready { .. }) => None,
        };

        if let Some(addr) = reopen {
            let channel = self.open(key, addr)?;
            if let Some(entry) = self.entries.get_mut(key) {
                entry.state = ChannelState::Ready { channel, addr };
            }
        }

        match self.entries.get_mut(key).map(|e| &mut e.state) {
            Some(ChannelState::Ready { channel, .. }) => channel.send(message),
            _ => Err(SipError::ChannelUnavailable(format!("No channel {}", key))),
        }
    }

    /// Complete a resolution. Returns the channel it was for, or `None` when
    /// the token is stale (entry released or replaced meanwhile).
    pub fn on_resolved(
        &mut self,
        token: ResolveToken,
        result: Result<Vec<SocketAddr>, SipError>,
    ) -> Option<(ChannelKey, Result<(), SipError>)> {
        let key = self.entries.iter().find_map(|(key, entry)| match entry.state {
            ChannelState::Resolving(t) if t == token => Some(key.clone()),
            _ => None,
        });
        let Some(key) = key else {
            debug!("Discarding stale resolution {:?}", token);
            return None;
        };

        let outcome = match result {
            Ok(addrs) => match addrs.first() {
                Some(addr) => self.open(&key, *addr).map(|channel| {
                    if let Some(entry) = self.entries.get_mut(&key) {
                        entry.state = ChannelState::Ready {
                            channel,
                            addr: *addr,
                        };
                    }
                }),
                None => Err(SipError::ChannelUnavailable(format!(
                    "No address for {}",
                    key.host
                ))),
            },
            Err(e) => Err(SipError::ChannelUnavailable(format!(
                "Cannot resolve {}: {}",
                key.host, e
            ))),
        };
        if outcome.is_err() {
            self.entries.remove(&key);
        }
        Some((key, outcome))
    }

    pub fn take_resolve_requests(&mut self) -> Vec<ResolveRequest> {
        std::mem::take(&mut self.pending)
    }
}
