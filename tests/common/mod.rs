//! Helpers shared by the integration tests: an in-memory channel factory
//! that records every message put on the wire

#![allow(dead_code)]

use sipflow::config::Config;
use sipflow::domain::shared::error::SipError;
use sipflow::domain::shared::value_objects::{ChannelKey, SipMethod, TransportProtocol};
use sipflow::infrastructure::protocols::sip::{
    Channel, ChannelFactory, Provider, SipEvent, SipMessage, SipRequest, SipResponse,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Default)]
pub struct Wire {
    pub sent: Vec<(ChannelKey, SipMessage)>,
    pub closed: Vec<ChannelKey>,
    pub fail_sends: bool,
}

pub type SharedWire = Arc<Mutex<Wire>>;

struct WireChannel {
    key: ChannelKey,
    wire: SharedWire,
    reliable: bool,
}

impl Channel for WireChannel {
    fn send(&mut self, message: &SipMessage) -> Result<(), SipError> {
        let mut wire = self.wire.lock().unwrap();
        if wire.fail_sends {
            return Err(SipError::TransportError("wire cut".to_string()));
        }
        wire.sent.push((self.key.clone(), message.clone()));
        Ok(())
    }

    fn is_reliable(&self) -> bool {
        self.reliable
    }

    fn close(&mut self) {
        self.wire.lock().unwrap().closed.push(self.key.clone());
    }
}

pub struct WireFactory {
    wire: SharedWire,
    reliable: bool,
}

impl ChannelFactory for WireFactory {
    fn open(&mut self, key: &ChannelKey, _addr: SocketAddr) -> Result<Box<dyn Channel>, SipError> {
        Ok(Box::new(WireChannel {
            key: key.clone(),
            wire: self.wire.clone(),
            reliable: self.reliable,
        }))
    }
}

pub struct TestUa {
    pub provider: Provider,
    pub events: UnboundedReceiver<SipEvent>,
    pub wire: SharedWire,
}

impl TestUa {
    pub fn new() -> Self {
        Self::with(Config::default(), false)
    }

    pub fn reliable() -> Self {
        Self::with(Config::default(), true)
    }

    pub fn with(config: Config, reliable: bool) -> Self {
        let wire = SharedWire::default();
        let factory = WireFactory {
            wire: wire.clone(),
            reliable,
        };
        let (provider, events) = Provider::new(config, Box::new(factory));
        Self {
            provider,
            events,
            wire,
        }
    }

    pub fn drain(&mut self) -> Vec<SipEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn drain_names(&mut self) -> Vec<&'static str> {
        self.drain().iter().map(|e| e.name()).collect()
    }

    pub fn sent_count(&self) -> usize {
        self.wire.lock().unwrap().sent.len()
    }

    pub fn sent_requests(&self, method: SipMethod) -> Vec<SipRequest> {
        self.wire
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter_map(|(_, m)| m.as_request())
            .filter(|r| r.method() == Some(method))
            .cloned()
            .collect()
    }

    pub fn last_request(&self, method: SipMethod) -> SipRequest {
        self.sent_requests(method).pop().unwrap()
    }

    pub fn sent_responses(&self) -> Vec<SipResponse> {
        self.wire
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter_map(|(_, m)| m.as_response())
            .cloned()
            .collect()
    }

    /// Advance paused time in small steps, firing timers on the way
    pub async fn run_for(&mut self, total: Duration) {
        let step = Duration::from_millis(100);
        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            tokio::time::advance(step).await;
            self.provider.poll_timers();
            elapsed += step;
        }
    }
}

pub fn peer() -> ChannelKey {
    ChannelKey::new(TransportProtocol::Udp, "192.0.2.4", 5060)
}
