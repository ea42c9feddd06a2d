//! Identifiers and small value types shared by the transaction, dialog and
//! refresher layers.
//!
//! Everything the provider stores in its tables is keyed by one of these
//! values, so cross references between layers are plain lookups.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Magic cookie every RFC3261 branch starts with
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// SIP method types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
    Info,
    Update,
    Prack,
    Subscribe,
    Notify,
    Refer,
    Message,
    Publish,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
            SipMethod::Info => "INFO",
            SipMethod::Update => "UPDATE",
            SipMethod::Prack => "PRACK",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Refer => "REFER",
            SipMethod::Message => "MESSAGE",
            SipMethod::Publish => "PUBLISH",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let method = match name.trim().to_ascii_uppercase().as_str() {
            "REGISTER" => SipMethod::Register,
            "INVITE" => SipMethod::Invite,
            "ACK" => SipMethod::Ack,
            "CANCEL" => SipMethod::Cancel,
            "BYE" => SipMethod::Bye,
            "OPTIONS" => SipMethod::Options,
            "INFO" => SipMethod::Info,
            "UPDATE" => SipMethod::Update,
            "PRACK" => SipMethod::Prack,
            "SUBSCRIBE" => SipMethod::Subscribe,
            "NOTIFY" => SipMethod::Notify,
            "REFER" => SipMethod::Refer,
            "MESSAGE" => SipMethod::Message,
            "PUBLISH" => SipMethod::Publish,
            _ => return None,
        };
        Some(method)
    }

    /// Methods whose 2xx may create a dialog
    pub fn creates_dialog(&self) -> bool {
        matches!(self, SipMethod::Invite | SipMethod::Subscribe)
    }

    /// Only INVITE dialogs pass through the Early state
    pub fn allows_early_dialog(&self) -> bool {
        matches!(self, SipMethod::Invite)
    }

    /// Methods whose 2xx carries a Contact that replaces the remote target
    pub fn is_target_refresh(&self) -> bool {
        matches!(
            self,
            SipMethod::Invite | SipMethod::Update | SipMethod::Subscribe | SipMethod::Notify
        )
    }

    /// Methods a refresher knows how to renew
    pub fn is_refreshable(&self) -> bool {
        matches!(
            self,
            SipMethod::Register | SipMethod::Subscribe | SipMethod::Publish
        )
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Transport protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportProtocol {
    Udp,
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl TransportProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "UDP",
            TransportProtocol::Tcp => "TCP",
            TransportProtocol::Tls => "TLS",
            TransportProtocol::Ws => "WS",
            TransportProtocol::Wss => "WSS",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "udp" => Some(TransportProtocol::Udp),
            "tcp" => Some(TransportProtocol::Tcp),
            "tls" => Some(TransportProtocol::Tls),
            "ws" => Some(TransportProtocol::Ws),
            "wss" => Some(TransportProtocol::Wss),
            _ => None,
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            TransportProtocol::Udp => 5060,
            TransportProtocol::Tcp => 5060,
            TransportProtocol::Tls => 5061,
            TransportProtocol::Ws => 80,
            TransportProtocol::Wss => 443,
        }
    }

    /// Whether the transport itself guarantees delivery
    pub fn is_reliable(&self) -> bool {
        !matches!(self, TransportProtocol::Udp)
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Via branch parameter
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchId(String);

impl BranchId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generate a fresh RFC3261 branch
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let random: u64 = rng.gen();
        Self(format!("{}{:x}", BRANCH_MAGIC_COOKIE, random))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a live transaction: branch plus method.
///
/// ACK for a non-2xx final response shares the INVITE branch and is matched
/// against the INVITE transaction, see [`TransactionKey::for_incoming`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: BranchId,
    pub method: SipMethod,
}

impl TransactionKey {
    pub fn new(branch: BranchId, method: SipMethod) -> Self {
        Self { branch, method }
    }

    /// Key an incoming request is matched with
    pub fn for_incoming(branch: BranchId, method: SipMethod) -> Self {
        let method = if method == SipMethod::Ack {
            SipMethod::Invite
        } else {
            method
        };
        Self { branch, method }
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.branch, self.method)
    }
}

/// Transaction role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionRole {
    Client,
    Server,
}

/// Dialog identity: Call-ID plus both tags, seen from the local side
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl DialogId {
    pub fn new(
        call_id: impl Into<String>,
        local_tag: impl Into<String>,
        remote_tag: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            local_tag: local_tag.into(),
            remote_tag: remote_tag.into(),
        }
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};local={};remote={}", self.call_id, self.local_tag, self.remote_tag)
    }
}

/// Refresher handle. Never reused within one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RefresherId(pub u64);

impl fmt::Display for RefresherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "refresher-{}", self.0)
    }
}

/// Token attached to an asynchronous name resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResolveToken(pub u64);

/// Pool key of a channel: one association per destination and transport
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub transport: TransportProtocol,
    pub host: String,
    pub port: u16,
}

impl ChannelKey {
    pub fn new(transport: TransportProtocol, host: impl Into<String>, port: u16) -> Self {
        Self {
            transport,
            host: host.into().to_ascii_lowercase(),
            port,
        }
    }

    pub fn from_addr(transport: TransportProtocol, addr: std::net::SocketAddr) -> Self {
        Self::new(transport, addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.transport.as_str().to_ascii_lowercase(), self.host, self.port)
    }
}

/// Random From/To tag
pub fn generate_tag() -> String {
    let mut rng = rand::thread_rng();
    let random: u32 = rng.gen();
    format!("{:08x}", random)
}
