//! SIP engine
//!
//! Transaction, dialog and refresher layers of a SIP user agent (RFC 3261),
//! driven by a single [`Provider`] that owns every live object.
//!
//! Architecture:
//! ```text
//! ┌─────────────────────────┐
//! │      Application        │  SipEvent receiver, StackHandle::call
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Refresher Layer       │  REGISTER / SUBSCRIBE / PUBLISH renewal
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │    Dialog Layer         │  CSeq, targets, route set, 2xx ACK
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transaction Layer     │  RFC 3261 state machines and timers
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Channel Pool          │  shared, reference-counted channels (UDP)
//! └─────────────────────────┘
//! ```

pub mod auth;
pub mod builder;
pub mod channel;
pub mod dialog;
pub mod event;
pub mod message;
pub mod metrics;
pub mod provider;
pub mod refresher;
pub mod resolver;
pub mod stack;
pub mod timer;
pub mod transaction;
pub mod transport;

pub use auth::{AuthChallenge, AuthHelper, DigestAuthHelper, UserCredentials};
pub use builder::{build_cancel, build_non2xx_ack, build_response, RequestBuilder, ResponseBuilder};
pub use channel::{Channel, ChannelFactory, ChannelPool, ResolveRequest};
pub use dialog::{Dialog, DialogState};
pub use event::SipEvent;
pub use message::{SipHeaders, SipMessage, SipRequest, SipResponse};
pub use provider::Provider;
pub use refresher::{RefreshFailure, RefreshListener, RefreshReport, RefresherState};
pub use resolver::{Resolver, TokioResolver};
pub use stack::{Stack, StackHandle, StackInput};
pub use timer::{RefreshPurpose, TimerHandle, TimerQueue, TimerTarget, TimerType};
pub use transaction::{
    InviteClientState, InviteServerState, NonInviteClientState, NonInviteServerState,
    SipTimers, Transaction, TransactionOwner, TransactionState, TransactionTimerAction,
};
pub use transport::{UdpChannel, UdpChannelFactory, UdpTransport};
