//! SIP Transaction Layer (RFC 3261 Section 17)
//!
//! A transaction is one request plus all of its responses. Client
//! transactions retransmit the request over unreliable channels and absorb
//! duplicate responses; server transactions absorb retransmitted requests
//! and replay the last response.
//!
//! The state machines here are pure: they mutate their own state and their
//! timers in the shared [`TimerQueue`], and report what the provider has to
//! put on the wire. Sending, event delivery and table bookkeeping live in
//! the provider.

use super::message::{SipHeaders, SipRequest, SipResponse};
use super::timer::{TimerHandle, TimerQueue, TimerTarget, TimerType};
use crate::config::TimerConfig;
use crate::domain::shared::error::SipError;
use crate::domain::shared::value_objects::{
    ChannelKey, DialogId, RefresherId, SipMethod, TransactionKey, TransactionRole,
};
use std::any::Any;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// SIP Timer values (RFC 3261 Section 17.1.1.1)
#[derive(Debug, Clone, Copy)]
pub struct SipTimers {
    /// T1: RTT estimate (default 500ms)
    pub t1: Duration,
    /// T2: Maximum retransmit interval for non-INVITE requests and INVITE responses (default 4s)
    pub t2: Duration,
    /// T4: Maximum duration a message will remain in the network (default 5s)
    pub t4: Duration,
    /// Timer D on unreliable transports (at least 32s)
    pub timer_d: Duration,
}

impl Default for SipTimers {
    fn default() -> Self {
        Self::from_config(&TimerConfig::default())
    }
}

impl SipTimers {
    pub fn from_config(config: &TimerConfig) -> Self {
        Self {
            t1: config.t1(),
            t2: config.t2(),
            t4: config.t4(),
            timer_d: config.timer_d(),
        }
    }

    /// Initial duration of a timer
    pub fn duration(&self, timer_type: TimerType, is_reliable: bool) -> Duration {
        let unless_reliable = |d: Duration| if is_reliable { Duration::ZERO } else { d };
        match timer_type {
            TimerType::TimerA | TimerType::TimerE | TimerType::TimerG => self.t1,
            TimerType::TimerB | TimerType::TimerF | TimerType::TimerH => self.t1 * 64,
            TimerType::TimerD => unless_reliable(self.timer_d),
            TimerType::TimerI | TimerType::TimerK => unless_reliable(self.t4),
            TimerType::TimerJ => unless_reliable(self.t1 * 64),
        }
    }
}

/// INVITE Client Transaction States (RFC 3261 Section 17.1.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteClientState {
    /// Created, request not sent yet
    Init,
    /// Request sent
    Calling,
    /// Received provisional response (1xx)
    Proceeding,
    /// Received final response (3xx-6xx), ACK sent
    Completed,
    /// Transaction terminated
    Terminated,
}

/// INVITE Server Transaction States (RFC 3261 Section 17.2.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteServerState {
    /// Request received, provisional response sent
    Proceeding,
    /// Final response sent
    Completed,
    /// ACK received
    Confirmed,
    /// Transaction terminated
    Terminated,
}

/// Non-INVITE Client Transaction States (RFC 3261 Section 17.1.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonInviteClientState {
    /// Created, request not sent yet
    Init,
    /// Request sent, no response yet
    Trying,
    /// Received provisional response (1xx)
    Proceeding,
    /// Received final response (2xx-6xx)
    Completed,
    /// Transaction terminated
    Terminated,
}

/// Non-INVITE Server Transaction States (RFC 3261 Section 17.2.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonInviteServerState {
    /// Request received
    Trying,
    /// Provisional response sent
    Proceeding,
    /// Final response sent
    Completed,
    /// Transaction terminated
    Terminated,
}

/// Transaction type and state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    InviteClient(InviteClientState),
    InviteServer(InviteServerState),
    NonInviteClient(NonInviteClientState),
    NonInviteServer(NonInviteServerState),
}

impl TransactionState {
    /// Check if transaction is terminated
    pub fn is_terminated(&self) -> bool {
        matches!(
            self,
            TransactionState::InviteClient(InviteClientState::Terminated)
                | TransactionState::InviteServer(InviteServerState::Terminated)
                | TransactionState::NonInviteClient(NonInviteClientState::Terminated)
                | TransactionState::NonInviteServer(NonInviteServerState::Terminated)
        )
    }

    /// Completed, Confirmed or Terminated: the exchange has an outcome
    pub fn has_outcome(&self) -> bool {
        self.is_terminated()
            || matches!(
                self,
                TransactionState::InviteClient(InviteClientState::Completed)
                    | TransactionState::InviteServer(InviteServerState::Completed)
                    | TransactionState::InviteServer(InviteServerState::Confirmed)
                    | TransactionState::NonInviteClient(NonInviteClientState::Completed)
                    | TransactionState::NonInviteServer(NonInviteServerState::Completed)
            )
    }

    /// Still waiting for the first answer from the peer
    pub fn is_early(&self) -> bool {
        matches!(
            self,
            TransactionState::InviteClient(InviteClientState::Init)
                | TransactionState::InviteClient(InviteClientState::Calling)
                | TransactionState::NonInviteClient(NonInviteClientState::Init)
                | TransactionState::NonInviteClient(NonInviteClientState::Trying)
        )
    }

    /// Get state name for debugging
    pub fn name(&self) -> &'static str {
        match self {
            TransactionState::InviteClient(InviteClientState::Init) => "ICT-Init",
            TransactionState::InviteClient(InviteClientState::Calling) => "ICT-Calling",
            TransactionState::InviteClient(InviteClientState::Proceeding) => "ICT-Proceeding",
            TransactionState::InviteClient(InviteClientState::Completed) => "ICT-Completed",
            TransactionState::InviteClient(InviteClientState::Terminated) => "ICT-Terminated",
            TransactionState::InviteServer(InviteServerState::Proceeding) => "IST-Proceeding",
            TransactionState::InviteServer(InviteServerState::Completed) => "IST-Completed",
            TransactionState::InviteServer(InviteServerState::Confirmed) => "IST-Confirmed",
            TransactionState::InviteServer(InviteServerState::Terminated) => "IST-Terminated",
            TransactionState::NonInviteClient(NonInviteClientState::Init) => "NICT-Init",
            TransactionState::NonInviteClient(NonInviteClientState::Trying) => "NICT-Trying",
            TransactionState::NonInviteClient(NonInviteClientState::Proceeding) => {
                "NICT-Proceeding"
            }
            TransactionState::NonInviteClient(NonInviteClientState::Completed) => "NICT-Completed",
            TransactionState::NonInviteClient(NonInviteClientState::Terminated) => {
                "NICT-Terminated"
            }
            TransactionState::NonInviteServer(NonInviteServerState::Trying) => "NIST-Trying",
            TransactionState::NonInviteServer(NonInviteServerState::Proceeding) => {
                "NIST-Proceeding"
            }
            TransactionState::NonInviteServer(NonInviteServerState::Completed) => "NIST-Completed",
            TransactionState::NonInviteServer(NonInviteServerState::Terminated) => {
                "NIST-Terminated"
            }
        }
    }
}

/// Active timer in a transaction
#[derive(Debug, Clone, Copy)]
pub struct ActiveTimer {
    pub timer_type: TimerType,
    pub handle: TimerHandle,
    pub interval: Duration,
}

/// Who receives the events of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOwner {
    Application,
    /// Internal renewal transaction of a refresher
    Refresher(RefresherId),
}

/// What the provider must do with a response after the state machine ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// Pass the response to the transaction user
    Deliver,
    /// Pass it on and send the hop-by-hop ACK (non-2xx final to INVITE)
    DeliverAndAck,
    /// Duplicate, absorb it
    Retransmission,
    /// Duplicate non-2xx final to INVITE, resend the ACK only
    RetransmissionAck,
    /// 2xx retransmission after the INVITE transaction ended; belongs to the dialog
    Late2xx,
}

/// Actions that should be taken when a timer fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionTimerAction {
    /// No action needed
    None,
    /// Retransmit the request
    RetransmitRequest,
    /// Retransmit the response
    RetransmitResponse,
    /// Transaction timed out
    Timeout,
    /// Terminate the transaction
    Terminate,
}

/// SIP Transaction
pub struct Transaction {
    pub key: TransactionKey,
    pub role: TransactionRole,
    /// Current state
    pub state: TransactionState,
    /// Original request
    pub request: SipRequest,
    /// Pooled channel this transaction holds a reference on
    pub channel: Option<ChannelKey>,
    /// Is transport reliable (TCP/TLS vs UDP)
    pub is_reliable: bool,
    /// Last response sent (server) or received (client)
    pub last_response: Option<SipResponse>,
    pub dialog: Option<DialogId>,
    pub owner: TransactionOwner,
    /// To tag added to responses of a server transaction
    pub local_tag: Option<String>,
    /// Send requested while the channel was still resolving
    pub send_pending: bool,
    pub retransmissions: u32,
    pub created_at: Instant,
    pub(crate) terminated_notified: bool,
    pub(crate) app_data: Option<Box<dyn Any + Send>>,
    timers: Vec<ActiveTimer>,
    sip_timers: SipTimers,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("key", &self.key)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("channel", &self.channel)
            .field("owner", &self.owner)
            .finish()
    }
}

impl Transaction {
    /// Create a client transaction. It stays in Init until the request is sent.
    pub fn new_client(
        key: TransactionKey,
        request: SipRequest,
        channel: ChannelKey,
        is_reliable: bool,
        sip_timers: SipTimers,
    ) -> Self {
        let state = if key.method == SipMethod::Invite {
            TransactionState::InviteClient(InviteClientState::Init)
        } else {
            TransactionState::NonInviteClient(NonInviteClientState::Init)
        };
        Self::with_state(key, TransactionRole::Client, state, request, channel, is_reliable, sip_timers)
    }

    /// Create a server transaction for a freshly received request
    pub fn new_server(
        key: TransactionKey,
        request: SipRequest,
        channel: ChannelKey,
        is_reliable: bool,
        sip_timers: SipTimers,
    ) -> Self {
        let state = if key.method == SipMethod::Invite {
            TransactionState::InviteServer(InviteServerState::Proceeding)
        } else {
            TransactionState::NonInviteServer(NonInviteServerState::Trying)
        };
        Self::with_state(key, TransactionRole::Server, state, request, channel, is_reliable, sip_timers)
    }

    fn with_state(
        key: TransactionKey,
        role: TransactionRole,
        state: TransactionState,
        request: SipRequest,
        channel: ChannelKey,
        is_reliable: bool,
        sip_timers: SipTimers,
    ) -> Self {
        Self {
            key,
            role,
            state,
            request,
            channel: Some(channel),
            is_reliable,
            last_response: None,
            dialog: None,
            owner: TransactionOwner::Application,
            local_tag: None,
            send_pending: false,
            retransmissions: 0,
            created_at: Instant::now(),
            terminated_notified: false,
            app_data: None,
            timers: Vec::new(),
            sip_timers,
        }
    }

    pub fn is_client(&self) -> bool {
        self.role == TransactionRole::Client
    }

    pub fn is_invite(&self) -> bool {
        self.key.method == SipMethod::Invite
    }

    pub fn method(&self) -> SipMethod {
        self.key.method
    }

    /// The request has left (or is queued to leave) the Init state
    pub fn was_sent(&self) -> bool {
        !matches!(
            self.state,
            TransactionState::InviteClient(InviteClientState::Init)
                | TransactionState::NonInviteClient(NonInviteClientState::Init)
        ) || self.send_pending
    }

    pub fn active_timers(&self) -> impl Iterator<Item = &ActiveTimer> {
        self.timers.iter()
    }

    /// Whether a popped timer handle is still one of ours
    pub fn owns_timer(&self, handle: TimerHandle) -> bool {
        self.timers.iter().any(|t| t.handle == handle)
    }

    fn set_state(&mut self, state: TransactionState) {
        if self.state != state {
            debug!(
                "Transaction {} state: {} -> {}",
                self.key,
                self.state.name(),
                state.name()
            );
            self.state = state;
        }
    }

    /// Start a timer. Returns false when its duration is zero.
    fn start_timer(&mut self, timer_type: TimerType, queue: &mut TimerQueue) -> bool {
        let duration = self.sip_timers.duration(timer_type, self.is_reliable);
        self.start_timer_with(timer_type, duration, queue)
    }

    fn start_timer_with(
        &mut self,
        timer_type: TimerType,
        duration: Duration,
        queue: &mut TimerQueue,
    ) -> bool {
        self.stop_timer(timer_type, queue);
        if duration.is_zero() {
            return false;
        }
        let handle = queue.schedule(
            Instant::now() + duration,
            TimerTarget::Transaction(self.key.clone(), timer_type),
        );
        self.timers.push(ActiveTimer {
            timer_type,
            handle,
            interval: duration,
        });
        debug!(
            "Started {:?} for transaction {} (expires in {:?})",
            timer_type, self.key, duration
        );
        true
    }

    fn stop_timer(&mut self, timer_type: TimerType, queue: &mut TimerQueue) {
        self.timers.retain(|t| {
            if t.timer_type == timer_type {
                queue.cancel(t.handle);
                false
            } else {
                true
            }
        });
    }

    fn stop_all_timers(&mut self, queue: &mut TimerQueue) {
        for timer in self.timers.drain(..) {
            queue.cancel(timer.handle);
        }
    }

    /// Move to a Completed/Confirmed wait state, or straight to Terminated
    /// when the wait timer is zero (reliable transports)
    fn enter_wait(&mut self, waiting: TransactionState, timer_type: TimerType, queue: &mut TimerQueue) {
        self.set_state(waiting);
        if !self.start_timer(timer_type, queue) {
            self.terminate(queue);
        }
    }

    /// Force the transaction to Terminated. Idempotent.
    pub fn terminate(&mut self, queue: &mut TimerQueue) {
        self.stop_all_timers(queue);
        let terminated = match self.state {
            TransactionState::InviteClient(_) => {
                TransactionState::InviteClient(InviteClientState::Terminated)
            }
            TransactionState::InviteServer(_) => {
                TransactionState::InviteServer(InviteServerState::Terminated)
            }
            TransactionState::NonInviteClient(_) => {
                TransactionState::NonInviteClient(NonInviteClientState::Terminated)
            }
            TransactionState::NonInviteServer(_) => {
                TransactionState::NonInviteServer(NonInviteServerState::Terminated)
            }
        };
        self.set_state(terminated);
    }

    /// Record that the request went out: leave Init and arm the
    /// retransmission and timeout timers
    pub fn mark_sent(&mut self, queue: &mut TimerQueue) -> Result<(), SipError> {
        self.send_pending = false;
        match self.state {
            TransactionState::InviteClient(InviteClientState::Init) => {
                self.set_state(TransactionState::InviteClient(InviteClientState::Calling));
                if !self.is_reliable {
                    self.start_timer(TimerType::TimerA, queue);
                }
                self.start_timer(TimerType::TimerB, queue);
                Ok(())
            }
            TransactionState::NonInviteClient(NonInviteClientState::Init) => {
                self.set_state(TransactionState::NonInviteClient(NonInviteClientState::Trying));
                if !self.is_reliable {
                    self.start_timer(TimerType::TimerE, queue);
                }
                self.start_timer(TimerType::TimerF, queue);
                Ok(())
            }
            _ => Err(SipError::AlreadySent(self.key.to_string())),
        }
    }

    /// Process received response (for client transactions)
    pub fn process_response(
        &mut self,
        response: &SipResponse,
        queue: &mut TimerQueue,
    ) -> ResponseOutcome {
        let status = response.status_code();

        match self.state {
            TransactionState::InviteClient(state) => match state {
                InviteClientState::Init => {
                    warn!("Response {} on unsent transaction {}", status, self.key);
                    ResponseOutcome::Retransmission
                }
                InviteClientState::Calling | InviteClientState::Proceeding => {
                    self.last_response = Some(response.clone());
                    if status < 200 {
                        self.set_state(TransactionState::InviteClient(InviteClientState::Proceeding));
                        self.stop_timer(TimerType::TimerA, queue);
                        ResponseOutcome::Deliver
                    } else if status < 300 {
                        // 2xx ACK is end-to-end, the dialog layer sends it
                        self.terminate(queue);
                        ResponseOutcome::Deliver
                    } else {
                        self.stop_timer(TimerType::TimerA, queue);
                        self.stop_timer(TimerType::TimerB, queue);
                        self.enter_wait(
                            TransactionState::InviteClient(InviteClientState::Completed),
                            TimerType::TimerD,
                            queue,
                        );
                        ResponseOutcome::DeliverAndAck
                    }
                }
                InviteClientState::Completed => {
                    if status >= 300 {
                        ResponseOutcome::RetransmissionAck
                    } else {
                        ResponseOutcome::Retransmission
                    }
                }
                InviteClientState::Terminated => {
                    if (200..300).contains(&status) {
                        ResponseOutcome::Late2xx
                    } else {
                        ResponseOutcome::Retransmission
                    }
                }
            },

            TransactionState::NonInviteClient(state) => match state {
                NonInviteClientState::Init => {
                    warn!("Response {} on unsent transaction {}", status, self.key);
                    ResponseOutcome::Retransmission
                }
                NonInviteClientState::Trying | NonInviteClientState::Proceeding => {
                    self.last_response = Some(response.clone());
                    if status < 200 {
                        self.set_state(TransactionState::NonInviteClient(
                            NonInviteClientState::Proceeding,
                        ));
                    } else {
                        self.stop_timer(TimerType::TimerE, queue);
                        self.stop_timer(TimerType::TimerF, queue);
                        self.enter_wait(
                            TransactionState::NonInviteClient(NonInviteClientState::Completed),
                            TimerType::TimerK,
                            queue,
                        );
                    }
                    ResponseOutcome::Deliver
                }
                NonInviteClientState::Completed | NonInviteClientState::Terminated => {
                    ResponseOutcome::Retransmission
                }
            },

            _ => {
                warn!("Response routed to server transaction {}", self.key);
                ResponseOutcome::Retransmission
            }
        }
    }

    /// Process received ACK (for INVITE server transactions).
    ///
    /// Returns true when the ACK belongs to this transaction (non-2xx final);
    /// an ACK for a 2xx is end-to-end and handled by the dialog.
    pub fn process_ack(&mut self, queue: &mut TimerQueue) -> bool {
        match self.state {
            TransactionState::InviteServer(InviteServerState::Completed) => {
                self.stop_timer(TimerType::TimerG, queue);
                self.stop_timer(TimerType::TimerH, queue);
                self.enter_wait(
                    TransactionState::InviteServer(InviteServerState::Confirmed),
                    TimerType::TimerI,
                    queue,
                );
                true
            }
            TransactionState::InviteServer(InviteServerState::Confirmed) => true,
            TransactionState::InviteServer(InviteServerState::Terminated) => {
                // absorbed only if the transaction answered with a non-2xx
                self.last_response
                    .as_ref()
                    .is_some_and(|r| r.status_code() >= 300)
            }
            _ => false,
        }
    }

    /// Response to replay when the request is retransmitted
    pub fn response_for_retransmission(&self) -> Option<&SipResponse> {
        match self.state {
            TransactionState::InviteServer(InviteServerState::Proceeding)
            | TransactionState::InviteServer(InviteServerState::Completed)
            | TransactionState::NonInviteServer(NonInviteServerState::Proceeding)
            | TransactionState::NonInviteServer(NonInviteServerState::Completed) => {
                self.last_response.as_ref()
            }
            _ => None,
        }
    }

    /// Send response (for server transactions)
    pub fn send_response(
        &mut self,
        response: SipResponse,
        queue: &mut TimerQueue,
    ) -> Result<(), SipError> {
        let status = response.status_code();

        match self.state {
            TransactionState::InviteServer(InviteServerState::Proceeding) => {
                self.last_response = Some(response);
                if (200..300).contains(&status) {
                    // retransmission of the 2xx is the dialog's job
                    self.terminate(queue);
                } else if status >= 300 {
                    self.set_state(TransactionState::InviteServer(InviteServerState::Completed));
                    if !self.is_reliable {
                        self.start_timer(TimerType::TimerG, queue);
                    }
                    self.start_timer(TimerType::TimerH, queue);
                }
                Ok(())
            }
            TransactionState::NonInviteServer(
                NonInviteServerState::Trying | NonInviteServerState::Proceeding,
            ) => {
                self.last_response = Some(response);
                if status < 200 {
                    self.set_state(TransactionState::NonInviteServer(
                        NonInviteServerState::Proceeding,
                    ));
                } else {
                    self.enter_wait(
                        TransactionState::NonInviteServer(NonInviteServerState::Completed),
                        TimerType::TimerJ,
                        queue,
                    );
                }
                Ok(())
            }
            TransactionState::InviteClient(_) | TransactionState::NonInviteClient(_) => Err(
                SipError::InvalidState(format!("{} is a client transaction", self.key)),
            ),
            state => Err(SipError::InvalidState(format!(
                "Cannot send {} on transaction {} in state {}",
                status,
                self.key,
                state.name()
            ))),
        }
    }

    /// Handle timer expiration
    pub fn handle_timer_fired(
        &mut self,
        timer_type: TimerType,
        queue: &mut TimerQueue,
    ) -> TransactionTimerAction {
        debug!(
            "Timer {:?} fired for transaction {} in state {}",
            timer_type,
            self.key,
            self.state.name()
        );
        let interval = self
            .timers
            .iter()
            .find(|t| t.timer_type == timer_type)
            .map(|t| t.interval);
        self.timers.retain(|t| t.timer_type != timer_type);
        let t2 = self.sip_timers.t2;

        match timer_type {
            TimerType::TimerA => {
                if self.state != TransactionState::InviteClient(InviteClientState::Calling) {
                    return TransactionTimerAction::None;
                }
                let next = interval.unwrap_or(self.sip_timers.t1) * 2;
                self.start_timer_with(TimerType::TimerA, next, queue);
                self.retransmissions += 1;
                TransactionTimerAction::RetransmitRequest
            }

            TimerType::TimerE => {
                let next = match self.state {
                    TransactionState::NonInviteClient(NonInviteClientState::Trying) => {
                        std::cmp::min(interval.unwrap_or(self.sip_timers.t1) * 2, t2)
                    }
                    TransactionState::NonInviteClient(NonInviteClientState::Proceeding) => t2,
                    _ => return TransactionTimerAction::None,
                };
                self.start_timer_with(TimerType::TimerE, next, queue);
                self.retransmissions += 1;
                TransactionTimerAction::RetransmitRequest
            }

            TimerType::TimerG => {
                if self.state != TransactionState::InviteServer(InviteServerState::Completed) {
                    return TransactionTimerAction::None;
                }
                let next = std::cmp::min(interval.unwrap_or(self.sip_timers.t1) * 2, t2);
                self.start_timer_with(TimerType::TimerG, next, queue);
                self.retransmissions += 1;
                TransactionTimerAction::RetransmitResponse
            }

            TimerType::TimerB | TimerType::TimerF | TimerType::TimerH => {
                self.terminate(queue);
                TransactionTimerAction::Timeout
            }

            TimerType::TimerD
            | TimerType::TimerI
            | TimerType::TimerJ
            | TimerType::TimerK => {
                self.terminate(queue);
                TransactionTimerAction::Terminate
            }
        }
    }

    /// Release the channel reference; returns it only the first time
    pub fn take_channel(&mut self) -> Option<ChannelKey> {
        self.channel.take()
    }

    /// Response sequence number of the original request
    pub fn cseq_number(&self) -> Option<u32> {
        self.request.cseq_number()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::shared::value_objects::{BranchId, TransportProtocol};

    fn create_request_with_branch(method: &str, branch: &str) -> SipRequest {
        let request_str = format!(
            "{} sip:bob@example.com SIP/2.0\r\n\
             Via: SIP/2.0/UDP 192.168.1.100:5060;branch={}\r\n\
             From: <sip:alice@example.com>;tag=1234\r\n\
             To: <sip:bob@example.com>\r\n\
             Call-ID: test-call-id\r\n\
             CSeq: 1 {}\r\n\
             Content-Length: 0\r\n\
             \r\n",
            method, branch, method
        );
        SipRequest::parse(request_str.as_bytes()).unwrap()
    }

    fn create_response(status: u16, method: &str, branch: &str) -> SipResponse {
        let response_str = format!(
            "SIP/2.0 {} Whatever\r\n\
             Via: SIP/2.0/UDP 192.168.1.100:5060;branch={}\r\n\
             From: <sip:alice@example.com>;tag=1234\r\n\
             To: <sip:bob@example.com>;tag=5678\r\n\
             Call-ID: test-call-id\r\n\
             CSeq: 1 {}\r\n\
             Content-Length: 0\r\n\
             \r\n",
            status, branch, method
        );
        SipResponse::parse(response_str.as_bytes()).unwrap()
    }

    fn channel() -> ChannelKey {
        ChannelKey::new(TransportProtocol::Udp, "192.168.1.200", 5060)
    }

    fn client(method: SipMethod, reliable: bool) -> Transaction {
        let branch = "z9hG4bKtest";
        let request = create_request_with_branch(method.as_str(), branch);
        Transaction::new_client(
            TransactionKey::new(BranchId::new(branch), method),
            request,
            channel(),
            reliable,
            SipTimers::default(),
        )
    }

    fn server(method: SipMethod, reliable: bool) -> Transaction {
        let branch = "z9hG4bKserver";
        let request = create_request_with_branch(method.as_str(), branch);
        Transaction::new_server(
            TransactionKey::new(BranchId::new(branch), method),
            request,
            channel(),
            reliable,
            SipTimers::default(),
        )
    }

    fn timer_types(txn: &Transaction) -> Vec<TimerType> {
        txn.active_timers().map(|t| t.timer_type).collect()
    }

    #[test]
    fn test_timer_durations() {
        let timers = SipTimers::default();
        assert_eq!(timers.duration(TimerType::TimerA, false), Duration::from_millis(500));
        assert_eq!(timers.duration(TimerType::TimerB, false), Duration::from_secs(32));
        assert_eq!(timers.duration(TimerType::TimerD, false), Duration::from_secs(32));
        assert_eq!(timers.duration(TimerType::TimerD, true), Duration::ZERO);
        assert_eq!(timers.duration(TimerType::TimerK, false), Duration::from_secs(5));
        assert_eq!(timers.duration(TimerType::TimerJ, true), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_invite_client_send_starts_timers() {
        let mut queue = TimerQueue::new();
        let mut txn = client(SipMethod::Invite, false);
        assert_eq!(txn.state.name(), "ICT-Init");

        txn.mark_sent(&mut queue).unwrap();
        assert_eq!(txn.state, TransactionState::InviteClient(InviteClientState::Calling));
        assert_eq!(timer_types(&txn), vec![TimerType::TimerA, TimerType::TimerB]);
        assert_eq!(queue.len(), 2);

        assert!(matches!(txn.mark_sent(&mut queue), Err(SipError::AlreadySent(_))));
    }

    #[tokio::test]
    async fn test_reliable_client_has_no_retransmit_timer() {
        let mut queue = TimerQueue::new();
        let mut txn = client(SipMethod::Register, true);
        txn.mark_sent(&mut queue).unwrap();
        assert_eq!(timer_types(&txn), vec![TimerType::TimerF]);
    }

    #[tokio::test]
    async fn test_invite_client_error_response_needs_ack() {
        let mut queue = TimerQueue::new();
        let mut txn = client(SipMethod::Invite, false);
        txn.mark_sent(&mut queue).unwrap();

        let ringing = create_response(180, "INVITE", "z9hG4bKtest");
        assert_eq!(txn.process_response(&ringing, &mut queue), ResponseOutcome::Deliver);
        assert_eq!(txn.state, TransactionState::InviteClient(InviteClientState::Proceeding));
        assert_eq!(timer_types(&txn), vec![TimerType::TimerB]);

        let busy = create_response(486, "INVITE", "z9hG4bKtest");
        assert_eq!(txn.process_response(&busy, &mut queue), ResponseOutcome::DeliverAndAck);
        assert_eq!(txn.state, TransactionState::InviteClient(InviteClientState::Completed));
        assert_eq!(timer_types(&txn), vec![TimerType::TimerD]);

        // the retransmitted 486 only triggers a new ACK
        assert_eq!(
            txn.process_response(&busy, &mut queue),
            ResponseOutcome::RetransmissionAck
        );
    }

    #[tokio::test]
    async fn test_invite_client_2xx_terminates() {
        let mut queue = TimerQueue::new();
        let mut txn = client(SipMethod::Invite, false);
        txn.mark_sent(&mut queue).unwrap();

        let ok = create_response(200, "INVITE", "z9hG4bKtest");
        assert_eq!(txn.process_response(&ok, &mut queue), ResponseOutcome::Deliver);
        assert!(txn.state.is_terminated());
        assert!(queue.is_empty());
        assert_eq!(txn.process_response(&ok, &mut queue), ResponseOutcome::Late2xx);
    }

    #[tokio::test]
    async fn test_reliable_invite_error_terminates_immediately() {
        let mut queue = TimerQueue::new();
        let mut txn = client(SipMethod::Invite, true);
        txn.mark_sent(&mut queue).unwrap();

        let busy = create_response(486, "INVITE", "z9hG4bKtest");
        assert_eq!(txn.process_response(&busy, &mut queue), ResponseOutcome::DeliverAndAck);
        assert!(txn.state.is_terminated());
    }

    #[tokio::test]
    async fn test_non_invite_client_flow() {
        let mut queue = TimerQueue::new();
        let mut txn = client(SipMethod::Register, false);
        txn.mark_sent(&mut queue).unwrap();

        let trying = create_response(100, "REGISTER", "z9hG4bKtest");
        txn.process_response(&trying, &mut queue);
        assert_eq!(
            txn.state,
            TransactionState::NonInviteClient(NonInviteClientState::Proceeding)
        );

        let ok = create_response(200, "REGISTER", "z9hG4bKtest");
        assert_eq!(txn.process_response(&ok, &mut queue), ResponseOutcome::Deliver);
        assert_eq!(
            txn.state,
            TransactionState::NonInviteClient(NonInviteClientState::Completed)
        );
        assert_eq!(timer_types(&txn), vec![TimerType::TimerK]);
        assert_eq!(
            txn.process_response(&ok, &mut queue),
            ResponseOutcome::Retransmission
        );
    }

    #[tokio::test]
    async fn test_timer_a_doubles_without_cap() {
        let mut queue = TimerQueue::new();
        let mut txn = client(SipMethod::Invite, false);
        txn.mark_sent(&mut queue).unwrap();

        let mut intervals = Vec::new();
        for _ in 0..5 {
            let action = txn.handle_timer_fired(TimerType::TimerA, &mut queue);
            assert_eq!(action, TransactionTimerAction::RetransmitRequest);
            let timer = txn
                .active_timers()
                .find(|t| t.timer_type == TimerType::TimerA)
                .unwrap();
            intervals.push(timer.interval.as_millis());
        }
        assert_eq!(intervals, vec![1000, 2000, 4000, 8000, 16000]);
        assert_eq!(txn.retransmissions, 5);
    }

    #[tokio::test]
    async fn test_timer_e_caps_at_t2() {
        let mut queue = TimerQueue::new();
        let mut txn = client(SipMethod::Options, false);
        txn.mark_sent(&mut queue).unwrap();

        let mut intervals = Vec::new();
        for _ in 0..5 {
            txn.handle_timer_fired(TimerType::TimerE, &mut queue);
            let timer = txn
                .active_timers()
                .find(|t| t.timer_type == TimerType::TimerE)
                .unwrap();
            intervals.push(timer.interval.as_millis());
        }
        assert_eq!(intervals, vec![1000, 2000, 4000, 4000, 4000]);
    }

    #[tokio::test]
    async fn test_timer_b_times_out() {
        let mut queue = TimerQueue::new();
        let mut txn = client(SipMethod::Invite, false);
        txn.mark_sent(&mut queue).unwrap();

        let action = txn.handle_timer_fired(TimerType::TimerB, &mut queue);
        assert_eq!(action, TransactionTimerAction::Timeout);
        assert!(txn.state.is_terminated());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_invite_server_error_then_ack() {
        let mut queue = TimerQueue::new();
        let mut txn = server(SipMethod::Invite, false);

        let busy = create_response(486, "INVITE", "z9hG4bKserver");
        txn.send_response(busy, &mut queue).unwrap();
        assert_eq!(txn.state, TransactionState::InviteServer(InviteServerState::Completed));
        assert_eq!(timer_types(&txn), vec![TimerType::TimerG, TimerType::TimerH]);
        assert_eq!(
            txn.response_for_retransmission().map(|r| r.status_code()),
            Some(486)
        );

        assert!(txn.process_ack(&mut queue));
        assert_eq!(txn.state, TransactionState::InviteServer(InviteServerState::Confirmed));
        assert_eq!(timer_types(&txn), vec![TimerType::TimerI]);
        // retransmitted ACK is absorbed
        assert!(txn.process_ack(&mut queue));
    }

    #[tokio::test]
    async fn test_invite_server_2xx_terminates() {
        let mut queue = TimerQueue::new();
        let mut txn = server(SipMethod::Invite, false);
        let ok = create_response(200, "INVITE", "z9hG4bKserver");
        txn.send_response(ok, &mut queue).unwrap();
        assert!(txn.state.is_terminated());
        // a 2xx ACK is not ours
        assert!(!txn.process_ack(&mut queue));
    }

    #[tokio::test]
    async fn test_non_invite_server_flow() {
        let mut queue = TimerQueue::new();
        let mut txn = server(SipMethod::Register, false);
        assert!(txn.response_for_retransmission().is_none());

        let ok = create_response(200, "REGISTER", "z9hG4bKserver");
        txn.send_response(ok.clone(), &mut queue).unwrap();
        assert_eq!(
            txn.state,
            TransactionState::NonInviteServer(NonInviteServerState::Completed)
        );
        assert_eq!(timer_types(&txn), vec![TimerType::TimerJ]);
        assert!(matches!(
            txn.send_response(ok, &mut queue),
            Err(SipError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let mut queue = TimerQueue::new();
        let mut txn = client(SipMethod::Register, false);
        txn.mark_sent(&mut queue).unwrap();
        txn.terminate(&mut queue);
        txn.terminate(&mut queue);
        assert!(txn.state.is_terminated());
        assert!(queue.is_empty());
        assert!(txn.take_channel().is_some());
        assert!(txn.take_channel().is_none());
    }
}
