//! The provider owns every live transaction, dialog and refresher, the
//! channel pool and the timer queue. It is driven from one loop (see
//! [`super::stack::Stack`]) and reports to the application through a single
//! event channel.
//!
//! ```text
//!  transport ──on_message_received──► Provider ──emit──► SipEvent receiver
//!                                       │  ▲
//!            poll_timers ──────────────►│  │ create_*/send_* (application)
//!                                       ▼  │
//!                        transactions / dialogs / refreshers
//! ```

use super::auth::{AuthChallenge, AuthHelper, DigestAuthHelper, UserCredentials};
use super::builder::{build_cancel, build_non2xx_ack};
use super::channel::{ChannelFactory, ChannelPool, ResolveRequest};
use super::dialog::{Dialog, DialogMatch};
use super::event::SipEvent;
use super::message::{with_header_param, SipHeaders, SipMessage, SipRequest, SipResponse};
use super::metrics;
use super::refresher::Refresher;
use super::timer::{TimerHandle, TimerQueue, TimerTarget};
use super::transaction::{
    InviteClientState, ResponseOutcome, SipTimers, Transaction, TransactionOwner,
    TransactionState, TransactionTimerAction,
};
use crate::config::Config;
use crate::domain::shared::error::SipError;
use crate::domain::shared::value_objects::{
    generate_tag, BranchId, ChannelKey, DialogId, RefresherId, ResolveToken, SipMethod,
    TransactionKey, TransactionRole,
};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub struct Provider {
    pub(crate) config: Config,
    pub(crate) sip_timers: SipTimers,
    pub(crate) timers: TimerQueue,
    pub(crate) pool: ChannelPool,
    pub(crate) transactions: HashMap<TransactionKey, Transaction>,
    pub(crate) dialogs: HashMap<DialogId, Dialog>,
    pub(crate) dialog_tombstones: HashSet<DialogId>,
    pub(crate) refreshers: HashMap<RefresherId, Refresher>,
    pub(crate) stopped_refreshers: HashSet<RefresherId>,
    pub(crate) next_refresher_id: u64,
    pub(crate) credentials: Vec<UserCredentials>,
    pub(crate) auth_helper: Box<dyn AuthHelper>,
    events: mpsc::UnboundedSender<SipEvent>,
}

fn not_found(key: &TransactionKey) -> SipError {
    SipError::NotFound(format!("Transaction {}", key))
}

impl Provider {
    pub fn new(
        config: Config,
        factory: Box<dyn ChannelFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<SipEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let provider = Self {
            sip_timers: SipTimers::from_config(&config.timers),
            config,
            timers: TimerQueue::new(),
            pool: ChannelPool::new(factory),
            transactions: HashMap::new(),
            dialogs: HashMap::new(),
            dialog_tombstones: HashSet::new(),
            refreshers: HashMap::new(),
            stopped_refreshers: HashSet::new(),
            next_refresher_id: 0,
            credentials: Vec::new(),
            auth_helper: Box::new(DigestAuthHelper::new()),
            events,
        };
        (provider, receiver)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Single exit point of every application event
    pub(crate) fn emit(&self, event: SipEvent) {
        debug!("Dispatching {}", event.name());
        if self.events.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }

    pub fn set_auth_helper(&mut self, helper: Box<dyn AuthHelper>) {
        self.auth_helper = helper;
    }

    pub fn add_credentials(&mut self, credentials: UserCredentials) {
        info!(
            "Added credentials for {} (realm {:?})",
            credentials.username, credentials.realm
        );
        self.credentials.push(credentials);
    }

    // --- client transactions ---------------------------------------------

    /// Create a client transaction for `request`. The top Via gets a fresh
    /// branch (a CANCEL keeps the branch of its INVITE) and the channel to
    /// the next hop is acquired from the pool.
    pub fn create_client_transaction(
        &mut self,
        request: SipRequest,
    ) -> Result<TransactionKey, SipError> {
        self.create_client_transaction_for(request, TransactionOwner::Application)
    }

    pub(crate) fn create_client_transaction_for(
        &mut self,
        mut request: SipRequest,
        owner: TransactionOwner,
    ) -> Result<TransactionKey, SipError> {
        let method = request
            .method()
            .ok_or_else(|| SipError::ProtocolViolation("Unknown request method".to_string()))?;
        if method == SipMethod::Ack {
            return Err(SipError::InvalidState(
                "ACK is sent without a transaction".to_string(),
            ));
        }
        let hop = request.next_hop()?;
        let branch = match (method, request.branch()) {
            (SipMethod::Cancel, Some(branch)) => branch,
            _ => BranchId::generate(),
        };
        let key = TransactionKey::new(branch.clone(), method);
        if self.transactions.contains_key(&key) {
            return Err(SipError::InvalidState(format!(
                "Transaction {} already exists",
                key
            )));
        }

        self.pool.acquire(&hop)?;
        let reliable = self.pool.is_reliable(&hop);
        request.set_branch(&branch, &self.config.sip.sent_by(), hop.transport);
        if !request.has_header("Max-Forwards") {
            request.push_header("Max-Forwards", "70");
        }
        if !request.has_header("User-Agent") {
            request.push_header("User-Agent", self.config.sip.user_agent.clone());
        }

        let mut txn = Transaction::new_client(key.clone(), request, hop, reliable, self.sip_timers);
        txn.owner = owner;
        txn.dialog = self.dialog_for_outgoing(&txn.request);
        debug!("Created client transaction {} over {:?}", key, txn.channel);
        self.transactions.insert(key.clone(), txn);
        metrics::transaction_created(TransactionRole::Client, method);
        metrics::transactions_active(self.transactions.len());
        Ok(key)
    }

    /// Send the request of a client transaction. One shot.
    pub fn send_request(&mut self, key: &TransactionKey) -> Result<(), SipError> {
        let txn = self.transactions.get_mut(key).ok_or_else(|| not_found(key))?;
        if !txn.is_client() {
            return Err(SipError::InvalidState(format!(
                "{} is a server transaction",
                key
            )));
        }
        if txn.was_sent() {
            return Err(SipError::AlreadySent(key.to_string()));
        }
        if txn.state.is_terminated() {
            return Err(SipError::InvalidState(format!("{} is terminated", key)));
        }
        let channel = txn
            .channel
            .clone()
            .ok_or_else(|| SipError::ChannelUnavailable(key.to_string()))?;
        if !self.pool.contains(&channel) {
            return Err(SipError::ChannelUnavailable(format!(
                "{} lost channel {}",
                key, channel
            )));
        }
        if !self.pool.is_ready(&channel) {
            debug!("Transaction {} waits for channel {}", key, channel);
            txn.send_pending = true;
            return Ok(());
        }
        self.transmit_request(key);
        Ok(())
    }

    /// Put the request on the wire and start the state machine. A send
    /// failure terminates the transaction with an io-error.
    fn transmit_request(&mut self, key: &TransactionKey) {
        let Some(txn) = self.transactions.get_mut(key) else {
            return;
        };
        let Some(channel) = txn.channel.clone() else {
            return;
        };
        let message = SipMessage::Request(txn.request.clone());
        match self.pool.send(&channel, &message) {
            Ok(()) => {
                if let Err(e) = txn.mark_sent(&mut self.timers) {
                    warn!("Transaction {}: {}", key, e);
                }
            }
            Err(e) => self.fail_transaction(key, &e.to_string()),
        }
    }

    /// CANCEL for a client INVITE that got a provisional response
    pub fn create_cancel(&self, key: &TransactionKey) -> Result<SipRequest, SipError> {
        let txn = self.transactions.get(key).ok_or_else(|| not_found(key))?;
        if txn.state != TransactionState::InviteClient(InviteClientState::Proceeding) {
            return Err(SipError::InvalidState(format!(
                "Cannot cancel {} in state {}",
                key,
                txn.state.name()
            )));
        }
        build_cancel(&txn.request)
    }

    /// Request for the same target carrying credentials for the challenges
    /// of the last 401/407 received on `key`
    pub fn create_authenticated_request(
        &mut self,
        key: &TransactionKey,
    ) -> Result<SipRequest, SipError> {
        let txn = self.transactions.get(key).ok_or_else(|| not_found(key))?;
        let response = txn
            .last_response
            .as_ref()
            .filter(|r| matches!(r.status_code(), 401 | 407))
            .ok_or_else(|| SipError::InvalidState(format!("{} was not challenged", key)))?;
        let challenges = AuthChallenge::from_response(response);
        let mut request = txn.request.clone();
        let cseq = request
            .cseq_number()
            .ok_or_else(|| SipError::ProtocolViolation("Request without CSeq".to_string()))?;
        let dialog = txn.dialog.clone();

        let next = match dialog {
            Some(dialog) => self.next_dialog_cseq(&dialog)?,
            None => cseq + 1,
        };
        request.set_cseq(next)?;
        self.authorize(&mut request, &challenges, None)?;
        Ok(request)
    }

    /// Replace the credentials of `request` with answers to `challenges`
    pub(crate) fn authorize(
        &mut self,
        request: &mut SipRequest,
        challenges: &[AuthChallenge],
        realm: Option<&str>,
    ) -> Result<(), SipError> {
        request.remove_header("Authorization");
        request.remove_header("Proxy-Authorization");
        let method = request
            .method()
            .ok_or_else(|| SipError::ProtocolViolation("Unknown request method".to_string()))?;
        let uri = request.uri_string();

        let mut answered = 0;
        for challenge in challenges {
            if realm.is_some_and(|r| r != challenge.realm) {
                debug!("Skipping challenge for realm {}", challenge.realm);
                continue;
            }
            let Some(credentials) = self
                .credentials
                .iter()
                .find(|c| c.matches_realm(&challenge.realm))
            else {
                debug!("No credentials for realm {}", challenge.realm);
                continue;
            };
            let value = self
                .auth_helper
                .compute_credentials(challenge, credentials, method, &uri)?;
            request.push_header(challenge.authorization_header_name(), value);
            answered += 1;
        }
        if answered == 0 {
            return Err(SipError::AuthFailure(format!(
                "No credentials for {} challenge(s)",
                challenges.len()
            )));
        }
        Ok(())
    }

    // --- incoming messages -----------------------------------------------

    /// Entry point of the transport: a message arrived on `channel`
    pub fn on_message_received(&mut self, channel: ChannelKey, message: SipMessage) {
        match message {
            SipMessage::Request(request) => self.handle_request(channel, request),
            SipMessage::Response(response) => self.route_response(response),
        }
    }

    /// Match a response to its client transaction by top Via branch and
    /// CSeq method. Unmatched responses are dropped.
    pub fn route_response(&mut self, response: SipResponse) {
        let status = response.status_code();
        let (Some(branch), Some((_, method))) = (response.branch(), response.cseq()) else {
            debug!("Dropping {} response without branch or CSeq", status);
            return;
        };
        let key = TransactionKey::new(branch, method);
        let Some(txn) = self.transactions.get_mut(&key) else {
            debug!("Dropping unmatched {} response for {}", status, key);
            return;
        };
        if !txn.is_client() {
            debug!("Dropping {} response matching server transaction {}", status, key);
            return;
        }

        let outcome = txn.process_response(&response, &mut self.timers);
        match outcome {
            ResponseOutcome::Retransmission => {
                debug!("Absorbed retransmitted {} on {}", status, key);
            }
            ResponseOutcome::RetransmissionAck => {
                debug!("Re-sending ACK for retransmitted {} on {}", status, key);
                self.send_non2xx_ack(&key, &response);
            }
            ResponseOutcome::Late2xx => self.dialog_on_late_2xx(&response),
            ResponseOutcome::Deliver | ResponseOutcome::DeliverAndAck => {
                if outcome == ResponseOutcome::DeliverAndAck {
                    self.send_non2xx_ack(&key, &response);
                }
                let dialog = self.dialog_on_response_received(&key, &response);
                self.deliver_response(&key, dialog, response);
                self.finish_if_terminated(&key);
            }
        }
    }

    fn send_non2xx_ack(&mut self, key: &TransactionKey, response: &SipResponse) {
        let Some(txn) = self.transactions.get(key) else {
            return;
        };
        let Some(channel) = txn.channel.clone() else {
            return;
        };
        match build_non2xx_ack(&txn.request, response) {
            Ok(ack) => {
                if let Err(e) = self.pool.send(&channel, &ack.into()) {
                    warn!("Cannot send ACK on {}: {}", key, e);
                }
            }
            Err(e) => warn!("Cannot build ACK on {}: {}", key, e),
        }
    }

    fn deliver_response(
        &mut self,
        key: &TransactionKey,
        dialog: Option<DialogId>,
        response: SipResponse,
    ) {
        let Some(owner) = self.transactions.get(key).map(|t| t.owner) else {
            return;
        };
        match owner {
            TransactionOwner::Application => {
                let challenges = if matches!(response.status_code(), 401 | 407) {
                    AuthChallenge::from_response(&response)
                } else {
                    Vec::new()
                };
                self.emit(SipEvent::Response {
                    transaction: key.clone(),
                    dialog,
                    response,
                });
                if !challenges.is_empty() {
                    self.emit(SipEvent::AuthRequested {
                        transaction: key.clone(),
                        challenges,
                    });
                }
            }
            TransactionOwner::Refresher(id) => self.refresher_on_response(id, key, &response),
        }
    }

    fn handle_request(&mut self, channel: ChannelKey, request: SipRequest) {
        let Some(method) = request.method() else {
            debug!("Dropping request with unsupported method from {}", channel);
            return;
        };
        let Some(branch) = request.branch() else {
            debug!("Dropping {} without Via branch from {}", method, channel);
            return;
        };

        if method == SipMethod::Ack {
            self.handle_ack(channel, branch, request);
            return;
        }

        let key = TransactionKey::new(branch, method);
        if self.transactions.contains_key(&key) {
            self.absorb_retransmitted_request(&key);
            return;
        }

        let dialog = match self.dialog_on_request(&request) {
            DialogMatch::Stale => return,
            DialogMatch::InDialog(id) => Some(id),
            DialogMatch::None => None,
        };
        let key = match self.insert_server_transaction(channel.clone(), request.clone()) {
            Ok(key) => key,
            Err(e) => {
                warn!("Cannot create server transaction for {}: {}", method, e);
                return;
            }
        };
        if let Some(txn) = self.transactions.get_mut(&key) {
            txn.dialog = dialog.clone();
        }
        self.emit(SipEvent::Request {
            transaction: Some(key),
            dialog,
            channel,
            request,
        });
    }

    fn handle_ack(&mut self, channel: ChannelKey, branch: BranchId, request: SipRequest) {
        let key = TransactionKey::for_incoming(branch, SipMethod::Ack);
        if let Some(txn) = self.transactions.get_mut(&key) {
            if !txn.is_client() && txn.process_ack(&mut self.timers) {
                debug!("ACK absorbed by transaction {}", key);
                self.finish_if_terminated(&key);
                return;
            }
        }
        // end-to-end ACK for a 2xx
        let dialog = match self.dialog_on_request(&request) {
            DialogMatch::Stale => return,
            DialogMatch::InDialog(id) => Some(id),
            DialogMatch::None => None,
        };
        if let Some(id) = &dialog {
            self.dialog_on_ack(id, request.cseq_number());
        }
        self.emit(SipEvent::Request {
            transaction: None,
            dialog,
            channel,
            request,
        });
    }

    /// A request matching an existing server transaction: replay the last
    /// response, never hand it to the application again
    fn absorb_retransmitted_request(&mut self, key: &TransactionKey) {
        let Some(txn) = self.transactions.get(key) else {
            return;
        };
        let (Some(response), Some(channel)) =
            (txn.response_for_retransmission().cloned(), txn.channel.clone())
        else {
            debug!("Absorbed retransmitted request on {}", key);
            return;
        };
        debug!("Replaying {} for retransmitted request on {}", response.status_code(), key);
        metrics::retransmission("response");
        if let Err(e) = self.pool.send(&channel, &response.into()) {
            self.fail_transaction(key, &e.to_string());
        }
    }

    /// Create the server transaction of a received request. A request whose
    /// branch is already known returns the existing transaction and replays
    /// its last response.
    pub fn create_server_transaction(
        &mut self,
        channel: ChannelKey,
        request: SipRequest,
    ) -> Result<TransactionKey, SipError> {
        let method = request
            .method()
            .ok_or_else(|| SipError::ProtocolViolation("Unknown request method".to_string()))?;
        let branch = request
            .branch()
            .ok_or_else(|| SipError::ProtocolViolation("Request without branch".to_string()))?;
        let key = TransactionKey::new(branch, method);
        if self.transactions.contains_key(&key) {
            self.absorb_retransmitted_request(&key);
            return Ok(key);
        }
        self.insert_server_transaction(channel, request)
    }

    fn insert_server_transaction(
        &mut self,
        channel: ChannelKey,
        request: SipRequest,
    ) -> Result<TransactionKey, SipError> {
        let method = request
            .method()
            .ok_or_else(|| SipError::ProtocolViolation("Unknown request method".to_string()))?;
        if method == SipMethod::Ack {
            return Err(SipError::InvalidState(
                "ACK has no server transaction".to_string(),
            ));
        }
        let branch = request
            .branch()
            .ok_or_else(|| SipError::ProtocolViolation("Request without branch".to_string()))?;
        let key = TransactionKey::new(branch, method);

        self.pool.acquire(&channel)?;
        let reliable = self.pool.is_reliable(&channel);
        let local_tag = request
            .to_tag()
            .unwrap_or_else(generate_tag);
        let mut txn = Transaction::new_server(key.clone(), request, channel, reliable, self.sip_timers);
        txn.local_tag = Some(local_tag);
        debug!("Created server transaction {}", key);
        self.transactions.insert(key.clone(), txn);
        metrics::transaction_created(TransactionRole::Server, method);
        metrics::transactions_active(self.transactions.len());
        Ok(key)
    }

    /// Send a response on a server transaction, over the channel the
    /// request arrived on
    pub fn send_response(
        &mut self,
        key: &TransactionKey,
        mut response: SipResponse,
    ) -> Result<(), SipError> {
        let txn = self.transactions.get_mut(key).ok_or_else(|| not_found(key))?;
        if txn.is_client() {
            return Err(SipError::InvalidState(format!("{} is a client transaction", key)));
        }
        if response.status_code() > 100 && response.to_tag().is_none() {
            if let (Some(tag), Some(to)) = (&txn.local_tag, response.header_value("To")) {
                response.set_header("To", with_header_param(&to, "tag", tag));
            }
        }
        let channel = txn
            .channel
            .clone()
            .ok_or_else(|| SipError::ChannelUnavailable(key.to_string()))?;
        txn.send_response(response.clone(), &mut self.timers)?;

        if let Err(e) = self.pool.send(&channel, &response.clone().into()) {
            self.fail_transaction(key, &e.to_string());
            return Ok(());
        }
        self.dialog_on_response_sent(key, &response);
        self.finish_if_terminated(key);
        Ok(())
    }

    // --- transaction bookkeeping -----------------------------------------

    pub fn transaction(&self, key: &TransactionKey) -> Option<&Transaction> {
        self.transactions.get(key)
    }

    pub fn transaction_state(&self, key: &TransactionKey) -> Option<TransactionState> {
        self.transactions.get(key).map(|t| t.state)
    }

    pub fn set_application_data(
        &mut self,
        key: &TransactionKey,
        data: Box<dyn Any + Send>,
    ) -> Result<(), SipError> {
        let txn = self.transactions.get_mut(key).ok_or_else(|| not_found(key))?;
        txn.app_data = Some(data);
        Ok(())
    }

    pub fn application_data(&self, key: &TransactionKey) -> Option<&(dyn Any + Send)> {
        self.transactions.get(key).and_then(|t| t.app_data.as_deref())
    }

    /// Force a transaction to Terminated. Idempotent.
    pub fn terminate_transaction(&mut self, key: &TransactionKey) -> Result<(), SipError> {
        let txn = self.transactions.get_mut(key).ok_or_else(|| not_found(key))?;
        txn.terminate(&mut self.timers);
        self.finish_if_terminated(key);
        Ok(())
    }

    /// Release the channel, arm the reap timer and notify, exactly once
    pub(crate) fn finish_if_terminated(&mut self, key: &TransactionKey) {
        let Some(txn) = self.transactions.get_mut(key) else {
            return;
        };
        if !txn.state.is_terminated() || txn.terminated_notified {
            return;
        }
        txn.terminated_notified = true;
        let owner = txn.owner;
        if let Some(channel) = txn.take_channel() {
            self.pool.release(&channel);
        }
        self.timers.schedule(
            Instant::now() + self.config.timers.linger(),
            TimerTarget::ReapTransaction(key.clone()),
        );
        if owner == TransactionOwner::Application {
            self.emit(SipEvent::TransactionTerminated {
                transaction: key.clone(),
            });
        }
    }

    /// Terminate a transaction after a transport failure
    fn fail_transaction(&mut self, key: &TransactionKey, reason: &str) {
        let Some(txn) = self.transactions.get_mut(key) else {
            return;
        };
        if txn.state.is_terminated() {
            return;
        }
        let channel = txn.channel.clone();
        let had_outcome = txn.state.has_outcome();
        txn.terminate(&mut self.timers);
        if !had_outcome {
            if let Some(channel) = channel {
                self.raise_io_error(key, channel, reason);
            }
        }
        self.finish_if_terminated(key);
    }

    /// Report a transport failure to whoever owns the transaction
    fn raise_io_error(&mut self, key: &TransactionKey, channel: ChannelKey, reason: &str) {
        metrics::io_error();
        warn!("I/O error on transaction {} over {}: {}", key, channel, reason);
        let Some(txn) = self.transactions.get(key) else {
            return;
        };
        let owner = txn.owner;
        let dialog = txn.dialog.clone();
        let method = txn.method();

        match owner {
            TransactionOwner::Application => self.emit(SipEvent::IoError {
                transaction: Some(key.clone()),
                channel,
                reason: reason.to_string(),
            }),
            TransactionOwner::Refresher(id) => self.refresher_on_io_error(id, key),
        }

        if method == SipMethod::Bye {
            if let Some(dialog) = dialog {
                self.terminate_dialog_internal(&dialog);
            }
        }
        self.terminate_dialogs_created_by(key, true);
    }

    fn on_transaction_timeout(&mut self, key: &TransactionKey) {
        metrics::transaction_timeout();
        let Some(txn) = self.transactions.get(key) else {
            return;
        };
        info!("Transaction {} timed out", key);
        let owner = txn.owner;
        let dialog = txn.dialog.clone();
        let method = txn.method();

        match owner {
            TransactionOwner::Application => self.emit(SipEvent::Timeout {
                transaction: key.clone(),
            }),
            TransactionOwner::Refresher(id) => self.refresher_on_timeout(id, key),
        }

        // a timeout counts as 408 for the dialog
        if let Some(dialog) = dialog {
            if txn_ends_dialog_on_timeout(method) {
                self.terminate_dialog_internal(&dialog);
            }
        }
        self.terminate_dialogs_created_by(key, true);
    }

    // --- timers ----------------------------------------------------------

    pub fn next_timer_deadline(&mut self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Fire every timer due now
    pub fn poll_timers(&mut self) {
        let now = Instant::now();
        while let Some((handle, target)) = self.timers.pop_due(now) {
            self.on_timer(handle, target);
        }
    }

    fn on_timer(&mut self, handle: TimerHandle, target: TimerTarget) {
        match target {
            TimerTarget::Transaction(key, timer_type) => {
                let Some(txn) = self.transactions.get_mut(&key) else {
                    return;
                };
                if !txn.owns_timer(handle) {
                    debug!("Stale {:?} for {}", timer_type, key);
                    return;
                }
                match txn.handle_timer_fired(timer_type, &mut self.timers) {
                    TransactionTimerAction::None => {}
                    TransactionTimerAction::RetransmitRequest => {
                        let message = SipMessage::Request(txn.request.clone());
                        self.retransmit(&key, message, "request");
                    }
                    TransactionTimerAction::RetransmitResponse => {
                        if let Some(response) = txn.last_response.clone() {
                            self.retransmit(&key, response.into(), "response");
                        }
                    }
                    TransactionTimerAction::Timeout => {
                        self.on_transaction_timeout(&key);
                        self.finish_if_terminated(&key);
                    }
                    TransactionTimerAction::Terminate => self.finish_if_terminated(&key),
                }
            }
            TimerTarget::ReapTransaction(key) => {
                if self
                    .transactions
                    .get(&key)
                    .is_some_and(|t| t.state.is_terminated())
                {
                    debug!("Reaping transaction {}", key);
                    self.transactions.remove(&key);
                    metrics::transactions_active(self.transactions.len());
                }
            }
            TimerTarget::Dialog2xxRetransmit(id) => self.on_dialog_2xx_retransmit(&id, handle),
            TimerTarget::Dialog2xxTimeout(id) => self.on_dialog_2xx_timeout(&id, handle),
            TimerTarget::ForgetDialog(id) => self.forget_dialog(&id),
            TimerTarget::Refresher(id, purpose) => self.refresher_on_timer(id, purpose, handle),
        }
    }

    fn retransmit(&mut self, key: &TransactionKey, message: SipMessage, kind: &'static str) {
        let Some(channel) = self.transactions.get(key).and_then(|t| t.channel.clone()) else {
            return;
        };
        debug!("Retransmitting {} on {}", kind, key);
        metrics::retransmission(kind);
        if let Err(e) = self.pool.send(&channel, &message) {
            self.fail_transaction(key, &e.to_string());
        }
    }

    // --- channels and resolution -----------------------------------------

    /// Resolutions the driver has to run
    pub fn take_resolve_requests(&mut self) -> Vec<ResolveRequest> {
        self.pool.take_resolve_requests()
    }

    /// Completion of a resolution; stale tokens are ignored
    pub fn on_resolved(&mut self, token: ResolveToken, result: Result<Vec<SocketAddr>, SipError>) {
        let Some((channel, outcome)) = self.pool.on_resolved(token, result) else {
            return;
        };
        let waiting: Vec<TransactionKey> = self
            .transactions
            .values()
            .filter(|t| t.channel.as_ref() == Some(&channel))
            .map(|t| t.key.clone())
            .collect();

        match outcome {
            Ok(()) => {
                for key in waiting {
                    if self.transactions.get(&key).is_some_and(|t| t.send_pending) {
                        self.transmit_request(&key);
                    }
                }
                let acks: Vec<DialogId> = self
                    .dialogs
                    .values()
                    .filter(|d| d.ack_channel.as_ref() == Some(&channel))
                    .map(|d| d.id.clone())
                    .collect();
                for id in acks {
                    self.send_dialog_ack(&id);
                }
            }
            Err(e) => {
                for key in waiting {
                    // the pool entry is gone, nothing to release
                    if let Some(txn) = self.transactions.get_mut(&key) {
                        txn.take_channel();
                    }
                    self.raise_and_terminate(&key, channel.clone(), &e.to_string());
                }
                self.detach_dialogs_from(&channel);
            }
        }
    }

    fn raise_and_terminate(&mut self, key: &TransactionKey, channel: ChannelKey, reason: &str) {
        let Some(txn) = self.transactions.get_mut(key) else {
            return;
        };
        if txn.state.is_terminated() {
            return;
        }
        let had_outcome = txn.state.has_outcome();
        txn.terminate(&mut self.timers);
        if !had_outcome {
            self.raise_io_error(key, channel, reason);
        }
        self.finish_if_terminated(key);
    }

    /// The channel is unusable: every transaction bound to it without an
    /// outcome gets an io-error, all of them terminate and the channel is
    /// discarded
    pub fn on_channel_error(&mut self, channel: ChannelKey, reason: &str) {
        warn!("Channel {} error: {}", channel, reason);
        let bound: Vec<TransactionKey> = self
            .transactions
            .values()
            .filter(|t| t.channel.as_ref() == Some(&channel))
            .map(|t| t.key.clone())
            .collect();
        for key in bound {
            if let Some(txn) = self.transactions.get_mut(&key) {
                txn.take_channel();
            }
            self.raise_and_terminate(&key, channel.clone(), reason);
        }
        self.detach_dialogs_from(&channel);
        self.pool.fail(&channel);
    }

    /// The peer closed the association; it is rebuilt on the next send
    pub fn on_channel_disconnected(&mut self, channel: ChannelKey) {
        self.pool.mark_disconnected(&channel);
    }

    pub fn channel_refs(&self, channel: &ChannelKey) -> usize {
        self.pool.refs(channel)
    }
}

fn txn_ends_dialog_on_timeout(method: SipMethod) -> bool {
    !matches!(method, SipMethod::Prack | SipMethod::Cancel)
}
