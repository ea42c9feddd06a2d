//! SIP Dialog Layer (RFC 3261 Section 12)
//!
//! A dialog is the peer-to-peer relationship created by an INVITE or
//! SUBSCRIBE. It keeps the CSeq counters, the targets and the route set used
//! for every request sent inside it. Dialogs live in the provider's table
//! keyed by [`DialogId`]; transactions refer to them by id only.

use super::message::{addr_uri, with_header_param, SipHeaders, SipRequest, SipResponse};
use super::metrics;
use super::provider::Provider;
use super::timer::{TimerHandle, TimerTarget};
use crate::domain::shared::error::SipError;
use crate::domain::shared::value_objects::{
    BranchId, ChannelKey, DialogId, SipMethod, TransactionKey,
};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Dialog states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Null,
    Early,
    Confirmed,
    Terminated,
}

/// 2xx to INVITE kept on the wire by the UAS until the ACK arrives
#[derive(Debug)]
pub(crate) struct Pending2xx {
    response: SipResponse,
    cseq: u32,
    channel: Option<ChannelKey>,
    interval: Duration,
    retransmit: Option<TimerHandle>,
    timeout: TimerHandle,
}

/// Result of checking an incoming request against the dialog table
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DialogMatch {
    None,
    InDialog(DialogId),
    /// Duplicate or out of order CSeq
    Stale,
}

#[derive(Debug)]
pub struct Dialog {
    pub id: DialogId,
    pub state: DialogState,
    pub is_server: bool,
    /// Method of the request that created the dialog
    pub method: SipMethod,
    pub local_cseq: u32,
    pub remote_cseq: Option<u32>,
    pub local_uri: String,
    pub remote_uri: String,
    pub local_target: String,
    pub remote_target: String,
    pub route_set: Vec<String>,
    pub route_set_frozen: bool,
    pub secure: bool,
    pub creating_transaction: Option<TransactionKey>,
    /// CSeq of the INVITE whose 2xx still needs (or got) an ACK
    pub(crate) invite_cseq: Option<u32>,
    pub(crate) last_ack: Option<SipRequest>,
    pub(crate) ack_channel: Option<ChannelKey>,
    pub(crate) pending_2xx: Option<Pending2xx>,
}

fn missing(name: &str) -> SipError {
    SipError::ProtocolViolation(format!("Missing {} for dialog", name))
}

impl Dialog {
    /// Dialog seen from the UAC, built from the request and a response
    /// carrying a To tag
    pub fn from_client(
        request: &SipRequest,
        response: &SipResponse,
        creating: Option<TransactionKey>,
    ) -> Result<Self, SipError> {
        let call_id = request.call_id().ok_or_else(|| missing("Call-ID"))?;
        let local_tag = request.from_tag().ok_or_else(|| missing("From tag"))?;
        let remote_tag = response.to_tag().ok_or_else(|| missing("To tag"))?;
        let (local_cseq, method) = request.cseq().ok_or_else(|| missing("CSeq"))?;
        let local_uri = addr_uri(&request.header_value("From").ok_or_else(|| missing("From"))?);
        let remote_uri = addr_uri(&request.header_value("To").ok_or_else(|| missing("To"))?);
        let request_uri = request.uri_string();

        let mut route_set = response.record_routes();
        route_set.reverse();

        Ok(Self {
            id: DialogId::new(call_id, local_tag, remote_tag),
            state: DialogState::Null,
            is_server: false,
            method,
            local_cseq,
            remote_cseq: None,
            local_target: request.contact_uri().unwrap_or_else(|| local_uri.clone()),
            remote_target: response.contact_uri().unwrap_or_else(|| request_uri.clone()),
            local_uri,
            remote_uri,
            route_set,
            route_set_frozen: false,
            secure: request_uri.starts_with("sips:"),
            creating_transaction: creating,
            invite_cseq: None,
            last_ack: None,
            ack_channel: None,
            pending_2xx: None,
        })
    }

    /// Dialog seen from the UAS. The route set is fixed by the request.
    pub fn from_server(
        request: &SipRequest,
        response: &SipResponse,
        creating: Option<TransactionKey>,
    ) -> Result<Self, SipError> {
        let call_id = request.call_id().ok_or_else(|| missing("Call-ID"))?;
        let local_tag = response.to_tag().ok_or_else(|| missing("To tag"))?;
        let remote_tag = request.from_tag().ok_or_else(|| missing("From tag"))?;
        let (remote_cseq, method) = request.cseq().ok_or_else(|| missing("CSeq"))?;
        let local_uri = addr_uri(&request.header_value("To").ok_or_else(|| missing("To"))?);
        let remote_uri = addr_uri(&request.header_value("From").ok_or_else(|| missing("From"))?);
        let request_uri = request.uri_string();

        Ok(Self {
            id: DialogId::new(call_id, local_tag, remote_tag),
            state: DialogState::Null,
            is_server: true,
            method,
            local_cseq: 0,
            remote_cseq: Some(remote_cseq),
            local_target: response.contact_uri().unwrap_or_else(|| request_uri.clone()),
            remote_target: request.contact_uri().unwrap_or_else(|| remote_uri.clone()),
            local_uri,
            remote_uri,
            route_set: request.record_routes(),
            route_set_frozen: true,
            secure: request_uri.starts_with("sips:"),
            creating_transaction: creating,
            invite_cseq: None,
            last_ack: None,
            ack_channel: None,
            pending_2xx: None,
        })
    }

    pub fn is_terminated(&self) -> bool {
        self.state == DialogState::Terminated
    }

    fn set_state(&mut self, state: DialogState) {
        if self.state != state {
            info!("Dialog {} state: {:?} -> {:?}", self.id, self.state, state);
            self.state = state;
        }
    }

    fn is_establishing(&self) -> bool {
        matches!(self.state, DialogState::Null | DialogState::Early)
    }

    fn refresh_route_set(&mut self, response: &SipResponse, freeze: bool) {
        if self.route_set_frozen {
            return;
        }
        let mut routes = response.record_routes();
        routes.reverse();
        self.route_set = routes;
        if freeze {
            debug!("Dialog {} route set frozen: {:?}", self.id, self.route_set);
            self.route_set_frozen = true;
        }
    }

    /// Apply a response received for one of our requests. Returns true when
    /// the dialog has to be terminated.
    pub fn on_response_received(
        &mut self,
        method: SipMethod,
        cseq: u32,
        response: &SipResponse,
        is_creating: bool,
    ) -> bool {
        if method == SipMethod::Prack {
            return false;
        }
        let status = response.status_code();

        if is_creating && self.is_establishing() {
            match status {
                101..=199 => {
                    if self.method.allows_early_dialog() {
                        self.set_state(DialogState::Early);
                    }
                    if let Some(target) = response.contact_uri() {
                        self.remote_target = target;
                    }
                    let reliable = response.requires_100rel() && !response.record_routes().is_empty();
                    self.refresh_route_set(response, reliable);
                }
                200..=299 => {
                    self.set_state(DialogState::Confirmed);
                    if let Some(target) = response.contact_uri() {
                        self.remote_target = target;
                    }
                    self.refresh_route_set(response, true);
                    if method == SipMethod::Invite {
                        self.invite_cseq = Some(cseq);
                    }
                }
                _ => return status >= 300,
            }
            return false;
        }

        match status {
            200..=299 => {
                if method.is_target_refresh() {
                    if let Some(target) = response.contact_uri() {
                        debug!("Dialog {} remote target refreshed to {}", self.id, target);
                        self.remote_target = target;
                    }
                }
                if method == SipMethod::Invite {
                    self.invite_cseq = Some(cseq);
                }
                method == SipMethod::Bye
            }
            481 | 408 => true,
            _ => method == SipMethod::Bye && status >= 200,
        }
    }

    /// Apply a response we sent on a server transaction. Returns true when
    /// the dialog has to be terminated.
    pub fn on_response_sent(
        &mut self,
        method: SipMethod,
        response: &SipResponse,
        is_creating: bool,
    ) -> bool {
        if method == SipMethod::Prack {
            return false;
        }
        let status = response.status_code();
        if is_creating && self.is_establishing() {
            match status {
                101..=199 => {
                    if self.method.allows_early_dialog() {
                        self.set_state(DialogState::Early);
                    }
                }
                200..=299 => {
                    self.set_state(DialogState::Confirmed);
                    if let Some(target) = response.contact_uri() {
                        self.local_target = target;
                    }
                }
                _ => return status >= 300,
            }
            return false;
        }
        method == SipMethod::Bye && status >= 200
    }

    /// Ordering check for a request received inside the dialog
    pub fn accept_remote_cseq(&mut self, method: SipMethod, cseq: u32) -> bool {
        if matches!(method, SipMethod::Ack | SipMethod::Cancel | SipMethod::Prack) {
            return true;
        }
        if let Some(remote) = self.remote_cseq {
            if cseq <= remote {
                return false;
            }
        }
        self.remote_cseq = Some(cseq);
        true
    }

    /// Request headers shared by in-dialog requests and the 2xx ACK
    fn request_skeleton(&self, method: SipMethod, cseq: u32) -> Result<SipRequest, SipError> {
        let mut request = SipRequest::build(method, &self.remote_target)?;
        for route in &self.route_set {
            request.push_header("Route", route.clone());
        }
        request.push_header("Max-Forwards", "70");
        request.push_header(
            "From",
            with_header_param(&format!("<{}>", self.local_uri), "tag", &self.id.local_tag),
        );
        request.push_header(
            "To",
            with_header_param(&format!("<{}>", self.remote_uri), "tag", &self.id.remote_tag),
        );
        request.push_header("Call-ID", self.id.call_id.clone());
        request.push_header("CSeq", format!("{} {}", cseq, method));
        Ok(request)
    }

    /// Next in-dialog request, loose routing only
    pub fn create_request(&mut self, method: SipMethod) -> Result<SipRequest, SipError> {
        if matches!(method, SipMethod::Ack | SipMethod::Cancel) {
            return Err(SipError::InvalidState(format!(
                "{} is not created through the dialog",
                method
            )));
        }
        match self.state {
            DialogState::Terminated => return Err(SipError::DialogTerminated(self.id.to_string())),
            DialogState::Null => {
                return Err(SipError::InvalidState(format!(
                    "Dialog {} is not established",
                    self.id
                )))
            }
            DialogState::Early | DialogState::Confirmed => {}
        }
        if let Some(first) = self.route_set.first() {
            if !first.contains(";lr") {
                warn!("Dialog {} uses a strict router, sending loose", self.id);
            }
        }

        self.local_cseq += 1;
        let mut request = self.request_skeleton(method, self.local_cseq)?;
        if method.is_target_refresh() {
            request.push_header("Contact", format!("<{}>", self.local_target));
        }
        request.push_header("Content-Length", "0");
        Ok(request)
    }

    /// ACK for the 2xx of the INVITE sent with `cseq`
    pub fn create_ack(&mut self, cseq: u32) -> Result<SipRequest, SipError> {
        if self.is_terminated() {
            return Err(SipError::DialogTerminated(self.id.to_string()));
        }
        if self.state != DialogState::Confirmed || self.invite_cseq != Some(cseq) {
            return Err(SipError::InvalidState(format!(
                "No 2xx INVITE with CSeq {} in dialog {}",
                cseq, self.id
            )));
        }
        let mut ack = self.request_skeleton(SipMethod::Ack, cseq)?;
        ack.push_header("Content-Length", "0");
        Ok(ack)
    }
}

impl Provider {
    pub(crate) fn dialog_ref(&self, id: &DialogId) -> Result<&Dialog, SipError> {
        if self.dialog_tombstones.contains(id) {
            return Err(SipError::DialogTerminated(id.to_string()));
        }
        self.dialogs
            .get(id)
            .ok_or_else(|| SipError::NotFound(format!("Dialog {}", id)))
    }

    pub(crate) fn dialog_mut(&mut self, id: &DialogId) -> Result<&mut Dialog, SipError> {
        if self.dialog_tombstones.contains(id) {
            return Err(SipError::DialogTerminated(id.to_string()));
        }
        self.dialogs
            .get_mut(id)
            .ok_or_else(|| SipError::NotFound(format!("Dialog {}", id)))
    }

    fn insert_dialog(&mut self, dialog: Dialog) -> DialogId {
        let id = dialog.id.clone();
        if self.dialogs.contains_key(&id) {
            return id;
        }
        info!("Created dialog {} ({})", id, if dialog.is_server { "UAS" } else { "UAC" });
        self.dialogs.insert(id.clone(), dialog);
        metrics::dialogs_active(self.dialogs.len());
        id
    }

    /// Create (or find) the dialog of a transaction that has a response
    /// carrying both tags
    pub fn create_dialog(&mut self, key: &TransactionKey) -> Result<DialogId, SipError> {
        let txn = self
            .transactions
            .get(key)
            .ok_or_else(|| SipError::NotFound(format!("Transaction {}", key)))?;
        let response = txn
            .last_response
            .as_ref()
            .ok_or_else(|| SipError::InvalidState(format!("Transaction {} has no response", key)))?;

        let dialog = if txn.is_client() {
            Dialog::from_client(&txn.request, response, Some(key.clone()))?
        } else {
            let mut response = response.clone();
            if response.to_tag().is_none() {
                if let (Some(tag), Some(to)) = (&txn.local_tag, response.header_value("To")) {
                    response.set_header("To", with_header_param(&to, "tag", tag));
                }
            }
            Dialog::from_server(&txn.request, &response, Some(key.clone()))?
        };
        if self.dialog_tombstones.contains(&dialog.id) {
            return Err(SipError::DialogTerminated(dialog.id.to_string()));
        }
        let id = self.insert_dialog(dialog);
        if let Some(txn) = self.transactions.get_mut(key) {
            txn.dialog = Some(id.clone());
        }
        Ok(id)
    }

    /// Dialog an in-dialog message belongs to. Call-ID and both tags must
    /// match; a bare Call-ID match is not enough.
    pub fn lookup_dialog(&self, message: &impl SipHeaders) -> Option<DialogId> {
        let call_id = message.call_id()?;
        let from_tag = message.from_tag()?;
        let to_tag = message.to_tag()?;
        [
            DialogId::new(call_id.clone(), from_tag.clone(), to_tag.clone()),
            DialogId::new(call_id, to_tag, from_tag),
        ]
        .into_iter()
        .find(|id| self.dialogs.contains_key(id))
    }

    pub fn dialog(&self, id: &DialogId) -> Option<&Dialog> {
        self.dialogs.get(id)
    }

    pub fn dialog_state(&self, id: &DialogId) -> Result<DialogState, SipError> {
        if self.dialog_tombstones.contains(id) {
            return Ok(DialogState::Terminated);
        }
        self.dialog_ref(id).map(|d| d.state)
    }

    /// Build the next request inside a dialog
    pub fn create_request(
        &mut self,
        id: &DialogId,
        method: SipMethod,
    ) -> Result<SipRequest, SipError> {
        self.dialog_mut(id)?.create_request(method)
    }

    /// Build the ACK for a 2xx to INVITE. The ACK is remembered so that a
    /// retransmitted 2xx is answered again.
    pub fn create_ack(&mut self, id: &DialogId, cseq: u32) -> Result<SipRequest, SipError> {
        let sent_by = self.config.sip.sent_by();
        let dialog = self.dialog_mut(id)?;
        let mut ack = dialog.create_ack(cseq)?;
        let hop = ack.next_hop()?;
        ack.set_branch(&BranchId::generate(), &sent_by, hop.transport);
        dialog.last_ack = Some(ack.clone());
        Ok(ack)
    }

    /// Send a 2xx ACK directly on a channel; it has no transaction
    pub fn send_ack(&mut self, id: &DialogId, ack: SipRequest) -> Result<(), SipError> {
        let hop = ack.next_hop()?;
        let current = self.dialog_ref(id)?.ack_channel.clone();
        if current.as_ref() != Some(&hop) {
            self.pool.acquire(&hop)?;
            if let Some(previous) = current {
                self.pool.release(&previous);
            }
        }
        let dialog = self.dialog_mut(id)?;
        dialog.ack_channel = Some(hop.clone());
        dialog.last_ack = Some(ack);
        if !self.pool.is_ready(&hop) {
            debug!("ACK for dialog {} waits for channel {}", id, hop);
            return Ok(());
        }
        self.send_dialog_ack(id);
        Ok(())
    }

    /// Put the remembered ACK on the wire
    pub(crate) fn send_dialog_ack(&mut self, id: &DialogId) {
        let Some(dialog) = self.dialogs.get(id) else {
            return;
        };
        let (Some(ack), Some(channel)) = (dialog.last_ack.clone(), dialog.ack_channel.clone())
        else {
            return;
        };
        if let Err(e) = self.pool.send(&channel, &ack.into()) {
            metrics::io_error();
            warn!("Cannot send ACK for dialog {}: {}", id, e);
            self.emit(super::event::SipEvent::IoError {
                transaction: None,
                channel,
                reason: e.to_string(),
            });
        }
    }

    /// Terminate a dialog. Idempotent.
    pub fn terminate_dialog(&mut self, id: &DialogId) -> Result<(), SipError> {
        if self.dialog_tombstones.contains(id) {
            return Ok(());
        }
        if !self.dialogs.contains_key(id) {
            return Err(SipError::NotFound(format!("Dialog {}", id)));
        }
        self.terminate_dialog_internal(id);
        Ok(())
    }

    pub(crate) fn terminate_dialog_internal(&mut self, id: &DialogId) {
        let Some(mut dialog) = self.dialogs.remove(id) else {
            return;
        };
        dialog.set_state(DialogState::Terminated);
        if let Some(pending) = dialog.pending_2xx.take() {
            self.stop_2xx_retransmission(pending);
        }
        if let Some(channel) = dialog.ack_channel.take() {
            self.pool.release(&channel);
        }
        self.dialog_tombstones.insert(id.clone());
        self.timers.schedule(
            Instant::now() + self.config.timers.linger(),
            TimerTarget::ForgetDialog(id.clone()),
        );
        metrics::dialog_terminated();
        metrics::dialogs_active(self.dialogs.len());
        info!("Dialog {} terminated", id);
        self.emit(super::event::SipEvent::DialogTerminated { dialog: id.clone() });
    }

    /// Forget every dialog reference to a channel the pool discarded. The
    /// pool entry is gone, so nothing is released.
    pub(crate) fn detach_dialogs_from(&mut self, channel: &ChannelKey) {
        for dialog in self.dialogs.values_mut() {
            if dialog.ack_channel.as_ref() == Some(channel) {
                dialog.ack_channel = None;
            }
            if let Some(pending) = dialog.pending_2xx.as_mut() {
                if pending.channel.as_ref() == Some(channel) {
                    debug!("Dialog {} stops retransmitting 2xx on {}", dialog.id, channel);
                    pending.channel = None;
                }
            }
        }
    }

    fn stop_2xx_retransmission(&mut self, pending: Pending2xx) {
        if let Some(handle) = pending.retransmit {
            self.timers.cancel(handle);
        }
        self.timers.cancel(pending.timeout);
        if let Some(channel) = pending.channel {
            self.pool.release(&channel);
        }
    }

    /// Early dialogs that were waiting on a creating transaction which failed
    pub(crate) fn terminate_dialogs_created_by(&mut self, key: &TransactionKey, only_early: bool) {
        let ids: Vec<DialogId> = self
            .dialogs
            .values()
            .filter(|d| d.creating_transaction.as_ref() == Some(key))
            .filter(|d| !only_early || d.is_establishing())
            .map(|d| d.id.clone())
            .collect();
        for id in ids {
            self.terminate_dialog_internal(&id);
        }
    }

    /// Dialog of a request we are about to send
    pub(crate) fn dialog_for_outgoing(&self, request: &SipRequest) -> Option<DialogId> {
        let id = DialogId::new(request.call_id()?, request.from_tag()?, request.to_tag()?);
        self.dialogs.contains_key(&id).then_some(id)
    }

    /// Dialog side effects of a response received on a client transaction
    pub(crate) fn dialog_on_response_received(
        &mut self,
        key: &TransactionKey,
        response: &SipResponse,
    ) -> Option<DialogId> {
        let txn = self.transactions.get(key)?;
        let method = txn.method();
        let status = response.status_code();
        let cseq = txn.cseq_number().unwrap_or_default();
        let txn_dialog = txn.dialog.clone();

        let id = match (response.call_id(), response.from_tag(), response.to_tag()) {
            (Some(call_id), Some(local), Some(remote)) => DialogId::new(call_id, local, remote),
            _ => {
                if status >= 300 && method.creates_dialog() {
                    self.terminate_dialogs_created_by(key, true);
                }
                return txn_dialog;
            }
        };

        if !self.dialogs.contains_key(&id) {
            // every fork answering with its own tag gets its own dialog
            let creates = method.creates_dialog()
                && (101..300).contains(&status)
                && !self.dialog_tombstones.contains(&id);
            if !creates {
                if status >= 300 && method.creates_dialog() {
                    self.terminate_dialogs_created_by(key, true);
                }
                return None;
            }
            let created = {
                let txn = self.transactions.get(key)?;
                Dialog::from_client(&txn.request, response, Some(key.clone()))
            };
            match created {
                Ok(dialog) => {
                    self.insert_dialog(dialog);
                }
                Err(e) => {
                    debug!("No dialog for response on {}: {}", key, e);
                    return None;
                }
            }
        }

        let dialog = self.dialogs.get_mut(&id)?;
        let is_creating = dialog.creating_transaction.as_ref() == Some(key);
        let terminate = dialog.on_response_received(method, cseq, response, is_creating);
        if let Some(txn) = self.transactions.get_mut(key) {
            if txn.dialog.is_none() {
                txn.dialog = Some(id.clone());
            }
        }
        if terminate {
            self.terminate_dialog_internal(&id);
        }
        Some(id)
    }

    /// Dialog side effects of a response sent on a server transaction
    pub(crate) fn dialog_on_response_sent(&mut self, key: &TransactionKey, response: &SipResponse) {
        let Some(txn) = self.transactions.get(key) else {
            return;
        };
        let method = txn.method();
        let status = response.status_code();

        let id = match txn.dialog.clone() {
            Some(id) => id,
            None => {
                let creates = method.creates_dialog()
                    && (101..300).contains(&status)
                    && response.to_tag().is_some()
                    && txn.request.from_tag().is_some();
                if !creates {
                    return;
                }
                match Dialog::from_server(&txn.request, response, Some(key.clone())) {
                    Ok(dialog) => {
                        if self.dialog_tombstones.contains(&dialog.id) {
                            return;
                        }
                        let id = self.insert_dialog(dialog);
                        if let Some(txn) = self.transactions.get_mut(key) {
                            txn.dialog = Some(id.clone());
                        }
                        id
                    }
                    Err(e) => {
                        debug!("No dialog for response on {}: {}", key, e);
                        return;
                    }
                }
            }
        };

        let Some(dialog) = self.dialogs.get_mut(&id) else {
            return;
        };
        let is_creating = dialog.creating_transaction.as_ref() == Some(key);
        let terminate = dialog.on_response_sent(method, response, is_creating);
        if terminate {
            self.terminate_dialog_internal(&id);
            return;
        }
        if method == SipMethod::Invite && response.is_success() {
            self.start_2xx_retransmission(&id, key, response);
        }
    }

    /// UAS keeps its 2xx to INVITE alive until the ACK arrives
    fn start_2xx_retransmission(&mut self, id: &DialogId, key: &TransactionKey, response: &SipResponse) {
        let Some(txn) = self.transactions.get(key) else {
            return;
        };
        let Some(channel) = txn.channel.clone() else {
            return;
        };
        let reliable = txn.is_reliable;
        let cseq = txn.cseq_number().unwrap_or_default();
        if self.pool.acquire(&channel).is_err() {
            return;
        }

        let now = Instant::now();
        let t1 = self.sip_timers.t1;
        let retransmit = (!reliable).then(|| {
            self.timers
                .schedule(now + t1, TimerTarget::Dialog2xxRetransmit(id.clone()))
        });
        let timeout = self
            .timers
            .schedule(now + t1 * 64, TimerTarget::Dialog2xxTimeout(id.clone()));

        let pending = Pending2xx {
            response: response.clone(),
            cseq,
            channel: Some(channel),
            interval: t1,
            retransmit,
            timeout,
        };
        if let Some(dialog) = self.dialogs.get_mut(id) {
            dialog.invite_cseq = Some(cseq);
            if let Some(previous) = dialog.pending_2xx.replace(pending) {
                self.stop_2xx_retransmission(previous);
            }
        } else {
            self.stop_2xx_retransmission(pending);
        }
    }

    /// A 2xx ACK reached the UAS
    pub(crate) fn dialog_on_ack(&mut self, id: &DialogId, cseq: Option<u32>) {
        let Some(dialog) = self.dialogs.get_mut(id) else {
            return;
        };
        let matches = dialog
            .pending_2xx
            .as_ref()
            .is_some_and(|p| cseq.map_or(true, |c| c == p.cseq));
        if matches {
            if let Some(pending) = dialog.pending_2xx.take() {
                debug!("ACK received for dialog {}", id);
                self.stop_2xx_retransmission(pending);
            }
        }
    }

    pub(crate) fn on_dialog_2xx_retransmit(&mut self, id: &DialogId, handle: TimerHandle) {
        let t2 = self.sip_timers.t2;
        let Some(dialog) = self.dialogs.get_mut(id) else {
            return;
        };
        let Some(pending) = dialog.pending_2xx.as_mut() else {
            return;
        };
        if pending.retransmit != Some(handle) {
            return;
        }
        let Some(channel) = pending.channel.clone() else {
            pending.retransmit = None;
            return;
        };
        pending.interval = std::cmp::min(pending.interval * 2, t2);
        pending.retransmit = Some(self.timers.schedule(
            Instant::now() + pending.interval,
            TimerTarget::Dialog2xxRetransmit(id.clone()),
        ));
        let response = pending.response.clone();
        debug!("Retransmitting 2xx for dialog {}", id);
        metrics::retransmission("response");
        if let Err(e) = self.pool.send(&channel, &response.into()) {
            warn!("Cannot retransmit 2xx for dialog {}: {}", id, e);
        }
    }

    pub(crate) fn on_dialog_2xx_timeout(&mut self, id: &DialogId, handle: TimerHandle) {
        let expired = self
            .dialogs
            .get(id)
            .and_then(|d| d.pending_2xx.as_ref())
            .is_some_and(|p| p.timeout == handle);
        if expired {
            warn!("No ACK for 2xx in dialog {}", id);
            self.terminate_dialog_internal(id);
        }
    }

    /// A retransmitted 2xx reached a terminated INVITE transaction
    pub(crate) fn dialog_on_late_2xx(&mut self, response: &SipResponse) {
        let Some(id) = self.lookup_dialog(response) else {
            debug!("Dropping 2xx retransmission without dialog");
            return;
        };
        let acked = self.dialogs.get(&id).is_some_and(|d| {
            d.last_ack
                .as_ref()
                .and_then(|ack| ack.cseq_number())
                .is_some_and(|cseq| Some(cseq) == response.cseq_number())
        });
        if acked {
            debug!("Re-sending ACK for retransmitted 2xx in dialog {}", id);
            self.send_dialog_ack(&id);
        } else {
            debug!("Absorbing 2xx retransmission for dialog {}", id);
        }
    }

    /// Match an incoming request against the dialog table and apply the
    /// remote CSeq ordering
    pub(crate) fn dialog_on_request(&mut self, request: &SipRequest) -> DialogMatch {
        let (Some(call_id), Some(local), Some(remote)) =
            (request.call_id(), request.to_tag(), request.from_tag())
        else {
            return DialogMatch::None;
        };
        let id = DialogId::new(call_id, local, remote);
        let Some(dialog) = self.dialogs.get_mut(&id) else {
            return DialogMatch::None;
        };
        let Some((cseq, method)) = request.cseq() else {
            return DialogMatch::Stale;
        };
        if !dialog.accept_remote_cseq(method, cseq) {
            debug!(
                "Dropping {} with stale CSeq {} in dialog {} (remote {:?})",
                method, cseq, id, dialog.remote_cseq
            );
            return DialogMatch::Stale;
        }
        if method.is_target_refresh() && method != SipMethod::Notify {
            if let Some(target) = request.contact_uri() {
                dialog.remote_target = target;
            }
        }
        DialogMatch::InDialog(id)
    }

    pub(crate) fn forget_dialog(&mut self, id: &DialogId) {
        self.dialog_tombstones.remove(id);
    }

    /// Next CSeq number of a dialog, for requests rebuilt outside `create_request`
    pub(crate) fn next_dialog_cseq(&mut self, id: &DialogId) -> Result<u32, SipError> {
        let dialog = self.dialog_mut(id)?;
        dialog.local_cseq += 1;
        Ok(dialog.local_cseq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invite() -> SipRequest {
        SipRequest::parse(
            b"INVITE sip:bob@biloxi.example.com SIP/2.0\r\n\
              Via: SIP/2.0/UDP pc33.atlanta.example.com;branch=z9hG4bKnashds8\r\n\
              Max-Forwards: 70\r\n\
              From: Alice <sip:alice@atlanta.example.com>;tag=9fxced76sl\r\n\
              To: Bob <sip:bob@biloxi.example.com>\r\n\
              Call-ID: 3848276298220188511@atlanta.example.com\r\n\
              CSeq: 1 INVITE\r\n\
              Contact: <sip:alice@pc33.atlanta.example.com>\r\n\
              Content-Length: 0\r\n\
              \r\n",
        )
        .unwrap()
    }

    fn response(status: u16, record_route: &[&str]) -> SipResponse {
        let mut text = format!(
            "SIP/2.0 {} Whatever\r\n\
             Via: SIP/2.0/UDP pc33.atlanta.example.com;branch=z9hG4bKnashds8\r\n\
             From: Alice <sip:alice@atlanta.example.com>;tag=9fxced76sl\r\n\
             To: Bob <sip:bob@biloxi.example.com>;tag=8321234356\r\n\
             Call-ID: 3848276298220188511@atlanta.example.com\r\n\
             CSeq: 1 INVITE\r\n\
             Contact: <sip:bob@192.0.2.4>\r\n",
            status
        );
        for rr in record_route {
            text.push_str(&format!("Record-Route: {}\r\n", rr));
        }
        text.push_str("Content-Length: 0\r\n\r\n");
        SipResponse::parse(text.as_bytes()).unwrap()
    }

    #[test]
    fn test_uac_dialog_reverses_record_route() {
        let ok = response(200, &["<sip:p2.example.com;lr>", "<sip:p1.example.com;lr>"]);
        let mut dialog = Dialog::from_client(&invite(), &ok, None).unwrap();
        assert_eq!(dialog.id.local_tag, "9fxced76sl");
        assert_eq!(dialog.id.remote_tag, "8321234356");

        dialog.on_response_received(SipMethod::Invite, 1, &ok, true);
        assert_eq!(dialog.state, DialogState::Confirmed);
        assert!(dialog.route_set_frozen);
        assert_eq!(
            dialog.route_set,
            vec!["<sip:p1.example.com;lr>", "<sip:p2.example.com;lr>"]
        );
        assert_eq!(dialog.remote_target, "sip:bob@192.0.2.4");
    }

    #[test]
    fn test_early_then_confirmed_and_route_freeze() {
        let ringing = response(180, &["<sip:p1.example.com;lr>"]);
        let mut dialog = Dialog::from_client(&invite(), &ringing, None).unwrap();
        dialog.on_response_received(SipMethod::Invite, 1, &ringing, true);
        assert_eq!(dialog.state, DialogState::Early);
        assert!(!dialog.route_set_frozen);

        let ok = response(200, &["<sip:p9.example.com;lr>"]);
        dialog.on_response_received(SipMethod::Invite, 1, &ok, true);
        assert_eq!(dialog.route_set, vec!["<sip:p9.example.com;lr>"]);

        // later Record-Route changes are ignored
        let reinvite_ok = response(200, &["<sip:other.example.com;lr>"]);
        dialog.on_response_received(SipMethod::Invite, 2, &reinvite_ok, false);
        assert_eq!(dialog.route_set, vec!["<sip:p9.example.com;lr>"]);
    }

    #[test]
    fn test_error_on_creating_request_terminates() {
        let ringing = response(180, &[]);
        let mut dialog = Dialog::from_client(&invite(), &ringing, None).unwrap();
        dialog.on_response_received(SipMethod::Invite, 1, &ringing, true);
        assert!(dialog.on_response_received(SipMethod::Invite, 1, &response(486, &[]), true));
    }

    #[test]
    fn test_prack_response_leaves_dialog_alone() {
        let ok = response(200, &[]);
        let mut dialog = Dialog::from_client(&invite(), &ok, None).unwrap();
        dialog.on_response_received(SipMethod::Invite, 1, &ok, true);
        let target = dialog.remote_target.clone();
        assert!(!dialog.on_response_received(SipMethod::Prack, 2, &response(481, &[]), false));
        assert_eq!(dialog.remote_target, target);
        assert_eq!(dialog.state, DialogState::Confirmed);
    }

    #[test]
    fn test_in_dialog_481_terminates() {
        let ok = response(200, &[]);
        let mut dialog = Dialog::from_client(&invite(), &ok, None).unwrap();
        dialog.on_response_received(SipMethod::Invite, 1, &ok, true);
        assert!(dialog.on_response_received(SipMethod::Info, 2, &response(481, &[]), false));
    }

    #[test]
    fn test_create_request_increments_cseq() {
        let ok = response(200, &["<sip:p1.example.com;lr>"]);
        let mut dialog = Dialog::from_client(&invite(), &ok, None).unwrap();
        dialog.on_response_received(SipMethod::Invite, 1, &ok, true);

        let bye = dialog.create_request(SipMethod::Bye).unwrap();
        assert_eq!(bye.cseq(), Some((2, SipMethod::Bye)));
        assert_eq!(bye.uri_string(), "sip:bob@192.0.2.4");
        assert_eq!(bye.routes(), vec!["<sip:p1.example.com;lr>"]);
        assert_eq!(bye.from_tag().as_deref(), Some("9fxced76sl"));
        assert_eq!(bye.to_tag().as_deref(), Some("8321234356"));
        assert!(!bye.has_header("Contact"));

        let update = dialog.create_request(SipMethod::Update).unwrap();
        assert_eq!(update.cseq_number(), Some(3));
        assert!(update.has_header("Contact"));

        assert!(matches!(
            dialog.create_request(SipMethod::Ack),
            Err(SipError::InvalidState(_))
        ));
    }

    #[test]
    fn test_create_ack_uses_invite_cseq() {
        let ok = response(200, &[]);
        let mut dialog = Dialog::from_client(&invite(), &ok, None).unwrap();
        dialog.on_response_received(SipMethod::Invite, 1, &ok, true);
        dialog.create_request(SipMethod::Info).unwrap();

        let ack = dialog.create_ack(1).unwrap();
        assert_eq!(ack.cseq(), Some((1, SipMethod::Ack)));
        assert!(matches!(dialog.create_ack(2), Err(SipError::InvalidState(_))));
    }

    #[test]
    fn test_remote_cseq_ordering() {
        let ok = response(200, &[]);
        let mut dialog = Dialog::from_server(&invite(), &ok, None).unwrap();
        assert_eq!(dialog.remote_cseq, Some(1));
        assert!(!dialog.accept_remote_cseq(SipMethod::Info, 1));
        assert!(dialog.accept_remote_cseq(SipMethod::Info, 2));
        // exempt methods do not move the counter
        assert!(dialog.accept_remote_cseq(SipMethod::Prack, 1));
        assert!(dialog.accept_remote_cseq(SipMethod::Ack, 1));
        assert_eq!(dialog.remote_cseq, Some(2));
    }

    #[test]
    fn test_terminated_dialog_rejects_requests() {
        let ok = response(200, &[]);
        let mut dialog = Dialog::from_client(&invite(), &ok, None).unwrap();
        dialog.set_state(DialogState::Terminated);
        assert!(matches!(
            dialog.create_request(SipMethod::Bye),
            Err(SipError::DialogTerminated(_))
        ));
    }
}
