//! Refreshers keep a REGISTER, SUBSCRIBE or PUBLISH alive by renewing it
//! before the granted expiry runs out.
//!
//! A refresher takes over a completed client transaction. From then on the
//! renewal transactions it creates are internal: their responses, timeouts
//! and transport failures come back here and the application only sees a
//! [`RefreshReport`] per completed attempt.

use super::auth::AuthChallenge;
use super::message::{
    addr_uri, header_param, with_header_param, SipHeaders, SipRequest, SipResponse,
};
use super::metrics;
use super::provider::Provider;
use super::timer::{RefreshPurpose, TimerHandle, TimerTarget};
use super::transaction::TransactionOwner;
use crate::domain::shared::error::SipError;
use crate::domain::shared::value_objects::{DialogId, RefresherId, SipMethod, TransactionKey};
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Renewal cycle of a refresher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefresherState {
    /// A renewal or retry timer is pending
    Armed,
    /// A renewal transaction is outstanding. `queued` holds the expiry of a
    /// refresh requested meanwhile.
    InFlight { queued: Option<u32> },
    /// Nothing scheduled
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshFailure {
    AuthFailure,
    TransportFailure,
    Timeout,
    Rejected,
}

/// Outcome of one renewal attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    pub status_code: u16,
    pub reason: String,
    pub will_retry: bool,
    pub failure: Option<RefreshFailure>,
}

impl RefreshReport {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

pub type RefreshListener = Box<dyn FnMut(&RefreshReport) + Send>;

pub struct Refresher {
    pub id: RefresherId,
    pub method: SipMethod,
    /// Last request sent; the next renewal is derived from it
    pub(crate) request: SipRequest,
    pub(crate) dialog: Option<DialogId>,
    pub(crate) transaction: Option<TransactionKey>,
    pub(crate) state: RefresherState,
    /// Expiry asked for
    pub(crate) target_expires: u32,
    /// Expiry granted by the server
    pub(crate) obtained_expires: u32,
    pub(crate) timer: Option<TimerHandle>,
    pub(crate) listener: Option<RefreshListener>,
    pub(crate) retry_after: Option<Duration>,
    pub(crate) realm: Option<String>,
    pub(crate) manual: bool,
    pub(crate) auth_failures: u32,
    pub(crate) io_retries: u32,
    pub(crate) publish_etag: Option<String>,
}

/// Expiry asked for by a request: Contact `expires` param, else Expires
fn request_expires(request: &SipRequest) -> Option<u32> {
    request
        .contacts()
        .first()
        .and_then(|c| header_param(c, "expires"))
        .and_then(|v| v.parse().ok())
        .or_else(|| request.expires())
}

/// Expiry granted by `response`, falling back to what was asked for
pub fn compute_expires(request: &SipRequest, response: &SipResponse) -> Option<u32> {
    if let Some(ours) = request.contact_uri() {
        let granted = response
            .contacts()
            .iter()
            .filter(|c| addr_uri(c) == ours)
            .find_map(|c| header_param(c, "expires"))
            .and_then(|v| v.parse().ok());
        if granted.is_some() {
            return granted;
        }
    }
    response.expires().or_else(|| request_expires(request))
}

fn set_request_expires(request: &mut SipRequest, expires: u32) {
    let contacts = request.header_values("Contact");
    if contacts.iter().any(|c| header_param(c, "expires").is_some()) {
        request.remove_header("Contact");
        for contact in contacts {
            let value = with_header_param(&contact, "expires", &expires.to_string());
            request.push_header("Contact", value);
        }
    }
    request.set_header("Expires", expires.to_string());
}

fn strip_credentials(request: &mut SipRequest) {
    request.remove_header("Authorization");
    request.remove_header("Proxy-Authorization");
}

impl Provider {
    fn refresher_ref(&self, id: RefresherId) -> Result<&Refresher, SipError> {
        if self.stopped_refreshers.contains(&id) {
            return Err(SipError::Cancelled(id.to_string()));
        }
        self.refreshers
            .get(&id)
            .ok_or_else(|| SipError::NotFound(format!("Refresher {}", id)))
    }

    fn refresher_mut(&mut self, id: RefresherId) -> Result<&mut Refresher, SipError> {
        if self.stopped_refreshers.contains(&id) {
            return Err(SipError::Cancelled(id.to_string()));
        }
        self.refreshers
            .get_mut(&id)
            .ok_or_else(|| SipError::NotFound(format!("Refresher {}", id)))
    }

    /// Take over a completed REGISTER, SUBSCRIBE or PUBLISH transaction and
    /// keep renewing it
    pub fn create_refresher(&mut self, key: &TransactionKey) -> Result<RefresherId, SipError> {
        let txn = self
            .transactions
            .get(key)
            .ok_or_else(|| SipError::NotFound(format!("Transaction {}", key)))?;
        let method = txn.method();
        if !method.is_refreshable() {
            return Err(SipError::ConfigurationError(format!(
                "{} cannot be refreshed",
                method
            )));
        }
        if !txn.is_client() {
            return Err(SipError::ConfigurationError(format!(
                "{} is a server transaction",
                key
            )));
        }
        let response = txn
            .last_response
            .as_ref()
            .filter(|r| r.is_success())
            .ok_or_else(|| {
                SipError::ConfigurationError(format!("{} has no 2xx final response", key))
            })?;
        let obtained = compute_expires(&txn.request, response)
            .filter(|e| *e > 0)
            .ok_or_else(|| {
                SipError::ConfigurationError(format!("No usable expiration on {}", key))
            })?;
        let target = request_expires(&txn.request).unwrap_or(obtained);
        let publish_etag = response.header_value("SIP-ETag");
        let request = txn.request.clone();
        let dialog = (method == SipMethod::Subscribe)
            .then(|| txn.dialog.clone())
            .flatten();

        self.next_refresher_id += 1;
        let id = RefresherId(self.next_refresher_id);
        if let Some(txn) = self.transactions.get_mut(key) {
            txn.owner = TransactionOwner::Refresher(id);
        }
        let refresher = Refresher {
            id,
            method,
            request,
            dialog,
            transaction: None,
            state: RefresherState::Idle,
            target_expires: target,
            obtained_expires: obtained,
            timer: None,
            listener: None,
            retry_after: self.config.refresher.retry_after_ms.map(Duration::from_millis),
            realm: None,
            manual: false,
            auth_failures: 0,
            io_retries: 0,
            publish_etag,
        };
        self.refreshers.insert(id, refresher);
        info!("Created {} refresher {} (expires {}s)", method, id, obtained);
        self.arm_normal_refresh(id);
        Ok(id)
    }

    pub fn set_refresher_listener(
        &mut self,
        id: RefresherId,
        listener: RefreshListener,
    ) -> Result<(), SipError> {
        self.refresher_mut(id)?.listener = Some(listener);
        Ok(())
    }

    /// Renew now with `expires` (0 to unregister or unsubscribe). While a
    /// renewal is in flight the request is merged with it or queued behind it.
    pub fn refresh(&mut self, id: RefresherId, expires: u32) -> Result<(), SipError> {
        let refresher = self.refresher_mut(id)?;
        refresher.auth_failures = 0;
        if let RefresherState::InFlight { queued } = &mut refresher.state {
            if queued.is_none() && expires == refresher.target_expires {
                debug!("Refresher {} already renewing with expires {}", id, expires);
            } else {
                debug!("Refresher {} queues expires {}", id, expires);
                *queued = Some(expires);
            }
            return Ok(());
        }
        refresher.target_expires = expires;
        if let Some(handle) = refresher.timer.take() {
            self.timers.cancel(handle);
        }
        self.send_renewal(id);
        Ok(())
    }

    /// Stop renewing. Idempotent. An outstanding renewal completes on the
    /// wire but is no longer reported.
    pub fn stop_refresher(&mut self, id: RefresherId) -> Result<(), SipError> {
        if self.stopped_refreshers.contains(&id) {
            return Ok(());
        }
        let refresher = self
            .refreshers
            .remove(&id)
            .ok_or_else(|| SipError::NotFound(format!("Refresher {}", id)))?;
        if let Some(handle) = refresher.timer {
            self.timers.cancel(handle);
        }
        self.stopped_refreshers.insert(id);
        info!("Stopped refresher {}", id);
        Ok(())
    }

    /// Expiry last granted by the server
    pub fn refresher_expires(&self, id: RefresherId) -> Result<u32, SipError> {
        Ok(self.refresher_ref(id)?.obtained_expires)
    }

    pub fn refresher_state(&self, id: RefresherId) -> Result<RefresherState, SipError> {
        Ok(self.refresher_ref(id)?.state)
    }

    pub fn set_retry_after(
        &mut self,
        id: RefresherId,
        retry_after: Option<Duration>,
    ) -> Result<(), SipError> {
        self.refresher_mut(id)?.retry_after = retry_after;
        Ok(())
    }

    pub fn retry_after(&self, id: RefresherId) -> Result<Option<Duration>, SipError> {
        Ok(self.refresher_ref(id)?.retry_after)
    }

    /// Answer only challenges of this realm
    pub fn set_realm(&mut self, id: RefresherId, realm: Option<String>) -> Result<(), SipError> {
        self.refresher_mut(id)?.realm = realm;
        Ok(())
    }

    /// In manual mode an expiring refresher reports status 0 instead of
    /// renewing on its own
    pub fn set_manual_mode(&mut self, id: RefresherId, manual: bool) -> Result<(), SipError> {
        self.refresher_mut(id)?.manual = manual;
        Ok(())
    }

    // --- internals ---------------------------------------------------------

    fn arm(&mut self, id: RefresherId, delay: Duration, purpose: RefreshPurpose) {
        let Some(refresher) = self.refreshers.get_mut(&id) else {
            return;
        };
        if let Some(handle) = refresher.timer.take() {
            self.timers.cancel(handle);
        }
        let handle = self
            .timers
            .schedule(Instant::now() + delay, TimerTarget::Refresher(id, purpose));
        refresher.timer = Some(handle);
        refresher.state = RefresherState::Armed;
        debug!("Refresher {} armed {:?} in {:?}", id, purpose, delay);
    }

    fn arm_normal_refresh(&mut self, id: RefresherId) {
        let Some(refresher) = self.refreshers.get(&id) else {
            return;
        };
        let ratio = self.config.refresher.safety_margin_ratio.clamp(0.0, 1.0);
        let delay = Duration::from_secs(u64::from(refresher.obtained_expires)).mul_f64(1.0 - ratio);
        self.arm(id, delay, RefreshPurpose::NormalRefresh);
    }

    fn go_idle(&mut self, id: RefresherId) {
        if let Some(refresher) = self.refreshers.get_mut(&id) {
            if let Some(handle) = refresher.timer.take() {
                self.timers.cancel(handle);
            }
            refresher.state = RefresherState::Idle;
        }
    }

    fn report(&mut self, id: RefresherId, report: RefreshReport) {
        metrics::refresh_outcome(match report.failure {
            None if report.is_success() => "success",
            None => "notice",
            Some(RefreshFailure::AuthFailure) => "auth_failure",
            Some(RefreshFailure::TransportFailure) => "transport_failure",
            Some(RefreshFailure::Timeout) => "timeout",
            Some(RefreshFailure::Rejected) => "rejected",
        });
        let Some(mut listener) = self.refreshers.get_mut(&id).and_then(|r| r.listener.take()) else {
            debug!("Refresher {} report {} with no listener", id, report.status_code);
            return;
        };
        listener(&report);
        if let Some(refresher) = self.refreshers.get_mut(&id) {
            refresher.listener = Some(listener);
        }
    }

    /// Next renewal request, derived from the last one sent
    fn build_renewal(&mut self, id: RefresherId) -> Result<SipRequest, SipError> {
        let refresher = self.refresher_ref(id)?;
        let template = refresher.request.clone();
        let target = refresher.target_expires;
        let etag = refresher.publish_etag.clone();

        let mut request = match refresher.dialog.clone() {
            Some(dialog) => {
                let mut request = self.create_request(&dialog, SipMethod::Subscribe)?;
                for name in ["Event", "Accept", "Content-Type"] {
                    if let Some(value) = template.header_value(name) {
                        request.set_header(name, value);
                    }
                }
                request.set_body(template.body().to_vec());
                request
            }
            None => {
                let mut request = template;
                strip_credentials(&mut request);
                let cseq = request.cseq_number().unwrap_or_default();
                request.set_cseq(cseq + 1)?;
                request
            }
        };
        set_request_expires(&mut request, target);
        if let Some(etag) = etag {
            request.set_header("SIP-If-Match", etag);
        }
        Ok(request)
    }

    fn send_renewal(&mut self, id: RefresherId) {
        match self.build_renewal(id) {
            Ok(request) => self.dispatch_renewal(id, request),
            Err(e) => {
                warn!("Refresher {} cannot build renewal: {}", id, e);
                self.go_idle(id);
                self.report(
                    id,
                    RefreshReport {
                        status_code: 0,
                        reason: e.to_string(),
                        will_retry: false,
                        failure: Some(RefreshFailure::Rejected),
                    },
                );
            }
        }
    }

    /// Send `request` as the outstanding renewal. The refresher is marked
    /// in flight first: a synchronous send failure comes back through
    /// `refresher_on_io_error` before this returns.
    fn dispatch_renewal(&mut self, id: RefresherId, request: SipRequest) {
        let Some(refresher) = self.refreshers.get_mut(&id) else {
            return;
        };
        if let Some(handle) = refresher.timer.take() {
            self.timers.cancel(handle);
        }
        let queued = match refresher.state {
            RefresherState::InFlight { queued } => queued,
            _ => None,
        };
        refresher.state = RefresherState::InFlight { queued };
        refresher.request = request.clone();
        refresher.transaction = None;
        metrics::refresh_attempt(refresher.method);

        let key =
            match self.create_client_transaction_for(request, TransactionOwner::Refresher(id)) {
                Ok(key) => key,
                Err(e) => {
                    self.refresher_transport_failure(id, &e.to_string());
                    return;
                }
            };
        if let Some(refresher) = self.refreshers.get_mut(&id) {
            refresher.transaction = Some(key.clone());
        }
        debug!("Refresher {} renewing on {}", id, key);
        if let Err(e) = self.send_request(&key) {
            warn!("Refresher {} cannot send {}: {}", id, key, e);
            if let Err(e) = self.terminate_transaction(&key) {
                debug!("Refresher {}: {}", id, e);
            }
            self.refresher_transport_failure(id, &e.to_string());
        }
    }

    /// Take the transaction of the current attempt if `key` is it
    fn current_attempt(&mut self, id: RefresherId, key: &TransactionKey) -> bool {
        let Some(refresher) = self.refreshers.get_mut(&id) else {
            debug!("Dropping outcome of {} for stopped refresher {}", key, id);
            return false;
        };
        if refresher.transaction.as_ref() != Some(key) {
            debug!("Dropping stale outcome of {} for refresher {}", key, id);
            return false;
        }
        true
    }

    fn retry_later(&mut self, id: RefresherId) -> bool {
        let Some(refresher) = self.refreshers.get(&id) else {
            return false;
        };
        match refresher.retry_after {
            Some(delay) if refresher.target_expires > 0 => {
                self.arm(id, delay, RefreshPurpose::Retry);
                true
            }
            _ => false,
        }
    }

    /// Close the current attempt with a failure report
    fn fail_attempt(
        &mut self,
        id: RefresherId,
        status_code: u16,
        reason: String,
        failure: RefreshFailure,
        may_retry: bool,
    ) {
        let will_retry = may_retry && self.retry_later(id);
        if !will_retry {
            self.go_idle(id);
        }
        self.report(
            id,
            RefreshReport {
                status_code,
                reason,
                will_retry,
                failure: Some(failure),
            },
        );
    }

    pub(crate) fn refresher_on_response(
        &mut self,
        id: RefresherId,
        key: &TransactionKey,
        response: &SipResponse,
    ) {
        let status = response.status_code();
        if status < 200 || !self.current_attempt(id, key) {
            return;
        }
        let Some(refresher) = self.refreshers.get_mut(&id) else {
            return;
        };
        let method = refresher.method;
        debug!("Refresher {} got {} on {}", id, status, key);

        match status {
            200..=299 => {
                refresher.auth_failures = 0;
                refresher.io_retries = 0;
                refresher.transaction = None;
                if method == SipMethod::Publish {
                    refresher.publish_etag = response.header_value("SIP-ETag");
                }
                let target = refresher.target_expires;
                let mut obtained = compute_expires(&refresher.request, response).unwrap_or(target);
                if obtained == 0 && target > 0 {
                    obtained = target;
                }
                refresher.obtained_expires = obtained;
                let queued = self.take_queued(id);
                if target == 0 {
                    info!("Refresher {} expired on request", id);
                    self.go_idle(id);
                } else {
                    self.arm_normal_refresh(id);
                }
                self.report(
                    id,
                    RefreshReport {
                        status_code: status,
                        reason: response.reason(),
                        will_retry: false,
                        failure: None,
                    },
                );
                self.requeue(id, queued);
            }
            401 | 407 => {
                refresher.auth_failures += 1;
                refresher.transaction = None;
                let first = refresher.auth_failures == 1;
                if first {
                    match self.authenticated_renewal(id, response) {
                        Ok(request) => {
                            self.dispatch_renewal(id, request);
                            return;
                        }
                        Err(e) => warn!("Refresher {} cannot answer challenge: {}", id, e),
                    }
                }
                if let Some(refresher) = self.refreshers.get_mut(&id) {
                    refresher.auth_failures = 0;
                }
                let queued = self.take_queued(id);
                self.fail_attempt(id, status, response.reason(), RefreshFailure::AuthFailure, true);
                self.requeue(id, queued);
            }
            423 => {
                refresher.transaction = None;
                let min_expires = response
                    .header_value("Min-Expires")
                    .and_then(|v| v.trim().parse().ok())
                    .filter(|_| refresher.target_expires > 0);
                match min_expires {
                    Some(min) => {
                        info!("Refresher {} raises expires to {}", id, min);
                        refresher.target_expires = min;
                        self.send_renewal(id);
                    }
                    None => self.reject(id, response, true),
                }
            }
            301 | 302 => {
                refresher.transaction = None;
                match response.contact_uri() {
                    Some(target) => {
                        info!("Refresher {} redirected to {}", id, target);
                        let result = refresher.request.set_uri(&target);
                        strip_credentials(&mut refresher.request);
                        match result {
                            Ok(()) => self.send_renewal(id),
                            Err(_) => self.reject(id, response, true),
                        }
                    }
                    None => self.reject(id, response, true),
                }
            }
            412 if method == SipMethod::Publish => {
                refresher.transaction = None;
                refresher.publish_etag = None;
                refresher.request.remove_header("SIP-If-Match");
                let queued = self.take_queued(id);
                let delay = Duration::from_millis(self.config.refresher.initial_io_error_retry_ms);
                self.arm(id, delay, RefreshPurpose::Retry);
                self.requeue(id, queued);
            }
            491 => {
                refresher.transaction = None;
                let queued = self.take_queued(id);
                let bound = self.config.refresher.max_conflict_retry_ms.max(1);
                let delay = Duration::from_millis(rand::thread_rng().gen_range(0..bound));
                self.arm(id, delay, RefreshPurpose::Retry);
                self.requeue(id, queued);
            }
            501 | 505 => self.reject(id, response, false),
            s if s >= 600 => self.reject(id, response, false),
            _ => self.reject(id, response, true),
        }
    }

    fn reject(&mut self, id: RefresherId, response: &SipResponse, may_retry: bool) {
        let queued = self.take_queued(id);
        if let Some(refresher) = self.refreshers.get_mut(&id) {
            refresher.transaction = None;
        }
        self.fail_attempt(
            id,
            response.status_code(),
            response.reason(),
            RefreshFailure::Rejected,
            may_retry,
        );
        self.requeue(id, queued);
    }

    /// Copy of the last renewal answering the challenges of `response`
    fn authenticated_renewal(
        &mut self,
        id: RefresherId,
        response: &SipResponse,
    ) -> Result<SipRequest, SipError> {
        let refresher = self.refresher_ref(id)?;
        let mut request = refresher.request.clone();
        let realm = refresher.realm.clone();
        let dialog = refresher.dialog.clone();
        let challenges = AuthChallenge::from_response(response);
        let cseq = match dialog {
            Some(dialog) => self.next_dialog_cseq(&dialog)?,
            None => request.cseq_number().unwrap_or_default() + 1,
        };
        request.set_cseq(cseq)?;
        self.authorize(&mut request, &challenges, realm.as_deref())?;
        Ok(request)
    }

    pub(crate) fn refresher_on_timeout(&mut self, id: RefresherId, key: &TransactionKey) {
        if !self.current_attempt(id, key) {
            return;
        }
        let queued = self.take_queued(id);
        let Some(refresher) = self.refreshers.get_mut(&id) else {
            return;
        };
        refresher.transaction = None;
        let will_retry = refresher.target_expires > 0;
        if will_retry {
            let delay = Duration::from_millis(self.config.refresher.timeout_retry_ms);
            self.arm(id, delay, RefreshPurpose::Retry);
        } else {
            self.go_idle(id);
        }
        self.report(
            id,
            RefreshReport {
                status_code: 408,
                reason: "Request Timeout".to_string(),
                will_retry,
                failure: Some(RefreshFailure::Timeout),
            },
        );
        self.requeue(id, queued);
    }

    pub(crate) fn refresher_on_io_error(&mut self, id: RefresherId, key: &TransactionKey) {
        if !self.current_attempt(id, key) {
            return;
        }
        self.refresher_transport_failure(id, "io error");
    }

    fn refresher_transport_failure(&mut self, id: RefresherId, reason: &str) {
        let queued = self.take_queued(id);
        let initial = Duration::from_millis(self.config.refresher.initial_io_error_retry_ms);
        let Some(refresher) = self.refreshers.get_mut(&id) else {
            return;
        };
        refresher.transaction = None;
        let delay = match refresher.retry_after {
            Some(_) if refresher.target_expires == 0 => None,
            Some(_) if refresher.io_retries == 0 => Some(initial),
            retry_after => retry_after,
        };
        refresher.io_retries += 1;
        let will_retry = delay.is_some();
        match delay {
            Some(delay) => self.arm(id, delay, RefreshPurpose::Retry),
            None => self.go_idle(id),
        }
        warn!("Refresher {} transport failure: {}", id, reason);
        self.report(
            id,
            RefreshReport {
                status_code: 503,
                reason: "io error".to_string(),
                will_retry,
                failure: Some(RefreshFailure::TransportFailure),
            },
        );
        self.requeue(id, queued);
    }

    /// Refresh requested during the attempt that just ended, if any
    fn take_queued(&mut self, id: RefresherId) -> Option<u32> {
        let refresher = self.refreshers.get_mut(&id)?;
        match &mut refresher.state {
            RefresherState::InFlight { queued } => queued.take(),
            _ => None,
        }
    }

    fn requeue(&mut self, id: RefresherId, queued: Option<u32>) {
        let Some(expires) = queued else {
            return;
        };
        let Some(refresher) = self.refreshers.get_mut(&id) else {
            return;
        };
        if matches!(refresher.state, RefresherState::InFlight { .. }) {
            return;
        }
        debug!("Refresher {} runs queued refresh (expires {})", id, expires);
        refresher.target_expires = expires;
        refresher.auth_failures = 0;
        self.send_renewal(id);
    }

    pub(crate) fn refresher_on_timer(
        &mut self,
        id: RefresherId,
        purpose: RefreshPurpose,
        handle: TimerHandle,
    ) {
        let Some(refresher) = self.refreshers.get_mut(&id) else {
            return;
        };
        if refresher.timer != Some(handle) {
            debug!("Stale timer for refresher {}", id);
            return;
        }
        refresher.timer = None;
        if purpose == RefreshPurpose::NormalRefresh && refresher.manual {
            refresher.state = RefresherState::Idle;
            self.report(
                id,
                RefreshReport {
                    status_code: 0,
                    reason: "about to expire".to_string(),
                    will_retry: false,
                    failure: None,
                },
            );
            return;
        }
        self.send_renewal(id);
    }
}
