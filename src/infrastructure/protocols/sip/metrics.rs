//! Counters and gauges exported by the engine

use crate::domain::shared::value_objects::{SipMethod, TransactionRole};
use metrics::{counter, gauge};

pub fn transaction_created(role: TransactionRole, method: SipMethod) {
    let role = match role {
        TransactionRole::Client => "client",
        TransactionRole::Server => "server",
    };
    counter!("sip_transactions_created_total", "role" => role, "method" => method.as_str())
        .increment(1);
}

pub fn transactions_active(count: usize) {
    gauge!("sip_transactions_active").set(count as f64);
}

/// `kind` is `request` or `response`
pub fn retransmission(kind: &'static str) {
    counter!("sip_retransmissions_total", "kind" => kind).increment(1);
}

pub fn transaction_timeout() {
    counter!("sip_transaction_timeouts_total").increment(1);
}

pub fn io_error() {
    counter!("sip_io_errors_total").increment(1);
}

pub fn dialogs_active(count: usize) {
    gauge!("sip_dialogs_active").set(count as f64);
}

pub fn dialog_terminated() {
    counter!("sip_dialogs_terminated_total").increment(1);
}

pub fn refresh_attempt(method: SipMethod) {
    counter!("sip_refresh_attempts_total", "method" => method.as_str()).increment(1);
}

pub fn refresh_outcome(outcome: &'static str) {
    counter!("sip_refresh_outcomes_total", "outcome" => outcome).increment(1);
}
