//! Events delivered by the provider to the application

use super::auth::AuthChallenge;
use super::message::{SipRequest, SipResponse};
use crate::domain::shared::value_objects::{ChannelKey, DialogId, TransactionKey};

/// Everything the engine reports to its user
#[derive(Debug, Clone)]
pub enum SipEvent {
    /// New request. `transaction` is `None` for a 2xx ACK, which has no
    /// transaction of its own.
    Request {
        transaction: Option<TransactionKey>,
        dialog: Option<DialogId>,
        channel: ChannelKey,
        request: SipRequest,
    },
    Response {
        transaction: TransactionKey,
        dialog: Option<DialogId>,
        response: SipResponse,
    },
    Timeout {
        transaction: TransactionKey,
    },
    TransactionTerminated {
        transaction: TransactionKey,
    },
    DialogTerminated {
        dialog: DialogId,
    },
    IoError {
        transaction: Option<TransactionKey>,
        channel: ChannelKey,
        reason: String,
    },
    /// 401/407 on an application transaction
    AuthRequested {
        transaction: TransactionKey,
        challenges: Vec<AuthChallenge>,
    },
}

impl SipEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SipEvent::Request { .. } => "process_request_event",
            SipEvent::Response { .. } => "process_response_event",
            SipEvent::Timeout { .. } => "process_timeout",
            SipEvent::TransactionTerminated { .. } => "process_transaction_terminated",
            SipEvent::DialogTerminated { .. } => "process_dialog_terminated",
            SipEvent::IoError { .. } => "process_io_error",
            SipEvent::AuthRequested { .. } => "process_auth_requested",
        }
    }

    /// Transaction the event is about, if any
    pub fn transaction(&self) -> Option<&TransactionKey> {
        match self {
            SipEvent::Request { transaction, .. } => transaction.as_ref(),
            SipEvent::Response { transaction, .. }
            | SipEvent::Timeout { transaction }
            | SipEvent::TransactionTerminated { transaction }
            | SipEvent::AuthRequested { transaction, .. } => Some(transaction),
            SipEvent::IoError { transaction, .. } => transaction.as_ref(),
            SipEvent::DialogTerminated { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::shared::value_objects::{BranchId, SipMethod};

    #[test]
    fn test_event_names() {
        let key = TransactionKey::new(BranchId::new("z9hG4bK1"), SipMethod::Options);
        let timeout = SipEvent::Timeout {
            transaction: key.clone(),
        };
        assert_eq!(timeout.name(), "process_timeout");
        assert_eq!(timeout.transaction(), Some(&key));

        let dialog = SipEvent::DialogTerminated {
            dialog: DialogId::new("c", "l", "r"),
        };
        assert_eq!(dialog.name(), "process_dialog_terminated");
        assert!(dialog.transaction().is_none());
    }
}
