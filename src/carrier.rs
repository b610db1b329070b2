use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::message::{AckOutcome, DataMessage, DatagramMessage};


/// The carrier layer's verdict on a message submitted to it
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SubmitOutcome {
    Success,
    Queued,
    RejectedNoRoute,
    RejectedQueueFull,
    RejectedExpired,
}
impl SubmitOutcome {
    /// The acknowledgment a peer gets for a message it submitted
    pub fn ack_outcome(&self) -> AckOutcome {
        match self {
            SubmitOutcome::Success => AckOutcome::Success,
            SubmitOutcome::Queued => AckOutcome::Queued,
            SubmitOutcome::RejectedNoRoute => AckOutcome::Rejected,
            SubmitOutcome::RejectedExpired => AckOutcome::Rejected,
            SubmitOutcome::RejectedQueueFull => AckOutcome::FailedTemporarily,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum FailureReason {
    /// the router is shutting down and can no longer deliver the message
    Shutdown,
    /// the peer rejected the message
    Rejected,
    Undeliverable,
}

/// The carrier side of the router, i.e. the protocol engines talking to the carriers' networks.
///
/// The router calls into this for messages originating at peers, and to report the final
///  outcome of every carrier message it accepted: each such message ends up in exactly one
///  call to either [CarrierLayer::on_sent] or [CarrierLayer::on_send_failed].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CarrierLayer: Send + Sync + 'static {
    async fn submit(&self, msg: DataMessage) -> SubmitOutcome;

    async fn submit_datagram(&self, msg: DatagramMessage);

    async fn on_sent(&self, msg: DataMessage);

    async fn on_send_failed(&self, msg: DataMessage, reason: FailureReason);
}
