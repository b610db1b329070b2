use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::{sleep, timeout};

use crate::carrier::{CarrierLayer, FailureReason, SubmitOutcome};
use crate::message::{DataMessage, DatagramMessage};


/// A [CarrierLayer] that records everything the router hands to it
#[derive(Debug)]
pub struct TrackingCarrier {
    submit_outcome: SubmitOutcome,
    submitted: RwLock<Vec<DataMessage>>,
    datagrams: RwLock<Vec<DatagramMessage>>,
    sent: RwLock<Vec<DataMessage>>,
    failed: RwLock<Vec<(DataMessage, FailureReason)>>,
}

impl Default for TrackingCarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackingCarrier {
    pub fn new() -> TrackingCarrier {
        Self::with_submit_outcome(SubmitOutcome::Success)
    }

    /// a carrier layer answering every submitted message with the given outcome
    pub fn with_submit_outcome(submit_outcome: SubmitOutcome) -> TrackingCarrier {
        TrackingCarrier {
            submit_outcome,
            submitted: Default::default(),
            datagrams: Default::default(),
            sent: Default::default(),
            failed: Default::default(),
        }
    }

    pub async fn submitted(&self) -> Vec<DataMessage> {
        self.submitted.read().await.clone()
    }

    pub async fn datagrams(&self) -> Vec<DatagramMessage> {
        self.datagrams.read().await.clone()
    }

    pub async fn sent(&self) -> Vec<DataMessage> {
        self.sent.read().await.clone()
    }

    pub async fn failed(&self) -> Vec<(DataMessage, FailureReason)> {
        self.failed.read().await.clone()
    }

    /// number of messages whose outcome was reported, successful or not
    pub async fn num_finalized(&self) -> usize {
        self.sent.read().await.len() + self.failed.read().await.len()
    }

    /// Polls until `num_finalized()` reaches the given number, panicking after a few seconds
    pub async fn wait_for_finalized(&self, expected: usize) {
        let result = timeout(Duration::from_secs(5), async {
            while self.num_finalized().await < expected {
                sleep(Duration::from_millis(5)).await;
            }
        }).await;
        if result.is_err() {
            panic!("expected {} finalized messages, got {}", expected, self.num_finalized().await);
        }
    }
}

#[async_trait]
impl CarrierLayer for TrackingCarrier {
    async fn submit(&self, msg: DataMessage) -> SubmitOutcome {
        self.submitted.write().await.push(msg);
        self.submit_outcome
    }

    async fn submit_datagram(&self, msg: DatagramMessage) {
        self.datagrams.write().await.push(msg);
    }

    async fn on_sent(&self, msg: DataMessage) {
        self.sent.write().await.push(msg);
    }

    async fn on_send_failed(&self, msg: DataMessage, reason: FailureReason) {
        self.failed.write().await.push((msg, reason));
    }
}
