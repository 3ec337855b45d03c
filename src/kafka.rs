use crate::errors::{SettlementError, SettlementResult};
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settlement events published for downstream consumers (dashboards,
/// reconciliation). Self-contained, past tense, timestamped.
///
/// Events are informational: the ledger commit is the source of truth
/// and has already happened by the time an event is published.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "eventType")]
pub enum SettlementEvent {
    #[serde(rename = "TRIP_SETTLED")]
    TripSettled {
        trip_reference: String,
        driver_wallet_id: String,
        driver_user_id: String,
        net_driver_amount: Decimal,
        transaction_id: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "WITHDRAWAL_REQUESTED")]
    WithdrawalRequested {
        request_id: String,
        wallet_id: String,
        user_id: String,
        requested_amount: Decimal,
        net_amount: Decimal,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "WITHDRAWAL_CANCELLED")]
    WithdrawalCancelled {
        request_id: String,
        wallet_id: String,
        user_id: String,
        requested_amount: Decimal,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "WITHDRAWAL_SETTLED")]
    WithdrawalSettled {
        request_id: String,
        wallet_id: String,
        user_id: String,
        requested_amount: Decimal,
        success: bool,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "BATCH_PROCESSED")]
    BatchProcessed {
        batch_id: String,
        batch_number: String,
        status: String,
        driver_count: i32,
        total_amount: Decimal,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "POSTING_REVERSED")]
    PostingReversed {
        original_transaction_id: String,
        reversal_transaction_id: String,
        wallet_id: String,
        amount: Decimal,
        timestamp: DateTime<Utc>,
    },
}

impl SettlementEvent {
    pub fn event_type(&self) -> &str {
        match self {
            SettlementEvent::TripSettled { .. } => "TRIP_SETTLED",
            SettlementEvent::WithdrawalRequested { .. } => "WITHDRAWAL_REQUESTED",
            SettlementEvent::WithdrawalCancelled { .. } => "WITHDRAWAL_CANCELLED",
            SettlementEvent::WithdrawalSettled { .. } => "WITHDRAWAL_SETTLED",
            SettlementEvent::BatchProcessed { .. } => "BATCH_PROCESSED",
            SettlementEvent::PostingReversed { .. } => "POSTING_REVERSED",
        }
    }

    /// Partition key. Wallet-scoped events key on the wallet so a
    /// wallet's events stay ordered; batch events key on the batch.
    pub fn partition_key(&self) -> &str {
        match self {
            SettlementEvent::TripSettled { driver_wallet_id, .. } => driver_wallet_id,
            SettlementEvent::WithdrawalRequested { wallet_id, .. } => wallet_id,
            SettlementEvent::WithdrawalCancelled { wallet_id, .. } => wallet_id,
            SettlementEvent::WithdrawalSettled { wallet_id, .. } => wallet_id,
            SettlementEvent::BatchProcessed { batch_id, .. } => batch_id,
            SettlementEvent::PostingReversed { wallet_id, .. } => wallet_id,
        }
    }
}

/// Kafka producer wrapper: hides broker config from the business logic
/// and exposes a single publish call.
pub struct EventProducer {
    producer: FutureProducer,
    topic: String,
}

impl EventProducer {
    pub fn new(brokers: &str, topic: String) -> SettlementResult<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            // Durability settings
            .set("acks", "all")
            .set("enable.idempotence", "true")
            // Performance tuning
            .set("compression.type", "snappy")
            .set("batch.size", "16384")
            .set("linger.ms", "10")
            .create()
            .map_err(|e| SettlementError::Kafka(format!("Failed to create producer: {}", e)))?;

        Ok(Self { producer, topic })
    }

    /// Publish an event and wait for broker acknowledgment.
    ///
    /// Callers publish after their database commit and treat failure as
    /// log-and-continue: the ledger is authoritative and projections
    /// can be rebuilt, so a lost event is an inconvenience, not a
    /// correctness problem.
    pub async fn publish(&self, event: SettlementEvent) -> SettlementResult<()> {
        let key = event.partition_key().to_string();
        let payload = serde_json::to_string(&event)
            .map_err(|e| SettlementError::Internal(format!("Failed to serialize event: {}", e)))?;

        tracing::info!(
            event_type = event.event_type(),
            key = %key,
            "Publishing settlement event"
        );

        let record = FutureRecord::to(&self.topic).key(&key).payload(&payload);

        match self.producer.send(record, Duration::from_secs(5)).await {
            Ok((partition, offset)) => {
                tracing::debug!(
                    partition = partition,
                    offset = offset,
                    "Event published successfully"
                );
                Ok(())
            }
            Err((e, _)) => {
                tracing::error!(error = %e, "Failed to publish event");
                Err(SettlementError::Kafka(format!(
                    "Failed to publish event: {}",
                    e
                )))
            }
        }
    }
}
