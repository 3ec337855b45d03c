use crate::errors::SettlementResult;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use uuid::Uuid;

/// One payout instruction handed to the bank rail.
#[derive(Debug, Clone)]
pub struct DisbursementInstruction {
    pub account_number: String,
    pub branch_code: String,
    pub account_holder: String,
    pub amount: Decimal,
    pub reference: String,
}

/// Per-instruction result from the channel. A rejection is an expected
/// business outcome, not a transport error.
#[derive(Debug, Clone)]
pub enum DisbursementOutcome {
    Accepted { channel_reference: String },
    Rejected { reason: String },
}

/// Abstraction over bank disbursement rails.
///
/// The processor wraps every call in a bounded timeout; implementations
/// do not need their own deadline handling.
#[async_trait]
pub trait DisbursementChannel: Send + Sync {
    async fn disburse(
        &self,
        instruction: &DisbursementInstruction,
    ) -> SettlementResult<DisbursementOutcome>;

    fn name(&self) -> &str;
}

/// Manual rail: every instruction is accepted and an operator executes
/// the EFT out of band, reconciling against the returned reference.
pub struct ManualChannel;

#[async_trait]
impl DisbursementChannel for ManualChannel {
    async fn disburse(
        &self,
        instruction: &DisbursementInstruction,
    ) -> SettlementResult<DisbursementOutcome> {
        let channel_reference = format!("MAN-{}", &Uuid::new_v4().simple().to_string()[..12]);
        tracing::info!(
            reference = %instruction.reference,
            channel_reference = %channel_reference,
            amount = %instruction.amount,
            account = %instruction.account_number,
            "Queued manual EFT instruction"
        );
        Ok(DisbursementOutcome::Accepted { channel_reference })
    }

    fn name(&self) -> &str {
        "manual"
    }
}

/// In-memory stub rail for tests: rejects configured accounts and can
/// stall on others to exercise the timeout path.
#[derive(Default)]
pub struct StubChannel {
    rejected_accounts: HashMap<String, String>,
    stalled_accounts: HashSet<String>,
    stall: Duration,
}

impl StubChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_account(mut self, account_number: &str, reason: &str) -> Self {
        self.rejected_accounts
            .insert(account_number.to_string(), reason.to_string());
        self
    }

    pub fn stall_account(mut self, account_number: &str, stall: Duration) -> Self {
        self.stalled_accounts.insert(account_number.to_string());
        self.stall = stall;
        self
    }
}

#[async_trait]
impl DisbursementChannel for StubChannel {
    async fn disburse(
        &self,
        instruction: &DisbursementInstruction,
    ) -> SettlementResult<DisbursementOutcome> {
        if self.stalled_accounts.contains(&instruction.account_number) {
            tokio::time::sleep(self.stall).await;
        }
        if let Some(reason) = self.rejected_accounts.get(&instruction.account_number) {
            return Ok(DisbursementOutcome::Rejected {
                reason: reason.clone(),
            });
        }
        Ok(DisbursementOutcome::Accepted {
            channel_reference: format!("STUB-{}", &Uuid::new_v4().simple().to_string()[..12]),
        })
    }

    fn name(&self) -> &str {
        "stub"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn instruction(account: &str) -> DisbursementInstruction {
        DisbursementInstruction {
            account_number: account.to_string(),
            branch_code: "250655".to_string(),
            account_holder: "T Driver".to_string(),
            amount: dec!(250.00),
            reference: "PB-test-0001".to_string(),
        }
    }

    #[tokio::test]
    async fn manual_channel_accepts_everything() {
        let channel = ManualChannel;
        let outcome = channel.disburse(&instruction("1234567890")).await.unwrap();
        assert!(matches!(outcome, DisbursementOutcome::Accepted { .. }));
    }

    #[tokio::test]
    async fn stub_channel_rejects_configured_accounts() {
        let channel = StubChannel::new().reject_account("999", "account closed");
        let outcome = channel.disburse(&instruction("999")).await.unwrap();
        match outcome {
            DisbursementOutcome::Rejected { reason } => assert_eq!(reason, "account closed"),
            other => panic!("expected rejection, got {:?}", other),
        }

        let outcome = channel.disburse(&instruction("111")).await.unwrap();
        assert!(matches!(outcome, DisbursementOutcome::Accepted { .. }));
    }

    #[tokio::test]
    async fn stub_channel_stall_trips_a_timeout() {
        let channel = StubChannel::new().stall_account("777", Duration::from_secs(5));
        let result = tokio::time::timeout(
            Duration::from_millis(50),
            channel.disburse(&instruction("777")),
        )
        .await;
        assert!(result.is_err(), "expected the wrapped call to time out");
    }
}
