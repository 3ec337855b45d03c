use crate::errors::{SettlementError, SettlementResult};
use crate::models::PaymentMethod;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use std::time::Duration;

/// Round a monetary value to the cent, half-up.
///
/// Every rounding in the settlement path goes through here; mixing
/// strategies is how cumulative drift happens.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Versioned settlement policy, injected into the split calculator and
/// the eligibility checks.
///
/// `version` is recorded on every PaymentSplit so historical splits stay
/// reproducible after a rate change.
#[derive(Debug, Clone)]
pub struct SettlementPolicy {
    pub version: String,
    pub local_card_online_rate: Decimal,
    pub local_card_in_person_rate: Decimal,
    pub international_online_rate: Decimal,
    pub international_in_person_rate: Decimal,
    pub amex_rate: Decimal,
    pub instant_eft_rate: Decimal,
    pub road_levy: Decimal,
    pub driver_percentage: i32,
    pub minimum_withdrawal: Decimal,
    pub withdrawal_fee_rate: Decimal,
    pub withdrawal_fee_minimum: Decimal,
    pub payout_threshold: Decimal,
    pub disbursement_timeout_secs: u64,
}

impl Default for SettlementPolicy {
    fn default() -> Self {
        Self {
            version: "2024-10".to_string(),
            local_card_online_rate: dec!(0.0295),
            local_card_in_person_rate: dec!(0.0270),
            international_online_rate: dec!(0.0340),
            international_in_person_rate: dec!(0.0320),
            amex_rate: dec!(0.0340),
            instant_eft_rate: dec!(0.0200),
            road_levy: dec!(5.00),
            driver_percentage: 90,
            minimum_withdrawal: dec!(100.00),
            withdrawal_fee_rate: dec!(0.01),
            withdrawal_fee_minimum: dec!(5.00),
            payout_threshold: dec!(200.00),
            disbursement_timeout_secs: 30,
        }
    }
}

impl SettlementPolicy {
    /// Load the policy, applying environment overrides onto the defaults.
    pub fn from_env() -> SettlementResult<Self> {
        let mut policy = Self::default();

        if let Ok(v) = std::env::var("POLICY_VERSION") {
            policy.version = v;
        }
        if let Ok(v) = std::env::var("POLICY_ROAD_LEVY") {
            policy.road_levy = parse_decimal("POLICY_ROAD_LEVY", &v)?;
        }
        if let Ok(v) = std::env::var("POLICY_DRIVER_PERCENTAGE") {
            policy.driver_percentage = v.parse().map_err(|_| {
                SettlementError::InvalidPolicy(format!(
                    "POLICY_DRIVER_PERCENTAGE is not an integer: {v}"
                ))
            })?;
        }
        if let Ok(v) = std::env::var("POLICY_MINIMUM_WITHDRAWAL") {
            policy.minimum_withdrawal = parse_decimal("POLICY_MINIMUM_WITHDRAWAL", &v)?;
        }
        if let Ok(v) = std::env::var("POLICY_PAYOUT_THRESHOLD") {
            policy.payout_threshold = parse_decimal("POLICY_PAYOUT_THRESHOLD", &v)?;
        }
        if let Ok(v) = std::env::var("POLICY_DISBURSEMENT_TIMEOUT_SECS") {
            policy.disbursement_timeout_secs = v.parse().map_err(|_| {
                SettlementError::InvalidPolicy(format!(
                    "POLICY_DISBURSEMENT_TIMEOUT_SECS is not an integer: {v}"
                ))
            })?;
        }

        policy.validate()?;
        Ok(policy)
    }

    /// Reject a policy that cannot produce a balanced split.
    pub fn validate(&self) -> SettlementResult<()> {
        if !(0..=100).contains(&self.driver_percentage) {
            return Err(SettlementError::InvalidPolicy(format!(
                "driver_percentage must be between 0 and 100, got {}",
                self.driver_percentage
            )));
        }
        for (name, rate) in [
            ("local_card_online", self.local_card_online_rate),
            ("local_card_in_person", self.local_card_in_person_rate),
            ("international_online", self.international_online_rate),
            ("international_in_person", self.international_in_person_rate),
            ("amex", self.amex_rate),
            ("instant_eft", self.instant_eft_rate),
        ] {
            if rate < Decimal::ZERO || rate >= Decimal::ONE {
                return Err(SettlementError::InvalidPolicy(format!(
                    "gateway fee rate for {name} out of range: {rate}"
                )));
            }
        }
        if self.road_levy < Decimal::ZERO {
            return Err(SettlementError::InvalidPolicy(format!(
                "road_levy cannot be negative: {}",
                self.road_levy
            )));
        }
        if self.minimum_withdrawal <= Decimal::ZERO {
            return Err(SettlementError::InvalidPolicy(format!(
                "minimum_withdrawal must be positive: {}",
                self.minimum_withdrawal
            )));
        }
        if self.disbursement_timeout_secs == 0 {
            return Err(SettlementError::InvalidPolicy(
                "disbursement_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Gateway fee rate for a payment method.
    pub fn gateway_fee_rate(&self, method: PaymentMethod) -> Decimal {
        match method {
            PaymentMethod::LocalCardOnline => self.local_card_online_rate,
            PaymentMethod::LocalCardInPerson => self.local_card_in_person_rate,
            PaymentMethod::InternationalOnline => self.international_online_rate,
            PaymentMethod::InternationalInPerson => self.international_in_person_rate,
            PaymentMethod::Amex => self.amex_rate,
            PaymentMethod::InstantEft => self.instant_eft_rate,
        }
    }

    /// Withdrawal processing fee: max(minimum, rate * amount).
    pub fn processing_fee(&self, amount: Decimal) -> Decimal {
        let proportional = round_money(self.withdrawal_fee_rate * amount);
        proportional.max(self.withdrawal_fee_minimum)
    }

    pub fn disbursement_timeout(&self) -> Duration {
        Duration::from_secs(self.disbursement_timeout_secs)
    }
}

fn parse_decimal(name: &str, value: &str) -> SettlementResult<Decimal> {
    value.parse().map_err(|_| {
        SettlementError::InvalidPolicy(format!("{name} is not a decimal: {value}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processing_fee_floors_at_minimum() {
        let policy = SettlementPolicy::default();
        // 1% of 300 = 3.00, below the 5.00 floor
        assert_eq!(policy.processing_fee(dec!(300.00)), dec!(5.00));
    }

    #[test]
    fn processing_fee_scales_above_minimum() {
        let policy = SettlementPolicy::default();
        // 1% of 800 = 8.00
        assert_eq!(policy.processing_fee(dec!(800.00)), dec!(8.00));
        // 1% of 512.34 = 5.1234 -> 5.12
        assert_eq!(policy.processing_fee(dec!(512.34)), dec!(5.12));
    }

    #[test]
    fn rounding_is_half_up() {
        assert_eq!(round_money(dec!(4.425)), dec!(4.43));
        assert_eq!(round_money(dec!(4.424)), dec!(4.42));
        assert_eq!(round_money(dec!(-4.425)), dec!(-4.43));
    }

    #[test]
    fn rejects_driver_percentage_out_of_range() {
        let policy = SettlementPolicy {
            driver_percentage: 110,
            ..Default::default()
        };
        assert!(matches!(
            policy.validate(),
            Err(SettlementError::InvalidPolicy(_))
        ));
    }

    #[test]
    fn default_policy_is_valid() {
        assert!(SettlementPolicy::default().validate().is_ok());
    }
}
