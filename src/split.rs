use crate::errors::{SettlementError, SettlementResult};
use crate::models::{PaymentMethod, PaymentSplit};
use crate::policy::{round_money, SettlementPolicy};
use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

/// Split a gross trip charge into gateway fee, road levy, driver share
/// and platform share. Pure computation; persistence is the ledger's job.
///
/// Order of deductions:
/// 1. gateway fee (rate table keyed by payment method, rounded half-up)
/// 2. road levy (fixed per trip)
/// 3. remainder split driver_percentage / rest
///
/// The rounding residue of the driver share lands on the platform side,
/// so total == driver + platform + fee + levy holds exactly for every
/// input. Assigning the residue anywhere else reintroduces the missing
/// cent.
pub fn compute_split(
    trip_reference: &str,
    gross_amount: Decimal,
    payment_method: PaymentMethod,
    rider_wallet_id: Option<&str>,
    policy: &SettlementPolicy,
) -> SettlementResult<PaymentSplit> {
    policy.validate()?;

    if gross_amount <= Decimal::ZERO {
        return Err(SettlementError::InvalidAmount(format!(
            "gross amount must be positive, got {gross_amount}"
        )));
    }

    let gateway_fee = round_money(gross_amount * policy.gateway_fee_rate(payment_method));
    let remainder = gross_amount - gateway_fee - policy.road_levy;
    if remainder < Decimal::ZERO {
        return Err(SettlementError::InvalidAmount(format!(
            "gross amount {gross_amount} does not cover gateway fee {gateway_fee} and road levy {}, short by {}",
            policy.road_levy,
            -remainder
        )));
    }

    let driver_fraction = Decimal::from(policy.driver_percentage) / Decimal::from(100);
    let net_driver_amount = round_money(remainder * driver_fraction);
    let platform_amount = remainder - net_driver_amount;

    Ok(PaymentSplit {
        id: Uuid::new_v4().to_string(),
        trip_reference: trip_reference.to_string(),
        rider_wallet_id: rider_wallet_id.map(str::to_string),
        total_amount: gross_amount,
        payment_gateway_fee: gateway_fee,
        road_levy: policy.road_levy,
        driver_percentage: policy.driver_percentage,
        net_driver_amount,
        platform_amount,
        payment_method,
        policy_version: policy.version.clone(),
        split_date: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const METHODS: [PaymentMethod; 6] = [
        PaymentMethod::LocalCardOnline,
        PaymentMethod::LocalCardInPerson,
        PaymentMethod::InternationalOnline,
        PaymentMethod::InternationalInPerson,
        PaymentMethod::Amex,
        PaymentMethod::InstantEft,
    ];

    fn assert_balanced(split: &PaymentSplit) {
        assert_eq!(
            split.total_amount,
            split.net_driver_amount
                + split.platform_amount
                + split.payment_gateway_fee
                + split.road_levy,
            "split for {} via {} does not balance",
            split.trip_reference,
            split.payment_method,
        );
    }

    #[test]
    fn local_card_online_worked_example() {
        let policy = SettlementPolicy::default();
        let split = compute_split(
            "TR-8821",
            dec!(150.00),
            PaymentMethod::LocalCardOnline,
            None,
            &policy,
        )
        .unwrap();

        // 150.00 * 2.95% = 4.425 -> 4.43; remainder 140.57;
        // driver 90% = 126.513 -> 126.51; platform gets the residue.
        assert_eq!(split.payment_gateway_fee, dec!(4.43));
        assert_eq!(split.road_levy, dec!(5.00));
        assert_eq!(split.net_driver_amount, dec!(126.51));
        assert_eq!(split.platform_amount, dec!(14.06));
        assert_balanced(&split);
    }

    #[test]
    fn balances_exactly_for_awkward_amounts() {
        let policy = SettlementPolicy::default();
        // Amounts chosen to stress rounding in both the fee and the
        // driver-share step.
        let amounts = [
            dec!(10.01),
            dec!(33.33),
            dec!(99.99),
            dec!(100.00),
            dec!(123.45),
            dec!(150.00),
            dec!(999.99),
            dec!(1234.56),
            dec!(10000.01),
        ];
        for method in METHODS {
            for amount in amounts {
                let split =
                    compute_split("TR-x", amount, method, None, &policy).unwrap();
                assert_balanced(&split);
                assert!(split.net_driver_amount >= Decimal::ZERO);
                assert!(split.platform_amount >= Decimal::ZERO);
            }
        }
    }

    #[test]
    fn rejects_non_positive_gross() {
        let policy = SettlementPolicy::default();
        for amount in [Decimal::ZERO, dec!(-1.00)] {
            let err = compute_split(
                "TR-x",
                amount,
                PaymentMethod::LocalCardOnline,
                None,
                &policy,
            )
            .unwrap_err();
            assert!(matches!(err, SettlementError::InvalidAmount(_)));
        }
    }

    #[test]
    fn rejects_gross_below_fees() {
        let policy = SettlementPolicy::default();
        // 4.00 gross cannot cover the 5.00 levy
        let err = compute_split(
            "TR-x",
            dec!(4.00),
            PaymentMethod::InstantEft,
            None,
            &policy,
        )
        .unwrap_err();
        assert!(matches!(err, SettlementError::InvalidAmount(_)));
    }

    #[test]
    fn rejects_invalid_policy() {
        let policy = SettlementPolicy {
            driver_percentage: 101,
            ..Default::default()
        };
        let err = compute_split(
            "TR-x",
            dec!(150.00),
            PaymentMethod::LocalCardOnline,
            None,
            &policy,
        )
        .unwrap_err();
        assert!(matches!(err, SettlementError::InvalidPolicy(_)));
    }

    #[test]
    fn records_policy_version_and_inputs() {
        let policy = SettlementPolicy {
            version: "2025-01".to_string(),
            ..Default::default()
        };
        let split = compute_split(
            "TR-42",
            dec!(200.00),
            PaymentMethod::Amex,
            Some("wallet-rider"),
            &policy,
        )
        .unwrap();
        assert_eq!(split.policy_version, "2025-01");
        assert_eq!(split.driver_percentage, 90);
        assert_eq!(split.rider_wallet_id.as_deref(), Some("wallet-rider"));
        assert_eq!(split.payment_method, PaymentMethod::Amex);
    }

    #[test]
    fn driver_percentage_zero_gives_everything_to_platform() {
        let policy = SettlementPolicy {
            driver_percentage: 0,
            ..Default::default()
        };
        let split = compute_split(
            "TR-x",
            dec!(150.00),
            PaymentMethod::InstantEft,
            None,
            &policy,
        )
        .unwrap();
        assert_eq!(split.net_driver_amount, Decimal::ZERO);
        assert_balanced(&split);
    }
}
