// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Billing Core
//!
//! Tests critical boundary conditions in:
//! - Proration math (PRO-01 to PRO-06)
//! - Plan change decisions and idempotent replay (SUB-01 to SUB-06)
//! - Dunning escalation (DUN-01 to DUN-04)
//! - Ledger amounts (LED-01 to LED-03)

#[cfg(test)]
mod proration_edge_tests {
    use crate::catalog::test_plan;
    use crate::proration::{add_months, prorate};
    use time::macros::datetime;

    // =========================================================================
    // PRO-01: Half the period remaining - both sides prorate to 50%
    // =========================================================================
    #[test]
    fn test_midperiod_upgrade_charges_half_difference() {
        let basic = test_plan("home_basic", 100_000);
        let premium = test_plan("home_plus", 200_000);

        // Period spans two days, "now" is exactly in the middle.
        let start = datetime!(2024-06-01 00:00 UTC);
        let end = datetime!(2024-06-03 00:00 UTC);
        let now = datetime!(2024-06-02 00:00 UTC);

        let p = prorate(&basic, &premium, Some((start, end)), now);
        assert_eq!(p.proration_charge, 100_000, "half of the premium price");
        assert_eq!(p.proration_credit, 50_000, "half of the basic price");
        assert_eq!(p.amount_due, 50_000);
    }

    // =========================================================================
    // PRO-02: Full period remaining - due equals the full price difference
    // =========================================================================
    #[test]
    fn test_full_period_remaining_charges_full_difference() {
        let basic = test_plan("home_basic", 100_000);
        let premium = test_plan("home_plus", 200_000);

        let start = datetime!(2024-06-01 00:00 UTC);
        let end = datetime!(2024-07-01 00:00 UTC);

        let p = prorate(&basic, &premium, Some((start, end)), start);
        assert_eq!(p.proration_charge, 200_000);
        assert_eq!(p.proration_credit, 100_000);
        assert_eq!(p.amount_due, 100_000);
    }

    // =========================================================================
    // PRO-03: now == period_end - period lapsed, full new price, zero credit
    // =========================================================================
    #[test]
    fn test_change_at_exact_period_end_charges_full_new_price() {
        let basic = test_plan("home_basic", 100_000);
        let premium = test_plan("home_plus", 200_000);

        let start = datetime!(2024-06-01 00:00 UTC);
        let end = datetime!(2024-07-01 00:00 UTC);

        let p = prorate(&basic, &premium, Some((start, end)), end);
        assert_eq!(p.proration_charge, 200_000, "full new-plan price");
        assert_eq!(p.proration_credit, 0, "nothing left to credit");
        assert_eq!(p.amount_due, 200_000);
        // A fresh monthly period starts at the change.
        assert_eq!(p.period_start, end);
        assert_eq!(p.period_end, add_months(end, 1));
    }

    // =========================================================================
    // PRO-04: One millisecond of period left - floor rounds both sides to 0
    // =========================================================================
    #[test]
    fn test_sliver_of_period_floors_to_zero() {
        let basic = test_plan("home_basic", 100_000);
        let premium = test_plan("home_plus", 200_000);

        let start = datetime!(2024-06-01 00:00 UTC);
        let end = datetime!(2024-07-01 00:00 UTC);
        let now = end - time::Duration::milliseconds(1);

        let p = prorate(&basic, &premium, Some((start, end)), now);
        assert_eq!(p.proration_charge, 0);
        assert_eq!(p.proration_credit, 0);
        assert_eq!(p.amount_due, 0);
    }

    // =========================================================================
    // PRO-05: Amounts are never negative, whatever the price spread
    // =========================================================================
    #[test]
    fn test_amount_due_clamps_at_zero() {
        let expensive = test_plan("home_max", 900_000);
        let cheap = test_plan("home_lite", 10_000);

        let start = datetime!(2024-06-01 00:00 UTC);
        let end = datetime!(2024-07-01 00:00 UTC);
        let now = datetime!(2024-06-15 00:00 UTC);

        let p = prorate(&expensive, &cheap, Some((start, end)), now);
        assert!(p.proration_credit > p.proration_charge);
        assert_eq!(p.amount_due, 0, "downgrade credit never goes negative");
    }

    // =========================================================================
    // PRO-06: Free target plan - zero charge, credit irrelevant
    // =========================================================================
    #[test]
    fn test_downgrade_to_free_plan_is_zero_due() {
        let paid = test_plan("home_plus", 200_000);
        let free = test_plan("home_free", 0);

        let start = datetime!(2024-06-01 00:00 UTC);
        let end = datetime!(2024-07-01 00:00 UTC);
        let now = datetime!(2024-06-10 00:00 UTC);

        let p = prorate(&paid, &free, Some((start, end)), now);
        assert_eq!(p.proration_charge, 0);
        assert_eq!(p.amount_due, 0);
    }
}

#[cfg(test)]
mod change_decision_tests {
    use caresight_shared::{PaymentId, SubscriptionId, TransactionId};
    use time::macros::datetime;

    use crate::catalog::test_plan;
    use crate::ledger::{Transaction, TransactionAction, TransactionStatus};
    use crate::subscriptions::{decide_change, ChangeDecision, ChangeStatus, SubscriptionService};

    fn stored_transaction(status: TransactionStatus, amount_total: i64) -> Transaction {
        Transaction {
            id: TransactionId::new(),
            subscription_id: SubscriptionId::new(),
            plan_code: "home_plus".to_string(),
            plan_snapshot: serde_json::json!({}),
            plan_snapshot_old: None,
            plan_snapshot_new: None,
            amount_subtotal: amount_total,
            amount_discount: 0,
            amount_tax: 0,
            amount_total,
            currency: "VND".to_string(),
            period_start: Some(datetime!(2024-06-10 00:00 UTC)),
            period_end: Some(datetime!(2024-07-01 00:00 UTC)),
            action: TransactionAction::Upgrade,
            status,
            provider: None,
            provider_payment_id: None,
            payment_id: Some(PaymentId::new()),
            idempotency_key: Some("upgrade-key-123".to_string()),
            related_tx_id: None,
            proration_charge: amount_total,
            proration_credit: 0,
            is_proration: true,
            notes: None,
            created_at: datetime!(2024-06-10 00:00 UTC),
            updated_at: datetime!(2024-06-10 00:00 UTC),
        }
    }

    // =========================================================================
    // SUB-01: Replaying an open transaction reports requires_action again
    // =========================================================================
    #[test]
    fn test_replay_of_open_transaction_requires_action() {
        let tx = stored_transaction(TransactionStatus::Open, 50_000);
        let expected_id = tx.id;

        let outcome = SubscriptionService::replay_outcome(tx);
        assert_eq!(outcome.status, ChangeStatus::RequiresAction);
        assert_eq!(outcome.transaction_id, Some(expected_id));
        assert_eq!(outcome.amount_due, 50_000);
        assert!(outcome.replayed);
    }

    // =========================================================================
    // SUB-02: Replaying a settled transaction reports success with the same id
    // =========================================================================
    #[test]
    fn test_replay_of_paid_transaction_reports_success() {
        let tx = stored_transaction(TransactionStatus::Paid, 50_000);
        let expected_id = tx.id;

        let outcome = SubscriptionService::replay_outcome(tx);
        assert_eq!(outcome.status, ChangeStatus::Success);
        assert_eq!(outcome.transaction_id, Some(expected_id));
        assert!(outcome.replayed);
    }

    // =========================================================================
    // SUB-03: Replaying an overdue transaction still requires action
    // =========================================================================
    #[test]
    fn test_replay_of_overdue_transaction_requires_action() {
        let tx = stored_transaction(TransactionStatus::Overdue, 50_000);
        let outcome = SubscriptionService::replay_outcome(tx);
        assert_eq!(outcome.status, ChangeStatus::RequiresAction);
    }

    // =========================================================================
    // SUB-04: Same plan code is a no-op regardless of period position
    // =========================================================================
    #[test]
    fn test_same_plan_no_op_at_any_time() {
        let plan = test_plan("home_basic", 100_000);
        let bounds = Some((
            datetime!(2024-06-01 00:00 UTC),
            datetime!(2024-07-01 00:00 UTC),
        ));

        for now in [
            datetime!(2024-06-01 00:00 UTC),
            datetime!(2024-06-15 12:00 UTC),
            datetime!(2024-08-01 00:00 UTC),
        ] {
            assert_eq!(
                decide_change(&plan, &plan, bounds, now),
                ChangeDecision::NoOp
            );
        }
    }

    // =========================================================================
    // SUB-05: Billable decision carries the exact due the ledger will store
    // =========================================================================
    #[test]
    fn test_billable_decision_amount_matches_capped_discount() {
        let old = test_plan("home_basic", 100_000);
        let new = test_plan("home_plus", 200_000);
        let bounds = Some((
            datetime!(2024-06-01 00:00 UTC),
            datetime!(2024-07-01 00:00 UTC),
        ));

        match decide_change(&old, &new, bounds, datetime!(2024-06-16 00:00 UTC)) {
            ChangeDecision::RequirePayment(p) => {
                // amount_total = subtotal - discount with discount capped by
                // the charge, so it must equal the computed due.
                let discount = p.proration_credit.min(p.proration_charge);
                assert_eq!(p.proration_charge - discount, p.amount_due);
            }
            other => panic!("expected RequirePayment, got {:?}", other),
        }
    }

    // =========================================================================
    // SUB-06: Changes without a current period bill the full new price
    // =========================================================================
    #[test]
    fn test_change_without_period_requires_full_payment() {
        let old = test_plan("home_basic", 100_000);
        let new = test_plan("home_plus", 200_000);

        match decide_change(&old, &new, None, datetime!(2024-06-16 00:00 UTC)) {
            ChangeDecision::RequirePayment(p) => {
                assert_eq!(p.amount_due, 200_000);
                assert_eq!(p.proration_credit, 0);
            }
            other => panic!("expected RequirePayment, got {:?}", other),
        }
    }
}

#[cfg(test)]
mod dunning_edge_tests {
    use crate::dunning::{DunningAction, DunningPolicy};

    // =========================================================================
    // DUN-01: Attempt exactly at the past_due threshold escalates
    // =========================================================================
    #[test]
    fn test_exact_past_due_threshold() {
        let policy = DunningPolicy {
            past_due_after_attempts: 3,
            suspend_after_attempts: 6,
            retry_interval_hours: 24,
            pause_on_exhaust: true,
        };
        assert_eq!(policy.next_action(2), DunningAction::Retry);
        assert_eq!(policy.next_action(3), DunningAction::MarkPastDue);
    }

    // =========================================================================
    // DUN-02: Attempt exactly at the suspension threshold suspends
    // =========================================================================
    #[test]
    fn test_exact_suspend_threshold() {
        let policy = DunningPolicy {
            past_due_after_attempts: 3,
            suspend_after_attempts: 6,
            retry_interval_hours: 24,
            pause_on_exhaust: true,
        };
        assert_eq!(policy.next_action(5), DunningAction::MarkPastDue);
        assert_eq!(policy.next_action(6), DunningAction::Suspend);
    }

    // =========================================================================
    // DUN-03: Single-attempt policy goes straight past retry
    // =========================================================================
    #[test]
    fn test_aggressive_policy_skips_retry() {
        let policy = DunningPolicy {
            past_due_after_attempts: 1,
            suspend_after_attempts: 1,
            retry_interval_hours: 1,
            pause_on_exhaust: false,
        };
        assert_eq!(policy.next_action(1), DunningAction::Suspend);
    }

    // =========================================================================
    // DUN-04: Stage reporting tracks escalation
    // =========================================================================
    #[test]
    fn test_stage_is_monotonic_in_attempts() {
        let policy = DunningPolicy::default();
        let stages: Vec<i32> = (0..8).map(|n| policy.stage_for(n)).collect();
        for pair in stages.windows(2) {
            assert!(pair[0] <= pair[1], "stage regressed: {:?}", stages);
        }
    }
}

#[cfg(test)]
mod ledger_edge_tests {
    use crate::ledger::TransactionStatus;

    // =========================================================================
    // LED-01: Only draft/open/overdue rows can settle
    // =========================================================================
    #[test]
    fn test_frozen_rows_cannot_settle() {
        // The reconciliation replay guard is exactly this predicate: a second
        // webhook finds `paid` and becomes a no-op.
        assert!(!TransactionStatus::Paid.is_settleable());
        assert!(!TransactionStatus::Void.is_settleable());
        assert!(TransactionStatus::Open.is_settleable());
        assert!(TransactionStatus::Overdue.is_settleable());
    }
}
