//! Admission checks against the shared ceiling.

mod common;

use chrono::Utc;
use common::{date, email, wallet, Harness};
use compliance_engine::{
    AdmissionRequest, Cents, ContributionRequest, ContributionStore, DonationType, DonorKey, Frequency,
    MockLedger, PaymentRail, RecurringDetails, RefusalReason, SubmissionResult, Wei,
};

/// A second $2,000 contribution is refused with $1,300 left under a $3,300 ceiling.
#[tokio::test]
async fn test_second_contribution_over_ceiling_refused() {
    let h = Harness::new(MockLedger::new());
    let donor = email("casey@example.org");
    h.register(&donor);

    let first = ContributionRequest::one_time(donor.clone(), Cents::from_dollars(2000), PaymentRail::Traditional);
    assert!(h.coordinator.submit(&first).await.is_completed());

    let second = ContributionRequest::one_time(donor.clone(), Cents::from_dollars(2000), PaymentRail::Traditional);
    match h.coordinator.submit(&second).await {
        SubmissionResult::Refused { admission } => {
            assert_eq!(admission.reason, Some(RefusalReason::ExceedsRemainingCapacity));
            assert_eq!(admission.remaining_capacity, Cents::from_dollars(1300));
            assert_eq!(admission.current_total, Cents::from_dollars(2000));
        }
        other => panic!("expected refusal, got {:?}", other),
    }

    let state = h.limit_state(&donor);
    assert_eq!(state.total_contributed_fiat, Cents::from_dollars(2000));
    assert_eq!(state.remaining_capacity_fiat, Cents::from_dollars(1300));
}

/// On-chain and traditional contributions count against the same limit.
#[tokio::test]
async fn test_rails_share_one_limit() {
    let h = Harness::new(MockLedger::new().with_kyc(&wallet()));
    let donor = DonorKey::Wallet(wallet());

    let on_chain = ContributionRequest::one_time(donor.clone(), Cents::from_dollars(2000), PaymentRail::OnChain);
    assert!(h.coordinator.submit(&on_chain).await.is_completed());

    let card = ContributionRequest::one_time(donor.clone(), Cents::from_dollars(2000), PaymentRail::Traditional);
    match h.coordinator.submit(&card).await {
        SubmissionResult::Refused { admission } => {
            assert_eq!(admission.remaining_capacity, Cents::from_dollars(1300));
        }
        other => panic!("expected refusal, got {:?}", other),
    }

    let card = ContributionRequest::one_time(donor.clone(), Cents::from_dollars(1300), PaymentRail::Traditional);
    assert!(h.coordinator.submit(&card).await.is_completed());
    assert_eq!(h.limit_state(&donor).remaining_capacity_fiat, Cents::ZERO);
}

/// Contributions made outside the engine still count through the ledger total.
#[tokio::test]
async fn test_external_chain_contribution_counts() {
    let h = Harness::new(MockLedger::new().with_kyc(&wallet()));
    let donor = DonorKey::Wallet(wallet());
    // One native unit at $3,000
    h.ledger
        .record_external_contribution(&wallet(), Wei::new(1_000_000_000_000_000_000));

    let result = h
        .calculator
        .evaluate(&AdmissionRequest::one_time(donor, Cents::from_dollars(500), PaymentRail::Traditional))
        .await
        .unwrap();
    assert!(!result.admissible);
    assert_eq!(result.current_total, Cents::from_dollars(3000));
    assert_eq!(result.remaining_capacity, Cents::from_dollars(300));
}

/// $100 a month from January 2024 fits 33 payments under $3,300.
#[tokio::test]
async fn test_monthly_projection_auto_cancels() {
    let h = Harness::new(MockLedger::new());
    let donor = email("robin@example.org");
    h.register(&donor);

    let request = AdmissionRequest {
        donor,
        amount: Cents::from_dollars(100),
        rail: PaymentRail::Traditional,
        donation_type: DonationType::Recurring,
        recurring: Some(RecurringDetails {
            frequency: Frequency::Monthly,
            start_date: date(2024, 1, 1),
            end_date: None,
        }),
    };
    let result = h.calculator.evaluate(&request).await.unwrap();
    assert!(result.admissible);

    let projection = result.projection.unwrap();
    assert_eq!(projection.payment_count, 33);
    assert_eq!(projection.total_projected_amount, Cents::from_dollars(3300));
    assert!(projection.will_exceed_limit);
    assert_eq!(projection.auto_cancel_date, Some(date(2026, 9, 1)));
}

/// An unreachable ledger refuses rather than admitting on stale data.
#[tokio::test]
async fn test_ledger_outage_fails_closed() {
    let h = Harness::new(MockLedger::new().with_kyc(&wallet()).with_reachable(false));
    let donor = DonorKey::Wallet(wallet());

    let request = ContributionRequest::one_time(donor.clone(), Cents::from_dollars(50), PaymentRail::OnChain);
    match h.coordinator.submit(&request).await {
        SubmissionResult::Refused { admission } => {
            assert_eq!(admission.reason, Some(RefusalReason::LedgerUnreachable));
        }
        other => panic!("expected refusal, got {:?}", other),
    }
    assert_eq!(h.ledger.send_calls(), 0);
    assert!(h.store.contributions_for_donor(&donor, &h.campaign()).unwrap().is_empty());
}

/// Concurrent attempts cannot jointly overshoot the ceiling.
#[tokio::test]
async fn test_concurrent_submissions_respect_ceiling() {
    let h = Harness::new(MockLedger::new());
    let donor = email("sam@example.org");
    h.register(&donor);

    let a = ContributionRequest::one_time(donor.clone(), Cents::from_dollars(2000), PaymentRail::Traditional);
    let b = ContributionRequest::one_time(donor.clone(), Cents::from_dollars(2000), PaymentRail::Traditional);
    let (ra, rb) = tokio::join!(h.coordinator.submit(&a), h.coordinator.submit(&b));

    let completed = [ra.is_completed(), rb.is_completed()].iter().filter(|c| **c).count();
    assert_eq!(completed, 1);
    assert_eq!(h.limit_state(&donor).total_contributed_fiat, Cents::from_dollars(2000));
}

/// Pending scheduled contributions reserve capacity.
#[tokio::test]
async fn test_scheduled_contribution_reserves_capacity() {
    let h = Harness::new(MockLedger::new());
    let donor = email("kai@example.org");
    h.register(&donor);

    let later = Utc::now().date_naive() + chrono::Days::new(30);
    let scheduled = ContributionRequest::scheduled(donor.clone(), Cents::from_dollars(3000), later);
    assert!(h.coordinator.submit(&scheduled).await.is_completed());

    let state = h.limit_state(&donor);
    assert_eq!(state.total_contributed_fiat, Cents::ZERO);
    assert_eq!(state.reserved_fiat, Cents::from_dollars(3000));

    let more = ContributionRequest::one_time(donor, Cents::from_dollars(500), PaymentRail::Traditional);
    assert!(matches!(
        h.coordinator.submit(&more).await,
        SubmissionResult::Refused { .. }
    ));
}

/// Unknown email donors cannot be verified.
#[tokio::test]
async fn test_unregistered_email_donor_refused() {
    let h = Harness::new(MockLedger::new());
    let request = AdmissionRequest::one_time(
        email("nobody@example.org"),
        Cents::from_dollars(10),
        PaymentRail::Traditional,
    );
    let result = h.calculator.evaluate(&request).await.unwrap();
    assert_eq!(result.reason, Some(RefusalReason::IdentityUnverifiable));
}
