//! Recurring and scheduled payment issuance.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::compliance::{payment_date, project_recurring, ComplianceCalculator};
use crate::coordinator::{ContributionWriteCoordinator, SubmissionResult};
use crate::error::EngineError;
use crate::models::{ContributionStatus, PlanStatus, RecurringPlan};
use crate::money::Cents;
use crate::store::{ContributionStore, StatusUpdate};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerReport {
    pub payments_issued: u32,
    pub scheduled_completed: u32,
    pub plans_completed: u32,
    pub plans_auto_cancelled: u32,
    /// Payments that failed for infrastructure reasons and will be retried
    pub deferred: u32,
}

pub struct PaymentScheduler {
    store: Arc<dyn ContributionStore>,
    coordinator: Arc<ContributionWriteCoordinator>,
    calculator: Arc<ComplianceCalculator>,
}

/// Why a plan stops issuing.
fn termination(plan: &RecurringPlan, next: Option<NaiveDate>) -> Option<PlanStatus> {
    let Some(next) = next else {
        return Some(PlanStatus::Completed);
    };
    if plan.auto_cancel_date.is_some_and(|cancel| next > cancel) {
        return Some(PlanStatus::AutoCancelled);
    }
    if plan.payments_issued >= plan.payment_count {
        return Some(if plan.auto_cancel_date.is_some() {
            PlanStatus::AutoCancelled
        } else {
            PlanStatus::Completed
        });
    }
    if plan.end_date.is_some_and(|end| next > end) {
        return Some(PlanStatus::Completed);
    }
    None
}

impl PaymentScheduler {
    pub fn new(
        store: Arc<dyn ContributionStore>,
        coordinator: Arc<ContributionWriteCoordinator>,
        calculator: Arc<ComplianceCalculator>,
    ) -> Self {
        Self {
            store,
            coordinator,
            calculator,
        }
    }

    /// Issue every payment due on or before `today`.
    pub async fn process_due(&self, today: NaiveDate) -> Result<SchedulerReport, EngineError> {
        let mut report = SchedulerReport::default();

        for plan in self.store.active_plans()? {
            self.process_plan(plan, today, &mut report).await?;
        }

        for record in self.store.due_scheduled(today)? {
            match self.store.transition(
                record.id,
                ContributionStatus::Pending,
                ContributionStatus::Completed,
                StatusUpdate::default(),
            ) {
                Ok(done) => {
                    info!(id = %done.id, donor = %done.donor_key, amount = %done.amount_fiat, "Scheduled contribution settled");
                    report.scheduled_completed += 1;
                }
                Err(EngineError::ConcurrentModification(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if report != SchedulerReport::default() {
            info!(
                issued = report.payments_issued,
                scheduled = report.scheduled_completed,
                completed = report.plans_completed,
                auto_cancelled = report.plans_auto_cancelled,
                deferred = report.deferred,
                "Payment run finished"
            );
        }
        Ok(report)
    }

    async fn process_plan(
        &self,
        mut plan: RecurringPlan,
        today: NaiveDate,
        report: &mut SchedulerReport,
    ) -> Result<(), EngineError> {
        loop {
            let next = payment_date(plan.start_date, plan.frequency, plan.payments_issued);
            if let Some(status) = termination(&plan, next) {
                return self.finish(plan, status, report);
            }
            let Some(due) = next.filter(|d| *d <= today) else {
                return Ok(());
            };

            let result = self
                .coordinator
                .submit_plan_payment(&plan, plan.payments_issued, due)
                .await;
            match result {
                SubmissionResult::Completed { record, .. } => {
                    debug!(plan = %plan.id, payment = plan.payments_issued, id = %record.id, %due, "Recurring payment issued");
                    plan.payments_issued += 1;
                    self.store.update_plan(&plan)?;
                    report.payments_issued += 1;
                }
                SubmissionResult::Refused { admission } => {
                    warn!(plan = %plan.id, reason = ?admission.reason, "Recurring payment refused, cancelling plan");
                    return self.finish(plan, PlanStatus::AutoCancelled, report);
                }
                other => {
                    warn!(plan = %plan.id, state = ?other.final_state(), "Recurring payment deferred");
                    report.deferred += 1;
                    return Ok(());
                }
            }
        }
    }

    fn finish(
        &self,
        mut plan: RecurringPlan,
        status: PlanStatus,
        report: &mut SchedulerReport,
    ) -> Result<(), EngineError> {
        plan.status = status;
        self.store.update_plan(&plan)?;
        match status {
            PlanStatus::AutoCancelled => report.plans_auto_cancelled += 1,
            _ => report.plans_completed += 1,
        }
        info!(plan = %plan.id, donor = %plan.donor_key, issued = plan.payments_issued, %status, "Recurring plan ended");
        Ok(())
    }

    /// Stop a plan. Already issued payments are untouched.
    pub fn cancel_plan(&self, id: Uuid) -> Result<RecurringPlan, EngineError> {
        let mut plan = self.active_plan(id)?;
        plan.status = PlanStatus::Cancelled;
        self.store.update_plan(&plan)?;
        info!(plan = %id, issued = plan.payments_issued, "Recurring plan cancelled");
        Ok(plan)
    }

    /// Re-project the remaining payments, optionally with a new amount.
    ///
    /// The projection starts at the next unissued payment and runs against
    /// the donor's current remaining capacity.
    pub fn recompute_plan(&self, id: Uuid, new_amount: Option<Cents>) -> Result<RecurringPlan, EngineError> {
        let mut plan = self.active_plan(id)?;
        let issued_total = Cents::new(plan.amount_per_payment.as_u64() * plan.payments_issued as u64);
        if let Some(amount) = new_amount {
            if amount.is_zero() {
                return Err(EngineError::Validation("amount must be positive".into()));
            }
            plan.amount_per_payment = amount;
        }

        let config = self.calculator.config();
        let state = self.store.limit_state(&plan.donor_key, &plan.campaign_id, config.ceiling)?;
        let next = payment_date(plan.start_date, plan.frequency, plan.payments_issued)
            .ok_or_else(|| EngineError::Validation("plan has no further payment dates".into()))?;
        let projection = project_recurring(
            plan.amount_per_payment,
            plan.frequency,
            next,
            plan.end_date,
            state.remaining_capacity_fiat,
        );

        plan.payment_count = plan.payments_issued + projection.payment_count;
        plan.total_projected_amount = issued_total + projection.total_projected_amount;
        plan.auto_cancel_date = projection.auto_cancel_date;
        if projection.payment_count == 0 {
            plan.status = PlanStatus::AutoCancelled;
        }
        self.store.update_plan(&plan)?;
        info!(
            plan = %id,
            payments = plan.payment_count,
            auto_cancel = ?plan.auto_cancel_date,
            "Recurring plan re-projected"
        );
        Ok(plan)
    }

    fn active_plan(&self, id: Uuid) -> Result<RecurringPlan, EngineError> {
        let plan = self
            .store
            .get_plan(id)?
            .ok_or_else(|| EngineError::Validation(format!("unknown plan {}", id)))?;
        if plan.status != PlanStatus::Active {
            return Err(EngineError::Validation(format!("plan {} is {}", id, plan.status)));
        }
        Ok(plan)
    }

    /// Run `process_due` every `interval` until shutdown.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut timer = tokio::time::interval(interval);
        info!(interval_secs = interval.as_secs(), "Payment scheduler started");
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let today = Utc::now().date_naive();
                    if let Err(e) = self.process_due(today).await {
                        warn!(error = %e, "Payment run failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("Payment scheduler shutting down");
                    break;
                }
            }
        }
    }
}
