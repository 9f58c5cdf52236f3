//! Compound submissions.
//!
//! A first-time donor may arrive with a profile, a KYC attestation and a
//! contribution in one request. The steps run in order; if one fails, the
//! steps already done are compensated newest first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{ContributionRequest, ContributionWriteCoordinator, FinalState, SubmissionResult};
use crate::error::{DonorNotice, EngineError};
use crate::identity::DonorKey;
use crate::models::{DonorProfile, KycAttestation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStep {
    RegisterDonor,
    RecordKyc,
    Contribute,
}

/// Off-chain identity check supplied with a compound request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KycEvidence {
    pub provider: String,
    pub verified: bool,
    pub attested_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CompoundRequest {
    pub display_name: Option<String>,
    pub kyc: KycEvidence,
    pub contribution: ContributionRequest,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompoundResult {
    pub success: bool,
    /// Some steps committed before the failure
    pub partial_completion: bool,
    pub completed_steps: Vec<SagaStep>,
    pub failed_step: Option<SagaStep>,
    /// Compensations that ran successfully
    pub rollback_operations: u32,
    pub final_state: FinalState,
    pub contribution: Option<SubmissionResult>,
    pub notice: Option<DonorNotice>,
}

/// Undo record for a committed step.
enum Compensation {
    DeleteDonor(DonorKey),
    DeleteKyc(Uuid),
}

impl Compensation {
    fn apply(&self, coordinator: &ContributionWriteCoordinator) -> Result<bool, EngineError> {
        match self {
            Compensation::DeleteDonor(donor) => coordinator.store().delete_donor(donor),
            Compensation::DeleteKyc(id) => coordinator.store().delete_kyc(*id),
        }
    }
}

impl ContributionWriteCoordinator {
    /// Register the donor, record their KYC attestation, then contribute.
    pub async fn submit_compound(&self, request: &CompoundRequest) -> CompoundResult {
        let donor = request.contribution.donor.clone();
        let mut done: Vec<(SagaStep, Option<Compensation>)> = Vec::new();

        let profile = DonorProfile {
            donor_key: donor.clone(),
            display_name: request.display_name.clone(),
            registered_at: Utc::now(),
        };
        match self.store().register_donor(&profile) {
            Ok(true) => done.push((SagaStep::RegisterDonor, Some(Compensation::DeleteDonor(donor.clone())))),
            // Already known; nothing of ours to undo
            Ok(false) => done.push((SagaStep::RegisterDonor, None)),
            Err(e) => return self.unwind(done, SagaStep::RegisterDonor, e.donor_notice(), None),
        }

        let attestation = KycAttestation {
            id: Uuid::new_v4(),
            donor_key: donor.clone(),
            provider: request.kyc.provider.clone(),
            verified: request.kyc.verified,
            attested_at: request.kyc.attested_at,
        };
        if let Err(e) = self.store().insert_kyc(&attestation) {
            return self.unwind(done, SagaStep::RecordKyc, e.donor_notice(), None);
        }
        done.push((SagaStep::RecordKyc, Some(Compensation::DeleteKyc(attestation.id))));

        let result = self.submit(&request.contribution).await;
        match result.final_state() {
            FinalState::Completed => {
                done.push((SagaStep::Contribute, None));
                info!(donor = %donor, "Compound submission completed");
                CompoundResult {
                    success: true,
                    partial_completion: false,
                    completed_steps: done.into_iter().map(|(step, _)| step).collect(),
                    failed_step: None,
                    rollback_operations: 0,
                    final_state: FinalState::Completed,
                    notice: result.notice(),
                    contribution: Some(result),
                }
            }
            FinalState::Unknown => {
                // Funds may be in flight; keep the donor and attestation
                warn!(donor = %donor, "Compound submission left pending, not rolling back");
                CompoundResult {
                    success: false,
                    partial_completion: true,
                    completed_steps: done.into_iter().map(|(step, _)| step).collect(),
                    failed_step: Some(SagaStep::Contribute),
                    rollback_operations: 0,
                    final_state: FinalState::Unknown,
                    notice: result.notice(),
                    contribution: Some(result),
                }
            }
            FinalState::Failed | FinalState::RolledBack => {
                let notice = result
                    .notice()
                    .unwrap_or_else(|| EngineError::NotAdmissible(String::new()).donor_notice());
                self.unwind(done, SagaStep::Contribute, notice, Some(result))
            }
        }
    }

    fn unwind(
        &self,
        done: Vec<(SagaStep, Option<Compensation>)>,
        failed_step: SagaStep,
        notice: DonorNotice,
        contribution: Option<SubmissionResult>,
    ) -> CompoundResult {
        let completed_steps: Vec<SagaStep> = done.iter().map(|(step, _)| *step).collect();
        let mut rollback_operations = 0;
        let mut clean = true;

        for (step, compensation) in done.into_iter().rev() {
            let Some(compensation) = compensation else { continue };
            match compensation.apply(self) {
                Ok(_) => rollback_operations += 1,
                Err(e) => {
                    clean = false;
                    error!(?step, error = %e, "Compensation failed");
                }
            }
        }

        warn!(?failed_step, rollback_operations, "Compound submission rolled back");
        CompoundResult {
            success: false,
            partial_completion: !completed_steps.is_empty(),
            completed_steps,
            failed_step: Some(failed_step),
            rollback_operations,
            final_state: if clean { FinalState::RolledBack } else { FinalState::Failed },
            contribution,
            notice: Some(notice),
        }
    }
}
