//! SQLite-backed contribution store.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::schema;
use super::*;
use crate::error::ConstraintKind;
use crate::models::{DonationType, Frequency, PlanStatus};
use crate::money::NativeRate;

const CONTRIBUTION_COLUMNS: &str = "id, donor_key, campaign_id, amount_fiat_cents, amount_native,
    native_rate_cents, payment_rail, chain_tx_hash, transaction_code, donation_type, status,
    block_number, gas_used, plan_id, scheduled_for, created_at, updated_at";

const PLAN_COLUMNS: &str = "id, donor_key, campaign_id, amount_per_payment_cents, frequency,
    start_date, end_date, payment_count, total_projected_cents, auto_cancel_date,
    payments_issued, status, created_at, updated_at";

/// Contribution store on a single SQLite connection.
pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create `contributions.db` in `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self, EngineError> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| EngineError::Storage(format!("creating {}: {}", data_dir.display(), e)))?;
        let db_path = data_dir.join("contributions.db");
        let db = Connection::open(&db_path)?;
        schema::migrate(&db)?;
        info!(path = %db_path.display(), "Contribution store initialized");
        Ok(Self { db: Mutex::new(db) })
    }

    pub fn open_in_memory() -> Result<Self, EngineError> {
        let db = Connection::open_in_memory()?;
        schema::migrate(&db)?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, EngineError> {
        self.db
            .lock()
            .map_err(|_| EngineError::Storage("store connection mutex poisoned".to_string()))
    }
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: String = row.get(idx)?;
    text.parse().map_err(|e| conversion_error(idx, e))
}

fn parse_opt_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: Option<String> = row.get(idx)?;
    text.map(|t| t.parse().map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn row_to_contribution(row: &Row<'_>) -> rusqlite::Result<ContributionRecord> {
    let rate: Option<i64> = row.get(5)?;
    Ok(ContributionRecord {
        id: parse_col(row, 0)?,
        donor_key: parse_col(row, 1)?,
        campaign_id: row.get(2)?,
        amount_fiat: Cents::new(row.get(3)?),
        amount_native: parse_opt_col::<Wei>(row, 4)?,
        native_rate: rate.and_then(|r| NativeRate::from_cents_per_native(r as u128)),
        payment_rail: parse_col(row, 6)?,
        chain_tx_hash: parse_opt_col(row, 7)?,
        transaction_code: parse_opt_col(row, 8)?,
        donation_type: parse_col(row, 9)?,
        status: parse_col(row, 10)?,
        block_number: row.get(11)?,
        gas_used: row.get(12)?,
        plan_id: parse_opt_col(row, 13)?,
        scheduled_for: parse_opt_col(row, 14)?,
        created_at: parse_col(row, 15)?,
        updated_at: parse_col(row, 16)?,
    })
}

fn row_to_plan(row: &Row<'_>) -> rusqlite::Result<RecurringPlan> {
    Ok(RecurringPlan {
        id: parse_col(row, 0)?,
        donor_key: parse_col(row, 1)?,
        campaign_id: row.get(2)?,
        amount_per_payment: Cents::new(row.get(3)?),
        frequency: parse_col::<Frequency>(row, 4)?,
        start_date: parse_col(row, 5)?,
        end_date: parse_opt_col(row, 6)?,
        payment_count: row.get(7)?,
        total_projected_amount: Cents::new(row.get(8)?),
        auto_cancel_date: parse_opt_col(row, 9)?,
        payments_issued: row.get(10)?,
        status: parse_col::<PlanStatus>(row, 11)?,
        created_at: parse_col(row, 12)?,
        updated_at: parse_col(row, 13)?,
    })
}

fn query_contribution(db: &Connection, id: Uuid) -> Result<Option<ContributionRecord>, EngineError> {
    let sql = format!("SELECT {} FROM contributions WHERE id = ?1", CONTRIBUTION_COLUMNS);
    let mut stmt = db.prepare_cached(&sql)?;
    Ok(stmt
        .query_row([id.to_string()], row_to_contribution)
        .optional()?)
}

fn query_active_by_hash(
    db: &Connection,
    tx_hash: &TxHash,
) -> Result<Option<ContributionRecord>, EngineError> {
    let sql = format!(
        "SELECT {} FROM contributions
         WHERE chain_tx_hash = ?1 AND status IN ('pending', 'completed', 'reorg_suspect')",
        CONTRIBUTION_COLUMNS
    );
    let mut stmt = db.prepare_cached(&sql)?;
    Ok(stmt
        .query_row([tx_hash.as_str()], row_to_contribution)
        .optional()?)
}

fn query_by_code(
    db: &Connection,
    donor: &DonorKey,
    code: &TransactionCode,
) -> Result<Option<ContributionRecord>, EngineError> {
    let sql = format!(
        "SELECT {} FROM contributions WHERE donor_key = ?1 AND transaction_code = ?2",
        CONTRIBUTION_COLUMNS
    );
    let mut stmt = db.prepare_cached(&sql)?;
    Ok(stmt
        .query_row([donor.as_str(), code.as_str()], row_to_contribution)
        .optional()?)
}

fn query_contributions(
    db: &Connection,
    where_clause: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<ContributionRecord>, EngineError> {
    let sql = format!(
        "SELECT {} FROM contributions WHERE {} ORDER BY created_at, id",
        CONTRIBUTION_COLUMNS, where_clause
    );
    let mut stmt = db.prepare_cached(&sql)?;
    let rows = stmt.query_map(args, row_to_contribution)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn query_totals(db: &Connection, donor: &DonorKey, campaign_id: &str) -> Result<DonorTotals, EngineError> {
    let mut stmt = db.prepare_cached(
        "SELECT status, payment_rail, amount_fiat_cents, amount_native
         FROM contributions WHERE donor_key = ?1 AND campaign_id = ?2",
    )?;
    let mut rows = stmt.query(params![donor.as_str(), campaign_id])?;
    let mut totals = DonorTotals::default();
    while let Some(row) = rows.next()? {
        let status: ContributionStatus = parse_col(row, 0)?;
        let rail: PaymentRail = parse_col(row, 1)?;
        let amount = Cents::new(row.get(2)?);
        let native: Option<Wei> = parse_opt_col(row, 3)?;
        totals.record_count += 1;
        match status {
            ContributionStatus::Completed => {
                totals.completed += amount;
                match rail {
                    PaymentRail::Traditional => totals.completed_traditional += amount,
                    PaymentRail::OnChain => {
                        totals.completed_native = totals.completed_native + native.unwrap_or_default()
                    }
                }
            }
            ContributionStatus::Pending => totals.pending += amount,
            ContributionStatus::ReorgSuspect => totals.suspect += amount,
            _ => {}
        }
    }
    Ok(totals)
}

fn insert_row(db: &Connection, new: &NewContribution) -> Result<ContributionRecord, EngineError> {
    let id = Uuid::new_v4();
    let at = now();
    db.execute(
        "INSERT INTO contributions (id, donor_key, campaign_id, amount_fiat_cents, amount_native,
            native_rate_cents, payment_rail, chain_tx_hash, transaction_code, donation_type, status,
            block_number, gas_used, plan_id, scheduled_for, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16)",
        params![
            id.to_string(),
            new.donor_key.as_str(),
            new.campaign_id,
            new.amount_fiat.as_u64(),
            new.amount_native.map(|w| w.to_string()),
            new.native_rate.map(|r| r.cents_per_native() as i64),
            new.payment_rail.as_str(),
            new.chain_tx_hash.as_ref().map(|h| h.as_str()),
            new.transaction_code.as_ref().map(|c| c.as_str()),
            new.donation_type.as_str(),
            new.status.as_str(),
            new.block_number,
            new.gas_used,
            new.plan_id.map(|p| p.to_string()),
            new.scheduled_for.map(|d| d.to_string()),
            ts(&at),
        ],
    )?;
    query_contribution(db, id)?
        .ok_or_else(|| EngineError::Storage(format!("contribution {} vanished after insert", id)))
}

fn insert_in_tx(
    db: &Connection,
    new: NewContribution,
    guard: CapacityGuard,
) -> Result<InsertOutcome, EngineError> {
    if let Some(hash) = &new.chain_tx_hash {
        if let Some(existing) = query_active_by_hash(db, hash)? {
            let duplicate_row = match &new.transaction_code {
                Some(code)
                    if existing.transaction_code.as_ref() != Some(code)
                        && query_by_code(db, &new.donor_key, code)?.is_none() =>
                {
                    let audit = NewContribution {
                        status: ContributionStatus::Duplicate,
                        ..new.clone()
                    };
                    let row = insert_row(db, &audit)?;
                    warn!(
                        tx_hash = %hash,
                        existing = %existing.id,
                        duplicate = %row.id,
                        "Second attempt for an already recorded transaction"
                    );
                    Some(row.id)
                }
                _ => None,
            };
            return Ok(InsertOutcome::Duplicate {
                existing,
                duplicate_row,
            });
        }
    }

    if let Some(code) = &new.transaction_code {
        if let Some(existing) = query_by_code(db, &new.donor_key, code)? {
            return Ok(InsertOutcome::Duplicate {
                existing,
                duplicate_row: None,
            });
        }
    }

    if let CapacityGuard::Enforce(ceiling) = guard {
        if matches!(
            new.status,
            ContributionStatus::Completed | ContributionStatus::Pending
        ) {
            let totals = query_totals(db, &new.donor_key, &new.campaign_id)?;
            let remaining = ceiling.saturating_sub(totals.completed + totals.pending);
            if new.amount_fiat > remaining {
                debug!(donor = %new.donor_key, %remaining, amount = %new.amount_fiat, "Capacity re-check failed");
                return Ok(InsertOutcome::CapacityExceeded { remaining });
            }
        }
    }

    match insert_row(db, &new) {
        Ok(record) => Ok(InsertOutcome::Inserted(record)),
        Err(EngineError::Constraint {
            kind: ConstraintKind::Unique,
            detail,
        }) => {
            // Lost a race with a writer outside this process
            let existing = match (&new.chain_tx_hash, &new.transaction_code) {
                (Some(hash), _) => query_active_by_hash(db, hash)?,
                (None, Some(code)) => query_by_code(db, &new.donor_key, code)?,
                (None, None) => None,
            };
            match existing {
                Some(existing) => Ok(InsertOutcome::Duplicate {
                    existing,
                    duplicate_row: None,
                }),
                None => Err(EngineError::Constraint {
                    kind: ConstraintKind::Unique,
                    detail,
                }),
            }
        }
        Err(e) => Err(e),
    }
}

impl ContributionStore for SqliteStore {
    fn insert_contribution(
        &self,
        new: NewContribution,
        guard: CapacityGuard,
    ) -> Result<InsertOutcome, EngineError> {
        new.validate()?;
        let mut db = self.lock()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let outcome = insert_in_tx(&tx, new, guard)?;
        tx.commit()?;
        if let InsertOutcome::Inserted(record) = &outcome {
            debug!(
                id = %record.id,
                donor = %record.donor_key,
                status = %record.status,
                amount = %record.amount_fiat,
                "Contribution recorded"
            );
        }
        Ok(outcome)
    }

    fn get_contribution(&self, id: Uuid) -> Result<Option<ContributionRecord>, EngineError> {
        query_contribution(&*self.lock()?, id)
    }

    fn find_active_by_tx_hash(&self, tx_hash: &TxHash) -> Result<Option<ContributionRecord>, EngineError> {
        query_active_by_hash(&*self.lock()?, tx_hash)
    }

    fn find_all_by_tx_hash(&self, tx_hash: &TxHash) -> Result<Vec<ContributionRecord>, EngineError> {
        query_contributions(&*self.lock()?, "chain_tx_hash = ?1", &[&tx_hash.as_str()])
    }

    fn find_by_transaction_code(
        &self,
        donor: &DonorKey,
        code: &TransactionCode,
    ) -> Result<Option<ContributionRecord>, EngineError> {
        query_by_code(&*self.lock()?, donor, code)
    }

    fn contributions_for_donor(
        &self,
        donor: &DonorKey,
        campaign_id: &str,
    ) -> Result<Vec<ContributionRecord>, EngineError> {
        query_contributions(
            &*self.lock()?,
            "donor_key = ?1 AND campaign_id = ?2",
            &[&donor.as_str(), &campaign_id],
        )
    }

    fn contributions_by_status(
        &self,
        status: ContributionStatus,
        rail: Option<PaymentRail>,
    ) -> Result<Vec<ContributionRecord>, EngineError> {
        let db = self.lock()?;
        match rail {
            Some(rail) => query_contributions(
                &db,
                "status = ?1 AND payment_rail = ?2",
                &[&status.as_str(), &rail.as_str()],
            ),
            None => query_contributions(&db, "status = ?1", &[&status.as_str()]),
        }
    }

    fn transition(
        &self,
        id: Uuid,
        expected: ContributionStatus,
        next: ContributionStatus,
        update: StatusUpdate,
    ) -> Result<ContributionRecord, EngineError> {
        let db = self.lock()?;
        let changed = db.execute(
            "UPDATE contributions
             SET status = ?1,
                 block_number = COALESCE(?2, block_number),
                 gas_used = COALESCE(?3, gas_used),
                 updated_at = ?4
             WHERE id = ?5 AND status = ?6",
            params![
                next.as_str(),
                update.block_number,
                update.gas_used,
                ts(&now()),
                id.to_string(),
                expected.as_str(),
            ],
        )?;

        let record = query_contribution(&db, id)?
            .ok_or_else(|| EngineError::Validation(format!("unknown contribution {}", id)))?;
        if changed == 0 {
            return Err(EngineError::ConcurrentModification(format!(
                "contribution {} is {}, expected {}",
                id, record.status, expected
            )));
        }
        debug!(%id, from = %expected, to = %next, "Contribution status changed");
        Ok(record)
    }

    fn mark_reorg_suspects(&self, from_block: u64) -> Result<Vec<ContributionRecord>, EngineError> {
        let mut db = self.lock()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let affected = query_contributions(
            &tx,
            "status = 'completed' AND payment_rail = 'on_chain' AND block_number >= ?1",
            &[&from_block],
        )?;
        tx.execute(
            "UPDATE contributions SET status = 'reorg_suspect', updated_at = ?1
             WHERE status = 'completed' AND payment_rail = 'on_chain' AND block_number >= ?2",
            params![ts(&now()), from_block],
        )?;
        tx.commit()?;
        Ok(affected
            .into_iter()
            .map(|mut r| {
                r.status = ContributionStatus::ReorgSuspect;
                r
            })
            .collect())
    }

    fn due_scheduled(&self, today: NaiveDate) -> Result<Vec<ContributionRecord>, EngineError> {
        query_contributions(
            &*self.lock()?,
            "status = 'pending' AND donation_type = ?1 AND payment_rail = 'traditional'
             AND scheduled_for IS NOT NULL AND scheduled_for <= ?2",
            &[&DonationType::Scheduled.as_str(), &today.to_string()],
        )
    }

    fn donor_totals(&self, donor: &DonorKey, campaign_id: &str) -> Result<DonorTotals, EngineError> {
        query_totals(&*self.lock()?, donor, campaign_id)
    }

    fn limit_state(
        &self,
        donor: &DonorKey,
        campaign_id: &str,
        ceiling: Cents,
    ) -> Result<ContributionLimitState, EngineError> {
        let db = self.lock()?;
        let totals = query_totals(&db, donor, campaign_id)?;

        let plan = {
            let sql = format!(
                "SELECT {} FROM recurring_plans
                 WHERE donor_key = ?1 AND campaign_id = ?2 AND status = 'active'
                 ORDER BY created_at DESC LIMIT 1",
                PLAN_COLUMNS
            );
            let mut stmt = db.prepare_cached(&sql)?;
            stmt.query_row([donor.as_str(), campaign_id], row_to_plan)
                .optional()?
        };

        let cached: Option<(bool, Option<String>, Option<String>)> = db
            .prepare_cached(
                "SELECT sync_required, discrepancy_native, last_validated_at
                 FROM contribution_limits WHERE donor_key = ?1 AND campaign_id = ?2",
            )?
            .query_row([donor.as_str(), campaign_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .optional()?;
        let (sync_required, discrepancy, last_validated) = cached.unwrap_or((false, None, None));

        let state = ContributionLimitState {
            donor_key: donor.clone(),
            campaign_id: campaign_id.to_string(),
            ceiling,
            total_contributed_fiat: totals.completed,
            reserved_fiat: totals.pending,
            suspect_fiat: totals.suspect,
            remaining_capacity_fiat: ceiling.saturating_sub(totals.completed + totals.pending),
            projected_recurring_total_fiat: plan.as_ref().map(|p| p.total_projected_amount),
            will_exceed_limit: plan.as_ref().is_some_and(|p| p.auto_cancel_date.is_some()),
            auto_cancel_at: plan.as_ref().and_then(|p| p.auto_cancel_date),
            sync_required,
            discrepancy_native: discrepancy.and_then(|d| d.parse().ok()),
            last_validated_at: last_validated.and_then(|t| t.parse().ok()),
            updated_at: now(),
        };

        db.execute(
            "INSERT INTO contribution_limits (donor_key, campaign_id, ceiling_cents,
                total_contributed_cents, reserved_cents, suspect_cents, remaining_capacity_cents,
                projected_recurring_cents, will_exceed_limit, auto_cancel_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(donor_key, campaign_id) DO UPDATE SET
                ceiling_cents = ?3, total_contributed_cents = ?4, reserved_cents = ?5,
                suspect_cents = ?6, remaining_capacity_cents = ?7, projected_recurring_cents = ?8,
                will_exceed_limit = ?9, auto_cancel_at = ?10, updated_at = ?11",
            params![
                donor.as_str(),
                campaign_id,
                ceiling.as_u64(),
                state.total_contributed_fiat.as_u64(),
                state.reserved_fiat.as_u64(),
                state.suspect_fiat.as_u64(),
                state.remaining_capacity_fiat.as_u64(),
                state.projected_recurring_total_fiat.map(|c| c.as_u64()),
                state.will_exceed_limit,
                state.auto_cancel_at.map(|d| d.to_string()),
                ts(&state.updated_at),
            ],
        )?;

        Ok(state)
    }

    fn record_validation(
        &self,
        donor: &DonorKey,
        campaign_id: &str,
        discrepancy_native: i128,
        at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let changed = self.lock()?.execute(
            "UPDATE contribution_limits
             SET sync_required = ?1, discrepancy_native = ?2, last_validated_at = ?3
             WHERE donor_key = ?4 AND campaign_id = ?5",
            params![
                discrepancy_native != 0,
                discrepancy_native.to_string(),
                ts(&at),
                donor.as_str(),
                campaign_id,
            ],
        )?;
        if changed == 0 {
            return Err(EngineError::Storage(format!(
                "no limit state for {} in {}",
                donor, campaign_id
            )));
        }
        Ok(())
    }

    fn on_chain_donors(&self, campaign_id: &str) -> Result<Vec<DonorKey>, EngineError> {
        let db = self.lock()?;
        let mut stmt = db.prepare_cached(
            "SELECT DISTINCT donor_key FROM contributions
             WHERE campaign_id = ?1 AND payment_rail = 'on_chain' ORDER BY donor_key",
        )?;
        let rows = stmt.query_map([campaign_id], |row| parse_col::<DonorKey>(row, 0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn insert_plan(&self, plan: &RecurringPlan) -> Result<(), EngineError> {
        self.lock()?.execute(
            "INSERT INTO recurring_plans (id, donor_key, campaign_id, amount_per_payment_cents,
                frequency, start_date, end_date, payment_count, total_projected_cents,
                auto_cancel_date, payments_issued, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                plan.id.to_string(),
                plan.donor_key.as_str(),
                plan.campaign_id,
                plan.amount_per_payment.as_u64(),
                plan.frequency.as_str(),
                plan.start_date.to_string(),
                plan.end_date.map(|d| d.to_string()),
                plan.payment_count,
                plan.total_projected_amount.as_u64(),
                plan.auto_cancel_date.map(|d| d.to_string()),
                plan.payments_issued,
                plan.status.as_str(),
                ts(&plan.created_at),
                ts(&plan.updated_at),
            ],
        )?;
        Ok(())
    }

    fn get_plan(&self, id: Uuid) -> Result<Option<RecurringPlan>, EngineError> {
        let db = self.lock()?;
        let sql = format!("SELECT {} FROM recurring_plans WHERE id = ?1", PLAN_COLUMNS);
        let mut stmt = db.prepare_cached(&sql)?;
        Ok(stmt.query_row([id.to_string()], row_to_plan).optional()?)
    }

    fn update_plan(&self, plan: &RecurringPlan) -> Result<(), EngineError> {
        let changed = self.lock()?.execute(
            "UPDATE recurring_plans
             SET amount_per_payment_cents = ?1, end_date = ?2, payment_count = ?3,
                 total_projected_cents = ?4, auto_cancel_date = ?5, payments_issued = ?6,
                 status = ?7, updated_at = ?8
             WHERE id = ?9",
            params![
                plan.amount_per_payment.as_u64(),
                plan.end_date.map(|d| d.to_string()),
                plan.payment_count,
                plan.total_projected_amount.as_u64(),
                plan.auto_cancel_date.map(|d| d.to_string()),
                plan.payments_issued,
                plan.status.as_str(),
                ts(&now()),
                plan.id.to_string(),
            ],
        )?;
        if changed == 0 {
            return Err(EngineError::Validation(format!("unknown plan {}", plan.id)));
        }
        Ok(())
    }

    fn active_plans(&self) -> Result<Vec<RecurringPlan>, EngineError> {
        let db = self.lock()?;
        let sql = format!(
            "SELECT {} FROM recurring_plans WHERE status = 'active' ORDER BY created_at",
            PLAN_COLUMNS
        );
        let mut stmt = db.prepare_cached(&sql)?;
        let rows = stmt.query_map([], row_to_plan)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn register_donor(&self, profile: &DonorProfile) -> Result<bool, EngineError> {
        let changed = self.lock()?.execute(
            "INSERT INTO donors (donor_key, display_name, registered_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(donor_key) DO NOTHING",
            params![
                profile.donor_key.as_str(),
                profile.display_name,
                ts(&profile.registered_at),
            ],
        )?;
        Ok(changed == 1)
    }

    fn get_donor(&self, donor: &DonorKey) -> Result<Option<DonorProfile>, EngineError> {
        let db = self.lock()?;
        let mut stmt = db.prepare_cached(
            "SELECT donor_key, display_name, registered_at FROM donors WHERE donor_key = ?1",
        )?;
        Ok(stmt
            .query_row([donor.as_str()], |row| {
                Ok(DonorProfile {
                    donor_key: parse_col(row, 0)?,
                    display_name: row.get(1)?,
                    registered_at: parse_col(row, 2)?,
                })
            })
            .optional()?)
    }

    fn delete_donor(&self, donor: &DonorKey) -> Result<bool, EngineError> {
        let changed = self
            .lock()?
            .execute("DELETE FROM donors WHERE donor_key = ?1", [donor.as_str()])?;
        Ok(changed > 0)
    }

    fn insert_kyc(&self, attestation: &KycAttestation) -> Result<(), EngineError> {
        self.lock()?.execute(
            "INSERT INTO kyc_attestations (id, donor_key, provider, verified, attested_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                attestation.id.to_string(),
                attestation.donor_key.as_str(),
                attestation.provider,
                attestation.verified,
                ts(&attestation.attested_at),
            ],
        )?;
        Ok(())
    }

    fn delete_kyc(&self, id: Uuid) -> Result<bool, EngineError> {
        let changed = self
            .lock()?
            .execute("DELETE FROM kyc_attestations WHERE id = ?1", [id.to_string()])?;
        Ok(changed > 0)
    }

    fn latest_kyc(&self, donor: &DonorKey) -> Result<Option<KycAttestation>, EngineError> {
        let db = self.lock()?;
        let mut stmt = db.prepare_cached(
            "SELECT id, donor_key, provider, verified, attested_at FROM kyc_attestations
             WHERE donor_key = ?1 ORDER BY attested_at DESC LIMIT 1",
        )?;
        Ok(stmt
            .query_row([donor.as_str()], |row| {
                Ok(KycAttestation {
                    id: parse_col(row, 0)?,
                    donor_key: parse_col(row, 1)?,
                    provider: row.get(2)?,
                    verified: row.get(3)?,
                    attested_at: parse_col(row, 4)?,
                })
            })
            .optional()?)
    }

    fn claim_send(
        &self,
        donor: &DonorKey,
        code: &TransactionCode,
        amount_native: Wei,
        rate: NativeRate,
    ) -> Result<bool, EngineError> {
        let changed = self.lock()?.execute(
            "INSERT OR IGNORE INTO send_attempts
                (donor_key, transaction_code, amount_native, native_rate_cents, chain_tx_hash, claimed_at)
             VALUES (?1, ?2, ?3, ?4, NULL, ?5)",
            params![
                donor.as_str(),
                code.as_str(),
                amount_native.to_string(),
                rate.cents_per_native() as i64,
                ts(&now())
            ],
        )?;
        Ok(changed == 1)
    }

    fn record_send_hash(
        &self,
        donor: &DonorKey,
        code: &TransactionCode,
        tx_hash: &TxHash,
    ) -> Result<(), EngineError> {
        self.lock()?.execute(
            "UPDATE send_attempts SET chain_tx_hash = ?3
             WHERE donor_key = ?1 AND transaction_code = ?2",
            params![donor.as_str(), code.as_str(), tx_hash.as_str()],
        )?;
        Ok(())
    }

    fn send_attempt(
        &self,
        donor: &DonorKey,
        code: &TransactionCode,
    ) -> Result<Option<SendAttempt>, EngineError> {
        let db = self.lock()?;
        let mut stmt = db.prepare_cached(
            "SELECT amount_native, native_rate_cents, chain_tx_hash FROM send_attempts
             WHERE donor_key = ?1 AND transaction_code = ?2",
        )?;
        let attempt = stmt
            .query_row([donor.as_str(), code.as_str()], |row| {
                let rate: i64 = row.get(1)?;
                let native_rate = NativeRate::from_cents_per_native(rate as u128)
                    .ok_or(rusqlite::Error::IntegralValueOutOfRange(1, rate))?;
                Ok(SendAttempt {
                    amount_native: parse_col(row, 0)?,
                    native_rate,
                    tx_hash: parse_opt_col(row, 2)?,
                })
            })
            .optional()?;
        Ok(attempt)
    }

    fn release_send(&self, donor: &DonorKey, code: &TransactionCode) -> Result<(), EngineError> {
        self.lock()?.execute(
            "DELETE FROM send_attempts WHERE donor_key = ?1 AND transaction_code = ?2",
            params![donor.as_str(), code.as_str()],
        )?;
        Ok(())
    }

    fn sync_cursor(&self, name: &str) -> Result<Option<u64>, EngineError> {
        let db = self.lock()?;
        let mut stmt = db.prepare_cached("SELECT block_number FROM sync_cursor WHERE name = ?1")?;
        Ok(stmt.query_row([name], |row| row.get(0)).optional()?)
    }

    fn set_sync_cursor(&self, name: &str, block: u64) -> Result<(), EngineError> {
        self.lock()?.execute(
            "INSERT INTO sync_cursor (name, block_number, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET block_number = ?2, updated_at = ?3",
            params![name, block, ts(&now())],
        )?;
        Ok(())
    }

    fn clear_sync_cursor(&self, name: &str) -> Result<(), EngineError> {
        self.lock()?.execute("DELETE FROM sync_cursor WHERE name = ?1", [name])?;
        Ok(())
    }
}
