//! SQLite schema

use rusqlite::Connection;

use crate::error::EngineError;

/// Amounts are integer cents or decimal wei strings. Timestamps are RFC 3339.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS contributions (
    id TEXT PRIMARY KEY,
    donor_key TEXT NOT NULL,
    campaign_id TEXT NOT NULL,
    amount_fiat_cents INTEGER NOT NULL CHECK (amount_fiat_cents > 0),
    amount_native TEXT,
    native_rate_cents INTEGER,
    payment_rail TEXT NOT NULL CHECK (payment_rail IN ('traditional', 'on_chain')),
    chain_tx_hash TEXT,
    transaction_code TEXT,
    donation_type TEXT NOT NULL CHECK (donation_type IN ('one_time', 'recurring', 'scheduled')),
    status TEXT NOT NULL CHECK (status IN
        ('pending', 'completed', 'failed', 'duplicate', 'reorg_suspect', 'rolled_back')),
    block_number INTEGER,
    gas_used INTEGER,
    plan_id TEXT REFERENCES recurring_plans(id),
    scheduled_for TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    CHECK ((payment_rail = 'on_chain') = (chain_tx_hash IS NOT NULL))
);

-- At most one active record per chain transaction
CREATE UNIQUE INDEX IF NOT EXISTS idx_contributions_active_tx
    ON contributions(chain_tx_hash)
    WHERE status IN ('pending', 'completed', 'reorg_suspect');

-- One record per donor attempt
CREATE UNIQUE INDEX IF NOT EXISTS idx_contributions_attempt
    ON contributions(donor_key, transaction_code)
    WHERE transaction_code IS NOT NULL;

CREATE INDEX IF NOT EXISTS idx_contributions_donor
    ON contributions(donor_key, campaign_id, status);
CREATE INDEX IF NOT EXISTS idx_contributions_block
    ON contributions(block_number) WHERE block_number IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_contributions_tx
    ON contributions(chain_tx_hash) WHERE chain_tx_hash IS NOT NULL;

CREATE TABLE IF NOT EXISTS contribution_limits (
    donor_key TEXT NOT NULL,
    campaign_id TEXT NOT NULL,
    ceiling_cents INTEGER NOT NULL,
    total_contributed_cents INTEGER NOT NULL,
    reserved_cents INTEGER NOT NULL,
    suspect_cents INTEGER NOT NULL,
    remaining_capacity_cents INTEGER NOT NULL,
    projected_recurring_cents INTEGER,
    will_exceed_limit INTEGER NOT NULL DEFAULT 0,
    auto_cancel_at TEXT,
    sync_required INTEGER NOT NULL DEFAULT 0,
    discrepancy_native TEXT,
    last_validated_at TEXT,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (donor_key, campaign_id)
);

CREATE TABLE IF NOT EXISTS recurring_plans (
    id TEXT PRIMARY KEY,
    donor_key TEXT NOT NULL,
    campaign_id TEXT NOT NULL,
    amount_per_payment_cents INTEGER NOT NULL CHECK (amount_per_payment_cents > 0),
    frequency TEXT NOT NULL,
    start_date TEXT NOT NULL,
    end_date TEXT,
    payment_count INTEGER NOT NULL,
    total_projected_cents INTEGER NOT NULL,
    auto_cancel_date TEXT,
    payments_issued INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL CHECK (status IN ('active', 'completed', 'cancelled', 'auto_cancelled')),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_plans_status ON recurring_plans(status);

CREATE TABLE IF NOT EXISTS donors (
    donor_key TEXT PRIMARY KEY,
    display_name TEXT,
    registered_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS kyc_attestations (
    id TEXT PRIMARY KEY,
    donor_key TEXT NOT NULL REFERENCES donors(donor_key),
    provider TEXT NOT NULL,
    verified INTEGER NOT NULL,
    attested_at TEXT NOT NULL
);

-- On-chain sends, claimed before the transaction leaves the process
CREATE TABLE IF NOT EXISTS send_attempts (
    donor_key TEXT NOT NULL,
    transaction_code TEXT NOT NULL,
    amount_native TEXT NOT NULL,
    native_rate_cents INTEGER NOT NULL,
    chain_tx_hash TEXT,
    claimed_at TEXT NOT NULL,
    PRIMARY KEY (donor_key, transaction_code)
);

CREATE TABLE IF NOT EXISTS sync_cursor (
    name TEXT PRIMARY KEY,
    block_number INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);
";

pub(crate) fn migrate(db: &Connection) -> Result<(), EngineError> {
    // WAL lets readers proceed while the reconciler writes
    db.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA foreign_keys=ON;
         PRAGMA busy_timeout=5000;",
    )?;
    db.execute_batch(SCHEMA)?;
    Ok(())
}
