//! SQLite persistence for joint accounts, contributions and settlement runs.
//!
//! Accounts and contributions belong to the wider app; only the read side and
//! a few seed helpers live here. The `settlement_runs` table is append-only:
//! the primary key `(account_id, sequence)` plus a partial unique index on
//! applied periods back up the head check done inside the append transaction.
//!
//! Several processes may open the same file. Writes take the lock up front
//! (`BEGIN IMMEDIATE`) and wait up to `BUSY_TIMEOUT` for it; a writer that
//! still loses is reported as a sequence conflict, never as a storage error.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{
    ffi, params, types::Type, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex;

use super::error::LedgerError;
use super::ledger::{check_append, SettlementLedger};
use super::models::{
    AccountId, Cents, Contribution, JointAccount, MemberId, MemberSettlement, RejectionReason,
    RunStatus, SettlementPeriod, SettlementRun, Share,
};
use super::sources::{checked_balance, AccountSource, ContributionCursor, ContributionSource};

const RUN_COLUMNS: &str = "id, account_id, period, sequence, status, balance_cents, \
     projected_balance_cents, members_json, rejection_json, contributions_through, \
     requested_by, created_at";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct SettlementDb {
    conn: Arc<Mutex<Connection>>,
}

impl SettlementDb {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open settlement db")?;
        conn.busy_timeout(BUSY_TIMEOUT).context("set busy timeout")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS joint_accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                balance_cents INTEGER NOT NULL DEFAULT 0,
                keep_positive INTEGER NOT NULL DEFAULT 1,
                created_by INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                last_contribution_id INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS joint_account_shares (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL,
                member_id INTEGER NOT NULL,
                basis_points INTEGER NOT NULL,
                FOREIGN KEY (account_id) REFERENCES joint_accounts(id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS contributions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL,
                member_id INTEGER NOT NULL,
                amount_cents INTEGER NOT NULL,
                recorded_at INTEGER NOT NULL,
                FOREIGN KEY (account_id) REFERENCES joint_accounts(id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS settlement_runs (
                account_id INTEGER NOT NULL,
                sequence INTEGER NOT NULL,
                id TEXT UNIQUE NOT NULL,
                period TEXT NOT NULL,
                status TEXT NOT NULL,
                balance_cents INTEGER NOT NULL,
                projected_balance_cents INTEGER NOT NULL,
                members_json TEXT NOT NULL,
                rejection_json TEXT,
                contributions_through INTEGER NOT NULL DEFAULT 0,
                requested_by INTEGER,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (account_id, sequence)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_shares_account ON joint_account_shares(account_id, id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_contributions_account ON contributions(account_id, id)",
            [],
        )?;
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_applied_period
             ON settlement_runs(account_id, period) WHERE status = 'APPLIED'",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an account with a zero balance and its shares, all or nothing.
    /// Shares keep the order given.
    pub async fn create_account_with_shares(
        &self,
        name: &str,
        created_by: MemberId,
        keep_positive: bool,
        shares: &[Share],
    ) -> Result<AccountId> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO joint_accounts (name, balance_cents, keep_positive, created_by, created_at)
             VALUES (?1, 0, ?2, ?3, ?4)",
            params![name, keep_positive as i64, created_by, Utc::now().timestamp_micros()],
        )?;
        let account_id = tx.last_insert_rowid();
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO joint_account_shares (account_id, member_id, basis_points)
                 VALUES (?1, ?2, ?3)",
            )?;
            for share in shares {
                stmt.execute(params![account_id, share.member_id, share.basis_points])?;
            }
        }
        tx.commit()?;
        Ok(account_id)
    }

    /// Insert a contribution and apply it to the account balance atomically.
    /// The account's `last_contribution_id` moves in the same transaction.
    pub async fn post_contribution(
        &self,
        account_id: AccountId,
        member_id: MemberId,
        amount_cents: Cents,
        recorded_at: DateTime<Utc>,
    ) -> Result<Contribution> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let balance_cents = checked_balance(
            account_id,
            current_balance(&tx, account_id)?,
            amount_cents,
        )?;
        tx.execute(
            "INSERT INTO contributions (account_id, member_id, amount_cents, recorded_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![account_id, member_id, amount_cents, recorded_at.timestamp_micros()],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE joint_accounts SET balance_cents = ?1, last_contribution_id = ?2 WHERE id = ?3",
            params![balance_cents, id, account_id],
        )?;
        tx.commit()?;

        Ok(Contribution {
            id,
            account_id,
            member_id,
            amount_cents,
            recorded_at: micros_to_utc(recorded_at.timestamp_micros())
                .context("contribution timestamp out of range")?,
        })
    }

    /// Move the balance without a contribution (fees, interest, shared bills).
    pub async fn adjust_balance(&self, account_id: AccountId, amount_cents: Cents) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let balance_cents = checked_balance(
            account_id,
            current_balance(&tx, account_id)?,
            amount_cents,
        )?;
        tx.execute(
            "UPDATE joint_accounts SET balance_cents = ?1 WHERE id = ?2",
            params![balance_cents, account_id],
        )?;
        tx.commit()?;
        Ok(())
    }
}

fn current_balance(conn: &Connection, account_id: AccountId) -> Result<Cents> {
    conn.query_row(
        "SELECT balance_cents FROM joint_accounts WHERE id = ?1",
        params![account_id],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| anyhow!("joint account {} not found", account_id))
}

fn head_of(conn: &Connection, account_id: AccountId) -> rusqlite::Result<u64> {
    let head: i64 = conn.query_row(
        "SELECT COALESCE(MAX(sequence), 0) FROM settlement_runs WHERE account_id = ?1",
        params![account_id],
        |row| row.get(0),
    )?;
    Ok(head as u64)
}

enum AppendFailure {
    Refused(LedgerError),
    Sqlite(rusqlite::Error),
}

impl From<LedgerError> for AppendFailure {
    fn from(e: LedgerError) -> Self {
        AppendFailure::Refused(e)
    }
}

impl From<rusqlite::Error> for AppendFailure {
    fn from(e: rusqlite::Error) -> Self {
        AppendFailure::Sqlite(e)
    }
}

fn insert_run(
    conn: &mut Connection,
    run: &SettlementRun,
    expected_previous: u64,
    members_json: &str,
    rejection_json: Option<&str>,
) -> Result<(), AppendFailure> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let head = head_of(&tx, run.account_id)?;
    let applied_same_period: Option<String> = tx
        .query_row(
            "SELECT period FROM settlement_runs
             WHERE account_id = ?1 AND period = ?2 AND status = 'APPLIED' LIMIT 1",
            params![run.account_id, run.period.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    check_append(
        run,
        expected_previous,
        head,
        applied_same_period
            .and_then(|p| SettlementPeriod::new(&p))
            .map(|p| (true, p)),
    )?;

    tx.execute(
        "INSERT INTO settlement_runs
         (id, account_id, period, sequence, status, balance_cents, projected_balance_cents,
          members_json, rejection_json, contributions_through, requested_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            &run.id,
            run.account_id,
            run.period.as_str(),
            run.sequence as i64,
            run.status.as_str(),
            run.balance_cents,
            run.projected_balance_cents,
            members_json,
            rejection_json,
            run.contributions_through,
            run.requested_by,
            run.created_at.timestamp_micros(),
        ],
    )?;
    tx.commit()?;
    Ok(())
}

/// Lock contention and key collisions mean another writer got there first.
fn contention_error(
    conn: &Connection,
    run: &SettlementRun,
    expected_previous: u64,
    err: rusqlite::Error,
) -> LedgerError {
    let (code, extended_code) = match &err {
        rusqlite::Error::SqliteFailure(failure, _) => (failure.code, failure.extended_code),
        _ => (ErrorCode::Unknown, 0),
    };
    let duplicate_period = code == ErrorCode::ConstraintViolation
        && extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
        && run.is_applied();
    let lost_race = matches!(code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        || (code == ErrorCode::ConstraintViolation
            && extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY);

    if duplicate_period {
        LedgerError::DuplicateAppliedPeriod {
            account_id: run.account_id,
            period: run.period.to_string(),
        }
    } else if lost_race {
        LedgerError::SequenceConflict {
            account_id: run.account_id,
            expected: expected_previous,
            actual: head_of(conn, run.account_id).unwrap_or(expected_previous),
        }
    } else {
        err.into()
    }
}

fn micros_to_utc(micros: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(0, micros))
}

fn json_column<T: serde::de::DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<SettlementRun> {
    let period: String = row.get(2)?;
    let status: String = row.get(4)?;
    let members_json: String = row.get(7)?;
    let rejection_json: Option<String> = row.get(8)?;
    let sequence: i64 = row.get(3)?;

    let period = SettlementPeriod::new(&period).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(2, Type::Text, "blank period".into())
    })?;
    let status = RunStatus::from_str(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(4, Type::Text, "unknown run status".into())
    })?;
    let members: Vec<MemberSettlement> = json_column(7, &members_json)?;
    let rejection: Option<RejectionReason> = rejection_json
        .as_deref()
        .map(|raw| json_column(8, raw))
        .transpose()?;

    Ok(SettlementRun {
        id: row.get(0)?,
        account_id: row.get(1)?,
        period,
        sequence: sequence as u64,
        status,
        balance_cents: row.get(5)?,
        projected_balance_cents: row.get(6)?,
        members,
        rejection,
        contributions_through: row.get(9)?,
        requested_by: row.get(10)?,
        created_at: micros_to_utc(row.get(11)?)?,
    })
}

#[async_trait::async_trait]
impl SettlementLedger for SettlementDb {
    async fn append(&self, run: &SettlementRun, expected_previous: u64) -> Result<(), LedgerError> {
        let members_json = serde_json::to_string(&run.members)?;
        let rejection_json = run
            .rejection
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut conn = self.conn.lock().await;
        match insert_run(
            &mut conn,
            run,
            expected_previous,
            &members_json,
            rejection_json.as_deref(),
        ) {
            Ok(()) => Ok(()),
            Err(AppendFailure::Refused(e)) => Err(e),
            Err(AppendFailure::Sqlite(e)) => Err(contention_error(&conn, run, expected_previous, e)),
        }
    }

    async fn list_by_account(&self, account_id: AccountId) -> Result<Vec<SettlementRun>, LedgerError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM settlement_runs WHERE account_id = ?1 ORDER BY sequence ASC",
            RUN_COLUMNS
        ))?;
        let runs = stmt
            .query_map(params![account_id], run_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    async fn latest_applied(
        &self,
        account_id: AccountId,
    ) -> Result<Option<SettlementRun>, LedgerError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM settlement_runs WHERE account_id = ?1 AND status = 'APPLIED'
             ORDER BY sequence DESC LIMIT 1",
            RUN_COLUMNS
        ))?;
        Ok(stmt
            .query_row(params![account_id], run_from_row)
            .optional()?)
    }

    async fn head_sequence(&self, account_id: AccountId) -> Result<u64, LedgerError> {
        let conn = self.conn.lock().await;
        Ok(head_of(&conn, account_id)?)
    }

    async fn find_applied(
        &self,
        account_id: AccountId,
        period: &SettlementPeriod,
    ) -> Result<Option<SettlementRun>, LedgerError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM settlement_runs
             WHERE account_id = ?1 AND period = ?2 AND status = 'APPLIED' LIMIT 1",
            RUN_COLUMNS
        ))?;
        Ok(stmt
            .query_row(params![account_id, period.as_str()], run_from_row)
            .optional()?)
    }
}

fn load_account(conn: &Connection, account_id: AccountId) -> rusqlite::Result<Option<JointAccount>> {
    let row = conn
        .query_row(
            "SELECT id, name, balance_cents, keep_positive, created_by, created_at,
                    last_contribution_id
             FROM joint_accounts WHERE id = ?1",
            params![account_id],
            |row| {
                Ok((
                    row.get::<_, AccountId>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Cents>(2)?,
                    row.get::<_, i64>(3)? == 1,
                    row.get::<_, MemberId>(4)?,
                    micros_to_utc(row.get(5)?)?,
                    row.get::<_, i64>(6)?,
                ))
            },
        )
        .optional()?;

    let Some((id, name, balance_cents, keep_positive, created_by, created_at, last_contribution_id)) =
        row
    else {
        return Ok(None);
    };

    let mut stmt = conn.prepare_cached(
        "SELECT member_id, basis_points FROM joint_account_shares
         WHERE account_id = ?1 ORDER BY id ASC",
    )?;
    let shares = stmt
        .query_map(params![account_id], |row| {
            Ok(Share::new(row.get(0)?, row.get(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(Some(JointAccount {
        id,
        name,
        balance_cents,
        keep_positive,
        created_by,
        created_at,
        shares,
        last_contribution_id,
    }))
}

#[async_trait::async_trait]
impl AccountSource for SettlementDb {
    async fn get_joint_account(&self, account_id: AccountId) -> Result<Option<JointAccount>> {
        let mut conn = self.conn.lock().await;
        // One read transaction so the shares match the account row.
        let tx = conn.transaction()?;
        let account = load_account(&tx, account_id).context("load joint account")?;
        tx.commit()?;
        Ok(account)
    }
}

#[async_trait::async_trait]
impl ContributionSource for SettlementDb {
    async fn contributions_since(
        &self,
        account_id: AccountId,
        cursor: &ContributionCursor,
    ) -> Result<Vec<Contribution>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, account_id, member_id, amount_cents, recorded_at FROM contributions
             WHERE account_id = ?1 AND id > ?2 AND id <= ?3 ORDER BY id ASC",
        )?;
        let out = stmt
            .query_map(params![account_id, cursor.after_id, cursor.through_id], |row| {
                Ok(Contribution {
                    id: row.get(0)?,
                    account_id: row.get(1)?,
                    member_id: row.get(2)?,
                    amount_cents: row.get(3)?,
                    recorded_at: micros_to_utc(row.get(4)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("load contributions")?;
        Ok(out)
    }
}
