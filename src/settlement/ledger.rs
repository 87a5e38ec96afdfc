//! Append-only settlement history.
//!
//! Runs are keyed by `(account_id, sequence)`. A run can only be appended as
//! `head + 1`, and the caller states which head it computed against, so a
//! settlement built on a stale snapshot fails instead of overwriting history.
//! No update or delete is exposed.

use parking_lot::{Mutex, RwLock};
use std::{collections::HashMap, sync::Arc};

use super::error::LedgerError;
use super::models::{AccountId, SettlementPeriod, SettlementRun};

#[async_trait::async_trait]
pub trait SettlementLedger: Send + Sync {
    /// Append `run` if the account head is still `expected_previous` and
    /// `run.sequence == expected_previous + 1`.
    async fn append(&self, run: &SettlementRun, expected_previous: u64) -> Result<(), LedgerError>;

    /// All runs for the account, ascending by sequence.
    async fn list_by_account(&self, account_id: AccountId) -> Result<Vec<SettlementRun>, LedgerError>;

    async fn latest_applied(&self, account_id: AccountId)
        -> Result<Option<SettlementRun>, LedgerError>;

    /// Highest sequence recorded for the account; 0 when empty.
    async fn head_sequence(&self, account_id: AccountId) -> Result<u64, LedgerError>;

    async fn find_applied(
        &self,
        account_id: AccountId,
        period: &SettlementPeriod,
    ) -> Result<Option<SettlementRun>, LedgerError>;
}

/// Check shared by every ledger implementation.
pub(crate) fn check_append(
    run: &SettlementRun,
    expected_previous: u64,
    head: u64,
    history: impl IntoIterator<Item = (bool, SettlementPeriod)>,
) -> Result<(), LedgerError> {
    if head != expected_previous || run.sequence != head + 1 {
        return Err(LedgerError::SequenceConflict {
            account_id: run.account_id,
            expected: expected_previous,
            actual: head,
        });
    }
    if run.is_applied()
        && history
            .into_iter()
            .any(|(applied, period)| applied && period == run.period)
    {
        return Err(LedgerError::DuplicateAppliedPeriod {
            account_id: run.account_id,
            period: run.period.to_string(),
        });
    }
    Ok(())
}

type AccountRuns = Arc<Mutex<Vec<SettlementRun>>>;

/// Process-local ledger. Each account has its own lock, so settlements on
/// different accounts never wait on each other.
#[derive(Default)]
pub struct InMemoryLedger {
    accounts: RwLock<HashMap<AccountId, AccountRuns>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn runs_for(&self, account_id: AccountId) -> AccountRuns {
        if let Some(runs) = self.accounts.read().get(&account_id) {
            return runs.clone();
        }
        self.accounts
            .write()
            .entry(account_id)
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone()
    }

    fn existing(&self, account_id: AccountId) -> Option<AccountRuns> {
        self.accounts.read().get(&account_id).cloned()
    }
}

#[async_trait::async_trait]
impl SettlementLedger for InMemoryLedger {
    async fn append(&self, run: &SettlementRun, expected_previous: u64) -> Result<(), LedgerError> {
        let runs = self.runs_for(run.account_id);
        let mut runs = runs.lock();
        let head = runs.last().map(|r| r.sequence).unwrap_or(0);
        check_append(
            run,
            expected_previous,
            head,
            runs.iter().map(|r| (r.is_applied(), r.period.clone())),
        )?;
        runs.push(run.clone());
        Ok(())
    }

    async fn list_by_account(&self, account_id: AccountId) -> Result<Vec<SettlementRun>, LedgerError> {
        let Some(runs) = self.existing(account_id) else {
            return Ok(Vec::new());
        };
        let history = runs.lock().clone();
        Ok(history)
    }

    async fn latest_applied(
        &self,
        account_id: AccountId,
    ) -> Result<Option<SettlementRun>, LedgerError> {
        let Some(runs) = self.existing(account_id) else {
            return Ok(None);
        };
        let latest = runs.lock().iter().rev().find(|r| r.is_applied()).cloned();
        Ok(latest)
    }

    async fn head_sequence(&self, account_id: AccountId) -> Result<u64, LedgerError> {
        let Some(runs) = self.existing(account_id) else {
            return Ok(0);
        };
        let head = runs.lock().last().map(|r| r.sequence).unwrap_or(0);
        Ok(head)
    }

    async fn find_applied(
        &self,
        account_id: AccountId,
        period: &SettlementPeriod,
    ) -> Result<Option<SettlementRun>, LedgerError> {
        let Some(runs) = self.existing(account_id) else {
            return Ok(None);
        };
        let found = runs
            .lock()
            .iter()
            .find(|r| r.is_applied() && &r.period == period)
            .cloned();
        Ok(found)
    }
}
