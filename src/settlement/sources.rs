//! Read access to accounts and contributions owned by the surrounding app.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

use super::models::{AccountId, Cents, Contribution, JointAccount, MemberId, SettlementRun};

/// Window of contribution ids a settlement covers: `after_id < id <= through_id`.
///
/// Ids come from the store's posting order, so a contribution is never skipped
/// because of its timestamp. `through_id` is the watermark read together with
/// the balance; anything posted after that read waits for the next run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContributionCursor {
    /// Newest contribution the previous applied run covered.
    pub after_id: i64,
    /// Newest contribution reflected in the balance being settled.
    pub through_id: i64,
}

impl ContributionCursor {
    /// Window from the previous applied run up to the account's watermark.
    pub fn for_snapshot(previous: Option<&SettlementRun>, account: &JointAccount) -> Self {
        let after_id = previous.map(|run| run.contributions_through).unwrap_or(0);
        Self {
            after_id,
            through_id: account.last_contribution_id.max(after_id),
        }
    }

    pub fn includes(&self, contribution: &Contribution) -> bool {
        contribution.id > self.after_id && contribution.id <= self.through_id
    }
}

#[async_trait::async_trait]
pub trait AccountSource: Send + Sync {
    /// The account with its balance and `last_contribution_id` from one read.
    async fn get_joint_account(&self, account_id: AccountId) -> Result<Option<JointAccount>>;
}

#[async_trait::async_trait]
pub trait ContributionSource: Send + Sync {
    /// Contributions inside `cursor`, in posting order.
    async fn contributions_since(
        &self,
        account_id: AccountId,
        cursor: &ContributionCursor,
    ) -> Result<Vec<Contribution>>;
}

#[derive(Default)]
struct DirectoryState {
    accounts: HashMap<AccountId, JointAccount>,
    contributions: HashMap<AccountId, Vec<Contribution>>,
    next_contribution_id: i64,
}

/// In-process account directory, used by tests and local runs.
///
/// Balances, contributions and the id counter share one lock, so a reader
/// never sees a contribution without its balance movement or the reverse.
#[derive(Default)]
pub struct InMemoryDirectory {
    state: RwLock<DirectoryState>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an account. The watermark is owned by the directory.
    pub fn upsert_account(&self, mut account: JointAccount) {
        let mut state = self.state.write();
        account.last_contribution_id = state
            .contributions
            .get(&account.id)
            .and_then(|all| all.last())
            .map(|c| c.id)
            .unwrap_or(0);
        state.accounts.insert(account.id, account);
    }

    /// Record a contribution and move the account balance by the same amount.
    pub fn post_contribution(
        &self,
        account_id: AccountId,
        member_id: MemberId,
        amount_cents: Cents,
        recorded_at: DateTime<Utc>,
    ) -> Result<Contribution> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let account = state
            .accounts
            .get_mut(&account_id)
            .ok_or_else(|| anyhow!("joint account {} not found", account_id))?;
        let balance_cents = checked_balance(account_id, account.balance_cents, amount_cents)?;

        state.next_contribution_id += 1;
        let contribution = Contribution {
            id: state.next_contribution_id,
            account_id,
            member_id,
            amount_cents,
            recorded_at,
        };
        account.balance_cents = balance_cents;
        account.last_contribution_id = contribution.id;
        state
            .contributions
            .entry(account_id)
            .or_default()
            .push(contribution.clone());
        Ok(contribution)
    }

    /// Move the balance without a contribution (fees, interest, shared bills).
    pub fn adjust_balance(&self, account_id: AccountId, amount_cents: Cents) -> Result<()> {
        let mut state = self.state.write();
        let account = state
            .accounts
            .get_mut(&account_id)
            .ok_or_else(|| anyhow!("joint account {} not found", account_id))?;
        account.balance_cents = checked_balance(account_id, account.balance_cents, amount_cents)?;
        Ok(())
    }
}

pub(crate) fn checked_balance(
    account_id: AccountId,
    balance_cents: Cents,
    amount_cents: Cents,
) -> Result<Cents> {
    balance_cents.checked_add(amount_cents).ok_or_else(|| {
        anyhow!(
            "balance of joint account {} would overflow ({} + {})",
            account_id,
            balance_cents,
            amount_cents
        )
    })
}

#[async_trait::async_trait]
impl AccountSource for InMemoryDirectory {
    async fn get_joint_account(&self, account_id: AccountId) -> Result<Option<JointAccount>> {
        Ok(self.state.read().accounts.get(&account_id).cloned())
    }
}

#[async_trait::async_trait]
impl ContributionSource for InMemoryDirectory {
    async fn contributions_since(
        &self,
        account_id: AccountId,
        cursor: &ContributionCursor,
    ) -> Result<Vec<Contribution>> {
        // Stored in posting order already.
        Ok(self
            .state
            .read()
            .contributions
            .get(&account_id)
            .map(|all| all.iter().filter(|c| cursor.includes(c)).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settlement::ledger::tests::make_run;
    use crate::settlement::models::{RunStatus, Share};
    use chrono::Duration;

    fn account(id: AccountId) -> JointAccount {
        JointAccount {
            id,
            name: "Viagem".to_string(),
            balance_cents: 0,
            keep_positive: false,
            created_by: 1,
            created_at: Utc::now(),
            shares: vec![Share::new(1, 10_000)],
            last_contribution_id: 0,
        }
    }

    fn window(after_id: i64, through_id: i64) -> ContributionCursor {
        ContributionCursor {
            after_id,
            through_id,
        }
    }

    #[tokio::test]
    async fn test_cursor_window_is_by_posting_order_not_timestamp() {
        let dir = InMemoryDirectory::new();
        dir.upsert_account(account(1));
        let t0 = Utc::now();
        let first = dir.post_contribution(1, 1, 500, t0).unwrap();
        // Backdated entry posted later still lands after `first`.
        let second = dir
            .post_contribution(1, 1, -200, t0 - Duration::days(30))
            .unwrap();
        assert!(second.id > first.id);

        let acct = dir.get_joint_account(1).await.unwrap().unwrap();
        assert_eq!(acct.balance_cents, 300);
        assert_eq!(acct.last_contribution_id, second.id);

        let all = dir
            .contributions_since(1, &window(0, acct.last_contribution_id))
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let newer = dir
            .contributions_since(1, &window(first.id, acct.last_contribution_id))
            .await
            .unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].amount_cents, -200);

        // Nothing past the watermark is returned.
        let bounded = dir
            .contributions_since(1, &window(0, first.id))
            .await
            .unwrap();
        assert_eq!(bounded.len(), 1);
        assert_eq!(bounded[0].id, first.id);
    }

    #[test]
    fn test_cursor_for_snapshot_uses_previous_run_and_watermark() {
        let mut acct = account(1);
        acct.last_contribution_id = 9;
        let fresh = ContributionCursor::for_snapshot(None, &acct);
        assert_eq!(fresh, window(0, 9));

        let mut previous = make_run(1, 3, "2026-01", RunStatus::Applied);
        previous.contributions_through = 4;
        let next = ContributionCursor::for_snapshot(Some(&previous), &acct);
        assert_eq!(next, window(4, 9));
    }

    #[tokio::test]
    async fn test_unknown_account_is_none() {
        let dir = InMemoryDirectory::new();
        assert!(dir.get_joint_account(42).await.unwrap().is_none());
        assert!(dir
            .contributions_since(42, &window(0, i64::MAX))
            .await
            .unwrap()
            .is_empty());
        assert!(dir.post_contribution(42, 1, 100, Utc::now()).is_err());
        assert!(dir.adjust_balance(42, 100).is_err());
    }

    #[test]
    fn test_balance_overflow_is_refused_without_recording() {
        let dir = InMemoryDirectory::new();
        let mut acct = account(1);
        acct.balance_cents = i64::MAX - 10;
        dir.upsert_account(acct);

        assert!(dir.post_contribution(1, 1, 11, Utc::now()).is_err());
        assert!(dir.adjust_balance(1, 11).is_err());
        assert!(dir.adjust_balance(1, 10).is_ok());

        let state = dir.state.read();
        assert_eq!(state.accounts[&1].balance_cents, i64::MAX);
        assert_eq!(state.accounts[&1].last_contribution_id, 0);
        assert!(state.contributions.get(&1).is_none());
    }
}
