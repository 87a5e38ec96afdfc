//! Settlement Engine
//!
//! One `settle` call is one reconciliation of one joint account:
//!
//! 1. Snapshot the ledger head and the previous applied run.
//! 2. Refuse if the period already has an applied run (idempotent no-op).
//! 3. Load the account and validate its shares. The balance comes with the id
//!    of the newest contribution it reflects.
//! 4. Sum each member's contributions after the previous applied run, up to
//!    that id. Later postings belong to the next run.
//! 5. Allocate the current balance by share (largest remainder).
//! 6. `delta = contributed - (entitled - baseline)`, where the baseline is the
//!    member's entitlement in the previous applied run.
//! 7. Run the keep-positive policy, then append `Applied` or `Rejected` as
//!    `head + 1`.
//!
//! The append is checked against the head read in step 1, so all math in a run
//! comes from a single snapshot. If another run landed in between, the call
//! fails with `ConcurrentSettlementConflict` and the caller decides whether to
//! retry. The engine writes nothing else and never retries on its own.

use chrono::Utc;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::allocation::allocate;
use super::error::{LedgerError, SettlementError};
use super::ledger::SettlementLedger;
use super::models::{
    AccountId, Cents, Contribution, JointAccount, MemberId, MemberSettlement, RunStatus,
    SettlementPeriod, SettlementRun,
};
use super::policy::{self, PolicyDecision};
use super::shares::ShareSet;
use super::sources::{AccountSource, ContributionCursor, ContributionSource};

#[derive(Clone)]
pub struct SettlementEngine {
    accounts: Arc<dyn AccountSource>,
    contributions: Arc<dyn ContributionSource>,
    ledger: Arc<dyn SettlementLedger>,
}

impl SettlementEngine {
    pub fn new(
        accounts: Arc<dyn AccountSource>,
        contributions: Arc<dyn ContributionSource>,
        ledger: Arc<dyn SettlementLedger>,
    ) -> Self {
        Self {
            accounts,
            contributions,
            ledger,
        }
    }

    /// Reconcile `account_id` for `period`.
    pub async fn settle(
        &self,
        account_id: AccountId,
        period: &SettlementPeriod,
    ) -> Result<SettlementRun, SettlementError> {
        self.run_settlement(None, account_id, period).await
    }

    /// Same as [`settle`](Self::settle) on behalf of an authenticated member.
    /// The caller must be the account creator or hold a share.
    pub async fn settle_as(
        &self,
        caller: MemberId,
        account_id: AccountId,
        period: &SettlementPeriod,
    ) -> Result<SettlementRun, SettlementError> {
        self.run_settlement(Some(caller), account_id, period).await
    }

    /// Every run recorded for the account, ascending by sequence.
    pub async fn settlement_history(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<SettlementRun>, SettlementError> {
        self.ledger
            .list_by_account(account_id)
            .await
            .map_err(|e| SettlementError::from_ledger(account_id, e))
    }

    async fn run_settlement(
        &self,
        caller: Option<MemberId>,
        account_id: AccountId,
        period: &SettlementPeriod,
    ) -> Result<SettlementRun, SettlementError> {
        let ledger_err = |e| SettlementError::from_ledger(account_id, e);

        let head = self
            .ledger
            .head_sequence(account_id)
            .await
            .map_err(ledger_err)?;
        let previous = self
            .ledger
            .latest_applied(account_id)
            .await
            .map_err(ledger_err)?;

        if let Some(prior) = self
            .ledger
            .find_applied(account_id, period)
            .await
            .map_err(ledger_err)?
        {
            debug!(account_id, period = %period, sequence = prior.sequence, "Period already settled");
            return Err(SettlementError::AlreadySettled {
                run: Box::new(prior),
            });
        }

        let account = self
            .accounts
            .get_joint_account(account_id)
            .await
            .map_err(|e| SettlementError::Storage(format!("{:#}", e)))?
            .ok_or(SettlementError::AccountNotFound { account_id })?;

        if let Some(member_id) = caller {
            if !account.has_member(member_id) {
                return Err(SettlementError::NotAccountMember {
                    account_id,
                    member_id,
                });
            }
        }

        let shares = ShareSet::validate(&account.shares).map_err(|violation| {
            warn!(account_id, %violation, "Settlement blocked by share configuration");
            SettlementError::InvalidShareConfiguration {
                account_id,
                violation,
            }
        })?;

        let cursor = ContributionCursor::for_snapshot(previous.as_ref(), &account);
        let contributions: Vec<Contribution> = self
            .contributions
            .contributions_since(account_id, &cursor)
            .await
            .map_err(|e| SettlementError::Storage(format!("{:#}", e)))?
            .into_iter()
            .filter(|c| cursor.includes(c))
            .collect();

        let members = compute_member_settlements(
            &account,
            &shares,
            &contributions,
            previous.as_ref(),
        )?;
        let decision = policy::evaluate(account.keep_positive, account.balance_cents, &members);

        let status = if decision.is_approved() {
            RunStatus::Applied
        } else {
            RunStatus::Rejected
        };
        let run = SettlementRun {
            id: Uuid::new_v4().to_string(),
            account_id,
            period: period.clone(),
            sequence: head + 1,
            status,
            balance_cents: account.balance_cents,
            projected_balance_cents: decision.projected_balance_cents(),
            members,
            rejection: decision.rejection(),
            contributions_through: cursor.through_id,
            requested_by: caller,
            created_at: Utc::now(),
        };

        match self.ledger.append(&run, head).await {
            Ok(()) => {}
            Err(LedgerError::SequenceConflict {
                expected, actual, ..
            }) => {
                warn!(
                    account_id,
                    period = %period,
                    expected_head = expected,
                    actual_head = actual,
                    "Concurrent settlement detected, run discarded"
                );
                return Err(SettlementError::ConcurrentSettlementConflict {
                    account_id,
                    expected_sequence: expected,
                    actual_sequence: actual,
                });
            }
            Err(LedgerError::DuplicateAppliedPeriod { .. }) => {
                // Another writer settled this period; report its run.
                let prior = self
                    .ledger
                    .find_applied(account_id, period)
                    .await
                    .map_err(ledger_err)?
                    .ok_or_else(|| {
                        SettlementError::Storage(format!(
                            "applied run for account {} period {} vanished",
                            account_id, period
                        ))
                    })?;
                return Err(SettlementError::AlreadySettled {
                    run: Box::new(prior),
                });
            }
            Err(e) => return Err(ledger_err(e)),
        }

        match decision {
            PolicyDecision::Approve { .. } => {
                info!(
                    account_id,
                    period = %period,
                    sequence = run.sequence,
                    balance_cents = run.balance_cents,
                    members = run.members.len(),
                    "✅ Settlement applied"
                );
                Ok(run)
            }
            PolicyDecision::Reject {
                shortfall_cents,
                offending_members,
                ..
            } => {
                warn!(
                    account_id,
                    period = %period,
                    sequence = run.sequence,
                    shortfall_cents,
                    offending = ?offending_members,
                    "Settlement rejected by keep-positive policy"
                );
                Err(SettlementError::NegativeBalancePolicyViolation {
                    run: Box::new(run),
                    shortfall_cents,
                    offending_members,
                })
            }
        }
    }
}

/// Per-member lines for the current balance, in share-set order.
fn compute_member_settlements(
    account: &JointAccount,
    shares: &ShareSet,
    contributions: &[Contribution],
    previous: Option<&SettlementRun>,
) -> Result<Vec<MemberSettlement>, SettlementError> {
    let mut contributed: HashMap<MemberId, Cents> = HashMap::with_capacity(shares.len());
    for c in contributions {
        if !shares.contains(c.member_id) {
            return Err(SettlementError::UnknownContributor {
                account_id: account.id,
                member_id: c.member_id,
            });
        }
        let entry = contributed.entry(c.member_id).or_insert(0);
        *entry = entry.saturating_add(c.amount_cents);
    }

    let entitled = allocate(account.balance_cents, shares);

    Ok(entitled
        .into_iter()
        .zip(shares.shares())
        .map(|(alloc, share)| {
            let contributed_cents = contributed.get(&alloc.member_id).copied().unwrap_or(0);
            let baseline_cents = previous
                .and_then(|run| run.member(alloc.member_id))
                .map(|m| m.entitled_cents)
                .unwrap_or(0);
            let entitled_change = alloc.amount_cents.saturating_sub(baseline_cents);
            MemberSettlement {
                member_id: alloc.member_id,
                basis_points: share.basis_points,
                contributed_cents,
                entitled_cents: alloc.amount_cents,
                baseline_cents,
                delta_cents: contributed_cents.saturating_sub(entitled_change),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settlement::models::Share;
    use chrono::TimeZone;

    fn account(balance_cents: Cents, shares: &[(MemberId, i32)]) -> JointAccount {
        JointAccount {
            id: 10,
            name: "Apartamento".to_string(),
            balance_cents,
            keep_positive: true,
            created_by: 1,
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            shares: shares.iter().map(|&(m, bp)| Share::new(m, bp)).collect(),
            last_contribution_id: 0,
        }
    }

    fn contribution(member_id: MemberId, amount_cents: Cents) -> Contribution {
        Contribution {
            id: 0,
            account_id: 10,
            member_id,
            amount_cents,
            recorded_at: Utc.with_ymd_and_hms(2026, 1, 5, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_first_period_deltas_sum_to_zero_when_balance_is_all_contributions() {
        let acct = account(700, &[(1, 5000), (2, 5000)]);
        let shares = ShareSet::validate(&acct.shares).unwrap();
        let lines = compute_member_settlements(
            &acct,
            &shares,
            &[contribution(1, 1000), contribution(2, -300)],
            None,
        )
        .unwrap();

        assert_eq!(lines[0].entitled_cents, 350);
        assert_eq!(lines[0].delta_cents, 650);
        assert_eq!(lines[1].entitled_cents, 350);
        assert_eq!(lines[1].delta_cents, -650);
        assert_eq!(lines.iter().map(|l| l.delta_cents).sum::<Cents>(), 0);
    }

    #[test]
    fn test_baseline_comes_from_previous_applied_run() {
        let acct = account(1000, &[(1, 5000), (2, 5000)]);
        let shares = ShareSet::validate(&acct.shares).unwrap();
        let first = compute_member_settlements(&acct, &shares, &[contribution(1, 1000)], None)
            .unwrap();
        let previous = SettlementRun {
            id: "r1".to_string(),
            account_id: 10,
            period: SettlementPeriod::new("2026-01").unwrap(),
            sequence: 1,
            status: RunStatus::Applied,
            balance_cents: 1000,
            projected_balance_cents: 1000,
            members: first,
            rejection: None,
            contributions_through: 0,
            requested_by: None,
            created_at: Utc::now(),
        };

        // Member 2 deposits 400 next period; balance 1400 -> 700 each.
        let acct = account(1400, &[(1, 5000), (2, 5000)]);
        let lines = compute_member_settlements(
            &acct,
            &shares,
            &[contribution(2, 400)],
            Some(&previous),
        )
        .unwrap();

        assert_eq!(lines[0].baseline_cents, 500);
        assert_eq!(lines[0].delta_cents, -200);
        assert_eq!(lines[1].baseline_cents, 500);
        assert_eq!(lines[1].delta_cents, 200);
    }

    #[test]
    fn test_contribution_from_non_member_is_refused() {
        let acct = account(100, &[(1, 10_000)]);
        let shares = ShareSet::validate(&acct.shares).unwrap();
        let err = compute_member_settlements(&acct, &shares, &[contribution(7, 100)], None)
            .unwrap_err();
        assert!(matches!(
            err,
            SettlementError::UnknownContributor { member_id: 7, .. }
        ));
    }
}
