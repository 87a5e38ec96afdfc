//! Error types for the ledger and the settlement engine.

use super::models::{AccountId, Cents, MemberId, SettlementRun};
use super::shares::ShareSetViolation;

/// Ledger append/read failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Head moved between snapshot and append, the run skipped a sequence,
    /// or another writer held the store. `actual` is the head seen afterwards.
    SequenceConflict {
        account_id: AccountId,
        expected: u64,
        actual: u64,
    },
    /// An applied run for the same period is already recorded.
    DuplicateAppliedPeriod {
        account_id: AccountId,
        period: String,
    },
    Storage(String),
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SequenceConflict {
                account_id,
                expected,
                actual,
            } => write!(
                f,
                "ledger head for account {} is {}, expected {}",
                account_id, actual, expected
            ),
            Self::DuplicateAppliedPeriod { account_id, period } => write!(
                f,
                "account {} already has an applied run for period {}",
                account_id, period
            ),
            Self::Storage(msg) => write!(f, "ledger storage error: {}", msg),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        LedgerError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        LedgerError::Storage(e.to_string())
    }
}

/// Everything `settle` can report. Each variant carries enough detail for the
/// caller to act without re-reading state.
#[derive(Debug, Clone)]
pub enum SettlementError {
    /// Share configuration is malformed. Nothing was written.
    InvalidShareConfiguration {
        account_id: AccountId,
        violation: ShareSetViolation,
    },
    /// Period already has an applied run; that run is returned unchanged.
    AlreadySettled { run: Box<SettlementRun> },
    /// Keep-positive policy refused the run. The rejected run was recorded.
    NegativeBalancePolicyViolation {
        run: Box<SettlementRun>,
        shortfall_cents: Cents,
        offending_members: Vec<MemberId>,
    },
    /// Another settlement for the account committed first. Reload and retry.
    ConcurrentSettlementConflict {
        account_id: AccountId,
        expected_sequence: u64,
        actual_sequence: u64,
    },
    AccountNotFound { account_id: AccountId },
    NotAccountMember {
        account_id: AccountId,
        member_id: MemberId,
    },
    /// A contribution references a member without a share.
    UnknownContributor {
        account_id: AccountId,
        member_id: MemberId,
    },
    Storage(String),
}

impl SettlementError {
    /// Conflicts and policy rejections can succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentSettlementConflict { .. } | Self::NegativeBalancePolicyViolation { .. }
        )
    }

    /// The run recorded for this outcome, if any.
    pub fn run(&self) -> Option<&SettlementRun> {
        match self {
            Self::AlreadySettled { run } | Self::NegativeBalancePolicyViolation { run, .. } => {
                Some(&**run)
            }
            _ => None,
        }
    }

    pub(crate) fn from_ledger(account_id: AccountId, err: LedgerError) -> Self {
        match err {
            LedgerError::SequenceConflict {
                expected, actual, ..
            } => Self::ConcurrentSettlementConflict {
                account_id,
                expected_sequence: expected,
                actual_sequence: actual,
            },
            err @ LedgerError::DuplicateAppliedPeriod { .. } => Self::Storage(err.to_string()),
            LedgerError::Storage(msg) => Self::Storage(msg),
        }
    }
}

impl std::fmt::Display for SettlementError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidShareConfiguration {
                account_id,
                violation,
            } => write!(
                f,
                "Invalid share configuration for account {}: {}",
                account_id, violation
            ),
            Self::AlreadySettled { run } => write!(
                f,
                "Account {} already settled for period {} (run #{})",
                run.account_id, run.period, run.sequence
            ),
            Self::NegativeBalancePolicyViolation {
                run,
                shortfall_cents,
                offending_members,
            } => write!(
                f,
                "Settlement of account {} for period {} rejected: shortfall {} cents (members {:?})",
                run.account_id, run.period, shortfall_cents, offending_members
            ),
            Self::ConcurrentSettlementConflict {
                account_id,
                expected_sequence,
                actual_sequence,
            } => write!(
                f,
                "Concurrent settlement on account {}: expected head {}, found {}",
                account_id, expected_sequence, actual_sequence
            ),
            Self::AccountNotFound { account_id } => {
                write!(f, "Joint account {} not found", account_id)
            }
            Self::NotAccountMember {
                account_id,
                member_id,
            } => write!(
                f,
                "Member {} is not part of joint account {}",
                member_id, account_id
            ),
            Self::UnknownContributor {
                account_id,
                member_id,
            } => write!(
                f,
                "Contribution on account {} from member {} who holds no share",
                account_id, member_id
            ),
            Self::Storage(msg) => write!(f, "Settlement storage error: {}", msg),
        }
    }
}

impl std::error::Error for SettlementError {}
