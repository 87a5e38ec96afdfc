//! Joint account records
//!
//! Money is always integer minor units (cents). Stakes are integer basis points.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub type AccountId = i64;
pub type MemberId = i64;

/// Signed amount in currency minor units.
pub type Cents = i64;

/// 1/100 of a percent.
pub type BasisPoints = i32;

/// A complete share set always sums to this.
pub const TOTAL_BASIS_POINTS: i64 = 10_000;

/// A member's fixed stake in a joint account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    pub member_id: MemberId,
    pub basis_points: BasisPoints,
}

impl Share {
    pub fn new(member_id: MemberId, basis_points: BasisPoints) -> Self {
        Self {
            member_id,
            basis_points,
        }
    }
}

/// Shared account as seen by the settlement engine (read-only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JointAccount {
    pub id: AccountId,
    pub name: String,
    pub balance_cents: Cents,
    pub keep_positive: bool,
    pub created_by: MemberId,
    pub created_at: DateTime<Utc>,
    /// Insertion order.
    pub shares: Vec<Share>,
    /// Newest contribution already reflected in `balance_cents`; 0 when none.
    /// Read together with the balance so both describe the same instant.
    #[serde(default)]
    pub last_contribution_id: i64,
}

impl JointAccount {
    /// True for the creator and for every share holder.
    pub fn has_member(&self, member_id: MemberId) -> bool {
        self.created_by == member_id || self.shares.iter().any(|s| s.member_id == member_id)
    }
}

/// Money a member put into (positive) or took out of (negative) the account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contribution {
    /// Posting order within the store, strictly increasing.
    pub id: i64,
    pub account_id: AccountId,
    pub member_id: MemberId,
    pub amount_cents: Cents,
    pub recorded_at: DateTime<Utc>,
}

/// Period key a settlement run covers, e.g. `2026-10`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SettlementPeriod(String);

impl SettlementPeriod {
    /// Returns `None` for a blank key.
    pub fn new(key: &str) -> Option<Self> {
        let key = key.trim();
        if key.is_empty() {
            return None;
        }
        Some(Self(key.to_string()))
    }

    /// Month key (`YYYY-MM`) for the month containing `date`.
    pub fn month(date: NaiveDate) -> Self {
        Self(date.format("%Y-%m").to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SettlementPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Applied,
    Rejected,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Applied => "APPLIED",
            RunStatus::Rejected => "REJECTED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "APPLIED" => Some(RunStatus::Applied),
            "REJECTED" => Some(RunStatus::Rejected),
            _ => None,
        }
    }
}

/// Per-member line of a settlement run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSettlement {
    pub member_id: MemberId,
    pub basis_points: BasisPoints,
    /// Net contributions since the previous applied run.
    pub contributed_cents: Cents,
    /// Fair share of the balance at run time.
    pub entitled_cents: Cents,
    /// Entitled amount carried by the previous applied run (0 if none).
    pub baseline_cents: Cents,
    /// `contributed - (entitled - baseline)`; positive means the member is owed.
    pub delta_cents: Cents,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionReason {
    NegativeBalance {
        shortfall_cents: Cents,
        offending_members: Vec<MemberId>,
    },
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NegativeBalance {
                shortfall_cents,
                offending_members,
            } => write!(
                f,
                "settlement would leave the account {} cents below zero (members {:?})",
                shortfall_cents, offending_members
            ),
        }
    }
}

/// Immutable record of one reconciliation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementRun {
    pub id: String,
    pub account_id: AccountId,
    pub period: SettlementPeriod,
    /// Per-account, starts at 1, no gaps.
    pub sequence: u64,
    pub status: RunStatus,
    /// Balance snapshot the allocation was computed from.
    pub balance_cents: Cents,
    /// Balance after paying out every delta.
    pub projected_balance_cents: Cents,
    pub members: Vec<MemberSettlement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<RejectionReason>,
    /// Id of the newest contribution this run covers; 0 when none.
    #[serde(default)]
    pub contributions_through: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<MemberId>,
    pub created_at: DateTime<Utc>,
}

impl SettlementRun {
    pub fn is_applied(&self) -> bool {
        self.status == RunStatus::Applied
    }

    pub fn member(&self, member_id: MemberId) -> Option<&MemberSettlement> {
        self.members.iter().find(|m| m.member_id == member_id)
    }

    pub fn total_delta_cents(&self) -> Cents {
        self.members.iter().map(|m| m.delta_cents).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_keys() {
        assert!(SettlementPeriod::new("   ").is_none());
        assert_eq!(SettlementPeriod::new(" 2026-10 ").unwrap().as_str(), "2026-10");

        let date = NaiveDate::from_ymd_opt(2026, 3, 17).unwrap();
        assert_eq!(SettlementPeriod::month(date).to_string(), "2026-03");
    }

    #[test]
    fn test_run_status_round_trips_through_storage_names() {
        for status in [RunStatus::Applied, RunStatus::Rejected] {
            assert_eq!(RunStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::from_str("applied"), None);
    }

    #[test]
    fn test_creator_counts_as_member() {
        let account = JointAccount {
            id: 1,
            name: "Casa".to_string(),
            balance_cents: 0,
            keep_positive: true,
            created_by: 99,
            created_at: Utc::now(),
            shares: vec![Share::new(1, 5000), Share::new(2, 5000)],
            last_contribution_id: 0,
        };
        assert!(account.has_member(99));
        assert!(account.has_member(2));
        assert!(!account.has_member(3));
    }
}
