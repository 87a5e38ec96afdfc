//! Share set validation
//!
//! A joint account can only be settled when its stakes form an exact partition
//! of 10000 basis points across distinct members.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::models::{BasisPoints, MemberId, Share, TOTAL_BASIS_POINTS};

/// Why a share configuration was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShareSetViolation {
    Empty,
    DuplicateMember {
        member_id: MemberId,
    },
    NonPositiveShare {
        member_id: MemberId,
        basis_points: BasisPoints,
    },
    SumMismatch {
        total: i64,
    },
}

impl std::fmt::Display for ShareSetViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "account has no shares"),
            Self::DuplicateMember { member_id } => {
                write!(f, "member {} holds more than one share", member_id)
            }
            Self::NonPositiveShare {
                member_id,
                basis_points,
            } => write!(
                f,
                "member {} has a non-positive share of {} bp",
                member_id, basis_points
            ),
            Self::SumMismatch { total } => write!(
                f,
                "shares sum to {} bp, expected {} bp",
                total, TOTAL_BASIS_POINTS
            ),
        }
    }
}

impl std::error::Error for ShareSetViolation {}

/// Validated, immutable share set. Only obtainable through [`ShareSet::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareSet {
    shares: Vec<Share>,
}

impl ShareSet {
    pub fn validate(shares: &[Share]) -> Result<Self, ShareSetViolation> {
        if shares.is_empty() {
            return Err(ShareSetViolation::Empty);
        }

        let mut seen = HashSet::with_capacity(shares.len());
        for share in shares {
            if !seen.insert(share.member_id) {
                return Err(ShareSetViolation::DuplicateMember {
                    member_id: share.member_id,
                });
            }
        }

        if let Some(bad) = shares.iter().find(|s| s.basis_points <= 0) {
            return Err(ShareSetViolation::NonPositiveShare {
                member_id: bad.member_id,
                basis_points: bad.basis_points,
            });
        }

        let total: i64 = shares.iter().map(|s| s.basis_points as i64).sum();
        if total != TOTAL_BASIS_POINTS {
            return Err(ShareSetViolation::SumMismatch { total });
        }

        Ok(Self {
            shares: shares.to_vec(),
        })
    }

    pub fn shares(&self) -> &[Share] {
        &self.shares
    }

    pub fn len(&self) -> usize {
        self.shares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shares.is_empty()
    }

    pub fn member_ids(&self) -> impl Iterator<Item = MemberId> + '_ {
        self.shares.iter().map(|s| s.member_id)
    }

    pub fn contains(&self, member_id: MemberId) -> bool {
        self.shares.iter().any(|s| s.member_id == member_id)
    }

    pub fn basis_points_of(&self, member_id: MemberId) -> Option<BasisPoints> {
        self.shares
            .iter()
            .find(|s| s.member_id == member_id)
            .map(|s| s.basis_points)
    }
}

/// Convert a legacy percentage (e.g. `33.34`) to basis points.
///
/// Rounds to the nearest basis point. Returns `None` for non-finite values or
/// anything outside `0..=100`.
pub fn basis_points_from_percent(percent: f64) -> Option<BasisPoints> {
    if !percent.is_finite() || !(0.0..=100.0).contains(&percent) {
        return None;
    }
    Some((percent * 100.0).round() as BasisPoints)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shares(pairs: &[(MemberId, BasisPoints)]) -> Vec<Share> {
        pairs.iter().map(|&(m, bp)| Share::new(m, bp)).collect()
    }

    #[test]
    fn test_valid_set_keeps_insertion_order() {
        let set = ShareSet::validate(&shares(&[(7, 2500), (3, 7500)])).unwrap();
        assert_eq!(set.member_ids().collect::<Vec<_>>(), vec![7, 3]);
        assert_eq!(set.basis_points_of(3), Some(7500));
        assert!(!set.contains(1));
    }

    #[test]
    fn test_single_member_owns_everything() {
        let set = ShareSet::validate(&shares(&[(1, 10_000)])).unwrap();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_rejects_empty() {
        assert_eq!(ShareSet::validate(&[]), Err(ShareSetViolation::Empty));
    }

    #[test]
    fn test_rejects_duplicate_member() {
        let err = ShareSet::validate(&shares(&[(1, 5000), (1, 5000)])).unwrap_err();
        assert_eq!(err, ShareSetViolation::DuplicateMember { member_id: 1 });
    }

    #[test]
    fn test_rejects_zero_and_negative_shares() {
        let err = ShareSet::validate(&shares(&[(1, 10_000), (2, 0)])).unwrap_err();
        assert_eq!(
            err,
            ShareSetViolation::NonPositiveShare {
                member_id: 2,
                basis_points: 0
            }
        );

        let err = ShareSet::validate(&shares(&[(1, 10_500), (2, -500)])).unwrap_err();
        assert!(matches!(
            err,
            ShareSetViolation::NonPositiveShare { member_id: 2, .. }
        ));
    }

    #[test]
    fn test_rejects_sum_off_by_one() {
        let err = ShareSet::validate(&shares(&[(1, 3333), (2, 3333), (3, 3333)])).unwrap_err();
        assert_eq!(err, ShareSetViolation::SumMismatch { total: 9999 });

        let err = ShareSet::validate(&shares(&[(1, 5001), (2, 5000)])).unwrap_err();
        assert_eq!(err, ShareSetViolation::SumMismatch { total: 10_001 });
    }

    #[test]
    fn test_sum_does_not_overflow() {
        let err =
            ShareSet::validate(&shares(&[(1, i32::MAX), (2, i32::MAX), (3, 10)])).unwrap_err();
        assert!(matches!(err, ShareSetViolation::SumMismatch { .. }));
    }

    #[test]
    fn test_percent_conversion() {
        assert_eq!(basis_points_from_percent(33.34), Some(3334));
        assert_eq!(basis_points_from_percent(100.0), Some(10_000));
        assert_eq!(basis_points_from_percent(12.5), Some(1250));
        assert_eq!(basis_points_from_percent(-1.0), None);
        assert_eq!(basis_points_from_percent(f64::NAN), None);
    }
}
