//! Largest-remainder allocation of integer cents.
//!
//! Splits a total across a validated share set so the parts sum to exactly the
//! total. Each member first receives `floor(|T| * w / 10000)`; the `R` leftover
//! cents (`0 <= R < n`) go one each to the members with the largest fractional
//! remainder, ties broken by ascending member id. Negative totals are split by
//! absolute value and negated, so debt is shared under the same rule.

use serde::{Deserialize, Serialize};

use super::models::{Cents, MemberId, TOTAL_BASIS_POINTS};
use super::shares::ShareSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub member_id: MemberId,
    pub amount_cents: Cents,
}

/// Allocate `total` across `shares`. Output follows share-set order.
pub fn allocate(total: Cents, shares: &ShareSet) -> Vec<Allocation> {
    let magnitude = (total as i128).abs();
    let denominator = TOTAL_BASIS_POINTS as i128;

    // (index, floor, fractional numerator)
    let mut parts: Vec<(usize, i128, i128)> = shares
        .shares()
        .iter()
        .enumerate()
        .map(|(idx, share)| {
            let exact = magnitude * share.basis_points as i128;
            (idx, exact / denominator, exact % denominator)
        })
        .collect();

    let floors: i128 = parts.iter().map(|&(_, floor, _)| floor).sum();
    let remainder = (magnitude - floors) as usize;
    debug_assert!(remainder < shares.len().max(1));

    let mut order: Vec<usize> = (0..parts.len()).collect();
    order.sort_by(|&a, &b| {
        parts[b]
            .2
            .cmp(&parts[a].2)
            .then_with(|| shares.shares()[a].member_id.cmp(&shares.shares()[b].member_id))
    });
    for &idx in order.iter().take(remainder) {
        parts[idx].1 += 1;
    }

    let sign: i128 = if total < 0 { -1 } else { 1 };
    parts
        .into_iter()
        .map(|(idx, amount, _)| Allocation {
            member_id: shares.shares()[idx].member_id,
            // |amount| <= |total|, so this always fits back into i64.
            amount_cents: (sign * amount) as Cents,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settlement::models::{BasisPoints, Share};
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn share_set(pairs: &[(MemberId, BasisPoints)]) -> ShareSet {
        let shares: Vec<Share> = pairs.iter().map(|&(m, bp)| Share::new(m, bp)).collect();
        ShareSet::validate(&shares).unwrap()
    }

    fn amounts(allocs: &[Allocation]) -> Vec<Cents> {
        allocs.iter().map(|a| a.amount_cents).collect()
    }

    /// Random share set of `n` members summing to 10000 bp.
    fn random_share_set(rng: &mut ChaCha8Rng, n: usize) -> ShareSet {
        let mut cuts: Vec<i32> = (0..n - 1).map(|_| rng.gen_range(1..10_000)).collect();
        cuts.sort_unstable();
        cuts.dedup();
        let mut bounds = vec![0];
        bounds.extend(cuts);
        bounds.push(10_000);
        let mut shares = Vec::new();
        for (i, pair) in bounds.windows(2).enumerate() {
            // Shuffle ids so insertion order and id order differ.
            let member_id = ((i as i64) * 7919) % 10_007;
            shares.push(Share::new(member_id, pair[1] - pair[0]));
        }
        ShareSet::validate(&shares).unwrap()
    }

    #[test]
    fn test_three_way_split_gives_extra_cent_to_largest_weight() {
        let set = share_set(&[(1, 3334), (2, 3333), (3, 3333)]);
        assert_eq!(amounts(&allocate(1000, &set)), vec![334, 333, 333]);
    }

    #[test]
    fn test_negative_balance_split_evenly() {
        let set = share_set(&[(1, 5000), (2, 5000)]);
        assert_eq!(amounts(&allocate(-100, &set)), vec![-50, -50]);
    }

    #[test]
    fn test_zero_total() {
        let set = share_set(&[(1, 1), (2, 9999)]);
        assert_eq!(amounts(&allocate(0, &set)), vec![0, 0]);
    }

    #[test]
    fn test_ties_go_to_lowest_member_id() {
        // Equal weights; member 5 was inserted first but 2 has the lower id.
        let set = share_set(&[(5, 5000), (2, 5000)]);
        let allocs = allocate(101, &set);
        assert_eq!(allocs[0], Allocation { member_id: 5, amount_cents: 50 });
        assert_eq!(allocs[1], Allocation { member_id: 2, amount_cents: 51 });

        let allocs = allocate(-101, &set);
        assert_eq!(amounts(&allocs), vec![-50, -51]);
    }

    #[test]
    fn test_remainder_prefers_larger_fraction_over_lower_id() {
        // 7 * 0.3 = 2.1, 7 * 0.7 = 4.9: member 9 gets the leftover cent.
        let set = share_set(&[(1, 3000), (9, 7000)]);
        assert_eq!(amounts(&allocate(7, &set)), vec![2, 5]);
    }

    #[test]
    fn test_extreme_totals_do_not_overflow() {
        let set = share_set(&[(1, 3333), (2, 3333), (3, 3334)]);
        for total in [i64::MAX, i64::MIN + 1, i64::MIN] {
            let sum: i128 = allocate(total, &set)
                .iter()
                .map(|a| a.amount_cents as i128)
                .sum();
            assert_eq!(sum, total as i128);
        }
    }

    #[test]
    fn test_random_splits_are_exact_and_close_to_rational_share() {
        let mut rng = ChaCha8Rng::seed_from_u64(0x5e771e);
        for _ in 0..2_000 {
            let n = rng.gen_range(1..=12);
            let set = random_share_set(&mut rng, n);
            let total: Cents = rng.gen_range(-5_000_000..=5_000_000);

            let allocs = allocate(total, &set);
            assert_eq!(allocs.len(), set.len());
            assert_eq!(allocs.iter().map(|a| a.amount_cents).sum::<Cents>(), total);

            for (alloc, share) in allocs.iter().zip(set.shares()) {
                assert_eq!(alloc.member_id, share.member_id);
                // |amount * 10000 - T * w| < 10000  <=>  error below one cent
                let scaled = alloc.amount_cents as i128 * TOTAL_BASIS_POINTS as i128;
                let exact = total as i128 * share.basis_points as i128;
                assert!(
                    (scaled - exact).abs() < TOTAL_BASIS_POINTS as i128,
                    "member {} got {} for total {} at {} bp",
                    share.member_id,
                    alloc.amount_cents,
                    total,
                    share.basis_points
                );
            }

            assert_eq!(allocate(total, &set), allocs);
        }
    }

    #[test]
    fn test_debt_mirrors_credit() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..200 {
            let n = rng.gen_range(2..=6);
            let set = random_share_set(&mut rng, n);
            let total: Cents = rng.gen_range(1..=1_000_000);
            let credit = amounts(&allocate(total, &set));
            let debt = amounts(&allocate(-total, &set));
            assert_eq!(credit.iter().map(|c| -c).collect::<Vec<_>>(), debt);
        }
    }
}
