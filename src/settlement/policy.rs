//! Keep-positive balance policy.

use serde::{Deserialize, Serialize};

use super::models::{Cents, MemberId, MemberSettlement, RejectionReason};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyDecision {
    Approve {
        projected_balance_cents: Cents,
    },
    Reject {
        projected_balance_cents: Cents,
        shortfall_cents: Cents,
        /// Members with a negative delta, most negative first.
        offending_members: Vec<MemberId>,
    },
}

impl PolicyDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, PolicyDecision::Approve { .. })
    }

    pub fn projected_balance_cents(&self) -> Cents {
        match self {
            PolicyDecision::Approve {
                projected_balance_cents,
            }
            | PolicyDecision::Reject {
                projected_balance_cents,
                ..
            } => *projected_balance_cents,
        }
    }

    pub fn rejection(&self) -> Option<RejectionReason> {
        match self {
            PolicyDecision::Approve { .. } => None,
            PolicyDecision::Reject {
                shortfall_cents,
                offending_members,
                ..
            } => Some(RejectionReason::NegativeBalance {
                shortfall_cents: *shortfall_cents,
                offending_members: offending_members.clone(),
            }),
        }
    }
}

/// Balance left after every delta is paid: positive deltas are paid out to
/// over-contributors, negative deltas are paid back in.
pub fn projected_balance(balance_cents: Cents, members: &[MemberSettlement]) -> Cents {
    let deltas: i128 = members.iter().map(|m| m.delta_cents as i128).sum();
    let projected = balance_cents as i128 - deltas;
    projected.clamp(Cents::MIN as i128, Cents::MAX as i128) as Cents
}

/// All-or-nothing approval of a computed settlement.
pub fn evaluate(
    keep_positive: bool,
    balance_cents: Cents,
    members: &[MemberSettlement],
) -> PolicyDecision {
    let projected_balance_cents = projected_balance(balance_cents, members);

    if !keep_positive || projected_balance_cents >= 0 {
        return PolicyDecision::Approve {
            projected_balance_cents,
        };
    }

    let mut negative: Vec<&MemberSettlement> =
        members.iter().filter(|m| m.delta_cents < 0).collect();
    negative.sort_by(|a, b| {
        a.delta_cents
            .cmp(&b.delta_cents)
            .then_with(|| a.member_id.cmp(&b.member_id))
    });

    PolicyDecision::Reject {
        projected_balance_cents,
        shortfall_cents: projected_balance_cents.saturating_neg(),
        offending_members: negative.into_iter().map(|m| m.member_id).collect(),
    }
}
