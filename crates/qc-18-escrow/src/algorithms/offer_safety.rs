//! # Offer Safety
//!
//! An allocation is offer safe for a proposal when it covers the proposal's
//! `give` (a refund) or its `want` (the exchange), counted `multiples` times
//! in total.
//!
//! ## Counting
//!
//! `satisfies` returns how many times an allocation covers a record:
//!
//! - a missing keyword, or an amount below the requirement, gives 0
//! - a nonzero count requirement gives `floor(held / required)`, saturating
//!   at `u64::MAX`
//! - zero requirements, set and multiset kinds, and `Any` patterns do not
//!   bound the count
//! - a record with no bounding keyword is satisfied once
//!
//! The predicate is total: arithmetic errors count as "not satisfied".

use crate::domain::{Allocation, Amount, AmountPattern, Proposal, WantRecord};
use crate::ports::outbound::AssetSink;

/// How many times `held` covers `required`; `None` means unbounded.
///
/// Ratios beyond `u64::MAX` saturate.
fn satisfies_amount(sink: &dyn AssetSink, held: Option<&Amount>, required: &Amount) -> Option<u64> {
    let Some(held) = held else {
        return Some(0);
    };
    match sink.is_gte(held, required) {
        Ok(true) => {}
        _ => return Some(0),
    }
    match (held.as_count(), required.as_count()) {
        (Some(held), Some(required)) if required > 0 => {
            Some(u64::try_from(held / required).unwrap_or(u64::MAX))
        }
        _ => None,
    }
}

/// Running minimum over keywords, stopping at the first zero.
fn fold_multiples<I>(counts: I) -> u64
where
    I: IntoIterator<Item = Option<u64>>,
{
    let mut multiples: Option<u64> = None;
    for count in counts {
        match count {
            Some(0) => return 0,
            Some(n) => multiples = Some(multiples.map_or(n, |m| m.min(n))),
            None => {}
        }
    }
    multiples.unwrap_or(1)
}

/// How many times `allocation` covers a give record.
pub fn satisfies_give(sink: &dyn AssetSink, give: &Allocation, allocation: &Allocation) -> u64 {
    fold_multiples(
        give.iter()
            .map(|(keyword, required)| satisfies_amount(sink, allocation.get(keyword), required)),
    )
}

/// How many times `allocation` covers a want record.
pub fn satisfies(sink: &dyn AssetSink, want: &WantRecord, allocation: &Allocation) -> u64 {
    fold_multiples(want.iter().map(|(keyword, pattern)| {
        let held = allocation.get(keyword);
        match pattern {
            AmountPattern::AtLeast(required) => satisfies_amount(sink, held, required),
            AmountPattern::Any { brand } => match held {
                Some(amount) if &amount.brand == brand => None,
                _ => Some(0),
            },
        }
    }))
}

/// Check if `allocation` satisfies the proposal's `want` at least once.
pub fn satisfies_want(sink: &dyn AssetSink, proposal: &Proposal, allocation: &Allocation) -> bool {
    satisfies(sink, &proposal.want, allocation) >= 1
}

/// Offer safety predicate.
pub fn is_offer_safe(sink: &dyn AssetSink, proposal: &Proposal, allocation: &Allocation) -> bool {
    let how_many = satisfies_give(sink, &proposal.give, allocation)
        .saturating_add(satisfies(sink, &proposal.want, allocation));
    how_many >= proposal.multiples
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::BrandRegistry;
    use crate::domain::{AssetKind, Brand, Keyword};

    fn kw(name: &str) -> Keyword {
        Keyword::new(name).unwrap()
    }

    fn moola() -> Brand {
        Brand::new("moola")
    }

    fn simoleans() -> Brand {
        Brand::new("simoleans")
    }

    fn tickets() -> Brand {
        Brand::new("tickets")
    }

    fn create_registry() -> BrandRegistry {
        BrandRegistry::new()
            .with_brand(&moola(), AssetKind::Count)
            .with_brand(&simoleans(), AssetKind::Count)
            .with_brand(&tickets(), AssetKind::Set)
    }

    fn alloc(entries: &[(&str, Amount)]) -> Allocation {
        entries
            .iter()
            .map(|(k, v)| (kw(k), v.clone()))
            .collect()
    }

    /// give 8 moola, want 6 simoleans.
    fn create_proposal(multiples: u64) -> Proposal {
        Proposal {
            give: alloc(&[("A", Amount::count(&moola(), 8))]),
            want: [(kw("B"), Amount::count(&simoleans(), 6).into())]
                .into_iter()
                .collect(),
            multiples,
            ..Default::default()
        }
    }

    #[test]
    fn test_refund_is_safe() {
        let sink = create_registry();
        let allocation = alloc(&[
            ("A", Amount::count(&moola(), 8)),
            ("B", Amount::count(&simoleans(), 0)),
        ]);
        assert!(is_offer_safe(&sink, &create_proposal(1), &allocation));
    }

    #[test]
    fn test_want_is_safe() {
        let sink = create_registry();
        let allocation = alloc(&[
            ("A", Amount::count(&moola(), 0)),
            ("B", Amount::count(&simoleans(), 7)),
        ]);
        assert!(is_offer_safe(&sink, &create_proposal(1), &allocation));
        assert!(satisfies_want(&sink, &create_proposal(1), &allocation));
    }

    #[test]
    fn test_neither_is_unsafe() {
        let sink = create_registry();
        let allocation = alloc(&[
            ("A", Amount::count(&moola(), 7)),
            ("B", Amount::count(&simoleans(), 5)),
        ]);
        assert!(!is_offer_safe(&sink, &create_proposal(1), &allocation));
    }

    #[test]
    fn test_missing_keyword_is_unsatisfied() {
        let sink = create_registry();
        let allocation = alloc(&[("B", Amount::count(&simoleans(), 5))]);
        assert!(!is_offer_safe(&sink, &create_proposal(1), &allocation));
        assert_eq!(satisfies_give(&sink, &create_proposal(1).give, &allocation), 0);
    }

    #[test]
    fn test_empty_proposal_is_always_safe() {
        let sink = create_registry();
        assert!(is_offer_safe(&sink, &Proposal::default(), &Allocation::new()));
        assert_eq!(satisfies(&sink, &WantRecord::new(), &Allocation::new()), 1);
    }

    #[test]
    fn test_multiples_two_requires_both_or_double() {
        let sink = create_registry();
        let proposal = create_proposal(2);

        // Refund alone covers give once.
        let refund = alloc(&[("A", Amount::count(&moola(), 8))]);
        assert!(!is_offer_safe(&sink, &proposal, &refund));

        // Double refund covers give twice.
        let double = alloc(&[("A", Amount::count(&moola(), 16))]);
        assert_eq!(satisfies_give(&sink, &proposal.give, &double), 2);
        assert!(is_offer_safe(&sink, &proposal, &double));

        // Refund plus want counts once each.
        let both = alloc(&[
            ("A", Amount::count(&moola(), 8)),
            ("B", Amount::count(&simoleans(), 6)),
        ]);
        assert!(is_offer_safe(&sink, &proposal, &both));

        // Floor division: 11 simoleans covers want 6 only once.
        let want_once = alloc(&[("B", Amount::count(&simoleans(), 11))]);
        assert!(!is_offer_safe(&sink, &proposal, &want_once));
    }

    #[test]
    fn test_any_pattern() {
        let sink = create_registry();
        let proposal = Proposal {
            want: [(kw("Asset"), AmountPattern::Any { brand: simoleans() })]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        let held = alloc(&[("Asset", Amount::count(&simoleans(), 0))]);
        assert!(is_offer_safe(&sink, &proposal, &held));

        // Missing keyword does not satisfy `Any`, but the empty give refunds.
        assert!(!satisfies_want(&sink, &proposal, &Allocation::new()));
        assert!(is_offer_safe(&sink, &proposal, &Allocation::new()));
    }

    #[test]
    fn test_set_amounts() {
        let sink = create_registry();
        let proposal = Proposal {
            give: alloc(&[("Price", Amount::count(&moola(), 5))]),
            want: [(kw("Seats"), Amount::set(&tickets(), ["A1"]).into())]
                .into_iter()
                .collect(),
            ..Default::default()
        };

        let got = alloc(&[("Seats", Amount::set(&tickets(), ["A1", "A2"]))]);
        assert!(is_offer_safe(&sink, &proposal, &got));

        let wrong = alloc(&[("Seats", Amount::set(&tickets(), ["B7"]))]);
        assert!(!is_offer_safe(&sink, &proposal, &wrong));
    }

    #[test]
    fn test_brand_mismatch_is_unsatisfied() {
        let sink = create_registry();
        let allocation = alloc(&[("A", Amount::count(&simoleans(), 100))]);
        assert_eq!(satisfies_give(&sink, &create_proposal(1).give, &allocation), 0);
    }

    #[test]
    fn test_huge_count_is_not_unbounded() {
        let sink = create_registry();
        let proposal = Proposal {
            give: alloc(&[("Price", Amount::count(&moola(), 1))]),
            multiples: 2,
            ..Default::default()
        };
        let held = alloc(&[("Price", Amount::count(&moola(), 1u128 << 70))]);

        assert_eq!(satisfies_give(&sink, &proposal.give, &held), u64::MAX);
        assert!(is_offer_safe(&sink, &proposal, &held));
    }
}
