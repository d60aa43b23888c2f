//! # Conservation
//!
//! Per-brand totals across a group of allocations, and the check that a
//! reallocation neither creates nor destroys rights.
//!
//! With a declared supply change the check becomes exact:
//! `before + minted == after + burned` for every brand.

use crate::domain::{Allocation, Amount, Brand, EscrowError};
use crate::ports::outbound::AssetSink;
use std::collections::{BTreeMap, BTreeSet};

/// Brand -> summed amount.
pub type BrandTotals = BTreeMap<Brand, Amount>;

/// Amounts a privileged reallocation creates and destroys.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SupplyDelta {
    /// Amounts added to circulation.
    pub minted: Vec<Amount>,
    /// Amounts removed from circulation.
    pub burned: Vec<Amount>,
}

impl SupplyDelta {
    /// Check if the delta declares nothing.
    pub fn is_empty(&self) -> bool {
        self.minted.is_empty() && self.burned.is_empty()
    }

    /// Brands named by the delta.
    pub fn brands(&self) -> BTreeSet<Brand> {
        self.minted
            .iter()
            .chain(&self.burned)
            .map(|a| a.brand.clone())
            .collect()
    }
}

/// Add `amount` into `totals`.
pub fn accumulate(
    sink: &dyn AssetSink,
    totals: &mut BrandTotals,
    amount: &Amount,
) -> Result<(), EscrowError> {
    let sum = match totals.get(&amount.brand) {
        Some(current) => sink.add(current, amount).map_err(|_| EscrowError::Conservation {
            brand: amount.brand.clone(),
        })?,
        None => amount.clone(),
    };
    totals.insert(amount.brand.clone(), sum);
    Ok(())
}

/// Sum every amount of every allocation, per brand.
pub fn totals_by_brand<'a, I>(sink: &dyn AssetSink, allocations: I) -> Result<BrandTotals, EscrowError>
where
    I: IntoIterator<Item = &'a Allocation>,
{
    let mut totals = BrandTotals::new();
    for allocation in allocations {
        for amount in allocation.values() {
            accumulate(sink, &mut totals, amount)?;
        }
    }
    Ok(totals)
}

fn sum_amounts(sink: &dyn AssetSink, amounts: &[Amount]) -> Result<BrandTotals, EscrowError> {
    let mut totals = BrandTotals::new();
    for amount in amounts {
        accumulate(sink, &mut totals, amount)?;
    }
    Ok(totals)
}

fn plus(
    sink: &dyn AssetSink,
    brand: &Brand,
    left: Option<&Amount>,
    right: Option<&Amount>,
) -> Result<Amount, EscrowError> {
    let result = match (left, right) {
        (Some(l), Some(r)) => sink.add(l, r),
        (Some(l), None) => Ok(l.clone()),
        (None, Some(r)) => Ok(r.clone()),
        (None, None) => sink.make_empty(brand),
    };
    result.map_err(|_| EscrowError::Conservation {
        brand: brand.clone(),
    })
}

/// Compare totals before and after a reallocation.
///
/// Fails with `Conservation { brand }` naming the first brand (in brand
/// order) whose totals differ.
pub fn check_conservation(
    sink: &dyn AssetSink,
    before: &BrandTotals,
    after: &BrandTotals,
    delta: &SupplyDelta,
) -> Result<(), EscrowError> {
    let minted = sum_amounts(sink, &delta.minted)?;
    let burned = sum_amounts(sink, &delta.burned)?;

    let brands: BTreeSet<&Brand> = before
        .keys()
        .chain(after.keys())
        .chain(minted.keys())
        .chain(burned.keys())
        .collect();

    for brand in brands {
        let supplied = plus(sink, brand, before.get(brand), minted.get(brand))?;
        let held = plus(sink, brand, after.get(brand), burned.get(brand))?;
        match sink.is_equal(&supplied, &held) {
            Ok(true) => {}
            _ => {
                return Err(EscrowError::Conservation {
                    brand: brand.clone(),
                })
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::BrandRegistry;
    use crate::domain::{AssetKind, Keyword};

    fn kw(name: &str) -> Keyword {
        Keyword::new(name).unwrap()
    }

    fn create_registry() -> (BrandRegistry, Brand, Brand, Brand) {
        let moola = Brand::new("moola");
        let simoleans = Brand::new("simoleans");
        let tickets = Brand::new("tickets");
        let sink = BrandRegistry::new()
            .with_brand(&moola, AssetKind::Count)
            .with_brand(&simoleans, AssetKind::Count)
            .with_brand(&tickets, AssetKind::Set);
        (sink, moola, simoleans, tickets)
    }

    fn alloc(entries: Vec<(&str, Amount)>) -> Allocation {
        entries.into_iter().map(|(k, v)| (kw(k), v)).collect()
    }

    #[test]
    fn test_swap_conserves() {
        let (sink, moola, simoleans, _) = create_registry();
        let before = [
            alloc(vec![("Price", Amount::count(&moola, 10))]),
            alloc(vec![("Asset", Amount::count(&simoleans, 3))]),
        ];
        let after = [
            alloc(vec![
                ("Price", Amount::count(&moola, 0)),
                ("Asset", Amount::count(&simoleans, 3)),
            ]),
            alloc(vec![("Price", Amount::count(&moola, 10))]),
        ];

        let before = totals_by_brand(&sink, &before).unwrap();
        let after = totals_by_brand(&sink, &after).unwrap();
        assert!(check_conservation(&sink, &before, &after, &SupplyDelta::default()).is_ok());
    }

    #[test]
    fn test_created_value_rejected() {
        let (sink, moola, _, _) = create_registry();
        let before = totals_by_brand(&sink, &[alloc(vec![("Price", Amount::count(&moola, 10))])])
            .unwrap();
        let after = totals_by_brand(&sink, &[alloc(vec![("Price", Amount::count(&moola, 11))])])
            .unwrap();
        assert_eq!(
            check_conservation(&sink, &before, &after, &SupplyDelta::default()),
            Err(EscrowError::Conservation { brand: moola })
        );
    }

    #[test]
    fn test_vanished_brand_rejected() {
        let (sink, moola, _, _) = create_registry();
        let before = totals_by_brand(&sink, &[alloc(vec![("Price", Amount::count(&moola, 4))])])
            .unwrap();
        let after = BrandTotals::new();
        assert!(check_conservation(&sink, &before, &after, &SupplyDelta::default()).is_err());

        // An empty amount appearing is not a change.
        let empty = totals_by_brand(&sink, &[alloc(vec![("Price", Amount::count(&moola, 0))])])
            .unwrap();
        assert!(check_conservation(&sink, &BrandTotals::new(), &empty, &SupplyDelta::default()).is_ok());
    }

    #[test]
    fn test_mint_must_be_exact() {
        let (sink, moola, _, _) = create_registry();
        let before = totals_by_brand(&sink, &[alloc(vec![("Price", Amount::count(&moola, 10))])])
            .unwrap();
        let after = totals_by_brand(&sink, &[alloc(vec![("Price", Amount::count(&moola, 15))])])
            .unwrap();

        let exact = SupplyDelta {
            minted: vec![Amount::count(&moola, 5)],
            burned: vec![],
        };
        assert!(check_conservation(&sink, &before, &after, &exact).is_ok());

        let short = SupplyDelta {
            minted: vec![Amount::count(&moola, 4)],
            burned: vec![],
        };
        assert!(check_conservation(&sink, &before, &after, &short).is_err());

        let burn = SupplyDelta {
            minted: vec![],
            burned: vec![Amount::count(&moola, 5)],
        };
        assert!(check_conservation(&sink, &after, &before, &burn).is_ok());
    }

    #[test]
    fn test_duplicated_set_element_rejected() {
        let (sink, _, _, tickets) = create_registry();
        let after = [
            alloc(vec![("Seats", Amount::set(&tickets, ["A1"]))]),
            alloc(vec![("Seats", Amount::set(&tickets, ["A1"]))]),
        ];
        assert_eq!(
            totals_by_brand(&sink, &after),
            Err(EscrowError::Conservation { brand: tickets })
        );
    }

    #[test]
    fn test_delta_brands() {
        let (_, moola, simoleans, _) = create_registry();
        let delta = SupplyDelta {
            minted: vec![Amount::count(&moola, 1)],
            burned: vec![Amount::count(&simoleans, 1)],
        };
        assert!(!delta.is_empty());
        assert_eq!(delta.brands(), BTreeSet::from([moola, simoleans]));
    }
}
