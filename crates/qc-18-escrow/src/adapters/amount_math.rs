//! Amount Math Adapter
//!
//! Implements the `AssetSink` port with one set of math helpers per asset
//! kind. The helpers for a brand are chosen once, when the brand is
//! registered.

use crate::domain::{Amount, AmountError, AmountValue, AssetKind, Brand};
use crate::ports::outbound::AssetSink;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// Kind-specific magnitude arithmetic.
///
/// Callers have already checked that both operands are of this kind.
trait MathHelpers: Send + Sync {
    fn kind(&self) -> AssetKind;
    fn is_empty(&self, value: &AmountValue) -> bool;
    fn is_gte(&self, left: &AmountValue, right: &AmountValue) -> bool;
    fn add(&self, brand: &Brand, left: &AmountValue, right: &AmountValue)
        -> Result<AmountValue, AmountError>;
    fn subtract(
        &self,
        brand: &Brand,
        left: &AmountValue,
        right: &AmountValue,
    ) -> Result<AmountValue, AmountError>;
}

struct CountMath;
struct SetMath;
struct MultisetMath;

static COUNT_MATH: CountMath = CountMath;
static SET_MATH: SetMath = SetMath;
static MULTISET_MATH: MultisetMath = MultisetMath;

fn helpers_for(kind: AssetKind) -> &'static dyn MathHelpers {
    match kind {
        AssetKind::Count => &COUNT_MATH,
        AssetKind::Set => &SET_MATH,
        AssetKind::Multiset => &MULTISET_MATH,
    }
}

impl MathHelpers for CountMath {
    fn kind(&self) -> AssetKind {
        AssetKind::Count
    }

    fn is_empty(&self, value: &AmountValue) -> bool {
        matches!(value, AmountValue::Count(0))
    }

    fn is_gte(&self, left: &AmountValue, right: &AmountValue) -> bool {
        match (left, right) {
            (AmountValue::Count(l), AmountValue::Count(r)) => l >= r,
            _ => false,
        }
    }

    fn add(
        &self,
        brand: &Brand,
        left: &AmountValue,
        right: &AmountValue,
    ) -> Result<AmountValue, AmountError> {
        match (left, right) {
            (AmountValue::Count(l), AmountValue::Count(r)) => l
                .checked_add(*r)
                .map(AmountValue::Count)
                .ok_or_else(|| AmountError::Overflow(brand.clone())),
            _ => Err(kind_mismatch(brand, self.kind())),
        }
    }

    fn subtract(
        &self,
        brand: &Brand,
        left: &AmountValue,
        right: &AmountValue,
    ) -> Result<AmountValue, AmountError> {
        match (left, right) {
            (AmountValue::Count(l), AmountValue::Count(r)) => l
                .checked_sub(*r)
                .map(AmountValue::Count)
                .ok_or_else(|| AmountError::Underflow {
                    brand: brand.clone(),
                }),
            _ => Err(kind_mismatch(brand, self.kind())),
        }
    }
}

impl MathHelpers for SetMath {
    fn kind(&self) -> AssetKind {
        AssetKind::Set
    }

    fn is_empty(&self, value: &AmountValue) -> bool {
        matches!(value, AmountValue::Set(s) if s.is_empty())
    }

    fn is_gte(&self, left: &AmountValue, right: &AmountValue) -> bool {
        match (left, right) {
            (AmountValue::Set(l), AmountValue::Set(r)) => r.is_subset(l),
            _ => false,
        }
    }

    fn add(
        &self,
        brand: &Brand,
        left: &AmountValue,
        right: &AmountValue,
    ) -> Result<AmountValue, AmountError> {
        match (left, right) {
            (AmountValue::Set(l), AmountValue::Set(r)) => {
                // Elements are unique copies; a union with overlap would mint one.
                if let Some(element) = l.intersection(r).next() {
                    return Err(AmountError::DuplicateElement {
                        brand: brand.clone(),
                        element: element.clone(),
                    });
                }
                Ok(AmountValue::Set(l.union(r).cloned().collect()))
            }
            _ => Err(kind_mismatch(brand, self.kind())),
        }
    }

    fn subtract(
        &self,
        brand: &Brand,
        left: &AmountValue,
        right: &AmountValue,
    ) -> Result<AmountValue, AmountError> {
        match (left, right) {
            (AmountValue::Set(l), AmountValue::Set(r)) => {
                if !r.is_subset(l) {
                    return Err(AmountError::Underflow {
                        brand: brand.clone(),
                    });
                }
                Ok(AmountValue::Set(
                    l.difference(r).cloned().collect::<BTreeSet<_>>(),
                ))
            }
            _ => Err(kind_mismatch(brand, self.kind())),
        }
    }
}

impl MathHelpers for MultisetMath {
    fn kind(&self) -> AssetKind {
        AssetKind::Multiset
    }

    fn is_empty(&self, value: &AmountValue) -> bool {
        matches!(value, AmountValue::Multiset(bag) if bag.values().all(|n| *n == 0))
    }

    fn is_gte(&self, left: &AmountValue, right: &AmountValue) -> bool {
        match (left, right) {
            (AmountValue::Multiset(l), AmountValue::Multiset(r)) => r
                .iter()
                .all(|(element, n)| l.get(element).copied().unwrap_or(0) >= *n),
            _ => false,
        }
    }

    fn add(
        &self,
        brand: &Brand,
        left: &AmountValue,
        right: &AmountValue,
    ) -> Result<AmountValue, AmountError> {
        match (left, right) {
            (AmountValue::Multiset(l), AmountValue::Multiset(r)) => {
                let mut sum = l.clone();
                for (element, n) in r {
                    let slot = sum.entry(element.clone()).or_insert(0);
                    *slot = slot
                        .checked_add(*n)
                        .ok_or_else(|| AmountError::Overflow(brand.clone()))?;
                }
                Ok(AmountValue::Multiset(sum))
            }
            _ => Err(kind_mismatch(brand, self.kind())),
        }
    }

    fn subtract(
        &self,
        brand: &Brand,
        left: &AmountValue,
        right: &AmountValue,
    ) -> Result<AmountValue, AmountError> {
        match (left, right) {
            (AmountValue::Multiset(l), AmountValue::Multiset(r)) => {
                let mut rest: BTreeMap<String, u64> = l.clone();
                for (element, n) in r {
                    let have = rest.get(element).copied().unwrap_or(0);
                    let left_over = have.checked_sub(*n).ok_or_else(|| AmountError::Underflow {
                        brand: brand.clone(),
                    })?;
                    if left_over == 0 {
                        rest.remove(element);
                    } else {
                        rest.insert(element.clone(), left_over);
                    }
                }
                Ok(AmountValue::Multiset(rest))
            }
            _ => Err(kind_mismatch(brand, self.kind())),
        }
    }
}

fn kind_mismatch(brand: &Brand, expected: AssetKind) -> AmountError {
    AmountError::KindMismatch {
        brand: brand.clone(),
        expected: expected.name().to_string(),
    }
}

/// In-process brand registry implementing `AssetSink`.
///
/// Brands are registered once with their kind; registering a brand again
/// with a different kind is refused.
#[derive(Default)]
pub struct BrandRegistry {
    brands: RwLock<HashMap<Brand, &'static dyn MathHelpers>>,
}

impl BrandRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a brand. Returns false if it was already registered with
    /// another kind.
    pub fn register(&self, brand: &Brand, kind: AssetKind) -> bool {
        let mut brands = self.brands.write();
        if let Some(existing) = brands.get(brand) {
            return existing.kind() == kind;
        }
        debug!(brand = %brand, kind = %kind, "[qc-18] Registered brand");
        brands.insert(brand.clone(), helpers_for(kind));
        true
    }

    /// Builder-style registration.
    pub fn with_brand(self, brand: &Brand, kind: AssetKind) -> Self {
        self.register(brand, kind);
        self
    }

    fn helpers(&self, amount: &Amount) -> Result<&'static dyn MathHelpers, AmountError> {
        let helpers = *self
            .brands
            .read()
            .get(&amount.brand)
            .ok_or_else(|| AmountError::UnknownBrand(amount.brand.clone()))?;
        if helpers.kind() != amount.kind() {
            return Err(kind_mismatch(&amount.brand, helpers.kind()));
        }
        Ok(helpers)
    }

    fn helpers_pair(
        &self,
        left: &Amount,
        right: &Amount,
    ) -> Result<&'static dyn MathHelpers, AmountError> {
        if left.brand != right.brand {
            return Err(AmountError::BrandMismatch {
                left: left.brand.clone(),
                right: right.brand.clone(),
            });
        }
        self.helpers(right)?;
        self.helpers(left)
    }
}

impl AssetSink for BrandRegistry {
    fn asset_kind(&self, brand: &Brand) -> Option<AssetKind> {
        self.brands.read().get(brand).map(|h| h.kind())
    }

    fn coerce(&self, brand: &Brand, raw: AmountValue) -> Result<Amount, AmountError> {
        let amount = Amount {
            brand: brand.clone(),
            value: raw,
        };
        self.helpers(&amount)?;
        Ok(amount)
    }

    fn make_empty(&self, brand: &Brand) -> Result<Amount, AmountError> {
        let kind = self
            .asset_kind(brand)
            .ok_or_else(|| AmountError::UnknownBrand(brand.clone()))?;
        Ok(Amount {
            brand: brand.clone(),
            value: AmountValue::empty(kind),
        })
    }

    fn is_empty(&self, amount: &Amount) -> Result<bool, AmountError> {
        Ok(self.helpers(amount)?.is_empty(&amount.value))
    }

    fn is_gte(&self, left: &Amount, right: &Amount) -> Result<bool, AmountError> {
        Ok(self.helpers_pair(left, right)?.is_gte(&left.value, &right.value))
    }

    fn add(&self, left: &Amount, right: &Amount) -> Result<Amount, AmountError> {
        let value = self
            .helpers_pair(left, right)?
            .add(&left.brand, &left.value, &right.value)?;
        Ok(Amount {
            brand: left.brand.clone(),
            value,
        })
    }

    fn subtract(&self, left: &Amount, right: &Amount) -> Result<Amount, AmountError> {
        let value = self
            .helpers_pair(left, right)?
            .subtract(&left.brand, &left.value, &right.value)?;
        Ok(Amount {
            brand: left.brand.clone(),
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (BrandRegistry, Brand, Brand, Brand) {
        let moola = Brand::new("moola");
        let tickets = Brand::new("tickets");
        let cards = Brand::new("cards");
        let registry = BrandRegistry::new()
            .with_brand(&moola, AssetKind::Count)
            .with_brand(&tickets, AssetKind::Set)
            .with_brand(&cards, AssetKind::Multiset);
        (registry, moola, tickets, cards)
    }

    #[test]
    fn test_count_math() {
        let (sink, moola, _, _) = registry();
        let three = Amount::count(&moola, 3);
        let five = Amount::count(&moola, 5);
        assert!(sink.is_gte(&five, &three).unwrap());
        assert!(!sink.is_gte(&three, &five).unwrap());
        assert_eq!(sink.add(&three, &five).unwrap(), Amount::count(&moola, 8));
        assert_eq!(sink.subtract(&five, &three).unwrap(), Amount::count(&moola, 2));
        assert!(matches!(
            sink.subtract(&three, &five),
            Err(AmountError::Underflow { .. })
        ));
    }

    #[test]
    fn test_count_overflow() {
        let (sink, moola, _, _) = registry();
        let max = Amount::count(&moola, u128::MAX);
        let one = Amount::count(&moola, 1);
        assert!(matches!(sink.add(&max, &one), Err(AmountError::Overflow(_))));
    }

    #[test]
    fn test_set_math() {
        let (sink, _, tickets, _) = registry();
        let ab = Amount::set(&tickets, ["a", "b"]);
        let a = Amount::set(&tickets, ["a"]);
        assert!(sink.is_gte(&ab, &a).unwrap());
        assert_eq!(sink.subtract(&ab, &a).unwrap(), Amount::set(&tickets, ["b"]));
        assert!(matches!(
            sink.add(&ab, &a),
            Err(AmountError::DuplicateElement { .. })
        ));
    }

    #[test]
    fn test_multiset_math() {
        let (sink, _, _, cards) = registry();
        let two_aces = Amount::multiset(&cards, [("ace", 2)]);
        let ace = Amount::multiset(&cards, [("ace", 1)]);
        assert!(sink.is_gte(&two_aces, &ace).unwrap());
        assert_eq!(sink.subtract(&two_aces, &two_aces).unwrap(), sink.make_empty(&cards).unwrap());
        assert_eq!(
            sink.add(&ace, &ace).unwrap(),
            Amount::multiset(&cards, [("ace", 2)])
        );
    }

    #[test]
    fn test_cross_brand_rejected() {
        let (sink, moola, _, _) = registry();
        let simoleans = Brand::new("simoleans");
        sink.register(&simoleans, AssetKind::Count);
        let result = sink.is_gte(&Amount::count(&moola, 1), &Amount::count(&simoleans, 1));
        assert!(matches!(result, Err(AmountError::BrandMismatch { .. })));
    }

    #[test]
    fn test_coerce_checks_kind() {
        let (sink, moola, _, _) = registry();
        assert!(sink.coerce(&moola, AmountValue::Count(4)).is_ok());
        assert!(matches!(
            sink.coerce(&moola, AmountValue::empty(AssetKind::Set)),
            Err(AmountError::KindMismatch { .. })
        ));
        assert!(matches!(
            sink.coerce(&Brand::new("nope"), AmountValue::Count(1)),
            Err(AmountError::UnknownBrand(_))
        ));
    }

    #[test]
    fn test_register_is_fixed() {
        let (sink, moola, _, _) = registry();
        assert!(sink.register(&moola, AssetKind::Count));
        assert!(!sink.register(&moola, AssetKind::Set));
        assert_eq!(sink.asset_kind(&moola), Some(AssetKind::Count));
    }

    #[test]
    fn test_is_empty() {
        let (sink, moola, tickets, _) = registry();
        assert!(sink.is_empty(&Amount::count(&moola, 0)).unwrap());
        assert!(!sink.is_empty(&Amount::set(&tickets, ["x"])).unwrap());
    }
}
