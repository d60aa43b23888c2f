//! # Domain Value Objects
//!
//! Immutable value types for the escrow engine: brands, amounts, keywords,
//! exit rules and seat states.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Logical timestamp delivered by a timer service.
pub type Timestamp = u64;

/// Identity of an asset type.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Brand(String);

impl Brand {
    /// Create a brand identity.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Brand name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Brand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Magnitude kind of a brand, fixed at registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetKind {
    /// Fungible natural-number count.
    Count,
    /// Set of unique elements.
    Set,
    /// Multiset of elements with multiplicities.
    Multiset,
}

impl AssetKind {
    /// Name used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            AssetKind::Count => "count",
            AssetKind::Set => "set",
            AssetKind::Multiset => "multiset",
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind-specific magnitude of an amount.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AmountValue {
    /// Natural-number count.
    Count(u128),
    /// Unordered set of unique copies.
    Set(BTreeSet<String>),
    /// Unordered multiset: element -> multiplicity.
    Multiset(BTreeMap<String, u64>),
}

impl AmountValue {
    /// Kind of this magnitude.
    pub fn kind(&self) -> AssetKind {
        match self {
            AmountValue::Count(_) => AssetKind::Count,
            AmountValue::Set(_) => AssetKind::Set,
            AmountValue::Multiset(_) => AssetKind::Multiset,
        }
    }

    /// Empty magnitude of a kind.
    pub fn empty(kind: AssetKind) -> Self {
        match kind {
            AssetKind::Count => AmountValue::Count(0),
            AssetKind::Set => AmountValue::Set(BTreeSet::new()),
            AssetKind::Multiset => AmountValue::Multiset(BTreeMap::new()),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            // Counts above 2^53 are not exact as JSON numbers.
            AmountValue::Count(n) if *n > (1u128 << 53) => Value::String(n.to_string()),
            AmountValue::Count(n) => json!(*n as u64),
            AmountValue::Set(elements) => json!(elements),
            AmountValue::Multiset(bag) => json!(bag),
        }
    }
}

/// A brand-tagged magnitude.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amount {
    /// Asset type.
    pub brand: Brand,
    /// Magnitude.
    pub value: AmountValue,
}

impl Amount {
    /// Count amount.
    pub fn count(brand: &Brand, n: u128) -> Self {
        Self {
            brand: brand.clone(),
            value: AmountValue::Count(n),
        }
    }

    /// Set amount.
    pub fn set<I, S>(brand: &Brand, elements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            brand: brand.clone(),
            value: AmountValue::Set(elements.into_iter().map(Into::into).collect()),
        }
    }

    /// Multiset amount; zero multiplicities are dropped.
    pub fn multiset<I, S>(brand: &Brand, entries: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        Self {
            brand: brand.clone(),
            value: AmountValue::Multiset(
                entries
                    .into_iter()
                    .filter(|(_, n)| *n > 0)
                    .map(|(k, n)| (k.into(), n))
                    .collect(),
            ),
        }
    }

    /// Kind of the magnitude.
    pub fn kind(&self) -> AssetKind {
        self.value.kind()
    }

    /// Count magnitude, if count-kind.
    pub fn as_count(&self) -> Option<u128> {
        match self.value {
            AmountValue::Count(n) => Some(n),
            _ => None,
        }
    }

    /// Raw record form `{"brand": .., "value": ..}`.
    pub fn to_value(&self) -> Value {
        json!({ "brand": self.brand.as_str(), "value": self.value.to_value() })
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_value())
    }
}

/// Value under a `want` keyword.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AmountPattern {
    /// At least this amount.
    AtLeast(Amount),
    /// Any amount of the brand.
    Any {
        /// Brand that must be present
        brand: Brand,
    },
}

impl AmountPattern {
    /// Brand the pattern refers to.
    pub fn brand(&self) -> &Brand {
        match self {
            AmountPattern::AtLeast(amount) => &amount.brand,
            AmountPattern::Any { brand } => brand,
        }
    }

    /// Raw record form.
    pub fn to_value(&self) -> Value {
        match self {
            AmountPattern::AtLeast(amount) => amount.to_value(),
            AmountPattern::Any { brand } => json!({ "brand": brand.as_str(), "match": "any" }),
        }
    }
}

impl From<Amount> for AmountPattern {
    fn from(amount: Amount) -> Self {
        AmountPattern::AtLeast(amount)
    }
}

/// Field name inside a give/want/allocation record.
///
/// ASCII identifier starting with an upper-case letter.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Keyword(String);

impl Keyword {
    /// Validate and wrap a keyword.
    pub fn new(name: impl Into<String>) -> Result<Self, String> {
        let name = name.into();
        if is_valid_keyword(&name) {
            Ok(Self(name))
        } else {
            Err(format!(
                "keyword {name:?} must be an ascii identifier starting with upper case."
            ))
        }
    }

    /// Keyword text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Keyword {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Keyword> for String {
    fn from(keyword: Keyword) -> Self {
        keyword.0
    }
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `^[A-Z][A-Za-z0-9_$]*$`, excluding the reserved `NaN` and `Infinity`.
pub fn is_valid_keyword(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    first.is_ascii_uppercase()
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        && name != "NaN"
        && name != "Infinity"
}

/// Name of a timer service registered with an instance.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimerRef(String);

impl TimerRef {
    /// Create a timer reference.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Timer name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TimerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Policy governing when a seat leaves escrow.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitRule {
    /// Holder may exit at any time.
    #[default]
    OnDemand,
    /// Only contract logic may exit the seat.
    Waived,
    /// Forced exit when the named timer reaches the deadline.
    AfterDeadline {
        /// Timer delivering the wakeup
        timer: TimerRef,
        /// Deadline on that timer
        deadline: Timestamp,
    },
}

impl ExitRule {
    /// Name used in the raw form and in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            ExitRule::OnDemand => "onDemand",
            ExitRule::Waived => "waived",
            ExitRule::AfterDeadline { .. } => "afterDeadline",
        }
    }

    /// Raw record form.
    pub fn to_value(&self) -> Value {
        match self {
            ExitRule::OnDemand => json!({ "onDemand": null }),
            ExitRule::Waived => json!({ "waived": null }),
            ExitRule::AfterDeadline { timer, deadline } => json!({
                "afterDeadline": { "timer": timer.as_str(), "deadline": deadline }
            }),
        }
    }
}

/// Seat identifier, unique within one instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeatId(pub u64);

impl fmt::Display for SeatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seat-{}", self.0)
    }
}

/// Contract instance identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    /// Fresh random instance id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance-{}", self.0)
    }
}

/// Seat lifecycle state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeatState {
    /// Holding escrow, eligible for reallocation.
    #[default]
    Active,
    /// Allocation frozen as payout.
    Exited,
}

impl SeatState {
    /// Check if transition is valid.
    pub fn can_transition_to(&self, next: SeatState) -> bool {
        matches!((self, next), (Self::Active, Self::Exited))
    }

    /// Check if terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited)
    }
}

/// Why a seat exited.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitCause {
    /// Holder called `exit()`.
    Voluntary,
    /// Contract logic exited the seat.
    ContractForced,
    /// Timer wakeup at or after the deadline.
    Deadline {
        /// Timestamp the wakeup was delivered with
        at: Timestamp,
    },
    /// Contract failed the seat (handler error or explicit fail).
    Failed {
        /// Failure description
        reason: String,
    },
}
