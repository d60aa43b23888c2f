//! # Proposal Cleaning
//!
//! Normalizes a raw offer request into a canonical `Proposal`.
//!
//! Pure and deterministic. Cleaning the raw form of an already-clean
//! proposal yields the same proposal.

use crate::domain::{
    Allocation, Amount, AmountPattern, AmountValue, AssetKind, Brand, EscrowError, ExitRule,
    Keyword, Proposal, TimerRef, WantRecord,
};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

const PROPOSAL_KEYS: [&str; 4] = ["give", "want", "exit", "multiples"];

/// Clean a raw proposal.
///
/// `asset_kind_of` reports the kind a brand was registered with.
pub fn clean_proposal<F>(raw: &Value, asset_kind_of: F) -> Result<Proposal, EscrowError>
where
    F: Fn(&Brand) -> Option<AssetKind>,
{
    let record = raw.as_object().ok_or_else(|| {
        EscrowError::ProposalShape(format!(
            "\"proposal\" {raw} must be a pass-by-copy record, not {}",
            type_name(raw)
        ))
    })?;

    if let Some(extra) = record.keys().find(|k| !PROPOSAL_KEYS.contains(&k.as_str())) {
        return Err(EscrowError::ProposalShape(format!(
            "{raw} - Must only have want:, give:, exit:, multiples: properties (found {extra:?})"
        )));
    }

    let give = clean_give(record.get("give"))?;
    let want = clean_want(record.get("want"))?;

    if let Some(keyword) = give.keys().find(|k| want.contains_key(*k)) {
        return Err(EscrowError::DuplicateKeyword(keyword.to_string()));
    }

    for amount in give.values() {
        assert_kind(amount, &asset_kind_of)?;
    }
    for pattern in want.values() {
        match pattern {
            AmountPattern::AtLeast(amount) => assert_kind(amount, &asset_kind_of)?,
            AmountPattern::Any { brand } => {
                if asset_kind_of(brand).is_none() {
                    return Err(EscrowError::UnknownBrand(brand.clone()));
                }
            }
        }
    }

    let exit = match record.get("exit") {
        None => ExitRule::OnDemand,
        Some(raw_exit) => clean_exit(raw_exit)?,
    };

    let multiples = match record.get("multiples") {
        None => 1,
        Some(value) => value
            .as_u64()
            .filter(|n| *n > 0)
            .ok_or_else(|| {
                EscrowError::ProposalShape(format!("multiples {value} must be a positive integer"))
            })?,
    };

    Ok(Proposal {
        give,
        want,
        exit,
        multiples,
    })
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "record",
    }
}

fn keyword_record<'a>(raw: Option<&'a Value>) -> Result<Option<&'a Map<String, Value>>, EscrowError> {
    match raw {
        None => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(other) => Err(EscrowError::ProposalShape(format!(
            "\"keywordRecord\" {other} must be a pass-by-copy record, not {}",
            type_name(other)
        ))),
    }
}

fn clean_keyword(name: &str) -> Result<Keyword, EscrowError> {
    Keyword::new(name).map_err(EscrowError::ProposalShape)
}

fn clean_give(raw: Option<&Value>) -> Result<Allocation, EscrowError> {
    let mut give = Allocation::new();
    if let Some(record) = keyword_record(raw)? {
        for (name, value) in record {
            let keyword = clean_keyword(name)?;
            if is_pattern(value) {
                return Err(EscrowError::ProposalShape(format!(
                    "a pattern is not an amount: {value} under 'give' keyword {keyword}"
                )));
            }
            give.insert(keyword, parse_amount(value)?);
        }
    }
    Ok(give)
}

fn clean_want(raw: Option<&Value>) -> Result<WantRecord, EscrowError> {
    let mut want = WantRecord::new();
    if let Some(record) = keyword_record(raw)? {
        for (name, value) in record {
            let keyword = clean_keyword(name)?;
            want.insert(keyword, parse_pattern(value)?);
        }
    }
    Ok(want)
}

fn is_pattern(value: &Value) -> bool {
    value.get("match").is_some()
}

fn parse_pattern(raw: &Value) -> Result<AmountPattern, EscrowError> {
    if !is_pattern(raw) {
        return parse_amount(raw).map(AmountPattern::AtLeast);
    }
    let record = raw
        .as_object()
        .filter(|r| r.len() == 2)
        .ok_or_else(|| bad_amount(raw))?;
    let brand = parse_brand(record.get("brand"), raw)?;
    match record.get("match").and_then(Value::as_str) {
        Some("any") => Ok(AmountPattern::Any { brand }),
        _ => Err(EscrowError::ProposalShape(format!(
            "unsupported amount pattern {raw}"
        ))),
    }
}

fn bad_amount(raw: &Value) -> EscrowError {
    EscrowError::ProposalShape(format!(
        "{raw} - Must be an amount record {{brand, value}}"
    ))
}

fn parse_brand(raw: Option<&Value>, whole: &Value) -> Result<Brand, EscrowError> {
    raw.and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(Brand::new)
        .ok_or_else(|| bad_amount(whole))
}

/// Parse a raw `{brand, value}` record into an amount.
///
/// The magnitude kind follows the JSON shape: integer (or decimal string)
/// for count, array of strings for set, object of positive integers for
/// multiset.
pub fn parse_amount(raw: &Value) -> Result<Amount, EscrowError> {
    let record = raw
        .as_object()
        .filter(|r| r.len() == 2)
        .ok_or_else(|| bad_amount(raw))?;
    let brand = parse_brand(record.get("brand"), raw)?;
    let value = record.get("value").ok_or_else(|| bad_amount(raw))?;

    let value = match value {
        Value::Number(n) => AmountValue::Count(u128::from(n.as_u64().ok_or_else(|| {
            EscrowError::ProposalShape(format!("{n} - Must be a natural number"))
        })?)),
        Value::String(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => {
            AmountValue::Count(s.parse::<u128>().map_err(|_| {
                EscrowError::ProposalShape(format!("{s:?} - Must be a natural number"))
            })?)
        }
        Value::Array(items) => {
            let mut elements = BTreeSet::new();
            for item in items {
                let element = item.as_str().ok_or_else(|| {
                    EscrowError::ProposalShape(format!("set element {item} must be a string"))
                })?;
                if !elements.insert(element.to_string()) {
                    return Err(EscrowError::ProposalShape(format!(
                        "set element {element:?} appears more than once"
                    )));
                }
            }
            AmountValue::Set(elements)
        }
        Value::Object(entries) => {
            let mut bag = BTreeMap::new();
            for (element, count) in entries {
                let count = count.as_u64().filter(|c| *c > 0).ok_or_else(|| {
                    EscrowError::ProposalShape(format!(
                        "multiset count {count} for {element:?} must be a positive integer"
                    ))
                })?;
                bag.insert(element.clone(), count);
            }
            AmountValue::Multiset(bag)
        }
        other => {
            return Err(EscrowError::ProposalShape(format!(
                "{other} - Must be a count, set or multiset value"
            )))
        }
    };

    Ok(Amount { brand, value })
}

fn assert_kind<F>(amount: &Amount, asset_kind_of: &F) -> Result<(), EscrowError>
where
    F: Fn(&Brand) -> Option<AssetKind>,
{
    let declared =
        asset_kind_of(&amount.brand).ok_or_else(|| EscrowError::UnknownBrand(amount.brand.clone()))?;
    if declared != amount.kind() {
        return Err(EscrowError::AssetKindMismatch {
            brand: amount.brand.clone(),
            expected: declared.name().to_string(),
            value: amount.to_string(),
        });
    }
    Ok(())
}

fn clean_exit(raw: &Value) -> Result<ExitRule, EscrowError> {
    let record = raw.as_object().ok_or_else(|| {
        EscrowError::ExitShape(format!("{raw} - Must have shape of base: \"copyRecord\""))
    })?;
    if record.len() != 1 {
        return Err(EscrowError::ExitShape(format!(
            "exit {raw} should only have one key"
        )));
    }

    let (name, body) = record
        .iter()
        .next()
        .ok_or_else(|| EscrowError::ExitShape(format!("exit {raw} should only have one key")))?;

    match name.as_str() {
        "onDemand" | "waived" => {
            if !body.is_null() {
                return Err(EscrowError::ExitShape(format!(
                    "{raw} - Must be equivalent to: {{\"{name}\":null}}"
                )));
            }
            Ok(if name == "onDemand" {
                ExitRule::OnDemand
            } else {
                ExitRule::Waived
            })
        }
        "afterDeadline" => {
            let fields = body.as_object().ok_or_else(|| {
                EscrowError::ExitShape(format!(
                    "{body} - Must be a copyRecord to match a copyRecord pattern: {{\"timer\", \"deadline\"}}"
                ))
            })?;
            if fields.len() != 2 || !fields.contains_key("timer") || !fields.contains_key("deadline")
            {
                return Err(EscrowError::ExitShape(format!(
                    "{body} - Must have same property names as record pattern: [\"deadline\",\"timer\"]"
                )));
            }
            let timer = fields
                .get("timer")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(TimerRef::new)
                .ok_or_else(|| {
                    EscrowError::ExitShape(format!(
                        "{} - Must be a timer reference",
                        fields["timer"]
                    ))
                })?;
            let deadline = fields
                .get("deadline")
                .and_then(Value::as_u64)
                .ok_or_else(|| {
                    EscrowError::ExitShape(format!("{} - Must be >= 0", fields["deadline"]))
                })?;
            Ok(ExitRule::AfterDeadline { timer, deadline })
        }
        other => Err(EscrowError::ExitShape(format!(
            "exit rule {other:?} is not one of onDemand, waived, afterDeadline"
        ))),
    }
}
