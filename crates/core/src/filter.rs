//! Composable filter expressions.
//!
//! A filter tree is a node with exactly one populated branch: a composite
//! (`and`, `or`, `not`) or a leaf (`rel`, `amount`, `time`, `str`, `index`,
//! `size`). The JSON encoding mirrors the algebra and rejects unknown
//! fields, so a rendered tree parses back to an equal tree. [`Filters::validate`]
//! reports the first violation found in a depth-first walk.

use crate::identifier::Identifier;
use crate::time::Timestamp;
use crate::unit::AmountUnit;
use serde::{Deserialize, Serialize};

/// First violation found while validating a filter tree.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{path}: {message}")]
pub struct FilterViolation {
    pub path: String,
    pub message: String,
}

fn violation(path: &str, message: impl Into<String>) -> FilterViolation {
    FilterViolation { path: path.to_string(), message: message.into() }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Relation leaf: documents whose `prop` points at `value`, or (with `none`)
/// documents without any `prop` edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelFilter {
    pub prop: Identifier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Identifier>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub none: bool,
}

/// Amount leaf: a unit-scoped range over `prop`, or its absence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AmountFilter {
    pub prop: Identifier,
    pub unit: AmountUnit,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gte: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lte: Option<f64>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub none: bool,
}

/// Time leaf: a timestamp range over `prop`, or its absence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeFilter {
    pub prop: Identifier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gte: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lte: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub none: bool,
}

/// String leaf: an exact lowercased value for `prop`, or its absence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StringFilter {
    pub prop: Identifier,
    #[serde(rename = "str", default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub none: bool,
}

/// Index leaf: documents living in a named index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexFilter {
    #[serde(rename = "str")]
    pub value: String,
}

/// Size leaf: a byte-size range over the `_size` pseudo-field, or documents
/// without one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SizeFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gte: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lte: Option<i64>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub none: bool,
}

/// A filter tree node. Exactly one field may be populated.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Filters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub and: Option<Vec<Filters>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub or: Option<Vec<Filters>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not: Option<Box<Filters>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rel: Option<RelFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<AmountFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<TimeFilter>,
    #[serde(rename = "str", default, skip_serializing_if = "Option::is_none")]
    pub string: Option<StringFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<IndexFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<SizeFilter>,
}

impl Filters {
    pub fn all_of(children: Vec<Filters>) -> Self {
        Filters { and: Some(children), ..Default::default() }
    }

    pub fn any_of(children: Vec<Filters>) -> Self {
        Filters { or: Some(children), ..Default::default() }
    }

    pub fn negate(child: Filters) -> Self {
        Filters { not: Some(Box::new(child)), ..Default::default() }
    }

    pub fn rel(prop: Identifier, value: Identifier) -> Self {
        Filters {
            rel: Some(RelFilter { prop, value: Some(value), none: false }),
            ..Default::default()
        }
    }

    pub fn rel_none(prop: Identifier) -> Self {
        Filters { rel: Some(RelFilter { prop, value: None, none: true }), ..Default::default() }
    }

    pub fn string(prop: Identifier, value: impl Into<String>) -> Self {
        Filters {
            string: Some(StringFilter { prop, value: Some(value.into()), none: false }),
            ..Default::default()
        }
    }

    pub fn amount(prop: Identifier, unit: AmountUnit, gte: Option<f64>, lte: Option<f64>) -> Self {
        Filters {
            amount: Some(AmountFilter { prop, unit, gte, lte, none: false }),
            ..Default::default()
        }
    }

    pub fn time(prop: Identifier, gte: Option<Timestamp>, lte: Option<Timestamp>) -> Self {
        Filters { time: Some(TimeFilter { prop, gte, lte, none: false }), ..Default::default() }
    }

    pub fn index(value: impl Into<String>) -> Self {
        Filters { index: Some(IndexFilter { value: value.into() }), ..Default::default() }
    }

    pub fn size(gte: Option<i64>, lte: Option<i64>) -> Self {
        Filters { size: Some(SizeFilter { gte, lte, none: false }), ..Default::default() }
    }

    /// Validate the whole tree, reporting the first violation depth-first.
    pub fn validate(&self) -> Result<(), FilterViolation> {
        self.check("filters", true)
    }

    fn populated(&self) -> usize {
        [
            self.and.is_some(),
            self.or.is_some(),
            self.not.is_some(),
            self.rel.is_some(),
            self.amount.is_some(),
            self.time.is_some(),
            self.string.is_some(),
            self.index.is_some(),
            self.size.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }

    fn check(&self, path: &str, top: bool) -> Result<(), FilterViolation> {
        match self.populated() {
            1 => {}
            0 => return Err(violation(path, "no filter set")),
            n => return Err(violation(path, format!("{n} filters set, expected exactly one"))),
        }

        if let Some(children) = &self.and {
            if top && children.is_empty() {
                return Err(violation(path, "empty \"and\" at the top level"));
            }
            for (i, child) in children.iter().enumerate() {
                child.check(&format!("{path}.and[{i}]"), false)?;
            }
        }
        if let Some(children) = &self.or {
            if top && children.is_empty() {
                return Err(violation(path, "empty \"or\" at the top level"));
            }
            for (i, child) in children.iter().enumerate() {
                child.check(&format!("{path}.or[{i}]"), false)?;
            }
        }
        if let Some(child) = &self.not {
            child.check(&format!("{path}.not"), false)?;
        }

        if let Some(rel) = &self.rel {
            let path = format!("{path}.rel");
            match (&rel.value, rel.none) {
                (Some(_), true) => return Err(violation(&path, "both \"value\" and \"none\" set")),
                (None, false) => return Err(violation(&path, "neither \"value\" nor \"none\" set")),
                _ => {}
            }
        }
        if let Some(amount) = &self.amount {
            let path = format!("{path}.amount");
            check_range(&path, amount.gte.is_some(), amount.lte.is_some(), amount.none)?;
        }
        if let Some(time) = &self.time {
            let path = format!("{path}.time");
            check_range(&path, time.gte.is_some(), time.lte.is_some(), time.none)?;
            if let (Some(gte), Some(lte)) = (&time.gte, &time.lte) {
                if gte > lte {
                    return Err(violation(&path, "\"gte\" after \"lte\""));
                }
            }
        }
        if let Some(string) = &self.string {
            let path = format!("{path}.str");
            match (&string.value, string.none) {
                (Some(_), true) => return Err(violation(&path, "both \"str\" and \"none\" set")),
                (None, false) => return Err(violation(&path, "neither \"str\" nor \"none\" set")),
                (Some(v), false) if v.is_empty() => {
                    return Err(violation(&path, "empty \"str\""));
                }
                _ => {}
            }
        }
        if let Some(index) = &self.index {
            if index.value.is_empty() {
                return Err(violation(&format!("{path}.index"), "empty \"str\""));
            }
        }
        if let Some(size) = &self.size {
            let path = format!("{path}.size");
            check_range(&path, size.gte.is_some(), size.lte.is_some(), size.none)?;
        }
        Ok(())
    }
}

fn check_range(path: &str, gte: bool, lte: bool, none: bool) -> Result<(), FilterViolation> {
    if none && (gte || lte) {
        return Err(violation(path, "\"none\" set together with a range bound"));
    }
    if !none && !gte && !lte {
        return Err(violation(path, "no range bound and no \"none\""));
    }
    Ok(())
}
