//! Typed polymorphic claims.
//!
//! A claim is a property/value assertion attached to a document. The claim is
//! a tagged union with a `kind` discriminant and one struct per case; shared
//! metadata lives in [`ClaimMeta`]. Traversal goes through [`ClaimVisitor`],
//! a capability with one method per case plus `visit_meta` — each method
//! decides whether the claim is kept or dropped.
//!
//! Claim equality ignores `id` and `confidence`: two claims are equal when
//! they assert the same value for the same property.

use crate::identifier::Identifier;
use crate::time::{TimePrecision, Timestamp};
use crate::unit::AmountUnit;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reference to the property a claim instantiates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyRef {
    pub id: Identifier,
}

/// Reference to another document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub id: Identifier,
}

/// Metadata carried by every claim. Equality compares the property only —
/// `id` and `confidence` never participate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimMeta {
    pub id: Identifier,
    pub confidence: f64,
    pub prop: PropertyRef,
}

impl PartialEq for ClaimMeta {
    fn eq(&self, other: &Self) -> bool {
        self.prop == other.prop
    }
}

impl ClaimMeta {
    pub fn new(id: Identifier, confidence: f64, prop: Identifier) -> Self {
        ClaimMeta { id, confidence, prop: PropertyRef { id: prop } }
    }
}

// ---------------------------------------------------------------------------
// Claim cases
// ---------------------------------------------------------------------------

/// Exact-match scalar string, e.g. an external catalog identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifierClaim {
    #[serde(flatten)]
    pub meta: ClaimMeta,
    pub identifier: String,
}

/// An IRI pointing outside the corpus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceClaim {
    #[serde(flatten)]
    pub meta: ClaimMeta,
    pub iri: String,
}

/// Language-mapped rich text with a parallel plain-text projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextClaim {
    #[serde(flatten)]
    pub meta: ClaimMeta,
    pub html: BTreeMap<String, String>,
    pub plain: BTreeMap<String, String>,
}

impl TextClaim {
    /// Build from HTML per language, deriving the plain projection.
    pub fn from_html(meta: ClaimMeta, html: BTreeMap<String, String>) -> Self {
        let plain = html.iter().map(|(lang, h)| (lang.clone(), strip_tags(h))).collect();
        TextClaim { meta, html, plain }
    }
}

/// A lowercased scalar string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StringClaim {
    #[serde(flatten)]
    pub meta: ClaimMeta,
    pub string: String,
}

impl StringClaim {
    /// String claims are stored lowercased.
    pub fn new(meta: ClaimMeta, value: &str) -> Self {
        StringClaim { meta, string: value.to_lowercase() }
    }
}

/// A measured quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmountClaim {
    #[serde(flatten)]
    pub meta: ClaimMeta,
    pub amount: f64,
    pub unit: AmountUnit,
}

/// A quantity known only within bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmountRangeClaim {
    #[serde(flatten)]
    pub meta: ClaimMeta,
    pub lower: f64,
    pub upper: f64,
    pub unit: AmountUnit,
}

/// A directed edge to another document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationClaim {
    #[serde(flatten)]
    pub meta: ClaimMeta,
    pub to: DocumentRef,
}

/// An instant with explicit precision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeClaim {
    #[serde(flatten)]
    pub meta: ClaimMeta,
    pub timestamp: Timestamp,
    pub precision: TimePrecision,
}

/// An interval known only within bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeRangeClaim {
    #[serde(flatten)]
    pub meta: ClaimMeta,
    pub lower: Timestamp,
    pub upper: Timestamp,
    pub precision: TimePrecision,
}

/// A span of time, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationClaim {
    #[serde(flatten)]
    pub meta: ClaimMeta,
    pub amount: f64,
}

/// A span of time known only within bounds, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationRangeClaim {
    #[serde(flatten)]
    pub meta: ClaimMeta,
    pub lower: f64,
    pub upper: f64,
}

/// A media file attached to the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileClaim {
    #[serde(flatten)]
    pub meta: ClaimMeta,
    pub media_type: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preview: Vec<String>,
}

/// Membership of an ordered list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListClaim {
    #[serde(flatten)]
    pub meta: ClaimMeta,
    pub element: DocumentRef,
    pub order: f64,
}

/// Asserts the property has no value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoValueClaim {
    #[serde(flatten)]
    pub meta: ClaimMeta,
}

/// Asserts the property has a value nobody knows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnknownValueClaim {
    #[serde(flatten)]
    pub meta: ClaimMeta,
}

// ---------------------------------------------------------------------------
// The tagged union
// ---------------------------------------------------------------------------

/// A claim of any kind. Serialized with a `kind` discriminant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Claim {
    Id(IdentifierClaim),
    Ref(ReferenceClaim),
    Text(TextClaim),
    String(StringClaim),
    Amount(AmountClaim),
    AmountRange(AmountRangeClaim),
    Rel(RelationClaim),
    Time(TimeClaim),
    TimeRange(TimeRangeClaim),
    Duration(DurationClaim),
    DurationRange(DurationRangeClaim),
    File(FileClaim),
    List(ListClaim),
    #[serde(rename = "none")]
    NoValue(NoValueClaim),
    #[serde(rename = "unknown")]
    UnknownValue(UnknownValueClaim),
}

impl Claim {
    pub fn meta(&self) -> &ClaimMeta {
        match self {
            Claim::Id(c) => &c.meta,
            Claim::Ref(c) => &c.meta,
            Claim::Text(c) => &c.meta,
            Claim::String(c) => &c.meta,
            Claim::Amount(c) => &c.meta,
            Claim::AmountRange(c) => &c.meta,
            Claim::Rel(c) => &c.meta,
            Claim::Time(c) => &c.meta,
            Claim::TimeRange(c) => &c.meta,
            Claim::Duration(c) => &c.meta,
            Claim::DurationRange(c) => &c.meta,
            Claim::File(c) => &c.meta,
            Claim::List(c) => &c.meta,
            Claim::NoValue(c) => &c.meta,
            Claim::UnknownValue(c) => &c.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut ClaimMeta {
        match self {
            Claim::Id(c) => &mut c.meta,
            Claim::Ref(c) => &mut c.meta,
            Claim::Text(c) => &mut c.meta,
            Claim::String(c) => &mut c.meta,
            Claim::Amount(c) => &mut c.meta,
            Claim::AmountRange(c) => &mut c.meta,
            Claim::Rel(c) => &mut c.meta,
            Claim::Time(c) => &mut c.meta,
            Claim::TimeRange(c) => &mut c.meta,
            Claim::Duration(c) => &mut c.meta,
            Claim::DurationRange(c) => &mut c.meta,
            Claim::File(c) => &mut c.meta,
            Claim::List(c) => &mut c.meta,
            Claim::NoValue(c) => &mut c.meta,
            Claim::UnknownValue(c) => &mut c.meta,
        }
    }

    pub fn id(&self) -> &Identifier {
        &self.meta().id
    }

    pub fn prop_id(&self) -> &Identifier {
        &self.meta().prop.id
    }

    /// The serialized discriminant, matching the index bucket name.
    pub fn kind(&self) -> &'static str {
        match self {
            Claim::Id(_) => "id",
            Claim::Ref(_) => "ref",
            Claim::Text(_) => "text",
            Claim::String(_) => "string",
            Claim::Amount(_) => "amount",
            Claim::AmountRange(_) => "amount_range",
            Claim::Rel(_) => "rel",
            Claim::Time(_) => "time",
            Claim::TimeRange(_) => "time_range",
            Claim::Duration(_) => "duration",
            Claim::DurationRange(_) => "duration_range",
            Claim::File(_) => "file",
            Claim::List(_) => "list",
            Claim::NoValue(_) => "none",
            Claim::UnknownValue(_) => "unknown",
        }
    }

    /// Run the visitor over this claim: metadata first, then the case method.
    pub fn accept(&self, visitor: &mut dyn ClaimVisitor) -> VisitDecision {
        if visitor.visit_meta(self.meta()) == VisitDecision::Drop {
            return VisitDecision::Drop;
        }
        match self {
            Claim::Id(c) => visitor.visit_id(c),
            Claim::Ref(c) => visitor.visit_ref(c),
            Claim::Text(c) => visitor.visit_text(c),
            Claim::String(c) => visitor.visit_string(c),
            Claim::Amount(c) => visitor.visit_amount(c),
            Claim::AmountRange(c) => visitor.visit_amount_range(c),
            Claim::Rel(c) => visitor.visit_rel(c),
            Claim::Time(c) => visitor.visit_time(c),
            Claim::TimeRange(c) => visitor.visit_time_range(c),
            Claim::Duration(c) => visitor.visit_duration(c),
            Claim::DurationRange(c) => visitor.visit_duration_range(c),
            Claim::File(c) => visitor.visit_file(c),
            Claim::List(c) => visitor.visit_list(c),
            Claim::NoValue(c) => visitor.visit_no_value(c),
            Claim::UnknownValue(c) => visitor.visit_unknown_value(c),
        }
    }
}

// ---------------------------------------------------------------------------
// Visitor capability
// ---------------------------------------------------------------------------

/// Whether a visited claim stays in its document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitDecision {
    Keep,
    Drop,
}

/// Traversal capability over claims. Every method defaults to `Keep`, so a
/// visitor implements only the cases it cares about. `visit_meta` runs before
/// the case method and can veto the claim outright.
#[allow(unused_variables)]
pub trait ClaimVisitor {
    fn visit_meta(&mut self, meta: &ClaimMeta) -> VisitDecision {
        VisitDecision::Keep
    }
    fn visit_id(&mut self, claim: &IdentifierClaim) -> VisitDecision {
        VisitDecision::Keep
    }
    fn visit_ref(&mut self, claim: &ReferenceClaim) -> VisitDecision {
        VisitDecision::Keep
    }
    fn visit_text(&mut self, claim: &TextClaim) -> VisitDecision {
        VisitDecision::Keep
    }
    fn visit_string(&mut self, claim: &StringClaim) -> VisitDecision {
        VisitDecision::Keep
    }
    fn visit_amount(&mut self, claim: &AmountClaim) -> VisitDecision {
        VisitDecision::Keep
    }
    fn visit_amount_range(&mut self, claim: &AmountRangeClaim) -> VisitDecision {
        VisitDecision::Keep
    }
    fn visit_rel(&mut self, claim: &RelationClaim) -> VisitDecision {
        VisitDecision::Keep
    }
    fn visit_time(&mut self, claim: &TimeClaim) -> VisitDecision {
        VisitDecision::Keep
    }
    fn visit_time_range(&mut self, claim: &TimeRangeClaim) -> VisitDecision {
        VisitDecision::Keep
    }
    fn visit_duration(&mut self, claim: &DurationClaim) -> VisitDecision {
        VisitDecision::Keep
    }
    fn visit_duration_range(&mut self, claim: &DurationRangeClaim) -> VisitDecision {
        VisitDecision::Keep
    }
    fn visit_file(&mut self, claim: &FileClaim) -> VisitDecision {
        VisitDecision::Keep
    }
    fn visit_list(&mut self, claim: &ListClaim) -> VisitDecision {
        VisitDecision::Keep
    }
    fn visit_no_value(&mut self, claim: &NoValueClaim) -> VisitDecision {
        VisitDecision::Keep
    }
    fn visit_unknown_value(&mut self, claim: &UnknownValueClaim) -> VisitDecision {
        VisitDecision::Keep
    }
}

/// Drop HTML tags, keeping text content with collapsed whitespace.
fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(confidence: f64) -> ClaimMeta {
        ClaimMeta::new(Identifier::random(), confidence, Identifier::random())
    }

    #[test]
    fn equality_ignores_id_and_confidence() {
        let prop = Identifier::random();
        let a = StringClaim {
            meta: ClaimMeta::new(Identifier::random(), 1.0, prop.clone()),
            string: "bridge".into(),
        };
        let b = StringClaim {
            meta: ClaimMeta::new(Identifier::random(), 0.2, prop.clone()),
            string: "bridge".into(),
        };
        let c = StringClaim {
            meta: ClaimMeta::new(Identifier::random(), 1.0, prop),
            string: "tunnel".into(),
        };
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn kind_discriminant_serializes() {
        let claim = Claim::NoValue(NoValueClaim { meta: meta(1.0) });
        let json = serde_json::to_value(&claim).unwrap();
        assert_eq!(json["kind"], "none");
        let back: Claim = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), "none");
    }

    #[test]
    fn string_claims_lowercase() {
        let claim = StringClaim::new(meta(1.0), "Sculpture");
        assert_eq!(claim.string, "sculpture");
    }

    #[test]
    fn text_claim_derives_plain_projection() {
        let mut html = BTreeMap::new();
        html.insert("en".to_string(), "<p>Stone   <b>bridge</b></p>".to_string());
        let claim = TextClaim::from_html(meta(1.0), html);
        assert_eq!(claim.plain["en"], "Stone bridge");
    }

    #[test]
    fn visitor_defaults_keep_and_meta_can_veto() {
        struct DropLowConfidence;
        impl ClaimVisitor for DropLowConfidence {
            fn visit_meta(&mut self, meta: &ClaimMeta) -> VisitDecision {
                if meta.confidence < 0.5 {
                    VisitDecision::Drop
                } else {
                    VisitDecision::Keep
                }
            }
        }
        let strong = Claim::NoValue(NoValueClaim { meta: meta(0.9) });
        let weak = Claim::NoValue(NoValueClaim { meta: meta(0.1) });
        let mut v = DropLowConfidence;
        assert_eq!(strong.accept(&mut v), VisitDecision::Keep);
        assert_eq!(weak.accept(&mut v), VisitDecision::Drop);
    }
}
