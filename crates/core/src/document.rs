//! Documents — identifier-addressed bags of claims.
//!
//! A document holds claims in insertion order, indexed by property on read.
//! The single structural invariant: no two claims in a document share an
//! `id`. The JSON layout groups claims into per-kind buckets (`claims.id`,
//! `claims.rel`, …) — the same nested shape the search index stores, so a
//! document round-trips between the store, the index, and this type.

use crate::claim::{
    AmountClaim, AmountRangeClaim, Claim, ClaimVisitor, DurationClaim, DurationRangeClaim,
    FileClaim, IdentifierClaim, ListClaim, NoValueClaim, ReferenceClaim, RelationClaim,
    StringClaim, TextClaim, TimeClaim, TimeRangeClaim, UnknownValueClaim, VisitDecision,
};
use crate::identifier::Identifier;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Error returned when an added claim's id is already present.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("document {document} already has claim {claim}")]
pub struct DuplicateClaim {
    pub document: Identifier,
    pub claim: Identifier,
}

/// The top-level unit addressed by an identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "DocumentRepr", try_from = "DocumentRepr")]
pub struct Document {
    id: Identifier,
    score: f64,
    claims: Vec<Claim>,
    claim_ids: HashSet<Identifier>,
}

impl Document {
    /// An empty document. Score is a [0,1] confidence used for ranking and
    /// for seeding claim confidences.
    pub fn new(id: Identifier, score: f64) -> Self {
        Document { id, score, claims: Vec::new(), claim_ids: HashSet::new() }
    }

    pub fn id(&self) -> &Identifier {
        &self.id
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    /// Append a claim to its property bucket. Fails iff a claim with the
    /// same id exists anywhere in the document, leaving it unchanged.
    pub fn add(&mut self, claim: Claim) -> Result<(), DuplicateClaim> {
        if self.claim_ids.contains(claim.id()) {
            return Err(DuplicateClaim { document: self.id.clone(), claim: claim.id().clone() });
        }
        self.claim_ids.insert(claim.id().clone());
        self.claims.push(claim);
        Ok(())
    }

    /// Claims asserting `prop`, in insertion order.
    pub fn get(&self, prop: &Identifier) -> Vec<&Claim> {
        self.claims.iter().filter(|c| c.prop_id() == prop).collect()
    }

    /// All claims, in insertion order.
    pub fn claims(&self) -> &[Claim] {
        &self.claims
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    /// Run a visitor over every claim; `Drop` decisions remove the claim
    /// from its bucket. Returns whether the document changed. Visits are
    /// single-threaded per document.
    pub fn visit(&mut self, visitor: &mut dyn ClaimVisitor) -> bool {
        let before = self.claims.len();
        let claim_ids = &mut self.claim_ids;
        self.claims.retain(|claim| match claim.accept(visitor) {
            VisitDecision::Keep => true,
            VisitDecision::Drop => {
                claim_ids.remove(claim.id());
                false
            }
        });
        self.claims.len() != before
    }
}

// ---------------------------------------------------------------------------
// Persisted layout: claims grouped into per-kind buckets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ClaimBuckets {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    id: Vec<IdentifierClaim>,
    #[serde(rename = "ref", default, skip_serializing_if = "Vec::is_empty")]
    reference: Vec<ReferenceClaim>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    text: Vec<TextClaim>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    string: Vec<StringClaim>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    amount: Vec<AmountClaim>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    amount_range: Vec<AmountRangeClaim>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    rel: Vec<RelationClaim>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    time: Vec<TimeClaim>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    time_range: Vec<TimeRangeClaim>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    duration: Vec<DurationClaim>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    duration_range: Vec<DurationRangeClaim>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    file: Vec<FileClaim>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    list: Vec<ListClaim>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    none: Vec<NoValueClaim>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    unknown: Vec<UnknownValueClaim>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocumentRepr {
    id: Identifier,
    score: f64,
    #[serde(default)]
    claims: ClaimBuckets,
}

impl From<Document> for DocumentRepr {
    fn from(doc: Document) -> Self {
        let mut buckets = ClaimBuckets::default();
        for claim in doc.claims {
            match claim {
                Claim::Id(c) => buckets.id.push(c),
                Claim::Ref(c) => buckets.reference.push(c),
                Claim::Text(c) => buckets.text.push(c),
                Claim::String(c) => buckets.string.push(c),
                Claim::Amount(c) => buckets.amount.push(c),
                Claim::AmountRange(c) => buckets.amount_range.push(c),
                Claim::Rel(c) => buckets.rel.push(c),
                Claim::Time(c) => buckets.time.push(c),
                Claim::TimeRange(c) => buckets.time_range.push(c),
                Claim::Duration(c) => buckets.duration.push(c),
                Claim::DurationRange(c) => buckets.duration_range.push(c),
                Claim::File(c) => buckets.file.push(c),
                Claim::List(c) => buckets.list.push(c),
                Claim::NoValue(c) => buckets.none.push(c),
                Claim::UnknownValue(c) => buckets.unknown.push(c),
            }
        }
        DocumentRepr { id: doc.id, score: doc.score, claims: buckets }
    }
}

impl TryFrom<DocumentRepr> for Document {
    type Error = DuplicateClaim;

    fn try_from(repr: DocumentRepr) -> Result<Self, Self::Error> {
        let mut doc = Document::new(repr.id, repr.score);
        let b = repr.claims;
        let claims = (b.id.into_iter().map(Claim::Id))
            .chain(b.reference.into_iter().map(Claim::Ref))
            .chain(b.text.into_iter().map(Claim::Text))
            .chain(b.string.into_iter().map(Claim::String))
            .chain(b.amount.into_iter().map(Claim::Amount))
            .chain(b.amount_range.into_iter().map(Claim::AmountRange))
            .chain(b.rel.into_iter().map(Claim::Rel))
            .chain(b.time.into_iter().map(Claim::Time))
            .chain(b.time_range.into_iter().map(Claim::TimeRange))
            .chain(b.duration.into_iter().map(Claim::Duration))
            .chain(b.duration_range.into_iter().map(Claim::DurationRange))
            .chain(b.file.into_iter().map(Claim::File))
            .chain(b.list.into_iter().map(Claim::List))
            .chain(b.none.into_iter().map(Claim::NoValue))
            .chain(b.unknown.into_iter().map(Claim::UnknownValue));
        for claim in claims {
            doc.add(claim)?;
        }
        Ok(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::ClaimMeta;

    fn string_claim(prop: &Identifier, value: &str) -> Claim {
        Claim::String(StringClaim::new(
            ClaimMeta::new(Identifier::random(), 1.0, prop.clone()),
            value,
        ))
    }

    #[test]
    fn duplicate_add_leaves_document_unchanged() {
        let prop = Identifier::random();
        let mut doc = Document::new(Identifier::random(), 1.0);
        let claim = string_claim(&prop, "bridge");
        doc.add(claim.clone()).unwrap();

        let err = doc.add(claim.clone()).unwrap_err();
        assert_eq!(&err.claim, claim.id());
        assert_eq!(doc.len(), 1);

        // A distinct claim with the same value is a different id and lands.
        doc.add(string_claim(&prop, "bridge")).unwrap();
        assert_eq!(doc.len(), 2);
    }

    #[test]
    fn get_preserves_insertion_order() {
        let prop = Identifier::random();
        let other = Identifier::random();
        let mut doc = Document::new(Identifier::random(), 1.0);
        doc.add(string_claim(&prop, "first")).unwrap();
        doc.add(string_claim(&other, "noise")).unwrap();
        doc.add(string_claim(&prop, "second")).unwrap();

        let values: Vec<&str> = doc
            .get(&prop)
            .iter()
            .map(|c| match c {
                Claim::String(s) => s.string.as_str(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(values, ["first", "second"]);
    }

    #[test]
    fn visit_drop_removes_and_reports_change() {
        struct DropStrings;
        impl ClaimVisitor for DropStrings {
            fn visit_string(&mut self, _: &StringClaim) -> VisitDecision {
                VisitDecision::Drop
            }
        }
        let prop = Identifier::random();
        let mut doc = Document::new(Identifier::random(), 1.0);
        doc.add(string_claim(&prop, "gone")).unwrap();
        let claim_id = doc.claims()[0].id().clone();

        assert!(doc.visit(&mut DropStrings));
        assert!(doc.is_empty());
        // The id is free again after the drop.
        let mut replacement = string_claim(&prop, "back");
        replacement.meta_mut().id = claim_id;
        doc.add(replacement).unwrap();
        assert_eq!(doc.len(), 1);
    }

    #[test]
    fn visit_keep_reports_no_change() {
        struct KeepAll;
        impl ClaimVisitor for KeepAll {}
        let prop = Identifier::random();
        let mut doc = Document::new(Identifier::random(), 1.0);
        doc.add(string_claim(&prop, "stays")).unwrap();
        assert!(!doc.visit(&mut KeepAll));
        assert_eq!(doc.len(), 1);
    }

    #[test]
    fn json_groups_claims_by_kind_and_round_trips() {
        let prop = Identifier::random();
        let mut doc = Document::new(Identifier::random(), 0.75);
        doc.add(string_claim(&prop, "sculpture")).unwrap();
        doc.add(Claim::NoValue(NoValueClaim {
            meta: ClaimMeta::new(Identifier::random(), 1.0, prop.clone()),
        }))
        .unwrap();

        let json = serde_json::to_value(&doc).unwrap();
        assert!(json["claims"]["string"].is_array());
        assert!(json["claims"]["none"].is_array());
        assert!(json["claims"].get("rel").is_none());

        let back: Document = serde_json::from_value(json).unwrap();
        assert_eq!(back.id(), doc.id());
        assert_eq!(back.len(), doc.len());
        assert_eq!(back.get(&prop).len(), 2);
    }

    #[test]
    fn deserializing_duplicate_ids_fails() {
        let prop = Identifier::random();
        let doc_id = Identifier::random();
        let claim_id = Identifier::random();
        let json = serde_json::json!({
            "id": doc_id.as_str(),
            "score": 1.0,
            "claims": {
                "string": [
                    {"id": claim_id.as_str(), "confidence": 1.0, "prop": {"id": prop.as_str()}, "string": "a"},
                    {"id": claim_id.as_str(), "confidence": 1.0, "prop": {"id": prop.as_str()}, "string": "b"}
                ]
            }
        });
        assert!(serde_json::from_value::<Document>(json).is_err());
    }
}
