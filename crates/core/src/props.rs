//! Core properties and their deterministic identifiers.
//!
//! A property is itself a document whose claims describe the property: a
//! name, a unique upper-snake-case mnemonic, an optional description, and a
//! `TYPE` edge per claim kind it accepts. Property identifiers derive from a
//! fixed namespace via UUID v5, so every build and every ingestion run mints
//! the same ids.

use crate::claim::Claim;
use crate::document::Document;
use crate::identifier::Identifier;
use std::collections::HashSet;
use uuid::Uuid;

/// Namespace for everything minted from a mnemonic.
pub const NAMESPACE: Uuid = Uuid::from_u128(0x8fca_0c0e_6a37_47e2_9a0f_5b1d_23c4_99ad);

// Property mnemonics.
pub const NAME: &str = "NAME";
pub const DESCRIPTION: &str = "DESCRIPTION";
pub const TYPE: &str = "TYPE";
pub const INSTANCE_OF: &str = "INSTANCE_OF";
pub const SUBPROPERTY_OF: &str = "SUBPROPERTY_OF";
pub const PROPERTY: &str = "PROPERTY";
pub const CLASSIFICATION: &str = "CLASSIFICATION";
pub const UNIT: &str = "UNIT";

// Claim-type sentinel documents that property `TYPE` edges point at.
pub const REL_CLAIM_TYPE: &str = "REL_CLAIM_TYPE";
pub const STRING_CLAIM_TYPE: &str = "STRING_CLAIM_TYPE";
pub const TEXT_CLAIM_TYPE: &str = "TEXT_CLAIM_TYPE";
pub const TIME_CLAIM_TYPE: &str = "TIME_CLAIM_TYPE";
pub const AMOUNT_CLAIM_TYPE: &str = "AMOUNT_CLAIM_TYPE";

/// All claim-type sentinels, in the order facets enumerate them.
pub const CLAIM_TYPE_SENTINELS: &[&str] = &[
    REL_CLAIM_TYPE,
    STRING_CLAIM_TYPE,
    TEXT_CLAIM_TYPE,
    TIME_CLAIM_TYPE,
    AMOUNT_CLAIM_TYPE,
];

/// Static description of a property seeded at populate time.
pub struct CoreProperty {
    pub mnemonic: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    /// Claim-type sentinels this property accepts.
    pub claim_types: &'static [&'static str],
}

/// The properties every corpus starts with.
pub const CORE_PROPERTIES: &[CoreProperty] = &[
    CoreProperty {
        mnemonic: NAME,
        name: "name",
        description: "The name of a document.",
        claim_types: &[TEXT_CLAIM_TYPE],
    },
    CoreProperty {
        mnemonic: DESCRIPTION,
        name: "description",
        description: "A short description of a document.",
        claim_types: &[TEXT_CLAIM_TYPE],
    },
    CoreProperty {
        mnemonic: TYPE,
        name: "type",
        description: "Claim types a property accepts.",
        claim_types: &[REL_CLAIM_TYPE],
    },
    CoreProperty {
        mnemonic: INSTANCE_OF,
        name: "instance of",
        description: "The class a document is an instance of.",
        claim_types: &[REL_CLAIM_TYPE],
    },
    CoreProperty {
        mnemonic: SUBPROPERTY_OF,
        name: "subproperty of",
        description: "The property this property specializes.",
        claim_types: &[REL_CLAIM_TYPE],
    },
    CoreProperty {
        mnemonic: CLASSIFICATION,
        name: "classification",
        description: "A categorical label for a document.",
        claim_types: &[STRING_CLAIM_TYPE],
    },
    CoreProperty {
        mnemonic: UNIT,
        name: "unit",
        description: "The unit an amount property is measured in.",
        claim_types: &[STRING_CLAIM_TYPE],
    },
];

/// Deterministic identifier for a mnemonic. Stable across runs and builds.
pub fn id(mnemonic: &str) -> Identifier {
    Identifier::from_uuid_v5(&NAMESPACE, mnemonic)
}

// ---------------------------------------------------------------------------
// Claim extraction helpers
// ---------------------------------------------------------------------------

/// The document's English name, from its first `NAME` text claim.
pub fn name_of(doc: &Document) -> Option<&str> {
    text_of(doc, NAME)
}

/// The document's English description.
pub fn description_of(doc: &Document) -> Option<&str> {
    text_of(doc, DESCRIPTION)
}

/// The unit symbol an amount property declares, if any.
pub fn unit_of(doc: &Document) -> Option<&str> {
    doc.get(&id(UNIT)).into_iter().find_map(|c| match c {
        Claim::String(s) => Some(s.string.as_str()),
        _ => None,
    })
}

fn text_of<'d>(doc: &'d Document, mnemonic: &str) -> Option<&'d str> {
    doc.get(&id(mnemonic)).into_iter().find_map(|c| match c {
        Claim::Text(t) => t.plain.get("en").map(String::as_str),
        _ => None,
    })
}

/// Claim-type sentinels the property's `TYPE` edges point at.
pub fn claim_types_of(doc: &Document) -> Vec<&Identifier> {
    doc.get(&id(TYPE))
        .into_iter()
        .filter_map(|c| match c {
            Claim::Rel(r) => Some(&r.to.id),
            _ => None,
        })
        .collect()
}

/// Transitive superproperties of `start`, walking `SUBPROPERTY_OF` edges
/// through `lookup`. The taxonomy is a DAG by convention; cycles terminate
/// the walk instead of looping.
pub fn superproperties<F>(start: &Identifier, lookup: F) -> Vec<Identifier>
where
    F: Fn(&Identifier) -> Option<Document>,
{
    let mut seen: HashSet<Identifier> = HashSet::new();
    let mut out = Vec::new();
    let mut stack = vec![start.clone()];
    seen.insert(start.clone());
    while let Some(current) = stack.pop() {
        let Some(doc) = lookup(&current) else { continue };
        for claim in doc.get(&id(SUBPROPERTY_OF)) {
            if let Claim::Rel(rel) = claim {
                if seen.insert(rel.to.id.clone()) {
                    out.push(rel.to.id.clone());
                    stack.push(rel.to.id.clone());
                }
            }
        }
    }
    out
}
