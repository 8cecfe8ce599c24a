//! Lowering of search states into engine queries.
//!
//! [`to_query`] is a pure function: the text sub-query and the filter
//! sub-query are compiled independently and joined by logical AND. Equal
//! inputs produce structurally equal JSON (the default map keeps keys
//! sorted, so rendered queries are canonical).

use peerdb_core::filter::Filters;
use serde_json::{json, Value};

/// Claim buckets the free-text disjunction searches, with the field each
/// bucket exposes to the analyzer.
const TEXT_SEARCH_FIELDS: &[(&str, &str)] = &[
    ("claims.id", "claims.id.identifier"),
    ("claims.ref", "claims.ref.iri"),
    ("claims.text", "claims.text.html.en"),
    ("claims.string", "claims.string.string"),
];

/// Allowed `simple_query_string` syntax: boolean `+|-`, phrases, prefix
/// matching, grouping, precedence. Fuzzy, slop, and near are disabled.
const TEXT_QUERY_FLAGS: &str = "AND|OR|NOT|PHRASE|PREFIX|PRECEDENCE|WHITESPACE|ESCAPE";

/// Compile a state's text and filters into one engine query.
pub fn to_query(search_query: &str, filters: Option<&Filters>) -> Value {
    let mut must = Vec::new();
    if !search_query.is_empty() {
        must.push(text_query(search_query));
    }
    if let Some(filters) = filters {
        must.push(compile_filters(filters));
    }
    match must.len() {
        0 => json!({ "match_all": {} }),
        1 => must.pop().unwrap(),
        _ => json!({ "bool": { "must": must } }),
    }
}

/// The free-text disjunction: an exact document-id clause plus one scoped
/// `simple_query_string` clause per searchable claim bucket.
fn text_query(text: &str) -> Value {
    let mut should = vec![json!({ "term": { "_id": text } })];
    for (path, field) in TEXT_SEARCH_FIELDS {
        should.push(json!({
            "nested": {
                "path": path,
                "query": {
                    "simple_query_string": {
                        "query": text,
                        "fields": [field],
                        "default_operator": "and",
                        "flags": TEXT_QUERY_FLAGS
                    }
                }
            }
        }));
    }
    json!({ "bool": { "should": should } })
}

/// Recursive lowering of the filter algebra. Assumes a validated tree;
/// nested empty composites lower to matching everything.
pub fn compile_filters(filters: &Filters) -> Value {
    if let Some(children) = &filters.and {
        let musts: Vec<Value> = children.iter().map(compile_filters).collect();
        return json!({ "bool": { "must": musts } });
    }
    if let Some(children) = &filters.or {
        let shoulds: Vec<Value> = children.iter().map(compile_filters).collect();
        return json!({ "bool": { "should": shoulds, "minimum_should_match": 1 } });
    }
    if let Some(child) = &filters.not {
        return json!({ "bool": { "must_not": [compile_filters(child)] } });
    }

    if let Some(rel) = &filters.rel {
        let prop_term = json!({ "term": { "claims.rel.prop.id": rel.prop.as_str() } });
        // A validated leaf carries a value exactly when `none` is unset.
        let Some(value) = (!rel.none).then_some(rel.value.as_ref()).flatten() else {
            return must_not_nested("claims.rel", prop_term);
        };
        return nested(
            "claims.rel",
            json!({ "bool": { "must": [
                prop_term,
                { "term": { "claims.rel.to.id": value.as_str() } }
            ] } }),
        );
    }

    if let Some(amount) = &filters.amount {
        if amount.none {
            let scope = json!({ "bool": { "must": [
                { "term": { "claims.amount.prop.id": amount.prop.as_str() } },
                { "term": { "claims.amount.unit": amount.unit.symbol() } }
            ] } });
            return must_not_nested("claims.amount", scope);
        }
        let mut range = serde_json::Map::new();
        if let Some(gte) = amount.gte {
            range.insert("gte".to_string(), json!(gte));
        }
        if let Some(lte) = amount.lte {
            range.insert("lte".to_string(), json!(lte));
        }
        return nested(
            "claims.amount",
            json!({ "bool": { "must": [
                { "term": { "claims.amount.prop.id": amount.prop.as_str() } },
                { "term": { "claims.amount.unit": amount.unit.symbol() } },
                { "range": { "claims.amount.amount": range } }
            ] } }),
        );
    }

    if let Some(time) = &filters.time {
        let prop_term = json!({ "term": { "claims.time.prop.id": time.prop.as_str() } });
        if time.none {
            return must_not_nested("claims.time", prop_term);
        }
        let mut range = serde_json::Map::new();
        if let Some(gte) = &time.gte {
            range.insert("gte".to_string(), json!(gte.to_string()));
        }
        if let Some(lte) = &time.lte {
            range.insert("lte".to_string(), json!(lte.to_string()));
        }
        return nested(
            "claims.time",
            json!({ "bool": { "must": [
                prop_term,
                { "range": { "claims.time.timestamp": range } }
            ] } }),
        );
    }

    if let Some(string) = &filters.string {
        let prop_term = json!({ "term": { "claims.string.prop.id": string.prop.as_str() } });
        let Some(value) = (!string.none).then_some(string.value.as_ref()).flatten() else {
            return must_not_nested("claims.string", prop_term);
        };
        return nested(
            "claims.string",
            json!({ "bool": { "must": [
                prop_term,
                { "term": { "claims.string.string": value } }
            ] } }),
        );
    }

    if let Some(index) = &filters.index {
        return json!({ "term": { "_index": index.value } });
    }

    if let Some(size) = &filters.size {
        if size.none {
            return json!({ "bool": { "must_not": [ { "exists": { "field": "_size" } } ] } });
        }
        let mut range = serde_json::Map::new();
        if let Some(gte) = size.gte {
            range.insert("gte".to_string(), json!(gte));
        }
        if let Some(lte) = size.lte {
            range.insert("lte".to_string(), json!(lte));
        }
        return json!({ "range": { "_size": range } });
    }

    // An empty node (only reachable nested under a composite).
    json!({ "match_all": {} })
}

fn nested(path: &str, query: Value) -> Value {
    json!({ "nested": { "path": path, "query": query } })
}

fn must_not_nested(path: &str, query: Value) -> Value {
    json!({ "bool": { "must_not": [ { "nested": { "path": path, "query": query } } ] } })
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerdb_core::{props, AmountUnit, Filters, Identifier};

    fn prop(mnemonic: &str) -> Identifier {
        props::id(mnemonic)
    }

    #[test]
    fn empty_text_and_filters_is_match_all() {
        assert_eq!(to_query("", None), json!({ "match_all": {} }));
    }

    #[test]
    fn compilation_is_pure_and_canonical() {
        let filters = Filters::all_of(vec![
            Filters::rel(prop(props::TYPE), prop("ARTWORK")),
            Filters::time(prop("DATE_ACQUIRED"), Some("1999-03-17".parse().unwrap()), None),
        ]);
        let a = to_query("bridges", Some(&filters));
        let b = to_query("bridges", Some(&filters));
        assert_eq!(a, b);
        assert_eq!(serde_json::to_string(&a).unwrap(), serde_json::to_string(&b).unwrap());
    }

    #[test]
    fn text_query_scopes_each_bucket() {
        let q = to_query("stone +bridge", None);
        let should = q["bool"]["should"].as_array().unwrap();
        assert_eq!(should.len(), 1 + TEXT_SEARCH_FIELDS.len());
        assert_eq!(should[0]["term"]["_id"], "stone +bridge");
        for (i, (path, field)) in TEXT_SEARCH_FIELDS.iter().enumerate() {
            let clause = &should[i + 1]["nested"];
            assert_eq!(clause["path"], *path);
            let sqs = &clause["query"]["simple_query_string"];
            assert_eq!(sqs["fields"][0], *field);
            assert_eq!(sqs["default_operator"], "and");
            assert_eq!(sqs["flags"], TEXT_QUERY_FLAGS);
        }
    }

    #[test]
    fn rel_filter_requires_prop_and_target() {
        let q = compile_filters(&Filters::rel(prop(props::TYPE), prop("ARTWORK")));
        let must = q["nested"]["query"]["bool"]["must"].as_array().unwrap();
        assert_eq!(must[0]["term"]["claims.rel.prop.id"], prop(props::TYPE).as_str());
        assert_eq!(must[1]["term"]["claims.rel.to.id"], prop("ARTWORK").as_str());
    }

    #[test]
    fn rel_none_compiles_to_must_not_nested() {
        let q = compile_filters(&Filters::rel_none(prop(props::TYPE)));
        let inner = &q["bool"]["must_not"][0]["nested"];
        assert_eq!(inner["path"], "claims.rel");
        assert_eq!(inner["query"]["term"]["claims.rel.prop.id"], prop(props::TYPE).as_str());
    }

    #[test]
    fn amount_range_includes_only_provided_bounds() {
        let q = compile_filters(&Filters::amount(
            prop("HEIGHT"),
            AmountUnit::Metre,
            Some(2.0),
            None,
        ));
        let must = q["nested"]["query"]["bool"]["must"].as_array().unwrap();
        let range = &must[2]["range"]["claims.amount.amount"];
        assert_eq!(range["gte"], 2.0);
        assert!(range.get("lte").is_none());
        assert_eq!(must[1]["term"]["claims.amount.unit"], "m");
    }

    #[test]
    fn time_bounds_render_canonically() {
        let q = compile_filters(&Filters::time(
            prop("DATE_ACQUIRED"),
            Some("1999-03-17".parse().unwrap()),
            None,
        ));
        let must = q["nested"]["query"]["bool"]["must"].as_array().unwrap();
        assert_eq!(
            must[1]["range"]["claims.time.timestamp"]["gte"],
            "1999-03-17T00:00:00.000Z"
        );
    }

    #[test]
    fn or_uses_minimum_should_match() {
        let q = compile_filters(&Filters::any_of(vec![
            Filters::string(prop(props::CLASSIFICATION), "sculpture"),
            Filters::string(prop(props::CLASSIFICATION), "painting"),
        ]));
        assert_eq!(q["bool"]["minimum_should_match"], 1);
        assert_eq!(q["bool"]["should"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn nested_composites_lower_recursively() {
        let q = compile_filters(&Filters::negate(Filters::any_of(vec![
            Filters::rel_none(prop(props::TYPE)),
            Filters::all_of(vec![Filters::string(prop(props::CLASSIFICATION), "mural")]),
        ])));
        let negated = &q["bool"]["must_not"][0];
        assert_eq!(negated["bool"]["minimum_should_match"], 1);
        let inner_and = &negated["bool"]["should"][1]["bool"]["must"][0];
        assert_eq!(inner_and["nested"]["path"], "claims.string");
    }

    #[test]
    fn text_and_filters_join_under_must() {
        let filters = Filters::index("docs");
        let q = to_query("bridges", Some(&filters));
        let must = q["bool"]["must"].as_array().unwrap();
        assert_eq!(must.len(), 2);
        assert!(must[0]["bool"]["should"].is_array());
        assert_eq!(must[1]["term"]["_index"], "docs");
    }

    #[test]
    fn index_and_size_use_pseudo_fields() {
        assert_eq!(
            compile_filters(&Filters::index("docs")),
            json!({ "term": { "_index": "docs" } })
        );
        let q = compile_filters(&Filters::size(Some(100), None));
        assert_eq!(q["range"]["_size"]["gte"], 100);

        let none = Filters { size: Some(peerdb_core::filter::SizeFilter { gte: None, lte: None, none: true }), ..Default::default() };
        let q = compile_filters(&none);
        assert_eq!(q["bool"]["must_not"][0]["exists"]["field"], "_size");
    }
}
