//! Per-facet aggregation pipelines.
//!
//! Each facet runs a nested aggregation against the engine scoped to the
//! state's compiled query: a `prop.id` filter wraps a terms aggregation
//! ordered by reverse-nested document count, with a sibling cardinality
//! aggregation reporting the number of distinct values. Cardinality is
//! approximate, so the reported total is never allowed below the observed
//! bucket count. The filters overview collects every claim-kind facet plus
//! the index and size cardinalities in a single round-trip.
//!
//! Every path records four durations — registry lookup, outer round-trip,
//! engine-reported internal time, and response decoding — as tracing
//! observations with no effect on the response.

use crate::errors::{Error, Result};
use crate::query::to_query;
use crate::service::SearchService;
use peerdb_core::{props, AmountUnit, Filters, Identifier, Timestamp, AMOUNT_UNITS_TOTAL};
use serde::Serialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::debug;

/// Upper bound on buckets returned by any facet.
pub const MAX_RESULTS_COUNT: usize = 1000;

/// Precision threshold under which the engine counts distinct values exactly.
pub const CARDINALITY_PRECISION_THRESHOLD: u64 = 40_000;

/// Bounded sample size used by property discovery.
const SAMPLE_SIZE: usize = 10;

// ---------------------------------------------------------------------------
// Result shapes
// ---------------------------------------------------------------------------

/// A single value/count pair within a facet result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueBucket<V> {
    pub value: V,
    pub count: i64,
}

/// A terms facet: top buckets plus the total number of distinct values.
#[derive(Debug, Clone, Serialize)]
pub struct TermsFacet<V> {
    pub buckets: Vec<ValueBucket<V>>,
    pub total: i64,
}

/// Facet kinds the overview reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FacetKind {
    Rel,
    Amount,
    Time,
    String,
    Index,
    Size,
}

/// One entry of the filters overview.
#[derive(Debug, Clone, Serialize)]
pub struct OverviewEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Identifier>,
    pub count: i64,
    #[serde(rename = "type")]
    pub kind: FacetKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<AmountUnit>,
}

/// A property surfaced by discovery, with enough context for tool use.
#[derive(Debug, Clone, Serialize)]
pub struct PropertyHit {
    pub id: Identifier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Claim kinds the property accepts: "rel", "string", "text", "time", "amount".
    pub kinds: Vec<String>,
    pub score: f64,
    /// Sample of documents this property's relations point at.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<RelatedDocument>,
    /// Sample of string values this property takes.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelatedDocument {
    pub id: Identifier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub count: i64,
}

// ---------------------------------------------------------------------------
// Timing observations
// ---------------------------------------------------------------------------

/// Durations every aggregation path reports. Purely observational.
pub(crate) struct FacetTimings {
    pub lookup: Duration,
    pub round_trip: Duration,
    pub engine_took: Duration,
    pub decode: Duration,
}

pub(crate) fn observe(operation: &'static str, state: Option<&Identifier>, t: &FacetTimings) {
    let state = state.map(|s| s.as_str()).unwrap_or("-");
    debug!(
        target: "peerdb::timings",
        operation,
        state,
        lookup_us = t.lookup.as_micros() as u64,
        round_trip_ms = t.round_trip.as_millis() as u64,
        engine_ms = t.engine_took.as_millis() as u64,
        decode_us = t.decode.as_micros() as u64,
        "aggregation"
    );
}

// ---------------------------------------------------------------------------
// Shared nested-terms plumbing
// ---------------------------------------------------------------------------

struct TermsSpec {
    /// Nested path, e.g. `claims.rel`.
    path: &'static str,
    /// The `prop.id` field inside the path.
    prop_field: &'static str,
    /// The value field the terms aggregation runs over.
    value_field: &'static str,
}

const REL_TERMS: TermsSpec = TermsSpec {
    path: "claims.rel",
    prop_field: "claims.rel.prop.id",
    value_field: "claims.rel.to.id",
};
const STRING_TERMS: TermsSpec = TermsSpec {
    path: "claims.string",
    prop_field: "claims.string.prop.id",
    value_field: "claims.string.string",
};
const TIME_TERMS: TermsSpec = TermsSpec {
    path: "claims.time",
    prop_field: "claims.time.prop.id",
    value_field: "claims.time.timestamp",
};

fn terms_body(query: &Value, spec: &TermsSpec, prop: &Identifier, threshold: u64) -> Value {
    json!({
        "size": 0,
        "query": query,
        "aggs": {
            "facet": {
                "nested": { "path": spec.path },
                "aggs": {
                    "scoped": {
                        "filter": { "term": { spec.prop_field: prop.as_str() } },
                        "aggs": {
                            "values": {
                                "terms": {
                                    "field": spec.value_field,
                                    "size": MAX_RESULTS_COUNT,
                                    "order": { "docs._count": "desc" }
                                },
                                "aggs": { "docs": { "reverse_nested": {} } }
                            },
                            "distinct": {
                                "cardinality": {
                                    "field": spec.value_field,
                                    "precision_threshold": threshold
                                }
                            }
                        }
                    }
                }
            }
        }
    })
}

fn bucket_doc_count(bucket: &Value) -> i64 {
    bucket["docs"]["doc_count"].as_i64().unwrap_or_else(|| bucket["doc_count"].as_i64().unwrap_or(0))
}

impl SearchService {
    async fn terms_for_query<V>(
        &self,
        query: &Value,
        spec: &TermsSpec,
        prop: &Identifier,
        threshold: u64,
        parse_key: impl Fn(&Value) -> Option<V>,
    ) -> Result<(TermsFacet<V>, FacetTimings)> {
        let body = terms_body(query, spec, prop, threshold);
        let started = Instant::now();
        let resp = self.engine().search(self.index(), &body).await?;
        let round_trip = started.elapsed();

        let decoding = Instant::now();
        let aggs = resp.aggregations.as_ref().ok_or_else(|| {
            Error::fatal("engine returned no aggregations").context("path", spec.path)
        })?;
        let scoped = &aggs["facet"]["scoped"];
        let mut buckets = Vec::new();
        if let Some(raw) = scoped["values"]["buckets"].as_array() {
            for bucket in raw {
                if let Some(value) = parse_key(bucket) {
                    buckets.push(ValueBucket { value, count: bucket_doc_count(bucket) });
                }
            }
        }
        let cardinality = scoped["distinct"]["value"].as_i64().unwrap_or(0);
        // Cardinality is approximate; never report fewer than we observed.
        let total = cardinality.max(buckets.len() as i64);
        let timings = FacetTimings {
            lookup: Duration::ZERO,
            round_trip,
            engine_took: Duration::from_millis(resp.took),
            decode: decoding.elapsed(),
        };
        Ok((TermsFacet { buckets, total }, timings))
    }

    async fn state_terms<V>(
        &self,
        operation: &'static str,
        state_id: &Identifier,
        spec: &TermsSpec,
        prop: &Identifier,
        parse_key: impl Fn(&Value) -> Option<V>,
    ) -> Result<TermsFacet<V>> {
        let looking = Instant::now();
        let state = self.registry().get(state_id)?;
        let query = self.state_query(&state)?;
        let lookup = looking.elapsed();

        let (facet, mut timings) = self
            .terms_for_query(&query, spec, prop, CARDINALITY_PRECISION_THRESHOLD, parse_key)
            .await
            .map_err(|e| e.context("prop", prop.clone()))?;
        timings.lookup = lookup;
        observe(operation, Some(state_id), &timings);
        Ok(facet)
    }

    /// Top related documents for a rel property under this state.
    pub async fn rel_values(
        &self,
        state_id: &Identifier,
        prop: &Identifier,
    ) -> Result<TermsFacet<Identifier>> {
        self.state_terms("rel_values", state_id, &REL_TERMS, prop, parse_identifier_key).await
    }

    /// Top string values for a string property under this state.
    pub async fn string_values(
        &self,
        state_id: &Identifier,
        prop: &Identifier,
    ) -> Result<TermsFacet<String>> {
        self.state_terms("string_values", state_id, &STRING_TERMS, prop, parse_string_key).await
    }

    /// Top discrete timestamps for a time property under this state.
    pub async fn time_values(
        &self,
        state_id: &Identifier,
        prop: &Identifier,
    ) -> Result<TermsFacet<Timestamp>> {
        self.state_terms("time_values", state_id, &TIME_TERMS, prop, parse_time_key).await
    }

    /// Units in use for an amount property under this state. Multi-terms
    /// over `(prop.id, unit)`; the discovery sentinel `"@"` is dropped.
    pub async fn amount_values(
        &self,
        state_id: &Identifier,
        prop: &Identifier,
    ) -> Result<TermsFacet<AmountUnit>> {
        let looking = Instant::now();
        let state = self.registry().get(state_id)?;
        let query = self.state_query(&state)?;
        let lookup = looking.elapsed();

        let threshold = 2 * self.properties_total().await? as u64 * AMOUNT_UNITS_TOTAL as u64;
        let body = json!({
            "size": 0,
            "query": query,
            "aggs": {
                "facet": {
                    "nested": { "path": "claims.amount" },
                    "aggs": {
                        "scoped": {
                            "filter": { "term": { "claims.amount.prop.id": prop.as_str() } },
                            "aggs": {
                                "values": {
                                    "multi_terms": {
                                        "terms": [
                                            { "field": "claims.amount.prop.id" },
                                            { "field": "claims.amount.unit" }
                                        ],
                                        "size": MAX_RESULTS_COUNT,
                                        "order": { "docs._count": "desc" }
                                    },
                                    "aggs": { "docs": { "reverse_nested": {} } }
                                },
                                "distinct": {
                                    "cardinality": {
                                        "field": "claims.amount.unit",
                                        "precision_threshold": threshold
                                    }
                                }
                            }
                        }
                    }
                }
            }
        });

        let started = Instant::now();
        let resp = self.engine().search(self.index(), &body).await?;
        let round_trip = started.elapsed();

        let decoding = Instant::now();
        let aggs = resp
            .aggregations
            .as_ref()
            .ok_or_else(|| Error::fatal("engine returned no aggregations"))?;
        let scoped = &aggs["facet"]["scoped"];
        let mut buckets = Vec::new();
        if let Some(raw) = scoped["values"]["buckets"].as_array() {
            for bucket in raw {
                let Some(unit) = parse_unit_key(bucket) else { continue };
                if unit == AmountUnit::Custom {
                    continue;
                }
                buckets.push(ValueBucket { value: unit, count: bucket_doc_count(bucket) });
            }
        }
        let cardinality = scoped["distinct"]["value"].as_i64().unwrap_or(0);
        let total = cardinality.max(buckets.len() as i64);

        let timings = FacetTimings {
            lookup,
            round_trip,
            engine_took: Duration::from_millis(resp.took),
            decode: decoding.elapsed(),
        };
        observe("amount_values", Some(state_id), &timings);
        Ok(TermsFacet { buckets, total })
    }

    /// Indices the state's documents live in, for the Index filter.
    pub async fn index_values(&self, state_id: &Identifier) -> Result<TermsFacet<String>> {
        let looking = Instant::now();
        let state = self.registry().get(state_id)?;
        let query = self.state_query(&state)?;
        let lookup = looking.elapsed();

        let body = json!({
            "size": 0,
            "query": query,
            "aggs": {
                "values": {
                    "terms": { "field": "_index", "size": MAX_RESULTS_COUNT, "order": { "_count": "desc" } }
                },
                "distinct": {
                    "cardinality": { "field": "_index", "precision_threshold": CARDINALITY_PRECISION_THRESHOLD }
                }
            }
        });
        let started = Instant::now();
        let resp = self.engine().search(self.index(), &body).await?;
        let round_trip = started.elapsed();

        let decoding = Instant::now();
        let aggs = resp
            .aggregations
            .as_ref()
            .ok_or_else(|| Error::fatal("engine returned no aggregations"))?;
        let mut buckets = Vec::new();
        if let Some(raw) = aggs["values"]["buckets"].as_array() {
            for bucket in raw {
                if let Some(value) = parse_string_key(bucket) {
                    buckets.push(ValueBucket { value, count: bucket_doc_count(bucket) });
                }
            }
        }
        let cardinality = aggs["distinct"]["value"].as_i64().unwrap_or(0);
        let total = cardinality.max(buckets.len() as i64);

        let timings = FacetTimings {
            lookup,
            round_trip,
            engine_took: Duration::from_millis(resp.took),
            decode: decoding.elapsed(),
        };
        observe("index_values", Some(state_id), &timings);
        Ok(TermsFacet { buckets, total })
    }

    /// Every claim-kind facet plus index and size cardinalities, merged and
    /// sorted by count descending, in one round-trip.
    pub async fn filters_overview(&self, state_id: &Identifier) -> Result<Vec<OverviewEntry>> {
        let looking = Instant::now();
        let state = self.registry().get(state_id)?;
        let query = self.state_query(&state)?;
        let lookup = looking.elapsed();

        let props_terms = |path: &str, field: String| {
            json!({
                "nested": { "path": path },
                "aggs": {
                    "props": {
                        "terms": {
                            "field": field,
                            "size": MAX_RESULTS_COUNT,
                            "order": { "docs._count": "desc" }
                        },
                        "aggs": { "docs": { "reverse_nested": {} } }
                    }
                }
            })
        };
        let body = json!({
            "size": 0,
            "query": query,
            "aggs": {
                "rel": props_terms("claims.rel", "claims.rel.prop.id".into()),
                "string": props_terms("claims.string", "claims.string.prop.id".into()),
                "time": props_terms("claims.time", "claims.time.prop.id".into()),
                "amount": {
                    "nested": { "path": "claims.amount" },
                    "aggs": {
                        "props": {
                            "multi_terms": {
                                "terms": [
                                    { "field": "claims.amount.prop.id" },
                                    { "field": "claims.amount.unit" }
                                ],
                                "size": MAX_RESULTS_COUNT,
                                "order": { "docs._count": "desc" }
                            },
                            "aggs": { "docs": { "reverse_nested": {} } }
                        }
                    }
                },
                "index": { "cardinality": { "field": "_index" } },
                "size": { "value_count": { "field": "_size" } }
            }
        });

        let started = Instant::now();
        let resp = self.engine().search(self.index(), &body).await?;
        let round_trip = started.elapsed();

        let decoding = Instant::now();
        let aggs = resp
            .aggregations
            .as_ref()
            .ok_or_else(|| Error::fatal("engine returned no aggregations"))?;

        let mut entries = Vec::new();
        for (agg, kind) in [("rel", FacetKind::Rel), ("string", FacetKind::String), ("time", FacetKind::Time)] {
            if let Some(buckets) = aggs[agg]["props"]["buckets"].as_array() {
                for bucket in buckets {
                    let Some(id) = parse_identifier_key(bucket) else { continue };
                    entries.push(OverviewEntry {
                        id: Some(id),
                        count: bucket_doc_count(bucket),
                        kind,
                        unit: None,
                    });
                }
            }
        }
        if let Some(buckets) = aggs["amount"]["props"]["buckets"].as_array() {
            for bucket in buckets {
                let Some(id) = parse_multi_identifier_key(bucket) else { continue };
                let Some(unit) = parse_unit_key(bucket) else { continue };
                if unit == AmountUnit::Custom {
                    continue;
                }
                entries.push(OverviewEntry {
                    id: Some(id),
                    count: bucket_doc_count(bucket),
                    kind: FacetKind::Amount,
                    unit: Some(unit),
                });
            }
        }
        // The index facet only matters when more than one index is present;
        // the size facet whenever anything was counted.
        let index_count = aggs["index"]["value"].as_i64().unwrap_or(0);
        if index_count > 1 {
            entries.push(OverviewEntry { id: None, count: index_count, kind: FacetKind::Index, unit: None });
        }
        let size_count = aggs["size"]["value"].as_i64().unwrap_or(0);
        if size_count > 0 {
            entries.push(OverviewEntry { id: None, count: size_count, kind: FacetKind::Size, unit: None });
        }

        entries.sort_by(|a, b| b.count.cmp(&a.count));
        entries.truncate(MAX_RESULTS_COUNT);

        let timings = FacetTimings {
            lookup,
            round_trip,
            engine_took: Duration::from_millis(resp.took),
            decode: decoding.elapsed(),
        };
        observe("filters_overview", Some(state_id), &timings);
        Ok(entries)
    }

    /// Property discovery for the prompt parser: a text search restricted to
    /// property documents, each hit enriched with a bounded sample of its
    /// related documents or string values.
    pub async fn find_properties(&self, text: &str) -> Result<Vec<PropertyHit>> {
        let sentinel_filter = Filters::any_of(
            props::CLAIM_TYPE_SENTINELS
                .iter()
                .map(|s| Filters::rel(props::id(props::TYPE), props::id(s)))
                .collect(),
        );
        let query = to_query(text, Some(&sentinel_filter));
        let body = json!({ "query": query, "size": SAMPLE_SIZE, "_source": true });

        let started = Instant::now();
        let resp = self.engine().search(self.index(), &body).await?;
        let round_trip = started.elapsed();
        let decoding = Instant::now();

        let mut hits = Vec::new();
        for hit in &resp.hits.hits {
            let Some(source) = &hit.source else { continue };
            let Ok(doc) = serde_json::from_value::<peerdb_core::Document>(source.clone()) else {
                continue;
            };
            let kinds: Vec<String> = props::claim_types_of(&doc)
                .into_iter()
                .filter_map(sentinel_kind)
                .map(str::to_string)
                .collect();
            hits.push(PropertyHit {
                id: doc.id().clone(),
                name: props::name_of(&doc).map(str::to_string),
                description: props::description_of(&doc).map(str::to_string),
                unit: props::unit_of(&doc).map(str::to_string),
                kinds,
                score: hit.score.unwrap_or(0.0),
                related: Vec::new(),
                values: Vec::new(),
            });
        }
        let timings = FacetTimings {
            lookup: Duration::ZERO,
            round_trip,
            engine_took: Duration::from_millis(resp.took),
            decode: decoding.elapsed(),
        };
        observe("find_properties", None, &timings);

        // Enrich with corpus-wide samples so the model can pick values.
        let everything = json!({ "match_all": {} });
        for hit in &mut hits {
            if hit.kinds.iter().any(|k| k == "rel") {
                let (facet, _) = self
                    .terms_for_query(
                        &everything,
                        &REL_TERMS,
                        &hit.id,
                        CARDINALITY_PRECISION_THRESHOLD,
                        parse_identifier_key,
                    )
                    .await?;
                let sample: Vec<ValueBucket<Identifier>> =
                    facet.buckets.into_iter().take(SAMPLE_SIZE).collect();
                hit.related = self.name_related(sample).await?;
            }
            if hit.kinds.iter().any(|k| k == "string") {
                let (facet, _) = self
                    .terms_for_query(
                        &everything,
                        &STRING_TERMS,
                        &hit.id,
                        CARDINALITY_PRECISION_THRESHOLD,
                        parse_string_key,
                    )
                    .await?;
                hit.values =
                    facet.buckets.into_iter().take(SAMPLE_SIZE).map(|b| b.value).collect();
            }
        }
        Ok(hits)
    }

    /// Resolve names for a sample of related documents. Cache hits skip the
    /// engine; the rest are fetched with one ids query and cached.
    async fn name_related(
        &self,
        sample: Vec<ValueBucket<Identifier>>,
    ) -> Result<Vec<RelatedDocument>> {
        if sample.is_empty() {
            return Ok(Vec::new());
        }
        let mut names = std::collections::HashMap::new();
        let mut missing = Vec::new();
        for bucket in &sample {
            match self.names().get(&bucket.value) {
                Some(name) => {
                    names.insert(bucket.value.clone(), name);
                }
                None => missing.push(bucket.value.as_str()),
            }
        }
        if !missing.is_empty() {
            let body = json!({
                "query": { "ids": { "values": missing } },
                "size": sample.len(),
                "_source": true
            });
            let resp = self.engine().search(self.index(), &body).await?;
            for hit in &resp.hits.hits {
                let Some(source) = &hit.source else { continue };
                if let Ok(doc) = serde_json::from_value::<peerdb_core::Document>(source.clone()) {
                    if let Some(name) = props::name_of(&doc) {
                        self.names().put(doc.id().clone(), name.to_string());
                        names.insert(doc.id().clone(), name.to_string());
                    }
                }
            }
        }
        Ok(sample
            .into_iter()
            .map(|b| RelatedDocument { name: names.get(&b.value).cloned(), id: b.value, count: b.count })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Bucket key parsing
// ---------------------------------------------------------------------------

fn parse_identifier_key(bucket: &Value) -> Option<Identifier> {
    bucket["key"].as_str()?.parse().ok()
}

fn parse_string_key(bucket: &Value) -> Option<String> {
    bucket["key"].as_str().map(str::to_string)
}

fn parse_time_key(bucket: &Value) -> Option<Timestamp> {
    if let Some(raw) = bucket["key_as_string"].as_str() {
        if let Ok(ts) = raw.parse() {
            return Some(ts);
        }
    }
    let millis = bucket["key"].as_i64()?;
    Timestamp::from_unix_seconds(millis.div_euclid(1000))
}

/// Multi-terms buckets key as `[prop, unit]`; plain terms as a string.
fn parse_multi_identifier_key(bucket: &Value) -> Option<Identifier> {
    bucket["key"].as_array()?.first()?.as_str()?.parse().ok()
}

fn parse_unit_key(bucket: &Value) -> Option<AmountUnit> {
    let raw = match bucket["key"].as_array() {
        Some(parts) => parts.get(1)?.as_str()?,
        None => bucket["key"].as_str()?,
    };
    raw.parse().ok()
}

fn sentinel_kind(id: &Identifier) -> Option<&'static str> {
    for (sentinel, kind) in [
        (props::REL_CLAIM_TYPE, "rel"),
        (props::STRING_CLAIM_TYPE, "string"),
        (props::TEXT_CLAIM_TYPE, "text"),
        (props::TIME_CLAIM_TYPE, "time"),
        (props::AMOUNT_CLAIM_TYPE, "amount"),
    ] {
        if *id == props::id(sentinel) {
            return Some(kind);
        }
    }
    None
}
