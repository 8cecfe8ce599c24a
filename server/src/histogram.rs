//! Histogram facets over amounts, sizes, and timestamps.
//!
//! Every histogram is a two-phase computation: a min/max/count summary
//! derives the bin layout, then a histogram aggregation fills the bins.
//! Amount and size bins are floats with the layout rules in [`bin_layout`];
//! time bins are whole seconds. Bins are half-open `[start, start + width)`
//! and monotonic.

use crate::errors::{Error, Result};
use crate::facets::{observe, FacetTimings};
use crate::service::SearchService;
use peerdb_core::{AmountUnit, Identifier, Timestamp};
use serde::Serialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

/// Number of bins a histogram aims for.
pub const HISTOGRAM_BINS: usize = 100;

/// A single half-open bin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramBin<V> {
    pub start: V,
    pub count: i64,
}

/// Histogram over a float axis (amounts, sizes).
#[derive(Debug, Clone, Serialize)]
pub struct NumericHistogram {
    pub bins: Vec<HistogramBin<f64>>,
    pub interval: f64,
    pub total: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl NumericHistogram {
    fn empty() -> Self {
        NumericHistogram { bins: Vec::new(), interval: 0.0, total: 0, min: None, max: None }
    }
}

/// Histogram over a time axis, with whole-second bins.
#[derive(Debug, Clone, Serialize)]
pub struct TimeHistogram {
    pub bins: Vec<HistogramBin<Timestamp>>,
    pub interval_seconds: i64,
    pub total: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<Timestamp>,
}

impl TimeHistogram {
    fn empty() -> Self {
        TimeHistogram { bins: Vec::new(), interval_seconds: 0, total: 0, min: None, max: None }
    }
}

/// Derive `(offset, width)` for a float histogram.
///
/// No observations or missing bounds yield no layout. Equal bounds get a
/// single bin one representable step wide. A short integer range keeps
/// unit-wide bins so discrete values stay distinguishable. Otherwise the
/// width is `(next_up(max) − min) / bins`, bumped one float up when rounding
/// collapses it onto the naive quotient — the last bin must contain `max`.
pub fn bin_layout(count: i64, min: Option<f64>, max: Option<f64>, bins: usize) -> Option<(f64, f64)> {
    if count == 0 || bins == 0 {
        return None;
    }
    let (min, max) = (min?, max?);
    if !min.is_finite() || !max.is_finite() || max < min {
        return None;
    }
    if min == max {
        return Some((min, min.next_up() - min));
    }
    if max - min < bins as f64 && min.fract() == 0.0 && max.fract() == 0.0 {
        return Some((min, 1.0));
    }
    let naive = (max - min) / bins as f64;
    let mut width = (max.next_up() - min) / bins as f64;
    if width == naive {
        width = width.next_up();
    }
    Some((min, width))
}

/// Whole-second width for a time histogram; zero widths are bumped to one.
fn time_width_seconds(min: i64, max: i64, bins: usize) -> i64 {
    let width = (max - min) / bins as i64;
    width.max(1)
}

// ---------------------------------------------------------------------------
// Summary phase parsing
// ---------------------------------------------------------------------------

struct Summary {
    count: i64,
    min: Option<f64>,
    max: Option<f64>,
}

fn parse_summary(scoped: &Value) -> Summary {
    Summary {
        count: scoped["count"]["value"].as_i64().unwrap_or(0),
        min: scoped["min"]["value"].as_f64(),
        max: scoped["max"]["value"].as_f64(),
    }
}

fn summary_aggs(field: &str) -> Value {
    json!({
        "min": { "min": { "field": field } },
        "max": { "max": { "field": field } },
        "count": { "value_count": { "field": field } }
    })
}

fn bucket_count(bucket: &Value) -> i64 {
    bucket["docs"]["doc_count"]
        .as_i64()
        .unwrap_or_else(|| bucket["doc_count"].as_i64().unwrap_or(0))
}

impl SearchService {
    /// Histogram of an amount property's values in one unit.
    pub async fn amount_histogram(
        &self,
        state_id: &Identifier,
        prop: &Identifier,
        unit: AmountUnit,
    ) -> Result<NumericHistogram> {
        let looking = Instant::now();
        let state = self.registry().get(state_id)?;
        let query = self.state_query(&state)?;
        let lookup = looking.elapsed();

        let scope = json!({ "bool": { "must": [
            { "term": { "claims.amount.prop.id": prop.as_str() } },
            { "term": { "claims.amount.unit": unit.symbol() } }
        ] } });
        let field = "claims.amount.amount";

        let summary_body = json!({
            "size": 0,
            "query": &query,
            "aggs": { "facet": {
                "nested": { "path": "claims.amount" },
                "aggs": { "scoped": { "filter": &scope, "aggs": summary_aggs(field) } }
            } }
        });
        let started = Instant::now();
        let summary_resp = self.engine().search(self.index(), &summary_body).await?;
        let summary = parse_summary(&aggs_of(&summary_resp)?["facet"]["scoped"]);

        let Some((offset, width)) = bin_layout(summary.count, summary.min, summary.max, HISTOGRAM_BINS)
        else {
            return Ok(NumericHistogram::empty());
        };

        let hist_body = json!({
            "size": 0,
            "query": &query,
            "aggs": { "facet": {
                "nested": { "path": "claims.amount" },
                "aggs": { "scoped": { "filter": &scope, "aggs": { "hist": {
                    "histogram": {
                        "field": field,
                        "interval": width,
                        "offset": offset.rem_euclid(width),
                        "min_doc_count": 0
                    },
                    "aggs": { "docs": { "reverse_nested": {} } }
                } } } }
            } }
        });
        let resp = self.engine().search(self.index(), &hist_body).await?;
        let round_trip = started.elapsed();

        let decoding = Instant::now();
        let buckets = aggs_of(&resp)?["facet"]["scoped"]["hist"]["buckets"].clone();
        let bins = parse_float_bins(&buckets);
        let timings = FacetTimings {
            lookup,
            round_trip,
            engine_took: Duration::from_millis(summary_resp.took + resp.took),
            decode: decoding.elapsed(),
        };
        observe("amount_histogram", Some(state_id), &timings);
        Ok(NumericHistogram {
            bins,
            interval: width,
            total: summary.count,
            min: summary.min,
            max: summary.max,
        })
    }

    /// Histogram of document sizes over the `_size` pseudo-field.
    pub async fn size_histogram(&self, state_id: &Identifier) -> Result<NumericHistogram> {
        let looking = Instant::now();
        let state = self.registry().get(state_id)?;
        let query = self.state_query(&state)?;
        let lookup = looking.elapsed();

        let summary_body = json!({
            "size": 0,
            "query": &query,
            "aggs": summary_aggs("_size")
        });
        let started = Instant::now();
        let summary_resp = self.engine().search(self.index(), &summary_body).await?;
        let summary = parse_summary(aggs_of(&summary_resp)?);

        let Some((offset, width)) = bin_layout(summary.count, summary.min, summary.max, HISTOGRAM_BINS)
        else {
            return Ok(NumericHistogram::empty());
        };

        let hist_body = json!({
            "size": 0,
            "query": &query,
            "aggs": { "hist": {
                "histogram": {
                    "field": "_size",
                    "interval": width,
                    "offset": offset.rem_euclid(width),
                    "min_doc_count": 0
                }
            } }
        });
        let resp = self.engine().search(self.index(), &hist_body).await?;
        let round_trip = started.elapsed();

        let decoding = Instant::now();
        let bins = parse_float_bins(&aggs_of(&resp)?["hist"]["buckets"].clone());
        let timings = FacetTimings {
            lookup,
            round_trip,
            engine_took: Duration::from_millis(summary_resp.took + resp.took),
            decode: decoding.elapsed(),
        };
        observe("size_histogram", Some(state_id), &timings);
        Ok(NumericHistogram {
            bins,
            interval: width,
            total: summary.count,
            min: summary.min,
            max: summary.max,
        })
    }

    /// Histogram of a time property's values, binned in whole seconds.
    pub async fn time_histogram(
        &self,
        state_id: &Identifier,
        prop: &Identifier,
    ) -> Result<TimeHistogram> {
        let looking = Instant::now();
        let state = self.registry().get(state_id)?;
        let query = self.state_query(&state)?;
        let lookup = looking.elapsed();

        let scope = json!({ "term": { "claims.time.prop.id": prop.as_str() } });
        let field = "claims.time.timestamp";

        let summary_body = json!({
            "size": 0,
            "query": &query,
            "aggs": { "facet": {
                "nested": { "path": "claims.time" },
                "aggs": { "scoped": { "filter": &scope, "aggs": summary_aggs(field) } }
            } }
        });
        let started = Instant::now();
        let summary_resp = self.engine().search(self.index(), &summary_body).await?;
        let summary = parse_summary(&aggs_of(&summary_resp)?["facet"]["scoped"]);

        if summary.count == 0 {
            return Ok(TimeHistogram::empty());
        }
        let (Some(min_ms), Some(max_ms)) = (summary.min, summary.max) else {
            return Ok(TimeHistogram::empty());
        };
        let min_s = (min_ms / 1000.0).floor() as i64;
        let max_s = (max_ms / 1000.0).floor() as i64;
        let width = time_width_seconds(min_s, max_s, HISTOGRAM_BINS);

        let hist_body = json!({
            "size": 0,
            "query": &query,
            "aggs": { "facet": {
                "nested": { "path": "claims.time" },
                "aggs": { "scoped": { "filter": &scope, "aggs": { "hist": {
                    "date_histogram": {
                        "field": field,
                        "fixed_interval": format!("{width}s"),
                        "offset": format!("{}s", min_s.rem_euclid(width)),
                        "min_doc_count": 0
                    },
                    "aggs": { "docs": { "reverse_nested": {} } }
                } } } }
            } }
        });
        let resp = self.engine().search(self.index(), &hist_body).await?;
        let round_trip = started.elapsed();

        let decoding = Instant::now();
        let mut bins = Vec::new();
        if let Some(raw) = aggs_of(&resp)?["facet"]["scoped"]["hist"]["buckets"].as_array() {
            for bucket in raw {
                let Some(millis) = bucket["key"].as_i64() else { continue };
                let Some(start) = Timestamp::from_unix_seconds(millis.div_euclid(1000)) else {
                    continue;
                };
                bins.push(HistogramBin { start, count: bucket_count(bucket) });
            }
        }
        let timings = FacetTimings {
            lookup,
            round_trip,
            engine_took: Duration::from_millis(summary_resp.took + resp.took),
            decode: decoding.elapsed(),
        };
        observe("time_histogram", Some(state_id), &timings);
        Ok(TimeHistogram {
            bins,
            interval_seconds: width,
            total: summary.count,
            min: Timestamp::from_unix_seconds(min_s),
            max: Timestamp::from_unix_seconds(max_s),
        })
    }
}

fn aggs_of(resp: &crate::engine::SearchResponse) -> Result<&Value> {
    resp.aggregations
        .as_ref()
        .ok_or_else(|| Error::fatal("engine returned no aggregations"))
}

fn parse_float_bins(buckets: &Value) -> Vec<HistogramBin<f64>> {
    let mut bins = Vec::new();
    if let Some(raw) = buckets.as_array() {
        for bucket in raw {
            let Some(start) = bucket["key"].as_f64() else { continue };
            bins.push(HistogramBin { start, count: bucket_count(bucket) });
        }
    }
    bins
}
