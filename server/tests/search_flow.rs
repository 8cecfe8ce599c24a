//! End-to-end search flows over the mock engine and scripted model.
//!
//! Each test builds a `SearchService`, queues engine responses, and drives
//! the same paths the HTTP layer uses: state lifecycle, compiled queries,
//! facet aggregations, and prompt parsing with its fallback.

mod helpers;

use helpers::{
    raw_tool_call_message, terms_response, tool_call_message, MockEngine, ScriptedModel,
    TestHarness,
};
use peerdb_core::{props, AmountUnit, Filters};
use peerdb_server::errors::Error;
use peerdb_server::ingest;
use peerdb_server::query::to_query;
use peerdb_server::store::MemoryStore;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// State lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn text_state_is_ready_and_reusable() {
    let h = TestHarness::new();
    let (s0, reused) = h.service.get_or_create_state(None, Some("bridges"), None, false);
    assert!(!reused);
    assert!(s0.ready());
    assert_eq!(s0.search_query, "bridges");

    let (again, reused) =
        h.service.get_or_create_state(Some(&s0.id), Some("bridges"), None, false);
    assert!(reused);
    assert_eq!(again.id, s0.id);
}

#[tokio::test]
async fn refinement_links_root_and_parent() {
    let h = TestHarness::new();
    let (s0, _) = h.service.get_or_create_state(None, Some("bridges"), None, false);

    let filters: Filters = serde_json::from_value(json!({
        "and": [{ "rel": {
            "prop": props::id(props::TYPE).as_str(),
            "value": props::id("ARTWORK").as_str()
        } }]
    }))
    .unwrap();
    filters.validate().unwrap();

    let (s1, reused) =
        h.service.get_or_create_state(Some(&s0.id), Some("bridges"), Some(&filters), false);
    assert!(!reused);
    assert_eq!(s1.root_id, s0.id);
    assert_eq!(s1.parent_id.as_ref(), Some(&s0.id));
    assert_eq!(s1.filters.as_ref(), Some(&filters));
}

// ---------------------------------------------------------------------------
// Facets
// ---------------------------------------------------------------------------

#[tokio::test]
async fn filters_overview_merges_and_sorts_facets() {
    let h = TestHarness::new();
    let (s0, _) = h.service.get_or_create_state(None, Some("bridges"), None, false);

    let classification = props::id(props::CLASSIFICATION);
    let type_prop = props::id(props::TYPE);
    let height = props::id("HEIGHT");
    h.engine.push(json!({
        "took": 3,
        "hits": { "total": { "value": 10 }, "hits": [] },
        "aggregations": {
            "rel": { "doc_count": 9, "props": { "buckets": [
                { "key": type_prop.as_str(), "doc_count": 5, "docs": { "doc_count": 5 } }
            ] } },
            "string": { "doc_count": 6, "props": { "buckets": [
                { "key": classification.as_str(), "doc_count": 4, "docs": { "doc_count": 4 } }
            ] } },
            "time": { "doc_count": 0, "props": { "buckets": [] } },
            "amount": { "doc_count": 4, "props": { "buckets": [
                { "key": [height.as_str(), "m"], "doc_count": 2, "docs": { "doc_count": 2 } },
                { "key": [height.as_str(), "@"], "doc_count": 7, "docs": { "doc_count": 7 } }
            ] } },
            "index": { "value": 1 },
            "size": { "value": 9 }
        }
    }));

    let overview = h.service.filters_overview(&s0.id).await.unwrap();

    // The compiled query went out with the request.
    let body = h.engine.request(0);
    assert_eq!(body["query"], to_query("bridges", None));
    assert_eq!(body["size"], 0);

    // Sorted by count descending; the "@" unit and single index are gone.
    let counts: Vec<i64> = overview.iter().map(|e| e.count).collect();
    assert_eq!(counts, vec![9, 5, 4, 2]);
    let classification_entry = overview
        .iter()
        .find(|e| e.id.as_ref() == Some(&classification))
        .expect("classification facet present");
    assert_eq!(serde_json::to_value(classification_entry).unwrap()["type"], "string");
    assert!(classification_entry.count >= 0);
    assert!(overview.iter().any(|e| e.unit == Some(AmountUnit::Metre)));
    assert!(overview.iter().all(|e| e.unit != Some(AmountUnit::Custom)));
    assert!(overview
        .iter()
        .all(|e| serde_json::to_value(e).unwrap()["type"] != "index"));
}

#[tokio::test]
async fn string_facet_clamps_total_to_observed() {
    let h = TestHarness::new();
    let (s0, _) = h.service.get_or_create_state(None, Some("bridges"), None, false);

    // Cardinality under-reports: three observed buckets, estimate of two.
    h.engine.push(terms_response(&[("sculpture", 5), ("painting", 3), ("mural", 1)], 2));
    let facet = h.service.string_values(&s0.id, &props::id(props::CLASSIFICATION)).await.unwrap();
    assert_eq!(facet.buckets.len(), 3);
    assert_eq!(facet.total, 3);
    assert_eq!(facet.buckets[0].value, "sculpture");
    assert_eq!(facet.buckets[0].count, 5);
}

#[tokio::test]
async fn amount_facet_sizes_threshold_and_drops_sentinel_unit() {
    let h = TestHarness::new();
    h.engine.set_count(50);
    let (s0, _) = h.service.get_or_create_state(None, Some("bridges"), None, false);

    let height = props::id("HEIGHT");
    h.engine.push(json!({
        "took": 2,
        "hits": { "total": { "value": 10 }, "hits": [] },
        "aggregations": { "facet": { "doc_count": 10, "scoped": {
            "doc_count": 10,
            "values": { "buckets": [
                { "key": [height.as_str(), "m"], "doc_count": 6, "docs": { "doc_count": 6 } },
                { "key": [height.as_str(), "@"], "doc_count": 3, "docs": { "doc_count": 3 } }
            ] },
            "distinct": { "value": 2 }
        } } }
    }));

    let facet = h.service.amount_values(&s0.id, &height).await.unwrap();
    assert_eq!(facet.buckets.len(), 1);
    assert_eq!(facet.buckets[0].value, AmountUnit::Metre);
    assert_eq!(facet.buckets[0].count, 6);
    assert_eq!(facet.total, 2);

    let body = h.engine.request(0);
    let threshold = 2 * 50 * peerdb_core::AMOUNT_UNITS_TOTAL as u64;
    assert_eq!(
        body["aggs"]["facet"]["aggs"]["scoped"]["aggs"]["distinct"]["cardinality"]
            ["precision_threshold"],
        threshold
    );
}

#[tokio::test]
async fn size_histogram_runs_two_phases() {
    let h = TestHarness::new();
    let (s0, _) = h.service.get_or_create_state(None, Some("bridges"), None, false);

    h.engine.push(json!({
        "took": 1,
        "hits": { "total": { "value": 1000 }, "hits": [] },
        "aggregations": {
            "min": { "value": 0.001 },
            "max": { "value": 18.085 },
            "count": { "value": 1000 }
        }
    }));
    h.engine.push(json!({
        "took": 2,
        "hits": { "total": { "value": 1000 }, "hits": [] },
        "aggregations": { "hist": { "buckets": [
            { "key": 0.001, "doc_count": 40 },
            { "key": 0.18185, "doc_count": 25 }
        ] } }
    }));

    let hist = h.service.size_histogram(&s0.id).await.unwrap();
    assert_eq!(hist.total, 1000);
    assert_eq!(hist.bins.len(), 2);
    let naive = (18.085 - 0.001) / 100.0;
    assert!(hist.interval > naive);

    // The second request carried the derived layout.
    assert_eq!(h.engine.request_count(), 2);
    let second = h.engine.request(1);
    assert_eq!(second["aggs"]["hist"]["histogram"]["field"], "_size");
    assert!(second["aggs"]["hist"]["histogram"]["interval"].as_f64().unwrap() > naive);
}

#[tokio::test]
async fn empty_summary_yields_empty_histogram() {
    let h = TestHarness::new();
    let (s0, _) = h.service.get_or_create_state(None, Some("bridges"), None, false);

    h.engine.push(json!({
        "took": 1,
        "hits": { "total": { "value": 0 }, "hits": [] },
        "aggregations": {
            "min": { "value": null },
            "max": { "value": null },
            "count": { "value": 0 }
        }
    }));
    let hist = h.service.size_histogram(&s0.id).await.unwrap();
    assert_eq!(hist.total, 0);
    assert!(hist.bins.is_empty());
    // No second phase without a layout.
    assert_eq!(h.engine.request_count(), 1);
}

// ---------------------------------------------------------------------------
// Prompt parsing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn prompt_parse_lowers_show_results() {
    let model = ScriptedModel::new(vec![Ok(tool_call_message(
        "show_results",
        json!({
            "query": "",
            "rel_filters": [{
                "prop_id": props::id(props::TYPE).as_str(),
                "doc_id": props::id("ARTWORK").as_str()
            }],
            "string_filters": [],
            "time_filters": [{
                "prop_id": props::id("DATE_ACQUIRED").as_str(),
                "min": "1999-03-17",
                "max": null
            }],
            "amount_filters": []
        }),
    ))]);
    let h = TestHarness::with_model(Some(model));

    let (state, _) =
        h.service
            .get_or_create_state(None, Some("artworks acquired after 1999-03-17"), None, true);
    assert!(!state.ready());

    let done = h.wait_ready(&state.id).await;
    assert!(done.prompt_done);
    assert!(!done.prompt_error);
    assert!(done.search_query.is_empty());
    let expected = Filters::all_of(vec![
        Filters::rel(props::id(props::TYPE), props::id("ARTWORK")),
        Filters::time(props::id("DATE_ACQUIRED"), Some("1999-03-17".parse().unwrap()), None),
    ]);
    assert_eq!(done.filters, Some(expected));
    let calls = done.prompt_calls.expect("trace recorded");
    assert!(calls.iter().any(|c| c.tool_name.as_deref() == Some("show_results")));
}

#[tokio::test]
async fn prompt_parse_discovers_properties_first() {
    let classification_doc = ingest::core_documents()
        .unwrap()
        .into_iter()
        .find(|d| *d.id() == props::id(props::CLASSIFICATION))
        .unwrap();

    let model = ScriptedModel::new(vec![
        Ok(tool_call_message("find_properties", json!({ "query": "classification" }))),
        Ok(tool_call_message(
            "show_results",
            json!({
                "query": "",
                "rel_filters": [],
                "string_filters": [{
                    "prop_id": props::id(props::CLASSIFICATION).as_str(),
                    "value": "sculpture"
                }],
                "time_filters": [],
                "amount_filters": []
            }),
        )),
    ]);
    let h = TestHarness::with_model(Some(model));

    // First engine call: property discovery. Second: string value samples.
    h.engine.push(json!({
        "took": 2,
        "hits": { "total": { "value": 1 }, "hits": [{
            "_id": classification_doc.id().as_str(),
            "_score": 2.5,
            "_source": serde_json::to_value(&classification_doc).unwrap()
        }] }
    }));
    h.engine.push(terms_response(&[("sculpture", 12), ("painting", 7)], 2));

    let (state, _) =
        h.service.get_or_create_state(None, Some("classified as sculpture"), None, true);
    let done = h.wait_ready(&state.id).await;

    assert!(done.prompt_done && !done.prompt_error);
    assert_eq!(
        done.filters,
        Some(Filters::string(props::id(props::CLASSIFICATION), "sculpture"))
    );
    let calls = done.prompt_calls.expect("trace recorded");
    let discovery = calls
        .iter()
        .find(|c| c.tool_name.as_deref() == Some("find_properties"))
        .expect("discovery call recorded");
    let output = discovery.tool_output.as_ref().expect("tool output recorded");
    assert_eq!(output[0]["id"], classification_doc.id().as_str());
    assert_eq!(output[0]["values"][0], "sculpture");
}

#[tokio::test]
async fn malformed_model_output_falls_back_to_text_search() {
    let model =
        ScriptedModel::new(vec![Ok(raw_tool_call_message("show_results", "not json at all"))]);
    let h = TestHarness::with_model(Some(model));

    let prompt = "artworks acquired after 1999-03-17";
    let (state, _) = h.service.get_or_create_state(None, Some(prompt), None, true);
    let done = h.wait_ready(&state.id).await;

    assert!(done.ready());
    assert!(done.prompt_error);
    assert_eq!(done.search_query, prompt);
    assert!(done.prompt_calls.is_some());
}

#[tokio::test]
async fn missing_model_degrades_immediately() {
    let h = TestHarness::new();
    let prompt = "tallest bridges";
    let (state, _) = h.service.get_or_create_state(None, Some(prompt), None, true);
    let done = h.wait_ready(&state.id).await;
    assert!(done.prompt_error);
    assert_eq!(done.search_query, prompt);
}

#[tokio::test]
async fn pending_prompt_surfaces_not_ready() {
    let model = ScriptedModel::stalled(Duration::from_secs(60));
    let h = TestHarness::with_model(Some(model));

    let (state, _) = h.service.get_or_create_state(None, Some("slow prompt"), None, true);
    let err = h.service.search(&state.id, 10).await.unwrap_err();
    assert!(matches!(err.root(), Error::NotReady));
}

// ---------------------------------------------------------------------------
// Populate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn populate_seeds_core_documents() {
    let engine = MockEngine::new();
    let store = Arc::new(MemoryStore::new());
    let count = ingest::populate(
        &(Arc::clone(&engine) as Arc<dyn peerdb_server::engine::SearchEngine>),
        &(Arc::clone(&store) as Arc<dyn peerdb_server::store::DocumentStore>),
        "docs",
    )
    .await
    .unwrap();

    assert_eq!(count, ingest::core_documents().unwrap().len());
    assert_eq!(store.len(), count);
    assert_eq!(engine.indexed.lock().unwrap().len(), count);

    // Seeding twice writes the same bytes — ids are deterministic.
    let first: Vec<_> = engine.indexed.lock().unwrap().clone();
    engine.indexed.lock().unwrap().clear();
    ingest::populate(
        &(Arc::clone(&engine) as Arc<dyn peerdb_server::engine::SearchEngine>),
        &(Arc::clone(&store) as Arc<dyn peerdb_server::store::DocumentStore>),
        "docs",
    )
    .await
    .unwrap();
    assert_eq!(first, *engine.indexed.lock().unwrap());
}
