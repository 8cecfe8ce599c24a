//! LLM-driven prompt parsing.
//!
//! A natural-language prompt is translated into a search query plus filters
//! by a single-shot conversation: the model may call `find_properties` to
//! discover properties, and terminates with `show_results`, whose payload is
//! lowered into the filter algebra and validated. On any model, tool, or
//! validation error the state falls back to free-text search over the raw
//! prompt — callers are never blocked on a parse.

use crate::errors::{Error, Result};
use crate::llm::{ChatMessage, ChatModel, PromptCall, ToolSpec};
use crate::service::SearchService;
use crate::state::SearchState;
use peerdb_core::{AmountUnit, Filters, Identifier, Timestamp};
use serde::Deserialize;
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Upper bound on completion rounds before the parse is abandoned.
const MAX_TOOL_ROUNDS: usize = 8;

/// Identifier shape enforced on every property id the model emits.
const ID_PATTERN: &str = "^[1-9A-HJ-NP-Za-km-z]{22}$";

const SYSTEM_PROMPT: &str = "\
You translate a natural-language request into a structured search over a \
document corpus. Documents carry typed property/value claims. Properties \
come in five kinds: text (rich text), rel (links to other documents), \
string (exact lowercased values), time (timestamps), and amount (numbers \
with units).

The free-text query syntax joins terms with AND by default and supports: \
+term (require), -term (exclude), \"exact phrase\", prefix*, and (grouping).

Use the find_properties tool to discover properties relevant to the \
request; it returns property ids, names, descriptions, units, and sample \
values. Prefer structured filters over query text whenever a property \
matches the request. When done, call show_results exactly once with the \
final query and filters. Use only property and document ids returned by \
find_properties.";

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

fn tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "find_properties",
            description: "Search the corpus for properties matching a query. \
                Returns ranked properties with id, name, description, unit, \
                sample related documents (rel) or sample values (string), and \
                a relevance score.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Search terms for property discovery" }
                },
                "required": ["query"],
                "additionalProperties": false
            }),
        },
        ToolSpec {
            name: "show_results",
            description: "Report the final translation. Call exactly once, \
                when the query and filters are complete.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Free-text query; empty when filters capture the whole request"
                    },
                    "rel_filters": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "prop_id": { "type": "string", "pattern": ID_PATTERN },
                                "doc_id": { "type": "string", "pattern": ID_PATTERN }
                            },
                            "required": ["prop_id", "doc_id"],
                            "additionalProperties": false
                        }
                    },
                    "string_filters": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "prop_id": { "type": "string", "pattern": ID_PATTERN },
                                "value": { "type": "string" }
                            },
                            "required": ["prop_id", "value"],
                            "additionalProperties": false
                        }
                    },
                    "time_filters": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "prop_id": { "type": "string", "pattern": ID_PATTERN },
                                "min": { "type": ["string", "null"], "description": "Inclusive ISO-8601 lower bound" },
                                "max": { "type": ["string", "null"], "description": "Inclusive ISO-8601 upper bound" }
                            },
                            "required": ["prop_id"],
                            "additionalProperties": false
                        }
                    },
                    "amount_filters": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "prop_id": { "type": "string", "pattern": ID_PATTERN },
                                "unit": { "type": "string", "description": "Unit symbol, e.g. \"kg\"" },
                                "min": { "type": ["number", "null"] },
                                "max": { "type": ["number", "null"] }
                            },
                            "required": ["prop_id", "unit"],
                            "additionalProperties": false
                        }
                    }
                },
                "required": ["query", "rel_filters", "string_filters", "time_filters", "amount_filters"],
                "additionalProperties": false
            }),
        },
    ]
}

// ---------------------------------------------------------------------------
// The terminal payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct ShowResults {
    #[serde(default)]
    query: String,
    #[serde(default)]
    rel_filters: Vec<RelArg>,
    #[serde(default)]
    string_filters: Vec<StringArg>,
    #[serde(default)]
    time_filters: Vec<TimeArg>,
    #[serde(default)]
    amount_filters: Vec<AmountArg>,
}

#[derive(Debug, Clone, Deserialize)]
struct RelArg {
    prop_id: String,
    doc_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct StringArg {
    prop_id: String,
    value: String,
}

#[derive(Debug, Clone, Deserialize)]
struct TimeArg {
    prop_id: String,
    #[serde(default)]
    min: Option<String>,
    #[serde(default)]
    max: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct AmountArg {
    prop_id: String,
    unit: String,
    #[serde(default)]
    min: Option<f64>,
    #[serde(default)]
    max: Option<f64>,
}

/// Group values under their property, preserving first-seen order.
fn group_by_prop<T>(items: Vec<(Identifier, T)>) -> Vec<(Identifier, Vec<T>)> {
    let mut groups: Vec<(Identifier, Vec<T>)> = Vec::new();
    for (prop, value) in items {
        match groups.iter_mut().find(|(p, _)| *p == prop) {
            Some((_, values)) => values.push(value),
            None => groups.push((prop, vec![value])),
        }
    }
    groups
}

fn one_or_any(mut leaves: Vec<Filters>) -> Filters {
    if leaves.len() == 1 {
        leaves.pop().unwrap()
    } else {
        Filters::any_of(leaves)
    }
}

/// Lower the terminal payload into the filter algebra: an AND of
/// per-property disjunctions. The result is validated before use.
fn lower(payload: ShowResults) -> Result<(String, Option<Filters>)> {
    let parse_id = |raw: &str| -> Result<Identifier> {
        Identifier::from_str(raw).map_err(|e| Error::from(e).context("property", raw.to_string()))
    };

    let mut clauses = Vec::new();

    let rels: Vec<(Identifier, Identifier)> = payload
        .rel_filters
        .into_iter()
        .map(|f| Ok((parse_id(&f.prop_id)?, parse_id(&f.doc_id)?)))
        .collect::<Result<_>>()?;
    for (prop, docs) in group_by_prop(rels) {
        let leaves = docs.into_iter().map(|doc| Filters::rel(prop.clone(), doc)).collect();
        clauses.push(one_or_any(leaves));
    }

    let strings: Vec<(Identifier, String)> = payload
        .string_filters
        .into_iter()
        .filter(|f| !f.value.is_empty())
        .map(|f| Ok((parse_id(&f.prop_id)?, f.value)))
        .collect::<Result<_>>()?;
    for (prop, values) in group_by_prop(strings) {
        let leaves = values.into_iter().map(|v| Filters::string(prop.clone(), v)).collect();
        clauses.push(one_or_any(leaves));
    }

    for f in payload.time_filters {
        if f.min.is_none() && f.max.is_none() {
            continue;
        }
        let prop = parse_id(&f.prop_id)?;
        let gte = f.min.as_deref().map(Timestamp::from_str).transpose()?;
        let lte = f.max.as_deref().map(Timestamp::from_str).transpose()?;
        clauses.push(Filters::time(prop, gte, lte));
    }

    for f in payload.amount_filters {
        if f.min.is_none() && f.max.is_none() {
            continue;
        }
        let prop = parse_id(&f.prop_id)?;
        let unit = AmountUnit::from_str(&f.unit)
            .map_err(|e| Error::invalid(e.to_string()).context("property", f.prop_id.clone()))?;
        clauses.push(Filters::amount(prop, unit, f.min, f.max));
    }

    let filters = match clauses.len() {
        0 => None,
        1 => Some(clauses.pop().unwrap()),
        _ => Some(Filters::all_of(clauses)),
    };
    if let Some(filters) = &filters {
        filters.validate()?;
    }
    Ok((payload.query, filters))
}

// ---------------------------------------------------------------------------
// The conversation loop
// ---------------------------------------------------------------------------

/// Translate `prompt` with the model, recording every exchange in `trace`.
/// The first `show_results` payload is the final answer.
pub async fn parse(
    prompt: &str,
    service: &SearchService,
    llm: &dyn ChatModel,
    trace: &mut Vec<PromptCall>,
) -> Result<(String, Option<Filters>)> {
    let tools = tool_specs();
    let mut messages = vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)];

    for _ in 0..MAX_TOOL_ROUNDS {
        let asking = Instant::now();
        let reply = llm.complete(&messages, &tools).await?;
        trace.push(PromptCall {
            role: "assistant".into(),
            content: reply.content.clone(),
            tool_name: None,
            tool_input: None,
            tool_output: None,
            duration_ms: asking.elapsed().as_millis() as u64,
        });
        if reply.tool_calls.is_empty() {
            return Err(Error::invalid("model finished without calling show_results"));
        }
        messages.push(reply.clone());

        for call in &reply.tool_calls {
            match call.function.name.as_str() {
                "show_results" => {
                    let payload: ShowResults = serde_json::from_str(&call.function.arguments)?;
                    trace.push(PromptCall {
                        role: "tool".into(),
                        content: None,
                        tool_name: Some("show_results".into()),
                        tool_input: Some(serde_json::from_str(&call.function.arguments)?),
                        tool_output: None,
                        duration_ms: 0,
                    });
                    return lower(payload);
                }
                "find_properties" => {
                    #[derive(Deserialize)]
                    struct FindArgs {
                        query: String,
                    }
                    let args: FindArgs = serde_json::from_str(&call.function.arguments)?;
                    let running = Instant::now();
                    let hits = service.find_properties(&args.query).await?;
                    let output = serde_json::to_value(&hits)?;
                    trace.push(PromptCall {
                        role: "tool".into(),
                        content: None,
                        tool_name: Some("find_properties".into()),
                        tool_input: Some(json!({ "query": args.query })),
                        tool_output: Some(output.clone()),
                        duration_ms: running.elapsed().as_millis() as u64,
                    });
                    messages.push(ChatMessage::tool_result(&call.id, output.to_string()));
                }
                other => {
                    return Err(Error::invalid(format!("model called unknown tool {other:?}")));
                }
            }
        }
    }
    Err(Error::invalid("model exceeded the tool-call round limit"))
}

/// Launch prompt parsing on a detached task. The task deliberately outlives
/// the request that created the state: a client disconnect must not abort
/// the parse. Whatever happens, the state ends up ready.
pub fn spawn_parse(
    service: Arc<SearchService>,
    llm: Option<Arc<dyn ChatModel>>,
    state: SearchState,
) {
    tokio::spawn(async move {
        let mut trace = Vec::new();
        let outcome = match &llm {
            Some(model) => parse(&state.prompt, &service, model.as_ref(), &mut trace).await,
            None => Err(Error::unsupported("no model endpoint configured")),
        };

        let Ok(mut updated) = service.registry().get(&state.id) else {
            return;
        };
        match outcome {
            Ok((query, filters)) => {
                info!(state = %state.id, "prompt parsed");
                updated.search_query = query;
                if filters.is_some() {
                    updated.filters = filters;
                }
                updated.prompt_done = true;
            }
            Err(err) => {
                warn!(state = %state.id, error = %err, "prompt parse failed; falling back to text search");
                updated.search_query = updated.prompt.clone();
                updated.prompt_done = true;
                updated.prompt_error = true;
            }
        }
        updated.prompt_calls = Some(trace);
        service.registry().store(updated);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerdb_core::props;

    fn id_str(mnemonic: &str) -> String {
        props::id(mnemonic).to_string()
    }

    #[test]
    fn lowering_builds_and_of_per_property_disjunctions() {
        let payload = ShowResults {
            query: String::new(),
            rel_filters: vec![RelArg { prop_id: id_str(props::TYPE), doc_id: id_str("ARTWORK") }],
            string_filters: vec![],
            time_filters: vec![TimeArg {
                prop_id: id_str("DATE_ACQUIRED"),
                min: Some("1999-03-17".into()),
                max: None,
            }],
            amount_filters: vec![],
        };
        let (query, filters) = lower(payload).unwrap();
        assert!(query.is_empty());
        let expected = Filters::all_of(vec![
            Filters::rel(props::id(props::TYPE), props::id("ARTWORK")),
            Filters::time(props::id("DATE_ACQUIRED"), Some("1999-03-17".parse().unwrap()), None),
        ]);
        assert_eq!(filters.unwrap(), expected);
    }

    #[test]
    fn same_property_values_merge_into_a_disjunction() {
        let payload = ShowResults {
            query: "bridges".into(),
            rel_filters: vec![],
            string_filters: vec![
                StringArg { prop_id: id_str(props::CLASSIFICATION), value: "sculpture".into() },
                StringArg { prop_id: id_str(props::CLASSIFICATION), value: "painting".into() },
                StringArg { prop_id: id_str(props::CLASSIFICATION), value: String::new() },
            ],
            time_filters: vec![],
            amount_filters: vec![],
        };
        let (query, filters) = lower(payload).unwrap();
        assert_eq!(query, "bridges");
        let filters = filters.unwrap();
        let or = filters.or.expect("single clause stays unwrapped");
        assert_eq!(or.len(), 2);
    }

    #[test]
    fn amount_filters_carry_units_and_bounds() {
        let payload = ShowResults {
            query: String::new(),
            rel_filters: vec![],
            string_filters: vec![],
            time_filters: vec![],
            amount_filters: vec![AmountArg {
                prop_id: id_str("HEIGHT"),
                unit: "m".into(),
                min: Some(2.0),
                max: None,
            }],
        };
        let (_, filters) = lower(payload).unwrap();
        let amount = filters.unwrap().amount.unwrap();
        assert_eq!(amount.unit, AmountUnit::Metre);
        assert_eq!(amount.gte, Some(2.0));
        assert_eq!(amount.lte, None);
    }

    #[test]
    fn unbounded_range_filters_are_skipped() {
        let payload = ShowResults {
            query: "everything".into(),
            rel_filters: vec![],
            string_filters: vec![],
            time_filters: vec![TimeArg { prop_id: id_str("DATE"), min: None, max: None }],
            amount_filters: vec![AmountArg {
                prop_id: id_str("HEIGHT"),
                unit: "m".into(),
                min: None,
                max: None,
            }],
        };
        let (query, filters) = lower(payload).unwrap();
        assert_eq!(query, "everything");
        assert!(filters.is_none());
    }

    #[test]
    fn bad_ids_and_units_are_violations() {
        let bad_id = ShowResults {
            query: String::new(),
            rel_filters: vec![RelArg { prop_id: "nope".into(), doc_id: id_str("ARTWORK") }],
            string_filters: vec![],
            time_filters: vec![],
            amount_filters: vec![],
        };
        assert!(lower(bad_id).is_err());

        let bad_unit = ShowResults {
            query: String::new(),
            rel_filters: vec![],
            string_filters: vec![],
            time_filters: vec![],
            amount_filters: vec![AmountArg {
                prop_id: id_str("HEIGHT"),
                unit: "furlong".into(),
                min: Some(1.0),
                max: None,
            }],
        };
        assert!(lower(bad_unit).is_err());
    }

    #[test]
    fn tool_schemas_constrain_identifiers() {
        let tools = tool_specs();
        let show = tools.iter().find(|t| t.name == "show_results").unwrap();
        let pattern = &show.parameters["properties"]["rel_filters"]["items"]["properties"]["prop_id"]["pattern"];
        assert_eq!(pattern, ID_PATTERN);
        let required = show.parameters["required"].as_array().unwrap();
        assert_eq!(required.len(), 5);
    }
}
