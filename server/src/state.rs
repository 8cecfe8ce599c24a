//! Search states and their process-wide registry.
//!
//! A state is an immutable snapshot of what the user is searching for.
//! States form a forest: refinements link to their parent and share its
//! root. A state is created once and replaced wholesale only to record the
//! outcome of prompt parsing. The registry is a concurrent map that lives
//! for the whole process; `create` happens-before any later `get`.

use crate::errors::{Error, Result};
use crate::llm::PromptCall;
use peerdb_core::{Filters, Identifier};
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;
use url::form_urlencoded;

/// An immutable search state.
#[derive(Debug, Clone, Serialize)]
pub struct SearchState {
    pub id: Identifier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Identifier>,
    pub root_id: Identifier,
    /// Free-text query. Empty while a prompt is still parsing.
    pub search_query: String,
    /// The natural-language prompt, when the state was created in prompt mode.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Filters>,
    pub prompt_done: bool,
    pub prompt_error: bool,
    /// Raw LLM call trace, recorded when parsing finishes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_calls: Option<Vec<PromptCall>>,
}

impl SearchState {
    /// Whether the state can be queried. Prompt states become ready once the
    /// call trace lands or the parse fails over.
    pub fn ready(&self) -> bool {
        self.prompt.is_empty() || self.prompt_calls.is_some() || self.prompt_error
    }

    /// Query-string pairs that round-trip this state through
    /// [`parse_query_pairs`] and [`StateRegistry::get_or_create`].
    pub fn values(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("s", self.id.to_string())];
        if !self.prompt.is_empty() {
            pairs.push(("p", self.prompt.clone()));
        } else if !self.search_query.is_empty() {
            pairs.push(("q", self.search_query.clone()));
        }
        pairs
    }

    /// Like [`SearchState::values`], with the optional anchor document.
    pub fn values_with_at(&self, at: &Identifier) -> Vec<(&'static str, String)> {
        let mut pairs = self.values();
        pairs.push(("at", at.to_string()));
        pairs
    }

    /// URL-encode pairs from [`SearchState::values`].
    pub fn encode(pairs: &[(&'static str, String)]) -> String {
        let mut ser = form_urlencoded::Serializer::new(String::new());
        for (key, value) in pairs {
            ser.append_pair(key, value);
        }
        ser.finish()
    }
}

/// Decoded state parameters from a URL query string.
#[derive(Debug, Clone, Default)]
pub struct StateParams {
    pub state: Option<Identifier>,
    pub text: Option<String>,
    pub prompt: Option<String>,
    pub at: Option<Identifier>,
    pub filters: Option<Filters>,
}

/// Parse the on-wire contract: `q` free text, `p` prompt, `s` state id,
/// `at` anchor, `filters` the canonical algebra JSON.
pub fn parse_query_pairs(query: &str) -> Result<StateParams> {
    let mut params = StateParams::default();
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "q" => params.text = Some(value.into_owned()),
            "p" => params.prompt = Some(value.into_owned()),
            "s" => params.state = Some(value.parse().map_err(Error::from)?),
            "at" => params.at = Some(value.parse().map_err(Error::from)?),
            "filters" => {
                let filters: Filters = serde_json::from_str(&value)?;
                filters.validate()?;
                params.filters = Some(filters);
            }
            _ => {}
        }
    }
    Ok(params)
}

/// The process-wide registry of search states.
#[derive(Default)]
pub struct StateRegistry {
    states: DashMap<Identifier, SearchState>,
}

impl StateRegistry {
    pub fn new() -> Self {
        StateRegistry::default()
    }

    /// Create a fresh state. A valid `parent` makes this a refinement
    /// sharing the parent's root; an unknown parent is dropped silently. In
    /// prompt mode the text lands under `prompt` and the state stays
    /// not-ready until parsing records an outcome.
    pub fn create(
        &self,
        parent: Option<&Identifier>,
        text: &str,
        filters: Option<Filters>,
        is_prompt: bool,
    ) -> SearchState {
        let id = Identifier::random();
        let (parent_id, root_id) = match parent.and_then(|p| self.states.get(p)) {
            Some(existing) => (Some(existing.id.clone()), existing.root_id.clone()),
            None => {
                if parent.is_some() {
                    debug!(state = %id, "dropping unknown parent reference");
                }
                (None, id.clone())
            }
        };
        let prompt_mode = is_prompt && !text.is_empty();
        let state = SearchState {
            id: id.clone(),
            parent_id,
            root_id,
            search_query: if prompt_mode { String::new() } else { text.to_string() },
            prompt: if prompt_mode { text.to_string() } else { String::new() },
            filters,
            prompt_done: false,
            prompt_error: false,
            prompt_calls: None,
        };
        self.states.insert(id, state.clone());
        state
    }

    pub fn get(&self, id: &Identifier) -> Result<SearchState> {
        self.states
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::not_found("search state").context("state", id.clone()))
    }

    /// Reuse `existing` only when every provided field matches it; any
    /// mismatch creates a fresh sibling refinement of the existing state.
    /// Returns the state and whether it was reused.
    pub fn get_or_create(
        &self,
        existing: Option<&Identifier>,
        text: Option<&str>,
        filters: Option<&Filters>,
        is_prompt: bool,
    ) -> (SearchState, bool) {
        let found = existing.and_then(|id| self.get(id).ok());
        if let Some(state) = found {
            let stored_text = if is_prompt { &state.prompt } else { &state.search_query };
            let text_matches = text.map_or(true, |t| t == stored_text);
            let filters_match = filters.map_or(true, |f| Some(f) == state.filters.as_ref());
            if text_matches && filters_match {
                return (state, true);
            }
            let refined = self.create(
                Some(&state.id),
                text.unwrap_or(""),
                filters.cloned(),
                is_prompt,
            );
            return (refined, false);
        }
        (self.create(None, text.unwrap_or(""), filters.cloned(), is_prompt), false)
    }

    /// Replace the whole record. The write is visible to every later `get`.
    pub fn store(&self, state: SearchState) {
        self.states.insert(state.id.clone(), state);
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_without_parent_is_its_own_root() {
        let registry = StateRegistry::new();
        let state = registry.create(None, "bridges", None, false);
        assert_eq!(state.root_id, state.id);
        assert!(state.parent_id.is_none());
        assert_eq!(state.search_query, "bridges");
        assert!(state.ready());
    }

    #[test]
    fn refinement_inherits_root_and_links_parent() {
        let registry = StateRegistry::new();
        let s0 = registry.create(None, "bridges", None, false);
        let s1 = registry.create(Some(&s0.id), "bridges", Some(Filters::index("docs")), false);
        assert_eq!(s1.root_id, s0.id);
        assert_eq!(s1.parent_id.as_ref(), Some(&s0.id));
    }

    #[test]
    fn unknown_parent_is_dropped_silently() {
        let registry = StateRegistry::new();
        let ghost = Identifier::random();
        let state = registry.create(Some(&ghost), "bridges", None, false);
        assert!(state.parent_id.is_none());
        assert_eq!(state.root_id, state.id);
    }

    #[test]
    fn prompt_mode_stores_text_under_prompt() {
        let registry = StateRegistry::new();
        let state = registry.create(None, "artworks acquired after 1999", None, true);
        assert_eq!(state.prompt, "artworks acquired after 1999");
        assert!(state.search_query.is_empty());
        assert!(!state.ready());
        // prompt == "" implies prompt_calls == null.
        let plain = registry.create(None, "", None, true);
        assert!(plain.prompt_calls.is_none());
        assert!(plain.ready());
    }

    #[test]
    fn get_or_create_reuses_on_full_match() {
        let registry = StateRegistry::new();
        let s0 = registry.create(None, "bridges", None, false);
        let (again, reused) = registry.get_or_create(Some(&s0.id), Some("bridges"), None, false);
        assert!(reused);
        assert_eq!(again.id, s0.id);
    }

    #[test]
    fn get_or_create_refines_on_mismatch() {
        let registry = StateRegistry::new();
        let s0 = registry.create(None, "bridges", None, false);
        let (refined, reused) =
            registry.get_or_create(Some(&s0.id), Some("stone bridges"), None, false);
        assert!(!reused);
        assert_ne!(refined.id, s0.id);
        assert_eq!(refined.parent_id.as_ref(), Some(&s0.id));
        assert_eq!(refined.root_id, s0.id);
    }

    #[test]
    fn values_round_trip_to_the_same_state() {
        let registry = StateRegistry::new();
        let s0 = registry.create(None, "stone bridges", None, false);
        let encoded = SearchState::encode(&s0.values());
        let params = parse_query_pairs(&encoded).unwrap();
        let (state, reused) = registry.get_or_create(
            params.state.as_ref(),
            params.text.as_deref(),
            params.filters.as_ref(),
            params.prompt.is_some(),
        );
        assert!(reused);
        assert_eq!(state.id, s0.id);
    }

    #[test]
    fn values_with_at_carries_the_anchor() {
        let registry = StateRegistry::new();
        let s0 = registry.create(None, "bridges", None, false);
        let at = Identifier::random();
        let encoded = SearchState::encode(&s0.values_with_at(&at));
        let params = parse_query_pairs(&encoded).unwrap();
        assert_eq!(params.at, Some(at));
    }

    #[test]
    fn parse_rejects_bad_state_and_filters() {
        assert!(parse_query_pairs("s=notanid").is_err());
        assert!(parse_query_pairs("filters=%7B%22and%22%3A%5B%5D%7D").is_err());
        assert!(parse_query_pairs("filters=notjson").is_err());
    }

    #[test]
    fn create_happens_before_concurrent_gets() {
        let registry = std::sync::Arc::new(StateRegistry::new());
        let mut handles = Vec::new();
        for worker in 0..8 {
            let registry = std::sync::Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    let state = registry.create(None, &format!("q {worker} {i}"), None, false);
                    let read = registry.get(&state.id).expect("created state is visible");
                    assert_eq!(read.search_query, state.search_query);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 8 * 50);
    }

    #[test]
    fn store_replaces_whole_record() {
        let registry = StateRegistry::new();
        let mut state = registry.create(None, "prompted", None, true);
        state.search_query = "parsed".to_string();
        state.prompt_done = true;
        state.prompt_calls = Some(Vec::new());
        registry.store(state.clone());

        let read = registry.get(&state.id).unwrap();
        assert!(read.ready());
        assert_eq!(read.search_query, "parsed");
    }
}
