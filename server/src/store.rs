//! Document store adapter.
//!
//! The core consumes the store through [`DocumentStore`]: fetch the latest
//! revision of a document, or replace it atomically. The contract assumes
//! serializable isolation with retries (capped at [`STORE_RETRY_CAP`]) on
//! serialization and deadlock failures. [`MemoryStore`] is the in-process
//! implementation backing tests and single-node serving; the Postgres-backed
//! adapter is an external collaborator reached through the same trait.

use crate::errors::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use peerdb_core::{Document, Identifier};
use std::sync::Arc;

/// Retry cap for serialization-failure and deadlock-detected errors.
pub const STORE_RETRY_CAP: u32 = 10;

#[async_trait]
pub trait DocumentStore: Send + Sync + std::fmt::Debug {
    /// The latest revision of `id`, or `NotFound`.
    async fn get_latest(&self, id: &Identifier) -> Result<Document>;

    /// Atomically insert or replace the whole document.
    async fn insert_or_replace(&self, doc: &Document) -> Result<()>;
}

/// Open the configured store. No URL selects the in-process store.
pub fn open(postgres_url: Option<&str>) -> Result<Arc<dyn DocumentStore>> {
    match postgres_url {
        None | Some("") => Ok(Arc::new(MemoryStore::new())),
        Some(url) => Err(Error::unsupported(
            "this build links no Postgres adapter; run against the external store service",
        )
        .context("postgres_url", url)),
    }
}

/// In-process store: a concurrent map of whole documents.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: DashMap<Identifier, Document>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get_latest(&self, id: &Identifier) -> Result<Document> {
        self.docs
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::not_found("document").context("document", id.clone()))
    }

    async fn insert_or_replace(&self, doc: &Document) -> Result<()> {
        self.docs.insert(doc.id().clone(), doc.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_replace_get() {
        let store = MemoryStore::new();
        let id = Identifier::random();
        let doc = Document::new(id.clone(), 0.5);
        store.insert_or_replace(&doc).await.unwrap();

        let replacement = Document::new(id.clone(), 0.9);
        store.insert_or_replace(&replacement).await.unwrap();

        let got = store.get_latest(&id).await.unwrap();
        assert_eq!(got.score(), 0.9);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn miss_is_not_found() {
        let store = MemoryStore::new();
        let err = store.get_latest(&Identifier::random()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn open_without_url_uses_memory() {
        assert!(open(None).is_ok());
        assert!(open(Some("")).is_ok());
        let err = open(Some("postgres://db/peerdb")).unwrap_err();
        assert!(matches!(err.root(), Error::Unsupported(_)));
    }
}
