//! In-memory document store
//!
//! Every collection lives in one map behind a single tokio mutex, which is
//! what makes `atomic_update` a real find-and-modify. Mutations are planned
//! against the cache first and committed afterwards, so a store that also
//! writes to disk can commit only what it managed to persist.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    document_id, project, Document, DocumentStore, Filter, ReturnDocument, Sort, StoreError,
    Update,
};

/// The documents of every collection, keyed by identity.
#[derive(Debug, Default)]
pub(crate) struct Collections {
    collections: BTreeMap<String, BTreeMap<Uuid, Document>>,
}

/// One planned change to a collection. Planning never touches the cache;
/// [`Collections::commit`] applies the change once it is safe to.
pub(crate) enum Touched {
    Written(Uuid, Document),
    Removed(Uuid),
}

impl Collections {
    pub(crate) fn put(&mut self, collection: &str, doc: Document) -> Result<Uuid, StoreError> {
        let id = document_id(&doc)?;
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(id, doc);
        Ok(id)
    }

    pub(crate) fn find_one(&self, collection: &str, id: Uuid) -> Option<Document> {
        self.collections.get(collection)?.get(&id).cloned()
    }

    pub(crate) fn find_many(
        &self,
        collection: &str,
        filter: &Filter,
        projection: Option<&[&str]>,
    ) -> Vec<Document> {
        let Some(docs) = self.collections.get(collection) else {
            return Vec::new();
        };
        docs.values()
            .filter(|doc| filter.matches(doc))
            .map(|doc| match projection {
                Some(fields) => project(doc, fields),
                None => doc.clone(),
            })
            .collect()
    }

    pub(crate) fn insert(&self, collection: &str, doc: Document) -> Result<Touched, StoreError> {
        let id = document_id(&doc)?;
        if self.find_one(collection, id).is_some() {
            return Err(StoreError::Duplicate {
                collection: collection.to_string(),
                id,
            });
        }
        Ok(Touched::Written(id, doc))
    }

    pub(crate) fn replace(
        &self,
        collection: &str,
        doc: Document,
    ) -> Result<(Touched, Option<Document>), StoreError> {
        let id = document_id(&doc)?;
        let previous = self.find_one(collection, id);
        Ok((Touched::Written(id, doc), previous))
    }

    pub(crate) fn replace_existing(
        &self,
        collection: &str,
        doc: Document,
    ) -> Result<Option<(Touched, Document)>, StoreError> {
        let id = document_id(&doc)?;
        Ok(self
            .find_one(collection, id)
            .map(|previous| (Touched::Written(id, doc), previous)))
    }

    pub(crate) fn atomic_update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        sort: Option<&Sort>,
        returning: ReturnDocument,
    ) -> Result<Option<(Touched, Document)>, StoreError> {
        let Some(docs) = self.collections.get(collection) else {
            return Ok(None);
        };

        let mut candidates = docs.values().filter(|doc| filter.matches(doc));
        let chosen = match sort {
            Some(sort) => candidates.min_by(|a, b| sort.compare(a, b)),
            None => candidates.next(),
        };
        let Some(chosen) = chosen else {
            return Ok(None);
        };

        let id = document_id(chosen)?;
        let before = chosen.clone();
        let mut after = before.clone();
        update.apply(&mut after)?;
        if document_id(&after)? != id {
            return Err(StoreError::InvalidDocument(
                "an update may not change a document's id".to_string(),
            ));
        }

        let returned = match returning {
            ReturnDocument::Before => before,
            ReturnDocument::After => after.clone(),
        };
        Ok(Some((Touched::Written(id, after), returned)))
    }

    pub(crate) fn remove(&self, collection: &str, filter: &Filter) -> Vec<Touched> {
        let Some(docs) = self.collections.get(collection) else {
            return Vec::new();
        };
        docs.iter()
            .filter(|(_, doc)| filter.matches(doc))
            .map(|(id, _)| Touched::Removed(*id))
            .collect()
    }

    /// Apply a planned change to the cache.
    pub(crate) fn commit(&mut self, collection: &str, touched: Touched) {
        let docs = self.collections.entry(collection.to_string()).or_default();
        match touched {
            Touched::Written(id, doc) => {
                docs.insert(id, doc);
            }
            Touched::Removed(id) => {
                docs.remove(&id);
            }
        }
    }
}

/// A document store that keeps everything in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Collections>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find_one(&self, collection: &str, id: Uuid) -> Result<Option<Document>, StoreError> {
        Ok(self.inner.lock().await.find_one(collection, id))
    }

    async fn find_many(
        &self,
        collection: &str,
        filter: &Filter,
        projection: Option<&[&str]>,
    ) -> Result<Vec<Document>, StoreError> {
        Ok(self.inner.lock().await.find_many(collection, filter, projection))
    }

    async fn insert(&self, collection: &str, doc: Document) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let touched = inner.insert(collection, doc)?;
        inner.commit(collection, touched);
        Ok(())
    }

    async fn replace(&self, collection: &str, doc: Document) -> Result<Option<Document>, StoreError> {
        let mut inner = self.inner.lock().await;
        let (touched, previous) = inner.replace(collection, doc)?;
        inner.commit(collection, touched);
        Ok(previous)
    }

    async fn replace_existing(
        &self,
        collection: &str,
        doc: Document,
    ) -> Result<Option<Document>, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.replace_existing(collection, doc)? {
            Some((touched, previous)) => {
                inner.commit(collection, touched);
                Ok(Some(previous))
            }
            None => Ok(None),
        }
    }

    async fn atomic_update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        sort: Option<&Sort>,
        returning: ReturnDocument,
    ) -> Result<Option<Document>, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.atomic_update(collection, filter, update, sort, returning)? {
            Some((touched, doc)) => {
                inner.commit(collection, touched);
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }

    async fn remove(&self, collection: &str, filter: &Filter) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        let removed = inner.remove(collection, filter);
        let count = removed.len();
        for touched in removed {
            inner.commit(collection, touched);
        }
        Ok(count)
    }
}
