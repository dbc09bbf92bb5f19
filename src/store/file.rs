//! On-disk document store
//!
//! Stores each collection as a directory and each document as a
//! pretty-printed `{id}.json` file inside it. Everything is loaded into an
//! in-memory cache at open time. Every change is written to disk before it
//! reaches the cache, both under the same lock, so a failed write leaves the
//! cache as it was.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs as tokio_fs;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::memory::{Collections, Touched};
use super::{Document, DocumentStore, Filter, ReturnDocument, Sort, StoreError, Update};

/// A document store backed by a directory of JSON files
pub struct FileStore {
    root: PathBuf,
    inner: Mutex<Collections>,
}

impl FileStore {
    /// Open (or create) a store rooted at `root`, loading every document.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        tokio_fs::create_dir_all(&root).await?;

        let mut collections = Collections::default();
        let mut dirs = tokio_fs::read_dir(&root).await?;
        while let Some(dir) = dirs.next_entry().await? {
            if !dir.file_type().await?.is_dir() {
                continue;
            }
            let Some(collection) = dir.file_name().to_str().map(str::to_string) else {
                continue;
            };

            let mut files = tokio_fs::read_dir(dir.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                    continue;
                }
                let data = tokio_fs::read(&path).await?;
                let doc: Document = serde_json::from_slice(&data)?;
                collections.put(&collection, doc)?;
            }
        }

        log::debug!("Opened file store at {}", root.display());
        Ok(Self {
            root,
            inner: Mutex::new(collections),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_path(&self, collection: &str, id: Uuid) -> PathBuf {
        self.root.join(collection).join(format!("{}.json", id))
    }

    async fn write_through(&self, collection: &str, touched: &Touched) -> Result<(), StoreError> {
        match touched {
            Touched::Written(id, doc) => {
                tokio_fs::create_dir_all(self.root.join(collection)).await?;
                let json = serde_json::to_string_pretty(doc)?;
                tokio_fs::write(self.document_path(collection, *id), json).await?;
            }
            Touched::Removed(id) => {
                let path = self.document_path(collection, *id);
                if tokio_fs::try_exists(&path).await? {
                    tokio_fs::remove_file(path).await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for FileStore {
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
        self.write_through(collection, &touched).await?;
        inner.commit(collection, touched);
        Ok(())
    }

    async fn replace(&self, collection: &str, doc: Document) -> Result<Option<Document>, StoreError> {
        let mut inner = self.inner.lock().await;
        let (touched, previous) = inner.replace(collection, doc)?;
        self.write_through(collection, &touched).await?;
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
                self.write_through(collection, &touched).await?;
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
                self.write_through(collection, &touched).await?;
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
            self.write_through(collection, &touched).await?;
            inner.commit(collection, touched);
        }
        Ok(count)
    }
}
