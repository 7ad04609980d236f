//! Object storage client.
//!
//! [`RemoteStore`] is the list/get/put/copy surface of a prefix-addressed
//! store. [`StorageClient`] builds the folder-level operations on top of it:
//! recursive prefix copy, pulling a prefix onto local disk, and single-object
//! uploads. Listings are paged with continuation tokens; pages are processed
//! one after another and the transfers inside a page run concurrently, so the
//! page size bounds the fan-out.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::try_join_all;
use futures::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use thiserror::Error;
use tracing::{debug, info};

use crate::workspace_fs::{self, FsError, RelPath};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object {0} not found")]
    NotFound(String),
    #[error("invalid object key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },
    #[error("object store error: {0}")]
    Backend(#[from] object_store::Error),
    #[error("writing {path}: {source}")]
    Local {
        path: String,
        #[source]
        source: FsError,
    },
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// One page of a listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub keys: Vec<String>,
    /// Present when more keys remain after this page
    pub next_token: Option<String>,
}

/// Prefix-addressed remote object store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn list(&self, prefix: &str, continuation: Option<&str>) -> Result<ListPage>;
    async fn get(&self, key: &str) -> Result<Bytes>;
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;
    async fn copy(&self, src: &str, dst: &str) -> Result<()>;
}

/// Backend selection
#[derive(Debug, Clone)]
pub enum StoreConfig {
    /// S3 or an S3-compatible service. Credentials come from the `AWS_*` env.
    S3 {
        bucket: String,
        region: Option<String>,
        endpoint: Option<String>,
    },
    /// Process-local store, for development and tests
    Memory,
}

/// [`RemoteStore`] over any `object_store` backend.
///
/// The continuation token is the last key of the previous page, which both
/// supported backends honour through their ordered `list_with_offset`.
pub struct ObjectStoreBackend {
    inner: Arc<dyn ObjectStore>,
    page_size: usize,
}

impl ObjectStoreBackend {
    pub fn new(inner: Arc<dyn ObjectStore>, page_size: usize) -> Self {
        Self {
            inner,
            page_size: page_size.max(1),
        }
    }

    pub fn from_config(config: &StoreConfig, page_size: usize) -> Result<Self> {
        let inner: Arc<dyn ObjectStore> = match config {
            StoreConfig::Memory => Arc::new(InMemory::new()),
            StoreConfig::S3 {
                bucket,
                region,
                endpoint,
            } => {
                let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
                if let Some(region) = region {
                    builder = builder.with_region(region);
                }
                if let Some(endpoint) = endpoint {
                    builder = builder
                        .with_endpoint(endpoint)
                        .with_allow_http(endpoint.starts_with("http://"));
                }
                Arc::new(builder.build()?)
            }
        };
        Ok(Self::new(inner, page_size))
    }
}

fn object_path(key: &str) -> Result<ObjectPath> {
    ObjectPath::parse(key).map_err(|e| StorageError::InvalidKey {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn map_not_found(key: &str, err: object_store::Error) -> StorageError {
    match err {
        object_store::Error::NotFound { .. } => StorageError::NotFound(key.to_string()),
        other => StorageError::Backend(other),
    }
}

#[async_trait]
impl RemoteStore for ObjectStoreBackend {
    async fn list(&self, prefix: &str, continuation: Option<&str>) -> Result<ListPage> {
        let prefix_path = object_path(prefix)?;
        let stream = match continuation {
            Some(token) => {
                let offset = object_path(token)?;
                self.inner.list_with_offset(Some(&prefix_path), &offset)
            }
            None => self.inner.list(Some(&prefix_path)),
        };

        // Read one entry past the page to learn whether another page exists.
        let mut metas: Vec<_> = stream.take(self.page_size + 1).try_collect().await?;
        let more = metas.len() > self.page_size;
        metas.truncate(self.page_size);

        let keys: Vec<String> = metas.into_iter().map(|m| m.location.to_string()).collect();
        let next_token = if more { keys.last().cloned() } else { None };
        Ok(ListPage { keys, next_token })
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = object_path(key)?;
        let result = self
            .inner
            .get(&path)
            .await
            .map_err(|e| map_not_found(key, e))?;
        Ok(result.bytes().await?)
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = object_path(key)?;
        self.inner.put(&path, PutPayload::from(data)).await?;
        Ok(())
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let from = object_path(src)?;
        let to = object_path(dst)?;
        self.inner
            .copy(&from, &to)
            .await
            .map_err(|e| map_not_found(src, e))
    }
}

/// Join a prefix and a relative path with exactly one `/` between them.
pub fn join_key(prefix: &str, relative: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let relative = relative.trim_start_matches('/');
    if prefix.is_empty() {
        relative.to_string()
    } else if relative.is_empty() {
        prefix.to_string()
    } else {
        format!("{prefix}/{relative}")
    }
}

/// The part of `key` below `prefix`, or `None` when the key is outside it.
fn relative_key<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    let prefix = prefix.trim_end_matches('/');
    let rest = key.strip_prefix(prefix)?;
    if prefix.is_empty() {
        return Some(rest);
    }
    rest.strip_prefix('/')
}

/// Folder-level operations over a [`RemoteStore`]. Cheap to clone.
#[derive(Clone)]
pub struct StorageClient {
    store: Arc<dyn RemoteStore>,
}

impl StorageClient {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self { store }
    }

    /// Copy every object under `src_prefix` to the same suffix under
    /// `dst_prefix`. An empty source is a no-op. The first failed copy aborts
    /// the operation.
    pub async fn copy_prefix(&self, src_prefix: &str, dst_prefix: &str) -> Result<usize> {
        let mut token: Option<String> = None;
        let mut copied = 0usize;

        loop {
            let page = self.store.list(src_prefix, token.as_deref()).await?;

            let copies = page.keys.iter().filter_map(|key| {
                let rel = relative_key(src_prefix, key)?;
                let dst = join_key(dst_prefix, rel);
                Some(async move {
                    self.store.copy(key, &dst).await?;
                    debug!(
                        component = "storage",
                        event = "storage.copy.object",
                        src = %key,
                        dst = %dst,
                        "Copied object"
                    );
                    Ok::<_, StorageError>(())
                })
            });
            copied += try_join_all(copies).await?.len();

            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        if copied == 0 {
            info!(
                component = "storage",
                event = "storage.copy.empty_source",
                src = %src_prefix,
                "No objects found to copy"
            );
        } else {
            info!(
                component = "storage",
                event = "storage.copy.completed",
                src = %src_prefix,
                dst = %dst_prefix,
                objects = copied,
                "Copied prefix"
            );
        }
        Ok(copied)
    }

    /// Mirror every object under `prefix` into `local_root`, creating parent
    /// directories as needed. Returns the number of files written.
    ///
    /// Zero-byte objects are written last. One that lands on a path the pull
    /// already made into a directory is a folder placeholder (`src/` lists as
    /// `src`) and is skipped.
    pub async fn pull(&self, prefix: &str, local_root: &Path) -> Result<usize> {
        let mut token: Option<String> = None;
        let mut pulled = 0usize;
        let mut empty: Vec<String> = Vec::new();

        loop {
            let page = self.store.list(prefix, token.as_deref()).await?;

            let downloads = page
                .keys
                .iter()
                .filter(|key| !key.ends_with('/'))
                .filter_map(|key| Some((key, relative_key(prefix, key)?)))
                .filter(|(_, rel)| !rel.is_empty())
                .map(|(key, rel)| async move {
                    let data = self.store.get(key).await?;
                    if data.is_empty() {
                        return Ok::<_, StorageError>(Some(rel.to_string()));
                    }
                    write_local(local_root, rel, &data).await?;
                    debug!(
                        component = "storage",
                        event = "storage.pull.object",
                        key = %key,
                        bytes = data.len(),
                        "Downloaded object"
                    );
                    Ok(None)
                });
            for deferred in try_join_all(downloads).await? {
                match deferred {
                    Some(rel) => empty.push(rel),
                    None => pulled += 1,
                }
            }

            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        // Deepest first, so a placeholder's children exist before it is checked.
        empty.sort();
        for rel in empty.iter().rev() {
            if is_local_dir(local_root, rel).await {
                debug!(
                    component = "storage",
                    event = "storage.pull.placeholder_skipped",
                    prefix = %prefix,
                    path = %rel,
                    "Skipped folder placeholder"
                );
                continue;
            }
            write_local(local_root, rel, &[]).await?;
            pulled += 1;
        }

        info!(
            component = "storage",
            event = "storage.pull.completed",
            prefix = %prefix,
            local_root = %local_root.display(),
            objects = pulled,
            "Pulled prefix"
        );
        Ok(pulled)
    }

    /// Upload one object at `prefix + relative_path`.
    pub async fn put(&self, prefix: &str, relative_path: &str, data: Bytes) -> Result<()> {
        let key = join_key(prefix, relative_path);
        let size = data.len();
        self.store.put(&key, data).await?;
        debug!(
            component = "storage",
            event = "storage.put",
            key = %key,
            bytes = size,
            "Uploaded object"
        );
        Ok(())
    }

    /// True when at least one object exists under `prefix`.
    pub async fn has_objects(&self, prefix: &str) -> Result<bool> {
        let page = self.store.list(prefix, None).await?;
        Ok(!page.keys.is_empty())
    }
}

async fn write_local(local_root: &Path, rel: &str, data: &[u8]) -> Result<()> {
    workspace_fs::write_file(local_root, rel, data)
        .await
        .map_err(|source| StorageError::Local {
            path: rel.to_string(),
            source,
        })
}

async fn is_local_dir(local_root: &Path, rel: &str) -> bool {
    let Ok(path) = RelPath::parse(rel) else {
        return false;
    };
    tokio::fs::metadata(path.resolve(local_root))
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) fn memory_client(page_size: usize) -> (StorageClient, Arc<ObjectStoreBackend>) {
        let backend = Arc::new(ObjectStoreBackend::new(Arc::new(InMemory::new()), page_size));
        (StorageClient::new(backend.clone()), backend)
    }

    pub(crate) async fn seed(store: &dyn RemoteStore, objects: &[(&str, &str)]) {
        for (key, body) in objects {
            store
                .put(key, Bytes::from(body.to_string()))
                .await
                .unwrap();
        }
    }

    async fn all_keys(store: &dyn RemoteStore, prefix: &str) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        let mut token = None;
        loop {
            let page = store.list(prefix, token.as_deref()).await.unwrap();
            keys.extend(page.keys);
            match page.next_token {
                Some(t) => token = Some(t),
                None => return keys,
            }
        }
    }

    /// Wraps a store, counts list calls and fails copies of one key.
    struct FlakyStore {
        inner: Arc<ObjectStoreBackend>,
        fail_copy_of: Option<String>,
        placeholders: Vec<String>,
        lists: AtomicUsize,
    }

    #[async_trait]
    impl RemoteStore for FlakyStore {
        async fn list(&self, prefix: &str, continuation: Option<&str>) -> Result<ListPage> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            let mut page = self.inner.list(prefix, continuation).await?;
            if continuation.is_none() {
                page.keys.extend(self.placeholders.iter().cloned());
            }
            Ok(page)
        }
        async fn get(&self, key: &str) -> Result<Bytes> {
            self.inner.get(key).await
        }
        async fn put(&self, key: &str, data: Bytes) -> Result<()> {
            self.inner.put(key, data).await
        }
        async fn copy(&self, src: &str, dst: &str) -> Result<()> {
            if self.fail_copy_of.as_deref() == Some(src) {
                return Err(StorageError::NotFound(src.to_string()));
            }
            self.inner.copy(src, dst).await
        }
    }

    #[test]
    fn joins_keys_with_single_separator() {
        assert_eq!(join_key("code/alice/p1", "/index.js"), "code/alice/p1/index.js");
        assert_eq!(join_key("code/alice/p1/", "src/a.rs"), "code/alice/p1/src/a.rs");
        assert_eq!(relative_key("code/a/p", "code/a/p/x/y"), Some("x/y"));
        assert_eq!(relative_key("code/a/p", "code/a/p1/x"), None);
    }

    #[tokio::test]
    async fn list_follows_continuation_tokens() {
        let (_, backend) = memory_client(2);
        seed(
            backend.as_ref(),
            &[
                ("base/node/a", "1"),
                ("base/node/b", "2"),
                ("base/node/c", "3"),
                ("base/node/d", "4"),
                ("base/node/e", "5"),
                ("base/python/z", "x"),
            ],
        )
        .await;

        let first = backend.list("base/node", None).await.unwrap();
        assert_eq!(first.keys, vec!["base/node/a", "base/node/b"]);
        assert_eq!(first.next_token.as_deref(), Some("base/node/b"));

        let keys = all_keys(backend.as_ref(), "base/node").await;
        assert_eq!(keys.len(), 5);
        assert!(keys.iter().all(|k| k.starts_with("base/node/")));
    }

    #[tokio::test]
    async fn copy_prefix_spans_pages_and_is_idempotent() {
        let (client, backend) = memory_client(2);
        seed(
            backend.as_ref(),
            &[
                ("base/node/index.js", "console.log(0)"),
                ("base/node/package.json", "{}"),
                ("base/node/src/app.js", "app"),
            ],
        )
        .await;

        assert_eq!(client.copy_prefix("base/node", "code/alice/proj1").await.unwrap(), 3);
        let once = all_keys(backend.as_ref(), "code/alice/proj1").await;

        client.copy_prefix("base/node", "code/alice/proj1").await.unwrap();
        let twice = all_keys(backend.as_ref(), "code/alice/proj1").await;

        assert_eq!(once, twice);
        assert_eq!(
            once.into_iter().collect::<Vec<_>>(),
            vec![
                "code/alice/proj1/index.js",
                "code/alice/proj1/package.json",
                "code/alice/proj1/src/app.js",
            ]
        );
        assert_eq!(
            backend.get("code/alice/proj1/src/app.js").await.unwrap(),
            Bytes::from("app")
        );
    }

    #[tokio::test]
    async fn copy_prefix_of_empty_source_is_noop() {
        let (client, backend) = memory_client(10);
        assert_eq!(client.copy_prefix("base/none", "code/alice/p").await.unwrap(), 0);
        assert!(all_keys(backend.as_ref(), "code").await.is_empty());
    }

    #[tokio::test]
    async fn copy_failure_aborts_operation() {
        let (_, backend) = memory_client(1);
        seed(
            backend.as_ref(),
            &[("base/node/a", "1"), ("base/node/b", "2"), ("base/node/c", "3")],
        )
        .await;
        let flaky = Arc::new(FlakyStore {
            inner: backend.clone(),
            fail_copy_of: Some("base/node/b".to_string()),
            placeholders: Vec::new(),
            lists: AtomicUsize::new(0),
        });
        let client = StorageClient::new(flaky.clone());

        let err = client.copy_prefix("base/node", "code/alice/p").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
        // Page size 1: pages for a and b were listed, c never was.
        assert_eq!(flaky.lists.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn pull_writes_objects_and_skips_placeholders() {
        let (_, backend) = memory_client(2);
        seed(
            backend.as_ref(),
            &[
                ("code/alice/p/index.js", "console.log(1)"),
                ("code/alice/p/src/lib/util.js", "util"),
                ("code/alice/p/README.md", "# p"),
                ("code/alice/p2/other.js", "nope"),
            ],
        )
        .await;
        let flaky = Arc::new(FlakyStore {
            inner: backend,
            fail_copy_of: None,
            placeholders: vec!["code/alice/p/empty/".to_string()],
            lists: AtomicUsize::new(0),
        });
        let client = StorageClient::new(flaky);
        let dir = tempfile::tempdir().unwrap();

        assert_eq!(client.pull("code/alice/p", dir.path()).await.unwrap(), 3);

        assert_eq!(
            std::fs::read_to_string(dir.path().join("index.js")).unwrap(),
            "console.log(1)"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("src/lib/util.js")).unwrap(),
            "util"
        );
        assert!(!dir.path().join("empty").exists());
        assert!(!dir.path().join("other.js").exists());
    }

    #[tokio::test]
    async fn pull_skips_placeholders_listed_by_the_backend() {
        let (client, backend) = memory_client(1);
        seed(
            backend.as_ref(),
            &[
                ("code/alice/p/src/", ""),
                ("code/alice/p/src/app.js", "app"),
                ("code/alice/p/src/lib/", ""),
                ("code/alice/p/src/lib/util.js", "util"),
                ("code/alice/p/.gitkeep", ""),
            ],
        )
        .await;
        // The trailing slash does not survive the store.
        let keys = all_keys(backend.as_ref(), "code/alice/p").await;
        assert!(keys.contains("code/alice/p/src"));

        let dir = tempfile::tempdir().unwrap();
        assert_eq!(client.pull("code/alice/p", dir.path()).await.unwrap(), 3);

        assert!(dir.path().join("src").is_dir());
        assert!(dir.path().join("src/lib").is_dir());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("src/app.js")).unwrap(),
            "app"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("src/lib/util.js")).unwrap(),
            "util"
        );
        assert_eq!(std::fs::metadata(dir.path().join(".gitkeep")).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn put_joins_prefix_and_path() {
        let (client, backend) = memory_client(10);
        client
            .put("code/alice/p", "/index.js", Bytes::from("x"))
            .await
            .unwrap();
        assert_eq!(
            backend.get("code/alice/p/index.js").await.unwrap(),
            Bytes::from("x")
        );
        assert!(client.has_objects("code/alice/p").await.unwrap());
        assert!(!client.has_objects("code/alice/q").await.unwrap());
    }

    #[tokio::test]
    async fn get_missing_object_is_not_found() {
        let (_, backend) = memory_client(10);
        let err = backend.get("code/nope").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }
}
