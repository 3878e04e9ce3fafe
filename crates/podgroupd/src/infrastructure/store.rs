//! Key-value persistence for pod group snapshots.

use core::error::Error;
use std::collections::BTreeMap;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use tokio::sync::RwLock;

pub type StoreResult<T> = Result<T, Report<StoreError>>;

#[derive(Debug, Display)]
pub enum StoreError {
    #[display("Invalid store key: {key}")]
    InvalidKey { key: String },
    #[display("Failed to read key {key}")]
    Read { key: String },
    #[display("Failed to write key {key}")]
    Write { key: String },
    #[display("Failed to remove key {key}")]
    Remove { key: String },
}

impl Error for StoreError {}

/// Key under which one pod group is persisted
pub fn pod_group_key(root: &str, namespace: &str, name: &str) -> String {
    format!("{}/{namespace}/{name}", pod_group_prefix(root))
}

/// Common prefix of every persisted pod group
pub fn pod_group_prefix(root: &str) -> String {
    format!("{}/pod_groups", root.trim_end_matches('/'))
}

#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn save(&self, key: &str, value: &[u8]) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Removing a missing key succeeds
    async fn remove(&self, key: &str) -> StoreResult<()>;

    /// Every stored key starting with `prefix`, sorted
    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;
}

/// Stores each key as a JSON file below a root directory.
///
/// `/podgroupd/pod_groups/shop/web` lives at `{root}/podgroupd/pod_groups/shop/web.json`.
pub struct FileStore {
    root: PathBuf,
}

const FILE_EXTENSION: &str = "json";

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> StoreResult<PathBuf> {
        let relative = Path::new(key.trim_start_matches('/'));
        let valid = !key.trim_matches('/').is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(Report::new(StoreError::InvalidKey {
                key: key.to_string(),
            }));
        }
        let mut file = relative.as_os_str().to_owned();
        file.push(".");
        file.push(FILE_EXTENSION);
        Ok(self.root.join(file))
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?.to_str()?;
        let relative = relative.strip_suffix(&format!(".{FILE_EXTENSION}"))?;
        Some(format!("/{}", relative.replace(std::path::MAIN_SEPARATOR, "/")))
    }
}

#[async_trait::async_trait]
impl Store for FileStore {
    #[tracing::instrument(skip(self, value), fields(bytes = value.len()))]
    async fn save(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let path = self.path_for(key)?;
        let write_error = || StoreError::Write {
            key: key.to_string(),
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .change_context_lazy(write_error)
                .attach_printable_lazy(|| format!("path: {}", parent.display()))?;
        }

        // write then rename so readers never see a torn file
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value)
            .await
            .change_context_lazy(write_error)
            .attach_printable_lazy(|| format!("path: {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .change_context_lazy(write_error)
            .attach_printable_lazy(|| format!("path: {}", path.display()))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Report::new(e)
                .change_context(StoreError::Read {
                    key: key.to_string(),
                })
                .attach_printable(format!("path: {}", path.display()))),
        }
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Report::new(e)
                .change_context(StoreError::Remove {
                    key: key.to_string(),
                })
                .attach_printable(format!("path: {}", path.display()))),
        }
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let read_error = || StoreError::Read {
            key: prefix.to_string(),
        };
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(Report::new(e)
                        .change_context(read_error())
                        .attach_printable(format!("path: {}", dir.display())))
                }
            };
            while let Some(entry) = entries.next_entry().await.change_context_lazy(read_error)? {
                let path = entry.path();
                let file_type = entry.file_type().await.change_context_lazy(read_error)?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if path.extension().and_then(|e| e.to_str()) == Some(FILE_EXTENSION) {
                    if let Some(key) = self.key_for(&path) {
                        if key.starts_with(prefix) {
                            keys.push(key);
                        }
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

/// Ordered in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following `save` fail until switched off again
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn save(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(Report::new(StoreError::Write {
                key: key.to_string(),
            })
            .attach_printable("writes disabled"));
        }
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .entries
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}
