//! Directory-backed [`ObjectStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use super::{ObjectMeta, ObjectStore};
use crate::error::StoreError;

/// Object keys are `/`-separated paths relative to `root`.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
            });
        }
        Ok(self.root.join(relative))
    }
}

/// Write to a `.tmp` sibling, then rename over the target.
fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn list_blocking(
    root: &Path,
    prefix: &str,
    since: Option<DateTime<Utc>>,
) -> Result<Vec<ObjectMeta>, StoreError> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut objects = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| StoreError::Io(io::Error::other(e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if !key.starts_with(prefix) || key.ends_with(".tmp") {
            continue;
        }
        let metadata = entry
            .metadata()
            .map_err(|e| StoreError::Io(io::Error::other(e)))?;
        let modified: DateTime<Utc> = metadata.modified()?.into();
        if since.is_some_and(|s| modified < s) {
            continue;
        }
        objects.push(ObjectMeta {
            key,
            size: metadata.len(),
            modified,
        });
    }
    objects.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.key.cmp(&b.key)));
    Ok(objects)
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn list_since(
        &self,
        prefix: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ObjectMeta>, StoreError> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || list_blocking(&root, &prefix, since))
            .await
            .map_err(|e| StoreError::Task {
                message: e.to_string(),
            })?
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::ObjectNotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.resolve(key)?;
        let data = bytes.to_vec();
        tokio::task::spawn_blocking(move || atomic_write(&path, &data))
            .await
            .map_err(|e| StoreError::Task {
                message: e.to_string(),
            })??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());
        store.put("raw/a.csv", b"x,y\n1,2\n").await.unwrap();
        assert_eq!(store.get("raw/a.csv").await.unwrap(), b"x,y\n1,2\n");
        assert!(!dir.path().join("raw/a.csv.tmp").exists());
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());
        store.put("a.json", b"[]").await.unwrap();
        store.put("a.json", b"[{}]").await.unwrap();
        assert_eq!(store.get("a.json").await.unwrap(), b"[{}]");
    }

    #[tokio::test]
    async fn test_get_missing() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let err = store.get("nope.csv").await.unwrap_err();
        assert!(matches!(err, StoreError::ObjectNotFound { .. }));
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());
        assert!(matches!(
            store.put("../evil.csv", b"x").await.unwrap_err(),
            StoreError::InvalidKey { .. }
        ));
        assert!(matches!(
            store.get("/etc/passwd").await.unwrap_err(),
            StoreError::InvalidKey { .. }
        ));
    }

    #[tokio::test]
    async fn test_list_filters_prefix_and_time() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());
        store.put("sensor_data/d1/a.csv", b"1").await.unwrap();
        store.put("sensor_data/d2/b.csv", b"22").await.unwrap();
        store.put("logs/c.json", b"{}").await.unwrap();

        let all = store.list_since("sensor_data/", None).await.unwrap();
        let keys: Vec<_> = all.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&"sensor_data/d1/a.csv"));
        assert_eq!(
            all.iter().find(|o| o.key.ends_with("b.csv")).unwrap().size,
            2
        );

        let future = Utc::now() + chrono::Duration::hours(1);
        assert!(store.list_since("", Some(future)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_missing_root_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path().join("absent"));
        assert!(store.list_since("", None).await.unwrap().is_empty());
    }
}
