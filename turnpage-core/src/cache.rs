use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use url::form_urlencoded::byte_serialize;

use crate::DocumentId;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Bookmarks(DocumentId),
    Locations(DocumentId),
    LastRead(DocumentId),
    /// Annotations of a preview session; authoritative in preview mode.
    PreviewAnnotations(DocumentId),
    /// Last-known-good mirror of the remote annotation list.
    Annotations(DocumentId),
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Bookmarks(id) => write!(f, "{}:bookmarks", id),
            CacheKey::Locations(id) => write!(f, "{}:locations", id),
            CacheKey::LastRead(id) => write!(f, "{}:lastread", id),
            CacheKey::PreviewAnnotations(id) => write!(f, "preview_annotations_{}", id),
            CacheKey::Annotations(id) => write!(f, "{}:annotations", id),
        }
    }
}

/// Key-value store that survives restarts.
pub trait LocalCache: Send + Sync {
    fn get(&self, key: &CacheKey) -> Result<Option<String>>;
    fn set(&self, key: &CacheKey, value: &str) -> Result<()>;
    fn remove(&self, key: &CacheKey) -> Result<()>;
}

pub struct FileCache {
    root: PathBuf,
}

impl FileCache {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create cache directory at {:?}", root))?;
        Ok(Self { root })
    }

    /// Percent-encodes the key so distinct keys never share a file.
    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        let name: String = byte_serialize(key.to_string().as_bytes()).collect();
        self.root.join(format!("{}.entry", name))
    }
}

impl LocalCache for FileCache {
    fn get(&self, key: &CacheKey) -> Result<Option<String>> {
        let path = self.entry_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let mut file =
            File::open(&path).with_context(|| format!("failed to open cache entry {:?}", path))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)
            .with_context(|| format!("failed to read cache entry {:?}", path))?;
        Ok(Some(buf))
    }

    fn set(&self, key: &CacheKey, value: &str) -> Result<()> {
        let path = self.entry_path(key);
        let tmp = path.with_extension("entry.tmp");
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to open temp cache entry {:?}", tmp))?;
        file.write_all(value.as_bytes())?;
        file.flush()?;
        fs::rename(tmp, path)?;
        Ok(())
    }

    fn remove(&self, key: &CacheKey) -> Result<()> {
        let path = self.entry_path(key);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove cache entry {:?}", path))?;
        }
        Ok(())
    }
}

pub struct MemoryCache {
    inner: Mutex<HashMap<String, String>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalCache for MemoryCache {
    fn get(&self, key: &CacheKey) -> Result<Option<String>> {
        Ok(self.inner.lock().get(&key.to_string()).cloned())
    }

    fn set(&self, key: &CacheKey, value: &str) -> Result<()> {
        self.inner.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &CacheKey) -> Result<()> {
        self.inner.lock().remove(&key.to_string());
        Ok(())
    }
}
