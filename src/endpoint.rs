//! Blob-store abstraction: the builder only ever needs whole-object
//! get/put plus existence checks, so anything from a local directory to an
//! object store can back an endpoint.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};

/// A byte-level key/value store with atomic whole-object put.
pub trait Store: Send + Sync {
    fn get(&self, path: &str) -> Result<Vec<u8>>;
    fn put(&self, path: &str, data: &[u8]) -> Result<()>;
    /// Object size, or None if absent.
    fn size(&self, path: &str) -> Option<u64>;

    /// Ranged read; stores without range support serve the full object.
    fn get_range(&self, path: &str, start: u64, end: Option<u64>) -> Result<Vec<u8>> {
        let data = self.get(path)?;
        let start = start.min(data.len() as u64) as usize;
        let end = end
            .map(|e| e.min(data.len() as u64) as usize)
            .unwrap_or(data.len());
        Ok(data[start..end.max(start)].to_vec())
    }

    /// The filesystem path of an object, when the store is a local
    /// directory. Readers use this to skip staging copies.
    fn local_path(&self, _path: &str) -> Option<PathBuf> {
        None
    }
}

/// A plain directory.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new<P: AsRef<Path>>(root: P) -> LocalStore {
        LocalStore {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

impl Store for LocalStore {
    fn get(&self, path: &str) -> Result<Vec<u8>> {
        fs::read(self.resolve(path)).map_err(|e| Error::Io(format!("get {path}: {e}")))
    }

    fn put(&self, path: &str, data: &[u8]) -> Result<()> {
        let dst = self.resolve(path);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::Io(format!("mkdir {path}: {e}")))?;
        }

        // Write-then-rename so a concurrent reader never sees a partial
        // object.
        let tmp = dst.with_extension(format!(
            "{}.tmp",
            dst.extension().and_then(|e| e.to_str()).unwrap_or("part")
        ));
        let mut f =
            fs::File::create(&tmp).map_err(|e| Error::Io(format!("create {path}: {e}")))?;
        f.write_all(data)
            .and_then(|_| f.sync_all())
            .map_err(|e| Error::Io(format!("write {path}: {e}")))?;
        fs::rename(&tmp, &dst).map_err(|e| Error::Io(format!("commit {path}: {e}")))
    }

    fn size(&self, path: &str) -> Option<u64> {
        fs::metadata(self.resolve(path)).ok().map(|m| m.len())
    }

    fn local_path(&self, path: &str) -> Option<PathBuf> {
        let p = self.resolve(path);
        p.exists().then_some(p)
    }
}

/// An in-memory store, for tests and dry runs.
#[derive(Default)]
pub struct MemStore {
    objects: parking_lot::RwLock<std::collections::HashMap<String, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> MemStore {
        MemStore::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl Store for MemStore {
    fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::Io(format!("get {path}: not found")))
    }

    fn put(&self, path: &str, data: &[u8]) -> Result<()> {
        self.objects.write().insert(path.to_string(), data.to_vec());
        Ok(())
    }

    fn size(&self, path: &str) -> Option<u64> {
        self.objects.read().get(path).map(|d| d.len() as u64)
    }
}

/// A prefixed view into a store.
#[derive(Clone)]
pub struct Endpoint {
    store: Arc<dyn Store>,
    prefix: String,
}

impl Endpoint {
    pub fn new(store: Arc<dyn Store>, prefix: &str) -> Endpoint {
        Endpoint {
            store,
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    pub fn sub(&self, name: &str) -> Endpoint {
        let prefix = if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.prefix, name)
        };
        Endpoint {
            store: self.store.clone(),
            prefix,
        }
    }

    fn join(&self, path: &str) -> String {
        if self.prefix.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.prefix, path)
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.store.get(&self.join(path))
    }

    pub fn put(&self, path: &str, data: &[u8]) -> Result<()> {
        self.store.put(&self.join(path), data)
    }

    pub fn size(&self, path: &str) -> Option<u64> {
        self.store.size(&self.join(path))
    }

    pub fn exists(&self, path: &str) -> bool {
        self.size(path).is_some()
    }

    pub fn get_range(&self, path: &str, start: u64, end: Option<u64>) -> Result<Vec<u8>> {
        self.store.get_range(&self.join(path), start, end)
    }

    pub fn local_path(&self, path: &str) -> Option<PathBuf> {
        self.store.local_path(&self.join(path))
    }
}

/// The fixed set of endpoints a build writes through.
#[derive(Clone)]
pub struct Endpoints {
    pub output: Endpoint,
    pub data: Endpoint,
    pub hierarchy: Endpoint,
    pub sources: Endpoint,
    pub tmp: PathBuf,
}

impl Endpoints {
    pub fn new(store: Arc<dyn Store>, tmp: PathBuf) -> Endpoints {
        let output = Endpoint::new(store, "");
        Endpoints {
            data: output.sub("ept-data"),
            hierarchy: output.sub("ept-hierarchy"),
            sources: output.sub("ept-sources"),
            output,
            tmp,
        }
    }

    /// Endpoints rooted at a local output directory, scratch space under
    /// the standard temp dir.
    pub fn local<P: AsRef<Path>>(output: P, tmp: Option<PathBuf>) -> Endpoints {
        let tmp = tmp.unwrap_or_else(std::env::temp_dir);
        Endpoints::new(Arc::new(LocalStore::new(output)), tmp)
    }
}
