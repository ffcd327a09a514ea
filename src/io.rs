//! Store I/O helpers: bounded retries with linear back-off, JSON
//! convenience wrappers, and local staging of remote inputs.

use std::io::{Cursor, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::endpoint::{Endpoint, Store};
use crate::error::{Error, Result};

/// Default attempt count for store operations.
pub const RETRY_TRIES: u32 = 8;

fn backoff(tried: u32, message: &str) {
    // Linear back-off should be fine.
    std::thread::sleep(Duration::from_secs(tried as u64));
    if !message.is_empty() {
        log::warn!("Failure #{tried}: {message}");
    }
}

fn with_retry<T, F: FnMut() -> Result<T>>(mut f: F, tries: u32, message: &str) -> Option<T> {
    let mut tried = 0;
    loop {
        match f() {
            Ok(v) => return Some(v),
            Err(_) => {
                tried += 1;
                if tried >= tries {
                    return None;
                }
                backoff(tried, message);
            }
        }
    }
}

pub fn put_with_retry(ep: &Endpoint, path: &str, data: &[u8], tries: u32) -> bool {
    with_retry(
        || ep.put(path, data),
        tries,
        &format!("Failed to put {path}"),
    )
    .is_some()
}

pub fn ensure_put(ep: &Endpoint, path: &str, data: &[u8]) -> Result<()> {
    if put_with_retry(ep, path, data, RETRY_TRIES) {
        Ok(())
    } else {
        Err(Error::Fatal(format!("Failed to put to {path}")))
    }
}

pub fn get_with_retry(ep: &Endpoint, path: &str, tries: u32) -> Option<Vec<u8>> {
    with_retry(|| ep.get(path), tries, &format!("Failed to get {path}"))
}

pub fn ensure_get(ep: &Endpoint, path: &str) -> Result<Vec<u8>> {
    get_with_retry(ep, path, RETRY_TRIES).ok_or_else(|| Error::Fatal(format!("Failed to get {path}")))
}

pub fn ensure_get_json<T: DeserializeOwned>(ep: &Endpoint, path: &str) -> Result<T> {
    Ok(serde_json::from_slice(&ensure_get(ep, path)?)?)
}

pub fn ensure_put_json<T: Serialize>(ep: &Endpoint, path: &str, v: &T, pretty: bool) -> Result<()> {
    let data = if pretty {
        serde_json::to_vec_pretty(v)?
    } else {
        serde_json::to_vec(v)?
    };
    ensure_put(ep, path, &data)
}

/// A file on the local filesystem, deleted on drop when it is a staged
/// scratch copy.
pub struct LocalHandle {
    path: PathBuf,
    temporary: bool,
}

impl LocalHandle {
    pub fn borrowed<P: AsRef<Path>>(path: P) -> LocalHandle {
        LocalHandle {
            path: path.as_ref().to_path_buf(),
            temporary: false,
        }
    }

    pub fn staged(path: PathBuf) -> LocalHandle {
        LocalHandle {
            path,
            temporary: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LocalHandle {
    fn drop(&mut self) {
        if self.temporary {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn stem_of(path: &str) -> String {
    Path::new(path)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("download")
        .to_string()
}

fn stage(tmp: &Path, name: &str, data: &[u8]) -> Result<LocalHandle> {
    std::fs::create_dir_all(tmp)?;
    let mut dst = tempfile::Builder::new()
        .prefix("ept-")
        .suffix(&format!("-{name}"))
        .tempfile_in(tmp)?;
    dst.write_all(data)?;
    let (_, path) = dst.keep().map_err(|e| Error::Io(e.to_string()))?;
    Ok(LocalHandle::staged(path))
}

/// Make `path` readable from the local filesystem, staging a copy into
/// `tmp` when the store cannot hand out a direct path.
pub fn ensure_local_handle(
    store: &Arc<dyn Store>,
    path: &str,
    tmp: &Path,
    tries: u32,
) -> Result<LocalHandle> {
    if let Some(local) = store.local_path(path) {
        return Ok(LocalHandle::borrowed(local));
    }

    let mut tried = 0;
    loop {
        match store.get(path) {
            Ok(data) => return stage(tmp, &stem_of(path), &data),
            Err(e) => {
                tried += 1;
                if tried >= tries {
                    return Err(Error::Input(format!("failed to fetch {path}: {e}")));
                }
                backoff(tried, &format!("Failed to fetch {path}"));
            }
        }
    }
}

const LAS_MAX_HEADER_SIZE: u64 = 375;
const LAS_MINOR_VERSION_POS: u64 = 25;
const LAS_HEADER_SIZE_POS: u64 = 94;
const LAS_POINT_OFFSET_POS: u64 = 96;
const LAS_EVLR_OFFSET_POS: u64 = 235;
const LAS_EVLR_NUMBER_POS: u64 = LAS_EVLR_OFFSET_POS + 8;

/// Fetch only the parts of a remote `.las`/`.laz` file a header preview
/// needs: header plus VLRs, with EVLRs appended directly after them and the
/// header patched to match, skipping the point records entirely.
pub fn shallow_las_handle(
    store: &Arc<dyn Store>,
    path: &str,
    tmp: &Path,
) -> Result<LocalHandle> {
    let head = store.get_range(path, 0, Some(LAS_MAX_HEADER_SIZE))?;
    if head.len() < LAS_HEADER_SIZE_POS as usize + 2 || &head[0..4] != b"LASF" {
        return Err(Error::ShallowInfo(format!(
            "invalid file signature for {path}: must be LASF"
        )));
    }

    let mut cursor = Cursor::new(head);

    cursor.seek(SeekFrom::Start(LAS_MINOR_VERSION_POS))?;
    let minor_version = cursor.read_u8()?;

    cursor.seek(SeekFrom::Start(LAS_HEADER_SIZE_POS))?;
    let header_size = cursor.read_u16::<LittleEndian>()? as u64;

    cursor.seek(SeekFrom::Start(LAS_POINT_OFFSET_POS))?;
    let point_offset = cursor.read_u32::<LittleEndian>()? as u64;

    let mut evlr_offset = 0u64;
    let mut evlr_number = 0u32;
    if minor_version >= 4 {
        cursor.seek(SeekFrom::Start(LAS_EVLR_OFFSET_POS))?;
        evlr_offset = cursor.read_u64::<LittleEndian>()?;
        cursor.seek(SeekFrom::Start(LAS_EVLR_NUMBER_POS))?;
        evlr_number = cursor.read_u32::<LittleEndian>()?;

        // Relocate the EVLRs to land directly after the VLRs, where this
        // synthesized file will put them.
        cursor.seek(SeekFrom::Start(LAS_EVLR_OFFSET_POS))?;
        cursor.write_u64::<LittleEndian>(point_offset)?;
    }

    let head = cursor.into_inner();
    let mut data = head[..(header_size as usize).min(head.len())].to_vec();

    if header_size < point_offset {
        let vlrs = store.get_range(path, header_size, Some(point_offset))?;
        data.extend_from_slice(&vlrs);
    }

    if evlr_number > 0 && evlr_offset > 0 {
        let evlrs = store.get_range(path, evlr_offset, None)?;
        data.extend_from_slice(&evlrs);
    }

    stage(tmp, &stem_of(path), &data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{Endpoints, LocalStore, MemStore};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// A store whose first `failures` gets fail, for retry-path tests.
    struct Flaky {
        inner: MemStore,
        failures: AtomicU32,
    }

    impl Store for Flaky {
        fn get(&self, path: &str) -> Result<Vec<u8>> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::Io(format!("transient failure on {path}")));
            }
            self.inner.get(path)
        }
        fn put(&self, path: &str, data: &[u8]) -> Result<()> {
            self.inner.put(path, data)
        }
        fn size(&self, path: &str) -> Option<u64> {
            self.inner.size(path)
        }
    }

    #[test]
    fn retry_survives_transient_failures() {
        let flaky = Flaky {
            inner: MemStore::new(),
            failures: AtomicU32::new(1),
        };
        flaky.inner.put("blob", b"payload").unwrap();

        let ep = Endpoints::new(Arc::new(flaky), std::env::temp_dir());
        // First attempt fails, the bounded retry recovers.
        assert_eq!(
            get_with_retry(&ep.output, "blob", 3).unwrap(),
            b"payload"
        );
    }

    #[test]
    fn get_with_retry_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let ep = Endpoints::local(dir.path(), None);
        assert!(get_with_retry(&ep.output, "nope.json", 1).is_none());

        ep.output.put("yes.json", b"[]").unwrap();
        assert_eq!(get_with_retry(&ep.output, "yes.json", 1).unwrap(), b"[]");
    }

    #[test]
    fn json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ep = Endpoints::local(dir.path(), None);
        ensure_put_json(&ep.output, "v.json", &vec![1u64, 2, 3], true).unwrap();
        let v: Vec<u64> = ensure_get_json(&ep.output, "v.json").unwrap();
        assert_eq!(v, vec![1, 2, 3]);
    }

    #[test]
    fn local_handle_borrowed_does_not_delete() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("input.las");
        std::fs::write(&file, b"data").unwrap();
        {
            let h = LocalHandle::borrowed(&file);
            assert_eq!(h.path(), file.as_path());
        }
        assert!(file.exists());
    }

    #[test]
    fn staged_handle_deletes_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(LocalStore::new(dir.path()));
        std::fs::write(dir.path().join("remote.bin"), b"payload").unwrap();

        // Force staging by asking a store view that hides local paths.
        struct Opaque(Arc<dyn Store>);
        impl Store for Opaque {
            fn get(&self, path: &str) -> Result<Vec<u8>> {
                self.0.get(path)
            }
            fn put(&self, path: &str, data: &[u8]) -> Result<()> {
                self.0.put(path, data)
            }
            fn size(&self, path: &str) -> Option<u64> {
                self.0.size(path)
            }
        }
        let opaque: Arc<dyn Store> = Arc::new(Opaque(store));

        let staged_path;
        {
            let h = ensure_local_handle(&opaque, "remote.bin", dir.path(), 1).unwrap();
            staged_path = h.path().to_path_buf();
            assert_eq!(std::fs::read(&staged_path).unwrap(), b"payload");
        }
        assert!(!staged_path.exists());
    }
}
