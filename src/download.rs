//! Resumable HTTP downloads (the `basic` and `http-range` download adapters).
//!
//! A download streams into `<oid>.tmp` in the adapter's temp directory. If
//! that file already exists it is resumed: its bytes are re-hashed and the
//! rest is requested with a `Range` header. The finished file is verified
//! against the OID and then atomically renamed to its destination.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::adapter::TransferImpl;
use crate::gate::AuthSignal;
use crate::http::{self, HttpClient};
use crate::oid::{ContentHasher, HashingReader};
use crate::progress::{self, ProgressCallback};
use crate::storage::{self, ObjectStore};
use crate::{Error, ObjectRef, Result};

/// Name of the default adapter.
pub const BASIC_ADAPTER_NAME: &str = "basic";

/// Name of the download-only Range adapter.
pub const HTTP_RANGE_ADAPTER_NAME: &str = "http-range";

/// Where a download adapter keeps its partial files. Each adapter owns its
/// directory since `clear_temp_storage` deletes it.
#[derive(Debug, Clone)]
enum PartialDir {
    /// `<root>/incomplete`, shared with other repository-local tooling.
    Incomplete,
    /// `<root>/tmp/<name>`.
    Scratch(&'static str),
}

/// Resumable download strategy.
#[derive(Clone)]
pub struct ResumableDownload {
    http: HttpClient,
    store: ObjectStore,
    partial_dir: PartialDir,
}

impl ResumableDownload {
    /// The `basic` download strategy, resuming from `<root>/incomplete`.
    pub fn basic(http: HttpClient, store: ObjectStore) -> Self {
        ResumableDownload {
            http,
            store,
            partial_dir: PartialDir::Incomplete,
        }
    }

    /// The `http-range` download strategy with its own partial directory.
    pub fn http_range(http: HttpClient, store: ObjectStore) -> Self {
        ResumableDownload {
            http,
            store,
            partial_dir: PartialDir::Scratch(HTTP_RANGE_ADAPTER_NAME),
        }
    }

    fn temp_dir(&self) -> Result<PathBuf> {
        match self.partial_dir {
            PartialDir::Incomplete => self.store.incomplete_dir(),
            PartialDir::Scratch(name) => {
                let dir = self.store.temp_dir()?.join(name);
                fs::create_dir_all(&dir)?;
                Ok(dir)
            }
        }
    }

    fn temp_dir_path(&self) -> PathBuf {
        match self.partial_dir {
            PartialDir::Incomplete => self.store.root().join("incomplete"),
            PartialDir::Scratch(name) => self.store.root().join("tmp").join(name),
        }
    }

    /// Path of the partial file for an object. Not a random temp name since
    /// it has to be found again to resume.
    pub fn partial_path(&self, object: &ObjectRef) -> Result<PathBuf> {
        Ok(self.temp_dir()?.join(format!("{}.tmp", object.oid())))
    }

    fn download(
        &self,
        object: &ObjectRef,
        progress: Option<&ProgressCallback>,
        auth: &mut AuthSignal<'_>,
    ) -> Result<()> {
        let link = object
            .link()
            .ok_or_else(|| Error::NotFound(format!("no download action for {}", object.oid())))?;

        let mut partial = PartialDownload::open(&self.partial_path(object)?)?;

        let response = loop {
            let mut req = self.http.request("GET", link)?;
            if partial.offset > 0 {
                // Be specific since the length is known.
                let range = format!("bytes={}-{}", partial.offset, object.size().saturating_sub(1));
                req = req.set("Range", &range);
            }

            let response = match req.call() {
                Ok(response) => response,
                Err(ureq::Error::Status(416, _)) if partial.offset > 0 => {
                    tracing::debug!(
                        "xfer: server rejected resume download request for {} from byte {}; re-downloading from start",
                        object.oid(),
                        partial.offset
                    );
                    partial = partial.restart()?;
                    continue;
                }
                Err(ureq::Error::Status(429, response)) => {
                    return Err(http::too_many_requests("GET", link, response))
                }
                Err(e) => return Err(Error::retriable(e)),
            };

            if partial.offset == 0 {
                break response;
            }

            match check_range_response(&response, partial.offset) {
                Ok(()) => {
                    tracing::debug!(
                        "xfer: server accepted resume download request: {} from byte {}",
                        object.oid(),
                        partial.offset
                    );
                    progress::advance_progress(progress, object, partial.offset)?;
                    break response;
                }
                Err(reason) => {
                    tracing::debug!(
                        "xfer: failed to resume download for {} from byte {}: {}. Re-downloading from start",
                        object.oid(),
                        partial.offset,
                        reason
                    );
                    partial = partial.restart()?;
                    // A 200 means the server ignored the Range header and is
                    // sending everything, so use this body from byte 0.
                    if response.status() == 200 {
                        break response;
                    }
                }
            }
        };

        // Free up the other workers before the body is transferred.
        auth.signal();

        let PartialDownload {
            mut file,
            path,
            hasher,
            offset,
        } = partial;

        let mut body = HashingReader::with_hasher(response.into_reader(), hasher);
        let written = progress::copy_with_callback(
            &mut file,
            &mut body,
            object.size(),
            progress::object_callback(progress, object, offset),
        )
        .map_err(|e| match e {
            Error::Io(io) => Error::Io(io::Error::new(
                io.kind(),
                format!("cannot write data to tempfile {}: {}", path.display(), io),
            )),
            other => other,
        })?;
        file.flush()?;
        drop(file);

        let actual = body.finish();
        if &actual != object.oid() {
            return Err(Error::Integrity {
                expected: object.oid().to_hex(),
                actual: actual.to_hex(),
                written: offset + written,
            });
        }

        match storage::rename_copy_permissions(&path, object.path()) {
            // Another process may have published it first.
            Err(_) if object.path().exists() => {
                let _ = fs::remove_file(&path);
                Ok(())
            }
            result => result,
        }
    }
}

impl TransferImpl for ResumableDownload {
    type Context = ();

    fn worker_starting(&self, _worker: usize) -> Result<()> {
        Ok(())
    }

    fn do_transfer(
        &self,
        _ctx: &mut (),
        object: &ObjectRef,
        progress: Option<&ProgressCallback>,
        auth: &mut AuthSignal<'_>,
    ) -> Result<()> {
        self.download(object, progress, auth)
    }

    fn clear_temp_storage(&self) -> Result<()> {
        storage::remove_dir_all(&self.temp_dir_path())
    }
}

/// A partial file for one object, opened for writing at its end, plus the
/// hash of the bytes already in it.
struct PartialDownload {
    file: File,
    path: PathBuf,
    hasher: ContentHasher,
    offset: u64,
}

impl PartialDownload {
    /// Open an existing partial file for resume or create a new one.
    ///
    /// Opening read/write acts as the lock rather than a separate existence
    /// check, which would race with other processes. A fresh file is created
    /// exclusively so a concurrent creator makes this fail.
    fn open(path: &Path) -> Result<Self> {
        match OpenOptions::new().read(true).write(true).open(path) {
            Ok(mut file) => {
                let mut hasher = ContentHasher::new();
                let offset = hasher.preload(&mut file)?;
                tracing::debug!("xfer: attempting to resume download of {} from byte {}", path.display(), offset);
                Ok(PartialDownload {
                    file,
                    path: path.to_path_buf(),
                    hasher,
                    offset,
                })
            }
            Err(_) => {
                let file = OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(path)?;
                Ok(PartialDownload::fresh(file, path))
            }
        }
    }

    /// Throw the partial content away and start again from byte 0.
    fn restart(self) -> Result<Self> {
        let PartialDownload { file, path, .. } = self;
        drop(file);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io(e)),
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(PartialDownload::fresh(file, &path))
    }

    fn fresh(file: File, path: &Path) -> Self {
        PartialDownload {
            file,
            path: path.to_path_buf(),
            hasher: ContentHasher::new(),
            offset: 0,
        }
    }
}

/// A ranged request must come back as 206 with a `Content-Range` starting at
/// `from_byte`. Returns why it does not otherwise.
fn check_range_response(response: &ureq::Response, from_byte: u64) -> std::result::Result<(), String> {
    if response.status() != 206 {
        return Err(format!("expected status code 206, received {}", response.status()));
    }
    let header = response
        .header("Content-Range")
        .ok_or_else(|| "missing Content-Range header in response".to_string())?;
    match content_range_start(header) {
        Some(start) if start == from_byte => Ok(()),
        Some(start) => Err(format!(
            "Content-Range start byte incorrect: {start} expected {from_byte}"
        )),
        None => Err(format!("badly formatted Content-Range header: {header:?}")),
    }
}

fn content_range_start(header: &str) -> Option<u64> {
    let (start, _) = header.trim().strip_prefix("bytes ")?.split_once('-')?;
    start.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Link, Oid};
    use tempfile::TempDir;

    #[test]
    fn test_content_range_start() {
        assert_eq!(content_range_start("bytes 100-199/200"), Some(100));
        assert_eq!(content_range_start("bytes 0-0/*"), Some(0));
        assert_eq!(content_range_start("bytes */200"), None);
        assert_eq!(content_range_start("items 1-2/3"), None);
    }

    #[test]
    fn test_partial_open_resumes_existing_bytes() {
        let td = TempDir::new().unwrap();
        let path = td.path().join("x.tmp");
        fs::write(&path, b"hello ").unwrap();

        let mut partial = PartialDownload::open(&path).unwrap();
        assert_eq!(partial.offset, 6);
        partial.file.write_all(b"world").unwrap();
        let oid = partial.hasher.clone();
        drop(partial);

        assert_eq!(fs::read(&path).unwrap(), b"hello world");
        assert_eq!(oid.finish(), Oid::from_content(b"hello "));
    }

    #[test]
    fn test_partial_restart_truncates() {
        let td = TempDir::new().unwrap();
        let path = td.path().join("y.tmp");
        fs::write(&path, b"stale").unwrap();

        let partial = PartialDownload::open(&path).unwrap().restart().unwrap();
        assert_eq!(partial.offset, 0);
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_partial_dirs_are_separate() {
        let td = TempDir::new().unwrap();
        let store = ObjectStore::new(td.path());
        let object = ObjectRef::new("a", Oid::from_content(b"a"), 1, td.path().join("a"))
            .with_link(Link::new("http://localhost/a"));

        let basic = ResumableDownload::basic(HttpClient::default(), store.clone());
        let range = ResumableDownload::http_range(HttpClient::default(), store);

        let basic_path = basic.partial_path(&object).unwrap();
        let range_path = range.partial_path(&object).unwrap();
        assert!(basic_path.starts_with(td.path().join("incomplete")));
        assert!(range_path.starts_with(td.path().join("tmp").join("http-range")));
        assert!(basic_path.to_string_lossy().ends_with(&format!("{}.tmp", object.oid())));

        range.clear_temp_storage().unwrap();
        assert!(!td.path().join("tmp").join("http-range").exists());
        assert!(td.path().join("incomplete").exists());
    }
}
