//! Local LFS object store layout.
//!
//! Completed objects live under `<root>/<oid[0:2]>/<oid[2:4]>/<oid>`.
//! Resumable partial downloads live in `<root>/incomplete` and scratch files
//! in `<root>/tmp`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::{Error, Oid, Result};

/// Local store for LFS objects, typically `.git/lfs/objects`.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    /// Create a store rooted at the given path.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        ObjectStore {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Create a store for a repository's `.git/lfs/objects` directory.
    pub fn for_repo<P: AsRef<Path>>(git_dir: P) -> Self {
        ObjectStore::new(git_dir.as_ref().join("lfs").join("objects"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the path where an object with the given OID is stored.
    pub fn object_path(&self, oid: &Oid) -> PathBuf {
        let hex = oid.to_hex();
        self.root.join(&hex[0..2]).join(&hex[2..4]).join(&hex)
    }

    /// Check if an object exists in the store.
    pub fn contains(&self, oid: &Oid) -> bool {
        self.object_path(oid).is_file()
    }

    /// Directory holding partial downloads that may be resumed.
    pub fn incomplete_dir(&self) -> Result<PathBuf> {
        let dir = self.root.join("incomplete");
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Directory for scratch files that are never resumed.
    pub fn temp_dir(&self) -> Result<PathBuf> {
        let dir = self.root.join("tmp");
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

/// Remove a directory tree, treating a missing directory as already clear.
pub(crate) fn remove_dir_all(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Atomically move `src` over `dest`.
///
/// If `dest` already exists its permission bits are applied to `src` first so
/// replacing a file does not change its mode.
pub fn rename_copy_permissions(src: &Path, dest: &Path) -> Result<()> {
    match fs::metadata(dest) {
        Ok(meta) => fs::set_permissions(src, meta.permissions()).map_err(|e| {
            Error::Io(io::Error::new(
                e.kind(),
                format!("can't set filemode on file {}: {}", src.display(), e),
            ))
        })?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        Err(e) => return Err(Error::Io(e)),
    }

    fs::rename(src, dest).map_err(|e| {
        Error::Io(io::Error::new(
            e.kind(),
            format!("cannot replace {} with {}: {}", dest.display(), src.display(), e),
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_object_path() {
        let store = ObjectStore::new("/tmp/lfs/objects");
        let oid = Oid::from_hex("4d7a214614ab2935c943f9e0ff69d22eadbb8f32b1258daaa5e2ca24d17e2393").unwrap();

        let path = store.object_path(&oid);
        assert_eq!(
            path,
            Path::new("/tmp/lfs/objects/4d/7a/4d7a214614ab2935c943f9e0ff69d22eadbb8f32b1258daaa5e2ca24d17e2393")
        );
    }

    #[test]
    fn test_dirs_are_created() {
        let td = TempDir::new().unwrap();
        let store = ObjectStore::for_repo(td.path());

        let incomplete = store.incomplete_dir().unwrap();
        assert!(incomplete.is_dir());
        assert!(incomplete.ends_with("lfs/objects/incomplete"));
        assert!(store.temp_dir().unwrap().is_dir());

        remove_dir_all(&incomplete).unwrap();
        remove_dir_all(&incomplete).unwrap();
        assert!(!incomplete.exists());
    }

    #[test]
    fn test_rename_creates_parents() {
        let td = TempDir::new().unwrap();
        let src = td.path().join("src.tmp");
        fs::write(&src, b"content").unwrap();
        let dest = td.path().join("a").join("b").join("dest");

        rename_copy_permissions(&src, &dest).unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read(&dest).unwrap(), b"content");
    }

    #[cfg(unix)]
    #[test]
    fn test_rename_keeps_existing_mode() {
        use std::os::unix::fs::PermissionsExt;

        let td = TempDir::new().unwrap();
        let src = td.path().join("src.tmp");
        let dest = td.path().join("dest");
        fs::write(&src, b"new").unwrap();
        fs::write(&dest, b"old").unwrap();
        fs::set_permissions(&dest, fs::Permissions::from_mode(0o640)).unwrap();

        rename_copy_permissions(&src, &dest).unwrap();
        let mode = fs::metadata(&dest).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
        assert_eq!(fs::read(&dest).unwrap(), b"new");
    }
}
