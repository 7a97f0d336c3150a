//! The extension binary on disk: validation, working copy and content hash.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;

use crate::error::{BridgeError, BridgeResult};

/// Check that `path` names an executable file and canonicalize it.
pub fn resolve(path: &Path) -> BridgeResult<PathBuf> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(BridgeError::NotFound(path.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };

    if !metadata.is_file() || !is_executable(&metadata) {
        return Err(BridgeError::NotExecutable(path.to_path_buf()));
    }

    Ok(fs::canonicalize(path)?)
}

#[cfg(unix)]
fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &fs::Metadata) -> bool {
    true
}

/// Where the running copy of an extension lives.
///
/// The directory is removed when the value is dropped.
#[derive(Debug)]
pub struct WorkingCopy {
    dir: TempDir,
    path: PathBuf,
}

impl WorkingCopy {
    /// Reserve a working location for `origin`, under `parent` or the
    /// system temporary directory.
    pub fn create(origin: &Path, parent: Option<&Path>) -> BridgeResult<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("orbit-");
        let dir = match parent {
            Some(parent) => builder.tempdir_in(parent)?,
            None => builder.tempdir()?,
        };
        let name = origin
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| OsString::from("extension"));
        let path = dir.path().join(name);
        Ok(Self { dir, path })
    }

    /// Path of the executable copy.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory holding the copy.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Replace the working copy with the current contents of `origin`.
    ///
    /// The copy is staged next to the target and renamed over it, so a
    /// running child keeps its old inode and the new file is never opened
    /// for writing while being executed.
    pub fn refresh(&self, origin: &Path) -> BridgeResult<()> {
        let mut staging = self.path.clone().into_os_string();
        staging.push(".staging");
        let staging = PathBuf::from(staging);

        fs::copy(origin, &staging)?;
        set_executable(&staging)?;
        fs::rename(&staging, &self.path)?;

        debug!(origin = %origin.display(), working = %self.path.display(), "Working copy refreshed");
        Ok(())
    }
}

#[cfg(unix)]
fn set_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Hex-encoded BLAKE3 digest of a file.
pub fn hash_file(path: &Path) -> BridgeResult<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().to_hex().to_string())
}

/// The sibling file recording the last-known digest: `<path>.hash`.
pub fn hash_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".hash");
    PathBuf::from(name)
}

/// Record `hash` next to `path`.
pub fn persist_hash(path: &Path, hash: &str) -> BridgeResult<()> {
    fs::write(hash_path(path), hash)?;
    Ok(())
}

/// Read the digest recorded next to `path`, if any.
pub fn read_persisted_hash(path: &Path) -> Option<String> {
    fs::read_to_string(hash_path(path))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executable(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        set_executable(&path).unwrap();
        path
    }

    #[test]
    fn test_resolve_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, BridgeError::NotFound(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_not_executable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain");
        fs::write(&path, b"data").unwrap();
        assert!(matches!(resolve(&path), Err(BridgeError::NotExecutable(_))));
        assert!(matches!(resolve(dir.path()), Err(BridgeError::NotExecutable(_))));
    }

    #[test]
    fn test_working_copy_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let origin = executable(dir.path(), "ext", b"v1");

        let copy = WorkingCopy::create(&origin, Some(dir.path())).unwrap();
        copy.refresh(&origin).unwrap();
        assert_eq!(fs::read(copy.path()).unwrap(), b"v1");
        assert!(resolve(copy.path()).is_ok());

        fs::write(&origin, b"v2").unwrap();
        copy.refresh(&origin).unwrap();
        assert_eq!(fs::read(copy.path()).unwrap(), b"v2");

        let working_dir = copy.dir().to_path_buf();
        drop(copy);
        assert!(!working_dir.exists());
    }

    #[test]
    fn test_hash_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let origin = executable(dir.path(), "ext", b"payload");

        let hash = hash_file(&origin).unwrap();
        assert_eq!(hash, blake3::hash(b"payload").to_hex().to_string());
        assert_eq!(hash_path(&origin), dir.path().join("ext.hash"));

        assert_eq!(read_persisted_hash(&origin), None);
        persist_hash(&origin, &hash).unwrap();
        assert_eq!(read_persisted_hash(&origin), Some(hash));
    }
}
