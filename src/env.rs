use std::path::{Path, PathBuf};
use std::time::SystemTime;

use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::codec::{self, Encoded, Fingerprint};
use crate::error::Result;

/// Provides the live state that stored records are validated against.
///
/// The matcher queries it lazily: only the globals, files and code units a
/// candidate record actually declares are looked up.
pub trait Environment {
    /// The current encoded value of a global, if it is defined.
    fn global_value(&self, name: &str) -> Option<Encoded>;

    /// The current modification time of a file, if it exists.
    fn file_mtime(&self, path: &Path) -> Option<SystemTime>;

    /// The current fingerprint of a code unit, if it still exists.
    fn code_fingerprint(&self, id: &str) -> Option<Fingerprint>;
}

/// Read a file's modification time from the file system.
pub fn fs_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

/// An in-memory environment.
///
/// File times fall back to the real file system for paths that were not set
/// explicitly, unless [`isolated`](Self::isolated) is used.
#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    globals: FxHashMap<String, Encoded>,
    files: FxHashMap<PathBuf, SystemTime>,
    code: FxHashMap<String, Fingerprint>,
    isolated: bool,
}

impl Snapshot {
    /// Create an empty snapshot that consults the file system for files.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty snapshot that never touches the file system.
    pub fn isolated() -> Self {
        Self { isolated: true, ..Self::default() }
    }

    /// Set a global's value.
    pub fn set_global<T: Serialize + ?Sized>(&mut self, name: &str, value: &T) -> Result<()> {
        self.globals.insert(name.into(), codec::encode(value)?);
        Ok(())
    }

    /// Remove a global.
    pub fn unset_global(&mut self, name: &str) {
        self.globals.remove(name);
    }

    /// Set a file's modification time.
    pub fn set_file(&mut self, path: impl Into<PathBuf>, mtime: SystemTime) {
        self.files.insert(path.into(), mtime);
    }

    /// Remove a file.
    pub fn remove_file(&mut self, path: &Path) {
        self.files.remove(path);
    }

    /// Set a code unit's fingerprint.
    pub fn set_code(&mut self, id: &str, fingerprint: Fingerprint) {
        self.code.insert(id.into(), fingerprint);
    }
}

impl Environment for Snapshot {
    fn global_value(&self, name: &str) -> Option<Encoded> {
        self.globals.get(name).cloned()
    }

    fn file_mtime(&self, path: &Path) -> Option<SystemTime> {
        match self.files.get(path) {
            Some(&mtime) => Some(mtime),
            None if self.isolated => None,
            None => fs_mtime(path),
        }
    }

    fn code_fingerprint(&self, id: &str) -> Option<Fingerprint> {
        self.code.get(id).copied()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_snapshot_lookups() {
        let mut env = Snapshot::isolated();
        env.set_global("x", &3).unwrap();
        env.set_file("a.txt", SystemTime::UNIX_EPOCH + Duration::from_secs(1));
        env.set_code("f", Fingerprint::from_raw(1));

        assert_eq!(env.global_value("x"), Some(codec::encode(&3).unwrap()));
        assert_eq!(env.global_value("y"), None);
        assert!(env.file_mtime(Path::new("a.txt")).is_some());
        assert!(env.file_mtime(Path::new("missing.txt")).is_none());
        assert_eq!(env.code_fingerprint("f"), Some(Fingerprint::from_raw(1)));

        env.unset_global("x");
        assert_eq!(env.global_value("x"), None);
    }

    #[test]
    fn test_snapshot_falls_back_to_file_system() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        std::fs::write(&path, "data").unwrap();

        assert_eq!(Snapshot::new().file_mtime(&path), fs_mtime(&path));
        assert!(Snapshot::new().file_mtime(&path).is_some());
        assert!(Snapshot::isolated().file_mtime(&path).is_none());
    }
}
