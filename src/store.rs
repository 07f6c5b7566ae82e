//! On-disk persistence of memo tables.
//!
//! Every function owns two artifacts in the cache directory:
//!
//! ```text
//! incmemo-cache/
//! ├── <name>.memoized_vals.pickle   # the memo records
//! └── <name>.dependencies.pickle    # code dependency fingerprints
//! ```
//!
//! Both start with a little-endian `u32` format version followed by the
//! bincode payload. They are written independently through a temporary
//! sibling and a rename, so a failed write leaves the previous artifact (and
//! the other one) intact. The records artifact is stamped with the digest of
//! the dependencies it was computed under; records are only handed out
//! together with exactly those dependencies.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::codec::Fingerprint;
use crate::error::{Error, Result};
use crate::record::MemoRecord;
use crate::table::CodeDependencies;

/// Artifact format version. Increment when changing the record layout.
pub const FORMAT_VERSION: u32 = 2;

/// File name suffix of the records artifact.
pub const RECORDS_SUFFIX: &str = ".memoized_vals.pickle";

/// File name suffix of the dependencies artifact.
pub const DEPENDENCIES_SUFFIX: &str = ".dependencies.pickle";

/// A cache directory holding per-function artifacts.
#[derive(Debug, Clone)]
pub struct Store {
    dir: PathBuf,
}

impl Store {
    /// Use the given cache directory. It is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The cache directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where a function's records live.
    pub fn records_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}{RECORDS_SUFFIX}", escape_name(name)))
    }

    /// Where a function's code dependencies live.
    pub fn dependencies_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}{DEPENDENCIES_SUFFIX}", escape_name(name)))
    }

    /// Load a function's records, computed under `deps`.
    ///
    /// A missing artifact is an empty table. Records stamped with different
    /// dependencies are reported as corrupt: one of the two artifacts failed
    /// to be written.
    pub fn load_records(
        &self,
        name: &str,
        deps: &CodeDependencies,
    ) -> Result<Vec<Arc<MemoRecord>>> {
        let path = self.records_path(name);
        let Some((stamp, records)) = read::<(Fingerprint, Vec<MemoRecord>)>(&path)? else {
            return Ok(Vec::new());
        };

        if stamp != Fingerprint::of(deps) {
            return Err(Error::corrupt(path, "records do not match the stored dependencies"));
        }

        Ok(records.into_iter().map(Arc::new).collect())
    }

    /// Load a function's code dependencies. A missing artifact is empty.
    pub fn load_dependencies(&self, name: &str) -> Result<CodeDependencies> {
        read(&self.dependencies_path(name)).map(Option::unwrap_or_default)
    }

    /// Persist a function's records, stamped with the dependencies they were
    /// computed under. An empty list removes the artifact.
    pub fn save_records(
        &self,
        name: &str,
        records: &[Arc<MemoRecord>],
        deps: &CodeDependencies,
    ) -> Result<()> {
        let stamped = (Fingerprint::of(deps), records);
        write(&self.dir, &self.records_path(name), &stamped, records.is_empty())
    }

    /// Persist a function's code dependencies. An empty map removes the
    /// artifact.
    pub fn save_dependencies(&self, name: &str, deps: &CodeDependencies) -> Result<()> {
        write(&self.dir, &self.dependencies_path(name), deps, deps.is_empty())
    }
}

/// Turn a canonical function name into a file-system-safe stem.
///
/// ASCII alphanumerics, `_`, `-` and `.` pass through, every other byte is
/// percent-escaped, so distinct names always map to distinct stems.
pub fn escape_name(name: &str) -> String {
    let mut stem = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' | b'-' | b'.' => {
                stem.push(byte as char)
            }
            _ => {
                let _ = write!(stem, "%{byte:02X}");
            }
        }
    }
    stem
}

fn read<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(Error::io(path, err)),
    };

    let Some((header, payload)) = bytes.split_first_chunk::<4>() else {
        return Err(Error::corrupt(path, "truncated header"));
    };

    let version = u32::from_le_bytes(*header);
    if version != FORMAT_VERSION {
        return Err(Error::corrupt(
            path,
            format!("format version {version}, expected {FORMAT_VERSION}"),
        ));
    }

    bincode::deserialize(payload)
        .map(Some)
        .map_err(|err| Error::corrupt(path, err))
}

fn write<T: Serialize + ?Sized>(dir: &Path, path: &Path, value: &T, empty: bool) -> Result<()> {
    if empty {
        return match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::io(path, err)),
        };
    }

    let mut bytes = FORMAT_VERSION.to_le_bytes().to_vec();
    bincode::serialize_into(&mut bytes, value)
        .map_err(|err| Error::Unserializable(err.to_string()))?;

    fs::create_dir_all(dir).map_err(|err| Error::io(dir, err))?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".tmp{}", std::process::id()));
    let tmp = PathBuf::from(tmp);

    if let Err(err) = fs::write(&tmp, &bytes) {
        let _ = fs::remove_file(&tmp);
        return Err(Error::io(&tmp, err));
    }

    fs::rename(&tmp, path).map_err(|err| {
        let _ = fs::remove_file(&tmp);
        Error::io(path, err)
    })
}
