use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::SystemTime;

use serde::Serialize;

use crate::codec::{self, Encoded, Fingerprint};
use crate::key::ArgsKey;
use crate::record::{FileTimes, GlobalReads, MemoRecord, RetBox, SeekPositions};
use crate::table::CodeDependencies;

/// Dependencies and effects observed during one execution.
///
/// A trace belongs to exactly one call. Nested calls get their own trace,
/// which is [joined](Self::join) into the caller's once they return, so that
/// recursive evaluation never shares mutable per-function state.
///
/// An axis that was never touched stays empty and becomes an absent field on
/// the stored record, which imposes no constraint when matching.
#[derive(Debug, Default, Clone)]
pub struct Trace {
    globals_read: GlobalReads,
    files_read: FileTimes,
    files_written: FileTimes,
    seek_positions: SeekPositions,
    code: CodeDependencies,
    stdout: String,
    stderr: String,
    impure: Option<String>,
}

impl Trace {
    /// Creates an empty trace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a read of a global variable.
    ///
    /// Only the first read of a name counts: it is the value the call
    /// depended on. A value that cannot be encoded makes the execution impure.
    pub fn read_global<T: Serialize + ?Sized>(&mut self, name: &str, value: &T) {
        match codec::encode(value) {
            Ok(encoded) => self.read_encoded_global(name, encoded),
            Err(err) => self.mark_impure(format!("global `{name}` is not serializable: {err}")),
        }
    }

    /// Record a read of a global variable whose value is already encoded.
    pub fn read_encoded_global(&mut self, name: &str, value: Encoded) {
        if !self.globals_read.contains_key(name) {
            self.globals_read.insert(name.into(), value);
        }
    }

    /// Record a read of a file with its modification time at read time.
    pub fn read_file(&mut self, path: impl Into<PathBuf>, mtime: SystemTime) {
        self.files_read.entry(path.into()).or_insert(mtime);
    }

    /// Record a write to a file with its modification time after the write.
    pub fn write_file(&mut self, path: impl Into<PathBuf>, mtime: SystemTime) {
        self.files_written.insert(path.into(), mtime);
    }

    /// Record the seek offset of an open file.
    pub fn seek(&mut self, path: impl Into<PathBuf>, pos: u64) {
        self.seek_positions.insert(path.into(), pos);
    }

    /// Record a dependency on a code unit.
    ///
    /// Observing two different fingerprints for one unit within a single
    /// execution means the code changed underneath it, so the execution
    /// becomes impure.
    pub fn depend_on_code(&mut self, id: &str, fingerprint: Fingerprint) {
        match self.code.get(id) {
            Some(&seen) if seen != fingerprint => {
                self.mark_impure(format!("code unit `{id}` changed during execution"));
            }
            Some(_) => {}
            None => {
                self.code.insert(id.into(), fingerprint);
            }
        }
    }

    /// Append captured standard output.
    pub fn capture_stdout(&mut self, text: &str) {
        self.stdout.push_str(text);
    }

    /// Append captured standard error.
    pub fn capture_stderr(&mut self, text: &str) {
        self.stderr.push_str(text);
    }

    /// Flag the execution as unsafe to cache.
    ///
    /// The first reason is kept.
    pub fn mark_impure(&mut self, reason: impl Into<String>) {
        if self.impure.is_none() {
            self.impure = Some(reason.into());
        }
    }

    /// Whether the execution is unsafe to cache.
    pub fn is_impure(&self) -> bool {
        self.impure.is_some()
    }

    /// Why the execution is unsafe to cache.
    pub fn impurity(&self) -> Option<&str> {
        self.impure.as_deref()
    }

    /// The code units this execution depended on.
    pub fn code_dependencies(&self) -> &CodeDependencies {
        &self.code
    }

    /// The recorded global reads.
    pub fn globals_read(&self) -> &GlobalReads {
        &self.globals_read
    }

    /// The recorded file reads.
    pub fn files_read(&self) -> &FileTimes {
        &self.files_read
    }

    /// The captured standard output.
    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    /// Add a finished nested call's trace to this one.
    ///
    /// Reads the caller already made keep their earlier values, writes and
    /// seeks take the callee's later values, the callee's code becomes the
    /// caller's code, output is appended, and an impure callee makes the
    /// caller impure.
    pub fn join(&mut self, other: Trace) {
        for (name, value) in other.globals_read {
            self.globals_read.entry(name).or_insert(value);
        }
        for (path, mtime) in other.files_read {
            self.files_read.entry(path).or_insert(mtime);
        }
        self.files_written.extend(other.files_written);
        self.seek_positions.extend(other.seek_positions);
        for (id, fingerprint) in other.code {
            self.depend_on_code(&id, fingerprint);
        }
        self.stdout.push_str(&other.stdout);
        self.stderr.push_str(&other.stderr);
        if let Some(reason) = other.impure {
            self.mark_impure(format!("called impure function: {reason}"));
        }
    }

    /// Turn the observations into a record.
    pub(crate) fn into_record(self, args: ArgsKey, retval: RetBox, runtime_ms: u64) -> MemoRecord {
        MemoRecord {
            args,
            global_vars_read: non_empty(self.globals_read),
            files_read: non_empty(self.files_read),
            files_written: non_empty(self.files_written),
            retval,
            stdout_buf: Some(self.stdout).filter(|s| !s.is_empty()),
            stderr_buf: Some(self.stderr).filter(|s| !s.is_empty()),
            final_file_seek_pos: non_empty(self.seek_positions),
            runtime_ms,
        }
    }

    /// Rebuild the observations a stored record stands for.
    pub(crate) fn from_record(record: &MemoRecord, code: &CodeDependencies) -> Self {
        Self {
            globals_read: record.global_vars_read.clone().unwrap_or_default(),
            files_read: record.files_read.clone().unwrap_or_default(),
            files_written: record.files_written.clone().unwrap_or_default(),
            seek_positions: record.final_file_seek_pos.clone().unwrap_or_default(),
            code: code.clone(),
            stdout: record.stdout_buf.clone().unwrap_or_default(),
            stderr: record.stderr_buf.clone().unwrap_or_default(),
            impure: None,
        }
    }
}

fn non_empty<K: Ord, V>(map: BTreeMap<K, V>) -> Option<BTreeMap<K, V>> {
    (!map.is_empty()).then_some(map)
}
