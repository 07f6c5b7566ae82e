use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::codec::Fingerprint;
use crate::env::Environment;
use crate::error::Error;
use crate::key::ArgsKey;
use crate::passthroughhasher::PassthroughHashMap;
use crate::record::MemoRecord;
use crate::store::Store;

/// Code unit identifier to fingerprint.
pub type CodeDependencies = BTreeMap<String, Fingerprint>;

/// The memo table of a single function.
///
/// Records are kept in insertion order. The lookup map points from an
/// argument key to the positions of all records sharing that key; there can
/// be several, because the same arguments may have produced different
/// results under different global state.
pub struct FuncMemoInfo {
    /// The function's canonical name.
    name: String,
    /// All records, in insertion order. Shared with replays handed out.
    records: Vec<Arc<MemoRecord>>,
    /// Maps from argument keys to indices into `records`.
    by_key: PassthroughHashMap<ArgsKey, Vec<usize>>,
    /// Fingerprints of the code the records were computed with.
    code_dependencies: CodeDependencies,
    /// Whether the store has been consulted yet.
    loaded: bool,
    /// Whether there are changes the store has not seen.
    dirty: bool,
    /// Whether to skip memoization for the rest of the process.
    likely_nothing_to_memoize: bool,
    /// Fast executions in a row that inserted nothing.
    consecutive_empty_fast_calls: u32,
}

impl FuncMemoInfo {
    /// Create an empty, unloaded table.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: Vec::new(),
            by_key: PassthroughHashMap::default(),
            code_dependencies: CodeDependencies::new(),
            loaded: false,
            dirty: false,
            likely_nothing_to_memoize: false,
            consecutive_empty_fast_calls: 0,
        }
    }

    /// The function's canonical name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All records in insertion order.
    pub fn records(&self) -> &[Arc<MemoRecord>] {
        &self.records
    }

    /// The number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the table holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The records stored for an argument key, earliest first.
    pub fn candidates<'a>(&'a self, key: &ArgsKey) -> impl Iterator<Item = &'a Arc<MemoRecord>> {
        self.by_key
            .get(key)
            .into_iter()
            .flatten()
            .map(|&i| &self.records[i])
    }

    /// The code fingerprints the records depend on.
    pub fn code_dependencies(&self) -> &CodeDependencies {
        &self.code_dependencies
    }

    /// Whether the store has been consulted.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Whether the table has unflushed changes.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether memoization is skipped for this function.
    pub fn likely_nothing_to_memoize(&self) -> bool {
        self.likely_nothing_to_memoize
    }

    /// Fast executions in a row that inserted nothing.
    pub fn consecutive_empty_fast_calls(&self) -> u32 {
        self.consecutive_empty_fast_calls
    }

    /// Start memoizing this function again.
    pub fn clear_ignore(&mut self) {
        self.likely_nothing_to_memoize = false;
        self.consecutive_empty_fast_calls = 0;
    }

    /// Load the persisted records and dependencies, once.
    ///
    /// Unreadable artifacts are logged and treated as empty. Records whose
    /// dependency artifact is unreadable, or that were written under other
    /// dependencies, are dropped as well, since there is no way left to tell
    /// whether they are stale. The same goes for records whose dependencies
    /// disagree with fingerprints observed in this process before the load.
    pub fn ensure_loaded(&mut self, store: &Store) {
        if self.loaded {
            return;
        }
        self.loaded = true;

        let deps = match store.load_dependencies(&self.name) {
            Ok(deps) => deps,
            Err(err) => {
                warn!(function = %self.name, error = %err, "discarding unreadable dependencies");
                self.dirty = true;
                return;
            }
        };

        let records = match store.load_records(&self.name, &deps) {
            Ok(records) => records,
            Err(err) => {
                warn!(function = %self.name, error = %err, "discarding unreadable memo table");
                self.dirty = true;
                Vec::new()
            }
        };

        let conflict = deps.iter().any(|(id, fingerprint)| {
            self.code_dependencies.get(id).is_some_and(|seen| seen != fingerprint)
        });
        if conflict {
            debug!(function = %self.name, "persisted records are stale, discarding");
            self.dirty = true;
            return;
        }

        for (id, fingerprint) in deps {
            self.code_dependencies.entry(id).or_insert(fingerprint);
        }

        debug!(function = %self.name, records = records.len(), "loaded memo table");
        let fresh = std::mem::take(&mut self.records);
        self.by_key.clear();
        for record in records.into_iter().chain(fresh) {
            self.push(record);
        }
    }

    /// Check the stored code fingerprints against the environment.
    ///
    /// On any mismatch the whole table is invalidated and `false` returned.
    pub fn verify_code_dependencies(&mut self, env: &dyn Environment) -> bool {
        let changed = self
            .code_dependencies
            .iter()
            .find(|&(id, &fingerprint)| env.code_fingerprint(id) != Some(fingerprint))
            .map(|(id, _)| id.clone());

        match changed {
            None => true,
            Some(dependency) => {
                let err = Error::DependencyUnsatisfied { dependency };
                debug!(function = %self.name, reason = %err, "invalidating memo table");
                self.invalidate();
                self.code_dependencies.clear();
                self.dirty = true;
                false
            }
        }
    }

    /// Merge the code fingerprints an execution observed.
    ///
    /// A changed fingerprint for a known dependency makes all existing
    /// records stale.
    pub fn merge_code_dependencies(&mut self, observed: &CodeDependencies) {
        let mut stale = false;
        for (id, &fingerprint) in observed {
            match self.code_dependencies.insert(id.clone(), fingerprint) {
                Some(previous) if previous == fingerprint => continue,
                Some(_) => stale = true,
                None => {}
            }
            self.dirty = true;
        }

        if stale && !self.records.is_empty() {
            debug!(function = %self.name, "code changed, invalidating memo table");
            self.invalidate();
        }
    }

    /// Append a record.
    pub fn insert(&mut self, record: MemoRecord) {
        self.push(Arc::new(record));
        self.dirty = true;
    }

    /// Drop all records.
    pub fn invalidate(&mut self) {
        if !self.records.is_empty() {
            self.records.clear();
            self.by_key.clear();
            self.dirty = true;
        }
    }

    /// Account for a finished execution in the opt-out heuristic.
    ///
    /// Returns whether this execution switched memoization off.
    pub fn note_execution(&mut self, fast: bool, inserted: bool, threshold: Option<u32>) -> bool {
        if inserted || !fast {
            self.consecutive_empty_fast_calls = 0;
            return false;
        }
        self.note_empty_call(threshold)
    }

    /// Count an execution that had nothing to memoize.
    pub fn note_empty_call(&mut self, threshold: Option<u32>) -> bool {
        self.consecutive_empty_fast_calls = self.consecutive_empty_fast_calls.saturating_add(1);
        match threshold {
            Some(threshold)
                if !self.likely_nothing_to_memoize
                    && self.consecutive_empty_fast_calls >= threshold =>
            {
                debug!(
                    function = %self.name,
                    calls = self.consecutive_empty_fast_calls,
                    "nothing to memoize, ignoring function"
                );
                self.likely_nothing_to_memoize = true;
                true
            }
            _ => false,
        }
    }

    /// Write the table to the store if it changed.
    ///
    /// Both artifacts are attempted even if the first fails; the records are
    /// stamped with the dependencies, so a half-written pair never loads.
    /// Returns the errors; the table stays dirty when there are any.
    pub fn flush(&mut self, store: &Store) -> Vec<Error> {
        if !self.loaded || !self.dirty {
            return Vec::new();
        }

        let errors: Vec<Error> = [
            store.save_records(&self.name, &self.records, &self.code_dependencies),
            store.save_dependencies(&self.name, &self.code_dependencies),
        ]
        .into_iter()
        .filter_map(Result::err)
        .collect();

        if errors.is_empty() {
            self.dirty = false;
        }
        errors
    }

    fn push(&mut self, record: Arc<MemoRecord>) {
        let index = self.records.len();
        self.by_key.entry(record.args.clone()).or_default().push(index);
        self.records.push(record);
    }
}
