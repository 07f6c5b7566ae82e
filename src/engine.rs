use std::sync::Arc;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::config::Config;
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::key::ArgsKey;
use crate::matcher;
use crate::record::{FileTimes, MemoRecord, RetBox, SeekPositions};
use crate::store::Store;
use crate::table::{CodeDependencies, FuncMemoInfo};
use crate::trace::Trace;

/// The memoization engine: one memo table per canonical function name.
///
/// The host's call hook asks [`before_call`](Self::before_call) whether a
/// call can be skipped and reports finished executions through
/// [`after_call`](Self::after_call). Tables are loaded from the cache
/// directory on first lookup and written back by
/// [`flush_all`](Self::flush_all).
///
/// None of these methods fail: unserializable values, corrupt artifacts and
/// changed dependencies all degrade to "execute normally".
pub struct Engine {
    config: Config,
    store: Store,
    tables: FxHashMap<String, FuncMemoInfo>,
    stats: Stats,
}

impl Engine {
    /// Create an engine with empty, unloaded tables.
    pub fn new(config: Config) -> Self {
        let store = Store::new(config.cache_dir.clone());
        Self { config, store, tables: FxHashMap::default(), stats: Stats::default() }
    }

    /// The engine's configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The backing store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// The memo table of a function, if it was invoked in this process.
    pub fn table(&self, name: &str) -> Option<&FuncMemoInfo> {
        self.tables.get(name)
    }

    /// Counters since the engine was created.
    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Try to reuse a stored result for a call.
    ///
    /// On [`Decision::Proceed`] the host executes the body and passes the
    /// returned frame to [`after_call`](Self::after_call).
    pub fn before_call<A>(&mut self, name: &str, args: &A, env: &dyn Environment) -> Decision
    where
        A: Serialize + ?Sized,
    {
        if !self.config.enabled {
            return Decision::Proceed(CallFrame::new(name, Attempt::Disabled));
        }

        let table = self
            .tables
            .entry(name.to_owned())
            .or_insert_with(|| FuncMemoInfo::new(name));

        if table.likely_nothing_to_memoize() {
            return Decision::Proceed(CallFrame::new(name, Attempt::Ignored));
        }

        let key = match ArgsKey::encode(args) {
            Ok(key) => key,
            Err(err) => {
                debug!(function = name, error = %err, "arguments are not memoizable");
                return Decision::Proceed(CallFrame::new(name, Attempt::UnserializableArgs));
            }
        };

        table.ensure_loaded(&self.store);

        match matcher::lookup(table, &key, env).cloned() {
            Some(record) => {
                debug!(function = name, saved_ms = record.runtime_ms, "memo hit");
                self.stats.hits += 1;
                self.stats.saved_ms = self.stats.saved_ms.saturating_add(record.runtime_ms);
                Decision::Hit(Replay { record, code: table.code_dependencies().clone() })
            }
            None => {
                debug!(function = name, "memo miss");
                self.stats.misses += 1;
                Decision::Proceed(CallFrame::new(name, Attempt::Lookup(key)))
            }
        }
    }

    /// Report a finished execution.
    ///
    /// The result is stored when the arguments and return value encode, the
    /// trace is not impure, and the body returned normally. The trace's code
    /// fingerprints are merged into the table regardless.
    pub fn after_call<R>(&mut self, frame: CallFrame, outcome: Outcome<'_, R>, trace: Trace) -> Insertion
    where
        R: Serialize + ?Sized,
    {
        let elapsed = frame.started.elapsed();
        let insertion = self.record_execution(frame, elapsed, outcome, trace);
        match insertion {
            Insertion::Inserted => self.stats.inserted += 1,
            Insertion::Skipped(_) => self.stats.skipped += 1,
        }
        insertion
    }

    fn record_execution<R>(
        &mut self,
        frame: CallFrame,
        elapsed: Duration,
        outcome: Outcome<'_, R>,
        trace: Trace,
    ) -> Insertion
    where
        R: Serialize + ?Sized,
    {
        let CallFrame { name, attempt, .. } = frame;
        if let Attempt::Disabled = attempt {
            return Insertion::Skipped(Skip::Disabled);
        }

        let table = self
            .tables
            .entry(name)
            .or_insert_with_key(|name| FuncMemoInfo::new(name.as_str()));

        // Dependency tracking continues even for calls that are not cached.
        table.ensure_loaded(&self.store);
        table.merge_code_dependencies(trace.code_dependencies());

        let threshold = self.config.ignore_threshold;
        let key = match attempt {
            Attempt::Disabled | Attempt::Ignored => return Insertion::Skipped(Skip::Ignored),
            Attempt::UnserializableArgs => {
                table.note_empty_call(threshold);
                return Insertion::Skipped(Skip::UnserializableArgs);
            }
            Attempt::Lookup(key) => key,
        };

        let insertion = insert(table, key, elapsed, outcome, trace);
        let fast = elapsed < self.config.fast_call_floor;
        table.note_execution(fast, insertion == Insertion::Inserted, threshold);
        insertion
    }

    /// Write every modified table to the cache directory.
    ///
    /// Failures are logged and reported; they never abort the flush of the
    /// remaining tables.
    pub fn flush_all(&mut self) -> FlushReport {
        let mut report = FlushReport::default();
        for table in self.tables.values_mut() {
            if !table.is_loaded() || !table.is_dirty() {
                continue;
            }

            let errors = table.flush(&self.store);
            if errors.is_empty() {
                report.written += 1;
            }

            for err in errors {
                warn!(function = table.name(), error = %err, "failed to persist memo table");
                report.errors.push(err);
            }
        }

        debug!(written = report.written, failed = report.errors.len(), "flushed memo tables");
        report
    }

    /// Let a function that was given up on be memoized again.
    pub fn clear_ignore(&mut self, name: &str) {
        if let Some(table) = self.tables.get_mut(name) {
            table.clear_ignore();
        }
    }
}

fn insert<R>(
    table: &mut FuncMemoInfo,
    key: ArgsKey,
    elapsed: Duration,
    outcome: Outcome<'_, R>,
    trace: Trace,
) -> Insertion
where
    R: Serialize + ?Sized,
{
    if let Some(reason) = trace.impurity() {
        debug!(function = table.name(), reason, "impure execution, not memoizing");
        return Insertion::Skipped(Skip::Impure);
    }

    let Outcome::Returned(value) = outcome else {
        return Insertion::Skipped(Skip::Raised);
    };

    let retval = match RetBox::encode(value) {
        Ok(retval) => retval,
        Err(err) => {
            debug!(function = table.name(), error = %err, "return value is not memoizable");
            return Insertion::Skipped(Skip::UnserializableRetval);
        }
    };

    let runtime_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
    table.insert(trace.into_record(key, retval, runtime_ms));
    Insertion::Inserted
}

/// What to do with a call.
#[derive(Debug)]
pub enum Decision {
    /// A stored result is valid; skip the body and replay it.
    Hit(Replay),
    /// Execute the body, then hand the frame to `after_call`.
    Proceed(CallFrame),
}

/// Per-call state carried from `before_call` to `after_call`.
#[derive(Debug)]
pub struct CallFrame {
    name: String,
    attempt: Attempt,
    started: Instant,
}

#[derive(Debug)]
enum Attempt {
    Disabled,
    Ignored,
    UnserializableArgs,
    Lookup(ArgsKey),
}

impl CallFrame {
    fn new(name: &str, attempt: Attempt) -> Self {
        Self { name: name.into(), attempt, started: Instant::now() }
    }

    /// The called function's canonical name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Time since the call started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// A stored result to replay instead of executing the body.
#[derive(Debug, Clone)]
pub struct Replay {
    record: Arc<MemoRecord>,
    code: CodeDependencies,
}

impl Replay {
    /// Decode a fresh copy of the stored return value.
    pub fn value<T: DeserializeOwned>(&self) -> Result<T> {
        self.record.retval.decode()
    }

    /// The return value's box.
    ///
    /// It shares the stored slot until written to, at which point it
    /// detaches; the stored record never sees the change.
    pub fn retval(&self) -> RetBox {
        self.record.retval.clone()
    }

    /// Output to print again.
    pub fn stdout(&self) -> Option<&str> {
        self.record.stdout_buf.as_deref()
    }

    /// Error output to print again.
    pub fn stderr(&self) -> Option<&str> {
        self.record.stderr_buf.as_deref()
    }

    /// Seek offsets to restore.
    pub fn final_file_seek_pos(&self) -> Option<&SeekPositions> {
        self.record.final_file_seek_pos.as_ref()
    }

    /// Files the original execution wrote.
    pub fn files_written(&self) -> Option<&FileTimes> {
        self.record.files_written.as_ref()
    }

    /// What the original execution cost.
    pub fn runtime(&self) -> Duration {
        self.record.runtime()
    }

    /// The stored record.
    pub fn record(&self) -> &MemoRecord {
        &self.record
    }

    /// The dependencies the replayed result stands for, to be joined into the
    /// enclosing call's trace.
    pub fn trace(&self) -> Trace {
        Trace::from_record(&self.record, &self.code)
    }
}

/// How a body finished.
#[derive(Debug)]
pub enum Outcome<'a, R: ?Sized> {
    /// It returned this value.
    Returned(&'a R),
    /// It raised or otherwise did not produce a value.
    Raised,
}

/// Whether `after_call` stored a record.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Insertion {
    Inserted,
    Skipped(Skip),
}

/// Why `after_call` stored nothing.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Skip {
    /// Memoization is turned off.
    Disabled,
    /// The function was given up on by the threshold heuristic.
    Ignored,
    /// The arguments do not encode.
    UnserializableArgs,
    /// The return value does not encode.
    UnserializableRetval,
    /// The execution had untracked effects.
    Impure,
    /// The body did not return normally.
    Raised,
}

/// Engine counters.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Stats {
    /// Calls answered from a memo table.
    pub hits: u64,
    /// Lookups that found nothing valid.
    pub misses: u64,
    /// Records stored.
    pub inserted: u64,
    /// Executions that stored nothing.
    pub skipped: u64,
    /// Recorded runtime of all replayed results, in milliseconds.
    pub saved_ms: u64,
}

/// The result of [`Engine::flush_all`].
#[derive(Debug, Default)]
pub struct FlushReport {
    /// Tables written completely.
    pub written: usize,
    /// Artifacts that could not be written.
    pub errors: Vec<Error>,
}

impl FlushReport {
    /// Whether everything was written.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use tempfile::TempDir;

    use super::*;
    use crate::codec::Fingerprint;
    use crate::env::Snapshot;
    use crate::value::{Handle, Value};

    fn config(dir: &TempDir) -> Config {
        Config::default().with_cache_dir(dir.path())
    }

    /// Run a call through the engine, returning whether it was a hit.
    fn call(
        engine: &mut Engine,
        name: &str,
        arg: i64,
        env: &Snapshot,
        body: impl FnOnce(&mut Trace) -> i64,
    ) -> (i64, bool) {
        match engine.before_call(name, &(arg,), env) {
            Decision::Hit(replay) => (replay.value().unwrap(), true),
            Decision::Proceed(frame) => {
                let mut trace = Trace::new();
                let out = body(&mut trace);
                engine.after_call(frame, Outcome::Returned(&out), trace);
                (out, false)
            }
        }
    }

    #[test]
    fn test_end_to_end() {
        let dir = TempDir::new().unwrap();
        let mut engine = Engine::new(config(&dir));
        let env = Snapshot::isolated();
        let mut executions = 0;
        let mut square = |x: i64| {
            executions += 1;
            x * x
        };

        assert_eq!(call(&mut engine, "f", 3, &env, |_| square(3)), (9, false));
        assert_eq!(call(&mut engine, "f", 3, &env, |_| square(3)), (9, true));
        assert_eq!(call(&mut engine, "f", 4, &env, |_| square(4)), (16, false));
        assert_eq!(executions, 2);

        let table = engine.table("f").unwrap();
        assert_eq!(table.len(), 2);
        assert!(table.records()[0].global_vars_read.is_none());
        assert_eq!(engine.stats().hits, 1);
        assert_eq!(engine.stats().misses, 2);
        assert_eq!(engine.stats().inserted, 2);
    }

    #[test]
    fn test_persistence_across_processes() {
        let dir = TempDir::new().unwrap();
        let mut env = Snapshot::isolated();
        env.set_code("f", Fingerprint::of("v1"));

        let mut first = Engine::new(config(&dir));
        let (out, hit) = call(&mut first, "f", 3, &env, |trace| {
            trace.depend_on_code("f", Fingerprint::of("v1"));
            9
        });
        assert_eq!((out, hit), (9, false));
        let report = first.flush_all();
        assert!(report.is_ok());
        assert_eq!(report.written, 1);
        drop(first);

        let mut second = Engine::new(config(&dir));
        assert_eq!(call(&mut second, "f", 3, &env, |_| unreachable!()), (9, true));

        // Editing the function invalidates the persisted records.
        env.set_code("f", Fingerprint::of("v2"));
        let mut third = Engine::new(config(&dir));
        assert_eq!(call(&mut third, "f", 3, &env, |_| 10), (10, false));
    }

    #[test]
    fn test_impure_execution_is_not_inserted() {
        let dir = TempDir::new().unwrap();
        let mut engine = Engine::new(config(&dir));
        let env = Snapshot::isolated();

        let Decision::Proceed(frame) = engine.before_call("f", &(1,), &env) else {
            panic!("expected a miss");
        };
        let mut trace = Trace::new();
        trace.mark_impure("printed to a socket");
        trace.depend_on_code("g", Fingerprint::from_raw(3));
        let insertion = engine.after_call(frame, Outcome::Returned(&1), trace);

        assert_eq!(insertion, Insertion::Skipped(Skip::Impure));
        let table = engine.table("f").unwrap();
        assert!(table.is_empty());
        assert_eq!(table.code_dependencies()["g"], Fingerprint::from_raw(3));
    }

    #[test]
    fn test_raised_and_unserializable_results() {
        let dir = TempDir::new().unwrap();
        let mut engine = Engine::new(config(&dir));
        let env = Snapshot::isolated();

        let Decision::Proceed(frame) = engine.before_call("f", &(1,), &env) else {
            panic!("expected a miss");
        };
        let insertion = engine.after_call::<i32>(frame, Outcome::Raised, Trace::new());
        assert_eq!(insertion, Insertion::Skipped(Skip::Raised));

        let Decision::Proceed(frame) = engine.before_call("f", &(1,), &env) else {
            panic!("expected a miss");
        };
        let handle = Value::Handle(Handle { kind: "file", id: 1 });
        let insertion = engine.after_call(frame, Outcome::Returned(&handle), Trace::new());
        assert_eq!(insertion, Insertion::Skipped(Skip::UnserializableRetval));
        assert!(engine.table("f").unwrap().is_empty());
    }

    #[test]
    fn test_unserializable_args_count_towards_threshold() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir).with_ignore_threshold(Some(2));
        let mut engine = Engine::new(config);
        let env = Snapshot::isolated();
        let args = (Value::Handle(Handle { kind: "socket", id: 9 }),);

        for _ in 0..2 {
            let Decision::Proceed(frame) = engine.before_call("f", &args, &env) else {
                panic!("expected a miss");
            };
            let insertion = engine.after_call(frame, Outcome::Returned(&0), Trace::new());
            assert_eq!(insertion, Insertion::Skipped(Skip::UnserializableArgs));
        }

        assert!(engine.table("f").unwrap().likely_nothing_to_memoize());
    }

    #[test]
    fn test_threshold_opt_out() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir)
            .with_ignore_threshold(Some(3))
            .with_fast_call_floor(Duration::from_secs(3600));
        let mut engine = Engine::new(config);
        let env = Snapshot::isolated();

        // Impure calls insert nothing and are fast.
        for i in 0..3 {
            let Decision::Proceed(frame) = engine.before_call("f", &(i,), &env) else {
                panic!("expected a miss");
            };
            let mut trace = Trace::new();
            trace.mark_impure("nondeterministic");
            engine.after_call(frame, Outcome::Returned(&i), trace);
        }

        let table = engine.table("f").unwrap();
        assert!(table.likely_nothing_to_memoize());
        assert_eq!(table.consecutive_empty_fast_calls(), 3);

        // From now on, calls are neither looked up nor stored.
        let Decision::Proceed(frame) = engine.before_call("f", &(0,), &env) else {
            panic!("expected to proceed");
        };
        let mut trace = Trace::new();
        trace.depend_on_code("f", Fingerprint::from_raw(1));
        let insertion = engine.after_call(frame, Outcome::Returned(&0), trace);
        assert_eq!(insertion, Insertion::Skipped(Skip::Ignored));
        let table = engine.table("f").unwrap();
        assert!(table.is_empty());
        assert_eq!(table.code_dependencies().len(), 1);

        engine.clear_ignore("f");
        assert_eq!(call(&mut engine, "f", 5, &env, |_| 5), (5, false));
        assert_eq!(engine.table("f").unwrap().consecutive_empty_fast_calls(), 0);
        assert_eq!(engine.table("f").unwrap().len(), 1);
    }

    #[test]
    fn test_slow_call_resets_counter() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir)
            .with_ignore_threshold(Some(10))
            .with_fast_call_floor(Duration::ZERO);
        let mut engine = Engine::new(config);
        let env = Snapshot::isolated();

        let Decision::Proceed(frame) = engine.before_call("f", &(1,), &env) else {
            panic!("expected a miss");
        };
        let mut trace = Trace::new();
        trace.mark_impure("random");
        engine.after_call(frame, Outcome::Returned(&1), trace);
        assert_eq!(engine.table("f").unwrap().consecutive_empty_fast_calls(), 0);
    }

    #[test]
    fn test_globals_and_replay() {
        let dir = TempDir::new().unwrap();
        let mut engine = Engine::new(config(&dir));
        let mut env = Snapshot::isolated();
        let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(10);
        env.set_global("scale", &2i64).unwrap();
        env.set_file("input.txt", mtime);

        let body = |scale: i64| {
            move |trace: &mut Trace| {
                trace.read_global("scale", &scale);
                trace.read_file("input.txt", mtime);
                trace.capture_stdout("computing\n");
                trace.seek("input.txt", 12);
                3 * scale
            }
        };

        assert_eq!(call(&mut engine, "f", 3, &env, body(2)), (6, false));
        env.set_global("scale", &5i64).unwrap();
        assert_eq!(call(&mut engine, "f", 3, &env, body(5)), (15, false));
        env.set_global("scale", &2i64).unwrap();

        let Decision::Hit(replay) = engine.before_call("f", &(3,), &env) else {
            panic!("expected a hit");
        };
        assert_eq!(replay.value::<i64>().unwrap(), 6);
        assert_eq!(replay.stdout(), Some("computing\n"));
        assert_eq!(replay.stderr(), None);
        assert_eq!(replay.final_file_seek_pos().unwrap().values().next(), Some(&12));
        assert_eq!(replay.trace().globals_read().len(), 1);

        // Mutating the handed-out box leaves the stored record intact.
        let mut retval = replay.retval();
        retval.set(crate::codec::encode(&100i64).unwrap());
        let Decision::Hit(again) = engine.before_call("f", &(3,), &env) else {
            panic!("expected a hit");
        };
        assert_eq!(again.value::<i64>().unwrap(), 6);

        env.set_file("input.txt", mtime + Duration::from_secs(1));
        assert!(matches!(engine.before_call("f", &(3,), &env), Decision::Proceed(_)));
    }

    #[test]
    fn test_hit_shares_stored_record() {
        let dir = TempDir::new().unwrap();
        let mut engine = Engine::new(config(&dir));
        let env = Snapshot::isolated();
        call(&mut engine, "f", 3, &env, |_| 9);

        let Decision::Hit(replay) = engine.before_call("f", &(3,), &env) else {
            panic!("expected a hit");
        };
        let stored = &engine.table("f").unwrap().records()[0];
        assert!(std::ptr::eq(replay.record(), &**stored));
        assert!(replay.retval().ptr_eq(&stored.retval));
    }

    #[test]
    fn test_corrupt_cache_resilience() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        std::fs::write(store.records_path("f"), [1, 0, 0, 0, 8]).unwrap();

        let mut engine = Engine::new(config(&dir));
        let env = Snapshot::isolated();
        assert_eq!(call(&mut engine, "f", 3, &env, |_| 9), (9, false));
        assert_eq!(call(&mut engine, "f", 3, &env, |_| 9), (9, true));
        assert!(engine.flush_all().is_ok());
        let deps = store.load_dependencies("f").unwrap();
        assert_eq!(store.load_records("f", &deps).unwrap().len(), 1);
    }

    #[test]
    fn test_flush_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();

        let mut engine = Engine::new(Config::default().with_cache_dir(&blocker));
        let env = Snapshot::isolated();
        call(&mut engine, "f", 1, &env, |_| 1);
        let report = engine.flush_all();
        assert!(!report.is_ok());
        assert_eq!(report.written, 0);
        assert!(engine.table("f").unwrap().is_dirty());
    }

    #[test]
    fn test_disabled() {
        let dir = TempDir::new().unwrap();
        let mut engine = Engine::new(config(&dir).with_enabled(false));
        let env = Snapshot::isolated();
        assert_eq!(call(&mut engine, "f", 1, &env, |_| 1), (1, false));
        assert_eq!(call(&mut engine, "f", 1, &env, |_| 1), (1, false));
        assert!(engine.table("f").is_none());
        assert_eq!(engine.flush_all().written, 0);
    }
}
