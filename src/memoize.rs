//! The process-global frontend behind [`#[memoize]`](macro@crate::memoize).
//!
//! One [`Engine`] serves the whole process. Each thread keeps a stack of
//! traces, one per memoized call in progress, and the tracked helpers in this
//! module record into the innermost one.

use std::cell::RefCell;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::codec::{self, Encoded, Fingerprint};
use crate::config::Config;
use crate::engine::{Decision, Engine, FlushReport, Outcome, Replay, Stats};
use crate::env::{self, Environment};
use crate::error::{Error, Result};
use crate::trace::Trace;

/// The global engine, configured from the environment on first use.
static ENGINE: LazyLock<Mutex<Engine>> =
    LazyLock::new(|| Mutex::new(Engine::new(Config::from_env())));

/// Global variables and code fingerprints of the running program.
static REGISTRY: LazyLock<RwLock<Registry>> = LazyLock::new(|| {
    RwLock::new(Registry { globals: FxHashMap::default(), code: registered_code() })
});

/// A memoized function's canonical name and token text.
#[derive(Debug)]
pub struct CodeUnit {
    pub name: &'static str,
    pub source: &'static str,
}

/// Every `#[memoize]` function in the program, collected at link time.
#[linkme::distributed_slice]
pub static CODE_UNITS: [CodeUnit] = [..];

thread_local! {
    /// Traces of the memoized calls currently executing on this thread.
    static FRAMES: RefCell<Vec<Trace>> = const { RefCell::new(Vec::new()) };
}

struct Registry {
    globals: FxHashMap<String, Encoded>,
    code: FxHashMap<&'static str, Fingerprint>,
}

impl Environment for Registry {
    fn global_value(&self, name: &str) -> Option<Encoded> {
        self.globals.get(name).cloned()
    }

    fn file_mtime(&self, path: &Path) -> Option<std::time::SystemTime> {
        env::fs_mtime(path)
    }

    fn code_fingerprint(&self, id: &str) -> Option<Fingerprint> {
        self.code.get(id).copied()
    }
}

/// Fingerprints of the registered code units.
fn registered_code() -> FxHashMap<&'static str, Fingerprint> {
    CODE_UNITS
        .iter()
        .map(|unit| (unit.name, Fingerprint::of(unit.source)))
        .collect()
}

/// Execute a function, reusing a stored result if one is valid.
///
/// `source` is the function's token text; it is the function's code
/// fingerprint. Results depend on the fingerprints of the function and of
/// every memoized function it called, so editing any of them invalidates
/// the results.
pub fn memoized<A, R, F>(name: &'static str, source: &'static str, args: A, func: F) -> R
where
    A: Serialize,
    R: Serialize + DeserializeOwned,
    F: FnOnce(A) -> R,
{
    let fingerprint = Fingerprint::of(source);
    if REGISTRY.read().code.get(name) != Some(&fingerprint) {
        REGISTRY.write().code.insert(name, fingerprint);
    }

    let decision = {
        let registry = REGISTRY.read();
        ENGINE.lock().before_call(name, &args, &*registry)
    };

    let frame = match decision {
        Decision::Hit(replay) => match replay.value() {
            Ok(output) => {
                replay_effects(&replay);
                #[cfg(feature = "testing")]
                crate::testing::register_hit();
                return output;
            }
            Err(err) => {
                warn!(function = name, error = %err, "stored result does not decode");
                None
            }
        },
        Decision::Proceed(frame) => Some(frame),
    };

    let guard = FrameGuard::push();
    record(|trace| trace.depend_on_code(name, fingerprint));
    let output = func(args);
    let trace = guard.finish();

    let exported = trace.clone();
    if let Some(frame) = frame {
        ENGINE.lock().after_call(frame, Outcome::Returned(&output), trace);
    }
    record(|parent| parent.join(exported));

    #[cfg(feature = "testing")]
    crate::testing::register_miss();

    output
}

/// Print the replayed output again and hand its dependencies to the caller.
fn replay_effects(replay: &Replay) {
    if let Some(text) = replay.stdout() {
        print!("{text}");
    }
    if let Some(text) = replay.stderr() {
        eprint!("{text}");
    }
    let trace = replay.trace();
    record(|parent| parent.join(trace));
}

/// Run `f` on the innermost trace, if any call is executing.
fn record(f: impl FnOnce(&mut Trace)) {
    FRAMES.with_borrow_mut(|frames| {
        if let Some(trace) = frames.last_mut() {
            f(trace);
        }
    });
}

/// Keeps the trace stack balanced even if the body panics.
struct FrameGuard {
    depth: usize,
}

impl FrameGuard {
    fn push() -> Self {
        let depth = FRAMES.with_borrow_mut(|frames| {
            frames.push(Trace::new());
            frames.len()
        });
        Self { depth }
    }

    fn finish(self) -> Trace {
        FRAMES
            .with_borrow_mut(|frames| {
                frames.truncate(self.depth);
                frames.pop()
            })
            .unwrap_or_default()
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        FRAMES.with_borrow_mut(|frames| frames.truncate(self.depth - 1));
    }
}

/// Read a global variable.
///
/// The current call depends on the value. Reading an unset global, or one
/// stored as a different type, makes the call impure.
pub fn global<T: DeserializeOwned>(name: &str) -> Option<T> {
    let Some(encoded) = REGISTRY.read().global_value(name) else {
        record(|trace| trace.mark_impure(format!("read unset global `{name}`")));
        return None;
    };

    match codec::decode(&encoded) {
        Ok(value) => {
            record(|trace| trace.read_encoded_global(name, encoded));
            Some(value)
        }
        Err(err) => {
            record(|trace| trace.mark_impure(format!("global `{name}` does not decode: {err}")));
            None
        }
    }
}

/// Set a global variable.
///
/// Assignments are not replayed, so the current call becomes impure.
pub fn set_global<T: Serialize + ?Sized>(name: &str, value: &T) -> Result<()> {
    let encoded = codec::encode(value)?;
    REGISTRY.write().globals.insert(name.into(), encoded);
    record(|trace| trace.mark_impure(format!("assigned global `{name}`")));
    Ok(())
}

/// Read a file, making the current call depend on its modification time.
pub fn read_to_string(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let mtime = env::fs_mtime(path);
    let text = fs::read_to_string(path).map_err(|err| Error::io(path, err))?;
    record(|trace| match mtime {
        Some(mtime) => trace.read_file(path, mtime),
        None => trace.mark_impure(format!("no modification time for {}", path.display())),
    });
    Ok(text)
}

/// Write a file, recording its modification time after the write.
pub fn write(path: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> Result<()> {
    let path = path.as_ref();
    fs::write(path, contents).map_err(|err| Error::io(path, err))?;
    let mtime = env::fs_mtime(path);
    record(|trace| match mtime {
        Some(mtime) => trace.write_file(path, mtime),
        None => trace.mark_impure(format!("no modification time for {}", path.display())),
    });
    Ok(())
}

/// Mark the current call as unsafe to cache.
pub fn mark_impure(reason: &str) {
    record(|trace| trace.mark_impure(reason));
}

/// Print to standard output. The text is replayed when the call is reused.
pub fn print_stdout(text: &str) {
    print!("{text}");
    record(|trace| trace.capture_stdout(text));
}

/// Print to standard error. The text is replayed when the call is reused.
pub fn print_stderr(text: &str) {
    eprint!("{text}");
    record(|trace| trace.capture_stderr(text));
}

/// Write all modified memo tables to the cache directory.
pub fn flush() -> FlushReport {
    ENGINE.lock().flush_all()
}

/// Replace the global engine with a fresh one, as a new run would see it.
///
/// Unflushed results of the previous engine are lost. Code fingerprints
/// observed at run time are forgotten; only registered ones remain known.
pub fn configure(config: Config) {
    *ENGINE.lock() = Engine::new(config);
    REGISTRY.write().code = registered_code();
}

/// Counters of the global engine.
pub fn stats() -> Stats {
    ENGINE.lock().stats()
}
