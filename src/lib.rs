//! Automatic, persistent memoization.
//!
//! A memoized function's results are stored together with everything the
//! execution depended on: global variables it read, files it read (with
//! their modification times), and the code it ran. A later call with equal
//! arguments replays the stored result, including captured output, as long
//! as all of those dependencies still hold. Tables are persisted per function
//! and loaded lazily, so results survive across runs.
//!
//! ```no_run
//! #[incmemo::memoize]
//! fn word_count(path: String) -> usize {
//!     let text = incmemo::read_to_string(&path).unwrap_or_default();
//!     text.split_whitespace().count()
//! }
//!
//! let first = word_count("notes.txt".into());
//! let again = word_count("notes.txt".into()); // replayed
//! assert_eq!(first, again);
//! incmemo::flush();
//! ```
//!
//! Hosts that run their own interpreter drive an [`Engine`] directly through
//! [`Engine::before_call`] and [`Engine::after_call`], supplying the current
//! state through an [`Environment`].

mod codec;
mod config;
mod engine;
mod env;
mod error;
mod key;
mod matcher;
mod memoize;
mod passthroughhasher;
mod record;
mod store;
mod table;
mod trace;
mod value;

#[cfg(feature = "testing")]
mod testing;

pub use crate::codec::{Encoded, Fingerprint, decode, encode};
pub use crate::config::{
    Config, DEFAULT_CACHE_DIR, DEFAULT_FAST_CALL_FLOOR, DEFAULT_IGNORE_THRESHOLD,
};
pub use crate::engine::{
    CallFrame, Decision, Engine, FlushReport, Insertion, Outcome, Replay, Skip, Stats,
};
pub use crate::env::{Environment, Snapshot, fs_mtime};
pub use crate::error::{Error, Result};
pub use crate::key::ArgsKey;
pub use crate::matcher::{is_valid, lookup};
pub use crate::memoize::{
    configure, flush, global, mark_impure, print_stderr, print_stdout, read_to_string,
    set_global, stats, write,
};
pub use crate::record::{FileTimes, GlobalReads, MemoRecord, RetBox, SeekPositions};
pub use crate::store::{DEPENDENCIES_SUFFIX, FORMAT_VERSION, RECORDS_SUFFIX, Store, escape_name};
pub use crate::table::{CodeDependencies, FuncMemoInfo};
pub use crate::trace::Trace;
pub use crate::value::{Handle, Value};

#[cfg(feature = "macros")]
pub use incmemo_macros::memoize;

/// These are implementation details. Do not rely on them!
#[doc(hidden)]
pub mod internal {
    pub use linkme;

    pub use crate::memoize::{CODE_UNITS, CodeUnit, memoized};

    #[cfg(feature = "testing")]
    pub use crate::testing::{executions, last_was_hit};
}
