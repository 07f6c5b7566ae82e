use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default directory for persisted memo tables.
pub const DEFAULT_CACHE_DIR: &str = "incmemo-cache";

/// Default number of consecutive fast, empty calls before a function is
/// considered not worth memoizing.
pub const DEFAULT_IGNORE_THRESHOLD: u32 = 50;

/// Default cost floor below which an execution counts as fast.
pub const DEFAULT_FAST_CALL_FLOOR: Duration = Duration::from_millis(100);

/// Engine configuration.
///
/// Controllable through the environment with [`Config::from_env`]:
/// - `INCMEMO_DISABLE`: disable memoization entirely
/// - `INCMEMO_CACHE_DIR`: directory for persisted tables
/// - `INCMEMO_IGNORE_THRESHOLD`: opt-out threshold, `0` turns it off
/// - `INCMEMO_FAST_CALL_MS`: cost floor for the opt-out heuristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Whether memoization happens at all.
    pub enabled: bool,
    /// Where the per-function artifacts live.
    pub cache_dir: PathBuf,
    /// After this many consecutive fast calls that cached nothing, stop
    /// trying to memoize the function. `None` never gives up.
    pub ignore_threshold: Option<u32>,
    /// Executions cheaper than this count as fast.
    pub fast_call_floor: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            ignore_threshold: Some(DEFAULT_IGNORE_THRESHOLD),
            fast_call_floor: DEFAULT_FAST_CALL_FLOOR,
        }
    }
}

impl Config {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Read the configuration through a variable lookup function.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if var("INCMEMO_DISABLE").is_some() {
            config.enabled = false;
        }

        if let Some(dir) = var("INCMEMO_CACHE_DIR").filter(|dir| !dir.is_empty()) {
            config.cache_dir = PathBuf::from(dir);
        }

        if let Some(threshold) = parse::<u32>("INCMEMO_IGNORE_THRESHOLD", &var) {
            config.ignore_threshold = (threshold > 0).then_some(threshold);
        }

        if let Some(ms) = parse::<u64>("INCMEMO_FAST_CALL_MS", &var) {
            config.fast_call_floor = Duration::from_millis(ms);
        }

        config
    }

    /// Use a different cache directory.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// Enable or disable memoization.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the opt-out threshold.
    pub fn with_ignore_threshold(mut self, threshold: Option<u32>) -> Self {
        self.ignore_threshold = threshold;
        self
    }

    /// Set the fast-call cost floor.
    pub fn with_fast_call_floor(mut self, floor: Duration) -> Self {
        self.fast_call_floor = floor;
        self
    }
}

/// Parse a numeric variable, ignoring (and logging) garbage.
fn parse<T: FromStr>(name: &str, var: &impl Fn(&str) -> Option<String>) -> Option<T> {
    let raw = var(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}
