use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::codec::{self, Encoded};
use crate::error::Result;
use crate::key::ArgsKey;

/// Global variable name to encoded value.
pub type GlobalReads = BTreeMap<String, Encoded>;

/// File path to modification time.
pub type FileTimes = BTreeMap<PathBuf, SystemTime>;

/// File path to seek offset.
pub type SeekPositions = BTreeMap<PathBuf, u64>;

/// One observed, reusable execution of a function.
///
/// The optional fields constrain matching only when present: a record
/// without `global_vars_read` matches regardless of global state. Absent
/// fields are still written to disk (as `None`), since the artifact format
/// is not self-describing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoRecord {
    /// The canonical argument list.
    pub args: ArgsKey,
    /// Globals read during the call, with their values at call time.
    pub global_vars_read: Option<GlobalReads>,
    /// Files read during the call, with their mtimes at read time.
    pub files_read: Option<FileTimes>,
    /// Files written during the call, with their mtimes at completion.
    pub files_written: Option<FileTimes>,
    /// The return value.
    pub retval: RetBox,
    /// Captured standard output.
    pub stdout_buf: Option<String>,
    /// Captured standard error.
    pub stderr_buf: Option<String>,
    /// Seek offsets of files still open at exit.
    pub final_file_seek_pos: Option<SeekPositions>,
    /// Wall-clock cost of the original execution in milliseconds.
    pub runtime_ms: u64,
}

impl MemoRecord {
    /// The original execution's cost.
    pub fn runtime(&self) -> Duration {
        Duration::from_millis(self.runtime_ms)
    }
}

/// A single-slot, copy-on-write box holding an encoded return value.
///
/// Clones share the slot. Mutation through [`make_mut`](Self::make_mut)
/// detaches the box first when it is shared, so a caller that got a box from
/// a cache hit can modify it freely without the stored record observing the
/// change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetBox(Arc<Encoded>);

impl RetBox {
    /// Box an encoded value.
    pub fn new(value: Encoded) -> Self {
        Self(Arc::new(value))
    }

    /// Encode a value into a fresh box.
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        codec::encode(value).map(Self::new)
    }

    /// The boxed encoding.
    #[inline]
    pub fn get(&self) -> &Encoded {
        &self.0
    }

    /// Decode a fresh copy of the boxed value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        codec::decode(&self.0)
    }

    /// Mutable access to the slot, copying it first if it is shared.
    pub fn make_mut(&mut self) -> &mut Encoded {
        Arc::make_mut(&mut self.0)
    }

    /// Replace the slot's contents, detaching from other clones.
    pub fn set(&mut self, value: Encoded) {
        *self.make_mut() = value;
    }

    /// Whether two boxes share the same slot.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

// On disk the box is a one-element sequence, mirroring its single slot.
impl Serialize for RetBox {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        (&*self.0,).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RetBox {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let (value,) = <(Encoded,)>::deserialize(deserializer)?;
        Ok(Self::new(value))
    }
}
