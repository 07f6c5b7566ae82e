//! The canonical value codec.
//!
//! Values are encoded with bincode's fixed-width little-endian format, which
//! is deterministic for a given serde data model: two values that serialize
//! the same way produce identical bytes. Map types with unspecified iteration
//! order (`HashMap`) are therefore not canonical; hosts should hand in
//! ordered maps.

use std::fmt::{self, Debug, Display, Formatter};
use std::hash::{Hash, Hasher};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use siphasher::sip128::{Hasher128, SipHasher13};

use crate::error::{Error, Result};

/// The canonical encoding of a value.
///
/// Equality is structural on the bytes, which is the codec's notion of
/// value equality.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Encoded(Vec<u8>);

impl Encoded {
    /// The raw encoded bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The number of encoded bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the encoding is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Debug for Encoded {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "Encoded({} bytes)", self.0.len())
    }
}

/// Encode a value into its canonical bytes.
///
/// Fails with [`Error::Unserializable`] when the value refuses to serialize,
/// e.g. because it holds an open handle.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Encoded> {
    bincode::serialize(value)
        .map(Encoded)
        .map_err(|err| Error::Unserializable(err.to_string()))
}

/// Decode a value from its canonical bytes.
pub fn decode<T: DeserializeOwned>(encoded: &Encoded) -> Result<T> {
    bincode::deserialize(&encoded.0).map_err(|err| Error::Decode(err.to_string()))
}

/// Produce a 128-bit hash of raw bytes.
#[inline]
pub(crate) fn hash_bytes(bytes: &[u8]) -> u128 {
    let mut state = SipHasher13::new();
    state.write(bytes);
    state.finish128().as_u128()
}

/// A version marker for a code unit or other static dependency.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(u128);

impl Fingerprint {
    /// Fingerprint a hashable value, typically a code unit's source text.
    #[inline]
    pub fn of<T: Hash + ?Sized>(value: &T) -> Self {
        let mut state = SipHasher13::new();
        value.hash(&mut state);
        Self(state.finish128().as_u128())
    }

    /// Wrap a host-provided version number.
    #[inline]
    pub const fn from_raw(raw: u128) -> Self {
        Self(raw)
    }

    /// The raw fingerprint value.
    #[inline]
    pub const fn into_raw(self) -> u128 {
        self.0
    }
}

impl Debug for Fingerprint {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "Fingerprint({:032x})", self.0)
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}
