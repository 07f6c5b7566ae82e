use std::fmt::{self, Debug, Formatter};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::codec::{self, Encoded};
use crate::error::Result;

/// The canonical key of an argument list, with precomputed hash.
///
/// # `Hash` and `Eq`
/// Hashing only writes the precomputed 128-bit digest, so a key can be used
/// with a [passthrough map](crate::passthroughhasher::PassthroughHashMap)
/// without rehashing the argument bytes. Equality compares the digest first
/// and then the encoded bytes, so two argument lists that happen to collide
/// on the digest still end up in distinct buckets.
#[derive(Clone)]
pub struct ArgsKey {
    /// The precomputed hash of `bytes`.
    hash: u128,
    /// The canonical encoding of the argument list.
    bytes: Encoded,
}

impl ArgsKey {
    /// Encode an argument list into a key.
    ///
    /// Fails with [`Unserializable`](crate::Error::Unserializable) for
    /// arguments that cannot be encoded.
    pub fn encode<T: Serialize + ?Sized>(args: &T) -> Result<Self> {
        codec::encode(args).map(Self::from_encoded)
    }

    /// Wrap already encoded argument bytes.
    pub fn from_encoded(bytes: Encoded) -> Self {
        Self { hash: codec::hash_bytes(bytes.as_bytes()), bytes }
    }

    /// The encoded argument list.
    #[inline]
    pub fn encoded(&self) -> &Encoded {
        &self.bytes
    }

    /// The precomputed digest.
    #[inline]
    pub fn digest(&self) -> u128 {
        self.hash
    }
}

impl Hash for ArgsKey {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u128(self.hash);
    }
}

impl Eq for ArgsKey {}

impl PartialEq for ArgsKey {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.bytes == other.bytes
    }
}

impl Debug for ArgsKey {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "ArgsKey({:08x}, {} bytes)", self.hash as u32, self.bytes.len())
    }
}

// Only the bytes go to disk. The digest is recomputed on load so that a
// change of hash function never produces stale buckets.
impl Serialize for ArgsKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.bytes.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ArgsKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Encoded::deserialize(deserializer).map(Self::from_encoded)
    }
}
