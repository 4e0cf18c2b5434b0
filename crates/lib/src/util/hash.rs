//! Content hashing for specs and change sets.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::consts::HASH_PREFIX_LEN;

pub type HashError = serde_json::Error;

/// A truncated SHA-256 digest of a JSON-serialized value.
///
/// The hash is a lowercase hexadecimal string of `HASH_PREFIX_LEN`
/// characters, e.g. `"a1b2c3d4e5f6789012ab"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectHash(pub String);

impl std::fmt::Display for ObjectHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

pub trait Hashable: Serialize {
  fn compute_hash(&self) -> Result<ObjectHash, HashError> {
    let serialized = serde_json::to_vec(self)?;
    Ok(hash_bytes(&serialized))
  }
}

impl Hashable for crate::value::MappingNode {}

/// Hash arbitrary bytes into a truncated object hash.
pub fn hash_bytes(bytes: &[u8]) -> ObjectHash {
  let digest = Sha256::digest(bytes);
  let full = hex::encode(digest);
  ObjectHash(full[..HASH_PREFIX_LEN].to_string())
}
