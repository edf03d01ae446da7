//! Cache key derivation.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::resource::Partition;

/// Derive the cache key for one request.
///
/// Layout is `{partition}:{logical_key}:{digest}`, with `:{nonce}` appended
/// for independent requests so that every call gets its own slot. The digest
/// covers the api id, logical key and params signature, each length-prefixed,
/// so keys of distinct tuples never coincide.
pub fn derive_key(
  api: &str,
  logical_key: &str,
  partition: Partition,
  independent: bool,
  signature: &str,
) -> String {
  let mut hasher = Sha256::new();
  for part in [api, logical_key, signature] {
    hasher.update((part.len() as u64).to_be_bytes());
    hasher.update(part.as_bytes());
  }
  let digest = hex::encode(hasher.finalize());

  let key = format!("{}:{}:{}", partition.as_str(), logical_key, digest);
  if independent {
    format!("{}:{}", key, Uuid::new_v4().simple())
  } else {
    key
  }
}
