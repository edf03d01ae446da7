//! Error type of the fetch client.

use std::sync::Arc;
use thiserror::Error;

use crate::resource::Resource;

/// Errors returned by the cache, executor and fetch invocation.
///
/// Everything except [`Error::RequestFailed`] and [`Error::Aborted`] is a
/// misuse by the host application and is reported before any request is made.
#[derive(Debug, Clone, Error)]
pub enum Error {
  /// The resource handed to the executor already left the latent stage.
  #[error("cannot execute resource {cache_key}: stage is {stage}, expected latent")]
  NotLatent {
    cache_key: String,
    stage: &'static str,
  },

  #[error("no api profile configured for '{0}'")]
  MissingApi(String),

  /// Two method descriptors were registered under one logical key.
  #[error("a method with key '{0}' is already registered")]
  DuplicateKey(String),

  #[error("failed to serialize params: {0}")]
  InvalidParams(String),

  /// The request settled in the fail stage. The resource carries the details
  /// and is also what the cache holds for its key.
  #[error("request {} failed: {}", .0.cache_key, .0.failure_message())]
  RequestFailed(Arc<Resource>),

  /// The request task went away without settling (runtime shutdown or panic).
  #[error("request {0} was dropped before it settled")]
  Aborted(String),
}

impl Error {
  /// The failed resource, if this error carries one.
  pub fn resource(&self) -> Option<&Arc<Resource>> {
    match self {
      Error::RequestFailed(resource) => Some(resource),
      _ => None,
    }
  }
}
