//! Fetch invocation: turns a method descriptor and params into a request.

use tracing::debug;

use crate::cache::derive_key;
use crate::client::ApiClient;
use crate::error::Error;
use crate::executor::Loading;
use crate::method::{KeyRegistry, MethodDescriptor};
use crate::resource::{Params, Resource};

/// A registered API method, ready to be called.
#[derive(Debug, Clone)]
pub struct FetchMethod {
  descriptor: MethodDescriptor,
}

impl FetchMethod {
  /// Register `descriptor` under its logical key.
  pub fn new(registry: &KeyRegistry, descriptor: MethodDescriptor) -> Result<Self, Error> {
    registry.register(&descriptor.key)?;
    Ok(Self { descriptor })
  }

  pub fn descriptor(&self) -> &MethodDescriptor {
    &self.descriptor
  }

  /// Cache key a call with `params` reads and writes.
  ///
  /// Independent methods get a fresh key on every call.
  pub fn cache_key(&self, params: &Params) -> Result<String, Error> {
    let signature = params
      .signature()
      .map_err(|e| Error::InvalidParams(e.to_string()))?;

    Ok(derive_key(
      self.descriptor.api_id(),
      &self.descriptor.key,
      self.descriptor.partition,
      self.descriptor.is_independent(),
      &signature,
    ))
  }

  /// Call the method.
  ///
  /// Waits for the cache to be ready, then starts the request. The returned
  /// handle resolves to the success resource, or to
  /// [`Error::RequestFailed`] with the fail resource.
  pub async fn fetch(&self, client: &ApiClient, params: Params) -> Result<Loading, Error> {
    let method_options = self.descriptor.realize(&params);
    let cache_key = self.cache_key(&params)?;

    client.cache().ready().await;

    let seed = if method_options.independent {
      None
    } else {
      client.cache().get(&cache_key)
    };
    debug!(
      cache_key = %cache_key,
      seeded = seed.is_some(),
      "Fetching"
    );

    let resource = Resource::latent(method_options, params, cache_key, seed.as_deref());
    client.execute(resource)
  }
}
