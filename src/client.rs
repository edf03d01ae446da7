//! Client handle tying the cache to an executor.

use color_eyre::Result;
use std::sync::Arc;

use crate::api::ApiConfigs;
use crate::cache::ClientCache;
use crate::error::Error;
use crate::executor::{Executor, Loading};
use crate::resource::Resource;
use crate::transport::{ReqwestTransport, Transport};

struct ClientInner {
  executor: Executor,
  cache: ClientCache,
}

/// Cheap to clone; every clone shares one cache and executor.
#[derive(Clone)]
pub struct ApiClient {
  inner: Arc<ClientInner>,
}

impl ApiClient {
  pub fn new(apis: ApiConfigs, cache: ClientCache, transport: Arc<dyn Transport>) -> Self {
    Self {
      inner: Arc::new(ClientInner {
        executor: Executor::new(apis, transport),
        cache,
      }),
    }
  }

  /// Client sending requests over HTTP with `reqwest`.
  pub fn with_reqwest(apis: ApiConfigs, cache: ClientCache) -> Result<Self> {
    let transport = ReqwestTransport::new()?;
    Ok(Self::new(apis, cache, Arc::new(transport)))
  }

  pub fn cache(&self) -> &ClientCache {
    &self.inner.cache
  }

  /// Start the request for a latent resource. See [`Executor::execute`].
  pub fn execute(&self, resource: Resource) -> std::result::Result<Loading, Error> {
    self.inner.executor.execute(resource, self)
  }
}
