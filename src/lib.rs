//! Client-side data fetching with a shared, persisted resource cache.
//!
//! Every call to a [`FetchMethod`] produces a [`Resource`] that moves through
//! `Latent → InFlight → Success | Fail`; each step is written to the
//! [`ClientCache`] under a derived cache key, so readers can render whatever
//! the cache currently holds and subscribe to changes. Resources in the disk
//! partition are persisted through a [`PersistedStore`] and come back on the
//! next start.
//!
//! ```no_run
//! use fetchcache::{
//!   create_cache, ApiClient, ApiConfigs, ApiProfile, FetchMethod, KeyRegistry, MethodDescriptor,
//!   Params, Partition, SqliteStore,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> color_eyre::Result<()> {
//! let cache = create_cache(Arc::new(SqliteStore::open()?), 500);
//! let apis = ApiConfigs::with_default(ApiProfile::new("https://api.example.com"));
//! let client = ApiClient::with_reqwest(apis, cache)?;
//!
//! let registry = KeyRegistry::new();
//! let users = FetchMethod::new(
//!   &registry,
//!   MethodDescriptor::new("users", "/users").with_partition(Partition::Disk),
//! )?;
//!
//! let resource = users.fetch(&client, Params::new()).await?.await?;
//! println!("{:?}", resource.payload());
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod cache;
pub mod client;
mod error;
pub mod executor;
pub mod fetch;
pub mod method;
pub mod resource;
pub mod transport;

#[cfg(test)]
mod testing;

pub use api::{ApiConfigs, ApiProfile, DEFAULT_API};
pub use cache::{
  create_cache, CacheStrategy, ClientCache, MemoryStore, PersistedStore, ResourceCountStrategy,
  SqliteStore, Subscription,
};
pub use client::ApiClient;
pub use error::Error;
pub use executor::{Loading, Settlement};
pub use fetch::FetchMethod;
pub use method::{KeyRegistry, MethodDescriptor, PathSpec};
pub use resource::{
  Fail, Flag, HttpMethod, MethodOptions, Params, Partition, Previous, Query, Resource, Stage,
  Success,
};
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
