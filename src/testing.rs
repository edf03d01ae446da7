//! Shared fixtures for unit tests.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::api::{ApiConfigs, ApiProfile};
use crate::cache::{ClientCache, MemoryStore, DEFAULT_STORAGE_KEY};
use crate::client::ApiClient;
use crate::resource::{self, HttpMethod, MethodOptions, Params, Partition, Resource, Success};
use crate::transport::{HttpRequest, HttpResponse, Transport};

fn options(path: &str, logical_key: &str, method: HttpMethod, partition: Partition) -> MethodOptions {
  MethodOptions {
    path: path.to_string(),
    key: logical_key.to_string(),
    api: None,
    refetch_interval_ms: None,
    method,
    partition,
    independent: method != HttpMethod::Get,
    headers: BTreeMap::new(),
    extract_headers: false,
  }
}

/// A successful resource stored under `cache_key`.
pub fn settled_resource(cache_key: &str, logical_key: &str) -> Resource {
  let partition = Partition::of_key(cache_key).unwrap_or_default();
  let latent = Resource::latent(
    options("/", logical_key, HttpMethod::Get, partition),
    Params::new(),
    cache_key.to_string(),
    None,
  );
  latent.to_success(Success {
    payload: Value::String(cache_key.to_string()),
    status: 200,
    headers: None,
    timestamp: resource::now(),
  })
}

/// A latent resource for `path` on the default api.
pub fn latent_resource(path: &str, method: HttpMethod) -> Resource {
  let logical_key = path.trim_start_matches('/');
  Resource::latent(
    options(path, logical_key, method, Partition::Memory),
    Params::new(),
    format!("memory:{}:test", logical_key),
    None,
  )
}

/// An empty cache over a memory store, already rehydrated.
pub async fn ready_cache() -> (ClientCache, Arc<MemoryStore>) {
  let store = Arc::new(MemoryStore::new());
  let cache = ClientCache::new(DEFAULT_STORAGE_KEY, store.clone());
  cache.ready().await;
  (cache, store)
}

/// A client with `profile` as the default api, over a ready memory cache.
pub async fn test_client(profile: ApiProfile, transport: Arc<StubTransport>) -> ApiClient {
  let (cache, _store) = ready_cache().await;
  ApiClient::new(ApiConfigs::with_default(profile), cache, transport)
}

#[derive(Clone)]
enum Reply {
  Response(HttpResponse),
  Error(String),
}

/// Transport answering from canned replies keyed by URL without its query.
///
/// Replies registered for one URL are used in order; the last one repeats.
#[derive(Default)]
pub struct StubTransport {
  routes: Mutex<HashMap<String, VecDeque<Reply>>>,
  requests: Mutex<Vec<HttpRequest>>,
}

impl StubTransport {
  pub fn new() -> Self {
    Self::default()
  }

  fn push(mut self, url: &str, reply: Reply) -> Self {
    self
      .routes
      .get_mut()
      .unwrap()
      .entry(url.to_string())
      .or_default()
      .push_back(reply);
    self
  }

  fn respond(self, url: &str, status: u16, content_type: &str, body: Vec<u8>) -> Self {
    let headers = BTreeMap::from([("content-type".to_string(), content_type.to_string())]);
    self.push(
      url,
      Reply::Response(HttpResponse {
        status,
        headers,
        body,
      }),
    )
  }

  pub fn json(self, url: &str, status: u16, body: Value) -> Self {
    let body = body.to_string().into_bytes();
    self.respond(url, status, "application/json", body)
  }

  pub fn text(self, url: &str, status: u16, body: &str) -> Self {
    self.respond(url, status, "text/plain", body.as_bytes().to_vec())
  }

  pub fn error(self, url: &str, message: &str) -> Self {
    self.push(url, Reply::Error(message.to_string()))
  }

  /// Requests sent so far, in order.
  pub fn requests(&self) -> Vec<HttpRequest> {
    self.requests.lock().unwrap().clone()
  }
}

impl Transport for StubTransport {
  fn send(&self, request: HttpRequest) -> BoxFuture<'static, Result<HttpResponse>> {
    let route = request
      .url
      .split_once('?')
      .map_or(request.url.as_str(), |(base, _)| base)
      .to_string();
    let reply = self.routes.lock().unwrap().get_mut(&route).and_then(|replies| {
      if replies.len() > 1 {
        replies.pop_front()
      } else {
        replies.front().cloned()
      }
    });
    self.requests.lock().unwrap().push(request);

    Box::pin(async move {
      tokio::task::yield_now().await;
      match reply {
        Some(Reply::Response(response)) => Ok(response),
        Some(Reply::Error(message)) => Err(eyre!("{}", message)),
        None => Err(eyre!("no stub for {}", route)),
      }
    })
  }
}
