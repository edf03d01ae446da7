//! API profiles supplied by the host application.

use color_eyre::{eyre::Report, Result};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::client::ApiClient;
use crate::resource::{Params, Resource};
use crate::transport::HttpResponse;

/// Profile id used when a method descriptor names no api.
pub const DEFAULT_API: &str = "default-api";

pub type Headers = BTreeMap<String, String>;

/// Called with the failed resource before its request settles.
pub type OnRequestFail =
  Arc<dyn Fn(&Resource, &ApiClient, Option<&Report>, Option<&HttpResponse>) + Send + Sync>;

/// Runs before every request; may contribute headers such as bearer tokens.
pub type Authenticator =
  Arc<dyn Fn(&ApiClient) -> BoxFuture<'static, Result<Option<Headers>>> + Send + Sync>;

pub type PrepareBody = Arc<dyn Fn(&Params) -> Result<Option<String>> + Send + Sync>;

pub type HandleResponse = Arc<dyn Fn(&HttpResponse) -> Result<Value> + Send + Sync>;

/// Configuration for one remote API.
#[derive(Clone)]
pub struct ApiProfile {
  pub base_path: String,
  pub on_request_fail: OnRequestFail,
  pub headers: Headers,
  pub authenticator: Option<Authenticator>,
  /// Log every outgoing request
  pub debug: bool,
  pub prepare_body: Option<PrepareBody>,
  pub handle_response: Option<HandleResponse>,
}

impl ApiProfile {
  pub fn new(base_path: impl Into<String>) -> Self {
    Self {
      base_path: base_path.into(),
      on_request_fail: Arc::new(
        |_: &Resource, _: &ApiClient, _: Option<&Report>, _: Option<&HttpResponse>| {},
      ),
      headers: Headers::new(),
      authenticator: None,
      debug: false,
      prepare_body: None,
      handle_response: None,
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }

  pub fn with_debug(mut self, debug: bool) -> Self {
    self.debug = debug;
    self
  }

  pub fn on_request_fail<F>(mut self, callback: F) -> Self
  where
    F: Fn(&Resource, &ApiClient, Option<&Report>, Option<&HttpResponse>) + Send + Sync + 'static,
  {
    self.on_request_fail = Arc::new(callback);
    self
  }

  /// Set an authenticator. The returned future must own whatever it needs
  /// from the client.
  pub fn with_authenticator<F, Fut>(mut self, authenticator: F) -> Self
  where
    F: Fn(&ApiClient) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Headers>>> + Send + 'static,
  {
    self.authenticator = Some(Arc::new(
      move |client: &ApiClient| -> BoxFuture<'static, Result<Option<Headers>>> {
        Box::pin(authenticator(client))
      },
    ));
    self
  }

  pub fn with_prepare_body<F>(mut self, prepare: F) -> Self
  where
    F: Fn(&Params) -> Result<Option<String>> + Send + Sync + 'static,
  {
    self.prepare_body = Some(Arc::new(prepare));
    self
  }

  pub fn with_handle_response<F>(mut self, handle: F) -> Self
  where
    F: Fn(&HttpResponse) -> Result<Value> + Send + Sync + 'static,
  {
    self.handle_response = Some(Arc::new(handle));
    self
  }
}

impl fmt::Debug for ApiProfile {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ApiProfile")
      .field("base_path", &self.base_path)
      .field("headers", &self.headers)
      .field("authenticator", &self.authenticator.is_some())
      .field("debug", &self.debug)
      .finish_non_exhaustive()
  }
}

/// API profiles keyed by api id.
#[derive(Debug, Clone, Default)]
pub struct ApiConfigs {
  profiles: HashMap<String, Arc<ApiProfile>>,
}

impl ApiConfigs {
  pub fn new() -> Self {
    Self::default()
  }

  /// Configs holding a single profile under [`DEFAULT_API`].
  pub fn with_default(profile: ApiProfile) -> Self {
    Self::new().with(DEFAULT_API, profile)
  }

  pub fn with(mut self, id: impl Into<String>, profile: ApiProfile) -> Self {
    self.insert(id, profile);
    self
  }

  pub fn insert(&mut self, id: impl Into<String>, profile: ApiProfile) {
    self.profiles.insert(id.into(), Arc::new(profile));
  }

  pub fn get(&self, id: &str) -> Option<&Arc<ApiProfile>> {
    self.profiles.get(id)
  }
}
