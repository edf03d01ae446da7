//! Method descriptors and the registry of logical keys.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::api::{Headers, DEFAULT_API};
use crate::error::Error;
use crate::resource::{HttpMethod, MethodOptions, Params, Partition};

/// Request path, either fixed or computed from the call's params.
#[derive(Clone)]
pub enum PathSpec {
  Static(String),
  Computed(Arc<dyn Fn(&Params) -> String + Send + Sync>),
}

impl PathSpec {
  pub fn realize(&self, params: &Params) -> String {
    match self {
      PathSpec::Static(path) => path.clone(),
      PathSpec::Computed(compute) => compute(params),
    }
  }
}

impl fmt::Debug for PathSpec {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      PathSpec::Static(path) => f.debug_tuple("Static").field(path).finish(),
      PathSpec::Computed(_) => f.write_str("Computed(..)"),
    }
  }
}

/// Declarative description of one API method.
#[derive(Debug, Clone)]
pub struct MethodDescriptor {
  pub path: PathSpec,
  pub key: String,
  pub api: Option<String>,
  pub refetch_interval: Option<Duration>,
  pub method: HttpMethod,
  pub partition: Partition,
  /// `None` means independent for every method except GET.
  pub independent: Option<bool>,
  pub headers: Headers,
  pub extract_headers: bool,
}

impl MethodDescriptor {
  pub fn new(key: impl Into<String>, path: impl Into<String>) -> Self {
    Self::with_path(key.into(), PathSpec::Static(path.into()))
  }

  pub fn computed<F>(key: impl Into<String>, path: F) -> Self
  where
    F: Fn(&Params) -> String + Send + Sync + 'static,
  {
    Self::with_path(key.into(), PathSpec::Computed(Arc::new(path)))
  }

  fn with_path(key: String, path: PathSpec) -> Self {
    Self {
      path,
      key,
      api: None,
      refetch_interval: None,
      method: HttpMethod::Get,
      partition: Partition::Memory,
      independent: None,
      headers: Headers::new(),
      extract_headers: false,
    }
  }

  pub fn with_method(mut self, method: HttpMethod) -> Self {
    self.method = method;
    self
  }

  pub fn with_partition(mut self, partition: Partition) -> Self {
    self.partition = partition;
    self
  }

  pub fn with_independent(mut self, independent: bool) -> Self {
    self.independent = Some(independent);
    self
  }

  pub fn with_api(mut self, api: impl Into<String>) -> Self {
    self.api = Some(api.into());
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }

  pub fn with_extract_headers(mut self, extract: bool) -> Self {
    self.extract_headers = extract;
    self
  }

  pub fn with_refetch_interval(mut self, interval: Duration) -> Self {
    self.refetch_interval = Some(interval);
    self
  }

  pub fn is_independent(&self) -> bool {
    self.independent.unwrap_or(self.method != HttpMethod::Get)
  }

  pub fn api_id(&self) -> &str {
    self.api.as_deref().unwrap_or(DEFAULT_API)
  }

  /// Fix the descriptor's defaults and path for one call.
  pub fn realize(&self, params: &Params) -> MethodOptions {
    MethodOptions {
      path: self.path.realize(params),
      key: self.key.clone(),
      api: self.api.clone(),
      refetch_interval_ms: self
        .refetch_interval
        .map(|interval| u64::try_from(interval.as_millis()).unwrap_or(u64::MAX)),
      method: self.method,
      partition: self.partition,
      independent: self.is_independent(),
      headers: self.headers.clone(),
      extract_headers: self.extract_headers,
    }
  }
}

/// Logical keys in use by one application.
#[derive(Debug, Default)]
pub struct KeyRegistry {
  keys: Mutex<HashSet<String>>,
}

impl KeyRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Claim `key`, failing if another method already uses it.
  pub fn register(&self, key: &str) -> Result<(), Error> {
    let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
    if !keys.insert(key.to_string()) {
      return Err(Error::DuplicateKey(key.to_string()));
    }
    Ok(())
  }

  pub fn contains(&self, key: &str) -> bool {
    self
      .keys
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .contains(key)
  }
}
