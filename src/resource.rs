//! Resource data model: the cached state machine for one request instance.
//!
//! A [`Resource`] is what the cache stores under a cache key. Its [`Stage`]
//! carries the outcome record for settled requests, so a success and a
//! failure can never be populated at the same time. Process-local handles
//! (completion future, raw response, raw error) are not part of this type;
//! they live in the cache's side-table and never reach the persisted blob.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::api::DEFAULT_API;

/// Current time at the millisecond precision resources are persisted with.
pub(crate) fn now() -> DateTime<Utc> {
  Utc::now().trunc_subsecs(3)
}

/// Cache partition. Only `Disk` resources survive a restart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
  #[default]
  Memory,
  Disk,
}

impl Partition {
  pub fn as_str(&self) -> &'static str {
    match self {
      Partition::Memory => "memory",
      Partition::Disk => "disk",
    }
  }

  /// Partition encoded at the front of a derived cache key.
  pub fn of_key(cache_key: &str) -> Option<Self> {
    match cache_key.split_once(':').map(|(prefix, _)| prefix) {
      Some("memory") => Some(Partition::Memory),
      Some("disk") => Some(Partition::Disk),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
  #[default]
  Get,
  Post,
  Put,
  Delete,
}

impl HttpMethod {
  pub fn as_str(&self) -> &'static str {
    match self {
      HttpMethod::Get => "GET",
      HttpMethod::Post => "POST",
      HttpMethod::Put => "PUT",
      HttpMethod::Delete => "DELETE",
    }
  }
}

/// Out-of-band invalidation marker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Flag {
  #[default]
  Stable,
  NeedsRefetch,
}

/// Query parameters of a call.
///
/// A key mapped to `None` is absent: it is left out of both the query string
/// and the request signature. `Some(Value::Null)` is an explicit null and is
/// sent as an empty value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query(BTreeMap<String, Option<Value>>);

impl Query {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
    self.0.insert(key.into(), Some(value.into()));
  }

  pub fn insert_opt(&mut self, key: impl Into<String>, value: Option<impl Into<Value>>) {
    self.0.insert(key.into(), value.map(Into::into));
  }

  pub fn iter(&self) -> impl Iterator<Item = (&String, Option<&Value>)> {
    self.0.iter().map(|(k, v)| (k, v.as_ref()))
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

impl Serialize for Query {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_map(
      self
        .0
        .iter()
        .filter_map(|(key, value)| value.as_ref().map(|v| (key, v))),
    )
  }
}

impl<'de> Deserialize<'de> for Query {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let map = BTreeMap::<String, Value>::deserialize(deserializer)?;
    Ok(Self(map.into_iter().map(|(k, v)| (k, Some(v))).collect()))
  }
}

/// Caller-supplied input of a call. Opaque to the cache apart from being
/// part of the request signature.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Params {
  #[serde(default, skip_serializing_if = "Query::is_empty")]
  pub query: Query,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<Value>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub headers: BTreeMap<String, String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub meta: Option<Value>,
}

impl Params {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_query(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
    self.query.insert(key, value);
    self
  }

  pub fn with_body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }

  pub fn with_meta(mut self, meta: Value) -> Self {
    self.meta = Some(meta);
    self
  }

  /// JSON text identifying these params inside a cache key.
  pub fn signature(&self) -> serde_json::Result<String> {
    serde_json::to_string(self)
  }
}

/// Realized request description, fixed once a resource is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodOptions {
  pub path: String,
  pub key: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub api: Option<String>,
  /// Age in milliseconds after which a cached resource should be refetched.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub refetch_interval_ms: Option<u64>,
  #[serde(default)]
  pub method: HttpMethod,
  #[serde(default, rename = "cache")]
  pub partition: Partition,
  pub independent: bool,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub headers: BTreeMap<String, String>,
  #[serde(default)]
  pub extract_headers: bool,
}

impl MethodOptions {
  /// API profile id, falling back to the default profile.
  pub fn api_id(&self) -> &str {
    self.api.as_deref().unwrap_or(DEFAULT_API)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Success {
  pub payload: Value,
  pub status: u16,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub headers: Option<BTreeMap<String, String>>,
  #[serde(with = "chrono::serde::ts_milliseconds")]
  pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fail {
  /// HTTP status, or `None` when the failure never produced a response.
  pub status: Option<u16>,
  pub message: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub payload: Option<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub headers: Option<BTreeMap<String, String>>,
  #[serde(with = "chrono::serde::ts_milliseconds")]
  pub timestamp: DateTime<Utc>,
  /// Client-side (4xx) failure. Classification only, nothing retries.
  pub terminal: bool,
}

/// Request stage. Settled stages own their outcome record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "kebab-case")]
pub enum Stage {
  Latent,
  InFlight,
  Success { success: Success },
  Fail { fail: Fail },
}

impl Stage {
  pub fn name(&self) -> &'static str {
    match self {
      Stage::Latent => "latent",
      Stage::InFlight => "in-flight",
      Stage::Success { .. } => "success",
      Stage::Fail { .. } => "fail",
    }
  }

  pub fn is_settled(&self) -> bool {
    matches!(self, Stage::Success { .. } | Stage::Fail { .. })
  }
}

/// Outcomes of earlier requests on the same cache key, kept until a newer
/// outcome of the same kind replaces them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Previous {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub success: Option<Success>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub fail: Option<Fail>,
}

impl Previous {
  /// Latest outcomes known for `resource`, its own stage taking precedence.
  fn carried_by(resource: &Resource) -> Self {
    Self {
      success: resource.latest_success().cloned(),
      fail: resource.latest_fail().cloned(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.success.is_none() && self.fail.is_none()
  }
}

/// Cached state of one logical request instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
  pub method_options: MethodOptions,
  pub params: Params,
  pub cache_key: String,
  #[serde(with = "chrono::serde::ts_milliseconds")]
  pub timestamp: DateTime<Utc>,
  #[serde(flatten)]
  pub stage: Stage,
  #[serde(default)]
  pub flag: Flag,
  /// Outcomes carried over from the resource this one was seeded from.
  /// A success clears them; a failure only replaces the previous failure.
  #[serde(default, skip_serializing_if = "Previous::is_empty")]
  pub previous: Previous,
}

impl Resource {
  /// Build a fresh latent resource.
  ///
  /// When `seed` is given (a shared key being refetched), its outcomes are
  /// kept in `previous` so readers can keep showing them.
  pub fn latent(
    method_options: MethodOptions,
    params: Params,
    cache_key: String,
    seed: Option<&Resource>,
  ) -> Self {
    let previous = seed.map(Previous::carried_by).unwrap_or_default();

    Self {
      method_options,
      params,
      cache_key,
      timestamp: now(),
      stage: Stage::Latent,
      flag: Flag::Stable,
      previous,
    }
  }

  pub fn to_in_flight(&self) -> Self {
    Self {
      stage: Stage::InFlight,
      ..self.clone()
    }
  }

  pub fn to_success(&self, success: Success) -> Self {
    Self {
      stage: Stage::Success { success },
      previous: Previous::default(),
      ..self.clone()
    }
  }

  pub fn to_fail(&self, fail: Fail) -> Self {
    Self {
      stage: Stage::Fail { fail },
      previous: Previous {
        success: self.previous.success.clone(),
        fail: None,
      },
      ..self.clone()
    }
  }

  pub fn with_flag(&self, flag: Flag) -> Self {
    Self {
      flag,
      ..self.clone()
    }
  }

  pub fn success(&self) -> Option<&Success> {
    match &self.stage {
      Stage::Success { success } => Some(success),
      _ => None,
    }
  }

  pub fn fail(&self) -> Option<&Fail> {
    match &self.stage {
      Stage::Fail { fail } => Some(fail),
      _ => None,
    }
  }

  fn latest_success(&self) -> Option<&Success> {
    self.success().or(self.previous.success.as_ref())
  }

  fn latest_fail(&self) -> Option<&Fail> {
    self.fail().or(self.previous.fail.as_ref())
  }

  /// Most recent success payload, including one carried over from a
  /// previous request on this key.
  pub fn payload(&self) -> Option<&Value> {
    self.latest_success().map(|s| &s.payload)
  }

  /// Failure worth reporting: hidden only by a strictly newer success.
  pub fn current_fail(&self) -> Option<&Fail> {
    let fail = self.latest_fail()?;
    match self.latest_success() {
      Some(success) if success.timestamp > fail.timestamp => None,
      _ => Some(fail),
    }
  }

  /// Whether a reader should trigger a new request for this resource.
  pub fn needs_refetch(&self, renew_time: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    if self.flag == Flag::NeedsRefetch || self.timestamp < renew_time {
      return true;
    }

    self
      .method_options
      .refetch_interval_ms
      .and_then(|ms| i64::try_from(ms).ok())
      .is_some_and(|ms| self.timestamp < now - Duration::milliseconds(ms))
  }

  pub(crate) fn failure_message(&self) -> &str {
    self
      .fail()
      .map(|f| f.message.as_str())
      .unwrap_or("resource did not fail")
  }
}
