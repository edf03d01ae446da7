//! Executor driving a resource through its request lifecycle.
//!
//! `Latent → InFlight → Success | Fail`. The in-flight snapshot is written to
//! the cache before any request work starts, and the settled resource is
//! written whatever the outcome. Request work runs on its own task, so it
//! completes and lands in the cache even when nobody awaits the result.

use color_eyre::{
  eyre::{eyre, Report, WrapErr},
  Result,
};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use url::form_urlencoded;

use crate::api::{ApiConfigs, ApiProfile, Headers};
use crate::cache::Attachments;
use crate::client::ApiClient;
use crate::error::Error;
use crate::resource::{self, Fail, Query, Resource, Stage, Success};
use crate::transport::{HttpRequest, HttpResponse, Transport};

/// Result of a settled request: the success resource, or
/// [`Error::RequestFailed`] carrying the fail resource.
pub type Settlement = std::result::Result<Arc<Resource>, Error>;

/// Handle to a request in flight. Cloneable; every clone resolves to the
/// same settlement.
#[derive(Clone)]
pub struct Loading {
  cache_key: String,
  settlement: Shared<BoxFuture<'static, Settlement>>,
}

impl Loading {
  pub fn cache_key(&self) -> &str {
    &self.cache_key
  }
}

impl Future for Loading {
  type Output = Settlement;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Settlement> {
    self.settlement.poll_unpin(cx)
  }
}

impl fmt::Debug for Loading {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Loading")
      .field("cache_key", &self.cache_key)
      .finish_non_exhaustive()
  }
}

/// Executes latent resources against the configured APIs.
#[derive(Clone)]
pub struct Executor {
  apis: ApiConfigs,
  transport: Arc<dyn Transport>,
}

impl Executor {
  pub fn new(apis: ApiConfigs, transport: Arc<dyn Transport>) -> Self {
    Self { apis, transport }
  }

  /// Start the request for `resource`.
  ///
  /// Returns synchronously with an error, before touching the cache, when the
  /// resource is not latent or its api has no profile. Otherwise the
  /// in-flight snapshot is already in the cache when this returns.
  pub fn execute(&self, resource: Resource, client: &ApiClient) -> std::result::Result<Loading, Error> {
    if resource.stage != Stage::Latent {
      return Err(Error::NotLatent {
        cache_key: resource.cache_key,
        stage: resource.stage.name(),
      });
    }

    let api_id = resource.method_options.api_id();
    let profile = self
      .apis
      .get(api_id)
      .cloned()
      .ok_or_else(|| Error::MissingApi(api_id.to_string()))?;

    let in_flight = Arc::new(resource.to_in_flight());
    let cache_key = in_flight.cache_key.clone();

    let (settled_tx, settled_rx) = oneshot::channel();
    let dropped_key = cache_key.clone();
    let settlement = async move {
      settled_rx
        .await
        .unwrap_or_else(|_| Err(Error::Aborted(dropped_key)))
    }
    .boxed()
    .shared();
    let loading = Loading {
      cache_key: cache_key.clone(),
      settlement,
    };

    client.cache().set_with(
      &cache_key,
      Arc::clone(&in_flight),
      Attachments {
        completion: Some(loading.clone()),
        ..Attachments::default()
      },
    );

    let exchange = Exchange {
      profile,
      transport: Arc::clone(&self.transport),
      client: client.clone(),
      resource: in_flight,
    };
    tokio::spawn(async move {
      let settlement = exchange.run().await;
      // Nobody may be listening any more; the cache already has the result
      let _ = settled_tx.send(settlement);
    });

    Ok(loading)
  }
}

/// One request in flight.
struct Exchange {
  profile: Arc<ApiProfile>,
  transport: Arc<dyn Transport>,
  client: ApiClient,
  resource: Arc<Resource>,
}

impl Exchange {
  async fn run(self) -> Settlement {
    let request = match build_request(&self.profile, &self.resource, &self.client).await {
      Ok(request) => request,
      Err(e) => return self.fail(None, None, Some(e)),
    };

    if self.profile.debug {
      info!(
        url = %request.url,
        method = request.method.as_str(),
        headers = ?request.headers,
        body = ?request.body,
        "Client fetch"
      );
    }

    let response = match self.transport.send(request).await {
      Ok(response) => Arc::new(response),
      Err(e) => return self.fail(None, None, Some(e)),
    };

    let payload = match decode_payload(&self.profile, &response) {
      Ok(payload) => payload,
      Err(e) => return self.fail(Some(response), None, Some(e)),
    };

    if response.is_success() {
      self.succeed(response, payload)
    } else {
      self.fail(Some(response), Some(payload), None)
    }
  }

  fn extracted_headers(&self, response: &HttpResponse) -> Option<BTreeMap<String, String>> {
    self
      .resource
      .method_options
      .extract_headers
      .then(|| response.headers.clone())
  }

  fn succeed(self, response: Arc<HttpResponse>, payload: Value) -> Settlement {
    let success = Success {
      payload,
      status: response.status,
      headers: self.extracted_headers(&response),
      timestamp: resource::now(),
    };
    let settled = Arc::new(self.resource.to_success(success));
    debug!(
      cache_key = %settled.cache_key,
      status = response.status,
      "Request succeeded"
    );

    self.client.cache().set_with(
      &settled.cache_key,
      Arc::clone(&settled),
      Attachments {
        response: Some(response),
        ..Attachments::default()
      },
    );
    Ok(settled)
  }

  fn fail(
    self,
    response: Option<Arc<HttpResponse>>,
    payload: Option<Value>,
    error: Option<Report>,
  ) -> Settlement {
    let status = response.as_ref().map(|r| r.status);
    let message = match (&error, &payload) {
      (Some(e), _) => format!("{:#}", e),
      (None, Some(payload)) => payload.to_string(),
      (None, None) => "request failed".to_string(),
    };

    let fail = Fail {
      status,
      message,
      payload,
      headers: response.as_deref().and_then(|r| self.extracted_headers(r)),
      timestamp: resource::now(),
      terminal: is_terminal(status),
    };
    let settled = Arc::new(self.resource.to_fail(fail));
    warn!(
      cache_key = %settled.cache_key,
      status = ?status,
      message = %settled.failure_message(),
      "Request failed"
    );

    let error = error.map(Arc::new);
    self.client.cache().set_with(
      &settled.cache_key,
      Arc::clone(&settled),
      Attachments {
        completion: None,
        response: response.clone(),
        error: error.clone(),
      },
    );

    // The fail resource is already cached; a panicking callback must not
    // keep the request from settling
    let notified = panic::catch_unwind(AssertUnwindSafe(|| {
      (self.profile.on_request_fail)(
        settled.as_ref(),
        &self.client,
        error.as_deref(),
        response.as_deref(),
      )
    }));
    if notified.is_err() {
      error!(cache_key = %settled.cache_key, "Request failure callback panicked");
    }

    Err(Error::RequestFailed(settled))
  }
}

/// A 4xx failure is attributed to the request itself.
fn is_terminal(status: Option<u16>) -> bool {
  matches!(status, Some(400..=499))
}

async fn build_request(
  profile: &ApiProfile,
  resource: &Resource,
  client: &ApiClient,
) -> Result<HttpRequest> {
  let options = &resource.method_options;
  let params = &resource.params;

  let body = match &profile.prepare_body {
    Some(prepare) => prepare(params).wrap_err("Failed to prepare request body")?,
    None => params
      .body
      .as_ref()
      .map(serde_json::to_string)
      .transpose()
      .map_err(|e| eyre!("Failed to encode request body: {}", e))?,
  };

  let auth_headers = match &profile.authenticator {
    Some(authenticate) => authenticate(client)
      .await
      .wrap_err("Authenticator failed")?,
    None => None,
  };

  let headers = merge_headers([
    Some(&profile.headers),
    Some(&options.headers),
    Some(&params.headers),
    auth_headers.as_ref(),
  ]);

  let mut url = format!("{}{}", profile.base_path, options.path);
  let query = encode_query(&params.query);
  if !query.is_empty() {
    url.push('?');
    url.push_str(&query);
  }

  Ok(HttpRequest {
    method: options.method,
    url,
    headers,
    body,
  })
}

/// Merge header layers in order; later layers win on the same name.
fn merge_headers<'a>(layers: impl IntoIterator<Item = Option<&'a Headers>>) -> Headers {
  let mut merged = Headers::new();
  for layer in layers.into_iter().flatten() {
    for (name, value) in layer {
      merged.insert(name.clone(), value.clone());
    }
  }
  merged
}

/// Form-encode query params. Absent values are skipped, null becomes an
/// empty value, objects and arrays are sent as JSON text.
pub fn encode_query(query: &Query) -> String {
  let mut serializer = form_urlencoded::Serializer::new(String::new());
  for (key, value) in query.iter() {
    let Some(value) = value else { continue };
    let text = match value {
      Value::Null => String::new(),
      Value::String(s) => s.clone(),
      other => other.to_string(),
    };
    serializer.append_pair(key, &text);
  }
  serializer.finish()
}

fn decode_payload(profile: &ApiProfile, response: &HttpResponse) -> Result<Value> {
  if let Some(handle) = &profile.handle_response {
    return handle(response).wrap_err("Response handler failed");
  }

  if response.is_json() {
    serde_json::from_slice(&response.body).map_err(|e| {
      eyre!(
        "Failed to decode JSON response (status {}): {}",
        response.status,
        e
      )
    })
  } else {
    Ok(Value::String(response.text()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::resource::{HttpMethod, Params};
  use crate::testing::{latent_resource, test_client, StubTransport};
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;

  #[test]
  fn test_encode_query_rules() {
    let mut query = Query::new();
    query.insert("page", 2);
    query.insert("name", "a b");
    query.insert("empty", Value::Null);
    query.insert_opt("skipped", None::<String>);
    query.insert("filter", json!({"x": [1, 2]}));
    query.insert("flag", true);

    assert_eq!(
      encode_query(&query),
      "empty=&filter=%7B%22x%22%3A%5B1%2C2%5D%7D&flag=true&name=a+b&page=2"
    );
  }

  #[test]
  fn test_merge_headers_later_layers_win() {
    let api = Headers::from([("a".to_string(), "api".to_string()), ("b".to_string(), "api".to_string())]);
    let method = Headers::from([("b".to_string(), "method".to_string()), ("c".to_string(), "method".to_string())]);
    let call = Headers::from([("c".to_string(), "call".to_string())]);
    let auth = Headers::from([("a".to_string(), "auth".to_string())]);

    let merged = merge_headers([Some(&api), Some(&method), Some(&call), Some(&auth)]);
    assert_eq!(merged["a"], "auth");
    assert_eq!(merged["b"], "method");
    assert_eq!(merged["c"], "call");
  }

  #[tokio::test]
  async fn test_success_lifecycle_is_written_to_cache() {
    let stub = Arc::new(StubTransport::new().json("http://test.com/success", 200, json!({"data": "test"})));
    let client = test_client(ApiProfile::new("http://test.com"), stub.clone()).await;
    let resource = latent_resource("/success", HttpMethod::Get);
    let key = resource.cache_key.clone();

    let loading = client.execute(resource).unwrap();
    let in_flight = client.cache().get(&key).unwrap();
    assert_eq!(in_flight.stage, Stage::InFlight);
    assert!(client.cache().completion(&in_flight).is_some());

    let settled = loading.await.unwrap();
    let cached = client.cache().get(&key).unwrap();
    assert!(Arc::ptr_eq(&settled, &cached));
    let success = cached.success().unwrap();
    assert_eq!(success.payload, json!({"data": "test"}));
    assert_eq!(success.status, 200);
    assert!(success.headers.is_none());
    assert_eq!(client.cache().raw_response(&cached).map(|r| r.status), Some(200));
  }

  #[tokio::test]
  async fn test_bad_status_settles_as_fail() {
    let stub = Arc::new(StubTransport::new().json("http://test.com/missing", 404, json!({"error": "nope"})));
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let profile = ApiProfile::new("http://test.com").on_request_fail(move |resource, _, error, response| {
      assert_eq!(resource.stage.name(), "fail");
      assert!(error.is_none());
      assert_eq!(response.map(|r| r.status), Some(404));
      counter.fetch_add(1, Ordering::SeqCst);
    });
    let client = test_client(profile, stub).await;
    let resource = latent_resource("/missing", HttpMethod::Get);
    let key = resource.cache_key.clone();

    let err = client.execute(resource).unwrap().await.unwrap_err();
    let failed = err.resource().unwrap();
    let fail = failed.fail().unwrap();
    assert_eq!(fail.status, Some(404));
    assert!(fail.terminal);
    assert_eq!(fail.payload, Some(json!({"error": "nope"})));
    assert_eq!(fail.message, r#"{"error":"nope"}"#);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let cached = client.cache().get(&key).unwrap();
    assert!(Arc::ptr_eq(failed, &cached));
  }

  #[tokio::test]
  async fn test_panicking_fail_callback_still_settles() {
    let stub = Arc::new(StubTransport::new().json("http://test.com/broken", 500, json!({})));
    let profile = ApiProfile::new("http://test.com").on_request_fail(|_, _, _, _| {
      panic!("callback exploded");
    });
    let client = test_client(profile, stub).await;
    let resource = latent_resource("/broken", HttpMethod::Get);
    let key = resource.cache_key.clone();

    let err = client.execute(resource).unwrap().await.unwrap_err();
    assert!(matches!(err, Error::RequestFailed(_)));

    let cached = client.cache().get(&key).unwrap();
    assert_eq!(cached.stage.name(), "fail");
    assert_eq!(cached.fail().and_then(|f| f.status), Some(500));
  }

  #[tokio::test]
  async fn test_fail_callback_sees_cached_resource() {
    let stub = Arc::new(StubTransport::new().json("http://test.com/gone", 410, json!({})));
    let seen = Arc::new(Mutex::new(None));
    let stages = Arc::clone(&seen);
    let profile = ApiProfile::new("http://test.com").on_request_fail(move |resource, client, _, _| {
      let cached = client.cache().get(&resource.cache_key).map(|r| r.stage.name());
      *stages.lock().unwrap() = cached;
    });
    let client = test_client(profile, stub).await;

    client
      .execute(latent_resource("/gone", HttpMethod::Get))
      .unwrap()
      .await
      .unwrap_err();
    assert_eq!(*seen.lock().unwrap(), Some("fail"));
  }

  #[tokio::test]
  async fn test_server_error_is_not_terminal() {
    let stub = Arc::new(StubTransport::new().text("http://test.com/flaky", 503, "try later"));
    let client = test_client(ApiProfile::new("http://test.com"), stub).await;

    let err = client
      .execute(latent_resource("/flaky", HttpMethod::Get))
      .unwrap()
      .await
      .unwrap_err();
    let fail = err.resource().unwrap().fail().unwrap().clone();
    assert_eq!(fail.status, Some(503));
    assert!(!fail.terminal);
    assert_eq!(fail.payload, Some(json!("try later")));
  }

  #[tokio::test]
  async fn test_transport_error_has_no_status() {
    let stub = Arc::new(StubTransport::new().error("http://test.com/down", "connection refused"));
    let client = test_client(ApiProfile::new("http://test.com"), stub).await;
    let resource = latent_resource("/down", HttpMethod::Get);
    let key = resource.cache_key.clone();

    let err = client.execute(resource).unwrap().await.unwrap_err();
    let failed = err.resource().unwrap();
    let fail = failed.fail().unwrap();
    assert_eq!(fail.status, None);
    assert!(!fail.terminal);
    assert!(fail.message.contains("connection refused"));
    assert!(client.cache().raw_error(failed).is_some());
    assert_eq!(client.cache().get(&key).unwrap().stage.name(), "fail");
  }

  #[tokio::test]
  async fn test_request_built_from_profile_method_params_and_auth() {
    let stub = Arc::new(StubTransport::new().json("http://test.com/items", 201, json!({"id": 7})));
    let profile = ApiProfile::new("http://test.com")
      .with_header("x-api", "api")
      .with_header("x-shared", "api")
      .with_authenticator(|_client| async {
        Ok::<_, Report>(Some(Headers::from([(
          "authorization".to_string(),
          "Bearer token".to_string(),
        )])))
      });
    let client = test_client(profile, stub.clone()).await;

    let mut resource = latent_resource("/items", HttpMethod::Post);
    resource
      .method_options
      .headers
      .insert("x-shared".to_string(), "method".to_string());
    resource.params = Params::new()
      .with_query("page", 1)
      .with_body(json!({"name": "thing"}))
      .with_header("x-call", "call");

    client.execute(resource).unwrap().await.unwrap();

    let requests = stub.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.method, HttpMethod::Post);
    assert_eq!(request.url, "http://test.com/items?page=1");
    assert_eq!(request.body.as_deref(), Some(r#"{"name":"thing"}"#));
    assert_eq!(request.headers["x-api"], "api");
    assert_eq!(request.headers["x-shared"], "method");
    assert_eq!(request.headers["x-call"], "call");
    assert_eq!(request.headers["authorization"], "Bearer token");
  }

  #[tokio::test]
  async fn test_authenticator_error_fails_without_request() {
    let stub = Arc::new(StubTransport::new().json("http://test.com/me", 200, json!({})));
    let profile = ApiProfile::new("http://test.com")
      .with_authenticator(|_client| async { Err::<Option<Headers>, _>(eyre!("token expired")) });
    let client = test_client(profile, stub.clone()).await;

    let err = client
      .execute(latent_resource("/me", HttpMethod::Get))
      .unwrap()
      .await
      .unwrap_err();
    let fail = err.resource().unwrap().fail().unwrap().clone();
    assert_eq!(fail.status, None);
    assert!(fail.message.contains("token expired"));
    assert!(stub.requests().is_empty());
  }

  #[tokio::test]
  async fn test_custom_body_and_response_hooks() {
    let stub = Arc::new(StubTransport::new().text("http://test.com/form", 200, "a=1"));
    let profile = ApiProfile::new("http://test.com")
      .with_prepare_body(|params| Ok(params.body.as_ref().map(|_| "encoded".to_string())))
      .with_handle_response(|response| Ok(json!({ "length": response.body.len() })));
    let client = test_client(profile, stub.clone()).await;

    let mut resource = latent_resource("/form", HttpMethod::Put);
    resource.params = Params::new().with_body(json!({"a": 1}));
    let settled = client.execute(resource).unwrap().await.unwrap();

    assert_eq!(stub.requests()[0].body.as_deref(), Some("encoded"));
    assert_eq!(settled.success().unwrap().payload, json!({"length": 3}));
  }

  #[tokio::test]
  async fn test_extract_headers_captured() {
    let stub = Arc::new(StubTransport::new().json("http://test.com/paged", 200, json!([])));
    let client = test_client(ApiProfile::new("http://test.com"), stub).await;
    let mut resource = latent_resource("/paged", HttpMethod::Get);
    resource.method_options.extract_headers = true;

    let settled = client.execute(resource).unwrap().await.unwrap();
    let headers = settled.success().unwrap().headers.clone().unwrap();
    assert_eq!(headers["content-type"], "application/json");
  }

  #[tokio::test]
  async fn test_non_latent_resource_is_rejected() {
    let stub = Arc::new(StubTransport::new());
    let client = test_client(ApiProfile::new("http://test.com"), stub.clone()).await;
    let resource = latent_resource("/x", HttpMethod::Get).to_in_flight();
    let key = resource.cache_key.clone();

    let err = client.execute(resource).unwrap_err();
    assert!(matches!(err, Error::NotLatent { stage: "in-flight", .. }));
    assert!(client.cache().get(&key).is_none());
    assert!(stub.requests().is_empty());
  }

  #[tokio::test]
  async fn test_missing_api_profile_is_rejected() {
    let stub = Arc::new(StubTransport::new());
    let client = test_client(ApiProfile::new("http://test.com"), stub).await;
    let mut resource = latent_resource("/x", HttpMethod::Get);
    resource.method_options.api = Some("billing".to_string());

    let err = client.execute(resource).unwrap_err();
    assert!(matches!(err, Error::MissingApi(ref id) if id == "billing"));
  }

  #[tokio::test]
  async fn test_unawaited_request_still_lands_in_cache() {
    let stub = Arc::new(StubTransport::new().json("http://test.com/fire", 200, json!(1)));
    let client = test_client(ApiProfile::new("http://test.com"), stub).await;
    let resource = latent_resource("/fire", HttpMethod::Post);
    let key = resource.cache_key.clone();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let stages = Arc::clone(&seen);
    let cache = client.cache().clone();
    let watched = key.clone();
    let _subscription = client.cache().subscribe(move || {
      if let Some(r) = cache.get(&watched) {
        stages.lock().unwrap().push(r.stage.name());
      }
    });

    drop(client.execute(resource).unwrap());
    client.cache().completion(&client.cache().get(&key).unwrap()).unwrap().await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["in-flight", "success"]);
  }
}
