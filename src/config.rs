use color_eyre::{
  eyre::{eyre, WrapErr},
  Result,
};
use fetchcache::api::Headers;
use fetchcache::{
  ApiConfigs, ApiProfile, FetchMethod, HttpMethod, KeyRegistry, MethodDescriptor, Partition,
  DEFAULT_API,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub apis: BTreeMap<String, ApiConfig>,
  #[serde(default)]
  pub methods: Vec<MethodConfig>,
  #[serde(default)]
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  pub base_path: String,
  #[serde(default)]
  pub headers: Headers,
  /// Log every request sent to this api
  #[serde(default)]
  pub debug: bool,
  /// Environment variable holding a bearer token
  pub token_env: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MethodConfig {
  pub key: String,
  pub path: String,
  /// Api id (defaults to "default-api")
  pub api: Option<String>,
  /// GET, POST, PUT or DELETE
  #[serde(default)]
  pub method: HttpMethod,
  /// memory or disk
  #[serde(default)]
  pub cache: Partition,
  pub independent: Option<bool>,
  #[serde(default)]
  pub headers: Headers,
  #[serde(default)]
  pub extract_headers: bool,
  pub refetch_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_max_entries")]
  pub max_entries: usize,
  /// SQLite file (defaults to the platform data directory)
  pub path: Option<PathBuf>,
}

fn default_max_entries() -> usize {
  fetchcache::cache::DEFAULT_MAX_RESOURCES
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      max_entries: default_max_entries(),
      path: None,
    }
  }
}

impl Config {
  /// Load configuration from `explicit_path`, or from the first existing
  /// file among [`search_paths`](Self::search_paths).
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = match explicit_path {
      Some(path) => path.to_path_buf(),
      None => Self::search_paths()
        .into_iter()
        .find(|path| path.exists())
        .ok_or_else(|| {
          eyre!("No configuration file found. Create one at ~/.config/fetchcache/config.yaml")
        })?,
    };

    let contents = std::fs::read_to_string(&path)
      .wrap_err_with(|| format!("Failed to read config file {}", path.display()))?;
    Self::parse(&contents).wrap_err_with(|| format!("Failed to parse config file {}", path.display()))
  }

  /// `./fetchcache.yaml`, then `$XDG_CONFIG_HOME/fetchcache/config.yaml`.
  fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("fetchcache.yaml")];
    paths.extend(dirs::config_dir().map(|dir| dir.join("fetchcache").join("config.yaml")));
    paths
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Build api profiles. Each api with a `token_env` authenticates with a
  /// bearer token read from that variable at request time.
  pub fn api_configs(&self) -> ApiConfigs {
    let mut configs = ApiConfigs::new();

    for (id, api) in &self.apis {
      let mut profile = ApiProfile::new(&api.base_path)
        .with_debug(api.debug)
        .on_request_fail(|resource, _client, error, _response| {
          let fail = resource.fail();
          warn!(
            cache_key = %resource.cache_key,
            status = ?fail.and_then(|f| f.status),
            error = ?error.map(|e| e.to_string()),
            "Request failed"
          );
        });
      profile.headers = api.headers.clone();

      if let Some(var) = api.token_env.clone() {
        profile = profile.with_authenticator(move |_client| {
          let headers = std::env::var(&var)
            .map(|token| Headers::from([("authorization".to_string(), format!("Bearer {}", token))]))
            .map_err(|_| eyre!("API token not found. Set the {} environment variable.", var));
          async move { headers.map(Some) }
        });
      }

      configs.insert(id.clone(), profile);
    }

    configs
  }

  /// Register every configured method, keyed by logical key.
  pub fn fetch_methods(&self, registry: &KeyRegistry) -> Result<BTreeMap<String, FetchMethod>> {
    let mut methods = BTreeMap::new();

    for method in &self.methods {
      let api = method.api.as_deref().unwrap_or(DEFAULT_API);
      if !self.apis.contains_key(api) {
        return Err(eyre!(
          "Method '{}' uses api '{}', which is not configured",
          method.key,
          api
        ));
      }

      let mut descriptor = MethodDescriptor::new(&method.key, &method.path)
        .with_method(method.method)
        .with_partition(method.cache)
        .with_extract_headers(method.extract_headers);
      descriptor.api = method.api.clone();
      descriptor.independent = method.independent;
      descriptor.headers = method.headers.clone();
      descriptor.refetch_interval = method.refetch_interval_secs.map(Duration::from_secs);

      let fetch = FetchMethod::new(registry, descriptor)
        .map_err(|e| eyre!("Invalid method '{}': {}", method.key, e))?;
      methods.insert(method.key.clone(), fetch);
    }

    Ok(methods)
  }
}
