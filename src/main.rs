mod config;
mod logging;

use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use fetchcache::{create_cache, ApiClient, ClientCache, Error, Params, Resource, SqliteStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "fetchcache")]
#[command(about = "Call configured API methods through a persisted resource cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/fetchcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// More log output (-v, -vv)
  #[arg(short, long, action = clap::ArgAction::Count)]
  verbose: u8,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Call a method and print the settled resource
  Fetch {
    /// Logical key of the method
    method: String,

    /// Query parameter as key=value
    #[arg(short, long = "query", value_parser = parse_pair)]
    query: Vec<(String, String)>,

    /// JSON request body
    #[arg(short, long)]
    body: Option<String>,

    /// Request header as name=value
    #[arg(short = 'H', long = "header", value_parser = parse_pair)]
    headers: Vec<(String, String)>,
  },
  /// List cached resources
  Show,
  /// Drop every cached resource
  Purge,
  /// Mark every cached resource of the given methods as stale
  Invalidate {
    #[arg(required = true)]
    methods: Vec<String>,
  },
}

fn parse_pair(s: &str) -> Result<(String, String), String> {
  s.split_once('=')
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .ok_or_else(|| format!("expected key=value, got '{}'", s))
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(args.verbose)?;

  let config = Config::load(args.config.as_deref())?;

  let store = match &config.cache.path {
    Some(path) => SqliteStore::open_at(path)?,
    None => SqliteStore::open()?,
  };
  let cache = create_cache(Arc::new(store), config.cache.max_entries);
  cache.ready().await;

  let outcome = run(args.command, &config, &cache).await;

  // Flush whatever the command left in the cache before exiting
  cache.persist().await?;
  outcome
}

async fn run(command: Command, config: &Config, cache: &ClientCache) -> Result<()> {
  match command {
    Command::Fetch {
      method,
      query,
      body,
      headers,
    } => {
      let client = ApiClient::with_reqwest(config.api_configs(), cache.clone())?;
      let registry = fetchcache::KeyRegistry::new();
      let methods = config.fetch_methods(&registry)?;
      let fetch = methods.get(&method).ok_or_else(|| {
        eyre!(
          "Unknown method '{}'. Configured: {}",
          method,
          methods.keys().cloned().collect::<Vec<_>>().join(", ")
        )
      })?;

      let mut params = Params::new();
      for (key, value) in query {
        params.query.insert(key, value);
      }
      for (name, value) in headers {
        params.headers.insert(name, value);
      }
      if let Some(body) = body {
        let body = serde_json::from_str(&body).map_err(|e| eyre!("Invalid JSON body: {}", e))?;
        params.body = Some(body);
      }

      let loading = fetch.fetch(&client, params).await?;
      info!(cache_key = loading.cache_key(), "Request started");

      match loading.await {
        Ok(resource) => print_resource(&resource),
        Err(Error::RequestFailed(resource)) => {
          print_resource(&resource)?;
          Err(eyre!("Request failed: {}", resource.cache_key))
        }
        Err(e) => Err(e.into()),
      }
    }
    Command::Show => {
      let renew_time = cache.renew_time();
      let now = Utc::now();
      for resource in cache.resources() {
        let stale = if resource.needs_refetch(renew_time, now) {
          "stale"
        } else {
          "fresh"
        };
        println!(
          "{}\t{}\t{}\t{}",
          resource.cache_key,
          resource.stage.name(),
          stale,
          resource.timestamp.to_rfc3339()
        );
      }
      Ok(())
    }
    Command::Purge => {
      let count = cache.resources().len();
      cache.purge().await?;
      println!("Purged {} cached resources", count);
      Ok(())
    }
    Command::Invalidate { methods } => {
      let keys: Vec<&str> = methods.iter().map(String::as_str).collect();
      let flagged = cache.mark_needs_refetch(&keys);
      println!("Marked {} cached resources for refetch", flagged);
      Ok(())
    }
  }
}

fn print_resource(resource: &Resource) -> Result<()> {
  let mut value = serde_json::to_value(resource)?;
  if let Some(object) = value.as_object_mut() {
    // Keep the output focused on the outcome
    object.remove("methodOptions");
  }
  println!("{}", serde_json::to_string_pretty(&value)?);
  Ok(())
}
