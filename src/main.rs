mod agent;
mod cache;
mod config;
mod event;
mod logging;
mod net;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;
use url::Url;

use agent::{Agent, Interception};
use cache::{CacheStorage, SqliteStorage};
use config::Config;
use event::EventLoop;
use net::{HttpClient, Network, Request, Response};

#[derive(Parser, Debug)]
#[command(name = "shellcache")]
#[command(about = "Versioned offline cache for a web app shell")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shellcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Cache version to use instead of the configured one
  #[arg(long)]
  cache_version: Option<String>,

  /// More log detail (-v debug, -vv trace); SHELLCACHE_LOG takes precedence
  #[arg(short, long, action = clap::ArgAction::Count)]
  verbose: u8,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Pre-cache every configured asset into the current version's bucket
  Install,
  /// Delete stale buckets and start intercepting fetches
  Activate,
  /// Install, then activate
  Update,
  /// Fetch a path through the agent
  Fetch {
    /// Path or URL, resolved against the origin
    path: String,

    /// Request method
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,

    /// Extra request header as "Name: value"
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
  },
  /// Show cache buckets and worker registrations
  Status,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(&Config::data_dir()?.join("logs"), args.verbose)?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Override version if specified on command line
  let config = match args.cache_version {
    Some(version) => config.with_version(version)?,
    None => config,
  };

  let storage = Arc::new(SqliteStorage::open(&config.database_path()?)?);
  let network = HttpClient::new()?;
  let agent = Agent::new(&config, Arc::clone(&storage), network.clone())?;
  let scope = agent.scope().clone();

  let events = EventLoop::spawn(agent);

  match args.command {
    Command::Install => {
      let count = events.install().await?;
      eprintln!("Cached {} assets in {}", count, config.version);
    }
    Command::Activate => {
      let deleted = events.activate().await?;
      print_activated(&config.version, &deleted);
    }
    Command::Update => {
      let count = events.install().await?;
      eprintln!("Cached {} assets in {}", count, config.version);
      let deleted = events.activate().await?;
      print_activated(&config.version, &deleted);
    }
    Command::Fetch {
      path,
      method,
      headers,
    } => {
      let request = build_request(&scope, &path, &method, &headers)?;
      fetch(&events, &network, request).await?;
    }
    Command::Status => {
      let mut stdout = std::io::stdout().lock();
      write_status(&mut stdout, &*storage, &scope, &config.version)?;
    }
  }

  Ok(())
}

fn print_activated(version: &str, deleted: &[String]) {
  if deleted.is_empty() {
    eprintln!("Activated {}", version);
  } else {
    eprintln!("Activated {}, deleted {}", version, deleted.join(", "));
  }
}

fn build_request(scope: &Url, path: &str, method: &str, headers: &[String]) -> Result<Request> {
  let url = scope
    .join(path)
    .map_err(|e| eyre!("Invalid path '{}': {}", path, e))?;
  let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
    .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;

  let mut request = Request::new(method, url);
  for header in headers {
    let (name, value) = header
      .split_once(':')
      .ok_or_else(|| eyre!("Invalid header '{}', expected \"Name: value\"", header))?;
    request = request.with_header(name.trim(), value.trim());
  }

  Ok(request)
}

async fn fetch(events: &EventLoop, network: &HttpClient, request: Request) -> Result<()> {
  match events.fetch(request.clone()).await? {
    Interception::Passthrough => {
      let response = network.fetch(&request).await?;
      write_response(&response, "network, not intercepted".to_string())
    }
    Interception::Respond(served) => {
      let source = match served.cached_at {
        Some(cached_at) => format!("{}, stored {}", served.source, cached_at),
        None => served.source.to_string(),
      };
      write_response(&served.response, source)?;

      // Let the cache write land before the process exits
      if let Some(refresh) = served.refresh {
        if let Err(e) = refresh.await {
          warn!(error = %e, "Cache refresh task did not complete");
        }
      }
      Ok(())
    }
    Interception::Unresolved => Err(eyre!(
      "Failed to load {}: network unavailable and no cached copy",
      request.url
    )),
  }
}

fn write_response(response: &Response, source: String) -> Result<()> {
  eprintln!("{} {} ({})", response.status, response.status_text, source);
  if let Some(content_type) = response.header("content-type") {
    eprintln!("Content-Type: {}", content_type);
  }

  let mut stdout = std::io::stdout().lock();
  stdout
    .write_all(&response.body)
    .and_then(|_| stdout.flush())
    .map_err(|e| eyre!("Failed to write response body: {}", e))
}

fn write_status(
  out: &mut impl Write,
  storage: &impl CacheStorage,
  scope: &Url,
  version: &str,
) -> Result<()> {
  let scope_str = scope.as_str();
  let mut lines = vec![format!("Scope: {}", scope), "Buckets:".to_string()];

  if !storage.has_bucket(scope_str, version)? {
    lines.push(format!("  (no bucket for {} yet)", version));
  }
  for name in storage.bucket_names(scope_str)? {
    let marker = if name == version { "*" } else { " " };
    let entries = storage.keys(scope_str, &name)?.len();
    lines.push(format!("  {} {} ({} entries)", marker, name, entries));
  }

  lines.push("Workers:".to_string());
  for worker in storage.workers(scope_str)? {
    let updated = worker
      .updated_at
      .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
      .unwrap_or_else(|| "-".to_string());
    lines.push(format!(
      "  {} {} skip_waiting={} controls_clients={} updated={}",
      worker.version, worker.state, worker.skip_waiting, worker.controls_clients, updated
    ));
  }

  for line in lines {
    writeln!(out, "{}", line).map_err(|e| eyre!("Failed to write status: {}", e))?;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{WorkerRecord, WorkerState};

  fn scope() -> Url {
    Url::parse("https://example.com/app/").unwrap()
  }

  #[test]
  fn test_build_request_resolves_path() {
    let request = build_request(&scope(), "./index.html", "get", &[]).unwrap();
    assert_eq!(request.method, Method::GET);
    assert_eq!(request.url.as_str(), "https://example.com/app/index.html");
  }

  #[test]
  fn test_build_request_parses_headers() {
    let headers = vec!["Accept-Language: en".to_string()];
    let request = build_request(&scope(), "./", "POST", &headers).unwrap();
    assert_eq!(request.method, Method::POST);
    assert_eq!(request.header("accept-language"), Some("en"));
  }

  #[test]
  fn test_build_request_rejects_bad_header() {
    let headers = vec!["no-colon".to_string()];
    assert!(build_request(&scope(), "./", "GET", &headers).is_err());
  }

  #[test]
  fn test_args_parse() {
    let args = Args::parse_from([
      "shellcache",
      "--cache-version",
      "v5",
      "-vv",
      "fetch",
      "./index.html",
      "-H",
      "Accept: text/html",
    ]);
    assert_eq!(args.cache_version.as_deref(), Some("v5"));
    assert_eq!(args.verbose, 2);
    match args.command {
      Command::Fetch { path, method, headers } => {
        assert_eq!(path, "./index.html");
        assert_eq!(method, "GET");
        assert_eq!(headers, vec!["Accept: text/html"]);
      }
      other => panic!("unexpected command {:?}", other),
    }
  }

  #[test]
  fn test_status_lists_scope_buckets_and_workers() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let scope = scope();
    storage.open_bucket(scope.as_str(), "v1").unwrap();
    storage
      .open_bucket("https://example.com/other/", "other-v1")
      .unwrap();
    storage
      .save_worker(&WorkerRecord::new(scope.as_str(), "v1", WorkerState::Activated))
      .unwrap();

    let mut out = Vec::new();
    write_status(&mut out, &storage, &scope, "v2").unwrap();
    let text = String::from_utf8(out).unwrap();

    assert!(text.contains("Scope: https://example.com/app/"));
    assert!(text.contains("(no bucket for v2 yet)"));
    assert!(text.contains("v1 (0 entries)"));
    assert!(!text.contains("other-v1"));
    assert!(text.contains("v1 activated skip_waiting=false controls_clients=false updated=20"));
  }
}
