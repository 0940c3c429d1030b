//! Fetch interception: network first, cache as the offline fallback.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Agent;
use crate::cache::{CacheStorage, ResponseSource, WorkerState};
use crate::net::{Network, Request, Response};

/// What the agent did with an intercepted request.
#[derive(Debug)]
pub enum Interception {
  /// Not handled; the host performs its default fetch
  Passthrough,
  Respond(Served),
  /// Network failed and no cached copy exists
  Unresolved,
}

/// A response handed back to the page.
#[derive(Debug)]
pub struct Served {
  pub response: Response,
  pub source: ResponseSource,
  /// When the cached copy was stored (cache responses only)
  pub cached_at: Option<DateTime<Utc>>,
  /// Background write of the fresh response into the cache. Dropping the
  /// handle does not cancel the write.
  pub refresh: Option<JoinHandle<()>>,
}

impl<S: CacheStorage + 'static, N: Network> Agent<S, N> {
  /// Handle an intercepted request.
  ///
  /// Only GET requests are intercepted, and only once this version is
  /// active. A 200 from the network is returned immediately while a copy is
  /// written to the cache in the background; any other status is returned
  /// untouched. When the network fails the cached copy is served instead.
  pub async fn fetch(&self, request: &Request) -> Result<Interception> {
    if !request.is_get() {
      debug!(method = %request.method, url = %request.url, "Not intercepting");
      return Ok(Interception::Passthrough);
    }

    if !self.is_controlling() {
      debug!(version = %self.version, url = %request.url, "Not active, passing through");
      return Ok(Interception::Passthrough);
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        let refresh = if response.is_ok() {
          Some(self.spawn_refresh(request.clone(), response.clone()))
        } else {
          debug!(url = %request.url, status = response.status, "Not caching response");
          None
        };

        Ok(Interception::Respond(Served {
          response,
          source: ResponseSource::Network,
          cached_at: None,
          refresh,
        }))
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "Network request failed, falling back to cache");
        Ok(self.serve_cached(request))
      }
    }
  }

  /// Whether this version currently controls clients. An unreadable record
  /// counts as not controlling, so the host falls back to its own fetch.
  fn is_controlling(&self) -> bool {
    match self.record() {
      Ok(record) => record
        .map(|r| r.state == WorkerState::Activated && r.controls_clients)
        .unwrap_or(false),
      Err(e) => {
        warn!(version = %self.version, error = %e, "Failed to read worker record");
        false
      }
    }
  }

  fn serve_cached(&self, request: &Request) -> Interception {
    match self
      .storage
      .match_request(self.scope.as_str(), &self.version, request)
    {
      Ok(Some(cached)) => {
        info!(url = %request.url, cached_at = %cached.cached_at, "Serving cached response");
        Interception::Respond(Served {
          response: cached.response,
          source: ResponseSource::Cache,
          cached_at: Some(cached.cached_at),
          refresh: None,
        })
      }
      Ok(None) => {
        warn!(url = %request.url, "Offline and not cached");
        Interception::Unresolved
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "Cache lookup failed");
        Interception::Unresolved
      }
    }
  }

  /// Store a fresh response without holding up the caller. Failures are
  /// logged and never reach the page.
  fn spawn_refresh(&self, request: Request, response: Response) -> JoinHandle<()> {
    let storage = Arc::clone(&self.storage);
    let scope = self.scope.to_string();
    let bucket = self.version.clone();

    tokio::spawn(async move {
      match storage.put(&scope, &bucket, &request, &response) {
        Ok(()) => debug!(url = %request.url, bucket = %bucket, "Refreshed cache entry"),
        Err(e) => warn!(url = %request.url, error = %e, "Failed to refresh cache entry"),
      }
    })
  }
}
