//! The offline-caching agent.
//!
//! An `Agent` is bound to one cache version and exposes the three handlers
//! the host delivers events to: install, activate and fetch. It keeps no
//! state of its own between events; buckets and lifecycle records live in
//! the storage backend.

mod intercept;
mod lifecycle;

pub use intercept::Interception;

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use url::Url;

use crate::cache::{CacheStorage, WorkerRecord, WorkerState};
use crate::config::Config;
use crate::event::{Event, EventOutcome};
use crate::net::Network;

pub struct Agent<S: CacheStorage, N: Network> {
  version: String,
  scope: Url,
  assets: Vec<String>,
  storage: Arc<S>,
  network: N,
}

impl<S: CacheStorage + 'static, N: Network> Agent<S, N> {
  /// Create an agent for the configured version.
  ///
  /// Several agents with different versions may share one storage.
  pub fn new(config: &Config, storage: Arc<S>, network: N) -> Result<Self> {
    Ok(Self {
      version: config.version.clone(),
      scope: config.origin_url()?,
      assets: config.assets.clone(),
      storage,
      network,
    })
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn scope(&self) -> &Url {
    &self.scope
  }

  /// Run the handler for one lifecycle or fetch event.
  pub async fn handle(&self, event: Event) -> Result<EventOutcome> {
    match event {
      Event::Install => self.install().await.map(EventOutcome::Installed),
      Event::Activate => self.activate().await.map(EventOutcome::Activated),
      Event::Fetch(request) => self.fetch(&request).await.map(EventOutcome::Fetched),
    }
  }

  /// Resolve an asset path against the scope.
  fn resolve(&self, path: &str) -> Result<Url> {
    self
      .scope
      .join(path)
      .map_err(|e| eyre!("Invalid asset path '{}': {}", path, e))
  }

  fn record(&self) -> Result<Option<WorkerRecord>> {
    self.storage.worker(self.scope.as_str(), &self.version)
  }

  fn is_active(&self) -> Result<bool> {
    Ok(matches!(
      self.record()?,
      Some(WorkerRecord {
        state: WorkerState::Activated,
        ..
      })
    ))
  }

  fn save_record(&self, state: WorkerState, skip_waiting: bool, controls_clients: bool) -> Result<()> {
    self.storage.save_worker(&WorkerRecord {
      skip_waiting,
      controls_clients,
      ..WorkerRecord::new(self.scope.as_str(), self.version.as_str(), state)
    })
  }
}
