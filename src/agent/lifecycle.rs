//! Install and activate handlers.

use color_eyre::{
  eyre::{bail, eyre},
  Result,
};
use futures::future::try_join_all;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use super::Agent;
use crate::cache::{CacheStorage, RequestKey, WorkerState};
use crate::net::{Network, Request, Response};

impl<S: CacheStorage + 'static, N: Network> Agent<S, N> {
  /// Pre-cache every asset into this version's bucket.
  ///
  /// All assets are fetched before anything is written, and the writes
  /// happen in one transaction, so a single failing asset leaves the bucket
  /// untouched. On success the worker skips the waiting period and is
  /// immediately eligible for activation.
  ///
  /// Installing the version that is already active only refreshes its
  /// bucket. Its lifecycle record is left alone whether or not the refresh
  /// succeeds, so interception and the offline fallback stay live.
  pub async fn install(&self) -> Result<usize> {
    if self.is_active()? {
      info!(version = %self.version, "Refreshing assets of the active version");
      return self.precache().await.inspect_err(|e| {
        warn!(version = %self.version, error = %e, "Refresh of active version failed");
      });
    }

    info!(version = %self.version, assets = self.assets.len(), "Installing");
    self.save_record(WorkerState::Installing, false, false)?;

    match self.precache().await {
      Ok(count) => {
        self.save_record(WorkerState::Installed, true, false)?;
        info!(version = %self.version, count, "Installed, skipping waiting period");
        Ok(count)
      }
      Err(e) => {
        warn!(version = %self.version, error = %e, "Install failed");
        self.save_record(WorkerState::Redundant, false, false)?;
        Err(e)
      }
    }
  }

  async fn precache(&self) -> Result<usize> {
    let mut seen = HashSet::new();
    let mut requests = Vec::with_capacity(self.assets.len());
    for path in &self.assets {
      let request = Request::get(self.resolve(path)?);
      if !seen.insert(RequestKey::for_request(&request)) {
        bail!("Duplicate asset '{}' in install list", path);
      }
      requests.push(request);
    }

    self.storage.open_bucket(self.scope.as_str(), &self.version)?;

    let responses = try_join_all(requests.iter().map(|request| self.fetch_asset(request))).await?;
    let entries: Vec<(Request, Response)> = requests.into_iter().zip(responses).collect();
    self
      .storage
      .put_all(self.scope.as_str(), &self.version, &entries)?;

    Ok(entries.len())
  }

  async fn fetch_asset(&self, request: &Request) -> Result<Response> {
    let response = self
      .network
      .fetch(request)
      .await
      .map_err(|e| eyre!("Failed to fetch asset {}: {}", request.url, e))?;

    if !response.is_ok() {
      bail!("Asset {} returned status {}", request.url, response.status);
    }

    debug!(url = %request.url, bytes = response.body.len(), "Fetched asset");
    Ok(response)
  }

  /// Delete every bucket but this version's and take control of clients.
  ///
  /// Returns the names of the deleted buckets. Re-activating an already
  /// active version only repeats the purge.
  pub async fn activate(&self) -> Result<Vec<String>> {
    let record = self
      .record()?
      .ok_or_else(|| eyre!("Version {} has not been installed", self.version))?;

    match record.state {
      WorkerState::Installed | WorkerState::Activating | WorkerState::Activated => {}
      state => bail!("Cannot activate version {} while it is {}", self.version, state),
    }

    let others: Vec<_> = self
      .storage
      .workers(self.scope.as_str())?
      .into_iter()
      .filter(|w| w.version != self.version)
      .collect();

    if !record.skip_waiting && others.iter().any(|w| w.state == WorkerState::Activated) {
      bail!(
        "Version {} is waiting for the active version to release its clients",
        self.version
      );
    }

    info!(version = %self.version, "Activating");
    self.save_record(WorkerState::Activating, record.skip_waiting, false)?;

    let deleted = self.purge_stale_buckets()?;
    self.storage.open_bucket(self.scope.as_str(), &self.version)?;

    for mut other in others {
      if other.state != WorkerState::Redundant || other.controls_clients {
        other.state = WorkerState::Redundant;
        other.controls_clients = false;
        self.storage.save_worker(&other)?;
        debug!(version = %other.version, "Superseded worker");
      }
    }

    self.save_record(WorkerState::Activated, record.skip_waiting, true)?;
    info!(
      version = %self.version,
      deleted = deleted.len(),
      "Activated, controlling clients"
    );

    Ok(deleted)
  }

  /// Delete this scope's buckets other than the current version's.
  fn purge_stale_buckets(&self) -> Result<Vec<String>> {
    let scope = self.scope.as_str();
    let mut deleted = Vec::new();
    for name in self.storage.bucket_names(scope)? {
      if name == self.version {
        continue;
      }
      if self.storage.delete_bucket(scope, &name)? {
        debug!(bucket = %name, "Deleted stale cache bucket");
        deleted.push(name);
      }
    }
    Ok(deleted)
  }
}
