//! Core types shared by the cache storage and the agent.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use std::fmt;

use crate::net::Response;

/// A response read back from a cache bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
  pub response: Response,
  /// When the response was stored
  pub cached_at: DateTime<Utc>,
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Live network response
  Network,
  /// Offline mode - network unavailable, serving the cached copy
  Cache,
}

impl fmt::Display for ResponseSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Network => write!(f, "network"),
      Self::Cache => write!(f, "cache"),
    }
  }
}

/// Lifecycle state of one agent version.
///
/// `Installing -> Installed -> Activating -> Activated`. A failed install or
/// a version superseded by another activation becomes `Redundant`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Installing,
  Installed,
  Activating,
  Activated,
  Redundant,
}

impl WorkerState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Activated => "activated",
      Self::Redundant => "redundant",
    }
  }

  pub fn parse(s: &str) -> Result<Self> {
    match s {
      "installing" => Ok(Self::Installing),
      "installed" => Ok(Self::Installed),
      "activating" => Ok(Self::Activating),
      "activated" => Ok(Self::Activated),
      "redundant" => Ok(Self::Redundant),
      other => Err(eyre!("Unknown worker state '{}'", other)),
    }
  }
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Persisted registration of one agent version within a scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRecord {
  /// Origin the agent serves
  pub scope: String,
  /// Version identifier, also the name of the version's cache bucket
  pub version: String,
  pub state: WorkerState,
  /// Set once install asks to skip the waiting period
  pub skip_waiting: bool,
  /// Set once activation has claimed already-open clients
  pub controls_clients: bool,
  /// When the record was last written (None until it has been stored)
  pub updated_at: Option<DateTime<Utc>>,
}

impl WorkerRecord {
  pub fn new(scope: impl Into<String>, version: impl Into<String>, state: WorkerState) -> Self {
    Self {
      scope: scope.into(),
      version: version.into(),
      state,
      skip_waiting: false,
      controls_clients: false,
      updated_at: None,
    }
  }
}
