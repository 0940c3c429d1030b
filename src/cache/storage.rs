//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{
  eyre::{bail, eyre},
  Result,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::identity::{capture_vary, vary_matches, RequestKey, VaryHeader};
use super::traits::{CachedResponse, WorkerRecord, WorkerState};
use crate::net::{Request, Response};

/// Trait for cache storage backends.
///
/// Buckets are named key-value stores of request identity to response,
/// namespaced by scope so several origins can share one database. The same
/// backend also persists the worker registrations for each scope.
pub trait CacheStorage: Send + Sync {
  /// Create the bucket if absent. Returns true if it was created.
  fn open_bucket(&self, scope: &str, name: &str) -> Result<bool>;

  fn has_bucket(&self, scope: &str, name: &str) -> Result<bool>;

  /// Bucket names of one scope in creation order.
  fn bucket_names(&self, scope: &str) -> Result<Vec<String>>;

  /// Delete a bucket and its entries. Returns true if it existed.
  fn delete_bucket(&self, scope: &str, name: &str) -> Result<bool>;

  /// Store one entry, replacing any entry with the same request identity.
  fn put(&self, scope: &str, bucket: &str, request: &Request, response: &Response) -> Result<()>;

  /// Store every entry or none of them.
  fn put_all(&self, scope: &str, bucket: &str, entries: &[(Request, Response)]) -> Result<()>;

  /// Look up the stored response for a request.
  fn match_request(
    &self,
    scope: &str,
    bucket: &str,
    request: &Request,
  ) -> Result<Option<CachedResponse>>;

  /// URLs stored in a bucket.
  fn keys(&self, scope: &str, bucket: &str) -> Result<Vec<String>>;

  fn worker(&self, scope: &str, version: &str) -> Result<Option<WorkerRecord>>;

  fn workers(&self, scope: &str) -> Result<Vec<WorkerRecord>>;

  fn save_worker(&self, record: &WorkerRecord) -> Result<()>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open or create the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS buckets (
    scope TEXT NOT NULL,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (scope, name)
);

-- One row per request identity per bucket
CREATE TABLE IF NOT EXISTS entries (
    scope TEXT NOT NULL,
    bucket TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    vary TEXT NOT NULL,
    response_url TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (scope, bucket, request_hash)
);

CREATE INDEX IF NOT EXISTS idx_entries_bucket ON entries(scope, bucket);

-- Lifecycle registration, one row per agent version
CREATE TABLE IF NOT EXISTS workers (
    scope TEXT NOT NULL,
    version TEXT NOT NULL,
    state TEXT NOT NULL,
    skip_waiting INTEGER NOT NULL DEFAULT 0,
    controls_clients INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (scope, version)
);
"#;

impl CacheStorage for SqliteStorage {
  fn open_bucket(&self, scope: &str, name: &str) -> Result<bool> {
    let conn = self.lock()?;
    let inserted = conn
      .execute(
        "INSERT OR IGNORE INTO buckets (scope, name, created_at) VALUES (?, ?, datetime('now'))",
        params![scope, name],
      )
      .map_err(|e| eyre!("Failed to open bucket '{}': {}", name, e))?;
    Ok(inserted == 1)
  }

  fn has_bucket(&self, scope: &str, name: &str) -> Result<bool> {
    let conn = self.lock()?;
    bucket_exists(&conn, scope, name)
  }

  fn bucket_names(&self, scope: &str) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM buckets WHERE scope = ? ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map(params![scope], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list buckets: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read bucket name: {}", e))?;

    Ok(names)
  }

  fn delete_bucket(&self, scope: &str, name: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM entries WHERE scope = ? AND bucket = ?",
      params![scope, name],
    )
    .map_err(|e| eyre!("Failed to delete entries of bucket '{}': {}", name, e))?;
    let deleted = tx
      .execute(
        "DELETE FROM buckets WHERE scope = ? AND name = ?",
        params![scope, name],
      )
      .map_err(|e| eyre!("Failed to delete bucket '{}': {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(deleted == 1)
  }

  fn put(&self, scope: &str, bucket: &str, request: &Request, response: &Response) -> Result<()> {
    let conn = self.lock()?;
    if !bucket_exists(&conn, scope, bucket)? {
      bail!("Cache bucket '{}' does not exist", bucket);
    }
    insert_entry(&conn, scope, bucket, request, response)
  }

  fn put_all(&self, scope: &str, bucket: &str, entries: &[(Request, Response)]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    if !bucket_exists(&tx, scope, bucket)? {
      bail!("Cache bucket '{}' does not exist", bucket);
    }

    // Dropping the transaction on error rolls back everything written so far
    for (request, response) in entries {
      insert_entry(&tx, scope, bucket, request, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))
  }

  fn match_request(
    &self,
    scope: &str,
    bucket: &str,
    request: &Request,
  ) -> Result<Option<CachedResponse>> {
    if !request.is_get() {
      return Ok(None);
    }

    let conn = self.lock()?;
    let key = RequestKey::for_request(request);

    let row = conn
      .query_row(
        "SELECT vary, response_url, status, status_text, headers, body, cached_at
         FROM entries WHERE scope = ? AND bucket = ? AND request_hash = ?",
        params![scope, bucket, key.hash],
        |row| {
          Ok(StoredRow {
            vary: row.get(0)?,
            url: row.get(1)?,
            status: row.get(2)?,
            status_text: row.get(3)?,
            headers: row.get(4)?,
            body: row.get(5)?,
            cached_at: row.get(6)?,
          })
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key.url, e))?;

    let Some(row) = row else {
      return Ok(None);
    };

    let vary: Vec<VaryHeader> = serde_json::from_str(&row.vary)
      .map_err(|e| eyre!("Failed to parse stored vary headers: {}", e))?;
    if !vary_matches(&vary, request) {
      return Ok(None);
    }

    let headers = serde_json::from_str(&row.headers)
      .map_err(|e| eyre!("Failed to parse stored response headers: {}", e))?;

    Ok(Some(CachedResponse {
      response: Response {
        url: row.url,
        status: row.status,
        status_text: row.status_text,
        headers,
        body: row.body,
      },
      cached_at: parse_datetime(&row.cached_at)?,
    }))
  }

  fn keys(&self, scope: &str, bucket: &str) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT url FROM entries WHERE scope = ? AND bucket = ? ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let urls = stmt
      .query_map(params![scope, bucket], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list keys of bucket '{}': {}", bucket, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache key: {}", e))?;

    Ok(urls)
  }

  fn worker(&self, scope: &str, version: &str) -> Result<Option<WorkerRecord>> {
    let conn = self.lock()?;
    let row = conn
      .query_row(
        "SELECT scope, version, state, skip_waiting, controls_clients, updated_at
         FROM workers WHERE scope = ? AND version = ?",
        params![scope, version],
        worker_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to load worker {}: {}", version, e))?;

    row.map(WorkerRow::into_record).transpose()
  }

  fn workers(&self, scope: &str) -> Result<Vec<WorkerRecord>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT scope, version, state, skip_waiting, controls_clients, updated_at
         FROM workers WHERE scope = ? ORDER BY rowid",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![scope], worker_row)
      .map_err(|e| eyre!("Failed to list workers: {}", e))?
      .collect::<rusqlite::Result<Vec<WorkerRow>>>()
      .map_err(|e| eyre!("Failed to read worker: {}", e))?;

    rows.into_iter().map(WorkerRow::into_record).collect()
  }

  fn save_worker(&self, record: &WorkerRecord) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT INTO workers (scope, version, state, skip_waiting, controls_clients, updated_at)
         VALUES (?, ?, ?, ?, ?, datetime('now'))
         ON CONFLICT (scope, version) DO UPDATE SET
           state = excluded.state,
           skip_waiting = excluded.skip_waiting,
           controls_clients = excluded.controls_clients,
           updated_at = excluded.updated_at",
        params![
          record.scope,
          record.version,
          record.state.as_str(),
          record.skip_waiting,
          record.controls_clients
        ],
      )
      .map_err(|e| eyre!("Failed to save worker {}: {}", record.version, e))?;
    Ok(())
  }
}

struct StoredRow {
  vary: String,
  url: String,
  status: u16,
  status_text: String,
  headers: String,
  body: Vec<u8>,
  cached_at: String,
}

struct WorkerRow {
  scope: String,
  version: String,
  state: String,
  skip_waiting: bool,
  controls_clients: bool,
  updated_at: String,
}

impl WorkerRow {
  fn into_record(self) -> Result<WorkerRecord> {
    Ok(WorkerRecord {
      scope: self.scope,
      version: self.version,
      state: WorkerState::parse(&self.state)?,
      skip_waiting: self.skip_waiting,
      controls_clients: self.controls_clients,
      updated_at: Some(parse_datetime(&self.updated_at)?),
    })
  }
}

fn worker_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkerRow> {
  Ok(WorkerRow {
    scope: row.get(0)?,
    version: row.get(1)?,
    state: row.get(2)?,
    skip_waiting: row.get(3)?,
    controls_clients: row.get(4)?,
    updated_at: row.get(5)?,
  })
}

fn bucket_exists(conn: &Connection, scope: &str, name: &str) -> Result<bool> {
  conn
    .query_row(
      "SELECT EXISTS(SELECT 1 FROM buckets WHERE scope = ? AND name = ?)",
      params![scope, name],
      |row| row.get(0),
    )
    .map_err(|e| eyre!("Failed to check bucket '{}': {}", name, e))
}

/// Insert or replace one entry. Only successful GET responses are accepted.
fn insert_entry(
  conn: &Connection,
  scope: &str,
  bucket: &str,
  request: &Request,
  response: &Response,
) -> Result<()> {
  if !request.is_get() {
    bail!(
      "Only GET requests can be cached, got {} {}",
      request.method,
      request.url
    );
  }
  if !response.is_ok() {
    bail!(
      "Refusing to cache {} response for {}",
      response.status,
      request.url
    );
  }

  let key = RequestKey::for_request(request);
  let vary = serde_json::to_string(&capture_vary(request, response)?)
    .map_err(|e| eyre!("Failed to serialize vary headers: {}", e))?;
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize response headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO entries
         (scope, bucket, request_hash, url, method, vary, response_url, status, status_text, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        scope,
        bucket,
        key.hash,
        key.url,
        request.method.as_str(),
        vary,
        response.url,
        response.status,
        response.status_text,
        headers,
        response.body
      ],
    )
    .map_err(|e| eyre!("Failed to store {}: {}", key.url, e))?;

  Ok(())
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::Method;
  use url::Url;

  const SCOPE: &str = "https://example.com/";

  fn get(s: &str) -> Request {
    Request::get(Url::parse(s).unwrap())
  }

  fn ok(url: &str, body: &str) -> Response {
    Response::new(url, 200, body)
  }

  fn storage() -> SqliteStorage {
    SqliteStorage::open_in_memory().unwrap()
  }

  #[test]
  fn test_open_bucket_is_idempotent() {
    let s = storage();
    assert!(s.open_bucket(SCOPE, "v1").unwrap());
    assert!(!s.open_bucket(SCOPE, "v1").unwrap());
    assert!(s.has_bucket(SCOPE, "v1").unwrap());
    assert!(!s.has_bucket(SCOPE, "v2").unwrap());
  }

  #[test]
  fn test_bucket_names_in_creation_order() {
    let s = storage();
    s.open_bucket(SCOPE, "b").unwrap();
    s.open_bucket(SCOPE, "a").unwrap();
    s.open_bucket(SCOPE, "c").unwrap();
    assert_eq!(s.bucket_names(SCOPE).unwrap(), vec!["b", "a", "c"]);
  }

  #[test]
  fn test_buckets_are_isolated_per_scope() {
    let s = storage();
    let other = "https://other.example/";
    s.open_bucket(SCOPE, "v1").unwrap();
    s.open_bucket(other, "v1").unwrap();
    s.open_bucket(other, "v2").unwrap();
    s.put(SCOPE, "v1", &get("https://example.com/"), &ok("https://example.com/", "mine"))
      .unwrap();

    assert_eq!(s.bucket_names(SCOPE).unwrap(), vec!["v1"]);
    assert_eq!(s.bucket_names(other).unwrap(), vec!["v1", "v2"]);
    assert!(s
      .match_request(other, "v1", &get("https://example.com/"))
      .unwrap()
      .is_none());

    // Deleting the same bucket name in another scope leaves ours alone
    assert!(s.delete_bucket(other, "v1").unwrap());
    assert!(s.has_bucket(SCOPE, "v1").unwrap());
    assert_eq!(s.keys(SCOPE, "v1").unwrap(), vec!["https://example.com/"]);
  }

  #[test]
  fn test_delete_bucket_removes_entries() {
    let s = storage();
    s.open_bucket(SCOPE, "v1").unwrap();
    s.put(SCOPE, "v1", &get("https://example.com/"), &ok("https://example.com/", "x"))
      .unwrap();

    assert!(s.delete_bucket(SCOPE, "v1").unwrap());
    assert!(!s.delete_bucket(SCOPE, "v1").unwrap());
    assert!(s.bucket_names(SCOPE).unwrap().is_empty());

    // Recreating the bucket starts empty
    s.open_bucket(SCOPE, "v1").unwrap();
    assert!(s.keys(SCOPE, "v1").unwrap().is_empty());
  }

  #[test]
  fn test_put_and_match() {
    let s = storage();
    s.open_bucket(SCOPE, "v1").unwrap();
    let req = get("https://example.com/index.html");
    let res = ok("https://example.com/index.html", "<html>").with_header("Content-Type", "text/html");
    s.put(SCOPE, "v1", &req, &res).unwrap();

    let cached = s.match_request(SCOPE, "v1", &req).unwrap().unwrap();
    assert_eq!(cached.response, res);
    assert!(s.match_request(SCOPE, "v2", &req).unwrap().is_none());
    assert!(s
      .match_request(SCOPE, "v1", &get("https://example.com/other"))
      .unwrap()
      .is_none());
  }

  #[test]
  fn test_put_replaces_existing_entry() {
    let s = storage();
    s.open_bucket(SCOPE, "v1").unwrap();
    let req = get("https://example.com/");
    s.put(SCOPE, "v1", &req, &ok("https://example.com/", "old")).unwrap();
    s.put(SCOPE, "v1", &req, &ok("https://example.com/", "new")).unwrap();

    assert_eq!(s.keys(SCOPE, "v1").unwrap(), vec!["https://example.com/"]);
    let cached = s.match_request(SCOPE, "v1", &req).unwrap().unwrap();
    assert_eq!(cached.response.body, b"new");
  }

  #[test]
  fn test_put_into_missing_bucket_fails() {
    let s = storage();
    let err = s
      .put(SCOPE, "gone", &get("https://example.com/"), &ok("https://example.com/", ""))
      .unwrap_err();
    assert!(err.to_string().contains("does not exist"));
    assert!(!s.has_bucket(SCOPE, "gone").unwrap());
  }

  #[test]
  fn test_put_rejects_non_200() {
    let s = storage();
    s.open_bucket(SCOPE, "v1").unwrap();
    let req = get("https://example.com/");
    for status in [204, 206, 304, 404, 500] {
      assert!(s
        .put(SCOPE, "v1", &req, &Response::new("https://example.com/", status, ""))
        .is_err());
    }
    assert!(s.keys(SCOPE, "v1").unwrap().is_empty());
  }

  #[test]
  fn test_put_rejects_non_get() {
    let s = storage();
    s.open_bucket(SCOPE, "v1").unwrap();
    let req = Request::new(Method::POST, Url::parse("https://example.com/").unwrap());
    assert!(s.put(SCOPE, "v1", &req, &ok("https://example.com/", "")).is_err());
  }

  #[test]
  fn test_put_rejects_vary_wildcard() {
    let s = storage();
    s.open_bucket(SCOPE, "v1").unwrap();
    let res = ok("https://example.com/", "").with_header("Vary", "*");
    assert!(s.put(SCOPE, "v1", &get("https://example.com/"), &res).is_err());
  }

  #[test]
  fn test_match_respects_vary() {
    let s = storage();
    s.open_bucket(SCOPE, "v1").unwrap();
    let req = get("https://example.com/").with_header("Accept-Language", "en");
    let res = ok("https://example.com/", "hello").with_header("Vary", "Accept-Language");
    s.put(SCOPE, "v1", &req, &res).unwrap();

    assert!(s.match_request(SCOPE, "v1", &req).unwrap().is_some());
    let german = get("https://example.com/").with_header("Accept-Language", "de");
    assert!(s.match_request(SCOPE, "v1", &german).unwrap().is_none());
  }

  #[test]
  fn test_match_ignores_non_get() {
    let s = storage();
    s.open_bucket(SCOPE, "v1").unwrap();
    let url = Url::parse("https://example.com/").unwrap();
    s.put(SCOPE, "v1", &Request::get(url.clone()), &ok("https://example.com/", ""))
      .unwrap();
    assert!(s
      .match_request(SCOPE, "v1", &Request::new(Method::POST, url))
      .unwrap()
      .is_none());
  }

  #[test]
  fn test_put_all_is_all_or_nothing() {
    let s = storage();
    s.open_bucket(SCOPE, "v1").unwrap();
    let entries = vec![
      (get("https://example.com/a"), ok("https://example.com/a", "a")),
      (
        get("https://example.com/b"),
        Response::new("https://example.com/b", 404, ""),
      ),
    ];
    assert!(s.put_all(SCOPE, "v1", &entries).is_err());
    assert!(s.keys(SCOPE, "v1").unwrap().is_empty());

    let entries = vec![
      (get("https://example.com/a"), ok("https://example.com/a", "a")),
      (get("https://example.com/b"), ok("https://example.com/b", "b")),
    ];
    s.put_all(SCOPE, "v1", &entries).unwrap();
    assert_eq!(
      s.keys(SCOPE, "v1").unwrap(),
      vec!["https://example.com/a", "https://example.com/b"]
    );
  }

  #[test]
  fn test_worker_save_and_load() {
    let s = storage();
    assert!(s.worker(SCOPE, "v1").unwrap().is_none());

    let mut record = WorkerRecord::new(SCOPE, "v1", WorkerState::Installing);
    s.save_worker(&record).unwrap();

    record.state = WorkerState::Installed;
    record.skip_waiting = true;
    s.save_worker(&record).unwrap();
    s.save_worker(&WorkerRecord::new(
      "https://other.com/",
      "v1",
      WorkerState::Activated,
    ))
    .unwrap();

    let loaded = s.worker(SCOPE, "v1").unwrap().unwrap();
    assert_eq!(loaded.state, WorkerState::Installed);
    assert!(loaded.skip_waiting);
    assert!(!loaded.controls_clients);
    assert!(loaded.updated_at.is_some());

    let all = s.workers(SCOPE).unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].version, "v1");
  }

  #[test]
  fn test_open_on_disk_persists() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");

    {
      let s = SqliteStorage::open(&path).unwrap();
      s.open_bucket(SCOPE, "v1").unwrap();
      s.put(SCOPE, "v1", &get("https://example.com/"), &ok("https://example.com/", "x"))
        .unwrap();
    }

    let s = SqliteStorage::open(&path).unwrap();
    assert_eq!(s.bucket_names(SCOPE).unwrap(), vec!["v1"]);
    assert_eq!(s.keys(SCOPE, "v1").unwrap(), vec!["https://example.com/"]);
  }
}
