//! Request identity: how a request maps to a cache key.

use color_eyre::{eyre::bail, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::net::{Request, Response};

/// Cache key derived from a GET request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  /// Normalized URL (fragment removed)
  pub url: String,
  /// Hex SHA-256 of method and normalized URL
  pub hash: String,
}

impl RequestKey {
  pub fn for_request(request: &Request) -> Self {
    let mut url = request.url.clone();
    url.set_fragment(None);
    let url = url.to_string();

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(request.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(url.as_bytes());
    let hash = hex::encode(hasher.finalize());

    Self { url, hash }
  }
}

/// A request header value captured because the response varies on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaryHeader {
  pub name: String,
  pub value: Option<String>,
}

/// Capture the request headers named by the response's `Vary` header.
///
/// Fails for `Vary: *`, which can never be matched again.
pub fn capture_vary(request: &Request, response: &Response) -> Result<Vec<VaryHeader>> {
  let mut captured = Vec::new();
  for name in response.vary() {
    if name == "*" {
      bail!("Response for {} has Vary: * and cannot be cached", request.url);
    }
    captured.push(VaryHeader {
      value: request.header(&name).map(String::from),
      name,
    });
  }
  Ok(captured)
}

/// Whether an incoming request agrees with every captured vary header.
pub fn vary_matches(captured: &[VaryHeader], request: &Request) -> bool {
  captured
    .iter()
    .all(|h| request.header(&h.name) == h.value.as_deref())
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::Method;
  use url::Url;

  fn get(s: &str) -> Request {
    Request::get(Url::parse(s).unwrap())
  }

  #[test]
  fn test_fragment_is_ignored() {
    let a = RequestKey::for_request(&get("https://example.com/app/index.html"));
    let b = RequestKey::for_request(&get("https://example.com/app/index.html#top"));
    assert_eq!(a, b);
    assert_eq!(a.url, "https://example.com/app/index.html");
  }

  #[test]
  fn test_query_is_significant() {
    let a = RequestKey::for_request(&get("https://example.com/?v=1"));
    let b = RequestKey::for_request(&get("https://example.com/?v=2"));
    assert_ne!(a.hash, b.hash);
  }

  #[test]
  fn test_method_is_part_of_key() {
    let url = Url::parse("https://example.com/").unwrap();
    let a = RequestKey::for_request(&Request::get(url.clone()));
    let b = RequestKey::for_request(&Request::new(Method::HEAD, url));
    assert_ne!(a.hash, b.hash);
  }

  #[test]
  fn test_hash_is_hex_sha256() {
    let key = RequestKey::for_request(&get("https://example.com/"));
    assert_eq!(key.hash.len(), 64);
    assert!(key.hash.chars().all(|c| c.is_ascii_hexdigit()));
  }

  #[test]
  fn test_capture_and_match_vary() {
    let req = get("https://example.com/").with_header("Accept-Language", "en");
    let res = Response::new("https://example.com/", 200, "hi").with_header("Vary", "Accept-Language");

    let captured = capture_vary(&req, &res).unwrap();
    assert_eq!(
      captured,
      vec![VaryHeader {
        name: "accept-language".to_string(),
        value: Some("en".to_string()),
      }]
    );

    assert!(vary_matches(&captured, &req));
    let other = get("https://example.com/").with_header("accept-language", "de");
    assert!(!vary_matches(&captured, &other));
    assert!(!vary_matches(&captured, &get("https://example.com/")));
  }

  #[test]
  fn test_missing_header_matches_missing() {
    let req = get("https://example.com/");
    let res = Response::new("https://example.com/", 200, "").with_header("Vary", "Cookie");
    let captured = capture_vary(&req, &res).unwrap();
    assert!(vary_matches(&captured, &get("https://example.com/")));
    assert!(!vary_matches(
      &captured,
      &get("https://example.com/").with_header("Cookie", "a=1")
    ));
  }

  #[test]
  fn test_vary_wildcard_rejected() {
    let req = get("https://example.com/");
    let res = Response::new("https://example.com/", 200, "").with_header("Vary", "*");
    assert!(capture_vary(&req, &res).is_err());
  }
}
