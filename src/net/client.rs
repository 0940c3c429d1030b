use color_eyre::{eyre::eyre, Result};
use reqwest::header::HeaderMap;
use std::future::Future;

use super::types::{Request, Response};

/// The network fetch primitive.
///
/// An `Err` means the request never produced a response (connection refused,
/// DNS failure, TLS error, ...). Any HTTP status, including 4xx and 5xx, is
/// an `Ok` response.
pub trait Network: Send + Sync {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send;
}

/// reqwest-backed network client
#[derive(Clone)]
pub struct HttpClient {
  client: reqwest::Client,
}

impl HttpClient {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("shellcache/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Network for HttpClient {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }

    let res = builder
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", request.url, e))?;

    let status = res.status().as_u16();
    let url = res.url().to_string();
    let headers = header_pairs(res.headers());

    let body = res
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response body from {}: {}", url, e))?;

    let response = headers
      .into_iter()
      .fold(Response::new(url, status, body.to_vec()), |response, (name, value)| {
        response.with_header(name, value)
      });

    Ok(response)
  }
}

/// Flatten a header map in wire order. Values that are not valid UTF-8 are
/// kept with the offending bytes replaced rather than dropped.
fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
  headers
    .iter()
    .map(|(name, value)| {
      (
        name.as_str().to_string(),
        String::from_utf8_lossy(value.as_bytes()).into_owned(),
      )
    })
    .collect()
}
