//! Network fetch: the trait the cache manager suspends on, and its
//! reqwest-backed implementation.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use url::Url;

use crate::http::{filter_headers, StoredResponse};

/// Issue a GET for a cacheable request.
///
/// Transport errors (refused connection, DNS failure, timeout) come back as
/// `Err`; an HTTP error status is a successful fetch whose response simply
/// isn't ok and will not be stored.
#[async_trait]
pub trait Fetch: Send + Sync {
  async fn fetch(&self, url: &Url, headers: &[(String, String)]) -> Result<StoredResponse>;
}

/// Fetch client backed by reqwest.
///
/// Responses are auto-decompressed by the client, so the bodies handed back
/// (and later stored) are identity-encoded.
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }

  /// Forward a request verbatim (minus hop-by-hop headers) and return the
  /// upstream response. Used for passthrough traffic that is never cached.
  pub async fn forward(
    &self,
    method: &str,
    url: &Url,
    headers: &[(String, String)],
    body: Vec<u8>,
  ) -> Result<StoredResponse> {
    let method: reqwest::Method = method
      .parse()
      .map_err(|_| eyre!("Invalid HTTP method: {}", method))?;

    let mut request = self.client.request(method, url.clone());
    for (name, value) in filter_headers(headers) {
      request = request.header(name, value);
    }
    if !body.is_empty() {
      request = request.body(body);
    }

    let response = request
      .send()
      .await
      .map_err(|e| eyre!("Forward to {} failed: {}", url, e))?;

    into_stored(response).await
  }
}

#[async_trait]
impl Fetch for HttpFetcher {
  async fn fetch(&self, url: &Url, headers: &[(String, String)]) -> Result<StoredResponse> {
    let mut request = self.client.get(url.clone());
    for (name, value) in filter_headers(headers) {
      request = request.header(name, value);
    }

    let response = request
      .send()
      .await
      .map_err(|e| eyre!("Fetch of {} failed: {}", url, e))?;

    into_stored(response).await
  }
}

async fn into_stored(response: reqwest::Response) -> Result<StoredResponse> {
  let status = response.status().as_u16();
  let headers: Vec<(String, String)> = response
    .headers()
    .iter()
    .filter_map(|(name, value)| {
      value
        .to_str()
        .ok()
        .map(|v| (name.as_str().to_string(), v.to_string()))
    })
    .collect();
  let headers = filter_headers(&headers);

  let url = response.url().clone();
  let body = response
    .bytes()
    .await
    .map_err(|e| eyre!("Failed to read body of {}: {}", url, e))?
    .to_vec();

  Ok(StoredResponse {
    status,
    headers,
    body,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use wiremock::matchers::{header, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  #[tokio::test]
  async fn test_fetch_ok_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/style.css"))
      .respond_with(ResponseTemplate::new(200).set_body_raw("body { margin: 0 }", "text/css"))
      .mount(&server)
      .await;

    let fetcher = HttpFetcher::new().unwrap();
    let url = Url::parse(&format!("{}/style.css", server.uri())).unwrap();
    let response = fetcher.fetch(&url, &[]).await.unwrap();

    assert!(response.is_ok());
    assert_eq!(response.body, b"body { margin: 0 }");
    assert!(response
      .headers
      .iter()
      .any(|(n, v)| n == "content-type" && v == "text/css"));
  }

  #[tokio::test]
  async fn test_fetch_error_status_is_not_transport_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .respond_with(ResponseTemplate::new(404))
      .mount(&server)
      .await;

    let fetcher = HttpFetcher::new().unwrap();
    let url = Url::parse(&format!("{}/missing.png", server.uri())).unwrap();
    let response = fetcher.fetch(&url, &[]).await.unwrap();

    assert_eq!(response.status, 404);
    assert!(!response.is_ok());
  }

  #[tokio::test]
  async fn test_fetch_dead_upstream_is_transport_error() {
    // A bare (non-pooled) server actually releases its port on drop
    let server = MockServer::builder().start().await;
    let url = Url::parse(&format!("{}/x", server.uri())).unwrap();
    drop(server);

    let fetcher = HttpFetcher::new().unwrap();
    assert!(fetcher.fetch(&url, &[]).await.is_err());
  }

  #[tokio::test]
  async fn test_fetch_passes_request_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(header("accept", "text/css"))
      .respond_with(ResponseTemplate::new(200))
      .expect(1)
      .mount(&server)
      .await;

    let fetcher = HttpFetcher::new().unwrap();
    let url = Url::parse(&format!("{}/a.css", server.uri())).unwrap();
    let headers = vec![
      ("accept".to_string(), "text/css".to_string()),
      // Hop-by-hop headers are dropped before forwarding
      ("connection".to_string(), "keep-alive".to_string()),
    ];
    let response = fetcher.fetch(&url, &headers).await.unwrap();
    assert!(response.is_ok());
  }

  #[tokio::test]
  async fn test_forward_post() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/api/records"))
      .respond_with(ResponseTemplate::new(201).set_body_string("created"))
      .mount(&server)
      .await;

    let fetcher = HttpFetcher::new().unwrap();
    let url = Url::parse(&format!("{}/api/records", server.uri())).unwrap();
    let response = fetcher
      .forward("POST", &url, &[], b"{\"liters\":42}".to_vec())
      .await
      .unwrap();

    assert_eq!(response.status, 201);
    assert_eq!(response.body, b"created");
  }
}
