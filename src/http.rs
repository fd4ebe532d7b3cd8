//! Shared HTTP vocabulary: stored responses, canonical request keys,
//! request classification, and header hygiene for forwarding/replay.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use url::Url;

/// An HTTP response as it lives in a cache bucket: status, headers, body.
///
/// Bodies are buffered whole; the fetch client decompresses on the way in,
/// so stored bodies are always identity-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl StoredResponse {
  /// Whether the response has an ok (2xx) status. Only ok responses are
  /// ever written into a bucket.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// How a request was classified for the fetch policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
  /// Top-level document load: network-first with cache fallback.
  Navigation,
  /// Subordinate asset: cache-first with opportunistic population.
  Asset,
  /// Forwarded verbatim, never cached (non-GET, or a bypass prefix).
  Passthrough,
}

/// Classify an intercepted request.
///
/// Navigation means `Sec-Fetch-Mode: navigate`, or — for clients that don't
/// send fetch metadata — a GET whose Accept header asks for text/html.
pub fn classify(method: &str, path: &str, headers: &[(String, String)], bypass: &[String]) -> RequestKind {
  if !method.eq_ignore_ascii_case("GET") {
    return RequestKind::Passthrough;
  }
  if bypass.iter().any(|prefix| path.starts_with(prefix.as_str())) {
    return RequestKind::Passthrough;
  }

  if let Some(mode) = header_value(headers, "sec-fetch-mode") {
    if mode.eq_ignore_ascii_case("navigate") {
      return RequestKind::Navigation;
    }
    return RequestKind::Asset;
  }

  if let Some(accept) = header_value(headers, "accept") {
    if accept.to_ascii_lowercase().contains("text/html") {
      return RequestKind::Navigation;
    }
  }

  RequestKind::Asset
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
  headers
    .iter()
    .find(|(n, _)| n.eq_ignore_ascii_case(name))
    .map(|(_, v)| v.as_str())
}

/// Compute the canonical cache key for a request target.
///
/// Origin-form targets ("/style.css") are joined onto the upstream origin;
/// absolute-form targets (forward-proxy style, used for CDN assets) are used
/// as-is. The fragment is dropped; the url crate lowercases the host and
/// elides default ports.
pub fn canonical_key(upstream: &Url, target: &str) -> Result<Url> {
  let mut url = if target.starts_with("http://") || target.starts_with("https://") {
    Url::parse(target).map_err(|e| eyre!("Invalid request target {}: {}", target, e))?
  } else {
    let relative = target.trim_start_matches("./");
    upstream
      .join(relative)
      .map_err(|e| eyre!("Cannot resolve {} against {}: {}", target, upstream, e))?
  };
  url.set_fragment(None);
  Ok(url)
}

/// Hop-by-hop headers, plus headers the fetch client manages itself.
/// Stripped both when forwarding a request upstream and when replaying a
/// stored response to a client.
const STRIP_HEADERS: &[&str] = &[
  "connection",
  "keep-alive",
  "proxy-authenticate",
  "proxy-authorization",
  "proxy-connection",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
  "host",
  "accept-encoding",
  "content-length",
];

/// Drop hop-by-hop and client-managed headers from a header list.
pub fn filter_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
  headers
    .iter()
    .filter(|(name, _)| !STRIP_HEADERS.iter().any(|s| name.eq_ignore_ascii_case(s)))
    .cloned()
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn hdrs(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
      .iter()
      .map(|(n, v)| (n.to_string(), v.to_string()))
      .collect()
  }

  #[test]
  fn test_classify_by_fetch_metadata() {
    let nav = hdrs(&[("Sec-Fetch-Mode", "navigate")]);
    assert_eq!(classify("GET", "/", &nav, &[]), RequestKind::Navigation);

    let sub = hdrs(&[("Sec-Fetch-Mode", "no-cors"), ("Accept", "text/html")]);
    // Fetch metadata wins over the Accept heuristic
    assert_eq!(classify("GET", "/style.css", &sub, &[]), RequestKind::Asset);
  }

  #[test]
  fn test_classify_by_accept_header() {
    let nav = hdrs(&[("Accept", "text/html,application/xhtml+xml")]);
    assert_eq!(classify("GET", "/", &nav, &[]), RequestKind::Navigation);

    let css = hdrs(&[("Accept", "text/css,*/*;q=0.1")]);
    assert_eq!(classify("GET", "/style.css", &css, &[]), RequestKind::Asset);

    assert_eq!(classify("GET", "/script.js", &[], &[]), RequestKind::Asset);
  }

  #[test]
  fn test_classify_passthrough() {
    let nav = hdrs(&[("Accept", "text/html")]);
    assert_eq!(classify("POST", "/", &nav, &[]), RequestKind::Passthrough);

    let bypass = vec!["/api/".to_string()];
    assert_eq!(
      classify("GET", "/api/records", &nav, &bypass),
      RequestKind::Passthrough
    );
    assert_eq!(classify("GET", "/app.js", &[], &bypass), RequestKind::Asset);
  }

  #[test]
  fn test_canonical_key_origin_form() {
    let upstream = Url::parse("http://localhost:3000").unwrap();
    let key = canonical_key(&upstream, "/style.css").unwrap();
    assert_eq!(key.as_str(), "http://localhost:3000/style.css");

    // Manifest entries use service-worker style relative paths
    let key = canonical_key(&upstream, "./index.html").unwrap();
    assert_eq!(key.as_str(), "http://localhost:3000/index.html");

    let key = canonical_key(&upstream, "./").unwrap();
    assert_eq!(key.as_str(), "http://localhost:3000/");
  }

  #[test]
  fn test_canonical_key_absolute_form() {
    let upstream = Url::parse("http://localhost:3000").unwrap();
    let key = canonical_key(&upstream, "https://CDN.Example.com:443/chart.min.js#v3").unwrap();
    // Host lowercased, default port elided, fragment dropped
    assert_eq!(key.as_str(), "https://cdn.example.com/chart.min.js");
  }

  #[test]
  fn test_filter_headers() {
    let filtered = filter_headers(&hdrs(&[
      ("Connection", "keep-alive"),
      ("Transfer-Encoding", "chunked"),
      ("Host", "localhost:3000"),
      ("Accept-Encoding", "gzip"),
      ("Content-Type", "text/css"),
      ("Cache-Control", "max-age=3600"),
    ]));

    assert_eq!(
      filtered,
      hdrs(&[("Content-Type", "text/css"), ("Cache-Control", "max-age=3600")])
    );
  }

  #[test]
  fn test_stored_response_ok() {
    let mut resp = StoredResponse {
      status: 200,
      headers: vec![],
      body: vec![],
    };
    assert!(resp.is_ok());
    resp.status = 304;
    assert!(!resp.is_ok());
    resp.status = 404;
    assert!(!resp.is_ok());
  }
}
