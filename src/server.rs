//! HTTP host: intercepts every request addressed to the proxy and routes it
//! through the cache manager (or straight upstream for passthrough traffic).

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use axum::Router;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::fetch::HttpFetcher;
use crate::http::{canonical_key, classify, filter_headers, RequestKind, StoredResponse};
use crate::manager::{CacheManager, Served};
use crate::store::BucketStore;

/// Response header marking how the proxy produced the response:
/// hit, miss, shell, or bypass.
pub const CACHE_HEADER: &str = "x-silo-cache";

/// Request bodies are buffered before forwarding; anything bigger than this
/// is rejected.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

pub struct AppState<S: BucketStore> {
  pub manager: CacheManager<S, HttpFetcher>,
  pub config: Config,
}

/// Build the proxy router. Every path falls through to the intercept
/// handler; there are no routes of our own.
pub fn router<S: BucketStore + 'static>(state: Arc<AppState<S>>) -> Router {
  Router::new()
    .fallback(intercept::<S>)
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

/// Bind the configured listen address and serve until the process exits.
pub async fn run<S: BucketStore + 'static>(state: Arc<AppState<S>>) -> Result<()> {
  let listen = state.config.listen;
  let app = router(state);

  let listener = tokio::net::TcpListener::bind(listen)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", listen, e))?;
  info!(addr = %listen, "proxy listening");

  axum::serve(listener, app)
    .await
    .map_err(|e| eyre!("Server error: {}", e))
}

async fn intercept<S: BucketStore + 'static>(
  State(state): State<Arc<AppState<S>>>,
  request: Request,
) -> Response {
  let (parts, body) = request.into_parts();

  let method = parts.method.as_str().to_string();
  let headers: Vec<(String, String)> = parts
    .headers
    .iter()
    .filter_map(|(name, value)| {
      value
        .to_str()
        .ok()
        .map(|v| (name.as_str().to_string(), v.to_string()))
    })
    .collect();

  // Origin-form targets resolve against the upstream; absolute-form targets
  // (forward-proxy style, used for CDN assets) are taken as-is.
  let target = if parts.uri.scheme().is_some() {
    parts.uri.to_string()
  } else {
    parts
      .uri
      .path_and_query()
      .map(|pq| pq.to_string())
      .unwrap_or_else(|| "/".to_string())
  };

  let key = match canonical_key(&state.config.upstream, &target) {
    Ok(key) => key,
    Err(e) => {
      warn!(target = %target, error = %e, "unresolvable request target");
      return empty_response(StatusCode::BAD_REQUEST, None);
    }
  };

  let kind = classify(&method, parts.uri.path(), &headers, &state.config.bypass);

  match kind {
    RequestKind::Passthrough => {
      let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes.to_vec(),
        Err(e) => {
          warn!(url = %key, error = %e, "failed to buffer request body");
          return empty_response(StatusCode::PAYLOAD_TOO_LARGE, None);
        }
      };

      match state
        .manager
        .fetcher()
        .forward(&method, &key, &headers, body)
        .await
      {
        Ok(response) => into_axum(response, "bypass"),
        Err(e) => {
          warn!(url = %key, error = %e, "passthrough forward failed");
          empty_response(StatusCode::BAD_GATEWAY, Some("bypass"))
        }
      }
    }
    RequestKind::Navigation | RequestKind::Asset => {
      let navigation = kind == RequestKind::Navigation;
      match state.manager.handle(&key, navigation, &headers).await {
        Ok(Some(served)) => {
          let marker = match &served {
            Served::Network(_) => "miss",
            Served::Cached(_) => "hit",
            Served::Shell(_) => "shell",
          };
          into_axum(served.into_response(), marker)
        }
        // Offline with a cold cache: nothing to serve
        Ok(None) => empty_response(StatusCode::GATEWAY_TIMEOUT, Some("miss")),
        Err(e) => {
          error!(url = %key, error = %e, "cache storage failure");
          empty_response(StatusCode::INTERNAL_SERVER_ERROR, None)
        }
      }
    }
  }
}

/// Convert a stored/fetched response into an axum response, replaying its
/// headers (minus hop-by-hop ones) and tagging the cache marker.
fn into_axum(stored: StoredResponse, marker: &str) -> Response {
  let status = StatusCode::from_u16(stored.status).unwrap_or(StatusCode::BAD_GATEWAY);
  let mut builder = Response::builder().status(status);

  for (name, value) in filter_headers(&stored.headers) {
    if let (Ok(name), Ok(value)) = (
      name.parse::<HeaderName>(),
      HeaderValue::from_str(&value),
    ) {
      builder = builder.header(name, value);
    }
  }
  builder = builder.header(CACHE_HEADER, marker);

  builder
    .body(Body::from(stored.body))
    .unwrap_or_else(|_| empty_response(StatusCode::INTERNAL_SERVER_ERROR, None))
}

fn empty_response(status: StatusCode, marker: Option<&str>) -> Response {
  let mut builder = Response::builder().status(status);
  if let Some(marker) = marker {
    builder = builder.header(CACHE_HEADER, marker);
  }
  builder.body(Body::empty()).unwrap()
}
