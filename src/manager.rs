//! The offline cache manager: pre-cache on setup, sweep stale buckets on
//! activation, and apply the fetch policy to intercepted requests.
//!
//! Policy: navigation requests are network-first with cache fallback (users
//! expect the latest page, but the app must still open offline); asset
//! requests are cache-first with opportunistic population (assets rarely
//! change within a version and are content-versioned by URL).

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Config;
use crate::fetch::Fetch;
use crate::http::{canonical_key, StoredResponse};
use crate::store::BucketStore;

/// Outcome of the precache pass. Individual failures never abort setup.
#[derive(Debug, Default)]
pub struct PrecacheReport {
  pub stored: usize,
  pub failed: Vec<PrecacheFailure>,
}

#[derive(Debug)]
pub struct PrecacheFailure {
  pub url: String,
  pub reason: String,
}

/// A response produced by the fetch policy, tagged with where it came from.
#[derive(Debug)]
pub enum Served {
  /// Fresh from the network (a cache miss, or a navigation refresh).
  Network(StoredResponse),
  /// Exact cache match.
  Cached(StoredResponse),
  /// The cached shell document, served when an offline navigation has no
  /// exact match.
  Shell(StoredResponse),
}

impl Served {
  pub fn into_response(self) -> StoredResponse {
    match self {
      Served::Network(r) | Served::Cached(r) | Served::Shell(r) => r,
    }
  }
}

/// Cache manager owning one versioned bucket.
///
/// Lifecycle is driven entirely by the host: `setup` on startup, `activate`
/// once setup completes, then `handle` for every intercepted request.
pub struct CacheManager<S: BucketStore, F: Fetch> {
  store: Arc<S>,
  fetcher: Arc<F>,
  version: String,
  upstream: Url,
  shell_key: Url,
}

impl<S: BucketStore, F: Fetch> CacheManager<S, F> {
  pub fn new(store: S, fetcher: F, config: &Config) -> Result<Self> {
    let shell_key = canonical_key(&config.upstream, &config.shell)?;

    Ok(Self {
      store: Arc::new(store),
      fetcher: Arc::new(fetcher),
      version: config.version.clone(),
      upstream: config.upstream.clone(),
      shell_key,
    })
  }

  #[allow(dead_code)]
  pub fn store(&self) -> &S {
    &self.store
  }

  pub fn fetcher(&self) -> &F {
    &self.fetcher
  }

  /// Pre-cache the manifest into the current version's bucket.
  ///
  /// All fetches are issued concurrently. An entry is stored only when the
  /// response is ok; a transport failure or non-ok status is recorded in the
  /// report and logged, and never aborts setup.
  pub async fn setup(&self, manifest: &[String]) -> Result<PrecacheReport> {
    info!(version = %self.version, entries = manifest.len(), "precaching manifest");
    self.store.open_bucket(&self.version)?;

    let fetches = manifest.iter().map(|entry| async move {
      let outcome = self.precache_one(entry).await;
      (entry.clone(), outcome)
    });

    let mut report = PrecacheReport::default();
    for (entry, outcome) in join_all(fetches).await {
      match outcome {
        Ok(()) => report.stored += 1,
        Err(e) => {
          warn!(url = %entry, error = %e, "failed to precache entry");
          report.failed.push(PrecacheFailure {
            url: entry,
            reason: e.to_string(),
          });
        }
      }
    }

    info!(
      stored = report.stored,
      failed = report.failed.len(),
      "precache complete"
    );
    Ok(report)
  }

  async fn precache_one(&self, entry: &str) -> Result<()> {
    let url = canonical_key(&self.upstream, entry)?;
    let response = self.fetcher.fetch(&url, &[]).await?;
    if !response.is_ok() {
      return Err(eyre!("unexpected status {}", response.status));
    }
    self.store.put(&self.version, url.as_str(), &response)?;
    Ok(())
  }

  /// Sweep buckets left behind by previous versions.
  ///
  /// A deletion failure is a logged warning, not an error: a stale bucket
  /// that lingers costs disk space, never correctness.
  pub fn activate(&self) -> Result<()> {
    for name in self.store.list_buckets()? {
      if name != self.version {
        info!(bucket = %name, "deleting stale cache bucket");
        if let Err(e) = self.store.delete_bucket(&name) {
          warn!(bucket = %name, error = %e, "failed to delete stale bucket");
        }
      }
    }
    info!(version = %self.version, "cache manager active");
    Ok(())
  }

  /// Apply the fetch policy to an intercepted request.
  ///
  /// `Ok(None)` means no response could be produced (offline with a cold
  /// cache); the host decides how to surface that. Storage failures
  /// propagate; network failures never do.
  pub async fn handle(
    &self,
    key: &Url,
    navigation: bool,
    headers: &[(String, String)],
  ) -> Result<Option<Served>> {
    if navigation {
      self.handle_navigation(key, headers).await
    } else {
      self.handle_asset(key, headers).await
    }
  }

  /// Network-first with cache fallback.
  async fn handle_navigation(
    &self,
    key: &Url,
    headers: &[(String, String)],
  ) -> Result<Option<Served>> {
    match self.fetcher.fetch(key, headers).await {
      Ok(response) => {
        if response.is_ok() {
          if let Err(e) = self.store.put(&self.version, key.as_str(), &response) {
            warn!(url = %key, error = %e, "failed to store navigation response");
          }
        }
        Ok(Some(Served::Network(response)))
      }
      Err(e) => {
        debug!(url = %key, error = %e, "navigation fetch failed, falling back to cache");
        if let Some(entry) = self.store.lookup(&self.version, key.as_str())? {
          return Ok(Some(Served::Cached(entry.response)));
        }
        if let Some(entry) = self.store.lookup(&self.version, self.shell_key.as_str())? {
          return Ok(Some(Served::Shell(entry.response)));
        }
        warn!(url = %key, "offline navigation with nothing cached, no response produced");
        Ok(None)
      }
    }
  }

  /// Cache-first with opportunistic population.
  async fn handle_asset(&self, key: &Url, headers: &[(String, String)]) -> Result<Option<Served>> {
    if let Some(entry) = self.store.lookup(&self.version, key.as_str())? {
      return Ok(Some(Served::Cached(entry.response)));
    }

    match self.fetcher.fetch(key, headers).await {
      Ok(response) => {
        if response.is_ok() {
          if let Err(e) = self.store.put(&self.version, key.as_str(), &response) {
            warn!(url = %key, error = %e, "failed to store asset response");
          }
        }
        Ok(Some(Served::Network(response)))
      }
      Err(e) => {
        warn!(url = %key, error = %e, "asset fetch failed on a cache miss");
        Ok(None)
      }
    }
  }
}

impl<S: BucketStore, F: Fetch> Clone for CacheManager<S, F> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      fetcher: Arc::clone(&self.fetcher),
      version: self.version.clone(),
      upstream: self.upstream.clone(),
      shell_key: self.shell_key.clone(),
    }
  }
}
