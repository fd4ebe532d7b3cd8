//! CLI command implementations: serve, precache, status, clear.

use clap::ValueEnum;
use color_eyre::Result;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

use crate::config::Config;
use crate::fetch::HttpFetcher;
use crate::manager::{CacheManager, PrecacheReport};
use crate::server::{self, AppState};
use crate::store::{BucketStore, SqliteStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Table,
  Json,
}

fn open_store(config: &Config) -> Result<SqliteStore> {
  SqliteStore::open(&config.cache_db_path()?)
}

fn build_manager(config: &Config) -> Result<CacheManager<SqliteStore, HttpFetcher>> {
  let store = open_store(config)?;
  let fetcher = HttpFetcher::new()?;
  CacheManager::new(store, fetcher, config)
}

/// Full lifecycle: precache the manifest, sweep stale buckets, then serve.
pub async fn serve(config: Config) -> Result<()> {
  let manager = build_manager(&config)?;

  let report = manager.setup(&config.precache).await?;
  if !report.failed.is_empty() {
    warn!(
      failed = report.failed.len(),
      "some manifest entries were not precached; they will be fetched on demand"
    );
  }
  manager.activate()?;

  let state = Arc::new(AppState { manager, config });
  server::run(state).await
}

/// Run setup and activation, print the report, and exit.
///
/// Partial failures do not fail the command; they are part of the report.
pub async fn precache(config: Config) -> Result<()> {
  let manager = build_manager(&config)?;

  let report = manager.setup(&config.precache).await?;
  manager.activate()?;

  print_report(&config.version, &report);
  Ok(())
}

fn print_report(version: &str, report: &PrecacheReport) {
  println!(
    "Precached {} entries into bucket '{}'",
    report.stored, version
  );
  if !report.failed.is_empty() {
    println!("{} entries failed:", report.failed.len());
    for failure in &report.failed {
      println!("  {}: {}", failure.url, failure.reason);
    }
  }
}

/// List cache buckets with entry counts, marking the current version.
pub fn status(config: Config, format: OutputFormat) -> Result<()> {
  let store = open_store(&config)?;
  let buckets = store.list_buckets()?;

  match format {
    OutputFormat::Json => {
      let entries: Vec<serde_json::Value> = buckets
        .iter()
        .map(|name| {
          Ok(json!({
            "name": name,
            "entries": store.entry_count(name)?,
            "current": *name == config.version,
          }))
        })
        .collect::<Result<_>>()?;
      let output = json!({
        "version": config.version,
        "buckets": entries,
      });
      println!("{}", serde_json::to_string_pretty(&output)?);
    }
    OutputFormat::Table => {
      if buckets.is_empty() {
        println!("No cache buckets.");
        return Ok(());
      }
      for name in &buckets {
        let marker = if *name == config.version {
          " (current)"
        } else {
          ""
        };
        println!("{}  {} entries{}", name, store.entry_count(name)?, marker);
      }
    }
  }

  Ok(())
}

/// Delete stale buckets; with `all`, delete the current one too.
pub fn clear(config: Config, all: bool) -> Result<()> {
  let store = open_store(&config)?;

  let mut deleted = 0;
  for name in store.list_buckets()? {
    if all || name != config.version {
      store.delete_bucket(&name)?;
      println!("Deleted bucket '{}'", name);
      deleted += 1;
    }
  }
  if deleted == 0 {
    println!("Nothing to delete.");
  }

  Ok(())
}
