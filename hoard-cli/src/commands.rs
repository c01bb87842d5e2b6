use std::path::Path;
use std::time::Duration;

use futures::future::join_all;
use hoard_engine::{CacheConfig, ConsistencyReport, DownloadProgress, DownloadStatus, OfflineCache, Phase};
use serde::Serialize;
use tracing::{info, warn};

use crate::cli::Args;
use crate::error::{AppError, Result};
use crate::params::parse_params;
use crate::progress;

/// Build the engine configuration from flags and environment.
pub fn build_config(args: &Args) -> Result<CacheConfig> {
    let mut builder = CacheConfig::builder()
        .database_url(args.database.as_str())
        .concurrency(args.concurrency)
        .max_retries(args.retries)
        .timeout(Duration::from_secs(args.timeout));

    for (name, value) in parse_params(&args.headers)? {
        builder = builder.header(&name, &value)?;
    }
    Ok(builder.build()?)
}

fn describe(status: &DownloadStatus) -> String {
    match status {
        DownloadStatus::Absent => "absent".to_string(),
        DownloadStatus::Downloading { completed, total } => {
            format!("downloading ({completed}/{total})")
        }
        DownloadStatus::Complete => "complete".to_string(),
        DownloadStatus::IncompleteResumable => "incomplete (resumable)".to_string(),
    }
}

#[derive(Serialize)]
struct DownloadSummary<'a> {
    url: &'a str,
    status: DownloadStatus,
    progress: DownloadProgress,
}

#[derive(Serialize)]
struct StatusLine<'a> {
    url: &'a str,
    status: DownloadStatus,
}

#[derive(Serialize)]
struct Removed<'a> {
    url: &'a str,
    removed: u64,
}

#[derive(Serialize)]
struct Exported<'a> {
    url: &'a str,
    path: &'a Path,
    bytes: usize,
}

pub struct CommandExecutor {
    cache: OfflineCache,
    json: bool,
}

impl CommandExecutor {
    pub async fn open(args: &Args) -> Result<Self> {
        let config = build_config(args)?;
        info!(database = %config.database_url, concurrency = config.concurrency, "Opening cache");
        Ok(Self {
            cache: OfflineCache::open(config).await?,
            json: args.json,
        })
    }

    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce() -> String) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(value)?);
        } else {
            println!("{}", text());
        }
        Ok(())
    }

    pub async fn download(&self, url: &str) -> Result<()> {
        let report = self.cache.run_consistency_check().await;
        if !report.is_clean() {
            info!(
                orphaned = report.orphaned_owners.len(),
                resumed = report.resumed.len(),
                "Cache reconciled before download"
            );
        }

        // Downloads the check resumed are followed too, so the process does
        // not exit while they are half done.
        let resumed: Vec<_> = resumed_besides(&report, url)
            .into_iter()
            .filter_map(|other| self.cache.handle(other))
            .collect();
        let handle = self.cache.start(url);
        let (last, resumed_results) = tokio::join!(
            progress::follow(&handle),
            join_all(resumed.iter().map(|handle| progress::follow(handle)))
        );
        let last = last?;
        for (other, result) in resumed.iter().zip(resumed_results) {
            let other_last = result?;
            if other_last.phase != Phase::Finished {
                warn!(url = %other.url(), phase = ?other_last.phase, "Resumed download did not finish");
            }
        }
        let status = self.cache.status(url).await?;

        self.emit(
            &DownloadSummary {
                url,
                status,
                progress: last,
            },
            || {
                format!(
                    "{url}: {} ({}/{} resources, {} failed)",
                    describe(&status),
                    last.completed,
                    last.total,
                    last.failed
                )
            },
        )?;

        match last.phase {
            Phase::Finished => Ok(()),
            phase => Err(AppError::Incomplete {
                url: url.to_string(),
                reason: format!("download ended {phase:?}"),
            }),
        }
    }

    pub async fn status(&self, url: &str) -> Result<()> {
        let status = self.cache.status(url).await?;
        self.emit(&StatusLine { url, status }, || {
            format!("{url}: {}", describe(&status))
        })
    }

    pub async fn delete(&self, url: &str) -> Result<()> {
        let removed = self.cache.delete(url).await?;
        self.emit(&Removed { url, removed }, || {
            format!("{url}: removed {removed} records")
        })
    }

    pub async fn check(&self, wait: bool) -> Result<()> {
        let report = self.cache.run_consistency_check().await;
        self.emit(&report, || describe_report(&report))?;

        if !wait || report.resumed.is_empty() {
            return Ok(());
        }

        let handles: Vec<_> = report
            .resumed
            .iter()
            .filter_map(|url| self.cache.handle(url))
            .collect();
        let results = join_all(handles.iter().map(|handle| progress::follow(handle))).await;

        let mut unfinished = 0;
        for (handle, result) in handles.iter().zip(results) {
            let last = result?;
            if last.phase != Phase::Finished {
                warn!(url = %handle.url(), phase = ?last.phase, "Resumed download did not finish");
                unfinished += 1;
            }
        }
        if unfinished > 0 {
            return Err(AppError::Incomplete {
                url: format!("{unfinished} resumed manifest(s)"),
                reason: "see log for details".to_string(),
            });
        }
        Ok(())
    }

    pub async fn export(&self, url: &str, path: &Path) -> Result<()> {
        let bytes = self
            .cache
            .read(url)
            .await?
            .ok_or_else(|| AppError::NotCached(url.to_string()))?;
        tokio::fs::write(path, &bytes).await?;

        self.emit(
            &Exported {
                url,
                path,
                bytes: bytes.len(),
            },
            || format!("{url}: wrote {} bytes to {}", bytes.len(), path.display()),
        )
    }
}

/// Manifests the check resumed, other than the one about to be downloaded.
fn resumed_besides<'a>(report: &'a ConsistencyReport, url: &str) -> Vec<&'a str> {
    report
        .resumed
        .iter()
        .map(String::as_str)
        .filter(|resumed| *resumed != url)
        .collect()
}

fn describe_report(report: &ConsistencyReport) -> String {
    let mut lines = vec![format!(
        "orphaned owners: {}, records removed: {}, resumed: {}",
        report.orphaned_owners.len(),
        report.records_removed,
        report.resumed.len()
    )];
    lines.extend(report.orphaned_owners.iter().map(|url| format!("  removed {url}")));
    lines.extend(report.resumed.iter().map(|url| format!("  resumed {url}")));
    lines.extend(report.errors.iter().map(|e| format!("  error: {e}")));
    lines.join("\n")
}
