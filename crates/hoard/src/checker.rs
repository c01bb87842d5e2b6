//! Startup reconciliation of the blob store.
//!
//! Two passes, each tolerant of the other failing:
//! 1. owners whose root record is gone have all their records deleted;
//! 2. root records that are not complete are handed back to the facade.

use serde::Serialize;
use tracing::{error, info, warn};

use crate::facade::OfflineCache;
use crate::store::RecordKind;

/// What a consistency check did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    /// Owners whose root record was missing.
    pub orphaned_owners: Vec<String>,
    /// Records deleted because their owner was missing.
    pub records_removed: u64,
    /// Root manifests whose download was restarted.
    pub resumed: Vec<String>,
    /// Errors met along the way; none of them stopped the check.
    pub errors: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_clean(&self) -> bool {
        self.orphaned_owners.is_empty() && self.resumed.is_empty() && self.errors.is_empty()
    }
}

pub(crate) struct ConsistencyChecker<'a> {
    cache: &'a OfflineCache,
}

impl<'a> ConsistencyChecker<'a> {
    pub(crate) fn new(cache: &'a OfflineCache) -> Self {
        Self { cache }
    }

    pub(crate) async fn run(&self) -> ConsistencyReport {
        let mut report = ConsistencyReport::default();
        self.collect_orphans(&mut report).await;
        self.resume_incomplete(&mut report).await;

        info!(
            orphaned = report.orphaned_owners.len(),
            removed = report.records_removed,
            resumed = report.resumed.len(),
            errors = report.errors.len(),
            "Consistency check finished"
        );
        report
    }

    async fn collect_orphans(&self, report: &mut ConsistencyReport) {
        let store = self.cache.store();
        let owners = match store.owners().await {
            Ok(owners) => owners,
            Err(e) => {
                error!(error = %e, "Orphan scan abandoned");
                report.errors.push(format!("orphan scan: {e}"));
                return;
            }
        };

        for owner in owners {
            match store.get(&owner).await {
                Ok(Some(record)) if record.is_root() => continue,
                Ok(_) => {}
                Err(e) => {
                    warn!(owner = %owner, error = %e, "Could not look up root record");
                    report.errors.push(format!("lookup {owner}: {e}"));
                    continue;
                }
            }

            let keys: Vec<String> = match store.keys_by_owner(&owner).await {
                Ok(keys) => keys.into_iter().collect(),
                Err(e) => {
                    warn!(owner = %owner, error = %e, "Could not list orphaned records");
                    report.errors.push(format!("list {owner}: {e}"));
                    continue;
                }
            };

            match store.delete_many(&keys).await {
                Ok(removed) => {
                    info!(owner = %owner, removed, "Removed orphaned records");
                    report.records_removed += removed;
                    report.orphaned_owners.push(owner);
                }
                Err(e) => {
                    warn!(owner = %owner, error = %e, "Could not remove orphaned records");
                    report.errors.push(format!("delete {owner}: {e}"));
                }
            }
        }
    }

    async fn resume_incomplete(&self, report: &mut ConsistencyReport) {
        let store = self.cache.store();
        let roots = match store.keys_by_kind(RecordKind::RootManifest).await {
            Ok(roots) => roots,
            Err(e) => {
                error!(error = %e, "Resume scan abandoned");
                report.errors.push(format!("resume scan: {e}"));
                return;
            }
        };

        for url in roots {
            let incomplete = match store.get(&url).await {
                Ok(Some(record)) => !record.progress.is_some_and(|p| p.is_complete()),
                Ok(None) => false,
                Err(e) => {
                    warn!(url = %url, error = %e, "Could not read root record");
                    report.errors.push(format!("read {url}: {e}"));
                    continue;
                }
            };

            if incomplete && self.cache.handle(&url).is_none() {
                info!(url = %url, "Resuming incomplete download");
                self.cache.start(&url);
                report.resumed.push(url);
            }
        }
    }
}
