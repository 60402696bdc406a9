//! Join projection repair.
//!
//! Point records are the source of truth. Index entries that do not
//! describe their record are deleted, and so are entries of cancelled
//! records, which nothing reads. Waiting records with no index entry get one.

use std::sync::Arc;
use tracing::{debug, info};

use crate::store::StoreError;
use super::join::{JoinRepository, RecordKey};
use super::model::{IndexKey, JoinStatus};

/// What one reconcile pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Index entries deleted.
    pub orphans_removed: usize,
    /// Index entries re-inserted.
    pub missing_restored: usize,
    /// Entries of cancelled records dropped.
    pub cancelled_pruned: usize,
}

/// Walks both join projections and repairs the index.
pub struct ReconcileSweep {
    joins: Arc<JoinRepository>,
    batch: usize,
}

impl ReconcileSweep {
    /// Create a sweep reading `batch` rows per page.
    pub fn new(joins: Arc<JoinRepository>, batch: usize) -> Self {
        Self { joins, batch: batch.max(1) }
    }

    /// One full pass over both projections.
    pub async fn run(&self) -> Result<ReconcileReport, StoreError> {
        let mut report = ReconcileReport::default();

        let mut cursor: Option<IndexKey> = None;
        loop {
            let page = self.joins.scan_index(cursor.take(), self.batch).await?;
            for key in &page {
                let record = self.joins.get(&key.user, &key.contest).await?;
                if !record.map_or(false, |r| key.describes(&r)) {
                    debug!("Removing orphan index entry for {} in {}", key.user, key.contest);
                    self.joins.remove_index(key).await?;
                    report.orphans_removed += 1;
                } else if key.status == JoinStatus::Cancelled {
                    self.joins.remove_index(key).await?;
                    report.cancelled_pruned += 1;
                }
            }
            if page.len() < self.batch {
                break;
            }
            cursor = page.last().cloned();
        }

        let mut cursor: Option<RecordKey> = None;
        loop {
            let page = self.joins.scan_records(cursor.take(), self.batch).await?;
            for record in &page {
                if record.status != JoinStatus::Waiting {
                    continue;
                }
                let key = record.index_key();
                if !self.joins.has_index(&key).await? {
                    debug!("Restoring index entry for {} in {}", record.user_id, record.contest_id);
                    self.joins.put_index(key).await?;
                    report.missing_restored += 1;
                }
            }
            if page.len() < self.batch {
                break;
            }
            cursor = page.last().map(|r| r.key());
        }

        if report != ReconcileReport::default() {
            info!(
                "Reconcile removed {} orphan(s), restored {} entr(ies), pruned {} cancelled",
                report.orphans_removed, report.missing_restored, report.cancelled_pruned
            );
        }
        Ok(report)
    }
}
