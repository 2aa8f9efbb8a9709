//! Deletion-queue processor.
//!
//! One call to [`Processor::run_batch`] is one scheduled run:
//!
//! 1. items abandoned in `processing` by a crashed run are rescheduled
//! 2. up to `batch_size` due items are claimed (marked `processing`)
//! 3. each item is reclaimed; a failure only affects that item
//! 4. mailbox sessions opened along the way are logged out, within the budget
//!
//! Message items remove the remote copy first (best effort, never blocking
//! local cleanup), then the database record. Blob items re-check the
//! reference count under the write lock and leave resurrected blobs alone.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use satchel_shared::{BlobId, MessageId, QueueItemKind, QueueStatus};
use satchel_store::{BlobFiles, Database, QueueItem, Reclaim, StoreError};

use crate::error::ReaperError;
use crate::mailbox::{MailboxConnector, SessionPool};

#[derive(Debug, Clone, Copy)]
pub struct BatchSettings {
    pub batch_size: usize,
    /// Items not started once this much time has passed are handed back.
    pub budget: Duration,
    pub mailbox_timeout: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            budget: Duration::from_secs(240),
            mailbox_timeout: Duration::from_secs(10),
        }
    }
}

/// What one run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Items found stuck in `processing` from an earlier run.
    pub recovered: usize,
    pub claimed: usize,
    pub completed: usize,
    /// Blob items skipped because the blob was referenced again.
    pub resurrected: usize,
    /// Failed attempts that will be retried later.
    pub retried: usize,
    /// Items that reached the attempt ceiling during this run.
    pub failed: usize,
    /// Claimed items handed back unstarted because the budget ran out.
    pub deferred: usize,
    /// Remote deletions that failed (local cleanup went ahead anyway).
    pub remote_failures: usize,
}

impl BatchReport {
    pub fn has_terminal_failures(&self) -> bool {
        self.failed > 0
    }
}

enum Outcome {
    Done,
    Resurrected,
}

pub struct Processor {
    db: Database,
    files: BlobFiles,
    connector: Option<Arc<dyn MailboxConnector>>,
    settings: BatchSettings,
}

impl Processor {
    pub fn new(
        db: Database,
        files: BlobFiles,
        connector: Option<Arc<dyn MailboxConnector>>,
        settings: BatchSettings,
    ) -> Self {
        Self {
            db,
            files,
            connector,
            settings,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn database_mut(&mut self) -> &mut Database {
        &mut self.db
    }

    /// Process one batch. Only errors that make the queue itself unusable
    /// are returned; per-item failures are recorded on the items.
    pub async fn run_batch(&mut self) -> Result<BatchReport, ReaperError> {
        let started = Instant::now();
        let mut report = BatchReport::default();

        for (id, status) in self.db.recover_interrupted(Utc::now())? {
            warn!(item_id = id, status = %status, "recovered interrupted queue item");
            report.recovered += 1;
            if status == QueueStatus::Failed {
                report.failed += 1;
            }
        }

        let items = self.db.claim_batch(self.settings.batch_size, Utc::now())?;
        report.claimed = items.len();
        if items.is_empty() {
            debug!("deletion queue empty");
            return Ok(report);
        }
        info!(count = items.len(), "processing deletion queue batch");

        let mut pool = SessionPool::new(self.connector.clone(), self.settings.mailbox_timeout);
        let mut pending = items.into_iter();

        while let Some(item) = pending.next() {
            if started.elapsed() >= self.settings.budget {
                warn!(item_id = item.id, "batch budget spent, deferring remaining items");
                for unstarted in std::iter::once(item).chain(pending.by_ref()) {
                    self.defer(&unstarted);
                    report.deferred += 1;
                }
                break;
            }

            match self.process(&mut pool, &item, &mut report).await {
                Ok(outcome) => match self.db.complete_queue_item(item.id) {
                    Ok(()) => {
                        report.completed += 1;
                        if matches!(outcome, Outcome::Resurrected) {
                            report.resurrected += 1;
                        }
                    }
                    Err(e) => self.fail(&item, &e.to_string(), &mut report),
                },
                Err(e) => self.fail(&item, &e.to_string(), &mut report),
            }
        }

        pool.close_all(started + self.settings.budget).await;

        info!(
            completed = report.completed,
            resurrected = report.resurrected,
            retried = report.retried,
            failed = report.failed,
            deferred = report.deferred,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "deletion queue batch finished"
        );
        Ok(report)
    }

    async fn process(
        &mut self,
        pool: &mut SessionPool,
        item: &QueueItem,
        report: &mut BatchReport,
    ) -> Result<Outcome, StoreError> {
        match item.kind {
            QueueItemKind::Message => {
                let id = MessageId(item.target_id);
                self.reclaim_message(pool, id, item.id, report).await
            }
            QueueItemKind::Blob => {
                let id = BlobId(item.target_id);
                match self.db.reclaim_blob(&self.files, id, item.file_path.as_deref())? {
                    Reclaim::Deleted { file_removed } => {
                        debug!(item_id = item.id, blob_id = %id, file_removed, "blob reclaimed");
                        Ok(Outcome::Done)
                    }
                    Reclaim::Resurrected { reference_count } => {
                        info!(
                            item_id = item.id,
                            blob_id = %id,
                            reference_count,
                            "blob referenced again since queued, keeping it"
                        );
                        Ok(Outcome::Resurrected)
                    }
                    Reclaim::Missing { file_removed } => {
                        debug!(item_id = item.id, blob_id = %id, file_removed, "blob record already gone");
                        Ok(Outcome::Done)
                    }
                }
            }
        }
    }

    async fn reclaim_message(
        &mut self,
        pool: &mut SessionPool,
        id: MessageId,
        item_id: i64,
        report: &mut BatchReport,
    ) -> Result<Outcome, StoreError> {
        let message = match self.db.get_message(id) {
            Ok(message) => message,
            Err(StoreError::NotFound) => {
                debug!(item_id, message_id = %id, "message record already gone");
                return Ok(Outcome::Done);
            }
            Err(e) => return Err(e),
        };

        if let Some(uid) = message.remote_uid {
            match pool.delete(message.user_id, &message.folder, uid).await {
                Ok(true) => debug!(item_id, message_id = %id, uid, "remote copy deleted"),
                Ok(false) => {}
                Err(e) => {
                    report.remote_failures += 1;
                    warn!(
                        item_id,
                        message_id = %id,
                        uid,
                        error = %e,
                        "remote deletion failed, continuing with local cleanup"
                    );
                }
            }
        }

        if let Some(dropped) = self.db.drop_message(id)? {
            for blob_id in &dropped.queued_blobs {
                debug!(item_id, message_id = %id, blob_id = %blob_id, "blob queued after message drop");
            }
        }
        Ok(Outcome::Done)
    }

    fn fail(&mut self, item: &QueueItem, error_text: &str, report: &mut BatchReport) {
        match self.db.record_queue_failure(item.id, error_text, Utc::now()) {
            Ok(QueueStatus::Failed) => {
                report.failed += 1;
                error!(
                    item_id = item.id,
                    kind = %item.kind,
                    target_id = item.target_id,
                    error = error_text,
                    "queue item failed permanently"
                );
            }
            Ok(_) => {
                report.retried += 1;
                warn!(
                    item_id = item.id,
                    kind = %item.kind,
                    target_id = item.target_id,
                    attempts = item.attempts + 1,
                    error = error_text,
                    "queue item failed, will retry"
                );
            }
            // Left in `processing`; the next run's recovery step counts it.
            Err(e) => error!(item_id = item.id, error = %e, "could not record queue failure"),
        }
    }

    fn defer(&mut self, item: &QueueItem) {
        if let Err(e) = self.db.release_queue_item(item.id) {
            error!(item_id = item.id, error = %e, "could not release deferred queue item");
        }
    }
}
