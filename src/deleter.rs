//! Chunked deletion against a single registry.
//!
//! Chunks are submitted one after the other so that the confirmed set keeps
//! the order the retention policy produced. A chunk that keeps failing is
//! recorded and skipped; it never stops the chunks after it.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::{
    error::{Failure, RegistryError, Stage},
    registry::{BatchOutcome, MAX_BATCH_SIZE, RegistryClient},
    retry::Backoff,
    types::{Repository, TagRecord},
};

/// What happened to one repository's candidates.
#[derive(Debug, Default)]
pub struct DeletionReport {
    /// Confirmed deleted by the registry. Always empty in dry-run mode.
    pub deleted: Vec<TagRecord>,
    /// Already gone when the delete call reached the registry.
    pub absent: Vec<TagRecord>,
    /// The chunks that would have been submitted. Only filled in dry-run mode.
    pub planned: Vec<Vec<TagRecord>>,
    pub failures: Vec<Failure>,
}

impl DeletionReport {
    pub fn planned_count(&self) -> usize {
        self.planned.iter().map(Vec::len).sum()
    }
}

#[derive(Clone)]
pub struct BatchDeleter {
    client: Arc<dyn RegistryClient>,
    batch_size: usize,
    backoff: Backoff,
}

impl BatchDeleter {
    pub fn new(client: Arc<dyn RegistryClient>, batch_size: usize, backoff: Backoff) -> Self {
        let batch_size = batch_size.clamp(1, client.batch_limit().clamp(1, MAX_BATCH_SIZE));
        Self {
            client,
            batch_size,
            backoff,
        }
    }

    pub fn registry(&self) -> &str {
        self.client.name()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub async fn delete(
        &self,
        repository: &Repository,
        candidates: &[TagRecord],
        dry_run: bool,
    ) -> DeletionReport {
        let mut report = DeletionReport::default();
        if candidates.is_empty() {
            return report;
        }

        let chunks: Vec<&[TagRecord]> = candidates.chunks(self.batch_size).collect();
        let total = chunks.len();

        if dry_run {
            for (idx, chunk) in chunks.into_iter().enumerate() {
                let tags: Vec<&str> = chunk.iter().map(|tag| tag.name.as_str()).collect();
                info!(
                    registry = self.registry(),
                    repository = %repository,
                    chunk = idx + 1,
                    chunks = total,
                    count = chunk.len(),
                    ?tags,
                    "Dry run: would delete batch"
                );
                report.planned.push(chunk.to_vec());
            }
            return report;
        }

        for (idx, chunk) in chunks.into_iter().enumerate() {
            self.delete_chunk(repository, chunk, idx + 1, total, &mut report)
                .await;
        }

        report
    }

    async fn delete_chunk(
        &self,
        repository: &Repository,
        chunk: &[TagRecord],
        number: usize,
        total: usize,
        report: &mut DeletionReport,
    ) {
        let mut pending = chunk.to_vec();
        let mut delays = self.backoff.delays();
        let mut attempt = 1;

        loop {
            let last_error: RegistryError = match self
                .client
                .delete_batch(repository, &pending)
                .await
            {
                BatchOutcome::Completed(receipt) => {
                    if !receipt.deleted.is_empty() {
                        info!(
                            registry = self.registry(),
                            repository = %repository,
                            chunk = number,
                            chunks = total,
                            count = receipt.deleted.len(),
                            "Deleted batch"
                        );
                    }
                    for tag in &receipt.absent {
                        debug!(
                            registry = self.registry(),
                            repository = %repository,
                            tag = %tag.name,
                            "Tag already absent"
                        );
                    }
                    report.deleted.extend(receipt.deleted);
                    report.absent.extend(receipt.absent);

                    let mut retry = vec![];
                    let mut last_error = None;
                    for (tag, err) in receipt.failed {
                        if err.is_transient() {
                            retry.push(tag);
                            last_error = Some(err);
                        } else {
                            error!(
                                registry = self.registry(),
                                repository = %repository,
                                tag = %tag.name,
                                error = %err,
                                "Registry refused to delete tag"
                            );
                            report.failures.push(Failure::new(
                                self.registry(),
                                repository,
                                Stage::Delete,
                                format!("tag {}: {err}", tag.name),
                            ));
                        }
                    }

                    match last_error {
                        Some(err) => {
                            pending = retry;
                            err
                        }
                        None => return,
                    }
                }
                BatchOutcome::Transient(err) => err,
                BatchOutcome::Permanent(err) => {
                    error!(
                        registry = self.registry(),
                        repository = %repository,
                        chunk = number,
                        chunks = total,
                        error = %err,
                        "Batch delete failed"
                    );
                    report.failures.push(self.chunk_failure(repository, &pending, number, total, &err));
                    return;
                }
            };

            match delays.next() {
                Some(delay) => {
                    warn!(
                        registry = self.registry(),
                        repository = %repository,
                        chunk = number,
                        attempt,
                        remaining = pending.len(),
                        error = %last_error,
                        "Batch delete failed, retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => {
                    error!(
                        registry = self.registry(),
                        repository = %repository,
                        chunk = number,
                        chunks = total,
                        attempts = attempt,
                        error = %last_error,
                        "Batch delete failed, giving up"
                    );
                    report
                        .failures
                        .push(self.chunk_failure(repository, &pending, number, total, &last_error));
                    return;
                }
            }
        }
    }

    fn chunk_failure(
        &self,
        repository: &Repository,
        pending: &[TagRecord],
        number: usize,
        total: usize,
        err: &RegistryError,
    ) -> Failure {
        Failure::new(
            self.registry(),
            repository,
            Stage::Delete,
            format!("batch {number}/{total} ({} tags): {err}", pending.len()),
        )
    }
}
