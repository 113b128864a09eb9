//! Replays primary deletions against the mirror registries.
//!
//! The mirror never runs the retention policy itself: whatever left the
//! primary leaves the mirror, tag for tag. A tag the mirror never had is
//! reported as absent, and nothing here can undo a primary deletion.

use tracing::{debug, info, warn};

use crate::{
    deleter::BatchDeleter,
    error::{Failure, Stage},
    types::{RepoTagSet, Repository},
};

#[derive(Debug, Default)]
pub struct SyncReport {
    pub deleted: usize,
    pub absent: usize,
    pub failures: Vec<Failure>,
}

impl SyncReport {
    pub fn encountered_error(&self) -> bool {
        !self.failures.is_empty()
    }
}

pub struct MirrorSync {
    deleters: Vec<BatchDeleter>,
}

impl MirrorSync {
    /// One deleter per mirror registry (one per region for ECR).
    pub fn new(deleters: Vec<BatchDeleter>) -> Self {
        Self { deleters }
    }

    pub async fn replay(&self, deleted_from_source: &[RepoTagSet], dry_run: bool) -> SyncReport {
        let mut report = SyncReport::default();

        for set in deleted_from_source.iter().filter(|set| !set.is_empty()) {
            // Registry ids belong to the primary; the mirror resolves its own.
            let repository = Repository::named(set.repository.name.clone());

            for deleter in &self.deleters {
                debug!(
                    registry = deleter.registry(),
                    repository = %repository,
                    count = set.tags.len(),
                    "Replaying deletions on mirror"
                );

                let outcome = deleter.delete(&repository, &set.tags, dry_run).await;

                for tag in &outcome.absent {
                    debug!(
                        registry = deleter.registry(),
                        repository = %repository,
                        tag = %tag.name,
                        "Tag not present on mirror"
                    );
                }

                if !outcome.deleted.is_empty() {
                    info!(
                        registry = deleter.registry(),
                        repository = %repository,
                        count = outcome.deleted.len(),
                        "Mirror in sync"
                    );
                }

                report.deleted += outcome.deleted.len();
                report.absent += outcome.absent.len();
                report
                    .failures
                    .extend(outcome.failures.into_iter().map(|failure| Failure {
                        stage: Stage::Mirror,
                        ..failure
                    }));
            }
        }

        if report.encountered_error() {
            warn!(
                failures = report.failures.len(),
                "Mirror replay finished with errors"
            );
        }

        report
    }
}
