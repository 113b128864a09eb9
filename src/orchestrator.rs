//! Drives a whole run: every primary registry, every repository.
//!
//! Repositories are pruned by a bounded pool of workers. Each worker produces
//! its own [`RunReport`] and the reports are merged once the pool drains, so
//! nothing is shared between workers while they run.

use std::{sync::Arc, time::Duration};

use futures::{StreamExt, stream};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    clock::Clock,
    config::{Configuration, duration},
    deleter::BatchDeleter,
    error::{Failure, PruneError, Stage},
    mirror::MirrorSync,
    policy::RetentionPolicy,
    registry::{self, RegistryClient},
    retry::Backoff,
    types::{RepoTagSet, Repository, TagRecord},
};

/// The parts of the configuration a run needs.
#[derive(Clone, Debug)]
pub struct RunSettings {
    pub policy: RetentionPolicy,
    pub dry_run: bool,
    pub concurrency: usize,
    pub batch_size: usize,
    pub backoff: Backoff,
    pub abort_on_repository_error: bool,
}

impl From<&Configuration> for RunSettings {
    fn from(config: &Configuration) -> Self {
        Self {
            policy: config.retention.clone(),
            dry_run: config.dry_run,
            concurrency: config.concurrency,
            batch_size: config.deletion.batch_size,
            backoff: config.deletion.backoff,
            abort_on_repository_error: config.abort_on_repository_error,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct RunReport {
    pub dry_run: bool,
    pub repositories_scanned: usize,
    pub repositories_pruned: usize,
    pub tags_deleted: usize,
    pub tags_planned: usize,
    pub tags_absent: usize,
    pub mirror_tags_deleted: usize,
    pub mirror_tags_absent: usize,
    /// A registry or repository was skipped because the run was stopped.
    pub cancelled: bool,
    pub failures: Vec<Failure>,
}

impl RunReport {
    fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            ..Default::default()
        }
    }

    pub fn merge(&mut self, other: RunReport) {
        self.repositories_scanned += other.repositories_scanned;
        self.repositories_pruned += other.repositories_pruned;
        self.tags_deleted += other.tags_deleted;
        self.tags_planned += other.tags_planned;
        self.tags_absent += other.tags_absent;
        self.mirror_tags_deleted += other.mirror_tags_deleted;
        self.mirror_tags_absent += other.mirror_tags_absent;
        self.cancelled |= other.cancelled;
        self.failures.extend(other.failures);
    }

    pub fn has_errors(&self) -> bool {
        !self.failures.is_empty()
    }

    /// A run with only non-fatal errors is a partial success unless `strict`.
    /// A cancelled run never succeeds.
    pub fn succeeded(&self, strict: bool) -> bool {
        !self.cancelled && !(strict && self.has_errors())
    }
}

pub struct PruneOrchestrator {
    primaries: Vec<Arc<dyn RegistryClient>>,
    mirror: Option<MirrorSync>,
    settings: RunSettings,
    clock: Clock,
}

impl PruneOrchestrator {
    pub fn new(
        primaries: Vec<Arc<dyn RegistryClient>>,
        mirrors: Vec<Arc<dyn RegistryClient>>,
        settings: RunSettings,
        clock: Clock,
    ) -> Self {
        let mirror = match mirrors.is_empty() {
            true => None,
            false => Some(MirrorSync::new(
                mirrors
                    .into_iter()
                    .map(|client| BatchDeleter::new(client, settings.batch_size, settings.backoff))
                    .collect(),
            )),
        };

        Self {
            primaries,
            mirror,
            settings,
            clock,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<RunReport, PruneError> {
        let mut report = RunReport::new(self.settings.dry_run);

        info!(
            keep_count = self.settings.policy.keep_count,
            min_age = %duration::format(&self.settings.policy.min_age),
            dry_run = self.settings.dry_run,
            registries = self.primaries.len(),
            "Starting prune run"
        );

        // Cancelling this stops the remaining repositories without touching the caller's token.
        let abort = cancel.child_token();

        for client in &self.primaries {
            if abort.is_cancelled() {
                report.cancelled = true;
                break;
            }

            info!(registry = client.name(), "Listing repositories");

            let repositories = tokio::select! {
                _ = abort.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                repositories = registry::collect(client.repositories()) => repositories,
            };

            let repositories = repositories.map_err(|source| {
                error!(registry = client.name(), error = %source, "Unable to list repositories");
                PruneError::ListRepositories {
                    registry: client.name().to_string(),
                    source,
                }
            })?;

            info!(
                registry = client.name(),
                count = repositories.len(),
                "Found repositories"
            );

            let deleter = BatchDeleter::new(client.clone(), self.settings.batch_size, self.settings.backoff);

            let reports: Vec<RunReport> = stream::iter(repositories)
                .map(|repository| self.prune_repository(client, &deleter, repository, &abort))
                .buffer_unordered(self.settings.concurrency.max(1))
                .collect()
                .await;

            for repository_report in reports {
                report.merge(repository_report);
            }

            if self.settings.abort_on_repository_error {
                if let Some(failure) = report.failures.first() {
                    error!(failure = %failure, "Aborting run after repository failure");
                    return Err(PruneError::RepositoryAborted {
                        registry: failure.registry.clone(),
                        repository: failure.repository.clone(),
                        message: failure.message.clone(),
                    });
                }
            }
        }

        info!(
            repositories_scanned = report.repositories_scanned,
            repositories_pruned = report.repositories_pruned,
            tags_deleted = report.tags_deleted,
            tags_planned = report.tags_planned,
            mirror_tags_deleted = report.mirror_tags_deleted,
            failures = report.failures.len(),
            cancelled = report.cancelled,
            "Prune run finished"
        );

        Ok(report)
    }

    async fn prune_repository(
        &self,
        client: &Arc<dyn RegistryClient>,
        deleter: &BatchDeleter,
        repository: Repository,
        abort: &CancellationToken,
    ) -> RunReport {
        let mut report = RunReport::new(self.settings.dry_run);

        if abort.is_cancelled() {
            debug!(registry = client.name(), repository = %repository, "Skipping repository, run is stopping");
            report.cancelled = true;
            return report;
        }

        let what = format!("listing tags of {repository}");
        let (source, target) = (client.as_ref(), &repository);
        let listing = self
            .settings
            .backoff
            .retry_transient(&what, move || registry::collect(source.tags(target)));

        let tags = tokio::select! {
            _ = abort.cancelled() => {
                report.cancelled = true;
                return report;
            }
            tags = listing => tags,
        };

        report.repositories_scanned = 1;

        let tags = match tags {
            Ok(tags) => tags,
            Err(err) => {
                error!(
                    registry = client.name(),
                    repository = %repository,
                    error = %err,
                    "Unable to list tags, skipping repository"
                );
                report.failures.push(Failure::new(
                    client.name(),
                    &repository,
                    Stage::ListTags,
                    err.to_string(),
                ));
                self.stop_if_aborting(abort);
                return report;
            }
        };

        let policy = &self.settings.policy;
        if tags.len() <= policy.keep_count {
            info!(
                registry = client.name(),
                repository = %repository,
                count = tags.len(),
                keep_count = policy.keep_count,
                "Not enough tags to prune"
            );
            return report;
        }

        let selected = policy.select_for_deletion(&tags, self.clock.now());
        if selected.is_empty() {
            info!(
                registry = client.name(),
                repository = %repository,
                count = tags.len(),
                "All candidates are younger than the age floor"
            );
            return report;
        }

        for tag in &selected {
            debug!(
                registry = client.name(),
                repository = %repository,
                tag = %tag.name,
                last_modified = %tag.last_modified,
                "Selected for deletion"
            );
        }

        if abort.is_cancelled() {
            report.cancelled = true;
            return report;
        }

        let outcome = deleter.delete(&repository, &selected, self.settings.dry_run).await;

        report.tags_deleted = outcome.deleted.len();
        report.tags_absent = outcome.absent.len();
        report.tags_planned = outcome.planned_count();
        if report.tags_deleted + report.tags_planned > 0 {
            report.repositories_pruned = 1;
        }
        report.failures.extend(outcome.failures);

        if let Some(mirror) = &self.mirror {
            // Tags already absent on the primary are gone from it all the same.
            let gone: Vec<TagRecord> = match self.settings.dry_run {
                true => outcome.planned.into_iter().flatten().collect(),
                false => outcome.deleted.into_iter().chain(outcome.absent).collect(),
            };

            let sync = mirror
                .replay(&[RepoTagSet::new(repository.clone(), gone)], self.settings.dry_run)
                .await;

            report.mirror_tags_deleted = sync.deleted;
            report.mirror_tags_absent = sync.absent;
            report.failures.extend(sync.failures);
        }

        if report.has_errors() {
            warn!(
                registry = client.name(),
                repository = %repository,
                failures = report.failures.len(),
                "Repository pruned with errors"
            );
            self.stop_if_aborting(abort);
        }

        report
    }

    fn stop_if_aborting(&self, abort: &CancellationToken) {
        if self.settings.abort_on_repository_error {
            abort.cancel();
        }
    }
}

/// Cancels `token` once `deadline` has passed. The returned guard stops the timer.
pub fn deadline_guard(token: &CancellationToken, deadline: Duration) -> tokio::task::JoinHandle<()> {
    let token = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(deadline) => {
                warn!(deadline = %duration::format(&deadline), "Run deadline reached, stopping");
                token.cancel();
            }
        }
    })
}
