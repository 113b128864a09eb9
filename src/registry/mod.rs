//! Registry backends.
//!
//! Every backend exposes the same small surface: paginated listings of
//! repositories and tags, and deletion of a batch of tags. Everything that
//! decides *what* to delete lives outside of this module.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{TryStreamExt, stream::BoxStream};

use crate::{
    config::BackendConfig,
    error::{PruneError, RegistryError},
    types::{Repository, TagRecord},
};

pub mod dockerhub;
#[cfg(feature = "ecr")]
pub mod ecr;

/// The most identifiers any supported registry accepts in one delete call.
pub const MAX_BATCH_SIZE: usize = 100;

/// A lazy stream of result pages. Calling the listing method again restarts it.
pub type Pages<'a, T> = BoxStream<'a, Result<Vec<T>, RegistryError>>;

#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Human readable identity used in logs and reports, e.g. `ecr/us-west-1`.
    fn name(&self) -> &str;

    fn batch_limit(&self) -> usize {
        MAX_BATCH_SIZE
    }

    fn repositories(&self) -> Pages<'_, Repository>;

    fn tags<'a>(&'a self, repository: &'a Repository) -> Pages<'a, TagRecord>;

    /// Deletes `tags` from `repository`. Tags that are already gone must be
    /// reported as absent, not as failures.
    async fn delete_batch(&self, repository: &Repository, tags: &[TagRecord]) -> BatchOutcome;
}

/// Per tag results of a delete call that reached the registry.
#[derive(Debug, Default)]
pub struct BatchReceipt {
    pub deleted: Vec<TagRecord>,
    pub absent: Vec<TagRecord>,
    pub failed: Vec<(TagRecord, RegistryError)>,
}

#[derive(Debug)]
pub enum BatchOutcome {
    /// The call went through; individual tags may still have failed.
    Completed(BatchReceipt),
    /// The whole call failed but may succeed if repeated.
    Transient(RegistryError),
    /// The whole call failed and repeating it is pointless.
    Permanent(RegistryError),
}

impl BatchOutcome {
    pub fn from_error(err: RegistryError) -> Self {
        if err.is_transient() {
            Self::Transient(err)
        } else {
            Self::Permanent(err)
        }
    }
}

/// Drains a page stream into one list.
pub async fn collect<T>(pages: Pages<'_, T>) -> Result<Vec<T>, RegistryError> {
    pages.try_concat().await
}

/// Builds one client per registry described by `config` (one per region for ECR).
pub async fn connect(config: &BackendConfig) -> Result<Vec<Arc<dyn RegistryClient>>, PruneError> {
    match config {
        BackendConfig::Dockerhub(hub) => {
            let client = dockerhub::DockerHubClient::new(hub).map_err(|err| PruneError::Client {
                registry: format!("dockerhub/{}", hub.namespace),
                message: err.to_string(),
            })?;
            Ok(vec![Arc::new(client) as Arc<dyn RegistryClient>])
        }
        #[cfg(feature = "ecr")]
        BackendConfig::Ecr(ecr_config) => {
            let mut clients: Vec<Arc<dyn RegistryClient>> = vec![];
            for region in &ecr_config.regions {
                clients.push(Arc::new(ecr::EcrClient::connect(region, ecr_config).await));
            }
            Ok(clients)
        }
        #[cfg(not(feature = "ecr"))]
        BackendConfig::Ecr(_) => Err(PruneError::Client {
            registry: "ecr".to_string(),
            message: "this build does not include the `ecr` feature".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;

    #[tokio::test]
    async fn collect_concatenates_pages_in_order() {
        let pages: Pages<'_, u32> = Box::pin(stream::iter(vec![Ok(vec![1, 2]), Ok(vec![]), Ok(vec![3])]));
        assert_eq!(collect(pages).await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn collect_stops_at_first_error() {
        let pages: Pages<'_, u32> = Box::pin(stream::iter(vec![
            Ok(vec![1]),
            Err(RegistryError::status("u", reqwest::StatusCode::NOT_FOUND, "")),
            Ok(vec![2]),
        ]));
        assert!(matches!(collect(pages).await, Err(RegistryError::Status { .. })));
    }

    #[test]
    fn outcome_from_error_follows_classification() {
        let transient = RegistryError::status("u", reqwest::StatusCode::SERVICE_UNAVAILABLE, "");
        let permanent = RegistryError::status("u", reqwest::StatusCode::UNAUTHORIZED, "");

        assert!(matches!(BatchOutcome::from_error(transient), BatchOutcome::Transient(_)));
        assert!(matches!(BatchOutcome::from_error(permanent), BatchOutcome::Permanent(_)));
    }
}
