use serde::Serialize;
use strum::{Display, EnumString};
use thiserror::Error;

use crate::types::Repository;

/// An error raised by a single registry call.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned {status}: {body}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("unable to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("authentication against {registry} failed: {message}")]
    Authentication { registry: String, message: String },

    #[error("{operation} failed: {message}")]
    Sdk {
        operation: &'static str,
        message: String,
        transient: bool,
    },
}

impl RegistryError {
    pub fn status(url: impl Into<String>, status: reqwest::StatusCode, body: impl Into<String>) -> Self {
        Self::Status {
            url: url.into(),
            status,
            body: body.into(),
        }
    }

    /// Whether repeating the same call later could reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            Self::Status { status, .. } => {
                status.is_server_error() || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            Self::Decode { .. } => false,
            Self::Authentication { .. } => false,
            Self::Sdk { transient, .. } => *transient,
        }
    }
}

/// Errors that end a whole run.
#[derive(Debug, Error)]
pub enum PruneError {
    #[error("failed to list repositories in {registry}: {source}")]
    ListRepositories {
        registry: String,
        #[source]
        source: RegistryError,
    },

    #[error("failed to set up registry client {registry}: {message}")]
    Client { registry: String, message: String },

    #[error("failed to prune repo {repository} in {registry}: {message}")]
    RepositoryAborted {
        registry: String,
        repository: String,
        message: String,
    },
}

/// Where in the pipeline a non-fatal failure happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    ListTags,
    Delete,
    Mirror,
}

/// A non-fatal failure, recorded and reported at the end of a run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub registry: String,
    pub repository: String,
    pub stage: Stage,
    pub message: String,
}

impl Failure {
    pub fn new(
        registry: &str,
        repository: &Repository,
        stage: Stage,
        message: impl Into<String>,
    ) -> Self {
        Self {
            registry: registry.to_string(),
            repository: repository.name.clone(),
            stage,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} ({}): {}",
            self.registry, self.repository, self.stage, self.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_errors_classify() {
        let url = "https://hub.docker.com/v2/";
        assert!(RegistryError::status(url, reqwest::StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(
            RegistryError::status(url, reqwest::StatusCode::TOO_MANY_REQUESTS, "").is_transient()
        );
        assert!(!RegistryError::status(url, reqwest::StatusCode::FORBIDDEN, "").is_transient());
        assert!(
            !RegistryError::Authentication {
                registry: "dockerhub/clever".into(),
                message: "login returned 401 Unauthorized".into(),
            }
            .is_transient()
        );
    }

    #[test]
    fn failure_serializes_stage_in_snake_case() {
        let failure = Failure::new(
            "ecr/us-west-1",
            &Repository::named("svc-a"),
            Stage::ListTags,
            "boom",
        );

        assert_eq!(
            serde_json::to_value(&failure).unwrap(),
            serde_json::json!({
                "registry": "ecr/us-west-1",
                "repository": "svc-a",
                "stage": "list_tags",
                "message": "boom",
            })
        );
        assert_eq!(failure.to_string(), "ecr/us-west-1 svc-a (list_tags): boom");
    }
}
