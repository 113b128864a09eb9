//! Amazon ECR backend, one client per region.

use std::{collections::HashSet, str::FromStr};

use async_trait::async_trait;
use aws_config::{Region, retry::RetryConfig};
use aws_sdk_ecr::{
    Client,
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    types::{DescribeImagesFilter, ImageFailure, ImageFailureCode, ImageIdentifier, TagStatus},
};
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use tracing::debug;

use super::{BatchOutcome, BatchReceipt, Pages, RegistryClient};
use crate::{
    config::{EcrConfig, ImageKey},
    error::RegistryError,
    types::{Digest, Repository, TagRecord},
};

const TRANSIENT_CODES: [&str; 3] = [
    "ThrottlingException",
    "ServerException",
    "ServiceUnavailableException",
];

pub struct EcrClient {
    name: String,
    client: Client,
    registry_id: Option<String>,
    delete_by: ImageKey,
}

impl EcrClient {
    pub async fn connect(region: &str, config: &EcrConfig) -> Self {
        // Retries are driven by the deletion backoff, not by the SDK.
        let shared = aws_config::from_env()
            .region(Region::new(region.to_string()))
            .retry_config(RetryConfig::disabled())
            .load()
            .await;

        let mut ecr_config = aws_sdk_ecr::config::Builder::from(&shared);
        if let Some(endpoint_url) = &config.endpoint_url {
            ecr_config = ecr_config.endpoint_url(endpoint_url);
        }

        Self {
            name: format!("ecr/{region}"),
            client: Client::from_conf(ecr_config.build()),
            registry_id: config.registry_id.clone(),
            delete_by: config.delete_by,
        }
    }

    fn registry_id_for(&self, repository: &Repository) -> Option<String> {
        repository
            .registry_id
            .clone()
            .or_else(|| self.registry_id.clone())
    }

    /// Images in `tags` that can go by digest. Always empty when deleting by tag.
    async fn deletable_images(
        &self,
        repository: &Repository,
        tags: &[TagRecord],
    ) -> Result<HashSet<Digest>, RegistryError> {
        if self.delete_by == ImageKey::Tag {
            return Ok(HashSet::new());
        }

        let mut digests: Vec<&Digest> = tags.iter().filter_map(|tag| tag.digest.as_ref()).collect();
        digests.sort();
        digests.dedup();
        if digests.is_empty() {
            return Ok(HashSet::new());
        }

        // The listing that fed the policy may be stale; ask for the current tags.
        let result = self
            .client
            .describe_images()
            .repository_name(&repository.name)
            .set_registry_id(self.registry_id_for(repository))
            .set_image_ids(Some(digests.into_iter().map(by_digest).collect()))
            .send()
            .await;

        match result {
            Ok(output) => Ok(whole_images(
                tags,
                output.image_details().iter().filter_map(|image| {
                    let digest = Digest::from_str(image.image_digest()?).ok()?;
                    Some((digest, image.image_tags()))
                }),
            )),
            // Deleting by tag reports whatever vanished as absent.
            Err(err)
                if err.as_service_error().is_some_and(|err| {
                    err.is_image_not_found_exception() || err.is_repository_not_found_exception()
                }) =>
            {
                Ok(HashSet::new())
            }
            Err(err) => Err(sdk_error("DescribeImages", err)),
        }
    }
}

fn by_digest(digest: &Digest) -> ImageIdentifier {
    ImageIdentifier::builder().image_digest(digest.to_string()).build()
}

/// Digests whose every tag is in `tags`.
///
/// Deleting by digest removes the whole image. An image that also carries a
/// tag the policy keeps must be deleted tag by tag instead.
fn whole_images<'a>(
    tags: &[TagRecord],
    images: impl IntoIterator<Item = (Digest, &'a [String])>,
) -> HashSet<Digest> {
    images
        .into_iter()
        .filter(|(_, names)| {
            !names.is_empty() && names.iter().all(|name| tags.iter().any(|tag| &tag.name == name))
        })
        .map(|(digest, _)| digest)
        .collect()
}

/// One identifier per whole image, one per tag for everything else.
fn identifiers(tags: &[TagRecord], whole: &HashSet<Digest>) -> Vec<ImageIdentifier> {
    let mut ids: Vec<ImageIdentifier> = Vec::with_capacity(tags.len());
    for tag in tags {
        let id = match &tag.digest {
            Some(digest) if whole.contains(digest) => by_digest(digest),
            _ => ImageIdentifier::builder().image_tag(&tag.name).build(),
        };
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}

fn sdk_error<E, R>(operation: &'static str, err: SdkError<E, R>) -> RegistryError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let transient = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            true
        }
        _ => err.code().is_some_and(|code| TRANSIENT_CODES.contains(&code)),
    };

    RegistryError::Sdk {
        operation,
        message: DisplayErrorContext(&err).to_string(),
        transient,
    }
}

fn pushed_at(at: Option<&aws_sdk_ecr::primitives::DateTime>) -> DateTime<Utc> {
    at.and_then(|at| DateTime::from_timestamp(at.secs(), at.subsec_nanos()))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn matches(id: &ImageIdentifier, tag: &TagRecord, whole: &HashSet<Digest>) -> bool {
    match &tag.digest {
        Some(digest) if whole.contains(digest) => id
            .image_digest()
            .and_then(|d| Digest::from_str(d).ok())
            .is_some_and(|d| &d == digest),
        _ => id.image_tag() == Some(tag.name.as_str()),
    }
}

/// Attributes every submitted tag to deleted, absent or failed.
///
/// `ImageNotFound` means someone else got there first. Tags the response does
/// not mention at all are treated the same way.
fn receipt_from(
    tags: &[TagRecord],
    deleted: &[ImageIdentifier],
    failures: &[ImageFailure],
    whole: &HashSet<Digest>,
) -> BatchReceipt {
    let mut receipt = BatchReceipt::default();

    for tag in tags {
        let failure = failures
            .iter()
            .find(|failure| failure.image_id().is_some_and(|id| matches(id, tag, whole)));

        match failure {
            Some(failure) if failure.failure_code() == Some(&ImageFailureCode::ImageNotFound) => {
                receipt.absent.push(tag.clone());
            }
            Some(failure) => {
                let code = failure.failure_code().map_or("Unknown", ImageFailureCode::as_str);
                let reason = failure.failure_reason().unwrap_or_default();
                receipt.failed.push((
                    tag.clone(),
                    RegistryError::Sdk {
                        operation: "BatchDeleteImage",
                        message: format!("{code}: {reason}"),
                        transient: false,
                    },
                ));
            }
            None if deleted.iter().any(|id| matches(id, tag, whole)) => {
                receipt.deleted.push(tag.clone());
            }
            None => receipt.absent.push(tag.clone()),
        }
    }

    receipt
}

#[async_trait]
impl RegistryClient for EcrClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn repositories(&self) -> Pages<'_, Repository> {
        let pages = self
            .client
            .describe_repositories()
            .set_registry_id(self.registry_id.clone())
            .into_paginator()
            .send();

        stream::unfold(pages, |mut pages| async move {
            let page = pages.next().await?.map(|output| {
                output
                    .repositories()
                    .iter()
                    .filter_map(|repository| {
                        let name = repository.repository_name()?;
                        let found = Repository::named(name);
                        Some(match repository.registry_id() {
                            Some(id) => found.with_registry_id(id),
                            None => found,
                        })
                    })
                    .collect::<Vec<_>>()
            });

            Some((page.map_err(|err| sdk_error("DescribeRepositories", err)), pages))
        })
        .boxed()
    }

    fn tags<'a>(&'a self, repository: &'a Repository) -> Pages<'a, TagRecord> {
        let pages = self
            .client
            .describe_images()
            .repository_name(&repository.name)
            .set_registry_id(self.registry_id_for(repository))
            // Untagged images are left to the registry's own lifecycle rules.
            .filter(DescribeImagesFilter::builder().tag_status(TagStatus::Tagged).build())
            .into_paginator()
            .send();

        stream::unfold(pages, |mut pages| async move {
            let page = pages.next().await?.map(|output| {
                output
                    .image_details()
                    .iter()
                    .flat_map(|image| {
                        let last_modified = pushed_at(image.image_pushed_at());
                        let digest = image.image_digest().and_then(|d| Digest::from_str(d).ok());
                        image.image_tags().iter().map(move |name| {
                            let tag = TagRecord::new(name, last_modified);
                            match &digest {
                                Some(digest) => tag.with_digest(digest.clone()),
                                None => tag,
                            }
                        })
                    })
                    .collect::<Vec<_>>()
            });

            Some((page.map_err(|err| sdk_error("DescribeImages", err)), pages))
        })
        .boxed()
    }

    async fn delete_batch(&self, repository: &Repository, tags: &[TagRecord]) -> BatchOutcome {
        let whole = match self.deletable_images(repository, tags).await {
            Ok(whole) => whole,
            Err(err) => return BatchOutcome::from_error(err),
        };

        let result = self
            .client
            .batch_delete_image()
            .repository_name(&repository.name)
            .set_registry_id(self.registry_id_for(repository))
            .set_image_ids(Some(identifiers(tags, &whole)))
            .send()
            .await;

        match result {
            Ok(output) => BatchOutcome::Completed(receipt_from(
                tags,
                output.image_ids(),
                output.failures(),
                &whole,
            )),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|err| err.is_repository_not_found_exception()) =>
            {
                debug!(
                    registry = %self.name,
                    repository = %repository,
                    "Repository no longer exists"
                );
                BatchOutcome::Completed(BatchReceipt {
                    absent: tags.to_vec(),
                    ..Default::default()
                })
            }
            Err(err) => BatchOutcome::from_error(sdk_error("BatchDeleteImage", err)),
        }
    }
}
