//! Docker Hub backend.
//!
//! Docker Hub has no batch delete, so a batch is deleted one tag at a time and
//! each tag gets its own verdict in the receipt.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::{StatusCode, header::AUTHORIZATION};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{BatchOutcome, BatchReceipt, Pages, RegistryClient};
use crate::{
    config::DockerHubConfig,
    error::RegistryError,
    types::{Digest, Repository, TagRecord},
};

const PAGE_SIZE: usize = 100;

const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.');

#[derive(Serialize)]
struct Login<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Deserialize)]
struct Page<T> {
    #[serde(default)]
    next: Option<String>,
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

#[derive(Deserialize)]
struct RepositoryEntry {
    name: String,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    digest: Option<String>,
}

impl From<TagEntry> for TagRecord {
    fn from(entry: TagEntry) -> Self {
        // Tags that were never updated sort as the oldest.
        let record = TagRecord::new(entry.name, entry.last_updated.unwrap_or(DateTime::<Utc>::UNIX_EPOCH));
        match entry.digest.as_deref().map(Digest::from_str) {
            Some(Ok(digest)) => record.with_digest(digest),
            _ => record,
        }
    }
}

pub struct DockerHubClient {
    name: String,
    base_url: String,
    namespace: String,
    username: String,
    password: String,
    client: reqwest::Client,
    token: OnceCell<String>,
}

impl DockerHubClient {
    pub fn new(config: &DockerHubConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .build()?;

        let mut base_url = config.url.clone();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        Ok(Self {
            name: format!("dockerhub/{}", config.namespace),
            base_url,
            namespace: config.namespace.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            client,
            token: OnceCell::new(),
        })
    }

    fn repository_url(&self, repository: &str) -> String {
        format!(
            "{}repositories/{}/{}/",
            self.base_url,
            utf8_percent_encode(&self.namespace, SEGMENT),
            utf8_percent_encode(repository, SEGMENT)
        )
    }

    async fn token(&self) -> Result<&str, RegistryError> {
        self.token
            .get_or_try_init(|| self.login())
            .await
            .map(String::as_str)
    }

    async fn login(&self) -> Result<String, RegistryError> {
        let url = format!("{}users/login/", self.base_url);
        debug!(registry = %self.name, username = %self.username, "Logging in");

        let response = self
            .client
            .post(&url)
            .json(&Login {
                username: &self.username,
                password: &self.password,
            })
            .send()
            .await
            .map_err(|source| RegistryError::Transport {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            return Err(RegistryError::status(url, status, body));
        }
        if !status.is_success() {
            return Err(RegistryError::Authentication {
                registry: self.name.clone(),
                message: format!("login returned {status}"),
            });
        }

        let login: LoginResponse = response
            .json()
            .await
            .map_err(|source| RegistryError::Decode { url, source })?;

        info!(registry = %self.name, "Logged in");
        Ok(format!("JWT {}", login.token))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, RegistryError> {
        let token = self.token().await?;

        let response = self
            .client
            .get(url)
            .header(AUTHORIZATION, token)
            .send()
            .await
            .map_err(|source| RegistryError::Transport {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RegistryError::status(url, status, body));
        }

        response.json().await.map_err(|source| RegistryError::Decode {
            url: url.to_string(),
            source,
        })
    }

    /// Follows `next` links starting at `first`, one request per polled page.
    fn paginate<'a, T, U>(&'a self, first: String) -> Pages<'a, U>
    where
        T: DeserializeOwned + Send + 'a,
        U: From<T> + Send + 'a,
    {
        stream::try_unfold(Some(first), move |next| async move {
            let Some(url) = next else {
                return Ok(None);
            };

            let page: Page<T> = self.get_json(&url).await?;
            let items = page.results.into_iter().map(U::from).collect();
            let next = page.next.filter(|next| !next.is_empty());

            Ok::<_, RegistryError>(Some((items, next)))
        })
        .boxed()
    }

    async fn delete_tag(&self, url: &str, token: &str) -> Result<bool, RegistryError> {
        let response = self
            .client
            .delete(url)
            .header(AUTHORIZATION, token)
            .send()
            .await
            .map_err(|source| RegistryError::Transport {
                url: url.to_string(),
                source,
            })?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(RegistryError::status(url, status, body))
            }
        }
    }
}

impl From<RepositoryEntry> for Repository {
    fn from(entry: RepositoryEntry) -> Self {
        Repository::named(entry.name)
    }
}

#[async_trait]
impl RegistryClient for DockerHubClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn repositories(&self) -> Pages<'_, Repository> {
        let first = format!(
            "{}repositories/{}/?page_size={PAGE_SIZE}",
            self.base_url,
            utf8_percent_encode(&self.namespace, SEGMENT)
        );
        self.paginate::<RepositoryEntry, Repository>(first)
    }

    fn tags<'a>(&'a self, repository: &'a Repository) -> Pages<'a, TagRecord> {
        let first = format!("{}tags/?page_size={PAGE_SIZE}", self.repository_url(&repository.name));
        self.paginate::<TagEntry, TagRecord>(first)
    }

    async fn delete_batch(&self, repository: &Repository, tags: &[TagRecord]) -> BatchOutcome {
        let token = match self.token().await {
            Ok(token) => token,
            Err(err) => return BatchOutcome::from_error(err),
        };

        let repository_url = self.repository_url(&repository.name);
        let mut receipt = BatchReceipt::default();

        for tag in tags {
            let url = format!("{repository_url}tags/{}/", utf8_percent_encode(&tag.name, SEGMENT));
            match self.delete_tag(&url, token).await {
                Ok(true) => receipt.deleted.push(tag.clone()),
                Ok(false) => receipt.absent.push(tag.clone()),
                Err(err) => receipt.failed.push((tag.clone(), err)),
            }
        }

        BatchOutcome::Completed(receipt)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use test_log::test;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{header, method, path, query_param},
    };

    use super::*;
    use crate::registry::collect;

    async fn server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/users/login/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": "abc" })))
            .mount(&server)
            .await;
        server
    }

    fn client(server: &MockServer) -> DockerHubClient {
        DockerHubClient::new(&DockerHubConfig {
            url: server.uri(),
            namespace: "clever".into(),
            username: "bot".into(),
            password: "hunter2".into(),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[test(tokio::test)]
    async fn lists_repositories_across_pages() {
        let server = server().await;

        Mock::given(method("GET"))
            .and(path("/repositories/clever/"))
            .and(query_param("page_size", "100"))
            .and(header("Authorization", "JWT abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "next": format!("{}/more/repositories", server.uri()),
                "results": [{ "name": "svc-a" }, { "name": "svc-b" }],
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/more/repositories"))
            .and(header("Authorization", "JWT abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "next": null,
                "results": [{ "name": "svc-c" }],
            })))
            .mount(&server)
            .await;

        let client = client(&server);
        let repos = collect(client.repositories()).await.unwrap();

        assert_eq!(
            repos,
            vec![
                Repository::named("svc-a"),
                Repository::named("svc-b"),
                Repository::named("svc-c"),
            ]
        );
        assert_eq!(client.name(), "dockerhub/clever");
    }

    #[test(tokio::test)]
    async fn lists_tags_with_timestamps() {
        let server = server().await;

        Mock::given(method("GET"))
            .and(path("/repositories/clever/svc-a/tags/"))
            .and(query_param("page_size", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "next": "",
                "results": [
                    {
                        "name": "v2",
                        "last_updated": "2024-03-02T10:00:00.123456Z",
                        "digest": "sha256:abcdef0123456789",
                    },
                    { "name": "v1", "last_updated": null },
                ],
            })))
            .mount(&server)
            .await;

        let client = client(&server);
        let repository = Repository::named("svc-a");
        let tags = collect(client.tags(&repository)).await.unwrap();

        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].name, "v2");
        assert_eq!(
            tags[0].last_modified,
            DateTime::parse_from_rfc3339("2024-03-02T10:00:00.123456Z").unwrap()
        );
        assert_eq!(
            tags[0].digest.as_ref().map(ToString::to_string).as_deref(),
            Some("sha256:abcdef0123456789")
        );
        assert_eq!(tags[1].last_modified, DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(tags[1].digest, None);
    }

    #[test(tokio::test)]
    async fn listing_errors_carry_the_status() {
        let server = server().await;

        Mock::given(method("GET"))
            .and(path("/repositories/clever/svc-a/tags/"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = client(&server);
        let repository = Repository::named("svc-a");
        let err = collect(client.tags(&repository)).await.unwrap_err();

        assert!(err.is_transient());
    }

    #[test(tokio::test)]
    async fn deletes_tag_by_tag() {
        let server = server().await;

        Mock::given(method("DELETE"))
            .and(path("/repositories/clever/svc-a/tags/v1/"))
            .and(header("Authorization", "JWT abc"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/repositories/clever/svc-a/tags/v2/"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/repositories/clever/svc-a/tags/v3/"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = client(&server);
        let now = Utc::now();
        let tags = vec![
            TagRecord::new("v1", now),
            TagRecord::new("v2", now),
            TagRecord::new("v3", now),
        ];

        let BatchOutcome::Completed(receipt) =
            client.delete_batch(&Repository::named("svc-a"), &tags).await
        else {
            panic!("batch should reach the registry");
        };

        assert_eq!(receipt.deleted, vec![tags[0].clone()]);
        assert_eq!(receipt.absent, vec![tags[1].clone()]);
        assert_eq!(receipt.failed.len(), 1);
        assert_eq!(receipt.failed[0].0, tags[2]);
        assert!(receipt.failed[0].1.is_transient());
    }

    #[test(tokio::test)]
    async fn rejected_login_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/users/login/"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = client(&server);
        let outcome = client
            .delete_batch(&Repository::named("svc-a"), &[TagRecord::new("v1", Utc::now())])
            .await;

        assert!(matches!(
            outcome,
            BatchOutcome::Permanent(RegistryError::Authentication { .. })
        ));
    }

    #[test(tokio::test)]
    async fn logs_in_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/users/login/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": "abc" })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repositories/clever/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "results": [] })))
            .mount(&server)
            .await;

        let client = client(&server);
        collect(client.repositories()).await.unwrap();
        collect(client.repositories()).await.unwrap();
    }
}
