use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use platform_dirs::AppDirs;
use serde::{Deserialize, Deserializer, Serialize, de};

use crate::{
    config::files::RecursiveFileProvider, policy::RetentionPolicy, registry::MAX_BATCH_SIZE,
    retry::Backoff,
};

pub(crate) mod duration;
pub(crate) mod files;

/// How ECR images are identified in `BatchDeleteImage`.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImageKey {
    #[default]
    Tag,
    Digest,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct EcrConfig {
    #[serde(default, deserialize_with = "regions")]
    pub regions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub delete_by: ImageKey,
}

fn default_hub_url() -> String {
    "https://hub.docker.com/v2/".to_string()
}

const fn default_hub_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DockerHubConfig {
    #[serde(default = "default_hub_url")]
    pub url: String,
    pub namespace: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(with = "crate::config::duration", default = "default_hub_timeout")]
    pub timeout: Duration,
}

impl std::fmt::Debug for DockerHubConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let password = match self.password.is_empty() {
            true => "",
            false => "***",
        };

        f.debug_struct("DockerHubConfig")
            .field("url", &self.url)
            .field("namespace", &self.namespace)
            .field("username", &self.username)
            .field("password", &password)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    Ecr(EcrConfig),
    Dockerhub(DockerHubConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Ecr(EcrConfig::default())
    }
}

impl BackendConfig {
    fn validate(&self, role: &str) -> Result<()> {
        match self {
            Self::Ecr(ecr) => {
                if ecr.regions.is_empty() {
                    bail!("{role}: at least one ECR region must be configured");
                }
            }
            Self::Dockerhub(hub) => {
                if hub.namespace.is_empty() {
                    bail!("{role}: a Docker Hub namespace must be configured");
                }
                if hub.username.is_empty() || hub.password.is_empty() {
                    bail!("{role}: Docker Hub username and password are required");
                }
            }
        }
        Ok(())
    }
}

/// Accepts either a YAML list or a comma separated string (`REGIONS=a,b`).
fn regions<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Regions {
        List(Vec<String>),
        Joined(String),
    }

    let regions = match Regions::deserialize(deserializer)? {
        Regions::List(list) => list,
        Regions::Joined(joined) => joined.split(',').map(str::to_string).collect(),
    };

    let regions: Vec<String> = regions
        .into_iter()
        .map(|region| region.trim().to_string())
        .filter(|region| !region.is_empty())
        .collect();

    if regions.iter().any(|region| region.contains(char::is_whitespace)) {
        return Err(de::Error::custom("region names cannot contain whitespace"));
    }

    Ok(regions)
}

const fn default_batch_size() -> usize {
    MAX_BATCH_SIZE
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct DeletionConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(flatten)]
    pub backoff: Backoff,
}

impl Default for DeletionConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            backoff: Backoff::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Configuration {
    pub dry_run: bool,
    pub strict: bool,
    pub abort_on_repository_error: bool,
    pub concurrency: usize,
    #[serde(with = "crate::config::duration::option", default)]
    pub deadline: Option<Duration>,
    pub retention: RetentionPolicy,
    pub deletion: DeletionConfig,
    pub primary: BackendConfig,
    pub mirror: Option<BackendConfig>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            dry_run: true,
            strict: false,
            abort_on_repository_error: false,
            concurrency: 4,
            deadline: None,
            retention: RetentionPolicy::default(),
            deletion: DeletionConfig::default(),
            primary: BackendConfig::default(),
            mirror: None,
        }
    }
}

impl Configuration {
    pub fn figment(configs: Vec<PathBuf>) -> Figment {
        let fig = Figment::from(Serialized::defaults(Configuration::default()));

        let config_path = AppDirs::new(Some("prune-images"), true)
            .map(|dirs| dirs.config_dir.join("config.yaml"));

        let fig = match config_path {
            Some(config_path) if config_path.exists() => {
                fig.admerge(RecursiveFileProvider::new(Yaml::file(config_path)))
            }
            _ => fig,
        };

        let fig = configs.into_iter().fold(fig, |fig, config_path| {
            fig.admerge(RecursiveFileProvider::new(Yaml::file(config_path)))
        });

        // Unprefixed names used by the Lambda deployment.
        let legacy = Env::raw()
            .only(&["DRY_RUN", "MIN_IMAGES", "REGIONS"])
            .map(|key| {
                if key == "min_images" {
                    "retention.keep_count".into()
                } else if key == "regions" {
                    "primary.regions".into()
                } else {
                    key.as_str().to_ascii_lowercase().into()
                }
            });

        fig.merge(legacy)
            .merge(RecursiveFileProvider::new(Env::prefixed("PRUNE_").split("__")))
    }

    pub fn config(figment: Figment) -> Result<Configuration> {
        let config: Configuration = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_BATCH_SIZE).contains(&self.deletion.batch_size) {
            bail!("deletion.batch_size must be between 1 and {MAX_BATCH_SIZE}");
        }

        if self.deletion.backoff.attempts < 1 {
            bail!("deletion.attempts must be at least 1");
        }

        if self.concurrency < 1 {
            bail!("concurrency must be at least 1");
        }

        self.primary.validate("primary")?;

        if let Some(mirror) = &self.mirror {
            mirror.validate("mirror")?;
        }

        Ok(())
    }
}
