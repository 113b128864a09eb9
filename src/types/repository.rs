use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A repository as reported by a registry listing.
#[derive(Clone, Debug, Hash, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Repository {
    pub name: String,
    /// Registry assigned identifier, e.g. the AWS account that owns an ECR repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_id: Option<String>,
}

impl Repository {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            registry_id: None,
        }
    }

    pub fn with_registry_id(mut self, registry_id: impl Into<String>) -> Self {
        self.registry_id = Some(registry_id.into());
        self
    }
}

impl FromStr for Repository {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Repository::named(s))
    }
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.registry_id {
            Some(registry_id) => write!(f, "{}/{}", registry_id, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}
