use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Digest, Repository};

/// One tag of a repository, as seen by a single listing snapshot.
///
/// A push reported under several tag names yields one record per name.
#[derive(Clone, Debug, Hash, Serialize, Deserialize, PartialEq, Eq)]
pub struct TagRecord {
    pub name: String,
    /// Last push or update time.
    pub last_modified: DateTime<Utc>,
    /// Only used by registries that key deletion by digest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
}

impl TagRecord {
    pub fn new(name: impl Into<String>, last_modified: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            last_modified,
            digest: None,
        }
    }

    pub fn with_digest(mut self, digest: Digest) -> Self {
        self.digest = Some(digest);
        self
    }
}

/// The tags removed from (or planned for removal from) one repository.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepoTagSet {
    pub repository: Repository,
    pub tags: Vec<TagRecord>,
}

impl RepoTagSet {
    pub fn new(repository: Repository, tags: Vec<TagRecord>) -> Self {
        Self { repository, tags }
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn tag_names(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(|tag| tag.name.as_str())
    }
}
