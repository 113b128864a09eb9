use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

use data_encoding::HEXLOWER_PERMISSIVE;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DigestError {
    #[error("digest {0:?} is not in <algorithm>:<hex> form")]
    Malformed(String),

    #[error("digest {0:?} does not carry a hex encoded hash")]
    NotHex(String),
}

/// Content addressed identifier of an image, e.g. `sha256:abcd...`.
#[derive(Clone, Debug, Hash, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    pub algo: String,
    pub hash: String,
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algo, hash) = s
            .split_once(':')
            .ok_or_else(|| DigestError::Malformed(s.to_string()))?;

        if algo.is_empty() || hash.is_empty() {
            return Err(DigestError::Malformed(s.to_string()));
        }

        if HEXLOWER_PERMISSIVE.decode(hash.as_bytes()).is_err() {
            return Err(DigestError::NotHex(s.to_string()));
        }

        Ok(Digest {
            algo: algo.to_string(),
            hash: hash.to_ascii_lowercase(),
        })
    }
}

// We implement this so that serde_json can parse a Digest from a straight string
impl TryFrom<String> for Digest {
    type Error = DigestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// We implement this so that serde_json can serialize a Digest struct into a string
impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_string()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algo, self.hash)
    }
}
