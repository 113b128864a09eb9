mod digest;
mod repository;
mod tag;

pub use self::digest::{Digest, DigestError};
pub use self::repository::Repository;
pub use self::tag::{RepoTagSet, TagRecord};
