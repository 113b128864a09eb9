//! Wall clock for the age floor. Tests pin it to a fixed instant.

use chrono::{DateTime, Utc};

#[derive(Clone, Debug, Default)]
pub struct Clock(Source);

#[derive(Clone, Debug, Default)]
enum Source {
    #[default]
    System,
    #[cfg(test)]
    Pinned(std::sync::Arc<std::sync::Mutex<DateTime<Utc>>>),
}

impl Clock {
    pub fn new() -> Self {
        Self(Source::System)
    }

    pub fn now(&self) -> DateTime<Utc> {
        match &self.0 {
            Source::System => Utc::now(),
            #[cfg(test)]
            Source::Pinned(at) => *at.lock().unwrap(),
        }
    }

    /// A clock that stays at `at` until advanced.
    #[cfg(test)]
    pub fn mocked(at: DateTime<Utc>) -> Self {
        Self(Source::Pinned(std::sync::Arc::new(std::sync::Mutex::new(at))))
    }

    /// Moves a pinned clock forward; every clone sees the move.
    #[cfg(test)]
    pub fn advance(&self, by: chrono::TimeDelta) {
        if let Source::Pinned(at) = &self.0 {
            *at.lock().unwrap() += by;
        }
    }
}
