//! Retention decisions.
//!
//! A repository keeps its `keep_count` most recently modified tags. Anything
//! ranked beyond that is only eligible once it is older than `min_age`, so a
//! burst of pushes cannot evict images that are still rolling out.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::TagRecord;

const fn default_keep_count() -> usize {
    100
}

const fn default_min_age() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct RetentionPolicy {
    #[serde(default = "default_keep_count")]
    pub keep_count: usize,
    #[serde(with = "crate::config::duration", default = "default_min_age")]
    pub min_age: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_count: default_keep_count(),
            min_age: default_min_age(),
        }
    }
}

impl RetentionPolicy {
    pub fn new(keep_count: usize, min_age: Duration) -> Self {
        Self {
            keep_count,
            min_age,
        }
    }

    /// Tags strictly older than this are past the age floor.
    pub fn age_floor(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let min_age = TimeDelta::from_std(self.min_age).unwrap_or(TimeDelta::MAX);
        now.checked_sub_signed(min_age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Returns the tags that should be deleted, most recent first.
    ///
    /// Ties on `last_modified` keep their listing order.
    pub fn select_for_deletion(&self, tags: &[TagRecord], now: DateTime<Utc>) -> Vec<TagRecord> {
        if tags.len() <= self.keep_count {
            return vec![];
        }

        let mut ranked: Vec<&TagRecord> = tags.iter().collect();
        ranked.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));

        let floor = self.age_floor(now);

        ranked
            .into_iter()
            .skip(self.keep_count)
            .filter(|tag| {
                if tag.last_modified < floor {
                    return true;
                }
                debug!(
                    tag = %tag.name,
                    last_modified = %tag.last_modified,
                    "Beyond keep count but younger than the age floor; retaining"
                );
                false
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use proptest::prelude::*;

    use super::*;

    const DAY: i64 = 24 * 60 * 60;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn week() -> Duration {
        Duration::from_secs(7 * DAY as u64)
    }

    /// `count` tags named `v0..`, `v0` being the newest, all `min_days_old` or older.
    fn tags_aged(count: usize, min_days_old: i64) -> Vec<TagRecord> {
        (0..count)
            .map(|idx| {
                TagRecord::new(
                    format!("v{idx}"),
                    now() - TimeDelta::seconds(min_days_old * DAY + idx as i64 * 60),
                )
            })
            .collect()
    }

    fn names(tags: &[TagRecord]) -> Vec<&str> {
        tags.iter().map(|tag| tag.name.as_str()).collect()
    }

    #[test]
    fn empty_input() {
        let policy = RetentionPolicy::new(0, week());
        assert!(policy.select_for_deletion(&[], now()).is_empty());
    }

    #[test]
    fn under_threshold_keeps_everything() {
        let policy = RetentionPolicy::new(100, week());
        assert!(policy.select_for_deletion(&tags_aged(100, 30), now()).is_empty());
        assert!(policy.select_for_deletion(&tags_aged(3, 30), now()).is_empty());
    }

    #[test]
    fn deletes_the_oldest_beyond_keep_count() {
        let policy = RetentionPolicy::new(100, week());
        let tags = tags_aged(120, 30);

        let selected = policy.select_for_deletion(&tags, now());

        assert_eq!(selected.len(), 20);
        let expected: Vec<String> = (100..120).map(|idx| format!("v{idx}")).collect();
        assert_eq!(names(&selected), expected);
    }

    #[test]
    fn input_order_does_not_matter() {
        let policy = RetentionPolicy::new(100, week());
        let mut tags = tags_aged(120, 30);
        tags.reverse();

        let selected = policy.select_for_deletion(&tags, now());
        let expected: Vec<String> = (100..120).map(|idx| format!("v{idx}")).collect();
        assert_eq!(names(&selected), expected);
    }

    #[test]
    fn recent_burst_is_protected() {
        // All 120 tags were pushed within the last day, so the 20 beyond the
        // keep count are still inside the grace window.
        let policy = RetentionPolicy::new(100, week());
        let tags = tags_aged(120, 0);

        assert!(policy.select_for_deletion(&tags, now()).is_empty());
    }

    #[test]
    fn only_candidates_past_the_floor_are_selected() {
        let policy = RetentionPolicy::new(2, week());
        let tags = vec![
            TagRecord::new("newest", now() - TimeDelta::days(1)),
            TagRecord::new("recent", now() - TimeDelta::days(2)),
            TagRecord::new("young", now() - TimeDelta::days(3)),
            TagRecord::new("old", now() - TimeDelta::days(8)),
            TagRecord::new("ancient", now() - TimeDelta::days(300)),
        ];

        let selected = policy.select_for_deletion(&tags, now());
        assert_eq!(names(&selected), vec!["old", "ancient"]);
    }

    #[test]
    fn keep_count_zero_selects_everything_old() {
        let policy = RetentionPolicy::new(0, week());
        let tags = vec![
            TagRecord::new("a", now() - TimeDelta::days(10)),
            TagRecord::new("b", now() - TimeDelta::days(1)),
            TagRecord::new("c", now() - TimeDelta::days(20)),
        ];

        let selected = policy.select_for_deletion(&tags, now());
        assert_eq!(names(&selected), vec!["a", "c"]);
    }

    #[test]
    fn exactly_at_the_floor_is_retained() {
        let policy = RetentionPolicy::new(0, week());
        let tags = vec![TagRecord::new("edge", now() - TimeDelta::days(7))];

        assert!(policy.select_for_deletion(&tags, now()).is_empty());
    }

    #[test]
    fn ties_keep_listing_order() {
        let pushed = now() - TimeDelta::days(30);
        let policy = RetentionPolicy::new(1, week());
        let tags = vec![
            TagRecord::new("first", pushed),
            TagRecord::new("second", pushed),
            TagRecord::new("third", pushed),
        ];

        let selected = policy.select_for_deletion(&tags, now());
        assert_eq!(names(&selected), vec!["second", "third"]);
    }

    #[test]
    fn huge_min_age_does_not_overflow() {
        let policy = RetentionPolicy::new(0, Duration::from_secs(u64::MAX));
        let tags = tags_aged(5, 1000);

        assert!(policy.select_for_deletion(&tags, now()).is_empty());
    }

    fn arb_tags() -> impl Strategy<Value = Vec<TagRecord>> {
        prop::collection::vec(0i64..(60 * DAY), 0..200).prop_map(|ages| {
            ages.into_iter()
                .enumerate()
                .map(|(idx, age)| TagRecord::new(format!("t{idx}"), now() - TimeDelta::seconds(age)))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn nothing_selected_at_or_under_threshold(tags in arb_tags(), extra in 0usize..50, min_age in 0u64..(30 * DAY as u64)) {
            let policy = RetentionPolicy::new(tags.len() + extra, Duration::from_secs(min_age));
            prop_assert!(policy.select_for_deletion(&tags, now()).is_empty());
        }

        #[test]
        fn selection_is_bounded(tags in arb_tags(), keep_count in 0usize..250, min_age in 0u64..(30 * DAY as u64)) {
            let policy = RetentionPolicy::new(keep_count, Duration::from_secs(min_age));
            let selected = policy.select_for_deletion(&tags, now());
            prop_assert!(selected.len() <= tags.len().saturating_sub(keep_count));
        }

        #[test]
        fn raising_min_age_never_grows_selection(tags in arb_tags(), keep_count in 0usize..250, lower in 0u64..(30 * DAY as u64), bump in 0u64..(30 * DAY as u64)) {
            let loose = RetentionPolicy::new(keep_count, Duration::from_secs(lower));
            let strict = RetentionPolicy::new(keep_count, Duration::from_secs(lower + bump));

            let loose_selected = loose.select_for_deletion(&tags, now());
            let strict_selected = strict.select_for_deletion(&tags, now());

            prop_assert!(strict_selected.len() <= loose_selected.len());
            for tag in &strict_selected {
                prop_assert!(loose_selected.contains(tag));
            }
        }

        #[test]
        fn selection_is_deterministic(tags in arb_tags(), keep_count in 0usize..250, min_age in 0u64..(30 * DAY as u64)) {
            let policy = RetentionPolicy::new(keep_count, Duration::from_secs(min_age));
            prop_assert_eq!(
                policy.select_for_deletion(&tags, now()),
                policy.select_for_deletion(&tags, now())
            );
        }

        #[test]
        fn selected_tags_are_past_the_floor(tags in arb_tags(), keep_count in 0usize..250, min_age in 0u64..(30 * DAY as u64)) {
            let policy = RetentionPolicy::new(keep_count, Duration::from_secs(min_age));
            let floor = policy.age_floor(now());
            for tag in policy.select_for_deletion(&tags, now()) {
                prop_assert!(tag.last_modified < floor);
            }
        }
    }
}
