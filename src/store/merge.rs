//! Replica reconciliation rules.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::EntryView;

/// Rule for reconciling a merging replica value with the existing local one,
/// e.g. after a network partition heals or a backup is promoted.
///
/// Ties always keep the existing value so that reconciliation is deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MergePolicy {
    /// Keep the existing value if present; otherwise take the merging value.
    #[default]
    #[serde(
        rename = "keep-existing-if-present",
        alias = "PutIfAbsentMergePolicy",
        alias = "put-if-absent"
    )]
    PutIfAbsent,
    /// Take whichever value has been accessed more times.
    #[serde(
        rename = "keep-higher-hit-count",
        alias = "HigherHitsMergePolicy",
        alias = "higher-hits"
    )]
    HigherHits,
    /// Take whichever value was written most recently.
    #[serde(
        rename = "keep-latest-update",
        alias = "LatestUpdateMergePolicy",
        alias = "latest-update"
    )]
    LatestUpdate,
    /// Always take the merging value.
    #[serde(
        rename = "always-overwrite",
        alias = "PassThroughMergePolicy",
        alias = "pass-through"
    )]
    PassThrough,
    /// Always keep the existing state, even when there is none.
    #[serde(rename = "always-discard", alias = "DiscardMergePolicy", alias = "discard")]
    Discard,
}

impl MergePolicy {
    /// Decide whether `merging` replaces `existing`.
    pub fn accepts(&self, existing: Option<&EntryView>, merging: &EntryView) -> bool {
        match (self, existing) {
            (MergePolicy::PassThrough, _) => true,
            (MergePolicy::Discard, _) => false,
            (_, None) => true,
            (MergePolicy::PutIfAbsent, Some(_)) => false,
            (MergePolicy::HigherHits, Some(current)) => merging.hits > current.hits,
            (MergePolicy::LatestUpdate, Some(current)) => {
                merging.last_update_time > current.last_update_time
            }
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            MergePolicy::PutIfAbsent => "keep-existing-if-present",
            MergePolicy::HigherHits => "keep-higher-hit-count",
            MergePolicy::LatestUpdate => "keep-latest-update",
            MergePolicy::PassThrough => "always-overwrite",
            MergePolicy::Discard => "always-discard",
        }
    }
}

impl fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(hits: u64, last_update_time: u64) -> EntryView {
        EntryView {
            key: "k".to_string(),
            value: vec![1],
            version: 1,
            hits,
            creation_time: 0,
            last_access_time: last_update_time,
            last_update_time,
        }
    }

    #[test]
    fn test_put_if_absent() {
        let policy = MergePolicy::PutIfAbsent;
        assert!(policy.accepts(None, &entry(1, 1)));
        assert!(!policy.accepts(Some(&entry(1, 1)), &entry(100, 100)));
    }

    #[test]
    fn test_higher_hits() {
        let policy = MergePolicy::HigherHits;
        assert!(policy.accepts(Some(&entry(3, 0)), &entry(4, 0)));
        assert!(!policy.accepts(Some(&entry(4, 0)), &entry(3, 0)));
        // Ties keep the existing value
        assert!(!policy.accepts(Some(&entry(4, 0)), &entry(4, 0)));
    }

    #[test]
    fn test_latest_update() {
        let policy = MergePolicy::LatestUpdate;
        assert!(policy.accepts(Some(&entry(0, 10)), &entry(0, 11)));
        assert!(!policy.accepts(Some(&entry(0, 11)), &entry(0, 10)));
        assert!(!policy.accepts(Some(&entry(0, 11)), &entry(0, 11)));
    }

    #[test]
    fn test_pass_through_and_discard() {
        assert!(MergePolicy::PassThrough.accepts(Some(&entry(9, 9)), &entry(0, 0)));
        assert!(!MergePolicy::Discard.accepts(None, &entry(0, 0)));
        assert!(!MergePolicy::Discard.accepts(Some(&entry(0, 0)), &entry(9, 9)));
    }

    #[test]
    fn test_deserialize_aliases() {
        let policy: MergePolicy = serde_yaml::from_str("HigherHitsMergePolicy").unwrap();
        assert_eq!(policy, MergePolicy::HigherHits);
        let policy: MergePolicy = serde_yaml::from_str("keep-latest-update").unwrap();
        assert_eq!(policy, MergePolicy::LatestUpdate);
        assert_eq!(MergePolicy::default().to_string(), "keep-existing-if-present");
    }
}
