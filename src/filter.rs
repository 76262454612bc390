//! Cluster inclusion/exclusion filter
//!
//! Compiled once from a project's `include_clusters` / `exclude_clusters`
//! lists and queried for every ingested record.

use std::collections::HashSet;
use thiserror::Error;

/// Both cluster lists were non-empty
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("only one of 'include_clusters' or 'exclude_clusters' may be specified")]
pub struct ClusterListConflict;

/// Pre-compiled cluster membership test
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterFilter {
    include: HashSet<String>,
    exclude: HashSet<String>,
}

impl ClusterFilter {
    /// Compile include/exclude lists into lookup sets
    ///
    /// Fails if both lists are non-empty.
    pub fn build<S: AsRef<str>>(
        include: &[S],
        exclude: &[S],
    ) -> Result<Self, ClusterListConflict> {
        if !include.is_empty() && !exclude.is_empty() {
            return Err(ClusterListConflict);
        }

        Ok(Self {
            include: include.iter().map(|c| c.as_ref().to_string()).collect(),
            exclude: exclude.iter().map(|c| c.as_ref().to_string()).collect(),
        })
    }

    /// A filter that accepts every cluster
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Whether records attributed to `cluster` should be forwarded
    pub fn matches(&self, cluster: &str) -> bool {
        if !self.include.is_empty() {
            self.include.contains(cluster)
        } else if !self.exclude.is_empty() {
            !self.exclude.contains(cluster)
        } else {
            true
        }
    }

    /// Like [`matches`](Self::matches), for records that may lack a cluster
    ///
    /// Unattributed records pass unless an include list is configured.
    pub fn matches_attribution(&self, cluster: Option<&str>) -> bool {
        match cluster {
            Some(name) => self.matches(name),
            None => self.include.is_empty(),
        }
    }

    pub fn is_pass_through(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }
}
