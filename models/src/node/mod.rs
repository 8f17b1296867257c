pub mod cordon;
pub mod eviction;

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::str::FromStr;

use self::error::Result;

/// Point-in-time view of the local node's termination status.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeTerminationState {
    /// Cluster-visible hostname of the local instance.
    pub node_name: String,
    /// Set while a provider signal indicates the VM is about to be reclaimed.
    pub pending_termination: bool,
    /// Absolute time by which the VM is expected to be gone. Only meaningful
    /// while a termination is pending.
    pub termination_time: DateTime<Utc>,
    /// Whether a host reboot is applicable to handle the pending termination.
    /// Preemptible instances are deleted outright, so rebooting them buys
    /// nothing.
    pub needs_reboot: bool,
}

/// Pods that must never be evicted, identified by name and namespace.
/// Built once from configuration and immutable afterwards.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExcludeSet {
    pods: HashSet<(String, String)>,
}

impl ExcludeSet {
    pub fn contains(&self, name: &str, namespace: &str) -> bool {
        self.pods
            .contains(&(name.to_string(), namespace.to_string()))
    }

    pub fn len(&self) -> usize {
        self.pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }
}

impl FromStr for ExcludeSet {
    type Err = error::Error;

    /// Parses a comma separated list of `name:namespace` pairs. An unset flag
    /// arrives as the empty string and yields an empty set.
    fn from_str(s: &str) -> Result<Self> {
        let mut pods = HashSet::new();
        for entry in s.split(',').filter(|entry| !entry.is_empty()) {
            let parts: Vec<&str> = entry.split(':').collect();
            match parts.as_slice() {
                [name, namespace] if !name.is_empty() && !namespace.is_empty() => {
                    pods.insert((name.to_string(), namespace.to_string()));
                }
                _ => return error::MalformedExcludeEntrySnafu { entry }.fail(),
            }
        }
        Ok(Self { pods })
    }
}

pub mod error {
    use snafu::Snafu;

    pub type Result<T> = std::result::Result<T, Error>;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display(
            "Invalid exclude-pods entry '{}'. Expected format 'name:namespace'.",
            entry
        ))]
        MalformedExcludeEntry { entry: String },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclude_set_parses_pairs() {
        let set: ExcludeSet = "fluentd:kube-system,web:default".parse().unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains("fluentd", "kube-system"));
        assert!(set.contains("web", "default"));
        assert!(!set.contains("fluentd", "default"));
    }

    #[test]
    fn empty_flag_is_an_empty_set() {
        let set: ExcludeSet = "".parse().unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn trailing_comma_is_tolerated() {
        let set: ExcludeSet = "web:default,".parse().unwrap();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn entry_without_namespace_is_rejected() {
        assert!("web".parse::<ExcludeSet>().is_err());
        assert!("web:".parse::<ExcludeSet>().is_err());
        assert!(":default".parse::<ExcludeSet>().is_err());
        assert!("a:b:c".parse::<ExcludeSet>().is_err());
    }
}
