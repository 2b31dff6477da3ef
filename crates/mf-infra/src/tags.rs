//! Discovery protocol.
//!
//! Every resource the orchestrator creates carries the marker tag, so listing
//! and teardown can find managed resources by querying for it. Supporting
//! resources are named after the server so teardown can find them again
//! without any local state.

use std::collections::{BTreeMap, HashMap};

use crate::types::ServerDescriptor;

/// Key of the tag marking a resource as managed.
pub const MARKER_TAG: &str = "mcfleet";
pub const MARKER_VALUE: &str = "true";
/// Display-name tag understood by the provider consoles.
pub const NAME_TAG: &str = "Name";

// ── Resource naming ──

pub const NETWORK_SUFFIX: &str = "net";
pub const SUBNET_SUFFIX: &str = "subnet";
pub const ROUTER_SUFFIX: &str = "router";
pub const SECURITY_GROUP_SUFFIX: &str = "sg";
pub const FIREWALL_SUFFIX: &str = "fw";
pub const SSH_KEY_SUFFIX: &str = "ssh";
pub const VOLUME_SUFFIX: &str = "vol";

/// Ordered tag map attached to every resource of one server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
    /// Marker plus `<edition>=true`, without a display name.
    pub fn managed(descriptor: &ServerDescriptor) -> Self {
        let mut tags = Self::default();
        tags.insert(MARKER_TAG, MARKER_VALUE);
        tags.insert(descriptor.edition.as_str(), MARKER_VALUE);
        tags
    }

    /// Marker, edition and the server name as display name.
    pub fn for_server(descriptor: &ServerDescriptor) -> Self {
        Self::managed(descriptor).with_name(&descriptor.name)
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.insert(NAME_TAG, name);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn to_map(&self) -> HashMap<String, String> {
        self.0.clone().into_iter().collect()
    }

    pub fn flatten(&self) -> String {
        flatten(self.iter())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TagSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Join tags as `k=v` pairs, sorted by key, separated by commas.
pub fn flatten<K: AsRef<str>, V: AsRef<str>>(tags: impl IntoIterator<Item = (K, V)>) -> String {
    let mut pairs: Vec<(K, V)> = tags.into_iter().collect();
    pairs.sort_by(|a, b| a.0.as_ref().cmp(b.0.as_ref()));
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k.as_ref(), v.as_ref()))
        .collect::<Vec<_>>()
        .join(",")
}

/// Whether a resource's tags carry the marker.
pub fn is_managed<K: AsRef<str>, V: AsRef<str>>(tags: impl IntoIterator<Item = (K, V)>) -> bool {
    tags.into_iter()
        .any(|(k, v)| k.as_ref() == MARKER_TAG && v.as_ref() == MARKER_VALUE)
}

/// Label selector form of the marker, `mcfleet=true`.
pub fn marker_selector() -> String {
    format!("{MARKER_TAG}={MARKER_VALUE}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Edition;
    use crate::types::fixtures::descriptor;

    #[test]
    fn server_tags_carry_marker_edition_and_name() {
        let tags = TagSet::for_server(&descriptor("lobby", Edition::Bedrock));
        assert_eq!(tags.get(MARKER_TAG), Some("true"));
        assert_eq!(tags.get("bedrock"), Some("true"));
        assert_eq!(tags.get(NAME_TAG), Some("lobby"));
        assert_eq!(tags.flatten(), "Name=lobby,bedrock=true,mcfleet=true");
    }

    #[test]
    fn flatten_sorts_unordered_input() {
        let pairs = vec![("zone", "b"), ("app", "mc"), ("mcfleet", "true")];
        assert_eq!(flatten(pairs), "app=mc,mcfleet=true,zone=b");
        assert_eq!(flatten([("a1", "x"), ("a", "y")]), "a=y,a1=x");
        assert_eq!(flatten(Vec::<(&str, &str)>::new()), "");
    }

    #[test]
    fn marker_detection_requires_true_value() {
        let mut map = HashMap::new();
        map.insert("mcfleet".to_string(), "true".to_string());
        assert!(is_managed(&map));

        map.insert("mcfleet".to_string(), "false".to_string());
        assert!(!is_managed(&map));
        assert!(!is_managed([("Name", "lobby")]));
    }
}
