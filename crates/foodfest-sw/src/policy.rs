//! Which caches survive activation.
//!
//! The current namespace is always kept by the activation handler; a policy
//! only decides about the other names it finds.

use std::fmt;

use crate::identity::CacheIdentity;

/// Retain-set test applied to every existing cache name during activation.
pub trait RetentionPolicy: Send + Sync + fmt::Debug {
    fn retain(&self, name: &str, identity: &CacheIdentity) -> bool;
}

/// Keep every cache whose name contains the application prefix.
///
/// Older versions of the same application contain the prefix too, so they
/// are kept. Unrelated caches whose name happens to contain the prefix text
/// are kept as well.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContainsPrefix;

impl RetentionPolicy for ContainsPrefix {
    fn retain(&self, name: &str, identity: &CacheIdentity) -> bool {
        identity.belongs_to_family(name)
    }
}

/// Delete only older versions of this application (names starting with the
/// prefix); caches owned by anything else are left alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct SupersededVersions;

impl RetentionPolicy for SupersededVersions {
    fn retain(&self, name: &str, identity: &CacheIdentity) -> bool {
        !name.starts_with(identity.prefix()) || identity.is_current(name)
    }
}

/// Delete everything except the current namespace.
#[derive(Debug, Default, Clone, Copy)]
pub struct CurrentOnly;

impl RetentionPolicy for CurrentOnly {
    fn retain(&self, name: &str, identity: &CacheIdentity) -> bool {
        identity.is_current(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAMES: [&str; 4] = [
        "FoodFest-version_01",
        "FoodFest-version_02",
        "OtherApp-v1",
        "mirror-FoodFest-assets",
    ];

    fn kept(policy: &dyn RetentionPolicy) -> Vec<&'static str> {
        let identity = CacheIdentity::new("FoodFest-", "version_02");
        NAMES
            .into_iter()
            .filter(|name| policy.retain(name, &identity))
            .collect()
    }

    #[test]
    fn test_contains_prefix() {
        assert_eq!(
            kept(&ContainsPrefix),
            vec!["FoodFest-version_01", "FoodFest-version_02", "mirror-FoodFest-assets"]
        );
    }

    #[test]
    fn test_superseded_versions() {
        assert_eq!(
            kept(&SupersededVersions),
            vec!["FoodFest-version_02", "OtherApp-v1", "mirror-FoodFest-assets"]
        );
    }

    #[test]
    fn test_current_only() {
        assert_eq!(kept(&CurrentOnly), vec!["FoodFest-version_02"]);
    }
}
