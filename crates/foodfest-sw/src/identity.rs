//! Versioned cache naming.

use std::fmt;

/// Name of one generation's cache store: application prefix + version token.
///
/// Built once when the worker is loaded and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheIdentity {
    prefix: String,
    version: String,
    name: String,
}

impl CacheIdentity {
    pub fn new(prefix: impl Into<String>, version: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let version = version.into();
        let name = format!("{prefix}{version}");
        Self {
            prefix,
            version,
            name,
        }
    }

    /// The current namespace, e.g. `FoodFest-version_01`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Whether `name` is this worker's own store.
    pub fn is_current(&self, name: &str) -> bool {
        self.name == name
    }

    /// Substring test: the prefix appears anywhere in `name`.
    pub fn belongs_to_family(&self, name: &str) -> bool {
        name.contains(&self.prefix)
    }
}

impl fmt::Display for CacheIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_is_deterministic() {
        let a = CacheIdentity::new("FoodFest-", "version_01");
        let b = CacheIdentity::new("FoodFest-", "version_01");
        assert_eq!(a.name(), "FoodFest-version_01");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), b.name());
    }

    #[test]
    fn test_version_bump_changes_name() {
        let v1 = CacheIdentity::new("FoodFest-", "version_01");
        let v2 = CacheIdentity::new("FoodFest-", "version_02");
        assert_ne!(v1.name(), v2.name());
        assert!(v2.is_current("FoodFest-version_02"));
        assert!(!v2.is_current(v1.name()));
    }

    #[test]
    fn test_family_is_substring_match() {
        let id = CacheIdentity::new("FoodFest-", "version_02");
        assert!(id.belongs_to_family("FoodFest-version_01"));
        assert!(id.belongs_to_family("legacy-FoodFest-images"));
        assert!(!id.belongs_to_family("OtherApp-v1"));
        assert!(!id.belongs_to_family("foodfest-version_01"));
    }
}
