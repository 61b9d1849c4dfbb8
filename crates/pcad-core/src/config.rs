//! Shape cache configuration
//!
//! Settings can be serialized and loaded from RON configuration files.

use serde::{Deserialize, Serialize};

use crate::expand::MissingReferencePolicy;

/// Shape cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached shapes (None = unbounded)
    ///
    /// When full, the oldest entry is evicted first.
    pub max_entries: Option<usize>,
    /// Handling of references to objects missing from the document
    pub missing_reference: MissingReferencePolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: None,
            missing_reference: MissingReferencePolicy::BestEffort,
        }
    }
}

impl CacheConfig {
    /// Parse a RON configuration string
    pub fn from_ron(content: &str) -> Result<Self, ron::error::SpannedError> {
        ron::from_str(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = CacheConfig::from_ron("(max_entries: Some(128))").unwrap();
        assert_eq!(config.max_entries, Some(128));
        assert_eq!(config.missing_reference, MissingReferencePolicy::BestEffort);
    }

    #[test]
    fn test_fail_fast_policy() {
        let config = CacheConfig::from_ron("(missing_reference: FailFast)").unwrap();
        assert_eq!(config.missing_reference, MissingReferencePolicy::FailFast);
        assert_eq!(config.max_entries, None);
    }
}
