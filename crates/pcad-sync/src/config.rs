//! Sync configuration

use serde::{Deserialize, Serialize};

/// What to do when a channel id is opened twice under one process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DuplicateChannelPolicy {
    /// The new channel wins; the previous transport is disposed
    #[default]
    Replace,
    /// Keep the existing channel and fail the open
    Reject,
}

/// Sync configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub duplicate_channels: DuplicateChannelPolicy,
    /// Inbound messages above this size are dropped (None = unlimited)
    pub max_message_size: Option<usize>,
}

impl SyncConfig {
    /// Parse a RON configuration string
    pub fn from_ron(content: &str) -> Result<Self, ron::error::SpannedError> {
        ron::from_str(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::from_ron("()").unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.duplicate_channels, DuplicateChannelPolicy::Replace);
    }

    #[test]
    fn test_reject_with_limit() {
        let config =
            SyncConfig::from_ron("(duplicate_channels: Reject, max_message_size: Some(65536))")
                .unwrap();
        assert_eq!(config.duplicate_channels, DuplicateChannelPolicy::Reject);
        assert_eq!(config.max_message_size, Some(65536));
    }
}
