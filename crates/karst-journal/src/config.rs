#![forbid(unsafe_code)]
//! Journal geometry configuration.

use karst_error::{KarstError, Result};
use karst_types::LogGroupId;

/// Geometry of the on-device journal: how many log groups the buffer is
/// divided into and how large each group region is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalConfig {
    /// Number of fixed-size log-group regions. At least 2, so one group can
    /// accept new records while another is being checkpointed.
    pub num_log_groups: u32,
    /// Size of one log-group region in bytes.
    pub log_group_size: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            num_log_groups: 2,
            log_group_size: 16 * 1024 * 1024,
        }
    }
}

impl JournalConfig {
    /// Validate the geometry, returning `self` for chaining.
    pub fn validate(self) -> Result<Self> {
        if self.num_log_groups < 2 {
            return Err(KarstError::Format(
                "journal must have at least two log groups".to_owned(),
            ));
        }
        if self.log_group_size == 0 {
            return Err(KarstError::Format(
                "journal log_group_size must be > 0".to_owned(),
            ));
        }
        self.total_size().ok_or_else(|| {
            KarstError::Format("journal geometry overflows u64".to_owned())
        })?;
        Ok(self)
    }

    /// Total journal size in bytes, `None` on overflow.
    #[must_use]
    pub fn total_size(&self) -> Option<u64> {
        self.log_group_size.checked_mul(u64::from(self.num_log_groups))
    }

    /// Whether `group` addresses a region inside this journal.
    #[must_use]
    pub fn contains(&self, group: LogGroupId) -> bool {
        group.0 < self.num_log_groups
    }

    /// Byte offset of the start of `group`'s region.
    #[must_use]
    pub fn group_offset(&self, group: LogGroupId) -> u64 {
        u64::from(group.0) * self.log_group_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = JournalConfig::default().validate().expect("valid");
        assert_eq!(config.num_log_groups, 2);
        assert_eq!(config.total_size(), Some(32 * 1024 * 1024));
    }

    #[test]
    fn rejects_single_group_journal() {
        let config = JournalConfig {
            num_log_groups: 1,
            log_group_size: 4096,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_group_size() {
        let config = JournalConfig {
            num_log_groups: 4,
            log_group_size: 0,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_overflowing_geometry() {
        let config = JournalConfig {
            num_log_groups: u32::MAX,
            log_group_size: u64::MAX / 2,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn group_offsets_are_contiguous() {
        let config = JournalConfig {
            num_log_groups: 4,
            log_group_size: 4096,
        };
        assert_eq!(config.group_offset(LogGroupId(0)), 0);
        assert_eq!(config.group_offset(LogGroupId(3)), 3 * 4096);
        assert!(config.contains(LogGroupId(3)));
        assert!(!config.contains(LogGroupId(4)));
    }
}
