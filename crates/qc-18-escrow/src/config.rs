//! Escrow instance configuration from environment variables.

use std::env;

/// Configuration for one contract instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowConfig {
    /// `multiples` used when a proposal omits it
    pub default_multiples: u64,

    /// Maximum seats named in one reallocation
    pub max_batch_size: usize,

    /// Capacity of the event broadcast channel
    pub event_channel_capacity: usize,

    /// Capacity of the executor command queue
    pub command_channel_capacity: usize,

    /// Re-check totals and offer safety after every commit
    pub audit_after_commit: bool,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            default_multiples: 1,
            max_batch_size: 64,
            event_channel_capacity: 1024,
            command_channel_capacity: 256,
            audit_after_commit: true,
        }
    }
}

impl EscrowConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `QC_ESCROW_DEFAULT_MULTIPLES`: default `multiples` (default: 1)
    /// - `QC_ESCROW_MAX_BATCH_SIZE`: seats per reallocation (default: 64)
    /// - `QC_ESCROW_EVENT_CAPACITY`: event channel capacity (default: 1024)
    /// - `QC_ESCROW_COMMAND_CAPACITY`: executor queue capacity (default: 256)
    /// - `QC_ESCROW_AUDIT`: post-commit audit (default: true)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            default_multiples: parse_var("QC_ESCROW_DEFAULT_MULTIPLES")
                .filter(|n: &u64| *n > 0)
                .unwrap_or(defaults.default_multiples),

            max_batch_size: parse_var("QC_ESCROW_MAX_BATCH_SIZE")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.max_batch_size),

            event_channel_capacity: parse_var("QC_ESCROW_EVENT_CAPACITY")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.event_channel_capacity),

            command_channel_capacity: parse_var("QC_ESCROW_COMMAND_CAPACITY")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.command_channel_capacity),

            audit_after_commit: env::var("QC_ESCROW_AUDIT")
                .map(|v| v.to_lowercase() != "false" && v != "0")
                .unwrap_or(defaults.audit_after_commit),
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EscrowConfig::default();
        assert_eq!(config.default_multiples, 1);
        assert_eq!(config.max_batch_size, 64);
        assert!(config.audit_after_commit);
    }

    #[test]
    fn test_from_env_overrides() {
        env::set_var("QC_ESCROW_MAX_BATCH_SIZE", "8");
        env::set_var("QC_ESCROW_DEFAULT_MULTIPLES", "0");
        let config = EscrowConfig::from_env();
        env::remove_var("QC_ESCROW_MAX_BATCH_SIZE");
        env::remove_var("QC_ESCROW_DEFAULT_MULTIPLES");

        assert_eq!(config.max_batch_size, 8);
        // Zero is not a usable multiple; the default stands.
        assert_eq!(config.default_multiples, 1);
    }
}
