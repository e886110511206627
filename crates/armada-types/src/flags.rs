// Master configuration flags

use serde::{Deserialize, Serialize};

use crate::role::Roles;

/// Tunables for the master and the default allocator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterFlags {
    /// Seconds between allocator offer rounds
    pub allocation_interval: f64,
    /// Seconds until an unanswered offer is rescinded; None disables
    pub offer_timeout: Option<f64>,
    /// Seconds between slave health-check pings
    pub slave_ping_timeout: f64,
    /// Consecutive missed pings before a slave is removed
    pub max_slave_ping_timeouts: u32,
    /// Role assigned to frameworks that do not name one
    pub default_role: String,
    /// Completed frameworks kept for introspection
    pub max_completed_frameworks: usize,
    /// Completed tasks kept per framework
    pub max_completed_tasks_per_framework: usize,
    /// Role weight table
    pub roles: Roles,
}

impl Default for MasterFlags {
    fn default() -> Self {
        MasterFlags {
            allocation_interval: 1.0,
            offer_timeout: None,
            slave_ping_timeout: 15.0,
            max_slave_ping_timeouts: 5,
            default_role: crate::role::DEFAULT_ROLE.to_string(),
            max_completed_frameworks: 50,
            max_completed_tasks_per_framework: 1000,
            roles: Roles::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let flags: MasterFlags = serde_json::from_str("{}").unwrap();
        assert_eq!(flags.allocation_interval, 1.0);
        assert_eq!(flags.max_slave_ping_timeouts, 5);
        assert!(flags.offer_timeout.is_none());
    }

    #[test]
    fn test_partial_override() {
        let flags: MasterFlags =
            serde_json::from_str(r#"{"allocation_interval": 0.25, "offer_timeout": 30.0}"#).unwrap();
        assert_eq!(flags.allocation_interval, 0.25);
        assert_eq!(flags.offer_timeout, Some(30.0));
        assert_eq!(flags.default_role, "*");
    }
}
