// Allocation roles and their fair-share weights

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypesError;

pub use armada_resources::DEFAULT_ROLE;

/// Role → weight table used by the fair-share accounting. Unknown roles
/// weigh 1.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Roles {
    weights: HashMap<String, f64>,
}

impl Roles {
    pub fn new() -> Self {
        Roles::default()
    }

    /// Register a role with a weight; weights must be positive.
    pub fn insert(&mut self, role: &str, weight: f64) -> Result<(), TypesError> {
        if !(weight > 0.0) {
            return Err(TypesError::InvalidWeight(format!(
                "weight for role '{}' must be positive, got {}",
                role, weight
            )));
        }
        self.weights.insert(role.to_string(), weight);
        Ok(())
    }

    pub fn weight(&self, role: &str) -> f64 {
        self.weights.get(role).copied().unwrap_or(1.0)
    }
}

impl FromStr for Roles {
    type Err = TypesError;

    /// Parse flag text of the form `"roleA=2,roleB=4"`.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut roles = Roles::new();
        for pair in text.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (role, weight) = pair
                .split_once('=')
                .ok_or_else(|| TypesError::InvalidWeight(format!("missing '=' in '{}'", pair)))?;
            let weight: f64 = weight
                .trim()
                .parse()
                .map_err(|_| TypesError::InvalidWeight(format!("malformed weight in '{}'", pair)))?;
            roles.insert(role.trim(), weight)?;
        }
        Ok(roles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_weights() {
        let roles: Roles = "analytics=2, batch=0.5".parse().unwrap();
        assert_eq!(roles.weight("analytics"), 2.0);
        assert_eq!(roles.weight("batch"), 0.5);
        assert_eq!(roles.weight("unknown"), 1.0);
    }

    #[test]
    fn test_rejects_nonpositive_weights() {
        assert!("analytics=0".parse::<Roles>().is_err());
        assert!("analytics=-1".parse::<Roles>().is_err());
        assert!("analytics".parse::<Roles>().is_err());
    }
}
