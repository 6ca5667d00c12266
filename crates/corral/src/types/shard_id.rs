use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifies a shard within a shard group.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ShardId {
    pub group: String,
    pub id: i32,
}

impl ShardId {
    pub fn new(group: impl Into<String>, id: i32) -> Self {
        Self {
            group: group.into(),
            id,
        }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group, self.id)
    }
}

/// Error returned when parsing a shard ID from its `group:index` form.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid shard id: {input}")]
pub struct ParseShardIdError {
    pub input: String,
}

impl FromStr for ShardId {
    type Err = ParseShardIdError;

    /// Parses the `Display` form `group:index`. Group names may themselves
    /// contain colons, so the split is on the last one.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseShardIdError { input: s.into() };
        let (group, id) = s.rsplit_once(':').ok_or_else(err)?;
        if group.is_empty() {
            return Err(err());
        }
        let id = id.parse().map_err(|_| err())?;
        Ok(Self::new(group, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_garbage() {
        assert!("".parse::<ShardId>().is_err());
        assert!("default".parse::<ShardId>().is_err());
        assert!(":3".parse::<ShardId>().is_err());
        assert!("default:x".parse::<ShardId>().is_err());
    }

    #[test]
    fn parse_group_with_colon() {
        let parsed: ShardId = "tenant:eu:5".parse().unwrap();
        assert_eq!(parsed, ShardId::new("tenant:eu", 5));
    }
}
