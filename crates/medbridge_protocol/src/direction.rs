//! Sync directions.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The two directions a change can travel.
///
/// The wire names reflect the store technologies on each side: the clinic
/// application runs on the on-premises SQL store (primary), the referrer
/// portal on the cloud Postgres store (secondary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Primary store to secondary store.
    #[serde(rename = "sql-to-postgres")]
    Outbound,
    /// Secondary store to primary store.
    #[serde(rename = "postgres-to-sql")]
    Inbound,
}

impl Direction {
    /// Returns the wire name for this direction.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Outbound => "sql-to-postgres",
            Direction::Inbound => "postgres-to-sql",
        }
    }

    /// Parses a wire name.
    pub fn parse(s: &str) -> Result<Self, ParseDirectionError> {
        match s {
            "sql-to-postgres" => Ok(Direction::Outbound),
            "postgres-to-sql" => Ok(Direction::Inbound),
            _ => Err(ParseDirectionError(s.to_string())),
        }
    }

    /// Returns the opposite direction.
    pub fn opposite(&self) -> Self {
        match self {
            Direction::Outbound => Direction::Inbound,
            Direction::Inbound => Direction::Outbound,
        }
    }

    /// Both directions, outbound first.
    pub fn both() -> [Direction; 2] {
        [Direction::Outbound, Direction::Inbound]
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Direction {
    type Err = ParseDirectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Direction::parse(s)
    }
}

/// Error returned when a direction name is not recognized.
#[derive(Debug, Clone, Error)]
#[error("unknown sync direction: {0}")]
pub struct ParseDirectionError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names() {
        assert_eq!(Direction::Outbound.as_str(), "sql-to-postgres");
        assert_eq!(Direction::Inbound.as_str(), "postgres-to-sql");

        assert_eq!(
            Direction::parse("sql-to-postgres").unwrap(),
            Direction::Outbound
        );
        assert_eq!(
            Direction::parse("postgres-to-sql").unwrap(),
            Direction::Inbound
        );
        assert!(Direction::parse("sideways").is_err());
    }

    #[test]
    fn opposite_is_involution() {
        for dir in Direction::both() {
            assert_eq!(dir.opposite().opposite(), dir);
        }
    }

    #[test]
    fn serde_uses_wire_names() {
        let json = serde_json::to_string(&Direction::Outbound).unwrap();
        assert_eq!(json, "\"sql-to-postgres\"");

        let parsed: Direction = serde_json::from_str("\"postgres-to-sql\"").unwrap();
        assert_eq!(parsed, Direction::Inbound);
    }
}
