//! Tunable consistency levels

use crate::common::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How many replicas must answer before a request succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConsistencyLevel {
    One,
    #[default]
    Quorum,
    All,
}

impl ConsistencyLevel {
    /// Acknowledgments required out of `n` replicas.
    pub fn required(self, n: usize) -> usize {
        match self {
            ConsistencyLevel::One => 1.min(n),
            ConsistencyLevel::Quorum => n / 2 + 1,
            ConsistencyLevel::All => n,
        }
    }
}

impl fmt::Display for ConsistencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConsistencyLevel::One => "ONE",
            ConsistencyLevel::Quorum => "QUORUM",
            ConsistencyLevel::All => "ALL",
        };
        f.write_str(s)
    }
}

impl FromStr for ConsistencyLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ONE" | "1" => Ok(ConsistencyLevel::One),
            "QUORUM" => Ok(ConsistencyLevel::Quorum),
            "ALL" => Ok(ConsistencyLevel::All),
            other => Err(Error::InvalidRequest(format!(
                "unknown consistency level: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required() {
        assert_eq!(ConsistencyLevel::One.required(3), 1);
        assert_eq!(ConsistencyLevel::Quorum.required(3), 2);
        assert_eq!(ConsistencyLevel::All.required(3), 3);
        assert_eq!(ConsistencyLevel::Quorum.required(1), 1);
        assert_eq!(ConsistencyLevel::Quorum.required(4), 3);
        assert_eq!(ConsistencyLevel::Quorum.required(5), 3);
        assert_eq!(ConsistencyLevel::One.required(0), 0);
    }

    #[test]
    fn test_parse() {
        assert_eq!("quorum".parse::<ConsistencyLevel>().unwrap(), ConsistencyLevel::Quorum);
        assert_eq!("ONE".parse::<ConsistencyLevel>().unwrap(), ConsistencyLevel::One);
        assert!("twice".parse::<ConsistencyLevel>().is_err());
        assert_eq!(ConsistencyLevel::All.to_string(), "ALL");
    }
}
