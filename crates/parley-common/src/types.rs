use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// The agent lineage a session belongs to. Each user has at most one active
/// session per agent type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Core,
    High,
    Low,
    User,
}

impl AgentType {
    pub const ALL: [AgentType; 4] = [
        AgentType::Core,
        AgentType::High,
        AgentType::Low,
        AgentType::User,
    ];

    /// Short code embedded in session IDs.
    pub fn code(self) -> &'static str {
        match self {
            AgentType::Core => "c",
            AgentType::High => "h",
            AgentType::Low => "l",
            AgentType::User => "u",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentType::Core => "core",
            AgentType::High => "high",
            AgentType::Low => "low",
            AgentType::User => "user",
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "core" | "c" => Ok(AgentType::Core),
            "high" | "h" => Ok(AgentType::High),
            "low" | "l" => Ok(AgentType::Low),
            "user" | "u" => Ok(AgentType::User),
            other => Err(Error::Config(format!("unknown agent type: '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_and_codes() {
        for agent in AgentType::ALL {
            assert_eq!(agent.as_str().parse::<AgentType>().unwrap(), agent);
            assert_eq!(agent.code().parse::<AgentType>().unwrap(), agent);
        }
        assert!("medium".parse::<AgentType>().is_err());
    }

    #[test]
    fn serializes_lowercase() {
        let json = serde_json::to_string(&AgentType::High).unwrap();
        assert_eq!(json, "\"high\"");
    }
}
