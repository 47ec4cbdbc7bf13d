use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Brokerage account mode. Each mode owns an independent broker session
/// and connection status record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountMode {
    Paper,
    Live,
}

impl AccountMode {
    pub fn name(&self) -> &'static str {
        match self {
            AccountMode::Paper => "paper",
            AccountMode::Live => "live",
        }
    }

    /// Default gateway port for this mode
    pub fn default_port(&self) -> u16 {
        match self {
            AccountMode::Paper => 7497,
            AccountMode::Live => 7496,
        }
    }

    pub fn all() -> [AccountMode; 2] {
        [AccountMode::Paper, AccountMode::Live]
    }
}

impl std::fmt::Display for AccountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for AccountMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "paper" => Ok(AccountMode::Paper),
            "live" => Ok(AccountMode::Live),
            other => Err(format!("Unknown account mode: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_mode_name() {
        assert_eq!(AccountMode::Paper.name(), "paper");
        assert_eq!(AccountMode::Live.name(), "live");
    }

    #[test]
    fn test_account_mode_parse() {
        assert_eq!("PAPER".parse::<AccountMode>().unwrap(), AccountMode::Paper);
        assert_eq!(" live ".parse::<AccountMode>().unwrap(), AccountMode::Live);
        assert!("demo".parse::<AccountMode>().is_err());
    }

    #[test]
    fn test_default_ports_differ() {
        assert_ne!(AccountMode::Paper.default_port(), AccountMode::Live.default_port());
    }
}
