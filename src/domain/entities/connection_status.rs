use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::entities::account_mode::AccountMode;

/// Liveness record of one broker session, one per account mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub account_mode: AccountMode,
    pub connected: bool,
    pub host: String,
    pub port: u16,
    pub client_id: u32,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_connected: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
}

impl ConnectionStatus {
    pub fn new(account_mode: AccountMode, host: &str, port: u16, client_id: u32) -> Self {
        Self {
            account_mode,
            connected: false,
            host: host.to_string(),
            port,
            client_id,
            last_checked: None,
            last_connected: None,
            reconnect_attempts: 0,
            last_error: None,
        }
    }

    /// Fold one health check result into the record.
    ///
    /// `reconnect_attempts` resets to zero only on a false -> true edge and
    /// counts every failed check otherwise.
    pub fn record_check(&mut self, connected: bool, error: Option<String>, now: DateTime<Utc>) {
        self.last_checked = Some(now);

        if connected {
            if !self.connected {
                self.reconnect_attempts = 0;
            }
            self.last_connected = Some(now);
            self.last_error = None;
        } else {
            self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
            self.last_error = error;
        }

        self.connected = connected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_checks_accumulate_then_reset() {
        let mut status = ConnectionStatus::new(AccountMode::Paper, "127.0.0.1", 7497, 1);
        for _ in 0..3 {
            status.record_check(false, Some("connection refused".to_string()), Utc::now());
        }
        assert_eq!(status.reconnect_attempts, 3);
        assert_eq!(status.last_error.as_deref(), Some("connection refused"));
        assert!(status.last_connected.is_none());

        status.record_check(true, None, Utc::now());
        assert_eq!(status.reconnect_attempts, 0);
        assert!(status.connected);
        assert!(status.last_connected.is_some());
        assert!(status.last_error.is_none());
    }

    #[test]
    fn test_steady_connection_keeps_counter() {
        let mut status = ConnectionStatus::new(AccountMode::Live, "gw", 7496, 2);
        status.record_check(true, None, Utc::now());
        status.record_check(true, None, Utc::now());
        assert_eq!(status.reconnect_attempts, 0);

        status.record_check(false, None, Utc::now());
        assert_eq!(status.reconnect_attempts, 1);
        assert!(!status.connected);
    }
}
