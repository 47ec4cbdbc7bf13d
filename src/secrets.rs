//! Start-up credentials.
//!
//! Each credential is read from a 1Password reference through the `op` CLI,
//! falling back to an environment variable when the deployment allows it.
//! Values live in `Zeroizing` buffers and never appear in `Debug` output.

use std::env;
use std::fmt;
use std::process::Command;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("Required credential {0} is not configured")]
    Missing(&'static str),

    #[error("1Password lookup for {name} failed: {reason}")]
    OnePassword { name: &'static str, reason: String },
}

/// Where credentials may come from
#[derive(Debug, Clone)]
pub struct SecretConfig {
    /// Accept environment variables when 1Password has nothing
    pub allow_env_vars: bool,
    /// Treat a failed `op read` as fatal
    pub require_op_cli: bool,
}

impl Default for SecretConfig {
    fn default() -> Self {
        Self {
            allow_env_vars: cfg!(debug_assertions),
            require_op_cli: false,
        }
    }
}

impl SecretConfig {
    /// Defaults overridden by `SECRETS_ALLOW_ENV` and `SECRETS_REQUIRE_OP`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            allow_env_vars: env_flag("SECRETS_ALLOW_ENV").unwrap_or(defaults.allow_env_vars),
            require_op_cli: env_flag("SECRETS_REQUIRE_OP").unwrap_or(defaults.require_op_cli),
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    match env::var(name).ok()?.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        other => {
            warn!("Ignoring {}={:?}, expected true or false", name, other);
            None
        }
    }
}

/// One credential and the places it is looked up
struct Credential {
    name: &'static str,
    op_reference: &'static str,
    env_var: &'static str,
}

const TWILIO_TOKEN: Credential = Credential {
    name: "twilio auth token",
    op_reference: "op://Trading/Twilio/auth_token",
    env_var: "TWILIO_AUTH_TOKEN",
};

const GATEWAY_TOKEN: Credential = Credential {
    name: "broker gateway token",
    op_reference: "op://Trading/BrokerGateway/token",
    env_var: "BROKER_GATEWAY_TOKEN",
};

const API_KEYS: Credential = Credential {
    name: "operator api keys",
    op_reference: "op://Trading/Tradegate/api_keys",
    env_var: "API_KEYS",
};

impl Credential {
    /// `Ok(None)` when no allowed source has a non-blank value
    fn resolve(
        &self,
        config: &SecretConfig,
        op_read: impl Fn(&str) -> Result<String, String>,
    ) -> Result<Option<Zeroizing<String>>, SecretError> {
        match op_read(self.op_reference) {
            Ok(value) if !value.trim().is_empty() => {
                info!("Loaded {} from 1Password", self.name);
                return Ok(Some(Zeroizing::new(value.trim().to_string())));
            }
            Ok(_) if config.require_op_cli => {
                return Err(SecretError::OnePassword {
                    name: self.name,
                    reason: "empty value".to_string(),
                });
            }
            Err(reason) if config.require_op_cli => {
                error!("1Password is required but {} could not be read", self.name);
                return Err(SecretError::OnePassword {
                    name: self.name,
                    reason,
                });
            }
            Ok(_) => {}
            Err(reason) => warn!("1Password unavailable for {}: {}", self.name, reason),
        }

        if !config.allow_env_vars {
            return Ok(None);
        }

        match env::var(self.env_var) {
            Ok(value) if !value.trim().is_empty() => {
                warn!(
                    "⚠️  {} taken from ${}; use 1Password in production",
                    self.name, self.env_var
                );
                Ok(Some(Zeroizing::new(value.trim().to_string())))
            }
            _ => Ok(None),
        }
    }
}

fn op_cli_read(reference: &str) -> Result<String, String> {
    let output = Command::new("op")
        .args(["read", reference])
        .output()
        .map_err(|e| format!("cannot run `op`: {}", e))?;

    if !output.status.success() {
        return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
    }
    String::from_utf8(output.stdout).map_err(|e| format!("non UTF-8 output: {}", e))
}

/// Credentials the control plane needs at start-up
pub struct ControlPlaneSecrets {
    pub twilio_auth_token: Option<Zeroizing<String>>,
    pub gateway_token: Option<Zeroizing<String>>,
    /// Comma-separated operator API keys
    pub api_keys: Zeroizing<String>,
}

impl fmt::Debug for ControlPlaneSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlPlaneSecrets")
            .field("twilio_auth_token", &self.twilio_auth_token.as_ref().map(|_| "<redacted>"))
            .field("gateway_token", &self.gateway_token.as_ref().map(|_| "<redacted>"))
            .field("api_keys", &"<redacted>")
            .finish()
    }
}

impl ControlPlaneSecrets {
    pub fn load(config: &SecretConfig) -> Result<Self, SecretError> {
        Self::load_with(config, op_cli_read)
    }

    fn load_with(
        config: &SecretConfig,
        op_read: impl Fn(&str) -> Result<String, String> + Copy,
    ) -> Result<Self, SecretError> {
        Ok(Self {
            twilio_auth_token: TWILIO_TOKEN.resolve(config, op_read)?,
            gateway_token: GATEWAY_TOKEN.resolve(config, op_read)?,
            api_keys: API_KEYS
                .resolve(config, op_read)?
                .ok_or(SecretError::Missing(API_KEYS.name))?,
        })
    }
}
