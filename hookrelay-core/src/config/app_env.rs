//! Runtime parameters of the containerized webhook application.
//!
//! These end up in the application's environment file. Secrets left unset
//! here are generated once when the file is first written and preserved on
//! every later run.

use serde::{Deserialize, Serialize};

use super::desired::ConfigError;

/// Runtime parameters for the application container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppEnv {
    pub db_host: String,
    pub db_port: u16,
    pub db_name: String,
    pub db_user: String,
    /// Generated when unset.
    pub db_password: Option<String>,

    /// Rows buffered before a batch insert.
    pub batch_size: u32,
    /// Maximum time a partial batch may wait before it is flushed.
    pub batch_flush_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,

    /// Stored requests older than this are purged.
    pub retention_days: u32,

    pub basic_auth_user: String,
    /// Generated when unset.
    pub basic_auth_password: Option<String>,

    /// Largest request body the endpoint accepts.
    pub max_payload_bytes: u64,

    /// Port the application listens on; always follows the desired port.
    pub listen_port: u16,
}

impl Default for AppEnv {
    fn default() -> Self {
        Self {
            db_host: "db".to_string(),
            db_port: 5432,
            db_name: "webhooks".to_string(),
            db_user: "webhooks".to_string(),
            db_password: None,
            batch_size: 100,
            batch_flush_ms: 1_000,
            retry_attempts: 5,
            retry_delay_ms: 2_000,
            retention_days: 30,
            basic_auth_user: "admin".to_string(),
            basic_auth_password: None,
            max_payload_bytes: 1024 * 1024,
            listen_port: super::desired::DEFAULT_PORT,
        }
    }
}

/// Keys whose values are secrets generated on first write.
pub const SECRET_KEYS: &[&str] = &["DB_PASSWORD", "BASIC_AUTH_PASSWORD"];

impl AppEnv {
    /// Returns the environment entries in a stable order.
    ///
    /// Unset secrets are returned as `None` so the caller can keep a value
    /// already on disk or generate a fresh one.
    pub fn entries(&self) -> Vec<(&'static str, Option<String>)> {
        vec![
            ("DB_HOST", Some(self.db_host.clone())),
            ("DB_PORT", Some(self.db_port.to_string())),
            ("DB_NAME", Some(self.db_name.clone())),
            ("DB_USER", Some(self.db_user.clone())),
            ("DB_PASSWORD", self.db_password.clone()),
            ("BATCH_SIZE", Some(self.batch_size.to_string())),
            ("BATCH_FLUSH_MS", Some(self.batch_flush_ms.to_string())),
            ("RETRY_ATTEMPTS", Some(self.retry_attempts.to_string())),
            ("RETRY_DELAY_MS", Some(self.retry_delay_ms.to_string())),
            ("RETENTION_DAYS", Some(self.retention_days.to_string())),
            ("BASIC_AUTH_USER", Some(self.basic_auth_user.clone())),
            ("BASIC_AUTH_PASSWORD", self.basic_auth_password.clone()),
            ("MAX_PAYLOAD_BYTES", Some(self.max_payload_bytes.to_string())),
            ("PORT", Some(self.listen_port.to_string())),
        ]
    }
}

impl AppEnv {
    /// Every value must stay on its own `KEY=value` line.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in self.entries() {
            let Some(value) = value else { continue };
            let reason = if value.contains(|c: char| c == '\n' || c == '\r') {
                "line breaks are not allowed"
            } else if value.contains('=') {
                "'=' is not allowed"
            } else if value.contains('\0') {
                "NUL bytes are not allowed"
            } else {
                continue;
            };
            return Err(ConfigError::InvalidEnvValue { key, reason });
        }
        Ok(())
    }
}

/// Generates a random secret suitable for a password field.
pub fn generate_secret() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
