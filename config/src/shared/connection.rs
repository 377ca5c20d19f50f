use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sqlx::mysql::{MySqlConnectOptions, MySqlSslMode};

use crate::shared::ValidationError;

/// Connection settings of the MySQL source.
///
/// This intentionally does not implement [`serde::Serialize`] to avoid leaking the password.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MySqlConnectionConfig {
    pub host: String,
    pub port: u16,
    /// Default database. Bulk export queries are always fully qualified.
    pub name: String,
    pub username: String,
    pub password: Option<SecretString>,
    /// Server id the binlog client registers with. Must be unique in the replication topology.
    #[serde(default = "default_server_id")]
    pub server_id: u32,
    #[serde(default)]
    pub tls: bool,
}

impl MySqlConnectionConfig {
    pub const DEFAULT_SERVER_ID: u32 = 1001;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.host.is_empty() {
            return Err(ValidationError::InvalidFieldValue {
                field: "source.host".to_string(),
                constraint: "must not be empty".to_string(),
            });
        }

        if self.server_id == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "source.server_id".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

fn default_server_id() -> u32 {
    MySqlConnectionConfig::DEFAULT_SERVER_ID
}

/// Converts the configuration into client-specific connect options.
pub trait IntoConnectOptions<Output> {
    /// Options without a default database selected.
    fn without_db(&self) -> Output;

    /// Options with [`MySqlConnectionConfig::name`] selected.
    fn with_db(&self) -> Output;
}

impl IntoConnectOptions<MySqlConnectOptions> for MySqlConnectionConfig {
    fn without_db(&self) -> MySqlConnectOptions {
        let ssl_mode = if self.tls {
            MySqlSslMode::VerifyIdentity
        } else {
            MySqlSslMode::Preferred
        };

        let mut options = MySqlConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.username)
            .ssl_mode(ssl_mode)
            .charset("utf8mb4");

        if let Some(password) = &self.password {
            options = options.password(password.expose_secret());
        }

        options
    }

    fn with_db(&self) -> MySqlConnectOptions {
        let options: MySqlConnectOptions = self.without_db();
        options.database(&self.name)
    }
}
