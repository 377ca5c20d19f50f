use config::shared::{IntoConnectOptions, MySqlConnectionConfig};
use sqlx::MySqlPool;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};

/// Connects to the source database with a bounded connection pool.
pub async fn connect_to_source_database(
    config: &MySqlConnectionConfig,
    min_connections: u32,
    max_connections: u32,
) -> Result<MySqlPool, sqlx::Error> {
    let options: MySqlConnectOptions = config.with_db();

    MySqlPoolOptions::new()
        .min_connections(min_connections)
        .max_connections(max_connections)
        .connect_with(options)
        .await
}
