use clickhouse::Client;

use crate::utils::config::ClickhouseConfig;
use crate::utils::error::Result;

pub mod checkpoints;
pub mod sink;

/// Builds the ClickHouse client and checks the server is reachable.
pub async fn init_clickhouse(config: &ClickhouseConfig) -> Result<Client> {
    let client = Client::default()
        .with_url(&config.url)
        .with_database(&config.database)
        .with_user(&config.username)
        .with_password(&config.password);

    client.query("SELECT 1").execute().await?;

    tracing::info!(database = %config.database, "ClickHouse connection established");
    Ok(client)
}
