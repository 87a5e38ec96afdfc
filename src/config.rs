//! Environment-driven configuration.

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub log_filter: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path = std::env::var("SETTLEMENT_DB_PATH")
            .unwrap_or_else(|_| "./joint_settlement.db".to_string());

        let log_filter =
            std::env::var("RUST_LOG").unwrap_or_else(|_| "joint_settlement=info".to_string());

        Ok(Self {
            database_path,
            log_filter,
        })
    }
}
