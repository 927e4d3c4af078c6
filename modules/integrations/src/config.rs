use std::env;

/// Application configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub worker_count: usize,
    pub pending_sweep_interval_s: u64,
    pub backorder_sweep_interval_s: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set".to_string())?;

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port: u16 = env::var("PORT")
            .unwrap_or_else(|_| "8094".to_string())
            .parse()
            .map_err(|_| "PORT must be a valid u16".to_string())?;

        let worker_count: usize = env::var("WORKER_COUNT")
            .unwrap_or_else(|_| "4".to_string())
            .parse()
            .map_err(|_| "WORKER_COUNT must be a positive integer".to_string())?;

        let pending_sweep_interval_s: u64 = env::var("PENDING_SWEEP_INTERVAL_S")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .map_err(|_| "PENDING_SWEEP_INTERVAL_S must be a positive integer".to_string())?;

        let backorder_sweep_interval_s: u64 = env::var("BACKORDER_SWEEP_INTERVAL_S")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .map_err(|_| "BACKORDER_SWEEP_INTERVAL_S must be a positive integer".to_string())?;

        Ok(Config {
            database_url,
            host,
            port,
            worker_count,
            pending_sweep_interval_s,
            backorder_sweep_interval_s,
        })
    }
}
