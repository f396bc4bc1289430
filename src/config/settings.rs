use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub upstream: UpstreamConfig,
    pub database: DatabaseConfig,
    pub http: HttpConfig,
    pub aggregation: AggregationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub websocket_base_url: String,
    pub api_base_url: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub max_streams_per_connection: usize,
    pub symbols: Vec<String>,
    pub backfill_concurrency: usize,
    pub backfill_rate_limit_per_minute: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
    pub retention_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub bind_address: String,
    pub port: u16,
    pub client_outbound_buffer: usize,
    pub client_write_deadline_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    pub computation_cache_ttl_secs: u64,
    pub default_volume_profile_buckets: usize,
    pub value_area_target_pct: f64,
    pub liquidation_cascade_window_ms: u64,
    pub liquidation_cascade_min_count: usize,
    pub liquidation_sweep_window_ms: u64,
    pub liquidation_sweep_notional_threshold: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            upstream: UpstreamConfig {
                websocket_base_url: "wss://fstream.binance.com".to_string(),
                api_base_url: "https://fapi.binance.com".to_string(),
                max_reconnect_attempts: 10,
                reconnect_delay_ms: 1000,
                max_reconnect_delay_ms: 60_000,
                max_streams_per_connection: 200,
                symbols: vec![
                    "BTCUSDT".to_string(),
                    "ETHUSDT".to_string(),
                    "SOLUSDT".to_string(),
                ],
                backfill_concurrency: 20,
                backfill_rate_limit_per_minute: 1200,
            },
            database: DatabaseConfig {
                path: "data.db".to_string(),
                retention_days: 30,
            },
            http: HttpConfig {
                bind_address: "0.0.0.0".to_string(),
                port: 8080,
                client_outbound_buffer: 256,
                client_write_deadline_secs: 10,
                heartbeat_interval_secs: 30,
                heartbeat_timeout_secs: 60,
            },
            aggregation: AggregationConfig {
                computation_cache_ttl_secs: 5,
                default_volume_profile_buckets: 50,
                value_area_target_pct: 0.70,
                liquidation_cascade_window_ms: 5_000,
                liquidation_cascade_min_count: 3,
                liquidation_sweep_window_ms: 2_000,
                liquidation_sweep_notional_threshold: 500_000.0,
            },
        }
    }
}

impl Settings {
    pub fn new() -> anyhow::Result<Self> {
        match std::fs::read_to_string("config.toml") {
            Ok(content) => {
                toml::from_str(&content).map_err(|e| anyhow::anyhow!("Config parse error: {}", e))
            }
            Err(_) => {
                let default_settings = Settings::default();
                let toml_content = toml::to_string_pretty(&default_settings)?;
                std::fs::write("config.toml", toml_content)?;
                Ok(default_settings)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_has_sane_bounds() {
        let settings = Settings::default();
        assert!(settings.upstream.max_streams_per_connection > 0);
        assert!(settings.aggregation.value_area_target_pct > 0.0);
        assert!(settings.aggregation.value_area_target_pct <= 1.0);
    }
}
