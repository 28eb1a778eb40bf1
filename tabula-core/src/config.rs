use config::{Config, ConfigError, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct TabulaConfig {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub tables: TableLimitsConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Webhook endpoint of the external automation engine.
#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    pub webhook_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_upstream_timeout")]
    pub timeout_seconds: u64,
}

fn default_upstream_timeout() -> u64 {
    60
}

/// Row limits shared between server and client. `default_rows` is the
/// collapsed display count, `max_rows` the hard cap applied at storage time.
#[derive(Debug, Deserialize, Clone)]
pub struct TableLimitsConfig {
    pub default_rows: usize,
    pub max_rows: usize,
}

impl Default for TableLimitsConfig {
    fn default() -> Self {
        Self {
            default_rows: 30,
            max_rows: 200,
        }
    }
}

impl TableLimitsConfig {
    /// Enforces `max_rows >= default_rows` by raising `max_rows`.
    pub fn normalized(mut self) -> Self {
        if self.max_rows > 0 && self.default_rows > 0 && self.max_rows < self.default_rows {
            tracing::warn!(
                "tables.max_rows ({}) is below tables.default_rows ({}); raising it",
                self.max_rows,
                self.default_rows
            );
            self.max_rows = self.default_rows;
        }
        self
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetentionConfig {
    pub max_messages_per_session: usize,
    pub max_sessions_per_owner: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_messages_per_session: 200,
            max_sessions_per_owner: 100,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
        }
    }
}

impl TabulaConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .build()?;
        let mut cfg: TabulaConfig = s.try_deserialize()?;
        cfg.tables = cfg.tables.normalized();
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_rows_raised_to_default_rows() {
        let limits = TableLimitsConfig {
            default_rows: 50,
            max_rows: 10,
        }
        .normalized();
        assert_eq!(limits.max_rows, 50);
        assert_eq!(limits.default_rows, 50);
    }

    #[test]
    fn valid_limits_untouched() {
        let limits = TableLimitsConfig {
            default_rows: 30,
            max_rows: 200,
        }
        .normalized();
        assert_eq!(limits.default_rows, 30);
        assert_eq!(limits.max_rows, 200);
    }

    #[test]
    fn defaults_match_shared_contract() {
        let limits = TableLimitsConfig::default();
        assert_eq!(limits.default_rows, 30);
        assert_eq!(limits.max_rows, 200);
        let retention = RetentionConfig::default();
        assert_eq!(retention.max_messages_per_session, 200);
        assert_eq!(retention.max_sessions_per_owner, 100);
    }
}
