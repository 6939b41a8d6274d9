//! Database connection configuration.

// ============================================================================
// CONNECTION CONFIGURATION
// ============================================================================

/// PostgreSQL connection configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    /// PostgreSQL host
    pub host: String,
    /// PostgreSQL port
    pub port: u16,
    /// Database name
    pub dbname: String,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
    /// Full connection string; overrides every other field when set
    pub dsn: Option<String>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "postgres".to_string(),
            user: "postgres".to_string(),
            password: "".to_string(),
            dsn: None,
        }
    }
}

impl DbConfig {
    /// Create a database configuration from environment variables.
    ///
    /// `CACHEWATCH_DSN` takes precedence over `CACHEWATCH_DB_HOST`,
    /// `CACHEWATCH_DB_PORT`, `CACHEWATCH_DB_NAME`, `CACHEWATCH_DB_USER` and
    /// `CACHEWATCH_DB_PASSWORD`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("CACHEWATCH_DB_HOST").unwrap_or(defaults.host),
            port: std::env::var("CACHEWATCH_DB_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            dbname: std::env::var("CACHEWATCH_DB_NAME").unwrap_or(defaults.dbname),
            user: std::env::var("CACHEWATCH_DB_USER").unwrap_or(defaults.user),
            password: std::env::var("CACHEWATCH_DB_PASSWORD").unwrap_or_default(),
            dsn: std::env::var("CACHEWATCH_DSN").ok().filter(|s| !s.is_empty()),
        }
    }

    pub fn with_dsn(mut self, dsn: impl Into<String>) -> Self {
        self.dsn = Some(dsn.into());
        self
    }

    /// Connection string accepted by `tokio_postgres::connect`.
    pub fn to_connection_string(&self) -> String {
        if let Some(dsn) = &self.dsn {
            return dsn.clone();
        }

        let mut parts = vec![
            format!("host={}", quote_value(&self.host)),
            format!("port={}", self.port),
            format!("dbname={}", quote_value(&self.dbname)),
            format!("user={}", quote_value(&self.user)),
        ];
        if !self.password.is_empty() {
            parts.push(format!("password={}", quote_value(&self.password)));
        }
        parts.join(" ")
    }
}

/// Quote a key/value connection-string value when it needs it.
fn quote_value(value: &str) -> String {
    if !value.is_empty() && !value.contains(|c: char| c.is_whitespace() || c == '\'' || c == '\\') {
        return value.to_string();
    }
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}
