use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::kite::types::TokenCache;
use crate::model::Interval;
use crate::retry::RetryConfig;

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub kite: KiteConfig,
    pub extract: ExtractConfig,
    pub retry: RetryConfig,
    pub output: OutputConfig,
    pub database: DatabaseConfig,
    pub telegram: TelegramConfig,
    pub notifier: NotifierConfig,
    pub options: OptionsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KiteConfig {
    pub base_url: String,
    pub exchange: String,
    pub token_cache_path: PathBuf,
    pub request_timeout_secs: u64,
    pub chunk_pause_ms: u64,
    #[serde(skip)]
    pub api_key: String,
    #[serde(skip)]
    pub access_token: String,
}

impl Default for KiteConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.kite.trade".to_string(),
            exchange: "NSE".to_string(),
            token_cache_path: PathBuf::from("kite_token.json"),
            request_timeout_secs: 30,
            chunk_pause_ms: 500,
            api_key: String::new(),
            access_token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SinkMode {
    File,
    Database,
    Both,
}

impl SinkMode {
    pub fn wants_file(self) -> bool {
        matches!(self, Self::File | Self::Both)
    }

    pub fn wants_database(self) -> bool {
        matches!(self, Self::Database | Self::Both)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    pub symbols: Vec<String>,
    pub days: u32,
    pub interval: Interval,
    pub sink: SinkMode,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["NIFTY 50".to_string()],
            days: 30,
            interval: Interval::Minute5,
            sink: SinkMode::File,
        }
    }
}

impl ExtractConfig {
    /// Upper-cased, de-duplicated, non-empty symbols in input order.
    pub fn tradable_symbols(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for sym in &self.symbols {
            let s = sym.trim().to_ascii_uppercase();
            if !s.is_empty() && !out.iter().any(|v| v == &s) {
                out.push(s);
            }
        }
        out
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("kite_data_output"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    Postgres,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub sqlite_path: PathBuf,
    pub host: Option<String>,
    pub port: u16,
    pub name: Option<String>,
    pub user: Option<String>,
    pub schema: String,
    #[serde(skip)]
    pub password: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseBackend::Postgres,
            sqlite_path: PathBuf::from("data/market_data.sqlite"),
            host: None,
            port: 5432,
            name: None,
            user: None,
            schema: "public".to_string(),
            password: None,
        }
    }
}

impl DatabaseConfig {
    /// libpq-style connection string for the `postgres` crate.
    pub fn postgres_params(&self) -> Result<String> {
        let host = self.host.as_deref().context("DB_HOST not set")?;
        let name = self.name.as_deref().context("DB_NAME not set")?;
        let user = self.user.as_deref().context("DB_USER not set")?;
        let mut params = format!(
            "host={} port={} dbname={} user={}",
            quote_param(host),
            self.port,
            quote_param(name),
            quote_param(user)
        );
        if let Some(password) = self.password.as_deref() {
            params.push_str(&format!(" password={}", quote_param(password)));
        }
        Ok(params)
    }
}

fn quote_param(v: &str) -> String {
    if !v.is_empty() && !v.contains([' ', '\'', '\\']) {
        return v.to_string();
    }
    format!("'{}'", v.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub enabled: bool,
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    #[serde(skip)]
    pub bot_token: Option<String>,
    #[serde(skip)]
    pub chat_id: Option<String>,
    #[serde(skip)]
    pub broadcast_ids: Vec<String>,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_base_url: "https://api.telegram.org".to_string(),
            request_timeout_secs: 10,
            bot_token: None,
            chat_id: None,
            broadcast_ids: Vec::new(),
        }
    }
}

impl TelegramConfig {
    /// Primary chat first, then broadcast ids, without duplicates.
    pub fn chat_ids(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for id in self.chat_id.iter().chain(self.broadcast_ids.iter()) {
            let id = id.trim();
            if !id.is_empty() && !out.iter().any(|v| v == id) {
                out.push(id.to_string());
            }
        }
        out
    }
}

/// Point thresholds for the movement label in summaries.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub strong_move_points: f64,
    pub flat_move_points: f64,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            strong_move_points: 50.0,
            flat_move_points: 25.0,
        }
    }
}

/// Option-chain snapshot settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OptionsConfig {
    /// `name` column of the derivatives dump, e.g. "NIFTY".
    pub underlying: String,
    /// Quote key for the spot price.
    pub spot_instrument: String,
    pub exchange: String,
    pub strike_step: u32,
    /// Strikes taken on each side of the at-the-money strike.
    pub strikes_each_side: u32,
    /// Snapshot timestamps are floored to this many minutes.
    pub bucket_minutes: u32,
    pub table: String,
}

impl Default for OptionsConfig {
    fn default() -> Self {
        Self {
            underlying: "NIFTY".to_string(),
            spot_instrument: "NSE:NIFTY 50".to_string(),
            exchange: "NFO".to_string(),
            strike_step: 50,
            strikes_each_side: 2,
            bucket_minutes: 5,
            table: "nifty_options_5m".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).context("failed to parse config TOML")?;
        Ok(config)
    }

    /// Load `.env`, the TOML file if it exists, then environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = if path.exists() {
            let config_str = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Self::from_toml_str(&config_str)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Config::default()
        };

        config.apply_env_with(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Fill secrets and overrides from an environment lookup.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| non_empty(lookup(key));

        self.kite.api_key =
            get("KITE_API_KEY").context("KITE_API_KEY not set in .env or environment")?;
        self.kite.access_token = match get("KITE_ACCESS_TOKEN") {
            Some(token) => token,
            None => read_token_cache(&self.kite.token_cache_path).with_context(|| {
                format!(
                    "KITE_ACCESS_TOKEN not set and no usable token cache at {}",
                    self.kite.token_cache_path.display()
                )
            })?,
        };

        if let Some(dir) = get("OUTPUT_DIR") {
            self.output.dir = PathBuf::from(dir);
        }

        if let Some(host) = get("DB_HOST") {
            self.database.host = Some(host);
        }
        if let Some(port) = get("DB_PORT") {
            self.database.port = port
                .parse()
                .with_context(|| format!("DB_PORT '{}' is not a port number", port))?;
        }
        if let Some(name) = get("DB_NAME") {
            self.database.name = Some(name);
        }
        if let Some(user) = get("DB_USER") {
            self.database.user = Some(user);
        }
        if let Some(password) = get("DB_PASSWORD") {
            self.database.password = Some(password);
        }
        if let Some(schema) = get("DB_SCHEMA") {
            self.database.schema = schema;
        }

        self.telegram.bot_token = get("TELEGRAM_BOT_TOKEN");
        self.telegram.chat_id = get("TELEGRAM_CHAT_ID");
        if let Some(ids) = get("TELEGRAM_BROADCAST_IDS") {
            self.telegram.broadcast_ids = ids
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.kite.base_url)
            .with_context(|| format!("kite.base_url '{}' is not a URL", self.kite.base_url))?;
        url::Url::parse(&self.telegram.api_base_url).with_context(|| {
            format!(
                "telegram.api_base_url '{}' is not a URL",
                self.telegram.api_base_url
            )
        })?;
        if self.extract.days == 0 {
            bail!("extract.days must be > 0");
        }
        if self.extract.days > self.extract.interval.max_days() {
            bail!(
                "extract.days {} exceeds the {}-day limit for {}",
                self.extract.days,
                self.extract.interval.max_days(),
                self.extract.interval
            );
        }
        if !is_sql_identifier(&self.options.table) {
            bail!(
                "options.table '{}' must be alphanumeric/underscore",
                self.options.table
            );
        }
        if self.options.strike_step == 0 || self.options.bucket_minutes == 0 {
            bail!("options.strike_step and options.bucket_minutes must be > 0");
        }
        if !is_sql_identifier(&self.database.schema) {
            bail!(
                "database.schema '{}' must be alphanumeric/underscore",
                self.database.schema
            );
        }
        Ok(())
    }
}

pub fn is_sql_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !s.starts_with(|c: char| c.is_ascii_digit())
}

pub fn read_token_cache(path: &Path) -> Result<String> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let cache: TokenCache = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    match non_empty(Some(cache.access_token)) {
        Some(token) => Ok(token),
        None => bail!("{} holds an empty access_token", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_default_toml() {
        let toml_str = r#"
[kite]
base_url = "https://api.kite.trade"
exchange = "BSE"
chunk_pause_ms = 250

[extract]
symbols = ["NIFTY 50", "reliance", "RELIANCE", " "]
days = 60
interval = "15minute"
sink = "both"

[retry]
max_retries = 5
base_delay_ms = 100
retry_on = ["network", "rate_limited"]

[database]
backend = "sqlite"
sqlite_path = "data/test.sqlite"

[logging]
level = "debug"
format = "json"
"#;
        let config = Config::from_toml_str(toml_str).unwrap();
        assert_eq!(config.kite.exchange, "BSE");
        assert_eq!(config.kite.chunk_pause_ms, 250);
        assert_eq!(config.kite.request_timeout_secs, 30);
        assert_eq!(config.extract.interval, Interval::Minute15);
        assert_eq!(config.extract.sink, SinkMode::Both);
        assert_eq!(
            config.extract.tradable_symbols(),
            vec!["NIFTY 50".to_string(), "RELIANCE".to_string()]
        );
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.retry_on.len(), 2);
        assert_eq!(config.database.backend, DatabaseBackend::Sqlite);
        assert_eq!(config.database.schema, "public");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!((config.notifier.strong_move_points - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.extract.days, 30);
        assert_eq!(config.extract.interval, Interval::Minute5);
        assert_eq!(config.output.dir, PathBuf::from("kite_data_output"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_bad_interval() {
        assert!(Config::from_toml_str("[extract]\ninterval = \"2minute\"\n").is_err());
    }

    #[test]
    fn validate_caps_days_per_interval() {
        let mut config = Config::default();
        config.extract.interval = Interval::Minute;
        config.extract.days = 61;
        assert!(config.validate().is_err());
        config.extract.days = 60;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn postgres_params_quote_values() {
        let db = DatabaseConfig {
            host: Some("localhost".to_string()),
            name: Some("market".to_string()),
            user: Some("me".to_string()),
            password: Some("p ss'word".to_string()),
            ..DatabaseConfig::default()
        };
        assert_eq!(
            db.postgres_params().unwrap(),
            "host=localhost port=5432 dbname=market user=me password='p ss\\'word'"
        );
        assert!(DatabaseConfig::default().postgres_params().is_err());
    }

    #[test]
    fn options_section_overrides_and_validates() {
        let config = Config::from_toml_str(
            "[options]\nunderlying = \"BANKNIFTY\"\nstrike_step = 100\ntable = \"banknifty_options_5m\"\n",
        )
        .unwrap();
        assert_eq!(config.options.underlying, "BANKNIFTY");
        assert_eq!(config.options.strike_step, 100);
        assert_eq!(config.options.strikes_each_side, 2);
        assert!(config.validate().is_ok());

        let mut bad = Config::default();
        bad.options.table = "options; drop".to_string();
        assert!(bad.validate().is_err());
        bad.options.table = "nifty_options_5m".to_string();
        bad.options.strike_step = 0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn sql_identifier_check() {
        assert!(is_sql_identifier("public"));
        assert!(is_sql_identifier("market_data"));
        assert!(!is_sql_identifier("1abc"));
        assert!(!is_sql_identifier("a;drop"));
        assert!(!is_sql_identifier(""));
    }
}
