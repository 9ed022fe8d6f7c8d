use broker_core::BrokerSettings;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_host")]
    pub listen_host: String,
    #[serde(default = "default_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub auth_username: Option<String>,
    #[serde(default)]
    pub auth_password: Option<String>,
    /// Hours of release cooldown; also the encounter-accounting window.
    #[serde(default = "default_cooldown")]
    pub cooldown: i64,
    /// Hours between successive hand-outs of the same account.
    #[serde(default = "default_cooldown_reuse")]
    pub cooldown_reuse: i64,
    #[serde(default = "default_encounter_limit")]
    pub encounter_limit: i64,
    #[serde(default = "default_max_logins")]
    pub device_max_logins_per_hour: i64,
    #[serde(default = "default_max_logins")]
    pub account_max_logins_per_hour: i64,
    #[serde(default)]
    pub disable_iv: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9009
}

fn default_cooldown() -> i64 {
    24
}

fn default_cooldown_reuse() -> i64 {
    3
}

fn default_encounter_limit() -> i64 {
    6500
}

fn default_max_logins() -> i64 {
    4
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_db_path() -> String {
    "data/broker.db".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            listen_host: default_host(),
            listen_port: default_port(),
            auth_username: None,
            auth_password: None,
            cooldown: default_cooldown(),
            cooldown_reuse: default_cooldown_reuse(),
            encounter_limit: default_encounter_limit(),
            device_max_logins_per_hour: default_max_logins(),
            account_max_logins_per_hour: default_max_logins(),
            disable_iv: false,
            log_level: default_log_level(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse { source: e })?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.general.auth_username.is_some() != self.general.auth_password.is_some() {
            return Err(ConfigError::Validation(
                "auth_username and auth_password must be set together".to_string(),
            ));
        }
        if self.general.cooldown <= 0 || self.general.cooldown_reuse <= 0 {
            return Err(ConfigError::Validation(
                "cooldown and cooldown_reuse must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            cooldown_hours: self.general.cooldown,
            short_cooldown_hours: self.general.cooldown_reuse,
            encounter_limit: self.general.encounter_limit,
            device_max_logins_per_hour: self.general.device_max_logins_per_hour,
            account_max_logins_per_hour: self.general.account_max_logins_per_hour,
            disable_iv: self.general.disable_iv,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {source}")]
    Parse {
        #[source]
        source: toml::de::Error,
    },
    #[error("Config validation error: {0}")]
    Validation(String),
}
