use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub endpoints: Endpoints,
    #[serde(default)]
    pub sampler: SamplerConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Endpoints {
    #[serde(default = "default_model_service_url")]
    pub model_service_url: String,
    #[serde(default = "default_node_exporter_url")]
    pub node_exporter_url: String,
    #[serde(default = "default_node_name")]
    pub node_name: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SamplerConfig {
    #[serde(default = "default_sampler_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    #[serde(default = "default_proxy_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            endpoints: Endpoints::default(),
            sampler: SamplerConfig::default(),
            health: HealthConfig::default(),
            proxy: ProxyConfig::default(),
        }
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            model_service_url: default_model_service_url(),
            node_exporter_url: default_node_exporter_url(),
            node_name: default_node_name(),
            api_base_url: default_api_base_url(),
        }
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sampler_interval_secs(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval_secs(),
            timeout_ms: default_health_timeout_ms(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_proxy_timeout_ms(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let mut cfg = match fs::read_to_string(path_ref) {
            Ok(text) => Self::from_yaml(&text).map_err(|source| ConfigError::Parse {
                path: path_display,
                source,
            })?,
            Err(err) if err.kind() == ErrorKind::NotFound => Config::default(),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path_display,
                    source,
                })
            }
        };

        cfg.apply_env_overrides(|name| std::env::var(name).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let read = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(v) = read("MODEL_SERVICE_URL") {
            self.endpoints.model_service_url = v.trim().to_string();
        }
        if let Some(v) = read("NODE_EXPORTER_URL") {
            self.endpoints.node_exporter_url = v.trim().to_string();
        }
        if let Some(v) = read("NODE_NAME") {
            self.endpoints.node_name = v.trim().to_string();
        }
        if let Some(v) = read("API_BASE_URL") {
            self.endpoints.api_base_url = v.trim().to_string();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation(
                "поле listen обязательно".to_string(),
            ));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "поле listen должно быть корректным адресом host:port".to_string(),
            ));
        }
        if self.sampler.interval_secs < 1 {
            return Err(ConfigError::Validation(
                "sampler.interval_secs должно быть >= 1".to_string(),
            ));
        }
        if self.sampler.fetch_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "sampler.fetch_timeout_ms должен быть > 0".to_string(),
            ));
        }
        if self.health.interval_secs < 1 {
            return Err(ConfigError::Validation(
                "health.interval_secs должно быть >= 1".to_string(),
            ));
        }
        if self.health.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "health.timeout_ms должен быть > 0".to_string(),
            ));
        }
        if self.proxy.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "proxy.timeout_ms должен быть > 0".to_string(),
            ));
        }

        validate_endpoints(&self.endpoints)
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_endpoints(endpoints: &Endpoints) -> Result<(), ConfigError> {
    let urls = [
        ("endpoints.model_service_url", &endpoints.model_service_url),
        ("endpoints.node_exporter_url", &endpoints.node_exporter_url),
        ("endpoints.api_base_url", &endpoints.api_base_url),
    ];
    for (field, value) in urls {
        if Url::parse(value).is_err() {
            return Err(ConfigError::Validation(format!(
                "{field} должен быть корректным URL, получено '{value}'"
            )));
        }
    }
    if endpoints.node_name.trim().is_empty() {
        return Err(ConfigError::Validation(
            "endpoints.node_name не должен быть пустым".to_string(),
        ));
    }
    Ok(())
}

fn default_listen() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_model_service_url() -> String {
    "http://localhost:19000".to_string()
}

fn default_node_exporter_url() -> String {
    "http://localhost:9100".to_string()
}

fn default_node_name() -> String {
    "unknown-node".to_string()
}

fn default_api_base_url() -> String {
    "http://localhost:8080".to_string()
}

const fn default_sampler_interval_secs() -> u64 {
    5
}

const fn default_fetch_timeout_ms() -> u64 {
    8000
}

const fn default_health_interval_secs() -> u64 {
    10
}

const fn default_health_timeout_ms() -> u64 {
    5000
}

const fn default_proxy_timeout_ms() -> u64 {
    30000
}
