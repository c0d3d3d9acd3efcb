use serde::Deserialize;
use ws_orchestrator::{ControllerConfig, TrackerConfig};

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_domain")]
    pub domain: String,

    #[serde(default = "default_system_namespace")]
    pub system_namespace: String,

    #[serde(default = "default_tls_secret")]
    pub tls_secret: String,

    #[serde(default = "default_storage_class")]
    pub storage_class: String,

    #[serde(default = "default_storage_size")]
    pub storage_size: String,

    #[serde(default = "default_image")]
    pub default_image: String,

    #[serde(default = "default_exposer_image")]
    pub exposer_image: String,

    #[serde(default = "default_image_registry")]
    pub image_registry: String,

    #[serde(default = "default_idle_threshold_hours")]
    pub idle_threshold_hours: f64,

    #[serde(default = "default_tracker_interval")]
    pub tracker_interval_secs: u64,

    /// Bearer token required on workspace routes when set.
    #[serde(default = "default_api_token")]
    pub api_token: Option<String>,
}

fn default_bind_addr() -> String {
    env_or("WS_API_BIND", "0.0.0.0:3121")
}

fn default_domain() -> String {
    env_or("WS_DOMAIN", "")
}

fn default_system_namespace() -> String {
    env_or(
        "WS_SYSTEM_NAMESPACE",
        &ControllerConfig::default().system_namespace,
    )
}

fn default_tls_secret() -> String {
    env_or("WS_TLS_SECRET", &ControllerConfig::default().tls_secret)
}

fn default_storage_class() -> String {
    env_or("WS_STORAGE_CLASS", &ControllerConfig::default().storage_class)
}

fn default_storage_size() -> String {
    env_or("WS_STORAGE_SIZE", &ControllerConfig::default().storage_size)
}

fn default_image() -> String {
    env_or("WS_DEFAULT_IMAGE", &ControllerConfig::default().default_image)
}

fn default_exposer_image() -> String {
    env_or("WS_EXPOSER_IMAGE", &ControllerConfig::default().exposer_image)
}

fn default_image_registry() -> String {
    env_or(
        "WS_IMAGE_REGISTRY",
        &ControllerConfig::default().image_registry,
    )
}

fn default_idle_threshold_hours() -> f64 {
    env_parse("WS_IDLE_THRESHOLD_HOURS", 24.0)
}

fn default_tracker_interval() -> u64 {
    env_parse("WS_TRACKER_INTERVAL", 120u64).max(1) // 2 minutes
}

fn default_api_token() -> Option<String> {
    std::env::var("WS_API_TOKEN")
        .ok()
        .filter(|t| !t.trim().is_empty())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            domain: default_domain(),
            system_namespace: default_system_namespace(),
            tls_secret: default_tls_secret(),
            storage_class: default_storage_class(),
            storage_size: default_storage_size(),
            default_image: default_image(),
            exposer_image: default_exposer_image(),
            image_registry: default_image_registry(),
            idle_threshold_hours: default_idle_threshold_hours(),
            tracker_interval_secs: default_tracker_interval(),
            api_token: default_api_token(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            domain: self.domain.clone(),
            system_namespace: self.system_namespace.clone(),
            tls_secret: self.tls_secret.clone(),
            storage_class: self.storage_class.clone(),
            storage_size: self.storage_size.clone(),
            default_image: self.default_image.clone(),
            exposer_image: self.exposer_image.clone(),
            image_registry: self.image_registry.clone(),
            ..ControllerConfig::default()
        }
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            threshold_hours: self.idle_threshold_hours,
            ..TrackerConfig::default()
        }
    }
}
