use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::assistant::AssistantConfig;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Two equivalent ways to configure:
//
//   config.toml:     [assistant]
//                    enabled = true
//
//   env var:         SHOAL_ASSISTANT__ENABLED=true   (double underscore = nesting)
//
//   (single underscore stays within field names: SHOAL_ASSISTANT__DAILY_LIMIT)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub assistant: AssistantFileConfig,
}

/// Server tuning knobs (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            outbox_capacity: default_outbox_capacity(),
        }
    }
}

/// Automated-reply tunables (lives under `[assistant]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssistantFileConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Base URL of the text-generation service.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Identity the automated replies are sent as.
    #[serde(default = "default_identity")]
    pub identity: String,
    #[serde(default = "default_prompt_ceiling")]
    pub prompt_ceiling: usize,
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AssistantFileConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: None,
            identity: default_identity(),
            prompt_ceiling: default_prompt_ceiling(),
            daily_limit: default_daily_limit(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_outbox_capacity() -> usize {
    100
}
fn default_identity() -> String {
    "assistant".to_string()
}
fn default_prompt_ceiling() -> usize {
    1000
}
fn default_daily_limit() -> u64 {
    20
}
fn default_timeout_secs() -> u64 {
    30
}

impl AssistantFileConfig {
    pub fn to_runtime(&self) -> AssistantConfig {
        AssistantConfig {
            identity: self.identity.clone(),
            prompt_ceiling: self.prompt_ceiling,
            daily_limit: self.daily_limit,
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

/// Build a figment that layers: defaults → config.toml → SHOAL_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `SHOAL_ASSISTANT__ENABLED=true`  →  `assistant.enabled = true`
///   `SHOAL_SERVER__PORT=4000`        →  `server.port = 4000`
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join("config.toml")))
        .merge(Env::prefixed("SHOAL_").split("__"))
}
