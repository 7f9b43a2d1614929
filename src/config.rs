use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::integrations::IntegrationDescriptor;
use crate::mqtt::MqttConfig;
use crate::persistence::DEFAULT_STATE_PATH;

const CONFIG_FILE: &str = ".config/homeline/config.toml";

/// Contents of `config.toml`
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub device_id: String,
    pub debug: bool,
    pub state_path: String,
    pub mqtt: MqttConfig,
    pub integrations: Vec<IntegrationDescriptor>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device_id: "homeline".to_string(),
            debug: false,
            state_path: DEFAULT_STATE_PATH.to_string(),
            mqtt: MqttConfig::default(),
            integrations: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn default_path() -> PathBuf {
        let mut path = get_home_dir();
        path.push(CONFIG_FILE);
        path
    }

    /// Reads the config file. `None` if there is no file, an error if
    /// it does not parse.
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        if !tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
        {
            return Ok(None);
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;
        Ok(Some(config))
    }
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}
