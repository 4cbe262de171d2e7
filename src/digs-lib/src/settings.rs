use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{DigsError, DigsResult};

pub const SETTINGS_FILE_NAME: &str = "client.json";

/// User-scoped state kept between runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub main_node: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub main_node_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub backup_node: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub backup_node_path: Option<String>,
    //comma separated node names, most preferred first
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub node_prefs: Option<String>,
}

impl LocalSettings {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("digs")
            .join(SETTINGS_FILE_NAME)
    }

    /// A missing file yields empty settings.
    pub async fn load(path: &Path) -> DigsResult<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                let settings = serde_json::from_str::<LocalSettings>(&content).map_err(|e| {
                    DigsError::Config(format!(
                        "parse settings {} failed: {}",
                        path.display(),
                        e
                    ))
                })?;
                debug!("settings {} loaded", path.display());
                Ok(settings)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("settings {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(DigsError::Io(format!(
                "read settings {} failed: {}",
                path.display(),
                e
            ))),
        }
    }

    pub async fn save(&self, path: &Path) -> DigsResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| DigsError::Config(format!("serialize settings failed: {}", e)))?;
        tokio::fs::write(path, content).await.map_err(|e| {
            DigsError::Io(format!("write settings {} failed: {}", path.display(), e))
        })?;
        Ok(())
    }

    pub fn preference_list(&self) -> Option<Vec<String>> {
        self.node_prefs.as_deref().map(decode_preference_list)
    }

    pub fn set_preference_list(&mut self, prefs: &[String]) {
        self.node_prefs = Some(encode_preference_list(prefs));
    }
}

pub fn encode_preference_list(prefs: &[String]) -> String {
    prefs.join(",")
}

pub fn decode_preference_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}
