//! Configuration file management for weft.
//!
//! Provides a TOML-based config file at `~/.config/weft/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use weft_core::gc::GcConfig;
use weft_core::notify::NotifyConfig;
use weft_core::queue::QueuePoolConfig;
use weft_core::runtime::RuntimeConfig;
use weft_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    pub node: NodeSection,
    #[serde(default)]
    pub api: ApiSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NodeSection {
    pub name: String,
    /// Directory for task log capture files.
    pub logs_dir: String,
    /// Keep task log files on disk after gathering them.
    #[serde(default)]
    pub logs_keep: bool,
    /// Remote execution agent binary, if any.
    #[serde(default)]
    pub agent_path: Option<String>,
    /// Directory holding notification plugin binaries.
    #[serde(default)]
    pub plugins_dir: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiSection {
    pub bind: String,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5000".to_owned(),
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the weft config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/weft` or `~/.config/weft`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("weft");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("weft")
}

/// Return the path to the weft config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct WeftConfig {
    pub db_config: DbConfig,
    pub node_name: String,
    pub logs_dir: PathBuf,
    pub logs_keep: bool,
    pub agent_path: Option<String>,
    pub plugins_dir: Option<PathBuf>,
    pub api_bind: String,
}

impl WeftConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default.
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("WEFT_DATABASE_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };

        let node_name = std::env::var("WEFT_NODE_NAME")
            .ok()
            .or_else(|| file_config.as_ref().map(|c| c.node.name.clone()))
            .unwrap_or_else(|| "localhost".to_owned());

        let logs_dir = file_config
            .as_ref()
            .map(|c| PathBuf::from(&c.node.logs_dir))
            .unwrap_or_else(|| std::env::temp_dir().join("weft-logs"));

        Ok(Self {
            db_config: DbConfig::new(db_url),
            node_name,
            logs_keep: file_config.as_ref().map(|c| c.node.logs_keep).unwrap_or(false),
            agent_path: file_config.as_ref().and_then(|c| c.node.agent_path.clone()),
            plugins_dir: file_config
                .as_ref()
                .and_then(|c| c.node.plugins_dir.as_ref().map(PathBuf::from)),
            api_bind: file_config
                .as_ref()
                .map(|c| c.api.bind.clone())
                .unwrap_or_else(|| ApiSection::default().bind),
            logs_dir,
        })
    }

    /// Build the node runtime configuration for `serve`.
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            node_name: self.node_name.clone(),
            logs_dir: self.logs_dir.clone(),
            logs_delete: !self.logs_keep,
            agent_path: self.agent_path.clone(),
            queue_pool: QueuePoolConfig::default(),
            notify: self.plugins_dir.as_ref().map(|dir| NotifyConfig {
                plugins_dir: dir.clone(),
                timeout: Duration::from_secs(30),
                node_name: self.node_name.clone(),
            }),
            gc: GcConfig::default(),
            shutdown_grace: Duration::from_secs(30),
            run_scheduler: true,
        }
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trip() {
        let original = ConfigFile {
            database: DatabaseSection {
                url: "postgresql://testhost:5432/testdb".to_string(),
            },
            node: NodeSection {
                name: "node-1".to_string(),
                logs_dir: "/var/log/weft".to_string(),
                logs_keep: true,
                agent_path: None,
                plugins_dir: Some("/usr/lib/weft/plugins".to_string()),
            },
            api: ApiSection::default(),
        };

        let text = toml::to_string_pretty(&original).unwrap();
        let loaded: ConfigFile = toml::from_str(&text).unwrap();

        assert_eq!(loaded.database.url, original.database.url);
        assert_eq!(loaded.node.name, "node-1");
        assert!(loaded.node.logs_keep);
        assert_eq!(loaded.api.bind, "127.0.0.1:5000");
    }

    #[test]
    fn api_section_is_optional() {
        let text = "[database]\nurl = \"postgresql://h/db\"\n[node]\nname = \"n\"\nlogs_dir = \"/tmp\"\n";
        let loaded: ConfigFile = toml::from_str(text).unwrap();
        assert_eq!(loaded.api.bind, "127.0.0.1:5000");
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("weft/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }
}
