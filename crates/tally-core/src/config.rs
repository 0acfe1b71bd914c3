//! Configuration for a tally vault.
//!
//! Loaded from `.tally/config.toml` in the vault root. Every field has a
//! default, so a missing file or a partial file both work.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path};
use std::time::Duration;

use crate::parser::LineParser;
use crate::Result;
use tracing::debug;

/// Directory (relative to the vault root) holding tally's own files.
pub const CONFIG_DIR: &str = ".tally";

const MIN_SETTLE_MS: u64 = 500;
const MAX_SETTLE_MS: u64 = 2500;

/// Vault-level sync configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// How long a document must stay quiet before it is reconciled.
    /// Clamped into 500..=2500 ms.
    #[serde(default = "default_settle_window_ms")]
    pub settle_window_ms: u64,

    /// Prefix of generated block identifiers (`^t42`).
    #[serde(default = "default_id_prefix")]
    pub id_prefix: String,

    /// Use the strict line pattern.
    #[serde(default = "default_strict")]
    pub strict: bool,

    /// File extensions treated as documents.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Folder whose documents are the canonical owners of their tasks.
    #[serde(default = "default_task_file_dir")]
    pub task_file_dir: Option<String>,

    /// Directory names never scanned or watched.
    #[serde(default = "default_ignore_dirs")]
    pub ignore_dirs: Vec<String>,

    /// Only reconcile the focused document when the host reports one.
    #[serde(default = "default_focus_only")]
    pub focus_only: bool,
}

// Default value providers
fn default_settle_window_ms() -> u64 {
    1000
}

fn default_id_prefix() -> String {
    "t".to_string()
}

fn default_strict() -> bool {
    true
}

fn default_extensions() -> Vec<String> {
    vec!["md".to_string()]
}

fn default_task_file_dir() -> Option<String> {
    Some("Tasks".to_string())
}

fn default_ignore_dirs() -> Vec<String> {
    vec![
        CONFIG_DIR.to_string(),
        ".git".to_string(),
        ".obsidian".to_string(),
        ".trash".to_string(),
    ]
}

fn default_focus_only() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            settle_window_ms: default_settle_window_ms(),
            id_prefix: default_id_prefix(),
            strict: default_strict(),
            extensions: default_extensions(),
            task_file_dir: default_task_file_dir(),
            ignore_dirs: default_ignore_dirs(),
            focus_only: default_focus_only(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from `.tally/config.toml` or use defaults
    pub fn load_or_default(vault_root: &Path) -> Result<Self> {
        let config_path = vault_root.join(CONFIG_DIR).join("config.toml");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Self = toml::from_str(&content).map_err(|e| {
                crate::Error::Config(format!("Failed to parse {}: {}", config_path.display(), e))
            })?;
            config.validate()?;
            debug!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            debug!("No config at {}, using defaults", config_path.display());
            Ok(Self::default())
        }
    }

    /// Write default configuration to `.tally/config.toml`
    pub fn write_default(vault_root: &Path) -> Result<()> {
        let config_dir = vault_root.join(CONFIG_DIR);
        std::fs::create_dir_all(&config_dir)?;

        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(config_dir.join("config.toml"), content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.id_prefix.is_empty()
            || !self
                .id_prefix
                .chars()
                .all(|c| c.is_ascii_alphabetic() || c == '-')
        {
            return Err(crate::Error::Config(format!(
                "id_prefix must be non-empty and alphabetic (got {:?})",
                self.id_prefix
            )));
        }
        if self.extensions.is_empty() {
            return Err(crate::Error::Config(
                "at least one document extension is required".to_string(),
            ));
        }
        Ok(())
    }

    /// Settle window, clamped into the supported range.
    pub fn settle_window(&self) -> Duration {
        Duration::from_millis(self.settle_window_ms.clamp(MIN_SETTLE_MS, MAX_SETTLE_MS))
    }

    pub fn parser(&self) -> LineParser {
        LineParser::new(self.strict)
    }

    /// True if a vault-relative path names a document tally should track.
    pub fn is_tracked(&self, path: &Path) -> bool {
        let has_extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
            .unwrap_or(false);

        has_extension
            && !path.components().any(|c| match c {
                Component::Normal(name) => self
                    .ignore_dirs
                    .iter()
                    .any(|d| name.to_str() == Some(d.as_str())),
                _ => false,
            })
    }

    /// True if a vault-relative path lies inside the canonical task folder.
    pub fn is_task_file(&self, path: &Path) -> bool {
        self.task_file_dir
            .as_deref()
            .map(|dir| path.starts_with(dir))
            .unwrap_or(false)
    }
}
