use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::converter::{DEFAULT_PANDOC, DEFAULT_PANDOC_TARGET};
use crate::identity::DEFAULT_EMAIL;
use crate::replay::DEFAULT_LAYOUT;
use crate::route::DEFAULT_IGNORE_PREFIXES;
use crate::scm::DEFAULT_GIT;
use crate::store::DEFAULT_CHECKPOINT_INTERVAL;

pub const CONFIG_FILENAME: &str = "wikihistory.toml";
pub const DEFAULT_PREFIX: &str = "wiki/";
pub const DEFAULT_MEDIAWIKI_EXT: &str = "mediawiki";
pub const DEFAULT_MARKDOWN_EXT: &str = "md";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct HistoryConfig {
    #[serde(default)]
    pub replay: ReplaySection,
    #[serde(default)]
    pub tools: ToolsSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ReplaySection {
    pub prefix: Option<String>,
    pub mediawiki_ext: Option<String>,
    pub markdown_ext: Option<String>,
    pub default_email: Option<String>,
    pub default_layout: Option<String>,
    pub ignore_prefixes: Option<Vec<String>>,
    pub usernames: Option<PathBuf>,
    pub blocklist: Option<PathBuf>,
    pub checkpoint_interval: Option<usize>,
    pub convert: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ToolsSection {
    pub git: Option<String>,
    pub pandoc: Option<String>,
    pub pandoc_target: Option<String>,
}

impl HistoryConfig {
    /// Output prefix: env WIKIHISTORY_PREFIX > config > DEFAULT_PREFIX.
    pub fn prefix(&self) -> String {
        env_or("WIKIHISTORY_PREFIX", self.replay.prefix.as_deref(), DEFAULT_PREFIX)
    }

    /// Fallback contact: env WIKIHISTORY_DEFAULT_EMAIL > config > DEFAULT_EMAIL.
    pub fn default_email(&self) -> String {
        env_or(
            "WIKIHISTORY_DEFAULT_EMAIL",
            self.replay.default_email.as_deref(),
            DEFAULT_EMAIL,
        )
    }

    pub fn git(&self) -> String {
        env_or("WIKIHISTORY_GIT", self.tools.git.as_deref(), DEFAULT_GIT)
    }

    pub fn pandoc(&self) -> String {
        env_or("WIKIHISTORY_PANDOC", self.tools.pandoc.as_deref(), DEFAULT_PANDOC)
    }

    pub fn pandoc_target(&self) -> &str {
        self.tools
            .pandoc_target
            .as_deref()
            .unwrap_or(DEFAULT_PANDOC_TARGET)
    }

    pub fn mediawiki_ext(&self) -> &str {
        self.replay
            .mediawiki_ext
            .as_deref()
            .unwrap_or(DEFAULT_MEDIAWIKI_EXT)
    }

    pub fn markdown_ext(&self) -> &str {
        self.replay
            .markdown_ext
            .as_deref()
            .unwrap_or(DEFAULT_MARKDOWN_EXT)
    }

    /// An empty string in the config disables the layout entry.
    pub fn default_layout(&self) -> Option<String> {
        match self.replay.default_layout.as_deref() {
            Some("") => None,
            Some(layout) => Some(layout.to_string()),
            None => Some(DEFAULT_LAYOUT.to_string()),
        }
    }

    pub fn ignore_prefixes(&self) -> Vec<String> {
        match &self.replay.ignore_prefixes {
            Some(prefixes) => prefixes.clone(),
            None => DEFAULT_IGNORE_PREFIXES
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }

    pub fn checkpoint_interval(&self) -> usize {
        self.replay
            .checkpoint_interval
            .filter(|interval| *interval > 0)
            .unwrap_or(DEFAULT_CHECKPOINT_INTERVAL)
    }

    pub fn convert(&self) -> bool {
        self.replay.convert.unwrap_or(true)
    }

    /// Relative table paths in the config resolve against the repository root.
    pub fn usernames_path(&self, repo_root: &Path) -> Option<PathBuf> {
        self.replay
            .usernames
            .as_deref()
            .map(|path| absolutize(path, repo_root))
    }

    pub fn blocklist_path(&self, repo_root: &Path) -> Option<PathBuf> {
        self.replay
            .blocklist
            .as_deref()
            .map(|path| absolutize(path, repo_root))
    }
}

/// Load and parse a HistoryConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<HistoryConfig> {
    if !config_path.exists() {
        return Ok(HistoryConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: HistoryConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn env_or(key: &str, configured: Option<&str>, default: &str) -> String {
    if let Ok(value) = env::var(key) {
        let trimmed = value.trim().to_string();
        if !trimmed.is_empty() {
            return trimmed;
        }
    }
    configured.unwrap_or(default).to_string()
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
