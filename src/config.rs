// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Configuration persistence for kubemirror
//!
//! Stores user preferences like the last used cluster context. All
//! kubemirror data lives under ~/.kubemirror/:
//! - ~/.kubemirror/config.json - user configuration
//! - ~/.kubemirror/log/ - rotated log files

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::sync::DEFAULT_PAGE_SIZE;

/// Get the base kubemirror directory (~/.kubemirror/)
pub fn base_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|p| p.join(".kubemirror"))
        .context("Could not determine home directory")
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

/// kubemirror configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Context selected on the last run (reconnected to by default)
    #[serde(default)]
    pub last_context: Option<String>,
    /// List page size for every reflector
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            last_context: None,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Atomically write content to a file using tempfile + rename
///
/// Other processes see either the old or the new content, never a partial
/// write.
fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    use tempfile::NamedTempFile;

    let temp_file = NamedTempFile::new_in(path.parent().unwrap_or_else(|| Path::new(".")))
        .context("Failed to create temp file")?;

    fs::write(temp_file.path(), content)
        .with_context(|| format!("Failed to write temp file {:?}", temp_file.path()))?;

    temp_file
        .persist(path)
        .with_context(|| format!("Failed to persist file to {:?}", path))?;

    Ok(())
}

impl Config {
    /// Load config from disk, or return default if not found
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save config to disk
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        atomic_write(path, content.as_bytes())
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Get the config file path (~/.kubemirror/config.json)
    pub fn config_path() -> Result<PathBuf> {
        Ok(base_dir()?.join("config.json"))
    }

    /// Remember the context of a successful connect
    pub fn set_last_context(&mut self, context: &str) -> Result<()> {
        self.last_context = Some(context.to_string());
        self.save()
    }
}
