// Copyright (C) 2024 SentryShot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! System configuration (§6 "System config (TOML)").
//!
//! Loaded from a TOML file, default `./configs/sentryshot.toml`, per the
//! `serde`/`toml` pattern used throughout the NVR example pack.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{wrap, Error, ErrorInt};

pub const DEFAULT_CONFIG_PATH: &str = "./configs/sentryshot.toml";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    pub storage_dir: PathBuf,
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
    pub max_disk_usage_gib: u64,
}

fn default_port() -> u16 {
    2020
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("./configs")
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Config, Error> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            wrap!(ErrorInt::ConfigInvalid {
                description: format!("cannot read {}: {e}", path.display()),
            })
        })?;
        let config: Config = toml::from_str(&content).map_err(|e| {
            wrap!(ErrorInt::ConfigInvalid {
                description: format!("invalid TOML in {}: {e}", path.display()),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.max_disk_usage_gib == 0 {
            return Err(wrap!(ErrorInt::ConfigInvalid {
                description: "max_disk_usage must be > 0".to_string(),
            }));
        }
        if self.storage_dir.as_os_str().is_empty() {
            return Err(wrap!(ErrorInt::ConfigInvalid {
                description: "storage_dir must not be empty".to_string(),
            }));
        }
        Ok(())
    }

    pub fn recordings_root(&self) -> PathBuf {
        self.storage_dir.join("recordings")
    }

    pub fn max_disk_usage_bytes(&self) -> u64 {
        self.max_disk_usage_gib * 1024 * 1024 * 1024
    }

    pub fn monitors_dir(&self) -> PathBuf {
        self.config_dir.join("monitors")
    }
}

/// Loads one `RecorderConfig`-shaped raw map per `*.toml` file under
/// `monitors_dir` (§6 "Dynamic typing of monitor config"). Each file is a
/// flat `string -> string` table; unknown keys pass through untouched.
pub fn load_monitor_configs(monitors_dir: &Path) -> Result<Vec<HashMap<String, String>>, Error> {
    if !monitors_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    let entries = std::fs::read_dir(monitors_dir).map_err(|e| {
        wrap!(ErrorInt::ConfigInvalid {
            description: format!("cannot read {}: {e}", monitors_dir.display()),
        })
    })?;
    for entry in entries {
        let entry = entry.map_err(|e| {
            wrap!(ErrorInt::ConfigInvalid {
                description: format!("reading {}: {e}", monitors_dir.display()),
            })
        })?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("toml") {
            continue;
        }
        let content = std::fs::read_to_string(&path).map_err(|e| {
            wrap!(ErrorInt::ConfigInvalid {
                description: format!("cannot read {}: {e}", path.display()),
            })
        })?;
        let raw: HashMap<String, String> = toml::from_str(&content).map_err(|e| {
            wrap!(ErrorInt::ConfigInvalid {
                description: format!("invalid TOML in {}: {e}", path.display()),
            })
        })?;
        out.push(raw);
    }
    out.sort_by(|a, b| a.get("id").cmp(&b.get("id")));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_disk_budget() {
        let config = Config {
            port: default_port(),
            storage_dir: PathBuf::from("/tmp/x"),
            config_dir: default_config_dir(),
            max_disk_usage_gib: 0,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_minimal_toml() {
        let toml = "storage_dir = \"/data\"\nmax_disk_usage_gib = 50\n";
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentryshot.toml");
        std::fs::write(&path, toml).unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.port, 2020);
        assert_eq!(config.max_disk_usage_bytes(), 50 * 1024 * 1024 * 1024);
    }
}
