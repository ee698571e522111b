// Copyright (C) 2024 SentryShot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed projection of the stringly-typed monitor config map (§6, §9).
//!
//! The core only understands a handful of keys; everything else in the raw
//! map is retained untouched for plugin consumption (§9 "Dynamic typing of
//! monitor config").

use std::collections::HashMap;
use std::time::Duration;

use crate::error::{wrap, Error, ErrorInt};

#[derive(Clone, Debug)]
pub struct RecorderConfig {
    pub id: String,
    pub enable: bool,
    pub main_input: String,
    pub sub_input: Option<String>,
    pub video_length: Duration,
    pub always_record: bool,
    pub timestamp_offset: i64,
    /// The full raw map, kept alongside the typed fields for plugin keys
    /// (`hwaccel`, `videoEncoder`, `audioEncoder`, `logLevel`, ...).
    pub raw: HashMap<String, String>,
}

impl RecorderConfig {
    pub fn from_raw(raw: HashMap<String, String>) -> Result<RecorderConfig, Error> {
        let id = required(&raw, "id")?;
        let main_input = required(&raw, "mainInput")?;
        let enable = parse_bool(&raw, "enable", true)?;
        let always_record = parse_bool(&raw, "alwaysRecord", true)?;
        let video_length_minutes: u64 = match raw.get("videoLength") {
            Some(s) => s.parse().map_err(|_| {
                wrap!(ErrorInt::ConfigInvalid {
                    description: format!("monitor {id}: invalid videoLength {s:?}"),
                })
            })?,
            None => 15,
        };
        let timestamp_offset: i64 = match raw.get("timestampOffset") {
            Some(s) => s.parse().map_err(|_| {
                wrap!(ErrorInt::ConfigInvalid {
                    description: format!("monitor {id}: invalid timestampOffset {s:?}"),
                })
            })?,
            None => 0,
        };
        Ok(RecorderConfig {
            id,
            enable,
            main_input,
            sub_input: raw.get("subInput").cloned(),
            video_length: Duration::from_secs(video_length_minutes * 60),
            always_record,
            timestamp_offset,
            raw,
        })
    }
}

fn required(raw: &HashMap<String, String>, key: &str) -> Result<String, Error> {
    raw.get(key).cloned().ok_or_else(|| {
        wrap!(ErrorInt::ConfigInvalid {
            description: format!("monitor config missing required key {key:?}"),
        })
    })
}

fn parse_bool(raw: &HashMap<String, String>, key: &str, default: bool) -> Result<bool, Error> {
    match raw.get(key).map(String::as_str) {
        Some("true") => Ok(true),
        Some("false") => Ok(false),
        Some(other) => Err(wrap!(ErrorInt::ConfigInvalid {
            description: format!("{key} must be \"true\" or \"false\", got {other:?}"),
        })),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_defaults_for_optional_keys() {
        let mut raw = HashMap::new();
        raw.insert("id".to_string(), "cam1".to_string());
        raw.insert("mainInput".to_string(), "rtsp://cam1/stream".to_string());
        let config = RecorderConfig::from_raw(raw).unwrap();
        assert_eq!(config.video_length, Duration::from_secs(15 * 60));
        assert!(config.always_record);
        assert!(config.sub_input.is_none());
    }

    #[test]
    fn rejects_missing_id() {
        let raw = HashMap::new();
        assert!(RecorderConfig::from_raw(raw).is_err());
    }

    #[test]
    fn rejects_malformed_bool() {
        let mut raw = HashMap::new();
        raw.insert("id".to_string(), "cam1".to_string());
        raw.insert("mainInput".to_string(), "rtsp://x".to_string());
        raw.insert("enable".to_string(), "yes".to_string());
        assert!(RecorderConfig::from_raw(raw).is_err());
    }
}
