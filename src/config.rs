// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Runtime configuration (spec.md §9's "Shared mutable state" minus the
//! file-format/CLI-flag concerns that are out of scope). Loaded once from
//! TOML at startup, then held behind an [`arc_swap::ArcSwap`] so the rest
//! of the process reads a consistent snapshot without ever blocking a
//! writer (spec.md §9: "read-copy-update snapshot").

use crate::retention::WaterMarks;
use base::{err, Error};
use db::stream::{Stream, StreamSettings};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn default_db_path() -> PathBuf {
    "/var/lib/lightnvr/index.db".into()
}

fn default_recordings_root() -> PathBuf {
    "/var/lib/lightnvr/recordings".into()
}

fn default_motion_pool_budget_bytes() -> i64 {
    crate::motion_buffer::DEFAULT_POOL_BUDGET_BYTES
}

fn default_high_water() -> f64 {
    crate::retention::DEFAULT_HIGH_WATER_FRACTION
}

fn default_low_water() -> f64 {
    crate::retention::DEFAULT_LOW_WATER_FRACTION
}

/// One stream entry in the config file: the identity/URL columns plus
/// its tunable settings, mirroring [`db::stream::Stream`] without the
/// runtime-only `enabled`/`streaming_enabled` split a config file has no
/// reason to separate (both start `true` unless stated otherwise).
#[derive(Clone, Debug, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub settings: StreamSettings,
}

fn default_true() -> bool {
    true
}

impl StreamConfig {
    fn into_stream(self) -> Stream {
        Stream {
            name: self.name,
            url: self.url,
            enabled: self.enabled,
            streaming_enabled: self.enabled,
            settings: self.settings,
        }
    }
}

/// Top-level configuration file object (spec.md §6: "Env vars provide
/// per-path overrides").
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_recordings_root")]
    pub recordings_root: PathBuf,

    #[serde(default = "default_high_water")]
    pub high_water_fraction: f64,

    #[serde(default = "default_low_water")]
    pub low_water_fraction: f64,

    #[serde(default = "default_motion_pool_budget_bytes")]
    pub motion_pool_budget_bytes: i64,

    #[serde(default)]
    pub streams: Vec<StreamConfig>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            db_path: default_db_path(),
            recordings_root: default_recordings_root(),
            high_water_fraction: default_high_water(),
            low_water_fraction: default_low_water(),
            motion_pool_budget_bytes: default_motion_pool_budget_bytes(),
            streams: Vec::new(),
        }
    }
}

impl Config {
    pub fn water_marks(&self) -> WaterMarks {
        WaterMarks { high: self.high_water_fraction, low: self.low_water_fraction }
    }

    /// Parses `path`, then applies the `LIGHTNVR_DATA_DIR`/
    /// `LIGHTNVR_RECORDINGS_DIR` environment overrides (spec.md §6).
    pub fn load(path: &Path) -> Result<Config, Error> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| err!(Unavailable, "reading config {}: {e}", path.display()))?;
        let mut config: Config = toml::from_str(&text)
            .map_err(|e| err!(InvalidArgument, "parsing config {}: {e}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("LIGHTNVR_DATA_DIR") {
            self.db_path = PathBuf::from(dir).join("index.db");
        }
        if let Ok(dir) = std::env::var("LIGHTNVR_RECORDINGS_DIR") {
            self.recordings_root = PathBuf::from(dir);
        }
    }

    /// Persists every configured stream not already present in the
    /// database (`AlreadyExists` from a prior run's `create` is not an
    /// error here — config is the source of truth for which streams
    /// *should* exist, not a one-shot seeding script).
    pub fn ensure_streams_persisted(&self, conn: &rusqlite::Connection) -> Result<(), Error> {
        for entry in &self.streams {
            let stream = entry.clone().into_stream();
            match db::stream::create(conn, &stream) {
                Ok(()) => {}
                Err(e) if e.kind() == base::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// The process-wide read-copy-update snapshot (spec.md §9). Readers
/// `.load()` a cheap `Arc` clone; the control plane `.store()`s a wholly
/// new `Config` built from the previous one plus whatever changed. No
/// reader ever blocks a writer or another reader.
pub type ConfigSnapshot = Arc<arc_swap::ArcSwap<Config>>;

pub fn snapshot(config: Config) -> ConfigSnapshot {
    Arc::new(arc_swap::ArcSwap::from_pointee(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_toml_with_defaults() {
        let toml = r#"
            [[streams]]
            name = "cam1"
            url = "rtsp://cam1/"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.db_path, default_db_path());
        assert_eq!(config.streams.len(), 1);
        assert_eq!(config.streams[0].settings.retention_days, 30);
        assert!(config.streams[0].enabled);
    }

    #[test]
    fn stream_settings_override_defaults() {
        let toml = r#"
            [[streams]]
            name = "cam1"
            url = "rtsp://cam1/"
            enabled = false
            retention_days = 7
            motion_recording = true
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(!config.streams[0].enabled);
        assert_eq!(config.streams[0].settings.retention_days, 7);
        assert!(config.streams[0].settings.motion_recording);
    }

    #[test]
    fn env_overrides_take_precedence_over_file_paths() {
        std::env::set_var("LIGHTNVR_DATA_DIR", "/tmp/lightnvr-test-data");
        std::env::set_var("LIGHTNVR_RECORDINGS_DIR", "/tmp/lightnvr-test-recordings");
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.db_path, PathBuf::from("/tmp/lightnvr-test-data/index.db"));
        assert_eq!(config.recordings_root, PathBuf::from("/tmp/lightnvr-test-recordings"));
        std::env::remove_var("LIGHTNVR_DATA_DIR");
        std::env::remove_var("LIGHTNVR_RECORDINGS_DIR");
    }

    #[test]
    fn ensure_streams_persisted_is_idempotent() {
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        db::migrate::upgrade(&mut conn).unwrap();
        let mut config = Config::default();
        config.streams.push(StreamConfig {
            name: "cam1".to_string(),
            url: "rtsp://cam1/".to_string(),
            enabled: true,
            settings: StreamSettings::default(),
        });
        config.ensure_streams_persisted(&conn).unwrap();
        config.ensure_streams_persisted(&conn).unwrap();
        assert_eq!(db::stream::list(&conn).unwrap().len(), 1);
    }

    #[test]
    fn water_marks_reflect_config_fractions() {
        let mut config = Config::default();
        config.high_water_fraction = 0.8;
        config.low_water_fraction = 0.7;
        let marks = config.water_marks();
        assert_eq!(marks.high, 0.8);
        assert_eq!(marks.low, 0.7);
    }
}
