// Copyright 2025 Tomoki Hayashi
// MIT License (https://opensource.org/licenses/MIT)

//! Configuration management.
//!
//! Config values are loaded with the following priority (highest to lowest):
//! 1. Environment variables (CFLOW_*)
//! 2. Config file (~/.config/cflow/config.toml)
//! 3. Default values

use serde::Deserialize;
use std::path::PathBuf;

use crate::window::WindowLayout;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scroll_stop_ms: u64,
    pub placeholder_aspect_ratio: f64,
    pub end_marker_height: f64,
    pub cell_aspect_ratio: f64,
    pub prefetch_threads: usize,
    pub preferred_group: Option<String>,
    pub debug: bool,
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scroll_stop_ms: 150,
            placeholder_aspect_ratio: 1.5,
            end_marker_height: 3.0,
            cell_aspect_ratio: 2.0,
            prefetch_threads: 2,
            preferred_group: None,
            debug: false,
            log_file: None,
        }
    }
}

impl Config {
    /// Load config with priority: env vars > config file > defaults
    pub fn load() -> Self {
        let mut config = Self::load_from_file().unwrap_or_default();
        config.apply_env_overrides();
        config.clamp_values();
        config
    }

    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("cflow").join("config.toml"))
    }

    fn load_from_file() -> Option<Self> {
        let path = Self::config_path()?;
        let content = std::fs::read_to_string(path).ok()?;
        toml::from_str(&content).ok()
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = Self::parse_env::<u64>("CFLOW_SCROLL_STOP_MS") {
            self.scroll_stop_ms = v;
        }
        if let Some(v) = Self::parse_env::<f64>("CFLOW_PLACEHOLDER_ASPECT_RATIO") {
            self.placeholder_aspect_ratio = v;
        }
        if let Some(v) = Self::parse_env::<f64>("CFLOW_END_MARKER_HEIGHT") {
            self.end_marker_height = v;
        }
        if let Some(v) = Self::parse_env::<f64>("CFLOW_CELL_ASPECT_RATIO") {
            self.cell_aspect_ratio = v;
        }
        if let Some(v) = Self::parse_env::<usize>("CFLOW_PREFETCH_THREADS") {
            self.prefetch_threads = v;
        }
        if let Ok(v) = std::env::var("CFLOW_PREFERRED_GROUP") {
            self.preferred_group = Some(v);
        }
        if std::env::var_os("CFLOW_DEBUG").is_some() {
            self.debug = true;
        }
        if let Some(v) = std::env::var_os("CFLOW_LOG_FILE") {
            self.log_file = Some(PathBuf::from(v));
        }
    }

    fn clamp_values(&mut self) {
        const MAX_SCROLL_STOP_MS: u64 = 5_000;

        self.scroll_stop_ms = self.scroll_stop_ms.min(MAX_SCROLL_STOP_MS);
        self.placeholder_aspect_ratio = self.placeholder_aspect_ratio.clamp(0.25, 8.0);
        self.end_marker_height = self.end_marker_height.clamp(1.0, 50.0);
        self.cell_aspect_ratio = self.cell_aspect_ratio.clamp(1.0, 4.0);
        self.prefetch_threads = self.prefetch_threads.clamp(1, 8);
        if self
            .preferred_group
            .as_deref()
            .is_some_and(|g| g.trim().is_empty())
        {
            self.preferred_group = None;
        }
    }

    fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
        std::env::var(key).ok()?.parse().ok()
    }

    /// Where log output goes, if anywhere. The terminal is owned by the UI.
    pub fn log_destination(&self) -> Option<PathBuf> {
        match (&self.log_file, self.debug) {
            (Some(path), _) => Some(path.clone()),
            (None, true) => Some(std::env::temp_dir().join("cflow.log")),
            (None, false) => None,
        }
    }

    pub fn window_layout(&self, width: f64) -> WindowLayout {
        WindowLayout {
            width,
            cell_aspect_ratio: self.cell_aspect_ratio,
            placeholder_aspect_ratio: self.placeholder_aspect_ratio,
            end_marker_height: self.end_marker_height,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.scroll_stop_ms, 150);
        assert_eq!(config.placeholder_aspect_ratio, 1.5);
        assert_eq!(config.end_marker_height, 3.0);
        assert_eq!(config.cell_aspect_ratio, 2.0);
        assert_eq!(config.prefetch_threads, 2);
        assert!(config.preferred_group.is_none());
        assert!(!config.debug);
    }

    #[test]
    fn test_clamp_values() {
        let mut config = Config {
            scroll_stop_ms: 10_000,
            placeholder_aspect_ratio: 100.0,
            end_marker_height: 0.0,
            prefetch_threads: 0,
            preferred_group: Some("  ".to_string()),
            ..Default::default()
        };
        config.clamp_values();
        assert_eq!(config.scroll_stop_ms, 5_000);
        assert_eq!(config.placeholder_aspect_ratio, 8.0);
        assert_eq!(config.end_marker_height, 1.0);
        assert_eq!(config.prefetch_threads, 1);
        assert!(config.preferred_group.is_none());
    }

    #[test]
    fn test_parse_toml_partial() {
        let config: Config = toml::from_str(
            r#"
            scroll_stop_ms = 300
            preferred_group = "alpha"
            "#,
        )
        .unwrap();
        assert_eq!(config.scroll_stop_ms, 300);
        assert_eq!(config.preferred_group.as_deref(), Some("alpha"));
        assert_eq!(config.cell_aspect_ratio, 2.0);
    }

    #[test]
    fn test_log_destination() {
        let config = Config::default();
        assert!(config.log_destination().is_none());

        let config = Config {
            debug: true,
            ..Default::default()
        };
        assert!(config.log_destination().unwrap().ends_with("cflow.log"));

        let config = Config {
            log_file: Some(PathBuf::from("/tmp/x.log")),
            ..Default::default()
        };
        assert_eq!(config.log_destination(), Some(PathBuf::from("/tmp/x.log")));
    }

    #[test]
    fn test_window_layout() {
        let layout = Config::default().window_layout(40.0);
        assert_eq!(layout.width, 40.0);
        assert_eq!(layout.cell_aspect_ratio, 2.0);
        assert_eq!(layout.placeholder_aspect_ratio, 1.5);
    }
}
