// SPDX-License-Identifier: CEPL-1.0
use std::fs;
use std::io;
use std::path::Path;

use serde::Deserialize;
use tracing::{info, warn};
use vkd_display_vk::DisplayConfig;

#[derive(Debug, Deserialize, Default, Clone)]
pub struct AppCfg {
    #[serde(default)]
    pub display: DisplayCfg,
    #[serde(default)]
    pub producer: ProducerCfg,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DisplayCfg {
    #[serde(default = "default_frames_in_flight")]
    pub frames_in_flight: usize,
    #[serde(default = "default_vsync")]
    pub vsync: bool,
    #[serde(default)]
    pub gpu: Option<usize>,
    /// Unset means on for debug builds only.
    #[serde(default)]
    pub validation: Option<bool>,
    #[serde(default = "default_clear")]
    pub clear_color: [f32; 4],
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct ProducerCfg {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    /// 0 produces as fast as the pool allows.
    #[serde(default = "default_fps")]
    pub fps: u32,
    /// Seconds spent in each fill mode before switching.
    #[serde(default = "default_switch_secs")]
    pub switch_secs: u64,
}

impl Default for DisplayCfg {
    fn default() -> Self {
        DisplayCfg {
            frames_in_flight: default_frames_in_flight(),
            vsync: default_vsync(),
            gpu: None,
            validation: None,
            clear_color: default_clear(),
        }
    }
}

impl Default for ProducerCfg {
    fn default() -> Self {
        ProducerCfg {
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            switch_secs: default_switch_secs(),
        }
    }
}

fn default_frames_in_flight() -> usize {
    3
}
fn default_vsync() -> bool {
    true
}
fn default_clear() -> [f32; 4] {
    [0.01, 0.01, 0.01, 1.0]
}
fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    360
}
fn default_fps() -> u32 {
    60
}
fn default_switch_secs() -> u64 {
    5
}

impl DisplayCfg {
    pub fn to_display_config(&self) -> DisplayConfig {
        let defaults = DisplayConfig::default();
        DisplayConfig {
            frames_in_flight: self.frames_in_flight.max(1),
            gpu_index: self.gpu,
            validation: self.validation.unwrap_or(defaults.validation),
            clear_color: self.clear_color,
        }
    }
}

impl AppCfg {
    /// Command line values win over the file.
    pub fn apply_overrides(
        &mut self,
        frames_in_flight: Option<usize>,
        gpu: Option<usize>,
        no_vsync: bool,
    ) {
        if let Some(n) = frames_in_flight {
            self.display.frames_in_flight = n;
        }
        if gpu.is_some() {
            self.display.gpu = gpu;
        }
        if no_vsync {
            self.display.vsync = false;
        }
    }
}

pub fn parse_cfg(text: &str) -> Result<AppCfg, toml::de::Error> {
    toml::from_str(text)
}

pub fn load_cfg(path: &Path) -> AppCfg {
    match fs::read_to_string(path) {
        Ok(s) => match parse_cfg(&s) {
            Ok(cfg) => {
                info!("config loaded from {}", path.display());
                cfg
            }
            Err(e) => {
                warn!("ignoring malformed {}: {e}", path.display());
                AppCfg::default()
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => AppCfg::default(),
        Err(e) => {
            warn!("cannot read {}: {e}", path.display());
            AppCfg::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let cfg = parse_cfg("").unwrap();
        assert_eq!(cfg.display.frames_in_flight, 3);
        assert!(cfg.display.vsync);
        assert_eq!(cfg.producer, ProducerCfg::default());
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let cfg = parse_cfg(
            r#"
            [display]
            frames_in_flight = 5
            gpu = 1

            [producer]
            fps = 0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.display.frames_in_flight, 5);
        assert_eq!(cfg.display.gpu, Some(1));
        assert!(cfg.display.vsync);
        assert_eq!(cfg.producer.fps, 0);
        assert_eq!(cfg.producer.width, 640);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        assert!(parse_cfg("[display]\nframes_in_flight = \"many\"").is_err());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let cfg = load_cfg(Path::new("definitely/not/here/vkd.toml"));
        assert_eq!(cfg.producer.switch_secs, 5);
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut cfg = parse_cfg("[display]\ngpu = 2\nframes_in_flight = 4").unwrap();
        cfg.apply_overrides(Some(2), None, true);
        assert_eq!(cfg.display.frames_in_flight, 2);
        assert_eq!(cfg.display.gpu, Some(2));
        assert!(!cfg.display.vsync);
    }

    #[test]
    fn test_display_config_clamps_frames() {
        let mut cfg = DisplayCfg::default();
        cfg.frames_in_flight = 0;
        cfg.validation = Some(true);
        let dc = cfg.to_display_config();
        assert_eq!(dc.frames_in_flight, 1);
        assert!(dc.validation);
    }
}
