use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    pub gesture: GestureConfig,
    pub seek: SeekConfig,
    pub locations: LocationsConfig,
    pub layout: LayoutConfig,
    pub read_aloud: ReadAloudConfig,
    pub bookmarks: BookmarkConfig,
    pub remote: RemoteConfig,
}

impl ReaderConfig {
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("net", "turnpage", "turnpage")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Reads a TOML config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        Self::from_toml(&raw).with_context(|| format!("failed to parse config file {:?}", path))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GestureConfig {
    /// Horizontal travel in pixels before a press becomes a drag.
    pub activation_px: f32,
    /// Fraction of the viewport width a drag must exceed to turn the page.
    pub release_fraction: f32,
}

impl Default for GestureConfig {
    fn default() -> Self {
        Self {
            activation_px: 10.0,
            release_fraction: 0.15,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeekConfig {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "settle_ms")]
    pub settle: Duration,
}

impl Default for SeekConfig {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationsConfig {
    pub chunk_size: usize,
}

impl Default for LocationsConfig {
    fn default() -> Self {
        Self { chunk_size: 1600 }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "resize_settle_ms")]
    pub resize_settle: Duration,
    pub gap: u32,
    /// Viewports at most this wide render a single page without spread.
    pub compact_max_width: u32,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            resize_settle: Duration::from_millis(150),
            gap: 30,
            compact_max_width: 768,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadAloudConfig {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "layout_settle_ms")]
    pub layout_settle: Duration,
    pub rate: f32,
    pub volume: f32,
    pub voice: Option<String>,
    pub max_empty_pages: usize,
}

impl Default for ReadAloudConfig {
    fn default() -> Self {
        Self {
            layout_settle: Duration::from_millis(250),
            rate: 1.0,
            volume: 0.8,
            voice: None,
            max_empty_pages: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookmarkMatch {
    /// Only an identical canonical reference counts as bookmarked.
    #[default]
    Exact,
    /// Falls back to comparing the section part of the reference (before
    /// `!`). Approximate: any page of the bookmarked section matches.
    SectionFallback,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BookmarkConfig {
    #[serde(rename = "match")]
    pub policy: BookmarkMatch,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: Option<String>,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "timeout_ms")]
    pub timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout: Duration::from_secs(10),
        }
    }
}
