use directories::ProjectDirs;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config directory not found")]
    NoConfigDir,
    #[error("config file not found at {0}")]
    NotFound(PathBuf),
    #[error("failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("validation failed: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub player: PlayerConfig,
    #[serde(default)]
    pub autoplay: AutoplayConfig,
    #[serde(default)]
    pub youtube: YoutubeConfig,
    #[serde(default)]
    pub niconico: NiconicoConfig,
}

#[derive(Default, Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub dir: Option<PathBuf>,
}

impl CacheConfig {
    pub fn dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| {
            ProjectDirs::from("", "", "jukebot")
                .map(|dirs| dirs.cache_dir().join("media"))
                .unwrap_or_else(|| std::env::temp_dir().join("jukebot").join("media"))
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlayerConfig {
    #[serde(default = "default_player_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Output volume in percent
    #[serde(default = "default_volume")]
    pub volume: u8,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            command: default_player_command(),
            args: Vec::new(),
            volume: default_volume(),
        }
    }
}

fn default_player_command() -> String {
    "mpv".to_string()
}

fn default_volume() -> u8 {
    25
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutoplayConfig {
    /// Whether newly joined sessions start with autoplay on
    #[serde(default)]
    pub enabled: bool,
    /// How many recent picks are excluded from selection
    #[serde(default = "default_history")]
    pub history: usize,
    /// Candidates tried before giving up
    #[serde(default = "default_attempts")]
    pub attempts: usize,
}

impl Default for AutoplayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            history: default_history(),
            attempts: default_attempts(),
        }
    }
}

fn default_history() -> usize {
    10
}

fn default_attempts() -> usize {
    20
}

#[derive(Debug, Clone, Deserialize)]
pub struct YoutubeConfig {
    #[serde(default = "default_downloader")]
    pub downloader: String,
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
    #[serde(default = "default_oembed_url")]
    pub oembed_url: String,
}

impl Default for YoutubeConfig {
    fn default() -> Self {
        Self {
            downloader: default_downloader(),
            ffmpeg: default_ffmpeg(),
            oembed_url: default_oembed_url(),
        }
    }
}

fn default_downloader() -> String {
    "youtube-dl".to_string()
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_oembed_url() -> String {
    "https://www.youtube.com/oembed".to_string()
}

/// Base URLs of the niconico APIs used for guest playback
#[derive(Debug, Clone, Deserialize)]
pub struct NiconicoConfig {
    #[serde(default = "default_public_api")]
    pub public_api: String,
    #[serde(default = "default_www")]
    pub www: String,
    #[serde(default = "default_dmc")]
    pub dmc: String,
    #[serde(default = "default_ce_api")]
    pub ce_api: String,
}

impl Default for NiconicoConfig {
    fn default() -> Self {
        Self {
            public_api: default_public_api(),
            www: default_www(),
            dmc: default_dmc(),
            ce_api: default_ce_api(),
        }
    }
}

fn default_public_api() -> String {
    "https://public.api.nicovideo.jp".to_string()
}

fn default_www() -> String {
    "https://www.nicovideo.jp".to_string()
}

fn default_dmc() -> String {
    "https://api.dmc.nico".to_string()
}

fn default_ce_api() -> String {
    "https://api.ce.nicovideo.jp".to_string()
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn config_path() -> Result<PathBuf, ConfigError> {
        ProjectDirs::from("", "", "jukebot")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .ok_or(ConfigError::NoConfigDir)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.autoplay.history == 0 {
            return Err(ConfigError::ValidationError(
                "autoplay.history must be at least 1".to_string(),
            ));
        }

        if self.autoplay.attempts == 0 {
            return Err(ConfigError::ValidationError(
                "autoplay.attempts must be at least 1".to_string(),
            ));
        }

        if self.player.volume > 100 {
            return Err(ConfigError::ValidationError(
                "player.volume must be between 0 and 100".to_string(),
            ));
        }

        if self.player.command.is_empty() {
            return Err(ConfigError::ValidationError(
                "player.command cannot be empty".to_string(),
            ));
        }

        let endpoints = [
            ("youtube.oembed_url", &self.youtube.oembed_url),
            ("niconico.public_api", &self.niconico.public_api),
            ("niconico.www", &self.niconico.www),
            ("niconico.dmc", &self.niconico.dmc),
            ("niconico.ce_api", &self.niconico.ce_api),
        ];
        for (name, url) in endpoints {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::ValidationError(format!(
                    "{} must start with http:// or https://",
                    name
                )));
            }
        }

        Ok(())
    }
}
