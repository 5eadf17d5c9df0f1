use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const DEFAULT_API_KEY: &str = "default-dev-key-change-in-production";

/// Anti-ban pacing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AntiBanConfig {
    /// Minimum delay between two messages of the same session
    pub message_delay_ms: u64,
    /// Global cap per hour; each session gets half of it
    pub max_messages_per_hour: u32,
    /// Pacing is skipped entirely when disabled
    pub enabled: bool,
}

impl Default for AntiBanConfig {
    fn default() -> Self {
        Self {
            message_delay_ms: 30_000,
            max_messages_per_hour: 50,
            enabled: false,
        }
    }
}

/// Headless browser settings for the messaging client
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BrowserConfig {
    /// Chromium binary; autodetected when unset
    pub chrome_executable: Option<PathBuf>,
    /// Show the browser window (debugging only)
    pub headful: bool,
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub port: u16,
    pub bind: String,
    pub environment: String,
    pub api_base_url: String,
    pub cors_origins: Vec<String>,

    pub session_path: PathBuf,
    pub max_sessions: usize,

    pub upload_path: PathBuf,
    pub max_file_size: usize,
    pub max_request_size: usize,

    pub api_key: String,
    pub rate_limit_window_ms: u64,
    pub rate_limit_max_requests: u32,

    pub anti_ban: AntiBanConfig,
    pub browser: BrowserConfig,

    /// Falls back to "debug" in development and "info" otherwise
    pub log_level: Option<String>,
    pub log_file_path: PathBuf,
}

impl AppConfig {
    pub fn new() -> Self {
        Self {
            port: 3001,
            bind: "0.0.0.0".to_string(),
            environment: "development".to_string(),
            api_base_url: "http://localhost:3001/api".to_string(),
            cors_origins: vec!["http://localhost:3000".to_string()],
            session_path: PathBuf::from("./sessions"),
            max_sessions: 10,
            upload_path: PathBuf::from("./uploads"),
            max_file_size: 10 * 1024 * 1024,
            max_request_size: 50 * 1024 * 1024,
            api_key: DEFAULT_API_KEY.to_string(),
            rate_limit_window_ms: 15 * 60 * 1000,
            rate_limit_max_requests: 100,
            anti_ban: AntiBanConfig::default(),
            browser: BrowserConfig::default(),
            log_level: None,
            log_file_path: PathBuf::from("./logs/app.log"),
        }
    }

    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    pub fn effective_log_level(&self) -> &str {
        match &self.log_level {
            Some(level) => level,
            None if self.is_development() => "debug",
            None => "info",
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::new()
    }
}
