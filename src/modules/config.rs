use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::models::{AppConfig, DEFAULT_API_KEY};

/// Command line / environment overrides. Every field is optional so that
/// values left unset keep whatever the config file (or the defaults) say.
#[derive(Parser, Debug, Default)]
#[command(name = "wa-gateway")]
#[command(about = "HTTP gateway for browser-driven messaging sessions")]
#[command(version)]
pub struct Cli {
    /// JSON config file (optional)
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// Address to bind to
    #[arg(short, long, env = "BIND")]
    pub bind: Option<String>,

    /// Deployment environment (development, production, test)
    #[arg(long, env = "APP_ENV")]
    pub environment: Option<String>,

    #[arg(long, env = "API_BASE_URL")]
    pub api_base_url: Option<String>,

    /// Allowed CORS origins, comma separated
    #[arg(long, env = "CORS_ORIGIN", value_delimiter = ',')]
    pub cors_origin: Option<Vec<String>>,

    /// Directory holding per-session browser profiles
    #[arg(long, env = "SESSION_PATH")]
    pub session_path: Option<PathBuf>,

    #[arg(long, env = "MAX_SESSIONS")]
    pub max_sessions: Option<usize>,

    #[arg(long, env = "UPLOAD_PATH")]
    pub upload_path: Option<PathBuf>,

    #[arg(long, env = "MAX_FILE_SIZE")]
    pub max_file_size: Option<usize>,

    #[arg(long, env = "MAX_REQUEST_SIZE")]
    pub max_request_size: Option<usize>,

    #[arg(long, env = "API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    #[arg(long, env = "RATE_LIMIT_WINDOW_MS")]
    pub rate_limit_window_ms: Option<u64>,

    #[arg(long, env = "RATE_LIMIT_MAX_REQUESTS")]
    pub rate_limit_max_requests: Option<u32>,

    #[arg(long, env = "MESSAGE_DELAY_MS")]
    pub message_delay_ms: Option<u64>,

    #[arg(long, env = "MAX_MESSAGES_PER_HOUR")]
    pub max_messages_per_hour: Option<u32>,

    #[arg(long, env = "ENABLE_ANTI_BAN")]
    pub enable_anti_ban: Option<bool>,

    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,

    #[arg(long, env = "LOG_FILE_PATH")]
    pub log_file_path: Option<PathBuf>,

    #[arg(long, env = "CHROME_EXECUTABLE")]
    pub chrome_executable: Option<PathBuf>,

    /// Show the browser windows instead of running headless
    #[arg(long, env = "BROWSER_HEADFUL")]
    pub headful: bool,
}

impl Cli {
    /// Overlay the values given on the command line or in the environment.
    pub fn apply(self, mut config: AppConfig) -> AppConfig {
        if let Some(v) = self.port {
            config.port = v;
        }
        if let Some(v) = self.bind {
            config.bind = v;
        }
        if let Some(v) = self.environment {
            config.environment = v;
        }
        if let Some(v) = self.api_base_url {
            config.api_base_url = v;
        }
        if let Some(v) = self.cors_origin {
            let origins: Vec<String> = v
                .into_iter()
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
            if !origins.is_empty() {
                config.cors_origins = origins;
            }
        }
        if let Some(v) = self.session_path {
            config.session_path = v;
        }
        if let Some(v) = self.max_sessions {
            config.max_sessions = v;
        }
        if let Some(v) = self.upload_path {
            config.upload_path = v;
        }
        if let Some(v) = self.max_file_size {
            config.max_file_size = v;
        }
        if let Some(v) = self.max_request_size {
            config.max_request_size = v;
        }
        if let Some(v) = self.api_key {
            config.api_key = v;
        }
        if let Some(v) = self.rate_limit_window_ms {
            config.rate_limit_window_ms = v;
        }
        if let Some(v) = self.rate_limit_max_requests {
            config.rate_limit_max_requests = v;
        }
        if let Some(v) = self.message_delay_ms {
            config.anti_ban.message_delay_ms = v;
        }
        if let Some(v) = self.max_messages_per_hour {
            config.anti_ban.max_messages_per_hour = v;
        }
        if let Some(v) = self.enable_anti_ban {
            config.anti_ban.enabled = v;
        }
        if let Some(v) = self.log_level {
            config.log_level = Some(v);
        }
        if let Some(v) = self.log_file_path {
            config.log_file_path = v;
        }
        if let Some(v) = self.chrome_executable {
            config.browser.chrome_executable = Some(v);
        }
        if self.headful {
            config.browser.headful = true;
        }
        config
    }
}

/// Load application configuration
pub fn load_app_config(path: Option<&Path>) -> AppResult<AppConfig> {
    let Some(config_path) = path else {
        return Ok(AppConfig::new());
    };

    let content = fs::read_to_string(config_path).map_err(|e| {
        AppError::Config(format!("failed to read {}: {}", config_path.display(), e))
    })?;

    serde_json::from_str(&content).map_err(|e| {
        AppError::Config(format!("failed to parse {}: {}", config_path.display(), e))
    })
}

/// Resolve the final configuration: defaults, then the config file, then CLI/env.
pub fn resolve(mut cli: Cli) -> AppResult<AppConfig> {
    let file = cli.config.take();
    let config = cli.apply(load_app_config(file.as_deref())?);
    validate(&config)?;
    Ok(config)
}

fn validate(config: &AppConfig) -> AppResult<()> {
    if config.max_sessions == 0 {
        return Err(AppError::Config("max_sessions must be at least 1".to_string()));
    }
    if config.api_key.trim().is_empty() {
        return Err(AppError::Config("api_key must not be empty".to_string()));
    }
    if config.rate_limit_window_ms == 0 {
        return Err(AppError::Config("rate_limit_window_ms must be positive".to_string()));
    }
    Ok(())
}

/// Risky settings worth a warning once logging is up.
pub fn startup_warnings(config: &AppConfig) -> Vec<&'static str> {
    let mut warnings = Vec::new();
    if config.api_key == DEFAULT_API_KEY && !config.is_development() {
        warnings.push("Using the default API key outside development; set API_KEY");
    }
    if !config.anti_ban.enabled {
        warnings.push("Anti-ban pacing is disabled");
    }
    warnings
}

/// Ensure the session and upload directories exist.
pub fn ensure_directories(config: &AppConfig) -> AppResult<()> {
    for dir in [&config.session_path, &config.upload_path] {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
            info!("Created directory {}", dir.display());
        }
    }
    Ok(())
}
