use std::io::IsTerminal;

use crate::logger::{error::LoggerError, format::LoggerFormat};

/// Filter directives, e.g. `info,evloop.exec=trace`.
pub const ENV_LEVEL: &str = "EVLOOP_LOG";
/// `text`, `json` or `journald`.
pub const ENV_FORMAT: &str = "EVLOOP_LOG_FORMAT";
/// Any value disables ANSI colors.
pub const ENV_NO_COLOR: &str = "NO_COLOR";

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub format: LoggerFormat,
    pub level: String,
    pub with_targets: bool,
    pub use_color: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            format: LoggerFormat::Text,
            level: "info".to_string(),
            with_targets: true,
            use_color: std::io::stdout().is_terminal(),
        }
    }
}

impl LoggerConfig {
    /// Defaults overridden by `EVLOOP_LOG`, `EVLOOP_LOG_FORMAT` and `NO_COLOR`.
    pub fn from_env() -> Result<Self, LoggerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, LoggerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(level) = lookup(ENV_LEVEL).filter(|v| !v.trim().is_empty()) {
            cfg.level = level;
        }
        if let Some(format) = lookup(ENV_FORMAT) {
            cfg.format = format.parse()?;
        }
        if lookup(ENV_NO_COLOR).is_some() || cfg.format != LoggerFormat::Text {
            cfg.use_color = false;
        }
        Ok(cfg)
    }
}
