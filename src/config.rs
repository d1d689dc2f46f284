//! Configuration for the trackwire service object
//!
//! Hosts usually build a [`TrackwireConfig`] in code, but the struct also
//! loads from a TOML file (`trackwire.toml`) for test harnesses and demo
//! apps. Default storage paths follow the XDG Base Directory Specification:
//! - Data (SQLite queue): `$XDG_DATA_HOME/trackwire/`
//! - State (logs): `$XDG_STATE_HOME/trackwire/`

use crate::error::{Error, Result};
use crate::types::{EventCategory, FlushMode, ProjectSettings, PropertyMap};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Clone, Deserialize)]
pub struct TrackwireConfig {
    /// Default project token
    pub project_token: String,

    /// Base URL of the ingestion API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Authorization header value (`Token <key>`)
    #[serde(default)]
    pub authorization: Option<String>,

    /// Per-category routing: events of a category go to these projects
    /// instead of the main project
    #[serde(default)]
    pub project_routes: HashMap<EventCategory, Vec<ProjectSettings>>,

    /// Retries allowed per record beyond its initial delivery attempt;
    /// a record whose retry count exceeds this is dropped
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,

    /// Session timeout, the grace window for backgrounding, in seconds
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: f64,

    /// Time to live of a stored campaign click, in seconds
    #[serde(default = "default_campaign_ttl")]
    pub campaign_ttl_secs: f64,

    /// Drive session start/end from app lifecycle callbacks
    #[serde(default = "default_automatic_session_tracking")]
    pub automatic_session_tracking: bool,

    /// When queued events are pushed to the backend
    #[serde(default = "default_flush_mode")]
    pub flush_mode: FlushMode,

    /// Period of the platform scheduler in `Period` mode, in seconds
    #[serde(default = "default_flush_period")]
    pub flush_period_secs: u64,

    /// Properties added to every tracked event; call-supplied keys win
    #[serde(default)]
    pub default_properties: PropertyMap,

    /// Override for the queue database location
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.trackwire.io".to_string()
}

fn default_max_retries() -> i32 {
    10
}

fn default_session_timeout() -> f64 {
    60.0
}

fn default_campaign_ttl() -> f64 {
    10.0
}

fn default_automatic_session_tracking() -> bool {
    true
}

fn default_flush_mode() -> FlushMode {
    FlushMode::Immediate
}

fn default_flush_period() -> u64 {
    3600
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TrackwireConfig {
    /// Minimal configuration for a single project
    pub fn new(project_token: impl Into<String>) -> Self {
        Self {
            project_token: project_token.into(),
            base_url: default_base_url(),
            authorization: None,
            project_routes: HashMap::new(),
            max_retries: default_max_retries(),
            session_timeout_secs: default_session_timeout(),
            campaign_ttl_secs: default_campaign_ttl(),
            automatic_session_tracking: default_automatic_session_tracking(),
            flush_mode: default_flush_mode(),
            flush_period_secs: default_flush_period(),
            default_properties: PropertyMap::new(),
            database_path: None,
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: TrackwireConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// The main project every unrouted category falls back to
    pub fn main_project(&self) -> ProjectSettings {
        ProjectSettings::new(
            self.base_url.clone(),
            self.project_token.clone(),
            self.authorization.clone(),
        )
    }

    /// Validate the configuration, failing fast on anything malformed.
    ///
    /// Runs at construction time; a service object never starts with a
    /// configuration that would only fail at flush time.
    pub fn validate(&self) -> Result<()> {
        validate_project("main", &self.main_project())?;

        for (category, projects) in &self.project_routes {
            if projects.is_empty() {
                return Err(Error::Config(format!(
                    "project route for '{}' must list at least one project",
                    category
                )));
            }
            for project in projects {
                validate_project(category.as_str(), project)?;
            }
        }

        if self.max_retries < 1 {
            return Err(Error::Config("max_retries must be at least 1".to_string()));
        }
        if self.flush_period_secs == 0 {
            return Err(Error::Config(
                "flush_period_secs must be at least 1".to_string(),
            ));
        }
        if self.session_timeout_secs <= 0.0 {
            return Err(Error::Config(
                "session_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Path of the queue database
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| xdg_data_home().join("trackwire").join("queue.db"))
    }

    /// Directory for log files
    pub fn log_dir() -> PathBuf {
        xdg_state_home().join("trackwire")
    }
}

pub(crate) fn validate_project(label: &str, project: &ProjectSettings) -> Result<()> {
    if project.project_token.trim().is_empty() {
        return Err(Error::Config(format!(
            "project token for '{}' must not be empty",
            label
        )));
    }
    if !project.base_url.starts_with("http://") && !project.base_url.starts_with("https://") {
        return Err(Error::Config(format!(
            "base URL for '{}' must be an http(s) URL, got '{}'",
            label, project.base_url
        )));
    }
    if let Some(auth) = &project.authorization {
        if auth.starts_with("Basic ") {
            return Err(Error::Config(format!(
                "basic authentication is not supported for '{}'; use token authentication",
                label
            )));
        }
        if !auth.starts_with("Token ") {
            return Err(Error::Config(format!(
                "authorization for '{}' must use the form 'Token <access token>'",
                label
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TrackwireConfig::new("token-1");
        assert_eq!(config.base_url, "https://api.trackwire.io");
        assert_eq!(config.max_retries, 10);
        assert_eq!(config.flush_mode, FlushMode::Immediate);
        assert_eq!(config.flush_period_secs, 3600);
        assert!(config.automatic_session_tracking);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
project_token = "token-1"
base_url = "https://tracking.example.com"
authorization = "Token abc"
flush_mode = "manual"
session_timeout_secs = 30.0

[default_properties]
app = "demo"

[[project_routes.payment]]
base_url = "https://billing.example.com"
project_token = "billing-token"
"#;
        let config: TrackwireConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.base_url, "https://tracking.example.com");
        assert_eq!(config.flush_mode, FlushMode::Manual);
        assert_eq!(config.session_timeout_secs, 30.0);
        assert_eq!(
            config.default_properties.get("app").and_then(|v| v.as_str()),
            Some("demo")
        );
        let payment = &config.project_routes[&EventCategory::Payment];
        assert_eq!(payment[0].project_token, "billing-token");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_basic_auth() {
        let mut config = TrackwireConfig::new("token-1");
        config.authorization = Some("Basic dXNlcjpwYXNz".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unknown_auth_scheme() {
        let mut config = TrackwireConfig::new("token-1");
        config.authorization = Some("Bearer abc".to_string());
        assert!(config.validate().is_err());

        config.authorization = Some("Token abc".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_empty_token_and_bad_url() {
        let config = TrackwireConfig::new("  ");
        assert!(config.validate().is_err());

        let mut config = TrackwireConfig::new("token-1");
        config.base_url = "ftp://example.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_route() {
        let mut config = TrackwireConfig::new("token-1");
        config
            .project_routes
            .insert(EventCategory::Payment, vec![]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_bounds() {
        let mut config = TrackwireConfig::new("token-1");
        config.max_retries = 0;
        assert!(config.validate().is_err());

        let mut config = TrackwireConfig::new("token-1");
        config.flush_period_secs = 0;
        assert!(config.validate().is_err());
    }
}
