use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use ipoa_adapters::{DEFAULT_GEMINI_MODEL, DEFAULT_SCRAPE_MAX_CHARS, DEFAULT_SOURCE_URL, DEFAULT_USER_AGENT};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("{key} has an invalid value {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Process-wide settings, read once at startup.
#[derive(Clone)]
pub struct AppConfig {
    pub google_api_key: String,
    pub gemini_model: String,
    pub sheet_endpoint: Option<String>,
    pub source_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub ai_timeout_secs: u64,
    pub scrape_max_chars: usize,
    pub snapshot_dir: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub web_port: u16,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Ok(Self {
            google_api_key: get("GOOGLE_API_KEY").ok_or(ConfigError::Missing("GOOGLE_API_KEY"))?,
            gemini_model: get("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
            sheet_endpoint: get("IPO_SHEET_API"),
            source_url: get("IPO_SOURCE_URL").unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string()),
            user_agent: get("IPOA_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: parsed(&get, "IPOA_HTTP_TIMEOUT_SECS", 20)?,
            ai_timeout_secs: parsed(&get, "IPOA_AI_TIMEOUT_SECS", 60)?,
            scrape_max_chars: parsed(&get, "IPOA_SCRAPE_MAX_CHARS", DEFAULT_SCRAPE_MAX_CHARS)?,
            snapshot_dir: get("IPOA_SNAPSHOT_DIR").map(PathBuf::from),
            scheduler_enabled: flag(&get, "IPOA_SCHEDULER_ENABLED", false)?,
            sync_cron: get("IPOA_SYNC_CRON").unwrap_or_else(|| "0 0 6 * * *".to_string()),
            web_port: parsed(&get, "IPOA_WEB_PORT", 8000)?,
        })
    }
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("google_api_key", &"<redacted>")
            .field("gemini_model", &self.gemini_model)
            .field("sheet_endpoint", &self.sheet_endpoint.as_ref().map(|_| "<set>"))
            .field("source_url", &self.source_url)
            .field("user_agent", &self.user_agent)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("ai_timeout_secs", &self.ai_timeout_secs)
            .field("scrape_max_chars", &self.scrape_max_chars)
            .field("snapshot_dir", &self.snapshot_dir)
            .field("scheduler_enabled", &self.scheduler_enabled)
            .field("sync_cron", &self.sync_cron)
            .field("web_port", &self.web_port)
            .finish()
    }
}

fn parsed<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

fn flag<G>(get: &G, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid { key, value }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_the_key_is_set() {
        let config = AppConfig::from_lookup(lookup(&[("GOOGLE_API_KEY", "k")])).unwrap();
        assert_eq!(config.gemini_model, "gemini-2.5-flash");
        assert_eq!(config.sheet_endpoint, None);
        assert_eq!(config.source_url, DEFAULT_SOURCE_URL);
        assert_eq!(config.http_timeout_secs, 20);
        assert_eq!(config.ai_timeout_secs, 60);
        assert_eq!(config.scrape_max_chars, 10_000);
        assert!(!config.scheduler_enabled);
        assert_eq!(config.sync_cron, "0 0 6 * * *");
        assert_eq!(config.web_port, 8000);
    }

    #[test]
    fn missing_or_blank_api_key_is_fatal() {
        assert_eq!(
            AppConfig::from_lookup(lookup(&[])).unwrap_err(),
            ConfigError::Missing("GOOGLE_API_KEY")
        );
        assert!(AppConfig::from_lookup(lookup(&[("GOOGLE_API_KEY", "  ")])).is_err());
    }

    #[test]
    fn overrides_are_parsed_and_checked() {
        let config = AppConfig::from_lookup(lookup(&[
            ("GOOGLE_API_KEY", "k"),
            ("IPO_SHEET_API", "https://sheet.best/api/sheets/x"),
            ("IPOA_SCHEDULER_ENABLED", "TRUE"),
            ("IPOA_WEB_PORT", "9000"),
            ("IPOA_SNAPSHOT_DIR", "/tmp/ipoa"),
        ]))
        .unwrap();
        assert_eq!(config.sheet_endpoint.as_deref(), Some("https://sheet.best/api/sheets/x"));
        assert!(config.scheduler_enabled);
        assert_eq!(config.web_port, 9000);
        assert_eq!(config.snapshot_dir, Some(PathBuf::from("/tmp/ipoa")));

        let err = AppConfig::from_lookup(lookup(&[
            ("GOOGLE_API_KEY", "k"),
            ("IPOA_HTTP_TIMEOUT_SECS", "soon"),
        ]))
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "IPOA_HTTP_TIMEOUT_SECS",
                value: "soon".into()
            }
        );
    }

    #[test]
    fn debug_output_hides_the_api_key() {
        let config = AppConfig::from_lookup(lookup(&[("GOOGLE_API_KEY", "super-secret")])).unwrap();
        assert!(!format!("{config:?}").contains("super-secret"));
    }
}
