// Configuration from environment variables

use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::downloader::{PlannerSettings, PolicySettings};
use crate::scheduler::{DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKERS};

/// Bot API upload limit for bots
pub const DEFAULT_MAX_FILESIZE: u64 = 50_000_000;
pub const DEFAULT_CONCURRENT_FRAGMENTS: u32 = 4;
const APP_DIR_NAME: &str = "link-downloader-bot";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    /// Chat that receives a line per download request
    pub logs_chat_id: Option<i64>,
    /// Byte ceiling for downloads and uploads
    pub max_filesize: u64,
    pub output_folder: PathBuf,
    /// Only set when the file exists
    pub cookies_file: Option<PathBuf>,
    pub data_dir: PathBuf,
    pub workers: usize,
    pub max_queue: usize,
    pub concurrent_fragments: u32,
    pub ytdlp_bin: Option<String>,
    pub metadata_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub js_runtimes: Vec<String>,
    pub remote_components: Vec<String>,
    pub instagram_impersonate: Option<String>,
    pub instagram_retries: u32,
    pub instagram_fragment_retries: u32,
    pub instagram_socket_timeout_secs: u32,
    pub planner_size_aware: bool,
    pub planner_trust_estimates: bool,
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    /// Trimmed value, empty counts as unset
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn positive<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr + PartialOrd + Default + Copy,
        T::Err: std::fmt::Display,
    {
        let value = self.parse(key, default)?;
        if value <= T::default() {
            return Err(ConfigError::Invalid {
                key,
                value: self.get(key).unwrap_or_default(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(value)
    }

    fn flag(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => match raw.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    key,
                    value: raw,
                    reason: "expected a boolean".to_string(),
                }),
            },
        }
    }

    fn list(&self, key: &str, default: &str) -> Vec<String> {
        self.get(key)
            .unwrap_or_else(|| default.to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

fn default_output_folder() -> PathBuf {
    std::env::temp_dir().join("yt-dlp-telegram")
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR_NAME)
}

impl Config {
    /// Load from the process environment (call `dotenvy::dotenv()` first).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let bot_token = env.get("BOT_TOKEN").ok_or(ConfigError::Missing("BOT_TOKEN"))?;

        let logs_chat_id = match env.get("LOGS_CHAT_ID") {
            None => None,
            Some(_) => Some(env.parse::<i64>("LOGS_CHAT_ID", 0)?),
        };

        let cookies_file = env
            .get("COOKIES_FILE")
            .map(PathBuf::from)
            .filter(|p| p.is_file());

        let instagram_impersonate = env
            .get("YTDLP_INSTAGRAM_IMPERSONATE")
            .unwrap_or_else(|| "chrome".to_string());
        let instagram_impersonate = match instagram_impersonate.to_lowercase().as_str() {
            "none" | "off" => None,
            _ => Some(instagram_impersonate),
        };

        Ok(Self {
            bot_token,
            logs_chat_id,
            max_filesize: env.positive("MAX_FILESIZE", DEFAULT_MAX_FILESIZE)?,
            output_folder: env
                .get("OUTPUT_FOLDER")
                .map(PathBuf::from)
                .unwrap_or_else(default_output_folder),
            cookies_file,
            data_dir: env
                .get("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_data_dir),
            workers: env.positive("WORKERS", DEFAULT_WORKERS)?,
            max_queue: env.positive("MAX_QUEUE", DEFAULT_QUEUE_CAPACITY)?,
            concurrent_fragments: env
                .positive("YTDLP_CONCURRENT_FRAGMENTS", DEFAULT_CONCURRENT_FRAGMENTS)?,
            ytdlp_bin: env.get("YTDLP_BIN"),
            metadata_timeout_secs: env.positive("YTDLP_METADATA_TIMEOUT", 120)?,
            download_timeout_secs: env.positive("YTDLP_DOWNLOAD_TIMEOUT", 900)?,
            js_runtimes: env.list("YTDLP_JS_RUNTIMES", "node"),
            remote_components: env.list("YTDLP_REMOTE_COMPONENTS", "ejs:github"),
            instagram_impersonate,
            instagram_retries: env.parse("YTDLP_INSTAGRAM_RETRIES", 8)?,
            instagram_fragment_retries: env.parse("YTDLP_INSTAGRAM_FRAGMENT_RETRIES", 8)?,
            instagram_socket_timeout_secs: env.positive("YTDLP_INSTAGRAM_SOCKET_TIMEOUT", 30)?,
            planner_size_aware: env.flag("PLANNER_SIZE_AWARE", true)?,
            planner_trust_estimates: env.flag("PLANNER_TRUST_ESTIMATES", false)?,
        })
    }

    pub fn planner_settings(&self) -> PlannerSettings {
        PlannerSettings {
            size_aware: self.planner_size_aware,
            trust_estimates: self.planner_trust_estimates,
            ..Default::default()
        }
    }

    pub fn policy_settings(&self) -> PolicySettings {
        PolicySettings {
            cookie_file: self.cookies_file.clone(),
            js_runtimes: self.js_runtimes.clone(),
            remote_components: self.remote_components.clone(),
            instagram_impersonate: self.instagram_impersonate.clone(),
            instagram_retries: self.instagram_retries,
            instagram_fragment_retries: self.instagram_fragment_retries,
            instagram_socket_timeout_secs: self.instagram_socket_timeout_secs,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("BOT_TOKEN", "123:abc")]).unwrap();
        assert_eq!(config.bot_token, "123:abc");
        assert_eq!(config.logs_chat_id, None);
        assert_eq!(config.max_filesize, 50_000_000);
        assert_eq!(config.workers, 2);
        assert_eq!(config.max_queue, 200);
        assert_eq!(config.concurrent_fragments, 4);
        assert_eq!(config.js_runtimes, vec!["node".to_string()]);
        assert_eq!(config.remote_components, vec!["ejs:github".to_string()]);
        assert_eq!(config.instagram_impersonate.as_deref(), Some("chrome"));
        assert_eq!(config.instagram_retries, 8);
        assert_eq!(config.instagram_socket_timeout_secs, 30);
        assert!(config.planner_size_aware);
        assert!(!config.planner_trust_estimates);
        assert!(config.output_folder.ends_with("yt-dlp-telegram"));
        assert!(config.data_dir.ends_with("link-downloader-bot"));
    }

    #[test]
    fn test_missing_token() {
        assert_eq!(load(&[]).unwrap_err(), ConfigError::Missing("BOT_TOKEN"));
        assert_eq!(
            load(&[("BOT_TOKEN", "  ")]).unwrap_err(),
            ConfigError::Missing("BOT_TOKEN")
        );
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("BOT_TOKEN", "t"),
            ("LOGS_CHAT_ID", "-1001234567890"),
            ("WORKERS", "3"),
            ("YTDLP_JS_RUNTIMES", "deno, node"),
            ("YTDLP_INSTAGRAM_IMPERSONATE", "none"),
            ("PLANNER_SIZE_AWARE", "off"),
            ("COOKIES_FILE", "/definitely/not/here/cookies.txt"),
        ])
        .unwrap();
        assert_eq!(config.logs_chat_id, Some(-1001234567890));
        assert_eq!(config.workers, 3);
        assert_eq!(config.js_runtimes, vec!["deno".to_string(), "node".to_string()]);
        assert_eq!(config.instagram_impersonate, None);
        assert!(!config.planner_size_aware);
        assert_eq!(config.cookies_file, None);
        assert!(!config.planner_settings().size_aware);
        assert_eq!(config.policy_settings().js_runtimes.len(), 2);
    }

    #[test]
    fn test_malformed_values() {
        assert!(matches!(
            load(&[("BOT_TOKEN", "t"), ("WORKERS", "two")]),
            Err(ConfigError::Invalid { key: "WORKERS", .. })
        ));
        assert!(matches!(
            load(&[("BOT_TOKEN", "t"), ("MAX_QUEUE", "0")]),
            Err(ConfigError::Invalid { key: "MAX_QUEUE", .. })
        ));
        assert!(matches!(
            load(&[("BOT_TOKEN", "t"), ("PLANNER_TRUST_ESTIMATES", "maybe")]),
            Err(ConfigError::Invalid { key: "PLANNER_TRUST_ESTIMATES", .. })
        ));
    }

    #[test]
    fn test_existing_cookie_file_is_kept() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_string_lossy().into_owned();
        let config = load(&[("BOT_TOKEN", "t"), ("COOKIES_FILE", path.as_str())]).unwrap();
        assert_eq!(config.cookies_file.as_deref(), Some(file.path()));
        assert_eq!(config.policy_settings().cookie_file.as_deref(), Some(file.path()));
    }
}
