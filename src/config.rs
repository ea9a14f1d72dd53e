use std::env;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::engine::DEFAULT_ROW_CAP;

pub const DEFAULT_BACKEND_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_VIEW_NAME: &str = "trips_zones";

/// Runtime settings shared by the CLI and embedding applications.
///
/// Stored as JSON on disk; every key is optional:
/// ```json
/// {
///   "row_cap": 10000,
///   "workers": 8,
///   "backend_timeout_secs": 300,
///   "backend_url": "http://aggregator.internal:8080",
///   "view_name": "trips_zones"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub row_cap: usize,
    pub workers: usize,
    pub backend_timeout_secs: u64,
    /// Remote aggregation service. Local execution when unset.
    pub backend_url: Option<String>,
    pub backend_token: Option<String>,
    pub view_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            row_cap: DEFAULT_ROW_CAP,
            workers: std::thread::available_parallelism().map_or(1, |n| n.get()),
            backend_timeout_secs: DEFAULT_BACKEND_TIMEOUT_SECS,
            backend_url: None,
            backend_token: None,
            view_name: DEFAULT_VIEW_NAME.to_string(),
        }
    }
}

fn parsed<T: FromStr>(vars: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match text(vars, key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{key}={raw} is not valid")),
        None => Ok(None),
    }
}

fn text(vars: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    vars(key).filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Loads the config from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// Defaults overridden by `TRIPSCOPE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env()
    }

    /// Applies `TRIPSCOPE_*` environment variables on top of `self`.
    pub fn with_env(self) -> Result<Self> {
        self.with_vars(|key| env::var(key).ok())
    }

    /// Applies `TRIPSCOPE_*` overrides looked up through `vars`. Blank
    /// values are ignored.
    pub fn with_vars(mut self, vars: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = parsed(&vars, "TRIPSCOPE_ROW_CAP")? {
            self.row_cap = v;
        }
        if let Some(v) = parsed(&vars, "TRIPSCOPE_WORKERS")? {
            self.workers = v;
        }
        if let Some(v) = parsed(&vars, "TRIPSCOPE_BACKEND_TIMEOUT_SECS")? {
            self.backend_timeout_secs = v;
        }
        if let Some(v) = text(&vars, "TRIPSCOPE_BACKEND_URL") {
            self.backend_url = Some(v);
        }
        if let Some(v) = text(&vars, "TRIPSCOPE_BACKEND_TOKEN") {
            self.backend_token = Some(v);
        }
        if let Some(v) = text(&vars, "TRIPSCOPE_VIEW_NAME") {
            self.view_name = v;
        }
        Ok(self)
    }

    pub fn backend_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.backend_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.row_cap, 10_000);
        assert_eq!(config.backend_timeout_secs, 300);
        assert_eq!(config.view_name, "trips_zones");
        assert!(config.workers >= 1);
        assert!(config.backend_url.is_none());
    }

    #[test]
    fn test_load_partial_file() {
        let path = env::temp_dir().join("tripscope_test_config.json");
        fs::write(&path, r#"{"row_cap": 50, "backend_url": "http://localhost:9000"}"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.row_cap, 50);
        assert_eq!(config.backend_url.as_deref(), Some("http://localhost:9000"));
        assert_eq!(config.view_name, "trips_zones");

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_load_rejects_bad_json() {
        let path = env::temp_dir().join("tripscope_test_config_bad.json");
        fs::write(&path, r#"{"row_cap": "lots"}"#).unwrap();
        assert!(Config::load(&path).is_err());
        fs::remove_file(&path).unwrap();
    }

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_overrides_apply_on_top_of_file_values() {
        let base = Config {
            row_cap: 50,
            ..Config::default()
        };
        let config = base
            .with_vars(vars(&[
                ("TRIPSCOPE_WORKERS", "3"),
                ("TRIPSCOPE_BACKEND_TIMEOUT_SECS", " 30 "),
                ("TRIPSCOPE_BACKEND_URL", "http://localhost:9000"),
                ("TRIPSCOPE_VIEW_NAME", "night_trips"),
                ("TRIPSCOPE_BACKEND_TOKEN", "  "),
            ]))
            .unwrap();
        assert_eq!(config.row_cap, 50);
        assert_eq!(config.workers, 3);
        assert_eq!(config.backend_timeout(), std::time::Duration::from_secs(30));
        assert_eq!(config.backend_url.as_deref(), Some("http://localhost:9000"));
        assert_eq!(config.view_name, "night_trips");
        assert!(config.backend_token.is_none());
    }

    #[test]
    fn test_bad_override_names_the_variable() {
        let err = Config::default()
            .with_vars(vars(&[("TRIPSCOPE_ROW_CAP", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("TRIPSCOPE_ROW_CAP=lots"), "{err}");
    }

    #[test]
    fn test_with_env_reads_process_environment() {
        // only this test touches the variable
        unsafe { env::set_var("TRIPSCOPE_BACKEND_TOKEN", "secret") };
        let config = Config::default().with_env();
        unsafe { env::remove_var("TRIPSCOPE_BACKEND_TOKEN") };
        assert_eq!(config.unwrap().backend_token.as_deref(), Some("secret"));
    }
}
