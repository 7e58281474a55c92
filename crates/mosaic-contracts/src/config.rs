use std::env;
use std::path::{Path, PathBuf};

use serde::Deserialize;

pub const DEFAULT_ENGINE_URL: &str = "http://127.0.0.1:8188";
pub const DEFAULT_HOSTED_BASE_URL: &str = "https://www.meigen.ai";

/// On-disk shape of `~/.config/mosaic/config.json`; every field optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    pub engine_url: Option<String>,
    pub default_template: Option<String>,
    pub templates_dir: Option<PathBuf>,
    pub max_concurrent_jobs: Option<usize>,
    pub hosted_base_url: Option<String>,
    pub hosted_api_token: Option<String>,
}

impl ConfigFile {
    pub fn read(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub engine_url: String,
    pub default_template: Option<String>,
    pub templates_dir: PathBuf,
    pub max_concurrent_jobs: usize,
    pub hosted_base_url: String,
    pub hosted_api_token: Option<String>,
}

impl Config {
    /// Environment first, then the config file, then defaults.
    pub fn load() -> Self {
        let home = env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let file = ConfigFile::read(&config_dir(&home).join("config.json"));
        Self::from_sources(file, |key| env::var(key).ok(), &home)
    }

    pub fn from_sources(
        file: ConfigFile,
        env_lookup: impl Fn(&str) -> Option<String>,
        home: &Path,
    ) -> Self {
        let lookup = |key: &str| {
            env_lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let engine_url = lookup("MOSAIC_ENGINE_URL")
            .or(file.engine_url)
            .map(|value| trim_url(&value))
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_ENGINE_URL.to_string());
        let hosted_base_url = lookup("MOSAIC_HOSTED_BASE_URL")
            .or(file.hosted_base_url)
            .map(|value| trim_url(&value))
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_HOSTED_BASE_URL.to_string());
        let max_concurrent_jobs = lookup("MOSAIC_MAX_CONCURRENT_JOBS")
            .and_then(|value| value.parse::<usize>().ok())
            .or(file.max_concurrent_jobs)
            .unwrap_or(1)
            .max(1);

        Self {
            engine_url,
            default_template: lookup("MOSAIC_DEFAULT_TEMPLATE").or(file.default_template),
            templates_dir: lookup("MOSAIC_TEMPLATES_DIR")
                .map(PathBuf::from)
                .or(file.templates_dir)
                .unwrap_or_else(|| config_dir(home).join("workflows")),
            max_concurrent_jobs,
            hosted_base_url,
            hosted_api_token: lookup("MOSAIC_HOSTED_API_TOKEN").or(file.hosted_api_token),
        }
    }
}

pub fn config_dir(home: &Path) -> PathBuf {
    home.join(".config").join("mosaic")
}

fn trim_url(value: &str) -> String {
    value.trim().trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_file_or_env() {
        let config = Config::from_sources(ConfigFile::default(), env_of(&[]), Path::new("/home/u"));
        assert_eq!(config.engine_url, DEFAULT_ENGINE_URL);
        assert_eq!(config.hosted_base_url, DEFAULT_HOSTED_BASE_URL);
        assert_eq!(config.max_concurrent_jobs, 1);
        assert_eq!(config.default_template, None);
        assert_eq!(
            config.templates_dir,
            PathBuf::from("/home/u/.config/mosaic/workflows")
        );
    }

    #[test]
    fn env_overrides_file_and_blank_env_is_ignored() {
        let file = ConfigFile {
            engine_url: Some("http://gpu-box:8188/".to_string()),
            default_template: Some("portrait".to_string()),
            max_concurrent_jobs: Some(3),
            hosted_api_token: Some("file-token".to_string()),
            ..ConfigFile::default()
        };
        let config = Config::from_sources(
            file,
            env_of(&[
                ("MOSAIC_DEFAULT_TEMPLATE", "anime"),
                ("MOSAIC_ENGINE_URL", "   "),
                ("MOSAIC_MAX_CONCURRENT_JOBS", "0"),
            ]),
            Path::new("/home/u"),
        );
        assert_eq!(config.engine_url, "http://gpu-box:8188");
        assert_eq!(config.default_template.as_deref(), Some("anime"));
        assert_eq!(config.max_concurrent_jobs, 1);
        assert_eq!(config.hosted_api_token.as_deref(), Some("file-token"));
    }

    #[test]
    fn malformed_config_file_reads_as_default() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("config.json");
        std::fs::write(&path, "{ nope")?;
        assert!(ConfigFile::read(&path).engine_url.is_none());

        std::fs::write(&path, r#"{"engineUrl": "http://10.0.0.2:8188", "maxConcurrentJobs": 2}"#)?;
        let file = ConfigFile::read(&path);
        assert_eq!(file.engine_url.as_deref(), Some("http://10.0.0.2:8188"));
        assert_eq!(file.max_concurrent_jobs, Some(2));
        Ok(())
    }
}
