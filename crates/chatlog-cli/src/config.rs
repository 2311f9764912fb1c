use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

/// Optional YAML settings file. Command-line flags and environment variables win over it.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub data_dir: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub key: Option<String>,
    pub workers: Option<usize>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let body = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&body).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(body: &str) -> Result<Self> {
        if body.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(body)?)
    }
}

/// Effective settings after layering flags over the config file.
#[derive(Clone)]
pub struct Settings {
    data_dir: Option<PathBuf>,
    work_dir: Option<PathBuf>,
    key: Option<String>,
    pub workers: usize,
}

pub const DEFAULT_WORKERS: usize = 8;

impl Settings {
    pub fn resolve(
        file: FileConfig,
        data_dir: Option<PathBuf>,
        work_dir: Option<PathBuf>,
        key: Option<String>,
        workers: Option<usize>,
    ) -> Self {
        Self {
            data_dir: data_dir.or(file.data_dir),
            work_dir: work_dir.or(file.work_dir),
            key: key.or(file.key),
            workers: workers.or(file.workers).unwrap_or(DEFAULT_WORKERS),
        }
    }

    pub fn key(&self) -> Result<&str> {
        self.key.as_deref().ok_or_else(|| {
            anyhow!("no key given: pass --key, set CHATLOG_KEY or add `key` to the config file")
        })
    }

    pub fn data_dir(&self) -> Result<&Path> {
        self.data_dir
            .as_deref()
            .ok_or_else(|| anyhow!("no data directory: pass --data-dir or set CHATLOG_DATA_DIR"))
    }

    pub fn work_dir(&self) -> Result<&Path> {
        self.work_dir
            .as_deref()
            .ok_or_else(|| anyhow!("no work directory: pass --work-dir or set CHATLOG_WORK_DIR"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_file() -> Result<()> {
        let config = FileConfig::parse(
            "data_dir: /srv/chat/raw\nwork_dir: /srv/chat/plain\nkey: \"00ff\"\nworkers: 2\n",
        )?;
        assert_eq!(config.data_dir, Some(PathBuf::from("/srv/chat/raw")));
        assert_eq!(config.work_dir, Some(PathBuf::from("/srv/chat/plain")));
        assert_eq!(config.key.as_deref(), Some("00ff"));
        assert_eq!(config.workers, Some(2));
        Ok(())
    }

    #[test]
    fn empty_file_is_default() -> Result<()> {
        assert_eq!(FileConfig::parse("  \n")?, FileConfig::default());
        Ok(())
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(FileConfig::parse("worker_count: 3\n").is_err());
    }

    #[test]
    fn flags_override_file_values() -> Result<()> {
        let file = FileConfig {
            data_dir: Some("/from/file".into()),
            work_dir: Some("/from/file/work".into()),
            key: Some("filekey".into()),
            workers: Some(3),
        };
        let settings = Settings::resolve(file, Some("/from/flag".into()), None, None, None);

        assert_eq!(settings.data_dir()?, Path::new("/from/flag"));
        assert_eq!(settings.work_dir()?, Path::new("/from/file/work"));
        assert_eq!(settings.key()?, "filekey");
        assert_eq!(settings.workers, 3);
        Ok(())
    }

    #[test]
    fn missing_values_explain_themselves() {
        let settings = Settings::resolve(FileConfig::default(), None, None, None, None);
        assert_eq!(settings.workers, DEFAULT_WORKERS);
        let err = settings.key().err().map(|err| err.to_string()).unwrap_or_default();
        assert!(err.contains("CHATLOG_KEY"), "{err}");
    }
}
