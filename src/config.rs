use crate::{db::DEFAULT_CACHE_FILE, error::IngestError};
use serde::{Deserialize, Serialize};
use std::{
    fs::{read_to_string, write},
    path::{Path, PathBuf},
};

pub const DEFAULT_PIPELINE_BUFFER: usize = 64;
pub const DEFAULT_FLUSH_BATCH: usize = 10_000;

/// What to do with a `<drug>` element that lacks required fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedRecordPolicy {
    /// Log it, report it as a diagnostic, and continue with the next record.
    #[default]
    Skip,
    /// Stop the import with the parse error. Records committed so far stay.
    Abort,
}

/// Settings for one [crate::manager::Manager].
///
/// ```toml
/// cache_path = "/var/cache/drugbank/cache.db"
/// malformed_records = "abort"
/// pipeline_buffer = 128
/// flush_batch = 5000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    pub cache_path: PathBuf,
    pub malformed_records: MalformedRecordPolicy,
    /// Capacity of the channel between the parser task and the populator.
    pub pipeline_buffer: usize,
    /// Staged forward references resolved per transaction once the stream ends.
    pub flush_batch: usize,
}

impl Default for ImportConfig {
    fn default() -> Self {
        ImportConfig {
            cache_path: PathBuf::from(DEFAULT_CACHE_FILE),
            malformed_records: MalformedRecordPolicy::default(),
            pipeline_buffer: DEFAULT_PIPELINE_BUFFER,
            flush_batch: DEFAULT_FLUSH_BATCH,
        }
    }
}

impl ImportConfig {
    pub fn new<P: Into<PathBuf>>(cache_path: P) -> Self {
        ImportConfig {
            cache_path: cache_path.into(),
            ..Default::default()
        }
    }

    pub fn with_malformed_records(mut self, policy: MalformedRecordPolicy) -> Self {
        self.malformed_records = policy;
        self
    }

    pub fn with_pipeline_buffer(mut self, buffer: usize) -> Self {
        self.pipeline_buffer = buffer;
        self
    }

    pub fn with_flush_batch(mut self, batch: usize) -> Self {
        self.flush_batch = batch;
        self
    }

    pub fn from_toml_str(content: &str) -> Result<Self, IngestError> {
        let config: ImportConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Missing keys take their defaults. A missing file is [IngestError::NotFound].
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, IngestError> {
        tracing::debug!("Attempting to read import config from: {:?}", path.as_ref());
        let content = read_to_string(path.as_ref())?;
        ImportConfig::from_toml_str(&content)
    }

    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<(), IngestError> {
        tracing::debug!("Attempting to write import config to: {:?}", path.as_ref());
        let toml_string = toml::to_string(self)?;
        write(path.as_ref(), toml_string)?;
        Ok(())
    }

    fn validate(&self) -> Result<(), IngestError> {
        if self.pipeline_buffer == 0 {
            return Err(IngestError::Config(
                "pipeline_buffer must be at least 1".to_string(),
            ));
        }
        if self.flush_batch == 0 {
            return Err(IngestError::Config(
                "flush_batch must be at least 1".to_string(),
            ));
        }
        if self.cache_path.as_os_str().is_empty() {
            return Err(IngestError::Config("cache_path is empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn missing_keys_take_defaults() {
        let config = ImportConfig::from_toml_str("malformed_records = \"abort\"").unwrap();
        assert_eq!(config.malformed_records, MalformedRecordPolicy::Abort);
        assert_eq!(config.pipeline_buffer, DEFAULT_PIPELINE_BUFFER);
        assert_eq!(config.flush_batch, DEFAULT_FLUSH_BATCH);
        assert_eq!(config.cache_path, PathBuf::from(DEFAULT_CACHE_FILE));
    }

    #[test]
    fn rejects_zero_buffer_and_unknown_policy() {
        assert!(matches!(
            ImportConfig::from_toml_str("pipeline_buffer = 0"),
            Err(IngestError::Config(_))
        ));
        assert!(matches!(
            ImportConfig::from_toml_str("flush_batch = 0"),
            Err(IngestError::Config(_))
        ));
        assert!(matches!(
            ImportConfig::from_toml_str("malformed_records = \"ignore\""),
            Err(IngestError::Config(_))
        ));
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("import.toml");
        let config = ImportConfig::new(dir.path().join("cache.db"))
            .with_malformed_records(MalformedRecordPolicy::Abort)
            .with_pipeline_buffer(8)
            .with_flush_batch(100);
        config.to_toml_file(&path).unwrap();
        assert_eq!(ImportConfig::from_toml_file(&path).unwrap(), config);
        assert!(matches!(
            ImportConfig::from_toml_file(dir.path().join("absent.toml")),
            Err(IngestError::NotFound(_))
        ));
    }
}
