//! Configuration sources for a run

use std::path::{Path, PathBuf};

use run_core::{Error, Mapping, Result};
use serde_json::Value;
use tracing::{debug, instrument};

/// Configuration source capability
pub trait ConfigLoader: Send + Sync {
    /// Produce the run configuration
    fn load(&self) -> Result<Mapping>;
}

/// Structured document formats accepted by [`FileConfigLoader`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
}

impl ConfigFormat {
    /// Infer the format from a file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        match extension.as_str() {
            "json" => Some(ConfigFormat::Json),
            "yaml" | "yml" => Some(ConfigFormat::Yaml),
            _ => None,
        }
    }

    /// Parse `text` into a top-level mapping
    pub fn parse(&self, text: &str) -> Result<Mapping> {
        let value: Value = match self {
            ConfigFormat::Json => serde_json::from_str(text)
                .map_err(|e| Error::config(format!("malformed JSON: {}", e)))?,
            ConfigFormat::Yaml => serde_yaml::from_str(text)
                .map_err(|e| Error::config(format!("malformed YAML: {}", e)))?,
        };

        match value {
            Value::Object(mapping) => Ok(mapping),
            other => Err(Error::config(format!(
                "expected a mapping at the top level, found {}",
                value_kind(&other)
            ))),
        }
    }
}

/// Reads configuration from a JSON or YAML file
#[derive(Debug, Clone)]
pub struct FileConfigLoader {
    path: PathBuf,
}

impl FileConfigLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigLoader for FileConfigLoader {
    #[instrument(skip(self), fields(path = %self.path.display()))]
    fn load(&self) -> Result<Mapping> {
        let format = ConfigFormat::from_path(&self.path).ok_or_else(|| {
            Error::config(format!(
                "unsupported configuration format: {}",
                self.path.display()
            ))
        })?;

        let text = std::fs::read_to_string(&self.path).map_err(|e| {
            Error::config(format!("cannot read {}: {}", self.path.display(), e))
        })?;

        let config = format.parse(&text)?;
        debug!(?format, keys = config.len(), "Configuration loaded");
        Ok(config)
    }
}

/// Serves a caller-supplied mapping
///
/// The mapping is copied on construction and on every load, so neither the
/// caller nor consumers of `load` can change what later loads return.
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigLoader {
    config: Mapping,
}

impl MemoryConfigLoader {
    pub fn new(config: Mapping) -> Self {
        Self { config }
    }

    /// Copy `config` into a new loader
    pub fn from_ref(config: &Mapping) -> Self {
        Self::new(config.clone())
    }
}

impl ConfigLoader for MemoryConfigLoader {
    fn load(&self) -> Result<Mapping> {
        Ok(self.config.clone())
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a sequence",
        Value::Object(_) => "a mapping",
    }
}
