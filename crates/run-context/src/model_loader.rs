//! Model artifact resolution

use std::path::{Path, PathBuf};

use bytes::Bytes;
use run_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// Model source capability
pub trait ModelLoader: Send + Sync {
    /// Resolve the model artifact without reading its payload
    fn load(&self) -> Result<ModelHandle>;
}

/// Declared weight format, inferred from the artifact's extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFormat {
    Safetensors,
    Pytorch,
    Onnx,
    Gguf,
    Directory,
    Unknown,
}

impl ModelFormat {
    fn infer(path: &Path, is_dir: bool) -> Self {
        if is_dir {
            return ModelFormat::Directory;
        }
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match extension.as_deref() {
            Some("safetensors") => ModelFormat::Safetensors,
            Some("pt") | Some("pth") | Some("bin") => ModelFormat::Pytorch,
            Some("onnx") => ModelFormat::Onnx,
            Some("gguf") => ModelFormat::Gguf,
            _ => ModelFormat::Unknown,
        }
    }
}

/// Reference to a model artifact on local disk
///
/// The run context never interprets the artifact; training code reads it
/// through [`materialize`](Self::materialize) or [`files`](Self::files).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelHandle {
    pub id: String,
    pub path: PathBuf,
    pub format: ModelFormat,
    pub is_dir: bool,

    /// File size, or the total size of the files of a directory artifact
    pub size_bytes: u64,
}

impl ModelHandle {
    /// Read a single-file artifact into memory
    pub async fn materialize(&self) -> Result<Bytes> {
        if self.is_dir {
            return Err(Error::ModelArtifact {
                message: format!(
                    "{} is a directory, use files() to read its contents",
                    self.path.display()
                ),
            });
        }
        let data = tokio::fs::read(&self.path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::ModelNotFound {
                path: self.path.display().to_string(),
            },
            _ => Error::Io(e),
        })?;
        Ok(Bytes::from(data))
    }

    /// Files of the artifact, sorted; a single-file artifact lists itself
    pub fn files(&self) -> Result<Vec<PathBuf>> {
        if !self.is_dir {
            return Ok(vec![self.path.clone()]);
        }
        let mut files = Vec::new();
        collect_files(&self.path, &mut files)?;
        files.sort();
        Ok(files)
    }
}

/// Resolves a model artifact on the local filesystem
#[derive(Debug, Clone)]
pub struct LocalModelLoader {
    id: String,
    path: PathBuf,
}

impl LocalModelLoader {
    /// Load the artifact at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { id, path }
    }

    /// Load the artifact at `<base_dir>/models/<id>`
    pub fn from_base_dir(base_dir: impl AsRef<Path>, id: impl Into<String>) -> Self {
        let id = id.into();
        let path = base_dir.as_ref().join("models").join(&id);
        Self { id, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ModelLoader for LocalModelLoader {
    #[instrument(skip(self), fields(path = %self.path.display()))]
    fn load(&self) -> Result<ModelHandle> {
        let metadata = match std::fs::metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::ModelNotFound {
                    path: self.path.display().to_string(),
                })
            }
            Err(e) => return Err(Error::Io(e)),
        };

        let is_dir = metadata.is_dir();
        let size_bytes = if is_dir {
            let mut files = Vec::new();
            collect_files(&self.path, &mut files)?;
            files
                .iter()
                .filter_map(|f| std::fs::metadata(f).ok())
                .map(|m| m.len())
                .sum()
        } else {
            metadata.len()
        };

        let handle = ModelHandle {
            id: self.id.clone(),
            path: self.path.clone(),
            format: ModelFormat::infer(&self.path, is_dir),
            is_dir,
            size_bytes,
        };
        debug!(format = ?handle.format, size_bytes, "Model resolved");
        Ok(handle)
    }
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(&entry.path(), files)?;
        } else if file_type.is_file() {
            files.push(entry.path());
        }
    }
    Ok(())
}
