//! Source access - locating experiment files and staging network copies

use crate::error::{LabError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

/// Kind of data file attached to an experiment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    /// Binary multi-channel telemetry
    Telemetry,
    /// Thermal camera recording
    Thermal,
}

impl DataKind {
    /// File name used by [`DirectoryLocator`]
    pub fn default_file_name(&self) -> &'static str {
        match self {
            DataKind::Telemetry => "telemetry.lscp",
            DataKind::Thermal => "thermal.raw",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataKind::Telemetry => f.write_str("telemetry"),
            DataKind::Thermal => f.write_str("thermal"),
        }
    }
}

/// Resolves an experiment's data file.
///
/// Implementations return [`LabError::NotFound`] when the experiment has no
/// file of the requested kind.
#[async_trait]
pub trait SourceLocator: Send + Sync {
    async fn locate(&self, experiment_id: &str, kind: DataKind) -> Result<PathBuf>;
}

/// In-memory locator fed by an external scanner
#[derive(Debug, Default)]
pub struct SourceRegistry {
    sources: RwLock<HashMap<(String, DataKind), PathBuf>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the file for an experiment
    pub fn register(&self, experiment_id: impl Into<String>, kind: DataKind, path: impl Into<PathBuf>) {
        self.sources
            .write()
            .insert((experiment_id.into(), kind), path.into());
    }

    /// Forget every file of an experiment
    pub fn remove_experiment(&self, experiment_id: &str) {
        self.sources.write().retain(|(id, _), _| id != experiment_id);
    }

    pub fn len(&self) -> usize {
        self.sources.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.read().is_empty()
    }
}

#[async_trait]
impl SourceLocator for SourceRegistry {
    async fn locate(&self, experiment_id: &str, kind: DataKind) -> Result<PathBuf> {
        self.sources
            .read()
            .get(&(experiment_id.to_string(), kind))
            .cloned()
            .ok_or_else(|| {
                LabError::NotFound(format!("{} data for experiment {}", kind, experiment_id))
            })
    }
}

/// Locator over a `<root>/<experiment>/<file>` directory tree
#[derive(Debug, Clone)]
pub struct DirectoryLocator {
    root: PathBuf,
}

impl DirectoryLocator {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl SourceLocator for DirectoryLocator {
    async fn locate(&self, experiment_id: &str, kind: DataKind) -> Result<PathBuf> {
        let not_found = || LabError::NotFound(format!("{} data for experiment {}", kind, experiment_id));
        if experiment_id.is_empty()
            || experiment_id.contains(['/', '\\'])
            || experiment_id == ".."
            || experiment_id == "."
        {
            return Err(not_found());
        }
        let path = self.root.join(experiment_id).join(kind.default_file_name());
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            Ok(_) => Err(not_found()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(not_found()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Copies files on slow network paths to local storage before decoding
#[derive(Debug, Clone, Default)]
pub struct Stager {
    staging_dir: Option<PathBuf>,
    network_prefixes: Vec<String>,
}

impl Stager {
    /// A stager that reads every file in place
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn new(staging_dir: impl Into<PathBuf>, network_prefixes: Vec<String>) -> Self {
        Self {
            staging_dir: Some(staging_dir.into()),
            network_prefixes,
        }
    }

    /// Whether `path` lives under one of the configured network prefixes
    pub fn is_network_path(&self, path: &Path) -> bool {
        let path = path.to_string_lossy();
        self.network_prefixes
            .iter()
            .any(|prefix| !prefix.is_empty() && path.starts_with(prefix.as_str()))
    }

    /// Stage `path` if it is on the network, otherwise hand it back as-is
    pub async fn stage(&self, path: &Path) -> Result<StagedFile> {
        let staging_dir = match &self.staging_dir {
            Some(dir) if self.is_network_path(path) => dir,
            _ => return Ok(StagedFile::in_place(path)),
        };

        fs::create_dir_all(staging_dir).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "data".to_string());
        let target = staging_dir.join(format!("{}-{}", Uuid::new_v4(), file_name));

        // Guard first so a failed copy still cleans up the partial file
        let staged = StagedFile {
            path: target,
            temporary: true,
            released: false,
        };
        let bytes = fs::copy(path, &staged.path).await?;
        tracing::debug!(
            source = %path.display(),
            staged = %staged.path.display(),
            bytes,
            "staged network file"
        );
        Ok(staged)
    }
}

/// A file ready for local reading.
///
/// Staged copies are removed on [`release`](Self::release) or on drop.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    temporary: bool,
    released: bool,
}

impl StagedFile {
    fn in_place(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            temporary: false,
            released: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this is a staged copy rather than the source itself
    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    /// Remove the staged copy, if any
    pub async fn release(mut self) {
        if self.temporary {
            if let Err(e) = fs::remove_file(&self.path).await {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove staged file");
            }
        }
        self.released = true;
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.temporary && !self.released {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_registry_locate() {
        let registry = SourceRegistry::new();
        registry.register("exp-1", DataKind::Telemetry, "/data/exp-1/run.lscp");

        let path = registry.locate("exp-1", DataKind::Telemetry).await.unwrap();
        assert_eq!(path, PathBuf::from("/data/exp-1/run.lscp"));

        let err = registry.locate("exp-1", DataKind::Thermal).await.unwrap_err();
        assert!(err.is_not_found());

        registry.remove_experiment("exp-1");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_directory_locator() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("exp-7");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("telemetry.lscp"), b"LSCP").unwrap();

        let locator = DirectoryLocator::new(root.path());
        let path = locator.locate("exp-7", DataKind::Telemetry).await.unwrap();
        assert_eq!(path, dir.join("telemetry.lscp"));

        assert!(locator.locate("exp-8", DataKind::Telemetry).await.unwrap_err().is_not_found());
        assert!(locator.locate("../exp-7", DataKind::Telemetry).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_local_files_are_not_staged() {
        let stager = Stager::new("/tmp/staging", vec!["//".to_string()]);
        let staged = stager.stage(Path::new("/data/run.lscp")).await.unwrap();
        assert!(!staged.is_temporary());
        assert_eq!(staged.path(), Path::new("/data/run.lscp"));
    }

    #[tokio::test]
    async fn test_network_file_staged_and_removed() {
        let share = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let source = share.path().join("run.lscp");
        std::fs::write(&source, b"payload").unwrap();

        let prefix = share.path().to_string_lossy().into_owned();
        let stager = Stager::new(staging.path(), vec![prefix]);
        assert!(stager.is_network_path(&source));

        let staged = stager.stage(&source).await.unwrap();
        assert!(staged.is_temporary());
        let copy = staged.path().to_path_buf();
        assert!(copy.starts_with(staging.path()));
        assert_eq!(std::fs::read(&copy).unwrap(), b"payload");

        staged.release().await;
        assert!(!copy.exists());
        assert!(source.exists());
    }

    #[tokio::test]
    async fn test_staged_copy_removed_on_drop() {
        let share = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let source = share.path().join("run.lscp");
        std::fs::write(&source, b"payload").unwrap();

        let stager = Stager::new(staging.path(), vec![share.path().to_string_lossy().into_owned()]);
        let copy = {
            let staged = stager.stage(&source).await.unwrap();
            staged.path().to_path_buf()
        };
        assert!(!copy.exists());
    }

    #[tokio::test]
    async fn test_missing_network_file_leaves_nothing_behind() {
        let share = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let stager = Stager::new(staging.path(), vec![share.path().to_string_lossy().into_owned()]);

        let err = stager.stage(&share.path().join("missing.lscp")).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);
    }
}
