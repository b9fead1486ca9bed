//! On-disk result storage.
//!
//! Layout: `{root}/{submitter}/comfyui/results/{prompt_id}_result.png`.
//! Both the submitter and the artifact name become path components, so
//! both are checked before touching the filesystem.

use std::path::{Path, PathBuf};

use tinter_core::error::CoreError;

use crate::error::PipelineError;

/// Persists and serves job result artifacts.
#[derive(Debug, Clone)]
pub struct ResultStore {
    root: PathBuf,
}

impl ResultStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stored file name for the result of `prompt_id`.
    pub fn artifact_name(prompt_id: &str) -> String {
        format!("{prompt_id}_result.png")
    }

    /// Download URL under which the result of `prompt_id` is served.
    pub fn result_url(submitter: &str, prompt_id: &str) -> String {
        format!("/download/{submitter}/{}", Self::artifact_name(prompt_id))
    }

    fn results_dir(&self, submitter: &str) -> PathBuf {
        self.root.join(submitter).join("comfyui").join("results")
    }

    /// Write the result bytes, creating directories as needed.
    pub async fn save(
        &self,
        submitter: &str,
        prompt_id: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, PipelineError> {
        check_component("submitter", submitter)?;
        let name = Self::artifact_name(prompt_id);
        check_component("artifact", &name)?;

        let dir = self.results_dir(submitter);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(name);
        tokio::fs::write(&path, bytes).await?;

        tracing::debug!(path = %path.display(), size = bytes.len(), "Stored result");
        Ok(path)
    }

    /// Read back a stored artifact.
    pub async fn fetch_result(
        &self,
        submitter: &str,
        artifact: &str,
    ) -> Result<Vec<u8>, CoreError> {
        check_component("submitter", submitter)?;
        check_component("artifact", artifact)?;

        let path = self.results_dir(submitter).join(artifact);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CoreError::NotFound {
                entity: "Result",
                id: format!("{submitter}/{artifact}"),
            }),
            Err(e) => Err(CoreError::Internal(format!(
                "failed to read {}: {e}",
                path.display()
            ))),
        }
    }
}

/// Reject values that would escape their directory when used as a path
/// component.
pub fn check_component(kind: &str, value: &str) -> Result<(), CoreError> {
    if value.is_empty()
        || value == "."
        || value.contains("..")
        || value.contains(['/', '\\', '\0'])
    {
        return Err(CoreError::Validation(format!("invalid {kind} name: {value:?}")));
    }
    Ok(())
}
