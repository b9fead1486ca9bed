//! Workflow template loading and input binding.
//!
//! The template is a ComfyUI API-format graph: an object keyed by node id
//! whose values carry an `inputs` object. Binding an uploaded image means
//! writing its stored name into `{node}.inputs.image`.

use std::path::Path;

use serde_json::Value;

use crate::error::PipelineError;

/// A workflow graph ready to have its image inputs bound.
#[derive(Debug, Clone)]
pub struct WorkflowTemplate {
    graph: Value,
}

impl WorkflowTemplate {
    /// Read and parse the template at `path`.
    pub async fn load(path: &Path) -> Result<Self, PipelineError> {
        let raw = tokio::fs::read(path).await.map_err(|e| {
            PipelineError::Workflow(format!("cannot read {}: {e}", path.display()))
        })?;
        let graph: Value = serde_json::from_slice(&raw).map_err(|e| {
            PipelineError::Workflow(format!("invalid JSON in {}: {e}", path.display()))
        })?;
        Self::from_value(graph)
    }

    pub fn from_value(graph: Value) -> Result<Self, PipelineError> {
        if !graph.is_object() {
            return Err(PipelineError::Workflow(
                "workflow graph must be a JSON object".into(),
            ));
        }
        Ok(Self { graph })
    }

    /// Point the image input of `node` at `image_name`.
    pub fn bind_image(&mut self, node: &str, image_name: &str) -> Result<(), PipelineError> {
        let inputs = self
            .graph
            .get_mut(node)
            .and_then(|n| n.get_mut("inputs"))
            .and_then(Value::as_object_mut)
            .ok_or_else(|| {
                PipelineError::Workflow(format!("node {node} has no inputs in the template"))
            })?;
        inputs.insert("image".to_string(), Value::String(image_name.to_string()));
        Ok(())
    }

    pub fn into_graph(self) -> Value {
        self.graph
    }
}

/// Reduce a client-supplied filename to its final path component.
pub fn sanitize_filename(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    match base {
        "" | "." | ".." => "image.png".to_string(),
        other => other.to_string(),
    }
}
