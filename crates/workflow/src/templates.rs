//! Workflow templates loaded from a directory of JSON files.
//!
//! Every `*.json` file in the templates directory is one template, keyed by
//! its file stem (`image_gen.json` -> `image_gen`). Files that cannot be
//! read or are not JSON objects are skipped with a warning so one broken
//! template does not take the others down.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use studio_core::graph::WorkflowGraph;
use tokio::sync::RwLock;

use crate::error::WorkflowError;

pub struct TemplateStore {
    dir: PathBuf,
    templates: RwLock<HashMap<String, WorkflowGraph>>,
}

impl TemplateStore {
    /// Load every template in `dir`, creating the directory if needed.
    pub async fn load(dir: impl Into<PathBuf>) -> Result<Self, WorkflowError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        let templates = read_templates(&dir).await?;
        tracing::info!(
            dir = %dir.display(),
            count = templates.len(),
            "Loaded workflow templates",
        );
        Ok(Self {
            dir,
            templates: RwLock::new(templates),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Re-read the directory, replacing the loaded set. Returns the number
    /// of templates now available.
    pub async fn reload(&self) -> Result<usize, WorkflowError> {
        let templates = read_templates(&self.dir).await?;
        let count = templates.len();
        *self.templates.write().await = templates;
        tracing::info!(count, "Reloaded workflow templates");
        Ok(count)
    }

    /// A copy of the named template.
    pub async fn get(&self, name: &str) -> Option<WorkflowGraph> {
        self.templates.read().await.get(name).cloned()
    }

    /// Loaded template names, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.templates.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Write `<name>.json` and make it available immediately.
    pub async fn save(&self, name: &str, template: &WorkflowGraph) -> Result<PathBuf, WorkflowError> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(WorkflowError::InvalidDocument(format!(
                "Invalid template name '{name}'"
            )));
        }
        let path = self.dir.join(format!("{name}.json"));
        let body = serde_json::to_vec_pretty(template)?;
        tokio::fs::write(&path, body).await?;
        self.templates
            .write()
            .await
            .insert(name.to_string(), template.clone());
        tracing::info!(template = name, path = %path.display(), "Saved workflow template");
        Ok(path)
    }
}

async fn read_templates(dir: &Path) -> Result<HashMap<String, WorkflowGraph>, WorkflowError> {
    let mut templates = HashMap::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        match read_template(&path).await {
            Ok(graph) => {
                templates.insert(name.to_string(), graph);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable template");
            }
        }
    }
    Ok(templates)
}

async fn read_template(path: &Path) -> Result<WorkflowGraph, WorkflowError> {
    let bytes = tokio::fs::read(path).await?;
    let value: serde_json::Value = serde_json::from_slice(&bytes)?;
    WorkflowGraph::from_value(value).map_err(|e| WorkflowError::InvalidDocument(e.to_string()))
}
