//! Downloading generated files referenced by node outputs.
//!
//! Output nodes report files as arrays of `{filename, subfolder, type}`
//! objects under keys such as `images` or `gifs`. Every such reference is
//! fetched through `GET /view` and written into the run's output directory.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::api::{ComfyUIApi, ComfyUIApiError, FileRef};

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("Failed to download {filename}: {source}")]
    Download {
        filename: String,
        #[source]
        source: ComfyUIApiError,
    },

    #[error("Failed to write output file: {0}")]
    Io(#[from] std::io::Error),
}

/// Every file reference in `outputs`, paired with the node that produced it.
pub fn collect_file_refs(outputs: &Value) -> Vec<(String, FileRef)> {
    let Some(nodes) = outputs.as_object() else {
        return Vec::new();
    };

    let mut refs = Vec::new();
    for (node_id, node_output) in nodes {
        let Some(fields) = node_output.as_object() else {
            continue;
        };
        for items in fields.values().filter_map(Value::as_array) {
            for item in items {
                if item.get("filename").is_none() {
                    continue;
                }
                if let Ok(file) = serde_json::from_value::<FileRef>(item.clone()) {
                    refs.push((node_id.clone(), file));
                }
            }
        }
    }
    refs
}

/// Local name for a downloaded file: `<run>_<node>_<basename>`.
///
/// Only the final path component of the server's filename is kept so a
/// hostile name cannot escape the output directory.
pub fn local_file_name(run_id: &str, node_id: &str, file: &FileRef) -> String {
    let basename = Path::new(&file.filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("output");
    format!("{run_id}_{node_id}_{basename}")
}

/// Download every file referenced in `outputs` into `output_dir`.
pub async fn save_outputs(
    api: &ComfyUIApi,
    outputs: &Value,
    output_dir: &Path,
    run_id: &str,
) -> Result<Vec<PathBuf>, OutputError> {
    let refs = collect_file_refs(outputs);
    if refs.is_empty() {
        return Ok(Vec::new());
    }

    tokio::fs::create_dir_all(output_dir).await?;

    let mut saved = Vec::with_capacity(refs.len());
    for (node_id, file) in refs {
        let bytes = api
            .fetch_file(&file)
            .await
            .map_err(|source| OutputError::Download {
                filename: file.filename.clone(),
                source,
            })?;
        let path = output_dir.join(local_file_name(run_id, &node_id, &file));
        tokio::fs::write(&path, &bytes).await?;
        tracing::debug!(
            run_id,
            node_id = %node_id,
            path = %path.display(),
            bytes = bytes.len(),
            "Saved output file",
        );
        saved.push(path);
    }
    Ok(saved)
}
