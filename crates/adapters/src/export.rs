use std::fs;
use std::path::Path;

use dbm_core::model::QueryResult;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to write export file at {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize JSON export: {0}")]
    Json(#[from] serde_json::Error),
}

/// Writes a downloaded CSV/SQL export to disk as-is.
pub fn save_download(path: &Path, payload: &[u8]) -> Result<usize, ExportError> {
    if let Some(parent_dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(parent_dir).map_err(|source| write_error(parent_dir, source))?;
    }
    fs::write(path, payload).map_err(|source| write_error(path, source))?;
    info!(path = %path.display(), bytes = payload.len(), "export saved");
    Ok(payload.len())
}

/// Columns follow `result.columns`; cells missing from a row are left empty.
///
/// Rows arrive as name-keyed objects, so result columns sharing a name (as in
/// `SELECT a.id, b.id`) all show the one value the gateway kept for that name.
pub fn write_result_csv(path: &Path, result: &QueryResult) -> Result<usize, ExportError> {
    let mut content = String::new();
    content.push_str(
        &result
            .columns
            .iter()
            .map(|header| csv_escape(header))
            .collect::<Vec<_>>()
            .join(","),
    );
    content.push('\n');

    for row in &result.rows {
        let values = result
            .columns
            .iter()
            .map(|column| csv_escape(&cell_text(row.get(column))))
            .collect::<Vec<_>>();
        content.push_str(&values.join(","));
        content.push('\n');
    }

    fs::write(path, content).map_err(|source| write_error(path, source))?;
    Ok(result.rows.len())
}

/// One object per row, keys in `result.columns` order. Columns sharing a name
/// collapse into a single key, the same limitation as [`write_result_csv`].
pub fn write_result_json(path: &Path, result: &QueryResult) -> Result<usize, ExportError> {
    let records = result
        .rows
        .iter()
        .map(|row| {
            let object = result
                .columns
                .iter()
                .map(|column| (column.clone(), row.get(column).cloned().unwrap_or(Value::Null)))
                .collect::<Map<_, _>>();
            Value::Object(object)
        })
        .collect::<Vec<_>>();

    let payload = serde_json::to_string_pretty(&records)?;
    fs::write(path, payload).map_err(|source| write_error(path, source))?;
    Ok(result.rows.len())
}

fn cell_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

fn csv_escape(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn write_error(path: &Path, source: std::io::Error) -> ExportError {
    ExportError::Write {
        path: path.display().to_string(),
        source,
    }
}
