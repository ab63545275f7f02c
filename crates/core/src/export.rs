use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::info;

use crate::gateway::{GatewayClient, GatewayError, GatewayRequest};
use crate::type_mapping::{TypeMappingError, TypeMappingPlan};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("export query is empty")]
    EmptyQuery,
    #[error("no tables or query selected for export")]
    NothingToExport,
    #[error("type mapping plan does not cover table `{table}`")]
    PlanMismatch { table: String },
    #[error(transparent)]
    TypeMapping(#[from] TypeMappingError),
    #[error("failed to encode export options: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsvOptions {
    pub include_header: bool,
    pub separator: String,
    pub quote: String,
    pub encoding: String,
    pub null_value: String,
    pub date_format: String,
    /// Zero exports every row.
    pub max_rows: u64,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            include_header: true,
            separator: ",".to_string(),
            quote: "\"".to_string(),
            encoding: "UTF-8".to_string(),
            null_value: String::new(),
            date_format: "2006-01-02 15:04:05".to_string(),
            max_rows: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SqlOptions {
    pub include_create_table: bool,
    pub include_drop_table: bool,
    pub batch_insert: bool,
    pub batch_size: u32,
    pub structure_only: bool,
    pub max_rows: u64,
    /// Exports the rows of this query instead of whole tables.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub query: String,
    /// Table name used in INSERT statements for a query export.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub table_name: String,
}

impl Default for SqlOptions {
    fn default() -> Self {
        Self {
            include_create_table: true,
            include_drop_table: false,
            batch_insert: true,
            batch_size: 100,
            structure_only: false,
            max_rows: 0,
            query: String::new(),
            table_name: String::new(),
        }
    }
}

/// Downloads CSV and SQL exports as raw bytes.
pub struct ExportService<G: GatewayClient> {
    gateway: Arc<G>,
}

impl<G: GatewayClient> ExportService<G> {
    #[must_use]
    pub fn new(gateway: Arc<G>) -> Self {
        Self { gateway }
    }

    pub async fn export_csv(
        &self,
        connection_id: &str,
        query: &str,
        options: &CsvOptions,
        database: Option<&str>,
    ) -> Result<Vec<u8>, ExportError> {
        if query.trim().is_empty() {
            return Err(ExportError::EmptyQuery);
        }

        let request = GatewayRequest::post(["connections", connection_id, "export", "csv"])
            .with_query("database", database)
            .with_body(json!({
                "query": query,
                "opts": options,
                "database": database.unwrap_or_default(),
            }));
        let payload = self.gateway.download(request).await?;
        info!(bytes = payload.len(), "csv export downloaded");
        Ok(payload)
    }

    /// With a plan, every user-choice type must be resolved and the plan must
    /// have been previewed for each exported table. The resolved mapping and
    /// target dialect are then sent along with the options.
    pub async fn export_sql(
        &self,
        connection_id: &str,
        tables: &[String],
        options: &SqlOptions,
        database: Option<&str>,
        plan: Option<&TypeMappingPlan>,
    ) -> Result<Vec<u8>, ExportError> {
        if tables.is_empty() && options.query.trim().is_empty() {
            return Err(ExportError::NothingToExport);
        }

        let mut body = json!({
            "tables": tables,
            "opts": serde_json::to_value(options)?,
            "database": database.unwrap_or_default(),
        });
        if let Some(plan) = plan {
            if let Some(table) = tables.iter().find(|table| !plan.tables().contains(*table)) {
                return Err(ExportError::PlanMismatch {
                    table: table.clone(),
                });
            }
            plan.ensure_ready()?;
            if let Value::Object(fields) = &mut body {
                fields.insert("targetDbType".to_string(), json!(plan.target()));
                fields.insert("typeMappings".to_string(), json!(plan.resolved_mappings()));
            }
        }

        let request = GatewayRequest::post(["connections", connection_id, "export", "sql"])
            .with_query("database", database)
            .with_body(body);
        let payload = self.gateway.download(request).await?;
        info!(bytes = payload.len(), tables = tables.len(), "sql export downloaded");
        Ok(payload)
    }
}
