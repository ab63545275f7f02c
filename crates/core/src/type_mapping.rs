//! Column type translation preview for cross-dialect SQL export.
//!
//! The preview is advisory: it reads table definitions server-side and
//! reports how each source type maps onto the target dialect. Types the
//! server cannot map on its own are listed under `requires_user`, and a
//! [`TypeMappingPlan`] collects the caller's choices for them before an
//! export may run.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use crate::gateway::{request_data, GatewayClient, GatewayError, GatewayRequest};
use crate::model::{non_empty, null_as_default, DatabaseType};

#[derive(Debug, Error)]
pub enum TypeMappingError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("no tables selected for type mapping")]
    NoTables,
    #[error(
        "type mapping summary is inconsistent: total {total} != direct {direct} + fallback {fallback} + user choice {user_choice}"
    )]
    InconsistentSummary {
        total: u64,
        direct: u64,
        fallback: u64,
        user_choice: u64,
    },
    #[error("`{source_type}` does not need a user choice")]
    UnknownSourceType { source_type: String },
    #[error("`{target_type}` is not an offered option for `{source_type}`")]
    InvalidChoice {
        source_type: String,
        target_type: String,
    },
    #[error("type choices still required for: {}", .source_types.join(", "))]
    Unresolved { source_types: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeOption {
    #[serde(alias = "Label")]
    pub label: String,
    #[serde(alias = "Value")]
    pub value: String,
}

/// The server emits rules with either camelCase or PascalCase keys.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeRule {
    #[serde(default, alias = "TargetType")]
    pub target_type: String,
    #[serde(default, alias = "SafeFallback")]
    pub safe_fallback: String,
    #[serde(default, alias = "PrecisionLoss")]
    pub precision_loss: bool,
    #[serde(default, alias = "RequiresUser")]
    pub requires_user: bool,
    #[serde(default, alias = "UserOptions", deserialize_with = "null_as_default")]
    pub user_options: Vec<TypeOption>,
    #[serde(default, alias = "Note")]
    pub note: String,
}

impl TypeRule {
    #[must_use]
    pub fn offers(&self, target_type: &str) -> bool {
        self.user_options.is_empty()
            || self
                .user_options
                .iter()
                .any(|option| option.value.eq_ignore_ascii_case(target_type))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeSummary {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub direct: u64,
    #[serde(default)]
    pub fallback: u64,
    #[serde(default)]
    pub user_choice: u64,
    #[serde(default)]
    pub lossy_count: u64,
}

impl TypeSummary {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.direct
            .checked_add(self.fallback)
            .and_then(|sum| sum.checked_add(self.user_choice))
            == Some(self.total)
    }

    pub fn ensure_consistent(&self) -> Result<(), TypeMappingError> {
        if self.is_consistent() {
            return Ok(());
        }
        Err(TypeMappingError::InconsistentSummary {
            total: self.total,
            direct: self.direct,
            fallback: self.fallback,
            user_choice: self.user_choice,
        })
    }
}

/// Keys of `mapped` and `requires_user` are source type names.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeMappingResult {
    #[serde(default)]
    pub success: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub mapped: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub warnings: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub requires_user: BTreeMap<String, TypeRule>,
    #[serde(default)]
    pub summary: TypeSummary,
}

/// A preview plus the caller's answers for every type that needs one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeMappingPlan {
    tables: Vec<String>,
    target: DatabaseType,
    result: TypeMappingResult,
    choices: BTreeMap<String, String>,
}

impl TypeMappingPlan {
    pub fn new(
        tables: Vec<String>,
        target: DatabaseType,
        result: TypeMappingResult,
    ) -> Result<Self, TypeMappingError> {
        result.summary.ensure_consistent()?;
        Ok(Self {
            tables,
            target,
            result,
            choices: BTreeMap::new(),
        })
    }

    #[must_use]
    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    #[must_use]
    pub fn target(&self) -> DatabaseType {
        self.target
    }

    #[must_use]
    pub fn result(&self) -> &TypeMappingResult {
        &self.result
    }

    #[must_use]
    pub fn covers(&self, tables: &[String]) -> bool {
        tables.iter().all(|table| self.tables.contains(table))
    }

    /// Records the target type to use for `source_type`. When the rule lists
    /// options, the choice must be one of them.
    pub fn resolve(&mut self, source_type: &str, target_type: &str) -> Result<(), TypeMappingError> {
        let Some(rule) = self.result.requires_user.get(source_type) else {
            return Err(TypeMappingError::UnknownSourceType {
                source_type: source_type.to_string(),
            });
        };
        let invalid = || TypeMappingError::InvalidChoice {
            source_type: source_type.to_string(),
            target_type: target_type.to_string(),
        };
        let Some(target_type) = non_empty(target_type) else {
            return Err(invalid());
        };
        if !rule.offers(target_type) {
            return Err(invalid());
        }

        self.choices
            .insert(source_type.to_string(), target_type.to_string());
        Ok(())
    }

    #[must_use]
    pub fn choice(&self, source_type: &str) -> Option<&str> {
        self.choices.get(source_type).map(String::as_str)
    }

    #[must_use]
    pub fn unresolved(&self) -> Vec<&str> {
        self.result
            .requires_user
            .keys()
            .filter(|source_type| !self.choices.contains_key(*source_type))
            .map(String::as_str)
            .collect()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.unresolved().is_empty()
    }

    pub fn ensure_ready(&self) -> Result<(), TypeMappingError> {
        let unresolved = self.unresolved();
        if unresolved.is_empty() {
            return Ok(());
        }
        Err(TypeMappingError::Unresolved {
            source_types: unresolved.into_iter().map(str::to_string).collect(),
        })
    }

    /// Server-mapped types merged with the caller's choices.
    #[must_use]
    pub fn resolved_mappings(&self) -> BTreeMap<String, String> {
        let mut mappings = self.result.mapped.clone();
        mappings.extend(
            self.choices
                .iter()
                .map(|(source, target)| (source.clone(), target.clone())),
        );
        mappings
    }
}

pub struct TypeMappingPreviewer<G: GatewayClient> {
    gateway: Arc<G>,
}

impl<G: GatewayClient> TypeMappingPreviewer<G> {
    #[must_use]
    pub fn new(gateway: Arc<G>) -> Self {
        Self { gateway }
    }

    pub async fn preview_export_type_mapping(
        &self,
        connection_id: &str,
        tables: &[String],
        target: DatabaseType,
    ) -> Result<TypeMappingResult, TypeMappingError> {
        if tables.is_empty() {
            return Err(TypeMappingError::NoTables);
        }

        let result: TypeMappingResult = request_data(
            self.gateway.as_ref(),
            GatewayRequest::post(["connections", connection_id, "export", "sql", "preview"])
                .with_body(json!({ "tables": tables, "targetDbType": target })),
            "failed to preview type mapping",
        )
        .await?;

        if let Err(error) = result.summary.ensure_consistent() {
            warn!(%error, "rejecting type mapping preview");
            return Err(error);
        }
        debug!(
            target = target.as_str(),
            direct = result.summary.direct,
            user_choice = result.summary.user_choice,
            "type mapping previewed"
        );
        Ok(result)
    }

    /// Previews and wraps the result in a plan ready for the caller's choices.
    pub async fn plan(
        &self,
        connection_id: &str,
        tables: &[String],
        target: DatabaseType,
    ) -> Result<TypeMappingPlan, TypeMappingError> {
        let result = self
            .preview_export_type_mapping(connection_id, tables, target)
            .await?;
        TypeMappingPlan::new(tables.to_vec(), target, result)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{json, Value};

    use super::{TypeMappingError, TypeMappingPlan, TypeMappingPreviewer, TypeMappingResult, TypeSummary};
    use crate::gateway::Method;
    use crate::model::DatabaseType;
    use crate::test_support::ScriptedGateway;

    fn preview_with_user_choice() -> Value {
        json!({
            "success": false,
            "mapped": { "int": "integer", "varchar": "varchar" },
            "warnings": ["enum has no direct equivalent"],
            "requiresUser": {
                "enum": {
                    "TargetType": "",
                    "SafeFallback": "text",
                    "PrecisionLoss": false,
                    "RequiresUser": true,
                    "UserOptions": [
                        { "Label": "Text", "Value": "text" },
                        { "Label": "Varchar(255)", "Value": "varchar(255)" }
                    ],
                    "Note": "choose a representation for enum values"
                }
            },
            "summary": { "total": 3, "direct": 2, "fallback": 0, "userChoice": 1, "lossyCount": 0 }
        })
    }

    fn orders() -> Vec<String> {
        vec!["orders".to_string()]
    }

    #[tokio::test]
    async fn preview_blocks_until_user_choice_is_made() {
        let gateway = ScriptedGateway::new();
        gateway.ok(Method::Post, "connections/c1/export/sql/preview", preview_with_user_choice());
        let previewer = TypeMappingPreviewer::new(Arc::clone(&gateway));

        let mut plan = previewer
            .plan("c1", &orders(), DatabaseType::Postgresql)
            .await
            .expect("preview should succeed");

        let body = gateway.last_call().and_then(|call| call.body);
        assert_eq!(body, Some(json!({ "tables": ["orders"], "targetDbType": "postgresql" })));
        let rule = &plan.result().requires_user["enum"];
        assert!(rule.requires_user);
        assert_eq!(rule.user_options.len(), 2);
        assert_eq!(plan.unresolved(), vec!["enum"]);
        assert!(matches!(
            plan.ensure_ready(),
            Err(TypeMappingError::Unresolved { ref source_types }) if source_types == &vec!["enum".to_string()]
        ));

        plan.resolve("enum", "varchar(255)").expect("offered option should resolve");
        assert!(plan.is_ready());
        assert_eq!(
            plan.resolved_mappings().get("enum").map(String::as_str),
            Some("varchar(255)")
        );
        assert_eq!(plan.resolved_mappings().len(), 3);
    }

    #[tokio::test]
    async fn inconsistent_summary_is_rejected_on_receipt() {
        let gateway = ScriptedGateway::new();
        let mut preview = preview_with_user_choice();
        preview["summary"]["total"] = json!(4);
        gateway.ok(Method::Post, "connections/c1/export/sql/preview", preview);
        let previewer = TypeMappingPreviewer::new(Arc::clone(&gateway));

        let err = previewer
            .preview_export_type_mapping("c1", &orders(), DatabaseType::Postgresql)
            .await
            .expect_err("summary should be rejected");

        assert!(matches!(err, TypeMappingError::InconsistentSummary { total: 4, .. }));
    }

    #[tokio::test]
    async fn same_dialect_preview_with_null_collections_parses() {
        let gateway = ScriptedGateway::new();
        gateway.ok(
            Method::Post,
            "connections/c1/export/sql/preview",
            json!({
                "success": true,
                "mapped": { "int": "int" },
                "warnings": null,
                "requiresUser": null,
                "summary": { "total": 4, "direct": 4 }
            }),
        );
        let previewer = TypeMappingPreviewer::new(Arc::clone(&gateway));

        let plan = previewer
            .plan("c1", &orders(), DatabaseType::Mysql)
            .await
            .expect("preview should succeed");
        assert!(plan.is_ready());
        assert!(plan.result().warnings.is_empty());
    }

    #[tokio::test]
    async fn empty_table_list_never_reaches_gateway() {
        let gateway = ScriptedGateway::new();
        let previewer = TypeMappingPreviewer::new(Arc::clone(&gateway));

        let err = previewer
            .preview_export_type_mapping("c1", &[], DatabaseType::Postgresql)
            .await
            .expect_err("no tables should fail");
        assert!(matches!(err, TypeMappingError::NoTables));
        assert!(gateway.calls().is_empty());
    }

    #[test]
    fn resolve_rejects_unknown_and_unoffered_types() {
        let result: TypeMappingResult =
            serde_json::from_value(preview_with_user_choice()).expect("result should parse");
        let mut plan = TypeMappingPlan::new(orders(), DatabaseType::Postgresql, result)
            .expect("summary is consistent");

        assert!(matches!(
            plan.resolve("int", "bigint"),
            Err(TypeMappingError::UnknownSourceType { .. })
        ));
        assert!(matches!(
            plan.resolve("enum", "jsonb"),
            Err(TypeMappingError::InvalidChoice { .. })
        ));
        assert!(matches!(
            plan.resolve("enum", " "),
            Err(TypeMappingError::InvalidChoice { .. })
        ));
        assert_eq!(plan.choice("enum"), None);
        assert!(plan.covers(&orders()));
        assert!(!plan.covers(&["customers".to_string()]));
    }

    #[test]
    fn summary_consistency_guards_overflow() {
        let summary = TypeSummary {
            total: 1,
            direct: u64::MAX,
            fallback: 2,
            user_choice: 0,
            lossy_count: 0,
        };
        assert!(!summary.is_consistent());
        assert!(TypeSummary::default().is_consistent());
    }
}
