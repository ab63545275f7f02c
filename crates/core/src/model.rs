use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// The server encodes empty collections as `null`.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    Mysql,
    Postgresql,
    Sqlite,
    Mssql,
    Oracle,
    Clickhouse,
    Kingbase,
    Dm,
    Mongodb,
}

impl DatabaseType {
    pub const ALL: [Self; 9] = [
        Self::Mysql,
        Self::Postgresql,
        Self::Sqlite,
        Self::Mssql,
        Self::Oracle,
        Self::Clickhouse,
        Self::Kingbase,
        Self::Dm,
        Self::Mongodb,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mysql => "mysql",
            Self::Postgresql => "postgresql",
            Self::Sqlite => "sqlite",
            Self::Mssql => "mssql",
            Self::Oracle => "oracle",
            Self::Clickhouse => "clickhouse",
            Self::Kingbase => "kingbase",
            Self::Dm => "dm",
            Self::Mongodb => "mongodb",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(raw))
    }

    /// Whether tables live under a schema level below the database.
    #[must_use]
    pub fn supports_schemas(self) -> bool {
        matches!(
            self,
            Self::Postgresql | Self::Mssql | Self::Oracle | Self::Kingbase | Self::Dm
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DatabaseType,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default)]
    pub database: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub group_id: String,
    #[serde(default)]
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl Connection {
    #[must_use]
    pub fn group(&self) -> Option<&str> {
        non_empty(&self.group_id)
    }

    #[must_use]
    pub fn default_database(&self) -> Option<&str> {
        non_empty(&self.database)
    }
}

/// Payload for creating, updating or probing a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDraft {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DatabaseType,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    pub params: BTreeMap<String, String>,
    pub group_id: String,
}

impl ConnectionDraft {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: DatabaseType, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            host: host.into(),
            port: default_port(kind),
            username: String::new(),
            password: String::new(),
            database: String::new(),
            params: BTreeMap::new(),
            group_id: String::new(),
        }
    }
}

fn default_port(kind: DatabaseType) -> u16 {
    match kind {
        DatabaseType::Mysql => 3306,
        DatabaseType::Postgresql => 5432,
        DatabaseType::Sqlite => 0,
        DatabaseType::Mssql => 1433,
        DatabaseType::Oracle => 1521,
        DatabaseType::Clickhouse => 9000,
        DatabaseType::Kingbase => 54321,
        DatabaseType::Dm => 5236,
        DatabaseType::Mongodb => 27017,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub parent_id: String,
}

impl Group {
    #[must_use]
    pub fn parent(&self) -> Option<&str> {
        non_empty(&self.parent_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupDraft {
    pub name: String,
    pub parent_id: String,
}

impl GroupDraft {
    #[must_use]
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent_id: String::new(),
        }
    }

    #[must_use]
    pub fn child_of(name: impl Into<String>, parent_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent_id: parent_id.into(),
        }
    }

    #[must_use]
    pub fn parent(&self) -> Option<&str> {
        non_empty(&self.parent_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub connected: bool,
    #[serde(default)]
    pub latency: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// The (connection, database, schema) tuple a metadata or mutation call is
/// evaluated against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct SchemaContext {
    pub connection_id: String,
    pub database: Option<String>,
    pub schema: Option<String>,
}

impl SchemaContext {
    #[must_use]
    pub fn new(
        connection_id: impl Into<String>,
        database: Option<&str>,
        schema: Option<&str>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            database: database.and_then(non_empty).map(str::to_string),
            schema: schema.and_then(non_empty).map(str::to_string),
        }
    }

    #[must_use]
    pub fn connection(connection_id: impl Into<String>) -> Self {
        Self::new(connection_id, None, None)
    }

    #[must_use]
    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    #[must_use]
    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Schema-less dialects never carry a qualifier.
    #[must_use]
    pub fn normalized_for(mut self, kind: DatabaseType) -> Self {
        if !kind.supports_schemas() {
            self.schema = None;
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableInfo {
    pub name: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub table_type: String,
    #[serde(default)]
    pub rows: i64,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub default_value: String,
    /// `PRI`, `UNI` or `MUL` when the column takes part in a key.
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub extra: String,
    #[serde(default)]
    pub comment: String,
}

impl ColumnInfo {
    #[must_use]
    pub fn is_primary_key(&self) -> bool {
        self.key.eq_ignore_ascii_case("PRI")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexInfo {
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintInfo {
    pub name: String,
    #[serde(rename = "type", default)]
    pub constraint_type: String,
    #[serde(default)]
    pub column_name: String,
    #[serde(default)]
    pub reference_table: String,
    #[serde(default)]
    pub reference_column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    #[serde(default)]
    pub database: String,
    pub table: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub columns: Vec<ColumnInfo>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub indexes: Vec<IndexInfo>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub constraints: Vec<ConstraintInfo>,
}

impl TableSchema {
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|column| column.name == name)
    }

    #[must_use]
    pub fn primary_key_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|column| column.is_primary_key())
            .map(|column| column.name.as_str())
            .collect()
    }
}

pub type Row = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    #[serde(default, deserialize_with = "null_as_default")]
    pub columns: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub rows: Vec<Row>,
    #[serde(default)]
    pub total: i64,
    #[serde(default)]
    pub time_cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResult {
    #[serde(default)]
    pub rows_affected: i64,
    #[serde(default)]
    pub time_cost: f64,
    #[serde(default)]
    pub message: String,
}

/// Paging and targeting knobs for a result-producing query. Unset fields are
/// omitted from the request and resolved server-side.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_desc: Option<bool>,
}

impl QueryOptions {
    #[must_use]
    pub fn in_database(database: impl Into<String>) -> Self {
        Self {
            database: Some(database.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    #[must_use]
    pub fn with_page(mut self, page: u32, page_size: u32) -> Self {
        self.page = Some(page);
        self.page_size = Some(page_size);
        self
    }

    #[must_use]
    pub fn sorted_by(mut self, column: impl Into<String>, descending: bool) -> Self {
        self.sort_by = Some(column.into());
        self.sort_desc = Some(descending);
        self
    }
}

pub(crate) fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}
