//! Discovery query (`KBQuery`), spec.md §4.3.
//!
//! Nodes are located by a compound filter over
//! `(knowledge_base, label, name, JSON properties, hierarchical path)`. The
//! builder accumulates filter conditions and executes them as a chain of
//! CTEs: `WITH base AS (...), filter_0 AS (SELECT * FROM base WHERE ...),
//! filter_1 AS (SELECT * FROM filter_0 WHERE ...), ... SELECT * FROM
//! filter_last`. With no filters at all, the query returns every row of the
//! table (spec.md §4.3, "Contract exceptions").

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::escape_identifier;

/// The enumerated node kinds a discovery row can carry (spec.md §3.1).
/// `completed_job` exists on the RPC server row's `state` domain, not here;
/// this is the discovery table's `label` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Label {
    StatusField,
    StreamField,
    JobQueue,
    RpcServerField,
    RpcClientField,
}

impl Label {
    pub fn as_str(self) -> &'static str {
        match self {
            Label::StatusField => "KB_STATUS_FIELD",
            Label::StreamField => "KB_STREAM_FIELD",
            Label::JobQueue => "KB_JOB_QUEUE",
            Label::RpcServerField => "KB_RPC_SERVER_FIELD",
            Label::RpcClientField => "KB_RPC_CLIENT_FIELD",
        }
    }
}

impl std::str::FromStr for Label {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "KB_STATUS_FIELD" => Label::StatusField,
            "KB_STREAM_FIELD" => Label::StreamField,
            "KB_JOB_QUEUE" => Label::JobQueue,
            "KB_RPC_SERVER_FIELD" => Label::RpcServerField,
            "KB_RPC_CLIENT_FIELD" => Label::RpcClientField,
            other => return Err(Error::invalid_input(format!("unknown label {other:?}"))),
        })
    }
}

/// A discovery row as read from the store (spec.md §3.1). Read-only to the
/// core; returned to callers as an owned, releasable value.
#[derive(Debug, Clone)]
pub struct DiscoveryRow {
    pub id: i64,
    pub knowledge_base: String,
    pub label: Label,
    pub name: String,
    pub properties: serde_json::Value,
    pub data: Vec<u8>,
    pub link_a: bool,
    pub link_b: bool,
    pub path: String,
}

#[derive(sqlx::FromRow)]
struct Row {
    id: i64,
    knowledge_base: String,
    label: String,
    name: String,
    properties: serde_json::Value,
    data: Vec<u8>,
    link_a: bool,
    link_b: bool,
    path: String,
}

impl TryFrom<Row> for DiscoveryRow {
    type Error = Error;

    fn try_from(row: Row) -> Result<Self> {
        Ok(DiscoveryRow {
            id: row.id,
            knowledge_base: row.knowledge_base,
            label: row.label.parse()?,
            name: row.name,
            properties: row.properties,
            data: row.data,
            link_a: row.link_a,
            link_b: row.link_b,
            path: row.path,
        })
    }
}

enum Param {
    Text(String),
    Json(serde_json::Value),
}

/// Composable filter over the discovery table. Filters are AND-ed together
/// as successive CTEs; order of application does not affect the result set.
pub struct KBQuery {
    base_table: String,
    filters: Vec<String>,
    params: Vec<Param>,
}

impl KBQuery {
    pub fn new(base_table: impl Into<String>) -> Self {
        KBQuery {
            base_table: base_table.into(),
            filters: Vec::new(),
            params: Vec::new(),
        }
    }

    fn push(mut self, template: &str, param: Param) -> Self {
        self.params.push(param);
        let idx = self.params.len();
        self.filters.push(template.replace("$N", &format!("${idx}")));
        self
    }

    pub fn by_knowledge_base(self, kb: impl Into<String>) -> Self {
        self.push("knowledge_base = $N", Param::Text(kb.into()))
    }

    pub fn by_label(self, label: Label) -> Self {
        self.push("label = $N", Param::Text(label.as_str().to_string()))
    }

    pub fn by_name(self, name: impl Into<String>) -> Self {
        self.push("name = $N", Param::Text(name.into()))
    }

    /// Match if the `properties` JSON has the given key, regardless of value.
    pub fn by_property_key(self, key: impl Into<String>) -> Self {
        self.push("properties ? $N", Param::Text(key.into()))
    }

    /// Match if `properties` contains `{key: value}` (JSON containment).
    pub fn by_property_key_value(self, key: &str, value: serde_json::Value) -> Self {
        let containment = serde_json::json!({ key: value });
        self.push("properties @> $N::jsonb", Param::Json(containment))
    }

    /// Match nodes whose path is contained in the subtree rooted at
    /// `starting_path` (ltree `<@` containment).
    pub fn by_starting_path(self, starting_path: impl Into<String>) -> Self {
        self.push("path <@ $N::ltree", Param::Text(starting_path.into()))
    }

    /// Match nodes whose path matches the given `lquery` pattern (ltree `~`).
    pub fn by_path_expression(self, pattern: impl Into<String>) -> Self {
        self.push("path ~ $N::lquery", Param::Text(pattern.into()))
    }

    /// Projection used at the head and tail of the CTE chain. `path` is
    /// stored as the store's hierarchical-path type (e.g. `ltree`), which
    /// does not decode directly into a Rust `String`; every projection casts
    /// it to `text` explicitly rather than relying on `SELECT *`.
    const PROJECTION: &'static str = "id, knowledge_base, label, name, properties, data, \
         link_a, link_b, path::text AS path";

    fn build_sql(&self) -> String {
        let table = escape_identifier(&self.base_table);
        if self.filters.is_empty() {
            return format!("SELECT {} FROM {table}", Self::PROJECTION);
        }

        let mut sql = format!("WITH base AS (SELECT * FROM {table})");
        let mut prev = "base".to_string();
        for (i, cond) in self.filters.iter().enumerate() {
            let name = format!("filter_{i}");
            sql.push_str(&format!(", {name} AS (SELECT * FROM {prev} WHERE {cond})"));
            prev = name;
        }
        sql.push_str(&format!(" SELECT {} FROM {prev}", Self::PROJECTION));
        sql
    }

    /// Executes the query, returning every matching row.
    pub async fn execute(&self, pool: &sqlx::PgPool) -> Result<Vec<DiscoveryRow>> {
        let sql = self.build_sql();
        let mut query = sqlx::query_as::<_, Row>(&sql);
        for param in &self.params {
            query = match param {
                Param::Text(s) => query.bind(s),
                Param::Json(v) => query.bind(v),
            };
        }
        let rows = query.fetch_all(pool).await?;
        rows.into_iter().map(DiscoveryRow::try_from).collect()
    }
}

/// Returns all matching rows for `label`. With no filters set on `filter`,
/// returns every row of the table (spec.md §4.3 contract exception).
pub async fn find_ids(
    pool: &sqlx::PgPool,
    base_table: &str,
    label: Label,
    kb: Option<&str>,
    name: Option<&str>,
    properties: &[(&str, serde_json::Value)],
    starting_path: Option<&str>,
) -> Result<Vec<DiscoveryRow>> {
    let mut query = KBQuery::new(base_table).by_label(label);
    if let Some(kb) = kb {
        query = query.by_knowledge_base(kb);
    }
    if let Some(name) = name {
        query = query.by_name(name);
    }
    for (key, value) in properties {
        query = query.by_property_key_value(key, value.clone());
    }
    if let Some(path) = starting_path {
        query = query.by_starting_path(path);
    }
    query.execute(pool).await
}

/// Like `find_ids`, but fails unless exactly one row matches
/// (spec.md §4.3, "Contract exceptions").
pub async fn find_id(
    pool: &sqlx::PgPool,
    base_table: &str,
    label: Label,
    kb: Option<&str>,
    name: Option<&str>,
    properties: &[(&str, serde_json::Value)],
    starting_path: Option<&str>,
) -> Result<DiscoveryRow> {
    let mut rows = find_ids(pool, base_table, label, kb, name, properties, starting_path).await?;
    match rows.len() {
        1 => Ok(rows.pop().unwrap()),
        0 => Err(Error::precondition(format!(
            "no {:?} node found matching filter",
            label
        ))),
        n => Err(Error::precondition(format!(
            "{n} {:?} nodes matched filter, expected exactly one",
            label
        ))),
    }
}

macro_rules! label_wrappers {
    ($ids_fn:ident, $id_fn:ident, $label:expr) => {
        pub async fn $ids_fn(
            pool: &sqlx::PgPool,
            base_table: &str,
            kb: Option<&str>,
            name: Option<&str>,
            properties: &[(&str, serde_json::Value)],
            starting_path: Option<&str>,
        ) -> Result<Vec<DiscoveryRow>> {
            find_ids(pool, base_table, $label, kb, name, properties, starting_path).await
        }

        pub async fn $id_fn(
            pool: &sqlx::PgPool,
            base_table: &str,
            kb: Option<&str>,
            name: Option<&str>,
            properties: &[(&str, serde_json::Value)],
            starting_path: Option<&str>,
        ) -> Result<DiscoveryRow> {
            find_id(pool, base_table, $label, kb, name, properties, starting_path).await
        }
    };
}

label_wrappers!(find_status_ids, find_status_id, Label::StatusField);
label_wrappers!(find_stream_ids, find_stream_id, Label::StreamField);
label_wrappers!(find_job_ids, find_job_id, Label::JobQueue);
label_wrappers!(find_rpc_server_ids, find_rpc_server_id, Label::RpcServerField);
label_wrappers!(find_rpc_client_ids, find_rpc_client_id, Label::RpcClientField);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_round_trips_through_str() {
        for label in [
            Label::StatusField,
            Label::StreamField,
            Label::JobQueue,
            Label::RpcServerField,
            Label::RpcClientField,
        ] {
            let parsed: Label = label.as_str().parse().unwrap();
            assert_eq!(parsed, label);
        }
    }

    #[test]
    fn rejects_unknown_label() {
        assert!("KB_BOGUS_FIELD".parse::<Label>().is_err());
    }

    #[test]
    fn no_filters_selects_whole_table() {
        let query = KBQuery::new("kb_nodes");
        assert_eq!(
            query.build_sql(),
            format!("SELECT {} FROM \"kb_nodes\"", KBQuery::PROJECTION)
        );
    }

    #[test]
    fn single_filter_produces_one_cte() {
        let query = KBQuery::new("kb_nodes").by_knowledge_base("kb1");
        assert_eq!(
            query.build_sql(),
            format!(
                "WITH base AS (SELECT * FROM \"kb_nodes\"), filter_0 AS (SELECT * FROM base WHERE knowledge_base = $1) SELECT {} FROM filter_0",
                KBQuery::PROJECTION
            )
        );
    }

    #[test]
    fn chained_filters_thread_through_ctes_in_order() {
        let query = KBQuery::new("kb_nodes")
            .by_knowledge_base("kb1")
            .by_label(Label::StatusField)
            .by_name("info3_status");
        let sql = query.build_sql();
        assert!(sql.contains("filter_0 AS (SELECT * FROM base WHERE knowledge_base = $1)"));
        assert!(sql.contains("filter_1 AS (SELECT * FROM filter_0 WHERE label = $2)"));
        assert!(sql.contains("filter_2 AS (SELECT * FROM filter_1 WHERE name = $3)"));
        assert!(sql.ends_with(&format!("SELECT {} FROM filter_2", KBQuery::PROJECTION)));
    }
}
