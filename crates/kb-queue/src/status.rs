//! Status cells (spec.md §4.4): a path-keyed upsertable single-value
//! register. `(id, path, data)`, `path` unique.

use std::time::Duration;

use kb_sql::error::{Error, Result};
use kb_sql::retry::{self, Attempt, Backoff};
use kb_sql::store::escape_identifier;

/// Whether `set` inserted a fresh row or updated an existing one, determined
/// by `RETURNING (xmax = 0)` (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Inserted,
    Updated,
}

#[derive(Debug, Clone)]
pub struct SetResult {
    pub outcome: SetOutcome,
    pub message: String,
}

/// Single-row SELECT, no transaction required.
#[tracing::instrument(level = "debug", skip(pool))]
pub async fn get(pool: &sqlx::PgPool, table: &str, path: &str) -> Result<Vec<u8>> {
    kb_sql::path::validate_path(path)?;
    let table = escape_identifier(table);
    let sql = format!("SELECT data FROM {table} WHERE path = $1");
    let row: Option<(Vec<u8>,)> = sqlx::query_as(&sql)
        .bind(path)
        .fetch_optional(pool)
        .await?;
    row.map(|(data,)| data)
        .ok_or_else(|| Error::NotFound(format!("no status cell at path {path:?}")))
}

/// Upserts `(path, data)`. Retries on any transient error under the C2 harness.
#[tracing::instrument(level = "debug", skip(pool, data))]
pub async fn set(
    pool: &sqlx::PgPool,
    table: &str,
    path: &str,
    data: &[u8],
    max_retries: u32,
    base_delay: Duration,
) -> Result<SetResult> {
    kb_sql::path::validate_path(path)?;
    let table = escape_identifier(table);
    let sql = format!(
        "INSERT INTO {table} (path, data) VALUES ($1, $2) \
         ON CONFLICT (path) DO UPDATE SET data = EXCLUDED.data \
         RETURNING (xmax = 0) AS inserted"
    );

    retry::retry(Backoff::Serializable, max_retries, base_delay, || async {
        let result: std::result::Result<(bool,), sqlx::Error> = sqlx::query_as(&sql)
            .bind(path)
            .bind(data)
            .fetch_one(pool)
            .await;

        match result {
            Ok((inserted,)) => {
                let outcome = if inserted {
                    SetOutcome::Inserted
                } else {
                    SetOutcome::Updated
                };
                Attempt::Ok(SetResult {
                    outcome,
                    message: format!("status cell at {path:?} {:?}", outcome),
                })
            }
            Err(err) if retry::is_transient(&err) => Attempt::Transient(err),
            Err(err) => Attempt::Fatal(err.into()),
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_outcome_is_copy_and_comparable() {
        assert_eq!(SetOutcome::Inserted, SetOutcome::Inserted);
        assert_ne!(SetOutcome::Inserted, SetOutcome::Updated);
    }

    #[tokio::test]
    async fn get_rejects_invalid_path_before_any_query() {
        // No pool is touched: path validation happens before the store adapter
        // is invoked, matching the InvalidInput policy in spec.md §7.
        let result = kb_sql::path::validate_path("bad path!");
        assert!(result.is_err());
    }
}
