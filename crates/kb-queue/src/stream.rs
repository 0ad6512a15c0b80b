//! Stream ring (spec.md §4.5): a fixed-capacity circular buffer of
//! timestamped records per path. Rows are pre-allocated; `push` only ever
//! mutates an existing row, replacing the oldest one.

use std::time::Duration;

use kb_sql::error::{Error, Result};
use kb_sql::retry::{self, Attempt, Backoff};
use kb_sql::store::escape_identifier;

/// Replaces the oldest row for `path` with `data`. Fails fatally with
/// `PreconditionNotMet` if no rows are provisioned for `path` (the pool
/// must have been provisioned out-of-band; see spec.md §6). The spec leaves
/// the tie-break between equally-old rows to the store's `SKIP LOCKED`
/// choice: callers must not depend on which row is replaced when
/// `recorded_at` ties.
#[tracing::instrument(level = "debug", skip(pool, data))]
pub async fn push(
    pool: &sqlx::PgPool,
    table: &str,
    path: &str,
    data: &[u8],
    max_retries: u32,
    base_delay: Duration,
) -> Result<i64> {
    kb_sql::path::validate_path(path)?;
    let table = escape_identifier(table);

    retry::retry(Backoff::Linear, max_retries, base_delay, || async {
        let mut txn = match pool.begin().await {
            Ok(txn) => txn,
            Err(err) => return Attempt::Fatal(err.into()),
        };

        let count_sql = format!("SELECT COUNT(*) FROM {table} WHERE path = $1");
        let count: i64 = match sqlx::query_scalar(&count_sql)
            .bind(path)
            .fetch_one(&mut *txn)
            .await
        {
            Ok(count) => count,
            Err(err) => return Attempt::Fatal(err.into()),
        };
        if count == 0 {
            return Attempt::Fatal(Error::precondition(format!(
                "stream ring at path {path:?} has no provisioned rows"
            )));
        }

        let select_sql = format!(
            "SELECT id FROM {table} WHERE path = $1 \
             ORDER BY recorded_at ASC FOR UPDATE SKIP LOCKED LIMIT 1"
        );
        let picked: Option<(i64,)> = match sqlx::query_as(&select_sql)
            .bind(path)
            .fetch_optional(&mut *txn)
            .await
        {
            Ok(picked) => picked,
            Err(err) if retry::is_transient(&err) => {
                let _ = txn.rollback().await;
                return Attempt::Transient(err);
            }
            Err(err) => return Attempt::Fatal(err.into()),
        };

        let Some((id,)) = picked else {
            // Every row for this path is currently locked by another writer;
            // back off and try again rather than blocking.
            let _ = txn.rollback().await;
            return Attempt::Transient(sqlx::Error::RowNotFound);
        };

        let update_sql = format!(
            "UPDATE {table} SET data = $1, recorded_at = now(), valid = TRUE \
             WHERE id = $2 RETURNING id"
        );
        match sqlx::query_as::<_, (i64,)>(&update_sql)
            .bind(data)
            .bind(id)
            .fetch_one(&mut *txn)
            .await
        {
            Ok((id,)) => match txn.commit().await {
                Ok(()) => Attempt::Ok(id),
                Err(err) => Attempt::Fatal(err.into()),
            },
            Err(err) if retry::is_transient(&err) => {
                let _ = txn.rollback().await;
                Attempt::Transient(err)
            }
            Err(err) => Attempt::Fatal(err.into()),
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    #[test]
    fn rejects_invalid_path() {
        assert!(kb_sql::path::validate_path("").is_err());
    }
}
