//! Job queue (spec.md §4.6): a FIFO with scheduled-at ordering and slot
//! lifecycle `{free -> queued -> active -> free}`.

use std::time::Duration;

use kb_sql::error::{Error, Result};
use kb_sql::retry::{self, Attempt, Backoff};
use kb_sql::store::escape_identifier;

/// Outcome of `peek`: either a claimed runnable job, or the absence of one
/// (not an error -- spec.md §4.6).
#[derive(Debug, Clone)]
pub enum PeekResult {
    Found { id: i64, data: Vec<u8> },
    NotFound,
}

/// Selects a free slot (`valid = FALSE`) ordered by `completed_at ASC`,
/// claims it with the new payload. Fails with `NoFreeSlot` if the pool is
/// exhausted; lock-not-available is transient.
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

        let select_sql = format!(
            "SELECT id FROM {table} WHERE path = $1 AND valid = FALSE \
             ORDER BY completed_at ASC FOR UPDATE NOWAIT LIMIT 1"
        );
        let picked: std::result::Result<Option<(i64,)>, sqlx::Error> =
            sqlx::query_as(&select_sql).bind(path).fetch_optional(&mut *txn).await;

        let id = match picked {
            Ok(Some((id,))) => id,
            Ok(None) => {
                let _ = txn.rollback().await;
                return Attempt::Fatal(Error::NoFreeSlot);
            }
            Err(err) if retry::is_transient(&err) => {
                let _ = txn.rollback().await;
                return Attempt::Transient(err);
            }
            Err(err) => return Attempt::Fatal(err.into()),
        };

        let update_sql = format!(
            "UPDATE {table} SET data = $1, schedule_at = now(), started_at = NULL, \
             completed_at = NULL, valid = TRUE, is_active = FALSE \
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

/// Claims the next runnable job: `valid = TRUE`, `is_active = FALSE`, and
/// `schedule_at` either null or due. Two concurrent `peek`s never claim the
/// same row, because `SKIP LOCKED` makes each pick the next unlocked
/// candidate rather than blocking.
#[tracing::instrument(level = "debug", skip(pool))]
pub async fn peek(
    pool: &sqlx::PgPool,
    table: &str,
    path: &str,
    max_retries: u32,
    base_delay: Duration,
) -> Result<PeekResult> {
    kb_sql::path::validate_path(path)?;
    let table = escape_identifier(table);

    retry::retry(Backoff::JobAcquire, max_retries, base_delay, || async {
        let mut txn = match pool.begin().await {
            Ok(txn) => txn,
            Err(err) => return Attempt::Fatal(err.into()),
        };

        let select_sql = format!(
            "SELECT id, data FROM {table} WHERE path = $1 AND valid = TRUE AND is_active = FALSE \
             AND (schedule_at IS NULL OR schedule_at <= now()) \
             ORDER BY schedule_at ASC NULLS FIRST FOR UPDATE SKIP LOCKED LIMIT 1"
        );
        let picked: std::result::Result<Option<(i64, Vec<u8>)>, sqlx::Error> =
            sqlx::query_as(&select_sql).bind(path).fetch_optional(&mut *txn).await;

        let (id, data) = match picked {
            Ok(Some(row)) => row,
            Ok(None) => {
                let _ = txn.rollback().await;
                return Attempt::Ok(PeekResult::NotFound);
            }
            Err(err) if retry::is_transient(&err) => {
                let _ = txn.rollback().await;
                return Attempt::Transient(err);
            }
            Err(err) => return Attempt::Fatal(err.into()),
        };

        let update_sql =
            format!("UPDATE {table} SET is_active = TRUE, started_at = now() WHERE id = $1");
        if let Err(err) = sqlx::query(&update_sql).bind(id).execute(&mut *txn).await {
            if retry::is_transient(&err) {
                let _ = txn.rollback().await;
                return Attempt::Transient(err);
            }
            return Attempt::Fatal(err.into());
        }

        match txn.commit().await {
            Ok(()) => Attempt::Ok(PeekResult::Found { id, data }),
            Err(err) => Attempt::Fatal(err.into()),
        }
    })
    .await
}

/// Marks a previously-peeked job complete. Fails if the row does not exist;
/// retries on lock unavailability.
#[tracing::instrument(level = "debug", skip(pool))]
pub async fn complete(
    pool: &sqlx::PgPool,
    table: &str,
    id: i64,
    max_retries: u32,
    base_delay: Duration,
) -> Result<()> {
    let table = escape_identifier(table);

    retry::retry(Backoff::Linear, max_retries, base_delay, || async {
        let mut txn = match pool.begin().await {
            Ok(txn) => txn,
            Err(err) => return Attempt::Fatal(err.into()),
        };

        let lock_sql = format!("SELECT id FROM {table} WHERE id = $1 FOR UPDATE NOWAIT");
        let locked: std::result::Result<Option<(i64,)>, sqlx::Error> =
            sqlx::query_as(&lock_sql).bind(id).fetch_optional(&mut *txn).await;

        match locked {
            Ok(Some(_)) => {}
            Ok(None) => {
                let _ = txn.rollback().await;
                return Attempt::Fatal(Error::NotFound(format!("job row {id} does not exist")));
            }
            Err(err) if retry::is_transient(&err) => {
                let _ = txn.rollback().await;
                return Attempt::Transient(err);
            }
            Err(err) => return Attempt::Fatal(err.into()),
        }

        let update_sql = format!(
            "UPDATE {table} SET completed_at = now(), valid = FALSE, is_active = FALSE \
             WHERE id = $1"
        );
        let affected = match sqlx::query(&update_sql).bind(id).execute(&mut *txn).await {
            Ok(result) => result.rows_affected(),
            Err(err) if retry::is_transient(&err) => {
                let _ = txn.rollback().await;
                return Attempt::Transient(err);
            }
            Err(err) => return Attempt::Fatal(err.into()),
        };

        if affected == 0 {
            let _ = txn.rollback().await;
            return Attempt::Fatal(Error::NotFound(format!("job row {id} does not exist")));
        }

        match txn.commit().await {
            Ok(()) => Attempt::Ok(()),
            Err(err) => Attempt::Fatal(err.into()),
        }
    })
    .await
}

/// Transactional `COUNT(*) WHERE valid = FALSE` for `path`.
pub async fn count_free(pool: &sqlx::PgPool, table: &str, path: &str) -> Result<i64> {
    count_by_valid(pool, table, path, false).await
}

/// Transactional `COUNT(*) WHERE valid = TRUE` for `path`.
pub async fn count_queued(pool: &sqlx::PgPool, table: &str, path: &str) -> Result<i64> {
    count_by_valid(pool, table, path, true).await
}

async fn count_by_valid(
    pool: &sqlx::PgPool,
    table: &str,
    path: &str,
    valid: bool,
) -> Result<i64> {
    kb_sql::path::validate_path(path)?;
    let table = escape_identifier(table);
    let sql = format!("SELECT COUNT(*) FROM {table} WHERE path = $1 AND valid = $2");
    let count: i64 = sqlx::query_scalar(&sql)
        .bind(path)
        .bind(valid)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Resets every row for `path` to `free`, atomically. Takes an exclusive
/// table lock for the duration of the reset (spec.md §4.6).
#[tracing::instrument(level = "debug", skip(pool))]
pub async fn clear(pool: &sqlx::PgPool, table: &str, path: &str) -> Result<u64> {
    kb_sql::path::validate_path(path)?;
    let escaped = escape_identifier(table);

    let mut txn = pool.begin().await?;
    sqlx::query(&format!("LOCK TABLE {escaped} IN EXCLUSIVE MODE"))
        .execute(&mut *txn)
        .await?;

    let update_sql = format!(
        "UPDATE {escaped} SET valid = FALSE, is_active = FALSE, data = '{{}}', \
         schedule_at = now(), started_at = now(), completed_at = now() \
         WHERE path = $1"
    );
    let affected = sqlx::query(&update_sql)
        .bind(path)
        .execute(&mut *txn)
        .await?
        .rows_affected();

    txn.commit().await?;
    Ok(affected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peek_result_distinguishes_found_from_not_found() {
        let found = PeekResult::Found {
            id: 1,
            data: b"{}".to_vec(),
        };
        assert!(matches!(found, PeekResult::Found { .. }));
        assert!(matches!(PeekResult::NotFound, PeekResult::NotFound));
    }
}
