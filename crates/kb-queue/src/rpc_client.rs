//! RPC client replies (spec.md §4.8): a reply mailbox symmetric to the RPC
//! server queue on the client side, claimed via `is_new_result`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use kb_sql::error::{Error, Result};
use kb_sql::retry::{self, Attempt, Backoff};
use kb_sql::store::escape_identifier;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RpcClientRow {
    pub id: i64,
    pub request_id: Uuid,
    pub client_path: String,
    pub server_path: String,
    pub transaction_tag: String,
    pub rpc_action: String,
    pub response_payload: Vec<u8>,
    pub response_timestamp: DateTime<Utc>,
    pub is_new_result: bool,
}

#[derive(sqlx::FromRow)]
struct Row {
    id: i64,
    request_id: Uuid,
    client_path: String,
    server_path: String,
    transaction_tag: String,
    rpc_action: String,
    response_payload: Vec<u8>,
    response_timestamp: DateTime<Utc>,
    is_new_result: bool,
}

impl From<Row> for RpcClientRow {
    fn from(row: Row) -> Self {
        RpcClientRow {
            id: row.id,
            request_id: row.request_id,
            client_path: row.client_path,
            server_path: row.server_path,
            transaction_tag: row.transaction_tag,
            rpc_action: row.rpc_action,
            response_payload: row.response_payload,
            response_timestamp: row.response_timestamp,
            is_new_result: row.is_new_result,
        }
    }
}

/// Marker distinguishing "zero matches because the path has no provisioned
/// rows at all" (spec.md §4.8, `NoRecords`/`-2`) from an ordinary zero count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotCount {
    Count(i64),
    NoRecords,
}

async fn slot_count(
    pool: &sqlx::PgPool,
    table: &str,
    client_path: &str,
    is_new_result: bool,
) -> Result<SlotCount> {
    kb_sql::path::validate_path(client_path)?;
    let escaped = escape_identifier(table);

    let total_sql = format!("SELECT COUNT(*) FROM {escaped} WHERE client_path = $1");
    let total: i64 = sqlx::query_scalar(&total_sql)
        .bind(client_path)
        .fetch_one(pool)
        .await?;
    if total == 0 {
        return Ok(SlotCount::NoRecords);
    }

    let sql = format!(
        "SELECT COUNT(*) FROM {escaped} WHERE client_path = $1 AND is_new_result = $2"
    );
    let count: i64 = sqlx::query_scalar(&sql)
        .bind(client_path)
        .bind(is_new_result)
        .fetch_one(pool)
        .await?;
    Ok(SlotCount::Count(count))
}

/// Count of slots with `is_new_result = FALSE`.
pub async fn find_free_slots(pool: &sqlx::PgPool, table: &str, client_path: &str) -> Result<SlotCount> {
    slot_count(pool, table, client_path, false).await
}

/// Count of slots with `is_new_result = TRUE`.
pub async fn find_queued_slots(pool: &sqlx::PgPool, table: &str, client_path: &str) -> Result<SlotCount> {
    slot_count(pool, table, client_path, true).await
}

/// Claims a free slot (`is_new_result = FALSE`) and fills it with a reply,
/// marking it queued. `request_uuid` must be a valid, non-null UUID
/// (spec.md §9 resolves the null-UUID Open Question this way); Rust's type
/// system enforces that at the call boundary.
#[tracing::instrument(level = "debug", skip(pool, reply_payload))]
pub async fn push_and_claim_reply_data(
    pool: &sqlx::PgPool,
    table: &str,
    client_path: &str,
    request_uuid: Uuid,
    server_path: &str,
    rpc_action: &str,
    transaction_tag: &str,
    reply_payload: &[u8],
    max_retries: u32,
    base_delay: Duration,
) -> Result<i64> {
    kb_sql::path::validate_path(client_path)?;
    kb_sql::path::validate_path(server_path)?;
    if rpc_action.is_empty() {
        return Err(Error::invalid_input("rpc_action must not be empty"));
    }
    if transaction_tag.is_empty() {
        return Err(Error::invalid_input("transaction_tag must not be empty"));
    }
    let escaped = escape_identifier(table);

    retry::retry(Backoff::Serializable, max_retries, base_delay, || async {
        let sql = format!(
            "WITH picked AS ( \
                 SELECT id FROM {escaped} \
                 WHERE client_path = $1 AND is_new_result = FALSE \
                 ORDER BY response_timestamp ASC FOR UPDATE SKIP LOCKED LIMIT 1 \
             ) \
             UPDATE {escaped} SET \
                 request_id = $2, server_path = $3, rpc_action = $4, \
                 transaction_tag = $5, response_payload = $6, \
                 response_timestamp = now(), is_new_result = TRUE \
             WHERE id IN (SELECT id FROM picked) \
             RETURNING id"
        );

        let claimed: std::result::Result<Option<(i64,)>, sqlx::Error> = sqlx::query_as(&sql)
            .bind(client_path)
            .bind(request_uuid)
            .bind(server_path)
            .bind(rpc_action)
            .bind(transaction_tag)
            .bind(reply_payload)
            .fetch_optional(pool)
            .await;

        match claimed {
            Ok(Some((id,))) => Attempt::Ok(id),
            Ok(None) => Attempt::Fatal(Error::NoFreeSlot),
            Err(err) if retry::is_transient(&err) => Attempt::Transient(err),
            Err(err) => Attempt::Fatal(err.into()),
        }
    })
    .await
}

/// Claims a queued reply (`is_new_result = TRUE`) and marks it consumed.
/// Returns `None` only once a probe confirms no queued row exists at all;
/// if the probe finds one but this call's own `SKIP LOCKED` attempt did not
/// (another worker briefly held the lock), the call retries instead of
/// returning `None` prematurely.
#[tracing::instrument(level = "debug", skip(pool))]
pub async fn peak_and_claim_reply_data(
    pool: &sqlx::PgPool,
    table: &str,
    client_path: &str,
    max_retries: u32,
    base_delay: Duration,
) -> Result<Option<RpcClientRow>> {
    kb_sql::path::validate_path(client_path)?;
    let escaped = escape_identifier(table);

    retry::retry(Backoff::Serializable, max_retries, base_delay, || async {
        let sql = format!(
            "WITH picked AS ( \
                 SELECT id FROM {escaped} \
                 WHERE client_path = $1 AND is_new_result = TRUE \
                 ORDER BY response_timestamp ASC FOR UPDATE SKIP LOCKED LIMIT 1 \
             ) \
             UPDATE {escaped} SET is_new_result = FALSE \
             WHERE id IN (SELECT id FROM picked) \
             RETURNING *"
        );

        let claimed: std::result::Result<Option<Row>, sqlx::Error> =
            sqlx::query_as(&sql).bind(client_path).fetch_optional(pool).await;

        match claimed {
            Ok(Some(row)) => Attempt::Ok(Some(row.into())),
            Ok(None) => {
                let probe_sql = format!(
                    "SELECT EXISTS(SELECT 1 FROM {escaped} \
                     WHERE client_path = $1 AND is_new_result = TRUE)"
                );
                match sqlx::query_scalar::<_, bool>(&probe_sql)
                    .bind(client_path)
                    .fetch_one(pool)
                    .await
                {
                    Ok(true) => Attempt::Transient(sqlx::Error::RowNotFound),
                    Ok(false) => Attempt::Ok(None),
                    Err(err) => Attempt::Fatal(err.into()),
                }
            }
            Err(err) if retry::is_transient(&err) => Attempt::Transient(err),
            Err(err) => Attempt::Fatal(err.into()),
        }
    })
    .await
}

/// Resets every row for `client_path` to a free slot: fresh random UUID,
/// empty JSON payload, current timestamp, `is_new_result = FALSE`.
#[tracing::instrument(level = "debug", skip(pool))]
pub async fn clear_reply_queue(
    pool: &sqlx::PgPool,
    table: &str,
    client_path: &str,
    max_retries: u32,
    base_delay: Duration,
) -> Result<u64> {
    kb_sql::path::validate_path(client_path)?;
    let escaped = escape_identifier(table);

    retry::retry(Backoff::Linear, max_retries, base_delay, || async {
        let mut txn = match pool.begin().await {
            Ok(txn) => txn,
            Err(err) => return Attempt::Fatal(err.into()),
        };

        let select_sql = format!("SELECT id FROM {escaped} WHERE client_path = $1 FOR UPDATE NOWAIT");
        let ids: std::result::Result<Vec<(i64,)>, sqlx::Error> =
            sqlx::query_as(&select_sql).bind(client_path).fetch_all(&mut *txn).await;

        let ids = match ids {
            Ok(ids) => ids,
            Err(err) if retry::is_transient(&err) => {
                let _ = txn.rollback().await;
                return Attempt::Transient(err);
            }
            Err(err) => return Attempt::Fatal(err.into()),
        };

        let mut affected = 0u64;
        let update_sql = format!(
            "UPDATE {escaped} SET request_id = $1, response_payload = '{{}}', \
             response_timestamp = now(), is_new_result = FALSE WHERE id = $2"
        );
        for (id,) in ids {
            match sqlx::query(&update_sql)
                .bind(Uuid::new_v4())
                .bind(id)
                .execute(&mut *txn)
                .await
            {
                Ok(result) => affected += result.rows_affected(),
                Err(err) if retry::is_transient(&err) => {
                    let _ = txn.rollback().await;
                    return Attempt::Transient(err);
                }
                Err(err) => return Attempt::Fatal(err.into()),
            }
        }

        match txn.commit().await {
            Ok(()) => Attempt::Ok(affected),
            Err(err) => Attempt::Fatal(err.into()),
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_count_distinguishes_no_records_from_zero() {
        assert_ne!(SlotCount::NoRecords, SlotCount::Count(0));
        assert_eq!(SlotCount::Count(0), SlotCount::Count(0));
    }
}
