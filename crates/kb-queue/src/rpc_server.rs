//! RPC server queue (spec.md §4.7): a priority+FIFO queue with state
//! machine `{empty -> new_job -> processing -> empty}` under serializable
//! isolation plus a per-path advisory lock.

use std::time::Duration;

use chrono::{DateTime, Utc};
use kb_sql::error::{Error, Result};
use kb_sql::retry::{self, Attempt, Backoff};
use kb_sql::store::escape_identifier;
use uuid::Uuid;

/// `state` domain of an RPC server row (spec.md §3.5). `CompletedJob` is a
/// reserved value: the core's `mark_job_completion` transitions directly to
/// `Empty` and never produces `CompletedJob` itself (spec.md §9, "Dead code
/// on `completed_job`"). It is kept here only so `count` accepts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Empty,
    NewJob,
    Processing,
    CompletedJob,
}

impl State {
    pub fn as_str(self) -> &'static str {
        match self {
            State::Empty => "empty",
            State::NewJob => "new_job",
            State::Processing => "processing",
            State::CompletedJob => "completed_job",
        }
    }
}

impl std::str::FromStr for State {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "empty" => State::Empty,
            "new_job" => State::NewJob,
            "processing" => State::Processing,
            "completed_job" => State::CompletedJob,
            other => return Err(Error::invalid_input(format!("invalid rpc server state {other:?}"))),
        })
    }
}

#[derive(Debug, Clone)]
pub struct RpcServerRow {
    pub id: i64,
    pub server_path: String,
    pub request_id: Uuid,
    pub rpc_action: String,
    pub request_payload: Vec<u8>,
    pub request_timestamp: DateTime<Utc>,
    pub transaction_tag: String,
    pub state: State,
    pub priority: i32,
    pub processing_timestamp: Option<DateTime<Utc>>,
    pub completed_timestamp: Option<DateTime<Utc>>,
    pub rpc_client_queue: Option<String>,
}

#[derive(sqlx::FromRow)]
struct Row {
    id: i64,
    server_path: String,
    request_id: Uuid,
    rpc_action: String,
    request_payload: Vec<u8>,
    request_timestamp: DateTime<Utc>,
    transaction_tag: String,
    state: String,
    priority: i32,
    processing_timestamp: Option<DateTime<Utc>>,
    completed_timestamp: Option<DateTime<Utc>>,
    rpc_client_queue: Option<String>,
}

impl TryFrom<Row> for RpcServerRow {
    type Error = Error;

    fn try_from(row: Row) -> Result<Self> {
        Ok(RpcServerRow {
            id: row.id,
            server_path: row.server_path,
            request_id: row.request_id,
            rpc_action: row.rpc_action,
            request_payload: row.request_payload,
            request_timestamp: row.request_timestamp,
            transaction_tag: row.transaction_tag,
            state: row.state.parse()?,
            priority: row.priority,
            processing_timestamp: row.processing_timestamp,
            completed_timestamp: row.completed_timestamp,
            rpc_client_queue: row.rpc_client_queue,
        })
    }
}

/// DJB2 hash of `table:path`, used as the key for the per-server_path
/// transactional advisory lock (spec.md §4.7 step 2). Kept as the spec's
/// 32-bit-ish DJB2 rather than swapped for a 64-bit hash (spec.md §9 notes
/// the substitution is optional, not required); false sharing between
/// unrelated paths only widens what the lock serializes, it does not break
/// correctness.
pub fn advisory_lock_key(table: &str, server_path: &str) -> i64 {
    let key = format!("{table}:{server_path}");
    let mut hash: u64 = 5381;
    for byte in key.bytes() {
        hash = (hash << 5).wrapping_add(hash).wrapping_add(byte as u64);
    }
    hash as i64
}

fn validate_push_inputs(
    server_path: &str,
    rpc_action: &str,
    transaction_tag: &str,
    rpc_client_queue: Option<&str>,
) -> Result<()> {
    kb_sql::path::validate_path(server_path)?;
    if let Some(client_queue) = rpc_client_queue {
        kb_sql::path::validate_path(client_queue)?;
    }
    if rpc_action.is_empty() {
        return Err(Error::invalid_input("rpc_action must not be empty"));
    }
    if transaction_tag.is_empty() {
        return Err(Error::invalid_input("transaction_tag must not be empty"));
    }
    Ok(())
}

/// Claims an `empty` slot for `server_path` and transitions it to
/// `new_job`. Serializes concurrent pushes on the same `server_path` with a
/// transactional advisory lock so `request_timestamp` is monotonically
/// non-decreasing within that path (spec.md §5).
#[tracing::instrument(level = "debug", skip(pool, payload))]
pub async fn push_rpc_server_queue(
    pool: &sqlx::PgPool,
    table: &str,
    server_path: &str,
    request_id: Option<Uuid>,
    rpc_action: &str,
    payload: &[u8],
    transaction_tag: &str,
    priority: i32,
    rpc_client_queue: Option<&str>,
    max_retries: u32,
    base_delay: Duration,
) -> Result<RpcServerRow> {
    validate_push_inputs(server_path, rpc_action, transaction_tag, rpc_client_queue)?;
    let lock_key = advisory_lock_key(table, server_path);
    let escaped = escape_identifier(table);
    let request_id = request_id.unwrap_or_else(Uuid::new_v4);

    retry::retry(Backoff::Serializable, max_retries, base_delay, || async {
        let mut txn = match kb_sql::store::begin_serializable(pool).await {
            Ok(txn) => txn,
            Err(err) => return Attempt::Fatal(err.into()),
        };

        if let Err(err) = sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(lock_key)
            .execute(&mut *txn)
            .await
        {
            if retry::is_transient(&err) {
                let _ = txn.rollback().await;
                return Attempt::Transient(err);
            }
            return Attempt::Fatal(err.into());
        }

        let select_sql = format!(
            "SELECT id FROM {escaped} WHERE server_path = $1 AND state = 'empty' \
             ORDER BY priority DESC, request_timestamp ASC FOR UPDATE LIMIT 1"
        );
        let picked: std::result::Result<Option<(i64,)>, sqlx::Error> =
            sqlx::query_as(&select_sql).bind(server_path).fetch_optional(&mut *txn).await;

        let id = match picked {
            Ok(Some((id,))) => id,
            Ok(None) => {
                let _ = txn.rollback().await;
                return Attempt::Fatal(Error::NoEmptySlot);
            }
            Err(err) if retry::is_transient(&err) => {
                let _ = txn.rollback().await;
                return Attempt::Transient(err);
            }
            Err(err) => return Attempt::Fatal(err.into()),
        };

        let update_sql = format!(
            "UPDATE {escaped} SET state = 'new_job', request_id = $1, rpc_action = $2, \
             request_payload = $3, transaction_tag = $4, priority = $5, \
             rpc_client_queue = $6, request_timestamp = (now() AT TIME ZONE 'UTC'), \
             completed_timestamp = NULL \
             WHERE id = $7 RETURNING *"
        );
        let row: std::result::Result<Row, sqlx::Error> = sqlx::query_as(&update_sql)
            .bind(request_id)
            .bind(rpc_action)
            .bind(payload)
            .bind(transaction_tag)
            .bind(priority)
            .bind(rpc_client_queue)
            .bind(id)
            .fetch_one(&mut *txn)
            .await;

        match row {
            Ok(row) => match txn.commit().await {
                Ok(()) => match RpcServerRow::try_from(row) {
                    Ok(row) => Attempt::Ok(row),
                    Err(err) => Attempt::Fatal(err),
                },
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

/// Claims the highest-priority `new_job` slot for `server_path` and
/// transitions it to `processing`. Returns `None` if no `new_job` slot
/// exists. Per spec.md §4.7, the returned row reflects the state as read
/// before the `processing` transition was applied (i.e. `state: NewJob`),
/// not the post-update row.
#[tracing::instrument(level = "debug", skip(pool))]
pub async fn peak_server_queue(
    pool: &sqlx::PgPool,
    table: &str,
    server_path: &str,
    max_retries: u32,
    base_delay: Duration,
) -> Result<Option<RpcServerRow>> {
    kb_sql::path::validate_path(server_path)?;
    let escaped = escape_identifier(table);

    retry::retry(Backoff::Serializable, max_retries, base_delay, || async {
        let mut txn = match kb_sql::store::begin_serializable(pool).await {
            Ok(txn) => txn,
            Err(err) => return Attempt::Fatal(err.into()),
        };

        let select_sql = format!(
            "SELECT * FROM {escaped} WHERE server_path = $1 AND state = 'new_job' \
             ORDER BY priority DESC, request_timestamp ASC FOR UPDATE SKIP LOCKED LIMIT 1"
        );
        let picked: std::result::Result<Option<Row>, sqlx::Error> =
            sqlx::query_as(&select_sql).bind(server_path).fetch_optional(&mut *txn).await;

        let loaded = match picked {
            Ok(Some(row)) => row,
            Ok(None) => {
                let _ = txn.rollback().await;
                return Attempt::Ok(None);
            }
            Err(err) if retry::is_transient(&err) => {
                let _ = txn.rollback().await;
                return Attempt::Transient(err);
            }
            Err(err) => return Attempt::Fatal(err.into()),
        };

        let update_sql = format!(
            "UPDATE {escaped} SET state = 'processing', \
             processing_timestamp = (now() AT TIME ZONE 'UTC') WHERE id = $1"
        );
        if let Err(err) = sqlx::query(&update_sql).bind(loaded.id).execute(&mut *txn).await {
            if retry::is_transient(&err) {
                let _ = txn.rollback().await;
                return Attempt::Transient(err);
            }
            return Attempt::Fatal(err.into());
        }

        match txn.commit().await {
            Ok(()) => match RpcServerRow::try_from(loaded) {
                Ok(row) => Attempt::Ok(Some(row)),
                Err(err) => Attempt::Fatal(err),
            },
            Err(err) => Attempt::Fatal(err.into()),
        }
    })
    .await
}

/// Transitions a `processing` slot to `empty`. Returns `Ok(false)` rather
/// than an error if no row matches `(id, server_path, state='processing')`.
#[tracing::instrument(level = "debug", skip(pool))]
pub async fn mark_job_completion(
    pool: &sqlx::PgPool,
    table: &str,
    server_path: &str,
    id: i64,
    max_retries: u32,
    base_delay: Duration,
) -> Result<bool> {
    kb_sql::path::validate_path(server_path)?;
    let escaped = escape_identifier(table);

    retry::retry(Backoff::Serializable, max_retries, base_delay, || async {
        let mut txn = match kb_sql::store::begin_serializable(pool).await {
            Ok(txn) => txn,
            Err(err) => return Attempt::Fatal(err.into()),
        };

        let check_sql = format!(
            "SELECT id FROM {escaped} WHERE id = $1 AND server_path = $2 \
             AND state = 'processing' FOR UPDATE"
        );
        let found: std::result::Result<Option<(i64,)>, sqlx::Error> =
            sqlx::query_as(&check_sql).bind(id).bind(server_path).fetch_optional(&mut *txn).await;

        match found {
            Ok(Some(_)) => {}
            Ok(None) => {
                let _ = txn.rollback().await;
                return Attempt::Ok(false);
            }
            Err(err) if retry::is_transient(&err) => {
                let _ = txn.rollback().await;
                return Attempt::Transient(err);
            }
            Err(err) => return Attempt::Fatal(err.into()),
        }

        let update_sql = format!(
            "UPDATE {escaped} SET state = 'empty', \
             completed_timestamp = (now() AT TIME ZONE 'UTC') WHERE id = $1"
        );
        let affected = match sqlx::query(&update_sql).bind(id).execute(&mut *txn).await {
            Ok(result) => result.rows_affected(),
            Err(err) if retry::is_transient(&err) => {
                let _ = txn.rollback().await;
                return Attempt::Transient(err);
            }
            Err(err) => return Attempt::Fatal(err.into()),
        };

        match txn.commit().await {
            Ok(()) => Attempt::Ok(affected > 0),
            Err(err) => Attempt::Fatal(err.into()),
        }
    })
    .await
}

/// Resets every row for `server_path` to `empty`, with a freshly-randomized
/// `request_id`. Establishes exclusive access with `FOR UPDATE NOWAIT`
/// rather than a table lock, retrying on `55P03` with a constant delay.
#[tracing::instrument(level = "debug", skip(pool))]
pub async fn clear_server_queue(
    pool: &sqlx::PgPool,
    table: &str,
    server_path: &str,
    max_retries: u32,
    base_delay: Duration,
) -> Result<u64> {
    kb_sql::path::validate_path(server_path)?;
    let escaped = escape_identifier(table);

    retry::retry(Backoff::Linear, max_retries, base_delay, || async {
        let mut txn = match pool.begin().await {
            Ok(txn) => txn,
            Err(err) => return Attempt::Fatal(err.into()),
        };

        let lock_sql = format!("SELECT 1 FROM {escaped} WHERE server_path = $1 FOR UPDATE NOWAIT");
        if let Err(err) = sqlx::query(&lock_sql).bind(server_path).execute(&mut *txn).await {
            if retry::is_transient(&err) {
                let _ = txn.rollback().await;
                return Attempt::Transient(err);
            }
            return Attempt::Fatal(err.into());
        }

        let update_sql = format!(
            "UPDATE {escaped} SET request_id = $1, request_payload = '{{}}', \
             completed_timestamp = (now() AT TIME ZONE 'UTC'), state = 'empty', \
             rpc_client_queue = NULL WHERE server_path = $2"
        );
        let affected = match sqlx::query(&update_sql)
            .bind(Uuid::new_v4())
            .bind(server_path)
            .execute(&mut *txn)
            .await
        {
            Ok(result) => result.rows_affected(),
            Err(err) if retry::is_transient(&err) => {
                let _ = txn.rollback().await;
                return Attempt::Transient(err);
            }
            Err(err) => return Attempt::Fatal(err.into()),
        };

        match txn.commit().await {
            Ok(()) => Attempt::Ok(affected),
            Err(err) => Attempt::Fatal(err.into()),
        }
    })
    .await
}

/// Transactional `COUNT(*)` of rows for `server_path` in the given `state`.
/// Fails fast on any state string outside the allowed domain.
pub async fn count(pool: &sqlx::PgPool, table: &str, server_path: &str, state: State) -> Result<i64> {
    kb_sql::path::validate_path(server_path)?;
    let escaped = escape_identifier(table);
    let sql = format!("SELECT COUNT(*) FROM {escaped} WHERE server_path = $1 AND state = $2");
    let count: i64 = sqlx::query_scalar(&sql)
        .bind(server_path)
        .bind(state.as_str())
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advisory_lock_key_matches_djb2_reference_vector() {
        // h=5381; for 'a' (0x61): h = ((5381<<5)+5381)+0x61 = 177286
        assert_eq!(advisory_lock_key("", "") , {
            let h: u64 = 5381;
            h as i64
        });
        let key = advisory_lock_key("t", "a");
        let mut h: u64 = 5381;
        for b in "t:a".bytes() {
            h = (h << 5).wrapping_add(h).wrapping_add(b as u64);
        }
        assert_eq!(key, h as i64);
    }

    #[test]
    fn advisory_lock_key_is_deterministic_and_path_sensitive() {
        let a = advisory_lock_key("kb_rpc_server", "kb1.h.svc_a");
        let b = advisory_lock_key("kb_rpc_server", "kb1.h.svc_a");
        let c = advisory_lock_key("kb_rpc_server", "kb1.h.svc_b");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn state_round_trips_through_str() {
        for state in [State::Empty, State::NewJob, State::Processing, State::CompletedJob] {
            assert_eq!(state.as_str().parse::<State>().unwrap(), state);
        }
    }

    #[test]
    fn rejects_unknown_state_string() {
        assert!("bogus".parse::<State>().is_err());
    }

    #[test]
    fn rejects_empty_rpc_action_or_tag() {
        assert!(validate_push_inputs("kb1.h.svc", "", "tag", None).is_err());
        assert!(validate_push_inputs("kb1.h.svc", "act", "", None).is_err());
        assert!(validate_push_inputs("kb1.h.svc", "act", "tag", None).is_ok());
    }
}
