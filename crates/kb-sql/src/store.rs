//! Store adapter (spec.md §4.1).
//!
//! A thin wrapper over `sqlx::PgPool`/`sqlx::Transaction`. The adapter itself
//! never retries (that is the retry harness's job, `crate::retry`) and never
//! owns a connection beyond the lifetime of a single operation.

/// Schema-qualified identifier escaping: split on the first `.`, escape each
/// part as a double-quoted Postgres identifier, rejoin. `sqlx` binds values
/// as parameters but never escapes identifiers used in a query template, so
/// every table/column name that is not a string literal must go through
/// this before being interpolated into SQL.
pub fn escape_identifier(ident: &str) -> String {
    match ident.split_once('.') {
        Some((schema, rest)) => format!("{}.{}", quote_ident(schema), quote_ident(rest)),
        None => quote_ident(ident),
    }
}

fn quote_ident(part: &str) -> String {
    format!("\"{}\"", part.replace('"', "\"\""))
}

/// Begins a transaction and sets `SERIALIZABLE` isolation, as required by
/// C7 (RPC server queue) and C8 (RPC client replies) per spec.md §5.
pub async fn begin_serializable(
    pool: &sqlx::PgPool,
) -> sqlx::Result<sqlx::Transaction<'_, sqlx::Postgres>> {
    let mut txn = pool.begin().await?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
        .execute(&mut *txn)
        .await?;
    Ok(txn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_plain_identifier() {
        assert_eq!(escape_identifier("kb_job_table"), "\"kb_job_table\"");
    }

    #[test]
    fn escapes_schema_qualified_identifier_once() {
        assert_eq!(
            escape_identifier("public.kb_job_table"),
            "\"public\".\"kb_job_table\""
        );
    }

    #[test]
    fn escapes_embedded_quotes() {
        assert_eq!(escape_identifier("weird\"table"), "\"weird\"\"table\"");
    }

    #[test]
    fn splits_only_on_first_dot() {
        assert_eq!(
            escape_identifier("a.b.c"),
            "\"a\".\"b.c\""
        );
    }
}
