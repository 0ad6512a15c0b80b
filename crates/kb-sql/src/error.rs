/// Error taxonomy shared by every coordination primitive (spec.md §7).
///
/// Variants map 1:1 onto the "Kind" column of the error taxonomy table:
/// `InvalidInput`, `PreconditionNotMet`, `NoFreeSlot`, and the
/// retry-exhaustion/fatal-store-error cases that bottom out in `Database`.
/// The `NoRecords` kind (spec.md §4.8) is carried by
/// `kb_queue::rpc_client::SlotCount::NoRecords` instead of a variant here,
/// since it is a property of a *count* result, not a failed operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Empty path, malformed path token, bad UUID, invalid state name, or a
    /// null where one was required. Rejected before any transaction opens.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A precondition the caller was responsible for establishing does not
    /// hold: a stream push against an unprovisioned path, or a `find_*_id`
    /// call whose match count was not exactly one.
    #[error("precondition not met: {0}")]
    PreconditionNotMet(String),

    /// A single-row lookup (status cell `get`) found no matching row.
    #[error("not found: {0}")]
    NotFound(String),

    /// A job-queue push found no slot with `valid = FALSE`.
    #[error("no free slot available")]
    NoFreeSlot,

    /// An RPC server-queue push found no slot with `state = 'empty'`.
    #[error("no empty slot available")]
    NoEmptySlot,

    /// The retry harness (C2) exhausted `max_retries` on a transient error.
    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },

    /// Any other non-OK store status, or a logical row mismatch
    /// (e.g. `complete` targeting a row that does not exist).
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Error {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Error::PreconditionNotMet(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
