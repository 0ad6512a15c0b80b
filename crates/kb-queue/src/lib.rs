//! The four coordination primitives layered on `kb-sql` (spec.md §4.4-§4.8):
//! status cells, stream rings, job queues, and the paired RPC server/client
//! mailboxes.

pub mod job_queue;
pub mod rpc_client;
pub mod rpc_server;
pub mod status;
pub mod stream;

pub use kb_sql::error::{Error, Result};
