//! Store adapter, retry harness, and discovery query for the knowledge-base
//! coordination substrate (spec.md §4.1-§4.3).
//!
//! This crate has no knowledge of the five coordination primitives
//! themselves (status cells, stream rings, job queues, RPC mailboxes) —
//! those live in `kb-queue`, which depends on this crate the way
//! `automations` depends on `agent-sql` in the teacher repo.

pub mod discovery;
pub mod error;
pub mod path;
pub mod retry;
pub mod store;

pub use discovery::{DiscoveryRow, KBQuery, Label};
pub use error::{Error, Result};
pub use retry::{Attempt, Backoff};
