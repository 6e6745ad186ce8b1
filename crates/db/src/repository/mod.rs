//! Repository functions, one per SQL statement.
//!
//! Every function takes a `&DbPool` and returns a `Result<T, DbError>`.
//! Ids travel as text and payloads as JSON strings; decoding them into
//! engine types is the caller's job.

pub mod workflows;
pub mod checkpoints;
