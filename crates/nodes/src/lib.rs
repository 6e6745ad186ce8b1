//! `nodes` crate — the `NodeExecutor` contract and built-in executors.
//!
//! Task bodies are opaque to the engine: every executor, built-in or supplied
//! by the caller, implements [`NodeExecutor`] and the engine dispatches
//! through that trait object without branching on the node kind.

pub mod error;
pub mod traits;
pub mod mock;
pub mod shell;

pub use error::NodeError;
pub use traits::{NodeContext, NodeExecutor};
