//! Plan coordination
//!
//! The coordinator walks a plan's DAG with bounded parallelism, gating each
//! step and handing finished artifacts to lineage and the retrospect pool.

pub mod capability;
pub mod coordinator;
pub mod hooks;
pub mod registry;
pub mod types;

pub use capability::*;
pub use coordinator::*;
pub use hooks::*;
pub use registry::*;
pub use types::*;
