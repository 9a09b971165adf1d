//! Canonical types for the Onlyboxes console.
//!
//! Everything that crosses a crate boundary lives here: identifier
//! newtypes, lifecycle enums, the wire error taxonomy, system defaults
//! and the HTTP API payload types. The console, the stores and the
//! surfaces all speak these types; nothing else defines its own copy.

pub mod defaults;
pub mod http_types;
pub mod ids;
pub mod types;

// Re-export the canonical types for convenience
pub use ids::{AccountId, CommandId, IdParseError, NodeId, TaskId, TokenId};
pub use types::{
    capabilities, capability_key, CapabilityDecl, ErrorCode, SubmitMode, TaskStatus, WorkerType,
    LABEL_OWNER_ID, LABEL_WORKER_TYPE,
};
