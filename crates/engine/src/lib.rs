//! The orchestration engine: per-execution actors for workflow runs and
//! conversations, the event/trace streamer, and the dispatch plumbing that
//! connects them.
//!
//! Entry point: build a [`Runtime`] from a store, an LLM client, and a task
//! executor, then drive it through its public operations (`start_run`,
//! `post_user_message`, `subscribe`, …). Every execution is owned by a
//! single-threaded actor; one mailbox message is processed to completion
//! per tick, and all cross-actor communication is message passing.

pub mod conversation;
pub mod coordinator;
pub mod dispatch;
pub mod emitter;
pub mod executor;
pub mod filter;
pub mod mailbox;
pub mod runtime;
pub mod schema;
pub mod streamer;

pub use emitter::Emitter;
pub use executor::{DefaultExecutor, TaskExecutor, TaskFailure, TaskInvocation};
pub use filter::SubscriberFilter;
pub use runtime::Runtime;
pub use streamer::{StreamerHandle, WirePayload};

/// Result of a dispatched sub-operation, delivered back to the owning actor.
pub type DispatchResult = std::result::Result<serde_json::Value, String>;
