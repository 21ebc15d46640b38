//! Execution contexts and the collaborator-facing controller.
//!
//! # Responsibility
//! - Serialize view reads, local edits and replay merges on one queue.
//! - Keep UI/FFI layers decoupled from store and sync details.

pub mod controller;
pub mod foreground;
pub mod query;
pub mod view_context;
