//! Store access layer over SQLite.
//!
//! # Responsibility
//! - Provide the narrow `StoreAccess` contract used by sync engines and view.
//! - Keep SQL and history bookkeeping inside the persistence boundary.
//!
//! # Invariants
//! - Every committed write has exactly one history transaction with an
//!   author tag and a token.

mod history;
pub mod notify;
mod records;
pub mod store;
