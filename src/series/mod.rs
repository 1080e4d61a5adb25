//! Time series module.
//!
//! Provides the persisted sample model and the append-only CSV store.

mod models;
mod store;

pub use models::*;
pub use store::*;
