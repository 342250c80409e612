//! Database module for powertrail.
//!
//! Provides SQLite storage with automatic migrations, behind the
//! repository traits the pipeline is written against.

mod models;
mod repo;
mod store;

pub use models::*;
pub use repo::*;
pub use store::*;
