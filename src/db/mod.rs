//! Database module: write models and SQL repositories.
//!
//! - `model`: values handed to repositories, built from raw inventory records.
//! - `repo`: SQL-only functions mapping rows into `crate::model` entities.
//!
//! Repository functions are re-exported at `crate::db::*`.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{AssetUpsert, ComponentInsert};
