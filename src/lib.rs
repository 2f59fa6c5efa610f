pub mod config;
pub mod db;
pub mod inventory;
pub mod maintenance;
pub mod model;
pub mod outbox;
pub mod sync;
