pub mod types;
pub mod config;
pub mod error;
pub mod stats;
pub mod sequence;
pub mod store;
pub mod database;
