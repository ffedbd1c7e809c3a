pub mod database;

pub use database::{SqliteStore, Store};
