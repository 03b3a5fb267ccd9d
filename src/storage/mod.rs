//! Durable storage (SQLite) and the shared key-value store.

pub mod db;
pub mod kv;

pub use db::Storage;
pub use kv::{KvStore, MemoryKv, SqliteKv};
