//! Impls - TaskStore の実装
//!
//! - **SqliteTaskStore**: 本番用、ファイル（または in-memory）の SQLite
//! - **InMemoryTaskStore**: テスト用・単一プロセス用

pub mod memory_store;
pub mod schema;
pub mod sqlite_store;

#[cfg(test)]
mod conformance;

pub use self::memory_store::InMemoryTaskStore;
pub use self::sqlite_store::SqliteTaskStore;
