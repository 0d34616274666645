//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」。キューのコアはこれらの trait にだけ依存し、
//! 実装（SQLite, in-memory）は `impls` に置きます。

pub mod clock;
pub mod id_generator;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::{StoreError, TaskStore};
