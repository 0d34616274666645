//! spool-core
//!
//! A durable background-task queue: tasks are persisted to a relational store,
//! claimed atomically by workers, and recovered when a worker dies mid-run.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（TaskId, TaskStatus, TaskRecord, Task trait, outcomes）
//! - **ports**: 抽象化レイヤー（TaskStore, Clock, IdGenerator）
//! - **impls**: TaskStore 実装（SQLite, in-memory）
//! - **typed**: 型付き Task API（TaskPayload, Handler, TaskRegistry, PayloadCodec）
//! - **app**: worker / reaper / runtime / builder
//! - **config**: QueueConfig（TOML + 環境変数）

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod typed;

pub use crate::app::{AppBuilder, QueueCounts, Runtime, RuntimeHandle};
pub use crate::config::QueueConfig;
pub use crate::domain::{ExecutionContext, Task, TaskError, TaskId, TaskRecord, TaskStatus};
pub use crate::ports::TaskStore;
pub use crate::typed::{Handler, TaskPayload, TaskRegistry};
