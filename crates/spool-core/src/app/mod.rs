//! App - アプリケーション層
//!
//! ports を組み合わせてキューの動作を実装します。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: ワイヤリングと起動時検証
//! - **Runtime**: enqueue と worker / reaper の起動
//! - **WorkerLoop**: poll → claim → reconstitute → execute → report
//! - **ReaperLoop**: processing のまま止まったタスクの回収
//! - **RetryPolicy**: store エラー時の backoff

pub mod builder;
pub mod reaper_loop;
pub mod retry;
pub mod runtime;
pub mod status;
pub mod worker_loop;

pub use self::builder::{AppBuilder, BuildError};
pub use self::reaper_loop::{ReapSummary, ReaperLoop};
pub use self::retry::RetryPolicy;
pub use self::runtime::{EnqueueError, Runtime, RuntimeHandle};
pub use self::status::QueueCounts;
pub use self::worker_loop::{
    Disposition, ExecutionReport, WorkerLoop, WorkerSettings, WorkerStats, WorkerStatsSnapshot,
};
