//! TaskPayload trait - 型付き Task の定義
//!
//! A payload type names its own task_type, so enqueue and registration can
//! never disagree on the tag.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// TaskPayload は task_type と型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct GenerateCards {
///     memo_id: String,
/// }
///
/// impl TaskPayload for GenerateCards {
///     const TYPE: &'static str = "cards.generate.v1";
/// }
/// ```
///
/// # Trait Bounds
/// - `Serialize` / `DeserializeOwned`: the payload column is JSON
/// - `Send + Sync + 'static`: lives inside a boxed `Task` on a worker task
pub trait TaskPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// task_type の定義
    ///
    /// # 命名規約
    /// - `{domain}.{action}.v{major}`
    /// - 例: `cards.generate.v1`
    const TYPE: &'static str;
}
