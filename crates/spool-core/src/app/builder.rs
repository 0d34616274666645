//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! # Fail-fast 設計
//! - `expect_tasks()` で期待される task_type を宣言
//! - `build()` 時に「期待集合 ⊆ 登録済み集合」をチェック
//! - store や config の不備も build() で検出

use std::sync::Arc;

use thiserror::Error;

use super::runtime::Runtime;
use crate::config::{ConfigError, QueueConfig};
use crate::ports::{Clock, IdGenerator, SystemClock, TaskStore, UlidGenerator};
use crate::typed::{Handler, RegistryError, TaskFactory, TaskPayload, TaskRegistry};

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("missing task types: {0:?}; these were expected but not registered")]
    MissingTaskTypes(Vec<String>),

    #[error("no task store configured")]
    MissingStore,

    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
}

/// AppBuilder は Runtime を構築
///
/// # 使用例
/// ```ignore
/// let runtime = AppBuilder::new()
///     .with_store(Arc::new(SqliteTaskStore::open("spool.db").await?))
///     .register::<GenerateCards, _>(GenerateCardsHandler)?
///     .expect_tasks(&[GenerateCards::TYPE])
///     .build()?;
/// ```
pub struct AppBuilder {
    registry: TaskRegistry,
    expected_tasks: Option<Vec<String>>,
    store: Option<Arc<dyn TaskStore>>,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    id_generator: Option<Arc<dyn IdGenerator>>,
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            registry: TaskRegistry::new(),
            expected_tasks: None,
            store: None,
            config: QueueConfig::default(),
            clock: Arc::new(SystemClock),
            id_generator: None,
        }
    }

    /// Handler を登録
    pub fn register<T, H>(mut self, handler: H) -> Result<Self, RegistryError>
    where
        T: TaskPayload,
        H: Handler<T> + 'static,
    {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    /// Factory を task_type に直接登録
    pub fn register_factory<F>(
        mut self,
        task_type: impl Into<String>,
        factory: F,
    ) -> Result<Self, RegistryError>
    where
        F: TaskFactory + 'static,
    {
        self.registry.register_factory(task_type, factory)?;
        Ok(self)
    }

    /// 期待される task_type のリストを設定
    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Clock for the default id generator. Stores take their own clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_id_generator(mut self, id_generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = Some(id_generator);
        self
    }

    /// # 検証
    /// - config が妥当か
    /// - store が設定されているか
    /// - expect_tasks() の task_type が全て登録されているか
    pub fn build(self) -> Result<Runtime, BuildError> {
        self.config.validate()?;

        let store = self.store.ok_or(BuildError::MissingStore)?;

        if let Some(expected_tasks) = &self.expected_tasks {
            let missing_tasks: Vec<String> = expected_tasks
                .iter()
                .filter(|t| !self.registry.contains(t))
                .cloned()
                .collect();
            if !missing_tasks.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing_tasks));
            }
        }

        let id_generator = self
            .id_generator
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(self.clock)) as Arc<dyn IdGenerator>);

        Ok(Runtime::new(store, self.registry, id_generator, self.config))
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}
