#![allow(dead_code)]

use std::sync::Arc;

use tempfile::TempDir;

use taskforge::exec::TaskExecutor;
use taskforge::registry::{RegistryOptions, TaskRegistry};
use taskforge::scheduler::{DispatchOptions, Dispatcher, ExecutionPolicy};
use taskforge::store::ResultStore;

pub use taskforge_test_utils::builders;
pub use taskforge_test_utils::fake_executor::{FakeBehavior, FakeExecutor};
pub use taskforge_test_utils::{init_tracing, wait_for, wait_terminal, with_timeout};

/// A dispatcher over an in-memory registry and a temporary store.
pub struct Harness {
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<TaskRegistry>,
    pub store: ResultStore,
    _dir: TempDir,
}

impl Harness {
    pub async fn new(executor: Arc<dyn TaskExecutor>, options: DispatchOptions) -> Self {
        Self::with_policy(executor, options, ExecutionPolicy::permissive()).await
    }

    pub async fn with_policy(
        executor: Arc<dyn TaskExecutor>,
        options: DispatchOptions,
        policy: ExecutionPolicy,
    ) -> Self {
        init_tracing();
        let dir = TempDir::new().expect("tempdir");
        let store = ResultStore::new(dir.path().join("artifacts"));
        store.init().await.expect("store init");
        let registry = Arc::new(TaskRegistry::in_memory(RegistryOptions::default()));
        let dispatcher = Dispatcher::start(
            Arc::clone(&registry),
            store.clone(),
            executor,
            policy,
            options,
        );
        Self {
            dispatcher: Arc::new(dispatcher),
            registry,
            store,
            _dir: dir,
        }
    }
}
