//! Application state wiring the engine together.
//!
//! `AppState` holds the concrete engine services used by both the CLI and
//! the REST API. Core services are generic over the repository trait;
//! AppState pins them to the SQLite implementation.

use std::path::PathBuf;
use std::sync::Arc;

use stepwell_core::engine::backoff::RetryPolicy;
use stepwell_core::engine::capability::CapabilityRegistry;
use stepwell_core::engine::dead_letter::DeadLetterManager;
use stepwell_core::engine::executor::{ExecutorConfig, StepExecutor};
use stepwell_core::engine::launcher::RunLauncher;
use stepwell_core::engine::safety::SafetyGate;
use stepwell_core::engine::scheduler::TimerScheduler;
use stepwell_core::engine::signal::SignalRouter;
use stepwell_core::event::bus::EventBus;
use stepwell_infra::capability::http::HttpWebhookCapability;
use stepwell_infra::config::{load_engine_config, resolve_data_dir};
use stepwell_infra::sqlite::engine::SqliteEngineRepository;
use stepwell_infra::sqlite::pool::DatabasePool;
use stepwell_types::config::EngineConfig;
use tokio_util::sync::CancellationToken;

/// Concrete type aliases for the engine generics pinned to SQLite.
pub type ConcreteExecutor = StepExecutor<SqliteEngineRepository>;
pub type ConcreteLauncher = RunLauncher<SqliteEngineRepository>;
pub type ConcreteSignalRouter = SignalRouter<SqliteEngineRepository>;
pub type ConcreteDeadLetterManager = DeadLetterManager<SqliteEngineRepository>;

/// Shared application state holding all engine services.
#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<SqliteEngineRepository>,
    pub executor: Arc<ConcreteExecutor>,
    pub launcher: Arc<ConcreteLauncher>,
    pub signals: Arc<ConcreteSignalRouter>,
    pub dead_letters: Arc<ConcreteDeadLetterManager>,
    pub events: EventBus,
    pub gate: SafetyGate,
    pub config: EngineConfig,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Initialize the application state: connect to the DB, register
    /// capabilities, wire the engine services.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_engine_config(&data_dir).await;

        let db_url = format!(
            "sqlite://{}?mode=rwc",
            data_dir.join("stepwell.db").display()
        );
        let pool = DatabasePool::new(&db_url).await?;
        let repo = Arc::new(SqliteEngineRepository::new(pool));

        let events = EventBus::new(1024);
        let gate = SafetyGate::new();

        let capabilities = CapabilityRegistry::new();
        capabilities.register(Arc::new(HttpWebhookCapability::new()));

        let executor_config = ExecutorConfig {
            max_hops: config.limits.max_hops,
            retry: RetryPolicy {
                base_secs: config.retry.base_secs,
                factor: config.retry.factor,
                cap_secs: config.retry.cap_secs,
                max_retries: config.retry.max_retries,
            },
        };

        let executor = Arc::new(StepExecutor::new(
            Arc::clone(&repo),
            capabilities,
            gate.clone(),
            events.clone(),
            executor_config,
        ));
        let launcher = Arc::new(RunLauncher::new(
            Arc::clone(&repo),
            Arc::clone(&executor),
            events.clone(),
        ));
        let signals = Arc::new(SignalRouter::new(
            Arc::clone(&repo),
            Arc::clone(&executor),
            events.clone(),
        ));
        let dead_letters = Arc::new(DeadLetterManager::new(
            Arc::clone(&repo),
            Arc::clone(&executor),
            events.clone(),
        ));

        Ok(Self {
            repo,
            executor,
            launcher,
            signals,
            dead_letters,
            events,
            gate,
            config,
            data_dir,
        })
    }

    /// Spawn the background timer scheduler. Returns the token that stops
    /// it on shutdown.
    pub fn spawn_scheduler(&self) -> CancellationToken {
        let scheduler = Arc::new(TimerScheduler::new(
            Arc::clone(&self.repo),
            Arc::clone(&self.executor),
            std::time::Duration::from_secs(self.config.scheduler.poll_interval_secs),
            self.config.scheduler.batch_limit,
        ));
        let token = scheduler.shutdown_token();
        tokio::spawn(async move { scheduler.run().await });
        token
    }
}
