//! Application state wiring all services together.
//!
//! AppState holds the concrete service instances used by both CLI and REST
//! API. The session service is generic over its collaborators; AppState pins
//! them to the concrete infra implementations.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use chatrelay_core::cache::box_store::BoxCacheStore;
use chatrelay_core::pipeline::processor::GenerationPipeline;
use chatrelay_core::service::SessionService;
use chatrelay_core::session::persistence::SnapshotPersistence;
use chatrelay_core::session::recovery::{RecoveryReport, recover_sessions};
use chatrelay_core::session::registry::SessionRegistry;
use chatrelay_core::session::sweeper::spawn_sweeper;
use chatrelay_core::session::writer::SnapshotWriter;
use chatrelay_infra::config::{load_global_config, resolve_data_dir};
use chatrelay_infra::llm::cached::CachedModelClient;
use chatrelay_infra::llm::openai_compat::OpenAiCompatClient;
use chatrelay_infra::sqlite::api_key::SqliteApiKeyStore;
use chatrelay_infra::sqlite::cache::SqliteCacheStore;
use chatrelay_infra::sqlite::conversation::SqliteConversationStore;
use chatrelay_infra::sqlite::pool::{DatabasePool, database_url};
use chatrelay_infra::sqlite::quota::SqliteQuotaLedger;
use chatrelay_types::config::GlobalConfig;

/// Concrete type alias for the session service pinned to infra implementations.
pub type ConcreteSessionService = SessionService<
    CachedModelClient<OpenAiCompatClient>,
    SqliteQuotaLedger,
    SqliteConversationStore,
>;

/// Shared application state holding all services.
///
/// Used by both CLI commands and REST API handlers.
#[derive(Clone)]
pub struct AppState {
    pub session_service: ConcreteSessionService,
    pub persistence: Arc<SnapshotPersistence>,
    pub ledger: Arc<SqliteQuotaLedger>,
    pub conversations: Arc<SqliteConversationStore>,
    pub api_keys: Arc<SqliteApiKeyStore>,
    pub config: Arc<GlobalConfig>,
    pub data_dir: PathBuf,
    pub db_pool: DatabasePool,
    /// Stops the snapshot writer and the sweeper.
    pub shutdown: CancellationToken,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl AppState {
    /// Initialize the application state in the resolved data directory.
    pub async fn init() -> anyhow::Result<Self> {
        Self::init_in(resolve_data_dir()).await
    }

    /// Initialize the application state: open the DB, start the snapshot
    /// writer, wire services.
    pub async fn init_in(data_dir: PathBuf) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_global_config(&data_dir).await;
        let db_pool = DatabasePool::new(&database_url(&data_dir)).await?;

        let session_config = config.session.clone();
        let persistence = Arc::new(SnapshotPersistence::new(
            BoxCacheStore::new(SqliteCacheStore::new(db_pool.clone())),
            session_config.cache_namespace.clone(),
            session_config.retention(),
        ));

        let shutdown = CancellationToken::new();
        let (writer, writer_task) = SnapshotWriter::spawn(
            persistence.clone(),
            session_config.snapshot_concurrency,
            shutdown.clone(),
        );
        let registry = Arc::new(SessionRegistry::new(session_config, writer));

        let model = Arc::new(CachedModelClient::new(
            OpenAiCompatClient::from_env(&config.upstream)?,
            BoxCacheStore::new(SqliteCacheStore::new(db_pool.clone())),
            config.upstream.response_cache_namespace.clone(),
            config.upstream.response_cache_ttl(),
        ));
        let ledger = Arc::new(SqliteQuotaLedger::new(db_pool.clone(), &config.model_rates));
        let conversations = Arc::new(SqliteConversationStore::new(db_pool.clone()));

        let pipeline =
            GenerationPipeline::new(registry, model, ledger.clone(), conversations.clone());
        let session_service = SessionService::new(pipeline);

        Ok(Self {
            session_service,
            persistence,
            ledger,
            conversations,
            api_keys: Arc::new(SqliteApiKeyStore::new(db_pool.clone())),
            config: Arc::new(config),
            data_dir,
            db_pool,
            shutdown,
            tasks: Arc::new(Mutex::new(vec![writer_task])),
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.session_service.registry()
    }

    /// Reload durable snapshots and start the periodic sweep. Called once
    /// before serving.
    pub async fn start_background(&self) -> RecoveryReport {
        let report = recover_sessions(self.registry()).await;

        let sweeper = spawn_sweeper(
            self.registry().clone(),
            self.config.session.sweep_interval(),
            self.shutdown.clone(),
        );
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sweeper);

        report
    }

    /// Flush pending snapshots, stop background tasks and close the pool.
    pub async fn shutdown(&self) {
        self.registry().flush().await;
        self.shutdown.cancel();

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }

        self.db_pool.close().await;
    }
}
