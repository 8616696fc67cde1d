//! Gateway server implementation

use crate::config::{ProxyConfig, StorageBackend};
use crate::error::{Error, Result};
use crate::gateway::handler::ProxyState;
use crate::gateway::orchestrator::Orchestrator;
use crate::ingest::{IngestPipeline, IngestQueue, IngestWorkers};
use crate::memory::eviction::EvictionManager;
use crate::memory::handler::MemoryState;
use crate::memory::retrieval::{AccessTracker, RetrievalEngine};
use crate::memory::store::{EntryPersistence, EntryStore, JsonFilePersistence, MemoryPersistence};
use crate::memory::versioning::{JsonlRevisionLog, MemoryRevisionLog, RevisionLog};
use crate::memory::writer::MemoryWriter;
use crate::providers::{
    ChatUpstream, Embedder, FactExtractor, HttpEmbedder, HttpFactExtractor, HttpUpstream,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// How long `stop` waits for queued exchanges to be ingested
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Gateway server state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    /// Not started
    Stopped,
    /// Starting up
    Starting,
    /// Running
    Running,
    /// Shutting down
    ShuttingDown,
}

/// memproxy gateway: owns the store, the pipelines and the background workers.
pub struct Gateway {
    config: ProxyConfig,
    state: Arc<RwLock<GatewayState>>,
    store: Arc<EntryStore>,
    writer: Arc<MemoryWriter>,
    retrieval: Arc<RetrievalEngine>,
    embedder: Arc<dyn Embedder>,
    orchestrator: Arc<Orchestrator>,
    ingest_queue: IngestQueue,
    workers: Mutex<Option<IngestWorkers>>,
}

impl Gateway {
    async fn new(
        config: ProxyConfig,
        embedder: Option<Arc<dyn Embedder>>,
        extractor: Option<Arc<dyn FactExtractor>>,
        upstream: Option<Arc<dyn ChatUpstream>>,
    ) -> Result<Self> {
        config.validate()?;

        let embedder: Arc<dyn Embedder> = match embedder {
            Some(e) => e,
            None => Arc::new(HttpEmbedder::new(&config.embedding)),
        };
        if embedder.dimension() != config.embedding.dimension {
            return Err(Error::Config(format!(
                "Embedder dimension {} does not match configured dimension {}",
                embedder.dimension(),
                config.embedding.dimension
            )));
        }
        let extractor: Arc<dyn FactExtractor> = match extractor {
            Some(e) => e,
            None => Arc::new(HttpFactExtractor::new(&config.extraction)),
        };
        let upstream: Arc<dyn ChatUpstream> = match upstream {
            Some(u) => u,
            None => Arc::new(HttpUpstream::new(&config.upstream)?),
        };

        let (persistence, revisions): (Arc<dyn EntryPersistence>, Arc<dyn RevisionLog>) =
            match config.storage.backend {
                StorageBackend::File => {
                    let base = &config.storage.base_dir;
                    (
                        Arc::new(JsonFilePersistence::new(base).await?),
                        Arc::new(JsonlRevisionLog::new(base).await?),
                    )
                }
                StorageBackend::Memory => (
                    Arc::new(MemoryPersistence),
                    Arc::new(MemoryRevisionLog::new()),
                ),
            };

        let store = Arc::new(EntryStore::open(config.embedding.dimension, persistence).await?);
        let writer = Arc::new(MemoryWriter::new(
            store.clone(),
            revisions,
            EvictionManager::new(config.memory.max_entries)?,
            config.memory.versioning,
        ));

        let tracker = AccessTracker::spawn(store.clone(), config.ingestion.access_queue_capacity);
        let retrieval = Arc::new(
            RetrievalEngine::new(
                store.clone(),
                embedder.clone(),
                &config.memory,
                Duration::from_millis(config.embedding.timeout_ms),
            )
            .with_access_tracker(tracker),
        );

        let pipeline = Arc::new(IngestPipeline::new(
            writer.clone(),
            embedder.clone(),
            extractor,
            &config,
        ));
        let (ingest_queue, workers) = IngestQueue::spawn(
            pipeline,
            config.ingestion.workers,
            config.ingestion.queue_capacity,
        );

        let orchestrator = Arc::new(Orchestrator::new(
            retrieval.clone(),
            store.clone(),
            upstream,
            Some(ingest_queue.clone()),
            config.gateway.trailing_metadata,
        ));

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(GatewayState::Stopped)),
            store,
            writer,
            retrieval,
            embedder,
            orchestrator,
            ingest_queue,
            workers: Mutex::new(Some(workers)),
        })
    }

    /// Get current state
    pub async fn state(&self) -> GatewayState {
        *self.state.read().await
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<EntryStore> {
        &self.store
    }

    pub fn writer(&self) -> &Arc<MemoryWriter> {
        &self.writer
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// State for the proxy router
    pub fn proxy_state(&self) -> ProxyState {
        ProxyState {
            orchestrator: self.orchestrator.clone(),
        }
    }

    /// State for the admin router
    pub fn memory_state(&self) -> MemoryState {
        MemoryState {
            store: self.store.clone(),
            writer: self.writer.clone(),
            retrieval: self.retrieval.clone(),
            embedder: self.embedder.clone(),
            embed_timeout: Duration::from_millis(self.config.embedding.timeout_ms),
        }
    }

    /// Mark the gateway as serving
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state != GatewayState::Stopped {
            return Err(Error::Config("Gateway already running".to_string()));
        }
        *state = GatewayState::Starting;
        drop(state);

        let conversations = self.store.conversation_ids().await.len();
        tracing::info!(
            conversations,
            backend = ?self.config.storage.backend,
            "Starting memproxy gateway"
        );

        *self.state.write().await = GatewayState::Running;
        tracing::info!(
            "memproxy gateway started on {}:{}",
            self.config.gateway.host,
            self.config.gateway.port
        );
        Ok(())
    }

    /// Stop intake and wait for queued exchanges to be ingested.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state != GatewayState::Running {
            return Ok(());
        }
        *state = GatewayState::ShuttingDown;
        drop(state);

        let pending = self.ingest_queue.pending();
        tracing::info!(pending, "Stopping memproxy gateway");
        self.ingest_queue.close();

        if let Some(workers) = self.workers.lock().await.take() {
            if tokio::time::timeout(DRAIN_TIMEOUT, workers.join())
                .await
                .is_err()
            {
                tracing::warn!("Ingestion workers did not drain in time");
            }
        }

        *self.state.write().await = GatewayState::Stopped;
        tracing::info!("memproxy gateway stopped");
        Ok(())
    }

    /// Get gateway status information
    pub async fn status(&self) -> GatewayStatus {
        let state = *self.state.read().await;
        GatewayStatus {
            state: format!("{:?}", state),
            conversations: self.store.conversation_ids().await.len(),
            pending_ingestion: self.ingest_queue.pending(),
            embedding_dimension: self.store.dimension(),
            max_entries: self.config.memory.max_entries,
            versioning: self.config.memory.versioning,
            summarization: self.config.memory.summarization,
        }
    }
}

/// Gateway status information
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    /// Current state
    pub state: String,
    /// Conversations with stored memories
    pub conversations: usize,
    /// Exchanges waiting for ingestion
    pub pending_ingestion: usize,
    pub embedding_dimension: usize,
    pub max_entries: usize,
    pub versioning: bool,
    pub summarization: bool,
}

/// Builder for Gateway
pub struct GatewayBuilder {
    config: ProxyConfig,
    embedder: Option<Arc<dyn Embedder>>,
    extractor: Option<Arc<dyn FactExtractor>>,
    upstream: Option<Arc<dyn ChatUpstream>>,
}

impl GatewayBuilder {
    /// Create a new builder with default config
    pub fn new() -> Self {
        Self {
            config: ProxyConfig::default(),
            embedder: None,
            extractor: None,
            upstream: None,
        }
    }

    /// Set the configuration
    pub fn config(mut self, config: ProxyConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the gateway host
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.gateway.host = host.into();
        self
    }

    /// Set the gateway port
    pub fn port(mut self, port: u16) -> Self {
        self.config.gateway.port = port;
        self
    }

    /// Use a custom embedder instead of the HTTP one
    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Use a custom fact extractor instead of the HTTP one
    pub fn extractor(mut self, extractor: Arc<dyn FactExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Use a custom upstream instead of the HTTP one
    pub fn upstream(mut self, upstream: Arc<dyn ChatUpstream>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    /// Build the gateway. Must be called inside a Tokio runtime.
    pub async fn build(self) -> Result<Gateway> {
        Gateway::new(self.config, self.embedder, self.extractor, self.upstream).await
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}
