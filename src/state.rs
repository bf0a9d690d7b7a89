//! Shared application state

use std::sync::Arc;

use anyhow::Result;

use crate::client::ModelClient;
use crate::config::Config;
use crate::council::Council;
use crate::mcp::McpRegistry;
use crate::memory::MemoryService;
use crate::metrics::MetricsStore;
use crate::storage::Storage;
use crate::title::TitleService;
use crate::tools::ToolOrchestrator;

pub struct AppState {
    pub config: Arc<Config>,
    pub client: Arc<ModelClient>,
    pub registry: Arc<McpRegistry>,
    pub council: Council,
    pub tools: ToolOrchestrator,
    pub memory: Arc<MemoryService>,
    pub storage: Storage,
    pub metrics: Arc<MetricsStore>,
    pub titles: TitleService,
}

impl AppState {
    /// Wire everything up in dependency order: client, MCP registry, then
    /// the services layered on both.
    pub async fn initialize(config: Config) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let data_dir = config.data_dir();

        let client = Arc::new(ModelClient::new(config.clone()));
        let registry = Arc::new(McpRegistry::initialize(&config.mcp).await);

        let metrics = Arc::new(MetricsStore::load(&data_dir, config.valid_models()));
        metrics.cleanup_invalid_models();

        let memory = Arc::new(MemoryService::new(
            client.clone(),
            registry.clone(),
            config.clone(),
        ));
        memory.initialize();

        let council = Council::new(client.clone(), metrics.clone(), config.clone());
        let tools = ToolOrchestrator::new(client.clone(), registry.clone());
        let storage = Storage::new(&data_dir);
        let titles = TitleService::new(client.clone());

        Ok(Arc::new(Self {
            config,
            client,
            registry,
            council,
            tools,
            memory,
            storage,
            metrics,
            titles,
        }))
    }

    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}
