use std::sync::Arc;

use crate::config::{AnnProviderKind, PlatformConfig};
use crate::embedding::EmbeddingService;
use crate::error::PlatformError;
use crate::index::{AnnIndexClient, JsonFileIndex, LanceAnnIndex, VectorIndexer};
use crate::store::ArticleStore;

/// Explicit wiring for everything the pipelines and the retrieval engine
/// need: no process-wide singletons, one value passed down.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<PlatformConfig>,
    pub store: Arc<ArticleStore>,
    pub embedder: Arc<EmbeddingService>,
    pub indexer: Arc<VectorIndexer>,
}

impl AppContext {
    pub async fn initialize(config: PlatformConfig) -> Result<Self, PlatformError> {
        config.validate().map_err(PlatformError::Config)?;

        let store = Arc::new(ArticleStore::open(&config.data_dir.join("newsrag.db"))?);
        let embedder = Arc::new(EmbeddingService::new(&config.embedding)?);

        let client: Arc<dyn AnnIndexClient> = match config.indexing.provider {
            AnnProviderKind::Lance => {
                let path = config.data_dir.join("lance_index");
                Arc::new(
                    LanceAnnIndex::connect(
                        path.to_str().unwrap_or("./lance_index"),
                        config.indexing.distance,
                    )
                    .await?,
                )
            }
            AnnProviderKind::LocalJson => {
                Arc::new(JsonFileIndex::new(&config.data_dir.join("json_index"))?)
            }
        };
        let indexer = Arc::new(VectorIndexer::new(
            client,
            store.clone(),
            config.indexing.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            store,
            embedder,
            indexer,
        })
    }

    /// Assemble a context from already-built parts (used by tests and by
    /// hosts that manage their own provider clients).
    pub fn from_parts(
        config: PlatformConfig,
        store: Arc<ArticleStore>,
        embedder: Arc<EmbeddingService>,
        indexer: Arc<VectorIndexer>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            embedder,
            indexer,
        }
    }
}
