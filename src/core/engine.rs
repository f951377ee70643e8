//! The explicit engine context: every component constructed once at
//! startup and shared by reference. No process-wide mutable state hides
//! anywhere else.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};
use tracing::info;

use crate::config::Settings;
use crate::core::agents::AgentRegistry;
use crate::core::agents::runner::AgentRunner;
use crate::core::cache::ArtifactCache;
use crate::core::limiter::Limiter;
use crate::core::memory::MemoryLog;
use crate::core::model::{ModelClient, ModelProvider};
use crate::core::orchestrator::Orchestrator;
use crate::core::queue::{InMemoryQueue, Queue};
use crate::core::research::Researcher;
use crate::core::research::fetch::{Fetcher, PageFetcher};
use crate::core::research::search::SearchProvider;
use crate::core::signal::CancelRegistry;
use crate::core::store::Store;
use crate::core::webhooks::WebhookIngress;
use crate::core::worker::WorkerPool;

const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

pub struct Engine {
    pub settings: Settings,
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn Queue>,
    pub cache: Arc<ArtifactCache>,
    pub limiter: Arc<Limiter>,
    pub memory: Arc<MemoryLog>,
    pub model: Arc<ModelClient>,
    pub researcher: Arc<Researcher>,
    pub registry: Arc<AgentRegistry>,
    pub runner: Arc<AgentRunner>,
    pub orchestrator: Arc<Orchestrator>,
    pub ingress: Arc<WebhookIngress>,
    pub cancellations: Arc<CancelRegistry>,
    pub fetcher: Arc<dyn Fetcher>,
    shutting_down: AtomicBool,
    in_memory_queue: Option<Arc<InMemoryQueue>>,
}

impl Engine {
    /// Wire every component. The store, queue, model provider, and search
    /// provider are the external collaborators; everything else is built
    /// here.
    pub fn new(
        settings: Settings,
        store: Arc<dyn Store>,
        queue: Arc<dyn Queue>,
        provider: Arc<dyn ModelProvider>,
        search: Arc<dyn SearchProvider>,
    ) -> Arc<Self> {
        Self::assemble(settings, store, queue, provider, search, None, None)
    }

    /// Wiring with every external collaborator supplied, page fetcher
    /// included. Test harnesses use this to run the engine fully
    /// in-process.
    pub fn with_collaborators(
        settings: Settings,
        store: Arc<dyn Store>,
        queue: Arc<dyn Queue>,
        provider: Arc<dyn ModelProvider>,
        search: Arc<dyn SearchProvider>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Arc<Self> {
        Self::assemble(settings, store, queue, provider, search, Some(fetcher), None)
    }

    /// Single-process wiring with the in-memory queue, keeping a handle so
    /// shutdown can drain it.
    pub fn with_in_memory_queue(
        settings: Settings,
        store: Arc<dyn Store>,
        provider: Arc<dyn ModelProvider>,
        search: Arc<dyn SearchProvider>,
    ) -> Arc<Self> {
        let queue = InMemoryQueue::new();
        Self::assemble(
            settings,
            store,
            queue.clone(),
            provider,
            search,
            None,
            Some(queue),
        )
    }

    fn assemble(
        settings: Settings,
        store: Arc<dyn Store>,
        queue: Arc<dyn Queue>,
        provider: Arc<dyn ModelProvider>,
        search: Arc<dyn SearchProvider>,
        fetcher: Option<Arc<dyn Fetcher>>,
        in_memory_queue: Option<Arc<InMemoryQueue>>,
    ) -> Arc<Self> {
        let cache = Arc::new(ArtifactCache::new(
            settings.cache_ttl_model,
            settings.cache_ttl_page,
            settings.cache_ttl_research,
        ));
        let limiter = Arc::new(Limiter::new(
            settings.k_global,
            settings.k_user,
            settings.bucket_capacity,
            settings.bucket_refill_per_sec,
        ));
        let model = Arc::new(ModelClient::new(provider, cache.clone(), limiter.clone()));
        let memory = Arc::new(MemoryLog::new(
            store.clone(),
            settings.memory_recent_verbatim,
            settings.memory_token_budget,
        ));
        let fetcher: Arc<dyn Fetcher> = fetcher.unwrap_or_else(|| {
            Arc::new(PageFetcher::new(
                limiter.clone(),
                cache.clone(),
                settings.fetch_timeout,
                settings.per_source_char_cap,
            ))
        });
        let researcher = Arc::new(Researcher::new(
            search,
            fetcher.clone(),
            model.clone(),
            cache.clone(),
            settings.research_max_sources,
            settings.per_source_char_cap,
        ));
        let registry = Arc::new(AgentRegistry::builtin());
        let runner = Arc::new(AgentRunner::new(
            registry.clone(),
            model.clone(),
            memory.clone(),
            store.clone(),
            settings.clone(),
        ));
        let cancellations = Arc::new(CancelRegistry::new());
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            queue.clone(),
            registry.clone(),
            cancellations.clone(),
        ));
        let ingress = Arc::new(WebhookIngress::new(
            store.clone(),
            queue.clone(),
            &settings.webhook_secret,
        ));

        Arc::new(Self {
            settings,
            store,
            queue,
            cache,
            limiter,
            memory,
            model,
            researcher,
            registry,
            runner,
            orchestrator,
            ingress,
            cancellations,
            fetcher,
            shutting_down: AtomicBool::new(false),
            in_memory_queue,
        })
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Start the worker pool and the cache sweep timer.
    pub fn start_background(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = WorkerPool::start(self.clone(), self.settings.workers);

        let engine = self.clone();
        handles.push(tokio::spawn(async move {
            while !engine.is_shutting_down() {
                sleep(SWEEP_INTERVAL).await;
                engine.cache.sweep().await;
            }
        }));
        info!(workers = self.settings.workers, "engine background loops started");
        handles
    }

    /// Graceful shutdown: stop intake, signal cancellation to outstanding
    /// tasks, and give workers a grace period to drain.
    pub async fn shutdown(&self) {
        info!("engine shutting down");
        self.shutting_down.store(true, Ordering::SeqCst);
        self.orchestrator.stop_accepting();
        if let Some(queue) = &self.in_memory_queue {
            queue.close().await;
        }
        self.cancellations.cancel_all().await;
        sleep(self.settings.shutdown_grace.min(Duration::from_secs(30))).await;
        info!("engine shutdown complete");
    }
}
