//! Process entry point: resolves configuration, builds every C1-C10
//! handle, spawns the C9 worker, and serves the C11 router.
//!
//! Grounded in the teacher's `main.rs` (load settings, build services top
//! down, build the router, serve) — the teacher's database-pool/document
//! service chain is replaced by this crate's retriever/LLM/cache/span
//! chain, but the overall shape (sequential `Arc`-wrapped construction,
//! one `build_router` call, one `axum::serve`) is unchanged.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use corpus_qa_server::config::Settings;
use corpus_qa_server::corpus::{capabilities_for_module, Bm25Sidecar, HybridRetriever, Retriever};
use corpus_qa_server::error::ApiError;
use corpus_qa_server::http::build_router;
use corpus_qa_server::jobs::{self, InMemoryJobStore, JobStore, RedisJobQueue};
use corpus_qa_server::llm::{self, LlmAdapter, Provider};
use corpus_qa_server::orchestrator::Orchestrator;
use corpus_qa_server::promptcache::PromptCache;
use corpus_qa_server::state::{AppState, RateLimit};
use corpus_qa_server::store::{
    FlatIndexFactory, HandleKey, HandlePool, HashingEmbedderFactory,
};
use corpus_qa_server::telemetry::{init_tracing, EmbeddedSpanStore, SharedSpanStore, SpanStore, Tracer};

#[tokio::main]
async fn main() -> Result<()> {
    let _logging_guard = init_tracing();
    info!("starting corpus QA server");

    let settings = Settings::load()?;
    info!(environment = %settings.environment, module = %settings.retriever_config.retriever_module, "configuration loaded");

    let handle_pool = Arc::new(HandlePool::new(
        Duration::from_secs(settings.vector_store.handle_idle_ttl_secs),
        Arc::new(FlatIndexFactory),
        Arc::new(HashingEmbedderFactory),
    ));
    let handle = handle_pool
        .get(HandleKey {
            collection: settings.vector_store.collection_name.clone(),
            embedding_model: settings.retriever_config.embedding_model.clone(),
            persist_directory: settings.vector_store.persist_directory.clone(),
        })
        .await?;

    let corpus_path = Path::new(&settings.vector_store.persist_directory);
    let bm25 = if corpus_path.exists() {
        Some(Arc::new(Bm25Sidecar::load(corpus_path)?))
    } else {
        info!(path = %corpus_path.display(), "no BM25 sidecar file found, hybrid search degrades to dense-only");
        None
    };

    let capabilities = capabilities_for_module(&settings.retriever_config.retriever_module);
    let retriever: Arc<dyn Retriever> = Arc::new(HybridRetriever::new(
        handle.embedder.clone(),
        handle.index.clone(),
        bm25,
        capabilities.clone(),
        Duration::from_secs(settings.retriever_config.request_timeout_secs),
    ));

    let llm_adapter: Arc<dyn LlmAdapter> = Arc::from(llm::build_adapter(
        Provider::parse(&settings.llm_provider),
        settings.llm_model.clone(),
    )?);

    let prompt_cache = Arc::new(PromptCache::new(
        Duration::from_secs(settings.prompt_cache.ttl_secs),
        settings.prompt_cache.cache_system_prompt,
        settings.prompt_cache.cache_context,
    ));

    let span_store: Arc<dyn SpanStore> = match &settings.redis {
        Some(redis) => {
            info!("using Redis-backed span registry");
            SharedSpanStore::connect(&redis.url).await?
        }
        None => {
            info!(path = %settings.span_registry_path, "using embedded, file-backed span registry");
            EmbeddedSpanStore::open(settings.span_registry_path.clone()).await?
        }
    };
    let tracer = Arc::new(Tracer::new(span_store));

    let orchestrator = Arc::new(Orchestrator::new(
        retriever,
        llm_adapter,
        prompt_cache.clone(),
        tracer.clone(),
        settings.limits.llm_max_concurrent,
        settings.retriever_config.citation_limit,
        &settings.retriever_config.retriever_module,
        settings.llm_provider.clone(),
        settings.llm_model.clone(),
        settings.limits.llm_max_response_chars,
    ));

    let job_store: Arc<dyn JobStore> = match &settings.redis {
        Some(redis) => {
            info!("using Redis-backed async job queue");
            RedisJobQueue::connect(&redis.url).await?
        }
        None => {
            info!("using in-process async job queue (development only)");
            Arc::new(InMemoryJobStore::new())
        }
    };

    tokio::spawn(jobs::run_worker(
        job_store.clone(),
        orchestrator.clone(),
        settings.retriever_config.k,
    ));

    {
        let pool = handle_pool.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tick.tick().await;
                pool.sweep_idle();
            }
        });
    }

    let rate_limit = Arc::new(RateLimit::per_minute(settings.limits.rate_limit_per_minute));
    let server_host = settings.server.host.clone();
    let server_port = settings.server.port;

    let state = AppState {
        settings: Arc::new(settings),
        orchestrator,
        job_store,
        prompt_cache,
        tracer,
        retriever_capabilities: Arc::new(capabilities),
        rate_limit,
    };

    let app = build_router(state);

    let addr = SocketAddr::from((
        server_host
            .parse::<std::net::IpAddr>()
            .map_err(|err| ApiError::Config(err.to_string()))?,
        server_port,
    ));

    info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}
