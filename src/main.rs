//! Lectern server binary.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use lectern::analytics::AnalyticsService;
use lectern::assistant::executor::{AssistantExecutor, Connectors, ProcessorRegistry};
use lectern::assistant::groups::GroupDirectory;
use lectern::assistant::sharing::SharingService;
use lectern::assistant::store::AssistantStore;
use lectern::config::Settings;
use lectern::gateway::{self, AppState};
use lectern::kb::ingestion::IngestionService;
use lectern::kb::plugins::markdown::MarkdownPlusIngest;
use lectern::kb::plugins::query::SimpleQuery;
use lectern::kb::plugins::url::UrlIngest;
use lectern::kb::plugins::youtube::YoutubeTranscriptIngest;
use lectern::kb::plugins::PluginRegistry;
use lectern::kb::query::QueryService;
use lectern::kb::store::KbStore;
use lectern::kb::vector::VectorStore;
use lectern::org::resolver::ConfigResolver;
use lectern::org::store::OrgStore;
use lectern::org::{OrgConfig, SYSTEM_ORG_SLUG};
use lectern::providers::banana::BananaConnector;
use lectern::providers::ollama::OllamaConnector;
use lectern::providers::openai::OpenAiConnector;
use lectern::providers::pool::ClientPool;
use lectern::tools::ToolRegistry;

/// Lectern: learning-assistant completion gateway.
#[derive(Debug, Parser)]
#[command(name = "lectern", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the gateway and the embedded knowledge-base service.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve => serve().await,
    }
}

async fn serve() -> anyhow::Result<()> {
    let settings = Settings::load().context("failed to load settings")?;
    let _logging_guard = lectern::logging::init_server(&settings.logs_dir)?;
    info!(host = %settings.host, port = settings.port, "lectern starting");

    // Databases.
    let core_pool = lectern::db::open_pool(&settings.database_path).await?;
    lectern::db::init_core_schema(&core_pool).await?;
    let kb_pool = lectern::db::open_pool(&settings.kb_database_path).await?;
    lectern::db::init_kb_schema(&kb_pool).await?;
    lectern::db::spawn_maintenance(core_pool.clone(), &settings.maintenance);
    lectern::db::spawn_maintenance(kb_pool.clone(), &settings.maintenance);

    // Stores.
    let org_store = OrgStore::new(core_pool.clone());
    let assistant_store = AssistantStore::new(core_pool.clone());
    let kb_store = KbStore::new(kb_pool);
    ensure_system_org(&org_store).await?;

    // Shared outbound HTTP clients.
    let pool = Arc::new(ClientPool::new(
        settings.max_connections,
        settings.completion_timeout,
    ));

    // Provider connectors.
    let resolver = ConfigResolver::new(org_store.clone(), settings.env_providers.clone());
    let tools = Arc::new(ToolRegistry::with_reference_tools(&settings));
    let connectors = Connectors {
        openai: OpenAiConnector::new(Arc::clone(&pool), resolver.clone(), Arc::clone(&tools)),
        ollama: OllamaConnector::new(
            Arc::clone(&pool),
            resolver.clone(),
            settings.env_providers.ollama_timeout,
        ),
        banana: BananaConnector::new(
            Arc::clone(&pool),
            resolver.clone(),
            settings.static_root.clone(),
            settings.public_base_url.clone(),
        ),
    };

    // Knowledge base.
    let vector = VectorStore::new(Arc::clone(&pool), settings.chroma_base_url.clone());
    let mut plugin_registry = PluginRegistry::new();
    plugin_registry.register_ingest(Arc::new(MarkdownPlusIngest::new()));
    plugin_registry.register_ingest(Arc::new(UrlIngest::new()));
    plugin_registry.register_ingest(Arc::new(YoutubeTranscriptIngest::new()));
    plugin_registry.register_query(Arc::new(SimpleQuery::new(
        Arc::clone(&pool),
        kb_store.clone(),
        vector.clone(),
    )));
    let plugin_registry = Arc::new(plugin_registry);

    let ingestion = IngestionService::new(
        kb_store.clone(),
        Arc::clone(&plugin_registry),
        vector,
        Arc::clone(&pool),
        settings.static_root.clone(),
        settings.public_base_url.clone(),
    );
    let query = QueryService::new(kb_store, Arc::clone(&plugin_registry));

    // Assistant pipeline.
    let directory = GroupDirectory::new(settings.owi_base_url.clone(), settings.owi_api_key.clone());
    let sharing = SharingService::new(assistant_store.clone(), org_store.clone(), directory);
    let executor = AssistantExecutor::new(
        assistant_store.clone(),
        org_store,
        sharing,
        Arc::clone(&tools),
        Arc::new(query.clone()),
        connectors,
        ProcessorRegistry::new(),
    );

    // Analytics read model (only with an external chat store configured).
    let analytics = match &settings.owi_database_path {
        Some(path) => match lectern::db::open_readonly_pool(path).await {
            Ok(external) => Some(AnalyticsService::new(external, core_pool)),
            Err(e) => {
                warn!(error = %e, "external chat store unavailable, analytics disabled");
                None
            }
        },
        None => None,
    };

    // HTTP surface.
    let probe = lectern::providers::probe::StatusProbe::new(Arc::clone(&pool), settings.probe_timeout);
    let state = AppState::new(
        settings.clone(),
        executor,
        assistant_store,
        ingestion,
        query,
        tools,
        analytics,
        resolver,
        probe,
    );
    let router = gateway::router(state);

    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "lectern ready");

    axum::serve(listener, router).await.context("server error")
}

/// Ensure the protected system organization exists.
async fn ensure_system_org(store: &OrgStore) -> anyhow::Result<()> {
    if store.organization_by_slug(SYSTEM_ORG_SLUG).await.is_ok() {
        return Ok(());
    }
    store
        .create_organization(SYSTEM_ORG_SLUG, "System", &OrgConfig::default())
        .await
        .context("failed to create system organization")?;
    info!("system organization created");
    Ok(())
}
