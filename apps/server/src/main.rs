//! Terminology server binary.

use argentum::api::build_router;
use argentum::config::Config;
use argentum::db::open_store;
use argentum::logging::init_logging;
use argentum::providers::{
    bcp47::Bcp47Provider, cpt::CptProvider, hgvs::HgvsProvider, loinc::LoincProvider,
    ndc::NdcProvider, omop::OmopProvider, rxnorm::RxNormProvider, snomed::SnomedProvider,
    ucum::UcumProvider, ProviderRegistry,
};
use argentum::state::{AppState, ResourceStore};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "tx-server", about = "FHIR terminology server")]
struct Args {
    /// Port override (otherwise from config / TX__SERVER__PORT)
    #[arg(long)]
    port: Option<u16>,
    /// Resource directory override
    #[arg(long)]
    resources: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load()?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(resources) = &args.resources {
        config.server.resources_dir = Some(resources.display().to_string());
    }

    init_logging(&config.logging)?;

    let registry = build_registry(&config).await?;
    tracing::info!(systems = ?registry.systems(), "Providers registered");

    let mut store = ResourceStore::new();
    if let Some(dir) = &config.server.resources_dir {
        let loaded = store.load_dir(std::path::Path::new(dir))?;
        tracing::info!(count = loaded, dir = %dir, "Loaded startup resources");
    }

    let addr = config.socket_addr()?;
    let state = AppState::new(config, registry, store);
    let router = build_router(state);

    tracing::info!(%addr, "Terminology server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

/// Open every configured vocabulary store and register its provider. A
/// missing store skips that provider with a warning; the server still
/// serves everything else.
async fn build_registry(config: &Config) -> anyhow::Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();

    // always-on providers: expression/structural validators
    registry.register(Arc::new(UcumProvider::new()));
    registry.register(Arc::new(Bcp47Provider::new()));

    if let Some(endpoint) = &config.hgvs.endpoint {
        registry.register(Arc::new(HgvsProvider::new(
            endpoint.clone(),
            Duration::from_millis(config.hgvs.timeout_ms),
        )?));
    }

    if let Some(path) = &config.stores.snomed {
        match open_store(path).await {
            Ok(pool) => registry.register(Arc::new(
                SnomedProvider::open(pool, config.operations.wildcard_cap).await?,
            )),
            Err(e) => tracing::warn!(path = %path, error = %e, "SNOMED store unavailable"),
        }
    }
    if let Some(path) = &config.stores.loinc {
        match open_store(path).await {
            Ok(pool) => registry.register(Arc::new(LoincProvider::open(pool).await?)),
            Err(e) => tracing::warn!(path = %path, error = %e, "LOINC store unavailable"),
        }
    }
    if let Some(path) = &config.stores.rxnorm {
        match open_store(path).await {
            Ok(pool) => registry.register(Arc::new(RxNormProvider::open(pool).await?)),
            Err(e) => tracing::warn!(path = %path, error = %e, "RxNorm store unavailable"),
        }
    }
    if let Some(path) = &config.stores.ndc {
        match open_store(path).await {
            Ok(pool) => registry.register(Arc::new(NdcProvider::open(pool).await?)),
            Err(e) => tracing::warn!(path = %path, error = %e, "NDC store unavailable"),
        }
    }
    if let Some(path) = &config.stores.cpt {
        match open_store(path).await {
            Ok(pool) => registry.register(Arc::new(CptProvider::open(pool).await?)),
            Err(e) => tracing::warn!(path = %path, error = %e, "CPT store unavailable"),
        }
    }
    if let Some(path) = &config.stores.omop {
        match open_store(path).await {
            Ok(pool) => registry.register(Arc::new(OmopProvider::open(pool).await?)),
            Err(e) => tracing::warn!(path = %path, error = %e, "OMOP store unavailable"),
        }
    }

    Ok(registry)
}
