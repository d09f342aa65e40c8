use std::{process, sync::Arc};

use pagecache::{
    cache::{
        CacheAdmin, CacheEnvironment, FileOptionStore, InvalidationCoordinator, OptionStore,
        PageCacheHandle, PageCacheState, PageCacher, options::OPTIONS_KEY,
    },
    config,
    infra::{
        content::{ContentPagesContributor, ContentStore},
        error::InfraError,
        http::{self, AdminState, HttpState},
        telemetry,
    },
};
use tokio::try_join;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| InfraError::configuration(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::ClearCache(_) => run_clear_cache(build_environment(&settings)).await,
        config::Command::Install(_) => run_install(build_environment(&settings)).await,
        config::Command::Uninstall(_) => run_uninstall(build_environment(&settings)).await,
    }
}

fn build_environment(settings: &config::Settings) -> CacheEnvironment {
    let store = Arc::new(FileOptionStore::new(settings.options.path.clone()));
    CacheEnvironment::new(store, settings.cache.default_directory.clone())
        .with_backend_settings(settings.backend.clone())
}

async fn run_serve(settings: config::Settings) -> Result<(), InfraError> {
    let env = Arc::new(build_environment(&settings));
    if env.store.get(OPTIONS_KEY).await?.is_none() {
        install(env.clone()).await?;
    }

    let handle = PageCacheHandle::from_cacher(env.clone(), PageCacher::open(env).await);
    let current = handle.current();
    if let Some(err) = current.first_error() {
        error!(error = %err, "Page cache unavailable; serving uncached");
    }

    let content = Arc::new(ContentStore::new());
    let coordinator = InvalidationCoordinator::new(handle.clone())
        .with_contributor(Arc::new(ContentPagesContributor));

    let cache_state = PageCacheState::new(handle.clone())
        .with_admin_prefix(settings.cache.admin_path_prefix.clone())
        .with_max_body_bytes(settings.cache.max_body_bytes.get());

    let public_router = http::build_router(
        HttpState {
            content: content.clone(),
        },
        cache_state.clone(),
    );
    let admin_router = http::build_admin_router(
        AdminState {
            cache: CacheAdmin::new(handle),
            coordinator: Arc::new(coordinator),
            content,
        },
        cache_state,
    );

    let public_listener = tokio::net::TcpListener::bind(settings.server.public_addr).await?;
    let admin_listener = tokio::net::TcpListener::bind(settings.server.admin_addr).await?;
    info!(
        public_addr = %settings.server.public_addr,
        admin_addr = %settings.server.admin_addr,
        "Listening"
    );

    let public_server = axum::serve(public_listener, public_router.into_make_service())
        .with_graceful_shutdown(shutdown_signal());
    let admin_server = axum::serve(admin_listener, admin_router.into_make_service())
        .with_graceful_shutdown(shutdown_signal());

    try_join!(public_server, admin_server)?;
    Ok(())
}

async fn run_clear_cache(env: CacheEnvironment) -> Result<(), InfraError> {
    let admin = CacheAdmin::for_maintenance(PageCacheHandle::open(env).await);
    if let Some(err) = admin.handle().current().first_error() {
        return Err(InfraError::Cache(err));
    }
    let removed = admin.clear_cache().await?;
    info!(removed, "Page cache cleared");
    Ok(())
}

async fn run_install(env: CacheEnvironment) -> Result<(), InfraError> {
    install(Arc::new(env)).await
}

/// Saves default options and creates the default cache directory.
async fn install(env: Arc<CacheEnvironment>) -> Result<(), InfraError> {
    tokio::fs::create_dir_all(&env.default_directory).await?;
    PageCacher::install(env).await?;
    Ok(())
}

async fn run_uninstall(env: CacheEnvironment) -> Result<(), InfraError> {
    let admin = CacheAdmin::for_maintenance(PageCacheHandle::open(env).await);
    admin.uninstall().await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
    }
}
