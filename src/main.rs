use std::{process, sync::Arc};

use paddock::{
    application::{
        content::{ContentService, OrchestratorConfig},
        error::{AppError, ErrorReport},
        repos::{AssetStorage, AuthProvider, ContentReader, ContentWriter},
    },
    cache::{CacheConfig, DurableConfig, DurableStore, FileBackend, KeyValueBackend},
    config,
    infra::{
        auth::StaticAuth,
        gateway::{GatewayOptions, ListLimits, RestGateway},
        realtime::{PhoenixOptions, PhoenixTransport},
        storage::RestAssetStorage,
        telemetry,
    },
    query::{ContentQueries, DurablePersister, QueryClient, QueryConfig, QueryState},
    realtime::{ChangeFeedListener, UpstreamInvalidator},
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    let report = ErrorReport::from_error("paddock", error);
    if dispatcher::has_been_set() {
        error!(source = report.source, chain = ?report.messages, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(source = report.source, chain = ?report.messages, "application error");
    });
}

struct Runtime {
    gateway: Arc<RestGateway>,
    content: Arc<ContentService>,
    queries: ContentQueries,
}

impl Runtime {
    async fn shutdown(&self) {
        self.queries.client().dispose().await;
        self.content.dispose();
        self.gateway.dispose();
    }
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Watch(config::WatchArgs::default()));

    telemetry::init(&settings.logging)?;

    let runtime = build_runtime(&settings)?;
    let restored = runtime.queries.client().init().await;
    info!(
        target = "paddock::startup",
        restored,
        backend = %settings.backend.url,
        "Paddock runtime ready"
    );

    let result = match command {
        config::Command::Refresh => run_refresh(&runtime).await,
        config::Command::Clear => run_clear(&runtime).await,
        config::Command::Show(args) => run_show(&runtime, args.resource).await,
        config::Command::Watch(args) => run_watch(&runtime, &settings, args).await,
    };

    runtime.shutdown().await;
    result
}

fn build_runtime(settings: &config::Settings) -> Result<Runtime, AppError> {
    let backend = &settings.backend;

    let gateway = Arc::new(RestGateway::new(GatewayOptions {
        base_url: backend.url.clone(),
        anon_key: backend.anon_key.clone(),
        request_timeout: backend.request_timeout,
        limits: ListLimits::default(),
        cache: CacheConfig::from(&settings.gateway),
    })?);
    gateway.init();

    let storage_key = backend
        .service_token
        .clone()
        .unwrap_or_else(|| backend.anon_key.clone());
    let storage = RestAssetStorage::new(
        &backend.url,
        backend.storage_bucket.clone(),
        storage_key,
        backend.request_timeout,
    )?;

    let kv: Arc<dyn KeyValueBackend> = Arc::new(FileBackend::new(&settings.durable.directory));
    let durable = DurableStore::new(Arc::clone(&kv), DurableConfig::from(&settings.durable));

    let reader: Arc<dyn ContentReader> = gateway.clone();
    let writer: Arc<dyn ContentWriter> = gateway.clone();
    let storage: Arc<dyn AssetStorage> = Arc::new(storage);
    let auth: Arc<dyn AuthProvider> =
        Arc::new(StaticAuth::service(backend.service_token.as_deref()));

    let content = Arc::new(ContentService::new(
        reader,
        writer,
        storage,
        auth,
        durable,
        OrchestratorConfig::from(&settings.orchestrator),
    ));

    let client = QueryClient::new(
        QueryConfig::from(&settings.query),
        Some(Arc::new(DurablePersister::new(kv))),
    );
    let queries = ContentQueries::new(client, Arc::clone(&content));

    Ok(Runtime {
        gateway,
        content,
        queries,
    })
}

async fn run_refresh(runtime: &Runtime) -> Result<(), AppError> {
    let report = runtime.queries.force_refresh().await;
    println!(
        "featured={} items={} categories={}",
        report.featured, report.items, report.categories
    );
    Ok(())
}

async fn run_clear(runtime: &Runtime) -> Result<(), AppError> {
    let report = runtime.queries.clear_all_caches().await;
    println!("memory={} durable={}", report.memory, report.durable);
    Ok(())
}

async fn run_show(runtime: &Runtime, resource: config::ShowResource) -> Result<(), AppError> {
    let queries = &runtime.queries;
    let state = match resource {
        config::ShowResource::Featured => queries.featured_items().await,
        config::ShowResource::Items => queries.all_items().await,
        config::ShowResource::Category { id } => queries.items_by_category(&id).await,
        config::ShowResource::Item { id } => queries.item(id).await,
        config::ShowResource::Categories => queries.categories().await,
        config::ShowResource::Hierarchy => queries.category_hierarchy().await,
        config::ShowResource::Search { query } => queries.search(&query).await,
    };

    let QueryState { data, error, .. } = state;
    if let Some(error) = error {
        return Err(error.into());
    }
    let Some(data) = data else {
        return Err(AppError::unexpected("query resolved without data"));
    };
    let rendered = serde_json::to_string_pretty(&data)
        .map_err(|err| AppError::unexpected(format!("failed to render result: {err}")))?;
    println!("{rendered}");
    Ok(())
}

async fn run_watch(
    runtime: &Runtime,
    settings: &config::Settings,
    args: config::WatchArgs,
) -> Result<(), AppError> {
    let realtime = &settings.realtime;
    let endpoint = match realtime.endpoint.clone() {
        Some(endpoint) => endpoint,
        None => PhoenixOptions::endpoint_for(&settings.backend.url)?,
    };
    let transport = PhoenixTransport::new(PhoenixOptions {
        endpoint,
        api_key: settings.backend.anon_key.clone(),
        heartbeat: realtime.heartbeat,
        backoff_min: realtime.backoff_min,
        backoff_max: realtime.backoff_max,
    });

    let upstream: Arc<dyn UpstreamInvalidator> = runtime.content.clone();
    let listener = ChangeFeedListener::new(runtime.queries.client().clone(), Arc::new(transport))
        .with_upstream(upstream);

    let tables = if args.tables.is_empty() {
        realtime.tables.clone()
    } else {
        args.tables
    };
    let tables: Vec<&str> = tables.iter().map(String::as_str).collect();

    // Warm the landing resources so the first events have something to patch.
    let (featured, items, categories) = tokio::join!(
        runtime.queries.featured_items(),
        runtime.queries.all_items(),
        runtime.queries.categories()
    );
    for (resource, state) in [
        ("featured", featured),
        ("items", items),
        ("categories", categories),
    ] {
        if let Some(error) = state.error {
            warn!(resource, error = %error, "Initial read failed");
        }
    }

    listener.start(&tables).await?;
    let mut connectivity = listener.watch_connectivity();
    info!(tables = ?tables, "Watching change feed; press Ctrl-C to stop");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    warn!(error = %err, "Failed to listen for shutdown signal");
                }
                break;
            }
            changed = connectivity.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = *connectivity.borrow_and_update();
                info!(status = ?status, "Change feed connectivity changed");
            }
        }
    }

    listener.stop();
    Ok(())
}
