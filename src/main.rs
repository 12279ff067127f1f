//! gridrunner - main entry point.

use std::collections::BTreeMap;
use std::sync::Arc;

use clap::Parser;
use kube::api::Api;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use gridrunner::browser::docker::{DockerAllocator, DockerOptions};
use gridrunner::browser::kubernetes::{
    CiEnvironment, CreateRetry, KubernetesAllocator, PodConverter, PodWatcher,
};
use gridrunner::browser::pool::{PoolConfig, PoolManager};
use gridrunner::browser::quota::{QuotaAllocator, QuotaAuthorizer};
use gridrunner::browser::BrowserAllocator;
use gridrunner::capabilities::ProxyOptions;
use gridrunner::catalog::BrowsersCatalog;
use gridrunner::config::{Backend, Cli};
use gridrunner::event::EventBroker;
use gridrunner::server::{self, AppInfo, AppState};
use gridrunner::session::{PlaywrightSessionService, SessionStorage, WebdriverSessionService};
use gridrunner::shutdown::ShutdownCoordinator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gridrunner=info")),
        )
        .init();

    let catalog_file = cli
        .browsers_config
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "browsers.yaml".to_string());
    let catalog_data = std::fs::read_to_string(&cli.browsers_config).map_err(|e| {
        anyhow::anyhow!(
            "failed to read browsers catalog {}: {e}",
            cli.browsers_config.display()
        )
    })?;
    let catalog = Arc::new(BrowsersCatalog::from_yaml(&catalog_data)?);

    let lineage = Uuid::new_v4().to_string();
    let shutdown = ShutdownCoordinator::new(cli.shutdown_timeout);
    let shutdown_timeout = cli.shutdown_timeout;

    let backend = cli.resolved_backend();
    let mut check_connection = false;
    let backend_allocator: Arc<dyn BrowserAllocator> = match backend {
        Backend::Docker => {
            let client = bollard::Docker::connect_with_local_defaults()?;
            client.ping().await?;
            let map_ports = cli.resolved_port_mapping();
            check_connection = map_ports;
            tracing::info!(map_ports, "using docker backend");
            Arc::new(
                DockerAllocator::new(
                    client,
                    Arc::clone(&catalog),
                    DockerOptions {
                        network: cli.docker_network.clone(),
                        map_ports,
                        privileged: cli.docker_privileged,
                        pull_images: cli.docker_pull_images,
                    },
                )
                .await?,
            )
        }
        Backend::Kubernetes | Backend::Auto => {
            let client = kube::Client::try_default().await?;
            let api: Api<k8s_openapi::api::core::v1::Pod> =
                Api::namespaced(client, &cli.namespace);
            tracing::info!(namespace = %cli.namespace, "using kubernetes backend");

            let template = std::fs::read_to_string(&cli.kube_template).map_err(|e| {
                anyhow::anyhow!(
                    "failed to read pod template {}: {e}",
                    cli.kube_template.display()
                )
            })?;
            let values = std::fs::read_to_string(&cli.kube_template_values).unwrap_or_default();
            let converter =
                PodConverter::new(&template, &values, &lineage, CiEnvironment::from_env())?;

            let watcher = PodWatcher::start(api.clone(), &lineage).await?;
            let hook_watcher = Arc::clone(&watcher);
            shutdown.register("backend", move || {
                Box::pin(async move { hook_watcher.shutdown(shutdown_timeout).await })
            });

            Arc::new(KubernetesAllocator::new(
                api,
                Arc::clone(&catalog),
                converter,
                watcher,
                CreateRetry::new(cli.create_retries, cli.create_timeout),
                cli.create_timeout,
            ))
        }
    };

    let pools = PoolManager::new(
        backend_allocator,
        PoolConfig {
            max_idle: cli.pool_max_idle,
            max_age: cli.pool_max_age,
            idle_timeout: cli.pool_idle_timeout,
        },
    );
    let hook_pools = Arc::clone(&pools);
    shutdown.register("pools", move || {
        Box::pin(async move { hook_pools.shutdown(shutdown_timeout).await })
    });

    let quota = if cli.quota_limit > 0 {
        Some(Arc::new(QuotaAuthorizer::new(
            cli.quota_limit,
            cli.queue_size,
        )))
    } else {
        None
    };
    let allocator: Arc<dyn BrowserAllocator> = match &quota {
        Some(authorizer) => Arc::new(QuotaAllocator::new(
            pools,
            Arc::clone(authorizer),
            cli.queue_timeout,
        )),
        None => pools,
    };

    let storage = SessionStorage::new();
    let hook_storage = Arc::clone(&storage);
    shutdown.register("sessions", move || {
        Box::pin(async move { hook_storage.shutdown(shutdown_timeout).await })
    });

    let client = reqwest::Client::builder()
        .connect_timeout(cli.connect_timeout)
        .build()?;

    let proxy_delete = cli.pool_max_idle > 0;
    let wd = Arc::new(WebdriverSessionService::new(
        Arc::clone(&allocator),
        Arc::clone(&storage),
        client.clone(),
        cli.create_timeout,
        proxy_delete,
    ));
    let pw = Arc::new(PlaywrightSessionService::new(
        allocator,
        Arc::clone(&storage),
        cli.create_timeout,
        check_connection,
    ));

    let broker = Arc::new(EventBroker::default());
    let hook_broker = Arc::clone(&broker);
    shutdown.register("events", move || {
        Box::pin(async move {
            hook_broker.shutdown();
            Ok(())
        })
    });

    let default_proxy = cli
        .proxy_host
        .as_deref()
        .map(|host| ProxyOptions::http_proxy(host, cli.no_proxy.as_deref().unwrap_or("")));

    let state = Arc::new(AppState {
        wd,
        pw,
        catalog,
        quota,
        broker,
        client,
        config_files: BTreeMap::from([(catalog_file, catalog_data)]),
        info: AppInfo::from_build(),
        default_proxy,
    });

    let listener = tokio::net::TcpListener::bind(&cli.listen).await?;
    tracing::info!(listen = %cli.listen, "serving API");

    let server_cancel = CancellationToken::new();
    let serve_cancel = server_cancel.clone();
    let server_task = tokio::spawn(async move {
        let app = server::router(state);
        if let Err(err) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { serve_cancel.cancelled().await })
            .await
        {
            tracing::error!(error = %err, "server failed");
        }
    });
    shutdown.register("server", move || {
        Box::pin(async move {
            server_cancel.cancel();
            let _ = server_task.await;
            Ok(())
        })
    });

    let code = shutdown.run().await;
    std::process::exit(code);
}
