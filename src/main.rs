//! Sidecar injector - Kubernetes mutating admission webhook for sidecar injection

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use kube::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sidecar_injector::catalog::{Catalog, DEFAULT_ANNOTATION_NAMESPACE};
use sidecar_injector::coalescer::coalesce;
use sidecar_injector::watcher::{infer_namespace, ConfigMapWatcher};
use sidecar_injector::webhook::{admission_router, lifecycle_router, WebhookState};
use sidecar_injector::{metrics, template};
use sidecar_injector::{DEFAULT_COALESCE_WINDOW_SECS, DEFAULT_LIFECYCLE_PORT, DEFAULT_TLS_PORT};

/// Sidecar injector - mutating webhook that merges sidecar templates into pods
#[derive(Parser, Debug)]
#[command(name = "sidecar-injector", version, about, long_about = None)]
struct Cli {
    /// Metrics and introspection port (metrics, health checking)
    #[arg(long, default_value_t = DEFAULT_LIFECYCLE_PORT)]
    lifecycle_port: u16,

    /// Webhook server port for handling admission reviews (TLS)
    #[arg(long, default_value_t = DEFAULT_TLS_PORT)]
    tls_port: u16,

    /// File containing the x509 certificate for HTTPS
    #[arg(long, default_value = "/var/lib/secrets/cert.pem")]
    tls_cert_file: PathBuf,

    /// File containing the x509 private key matching --tls-cert-file
    #[arg(long, default_value = "/var/lib/secrets/cert.key")]
    tls_key_file: PathBuf,

    /// Directory to load sidecar template yaml files from
    #[arg(long, default_value = "conf/")]
    config_directory: PathBuf,

    /// Override the annotation namespace scoping the request/status
    /// annotations
    #[arg(long, default_value = DEFAULT_ANNOTATION_NAMESPACE)]
    annotation_namespace: String,

    /// Namespace to search for ConfigMaps holding sidecar templates
    /// (default: the pod's own namespace)
    #[arg(long, default_value = "")]
    configmap_namespace: String,

    /// Label pairs used to discover ConfigMaps, formatted
    /// key=value[,key2=value2]
    #[arg(long, value_parser = parse_label_pairs, default_value = "")]
    configmap_labels: BTreeMap<String, String>,

    /// Window in seconds over which bursts of ConfigMap change events are
    /// coalesced into a single reconciliation
    #[arg(long, default_value_t = DEFAULT_COALESCE_WINDOW_SECS)]
    coalesce_window_secs: u64,
}

fn parse_label_pairs(raw: &str) -> Result<BTreeMap<String, String>, String> {
    let mut labels = BTreeMap::new();
    if raw.is_empty() {
        return Ok(labels);
    }
    for pair in raw.split(',') {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(format!(
                "{pair} is incorrectly formatted! should be key=value[,key2=value2]"
            ));
        };
        labels.insert(key.to_string(), value.to_string());
    }
    Ok(labels)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install crypto provider");

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    metrics::init();

    // Load the on-disk template set; an unloadable directory is fatal at
    // startup, unlike reconciliation failures later on.
    let file_templates = template::load_directory(&cli.config_directory)
        .with_context(|| format!("loading templates from {}", cli.config_directory.display()))?;
    info!(
        templates = file_templates.len(),
        annotation_namespace = %cli.annotation_namespace,
        "loaded sidecar templates from disk"
    );
    for template in &file_templates {
        info!("  {}", template.summary());
    }

    let catalog = Arc::new(Catalog::with_templates(
        cli.annotation_namespace.clone(),
        file_templates.clone(),
    ));

    // Kubernetes client and ConfigMap watcher
    let client = Client::try_default()
        .await
        .context("creating Kubernetes client")?;
    let namespace = infer_namespace(&cli.configmap_namespace).await?;
    let watcher = ConfigMapWatcher::new(client, namespace, &cli.configmap_labels);

    let cancel = CancellationToken::new();
    let (signal_tx, signal_rx) = mpsc::channel(16);
    let (tick_tx, tick_rx) = mpsc::channel(16);

    // Coalescer: debounce change signals so reconciliation does not hammer
    // the API server
    tokio::spawn(coalesce(
        signal_rx,
        tick_tx,
        Duration::from_secs(cli.coalesce_window_secs),
        cancel.clone(),
    ));

    // Reconciler: each debounced tick re-lists ConfigMaps and swaps the
    // catalog
    let reconciler = {
        let watcher = watcher.clone();
        let catalog = Arc::clone(&catalog);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            watcher
                .reconcile(catalog, file_templates, tick_rx, cancel)
                .await
        })
    };

    // Watch supervisor: restarts the stream until cancelled or a fatal error
    let mut watch_task = {
        let watcher = watcher.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { watcher.run(signal_tx, cancel).await })
    };

    // Admission HTTPS server
    let state = Arc::new(WebhookState::new(Arc::clone(&catalog)));
    let tls_config = RustlsConfig::from_pem_file(&cli.tls_cert_file, &cli.tls_key_file)
        .await
        .with_context(|| {
            format!(
                "loading TLS key pair from {} / {}",
                cli.tls_cert_file.display(),
                cli.tls_key_file.display()
            )
        })?;

    let admission_addr = SocketAddr::from(([0, 0, 0, 0], cli.tls_port));
    let admission_handle = axum_server::Handle::new();
    info!(addr = %admission_addr, "launching sidecar injector admission server (https)");
    let admission_server = {
        let handle = admission_handle.clone();
        let router = admission_router(state);
        tokio::spawn(async move {
            axum_server::bind_rustls(admission_addr, tls_config)
                .handle(handle)
                .serve(router.into_make_service())
                .await
                .map_err(|err| error!(error = %err, "admission server error"))
        })
    };

    // Lifecycle HTTP server (metrics, health)
    let lifecycle_addr = SocketAddr::from(([0, 0, 0, 0], cli.lifecycle_port));
    let lifecycle_handle = axum_server::Handle::new();
    info!(addr = %lifecycle_addr, "launching lifecycle server (http)");
    let lifecycle_server = {
        let handle = lifecycle_handle.clone();
        tokio::spawn(async move {
            axum_server::bind(lifecycle_addr)
                .handle(handle)
                .serve(lifecycle_router().into_make_service())
                .await
                .map_err(|err| error!(error = %err, "lifecycle server error"))
        })
    };

    // Run until shutdown signal, or until the watch supervisor hits a fatal
    // error (authorization failures are not retried)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("got OS shutdown signal, shutting down gracefully");
        }
        result = &mut watch_task => {
            cancel.cancel();
            admission_handle.shutdown();
            lifecycle_handle.shutdown();
            match result {
                Ok(Err(err)) => return Err(err).context("configmap watcher failed"),
                Ok(Ok(())) => anyhow::bail!("configmap watcher exited unexpectedly"),
                Err(err) => return Err(err).context("configmap watcher panicked"),
            }
        }
    }

    cancel.cancel();
    // let in-flight admission responses finish before closing the listeners
    admission_handle.graceful_shutdown(Some(Duration::from_secs(10)));
    lifecycle_handle.graceful_shutdown(Some(Duration::from_secs(5)));

    let _ = watch_task.await;
    let _ = reconciler.await;
    let _ = admission_server.await;
    let _ = lifecycle_server.await;

    info!("sidecar injector shut down");
    Ok(())
}
