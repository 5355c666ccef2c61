//! ConfigMap watching, supervision and catalog reconciliation
//!
//! The watcher subscribes to labeled ConfigMaps in one namespace and emits a
//! signal whenever any of them changes. Signals are debounced by the
//! [`coalescer`](crate::coalescer); each resulting tick re-lists all matching
//! ConfigMaps, parses every entry into a template, unions the result with the
//! on-disk template set and atomically replaces the catalog.
//!
//! The watch stream is wrapped in a supervisor: channel closure and transient
//! stream errors restart it with capped exponential backoff, while
//! authorization failures are fatal since no retry will fix the service
//! account.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ListParams;
use kube::runtime::watcher::{self, Event};
use kube::runtime::watcher as watcher_fn;
use kube::{Api, Client, ResourceExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::catalog::Catalog;
use crate::template::Template;
use crate::{Error, Result};

/// Well-known file holding the namespace of the pod's own service account,
/// used to infer the ConfigMap search namespace when none is configured
pub const SERVICE_ACCOUNT_NAMESPACE_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// A watch that lived this long resets the restart backoff
const HEALTHY_WATCH_RESET: Duration = Duration::from_secs(60);

/// Watches labeled ConfigMaps and turns them into sidecar templates
#[derive(Clone)]
pub struct ConfigMapWatcher {
    client: Client,
    namespace: String,
    selector: String,
}

impl ConfigMapWatcher {
    /// Create a watcher over ConfigMaps in `namespace` matching `labels`
    pub fn new(client: Client, namespace: String, labels: &BTreeMap<String, String>) -> Self {
        Self {
            client,
            namespace,
            selector: label_selector(labels),
        }
    }

    fn api(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Consume the watch stream, emitting one signal per change event.
    ///
    /// Returns `Ok(())` on cancellation, [`Error::WatchChannelClosed`] when
    /// the stream ends, and a typed stream error otherwise.
    pub async fn watch(
        &self,
        notify: &mpsc::Sender<()>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        debug!(
            namespace = %self.namespace,
            selector = %self.selector,
            "watching ConfigMaps for sidecar templates"
        );

        let mut config = watcher::Config::default();
        if !self.selector.is_empty() {
            config = config.labels(&self.selector);
        }
        let stream = watcher_fn(self.api(), config);
        tokio::pin!(stream);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("stopping ConfigMap watch, cancellation requested");
                    return Ok(());
                }
                event = stream.next() => match event {
                    Some(Ok(event)) => {
                        if signal_for_event(&event) && notify.send(()).await.is_err() {
                            // downstream is gone, we are shutting down
                            return Ok(());
                        }
                    }
                    Some(Err(err)) => return Err(classify_stream_error(err)),
                    None => return Err(Error::WatchChannelClosed),
                }
            }
        }
    }

    /// Supervise the watch stream: restart on closure and transient errors
    /// with capped exponential backoff, bail out on authorization failures.
    pub async fn run(&self, notify: mpsc::Sender<()>, cancel: CancellationToken) -> Result<()> {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let started = Instant::now();
            let result = self.watch(&notify, &cancel).await;
            if cancel.is_cancelled() {
                return Ok(());
            }

            match result {
                Ok(()) => return Ok(()),
                Err(Error::WatchChannelClosed) => {
                    warn!("watch channel closed, restarting watch");
                }
                Err(err) if err.is_fatal_watch_error() => {
                    error!(error = %err, "fatal watch error, not restarting");
                    return Err(err);
                }
                Err(err) => {
                    warn!(error = %err, backoff = ?backoff, "watch stream failed, restarting");
                }
            }

            if started.elapsed() >= HEALTHY_WATCH_RESET {
                backoff = INITIAL_BACKOFF;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// List all matching ConfigMaps and parse every entry into a template.
    /// A parse failure in any entry fails the whole listing; templates are
    /// never partially applied.
    pub async fn list(&self) -> Result<Vec<Template>> {
        let mut params = ListParams::default();
        if !self.selector.is_empty() {
            params = params.labels(&self.selector);
        }

        let config_maps = self.api().list(&params).await?;
        debug!(config_maps = config_maps.items.len(), "fetched ConfigMaps");

        let mut templates = Vec::new();
        for cm in &config_maps.items {
            templates.extend(templates_from_config_map(cm)?);
        }
        Ok(templates)
    }

    /// Consume debounced reconciliation ticks until cancellation. Each tick
    /// unions the on-disk templates with the freshly listed ConfigMap
    /// templates and replaces the catalog; a failed tick keeps the previous
    /// catalog active.
    pub async fn reconcile(
        &self,
        catalog: Arc<Catalog>,
        file_templates: Vec<Template>,
        mut ticks: mpsc::Receiver<()>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("reconciler terminated, cancellation requested");
                    return;
                }
                tick = ticks.recv() => match tick {
                    Some(()) => self.reconcile_once(&catalog, &file_templates).await,
                    None => {
                        debug!("reconciler terminated, tick channel closed");
                        return;
                    }
                }
            }
        }
    }

    async fn reconcile_once(&self, catalog: &Catalog, file_templates: &[Template]) {
        match self.list().await {
            Ok(watched) => {
                let from_api = watched.len();
                // on-disk templates first so ConfigMap entries win on key collision
                let mut all = file_templates.to_vec();
                all.extend(watched);
                catalog.replace_all(all);
                info!(
                    from_disk = file_templates.len(),
                    from_api,
                    total = catalog.len(),
                    "replaced template catalog"
                );
            }
            Err(err) => {
                warn!(error = %err, "reconciliation failed, keeping previous catalog");
            }
        }
    }
}

/// Resolve the namespace to watch: the configured value if non-empty,
/// otherwise the pod's own namespace read from the service account mount.
/// A missing file outside a cluster is a startup error with a pointer to
/// the flag to set.
pub async fn infer_namespace(configured: &str) -> Result<String> {
    if !configured.is_empty() {
        return Ok(configured.to_string());
    }

    let contents = tokio::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE_FILE)
        .await
        .map_err(|err| {
            Error::io(
                format!(
                    "{SERVICE_ACCOUNT_NAMESPACE_FILE} (specify --configmap-namespace when \
                     running outside of kubernetes)"
                ),
                err,
            )
        })?;
    let namespace = contents.trim().to_string();
    info!(namespace = %namespace, "inferred ConfigMap search namespace from service account");
    Ok(namespace)
}

/// Parse every entry of a ConfigMap's data map as one template. All-or-nothing:
/// one bad entry fails the whole ConfigMap.
pub fn templates_from_config_map(cm: &ConfigMap) -> Result<Vec<Template>> {
    let name = cm.name_any();
    let mut templates = Vec::new();
    if let Some(data) = &cm.data {
        for (key, payload) in data {
            let template = Template::from_yaml(payload)
                .map_err(|err| Error::config_map_entry(&name, key, err))?;
            debug!(
                config_map = %name,
                entry = %key,
                template = %template.full_name(),
                "loaded template from ConfigMap"
            );
            templates.push(template);
        }
    }
    Ok(templates)
}

/// Format a label map as an equality-join selector, `k1=v1,k2=v2`
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn signal_for_event(event: &Event<ConfigMap>) -> bool {
    match event {
        Event::Apply(cm) | Event::Delete(cm) => {
            debug!(config_map = %cm.name_any(), "ConfigMap change event");
            true
        }
        // one signal once the initial list has been replayed in full
        Event::InitDone => {
            debug!("initial ConfigMap list complete");
            true
        }
        Event::Init | Event::InitApply(_) => false,
    }
}

fn classify_stream_error(err: watcher::Error) -> Error {
    match &err {
        watcher::Error::WatchError(response) if is_auth_code(response.code) => {
            Error::Unauthorized(response.message.clone())
        }
        watcher::Error::InitialListFailed(kube::Error::Api(response))
        | watcher::Error::WatchStartFailed(kube::Error::Api(response))
        | watcher::Error::WatchFailed(kube::Error::Api(response))
            if is_auth_code(response.code) =>
        {
            Error::Unauthorized(response.message.clone())
        }
        _ => Error::Watch(err.to_string()),
    }
}

fn is_auth_code(code: u16) -> bool {
    code == 401 || code == 403
}
