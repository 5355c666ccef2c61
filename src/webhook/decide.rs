//! Injection decision for admitted pods
//!
//! From a pod's metadata alone, decide whether injection applies and which
//! template key to use. Skips are ordinary control flow, not failures: the
//! pod is always allowed, the outcome only shows up in the response patch
//! (or its absence) and the metrics.

use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::metrics::InjectionReason;

/// Value of the status annotation marking a pod as already injected
pub const STATUS_INJECTED: &str = "injected";

/// Namespaces never injected into, regardless of annotations
pub const DEFAULT_IGNORED_NAMESPACES: [&str; 2] = ["kube-system", "kube-public"];

/// Why injection did not apply to a pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Skip {
    /// The pod lives in a namespace on the ignore list
    IgnoredNamespace,
    /// The pod's status annotation says injection already happened
    AlreadyInjected,
    /// The pod does not carry a request annotation
    MissingRequestAnnotation,
    /// The requested sidecar is not in the catalog
    SidecarNotFound {
        /// The raw requested key, kept for the metrics label
        requested: String,
    },
}

impl Skip {
    /// The metrics reason label for this skip
    pub fn reason(&self) -> InjectionReason {
        match self {
            Self::IgnoredNamespace => InjectionReason::IgnoredNamespace,
            Self::AlreadyInjected => InjectionReason::AlreadyInjected,
            Self::MissingRequestAnnotation => InjectionReason::NoAnnotation,
            Self::SidecarNotFound { .. } => InjectionReason::MissingConfig,
        }
    }

    /// The requested template key, when one was named
    pub fn requested(&self) -> &str {
        match self {
            Self::SidecarNotFound { requested } => requested,
            _ => "",
        }
    }
}

impl fmt::Display for Skip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IgnoredNamespace => write!(f, "pod is in an ignored namespace"),
            Self::AlreadyInjected => write!(f, "pod has already been injected"),
            Self::MissingRequestAnnotation => write!(f, "missing injection request annotation"),
            Self::SidecarNotFound { requested } => {
                write!(f, "requested sidecar {requested:?} not found in configuration")
            }
        }
    }
}

/// Determine whether injection applies to a pod and which template to use.
///
/// Short-circuits in order: ignored namespace, already injected, no request
/// annotation, requested template unknown. On success returns the canonical
/// full-name of the matched template.
///
/// The annotation namespace is read from the catalog here, at decision time,
/// so configuration reloads take effect without a restart.
pub fn requested_template(
    catalog: &Catalog,
    ignored_namespaces: &[String],
    metadata: &ObjectMeta,
) -> Result<String, Skip> {
    let namespace = metadata.namespace.as_deref().unwrap_or_default();
    let name = metadata.name.as_deref().unwrap_or_default();

    if ignored_namespaces.iter().any(|ns| ns == namespace) {
        info!(namespace, pod = name, "skipping injection, namespace is ignored");
        return Err(Skip::IgnoredNamespace);
    }

    let empty = Default::default();
    let annotations = metadata.annotations.as_ref().unwrap_or(&empty);

    let status_key = catalog.status_annotation_key();
    if let Some(status) = annotations.get(&status_key) {
        if status.to_lowercase() == STATUS_INJECTED {
            info!(
                namespace,
                pod = name,
                status = %status,
                "skipping injection, already satisfied"
            );
            return Err(Skip::AlreadyInjected);
        }
    }

    let request_key = catalog.request_annotation_key();
    let Some(requested) = annotations.get(&request_key) else {
        debug!(namespace, pod = name, annotation = %request_key, "no injection requested");
        return Err(Skip::MissingRequestAnnotation);
    };

    match catalog.get(requested) {
        Ok(template) => {
            let full_name = template.full_name();
            info!(
                namespace,
                pod = name,
                requested = %requested,
                template = %full_name,
                "pod requests sidecar injection"
            );
            Ok(full_name)
        }
        Err(_) => {
            info!(
                namespace,
                pod = name,
                requested = %requested,
                "requested sidecar not in configuration, skipping"
            );
            Err(Skip::SidecarNotFound {
                requested: requested.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::Template;
    use std::collections::BTreeMap;

    fn catalog() -> Catalog {
        Catalog::with_templates(
            "injector.unittest.com",
            vec![
                Template::from_yaml("name: sidecar-test").unwrap(),
                Template::from_yaml("name: init-containers:v2").unwrap(),
            ],
        )
    }

    fn metadata(namespace: &str, annotations: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            name: Some("test-pod".to_string()),
            namespace: Some(namespace.to_string()),
            annotations: if annotations.is_empty() {
                None
            } else {
                Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                )
            },
            ..Default::default()
        }
    }

    fn ignored() -> Vec<String> {
        vec!["kube-system".to_string(), "ignore-me".to_string()]
    }

    #[test]
    fn test_ignored_namespace_short_circuits() {
        // even an explicit request is ignored in an ignored namespace
        let meta = metadata(
            "ignore-me",
            &[("injector.unittest.com/request", "sidecar-test")],
        );
        let err = requested_template(&catalog(), &ignored(), &meta).unwrap_err();
        assert_eq!(err, Skip::IgnoredNamespace);
        assert_eq!(err.requested(), "");
    }

    /// Story: a pod that was already injected is never injected twice
    #[test]
    fn story_already_injected_pod_is_skipped() {
        let meta = metadata(
            "default",
            &[
                ("injector.unittest.com/request", "sidecar-test"),
                ("injector.unittest.com/status", "injected"),
            ],
        );
        let err = requested_template(&catalog(), &ignored(), &meta).unwrap_err();
        assert_eq!(err, Skip::AlreadyInjected);
    }

    #[test]
    fn test_status_value_is_case_insensitive() {
        let meta = metadata(
            "default",
            &[
                ("injector.unittest.com/request", "sidecar-test"),
                ("injector.unittest.com/status", "InJeCtEd"),
            ],
        );
        let err = requested_template(&catalog(), &ignored(), &meta).unwrap_err();
        assert_eq!(err, Skip::AlreadyInjected);
    }

    #[test]
    fn test_non_injected_status_does_not_skip() {
        let meta = metadata(
            "default",
            &[
                ("injector.unittest.com/request", "sidecar-test"),
                ("injector.unittest.com/status", "pending"),
            ],
        );
        assert_eq!(
            requested_template(&catalog(), &ignored(), &meta).unwrap(),
            "sidecar-test:latest"
        );
    }

    #[test]
    fn test_missing_request_annotation() {
        let meta = metadata("default", &[]);
        let err = requested_template(&catalog(), &ignored(), &meta).unwrap_err();
        assert_eq!(err, Skip::MissingRequestAnnotation);
    }

    #[test]
    fn test_unknown_sidecar_carries_requested_key() {
        let meta = metadata(
            "default",
            &[("injector.unittest.com/request", "no-such-sidecar")],
        );
        let err = requested_template(&catalog(), &ignored(), &meta).unwrap_err();
        assert_eq!(
            err,
            Skip::SidecarNotFound {
                requested: "no-such-sidecar".to_string()
            }
        );
        assert_eq!(err.requested(), "no-such-sidecar");
    }

    #[test]
    fn test_badly_formatted_request_is_not_found() {
        let meta = metadata(
            "default",
            &[("injector.unittest.com/request", "a:b:c")],
        );
        let err = requested_template(&catalog(), &ignored(), &meta).unwrap_err();
        assert!(matches!(err, Skip::SidecarNotFound { .. }));
    }

    /// Story: version selection picks exactly the requested template
    #[test]
    fn story_versioned_request_selects_versioned_template() {
        let meta = metadata(
            "default",
            &[("injector.unittest.com/request", "init-containers:v2")],
        );
        assert_eq!(
            requested_template(&catalog(), &ignored(), &meta).unwrap(),
            "init-containers:v2"
        );

        // bare name resolves to :latest, which is a different template here
        let meta = metadata(
            "default",
            &[("injector.unittest.com/request", "init-containers")],
        );
        let err = requested_template(&catalog(), &ignored(), &meta).unwrap_err();
        assert!(matches!(err, Skip::SidecarNotFound { .. }));
    }

    #[test]
    fn test_returned_key_is_canonical() {
        let meta = metadata(
            "default",
            &[("injector.unittest.com/request", "Sidecar-Test:LATEST")],
        );
        assert_eq!(
            requested_template(&catalog(), &ignored(), &meta).unwrap(),
            "sidecar-test:latest"
        );
    }

    #[test]
    fn test_skip_reasons_map_to_metric_labels() {
        assert_eq!(Skip::IgnoredNamespace.reason().as_str(), "ignored_namespace");
        assert_eq!(Skip::AlreadyInjected.reason().as_str(), "already_injected");
        assert_eq!(
            Skip::MissingRequestAnnotation.reason().as_str(),
            "no_annotation"
        );
        assert_eq!(
            Skip::SidecarNotFound {
                requested: "x".to_string()
            }
            .reason()
            .as_str(),
            "missing_config"
        );
    }
}
