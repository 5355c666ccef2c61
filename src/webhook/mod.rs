//! Mutating admission webhook for sidecar injection
//!
//! Handles `AdmissionReview` requests for pods, deciding per pod whether a
//! sidecar template applies and answering with a JSON patch that merges the
//! template in. Injection failures never block a pod: every response is
//! allowed, a failed injection just carries no patch.
//!
//! Two routers are served: the TLS admission router (`/mutate`, `/health`)
//! and the plain-HTTP lifecycle router (`/metrics`, `/health`).

pub mod decide;
pub mod patch;

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use k8s_openapi::api::core::v1::Pod;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use tracing::{debug, error, info, warn};

use crate::catalog::Catalog;
use crate::metrics::{self, InjectionReason, InjectionStatus};

/// Shared state for the admission handlers
pub struct WebhookState {
    /// The live template catalog
    pub catalog: Arc<Catalog>,
    /// Namespaces in which injection never applies
    pub ignored_namespaces: Vec<String>,
}

impl WebhookState {
    /// Create webhook state over a catalog with the default ignored
    /// namespaces
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            catalog,
            ignored_namespaces: decide::DEFAULT_IGNORED_NAMESPACES
                .iter()
                .map(|ns| ns.to_string())
                .collect(),
        }
    }
}

/// Build the TLS admission router: `POST /mutate` and `GET /health`
pub fn admission_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/mutate", post(mutate_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

/// Build the plain-HTTP lifecycle router: `GET /metrics` and `GET /health`
pub fn lifecycle_router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(|| async { "ok" }))
}

/// Handle a mutating admission review for a pod.
///
/// Requires `Content-Type: application/json` (415 otherwise). A body that
/// fails to decode never rejects the pod; the response carries the decode
/// error in `result.message`.
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
    {
        Some("application/json") => {}
        other => {
            warn!(content_type = ?other, "rejecting admission request, unsupported content type");
            return (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "invalid Content-Type, expect `application/json`",
            )
                .into_response();
        }
    }

    let review: AdmissionReview<DynamicObject> = match serde_json::from_slice(&body) {
        Ok(review) => review,
        Err(err) => {
            error!(error = %err, "could not decode admission review body");
            return Json(AdmissionResponse::invalid(err.to_string()).into_review())
                .into_response();
        }
    };

    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(request) => request,
        Err(err) => {
            error!(error = %err, "admission review carries no usable request");
            return Json(AdmissionResponse::invalid(err.to_string()).into_review())
                .into_response();
        }
    };

    Json(mutate(&state, &request).into_review()).into_response()
}

/// Decide and apply injection for one admission request. Always allows the
/// pod; the outcome shows up as a patch, a `result.message`, or neither.
fn mutate(state: &WebhookState, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let response = AdmissionResponse::from(request);

    let Some(object) = request.object.as_ref() else {
        debug!(uid = %request.uid, "no pod object in request, allowing unchanged");
        return response;
    };

    let pod: Pod = match object.clone().try_parse() {
        Ok(pod) => pod,
        Err(err) => {
            error!(uid = %request.uid, error = %err, "could not decode pod from admission request");
            metrics::record_injection(
                InjectionStatus::Error,
                InjectionReason::UnmarshalError,
                "",
            );
            let mut response = response;
            response.result.message = err.to_string();
            return response;
        }
    };

    info!(
        uid = %request.uid,
        namespace = pod.metadata.namespace.as_deref().unwrap_or_default(),
        pod = pod.metadata.name.as_deref().unwrap_or_default(),
        operation = ?request.operation,
        "admission review for pod"
    );

    let key = match decide::requested_template(
        &state.catalog,
        &state.ignored_namespaces,
        &pod.metadata,
    ) {
        Ok(key) => key,
        Err(skip) => {
            debug!(uid = %request.uid, %skip, "skipping mutation");
            metrics::record_injection(InjectionStatus::Skipped, skip.reason(), skip.requested());
            return response;
        }
    };

    let template = match state.catalog.get(&key) {
        Ok(template) => template,
        Err(err) => {
            // the catalog was swapped between decision and retrieval; permit
            // the pod to launch with no sidecar injected
            warn!(uid = %request.uid, error = %err, "template disappeared, allowing unchanged");
            metrics::record_injection(
                InjectionStatus::Skipped,
                InjectionReason::MissingConfig,
                &key,
            );
            return response;
        }
    };

    let mut annotations = BTreeMap::new();
    annotations.insert(
        state.catalog.status_annotation_key(),
        decide::STATUS_INJECTED.to_string(),
    );

    let ops = patch::build_patch(&pod, &template, &annotations);
    info!(
        uid = %request.uid,
        template = %key,
        patch_ops = ops.len(),
        "applying sidecar patch"
    );

    match response.with_patch(json_patch::Patch(ops)) {
        Ok(response) => {
            metrics::record_injection(InjectionStatus::Success, InjectionReason::AllGroovy, &key);
            response
        }
        Err(err) => {
            error!(uid = %request.uid, error = %err, "failed to serialize patch");
            metrics::record_injection(
                InjectionStatus::Error,
                InjectionReason::PatchingError,
                &key,
            );
            let mut response = AdmissionResponse::from(request);
            response.result.message = err.to_string();
            response
        }
    }
}

/// Render the Prometheus registry for scraping
async fn metrics_handler() -> Response {
    match metrics::render() {
        Ok(body) => body.into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::Template;
    use serde_json::json;

    fn test_state(templates: &[&str]) -> WebhookState {
        let catalog = Catalog::with_templates(
            "injector.unittest.com",
            templates
                .iter()
                .map(|yaml| Template::from_yaml(yaml).unwrap())
                .collect(),
        );
        let mut state = WebhookState::new(Arc::new(catalog));
        state.ignored_namespaces.push("ignore-me".to_string());
        state
    }

    fn sidecar_test_yaml() -> &'static str {
        r#"
name: sidecar-test
containers:
  - name: sidecar-nginx
    image: nginx:1.12.2
  - name: sidecar-logger
    image: registry.internal/logtailer:v1.3
volumes:
  - name: nginx-conf
    configMap:
      name: nginx-configmap
env:
  - name: DATACENTER
    value: foo
  - name: LOG_FORMAT
    value: json
"#
    }

    fn admission_request(pod: serde_json::Value) -> AdmissionRequest<DynamicObject> {
        let review: AdmissionReview<DynamicObject> = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {"group": "", "version": "v1", "kind": "Pod"},
                "resource": {"group": "", "version": "v1", "resource": "pods"},
                "operation": "CREATE",
                "userInfo": {"username": "kubelet"},
                "object": pod
            }
        }))
        .unwrap();
        review.try_into().unwrap()
    }

    fn pod_requesting(namespace: &str, annotations: serde_json::Value) -> serde_json::Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "web-0",
                "namespace": namespace,
                "annotations": annotations
            },
            "spec": {
                "containers": [{"name": "app", "image": "registry.internal/app:v7"}]
            }
        })
    }

    fn decoded_patch(response: &AdmissionResponse) -> serde_json::Value {
        let patch = response.patch.as_ref().expect("expected a patch");
        serde_json::from_slice(patch).unwrap()
    }

    // =========================================================================
    // mutate
    // =========================================================================

    /// Story: a pod requesting a known sidecar is allowed with a patch
    #[test]
    fn story_requesting_pod_is_patched() {
        let state = test_state(&[sidecar_test_yaml()]);
        let request = admission_request(pod_requesting(
            "default",
            json!({"injector.unittest.com/request": "sidecar-test"}),
        ));

        let response = mutate(&state, &request);

        assert!(response.allowed);
        let patch = decoded_patch(&response);
        let ops = patch.as_array().unwrap();
        assert!(!ops.is_empty());

        // two container adds and the status annotation among them
        let container_adds = ops
            .iter()
            .filter(|op| op["path"] == "/spec/containers/-")
            .count();
        assert_eq!(container_adds, 2);
        assert!(ops.iter().any(|op| {
            op["path"] == "/metadata/annotations/injector.unittest.com~1status"
                && op["value"] == "injected"
        }));
    }

    /// Story: an already injected pod passes through untouched
    #[test]
    fn story_already_injected_pod_is_allowed_without_patch() {
        let state = test_state(&[sidecar_test_yaml()]);
        let request = admission_request(pod_requesting(
            "default",
            json!({
                "injector.unittest.com/request": "sidecar-test",
                "injector.unittest.com/status": "injected"
            }),
        ));

        let response = mutate(&state, &request);

        assert!(response.allowed);
        assert!(response.patch.is_none());
    }

    #[test]
    fn test_pod_without_request_annotation_is_allowed_without_patch() {
        let state = test_state(&[sidecar_test_yaml()]);
        let request = admission_request(pod_requesting("default", json!({})));

        let response = mutate(&state, &request);
        assert!(response.allowed);
        assert!(response.patch.is_none());
    }

    #[test]
    fn test_unknown_sidecar_is_allowed_without_patch() {
        let state = test_state(&[sidecar_test_yaml()]);
        let request = admission_request(pod_requesting(
            "default",
            json!({"injector.unittest.com/request": "no-such-sidecar"}),
        ));

        let response = mutate(&state, &request);
        assert!(response.allowed);
        assert!(response.patch.is_none());
    }

    #[test]
    fn test_ignored_namespace_is_allowed_without_patch() {
        let state = test_state(&[sidecar_test_yaml()]);
        let request = admission_request(pod_requesting(
            "ignore-me",
            json!({"injector.unittest.com/request": "sidecar-test"}),
        ));

        let response = mutate(&state, &request);
        assert!(response.allowed);
        assert!(response.patch.is_none());
    }

    /// Story: version selection derives the patch from the requested
    /// version only
    #[test]
    fn story_versioned_request_uses_versioned_template() {
        let state = test_state(&[
            "name: ic\ncontainers:\n  - name: sidecar\n    image: sidecar:latest\n",
            "name: ic:v2\ncontainers:\n  - name: sidecar\n    image: sidecar:v2\n",
        ]);
        let request = admission_request(pod_requesting(
            "default",
            json!({"injector.unittest.com/request": "ic:v2"}),
        ));

        let response = mutate(&state, &request);
        let patch = decoded_patch(&response);
        let serialized = patch.to_string();
        assert!(serialized.contains("sidecar:v2"));
        assert!(!serialized.contains("sidecar:latest"));
    }

    #[test]
    fn test_undecodable_pod_reports_message_and_allows() {
        let state = test_state(&[sidecar_test_yaml()]);
        let request = admission_request(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "web-0", "namespace": "default"},
            "spec": {"containers": "this is not a container list"}
        }));

        let response = mutate(&state, &request);
        assert!(response.allowed);
        assert!(response.patch.is_none());
        assert!(!response.result.message.is_empty());
    }

    #[test]
    fn test_response_echoes_request_uid() {
        let state = test_state(&[sidecar_test_yaml()]);
        let request = admission_request(pod_requesting(
            "default",
            json!({"injector.unittest.com/request": "sidecar-test"}),
        ));

        let response = mutate(&state, &request);
        let review = response.into_review();
        assert_eq!(
            review.response.unwrap().uid,
            "705ab4f5-6393-11e8-b7cc-42010a800002"
        );
    }

    // =========================================================================
    // HTTP handler
    // =========================================================================

    fn json_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        headers
    }

    #[tokio::test]
    async fn test_handler_rejects_wrong_content_type() {
        let state = Arc::new(test_state(&[sidecar_test_yaml()]));
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "text/plain".parse().unwrap());

        let response =
            mutate_handler(State(state), headers, Bytes::from_static(b"{}")).await;
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn test_handler_rejects_missing_content_type() {
        let state = Arc::new(test_state(&[sidecar_test_yaml()]));

        let response =
            mutate_handler(State(state), HeaderMap::new(), Bytes::from_static(b"{}")).await;
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn test_handler_undecodable_body_answers_with_review() {
        let state = Arc::new(test_state(&[sidecar_test_yaml()]));

        let response = mutate_handler(
            State(state),
            json_headers(),
            Bytes::from_static(b"not json at all"),
        )
        .await;
        // decode failures answer 200 with a review carrying the error
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_handler_mutates_valid_review() {
        let state = Arc::new(test_state(&[sidecar_test_yaml()]));
        let review = json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {"group": "", "version": "v1", "kind": "Pod"},
                "resource": {"group": "", "version": "v1", "resource": "pods"},
                "operation": "CREATE",
                "userInfo": {"username": "kubelet"},
                "object": pod_requesting(
                    "default",
                    json!({"injector.unittest.com/request": "sidecar-test"})
                )
            }
        });

        let response = mutate_handler(
            State(state),
            json_headers(),
            Bytes::from(serde_json::to_vec(&review).unwrap()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
