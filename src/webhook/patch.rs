//! JSON patch generation for sidecar injection
//!
//! Computes the ordered patch document that merges a resolved template into
//! an admitted pod. The patch is additive: nothing already on the pod is
//! replaced except the service account name (when the pod has none or runs
//! as `default`), the two host flags (only when the template turns them on)
//! and the injection status annotation.
//!
//! Operation ordering matters to the consumer, which applies ops in
//! sequence: `remove` operations address mounts by index, so they are
//! emitted before any `add` that could shift indices. Within an array, the
//! first `add` into an empty target carries a whole single-element array at
//! the base path; subsequent adds append with `/-`, which the consumer only
//! accepts once the array exists.

use std::collections::BTreeMap;

use json_patch::{AddOperation, PatchOperation, RemoveOperation, ReplaceOperation};
use jsonptr::PointerBuf;
use k8s_openapi::api::core::v1::{Container, EnvVar, Pod, PodSpec, Volume, VolumeMount};
use serde::Serialize;
use tracing::warn;

use crate::template::Template;

/// Mount path of the automatically injected default service account token
pub const SERVICE_ACCOUNT_TOKEN_MOUNT_PATH: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount";

const DEFAULT_SERVICE_ACCOUNT: &str = "default";

/// Build the ordered patch merging `template` into `pod`. `annotations` is
/// the set of annotations to insert or update, normally just the status
/// annotation.
pub fn build_patch(
    pod: &Pod,
    template: &Template,
    annotations: &BTreeMap<String, String>,
) -> Vec<PatchOperation> {
    let empty_spec = PodSpec::default();
    let spec = pod.spec.as_ref().unwrap_or(&empty_spec);
    let containers = spec.containers.as_slice();
    let init_containers = spec.init_containers.as_deref().unwrap_or_default();
    let volumes = spec.volumes.as_deref().unwrap_or_default();
    let host_aliases = spec.host_aliases.as_deref().unwrap_or_default();

    let mut ops = Vec::new();

    // Service account adoption. The index-addressed removals of the default
    // token mounts are emitted before any additions can shift indices.
    if let Some(service_account) = template
        .service_account_name
        .as_deref()
        .filter(|sa| !sa.is_empty())
    {
        let current = spec.service_account_name.as_deref().unwrap_or_default();
        if current.is_empty() || current == DEFAULT_SERVICE_ACCOUNT {
            ops.push(replace_op(&["spec", "serviceAccountName"], service_account));
            ops.extend(remove_token_mounts(init_containers, "initContainers"));
            ops.extend(remove_token_mounts(containers, "containers"));
        }
    }

    // Init containers: inject env and mounts into the existing ones, then
    // append the template's own init containers with the env/mount set
    // pre-merged.
    ops.extend(add_env(init_containers, "initContainers", &template.environment));
    ops.extend(add_volume_mounts(
        init_containers,
        "initContainers",
        &template.volume_mounts,
    ));
    let injected_init = inject_env_and_mounts(template, &template.init_containers);
    ops.extend(add_containers(init_containers, "initContainers", &injected_init));

    // Containers: identical algorithm over /spec/containers.
    ops.extend(add_env(containers, "containers", &template.environment));
    ops.extend(add_volume_mounts(containers, "containers", &template.volume_mounts));
    let injected = inject_env_and_mounts(template, &template.containers);
    ops.extend(add_containers(containers, "containers", &injected));

    // Pod level: host aliases are unkeyed and always appended, volumes are
    // keyed by name and never duplicated.
    ops.extend(append_items(
        &["spec", "hostAliases"],
        host_aliases.is_empty(),
        &template.host_aliases.iter().collect::<Vec<_>>(),
    ));
    let fresh_volumes: Vec<&Volume> = template
        .volumes
        .iter()
        .filter(|volume| !volumes.iter().any(|v| v.name == volume.name))
        .collect();
    ops.extend(append_items(&["spec", "volumes"], volumes.is_empty(), &fresh_volumes));

    // Host flags are only ever switched on; false emits nothing.
    if template.host_network {
        ops.push(replace_op(&["spec", "hostNetwork"], true));
    }
    if template.host_pid {
        ops.push(replace_op(&["spec", "hostPID"], true));
    }

    ops.extend(update_annotations(pod.metadata.annotations.as_ref(), annotations));

    ops
}

fn pointer(tokens: &[&str]) -> PointerBuf {
    PointerBuf::from_tokens(tokens.iter().copied())
}

fn replace_op<T: Serialize>(tokens: &[&str], value: T) -> PatchOperation {
    PatchOperation::Replace(ReplaceOperation {
        path: pointer(tokens),
        value: serde_json::to_value(value).unwrap_or_default(),
    })
}

/// Emit `add` ops for `items` into the array at `base_tokens`. The first add
/// into an empty target initializes the array with a single element; all
/// later adds append with `/-`.
fn append_items<T: Serialize>(
    base_tokens: &[&str],
    target_empty: bool,
    items: &[&T],
) -> Vec<PatchOperation> {
    let mut ops = Vec::new();
    let mut first = target_empty;
    for item in items {
        if first {
            first = false;
            ops.push(PatchOperation::Add(AddOperation {
                path: pointer(base_tokens),
                value: serde_json::to_value(std::slice::from_ref(*item)).unwrap_or_default(),
            }));
        } else {
            let mut tokens = base_tokens.to_vec();
            tokens.push("-");
            ops.push(PatchOperation::Add(AddOperation {
                path: pointer(&tokens),
                value: serde_json::to_value(item).unwrap_or_default(),
            }));
        }
    }
    ops
}

/// For every existing container, add each injected env var it does not
/// already define by name.
fn add_env(containers: &[Container], field: &str, added: &[EnvVar]) -> Vec<PatchOperation> {
    let mut ops = Vec::new();
    for (index, container) in containers.iter().enumerate() {
        let existing = container.env.as_deref().unwrap_or_default();
        let fresh: Vec<&EnvVar> = added
            .iter()
            .filter(|var| !existing.iter().any(|env| env.name == var.name))
            .collect();
        let index_token = index.to_string();
        ops.extend(append_items(
            &["spec", field, index_token.as_str(), "env"],
            existing.is_empty(),
            &fresh,
        ));
    }
    ops
}

/// For every existing container, add each injected volume mount it does not
/// already carry by name.
fn add_volume_mounts(
    containers: &[Container],
    field: &str,
    added: &[VolumeMount],
) -> Vec<PatchOperation> {
    let mut ops = Vec::new();
    for (index, container) in containers.iter().enumerate() {
        let existing = container.volume_mounts.as_deref().unwrap_or_default();
        let fresh: Vec<&VolumeMount> = added
            .iter()
            .filter(|mount| !existing.iter().any(|m| m.name == mount.name))
            .collect();
        let index_token = index.to_string();
        ops.extend(append_items(
            &["spec", field, index_token.as_str(), "volumeMounts"],
            existing.is_empty(),
            &fresh,
        ));
    }
    ops
}

/// Append template containers that do not collide by name with an existing
/// container.
fn add_containers(
    existing: &[Container],
    field: &str,
    added: &[Container],
) -> Vec<PatchOperation> {
    let fresh: Vec<&Container> = added
        .iter()
        .filter(|container| !existing.iter().any(|c| c.name == container.name))
        .collect();
    append_items(&["spec", field], existing.is_empty(), &fresh)
}

/// Pre-merge the template's env vars and volume mounts into its own
/// containers, skipping names each container already defines. These
/// containers do not exist on the pod yet, so the merge happens on the
/// value rather than through patch ops.
fn inject_env_and_mounts(template: &Template, containers: &[Container]) -> Vec<Container> {
    containers
        .iter()
        .cloned()
        .map(|mut container| {
            if !template.environment.is_empty() {
                let env = container.env.get_or_insert_with(Vec::new);
                for var in &template.environment {
                    if !env.iter().any(|e| e.name == var.name) {
                        env.push(var.clone());
                    }
                }
            }
            if !template.volume_mounts.is_empty() {
                let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
                for mount in &template.volume_mounts {
                    if !mounts.iter().any(|m| m.name == mount.name) {
                        mounts.push(mount.clone());
                    }
                }
            }
            container
        })
        .collect()
}

/// Remove every volume mount of the default service account token.
///
/// Removals are addressed by index and applied sequentially by the
/// consumer, so within each container they are emitted highest index
/// first; a removal then never shifts the index of one still to come.
fn remove_token_mounts(containers: &[Container], field: &str) -> Vec<PatchOperation> {
    let mut ops = Vec::new();
    for (container_index, container) in containers.iter().enumerate() {
        let mounts = container.volume_mounts.as_deref().unwrap_or_default();
        for (mount_index, mount) in mounts.iter().enumerate().rev() {
            if mount.mount_path == SERVICE_ACCOUNT_TOKEN_MOUNT_PATH {
                let ci = container_index.to_string();
                let mi = mount_index.to_string();
                ops.push(PatchOperation::Remove(RemoveOperation {
                    path: pointer(&["spec", field, ci.as_str(), "volumeMounts", mi.as_str()]),
                }));
            }
        }
    }
    ops
}

/// Insert or update annotations. Keys are rewritten with `/` -> `~1` only,
/// the same replacement the consumer understands; a literal `~` in a key
/// has no representation under this scheme and the annotation is dropped.
fn update_annotations(
    existing: Option<&BTreeMap<String, String>>,
    added: &BTreeMap<String, String>,
) -> Vec<PatchOperation> {
    let mut ops = Vec::new();
    for (key, value) in added {
        let escaped = key.replace('/', "~1");
        let path = match PointerBuf::parse(&format!("/metadata/annotations/{escaped}")) {
            Ok(path) => path,
            Err(err) => {
                warn!(key = %key, error = %err, "annotation key is not expressible, dropping");
                continue;
            }
        };
        let value = serde_json::Value::String(value.clone());
        if existing.and_then(|annotations| annotations.get(key)).is_some() {
            ops.push(PatchOperation::Replace(ReplaceOperation { path, value }));
        } else {
            ops.push(PatchOperation::Add(AddOperation { path, value }));
        }
    }
    ops
}
