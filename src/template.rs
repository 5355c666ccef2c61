//! Sidecar template model, parsing, merge and inheritance
//!
//! A template is a named, versioned set of containers, volumes, environment
//! variables and pod-level settings that the webhook merges into admitted
//! pods. Templates are authored as YAML, either as files in the config
//! directory or as entries in watched ConfigMaps. File-loaded templates may
//! reference a parent with `inherits`, in which case the child is merged over
//! the recursively resolved parent.

use std::fs;
use std::path::{Path, PathBuf};

use k8s_openapi::api::core::v1::{Container, EnvVar, HostAlias, Volume, VolumeMount};
use serde::Deserialize;
use tracing::debug;

use crate::{Error, Result};

/// Version assumed when a template name carries no `:version` suffix
pub const DEFAULT_VERSION: &str = "latest";

/// Maximum depth of an `inherits` chain before loading fails
pub const MAX_INHERITANCE_DEPTH: usize = 16;

/// A single sidecar template, immutable once loaded
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    /// Template name; may carry a `:version` suffix in the raw YAML, split
    /// apart during parsing. Absence is a load error.
    #[serde(default)]
    pub name: String,

    /// Parsed version component; empty means [`DEFAULT_VERSION`]
    #[serde(skip)]
    version: String,

    /// Relative path to a parent template this one is merged over; only
    /// meaningful for file-loaded templates
    #[serde(default)]
    pub inherits: Option<String>,

    /// Containers appended to the pod's `containers`
    #[serde(default)]
    pub containers: Vec<Container>,

    /// Containers appended to the pod's `initContainers`
    #[serde(default)]
    pub init_containers: Vec<Container>,

    /// Volumes added to the pod spec
    #[serde(default)]
    pub volumes: Vec<Volume>,

    /// Volume mounts injected into every container that lacks them by name
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,

    /// Environment variables injected into every container that lacks them
    /// by name
    #[serde(default, rename = "env")]
    pub environment: Vec<EnvVar>,

    /// Host aliases appended to the pod spec; unkeyed, duplicates allowed
    #[serde(default)]
    pub host_aliases: Vec<HostAlias>,

    /// Service account to run the pod as, when the pod does not name its own
    #[serde(default)]
    pub service_account_name: Option<String>,

    /// Whether the pod should be switched onto the host network
    #[serde(default)]
    pub host_network: bool,

    /// Whether the pod should share the host PID namespace
    #[serde(default, rename = "hostPID")]
    pub host_pid: bool,
}

impl Template {
    /// Parse one template from YAML text.
    ///
    /// The raw `name` field may carry a `name[:version]` suffix which is
    /// split apart here; a missing name or a name with more than one `:`
    /// is a load error.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let mut template: Template = serde_yaml::from_str(data)?;
        if template.name.is_empty() {
            return Err(Error::MissingName);
        }

        let (name, version) = split_name_version(&template.name)?;
        template.name = name;
        template.version = version;

        Ok(template)
    }

    /// The parsed version of this template, or [`DEFAULT_VERSION`] if the
    /// name carried no `:version` suffix
    pub fn version(&self) -> &str {
        if self.version.is_empty() {
            DEFAULT_VERSION
        } else {
            &self.version
        }
    }

    /// The canonical full identifier of this template, `lower(name:version)`.
    /// This is the sole key under which the catalog stores templates.
    pub fn full_name(&self) -> String {
        canonicalize(&self.name, self.version())
    }

    /// One-line summary of the template's contents for startup logging
    pub fn summary(&self) -> String {
        format!(
            "{}: {} containers, {} init containers, {} volumes, {} environment vars, {} volume mounts, {} host aliases",
            self.full_name(),
            self.containers.len(),
            self.init_containers.len(),
            self.volumes.len(),
            self.environment.len(),
            self.volume_mounts.len(),
            self.host_aliases.len(),
        )
    }

    /// Merge `child` over `base`, producing the resolved template.
    ///
    /// Identity fields and the host flags are taken from the child
    /// wholesale. Name-keyed sequences replace base entries in place and
    /// append new ones, preserving base ordering. Host aliases concatenate.
    /// The child's service account wins only when non-empty.
    pub fn merge(base: &Template, child: &Template) -> Template {
        Template {
            name: child.name.clone(),
            version: child.version.clone(),
            inherits: child.inherits.clone(),
            containers: merge_named(&base.containers, &child.containers, |c| c.name.as_str()),
            init_containers: merge_named(&base.init_containers, &child.init_containers, |c| {
                c.name.as_str()
            }),
            volumes: merge_named(&base.volumes, &child.volumes, |v| v.name.as_str()),
            volume_mounts: merge_named(&base.volume_mounts, &child.volume_mounts, |m| {
                m.name.as_str()
            }),
            environment: merge_named(&base.environment, &child.environment, |e| e.name.as_str()),
            host_aliases: base
                .host_aliases
                .iter()
                .chain(child.host_aliases.iter())
                .cloned()
                .collect(),
            service_account_name: child
                .service_account_name
                .clone()
                .filter(|sa| !sa.is_empty())
                .or_else(|| base.service_account_name.clone()),
            host_network: child.host_network,
            host_pid: child.host_pid,
        }
    }

    #[cfg(test)]
    fn named(name: &str, version: &str) -> Self {
        Template {
            name: name.to_string(),
            version: version.to_string(),
            ..Template::default()
        }
    }
}

/// Normalize a lookup key into canonical `lower(name:version)` form.
///
/// Accepts both bare `name` (implicitly [`DEFAULT_VERSION`]) and
/// `name:version`.
pub fn canonical_key(key: &str) -> Result<String> {
    let (name, version) = split_name_version(key)?;
    if version.is_empty() {
        Ok(canonicalize(&name, DEFAULT_VERSION))
    } else {
        Ok(canonicalize(&name, &version))
    }
}

/// Split a raw `name[:version]` into its components. The version is empty
/// when unspecified; two or more `:` separators is an error.
fn split_name_version(raw: &str) -> Result<(String, String)> {
    let mut parts = raw.split(':');
    let name = parts.next().unwrap_or_default();
    let version = parts.next();
    if parts.next().is_some() {
        return Err(Error::unsupported_name_version(raw));
    }

    Ok((name.to_string(), version.unwrap_or_default().to_string()))
}

fn canonicalize(name: &str, version: &str) -> String {
    format!("{name}:{version}").to_lowercase()
}

/// For each child entry: replace the same-named base entry in place, or
/// append. Base ordering is preserved.
fn merge_named<T: Clone>(base: &[T], child: &[T], name_of: impl Fn(&T) -> &str) -> Vec<T> {
    let mut merged = base.to_vec();
    for entry in child {
        match merged.iter().position(|e| name_of(e) == name_of(entry)) {
            Some(i) => merged[i] = entry.clone(),
            None => merged.push(entry.clone()),
        }
    }
    merged
}

/// Load a template from a file, resolving its `inherits` chain.
///
/// The parent path is a plain join of the current file's directory and the
/// `inherits` value; a reference outside the config directory surfaces as a
/// file-not-found load failure.
pub fn load_file(path: &Path) -> Result<Template> {
    load_file_at_depth(path, 0)
}

fn load_file_at_depth(path: &Path, depth: usize) -> Result<Template> {
    if depth > MAX_INHERITANCE_DEPTH {
        return Err(Error::inheritance_too_deep(
            path.display().to_string(),
            MAX_INHERITANCE_DEPTH,
        ));
    }

    debug!(path = %path.display(), "loading sidecar template");
    let data =
        fs::read_to_string(path).map_err(|err| Error::io(path.display().to_string(), err))?;
    let template = Template::from_yaml(&data)?;

    if let Some(parent) = template.inherits.as_deref().filter(|p| !p.is_empty()) {
        let parent_path = match path.parent() {
            Some(dir) => dir.join(parent),
            None => PathBuf::from(parent),
        };
        debug!(
            path = %path.display(),
            parent = %parent_path.display(),
            "resolving template inheritance"
        );
        let base = load_file_at_depth(&parent_path, depth + 1)?;
        return Ok(Template::merge(&base, &template));
    }

    Ok(template)
}

/// Load every `*.yaml` file in a directory. Zero templates is an error;
/// a failure to load any single file fails the whole scan.
pub fn load_directory(dir: &Path) -> Result<Vec<Template>> {
    let entries =
        fs::read_dir(dir).map_err(|err| Error::io(dir.display().to_string(), err))?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "yaml"))
        .collect();
    paths.sort();

    let mut templates = Vec::with_capacity(paths.len());
    for path in &paths {
        templates.push(load_file(path)?);
    }

    if templates.is_empty() {
        return Err(Error::NoConfigurationLoaded(dir.display().to_string()));
    }

    Ok(templates)
}
