//! Catalog of resolved sidecar templates
//!
//! The catalog maps canonical full-names (`lower(name:version)`) to resolved
//! templates. It is the sole shared mutable resource in the process: admission
//! requests read from it concurrently while the reconciler atomically replaces
//! the whole mapping. Readers dereference an immutable snapshot behind a
//! single pointer, so a swap in progress is never observed partially.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::template::{self, Template};
use crate::{Error, Result};

/// Default DNS-style prefix under which the `status` and `request`
/// annotations live
pub const DEFAULT_ANNOTATION_NAMESPACE: &str = "injector.tumblr.com";

/// An immutable catalog generation; replaced wholesale, never mutated
#[derive(Debug, Default)]
struct Snapshot {
    annotation_namespace: String,
    templates: HashMap<String, Arc<Template>>,
}

/// Read-mostly mapping from canonical full-name to resolved template.
///
/// Reads clone the current snapshot pointer under a shared lock; writes
/// construct a fresh snapshot and swap the pointer. A reader therefore sees
/// either the entirely-old or entirely-new catalog, never a mix.
#[derive(Debug)]
pub struct Catalog {
    inner: RwLock<Arc<Snapshot>>,
}

impl Catalog {
    /// Create an empty catalog with the given annotation namespace
    pub fn new(annotation_namespace: impl Into<String>) -> Self {
        Self::with_templates(annotation_namespace, Vec::new())
    }

    /// Create a catalog pre-populated with the given templates
    pub fn with_templates(
        annotation_namespace: impl Into<String>,
        templates: Vec<Template>,
    ) -> Self {
        Self {
            inner: RwLock::new(Arc::new(Snapshot {
                annotation_namespace: annotation_namespace.into(),
                templates: index_by_full_name(templates),
            })),
        }
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.read().clone()
    }

    /// The annotation namespace currently in effect
    pub fn annotation_namespace(&self) -> String {
        self.snapshot().annotation_namespace.clone()
    }

    /// The full key of the injection status annotation,
    /// `{annotation_namespace}/status`
    pub fn status_annotation_key(&self) -> String {
        format!("{}/status", self.annotation_namespace())
    }

    /// The full key of the injection request annotation,
    /// `{annotation_namespace}/request`
    pub fn request_annotation_key(&self) -> String {
        format!("{}/request", self.annotation_namespace())
    }

    /// Whether a template exists for the given key. Accepts both bare
    /// `name` (implicitly `latest`) and `name:version`; an unparseable key
    /// matches nothing.
    pub fn has(&self, key: &str) -> bool {
        match template::canonical_key(key) {
            Ok(full_name) => self.snapshot().templates.contains_key(&full_name),
            Err(_) => false,
        }
    }

    /// Fetch the template for the given key, or [`Error::NotFound`]. An
    /// unparseable key is reported as not found, carrying the raw key.
    pub fn get(&self, key: &str) -> Result<Arc<Template>> {
        let full_name = template::canonical_key(key).map_err(|_| Error::not_found(key))?;
        self.snapshot()
            .templates
            .get(&full_name)
            .cloned()
            .ok_or_else(|| Error::not_found(full_name))
    }

    /// Atomically replace the whole template mapping. Duplicate full-names
    /// within `templates` resolve last-writer-wins. The annotation
    /// namespace is carried over unchanged.
    pub fn replace_all(&self, templates: Vec<Template>) {
        let mut guard = self.inner.write();
        let next = Snapshot {
            annotation_namespace: guard.annotation_namespace.clone(),
            templates: index_by_full_name(templates),
        };
        debug!(templates = next.templates.len(), "replacing template catalog");
        *guard = Arc::new(next);
    }

    /// Number of templates in the current snapshot
    pub fn len(&self) -> usize {
        self.snapshot().templates.len()
    }

    /// Whether the current snapshot holds no templates
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted canonical full-names in the current snapshot; all names come
    /// from the same snapshot
    pub fn template_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.snapshot().templates.keys().cloned().collect();
        names.sort();
        names
    }
}

fn index_by_full_name(templates: Vec<Template>) -> HashMap<String, Arc<Template>> {
    let mut index = HashMap::with_capacity(templates.len());
    for template in templates {
        index.insert(template.full_name(), Arc::new(template));
    }
    index
}
