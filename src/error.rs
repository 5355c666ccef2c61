//! Error types for the sidecar injector

use thiserror::Error;

/// Main error type for injector operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A template was parsed without the required `name` field
    #[error("name field is required for a sidecar template")]
    MissingName,

    /// A template `name` carried more than one `:` separator
    #[error("unsupported name:version format: {0:?}")]
    UnsupportedNameVersionFormat(String),

    /// The template directory scan produced no templates
    #[error("at least one template must be present in {0}")]
    NoConfigurationLoaded(String),

    /// An `inherits` chain exceeded the recursion limit
    #[error("inheritance chain deeper than {limit} levels at {path}")]
    InheritanceTooDeep {
        /// File at which the limit was hit
        path: String,
        /// The configured recursion limit
        limit: usize,
    },

    /// Catalog lookup miss
    #[error("no template found for {0:?}")]
    NotFound(String),

    /// A template entry inside a ConfigMap failed to parse
    #[error("parsing ConfigMap {config_map} entry {key}: {source}")]
    ConfigMapEntry {
        /// Name of the ConfigMap carrying the entry
        config_map: String,
        /// Data key of the failing entry
        key: String,
        /// Underlying parse error
        #[source]
        source: Box<Error>,
    },

    /// The watch stream ended without an error; the supervisor restarts it
    #[error("watch channel has closed")]
    WatchChannelClosed,

    /// A transient watch stream failure; retried with backoff
    #[error("watch stream error: {0}")]
    Watch(String),

    /// The API server rejected our credentials; not retried
    #[error("kubernetes authorization failure: {0}")]
    Unauthorized(String),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// YAML (de)serialization error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error with the path it occurred on
    #[error("{path}: {source}")]
    Io {
        /// Path being read when the error occurred
        path: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Create an error for an unparseable `name[:version]` field
    pub fn unsupported_name_version(raw: impl Into<String>) -> Self {
        Self::UnsupportedNameVersionFormat(raw.into())
    }

    /// Create an inheritance depth error for the given file
    pub fn inheritance_too_deep(path: impl Into<String>, limit: usize) -> Self {
        Self::InheritanceTooDeep {
            path: path.into(),
            limit,
        }
    }

    /// Create a catalog miss for the given lookup key
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound(key.into())
    }

    /// Create an I/O error annotated with the path it occurred on
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap a template parse failure with the ConfigMap entry it came from
    pub fn config_map_entry(
        config_map: impl Into<String>,
        key: impl Into<String>,
        source: Error,
    ) -> Self {
        Self::ConfigMapEntry {
            config_map: config_map.into(),
            key: key.into(),
            source: Box::new(source),
        }
    }

    /// Whether this error is fatal to the watch supervisor rather than
    /// something to retry with backoff
    pub fn is_fatal_watch_error(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_name_display() {
        let err = Error::MissingName;
        assert!(err.to_string().contains("name field is required"));
    }

    #[test]
    fn test_unsupported_name_version_carries_raw_value() {
        let err = Error::unsupported_name_version("a:b:c");
        assert!(err.to_string().contains("a:b:c"));
    }

    #[test]
    fn test_not_found_carries_key() {
        let err = Error::not_found("missing-sidecar:latest");
        assert!(err.to_string().contains("missing-sidecar:latest"));
    }

    #[test]
    fn test_config_map_entry_wraps_source() {
        let inner = Error::MissingName;
        let err = Error::config_map_entry("sidecars", "broken.yaml", inner);
        let msg = err.to_string();
        assert!(msg.contains("sidecars"));
        assert!(msg.contains("broken.yaml"));
        assert!(msg.contains("name field is required"));
    }

    /// Story: the watch supervisor distinguishes retryable from fatal errors
    ///
    /// Channel closure and transient stream errors restart the watch with
    /// backoff; an authorization failure means the service account is wrong
    /// and no amount of retrying will fix it.
    #[test]
    fn story_watch_error_classification() {
        assert!(!Error::WatchChannelClosed.is_fatal_watch_error());
        assert!(!Error::Watch("connection reset".to_string()).is_fatal_watch_error());
        assert!(Error::Unauthorized("RBAC denied configmaps list".to_string())
            .is_fatal_watch_error());
    }

    #[test]
    fn test_inheritance_too_deep_display() {
        let err = Error::inheritance_too_deep("conf/a.yaml", 16);
        let msg = err.to_string();
        assert!(msg.contains("16"));
        assert!(msg.contains("conf/a.yaml"));
    }
}
