//! Sidecar injector - Kubernetes mutating admission webhook for sidecar injection
//!
//! The injector intercepts pod creation through a mutating admission webhook and
//! merges operator-authored sidecar templates into the pod spec before it is
//! scheduled. Pods opt in with a request annotation; templates are loaded from a
//! directory at startup and live-reloaded from labeled ConfigMaps.
//!
//! # Architecture
//!
//! Four concurrent activities run in the process:
//! - A TLS admission server answering `POST /mutate`
//! - A plain-HTTP lifecycle server for `/metrics` and `/health`
//! - A ConfigMap watcher that signals whenever a labeled ConfigMap changes
//! - A coalescer that collapses bursts of change signals into single
//!   reconciliation ticks
//!
//! # Modules
//!
//! - [`template`] - Sidecar template model, YAML parsing, merge and inheritance
//! - [`catalog`] - Atomically replaceable name:version -> template catalog
//! - [`coalescer`] - Debouncing of watch signals
//! - [`watcher`] - ConfigMap watch loop, supervision and reconciliation
//! - [`webhook`] - Admission endpoint, injection decision and patch generation
//! - [`metrics`] - Prometheus counters and exposition
//! - [`error`] - Error types for the injector

#![deny(missing_docs)]

pub mod catalog;
pub mod coalescer;
pub mod error;
pub mod metrics;
pub mod template;
pub mod watcher;
pub mod webhook;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// These constants define the default values used throughout the injector.
// Centralizing them here ensures consistency across the CLI defaults and
// test fixtures.

/// Default port for the lifecycle HTTP server (metrics, health checking)
pub const DEFAULT_LIFECYCLE_PORT: u16 = 9000;

/// Default port for the TLS webhook server handling admission reviews
pub const DEFAULT_TLS_PORT: u16 = 9443;

/// Default window in seconds over which bursts of ConfigMap change signals
/// are coalesced into a single reconciliation
pub const DEFAULT_COALESCE_WINDOW_SECS: u64 = 3;
