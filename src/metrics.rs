//! Prometheus metrics for the injector
//!
//! One counter carries the outcome of every admission decision:
//! `injections{status, reason, requested}`. `status` distinguishes
//! successful mutations, deliberate skips and errors; `reason` narrows the
//! skip/error cause; `requested` is the canonical full-name of the template
//! the pod asked for, when one was named.

use once_cell::sync::Lazy;
use prometheus::{opts, register_int_counter_vec, IntCounterVec, TextEncoder};

/// Counter of mutations/injections into admitted pods
///
/// Labels:
/// - `status`: success, skipped, error
/// - `reason`: why the outcome happened (empty for none)
/// - `requested`: canonical full-name of the requested template (possibly
///   empty)
pub static INJECTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("injections", "Count of mutations/injections into a resource"),
        &["status", "reason", "requested"]
    )
    .expect("injections counter registration")
});

/// Force metric registration so `/metrics` exposes counters before their
/// first increment
pub fn init() {
    Lazy::force(&INJECTIONS);
}

/// Outcome category of one admission decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionStatus {
    /// A patch was produced and returned
    Success,
    /// Injection deliberately did not apply; the pod was allowed unchanged
    Skipped,
    /// The request or the patch generation failed; the pod was still allowed
    Error,
}

impl InjectionStatus {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Skipped => "skipped",
            Self::Error => "error",
        }
    }
}

/// Narrow cause recorded with each injection outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionReason {
    /// The pod lives in an ignored namespace
    IgnoredNamespace,
    /// The pod already carries the injected status annotation
    AlreadyInjected,
    /// The pod carries no request annotation
    NoAnnotation,
    /// The requested template is not in the catalog
    MissingConfig,
    /// The pod object in the admission request failed to decode
    UnmarshalError,
    /// The patch document could not be produced or serialized
    PatchingError,
    /// Everything went fine
    AllGroovy,
}

impl InjectionReason {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IgnoredNamespace => "ignored_namespace",
            Self::AlreadyInjected => "already_injected",
            Self::NoAnnotation => "no_annotation",
            Self::MissingConfig => "missing_config",
            Self::UnmarshalError => "unmarshal_error",
            Self::PatchingError => "patching_error",
            Self::AllGroovy => "all_groovy",
        }
    }
}

/// Record one admission decision outcome
pub fn record_injection(status: InjectionStatus, reason: InjectionReason, requested: &str) {
    INJECTIONS
        .with_label_values(&[status.as_str(), reason.as_str(), requested])
        .inc();
}

/// Render the default registry in the Prometheus text exposition format
pub fn render() -> std::result::Result<String, prometheus::Error> {
    TextEncoder::new().encode_to_string(&prometheus::gather())
}
