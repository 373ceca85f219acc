//! Provider error taxonomy and classification.
//!
//! Every failure that crosses the model-call boundary is normalized into a
//! [`ProviderError`] exactly once. The [`retryable`](ProviderError::retryable)
//! flag is the only signal an external retry policy needs; this crate never
//! loops or backs off on its own.
//!
//! Classification is a pure function over the error text (plus an optional
//! transport status code). Rules are applied in priority order and the first
//! match wins:
//!
//! | Rule | Kind | Retryable |
//! |------|------|-----------|
//! | 401/403, "unauthorized", "invalid api key" | `Auth` | no |
//! | "model ... not found / does not exist" | `Model` | no |
//! | 404 | `Endpoint` | no |
//! | "connection refused", "no such host" | `Endpoint` | yes |
//! | timeout, "deadline exceeded" | `Endpoint` | yes |
//! | "context canceled" | `Unknown` ("request cancelled") | no |
//! | 429, "rate limit", "too many requests" | `RateLimited` | yes |
//! | GPU / CUDA / out-of-memory | `Endpoint` | yes |
//! | 5xx | `Endpoint` | yes |
//! | anything else | `Unknown` | no |

use regex::Regex;
use serde::Serialize;
use std::error::Error as StdError;
use std::fmt;
use std::sync::{Arc, LazyLock};

/// Type-erased error accepted at the classification boundary.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Message used for every cancelled request, regardless of the raw cause.
pub const CANCELLED_MESSAGE: &str = "request cancelled";

/// Coarse failure category of a provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Credentials rejected. Never retry.
    Auth,
    /// The requested model is unknown to the endpoint. Retrying needs reconfiguration.
    Model,
    /// Network, 5xx, or transient infrastructure failure (or a missing route).
    Endpoint,
    /// HTTP 429 or an explicit rate-limit message.
    RateLimited,
    /// Unrecognized failure, treated conservatively.
    Unknown,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderErrorKind::Auth => write!(f, "auth"),
            ProviderErrorKind::Model => write!(f, "model"),
            ProviderErrorKind::Endpoint => write!(f, "endpoint"),
            ProviderErrorKind::RateLimited => write!(f, "rate_limited"),
            ProviderErrorKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Where a failed call was headed. Copied into the resulting [`ProviderError`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CallSite<'a> {
    pub model: &'a str,
    pub endpoint: &'a str,
}

impl<'a> CallSite<'a> {
    pub fn new(model: &'a str, endpoint: &'a str) -> Self {
        Self { model, endpoint }
    }
}

/// A classified, immutable provider failure.
///
/// Build one with [`classify_error`] or [`classify_message`]; the fields are
/// read-only afterwards.
#[derive(Debug, Clone)]
pub struct ProviderError {
    kind: ProviderErrorKind,
    message: String,
    retryable: bool,
    cause: Option<Arc<dyn StdError + Send + Sync>>,
    status_code: u16,
    model: String,
    endpoint: String,
}

impl ProviderError {
    pub fn kind(&self) -> ProviderErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether an external retry policy may re-issue the call unchanged.
    pub fn retryable(&self) -> bool {
        self.retryable
    }

    /// HTTP status code extracted from the failure, or `0` when none was found.
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The original error this one was classified from, if any.
    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// Whether this failure came from a cancelled request. Callers usually
    /// exclude these from circuit-breaker accounting.
    pub fn is_cancelled(&self) -> bool {
        self.kind == ProviderErrorKind::Unknown && self.message == CANCELLED_MESSAGE
    }

    /// The canonical cancellation error for a call site.
    pub fn cancelled(site: &CallSite<'_>) -> Self {
        Self {
            kind: ProviderErrorKind::Unknown,
            message: CANCELLED_MESSAGE.to_string(),
            retryable: false,
            cause: None,
            status_code: 0,
            model: site.model.to_string(),
            endpoint: site.endpoint.to_string(),
        }
    }

    /// An error raised by this crate itself rather than by the upstream.
    pub(crate) fn local(
        kind: ProviderErrorKind,
        message: impl Into<String>,
        retryable: bool,
        site: &CallSite<'_>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable,
            cause: None,
            status_code: 0,
            model: site.model.to_string(),
            endpoint: site.endpoint.to_string(),
        }
    }

    fn with_cause(mut self, cause: BoxError) -> Self {
        self.cause = Some(Arc::from(cause));
        self
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl StdError for ProviderError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

// ── Classification ─────────────────────────────────────────────────

/// Classify an arbitrary error raised at the call boundary.
///
/// An error that is already a [`ProviderError`] is returned unchanged, so
/// classification can be applied at every layer without losing the original
/// call site.
pub fn classify_error(err: BoxError, site: &CallSite<'_>) -> ProviderError {
    match err.downcast::<ProviderError>() {
        Ok(classified) => *classified,
        Err(raw) => {
            let message = raw.to_string();
            classify_message(&message, None, site).with_cause(raw)
        }
    }
}

/// Classify a raw error message, optionally with a status code reported by
/// the transport (which takes precedence over one parsed from the text).
pub fn classify_message(raw: &str, status: Option<u16>, site: &CallSite<'_>) -> ProviderError {
    let status_code = status
        .filter(|s| (100..=599).contains(s))
        .or_else(|| extract_status_code(raw))
        .unwrap_or(0);
    let lower = raw.to_lowercase();
    let target = if site.endpoint.is_empty() {
        "endpoint"
    } else {
        site.endpoint
    };

    let (kind, retryable, message) = if status_code == 401
        || status_code == 403
        || contains_any(
            &lower,
            &[
                "unauthorized",
                "invalid api key",
                "incorrect api key",
                "forbidden",
            ],
        ) {
        (
            ProviderErrorKind::Auth,
            false,
            format!("authentication failed for {target}: {raw}"),
        )
    } else if regex_hit(&MODEL_MISSING, raw) {
        (
            ProviderErrorKind::Model,
            false,
            format!("model '{}' is not available at {target}: {raw}", site.model),
        )
    } else if status_code == 404 {
        (
            ProviderErrorKind::Endpoint,
            false,
            format!("endpoint {target} not found (HTTP 404): {raw}"),
        )
    } else if contains_any(
        &lower,
        &[
            "connection refused",
            "no such host",
            "dns error",
            "connection reset",
        ],
    ) {
        (
            ProviderErrorKind::Endpoint,
            true,
            format!("cannot reach {target}: {raw}"),
        )
    } else if contains_any(&lower, &["timeout", "timed out", "deadline exceeded"]) {
        (
            ProviderErrorKind::Endpoint,
            true,
            format!("request to {target} timed out: {raw}"),
        )
    } else if contains_any(
        &lower,
        &[
            "context canceled",
            "context cancelled",
            "request cancelled",
            "request canceled",
        ],
    ) {
        (ProviderErrorKind::Unknown, false, CANCELLED_MESSAGE.to_string())
    } else if status_code == 429 || contains_any(&lower, &["rate limit", "too many requests"]) {
        (
            ProviderErrorKind::RateLimited,
            true,
            format!("rate limited by {target}: {raw}"),
        )
    } else if regex_hit(&GPU_EXHAUSTION, raw) {
        (
            ProviderErrorKind::Endpoint,
            true,
            format!("transient resource exhaustion at {target}: {raw}"),
        )
    } else if (500..=599).contains(&status_code) {
        (
            ProviderErrorKind::Endpoint,
            true,
            format!("upstream error from {target} (HTTP {status_code}): {raw}"),
        )
    } else {
        (
            ProviderErrorKind::Unknown,
            false,
            format!("provider call failed: {raw}"),
        )
    };

    ProviderError {
        kind,
        message,
        retryable,
        cause: None,
        status_code,
        model: site.model.to_string(),
        endpoint: site.endpoint.to_string(),
    }
}

/// Status code patterns. Each requires a keyword directly before the number
/// so that counts like "processed 503 records" are never mistaken for codes.
const STATUS_PATTERN_SOURCES: [&str; 3] = [
    r"(?i)\bhttp(?:/\d(?:\.\d)?)?[\s:]+(\d{3})\b",
    r"(?i)\bstatus(?:[\s_]?code)?\s*[:=]?\s*(\d{3})\b",
    r"(?i)\bcode\s*[:=]?\s*(\d{3})\b",
];

static STATUS_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    STATUS_PATTERN_SOURCES
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
});

static MODEL_MISSING: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?is)\bmodel\b.*?(?:not found|does not exist|not exist)").ok()
});

static GPU_EXHAUSTION: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:cuda|gpu|oom)\b|out of memory|insufficient (?:v?ram|memory)").ok()
});

fn regex_hit(re: &LazyLock<Option<Regex>>, text: &str) -> bool {
    re.as_ref().is_some_and(|re| re.is_match(text))
}

/// Pull an HTTP status code out of free-form error text.
pub fn extract_status_code(text: &str) -> Option<u16> {
    STATUS_PATTERNS.iter().find_map(|re| {
        re.captures(text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u16>().ok())
            .filter(|code| (100..=599).contains(code))
    })
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}
