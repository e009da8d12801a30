//! Shared error type used across all Opta-LMX crates.
//!
//! Every variant carries enough context for the HTTP layer to build an
//! OpenAI-shaped error body (`{error: {message, type, code}}`) without
//! re-classifying. `status()` / `code()` / `error_type()` are the single
//! source of truth for that mapping.

use crate::config::HelperFallback;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("model in use: {0}")]
    ModelInUse(String),

    #[error("download not found: {0}")]
    DownloadNotFound(String),

    #[error("insufficient memory: {0}")]
    InsufficientMemory(String),

    #[error("model loader crashed: {0}")]
    ModelLoaderCrashed(String),

    #[error("model runtime incompatible: {0}")]
    ModelRuntimeIncompatible(String),

    /// Semaphore timeout on lane admission.
    #[error("Server is busy — all inference slots occupied. Try again shortly.")]
    Overloaded,

    #[error("request timed out after {0:.0}s")]
    RequestTimeout(f64),

    #[error("Budget exhausted: {budget} used {used:.2} of {limit:.2} limit")]
    BudgetExhausted {
        budget: &'static str,
        used: f64,
        limit: f64,
    },

    #[error("queue is full ({size}/{capacity})")]
    QueueFull { size: usize, capacity: usize },

    #[error("helper node {node}: {message}")]
    HelperNode {
        node: String,
        message: String,
        fallback: HelperFallback,
    },

    #[error("circuit open for {0}")]
    CircuitOpen(String),

    #[error("auth: {0}")]
    AuthDenied(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// HTTP status this error maps to on the public surface.
    pub fn status(&self) -> u16 {
        match self {
            Error::ModelNotFound(_) | Error::DownloadNotFound(_) => 404,
            Error::ModelInUse(_) => 409,
            Error::InsufficientMemory(_) => 507,
            Error::Overloaded | Error::QueueFull { .. } => 429,
            Error::RequestTimeout(_) => 504,
            Error::AuthDenied(_) => 401,
            Error::Validation(_) | Error::BudgetExhausted { .. } => 400,
            Error::HelperNode { fallback, .. } => match fallback {
                HelperFallback::Skip => 502,
                HelperFallback::Local => 500,
            },
            Error::CircuitOpen(_) => 502,
            Error::ModelLoaderCrashed(_)
            | Error::ModelRuntimeIncompatible(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::Internal(_) => 500,
        }
    }

    /// Stable machine-readable code for the OpenAI error body.
    pub fn code(&self) -> &'static str {
        match self {
            Error::ModelNotFound(_) => "model_not_found",
            Error::ModelInUse(_) => "model_in_use",
            Error::DownloadNotFound(_) => "download_not_found",
            Error::InsufficientMemory(_) => "insufficient_memory",
            Error::ModelLoaderCrashed(_) => "model_loader_crashed",
            Error::ModelRuntimeIncompatible(_) => "model_runtime_incompatible",
            Error::Overloaded => "overloaded",
            Error::RequestTimeout(_) => "request_timeout",
            Error::BudgetExhausted { .. } => "budget_exhausted",
            Error::QueueFull { .. } => "queue_full",
            Error::HelperNode { .. } => "helper_node_error",
            Error::CircuitOpen(_) => "circuit_open",
            Error::AuthDenied(_) => "auth_denied",
            Error::Validation(_) => "validation_error",
            Error::Io(_) | Error::Json(_) | Error::Internal(_) => "internal_error",
        }
    }

    /// OpenAI `error.type` field.
    pub fn error_type(&self) -> &'static str {
        match self.status() {
            400 => "invalid_request_error",
            401 | 403 => "authentication_error",
            404 => "not_found_error",
            429 => "rate_limit_error",
            _ => "server_error",
        }
    }

    /// Whether the error is transient enough to retry (agent step policy).
    pub fn is_transient(&self) -> bool {
        if matches!(self, Error::Overloaded | Error::RequestTimeout(_)) {
            return true;
        }
        let message = self.to_string().to_lowercase();
        const MARKERS: &[&str] = &[
            "timed out",
            "timeout",
            "server is busy",
            "temporarily unavailable",
            "connection reset",
            "rate limit",
        ];
        MARKERS.iter().any(|m| message.contains(m))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(Error::ModelNotFound("x".into()).status(), 404);
        assert_eq!(Error::ModelInUse("x".into()).status(), 409);
        assert_eq!(Error::Overloaded.status(), 429);
        assert_eq!(
            Error::QueueFull {
                size: 8,
                capacity: 8
            }
            .status(),
            429
        );
        assert_eq!(Error::InsufficientMemory("x".into()).status(), 507);
        assert_eq!(Error::Validation("x".into()).status(), 400);
        assert_eq!(Error::AuthDenied("x".into()).status(), 401);
    }

    #[test]
    fn helper_fallback_drives_status() {
        let skip = Error::HelperNode {
            node: "embed".into(),
            message: "boom".into(),
            fallback: HelperFallback::Skip,
        };
        let local = Error::HelperNode {
            node: "embed".into(),
            message: "boom".into(),
            fallback: HelperFallback::Local,
        };
        assert_eq!(skip.status(), 502);
        assert_eq!(local.status(), 500);
    }

    #[test]
    fn overload_message_names_slots() {
        let message = Error::Overloaded.to_string();
        assert!(message.contains("all inference slots occupied"));
    }

    #[test]
    fn transient_detection() {
        assert!(Error::Overloaded.is_transient());
        assert!(Error::RequestTimeout(30.0).is_transient());
        assert!(Error::Internal("upstream rate limit hit".into()).is_transient());
        assert!(!Error::Validation("bad field".into()).is_transient());
        assert!(!Error::ModelNotFound("m".into()).is_transient());
    }

    #[test]
    fn budget_exhausted_names_budget() {
        let err = Error::BudgetExhausted {
            budget: "token",
            used: 13.0,
            limit: 10.0,
        };
        let message = err.to_string();
        assert!(message.contains("Budget exhausted"));
        assert!(message.contains("token"));
        assert_eq!(err.code(), "budget_exhausted");
    }
}
