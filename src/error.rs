//! Unified error types for manifest analysis and query planning.
//!
//! Two error enums cover the whole pipeline:
//!
//! - [`ManifestError`]: the manifest failed analysis (duplicate names,
//!   unresolvable references, invalid origins, bad windows).
//! - [`PlanError`]: a planning request failed (syntax, size, unknown
//!   objects, ambiguity, cycles).
//!
//! Every error maps to a stable wire code via [`ErrorCode`] and serializes
//! to the `{code, message, path?}` shape consumed by callers. Internal
//! invariant violations use [`PlanError::Internal`]; they are logged and
//! returned, never panicked.

use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// Result type for planning operations.
pub type PlanResult<T> = Result<T, PlanError>;

/// Stable error codes exposed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ManifestInvalid,
    UnknownObject,
    AmbiguousIdentifier,
    Cycle,
    Parse,
    InputTooLarge,
    UnsupportedDialect,
    /// Invariant violation inside the planner. Should never surface to a
    /// well-behaved caller.
    Internal,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::ManifestInvalid => "MANIFEST_INVALID",
            ErrorCode::UnknownObject => "UNKNOWN_OBJECT",
            ErrorCode::AmbiguousIdentifier => "AMBIGUOUS_IDENTIFIER",
            ErrorCode::Cycle => "CYCLE",
            ErrorCode::Parse => "PARSE",
            ErrorCode::InputTooLarge => "INPUT_TOO_LARGE",
            ErrorCode::UnsupportedDialect => "UNSUPPORTED_DIALECT",
            ErrorCode::Internal => "INTERNAL",
        };
        f.write_str(s)
    }
}

/// Errors raised while analyzing a manifest.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ManifestError {
    #[error("duplicate {kind} name: '{name}'")]
    DuplicateName { kind: String, name: String },

    #[error("{owner} references unknown object '{reference}'")]
    UnknownReference { owner: String, reference: String },

    #[error("model '{model}' must declare exactly one of refSql, baseObject, tableReference")]
    InvalidOrigin { model: String },

    #[error("relationship '{name}' is invalid: {reason}")]
    InvalidRelationship { name: String, reason: String },

    #[error("cumulative metric '{metric}' window is invalid: {reason}")]
    InvalidWindow { metric: String, reason: String },

    #[error("column '{column}' of '{owner}' is invalid: {reason}")]
    InvalidColumn {
        owner: String,
        column: String,
        reason: String,
    },

    #[error("manifest JSON is invalid: {message}")]
    Json { message: String },
}

impl ManifestError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ManifestError::UnknownReference { .. } => ErrorCode::UnknownObject,
            _ => ErrorCode::ManifestInvalid,
        }
    }

    /// Wire shape: `{code, message, path?}`.
    pub fn to_json(&self) -> serde_json::Value {
        let path = match self {
            ManifestError::UnknownReference { owner, .. } => Some(owner.clone()),
            ManifestError::InvalidOrigin { model } => Some(model.clone()),
            ManifestError::InvalidRelationship { name, .. } => Some(name.clone()),
            ManifestError::InvalidWindow { metric, .. } => Some(metric.clone()),
            ManifestError::InvalidColumn { owner, column, .. } => {
                Some(format!("{owner}.{column}"))
            }
            _ => None,
        };
        match path {
            Some(path) => json!({
                "code": self.code(),
                "message": self.to_string(),
                "path": path,
            }),
            None => json!({
                "code": self.code(),
                "message": self.to_string(),
            }),
        }
    }
}

/// Errors raised while planning a statement.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlanError {
    #[error("SQL parse error: {message}")]
    Parse { message: String },

    #[error("{what} exceeds the {limit}-byte limit ({actual} bytes)")]
    InputTooLarge {
        what: &'static str,
        limit: usize,
        actual: usize,
    },

    #[error("unknown object '{name}'")]
    UnknownObject { name: String },

    #[error("ambiguous identifier '{name}' (candidates: {})", candidates.join(", "))]
    AmbiguousIdentifier {
        name: String,
        candidates: Vec<String>,
    },

    #[error("cycle detected while resolving calculated column '{column}'")]
    Cycle { column: String },

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("unsupported dialect '{name}'")]
    UnsupportedDialect { name: String },

    #[error("internal planner error: {message}")]
    Internal { message: String },
}

impl PlanError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PlanError::Parse { .. } => ErrorCode::Parse,
            PlanError::InputTooLarge { .. } => ErrorCode::InputTooLarge,
            PlanError::UnknownObject { .. } => ErrorCode::UnknownObject,
            PlanError::AmbiguousIdentifier { .. } => ErrorCode::AmbiguousIdentifier,
            PlanError::Cycle { .. } => ErrorCode::Cycle,
            PlanError::Manifest(inner) => inner.code(),
            PlanError::UnsupportedDialect { .. } => ErrorCode::UnsupportedDialect,
            PlanError::Internal { .. } => ErrorCode::Internal,
        }
    }

    /// Wire shape: `{code, message, path?}`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            PlanError::Manifest(inner) => inner.to_json(),
            PlanError::Cycle { column } => json!({
                "code": self.code(),
                "message": self.to_string(),
                "path": column,
            }),
            _ => json!({
                "code": self.code(),
                "message": self.to_string(),
            }),
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        let message = message.into();
        log::error!("internal planner error: {message}");
        PlanError::Internal { message }
    }
}
