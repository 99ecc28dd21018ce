//! Error types for evidence gathering and gene resolution

use std::fmt;

use thiserror::Error;

use crate::evidence::EvidenceKind;
use crate::gene::GeneService;

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, EvidenceError>;

/// One evidence source's failure inside an aggregate error.
#[derive(Debug)]
pub struct SourceFailure {
    pub kind: EvidenceKind,
    pub error: EvidenceError,
}

impl fmt::Display for SourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.kind.service_name(), self.error)
    }
}

/// Main error type for the crate
#[derive(Debug, Error)]
pub enum EvidenceError {
    /// Network-level failure talking to an external service. Callers may retry.
    #[error("{service} transient failure: {message}")]
    Transient { service: String, message: String },

    /// The breaker guarding `name` rejected the call without attempting it.
    #[error("circuit breaker {name} is open")]
    CircuitOpen { name: String },

    /// Breaker open and no cached fallback was available.
    #[error("{service} service unavailable (circuit breaker open)")]
    ServiceUnavailable { service: String },

    /// Non-breaker failure from a named service.
    #[error("{service} query failed: {source}")]
    SourceFailed {
        service: String,
        #[source]
        source: Box<EvidenceError>,
    },

    /// Cache backend failure. Logged and treated as a miss by callers.
    #[error("Cache error: {0}")]
    Cache(String),

    /// Every evidence source failed.
    #[error("all external database queries failed: {}", join_failures(.failures))]
    AggregateFailure { failures: Vec<SourceFailure> },

    /// All gene services failed to resolve a transcript.
    #[error("failed to resolve transcript for gene symbol {symbol}: {}", join_gene_failures(.failures))]
    TranscriptResolution {
        symbol: String,
        failures: Vec<(GeneService, String)>,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("unsupported operation: {operation}")]
    Unsupported { operation: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl EvidenceError {
    pub fn transient(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            service: service.into(),
            message: message.into(),
        }
    }

    /// True for breaker rejections, including half-open saturation.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient { .. } | Self::Io(_) => true,
            Self::SourceFailed { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

fn join_failures(failures: &[SourceFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn join_gene_failures(failures: &[(GeneService, String)]) -> String {
    failures
        .iter()
        .map(|(service, err)| format!("{}: {}", service, err))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EvidenceError::ServiceUnavailable {
            service: "ClinVar".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "ClinVar service unavailable (circuit breaker open)"
        );

        let err = EvidenceError::SourceFailed {
            service: "gnomAD".to_string(),
            source: Box::new(EvidenceError::transient("gnomAD", "connection reset")),
        };
        assert_eq!(
            err.to_string(),
            "gnomAD query failed: gnomAD transient failure: connection reset"
        );
    }

    #[test]
    fn test_aggregate_failure_names_every_source() {
        let err = EvidenceError::AggregateFailure {
            failures: vec![
                SourceFailure {
                    kind: EvidenceKind::ClinicalSignificance,
                    error: EvidenceError::transient("ClinVar", "boom"),
                },
                SourceFailure {
                    kind: EvidenceKind::MutationDatabase,
                    error: EvidenceError::ServiceUnavailable {
                        service: "HGMD".into(),
                    },
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("all external database queries failed"));
        assert!(msg.contains("ClinVar=ClinVar transient failure: boom"));
        assert!(msg.contains("HGMD=HGMD service unavailable"));
    }

    #[test]
    fn test_transient_classification() {
        let wrapped = EvidenceError::SourceFailed {
            service: "COSMIC".into(),
            source: Box::new(EvidenceError::transient("COSMIC", "timeout")),
        };
        assert!(wrapped.is_transient());
        assert!(!EvidenceError::Cancelled.is_transient());
        assert!(EvidenceError::CircuitOpen { name: "x".into() }.is_circuit_open());
    }

    #[test]
    fn test_error_from_serde() {
        let serde_err = serde_json::from_str::<u32>("not json").unwrap_err();
        let err: EvidenceError = serde_err.into();
        assert!(matches!(err, EvidenceError::Serialization(_)));
    }
}
