//! Error types for vnetdir

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Membership Errors ===
    #[error("Unknown node: {0}")]
    NodeNotFound(String),

    #[error("Node {0} is not live")]
    NodeNotLive(String),

    #[error("Invalid node address: {0}")]
    InvalidAddress(String),

    #[error("Not leader: current leader is {0}")]
    NotLeader(String),

    // === Domain Errors ===
    #[error("Unknown domain: {0}")]
    DomainNotFound(u32),

    #[error("Domain {domain} is not hosted by {node}")]
    DomainNotHosted { domain: u32, node: String },

    #[error("Domain {domain} is already hosted by {node}")]
    DomainAlreadyHosted { domain: u32, node: String },

    #[error("Invalid replication factor {0}")]
    InvalidReplicationFactor(u32),

    // === Migration Errors ===
    #[error("Migration of domain {domain} to {destination} already active")]
    SessionExists { domain: u32, destination: String },

    #[error("Migration rejected for domain {domain}: {reason}")]
    MigrationRejected { domain: u32, reason: String },

    #[error("Migration admission denied: weight {requested} over ceiling ({active}/{ceiling})")]
    AdmissionDenied {
        requested: u64,
        active: u64,
        ceiling: u64,
    },

    // === Network Errors ===
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP error: {0}")]
    Http(String),

    /// Error answer from a node's admin API
    #[error("Request failed ({status}): {message}")]
    Api { status: u16, message: String },

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),
}

impl Error {
    /// Can the caller simply try again later?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::Transport(_)
                | Error::Http(_)
                | Error::MigrationRejected { .. }
                | Error::AdmissionDenied { .. }
                | Error::NotLeader(_)
        ) || matches!(self, Error::Api { status, .. } if *status >= 500)
    }

    /// Convert to HTTP status code for the admin API
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NodeNotFound(_) | Error::DomainNotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidAddress(_)
            | Error::InvalidReplicationFactor(_)
            | Error::InvalidConfig(_)
            | Error::DomainNotHosted { .. }
            | Error::DomainAlreadyHosted { .. } => StatusCode::BAD_REQUEST,
            Error::SessionExists { .. } => StatusCode::CONFLICT,
            Error::MigrationRejected { .. }
            | Error::AdmissionDenied { .. }
            | Error::NodeNotLive(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::NotLeader(_) => StatusCode::MISDIRECTED_REQUEST,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::Api { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_retryable_classes() {
        assert!(Error::Transport("down".into()).is_retryable());
        assert!(Error::MigrationRejected {
            domain: 7,
            reason: "session invalid".into()
        }
        .is_retryable());
        assert!(!Error::DomainNotFound(7).is_retryable());
        assert!(!Error::InvalidConfig("x".into()).is_retryable());
        assert!(Error::Api {
            status: 503,
            message: "busy".into()
        }
        .is_retryable());
        assert!(!Error::Api {
            status: 404,
            message: "gone".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(
            Error::NodeNotFound("10.0.0.1:7400".into()).to_http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::SessionExists {
                domain: 1,
                destination: "10.0.0.2:7400".into()
            }
            .to_http_status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::AdmissionDenied {
                requested: 10,
                active: 995,
                ceiling: 1000
            }
            .to_http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
