use thiserror::Error;

use crate::budget::BudgetError;
use crate::domain::simulation::GraphError;
use crate::engine::EngineError;
use crate::holds::HoldError;
use crate::ledger::LedgerError;
use crate::policy::PolicyError;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum DomainError {
    #[error(transparent)]
    Hold(#[from] HoldError),
    #[error(transparent)]
    Budget(#[from] BudgetError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("validation failure: {0}")]
    Validation(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl From<EngineError> for ApplicationError {
    fn from(value: EngineError) -> Self {
        match value {
            EngineError::InvalidTtl { .. } => Self::Validation(value.to_string()),
            EngineError::Unavailable(detail) => Self::Persistence(detail),
        }
    }
}

impl From<PolicyError> for ApplicationError {
    fn from(value: PolicyError) -> Self {
        Self::Configuration(value.to_string())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::NotFound { .. } => "The referenced lease or session does not exist.",
            Self::Conflict { .. } => {
                "The request conflicts with the current lease state. Re-request and retry."
            }
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::Conflict { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::Conflict { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let message = value.to_string();
        let unassigned = "unassigned".to_string();
        match value {
            ApplicationError::Domain(domain) => match domain {
                DomainError::Hold(HoldError::NotFound(_))
                | DomainError::Budget(BudgetError::NotFound(_))
                | DomainError::Ledger(LedgerError::NotFound(_)) => {
                    Self::NotFound { message, correlation_id: unassigned }
                }
                DomainError::Hold(HoldError::Expired(_))
                | DomainError::Hold(HoldError::StillPending(_))
                | DomainError::Hold(HoldError::NotHolder(_)) => {
                    Self::Conflict { message, correlation_id: unassigned }
                }
                DomainError::Hold(HoldError::InvalidTtl { .. })
                | DomainError::Budget(_)
                | DomainError::Ledger(LedgerError::InvalidTtl(_))
                | DomainError::Graph(_) => {
                    Self::BadRequest { message, correlation_id: unassigned }
                }
            },
            ApplicationError::Validation(_) => {
                Self::BadRequest { message, correlation_id: unassigned }
            }
            ApplicationError::Persistence(_) => {
                Self::ServiceUnavailable { message, correlation_id: unassigned }
            }
            ApplicationError::Configuration(_) => {
                Self::Internal { message, correlation_id: unassigned }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::holds::HoldError;
    use crate::ledger::LedgerError;

    use super::{ApplicationError, DomainError, InterfaceError};

    #[test]
    fn expired_hold_maps_to_conflict_with_correlation() {
        let interface = ApplicationError::from(DomainError::Hold(HoldError::Expired(
            "h_1".to_string(),
        )))
        .into_interface("req-1");

        assert!(matches!(
            interface,
            InterfaceError::Conflict { ref correlation_id, .. } if correlation_id == "req-1"
        ));
        assert_eq!(
            interface.user_message(),
            "The request conflicts with the current lease state. Re-request and retry."
        );
    }

    #[test]
    fn missing_records_map_to_not_found() {
        let interface = ApplicationError::from(DomainError::Ledger(LedgerError::NotFound(
            "key".to_string(),
        )))
        .into_interface("req-2");

        assert!(matches!(interface, InterfaceError::NotFound { .. }));
    }

    #[test]
    fn persistence_failures_map_to_service_unavailable() {
        let interface = ApplicationError::Persistence("database lock timeout".to_string())
            .into_interface("req-3");

        assert!(matches!(interface, InterfaceError::ServiceUnavailable { .. }));
        assert_eq!(
            interface.user_message(),
            "The service is temporarily unavailable. Please retry shortly."
        );
    }

    #[test]
    fn configuration_failures_map_to_internal() {
        let interface =
            ApplicationError::Configuration("policy file unreadable".to_string())
                .into_interface("req-4");

        assert!(matches!(interface, InterfaceError::Internal { .. }));
    }
}
