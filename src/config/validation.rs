//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (ports, counts, delays)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: HandoffConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::{HandoffConfig, RoutingPolicyKind};

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("listener.bind_address {0:?} is not a socket address")]
    BindAddress(String),

    #[error("workers.count must be at least 1 when routing delegates connections")]
    NoWorkers,

    #[error("workers.program must not be empty")]
    EmptyProgram,

    #[error("workers.port_range {start}..{end} is empty")]
    EmptyPortRange { start: u16, end: u16 },

    #[error("workers.port_range must not include port 0")]
    ZeroPort,

    #[error("workers.connect_retry_ms must be greater than 0")]
    ZeroRetryDelay,

    #[error("delegated.backlog must be at least 1")]
    ZeroBacklog,

    #[error("observability.metrics_address {0:?} is not a socket address")]
    MetricsAddress(String),
}

/// Check a configuration, collecting every problem found.
pub fn validate_config(config: &HandoffConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::BindAddress(
            config.listener.bind_address.clone(),
        ));
    }

    let delegates = config.routing.policy != RoutingPolicyKind::LocalOnly;
    if delegates && config.workers.count == 0 {
        errors.push(ValidationError::NoWorkers);
    }
    if config.workers.count > 0 && config.workers.program.as_os_str().is_empty() {
        errors.push(ValidationError::EmptyProgram);
    }
    if let Some(range) = config.workers.port_range {
        if range.start >= range.end {
            errors.push(ValidationError::EmptyPortRange {
                start: range.start,
                end: range.end,
            });
        } else if range.start == 0 {
            errors.push(ValidationError::ZeroPort);
        }
    }
    if config.workers.connect_retry_ms == 0 {
        errors.push(ValidationError::ZeroRetryDelay);
    }

    if config.delegated.backlog == 0 {
        errors.push(ValidationError::ZeroBacklog);
    }

    if config.observability.metrics_enabled
        && config
            .observability
            .metrics_address
            .parse::<SocketAddr>()
            .is_err()
    {
        errors.push(ValidationError::MetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::PortRange;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(validate_config(&HandoffConfig::default()), Ok(()));
    }

    #[test]
    fn collects_every_error() {
        let mut config = HandoffConfig::default();
        config.listener.bind_address = "not an address".into();
        config.workers.count = 0;
        config.workers.port_range = Some(PortRange { start: 9000, end: 8000 });
        config.delegated.backlog = 0;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![
                ValidationError::BindAddress("not an address".into()),
                ValidationError::NoWorkers,
                ValidationError::EmptyPortRange { start: 9000, end: 8000 },
                ValidationError::ZeroBacklog,
            ]
        );
    }

    #[test]
    fn local_only_needs_no_workers() {
        let mut config = HandoffConfig::default();
        config.routing.policy = RoutingPolicyKind::LocalOnly;
        config.workers.count = 0;
        assert_eq!(validate_config(&config), Ok(()));
    }
}
