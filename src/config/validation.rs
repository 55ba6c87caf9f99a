use std::net::SocketAddr;

use eyre::Result;

use crate::{
    config::{
        models::{Configuration, Protocol, RouteNode, RouteType, ServiceRoute},
        settings::Settings,
    },
    core::{
        load_balancer::BalancerFactory,
        router::{RoutePattern, parse_methods},
    },
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Semantic checks for dynamic configuration snapshots
pub struct ConfigurationValidator;

impl ConfigurationValidator {
    /// Validate a whole snapshot, reporting every problem at once
    pub fn validate(config: &Configuration) -> ValidationResult<()> {
        let factory = BalancerFactory::default();
        let mut errors = Vec::new();

        if let Some(mode) = &config.balance_mode {
            if !factory.supports(mode) {
                errors.push(ValidationError::InvalidField {
                    field: "balance_mode".to_string(),
                    message: format!("algorithm '{mode}' not supported"),
                });
            }
        }

        for (name, service) in &config.services {
            Self::validate_service(name, service, &factory, &mut errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    fn validate_service(
        name: &str,
        service: &ServiceRoute,
        factory: &BalancerFactory,
        errors: &mut Vec<ValidationError>,
    ) {
        if let Some(mode) = &service.balance_mode {
            if !factory.supports(mode) {
                errors.push(ValidationError::InvalidField {
                    field: format!("service '{name}' balance_mode"),
                    message: format!("algorithm '{mode}' not supported"),
                });
            }
        }

        for (i, server) in service.servers.iter().enumerate() {
            if server.host.trim().is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("service '{name}' server {} host", i + 1),
                });
            }
            if server.port == 0 {
                errors.push(ValidationError::InvalidField {
                    field: format!("service '{name}' server {} port", i + 1),
                    message: "Port must be greater than 0".to_string(),
                });
            }
        }

        // Unknown protocols are skipped when routers are built, so their routes are not checked.
        let Some(protocol) = service.protocol() else {
            return;
        };
        for node in &service.routers {
            Self::validate_node(name, node, "", protocol, errors);
        }
    }

    fn validate_node(
        service: &str,
        node: &RouteNode,
        prefix: &str,
        protocol: Protocol,
        errors: &mut Vec<ValidationError>,
    ) {
        if let Err(e) = parse_methods(&node.methods, protocol) {
            errors.push(ValidationError::InvalidField {
                field: format!("service '{service}' route '{}' methods", node.path),
                message: e.to_string(),
            });
        }

        if node.kind == RouteType::Subrouter {
            let mount = if node.prefix.is_empty() {
                &node.path
            } else {
                &node.prefix
            };
            if mount.is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("service '{service}' subrouter prefix"),
                });
                return;
            }
            if !mount.starts_with('/') {
                errors.push(ValidationError::InvalidField {
                    field: format!("service '{service}' subrouter '{mount}'"),
                    message: "Prefix must start with '/'".to_string(),
                });
            }
            let nested = format!("{prefix}{}", mount.trim_end_matches('/'));
            for child in &node.routers {
                Self::validate_node(service, child, &nested, protocol, errors);
            }
            return;
        }

        if !node.path.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: format!("service '{service}' route '{}'", node.path),
                message: "Path must start with '/'".to_string(),
            });
            return;
        }

        let full = format!("{prefix}{}", node.path);
        if let Err(e) = RoutePattern::compile(&full, node.kind, &node.params) {
            errors.push(ValidationError::InvalidField {
                field: format!("service '{service}' route '{}'", node.path),
                message: e.to_string(),
            });
        }
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}

/// Validate the static settings
pub fn validate_settings(settings: &Settings) -> ValidationResult<()> {
    if let Err(e) = settings.entrypoint.address.parse::<SocketAddr>() {
        return Err(ValidationError::InvalidListenAddress {
            address: settings.entrypoint.address.clone(),
            reason: e.to_string(),
        });
    }

    if let Some(file) = &settings.providers.file {
        match (&file.filename, &file.directory) {
            (None, None) => {
                return Err(ValidationError::MissingField {
                    field: "providers.file.filename or providers.file.directory".to_string(),
                });
            }
            (Some(_), Some(_)) => {
                return Err(ValidationError::InvalidField {
                    field: "providers.file".to_string(),
                    message: "Set either filename or directory, not both".to_string(),
                });
            }
            _ => {}
        }
    }

    Ok(())
}
