use std::collections::HashSet;
use std::path::Path;

use crate::config::models::{PortConfig, ServiceConfig};
use crate::core::authority::is_domain;

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid TLS configuration for port {port}: {message}")]
    InvalidTls { port: u16, message: String },

    #[error("Port {port} is declared more than once")]
    DuplicatePort { port: u16 },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Service configuration validator
pub struct ServiceConfigValidator;

impl ServiceConfigValidator {
    /// Validate the entire service configuration, reporting every problem
    /// found rather than stopping at the first.
    pub fn validate(config: &ServiceConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        let mut seen_ports = HashSet::new();
        for (section, port_config) in std::iter::once(("server", &config.server))
            .chain(config.listeners.iter().map(|l| ("listeners", l)))
        {
            if !seen_ports.insert(port_config.port) {
                errors.push(ValidationError::DuplicatePort {
                    port: port_config.port,
                });
            }
            if let Err(mut port_errors) = Self::validate_port_config(section, port_config) {
                errors.append(&mut port_errors);
            }
        }

        if let Some(contact) = &config.acme.contact {
            if !contact.contains('@') {
                errors.push(ValidationError::InvalidField {
                    field: "acme.contact".to_string(),
                    message: format!("'{contact}' does not look like an e-mail address"),
                });
            }
        }

        if !matches!(config.logging.format.as_str(), "text" | "json") {
            errors.push(ValidationError::InvalidField {
                field: "logging.format".to_string(),
                message: format!(
                    "'{}' is not a supported format (expected 'text' or 'json')",
                    config.logging.format
                ),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate one port record
    fn validate_port_config(
        section: &str,
        config: &PortConfig,
    ) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if config.port == 0 {
            errors.push(ValidationError::InvalidField {
                field: format!("{section}.port"),
                message: "Port must be greater than 0".to_string(),
            });
        }

        for location in &config.locations {
            if !Path::new(location).is_dir() {
                errors.push(ValidationError::InvalidField {
                    field: format!("{section}.locations"),
                    message: format!(
                        "Static root '{}' does not exist or is not a directory",
                        location.display()
                    ),
                });
            }
        }

        if let Some(page) = &config.page_404 {
            if !Path::new(page).is_file() {
                errors.push(ValidationError::InvalidField {
                    field: format!("{section}.page404"),
                    message: format!("Not-found page '{}' does not exist", page.display()),
                });
            }
        }

        if config.ssl.enabled {
            if config.ssl.hosts.is_empty() {
                errors.push(ValidationError::InvalidTls {
                    port: config.port,
                    message: "TLS is enabled but no hosts are configured".to_string(),
                });
            }
            for host in &config.ssl.hosts {
                if !is_domain(host.trim().to_lowercase().as_str()) {
                    errors.push(ValidationError::InvalidTls {
                        port: config.port,
                        message: format!(
                            "'{host}' is not a domain name a certificate can be issued for"
                        ),
                    });
                }
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::models::SslConfig;

    fn minimal_valid_config() -> ServiceConfig {
        ServiceConfig::default()
    }

    #[test]
    fn validate_accepts_default_config() {
        assert!(ServiceConfigValidator::validate(&minimal_valid_config()).is_ok());
    }

    #[test]
    fn validate_rejects_port_zero() {
        let mut config = minimal_valid_config();
        config.server.port = 0;

        assert!(ServiceConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn validate_rejects_duplicate_ports() {
        let mut config = minimal_valid_config();
        config.listeners.push(PortConfig::for_port(8080));
        config.listeners.push(PortConfig::for_port(8080));

        let err = ServiceConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("8080"));
    }

    #[test]
    fn validate_rejects_tls_without_hosts() {
        let mut config = minimal_valid_config();
        config.listeners.push(PortConfig {
            port: 8443,
            ssl: SslConfig {
                enabled: true,
                hosts: vec![],
            },
            ..PortConfig::default()
        });

        assert!(ServiceConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn validate_rejects_non_domain_tls_host() {
        let mut config = minimal_valid_config();
        config.listeners.push(PortConfig {
            port: 8443,
            ssl: SslConfig {
                enabled: true,
                hosts: vec!["127.0.0.1".to_string()],
            },
            ..PortConfig::default()
        });

        assert!(ServiceConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn validate_rejects_missing_static_root() {
        let mut config = minimal_valid_config();
        config.server.locations.push("definitely/not/here".into());

        let err = ServiceConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("Static root"));
    }

    #[test]
    fn validate_accepts_existing_static_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = minimal_valid_config();
        config.server.locations.push(dir.path().to_path_buf());

        assert!(ServiceConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn validate_rejects_bad_contact_and_format_together() {
        let mut config = minimal_valid_config();
        config.acme.contact = Some("not-an-email".to_string());
        config.logging.format = "xml".to_string();

        let err = ServiceConfigValidator::validate(&config).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("acme.contact"));
        assert!(message.contains("logging.format"));
    }
}
