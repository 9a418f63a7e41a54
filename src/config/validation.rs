use std::{collections::HashSet, net::SocketAddr};

use crate::config::models::{EndpointSpec, RevolverConfig, ServiceConfig};

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

    #[error("Service '{service}' misconfigured: {message}")]
    InvalidService { service: String, message: String },

    #[error("API '{service}.{api}' misconfigured: {message}")]
    InvalidApi {
        service: String,
        api: String,
        message: String,
    },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Gateway configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the entire gateway configuration.
    pub fn validate(config: &RevolverConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if config.services.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "services".to_string(),
            });
        }

        let mut seen_services = HashSet::new();
        for service in &config.services {
            let name = &service.settings().service;
            if !seen_services.insert(name.clone()) {
                errors.push(ValidationError::InvalidService {
                    service: name.clone(),
                    message: "duplicate service name".to_string(),
                });
            }
            Self::validate_service(config, service, &mut errors);
        }

        if config.dynamic_config && config.dynamic_config_url.is_none() {
            errors.push(ValidationError::MissingField {
                field: "dynamic_config_url".to_string(),
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

    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_service(
        config: &RevolverConfig,
        service: &ServiceConfig,
        errors: &mut Vec<ValidationError>,
    ) {
        let settings = service.settings();
        let name = settings.service.clone();

        match &settings.endpoint {
            EndpointSpec::Simple { endpoints } => {
                if endpoints.is_empty() {
                    errors.push(ValidationError::InvalidService {
                        service: name.clone(),
                        message: "simple endpoint spec needs at least one endpoint".to_string(),
                    });
                }
                for endpoint in endpoints {
                    if Self::split_host_port(endpoint).is_none() {
                        errors.push(ValidationError::InvalidService {
                            service: name.clone(),
                            message: format!("endpoint '{endpoint}' must be 'host:port'"),
                        });
                    }
                }
            }
            EndpointSpec::Watched { .. } => {
                if !config.service_resolver.use_watcher {
                    errors.push(ValidationError::InvalidService {
                        service: name.clone(),
                        message: "watched endpoint spec requires service_resolver.use_watcher"
                            .to_string(),
                    });
                }
            }
        }

        if settings.apis.is_empty() {
            errors.push(ValidationError::InvalidService {
                service: name.clone(),
                message: "a service must define at least one API".to_string(),
            });
        }

        let mut seen_apis = HashSet::new();
        for api in &settings.apis {
            if !seen_apis.insert(api.api.clone()) {
                errors.push(ValidationError::InvalidApi {
                    service: name.clone(),
                    api: api.api.clone(),
                    message: "duplicate API name".to_string(),
                });
            }
            Self::validate_api(&name, api, errors);
        }
    }

    fn validate_api(
        service: &str,
        api: &crate::config::models::ApiConfig,
        errors: &mut Vec<ValidationError>,
    ) {
        if !api.path.starts_with('/') {
            errors.push(ValidationError::InvalidApi {
                service: service.to_string(),
                api: api.api.clone(),
                message: "path templates must start with '/'".to_string(),
            });
        }

        if api.methods.is_empty() {
            errors.push(ValidationError::InvalidApi {
                service: service.to_string(),
                api: api.api.clone(),
                message: "at least one HTTP method is required".to_string(),
            });
        }

        // Two parameter segments sharing a name would produce an ambiguous
        // capture, so templates like /a/{id}/b/{id} are rejected outright.
        let mut seen_params = HashSet::new();
        for segment in api.path.split('/') {
            if let Some(param) = segment
                .strip_prefix('{')
                .and_then(|rest| rest.strip_suffix('}'))
            {
                if param.is_empty() {
                    errors.push(ValidationError::InvalidApi {
                        service: service.to_string(),
                        api: api.api.clone(),
                        message: "empty parameter segment '{}' in path template".to_string(),
                    });
                } else if !seen_params.insert(param.to_string()) {
                    errors.push(ValidationError::InvalidApi {
                        service: service.to_string(),
                        api: api.api.clone(),
                        message: format!("duplicate path parameter '{{{param}}}'"),
                    });
                }
            }
        }

        if let Some(runtime) = &api.runtime {
            if runtime.concurrency == 0 {
                errors.push(ValidationError::InvalidApi {
                    service: service.to_string(),
                    api: api.api.clone(),
                    message: "concurrency must be greater than 0".to_string(),
                });
            }
            if runtime.circuit.error_threshold_percent > 100 {
                errors.push(ValidationError::InvalidApi {
                    service: service.to_string(),
                    api: api.api.clone(),
                    message: "circuit.error_threshold_percent must be <= 100".to_string(),
                });
            }
            if runtime.circuit.request_volume == 0 {
                errors.push(ValidationError::InvalidApi {
                    service: service.to_string(),
                    api: api.api.clone(),
                    message: "circuit.request_volume must be greater than 0".to_string(),
                });
            }
        }
    }

    fn split_host_port(endpoint: &str) -> Option<(&str, u16)> {
        let (host, port) = endpoint.rsplit_once(':')?;
        if host.is_empty() {
            return None;
        }
        port.parse::<u16>().ok().map(|p| (host, p))
    }

    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        let mut out = format!("{} error(s):", errors.len());
        for (i, error) in errors.iter().enumerate() {
            out.push_str(&format!("\n  {}. {error}", i + 1));
        }
        out
    }
}
