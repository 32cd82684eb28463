//! Configuration validation module.
//!
//! Collects every problem in one pass so startup fails with the full list
//! instead of one error at a time.

use crate::HopperConfig;
use std::fmt;
use url::Url;

/// Configuration validation error variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValidationError {
    /// No queue is declared.
    NoQueues,
    /// The default queue is not in the queue catalogue.
    UnknownDefaultQueue { name: String },
    /// A concurrency value is zero.
    ZeroConcurrency { scope: String },
    /// Global concurrency cap is zero.
    ZeroGlobalConcurrency { queue: String },
    /// The application key is empty.
    MissingAppKey,
    /// The application key is too short.
    AppKeyTooShort { actual: usize, minimum: usize },
    /// Connection URL cannot be parsed.
    InvalidUrl { message: String },
    /// Connection pool size is zero.
    ZeroPoolSize,
    /// Timeout value must be positive.
    NonPositiveTimeout { name: String },
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoQueues => write!(f, "At least one queue must be declared"),
            Self::UnknownDefaultQueue { name } => {
                write!(f, "Default queue '{}' is not declared in queue.queues", name)
            }
            Self::ZeroConcurrency { scope } => {
                write!(f, "Concurrency for {} must be greater than zero", scope)
            }
            Self::ZeroGlobalConcurrency { queue } => {
                write!(f, "Global concurrency for queue '{}' must be greater than zero", queue)
            }
            Self::MissingAppKey => write!(f, "app.key is required"),
            Self::AppKeyTooShort { actual, minimum } => {
                write!(
                    f,
                    "app.key too short: {} characters (minimum {})",
                    actual, minimum
                )
            }
            Self::InvalidUrl { message } => write!(f, "Invalid connection URL: {}", message),
            Self::ZeroPoolSize => write!(f, "connection.pool_size must be greater than zero"),
            Self::NonPositiveTimeout { name } => write!(f, "{} must be greater than zero", name),
        }
    }
}

impl std::error::Error for ConfigValidationError {}

/// Result of configuration validation containing all errors found.
#[derive(Debug)]
pub struct ValidationResult {
    errors: Vec<ConfigValidationError>,
}

impl ValidationResult {
    fn new() -> Self {
        Self { errors: Vec::new() }
    }

    fn add_error(&mut self, error: ConfigValidationError) {
        self.errors.push(error);
    }

    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the validation errors.
    pub fn errors(&self) -> &[ConfigValidationError] {
        &self.errors
    }

    /// Converts to Result, returning Err with all errors if any exist.
    pub fn into_result(self) -> Result<(), Vec<ConfigValidationError>> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors)
        }
    }
}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Minimum application key length.
    pub const MIN_APP_KEY_LENGTH: usize = 16;

    /// Validates the entire configuration.
    pub fn validate(config: &HopperConfig) -> Result<(), Vec<ConfigValidationError>> {
        Self::check(config).into_result()
    }

    /// Runs every check and returns the collected result.
    pub fn check(config: &HopperConfig) -> ValidationResult {
        let mut result = ValidationResult::new();

        Self::validate_app(config, &mut result);
        Self::validate_queues(config, &mut result);
        Self::validate_worker(config, &mut result);
        Self::validate_connection(config, &mut result);

        result
    }

    fn validate_app(config: &HopperConfig, result: &mut ValidationResult) {
        let key_len = config.app.key.len();
        if key_len == 0 {
            result.add_error(ConfigValidationError::MissingAppKey);
        } else if key_len < Self::MIN_APP_KEY_LENGTH {
            result.add_error(ConfigValidationError::AppKeyTooShort {
                actual: key_len,
                minimum: Self::MIN_APP_KEY_LENGTH,
            });
        }
    }

    fn validate_queues(config: &HopperConfig, result: &mut ValidationResult) {
        let queues = &config.queue;
        if queues.queues.is_empty() {
            result.add_error(ConfigValidationError::NoQueues);
            return;
        }

        if !queues.contains(&queues.default_queue) {
            result.add_error(ConfigValidationError::UnknownDefaultQueue {
                name: queues.default_queue.clone(),
            });
        }

        for (name, options) in &queues.queues {
            if options.concurrency == Some(0) {
                result.add_error(ConfigValidationError::ZeroConcurrency {
                    scope: format!("queue '{}'", name),
                });
            }
            if options.global_concurrency == Some(0) {
                result.add_error(ConfigValidationError::ZeroGlobalConcurrency {
                    queue: name.clone(),
                });
            }
        }
    }

    fn validate_worker(config: &HopperConfig, result: &mut ValidationResult) {
        if config.worker.concurrency == 0 {
            result.add_error(ConfigValidationError::ZeroConcurrency {
                scope: "worker".to_string(),
            });
        }
        if config.worker.block_timeout_ms == 0 {
            result.add_error(ConfigValidationError::NonPositiveTimeout {
                name: "worker.block_timeout_ms".to_string(),
            });
        }
    }

    fn validate_connection(config: &HopperConfig, result: &mut ValidationResult) {
        let connection = &config.connection;
        if let Err(e) = Url::parse(&connection.url) {
            result.add_error(ConfigValidationError::InvalidUrl {
                message: e.to_string(),
            });
        }
        if connection.pool_size == 0 {
            result.add_error(ConfigValidationError::ZeroPoolSize);
        }
        if connection.connect_timeout_secs == 0 {
            result.add_error(ConfigValidationError::NonPositiveTimeout {
                name: "connection.connect_timeout_secs".to_string(),
            });
        }
    }
}
