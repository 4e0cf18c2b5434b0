//! Engine configuration.
//!
//! Defaults suit interactive use; every value can be overridden in code or
//! through `BLUEPRINT_*` environment variables (see [`EngineConfig::from_env`]).

use std::time::Duration;

use thiserror::Error;

use crate::consts::{
  DEFAULT_MAX_INCLUDE_DEPTH, ENV_CONCURRENCY, ENV_MAX_INCLUDE_DEPTH, ENV_PROVIDER_TIMEOUT, ENV_RUN_DEADLINE,
};

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("{var} must be a positive integer, got '{value}'")]
  InvalidNumber { var: &'static str, value: String },

  #[error("{var} must be a duration such as '30s' or '5m', got '{value}': {source}")]
  InvalidDuration {
    var: &'static str,
    value: String,
    #[source]
    source: humantime::DurationError,
  },
}

/// Exponential backoff for retryable provider errors.
///
/// Only applied when the caller supplies one; the engine never retries on
/// its own.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
  /// Total attempts including the first.
  pub max_attempts: u32,
  pub initial_delay: Duration,
  pub max_delay: Duration,
  pub multiplier: f64,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      initial_delay: Duration::from_millis(500),
      max_delay: Duration::from_secs(30),
      multiplier: 2.0,
    }
  }
}

impl RetryPolicy {
  /// Delay before retry number `attempt` (1 for the first retry).
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
    let delay = self.initial_delay.mul_f64(factor.max(0.0));
    delay.min(self.max_delay)
  }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
  /// Maximum number of elements staged or deployed at the same time.
  pub concurrency: usize,

  /// Timeout applied to each individual provider call.
  pub provider_call_timeout: Duration,

  /// Overall deadline for a deploy or destroy run.
  pub run_deadline: Option<Duration>,

  pub stabilisation_poll_interval: Duration,

  /// How long to wait for a resource to report it has stabilised.
  pub stabilisation_timeout: Duration,

  pub retry: Option<RetryPolicy>,

  pub max_include_depth: usize,

  /// Run the drift detector before staging and deploying existing instances.
  pub check_drift: bool,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      concurrency: num_cpus(),
      provider_call_timeout: Duration::from_secs(300),
      run_deadline: None,
      stabilisation_poll_interval: Duration::from_secs(5),
      stabilisation_timeout: Duration::from_secs(600),
      retry: None,
      max_include_depth: DEFAULT_MAX_INCLUDE_DEPTH,
      check_drift: true,
    }
  }
}

impl EngineConfig {
  /// Default configuration with overrides from the environment.
  ///
  /// # Errors
  ///
  /// Returns an error if a variable is set but cannot be parsed.
  pub fn from_env() -> Result<Self, ConfigError> {
    let mut config = Self::default();

    if let Some(value) = env_value(ENV_CONCURRENCY) {
      config.concurrency = parse_positive(ENV_CONCURRENCY, &value)?;
    }
    if let Some(value) = env_value(ENV_PROVIDER_TIMEOUT) {
      config.provider_call_timeout = parse_duration(ENV_PROVIDER_TIMEOUT, &value)?;
    }
    if let Some(value) = env_value(ENV_RUN_DEADLINE) {
      config.run_deadline = Some(parse_duration(ENV_RUN_DEADLINE, &value)?);
    }
    if let Some(value) = env_value(ENV_MAX_INCLUDE_DEPTH) {
      config.max_include_depth = parse_positive(ENV_MAX_INCLUDE_DEPTH, &value)?;
    }

    Ok(config)
  }
}

fn env_value(var: &str) -> Option<String> {
  std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn parse_positive(var: &'static str, value: &str) -> Result<usize, ConfigError> {
  match value.trim().parse::<usize>() {
    Ok(n) if n > 0 => Ok(n),
    _ => Err(ConfigError::InvalidNumber {
      var,
      value: value.to_string(),
    }),
  }
}

fn parse_duration(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
  humantime::parse_duration(value.trim()).map_err(|source| ConfigError::InvalidDuration {
    var,
    value: value.to_string(),
    source,
  })
}

/// Get the number of CPUs for default concurrency.
fn num_cpus() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}
