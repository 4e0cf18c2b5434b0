//! Crate-wide constants.

/// Length of the truncated hex digest used for spec hashes and changeset ids.
pub const HASH_PREFIX_LEN: usize = 20;

/// Default limit on how deeply child blueprints may include each other.
pub const DEFAULT_MAX_INCLUDE_DEPTH: usize = 5;

/// Environment variable overriding the element concurrency limit.
pub const ENV_CONCURRENCY: &str = "BLUEPRINT_CONCURRENCY";

/// Environment variable overriding the per provider call timeout.
pub const ENV_PROVIDER_TIMEOUT: &str = "BLUEPRINT_PROVIDER_TIMEOUT";

/// Environment variable setting an overall deadline for a deploy or destroy run.
pub const ENV_RUN_DEADLINE: &str = "BLUEPRINT_RUN_DEADLINE";

/// Environment variable overriding the maximum child include depth.
pub const ENV_MAX_INCLUDE_DEPTH: &str = "BLUEPRINT_MAX_INCLUDE_DEPTH";
