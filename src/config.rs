use crate::error::OrchestrationError;
use crate::retry::RetryPolicy;
use crate::step::PipelineStep;
use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

/// Process-wide configuration for the orchestration engine.
///
/// Loaded once at startup, either from [`OrchestratorConfig::default`] or
/// from `DOCFLOW_*` environment variables via
/// [`OrchestratorConfig::from_env`], then passed by reference to the
/// components that need it. Interval-valued settings are expressed in
/// seconds in the environment.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Attempts per step before giving up. Default: 3.
    pub max_retry_attempts: u32,
    /// Backoff delay after the first failure. Default: 5s.
    pub initial_retry_interval: Duration,
    /// Backoff delay ceiling. Default: 300s.
    pub max_retry_interval: Duration,
    /// Wall-clock timeout for steps without an override. Default: 600s.
    pub default_step_timeout: Duration,
    /// Per-step timeout overrides.
    pub step_timeouts: BTreeMap<PipelineStep, Duration>,
    /// Ceiling on total processing time since upload. Default: 3600s.
    pub workflow_execution_timeout: Duration,
    /// Concurrent step executions across all workflows. Default: 10.
    pub max_concurrent_activities: usize,
    /// Concurrent workflow resumptions. Default: 5.
    pub max_concurrent_workflows: usize,
    /// Work queue depth before enqueues are rejected as busy. Default: 1024.
    pub queue_capacity: usize,
    /// How long a per-document lease remains valid before a new worker may
    /// reclaim it. Default: 30s.
    pub lease_ttl: Duration,
    /// Fallback poll interval of the worker pool when the queue is idle.
    /// Default: 50ms.
    pub poll_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let mut step_timeouts = BTreeMap::new();
        step_timeouts.insert(PipelineStep::TextExtraction, Duration::from_secs(600));
        step_timeouts.insert(PipelineStep::Chunking, Duration::from_secs(300));
        step_timeouts.insert(PipelineStep::Classification, Duration::from_secs(300));
        step_timeouts.insert(PipelineStep::Vectorization, Duration::from_secs(600));
        step_timeouts.insert(PipelineStep::Summarization, Duration::from_secs(300));
        Self {
            max_retry_attempts: 3,
            initial_retry_interval: Duration::from_secs(5),
            max_retry_interval: Duration::from_secs(300),
            default_step_timeout: Duration::from_secs(600),
            step_timeouts,
            workflow_execution_timeout: Duration::from_secs(3600),
            max_concurrent_activities: 10,
            max_concurrent_workflows: 5,
            queue_capacity: 1024,
            lease_ttl: Duration::from_secs(30),
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl OrchestratorConfig {
    /// Loads configuration from the environment, falling back to defaults
    /// for absent variables.
    ///
    /// Recognized variables: `DOCFLOW_MAX_RETRY_ATTEMPTS`,
    /// `DOCFLOW_INITIAL_RETRY_INTERVAL`, `DOCFLOW_MAX_RETRY_INTERVAL`,
    /// `DOCFLOW_STEP_TIMEOUT`, `DOCFLOW_WORKFLOW_EXECUTION_TIMEOUT`
    /// (seconds), `DOCFLOW_MAX_CONCURRENT_ACTIVITIES`,
    /// `DOCFLOW_MAX_CONCURRENT_WORKFLOWS`, `DOCFLOW_QUEUE_CAPACITY`,
    /// `DOCFLOW_LEASE_TTL` (seconds).
    ///
    /// # Errors
    ///
    /// Returns [`OrchestrationError::Configuration`] when a variable is
    /// present but cannot be parsed.
    pub fn from_env() -> Result<Self, OrchestrationError> {
        let defaults = Self::default();
        Ok(Self {
            max_retry_attempts: load_parsed(
                "DOCFLOW_MAX_RETRY_ATTEMPTS",
                defaults.max_retry_attempts,
            )?,
            initial_retry_interval: load_secs(
                "DOCFLOW_INITIAL_RETRY_INTERVAL",
                defaults.initial_retry_interval,
            )?,
            max_retry_interval: load_secs("DOCFLOW_MAX_RETRY_INTERVAL", defaults.max_retry_interval)?,
            default_step_timeout: load_secs("DOCFLOW_STEP_TIMEOUT", defaults.default_step_timeout)?,
            step_timeouts: defaults.step_timeouts,
            workflow_execution_timeout: load_secs(
                "DOCFLOW_WORKFLOW_EXECUTION_TIMEOUT",
                defaults.workflow_execution_timeout,
            )?,
            max_concurrent_activities: load_parsed(
                "DOCFLOW_MAX_CONCURRENT_ACTIVITIES",
                defaults.max_concurrent_activities,
            )?,
            max_concurrent_workflows: load_parsed(
                "DOCFLOW_MAX_CONCURRENT_WORKFLOWS",
                defaults.max_concurrent_workflows,
            )?,
            queue_capacity: load_parsed("DOCFLOW_QUEUE_CAPACITY", defaults.queue_capacity)?,
            lease_ttl: load_secs("DOCFLOW_LEASE_TTL", defaults.lease_ttl)?,
            poll_interval: defaults.poll_interval,
        })
    }

    /// The wall-clock timeout for a step, honoring overrides.
    pub fn step_timeout(&self, step: PipelineStep) -> Duration {
        self.step_timeouts
            .get(&step)
            .copied()
            .unwrap_or(self.default_step_timeout)
    }

    /// The retry policy derived from this configuration.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retry_attempts,
            self.initial_retry_interval,
            self.max_retry_interval,
        )
    }
}

fn load_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T, OrchestrationError> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map_err(|_| OrchestrationError::Configuration(format!("invalid value for {key}"))),
        _ => Ok(default),
    }
}

fn load_secs(key: &str, default: Duration) -> Result<Duration, OrchestrationError> {
    Ok(Duration::from_secs(load_parsed(
        key,
        default.as_secs(),
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env vars are process-global; serialize the tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_defaults_mirror_pipeline_timeouts() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_retry_attempts, 3);
        assert_eq!(
            config.step_timeout(PipelineStep::TextExtraction),
            Duration::from_secs(600)
        );
        assert_eq!(
            config.step_timeout(PipelineStep::Chunking),
            Duration::from_secs(300)
        );
        assert_eq!(
            config.step_timeout(PipelineStep::Vectorization),
            Duration::from_secs(600)
        );
    }

    #[test]
    fn test_step_timeout_falls_back_to_default() {
        let mut config = OrchestratorConfig::default();
        config.step_timeouts.clear();
        config.default_step_timeout = Duration::from_secs(42);
        assert_eq!(
            config.step_timeout(PipelineStep::Summarization),
            Duration::from_secs(42)
        );
    }

    #[test]
    fn test_from_env_reads_overrides() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("DOCFLOW_MAX_RETRY_ATTEMPTS", "5");
        env::set_var("DOCFLOW_INITIAL_RETRY_INTERVAL", "1");
        let config = OrchestratorConfig::from_env().unwrap();
        assert_eq!(config.max_retry_attempts, 5);
        assert_eq!(config.initial_retry_interval, Duration::from_secs(1));
        env::remove_var("DOCFLOW_MAX_RETRY_ATTEMPTS");
        env::remove_var("DOCFLOW_INITIAL_RETRY_INTERVAL");
    }

    #[test]
    fn test_from_env_rejects_garbage() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("DOCFLOW_QUEUE_CAPACITY", "not-a-number");
        let result = OrchestratorConfig::from_env();
        env::remove_var("DOCFLOW_QUEUE_CAPACITY");
        assert!(matches!(
            result,
            Err(OrchestrationError::Configuration(_))
        ));
    }

    #[test]
    fn test_retry_policy_from_config() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.retry_policy().max_attempts(), 3);
    }
}
