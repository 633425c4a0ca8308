use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Which sandbox backend executes test runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerKind {
    /// Plain child process on the host; for development and tests
    Local,
    /// Docker container with the run directory bind-mounted
    Docker,
}

impl FromStr for RunnerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(RunnerKind::Local),
            "docker" => Ok(RunnerKind::Docker),
            other => Err(format!("unknown runner: {}", other)),
        }
    }
}

/// Application configuration
/// Provides defaults with environment variable overrides
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub runner: RunnerKind,
    pub default_image: String,
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub scm_base_url: String,
    pub memory_limit_mb: u64,
    pub cpu_limit: f64,
    pub sandbox_network: bool,
    /// Upper bound on captured output per run; the rest is discarded
    pub max_output_bytes: usize,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    /// Missing or unparseable values fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            redis_url: lookup("REDIS_URL")
                .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
            runner: parsed(&lookup, "GRADEKIT_RUNNER").unwrap_or(RunnerKind::Docker),
            default_image: lookup("GRADEKIT_DEFAULT_IMAGE")
                .unwrap_or_else(|| "gradekit/runner:latest".to_string()),
            default_timeout_ms: parsed(&lookup, "DEFAULT_TIMEOUT_MS").unwrap_or(600_000),
            max_timeout_ms: parsed(&lookup, "MAX_TIMEOUT_MS").unwrap_or(3_600_000),
            scm_base_url: lookup("GRADEKIT_SCM_BASE_URL")
                .unwrap_or_else(|| "https://github.com".to_string()),
            memory_limit_mb: parsed(&lookup, "GRADEKIT_MEMORY_LIMIT_MB").unwrap_or(1024),
            cpu_limit: parsed(&lookup, "GRADEKIT_CPU_LIMIT").unwrap_or(1.0),
            sandbox_network: parsed(&lookup, "GRADEKIT_SANDBOX_NETWORK").unwrap_or(false),
            max_output_bytes: parsed(&lookup, "GRADEKIT_MAX_OUTPUT_BYTES").unwrap_or(1 << 20),
        }
    }

    /// Deadline for an assignment, clamped to the configured maximum
    pub fn deadline(&self, requested_ms: Option<u64>) -> Duration {
        let ms = requested_ms
            .filter(|ms| *ms > 0)
            .unwrap_or(self.default_timeout_ms)
            .min(self.max_timeout_ms);
        Duration::from_millis(ms)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.parse().ok())
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}
