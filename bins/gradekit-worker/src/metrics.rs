// Prometheus metrics for test runs
//
// Created once at startup and handed to the pipeline; nothing in here is
// reachable through a global.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

const LABELS: &[&str] = &["job_owner", "course_code"];

/// Terminal (or starting) outcome of a test run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Started,
    Succeeded,
    FailedWithoutOutput,
    FailedWithOutput,
    ExtractionFailed,
}

pub struct Metrics {
    registry: Registry,
    tests_started: IntCounterVec,
    tests_succeeded: IntCounterVec,
    tests_failed: IntCounterVec,
    tests_failed_with_output: IntCounterVec,
    tests_failed_extract_results: IntCounterVec,
    test_execution_time: HistogramVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounterVec> {
            let counter = IntCounterVec::new(Opts::new(name, help), LABELS)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let tests_started = counter("gradekit_tests_started_total", "Test runs started")?;
        let tests_succeeded = counter("gradekit_tests_succeeded_total", "Test runs completed")?;
        let tests_failed = counter(
            "gradekit_tests_failed_total",
            "Test runs that failed without output",
        )?;
        let tests_failed_with_output = counter(
            "gradekit_tests_failed_with_output_total",
            "Test runs that failed but produced output",
        )?;
        let tests_failed_extract_results = counter(
            "gradekit_tests_failed_extract_results_total",
            "Test runs whose score extraction reported errors",
        )?;

        let test_execution_time = HistogramVec::new(
            HistogramOpts::new(
                "gradekit_test_execution_time_seconds",
                "Wall-clock time spent executing tests",
            )
            .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]),
            LABELS,
        )?;
        registry.register(Box::new(test_execution_time.clone()))?;

        Ok(Self {
            registry,
            tests_started,
            tests_succeeded,
            tests_failed,
            tests_failed_with_output,
            tests_failed_extract_results,
            test_execution_time,
        })
    }

    /// Record one outcome for (job owner, course code)
    pub fn record(&self, outcome: Outcome, job_owner: &str, course_code: &str) {
        self.counter(outcome)
            .with_label_values(&[job_owner, course_code])
            .inc();
    }

    pub fn observe_execution(&self, job_owner: &str, course_code: &str, elapsed: Duration) {
        self.test_execution_time
            .with_label_values(&[job_owner, course_code])
            .observe(elapsed.as_secs_f64());
    }

    /// Current value of an outcome counter
    pub fn count(&self, outcome: Outcome, job_owner: &str, course_code: &str) -> u64 {
        self.counter(outcome)
            .with_label_values(&[job_owner, course_code])
            .get()
    }

    fn counter(&self, outcome: Outcome) -> &IntCounterVec {
        match outcome {
            Outcome::Started => &self.tests_started,
            Outcome::Succeeded => &self.tests_succeeded,
            Outcome::FailedWithoutOutput => &self.tests_failed,
            Outcome::FailedWithOutput => &self.tests_failed_with_output,
            Outcome::ExtractionFailed => &self.tests_failed_extract_results,
        }
    }

    /// Render metrics in Prometheus text format
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(err) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %err, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}
