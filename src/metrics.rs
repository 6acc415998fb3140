//! Prometheus metrics for the self-modification pipeline.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup. The recording helpers
//! (`record_validation`, `record_outcome`, …) are no-ops until then, so
//! library users that never initialise metrics pay nothing.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `self_rewrite_validations_total` | Counter | `mode`, `outcome` |
//! | `self_rewrite_validation_duration_seconds` | Histogram | `mode` |
//! | `self_rewrite_pipeline_outcomes_total` | Counter | `operation`, `outcome` |
//! | `self_rewrite_swap_failures_total` | Counter | `kind` |
//! | `self_rewrite_scheduler_runs_total` | Counter | `task`, `result` |

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    core::Collector, CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

use crate::RewriteError;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All metrics, stored together in one [`OnceLock`].
pub struct Metrics {
    /// Registry owning every descriptor below.
    pub registry: Registry,
    /// Validation outcomes by mode (`file`, `tree`, `patch`).
    pub validations_total: CounterVec,
    /// Time spent compile-checking, by mode.
    pub validation_duration: HistogramVec,
    /// Final pipeline outcomes by operation.
    pub outcomes_total: CounterVec,
    /// Backup or overwrite failures.
    pub swap_failures_total: CounterVec,
    /// Scheduler task runs by result (`ok`, `failed`).
    pub scheduler_runs_total: CounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn registered<C>(registry: &Registry, collector: Result<C, prometheus::Error>) -> Result<C, RewriteError>
where
    C: Collector + Clone + 'static,
{
    let collector = collector.map_err(|e| RewriteError::Other(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| RewriteError::Other(format!("metrics registration failed: {e}")))?;
    Ok(collector)
}

fn build(prefix: &str) -> Result<Metrics, RewriteError> {
    let registry = Registry::new();
    let name = |suffix: &str| format!("{prefix}_{suffix}");

    let validations_total = registered(
        &registry,
        CounterVec::new(
            Opts::new(name("validations_total"), "Sandbox validation outcomes"),
            &["mode", "outcome"],
        ),
    )?;
    let validation_duration = registered(
        &registry,
        HistogramVec::new(
            HistogramOpts::new(name("validation_duration_seconds"), "Sandbox validation duration"),
            &["mode"],
        ),
    )?;
    let outcomes_total = registered(
        &registry,
        CounterVec::new(
            Opts::new(name("pipeline_outcomes_total"), "Pipeline outcomes by operation"),
            &["operation", "outcome"],
        ),
    )?;
    let swap_failures_total = registered(
        &registry,
        CounterVec::new(
            Opts::new(name("swap_failures_total"), "Backup and overwrite failures"),
            &["kind"],
        ),
    )?;
    let scheduler_runs_total = registered(
        &registry,
        CounterVec::new(
            Opts::new(name("scheduler_runs_total"), "Scheduler task runs"),
            &["task", "result"],
        ),
    )?;

    Ok(Metrics {
        registry,
        validations_total,
        validation_duration,
        outcomes_total,
        swap_failures_total,
        scheduler_runs_total,
    })
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all metrics. A second call is a no-op.
///
/// # Errors
///
/// [`RewriteError::Other`] if a descriptor is invalid or registered twice.
pub fn init_metrics() -> Result<(), RewriteError> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    // A racing initialiser builds identical descriptors; first one wins.
    let _ = METRICS.set(build("self_rewrite")?);
    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Recording helpers ──────────────────────────────────────────────────────

/// Count one validation and its duration.
pub fn record_validation(mode: &str, outcome: &str, elapsed: Duration) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.validations_total.get_metric_with_label_values(&[mode, outcome]) {
            c.inc();
        }
        if let Ok(h) = m.validation_duration.get_metric_with_label_values(&[mode]) {
            h.observe(elapsed.as_secs_f64());
        }
    }
}

/// Count one finished pipeline operation.
pub fn record_outcome(operation: &str, outcome: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.outcomes_total.get_metric_with_label_values(&[operation, outcome]) {
            c.inc();
        }
    }
}

/// Count one backup (`backup`) or overwrite (`swap`) failure.
pub fn record_swap_failure(kind: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.swap_failures_total.get_metric_with_label_values(&[kind]) {
            c.inc();
        }
    }
}

/// Count one scheduler task run.
pub fn record_task_run(task: &str, ok: bool) {
    if let Some(m) = metrics() {
        let result = if ok { "ok" } else { "failed" };
        if let Ok(c) = m.scheduler_runs_total.get_metric_with_label_values(&[task, result]) {
            c.inc();
        }
    }
}

// ── Export ─────────────────────────────────────────────────────────────────

/// Encode every metric in the Prometheus text format.
///
/// Empty if metrics were never initialised or encoding fails.
pub fn gather_metrics() -> String {
    let Some(m) = metrics() else {
        return String::new();
    };
    let families = m.registry.gather();
    let mut buffer = Vec::new();
    if TextEncoder::new().encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Counter snapshot for the `status` command.
#[derive(Debug, Default)]
pub struct MetricsSummary {
    /// Pipeline outcomes keyed by `"operation:outcome"`.
    pub outcomes: HashMap<String, u64>,
    /// Scheduler runs keyed by `"task:result"`.
    pub scheduler_runs: HashMap<String, u64>,
    /// Swap failures keyed by kind.
    pub swap_failures: HashMap<String, u64>,
}

fn counter_values(vec: &CounterVec, labels: &[&str]) -> HashMap<String, u64> {
    let mut out = HashMap::new();
    for family in vec.collect() {
        for metric in family.get_metric() {
            let key = labels
                .iter()
                .map(|name| {
                    metric
                        .get_label()
                        .iter()
                        .find(|l| l.get_name() == *name)
                        .map_or("unknown", |l| l.get_value())
                })
                .collect::<Vec<_>>()
                .join(":");
            out.insert(key, metric.get_counter().get_value() as u64);
        }
    }
    out
}

/// Current counter values; zeroed if metrics were never initialised.
pub fn get_metrics_summary() -> MetricsSummary {
    let Some(m) = metrics() else {
        return MetricsSummary::default();
    };
    MetricsSummary {
        outcomes: counter_values(&m.outcomes_total, &["operation", "outcome"]),
        scheduler_runs: counter_values(&m.scheduler_runs_total, &["task", "result"]),
        swap_failures: counter_values(&m.swap_failures_total, &["kind"]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
    }

    #[test]
    fn test_isolated_bundle_counts_validations() {
        let m = build("t_validation").expect("test: build");
        m.validations_total
            .get_metric_with_label_values(&["tree", "rejected_parse"])
            .expect("test: labels")
            .inc();
        m.validation_duration
            .get_metric_with_label_values(&["tree"])
            .expect("test: labels")
            .observe(0.25);

        let families = m.registry.gather();
        let counter = families
            .iter()
            .find(|f| f.get_name() == "t_validation_validations_total")
            .expect("test: family");
        assert!((counter.get_metric()[0].get_counter().get_value() - 1.0).abs() < f64::EPSILON);
        let histogram = families
            .iter()
            .find(|f| f.get_name() == "t_validation_validation_duration_seconds")
            .expect("test: family");
        assert_eq!(histogram.get_metric()[0].get_histogram().get_sample_count(), 1);
    }

    #[test]
    fn test_counter_values_joins_labels() {
        let m = build("t_summary").expect("test: build");
        m.scheduler_runs_total
            .get_metric_with_label_values(&["self_check", "failed"])
            .expect("test: labels")
            .inc_by(3.0);
        let values = counter_values(&m.scheduler_runs_total, &["task", "result"]);
        assert_eq!(values.get("self_check:failed"), Some(&3));
    }

    #[test]
    fn test_global_helpers_show_up_in_text_export() {
        let _ = init_metrics();
        record_outcome("improve", "applied");
        record_task_run("export-test", true);
        let text = gather_metrics();
        assert!(text.contains("self_rewrite_pipeline_outcomes_total"));
        let summary = get_metrics_summary();
        assert!(summary.scheduler_runs.get("export-test:ok").copied().unwrap_or(0) >= 1);
    }
}
