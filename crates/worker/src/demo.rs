//! Load-driving demo run
//!
//! Submits a burst of report jobs to the core, logs core statistics while
//! they run, and summarizes the outcomes.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use bulwark_core::{CancelContext, Job, JobError, SubmitError, TaskCore};

/// Demo configuration
#[derive(Debug, Clone, Serialize)]
pub struct DemoConfig {
    /// Number of report jobs to submit
    pub jobs: usize,
    /// Distinct tenants the reports are spread over
    pub tenants: usize,
    /// Probability that a downstream call fails
    pub failure_rate: f64,
    /// Simulated downstream latency
    pub downstream_latency: Duration,
    /// How often core statistics are logged
    pub stats_interval: Duration,
    /// Wait for rate tokens instead of shedding load
    pub wait_for_tokens: bool,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            jobs: 10_000,
            tenants: 32,
            failure_rate: 0.05,
            downstream_latency: Duration::from_millis(2),
            stats_interval: Duration::from_secs(1),
            wait_for_tokens: false,
        }
    }
}

impl DemoConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `BULWARK_DEMO_JOBS`: Jobs to submit (default: 10000)
    /// - `BULWARK_DEMO_TENANTS`: Distinct tenants (default: 32)
    /// - `BULWARK_DEMO_FAILURE_RATE`: Downstream failure probability (default: 0.05)
    /// - `BULWARK_DEMO_LATENCY_MS`: Downstream latency (default: 2)
    /// - `BULWARK_STATS_INTERVAL_MS`: Stats logging interval (default: 1000)
    /// - `BULWARK_DEMO_WAIT_FOR_TOKENS`: "true" to wait on the rate limiter
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            jobs: env_parse("BULWARK_DEMO_JOBS").unwrap_or(defaults.jobs),
            tenants: env_parse::<usize>("BULWARK_DEMO_TENANTS")
                .unwrap_or(defaults.tenants)
                .max(1),
            failure_rate: env_parse("BULWARK_DEMO_FAILURE_RATE").unwrap_or(defaults.failure_rate),
            downstream_latency: env_parse("BULWARK_DEMO_LATENCY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.downstream_latency),
            stats_interval: env_parse("BULWARK_STATS_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.stats_interval),
            wait_for_tokens: std::env::var("BULWARK_DEMO_WAIT_FOR_TOKENS")
                .map(|v| v.to_lowercase() == "true")
                .unwrap_or(defaults.wait_for_tokens),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Outcome counts of a demo run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DemoSummary {
    pub submitted: usize,
    pub rate_limited: usize,
    pub queue_full: usize,
    pub succeeded: usize,
    pub downstream_failed: usize,
    pub breaker_open: usize,
    pub panicked: usize,
    pub cancelled: usize,
    pub other_failures: usize,
}

impl DemoSummary {
    fn record(&mut self, outcome: &Result<serde_json::Value, JobError>) {
        match outcome {
            Ok(_) => self.succeeded += 1,
            Err(JobError::Downstream(_)) => self.downstream_failed += 1,
            Err(JobError::BreakerOpen) => self.breaker_open += 1,
            Err(JobError::Panicked(_)) => self.panicked += 1,
            Err(JobError::Cancelled(_) | JobError::Dropped) => self.cancelled += 1,
            Err(JobError::Failed(_)) => self.other_failures += 1,
        }
    }
}

/// Submit the configured burst and wait for every accepted job
pub async fn run_demo(core: &TaskCore, config: &DemoConfig, ctx: &CancelContext) -> DemoSummary {
    let mut summary = DemoSummary::default();
    let mut tickets = Vec::with_capacity(config.jobs);

    for seq in 0..config.jobs {
        let report = Job::new(json!({
            "tenant": format!("tenant-{}", seq % config.tenants),
            "seq": seq,
            "panel": {"hb": 13.2, "wbc": 6.1, "plt": 250},
        }));

        let submitted = if config.wait_for_tokens {
            core.submit_wait(report, ctx).await
        } else {
            core.submit(report, ctx)
        };

        match submitted {
            Ok(ticket) => {
                summary.submitted += 1;
                tickets.push(ticket);
            }
            Err(SubmitError::RateLimited) => summary.rate_limited += 1,
            Err(SubmitError::QueueFull) => {
                summary.queue_full += 1;
                // Let workers catch up instead of spinning on a full queue
                tokio::task::yield_now().await;
            }
            Err(e @ (SubmitError::QueueClosed | SubmitError::Cancelled(_))) => {
                warn!(error = %e, submitted = summary.submitted, "Stopping submissions");
                break;
            }
        }
    }

    for outcome in join_all(tickets.into_iter().map(|t| t.wait())).await {
        summary.record(&outcome);
    }
    summary
}

/// Log core statistics every `interval` until `ctx` ends
pub fn spawn_stats_reporter(
    core: Arc<TaskCore>,
    interval: Duration,
    ctx: CancelContext,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = core.stats();
                    info!(
                        queue_depth = stats.workers.queue_depth,
                        busy = stats.workers.busy,
                        idle = stats.workers.idle,
                        tokens = stats.tokens_available,
                        breaker = %stats.breaker.state,
                        accepted = stats.admission.accepted,
                        completed = stats.workers.completed,
                        failed = stats.workers.failed,
                        "Core stats"
                    );
                }
                _ = ctx.done() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use bulwark_core::CoreConfig;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = DemoConfig::default();
        assert_eq!(config.jobs, 10_000);
        assert!(!config.wait_for_tokens);
    }

    #[tokio::test]
    async fn test_run_demo_counts_every_outcome() {
        let core = TaskCore::new(
            CoreConfig::new()
                .with_worker_count(4)
                .with_queue_capacity(256),
        )
        .unwrap();
        core.register_handler(|job, _ctx| async move {
            match job.payload["seq"].as_u64() {
                Some(seq) if seq % 10 == 0 => Err(JobError::Downstream("503".into())),
                _ => Ok(json!(null)),
            }
        });
        core.start().unwrap();

        let config = DemoConfig {
            jobs: 100,
            wait_for_tokens: true,
            ..DemoConfig::default()
        };
        let summary = run_demo(&core, &config, &CancelContext::new()).await;

        assert_eq!(summary.submitted, 100);
        assert_eq!(summary.succeeded, 90);
        assert_eq!(summary.downstream_failed, 10);
        core.shutdown(&CancelContext::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_core_stops_submissions() {
        let core = TaskCore::new(CoreConfig::new()).unwrap();
        core.register_handler(|_job, _ctx| async { Ok(json!(null)) });
        core.shutdown(&CancelContext::new()).await.unwrap();

        let config = DemoConfig {
            jobs: 10,
            ..DemoConfig::default()
        };
        let summary = run_demo(&core, &config, &CancelContext::new()).await;

        assert_eq!(summary, DemoSummary::default());
    }
}
