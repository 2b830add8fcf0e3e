//! Report ingestion job handler
//!
//! Each job carries one report for a tenant. The handler:
//! 1. Serializes the report into a pooled buffer
//! 2. Adds the byte count to the tenant's counters in the shared store
//! 3. Delivers the report downstream through the circuit breaker
//!
//! While the breaker is open, reports are counted as deferred instead of
//! hammering the failing dependency.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use bulwark_core::{
    CancelContext, CircuitBreaker, CircuitBreakerError, Job, JobError, JobOutcome, ObjectPool,
    SharedStore, TaskCore,
};

use crate::downstream::FlakyDownstream;

/// Shared resources of the ingestion handler
#[derive(Clone)]
pub struct ReportIngest {
    buffers: ObjectPool<Vec<u8>>,
    store: Arc<SharedStore>,
    breaker: Arc<CircuitBreaker>,
    downstream: Arc<FlakyDownstream>,
}

impl ReportIngest {
    /// Wire the handler to the core's breaker and store
    pub fn new(core: &TaskCore, downstream: Arc<FlakyDownstream>) -> Self {
        let buffers = ObjectPool::with_factory(core.config().object_pool_max_idle, || {
            Vec::with_capacity(4096)
        });
        buffers.prewarm(core.config().worker_count);

        Self {
            buffers,
            store: core.store(),
            breaker: core.breaker(),
            downstream,
        }
    }

    pub fn buffers(&self) -> &ObjectPool<Vec<u8>> {
        &self.buffers
    }

    pub async fn handle(&self, job: Job, ctx: CancelContext) -> JobOutcome {
        let tenant = job
            .payload
            .get("tenant")
            .and_then(Value::as_str)
            .ok_or_else(|| JobError::failed("report has no tenant"))?
            .to_string();

        let bytes = {
            let mut buf = self.buffers.acquire();
            serde_json::to_writer(&mut *buf, &job.payload)
                .map_err(|e| JobError::failed(format!("unserializable report: {e}")))?;
            buf.len()
        };
        increment(&self.store, format!("tenant:{tenant}:bytes"), bytes as u64);

        let downstream = Arc::clone(&self.downstream);
        match self
            .breaker
            .execute_with(&ctx, || async move { downstream.deliver(bytes).await })
            .await
        {
            Ok(receipt) => {
                increment(&self.store, format!("tenant:{tenant}:delivered"), 1);
                Ok(json!({"tenant": tenant, "receipt": receipt}))
            }
            Err(CircuitBreakerError::Open) => {
                debug!(job_id = %job.id, %tenant, "Downstream open, report deferred");
                increment(&self.store, format!("tenant:{tenant}:deferred"), 1);
                Err(JobError::BreakerOpen)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn increment(store: &SharedStore, key: String, by: u64) {
    store.update(key, |value| {
        *value = json!(value.as_u64().unwrap_or(0) + by);
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bulwark_core::{CircuitState, CoreConfig};

    use super::*;

    fn ingest(failure_rate: f64, threshold: u32) -> (TaskCore, ReportIngest) {
        let core = TaskCore::new(
            CoreConfig::new()
                .with_worker_count(2)
                .with_breaker_failure_threshold(threshold),
        )
        .unwrap();
        let downstream = Arc::new(FlakyDownstream::new(failure_rate, Duration::ZERO));
        let ingest = ReportIngest::new(&core, downstream);
        (core, ingest)
    }

    #[tokio::test]
    async fn test_delivered_report_updates_counters() {
        let (core, ingest) = ingest(0.0, 5);

        let outcome = ingest
            .handle(Job::new(json!({"tenant": "clinic-7", "hb": 13.2})), CancelContext::new())
            .await
            .unwrap();

        assert_eq!(outcome["tenant"], "clinic-7");
        assert_eq!(core.store().get("tenant:clinic-7:delivered"), Some(json!(1)));
        assert!(core.store().get("tenant:clinic-7:bytes").is_some());
        assert!(ingest.buffers().stats().reused >= 1);
    }

    #[tokio::test]
    async fn test_missing_tenant_fails() {
        let (_core, ingest) = ingest(0.0, 5);

        let outcome = ingest.handle(Job::new(json!({})), CancelContext::new()).await;

        assert!(matches!(outcome, Err(JobError::Failed(_))));
    }

    #[tokio::test]
    async fn test_open_breaker_defers_reports() {
        let (core, ingest) = ingest(1.0, 2);
        let report = || Job::new(json!({"tenant": "lab-3"}));

        for _ in 0..2 {
            let outcome = ingest.handle(report(), CancelContext::new()).await;
            assert!(matches!(outcome, Err(JobError::Downstream(_))));
        }
        assert_eq!(core.breaker().state(), CircuitState::Open);

        let outcome = ingest.handle(report(), CancelContext::new()).await;
        assert_eq!(outcome, Err(JobError::BreakerOpen));
        assert_eq!(core.store().get("tenant:lab-3:deferred"), Some(json!(1)));
    }
}
