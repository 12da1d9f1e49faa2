// Dispatcher: turns an admitted fire into an enqueue call
//
// Deferred args/properties are materialized here, at dispatch time, and one
// DispatchRequest is built per fire. Enqueue failures are retried a bounded
// number of times within the tick; after that the fire is given up and the
// definition proceeds to its next occurrence.

use crate::errors::DispatchError;
use crate::queue::{DispatchRequest, JobEnqueuer};
use crate::retry::{ExponentialBackoff, RetryStrategy};
use crate::table::{Properties, TaskDefinition};
use crate::telemetry;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{instrument, warn};

pub struct Dispatcher {
    enqueuer: Arc<dyn JobEnqueuer>,
    retry: Box<dyn RetryStrategy>,
    max_attempts: u32,
}

impl Dispatcher {
    pub fn new(enqueuer: Arc<dyn JobEnqueuer>, max_attempts: u32) -> Self {
        Self {
            enqueuer,
            retry: Box::new(ExponentialBackoff::new()),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn with_retry_strategy(mut self, retry: impl RetryStrategy + 'static) -> Self {
        self.retry = Box::new(retry);
        self
    }

    /// Dispatch one fire to the execution engine
    ///
    /// Success means the engine acknowledged acceptance; job completion is
    /// not tracked here.
    #[instrument(skip(self, definition), fields(
        task_key = %definition.key,
        job_class = %definition.job_class,
        scheduled_at = %scheduled_at
    ))]
    pub async fn dispatch(
        &self,
        definition: &TaskDefinition,
        scheduled_at: DateTime<Utc>,
    ) -> Result<(), DispatchError> {
        let request = materialize(definition, scheduled_at);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.enqueuer.enqueue(&request).await {
                Ok(()) => {
                    telemetry::record_fire_dispatched(&definition.key);
                    return Ok(());
                }
                Err(error) => {
                    if attempt >= self.max_attempts {
                        telemetry::record_dispatch_failure(&definition.key, &error);
                        return Err(DispatchError::RetriesExhausted {
                            key: definition.key.clone(),
                            attempts: attempt,
                            source: error,
                        });
                    }

                    let delay = self.retry.delay_for(attempt - 1);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Enqueue failed, retrying within tick"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Resolve deferred values and build the concrete request
fn materialize(definition: &TaskDefinition, scheduled_at: DateTime<Utc>) -> DispatchRequest {
    let args = definition.args.resolve();
    let properties = definition.properties.resolve();
    let priority = effective_priority(definition, &properties);

    DispatchRequest {
        key: definition.key.clone(),
        job_class: definition.job_class.clone(),
        args,
        priority,
        properties,
        scheduled_at,
    }
}

/// A `properties.priority` override wins over the definition-level priority.
/// Static overrides were validated at load time; a deferred computation can
/// still produce a non-integer, which is ignored with a warning.
fn effective_priority(definition: &TaskDefinition, properties: &Properties) -> i32 {
    match properties.get("priority") {
        None => definition.priority,
        Some(value) => match value.as_i64().and_then(|p| i32::try_from(p).ok()) {
            Some(priority) => priority,
            None => {
                warn!(
                    task_key = %definition.key,
                    value = %value,
                    "Ignoring non-integer priority override from properties"
                );
                definition.priority
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::EnqueueError;
    use crate::retry::FixedDelay;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    /// Enqueuer that records requests and fails the first `fail_times` calls
    struct RecordingEnqueuer {
        requests: Mutex<Vec<DispatchRequest>>,
        fail_times: AtomicUsize,
        calls: AtomicUsize,
    }

    impl RecordingEnqueuer {
        fn new(fail_times: usize) -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                fail_times: AtomicUsize::new(fail_times),
                calls: AtomicUsize::new(0),
            })
        }

        async fn recorded(&self) -> Vec<DispatchRequest> {
            self.requests.lock().await.clone()
        }
    }

    #[async_trait::async_trait]
    impl JobEnqueuer for RecordingEnqueuer {
        async fn enqueue(&self, request: &DispatchRequest) -> Result<(), EnqueueError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.fail_times.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_times.store(remaining - 1, Ordering::SeqCst);
                return Err(EnqueueError::Rejected("engine unavailable".to_string()));
            }
            self.requests.lock().await.push(request.clone());
            Ok(())
        }
    }

    fn dispatcher(enqueuer: Arc<RecordingEnqueuer>, max_attempts: u32) -> Dispatcher {
        Dispatcher::new(enqueuer, max_attempts)
            .with_retry_strategy(FixedDelay::new(Duration::ZERO))
    }

    fn instant() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 10, 0).unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_builds_request_from_definition() {
        let enqueuer = RecordingEnqueuer::new(0);
        let definition = TaskDefinition::new("frequent_task", "*/10 * * * *", "ReportRollupJob")
            .unwrap()
            .with_args(vec![json!(1)])
            .with_priority(2);

        dispatcher(enqueuer.clone(), 3)
            .dispatch(&definition, instant())
            .await
            .unwrap();

        let requests = enqueuer.recorded().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].key, "frequent_task");
        assert_eq!(requests[0].job_class, "ReportRollupJob");
        assert_eq!(requests[0].args, vec![json!(1)]);
        assert_eq!(requests[0].priority, 2);
        assert_eq!(requests[0].scheduled_at, instant());
    }

    #[tokio::test]
    async fn test_dispatch_retries_then_succeeds() {
        let enqueuer = RecordingEnqueuer::new(2);
        let definition = TaskDefinition::new("a", "* * * * *", "SomeJob").unwrap();

        dispatcher(enqueuer.clone(), 3)
            .dispatch(&definition, instant())
            .await
            .unwrap();

        assert_eq!(enqueuer.calls.load(Ordering::SeqCst), 3);
        assert_eq!(enqueuer.recorded().await.len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_gives_up_after_retry_budget() {
        let enqueuer = RecordingEnqueuer::new(usize::MAX);
        let definition = TaskDefinition::new("a", "* * * * *", "SomeJob").unwrap();

        let result = dispatcher(enqueuer.clone(), 2)
            .dispatch(&definition, instant())
            .await;

        assert!(matches!(
            result,
            Err(DispatchError::RetriesExhausted { attempts: 2, .. })
        ));
        assert_eq!(enqueuer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_deferred_args_materialize_at_dispatch_time() {
        let enqueuer = RecordingEnqueuer::new(0);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let definition = TaskDefinition::new("a", "* * * * *", "SomeJob")
            .unwrap()
            .with_args_fn(move || vec![json!(counter.fetch_add(1, Ordering::SeqCst))]);

        // Nothing evaluated until a dispatch happens
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let d = dispatcher(enqueuer.clone(), 1);
        d.dispatch(&definition, instant()).await.unwrap();
        d.dispatch(&definition, instant() + chrono::Duration::minutes(1))
            .await
            .unwrap();

        let requests = enqueuer.recorded().await;
        assert_eq!(requests[0].args, vec![json!(0)]);
        assert_eq!(requests[1].args, vec![json!(1)]);
    }

    #[tokio::test]
    async fn test_properties_priority_override_wins() {
        let enqueuer = RecordingEnqueuer::new(0);
        let mut properties = Properties::new();
        properties.insert("priority".to_string(), json!(-10));

        let definition = TaskDefinition::new("a", "* * * * *", "SomeJob")
            .unwrap()
            .with_priority(5)
            .with_properties(properties);

        dispatcher(enqueuer.clone(), 1)
            .dispatch(&definition, instant())
            .await
            .unwrap();

        assert_eq!(enqueuer.recorded().await[0].priority, -10);
    }

    #[tokio::test]
    async fn test_non_integer_deferred_override_falls_back_to_definition() {
        let enqueuer = RecordingEnqueuer::new(0);
        let definition = TaskDefinition::new("a", "* * * * *", "SomeJob")
            .unwrap()
            .with_priority(5)
            .with_properties_fn(|| {
                let mut properties = Properties::new();
                properties.insert("priority".to_string(), json!("urgent"));
                properties
            });

        dispatcher(enqueuer.clone(), 1)
            .dispatch(&definition, instant())
            .await
            .unwrap();

        assert_eq!(enqueuer.recorded().await[0].priority, 5);
    }
}
