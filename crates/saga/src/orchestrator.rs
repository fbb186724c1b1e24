//! Checkout saga orchestration.
//!
//! Steps run strictly in declared order. The first failure stops the saga,
//! then every step that had already succeeded is compensated in reverse.
//! Compensation failures are collected separately from the triggering error
//! and never hidden: they are logged at error level, counted, and published
//! as [`COMPENSATION_FAILED_EVENT`].
//!
//! Each step runs on its own task under a timeout. A timed-out step is not
//! interrupted; its late outcome is awaited during compensation so anything it
//! did can be undone.

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{Clock, SagaId, SystemClock};
use reliability::{EventBus, ProcessError};
use serde_json::json;
use store::SagaLogStore;
use tokio::task::JoinHandle;

use crate::checkout::CheckoutRequest;
use crate::error::{Result, SagaError};
use crate::execution::{SagaExecution, SagaResult};
use crate::steps::{CheckoutServices, CheckoutStep, StepOutput};

/// Saga type recorded for orchestrated checkouts.
pub const CHECKOUT_SAGA: &str = "checkout";

/// Published when a compensating action fails.
pub const COMPENSATION_FAILED_EVENT: &str = "saga.compensation_failed";

pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(10);

type StepHandle = JoinHandle<reliability::Result<StepOutput>>;

/// One execution in progress.
pub(crate) struct Run {
    execution: SagaExecution,
    request: Arc<CheckoutRequest>,
    completed: Vec<(CheckoutStep, StepOutput)>,
    late: Option<(CheckoutStep, StepHandle)>,
    started: Instant,
}

/// Step execution, compensation and persistence shared by both checkout paths.
#[derive(Clone)]
pub(crate) struct SagaRunner {
    services: CheckoutServices,
    log: Arc<dyn SagaLogStore>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    step_timeout: Duration,
}

impl SagaRunner {
    pub(crate) fn new(services: CheckoutServices, log: Arc<dyn SagaLogStore>) -> Self {
        Self {
            services,
            log,
            events: EventBus::default(),
            clock: Arc::new(SystemClock),
            step_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }

    pub(crate) fn set_events(&mut self, events: EventBus) {
        self.events = events;
    }

    pub(crate) fn set_clock(&mut self, clock: Arc<dyn Clock>) {
        self.clock = clock;
    }

    pub(crate) fn set_step_timeout(&mut self, timeout: Duration) {
        self.step_timeout = timeout;
    }

    pub(crate) async fn start(&self, saga_type: &str, request: CheckoutRequest) -> Run {
        let run = Run {
            execution: SagaExecution::new(saga_type, self.clock.now()),
            request: Arc::new(request),
            completed: Vec::new(),
            late: None,
            started: Instant::now(),
        };
        tracing::info!(
            saga_id = %run.execution.saga_id,
            saga_type,
            customer_id = %run.request.customer_id,
            "saga started"
        );
        self.persist(&run.execution).await;
        run
    }

    /// Runs one step. Returns false if it failed and the saga must stop.
    pub(crate) async fn step(&self, run: &mut Run, step: CheckoutStep) -> bool {
        let name = step.name();
        let saga_id = run.execution.saga_id;
        run.execution.step_started(name, self.clock.now());
        self.persist(&run.execution).await;
        tracing::info!(%saga_id, step = name, "saga step started");

        let services = self.services.clone();
        let request = run.request.clone();
        let completed: Vec<StepOutput> = run.completed.iter().map(|(_, o)| o.clone()).collect();
        let mut handle: StepHandle =
            tokio::spawn(async move { services.run(step, &request, &completed).await });

        let error = match tokio::time::timeout(self.step_timeout, &mut handle).await {
            Ok(Ok(Ok(output))) => {
                run.execution
                    .step_succeeded(name, output.to_json(), self.clock.now());
                run.completed.push((step, output));
                self.persist(&run.execution).await;
                tracing::info!(%saga_id, step = name, "saga step completed");
                return true;
            }
            Ok(Ok(Err(source))) => SagaError::StepFailed { step: name, source },
            Ok(Err(join)) => SagaError::StepFailed {
                step: name,
                source: ProcessError::permanent(format!("step task failed: {join}")),
            },
            Err(_) => {
                run.late = Some((step, handle));
                SagaError::StepTimedOut {
                    step: name,
                    after: self.step_timeout,
                }
            }
        };

        tracing::warn!(%saga_id, step = name, error = %error, "saga step failed");
        metrics::counter!("saga_step_failures_total", "step" => name).increment(1);
        run.execution
            .step_failed(name, error.to_string(), self.clock.now());
        self.persist(&run.execution).await;
        false
    }

    /// Undoes every step that took effect, most recent first.
    pub(crate) async fn compensate(&self, run: &mut Run) {
        if !run.execution.begin_compensation() {
            return;
        }
        self.persist(&run.execution).await;

        let failed_step = run.execution.failed_step.clone().unwrap_or_default();
        let reason = format!("checkout failed at {failed_step}");

        if let Some((step, handle)) = run.late.take() {
            match tokio::time::timeout(self.step_timeout, handle).await {
                Ok(Ok(Ok(output))) => {
                    tracing::warn!(step = step.name(), "timed-out step finished late");
                    run.completed.push((step, output));
                }
                Ok(Ok(Err(_))) => {}
                Ok(Err(join)) => {
                    let error = format!("step task failed after timeout: {join}");
                    self.compensation_failed(&mut run.execution, step.name(), error)
                        .await;
                }
                Err(_) => {
                    let error = "step outcome unknown after timeout".to_string();
                    self.compensation_failed(&mut run.execution, step.name(), error)
                        .await;
                }
            }
        }

        for (step, output) in run.completed.iter().rev() {
            if !output.has_compensation() {
                continue;
            }
            let name = step.name();
            let outcome =
                tokio::time::timeout(self.step_timeout, self.services.compensate(output, &reason))
                    .await;
            let error = match outcome {
                Ok(Ok(())) => {
                    run.execution.step_compensated(name);
                    tracing::info!(saga_id = %run.execution.saga_id, step = name, "step compensated");
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("compensation timed out after {:?}", self.step_timeout),
            };
            self.compensation_failed(&mut run.execution, name, error)
                .await;
        }
        self.persist(&run.execution).await;
    }

    async fn compensation_failed(
        &self,
        execution: &mut SagaExecution,
        step: &'static str,
        error: String,
    ) {
        let err = SagaError::CompensationFailed {
            step,
            reason: error.clone(),
        };
        tracing::error!(
            saga_id = %execution.saga_id,
            saga_type = %execution.saga_type,
            step,
            error = %err,
            "saga compensation failed; manual intervention required"
        );
        metrics::counter!(
            "saga_compensation_failed_total",
            "saga_type" => execution.saga_type.clone(),
            "step" => step
        )
        .increment(1);

        let payload = json!({
            "saga_id": execution.saga_id,
            "saga_type": execution.saga_type,
            "failed_step": execution.failed_step,
            "step": step,
            "error": error,
        });
        self.events.emit(COMPENSATION_FAILED_EVENT, &payload).await;
        execution.compensation_failed(step, error);
    }

    pub(crate) async fn finish(&self, mut run: Run) -> SagaResult {
        run.execution.finish(self.clock.now());
        self.persist(&run.execution).await;

        let execution = &run.execution;
        let duration = run.started.elapsed().as_secs_f64();
        metrics::histogram!("saga_duration_seconds", "saga_type" => execution.saga_type.clone())
            .record(duration);
        metrics::counter!(
            "saga_executions_total",
            "saga_type" => execution.saga_type.clone(),
            "status" => execution.status.as_str()
        )
        .increment(1);
        if execution.compensated {
            metrics::counter!("saga_compensated_total", "saga_type" => execution.saga_type.clone())
                .increment(1);
        }

        if execution.failed_step.is_none() {
            tracing::info!(saga_id = %execution.saga_id, duration, "saga completed");
        } else {
            tracing::warn!(
                saga_id = %execution.saga_id,
                status = %execution.status,
                failed_step = execution.failed_step.as_deref().unwrap_or("-"),
                duration,
                "saga failed"
            );
        }
        execution.to_result()
    }

    /// Saves the execution. A failed save is logged; the saga keeps going.
    async fn persist(&self, execution: &SagaExecution) {
        let saved = match execution.to_log_entry(self.clock.now()) {
            Ok(entry) => self.log.save(entry).await.map_err(SagaError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = saved {
            tracing::warn!(saga_id = %execution.saga_id, error = %e, "failed to persist saga state");
        }
    }

    pub(crate) async fn load(&self, saga_id: SagaId) -> Result<Option<SagaExecution>> {
        match self.log.load(saga_id).await? {
            Some(entry) => SagaExecution::from_log_entry(entry).map(Some),
            None => Ok(None),
        }
    }
}

pub(crate) fn check_request(request: &CheckoutRequest) -> Result<()> {
    if request.customer_id.trim().is_empty() {
        return Err(SagaError::InvalidRequest("missing customer_id".to_string()));
    }
    if request.shipping_address.trim().is_empty() {
        return Err(SagaError::InvalidRequest(
            "missing shipping_address".to_string(),
        ));
    }
    if request.total_cents().is_none() {
        return Err(SagaError::InvalidRequest(
            "cart total is out of range".to_string(),
        ));
    }
    Ok(())
}

/// Runs checkout as an orchestrated saga.
pub struct CheckoutSaga {
    runner: SagaRunner,
}

impl CheckoutSaga {
    pub fn new(services: CheckoutServices, log: Arc<dyn SagaLogStore>) -> Self {
        Self {
            runner: SagaRunner::new(services, log),
        }
    }

    /// Publishes compensation failures on `events`.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.runner.set_events(events);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.runner.set_clock(clock);
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.runner.set_step_timeout(timeout);
        self
    }

    /// Runs the checkout to a terminal state.
    ///
    /// Step failures are reported in the result, not as `Err`; `Err` means
    /// the request could not start a saga.
    #[tracing::instrument(skip(self, request), fields(saga_type = CHECKOUT_SAGA))]
    pub async fn execute(&self, request: CheckoutRequest) -> Result<SagaResult> {
        check_request(&request)?;
        let mut run = self.runner.start(CHECKOUT_SAGA, request).await;

        for step in CheckoutStep::ALL {
            if !self.runner.step(&mut run, step).await {
                self.runner.compensate(&mut run).await;
                break;
            }
        }
        Ok(self.runner.finish(run).await)
    }

    /// Loads a saga execution by ID.
    pub async fn get(&self, saga_id: SagaId) -> Result<Option<SagaExecution>> {
        self.runner.load(saga_id).await
    }
}
