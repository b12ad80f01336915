//! Case execution: step sequencing, aggregation, cancellation.

use crate::events::{self, EventSink, ExecutionEvent, LogLevel, NullSink};
use crate::executor::{ReqwestExecutor, RequestExecutor};
use crate::model::*;
use crate::step::StepProcessor;
use crate::store::TemplateStore;
use crate::variables::VariableContext;
use async_trait::async_trait;
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{info, instrument};

/// Shared cancellation flag, polled before each step starts.
///
/// Cancellation is cooperative only: a request already in flight runs to
/// completion or timeout, after which no further step starts.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Case runner trait
#[async_trait]
pub trait CaseRunner: Send + Sync {
    /// Run every enabled step of `case` using `vars` as the run's
    /// variable context.
    async fn run(
        &self,
        case: &TestCase,
        vars: &mut VariableContext,
        cancel: &CancellationFlag,
    ) -> CaseExecutionResult;
}

/// Sequences the steps of a case and reports progress to a sink.
pub struct Orchestrator {
    executor: Arc<dyn RequestExecutor>,
    templates: Arc<dyn TemplateStore>,
    environment: Environment,
    sink: Arc<dyn EventSink>,
}

impl Orchestrator {
    /// Orchestrator using the reqwest executor, no environment and no sink.
    pub fn new(templates: Arc<dyn TemplateStore>) -> Self {
        Self {
            executor: Arc::new(ReqwestExecutor::new()),
            templates,
            environment: Environment::default(),
            sink: Arc::new(NullSink),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn RequestExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Run `case` on its own tokio task with a fresh variable context.
    pub fn spawn(
        self: &Arc<Self>,
        case: TestCase,
        vars: VariableContext,
    ) -> CaseRunHandle {
        let cancel = CancellationFlag::new();
        let flag = cancel.clone();
        let orchestrator = Arc::clone(self);
        let fallback = case.clone();

        let join = tokio::spawn(async move {
            let mut vars = vars;
            let run = orchestrator.run(&case, &mut vars, &flag);
            let result = AssertUnwindSafe(run).catch_unwind().await;
            match result {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    let result = CaseExecutionResult::aborted(
                        &case,
                        format!("case run aborted: {message}"),
                    );
                    orchestrator
                        .sink
                        .emit(ExecutionEvent::CaseFinished {
                            result: result.clone(),
                        })
                        .await;
                    result
                }
            }
        });

        CaseRunHandle {
            cancel,
            join,
            case: fallback,
        }
    }

    async fn log(&self, level: LogLevel, message: String) {
        events::log(self.sink.as_ref(), level, message).await;
    }
}

#[async_trait]
impl CaseRunner for Orchestrator {
    #[instrument(skip(self, case, vars, cancel), fields(name = %case.name))]
    async fn run(
        &self,
        case: &TestCase,
        vars: &mut VariableContext,
        cancel: &CancellationFlag,
    ) -> CaseExecutionResult {
        let start_time = Instant::now();

        vars.clear_local();
        vars.set_global(self.environment.variables.clone());
        vars.set_global(case.global_vars.clone());

        let steps = case.ordered_steps();
        info!("Starting test case: {}", case.name);
        self.sink
            .emit(ExecutionEvent::CaseStarted {
                case_name: case.name.clone(),
                total_steps: steps.len(),
            })
            .await;

        let processor = StepProcessor::new(
            self.executor.as_ref(),
            self.templates.as_ref(),
            &self.environment,
            self.sink.as_ref(),
        );

        let mut step_results = Vec::with_capacity(steps.len());
        let mut cancelled = false;

        for (step_idx, step) in steps.iter().enumerate() {
            if cancel.is_cancelled() {
                cancelled = true;
                self.log(
                    LogLevel::Warning,
                    format!(
                        "Case '{}' cancelled before step {}/{}",
                        case.name,
                        step_idx + 1,
                        steps.len()
                    ),
                )
                .await;
                break;
            }

            let name = step.display_name();
            info!("Running step {}/{}: {}", step_idx + 1, steps.len(), name);
            self.sink
                .emit(ExecutionEvent::StepStarted {
                    step_order: step.step_order,
                    name: name.clone(),
                })
                .await;

            let mut fallback = StepResult::pending(step);
            fallback.start();

            let result = match AssertUnwindSafe(processor.process(step, vars))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => {
                    let message = format!(
                        "unhandled error: {}",
                        panic_message(panic.as_ref())
                    );
                    self.log(
                        LogLevel::Error,
                        format!("Step '{name}' crashed: {message}"),
                    )
                    .await;
                    fallback.error = Some(message);
                    fallback.finish(StepStatus::Error);
                    fallback
                }
            };

            self.sink
                .emit(ExecutionEvent::StepFinished {
                    result: result.clone(),
                })
                .await;
            step_results.push(result);
        }

        let mut result = CaseExecutionResult::from_steps(
            case,
            step_results,
            cancelled,
            start_time.elapsed().as_millis() as u64,
        );
        result.variables = vars.snapshot().merged();

        info!(
            "Test case finished: {} ({} ms) - {}",
            case.name,
            result.duration_ms,
            result.overall_status.as_str()
        );
        self.sink
            .emit(ExecutionEvent::CaseFinished {
                result: result.clone(),
            })
            .await;

        result
    }
}

/// How waiting on a spawned run ended.
#[derive(Debug)]
pub enum RunOutcome {
    Finished(CaseExecutionResult),
    /// The join timeout elapsed. The run may still be going.
    Abandoned,
}

/// Handle to a case running on a background task.
#[derive(Debug)]
pub struct CaseRunHandle {
    cancel: CancellationFlag,
    join: JoinHandle<CaseExecutionResult>,
    case: TestCase,
}

impl CaseRunHandle {
    /// Ask the run to stop before its next step.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation(&self) -> CancellationFlag {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the run, optionally bounded by `timeout`.
    ///
    /// Exceeding the timeout yields [`RunOutcome::Abandoned`]; the task is
    /// not aborted and is not guaranteed to have stopped.
    pub async fn wait(self, timeout: Option<Duration>) -> RunOutcome {
        let CaseRunHandle { join, case, .. } = self;
        let joined = match timeout {
            Some(limit) => match tokio::time::timeout(limit, join).await {
                Ok(joined) => joined,
                Err(_) => return RunOutcome::Abandoned,
            },
            None => join.await,
        };
        match joined {
            Ok(result) => RunOutcome::Finished(result),
            Err(err) => RunOutcome::Finished(CaseExecutionResult::aborted(
                &case,
                format!("case run aborted: {err}"),
            )),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
