//! Block executor.

use std::sync::Arc;

use blockflow_core::inference::{CompletionRequest, CompletionResponse, CompletionService, TokenUsage};
use jiff::Timestamp;
use serde_json::Value;
use tokio::sync::{Semaphore, TryAcquireError};
use tokio::time::Instant;

use super::{BlockResult, BlockState, EngineConfig, ExecutionContext, ExecutionEvent, ExecutionReport};
use crate::definition::{BlockDefinition, WorkflowDefinition};
use crate::schema::OutputSchema;
use crate::template::{self, Bindings, RenderWarning};
use crate::{TRACING_TARGET_ENGINE, WorkflowError, WorkflowResult};

/// Retry accounting shared by all blocks of one execution.
struct RetryBudget {
    transient_remaining: u32,
    retries: u32,
}

/// The block executor.
///
/// Runs blocks strictly in ascending order. Model invocations from every
/// execution sharing this engine are bounded by one semaphore.
pub struct Engine {
    config: EngineConfig,
    completion: CompletionService,
    slots: Arc<Semaphore>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("available_slots", &self.slots.available_permits())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates a new engine with the given configuration.
    pub fn new(config: EngineConfig, completion: CompletionService) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent_invocations));

        tracing::info!(
            target: TRACING_TARGET_ENGINE,
            max_concurrent_invocations = config.max_concurrent_invocations,
            invocation_timeout_secs = config.invocation_timeout_secs,
            max_retries = config.max_retries,
            "Workflow engine initialized"
        );

        Self {
            config,
            completion,
            slots,
        }
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Invocation slots currently free.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Executes `workflow` within `ctx`.
    ///
    /// Never panics on block failure; the returned report carries every
    /// result produced so far and the error that stopped execution.
    pub async fn execute(&self, workflow: &WorkflowDefinition, ctx: ExecutionContext) -> ExecutionReport {
        if let Err(error) = workflow.validate() {
            tracing::error!(
                target: TRACING_TARGET_ENGINE,
                job_id = %ctx.job_id(),
                workflow_id = %workflow.id,
                error = %error,
                "Refusing to execute invalid workflow"
            );
            return ExecutionReport::failed(Vec::new(), 0, error);
        }

        let blocks = workflow.ordered_blocks();
        let total_steps = blocks.len();

        tracing::debug!(
            target: TRACING_TARGET_ENGINE,
            job_id = %ctx.job_id(),
            workflow_id = %workflow.id,
            total_steps,
            "Starting workflow execution"
        );

        let mut bindings = Bindings::new(ctx.request_text());
        let mut results = Vec::with_capacity(total_steps);
        let mut budget = RetryBudget {
            transient_remaining: self.config.max_retries,
            retries: 0,
        };

        for (step, block) in blocks.into_iter().enumerate() {
            if ctx.is_cancelled() {
                return ExecutionReport::failed(
                    results,
                    budget.retries,
                    WorkflowError::Cancelled { block: None },
                );
            }

            ctx.emit(ExecutionEvent::BlockStarted {
                step,
                total_steps,
                block_id: block.id,
                block_name: block.name.clone(),
            });

            let (result, outcome) = self.run_block(block, &bindings, &ctx, &mut budget).await;

            match outcome {
                Ok(output) => {
                    bindings.insert(block.name.clone(), output);
                    ctx.emit(ExecutionEvent::BlockCompleted {
                        step,
                        total_steps,
                        result: Box::new(result.clone()),
                    });
                    results.push(result);
                }
                Err(error) => {
                    tracing::error!(
                        target: TRACING_TARGET_ENGINE,
                        job_id = %ctx.job_id(),
                        block = %block.name,
                        step,
                        error = %error,
                        "Block failed, stopping execution"
                    );
                    ctx.emit(ExecutionEvent::BlockFailed {
                        step,
                        result: Box::new(result.clone()),
                    });
                    results.push(result);
                    return ExecutionReport::failed(results, budget.retries, error);
                }
            }
        }

        tracing::debug!(
            target: TRACING_TARGET_ENGINE,
            job_id = %ctx.job_id(),
            retries = budget.retries,
            "Workflow execution completed"
        );

        ExecutionReport {
            results,
            retries: budget.retries,
            outcome: Ok(bindings),
        }
    }

    /// Drives one block through render, invoke and validate.
    async fn run_block(
        &self,
        block: &BlockDefinition,
        bindings: &Bindings,
        ctx: &ExecutionContext,
        budget: &mut RetryBudget,
    ) -> (BlockResult, WorkflowResult<Value>) {
        let started_at = Timestamp::now();
        let clock = Instant::now();

        ctx.emit(ExecutionEvent::StateChanged {
            block_name: block.name.clone(),
            state: BlockState::Rendering,
        });

        let prompt = template::render(&block.prompt_template, bindings);
        let system = block
            .system_prompt
            .as_deref()
            .map(|t| template::render(t, bindings));

        let mut warnings: Vec<RenderWarning> = prompt.warnings;
        let system_prompt = system.map(|rendered| {
            warnings.extend(rendered.warnings);
            rendered.text
        });

        for warning in &warnings {
            tracing::warn!(
                target: TRACING_TARGET_ENGINE,
                job_id = %ctx.job_id(),
                block = %block.name,
                placeholder = %warning.placeholder,
                kind = ?warning.kind,
                "Template placeholder not rendered exactly"
            );
        }

        let mut rendered_prompt = prompt.text;
        if let Some(extra) = ctx.instructions_for(&block.name) {
            rendered_prompt = format!("{rendered_prompt}\n\n{extra}");
        }

        let mut request = CompletionRequest::new(&block.model.name, rendered_prompt.clone())
            .with_parameters(block.model.parameters.clone());
        request.system_prompt = system_prompt.clone();

        let mut attempts = 0u32;
        let mut usage = TokenUsage::default();
        let mut raw_output = None;
        let mut validation_error = None;

        let outcome = match OutputSchema::compile(&block.output_schema) {
            Err(message) => Err(WorkflowError::InvalidDefinition(format!(
                "block '{}' has an invalid output schema: {message}",
                block.name
            ))),
            Ok(schema) => {
                let mut validation_failures = 0u32;
                loop {
                    attempts += 1;
                    ctx.emit(ExecutionEvent::StateChanged {
                        block_name: block.name.clone(),
                        state: BlockState::Invoking,
                    });

                    match self.invoke(block, &request, ctx).await {
                        Ok(response) => {
                            usage += response.usage;
                            ctx.emit(ExecutionEvent::StateChanged {
                                block_name: block.name.clone(),
                                state: BlockState::Validating,
                            });

                            let validated = schema.validate(&response.content);
                            raw_output = Some(response.content);

                            let Some(message) = validated.error else {
                                validation_error = None;
                                break Ok(validated.output);
                            };

                            validation_error = Some(message.clone());
                            if validation_failures >= self.config.validation_retries {
                                break Err(WorkflowError::Validation {
                                    block: block.name.clone(),
                                    message,
                                });
                            }

                            validation_failures += 1;
                            budget.retries += 1;
                            tracing::warn!(
                                target: TRACING_TARGET_ENGINE,
                                job_id = %ctx.job_id(),
                                block = %block.name,
                                attempt = attempts,
                                error = %message,
                                "Output failed validation, retrying"
                            );
                            ctx.emit(ExecutionEvent::Retrying {
                                block_name: block.name.clone(),
                                attempt: attempts,
                                reason: message,
                            });
                        }
                        Err(error) if error.is_transient() && budget.transient_remaining > 0 => {
                            budget.transient_remaining -= 1;
                            budget.retries += 1;
                            tracing::warn!(
                                target: TRACING_TARGET_ENGINE,
                                job_id = %ctx.job_id(),
                                block = %block.name,
                                attempt = attempts,
                                retries_left = budget.transient_remaining,
                                error = %error,
                                "Transient invocation failure, retrying"
                            );
                            ctx.emit(ExecutionEvent::Retrying {
                                block_name: block.name.clone(),
                                attempt: attempts,
                                reason: error.to_string(),
                            });

                            tokio::select! {
                                biased;
                                () = ctx.cancellation().cancelled() => {
                                    break Err(WorkflowError::Cancelled {
                                        block: Some(block.name.clone()),
                                    });
                                }
                                () = tokio::time::sleep(self.config.retry_delay()) => {}
                            }
                        }
                        Err(error) => break Err(error),
                    }
                }
            }
        };

        let (status, error) = match &outcome {
            Ok(_) => (BlockState::Done, None),
            Err(e) => (BlockState::Failed, Some(e.to_string())),
        };

        ctx.emit(ExecutionEvent::StateChanged {
            block_name: block.name.clone(),
            state: status,
        });

        let result = BlockResult {
            block_id: block.id,
            block_name: block.name.clone(),
            order: block.order,
            status,
            model: block.model.name.clone(),
            rendered_prompt,
            rendered_system_prompt: system_prompt,
            raw_output,
            output: outcome.as_ref().ok().cloned(),
            validation_error,
            error,
            warnings,
            attempts,
            latency_ms: u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX),
            usage,
            started_at,
            completed_at: Timestamp::now(),
        };

        tracing::debug!(
            target: TRACING_TARGET_ENGINE,
            job_id = %ctx.job_id(),
            block = %block.name,
            status = %status,
            attempts,
            latency_ms = result.latency_ms,
            "Block finished"
        );

        (result, outcome)
    }

    /// Invokes the model once, holding a shared slot for the duration.
    async fn invoke(
        &self,
        block: &BlockDefinition,
        request: &CompletionRequest,
        ctx: &ExecutionContext,
    ) -> WorkflowResult<CompletionResponse> {
        let cancelled = || WorkflowError::Cancelled {
            block: Some(block.name.clone()),
        };

        let _permit = match self.slots.try_acquire() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                tracing::debug!(
                    target: TRACING_TARGET_ENGINE,
                    job_id = %ctx.job_id(),
                    block = %block.name,
                    "Waiting for an invocation slot"
                );
                ctx.emit(ExecutionEvent::WaitingForSlot {
                    block_name: block.name.clone(),
                });

                tokio::select! {
                    biased;
                    () = ctx.cancellation().cancelled() => return Err(cancelled()),
                    permit = self.slots.acquire() => permit.map_err(|_| {
                        WorkflowError::Internal("invocation limiter closed".into())
                    })?,
                }
            }
            Err(TryAcquireError::Closed) => {
                return Err(WorkflowError::Internal("invocation limiter closed".into()));
            }
        };

        let timeout = self.config.invocation_timeout();
        tokio::select! {
            biased;
            () = ctx.cancellation().cancelled() => Err(cancelled()),
            result = tokio::time::timeout(timeout, self.completion.complete(request)) => match result {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(source)) => Err(WorkflowError::Invocation {
                    block: block.name.clone(),
                    source,
                }),
                Err(_) => Err(WorkflowError::InvocationTimeout {
                    block: block.name.clone(),
                    timeout,
                }),
            },
        }
    }
}
