//! Stage runner.
//!
//! One call of [`Pipeline::run_stage`] takes every ready item through one
//! stage: plan the conversation, size the output budget, call the backend under
//! the concurrency ceilings, repair and validate the answer, write it back, and
//! checkpoint the working set after each batch.
//!
//! Per-item failures are recorded and leave the slot unset; only faults of the
//! run itself (backup, checkpoint) abort it.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::checkpoint::{CheckpointError, Checkpointer};
use crate::config::{ConfigError, PipelineConfig};
use crate::conversation::{ConversationManager, ConversationPlan};
use crate::gateway::{Attribution, ChatGateway, ChatRequest};
use crate::item::Item;
use crate::parse::parse;
use crate::prompts::PromptBuilder;
use crate::retry::{ErrorClass, GiveUpReason, RetryDecision, RetryState};
use crate::stages::{StageDefinition, StageGraph, StageKind, StageRun};
use crate::throttle::ResourcePool;
use crate::trace::{CallTrace, NoopTraceSink, TraceOutcome, TraceSink};

const CALLER: &str = "pipeline::run_stage";

// =============================================================================
// Errors and options
// =============================================================================

/// Faults that end a run. Item-level failures never surface here.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("stage {0} has no alternate mode")]
    NoAlternate(StageKind),
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Process at most this many ready items.
    pub limit: Option<usize>,
    /// Plan and trace only; no backend calls, no checkpoint.
    pub dry_run: bool,
}

/// Counts for one stage run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub stage: &'static str,
    pub slot: &'static str,
    pub run_id: Uuid,
    /// Ready items taken into the run.
    pub selected: usize,
    pub completed: usize,
    pub parse_failed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Backend calls made, retries included.
    pub calls: u32,
    pub batches: usize,
    pub dry_run: bool,
}

impl RunSummary {
    fn new(stage: &'static str, slot: &'static str, run_id: Uuid, dry_run: bool) -> Self {
        Self {
            stage,
            slot,
            run_id,
            selected: 0,
            completed: 0,
            parse_failed: 0,
            failed: 0,
            skipped: 0,
            calls: 0,
            batches: 0,
            dry_run,
        }
    }

    fn absorb(&mut self, outcome: &ItemOutcome) {
        self.calls += outcome.calls;
        match outcome.outcome {
            TraceOutcome::Completed => self.completed += 1,
            TraceOutcome::ParseFailed => self.parse_failed += 1,
            TraceOutcome::Failed => self.failed += 1,
            TraceOutcome::Skipped => self.skipped += 1,
            TraceOutcome::DryRun => {}
        }
    }
}

struct ItemOutcome {
    outcome: TraceOutcome,
    calls: u32,
}

// =============================================================================
// Pipeline
// =============================================================================

pub struct Pipeline {
    config: PipelineConfig,
    graph: StageGraph,
    gateway: Arc<dyn ChatGateway>,
    prompts: Arc<dyn PromptBuilder>,
    trace: Arc<dyn TraceSink>,
    pool: ResourcePool,
    conversations: ConversationManager,
}

impl Pipeline {
    /// Validates `config` and builds the resource pool from it.
    pub fn new(
        config: PipelineConfig,
        gateway: Arc<dyn ChatGateway>,
        prompts: Arc<dyn PromptBuilder>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let pool = ResourcePool::new(
            config
                .resources
                .iter()
                .map(|r| (r.name.clone(), r.max_concurrent)),
            config.global_concurrency,
        );
        let conversations =
            ConversationManager::new(config.resource_names(), config.system_message.clone());
        Ok(Self {
            config,
            graph: StageGraph::standard(),
            gateway,
            prompts,
            trace: Arc::new(NoopTraceSink),
            pool,
            conversations,
        })
    }

    pub fn with_trace(mut self, trace: Arc<dyn TraceSink>) -> Self {
        self.trace = trace;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    /// Run `run` over the ready items of `items`, saving through `checkpoint`
    /// after every batch.
    pub async fn run_stage(
        &self,
        items: &mut [Item],
        run: StageRun,
        checkpoint: &Checkpointer,
        options: &RunOptions,
    ) -> Result<RunSummary, PipelineError> {
        let def = self.graph.definition(run.kind);
        if run.alternate && def.alternate.is_none() {
            return Err(PipelineError::NoAlternate(run.kind));
        }

        let run_id = Uuid::new_v4();
        let mut summary = RunSummary::new(
            run.kind.as_str(),
            def.slot(run.alternate),
            run_id,
            options.dry_run,
        );

        let mut limit = options.limit;
        if options.dry_run {
            limit = match (limit, self.config.dry_run_limit) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }

        let ready: Vec<usize> = items
            .iter()
            .enumerate()
            .filter(|(_, item)| self.graph.is_ready(item, run, self.config.readiness))
            .map(|(i, _)| i)
            .take(limit.unwrap_or(usize::MAX))
            .collect();
        summary.selected = ready.len();

        info!(
            run_id = %run_id,
            stage = summary.stage,
            slot = summary.slot,
            ready = ready.len(),
            total = items.len(),
            dry_run = options.dry_run,
            "Starting stage run"
        );

        if ready.is_empty() {
            return Ok(summary);
        }

        if !options.dry_run && checkpoint.config().backup {
            if let Some(path) = checkpoint.backup().await? {
                info!(backup = %path.display(), "Backed up working set");
            }
        }

        let batch_size = self.config.checkpoint.batch_size.max(1);
        let concurrency = self.config.global_concurrency.max(1);

        for (n, batch) in ready.chunks(batch_size).enumerate() {
            let wanted: HashSet<usize> = batch.iter().copied().collect();
            let outcomes: Vec<ItemOutcome> = stream::iter(
                items
                    .iter_mut()
                    .enumerate()
                    .filter(|(i, _)| wanted.contains(i))
                    .map(|(_, item)| self.process(item, run, run_id, options.dry_run)),
            )
            .buffer_unordered(concurrency)
            .collect()
            .await;

            for outcome in &outcomes {
                summary.absorb(outcome);
            }
            summary.batches += 1;

            if !options.dry_run {
                checkpoint.save(items).await?;
            }
            info!(
                run_id = %run_id,
                batch = n + 1,
                size = batch.len(),
                completed = summary.completed,
                failed = summary.failed + summary.parse_failed,
                "Batch done"
            );
        }

        info!(
            run_id = %run_id,
            stage = summary.stage,
            completed = summary.completed,
            parse_failed = summary.parse_failed,
            failed = summary.failed,
            skipped = summary.skipped,
            calls = summary.calls,
            "Stage run finished"
        );
        Ok(summary)
    }

    // =========================================================================
    // One item
    // =========================================================================

    async fn process(
        &self,
        item: &mut Item,
        run: StageRun,
        run_id: Uuid,
        dry_run: bool,
    ) -> ItemOutcome {
        let def = self.graph.definition(run.kind);
        let slot = def.slot(run.alternate);
        let mut trace = CallTrace::new(run_id, run.kind.as_str(), slot, &item.id, TraceOutcome::Skipped);

        let plan = self
            .prompts
            .build(item, def, run)
            .and_then(|prompt| self.conversations.plan(item, def, run, &prompt));
        let Some(plan) = plan else {
            debug!(item = %item.id, slot, "No prompt; skipping");
            return self.finish(trace, 0);
        };

        let cap_key = def.cap_key(run.alternate);
        let max_tokens = self.config.budget.budget(&plan.input, cap_key);

        if dry_run {
            trace.outcome = TraceOutcome::DryRun;
            trace.mode = Some(plan.mode.label());
            trace.resource = plan.pinned_resource().map(str::to_string);
            trace.max_output_tokens = Some(max_tokens);
            trace.estimated_input_tokens = Some(self.config.budget.estimate_input_tokens(&plan.input));
            trace.input_chars = Some(plan.input.chars().count());
            trace.input = Some(plan.input);
            return self.finish(trace, 0);
        }

        self.call_until_settled(item, def, run, run_id, plan, max_tokens, trace)
            .await
    }

    /// Drive one logical call through the retry policy.
    #[allow(clippy::too_many_arguments)]
    async fn call_until_settled(
        &self,
        item: &mut Item,
        def: &StageDefinition,
        run: StageRun,
        run_id: Uuid,
        mut plan: ConversationPlan,
        mut max_tokens: u32,
        mut trace: CallTrace,
    ) -> ItemOutcome {
        let slot = def.slot(run.alternate);
        let cap_key = def.cap_key(run.alternate);
        let output = def.output_for(run.alternate);
        let mut state = RetryState::default();
        let mut calls = 0u32;
        let mut last_class = ErrorClass::Fatal;

        loop {
            trace.mode = Some(plan.mode.label());
            trace.max_output_tokens = Some(max_tokens);
            trace.estimated_input_tokens = Some(self.config.budget.estimate_input_tokens(&plan.input));
            trace.input_chars = Some(plan.input.chars().count());

            let resource = match self.pool.pick(plan.pinned_resource()) {
                Ok(resource) => resource,
                Err(e) => {
                    trace.outcome = TraceOutcome::Failed;
                    trace.error_class = Some(ErrorClass::Fatal);
                    trace.error = Some(e.to_string());
                    return self.finish(trace, calls);
                }
            };
            trace.resource = Some(resource.clone());

            let mut req = ChatRequest::new(
                resource.clone(),
                plan.input.clone(),
                Attribution::new(CALLER)
                    .with_run(run_id)
                    .with_item(item.id.clone())
                    .with_stage(slot),
            )
            .temperature(self.config.api.temperature)
            .max_output_tokens(max_tokens)
            .streaming(self.config.api.stream);
            if let Some(session) = plan.session() {
                req = req.continuing(session);
            }

            debug!(
                item = %item.id,
                slot,
                resource = %resource,
                chained = plan.is_chained(),
                input_chars = plan.input.chars().count(),
                max_tokens,
                "Sending request"
            );

            let result = {
                let permits = match self.pool.acquire_global().await {
                    Ok(global) => self.pool.acquire(&resource).await.map(|r| (global, r)),
                    Err(e) => Err(e),
                };
                let _permits = match permits {
                    Ok(p) => p,
                    Err(e) => {
                        trace.outcome = TraceOutcome::Failed;
                        trace.error_class = Some(ErrorClass::Fatal);
                        trace.error = Some(e.to_string());
                        return self.finish(trace, calls);
                    }
                };
                calls += 1;
                self.gateway.chat(req).await
            };

            let class = match result {
                Ok(resp) => {
                    self.touch_heartbeat().await;
                    let raw = resp.content();
                    match parse(&raw, &output) {
                        Ok(parsed) => {
                            item.set_result(slot, parsed.into_value());
                            self.conversations.record(
                                item,
                                def,
                                run,
                                resp.response_id.as_deref(),
                                &resource,
                            );
                            trace.outcome = TraceOutcome::Completed;
                            trace.fallback_used = state.fallback_used;
                            trace.error_class = None;
                            trace.error = None;
                            trace.raw = None;
                            info!(
                                item = %item.id,
                                slot,
                                resource = %resource,
                                calls,
                                "Item completed"
                            );
                            return self.finish(trace, calls);
                        }
                        Err(e) => {
                            warn!(item = %item.id, slot, reason = %e.reason, "Unparseable output");
                            trace.error = Some(e.to_string());
                            trace.raw = Some(e.raw);
                            ErrorClass::Malformed
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        item = %item.id,
                        slot,
                        resource = %resource,
                        code = e.code(),
                        error = %e,
                        "Backend call failed"
                    );
                    trace.error = Some(e.to_string());
                    e.class()
                }
            };
            last_class = class;
            trace.error_class = Some(class);

            match self.config.retry.decide(class, plan.is_chained(), &mut state) {
                RetryDecision::RetrySame { delay } => {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                RetryDecision::ShrinkBudget => match self.config.budget.shrink(max_tokens) {
                    Some(next) => {
                        debug!(item = %item.id, from = max_tokens, to = next, "Shrinking output budget");
                        max_tokens = next;
                    }
                    None => {
                        trace.outcome = TraceOutcome::Failed;
                        break;
                    }
                },
                RetryDecision::Fallback => match self.conversations.demote(item, def, run, &plan) {
                    Some(fresh) => {
                        info!(item = %item.id, slot, "Session rejected; retrying with full context");
                        trace.fallback_used = true;
                        max_tokens = self.config.budget.budget(&fresh.input, cap_key);
                        plan = fresh;
                    }
                    None => {
                        trace.outcome = TraceOutcome::Failed;
                        break;
                    }
                },
                RetryDecision::GiveUp { reason } => {
                    trace.outcome = match reason {
                        GiveUpReason::Exhausted(ErrorClass::Malformed) => TraceOutcome::ParseFailed,
                        _ => TraceOutcome::Failed,
                    };
                    break;
                }
            }
        }

        trace.fallback_used = state.fallback_used;
        warn!(
            item = %item.id,
            slot,
            calls,
            class = last_class.as_str(),
            "Giving up on item"
        );
        self.finish(trace, calls)
    }

    fn finish(&self, mut trace: CallTrace, calls: u32) -> ItemOutcome {
        trace.calls = calls;
        let outcome = trace.outcome;
        if let Err(e) = self.trace.record(trace) {
            warn!(error = %e, "Failed to record trace");
        }
        ItemOutcome { outcome, calls }
    }

    async fn touch_heartbeat(&self) {
        let Some(path) = self.config.heartbeat_path.as_deref() else {
            return;
        };
        if let Err(e) = write_heartbeat(path).await {
            warn!(path = %path.display(), error = %e, "Failed to touch heartbeat");
        }
    }
}

async fn write_heartbeat(path: &Path) -> std::io::Result<()> {
    tokio::fs::write(path, chrono::Utc::now().to_rfc3339()).await
}
