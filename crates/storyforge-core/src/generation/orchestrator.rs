//! Multi-candidate generation for one unit.
//!
//! A batch runs in three steps:
//!
//! 1. Under the project's shared guard, check the phase, record the epoch and
//!    persist `generating` so an interrupted run is visible.
//! 2. Dispatch one task per slot. Slot ids are fixed before dispatch. Every
//!    attempt waits for a gate permit, then issues the request with the
//!    configured timeout, then gives the permit back before any backoff.
//! 3. Under the shared guard again, discard the batch if a rollback bumped
//!    the epoch meanwhile; otherwise persist the successful candidates and
//!    move the unit on (`evaluating`/`selecting`, or `failed` when nothing
//!    succeeded).
//!
//! At most one generate, retry or select runs per unit at a time; a second
//! caller gets `UnitBusy` instead of queueing.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, info, warn};

use super::backend::{BackendErrorKind, BackendResult, GenerationBackend, GenerationRequest};
use super::evaluator::Evaluator;
use super::gate::ConcurrencyGate;
use super::metadata::{summarize, word_count};
use super::prompt::{RenderedPrompt, render_prompt};
use crate::circuit_breaker::{
    CallOutcome, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus,
};
use crate::config::GenerationConfig;
use crate::context::LayeredContext;
use crate::coordination::{CancelToken, Coordination, KeyedMutex, KeyedMutexGuard};
use crate::error::{
    BatchFailureReport, Error, GenerationError, LifecycleError, Result, SlotFailure, StorageError,
};
use crate::invalidation::CascadeInvalidator;
use crate::lifecycle::Operation;
use crate::model::{
    Candidate, CandidateId, GenerationStatus, NewCandidate, Unit, UnitKey, now_epoch_ms,
};
use crate::retry::{RetryPolicy, is_transient, retry_transient, run_with_retry};
use crate::search::{Indexer, ReindexReport};
use crate::sf_span;
use crate::store::SharedStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SlotOutcome {
    Succeeded { candidate_id: CandidateId },
    Failed { last_error: String },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotReport {
    pub slot: u32,
    pub attempts: u32,
    pub outcome: SlotOutcome,
}

/// Per-slot result of a batch that produced at least one candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateReport {
    pub unit: UnitKey,
    pub status: GenerationStatus,
    pub attempt: u32,
    pub requested: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub cancelled: bool,
    pub slots: Vec<SlotReport>,
}

impl GenerateReport {
    #[must_use]
    pub fn candidate_ids(&self) -> Vec<CandidateId> {
        self.slots
            .iter()
            .filter_map(|slot| match slot.outcome {
                SlotOutcome::Succeeded { candidate_id } => Some(candidate_id),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectReport {
    pub unit: UnitKey,
    pub selected: CandidateId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<CandidateId>,
    pub status: GenerationStatus,
    /// `None` when the stored chunks already matched the selection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reindex: Option<ReindexReport>,
    /// Set when reindexing failed; the unit then has no chunks until the
    /// next successful reindex.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_error: Option<String>,
}

struct SlotResult {
    slot: u32,
    attempts: u32,
    result: Result<String>,
}

/// How a finished batch updates the unit.
#[derive(Clone, Copy)]
struct BatchPlan {
    requested: u32,
    attempt: u32,
    on_total_failure: GenerationStatus,
    /// The unit is `done` and stays `done`; only candidates are appended.
    keep_done: bool,
}

/// What one slot task needs to call the backend.
#[derive(Clone)]
struct SlotCaller {
    backend: Arc<dyn GenerationBackend>,
    gate: Arc<ConcurrencyGate>,
    circuit: Arc<Mutex<CircuitBreaker>>,
}

impl SlotCaller {
    fn circuit(&self) -> MutexGuard<'_, CircuitBreaker> {
        match self.circuit.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn call(&self, request: &GenerationRequest, token: &CancelToken) -> Result<String> {
        let cancelled = || Error::Cancelled(format!("slot {} was not issued", request.slot));
        if token.is_cancelled() {
            return Err(cancelled());
        }
        {
            let mut circuit = self.circuit();
            if !circuit.allow() {
                return Err(GenerationError::CircuitOpen {
                    retry_after_ms: circuit.retry_after_ms(),
                }
                .into());
            }
        }

        let mut watcher = token.clone();
        let permit = tokio::select! {
            biased;
            () = watcher.cancelled() => None,
            permit = self.gate.acquire() => Some(permit),
        };
        let permit = match permit {
            Some(Ok(permit)) => permit,
            Some(Err(err)) => {
                self.circuit().abandon();
                return Err(err);
            }
            None => {
                self.circuit().abandon();
                return Err(cancelled());
            }
        };

        let started = Instant::now();
        let reply = match tokio::time::timeout(request.timeout(), self.backend.complete(request)).await
        {
            Ok(reply) => reply,
            Err(_) => BackendResult::error(
                BackendErrorKind::Timeout,
                format!("no reply within {} ms", request.timeout_ms),
            ),
        };
        drop(permit);

        self.circuit().record(match &reply {
            BackendResult::Ok { .. } => CallOutcome::Success,
            BackendResult::Error { kind, .. } => CallOutcome::Failure(*kind),
        });
        debug!(
            backend = self.backend.name(),
            ok = reply.is_ok(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Backend call finished"
        );
        reply.into_result().map_err(Error::from)
    }
}

/// Text for a slot's `last_error`, without the crate-level prefixes.
fn slot_error_text(err: &Error) -> String {
    match err {
        Error::Generation(GenerationError::Backend { kind, message }) => {
            format!("{kind}: {message}")
        }
        Error::Generation(inner) => inner.to_string(),
        Error::Cancelled(_) => "cancelled".to_string(),
        other => other.to_string(),
    }
}

pub struct GenerationOrchestrator {
    store: SharedStore,
    caller: SlotCaller,
    evaluator: Option<Arc<dyn Evaluator>>,
    indexer: Arc<Indexer>,
    invalidator: Arc<CascadeInvalidator>,
    coordination: Arc<Coordination>,
    config: GenerationConfig,
    retry: RetryPolicy,
    unit_ops: KeyedMutex<UnitKey>,
}

impl GenerationOrchestrator {
    #[must_use]
    pub fn new(
        store: SharedStore,
        backend: Arc<dyn GenerationBackend>,
        gate: Arc<ConcurrencyGate>,
        indexer: Arc<Indexer>,
        invalidator: Arc<CascadeInvalidator>,
        coordination: Arc<Coordination>,
        config: GenerationConfig,
    ) -> Self {
        let circuit =
            CircuitBreaker::new(backend.name(), CircuitBreakerConfig::generation(&config));
        Self {
            store,
            caller: SlotCaller {
                backend,
                gate,
                circuit: Arc::new(Mutex::new(circuit)),
            },
            evaluator: None,
            indexer,
            invalidator,
            coordination,
            retry: RetryPolicy::generation(&config),
            config,
            unit_ops: KeyedMutex::new(),
        }
    }

    #[must_use]
    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        &self.caller.gate
    }

    #[must_use]
    pub fn circuit_status(&self) -> CircuitBreakerStatus {
        self.caller.circuit().status()
    }

    async fn lock_unit(&self, unit: &UnitKey) -> Result<KeyedMutexGuard<UnitKey>> {
        if let Some(guard) = self.unit_ops.try_lock(unit) {
            return Ok(guard);
        }
        let status = self
            .store
            .unit(unit)
            .await?
            .map_or(GenerationStatus::Generating, |u| u.status);
        Err(GenerationError::UnitBusy {
            unit: unit.clone(),
            status,
        }
        .into())
    }

    /// Current epoch, provided the phase permits `operation`.
    async fn permitted_epoch(&self, project_id: &str, operation: Operation) -> Result<u64> {
        let state = self
            .store
            .project_state(project_id)
            .await?
            .ok_or_else(|| LifecycleError::ProjectNotFound(project_id.to_string()))?;
        if !operation.permitted_in(state.phase) {
            return Err(LifecycleError::OperationNotPermitted {
                operation: operation.to_string(),
                phase: state.phase,
            }
            .into());
        }
        Ok(state.epoch)
    }

    async fn existing_unit(&self, unit: &UnitKey) -> Result<Unit> {
        self.store
            .unit(unit)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("unit {unit}")).into())
    }

    /// Move `record` into `generating` for a new batch of `slots`. Returns
    /// the batch's attempt index.
    fn enter_generating(record: &mut Unit, slots: u32, regenerate: bool) -> Result<u32> {
        let from = record.status;
        if from.is_busy() {
            // the per-unit lock is held, so no live batch owns this state
            warn!(unit = %record.key, status = %from, "Recovering unit left busy by an interrupted run");
        } else if (from == GenerationStatus::Done && !regenerate)
            || !from.can_transition(GenerationStatus::Generating)
        {
            return Err(GenerationError::InvalidStatusTransition {
                unit: record.key.clone(),
                from,
                to: GenerationStatus::Generating,
            }
            .into());
        }
        let attempt = record.next_attempt;
        record.next_attempt += 1;
        record.status = GenerationStatus::Generating;
        record.last_batch_slots = slots;
        record.last_failure = None;
        record.updated_at = now_epoch_ms();
        Ok(attempt)
    }

    /// Generate `n` candidates for a unit that has no finalized selection.
    pub async fn generate(
        &self,
        unit: &UnitKey,
        n: u32,
        context: &LayeredContext,
    ) -> Result<GenerateReport> {
        let span = sf_span!(
            "generate_unit",
            project_id = unit.project_id.as_str(),
            unit = unit.ordinal
        );
        self.run_batch(unit, n.max(1), context, false)
            .instrument(span)
            .await
    }

    /// Start over on a unit: drop what its selection produced, clear the
    /// selection and generate a fresh batch.
    pub async fn regenerate(
        &self,
        unit: &UnitKey,
        n: u32,
        context: &LayeredContext,
    ) -> Result<GenerateReport> {
        let span = sf_span!(
            "regenerate_unit",
            project_id = unit.project_id.as_str(),
            unit = unit.ordinal
        );
        self.run_batch(unit, n.max(1), context, true)
            .instrument(span)
            .await
    }

    async fn run_batch(
        &self,
        unit: &UnitKey,
        n: u32,
        context: &LayeredContext,
        regenerate: bool,
    ) -> Result<GenerateReport> {
        let _op = self.lock_unit(unit).await?;
        let token = self.coordination.cancels.token(&unit.project_id);
        let (epoch, attempt) = {
            let _shared = self.coordination.projects.shared(&unit.project_id).await;
            let epoch = self
                .permitted_epoch(&unit.project_id, Operation::GenerateUnit)
                .await?;
            let mut record = self
                .store
                .unit(unit)
                .await?
                .unwrap_or_else(|| Unit::new(unit.clone()));
            let had_selection = regenerate && record.selected.is_some();
            let attempt = Self::enter_generating(&mut record, n, regenerate)?;
            if had_selection {
                record.selected = None;
            }
            self.store.put_unit(&record).await?;
            // cleared first, so a reindex that starts now finds no selection
            if had_selection {
                self.invalidator.invalidate_selection(unit).await?;
                self.invalidator
                    .refresh_entities_from(&unit.project_id, unit.ordinal)
                    .await?;
            }
            (epoch, attempt)
        };
        info!(slots = n, attempt, regenerate, "Generation started");

        let slots: Vec<u32> = (0..n).collect();
        let results = self
            .dispatch(unit, &slots, attempt, &render_prompt(context), &token)
            .await;
        let plan = BatchPlan {
            requested: n,
            attempt,
            on_total_failure: GenerationStatus::Failed,
            keep_done: false,
        };
        self.finish(unit, plan, results, epoch, token.is_cancelled())
            .await
    }

    /// Re-run exactly one slot of the unit's last batch.
    ///
    /// Other candidates are untouched. A `done` unit keeps its selection and
    /// status; the new candidate is only appended.
    pub async fn retry_one(
        &self,
        unit: &UnitKey,
        slot: u32,
        context: &LayeredContext,
    ) -> Result<GenerateReport> {
        let span = sf_span!(
            "retry_slot",
            project_id = unit.project_id.as_str(),
            unit = unit.ordinal,
            slot = slot
        );
        self.run_retry(unit, slot, context).instrument(span).await
    }

    async fn run_retry(
        &self,
        unit: &UnitKey,
        slot: u32,
        context: &LayeredContext,
    ) -> Result<GenerateReport> {
        let _op = self.lock_unit(unit).await?;
        let token = self.coordination.cancels.token(&unit.project_id);
        let (epoch, attempt, prior) = {
            let _shared = self.coordination.projects.shared(&unit.project_id).await;
            let epoch = self
                .permitted_epoch(&unit.project_id, Operation::GenerateUnit)
                .await?;
            let mut record = self.existing_unit(unit).await?;
            if slot >= record.last_batch_slots {
                return Err(GenerationError::SlotOutOfRange {
                    unit: unit.clone(),
                    slot,
                    slots: record.last_batch_slots,
                }
                .into());
            }
            let prior = record.status;
            let attempt = record.next_attempt;
            record.next_attempt += 1;
            if prior != GenerationStatus::Done {
                record.status = GenerationStatus::Generating;
            }
            record.updated_at = now_epoch_ms();
            self.store.put_unit(&record).await?;
            (epoch, attempt, prior)
        };
        info!(attempt, prior = %prior, "Retrying slot");

        let results = self
            .dispatch(unit, &[slot], attempt, &render_prompt(context), &token)
            .await;
        let plan = BatchPlan {
            requested: 1,
            attempt,
            on_total_failure: if prior.is_busy() {
                GenerationStatus::Failed
            } else {
                prior
            },
            keep_done: prior == GenerationStatus::Done,
        };
        self.finish(unit, plan, results, epoch, token.is_cancelled())
            .await
    }

    /// Finalize `candidate_id` as the unit's text and bring the index and
    /// entity snapshots in line with it.
    pub async fn select(&self, unit: &UnitKey, candidate_id: CandidateId) -> Result<SelectReport> {
        let _op = self.lock_unit(unit).await?;
        let _shared = self.coordination.projects.shared(&unit.project_id).await;
        self.permitted_epoch(&unit.project_id, Operation::SelectCandidate)
            .await?;

        let record = self.existing_unit(unit).await?;
        if record.status.is_busy() {
            return Err(GenerationError::UnitBusy {
                unit: unit.clone(),
                status: record.status,
            }
            .into());
        }
        if !record.status.can_transition(GenerationStatus::Done) {
            return Err(GenerationError::InvalidStatusTransition {
                unit: unit.clone(),
                from: record.status,
                to: GenerationStatus::Done,
            }
            .into());
        }
        let candidate = self
            .store
            .candidate(candidate_id)
            .await?
            .filter(|c| &c.unit == unit)
            .ok_or_else(|| GenerationError::ForeignCandidate {
                unit: unit.clone(),
                candidate_id: candidate_id.to_string(),
            })?;

        let previous = record.selected;
        let committed = self
            .store
            .commit_selection(unit, Some(candidate_id), GenerationStatus::Done)
            .await?;
        info!(
            unit = %unit,
            candidate_id = %candidate_id,
            previous = ?previous,
            "Candidate selected"
        );

        // chunks of any other candidate stop matching before reindexing
        let (reindex, index_error) = match self
            .indexer
            .refresh_if_stale(unit, candidate_id, &candidate.text)
            .await
        {
            Ok(report) => (report, None),
            Err(err) => {
                warn!(unit = %unit, error = %err, "Reindex after selection failed");
                if let Err(cleanup) = self.invalidator.invalidate_unit_chunks(unit).await {
                    warn!(unit = %unit, error = %cleanup, "Could not drop old chunks");
                }
                (None, Some(err.to_string()))
            }
        };
        if let Err(err) = self
            .invalidator
            .refresh_entities_from(&unit.project_id, unit.ordinal)
            .await
        {
            warn!(unit = %unit, error = %err, "Entity snapshot rebuild failed");
        }

        Ok(SelectReport {
            unit: unit.clone(),
            selected: candidate_id,
            previous,
            status: committed.status,
            reindex,
            index_error,
        })
    }

    /// Delete a unit and everything derived from it. Refused while a
    /// generation or selection on the unit is running.
    pub async fn delete_unit(&self, unit: &UnitKey) -> Result<bool> {
        let _op = self.lock_unit(unit).await?;
        let _shared = self.coordination.projects.shared(&unit.project_id).await;
        self.permitted_epoch(&unit.project_id, Operation::DeleteUnit)
            .await?;
        self.invalidator.delete_unit(unit).await
    }

    async fn dispatch(
        &self,
        unit: &UnitKey,
        slots: &[u32],
        attempt: u32,
        prompt: &RenderedPrompt,
        token: &CancelToken,
    ) -> Vec<SlotResult> {
        let mut tasks = JoinSet::new();
        for &slot in slots {
            let request = GenerationRequest {
                unit: unit.clone(),
                slot,
                attempt,
                system: prompt.system.clone(),
                prompt: prompt.user.clone(),
                model: self.config.model.clone(),
                temperature: self.config.temperature,
                max_output_tokens: self.config.max_output_tokens,
                timeout_ms: self.config.request_timeout_ms,
            };
            let caller = self.caller.clone();
            let retry = self.retry.clone();
            let token = token.clone();
            let span = sf_span!("generation_slot", slot = slot);
            tasks.spawn(
                async move {
                    let outcome =
                        run_with_retry(&retry, is_transient, || caller.call(&request, &token))
                            .await;
                    SlotResult {
                        slot: request.slot,
                        attempts: outcome.attempts,
                        result: outcome.result,
                    }
                }
                .instrument(span),
            );
        }

        let mut results = Vec::with_capacity(slots.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => warn!(error = %err, "Generation slot task aborted"),
            }
        }
        for &slot in slots {
            if !results.iter().any(|r| r.slot == slot) {
                results.push(SlotResult {
                    slot,
                    attempts: 0,
                    result: Err(Error::Runtime("slot task aborted".to_string())),
                });
            }
        }
        results.sort_by_key(|r| r.slot);
        results
    }

    async fn finish(
        &self,
        unit: &UnitKey,
        plan: BatchPlan,
        results: Vec<SlotResult>,
        epoch: u64,
        cancelled: bool,
    ) -> Result<GenerateReport> {
        let _shared = self.coordination.projects.shared(&unit.project_id).await;
        let current = self
            .store
            .project_state(&unit.project_id)
            .await?
            .map(|state| state.epoch);
        if current != Some(epoch) {
            warn!(unit = %unit, "Project rolled back during generation; batch discarded");
            return Err(Error::Cancelled(format!(
                "project {} was rolled back while {unit} was generating; output discarded",
                unit.project_id
            )));
        }
        let mut record = self.existing_unit(unit).await?;

        let mut slots = Vec::with_capacity(results.len());
        let mut created: Vec<Candidate> = Vec::new();
        let mut failures = Vec::new();
        for result in results {
            match result.result {
                Ok(text) => {
                    let stored = self
                        .store
                        .append_candidate(&NewCandidate {
                            unit: unit.clone(),
                            slot: result.slot,
                            attempt: plan.attempt,
                            word_count: word_count(&text),
                            summary: summarize(&text),
                            text,
                        })
                        .await;
                    let candidate = match stored {
                        Ok(candidate) => candidate,
                        Err(err) => {
                            failures.push(SlotFailure {
                                slot: result.slot,
                                attempts: result.attempts,
                                last_error: format!("not stored: {}", slot_error_text(&err)),
                            });
                            let report = BatchFailureReport {
                                unit: unit.clone(),
                                requested: plan.requested,
                                failed: failures.len() as u32,
                                cancelled,
                                slots: failures,
                            };
                            self.abandon_batch(record, plan.on_total_failure, report, created.len())
                                .await;
                            return Err(err);
                        }
                    };
                    debug!(
                        slot = result.slot,
                        candidate_id = %candidate.id,
                        words = candidate.word_count,
                        "Candidate stored"
                    );
                    slots.push(SlotReport {
                        slot: result.slot,
                        attempts: result.attempts,
                        outcome: SlotOutcome::Succeeded {
                            candidate_id: candidate.id,
                        },
                    });
                    created.push(candidate);
                }
                Err(err) => {
                    let last_error = slot_error_text(&err);
                    warn!(
                        slot = result.slot,
                        attempts = result.attempts,
                        error = %last_error,
                        "Candidate slot failed"
                    );
                    let outcome = if matches!(err, Error::Cancelled(_)) {
                        SlotOutcome::Cancelled
                    } else {
                        SlotOutcome::Failed {
                            last_error: last_error.clone(),
                        }
                    };
                    slots.push(SlotReport {
                        slot: result.slot,
                        attempts: result.attempts,
                        outcome,
                    });
                    failures.push(SlotFailure {
                        slot: result.slot,
                        attempts: result.attempts,
                        last_error,
                    });
                }
            }
        }

        let report = BatchFailureReport {
            unit: unit.clone(),
            requested: plan.requested,
            failed: failures.len() as u32,
            cancelled,
            slots: failures,
        };

        if created.is_empty() {
            record.status = plan.on_total_failure;
            record.last_failure = Some(report.clone());
            record.updated_at = now_epoch_ms();
            self.persist_outcome(&record).await?;
            warn!(
                failed = report.failed,
                requested = report.requested,
                cancelled,
                "Every candidate slot failed"
            );
            return Err(GenerationError::BatchFailed(report).into());
        }

        let failed = report.failed;
        record.last_failure = (failed > 0).then_some(report);
        if let Some(evaluator) = &self.evaluator {
            if !plan.keep_done {
                record.status = GenerationStatus::Evaluating;
                record.updated_at = now_epoch_ms();
                self.store.put_unit(&record).await?;
            }
            self.evaluate(evaluator.as_ref(), unit, &created).await;
        }
        if !plan.keep_done {
            record.status = GenerationStatus::Selecting;
        }
        record.updated_at = now_epoch_ms();
        self.persist_outcome(&record).await?;
        info!(
            succeeded = created.len(),
            failed,
            status = %record.status,
            "Generation finished"
        );

        Ok(GenerateReport {
            unit: unit.clone(),
            status: record.status,
            attempt: plan.attempt,
            requested: plan.requested,
            succeeded: created.len() as u32,
            failed,
            cancelled,
            slots,
        })
    }

    /// Leave the unit in `status` with `report` after the batch could not be
    /// persisted. Candidates stored before the failure stay.
    async fn abandon_batch(
        &self,
        mut record: Unit,
        status: GenerationStatus,
        report: BatchFailureReport,
        stored: usize,
    ) {
        record.status = status;
        record.last_failure = Some(report);
        record.updated_at = now_epoch_ms();
        if let Err(err) = self.persist_outcome(&record).await {
            warn!(unit = %record.key, error = %err, "Could not record abandoned batch");
        }
        warn!(unit = %record.key, stored, status = %status, "Candidate write failed; batch abandoned");
    }

    /// Final status write of a batch. Candidates are already stored, so a
    /// busy database is waited out rather than leaving the unit `generating`.
    async fn persist_outcome(&self, record: &Unit) -> Result<()> {
        retry_transient(&RetryPolicy::db_write(), || self.store.put_unit(record)).await
    }

    async fn evaluate(&self, evaluator: &dyn Evaluator, unit: &UnitKey, candidates: &[Candidate]) {
        let outline = match self.store.bible(&unit.project_id).await {
            Ok(bible) => bible.and_then(|b| b.outline_entry(unit.ordinal).cloned()),
            Err(err) => {
                warn!(error = %err, "Could not load outline for evaluation");
                None
            }
        };
        for candidate in candidates {
            match evaluator.evaluate(candidate, outline.as_ref()).await {
                Ok(evaluation) => {
                    debug!(
                        candidate_id = %candidate.id,
                        evaluator = evaluator.name(),
                        score = evaluation.score,
                        "Candidate evaluated"
                    );
                    if let Err(err) = self.store.set_evaluation(candidate.id, &evaluation).await {
                        warn!(candidate_id = %candidate.id, error = %err, "Could not store evaluation");
                    }
                }
                Err(err) => {
                    warn!(
                        candidate_id = %candidate.id,
                        error = %err,
                        "Evaluation failed; candidate remains selectable"
                    );
                }
            }
        }
    }
}
