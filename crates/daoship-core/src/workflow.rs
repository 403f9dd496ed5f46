//! Step workflow engine.
//!
//! A workflow is an ordered list of named steps executed strictly one at a
//! time. Each step moves `pending -> running -> {succeeded | failed}`; the
//! workflow moves `idle -> in_progress -> {completed | failed | aborted}`.
//!
//! Every transition publishes a full, immutable [`WorkflowSnapshot`] on the
//! [`SnapshotStream`] returned by [`StepEngine::start`]. The stream is finite:
//! it ends once the run reaches a terminal state with no step in flight, or
//! when a later `start` supersedes the run.
//!
//! Each `start` opens a new generation. Results of actions that resolve after
//! their generation was superseded are dropped, never applied to the new run.
//! Aborting only stops new steps from starting; an action already in flight
//! still has its outcome recorded, since a submitted ledger operation cannot
//! be taken back. A `run_step` future dropped mid-action marks its step
//! failed with [`ABANDONED_DETAIL`], so the run still ends.

use crate::error::WorkflowError;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;

// ── Identifiers ──────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error detail recorded for a step whose action was dropped unfinished.
pub const ABANDONED_DETAIL: &str = "step abandoned before its action completed";

/// Handle for one generation of a workflow run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunToken {
    generation: u64,
}

impl RunToken {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

// ── Steps and states ─────────────────────────────────────────────────

/// Declared step, before it has any runtime state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepDefinition {
    pub id: String,
    pub title: String,
    pub description: String,
}

impl StepDefinition {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowStep {
    fn pending(definition: StepDefinition) -> Self {
        Self {
            id: definition.id,
            title: definition.title,
            description: definition.description,
            status: StepStatus::Pending,
            result_ref: None,
            error_detail: None,
            started_at: None,
            finished_at: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Idle,
    InProgress,
    Completed,
    Failed,
    Aborted,
}

impl WorkflowState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

/// Full, immutable view of a workflow run after one transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub workflow_id: WorkflowId,
    pub generation: u64,
    /// Position of this snapshot within its generation, starting at 0.
    pub sequence: u64,
    pub state: WorkflowState,
    pub steps: Vec<WorkflowStep>,
    pub captured_at: DateTime<Utc>,
}

impl WorkflowSnapshot {
    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|step| step.id == id)
    }

    pub fn status_of(&self, id: &str) -> Option<StepStatus> {
        self.step(id).map(|step| step.status)
    }

    pub fn running_step(&self) -> Option<&WorkflowStep> {
        self.steps
            .iter()
            .find(|step| step.status == StepStatus::Running)
    }

    pub fn failed_step(&self) -> Option<&WorkflowStep> {
        self.steps
            .iter()
            .find(|step| step.status == StepStatus::Failed)
    }

    pub fn next_pending(&self) -> Option<&WorkflowStep> {
        self.steps
            .iter()
            .find(|step| step.status == StepStatus::Pending)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

// ── Snapshot stream ──────────────────────────────────────────────────

/// Lazy, finite sequence of snapshots for one generation.
///
/// Cannot be restarted; a new run yields a new stream.
#[derive(Debug)]
pub struct SnapshotStream {
    rx: mpsc::UnboundedReceiver<WorkflowSnapshot>,
}

impl SnapshotStream {
    pub async fn next_snapshot(&mut self) -> Option<WorkflowSnapshot> {
        self.rx.recv().await
    }

    /// Drain until the run closes the stream.
    pub async fn collect_all(mut self) -> Vec<WorkflowSnapshot> {
        let mut snapshots = Vec::new();
        while let Some(snapshot) = self.rx.recv().await {
            snapshots.push(snapshot);
        }
        snapshots
    }
}

impl Stream for SnapshotStream {
    type Item = WorkflowSnapshot;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

// ── Step results ─────────────────────────────────────────────────────

/// Value produced by a successful step; its reference is shown on the step.
pub trait StepReport {
    fn result_ref(&self) -> Option<String>;
}

impl StepReport for () {
    fn result_ref(&self) -> Option<String> {
        None
    }
}

impl StepReport for String {
    fn result_ref(&self) -> Option<String> {
        Some(self.clone())
    }
}

/// Error produced by a failed step.
pub trait StepCause: fmt::Display {
    /// Set when the step failed because a bounded call ran out of time.
    fn timed_out(&self) -> Option<Duration> {
        None
    }
}

impl StepCause for String {}

/// Why `run_step` did not produce a value.
#[derive(Debug)]
pub enum StepRunError<E> {
    /// The engine refused the step, or dropped a superseded result.
    Refused(WorkflowError),
    /// The action ran and failed; the step is now `failed`.
    Failed { step_id: String, cause: E },
}

impl<E: StepCause> StepRunError<E> {
    pub fn to_workflow_error(&self) -> WorkflowError {
        match self {
            Self::Refused(err) => err.clone(),
            Self::Failed { step_id, cause } => match cause.timed_out() {
                Some(after) => WorkflowError::Timeout {
                    step_id: step_id.clone(),
                    after,
                },
                None => WorkflowError::StepFailed {
                    step_id: step_id.clone(),
                    cause: cause.to_string(),
                },
            },
        }
    }
}

impl<E> From<WorkflowError> for StepRunError<E> {
    fn from(err: WorkflowError) -> Self {
        Self::Refused(err)
    }
}

// ── Engine ───────────────────────────────────────────────────────────

#[derive(Debug)]
struct EngineState {
    workflow_id: WorkflowId,
    generation: u64,
    state: WorkflowState,
    steps: Vec<WorkflowStep>,
    sequence: u64,
    abort_reason: Option<String>,
    last: Option<WorkflowSnapshot>,
    sink: Option<mpsc::UnboundedSender<WorkflowSnapshot>>,
}

impl EngineState {
    fn snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot {
            workflow_id: self.workflow_id.clone(),
            generation: self.generation,
            sequence: self.sequence,
            state: self.state,
            steps: self.steps.clone(),
            captured_at: Utc::now(),
        }
    }

    fn has_running_step(&self) -> bool {
        self.steps
            .iter()
            .any(|step| step.status == StepStatus::Running)
    }

    fn emit(&mut self) -> WorkflowSnapshot {
        let snapshot = self.snapshot();
        self.sequence += 1;
        self.last = Some(snapshot.clone());
        tracing::debug!(
            workflow_id = %self.workflow_id,
            generation = self.generation,
            sequence = snapshot.sequence,
            state = ?snapshot.state,
            "Workflow snapshot"
        );

        if let Some(sink) = &self.sink {
            // A dropped receiver only means nobody is watching.
            let _ = sink.send(snapshot.clone());
        }
        if self.state.is_terminal() && !self.has_running_step() {
            self.sink = None;
        }
        snapshot
    }

    fn check_generation(&self, token: RunToken) -> Result<(), WorkflowError> {
        if token.generation != self.generation {
            return Err(WorkflowError::Superseded {
                stale: token.generation,
                current: self.generation,
            });
        }
        Ok(())
    }

    fn check_runnable(&self, step_id: &str) -> Result<usize, WorkflowError> {
        match self.state {
            WorkflowState::InProgress => {}
            WorkflowState::Aborted => {
                return Err(WorkflowError::Aborted {
                    reason: self.abort_reason.clone().unwrap_or_default(),
                })
            }
            other => return Err(WorkflowError::NotInProgress(other)),
        }

        let index = self
            .steps
            .iter()
            .position(|step| step.id == step_id)
            .ok_or_else(|| WorkflowError::UnknownStep(step_id.to_string()))?;

        if let Some(running) = self
            .steps
            .iter()
            .find(|step| step.status == StepStatus::Running)
        {
            return Err(WorkflowError::OutOfOrder {
                requested: step_id.to_string(),
                expected: Some(running.id.clone()),
            });
        }

        let next = self
            .steps
            .iter()
            .position(|step| step.status == StepStatus::Pending);
        if next != Some(index) {
            return Err(WorkflowError::OutOfOrder {
                requested: step_id.to_string(),
                expected: next.map(|i| self.steps[i].id.clone()),
            });
        }
        Ok(index)
    }
}

/// Sequential step runner with generation-based cancellation.
///
/// Cloning shares the same run; independent workflows use independent engines.
#[derive(Clone, Debug)]
pub struct StepEngine {
    inner: Arc<Mutex<EngineState>>,
}

impl Default for StepEngine {
    fn default() -> Self {
        Self::new(WorkflowId::generate())
    }
}

impl StepEngine {
    pub fn new(workflow_id: WorkflowId) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EngineState {
                workflow_id,
                generation: 0,
                state: WorkflowState::Idle,
                steps: Vec::new(),
                sequence: 0,
                abort_reason: None,
                last: None,
                sink: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        // State is only mutated under short, non-panicking critical sections.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn workflow_id(&self) -> WorkflowId {
        self.lock().workflow_id.clone()
    }

    /// The most recently published snapshot, or an idle one before `start`.
    pub fn snapshot(&self) -> WorkflowSnapshot {
        let state = self.lock();
        state.last.clone().unwrap_or_else(|| state.snapshot())
    }

    /// Begin a new generation with every step `pending`.
    ///
    /// The returned stream yields the initial snapshot first. Any previous
    /// generation is superseded and its stream ends.
    pub fn start(
        &self,
        definitions: Vec<StepDefinition>,
    ) -> Result<(RunToken, SnapshotStream), WorkflowError> {
        if definitions.is_empty() {
            return Err(WorkflowError::InvalidDefinition(
                "workflow needs at least one step".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for definition in &definitions {
            if definition.id.is_empty() {
                return Err(WorkflowError::InvalidDefinition(
                    "step id must not be empty".to_string(),
                ));
            }
            if !seen.insert(definition.id.as_str()) {
                return Err(WorkflowError::InvalidDefinition(format!(
                    "duplicate step id '{}'",
                    definition.id
                )));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        if state.state == WorkflowState::InProgress {
            tracing::info!(
                workflow_id = %state.workflow_id,
                generation = state.generation,
                "Superseding in-progress workflow generation"
            );
        }

        state.generation += 1;
        state.state = WorkflowState::InProgress;
        state.steps = definitions.into_iter().map(WorkflowStep::pending).collect();
        state.sequence = 0;
        state.abort_reason = None;
        state.sink = Some(tx);

        tracing::info!(
            workflow_id = %state.workflow_id,
            generation = state.generation,
            steps = state.steps.len(),
            "Workflow started"
        );
        state.emit();

        Ok((
            RunToken {
                generation: state.generation,
            },
            SnapshotStream { rx },
        ))
    }

    /// Run `action` as step `step_id`.
    ///
    /// The step must be the next pending one and nothing may be running.
    pub async fn run_step<T, E, Fut>(
        &self,
        token: RunToken,
        step_id: &str,
        action: Fut,
    ) -> Result<T, StepRunError<E>>
    where
        T: StepReport,
        E: StepCause,
        Fut: Future<Output = Result<T, E>>,
    {
        let index = {
            let mut state = self.lock();
            state.check_generation(token)?;
            let index = state.check_runnable(step_id)?;

            let step = &mut state.steps[index];
            step.status = StepStatus::Running;
            step.started_at = Some(Utc::now());
            tracing::info!(
                workflow_id = %state.workflow_id,
                generation = token.generation,
                step_id,
                "Step running"
            );
            state.emit();
            index
        };

        let mut in_flight = InFlightStep {
            engine: self,
            token,
            index,
            armed: true,
        };
        let outcome = action.await;
        in_flight.armed = false;

        let mut state = self.lock();
        if let Err(err) = state.check_generation(token) {
            tracing::warn!(
                workflow_id = %state.workflow_id,
                step_id,
                stale_generation = token.generation,
                current_generation = state.generation,
                succeeded = outcome.is_ok(),
                "Dropping step result from superseded generation"
            );
            return Err(StepRunError::Refused(err));
        }

        let now = Utc::now();
        match outcome {
            Ok(value) => {
                let step = &mut state.steps[index];
                step.status = StepStatus::Succeeded;
                step.result_ref = value.result_ref();
                step.finished_at = Some(now);

                let all_done = state
                    .steps
                    .iter()
                    .all(|step| step.status == StepStatus::Succeeded);
                if state.state == WorkflowState::InProgress && all_done {
                    state.state = WorkflowState::Completed;
                }
                tracing::info!(
                    workflow_id = %state.workflow_id,
                    step_id,
                    state = ?state.state,
                    "Step succeeded"
                );
                state.emit();
                Ok(value)
            }
            Err(cause) => {
                let step = &mut state.steps[index];
                step.status = StepStatus::Failed;
                step.error_detail = Some(cause.to_string());
                step.finished_at = Some(now);

                if state.state == WorkflowState::InProgress {
                    state.state = WorkflowState::Failed;
                }
                tracing::warn!(
                    workflow_id = %state.workflow_id,
                    step_id,
                    error = %cause,
                    "Step failed"
                );
                state.emit();
                Err(StepRunError::Failed {
                    step_id: step_id.to_string(),
                    cause,
                })
            }
        }
    }

    /// Fail a step whose action future was dropped while running.
    fn abandon(&self, token: RunToken, index: usize) {
        let mut state = self.lock();
        if state.check_generation(token).is_err() {
            return;
        }
        let Some(step) = state.steps.get_mut(index) else {
            return;
        };
        if step.status != StepStatus::Running {
            return;
        }
        step.status = StepStatus::Failed;
        step.error_detail = Some(ABANDONED_DETAIL.to_string());
        step.finished_at = Some(Utc::now());
        let step_id = step.id.clone();

        if state.state == WorkflowState::InProgress {
            state.state = WorkflowState::Failed;
        }
        tracing::warn!(
            workflow_id = %state.workflow_id,
            generation = token.generation,
            step_id = %step_id,
            "Step abandoned before completion"
        );
        state.emit();
    }

    /// Stop the run from starting further steps.
    pub fn abort(
        &self,
        token: RunToken,
        reason: impl Into<String>,
    ) -> Result<WorkflowSnapshot, WorkflowError> {
        let mut state = self.lock();
        state.check_generation(token)?;
        if state.state != WorkflowState::InProgress {
            return Err(WorkflowError::NotInProgress(state.state));
        }

        let reason = reason.into();
        state.state = WorkflowState::Aborted;
        tracing::warn!(
            workflow_id = %state.workflow_id,
            generation = token.generation,
            in_flight = ?state
                .steps
                .iter()
                .find(|step| step.status == StepStatus::Running)
                .map(|step| step.id.clone()),
            %reason,
            "Workflow aborted"
        );
        state.abort_reason = Some(reason);
        Ok(state.emit())
    }
}

/// Armed while a step action is awaited; fires only if the future is dropped.
struct InFlightStep<'a> {
    engine: &'a StepEngine,
    token: RunToken,
    index: usize,
    armed: bool,
}

impl Drop for InFlightStep<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.engine.abandon(self.token, self.index);
        }
    }
}
