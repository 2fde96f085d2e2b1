//! Backlog orchestrator: the single writer of [`AggregateState`].
//!
//! Each tick activates (or resumes) one ticket and drives its lifecycle until
//! it has to wait, finishes, or parks for an operator. State is persisted
//! after every transition that changed something.

use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

pub use crate::types::LifecycleEvent;

use crate::{
    context::ContextSlice,
    lifecycle::{Outcome, Step, TaskLifecycle},
    policy,
    retro::{GuidanceOptimizer, RetrospectiveAnalyst, SprintMetrics, MIN_TICKETS_FOR_RETROSPECTIVE},
    store::{LoadSource, StateStore},
    types::{
        AggregateState, Node, SystemStatus, TaskExecutionState, TaskStatus, Ticket, TicketRecord,
        TicketStatus, VerificationGate,
    },
};

/// Recent log lines shared with the tracing layer that fills it.
pub type LogRing = Arc<Mutex<VecDeque<String>>>;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_retries: u32,
    /// Tickets moved from the queue into the sprint backlog per planning pass.
    pub sprint_size: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            sprint_size: 5,
        }
    }
}

/// What a tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Nothing runnable.
    Idle,
    /// The active ticket is waiting on the worker; call again after `delay`.
    Waiting { ticket_id: String, delay: Duration },
    /// The active ticket reached a terminal state.
    Finished { ticket_id: String, outcome: Outcome },
    /// Awaiting operator; nothing is driven until [`Pipeline::resume`].
    Parked { reason: String },
}

pub struct Pipeline {
    store: StateStore,
    state: AggregateState,
    lifecycle: TaskLifecycle,
    settings: PipelineSettings,
    pub event_tx: broadcast::Sender<LifecycleEvent>,
    log_ring: Option<LogRing>,
    analyst: Option<Arc<dyn RetrospectiveAnalyst>>,
    optimizer: Option<GuidanceOptimizer>,
}

impl Pipeline {
    /// Load persisted state (with fallback) and build the orchestrator.
    pub fn open(
        store: StateStore,
        lifecycle: TaskLifecycle,
        settings: PipelineSettings,
    ) -> (Self, broadcast::Receiver<LifecycleEvent>) {
        let (state, source) = store.load();
        match source {
            LoadSource::Primary => info!("state loaded from {}", store.primary_path().display()),
            LoadSource::Seed => info!("state seeded from snapshot"),
            LoadSource::Default => info!("starting from an empty state"),
        }
        let (tx, rx) = broadcast::channel(256);
        let p = Self {
            store,
            state,
            lifecycle,
            settings,
            event_tx: tx,
            log_ring: None,
            analyst: None,
            optimizer: None,
        };
        (p, rx)
    }

    pub fn with_log_ring(mut self, ring: LogRing) -> Self {
        self.log_ring = Some(ring);
        self
    }

    pub fn with_retrospective(mut self, analyst: Arc<dyn RetrospectiveAnalyst>, optimizer: GuidanceOptimizer) -> Self {
        self.analyst = Some(analyst);
        self.optimizer = Some(optimizer);
        self
    }

    pub fn state(&self) -> &AggregateState {
        &self.state
    }

    // ── Backlog ──────────────────────────────────────────────────────────

    /// Add a ticket to the queue. Returns `false` if the id is already known.
    pub fn enqueue(&mut self, mut ticket: Ticket) -> Result<bool> {
        if ticket.id.trim().is_empty() {
            anyhow::bail!("ticket id must not be empty");
        }
        if self.state.orchestration.contains(&ticket.id) {
            warn!(ticket_id = %ticket.id, "ticket already known, not enqueued");
            return Ok(false);
        }
        ticket.status = TicketStatus::Open;
        info!(ticket_id = %ticket.id, title = %ticket.title, "ticket enqueued");
        self.state.orchestration.task_queue.push(ticket);
        self.persist()?;
        Ok(true)
    }

    /// Move ready tickets from the queue into the sprint backlog, lowest
    /// priority value first. Returns how many moved.
    fn plan_sprint(&mut self) -> usize {
        let orch = &mut self.state.orchestration;
        let done: HashSet<&str> = orch
            .completed_tasks_log
            .iter()
            .map(|r| r.ticket.id.as_str())
            .collect();

        let mut ready: Vec<(u32, usize, String)> = orch
            .task_queue
            .iter()
            .enumerate()
            .filter(|(_, t)| t.status == TicketStatus::Open)
            .filter(|(_, t)| t.dependencies.iter().all(|d| done.contains(d.as_str())))
            .map(|(i, t)| (t.priority, i, t.id.clone()))
            .collect();
        ready.sort();
        ready.truncate(self.settings.sprint_size.max(1));

        let count = ready.len();
        for (_, _, id) in ready {
            let Some(pos) = orch.task_queue.iter().position(|t| t.id == id) else {
                continue;
            };
            let ticket = orch.task_queue.remove(pos);
            info!(ticket_id = %ticket.id, priority = ticket.priority, "planned into sprint");
            orch.sprint_backlog.push(ticket);
        }
        count
    }

    /// Next runnable ticket id, planning a sprint if the backlog is empty.
    fn next_ticket(&mut self) -> Option<String> {
        let runnable = |state: &AggregateState| {
            state
                .orchestration
                .sprint_backlog
                .iter()
                .find(|t| !state.orchestration.is_finished(&t.id))
                .map(|t| t.id.clone())
        };
        if let Some(id) = runnable(&self.state) {
            return Some(id);
        }
        if self.plan_sprint() > 0 {
            return runnable(&self.state);
        }
        None
    }

    fn log_excerpt(&self) -> String {
        self.log_ring
            .as_ref()
            .and_then(|ring| ring.lock().ok().map(|r| r.iter().cloned().collect::<Vec<_>>().join("\n")))
            .unwrap_or_default()
    }

    fn activate(&mut self, id: &str) -> Option<Ticket> {
        let log = self.log_excerpt();
        let source = self.lifecycle.source();
        let max_retries = self.settings.max_retries;
        let ticket = self
            .state
            .orchestration
            .sprint_backlog
            .iter_mut()
            .find(|t| t.id == id)?;
        ticket.status = TicketStatus::InProgress;
        let ticket = ticket.clone();

        let slice = ContextSlice::for_ticket(&ticket, source.as_ref(), &log);
        let session_id = format!("{}-{}", ticket.id, Utc::now().format("%Y%m%d%H%M%S"));
        info!(ticket_id = %ticket.id, footprint = %slice.footprint(), "ticket activated");

        let eng = &mut self.state.engineering;
        eng.active_ticket = Some(ticket.id.clone());
        eng.task = Some(TaskExecutionState::new(session_id, max_retries, slice));
        eng.gate = VerificationGate::default();
        eng.resume_at = Some(Node::Dispatch);
        Some(ticket)
    }

    /// The active ticket, or a freshly activated one.
    fn current_ticket(&mut self) -> Result<Option<Ticket>> {
        if let Some(id) = self.state.engineering.active_ticket.clone() {
            if self.state.orchestration.is_finished(&id) {
                warn!(ticket_id = %id, "active ticket already finished, clearing");
                self.state.orchestration.sprint_backlog.retain(|t| t.id != id);
                self.clear_engineering();
                self.persist()?;
            } else if let Some(t) = self.state.orchestration.sprint_backlog.iter().find(|t| t.id == id) {
                return Ok(Some(t.clone()));
            } else {
                warn!(ticket_id = %id, "active ticket missing from sprint backlog, clearing");
                self.clear_engineering();
            }
        }
        let Some(id) = self.next_ticket() else {
            return Ok(None);
        };
        let ticket = self.activate(&id);
        self.persist()?;
        Ok(ticket)
    }

    // ── Driving ──────────────────────────────────────────────────────────

    pub async fn tick(&mut self) -> Result<TickOutcome> {
        if self.state.orchestration.escalation_triggered {
            info!("escalation acknowledged");
            self.state.orchestration.escalation_triggered = false;
            self.persist()?;
        }
        if self.state.meta.system_status == SystemStatus::AwaitingOperator {
            let reason = self.state.meta.operator_note.clone().unwrap_or_default();
            return Ok(TickOutcome::Parked { reason });
        }

        let Some(ticket) = self.current_ticket()? else {
            self.maybe_retrospective().await?;
            return Ok(TickOutcome::Idle);
        };

        let mut node = self.state.engineering.resume_at.unwrap_or(Node::Dispatch);
        loop {
            let mut exec = self.state.engineering.task.take().unwrap_or_else(|| {
                TaskExecutionState::new(ticket.id.clone(), self.settings.max_retries, ContextSlice::new(ticket.title.clone()))
            });
            let mut gate = std::mem::take(&mut self.state.engineering.gate);
            let before = (exec.clone(), gate.clone());

            let transition = self.lifecycle.step(node, &ticket, &mut exec, &mut gate).await;

            let changed = before.0 != exec || before.1 != gate || !transition.events.is_empty();
            self.state.engineering.task = Some(exec);
            self.state.engineering.gate = gate;
            self.apply_events(&transition.events);

            match transition.next {
                Step::Run(next) => {
                    self.state.engineering.resume_at = Some(next);
                    self.persist()?;
                    node = next;
                }
                Step::Wait { node: next, delay } => {
                    let moved = self.state.engineering.resume_at != Some(next);
                    self.state.engineering.resume_at = Some(next);
                    if changed || moved {
                        self.persist()?;
                    }
                    return Ok(TickOutcome::Waiting { ticket_id: ticket.id, delay });
                }
                Step::Finish(outcome) => {
                    self.finish(&ticket, &outcome)?;
                    return Ok(TickOutcome::Finished { ticket_id: ticket.id, outcome });
                }
            }
        }
    }

    fn apply_events(&mut self, events: &[LifecycleEvent]) {
        for event in events {
            match event {
                LifecycleEvent::EntropyMeasured { .. } => {
                    let history = self
                        .state
                        .engineering
                        .task
                        .as_ref()
                        .map(|t| t.entropy_history.as_slice())
                        .unwrap_or_default();
                    self.state.orchestration.circuit_breaker_triggered = policy::circuit_breaker(history);
                }
                LifecycleEvent::Escalated { .. } => {
                    self.state.orchestration.escalation_triggered = true;
                }
                _ => {}
            }
            let _ = self.event_tx.send(event.clone());
        }
    }

    fn finish(&mut self, ticket: &Ticket, outcome: &Outcome) -> Result<()> {
        match outcome {
            Outcome::Merged { tech_debt } => {
                info!(ticket_id = %ticket.id, tech_debt, "ticket done");
                self.retire(ticket, TicketStatus::Done, *tech_debt);
            }
            Outcome::Escalated => {
                error!(ticket_id = %ticket.id, "ticket failed and escalated for human attention");
                self.retire(ticket, TicketStatus::Failed, false);
                self.state.orchestration.escalation_triggered = true;
            }
            Outcome::Infrastructure { node, reason } => {
                error!(ticket_id = %ticket.id, node = %node, "parking for operator: {reason}");
                self.state.engineering.resume_at = Some(*node);
                self.park(format!("infrastructure failure at {node}: {reason}"));
            }
            Outcome::Blocked { reason } => {
                warn!(ticket_id = %ticket.id, "parking blocked ticket: {reason}");
                self.state.engineering.resume_at = Some(Node::Watch);
                self.park(format!("worker blocked: {reason}"));
            }
        }
        self.persist()
    }

    /// Fold the active ticket into a log and drop its execution state.
    fn retire(&mut self, ticket: &Ticket, status: TicketStatus, tech_debt: bool) {
        let orch = &mut self.state.orchestration;
        orch.sprint_backlog.retain(|t| t.id != ticket.id);
        let mut done = ticket.clone();
        done.status = status;
        let exec = self.state.engineering.task.take().unwrap_or_default();
        let record = TicketRecord::from_execution(done, &exec, tech_debt);
        match status {
            TicketStatus::Failed => orch.failed_tasks_log.push(record),
            _ => orch.completed_tasks_log.push(record),
        }
        self.clear_engineering();
    }

    fn clear_engineering(&mut self) {
        self.state.engineering = Default::default();
    }

    fn park(&mut self, note: String) {
        self.state.meta.system_status = SystemStatus::AwaitingOperator;
        self.state.meta.operator_note = Some(note);
    }

    /// Clear an operator park; the active ticket resumes at its recorded node.
    pub fn resume(&mut self) -> Result<()> {
        if self.state.meta.system_status != SystemStatus::AwaitingOperator {
            return Ok(());
        }
        info!(
            note = self.state.meta.operator_note.as_deref().unwrap_or(""),
            "operator resumed orchestration"
        );
        self.state.meta.system_status = SystemStatus::Running;
        self.state.meta.operator_note = None;
        if let Some(task) = self.state.engineering.task.as_mut() {
            task.infra_error = None;
            if task.status == TaskStatus::Blocked {
                task.status = TaskStatus::Working;
            }
        }
        self.persist()
    }

    /// Tick forever, sleeping between ticks. Waits requested by the
    /// lifecycle replace the idle interval.
    pub async fn run(&mut self, idle: Duration) -> Result<()> {
        loop {
            let delay = match self.tick().await {
                Ok(TickOutcome::Waiting { delay, .. }) => delay,
                Ok(TickOutcome::Finished { .. }) => Duration::ZERO,
                Ok(TickOutcome::Idle) | Ok(TickOutcome::Parked { .. }) => idle,
                Err(e) => {
                    error!("pipeline tick error: {e:#}");
                    idle
                }
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    // ── Retrospective ────────────────────────────────────────────────────

    async fn maybe_retrospective(&mut self) -> Result<()> {
        let (Some(analyst), Some(optimizer)) = (self.analyst.clone(), self.optimizer.as_ref()) else {
            return Ok(());
        };
        let orch = &self.state.orchestration;
        let finished = orch.finished_count();
        if finished < orch.retrospective_watermark + MIN_TICKETS_FOR_RETROSPECTIVE {
            return Ok(());
        }

        let (completed, failed) = recent(
            &orch.completed_tasks_log,
            &orch.failed_tasks_log,
            finished - orch.retrospective_watermark,
        );
        let metrics = SprintMetrics::from_records(&completed, &failed);
        let strategy = metrics.strategy();
        info!(strategy = strategy.as_str(), "running retrospective:\n{}", metrics.summary());

        let mut report = match analyst.analyze(strategy, &metrics).await {
            Ok(r) => r,
            Err(e) => {
                warn!("retrospective analyst failed, will retry later: {e:#}");
                return Ok(());
            }
        };
        if report.sprint_id.is_empty() {
            report.sprint_id = Utc::now().format("%Y%m%d%H%M%S").to_string();
        }
        report.success_rate = metrics.success_rate;
        if report.summary.is_empty() {
            report.summary = metrics.summary();
        }

        match optimizer.apply(&report) {
            Ok(updated) => info!(roles = ?updated, "retrospective applied"),
            Err(e) => error!("retrospective guidance update rejected: {e:#}"),
        }
        self.state.orchestration.retrospective_watermark = finished;
        self.state.meta.last_retrospective = Some(report);
        self.persist()
    }

    fn persist(&mut self) -> Result<()> {
        self.state.meta.updated_at = Some(Utc::now());
        self.store.save(&self.state)
    }
}

/// The `fresh` most recently finished records, split into (completed, failed).
fn recent(completed: &[TicketRecord], failed: &[TicketRecord], fresh: usize) -> (Vec<TicketRecord>, Vec<TicketRecord>) {
    let mut all: Vec<(bool, &TicketRecord)> = completed
        .iter()
        .map(|r| (true, r))
        .chain(failed.iter().map(|r| (false, r)))
        .collect();
    all.sort_by_key(|(_, r)| r.finished_at);
    let skip = all.len().saturating_sub(fresh);
    let (ok, bad): (Vec<_>, Vec<_>) = all.into_iter().skip(skip).partition(|(passed, _)| *passed);
    (
        ok.into_iter().map(|(_, r)| r.clone()).collect(),
        bad.into_iter().map(|(_, r)| r.clone()).collect(),
    )
}
