//! The phase state machine.

use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

use super::control::RunControl;
use super::events::SessionEvent;
use super::phases::{self, FileGenerator, Plan};
use super::policy::{self, Decision, ObserveStep};
use crate::artifacts::ArtifactStore;
use crate::checkpoint::{RecoveryManager, RecoveryReport};
use crate::commit::{Committer, NoopCommitter};
use crate::config::{ConductorToml, RunOptions, RunSettings};
use crate::errors::{InvocationError, OrchestratorError};
use crate::llm::{InvocationRequest, LlmInvoker};
use crate::logging::phase_span;
use crate::plugins::{HookContext, HookEvent, HookOutcome, PluginHost};
use crate::prompts;
use crate::session::{
    ErrorKind, PhaseName, PhaseOutcome, PhaseRecord, Session, SessionError, SessionStatus,
};
use crate::tasks::{BatchAggregate, Task, TaskRunner};
use crate::util::truncate_chars;
use crate::vision::{ValidationResult, VisualValidator, all_approved};

/// Largest slice of a produced file included in the audit prompt.
const MAX_AUDIT_FILE_CHARS: usize = 20_000;

/// Final state of a run.
#[derive(Debug)]
pub struct RunResult {
    pub session: Session,
    /// Why the session failed, when it did
    pub error: Option<OrchestratorError>,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.session.status == SessionStatus::Completed
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status
    }

    pub fn records(&self) -> &[PhaseRecord] {
        &self.session.records
    }

    pub fn errors(&self) -> &[SessionError] {
        &self.session.errors
    }
}

/// Why the phase loop stopped early.
enum Halt {
    Cancelled,
    Failed(OrchestratorError),
}

/// Mutable state carried through one run.
struct RunContext {
    session: Session,
    settings: RunSettings,
    control: RunControl,
    plan: Option<Arc<Plan>>,
    /// Targets still owed after a partial execute batch
    pending_targets: Option<Vec<String>>,
    /// Visual feedback for the next execute pass
    fix_notes: Option<String>,
    visual_iterations: u32,
    last_validation: Vec<ValidationResult>,
    checkpoint_failures: u32,
}

impl RunContext {
    fn new(session: Session, settings: RunSettings, control: RunControl) -> Self {
        Self {
            session,
            settings,
            control,
            plan: None,
            pending_targets: None,
            fix_notes: None,
            visual_iterations: 0,
            last_validation: Vec::new(),
            checkpoint_failures: 0,
        }
    }

    /// Append to the session error log and the event stream.
    fn absorb(&mut self, kind: ErrorKind, phase: Option<PhaseName>, message: impl Into<String>) {
        let message = message.into();
        self.session.record_error(kind, phase, message.clone());
        self.control.emit(SessionEvent::Error {
            session_id: self.session.id.clone(),
            kind,
            phase,
            message,
        });
    }

    fn emit_last_transition(&self) {
        if let Some(t) = self.session.transitions.last() {
            self.control.emit(SessionEvent::Transition {
                session_id: self.session.id.clone(),
                from: t.from,
                to: t.to,
                reason: t.reason.clone(),
            });
        }
    }

    fn transition(&mut self, to: PhaseName, reason: &str) {
        self.session.transition(Some(to), reason);
        self.emit_last_transition();
    }

    fn finish(&mut self, status: SessionStatus, reason: &str) {
        self.session.finish(status, reason);
        self.emit_last_transition();
    }
}

/// Result of one phase attempt before it is written to a record.
struct PhaseAttempt {
    outcome: PhaseOutcome,
    result: Value,
    /// Why the attempt did not succeed
    reason: Option<(ErrorKind, String)>,
    /// Note for the next attempt's prompt
    corrective: Option<String>,
}

impl PhaseAttempt {
    fn success(result: Value) -> Self {
        Self {
            outcome: PhaseOutcome::Success,
            result,
            reason: None,
            corrective: None,
        }
    }

    fn retry(kind: ErrorKind, reason: String, corrective: Option<String>, result: Value) -> Self {
        Self {
            outcome: PhaseOutcome::NeedsRetry,
            result,
            reason: Some((kind, reason)),
            corrective,
        }
    }

    fn failure(kind: ErrorKind, reason: String, result: Value) -> Self {
        Self {
            outcome: PhaseOutcome::Failure,
            result,
            reason: Some((kind, reason)),
            corrective: None,
        }
    }

    fn from_invocation(err: &InvocationError) -> Self {
        let (outcome, kind) = policy::invocation_outcome(err);
        Self {
            outcome,
            result: json!({ "error": err.to_string() }),
            reason: Some((kind, err.to_string())),
            corrective: policy::human_input_note(err),
        }
    }

    fn reason_text(&self) -> String {
        self.reason
            .as_ref()
            .map(|(_, r)| r.clone())
            .unwrap_or_else(|| self.outcome.to_string())
    }
}

/// Drives sessions through plan, execute, observe, audit and commit.
pub struct Orchestrator {
    llm: Arc<dyn LlmInvoker>,
    artifacts: Arc<dyn ArtifactStore>,
    recovery: Arc<RecoveryManager>,
    plugins: Arc<PluginHost>,
    visual: Option<Arc<VisualValidator>>,
    committer: Arc<dyn Committer>,
    config: ConductorToml,
    config_value: Value,
}

impl Orchestrator {
    pub fn new(
        llm: Arc<dyn LlmInvoker>,
        artifacts: Arc<dyn ArtifactStore>,
        recovery: Arc<RecoveryManager>,
        config: ConductorToml,
    ) -> Self {
        let config_value = serde_json::to_value(&config).unwrap_or(Value::Null);
        Self {
            llm,
            artifacts,
            recovery,
            plugins: Arc::new(PluginHost::default()),
            visual: None,
            committer: Arc::new(NoopCommitter),
            config,
            config_value,
        }
    }

    pub fn with_plugins(mut self, plugins: PluginHost) -> Self {
        self.plugins = Arc::new(plugins);
        self
    }

    /// Enable the observe phase.
    pub fn with_visual(mut self, validator: VisualValidator) -> Self {
        self.visual = Some(Arc::new(validator));
        self
    }

    pub fn with_committer(mut self, committer: Arc<dyn Committer>) -> Self {
        self.committer = committer;
        self
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    pub fn plugins(&self) -> &PluginHost {
        &self.plugins
    }

    /// Run a new session for `task` to a terminal status.
    pub async fn run(&self, task: &str, options: RunOptions) -> RunResult {
        let session = Session::new(task).with_metadata(options.metadata.clone());
        self.run_session(session, options, RunControl::default()).await
    }

    /// Run a pre-created session, reporting through `control`.
    pub async fn run_session(
        &self,
        session: Session,
        options: RunOptions,
        control: RunControl,
    ) -> RunResult {
        let settings = self.config.resolve(&options);
        let mut ctx = RunContext::new(session, settings, control);
        tracing::info!(session_id = %ctx.session.id, "Starting session");
        ctx.control.emit(SessionEvent::SessionStarted {
            session_id: ctx.session.id.clone(),
            task: ctx.session.task.clone(),
        });
        ctx.control.publish(&ctx.session);

        let hook = HookContext::new(HookEvent::SessionStart, &ctx.session);
        self.run_hook(&mut ctx, hook).await;

        let result = self
            .drive(&mut ctx, Some((PhaseName::Plan, "session started".to_string())))
            .await;
        self.finish(ctx, result).await
    }

    /// Continue an interrupted session after its last successful phase.
    ///
    /// The stored plan is reused and files that recovery confirmed are not
    /// regenerated.
    pub async fn resume(
        &self,
        report: RecoveryReport,
        options: RunOptions,
    ) -> Result<RunResult, OrchestratorError> {
        self.resume_with(report, options, RunControl::default()).await
    }

    pub async fn resume_with(
        &self,
        report: RecoveryReport,
        options: RunOptions,
        control: RunControl,
    ) -> Result<RunResult, OrchestratorError> {
        let Some(session) = report.session.filter(|s| !s.is_terminal()) else {
            return Err(OrchestratorError::NothingToResume(report.session_id));
        };

        let settings = self.config.resolve(&options);
        let mut ctx = RunContext::new(session, settings, control);
        ctx.plan = stored_plan(&ctx.session).map(Arc::new);
        ctx.visual_iterations = ctx
            .session
            .records_for(PhaseName::Observe)
            .filter(|r| r.succeeded())
            .count() as u32;

        let start = self.resume_point(&ctx);
        tracing::info!(
            session_id = %ctx.session.id,
            resume_at = ?start,
            produced = ctx.session.produced_files.len(),
            "Resuming session"
        );
        ctx.control.publish(&ctx.session);

        let hook = HookContext::new(HookEvent::SessionStart, &ctx.session);
        self.run_hook(&mut ctx, hook).await;

        let result = self
            .drive(&mut ctx, start.map(|p| (p, "resumed after interruption".to_string())))
            .await;
        Ok(self.finish(ctx, result).await)
    }

    fn resume_point(&self, ctx: &RunContext) -> Option<PhaseName> {
        let last = ctx.session.last_successful_phase();
        let start = match last {
            None => Some(PhaseName::Plan),
            Some(PhaseName::Observe)
                if ctx.visual_iterations < ctx.settings.max_visual_iterations =>
            {
                Some(PhaseName::Observe)
            }
            Some(phase) => policy::next_in_line(phase, self.visual_enabled(&ctx.settings)),
        };
        // Everything past planning needs the plan
        match start {
            Some(PhaseName::Execute) | Some(PhaseName::Observe) if ctx.plan.is_none() => {
                Some(PhaseName::Plan)
            }
            other => other,
        }
    }

    fn visual_enabled(&self, settings: &RunSettings) -> bool {
        self.visual.is_some() && settings.max_visual_iterations > 0
    }

    async fn drive(
        &self,
        ctx: &mut RunContext,
        start: Option<(PhaseName, String)>,
    ) -> Result<(), Halt> {
        let mut next = start;
        while let Some((phase, reason)) = next {
            if ctx.control.is_cancelled() {
                return Err(Halt::Cancelled);
            }
            ctx.transition(phase, &reason);
            self.run_phase(ctx, phase).await?;
            next = self.next_phase(ctx, phase);
        }
        Ok(())
    }

    fn next_phase(&self, ctx: &mut RunContext, phase: PhaseName) -> Option<(PhaseName, String)> {
        if phase != PhaseName::Observe {
            return policy::next_in_line(phase, self.visual_enabled(&ctx.settings))
                .map(|next| (next, format!("{} succeeded", phase)));
        }

        let max = ctx.settings.max_visual_iterations;
        match policy::observe_step(
            all_approved(&ctx.last_validation),
            ctx.visual_iterations,
            max,
        ) {
            ObserveStep::Approved => Some((PhaseName::Audit, "all routes approved".to_string())),
            ObserveStep::FixPass => {
                ctx.fix_notes = Some(prompts::fix_notes(&ctx.last_validation));
                Some((
                    PhaseName::Execute,
                    format!("visual fix pass {} of {}", ctx.visual_iterations, max),
                ))
            }
            ObserveStep::ForceAudit => {
                tracing::warn!(
                    session_id = %ctx.session.id,
                    iterations = ctx.visual_iterations,
                    "Visual validation not approved within the iteration limit"
                );
                Some((
                    PhaseName::Audit,
                    format!("visual iteration limit of {} reached", max),
                ))
            }
        }
    }

    /// Run attempts of `phase` until one advances or the phase fails.
    async fn run_phase(&self, ctx: &mut RunContext, phase: PhaseName) -> Result<(), Halt> {
        let limits = ctx.settings.limits_for(phase);
        let mut attempt = 0u32;
        let mut timeouts = 0u32;
        let mut corrective: Option<String> = None;

        loop {
            if ctx.control.is_cancelled() {
                return Err(Halt::Cancelled);
            }
            attempt += 1;
            let record_attempt = ctx.session.records_for(phase).count() as u32 + 1;

            let hook = HookContext::new(HookEvent::BeforePhase, &ctx.session)
                .with_phase(phase, record_attempt);
            let injections = self.run_hook(ctx, hook).await.injections();

            ctx.control.emit(SessionEvent::PhaseStarted {
                session_id: ctx.session.id.clone(),
                phase,
                attempt: record_attempt,
            });
            let record = PhaseRecord::open(phase, record_attempt, self.agent_for(phase));
            let span = phase_span(&ctx.session.id, phase, record_attempt);

            let work = self.attempt(ctx, phase, &injections, corrective.take(), limits.timeout);
            let result = match tokio::time::timeout(limits.timeout, work.instrument(span)).await {
                Ok(result) => result,
                Err(_) => {
                    timeouts += 1;
                    let reason = format!(
                        "phase {} timed out after {}s",
                        phase,
                        limits.timeout.as_secs()
                    );
                    let result = json!({ "timed_out": true });
                    match policy::timeout_outcome(timeouts) {
                        PhaseOutcome::NeedsRetry => {
                            PhaseAttempt::retry(ErrorKind::Tool, reason, None, result)
                        }
                        _ => PhaseAttempt::failure(ErrorKind::Tool, reason, result),
                    }
                }
            };

            let closed = record.close(result.outcome, result.result.clone());
            if let Err(e) = ctx.session.push_record(closed) {
                return Err(Halt::Failed(OrchestratorError::Other(e)));
            }
            tracing::info!(
                session_id = %ctx.session.id,
                phase = %phase,
                attempt = record_attempt,
                outcome = %result.outcome,
                "Phase attempt finished"
            );
            ctx.control.emit(SessionEvent::PhaseCompleted {
                session_id: ctx.session.id.clone(),
                phase,
                attempt: record_attempt,
                outcome: result.outcome,
            });

            if result.outcome == PhaseOutcome::NeedsRetry
                && let Some((kind, reason)) = &result.reason
            {
                ctx.absorb(*kind, Some(phase), reason.clone());
            }

            let hook = HookContext::new(HookEvent::AfterPhase, &ctx.session)
                .with_phase(phase, record_attempt)
                .with_outcome(result.outcome);
            self.run_hook(ctx, hook).await;

            self.checkpoint(ctx, phase)?;
            ctx.control.publish(&ctx.session);

            match policy::decide(result.outcome, attempt, &limits) {
                Decision::Advance => return Ok(()),
                Decision::Retry => {
                    tracing::info!(
                        session_id = %ctx.session.id,
                        phase = %phase,
                        attempt,
                        max_attempts = limits.max_attempts(),
                        reason = %result.reason_text(),
                        "Retrying phase"
                    );
                    let hook = HookContext::new(HookEvent::PhaseRetry, &ctx.session)
                        .with_phase(phase, record_attempt)
                        .with_outcome(result.outcome);
                    self.run_hook(ctx, hook).await;
                    corrective = result.corrective;
                }
                Decision::Exhausted => {
                    return Err(Halt::Failed(OrchestratorError::RetriesExhausted {
                        phase: phase.to_string(),
                        attempts: attempt,
                    }));
                }
                Decision::Fail => {
                    return Err(Halt::Failed(OrchestratorError::PhaseFailed {
                        phase: phase.to_string(),
                        message: result.reason_text(),
                    }));
                }
            }
        }
    }

    fn agent_for(&self, phase: PhaseName) -> String {
        match phase {
            PhaseName::Plan | PhaseName::Execute | PhaseName::Audit => self.llm.name().to_string(),
            PhaseName::Observe => "vision".to_string(),
            PhaseName::Commit => self.committer.name().to_string(),
        }
    }

    async fn attempt(
        &self,
        ctx: &mut RunContext,
        phase: PhaseName,
        injections: &[String],
        corrective: Option<String>,
        timeout: Duration,
    ) -> PhaseAttempt {
        match phase {
            PhaseName::Plan => self.plan(ctx, injections, corrective, timeout).await,
            PhaseName::Execute => self.execute(ctx, injections).await,
            PhaseName::Observe => self.observe(ctx).await,
            PhaseName::Audit => self.audit(ctx, injections, corrective, timeout).await,
            PhaseName::Commit => self.commit(ctx).await,
        }
    }

    async fn plan(
        &self,
        ctx: &mut RunContext,
        injections: &[String],
        corrective: Option<String>,
        timeout: Duration,
    ) -> PhaseAttempt {
        let prompt = prompts::plan_prompt(&ctx.session.task, injections, corrective.as_deref());
        let raw = match self
            .llm
            .invoke(&InvocationRequest::new(prompt, "plan", timeout))
            .await
        {
            Ok(raw) => raw,
            Err(e) => return PhaseAttempt::from_invocation(&e),
        };

        match phases::parse_plan(&raw) {
            Ok(plan) => {
                tracing::info!(files = plan.files.len(), "Plan accepted");
                let result = json!({ "plan": plan });
                ctx.plan = Some(Arc::new(plan));
                PhaseAttempt::success(result)
            }
            Err(problem) => PhaseAttempt::retry(
                ErrorKind::Validation,
                format!("plan rejected: {}", problem),
                Some(problem.clone()),
                json!({ "error": problem }),
            ),
        }
    }

    async fn execute(&self, ctx: &mut RunContext, injections: &[String]) -> PhaseAttempt {
        let Some(plan) = ctx.plan.clone() else {
            return PhaseAttempt::failure(
                ErrorKind::Unrecoverable,
                "execute started without a plan".to_string(),
                Value::Null,
            );
        };

        let retrying = ctx.pending_targets.is_some();
        let tasks: Vec<Task> = plan
            .files
            .iter()
            .filter(|f| match &ctx.pending_targets {
                Some(pending) => pending.contains(&f.path),
                None if ctx.fix_notes.is_some() => true,
                None => !ctx.session.produced_files.contains(&f.path),
            })
            .map(|f| Task::new(&f.path, &f.path, &f.description))
            .collect();

        if tasks.is_empty() {
            tracing::info!("Every planned file already exists, nothing to generate");
            return PhaseAttempt::success(json!({ "skipped": true }));
        }

        let generator = Arc::new(FileGenerator {
            llm: self.llm.clone(),
            artifacts: self.artifacts.clone(),
            task: ctx.session.task.clone(),
            plan,
            fix_notes: ctx.fix_notes.clone(),
            injections: injections.to_vec(),
            timeout: ctx.settings.task_timeout,
        });
        let runner = TaskRunner::new(ctx.settings.max_concurrency)
            .with_task_timeout(ctx.settings.task_timeout)
            .with_listener(ctx.control.task_listener(&ctx.session.id));
        let report = runner.run(tasks, generator).await;

        for (_, output) in report.succeeded() {
            if let Some(artifact) = &output.artifact {
                ctx.session.add_produced_file(artifact);
            }
        }

        let result = json!({
            "outcomes": report.outcomes,
            "peak_running": report.peak_running,
            "fix_pass": ctx.fix_notes.is_some(),
        });
        let total = report.outcomes.len();
        let fatal: Vec<String> = report
            .failed()
            .filter(|(_, f)| !f.transient)
            .map(|(id, f)| format!("{}: {}", id, f.message))
            .collect();
        if !fatal.is_empty() {
            return PhaseAttempt::failure(
                ErrorKind::Unrecoverable,
                format!("unrecoverable task failure ({})", fatal.join("; ")),
                result,
            );
        }
        match report.aggregate() {
            BatchAggregate::Empty | BatchAggregate::AllSucceeded => {
                ctx.pending_targets = None;
                ctx.fix_notes = None;
                PhaseAttempt::success(result)
            }
            BatchAggregate::Partial { failed } => {
                let reason = format!("{} of {} task(s) failed: {}", failed.len(), total, failed.join(", "));
                ctx.pending_targets = Some(failed);
                PhaseAttempt::retry(ErrorKind::Tool, reason, None, result)
            }
            BatchAggregate::AllFailed if retrying => {
                let failed: Vec<String> = report.failed().map(|(id, _)| id.clone()).collect();
                let reason = format!("{} retried task(s) failed again: {}", total, failed.join(", "));
                ctx.pending_targets = Some(failed);
                PhaseAttempt::retry(ErrorKind::Tool, reason, None, result)
            }
            BatchAggregate::AllFailed => {
                let details: Vec<String> = report
                    .failed()
                    .map(|(id, f)| format!("{}: {}", id, f.message))
                    .collect();
                PhaseAttempt::failure(
                    ErrorKind::Tool,
                    format!("all {} task(s) failed ({})", total, details.join("; ")),
                    result,
                )
            }
        }
    }

    async fn observe(&self, ctx: &mut RunContext) -> PhaseAttempt {
        let Some(visual) = &self.visual else {
            return PhaseAttempt::success(json!({ "skipped": true }));
        };

        match visual.validate_all(ctx.settings.max_concurrency).await {
            Ok(results) => {
                ctx.visual_iterations += 1;
                let approved = all_approved(&results);
                tracing::info!(
                    iteration = ctx.visual_iterations,
                    approved,
                    routes = results.len(),
                    "Visual validation finished"
                );
                let result = json!({
                    "iteration": ctx.visual_iterations,
                    "approved": approved,
                    "results": results,
                });
                ctx.last_validation = results;
                PhaseAttempt::success(result)
            }
            Err(e) => PhaseAttempt::from_invocation(&e),
        }
    }

    async fn audit(
        &self,
        ctx: &mut RunContext,
        injections: &[String],
        corrective: Option<String>,
        timeout: Duration,
    ) -> PhaseAttempt {
        let mut files = Vec::new();
        for path in &ctx.session.produced_files {
            match self.artifacts.read(path) {
                Ok(bytes) => files.push((
                    path.clone(),
                    truncate_chars(&String::from_utf8_lossy(&bytes), MAX_AUDIT_FILE_CHARS),
                )),
                Err(e) => tracing::warn!(path = %path, error = %e, "Skipping unreadable file in audit"),
            }
        }

        let prompt =
            prompts::audit_prompt(&ctx.session.task, &files, injections, corrective.as_deref());
        let raw = match self
            .llm
            .invoke(&InvocationRequest::new(prompt, "audit", timeout))
            .await
        {
            Ok(raw) => raw,
            Err(e) => return PhaseAttempt::from_invocation(&e),
        };

        match phases::parse_audit(&raw) {
            Ok(report) => {
                tracing::info!(
                    verdict = ?report.verdict,
                    findings = report.findings.len(),
                    "Audit finished"
                );
                PhaseAttempt::success(json!({ "audit": report }))
            }
            Err(problem) => PhaseAttempt::retry(
                ErrorKind::Validation,
                format!("audit rejected: {}", problem),
                Some(problem.clone()),
                json!({ "error": problem }),
            ),
        }
    }

    async fn commit(&self, ctx: &mut RunContext) -> PhaseAttempt {
        let message = prompts::commit_message(
            self.config.commit.message_prefix.as_deref(),
            &ctx.session.task,
            &ctx.session.produced_files,
        );
        match self
            .committer
            .commit(&message, &ctx.session.produced_files)
            .await
        {
            Ok(id) => PhaseAttempt::success(json!({
                "commit": id,
                "committer": self.committer.name(),
                "files": ctx.session.produced_files.len(),
            })),
            Err(e) => {
                let reason = format!("commit failed: {:#}", e);
                PhaseAttempt::retry(
                    ErrorKind::Tool,
                    reason.clone(),
                    None,
                    json!({ "error": reason }),
                )
            }
        }
    }

    /// Run a hook and log handler failures into the session.
    async fn run_hook(&self, ctx: &mut RunContext, hook: HookContext) -> HookOutcome {
        let phase = hook.phase;
        let outcome = self
            .plugins
            .execute(&hook.with_config(self.config_value.clone()))
            .await;
        for failure in outcome.failures() {
            ctx.absorb(
                ErrorKind::Plugin,
                phase,
                format!(
                    "{} hook {}/{} failed: {}",
                    outcome.event,
                    failure.plugin,
                    failure.handler,
                    failure.result.error.as_deref().unwrap_or("unknown error")
                ),
            );
        }
        outcome
    }

    /// Write a recovery point, applying the persistence failure policy.
    fn checkpoint(&self, ctx: &mut RunContext, phase: PhaseName) -> Result<(), Halt> {
        match self.recovery.checkpoint(&ctx.session) {
            Ok(_) => {
                ctx.checkpoint_failures = 0;
                Ok(())
            }
            Err(e) => {
                ctx.checkpoint_failures += 1;
                tracing::warn!(
                    session_id = %ctx.session.id,
                    phase = %phase,
                    failures = ctx.checkpoint_failures,
                    error = %e,
                    "Checkpoint write failed"
                );
                ctx.absorb(
                    ErrorKind::Persistence,
                    Some(phase),
                    format!("checkpoint failed: {}", e),
                );
                match ctx.settings.max_consecutive_checkpoint_failures {
                    Some(max) if ctx.checkpoint_failures >= max => {
                        Err(Halt::Failed(OrchestratorError::PersistenceExhausted {
                            failures: ctx.checkpoint_failures,
                        }))
                    }
                    _ => Ok(()),
                }
            }
        }
    }

    async fn finish(&self, mut ctx: RunContext, result: Result<(), Halt>) -> RunResult {
        let error = match result {
            Ok(()) => {
                ctx.finish(SessionStatus::Completed, "session completed");
                if let Err(e) = self.recovery.complete(&ctx.session.id) {
                    tracing::warn!(session_id = %ctx.session.id, error = %e, "Failed to remove recovery point");
                    ctx.absorb(
                        ErrorKind::Persistence,
                        None,
                        format!("recovery point not removed: {}", e),
                    );
                }
                None
            }
            Err(Halt::Cancelled) => {
                tracing::info!(session_id = %ctx.session.id, "Session cancelled");
                ctx.finish(SessionStatus::Cancelled, "cancelled");
                self.final_checkpoint(&mut ctx);
                None
            }
            Err(Halt::Failed(err)) => {
                let phase = ctx.session.current_phase;
                tracing::error!(session_id = %ctx.session.id, error = %err, "Session failed");
                ctx.absorb(ErrorKind::Unrecoverable, phase, err.to_string());

                let mut hook = HookContext::new(HookEvent::PhaseFailed, &ctx.session);
                if let Some(phase) = phase {
                    let attempts = ctx.session.records_for(phase).count() as u32;
                    hook = hook.with_phase(phase, attempts).with_outcome(PhaseOutcome::Failure);
                }
                self.run_hook(&mut ctx, hook).await;

                ctx.finish(SessionStatus::Failed, &err.to_string());
                self.final_checkpoint(&mut ctx);
                Some(err)
            }
        };

        let hook = HookContext::new(HookEvent::SessionEnd, &ctx.session);
        self.run_hook(&mut ctx, hook).await;

        ctx.control.publish(&ctx.session);
        ctx.control.emit(SessionEvent::SessionFinished {
            session_id: ctx.session.id.clone(),
            status: ctx.session.status,
        });
        tracing::info!(
            session_id = %ctx.session.id,
            status = %ctx.session.status.as_str(),
            records = ctx.session.records.len(),
            errors = ctx.session.errors.len(),
            "Session finished"
        );

        RunResult {
            session: ctx.session,
            error,
        }
    }

    /// Keep a terminal recovery point for failed and cancelled sessions.
    fn final_checkpoint(&self, ctx: &mut RunContext) {
        if let Err(e) = self.recovery.checkpoint(&ctx.session) {
            tracing::warn!(session_id = %ctx.session.id, error = %e, "Final checkpoint failed");
            ctx.absorb(
                ErrorKind::Persistence,
                ctx.session.current_phase,
                format!("final checkpoint failed: {}", e),
            );
        }
    }
}

/// Plan stored on the most recent successful plan record.
fn stored_plan(session: &Session) -> Option<Plan> {
    session
        .records_for(PhaseName::Plan)
        .filter(|r| r.succeeded())
        .last()
        .and_then(|r| r.result.get("plan"))
        .and_then(|plan| serde_json::from_value(plan.clone()).ok())
}
