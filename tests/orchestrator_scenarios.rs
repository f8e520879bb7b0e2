//! End-to-end orchestrator scenarios through the public library API.
//!
//! Collaborators are replaced with in-memory implementations of the public
//! traits; files land in a temp directory.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use conductor::artifacts::{ArtifactStore, FsArtifactStore};
use conductor::checkpoint::{CheckpointStore, FileCheckpointStore, RecoveryManager};
use conductor::config::{ConductorToml, RunOptions};
use conductor::errors::InvocationError;
use conductor::llm::{InvocationRequest, LlmInvoker};
use conductor::orchestrator::{Orchestrator, SessionEvent, SessionRegistry};
use conductor::plugins::{HookEvent, HookResult, PluginHost, handler_fn};
use conductor::session::{ErrorKind, PhaseName, PhaseOutcome, PhaseRecord, Session, SessionStatus};
use conductor::vision::{Capture, ScreenCapture, VisionAnalyzer, VisualValidator};

type Reply = Result<String, InvocationError>;
type Responder = dyn Fn(&str, usize) -> Reply + Send + Sync;

/// Model stand-in answering by target and per-target call index. Tracks how
/// many file generations run at once.
struct MockLlm {
    respond: Box<Responder>,
    delay: Duration,
    calls: Mutex<HashMap<String, usize>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl MockLlm {
    fn new(respond: impl Fn(&str, usize) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            respond: Box::new(respond),
            delay: Duration::ZERO,
            calls: Mutex::new(HashMap::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn calls(&self, target: &str) -> usize {
        self.calls.lock().unwrap().get(target).copied().unwrap_or(0)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmInvoker for MockLlm {
    fn name(&self) -> &str {
        "mock"
    }

    async fn invoke(&self, request: &InvocationRequest) -> Result<String, InvocationError> {
        let index = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(request.target.clone()).or_insert(0);
            *count += 1;
            *count - 1
        };
        let generating = request.target != "plan" && request.target != "audit";
        if generating {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if generating {
            self.running.fetch_sub(1, Ordering::SeqCst);
        }
        (self.respond)(&request.target, index)
    }
}

fn plan_reply(paths: &[&str]) -> Reply {
    let files: Vec<_> = paths
        .iter()
        .map(|p| serde_json::json!({ "path": p, "description": format!("{} file", p) }))
        .collect();
    Ok(serde_json::json!({ "summary": "plan", "files": files }).to_string())
}

fn audit_pass() -> Reply {
    Ok(r#"{"verdict": "pass", "findings": [], "summary": "ok"}"#.to_string())
}

fn fail(code: i32) -> Reply {
    Err(InvocationError::NonZeroExit {
        code,
        stderr: "scripted failure".into(),
    })
}

struct NoopCapture;

#[async_trait]
impl ScreenCapture for NoopCapture {
    async fn capture(&self, route: &str) -> Result<Capture, InvocationError> {
        Ok(Capture {
            image: PathBuf::from(format!("{}.png", route.trim_matches('/'))),
            console_errors: vec![],
        })
    }
}

/// Vision stand-in that always returns the same raw text.
struct FixedVision {
    reply: String,
    calls: AtomicUsize,
}

impl FixedVision {
    fn new(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.to_string(),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl VisionAnalyzer for FixedVision {
    async fn analyze(&self, _capture: &Capture, _route: &str) -> Result<String, InvocationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.reply.clone())
    }
}

struct Fixture {
    dir: TempDir,
    store: Arc<FileCheckpointStore>,
    artifacts: Arc<FsArtifactStore>,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileCheckpointStore::new(dir.path().join(".conductor/checkpoints")));
        let artifacts = Arc::new(FsArtifactStore::new(dir.path()));
        Self {
            dir,
            store,
            artifacts,
        }
    }

    fn recovery(&self) -> Arc<RecoveryManager> {
        Arc::new(RecoveryManager::new(self.store.clone(), self.artifacts.clone()))
    }

    fn orchestrator(&self, llm: Arc<MockLlm>) -> Orchestrator {
        Orchestrator::new(
            llm,
            self.artifacts.clone(),
            self.recovery(),
            ConductorToml::default(),
        )
    }

    fn read(&self, path: &str) -> String {
        std::fs::read_to_string(self.dir.path().join(path)).unwrap()
    }
}

// =============================================================================
// Happy path
// =============================================================================

#[tokio::test]
async fn test_simple_file_session_completes() {
    let fx = Fixture::new();
    let llm = Arc::new(MockLlm::new(|target, _| match target {
        "plan" => plan_reply(&["hello.txt"]),
        "audit" => audit_pass(),
        _ => Ok("hello world".into()),
    }));

    let result = fx
        .orchestrator(llm.clone())
        .run("write hello.txt", RunOptions::default())
        .await;

    assert!(result.success(), "errors: {:?}", result.errors());
    assert_eq!(
        result.session.phase_history(),
        vec![PhaseName::Plan, PhaseName::Execute, PhaseName::Audit, PhaseName::Commit]
    );
    assert!(result.records().iter().all(|r| r.is_closed() && r.succeeded()));
    assert_eq!(result.session.produced_files, vec!["hello.txt".to_string()]);
    assert_eq!(fx.read("hello.txt"), "hello world\n");

    // Completed sessions leave no recovery point
    assert!(fx.store.list_ids().unwrap().is_empty());
}

// =============================================================================
// Bounded concurrency and partial retry
// =============================================================================

#[tokio::test]
async fn test_partial_failure_retries_only_failed_task() {
    let fx = Fixture::new();
    let llm = Arc::new(
        MockLlm::new(|target, index| match (target, index) {
            ("plan", _) => plan_reply(&["a.txt", "b.txt", "c.txt"]),
            ("audit", _) => audit_pass(),
            ("b.txt", 0) => fail(1),
            (file, _) => Ok(format!("content of {}", file)),
        })
        .with_delay(Duration::from_millis(30)),
    );

    let result = fx
        .orchestrator(llm.clone())
        .run("three files", RunOptions::default().with_max_concurrency(2))
        .await;

    assert!(result.success(), "errors: {:?}", result.errors());
    assert!(llm.peak() <= 2, "peak was {}", llm.peak());
    assert_eq!(llm.calls("a.txt"), 1);
    assert_eq!(llm.calls("b.txt"), 2);
    assert_eq!(llm.calls("c.txt"), 1);

    let execute: Vec<_> = result
        .session
        .records_for(PhaseName::Execute)
        .map(|r| r.outcome)
        .collect();
    assert_eq!(
        execute,
        vec![Some(PhaseOutcome::NeedsRetry), Some(PhaseOutcome::Success)]
    );
    assert_eq!(fx.read("b.txt"), "content of b.txt\n");
}

// =============================================================================
// Visual validation
// =============================================================================

#[tokio::test]
async fn test_observe_loop_stops_at_max_iterations() {
    let fx = Fixture::new();
    let llm = Arc::new(MockLlm::new(|target, _| match target {
        "plan" => plan_reply(&["index.html"]),
        "audit" => audit_pass(),
        _ => Ok("<html></html>".into()),
    }));
    let vision = FixedVision::new(
        r#"{"status": "needs-work", "issues": [{"severity": "minor", "category": "layout", "description": "misaligned"}]}"#,
    );
    let orchestrator = fx.orchestrator(llm.clone()).with_visual(VisualValidator::new(
        Arc::new(NoopCapture),
        vision.clone(),
        vec!["/".into()],
    ));

    let result = orchestrator
        .run("page", RunOptions::default().with_max_visual_iterations(3))
        .await;

    assert!(result.success(), "errors: {:?}", result.errors());
    assert_eq!(vision.calls.load(Ordering::SeqCst), 3);
    assert_eq!(result.session.records_for(PhaseName::Observe).count(), 3);
    assert_eq!(llm.calls("index.html"), 3);
    assert_eq!(result.session.phase_history().last(), Some(&PhaseName::Commit));
}

#[tokio::test]
async fn test_unparsable_vision_reply_becomes_parse_error_issue() {
    let fx = Fixture::new();
    let llm = Arc::new(MockLlm::new(|target, _| match target {
        "plan" => plan_reply(&["index.html"]),
        "audit" => audit_pass(),
        _ => Ok("<html></html>".into()),
    }));
    let vision = FixedVision::new("not json");
    let orchestrator = fx.orchestrator(llm).with_visual(VisualValidator::new(
        Arc::new(NoopCapture),
        vision,
        vec!["/".into()],
    ));

    let result = orchestrator
        .run("page", RunOptions::default().with_max_visual_iterations(1))
        .await;

    assert!(result.success(), "errors: {:?}", result.errors());
    let observe: Vec<&PhaseRecord> = result.session.records_for(PhaseName::Observe).collect();
    assert_eq!(observe.len(), 1);
    let route = &observe[0].result["results"][0];
    assert_eq!(route["status"], "needs-work");
    assert_eq!(route["issues"][0]["category"], "parse-error");
    assert_eq!(route["issues"][0]["severity"], "major");
}

// =============================================================================
// Recovery
// =============================================================================

fn interrupted_after_execute(fx: &Fixture) -> Session {
    let mut session = Session::new("landing page");
    let plan = serde_json::json!({
        "summary": "one page",
        "files": [{ "path": "index.html", "description": "landing page" }],
    });
    session
        .push_record(
            PhaseRecord::open(PhaseName::Plan, 1, "mock")
                .close(PhaseOutcome::Success, serde_json::json!({ "plan": plan })),
        )
        .unwrap();
    fx.artifacts.write("index.html", b"<h1>saved</h1>\n").unwrap();
    session.add_produced_file("index.html");
    session
        .push_record(
            PhaseRecord::open(PhaseName::Execute, 1, "mock")
                .close(PhaseOutcome::Success, serde_json::json!({ "generated": ["index.html"] })),
        )
        .unwrap();
    fx.recovery().checkpoint(&session).unwrap();
    session
}

#[tokio::test]
async fn test_recovery_is_idempotent() {
    let fx = Fixture::new();
    let session = interrupted_after_execute(&fx);
    std::fs::remove_file(fx.dir.path().join("index.html")).unwrap();

    let recovery = fx.recovery();
    let first = recovery.recover(&session.id).unwrap();
    assert!(first.recovered);
    assert_eq!(first.rewritten, vec!["index.html".to_string()]);
    assert_eq!(fx.read("index.html"), "<h1>saved</h1>\n");

    let second = recovery.recover(&session.id).unwrap();
    assert!(second.recovered);
    assert!(second.rewritten.is_empty());
    assert_eq!(second.restored, vec!["index.html".to_string()]);
    assert_eq!(second.phase, first.phase);
    assert_eq!(fx.read("index.html"), "<h1>saved</h1>\n");
}

#[tokio::test]
async fn test_resume_continues_from_next_phase() {
    let fx = Fixture::new();
    let session = interrupted_after_execute(&fx);
    let llm = Arc::new(MockLlm::new(|target, _| match target {
        "audit" => audit_pass(),
        other => Err(InvocationError::NonZeroExit {
            code: 1,
            stderr: format!("{} should not be called", other),
        }),
    }));

    let report = fx.recovery().recover(&session.id).unwrap();
    let result = fx
        .orchestrator(llm.clone())
        .resume(report, RunOptions::default())
        .await
        .unwrap();

    assert!(result.success(), "errors: {:?}", result.errors());
    assert_eq!(result.session.id, session.id);
    assert_eq!(llm.calls("plan"), 0);
    assert_eq!(llm.calls("index.html"), 0);
    assert_eq!(llm.calls("audit"), 1);
    assert_eq!(
        result.session.phase_history(),
        vec![PhaseName::Plan, PhaseName::Execute, PhaseName::Audit, PhaseName::Commit]
    );
    assert!(fx.store.load(&session.id).unwrap().is_none());
}

#[tokio::test]
async fn test_failed_session_keeps_terminal_point() {
    let fx = Fixture::new();
    let llm = Arc::new(MockLlm::new(|_, _| fail(1)));

    let result = fx
        .orchestrator(llm)
        .run("doomed", RunOptions::default().with_max_retries(1))
        .await;

    assert_eq!(result.status(), SessionStatus::Failed);
    assert_eq!(result.records().len(), 2);
    assert!(result.errors().iter().any(|e| e.kind == ErrorKind::Unrecoverable));

    let point = fx.store.load(&result.session.id).unwrap().unwrap();
    assert!(point.session.is_terminal());
    assert!(fx.recovery().find_interrupted().unwrap().is_empty());
}

// =============================================================================
// Plugins
// =============================================================================

#[tokio::test]
async fn test_plugin_failures_are_isolated_and_stop_propagation_holds() {
    let fx = Fixture::new();
    let llm = Arc::new(MockLlm::new(|target, _| match target {
        "plan" => plan_reply(&["a.txt"]),
        "audit" => audit_pass(),
        _ => Ok("a".into()),
    }));

    let reached = Arc::new(AtomicUsize::new(0));
    let reached_in_handler = reached.clone();
    let mut plugins = PluginHost::new(Duration::from_secs(5));
    plugins.register(
        HookEvent::BeforePhase,
        "broken",
        "explode",
        Arc::new(handler_fn(|_| anyhow::bail!("boom"))),
    );
    plugins.register(
        HookEvent::BeforePhase,
        "gate",
        "stop",
        Arc::new(handler_fn(|_| Ok(HookResult::ok().stop()))),
    );
    plugins.register(
        HookEvent::BeforePhase,
        "late",
        "count",
        Arc::new(handler_fn(move |_| {
            reached_in_handler.fetch_add(1, Ordering::SeqCst);
            Ok(HookResult::ok())
        })),
    );

    let result = fx
        .orchestrator(llm)
        .with_plugins(plugins)
        .run("one file", RunOptions::default())
        .await;

    assert!(result.success(), "errors: {:?}", result.errors());
    assert_eq!(reached.load(Ordering::SeqCst), 0);
    let plugin_errors = result
        .errors()
        .iter()
        .filter(|e| e.kind == ErrorKind::Plugin)
        .count();
    assert_eq!(plugin_errors, 4, "one per phase");
}

// =============================================================================
// Control plane
// =============================================================================

#[tokio::test]
async fn test_registry_reports_status_and_events() {
    let fx = Fixture::new();
    let llm = Arc::new(
        MockLlm::new(|target, _| match target {
            "plan" => plan_reply(&["a.txt"]),
            "audit" => audit_pass(),
            _ => Ok("a".into()),
        })
        .with_delay(Duration::from_millis(50)),
    );
    let registry = SessionRegistry::new(Arc::new(fx.orchestrator(llm)));

    let id = registry.start("one file", RunOptions::default()).await;
    let mut events = registry.subscribe(&id).await.unwrap();
    assert_eq!(registry.session_ids().await, vec![id.clone()]);

    let mut finished = None;
    while let Ok(event) = events.recv().await {
        if let SessionEvent::SessionFinished { status, .. } = &event {
            finished = Some(*status);
            break;
        }
    }
    assert_eq!(finished, Some(SessionStatus::Completed));

    let result = registry.wait(&id).await.unwrap();
    assert!(result.success());
    let status = registry.status(&id).await.unwrap();
    assert_eq!(status.status, SessionStatus::Completed);

    // The result can only be taken once
    assert!(registry.wait(&id).await.is_none());
    assert!(registry.status("missing").await.is_none());
    assert!(!registry.cancel("missing").await);
}

#[tokio::test]
async fn test_registry_forgets_only_finished_sessions() {
    let fx = Fixture::new();
    let llm = Arc::new(
        MockLlm::new(|target, _| match target {
            "plan" => plan_reply(&["a.txt"]),
            "audit" => audit_pass(),
            _ => Ok("a".into()),
        })
        .with_delay(Duration::from_millis(100)),
    );
    let registry = SessionRegistry::new(Arc::new(fx.orchestrator(llm)));

    let id = registry.start("one file", RunOptions::default()).await;
    assert!(registry.forget(&id).await.is_none(), "still running");
    assert_eq!(registry.session_ids().await, vec![id.clone()]);

    assert!(registry.wait(&id).await.unwrap().success());
    let snapshot = registry.forget(&id).await.unwrap();
    assert_eq!(snapshot.status, SessionStatus::Completed);

    assert!(registry.session_ids().await.is_empty());
    assert!(registry.status(&id).await.is_none());
    assert!(registry.forget(&id).await.is_none());
}

#[tokio::test]
async fn test_registry_cancel_stops_at_phase_boundary() {
    let fx = Fixture::new();
    let llm = Arc::new(
        MockLlm::new(|target, _| match target {
            "plan" => plan_reply(&["a.txt"]),
            "audit" => audit_pass(),
            _ => Ok("a".into()),
        })
        .with_delay(Duration::from_millis(200)),
    );
    let registry = SessionRegistry::new(Arc::new(fx.orchestrator(llm.clone())));

    let id = registry.start("one file", RunOptions::default()).await;
    assert!(registry.cancel(&id).await);

    let result = registry.wait(&id).await.unwrap();
    assert_eq!(result.status(), SessionStatus::Cancelled);
    assert!(result.records().len() <= 1);
    assert_eq!(llm.calls("audit"), 0);

    let point = fx.store.load(&id).unwrap().unwrap();
    assert_eq!(point.session.status, SessionStatus::Cancelled);
}
