//! Scripted collaborators for unit tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::errors::InvocationError;
use crate::llm::{InvocationRequest, LlmInvoker};
use crate::vision::{Capture, ScreenCapture, VisionAnalyzer};

type Reply = Result<String, InvocationError>;

/// Replays queued replies per target. The last reply of a target repeats
/// once its queue is drained.
#[derive(Clone, Default)]
struct Script {
    queued: HashMap<String, VecDeque<Reply>>,
    last: HashMap<String, Reply>,
}

impl Script {
    fn push(&mut self, key: &str, replies: Vec<Reply>) {
        self.queued.entry(key.to_string()).or_default().extend(replies);
    }

    fn next(&mut self, key: &str) -> Reply {
        if let Some(reply) = self.queued.get_mut(key).and_then(VecDeque::pop_front) {
            self.last.insert(key.to_string(), reply.clone());
            return reply;
        }
        self.last.get(key).cloned().unwrap_or_else(|| {
            Err(InvocationError::NonZeroExit {
                code: 1,
                stderr: format!("no scripted reply for {}", key),
            })
        })
    }
}

#[derive(Default)]
struct LlmState {
    script: Script,
    delays: HashMap<String, Duration>,
    prompts: Vec<(String, String)>,
}

#[derive(Clone, Default)]
pub struct ScriptedLlm {
    state: Arc<Mutex<LlmState>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, target: &str, replies: Vec<Reply>) -> Self {
        self.state.lock().unwrap().script.push(target, replies);
        self
    }

    pub fn with_delay(self, target: &str, delay: Duration) -> Self {
        self.state.lock().unwrap().delays.insert(target.to_string(), delay);
        self
    }

    pub fn prompts_for(&self, target: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .prompts
            .iter()
            .filter(|(t, _)| t == target)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn calls_for(&self, target: &str) -> usize {
        self.prompts_for(target).len()
    }
}

#[async_trait]
impl LlmInvoker for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, request: &InvocationRequest) -> Result<String, InvocationError> {
        let (reply, delay) = {
            let mut state = self.state.lock().unwrap();
            state
                .prompts
                .push((request.target.clone(), request.prompt.clone()));
            let delay = state.delays.get(&request.target).copied();
            (state.script.next(&request.target), delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        reply
    }
}

/// Capture that never touches the filesystem.
#[derive(Clone, Default)]
pub struct ScriptedCapture {
    console_errors: Vec<String>,
}

impl ScriptedCapture {
    pub fn with_console_errors(errors: &[&str]) -> Self {
        Self {
            console_errors: errors.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[async_trait]
impl ScreenCapture for ScriptedCapture {
    async fn capture(&self, route: &str) -> Result<Capture, InvocationError> {
        Ok(Capture {
            image: PathBuf::from(format!("{}.png", route.trim_matches('/'))),
            console_errors: self.console_errors.clone(),
        })
    }
}

/// Vision collaborator replaying a script per route.
#[derive(Clone, Default)]
pub struct ScriptedVision {
    state: Arc<Mutex<(Script, usize)>>,
}

impl ScriptedVision {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, route: &str, replies: Vec<Reply>) -> Self {
        self.state.lock().unwrap().0.push(route, replies);
        self
    }

    pub fn calls(&self) -> usize {
        self.state.lock().unwrap().1
    }
}

#[async_trait]
impl VisionAnalyzer for ScriptedVision {
    async fn analyze(&self, _capture: &Capture, route: &str) -> Result<String, InvocationError> {
        let mut state = self.state.lock().unwrap();
        state.1 += 1;
        state.0.next(route)
    }
}

/// Canned model replies.
pub mod reply_for {
    pub fn plan(paths: &[&str]) -> String {
        let files: Vec<_> = paths
            .iter()
            .map(|p| serde_json::json!({ "path": p, "description": format!("the {} file", p) }))
            .collect();
        serde_json::json!({ "summary": "generated plan", "files": files }).to_string()
    }

    pub fn audit_pass() -> String {
        r#"{"verdict": "pass", "findings": [], "summary": "fine"}"#.to_string()
    }

    pub fn vision_approved() -> String {
        r#"{"status": "approved", "issues": [], "summary": "looks right"}"#.to_string()
    }

    pub fn vision_needs_work(description: &str) -> String {
        serde_json::json!({
            "status": "needs-work",
            "issues": [{ "severity": "major", "category": "layout", "description": description }],
            "summary": "needs fixes",
        })
        .to_string()
    }
}
