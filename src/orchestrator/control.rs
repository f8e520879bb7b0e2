//! In-process control plane: start, status, cancel and event streams.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;

use super::engine::{Orchestrator, RunResult};
use super::events::SessionEvent;
use crate::config::RunOptions;
use crate::session::Session;
use crate::tasks::{Task, TaskListener};

/// Buffered events per session before slow subscribers start lagging.
const EVENT_CAPACITY: usize = 256;

/// Cooperative cancellation, checked at phase boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
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

/// Channels a run reports through. All of them are optional.
#[derive(Clone, Default)]
pub struct RunControl {
    cancel: CancelFlag,
    events: Option<broadcast::Sender<SessionEvent>>,
    snapshots: Option<Arc<watch::Sender<Session>>>,
}

impl RunControl {
    pub fn new(cancel: CancelFlag) -> Self {
        Self {
            cancel,
            ..Self::default()
        }
    }

    pub fn with_events(mut self, events: broadcast::Sender<SessionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_snapshots(mut self, snapshots: watch::Sender<Session>) -> Self {
        self.snapshots = Some(Arc::new(snapshots));
        self
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            // No subscribers is fine
            let _ = events.send(event);
        }
    }

    pub(crate) fn publish(&self, session: &Session) {
        if let Some(snapshots) = &self.snapshots {
            snapshots.send_replace(session.clone());
        }
    }

    pub(crate) fn task_listener(&self, session_id: &str) -> TaskListener {
        let control = self.clone();
        let session_id = session_id.to_string();
        Arc::new(move |task: &Task| {
            control.emit(SessionEvent::TaskUpdated {
                session_id: session_id.clone(),
                task_id: task.id.clone(),
                target: task.target.clone(),
                state: task.state,
            });
        })
    }
}

struct SessionHandle {
    status: watch::Receiver<Session>,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancelFlag,
    join: Option<JoinHandle<RunResult>>,
}

/// Runs sessions in the background and answers control-plane queries.
pub struct SessionRegistry {
    orchestrator: Arc<Orchestrator>,
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn a run and return its session id without waiting for it.
    ///
    /// Subscribers see events published after they subscribe; the status
    /// snapshot always reflects the latest state.
    pub async fn start(&self, task: &str, options: RunOptions) -> String {
        let session = Session::new(task).with_metadata(options.metadata.clone());
        let session_id = session.id.clone();

        let (status_tx, status_rx) = watch::channel(session.clone());
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let cancel = CancelFlag::new();
        let control = RunControl::new(cancel.clone())
            .with_events(events_tx.clone())
            .with_snapshots(status_tx);

        let orchestrator = self.orchestrator.clone();
        let join =
            tokio::spawn(async move { orchestrator.run_session(session, options, control).await });

        self.sessions.lock().await.insert(
            session_id.clone(),
            SessionHandle {
                status: status_rx,
                events: events_tx,
                cancel,
                join: Some(join),
            },
        );
        tracing::info!(session_id = %session_id, "Session started");
        session_id
    }

    /// Latest snapshot of the session.
    pub async fn status(&self, session_id: &str) -> Option<Session> {
        let sessions = self.sessions.lock().await;
        sessions.get(session_id).map(|h| h.status.borrow().clone())
    }

    /// Request cancellation. Takes effect at the next phase boundary.
    pub async fn cancel(&self, session_id: &str) -> bool {
        let sessions = self.sessions.lock().await;
        match sessions.get(session_id) {
            Some(handle) => {
                handle.cancel.cancel();
                tracing::info!(session_id = %session_id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    pub async fn subscribe(&self, session_id: &str) -> Option<broadcast::Receiver<SessionEvent>> {
        let sessions = self.sessions.lock().await;
        sessions.get(session_id).map(|h| h.events.subscribe())
    }

    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Wait for a run to finish. Returns `None` for unknown ids or when the
    /// result was already taken.
    pub async fn wait(&self, session_id: &str) -> Option<RunResult> {
        let join = {
            let mut sessions = self.sessions.lock().await;
            sessions.get_mut(session_id)?.join.take()?
        };
        match join.await {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Session task aborted");
                None
            }
        }
    }

    /// Drop a finished session and return its final snapshot.
    ///
    /// Running sessions are kept; `None` means unknown or still running.
    pub async fn forget(&self, session_id: &str) -> Option<Session> {
        let mut sessions = self.sessions.lock().await;
        let finished = sessions
            .get(session_id)?
            .join
            .as_ref()
            .is_none_or(|join| join.is_finished());
        if !finished {
            return None;
        }
        let handle = sessions.remove(session_id)?;
        tracing::debug!(session_id = %session_id, "Session forgotten");
        let snapshot = handle.status.borrow().clone();
        Some(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_flag_shared_between_clones() {
        let flag = CancelFlag::new();
        let control = RunControl::new(flag.clone());
        assert!(!control.is_cancelled());
        flag.cancel();
        assert!(control.is_cancelled());
        assert!(control.cancel_flag().is_cancelled());
    }

    #[tokio::test]
    async fn test_run_control_emits_and_publishes() {
        let (events_tx, mut events_rx) = broadcast::channel(8);
        let session = Session::new("task");
        let (status_tx, status_rx) = watch::channel(session.clone());
        let control = RunControl::default()
            .with_events(events_tx)
            .with_snapshots(status_tx);

        let listener = control.task_listener(&session.id);
        listener(&Task::new("a", "a.txt", ""));
        match events_rx.recv().await.unwrap() {
            SessionEvent::TaskUpdated { target, .. } => assert_eq!(target, "a.txt"),
            other => panic!("unexpected event {:?}", other),
        }

        let mut updated = session.clone();
        updated.add_produced_file("a.txt");
        control.publish(&updated);
        assert_eq!(status_rx.borrow().produced_files, vec!["a.txt".to_string()]);
    }

    #[test]
    fn test_run_control_without_channels_is_silent() {
        let control = RunControl::default();
        control.emit(SessionEvent::SessionStarted {
            session_id: "s".into(),
            task: "t".into(),
        });
        control.publish(&Session::new("t"));
    }
}
