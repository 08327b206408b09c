//! Host-facing task API.
//!
//! An embedding application starts a task from a [`TaskRequest`], then polls
//! [`TaskHandle::wait_for_next_event`] until [`TaskHandle::is_done`]. Events
//! go through a bounded channel; when the application falls behind, new
//! events are dropped rather than buffered without limit.
//!
//! Shutdown is two-phase: [`TaskHandle::interrupt`] cancels the task, then
//! the application keeps waiting until the channel is drained and the task
//! has stopped, at which point the handle flips to done.

mod control;
mod quichandshake;
mod tcpconnect;

pub use control::{ControlRunner, ControlTaskRequest};
pub use quichandshake::{QuicHandshakeRequest, QuicHandshakeRunner};
pub use tcpconnect::{TcpConnectRequest, TcpConnectRunner};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Capacity of a task's event channel.
pub const TASK_EVENTS_BUFFER: usize = 1024;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("invalid task request: {0}")]
    InvalidRequest(#[from] serde_json::Error),
    #[error("unknown task: {0}")]
    UnknownTask(String),
}

/// A request naming exactly one task and carrying its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskRequest {
    TcpConnect(TcpConnectRequest),
    Control(ControlTaskRequest),
    QuicHandshake(QuicHandshakeRequest),
}

impl TaskRequest {
    /// Registry name of the requested task.
    #[must_use]
    pub fn task_name(&self) -> &'static str {
        match self {
            Self::TcpConnect(_) => "TcpConnect",
            Self::Control(_) => "Control",
            Self::QuicHandshake(_) => "QuicHandshake",
        }
    }

    pub fn from_json(data: &str) -> Result<Self, TaskError> {
        Ok(serde_json::from_str(data)?)
    }
}

/// Something a running task wants the application to know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub key: String,
    pub value: serde_json::Value,
}

/// Emits events when there is room, drops them otherwise.
pub trait TaskEmitter: Send + Sync {
    fn maybe_emit_event(&self, key: &str, value: serde_json::Value);

    fn log(&self, level: &str, message: &str) {
        self.maybe_emit_event(
            "Log",
            serde_json::json!({"level": level, "message": message}),
        );
    }
}

struct ChannelEmitter {
    tx: mpsc::Sender<TaskEvent>,
}

impl TaskEmitter for ChannelEmitter {
    fn maybe_emit_event(&self, key: &str, value: serde_json::Value) {
        let event = TaskEvent {
            key: key.to_string(),
            value,
        };
        if self.tx.try_send(event).is_err() {
            trace!(key, "task event dropped");
        }
    }
}

/// Runs one kind of task to completion.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(
        &self,
        cancel: CancellationToken,
        emitter: &dyn TaskEmitter,
        request: TaskRequest,
    );
}

static TASK_REGISTRY: LazyLock<HashMap<&'static str, Arc<dyn TaskRunner>>> = LazyLock::new(|| {
    let mut registry: HashMap<&'static str, Arc<dyn TaskRunner>> = HashMap::new();
    registry.insert("TcpConnect", Arc::new(TcpConnectRunner));
    registry.insert("Control", Arc::new(ControlRunner));
    registry.insert("QuicHandshake", Arc::new(QuicHandshakeRunner));
    registry
});

/// The runner registered under `name`.
#[must_use]
pub fn runner_for(name: &str) -> Option<Arc<dyn TaskRunner>> {
    TASK_REGISTRY.get(name).cloned()
}

/// Start the task named by `request`. Must be called within a tokio runtime.
pub fn start_task(request: TaskRequest) -> Result<TaskHandle, TaskError> {
    let name = request.task_name();
    let runner = runner_for(name).ok_or_else(|| TaskError::UnknownTask(name.to_string()))?;
    debug!(task = name, "starting task");
    Ok(TaskHandle::spawn(runner, request))
}

/// Negative timeouts mean "wait forever".
#[must_use]
pub fn wait_timeout_from_millis(millis: i64) -> Option<Duration> {
    u64::try_from(millis).ok().map(Duration::from_millis)
}

enum Next {
    Event(Option<TaskEvent>),
    Stopped,
}

/// A running (or finished) task.
pub struct TaskHandle {
    cancel: CancellationToken,
    done: AtomicBool,
    events: Mutex<mpsc::Receiver<TaskEvent>>,
    stopped: CancellationToken,
}

impl TaskHandle {
    pub(crate) fn spawn(runner: Arc<dyn TaskRunner>, request: TaskRequest) -> Self {
        let cancel = CancellationToken::new();
        let stopped = CancellationToken::new();
        let (tx, rx) = mpsc::channel(TASK_EVENTS_BUFFER);

        let task_cancel = cancel.clone();
        let guard = stopped.clone().drop_guard();
        tokio::spawn(async move {
            // Signals "stopped" however the runner exits.
            let _guard = guard;
            let emitter = ChannelEmitter { tx };
            runner.run(task_cancel, &emitter, request).await;
        });

        Self {
            cancel,
            done: AtomicBool::new(false),
            events: Mutex::new(rx),
            stopped,
        }
    }

    /// Wait for the next event. `None` as timeout waits indefinitely.
    ///
    /// Returns `None` when the timeout expires or once the task has stopped
    /// and every event has been consumed; in the latter case the handle is
    /// marked done.
    pub async fn wait_for_next_event(&self, timeout: Option<Duration>) -> Option<TaskEvent> {
        let wait = async {
            let mut events = self.events.lock().await;
            let next = tokio::select! {
                biased;
                ev = events.recv() => Next::Event(ev),
                _ = self.stopped.cancelled() => Next::Stopped,
            };
            match next {
                Next::Event(Some(ev)) => Some(ev),
                Next::Event(None) => {
                    self.done.store(true, Ordering::SeqCst);
                    None
                }
                Next::Stopped => match events.try_recv() {
                    Ok(ev) => Some(ev),
                    Err(_) => {
                        self.done.store(true, Ordering::SeqCst);
                        None
                    }
                },
            }
        };
        match timeout {
            None => wait.await,
            Some(timeout) => tokio::time::timeout(timeout, wait).await.unwrap_or(None),
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    pub fn interrupt(&self) {
        self.cancel.cancel();
    }

    /// Interrupt the task and discard its remaining events.
    pub async fn free(&self) {
        self.interrupt();
        let mut discarded = 0usize;
        while !self.is_done() {
            if self.wait_for_next_event(None).await.is_some() {
                discarded += 1;
            }
        }
        if discarded > 0 {
            debug!(discarded, "task freed with pending events");
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        if !self.stopped.is_cancelled() {
            warn!("task handle dropped while the task is running; interrupting it");
            self.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Emits "Started", blocks until cancelled, then emits "Interrupted".
    struct BlockingRunner;

    #[async_trait]
    impl TaskRunner for BlockingRunner {
        async fn run(
            &self,
            cancel: CancellationToken,
            emitter: &dyn TaskEmitter,
            _request: TaskRequest,
        ) {
            emitter.maybe_emit_event("Started", serde_json::Value::Null);
            cancel.cancelled().await;
            emitter.maybe_emit_event("Interrupted", serde_json::Value::Null);
        }
    }

    /// Emits more events than the channel can hold.
    struct FloodRunner;

    #[async_trait]
    impl TaskRunner for FloodRunner {
        async fn run(
            &self,
            _cancel: CancellationToken,
            emitter: &dyn TaskEmitter,
            _request: TaskRequest,
        ) {
            for i in 0..(TASK_EVENTS_BUFFER + 10) {
                emitter.maybe_emit_event("N", serde_json::json!(i));
            }
        }
    }

    fn dummy_request() -> TaskRequest {
        TaskRequest::TcpConnect(TcpConnectRequest {
            address: "127.0.0.1:9".to_string(),
        })
    }

    #[test]
    fn test_registry_resolves_every_variant() {
        let requests = [
            dummy_request(),
            TaskRequest::Control(ControlTaskRequest::default()),
            TaskRequest::QuicHandshake(QuicHandshakeRequest::default()),
        ];
        for request in requests {
            assert!(runner_for(request.task_name()).is_some());
        }
        assert!(runner_for("Nonexistent").is_none());
    }

    #[test]
    fn test_request_is_externally_tagged() {
        let request =
            TaskRequest::from_json(r#"{"TcpConnect": {"address": "1.2.3.4:80"}}"#).unwrap();
        assert_eq!(request.task_name(), "TcpConnect");
        assert!(TaskRequest::from_json(r#"{"Nope": {}}"#).is_err());
        assert!(TaskRequest::from_json("{}").is_err());
    }

    #[test]
    fn test_wait_timeout_from_millis() {
        assert_eq!(wait_timeout_from_millis(-1), None);
        assert_eq!(wait_timeout_from_millis(0), Some(Duration::ZERO));
        assert_eq!(
            wait_timeout_from_millis(1500),
            Some(Duration::from_millis(1500))
        );
    }

    #[tokio::test]
    async fn test_interrupt_unblocks_pending_wait() {
        let handle = Arc::new(TaskHandle::spawn(Arc::new(BlockingRunner), dummy_request()));

        let first = handle.wait_for_next_event(Some(Duration::from_secs(5))).await;
        assert_eq!(first.map(|e| e.key).as_deref(), Some("Started"));

        // Nothing else is coming until we interrupt.
        assert!(handle
            .wait_for_next_event(Some(Duration::from_millis(20)))
            .await
            .is_none());
        assert!(!handle.is_done());

        let waiter = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.wait_for_next_event(None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.interrupt();

        let ev = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ev.map(|e| e.key).as_deref(), Some("Interrupted"));

        tokio::time::timeout(Duration::from_secs(5), async {
            while !handle.is_done() {
                assert!(handle.wait_for_next_event(None).await.is_none());
            }
        })
        .await
        .unwrap();
        assert!(handle.is_done());
        // Done is sticky and non-blocking.
        assert!(handle.wait_for_next_event(Some(Duration::ZERO)).await.is_none());
        assert!(handle.is_done());
    }

    #[tokio::test]
    async fn test_full_channel_drops_events() {
        let handle = TaskHandle::spawn(Arc::new(FloodRunner), dummy_request());
        let mut received = Vec::new();
        while let Some(ev) = handle.wait_for_next_event(Some(Duration::from_secs(5))).await {
            received.push(ev.value);
        }
        assert!(handle.is_done());
        assert_eq!(received.len(), TASK_EVENTS_BUFFER);
        assert_eq!(received[0], serde_json::json!(0));
    }

    #[tokio::test]
    async fn test_free_waits_until_done() {
        let handle = TaskHandle::spawn(Arc::new(BlockingRunner), dummy_request());
        tokio::time::timeout(Duration::from_secs(5), handle.free())
            .await
            .unwrap();
        assert!(handle.is_done());
    }
}
