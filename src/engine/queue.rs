//! In-process background queue for deferred work.
//!
//! Single consumer, FIFO, best-effort: nothing is persisted and a restart
//! loses pending tasks and the failure log. One `BackgroundQueue` is built at
//! startup and cloned into whatever needs to enqueue work.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::Notify;

use crate::error::AppError;

/// Failed tasks beyond this are dropped oldest first.
pub const MAX_FAILED_TASKS: usize = 100;

// =============================================================================
// Tasks
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueTaskKind {
    /// Look for patterns resembling `error_message` in the same project.
    SimilaritySearch {
        pattern_id: String,
        project_name: String,
        error_message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueTask {
    pub id: String,
    #[serde(flatten)]
    pub kind: QueueTaskKind,
    pub created_at: String,
}

impl QueueTask {
    pub fn new(kind: QueueTaskKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn similarity_search(
        pattern_id: impl Into<String>,
        project_name: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self::new(QueueTaskKind::SimilaritySearch {
            pattern_id: pattern_id.into(),
            project_name: project_name.into(),
            error_message: error_message.into(),
        })
    }

    fn label(&self) -> &'static str {
        match self.kind {
            QueueTaskKind::SimilaritySearch { .. } => "similarity_search",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedTask {
    pub task: QueueTask,
    pub error: String,
    pub failed_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub queue_length: usize,
    pub processing: bool,
    pub failed_tasks: usize,
}

/// Runs one task. Errors are recorded by the queue, never propagated.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &QueueTask) -> Result<(), AppError>;
}

// =============================================================================
// BackgroundQueue
// =============================================================================

#[derive(Default)]
struct QueueState {
    tasks: VecDeque<QueueTask>,
    /// True while a drain loop owns the queue.
    processing: bool,
    failed: VecDeque<FailedTask>,
}

struct Inner {
    state: Mutex<QueueState>,
    executor: Arc<dyn TaskExecutor>,
    idle: Notify,
}

#[derive(Clone)]
pub struct BackgroundQueue {
    inner: Arc<Inner>,
}

impl BackgroundQueue {
    pub fn new(executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                executor,
                idle: Notify::new(),
            }),
        }
    }

    /// Append a task and start a drain loop unless one is already running.
    ///
    /// Must be called from within a tokio runtime; outside one the task stays
    /// queued until the next `add_task` or `wait_idle` that can spawn.
    pub fn add_task(&self, task: QueueTask) {
        let start_drain = {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            tracing::debug!(task_id = %task.id, kind = task.label(), depth = state.tasks.len() + 1, "Task queued");
            state.tasks.push_back(task);
            claim_drain(&mut state)
        };

        if start_drain {
            self.spawn_drain();
        }
    }

    /// Spawn the drain loop for a caller that already set `processing`.
    /// Returns false, with `processing` cleared again, when there is no runtime.
    fn spawn_drain(&self) -> bool {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(drain(Arc::clone(&self.inner)));
                true
            }
            Err(e) => {
                let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
                state.processing = false;
                tracing::warn!(error = %e, pending = state.tasks.len(), "No async runtime available, task left pending");
                false
            }
        }
    }

    pub fn get_status(&self) -> QueueStatus {
        let state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        QueueStatus {
            queue_length: state.tasks.len(),
            processing: state.processing,
            failed_tasks: state.failed.len(),
        }
    }

    /// Snapshot of recorded failures, oldest first.
    pub fn failed_tasks(&self) -> Vec<FailedTask> {
        let state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        state.failed.iter().cloned().collect()
    }

    /// Resolves once the queue is empty and no drain loop is running.
    ///
    /// Tasks left pending by an `add_task` outside a runtime are drained here.
    /// Returns early with those tasks still queued if no tokio runtime is
    /// available to drain them.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            let start_drain = {
                let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
                if !state.processing && state.tasks.is_empty() {
                    return;
                }
                claim_drain(&mut state)
            };
            if start_drain && !self.spawn_drain() {
                return;
            }
            notified.await;
        }
    }
}

/// Mark the queue as draining. False when a drain loop already owns it.
fn claim_drain(state: &mut QueueState) -> bool {
    if state.processing {
        false
    } else {
        state.processing = true;
        true
    }
}

/// Pops until empty. Tasks appended mid-drain are picked up by this same loop
/// because `processing` is only cleared under the lock that observed the empty
/// queue.
async fn drain(inner: Arc<Inner>) {
    loop {
        let task = {
            let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
            match state.tasks.pop_front() {
                Some(task) => task,
                None => {
                    state.processing = false;
                    break;
                }
            }
        };

        let outcome = AssertUnwindSafe(inner.executor.execute(&task))
            .catch_unwind()
            .await;
        let error = match outcome {
            Ok(Ok(())) => {
                tracing::debug!(task_id = %task.id, kind = task.label(), "Task completed");
                continue;
            }
            Ok(Err(e)) => e.to_string(),
            Err(panic) => panic_message(panic.as_ref()),
        };

        tracing::warn!(task_id = %task.id, kind = task.label(), error = %error, "Background task failed");
        let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.failed.len() >= MAX_FAILED_TASKS {
            state.failed.pop_front();
        }
        state.failed.push_back(FailedTask {
            task,
            error,
            failed_at: chrono::Utc::now().to_rfc3339(),
        });
    }

    inner.idle.notify_waiters();
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("task panicked: {s}")
    } else {
        "task panicked".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Records execution order and flags any overlap between tasks.
    #[derive(Default)]
    struct Recorder {
        active: AtomicUsize,
        overlapped: AtomicBool,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TaskExecutor for Recorder {
        async fn execute(&self, task: &QueueTask) -> Result<(), AppError> {
            if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
            let QueueTaskKind::SimilaritySearch { error_message, .. } = &task.kind;
            self.seen.lock().unwrap().push(error_message.clone());
            self.active.fetch_sub(1, Ordering::SeqCst);

            if error_message.starts_with("fail") {
                return Err(AppError::Execution(format!("boom: {error_message}")));
            }
            if error_message == "panic" {
                panic!("executor exploded");
            }
            Ok(())
        }
    }

    fn task(message: &str) -> QueueTask {
        QueueTask::similarity_search("p1", "reno", message)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_burst_never_overlaps() {
        let recorder = Arc::new(Recorder::default());
        let queue = BackgroundQueue::new(recorder.clone());

        let handles: Vec<_> = (0..50)
            .map(|i| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.add_task(task(&format!("t{i}"))) })
            })
            .collect();
        for h in futures_util::future::join_all(handles).await {
            h.unwrap();
        }

        queue.wait_idle().await;
        assert_eq!(recorder.seen.lock().unwrap().len(), 50);
        assert!(!recorder.overlapped.load(Ordering::SeqCst));
        assert_eq!(
            queue.get_status(),
            QueueStatus { queue_length: 0, processing: false, failed_tasks: 0 }
        );
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let recorder = Arc::new(Recorder::default());
        let queue = BackgroundQueue::new(recorder.clone());
        for i in 0..10 {
            queue.add_task(task(&format!("t{i}")));
        }
        queue.wait_idle().await;
        let expected: Vec<_> = (0..10).map(|i| format!("t{i}")).collect();
        assert_eq!(*recorder.seen.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_drain() {
        let recorder = Arc::new(Recorder::default());
        let queue = BackgroundQueue::new(recorder.clone());
        queue.add_task(task("ok-1"));
        queue.add_task(task("fail-1"));
        queue.add_task(task("panic"));
        queue.add_task(task("ok-2"));
        queue.wait_idle().await;

        assert_eq!(recorder.seen.lock().unwrap().len(), 4);
        let failed = queue.failed_tasks();
        assert_eq!(failed.len(), 2);
        assert!(failed[0].error.contains("boom: fail-1"));
        assert!(failed[1].error.contains("executor exploded"));
    }

    #[tokio::test]
    async fn test_failure_buffer_is_bounded() {
        let recorder = Arc::new(Recorder::default());
        let queue = BackgroundQueue::new(recorder.clone());
        for i in 0..(MAX_FAILED_TASKS + 5) {
            queue.add_task(task(&format!("fail-{i}")));
        }
        queue.wait_idle().await;

        let failed = queue.failed_tasks();
        assert_eq!(failed.len(), MAX_FAILED_TASKS);
        assert!(failed[0].error.ends_with("fail-5"));
        assert_eq!(queue.get_status().failed_tasks, MAX_FAILED_TASKS);
    }

    #[tokio::test]
    async fn test_status_is_idempotent() {
        let queue = BackgroundQueue::new(Arc::new(Recorder::default()));
        queue.add_task(task("fail-x"));
        queue.wait_idle().await;
        let first = queue.get_status();
        let second = queue.get_status();
        assert_eq!(first, second);
        assert_eq!(first.failed_tasks, 1);
    }

    #[test]
    fn test_add_task_outside_runtime_keeps_task() {
        let queue = BackgroundQueue::new(Arc::new(Recorder::default()));
        queue.add_task(task("later"));
        let status = queue.get_status();
        assert_eq!(status.queue_length, 1);
        assert!(!status.processing);
    }

    #[test]
    fn test_wait_idle_drains_tasks_queued_without_runtime() {
        let recorder = Arc::new(Recorder::default());
        let queue = BackgroundQueue::new(recorder.clone());
        queue.add_task(task("early-1"));
        queue.add_task(task("early-2"));
        assert_eq!(queue.get_status().queue_length, 2);

        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            tokio::time::timeout(Duration::from_secs(5), queue.wait_idle())
                .await
                .expect("pending tasks drained");
        });

        assert_eq!(*recorder.seen.lock().unwrap(), vec!["early-1", "early-2"]);
        assert_eq!(
            queue.get_status(),
            QueueStatus { queue_length: 0, processing: false, failed_tasks: 0 }
        );
    }
}
