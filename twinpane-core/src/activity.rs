//! Tracks running operations and aggregates their progress.
//!
//! Every operation started through [`Activity::run`] gets a [`TaskHandle`]
//! that nested code uses to publish progress. Expected failures (see
//! [`ExpectedFailure`]) are trapped here and forwarded to the
//! [`NotificationSink`]; everything else propagates to the caller.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::error::SourceError;

pub const DEFAULT_TICK: Duration = Duration::from_millis(50);

const INDETERMINATE_BITS: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Progress {
    Indeterminate,
    Fraction(f64),
}

impl Progress {
    /// Value used for aggregation; indeterminate tasks count as zero.
    pub fn value(self) -> f64 {
        match self {
            Progress::Indeterminate => 0.0,
            Progress::Fraction(value) => value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Registered = 0,
    Running = 1,
    Succeeded = 2,
    Failed = 3,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TaskState::Running,
            2 => TaskState::Succeeded,
            3 => TaskState::Failed,
            _ => TaskState::Registered,
        }
    }
}

#[derive(Debug)]
struct Task {
    id: u64,
    name: String,
    started: OffsetDateTime,
    progress: AtomicU64,
    state: AtomicU8,
}

/// Shared handle to one task's progress.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    task: Arc<Task>,
}

impl TaskHandle {
    fn new(id: u64, name: String) -> Self {
        Self {
            task: Arc::new(Task {
                id,
                name,
                started: OffsetDateTime::now_utc(),
                progress: AtomicU64::new(0f64.to_bits()),
                state: AtomicU8::new(TaskState::Registered as u8),
            }),
        }
    }

    /// A handle that is not tracked by any [`Activity`].
    pub fn detached(name: impl Into<String>) -> Self {
        Self::new(0, name.into())
    }

    pub fn id(&self) -> u64 {
        self.task.id
    }

    pub fn name(&self) -> &str {
        &self.task.name
    }

    pub fn started(&self) -> OffsetDateTime {
        self.task.started
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.task.state.load(Ordering::Acquire))
    }

    pub fn progress(&self) -> Progress {
        let bits = self.task.progress.load(Ordering::Acquire);
        if bits == INDETERMINATE_BITS {
            Progress::Indeterminate
        } else {
            Progress::Fraction(f64::from_bits(bits))
        }
    }

    pub fn set_progress(&self, fraction: f64) {
        let fraction = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        self.task
            .progress
            .store(fraction.to_bits(), Ordering::Release);
    }

    pub fn set_indeterminate(&self) {
        self.task
            .progress
            .store(INDETERMINATE_BITS, Ordering::Release);
    }

    pub fn finish(&self) {
        self.set_progress(1.0);
    }

    fn set_state(&self, state: TaskState) {
        self.task.state.store(state as u8, Ordering::Release);
    }

    fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id(),
            name: self.task.name.clone(),
            progress: self.progress(),
            started: self.task.started,
            state: self.state(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskSnapshot {
    pub id: u64,
    pub name: String,
    pub progress: Progress,
    pub started: OffsetDateTime,
    pub state: TaskState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub message: String,
}

impl Notification {
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
        }
    }
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Logs notifications; used when no front end is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl NotificationSink for TracingNotifier {
    fn notify(&self, notification: Notification) {
        warn!(title = %notification.title, message = %notification.message, "user notification");
    }
}

#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        let _ = self.tx.send(notification);
    }
}

/// Classifies errors that are shown to the user rather than propagated.
pub trait ExpectedFailure {
    fn notification(&self) -> Option<Notification>;
}

impl ExpectedFailure for SourceError {
    fn notification(&self) -> Option<Notification> {
        match self {
            SourceError::NotFound(path) => Some(Notification::new("Not Found", path.clone())),
            _ => None,
        }
    }
}

pub struct Activity {
    tasks: Mutex<Vec<TaskHandle>>,
    next_id: AtomicU64,
    overall: watch::Sender<f64>,
    notifier: Arc<dyn NotificationSink>,
}

impl Activity {
    pub fn new(notifier: Arc<dyn NotificationSink>) -> Self {
        let (overall, _) = watch::channel(0.0);
        Self {
            tasks: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            overall,
            notifier,
        }
    }

    /// Runs `op` as a tracked task.
    ///
    /// Returns `Ok(None)` when the operation failed with an expected error that
    /// was delivered to the notification sink.
    pub async fn run<T, E, F, Fut>(&self, name: impl Into<String>, op: F) -> Result<Option<T>, E>
    where
        F: FnOnce(TaskHandle) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ExpectedFailure,
    {
        let registration = self.register(name.into());
        let handle = registration.handle.clone();
        handle.set_state(TaskState::Running);
        debug!(task = handle.id(), name = handle.name(), "task started");

        let result = op(handle.clone()).await;
        handle.set_state(if result.is_ok() {
            TaskState::Succeeded
        } else {
            TaskState::Failed
        });
        drop(registration);

        match result {
            Ok(value) => Ok(Some(value)),
            Err(err) => match err.notification() {
                Some(notification) => {
                    debug!(
                        task = handle.id(),
                        title = %notification.title,
                        "task failed with expected error"
                    );
                    self.notifier.notify(notification);
                    Ok(None)
                }
                None => Err(err),
            },
        }
    }

    /// Mean progress of all active tasks, 0 when idle.
    pub fn overall_progress(&self) -> f64 {
        let tasks = self.tasks.lock();
        if tasks.is_empty() {
            return 0.0;
        }
        let sum: f64 = tasks.iter().map(|task| task.progress().value()).sum();
        sum / tasks.len() as f64
    }

    pub fn tasks(&self) -> Vec<TaskSnapshot> {
        self.tasks.lock().iter().map(TaskHandle::snapshot).collect()
    }

    pub fn is_idle(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    pub fn subscribe(&self) -> watch::Receiver<f64> {
        self.overall.subscribe()
    }

    /// Republishes the aggregate on every tick until the activity is dropped.
    pub fn spawn_ticker(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let activity = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(activity) = activity.upgrade() else {
                    break;
                };
                activity.publish();
            }
        })
    }

    fn publish(&self) {
        let value = self.overall_progress();
        self.overall.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        });
    }

    fn register(&self, name: String) -> Registration<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = TaskHandle::new(id, name);
        self.tasks.lock().push(handle.clone());
        Registration {
            activity: self,
            handle,
        }
    }

    fn unregister(&self, id: u64) {
        let now_idle = {
            let mut tasks = self.tasks.lock();
            tasks.retain(|task| task.id() != id);
            tasks.is_empty()
        };
        if now_idle {
            self.publish();
        }
    }
}

/// Removes the task on drop, including when the operation future is dropped early.
struct Registration<'a> {
    activity: &'a Activity,
    handle: TaskHandle,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.activity.unregister(self.handle.id());
        debug!(task = self.handle.id(), "task unregistered");
    }
}
