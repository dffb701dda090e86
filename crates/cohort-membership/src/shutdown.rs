//! Leave completion handles and coordinated shutdown.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Resolves once the local node's leave has finished, i.e. its own
/// `MemberRemoved` was published or the node stopped.
///
/// Cheap to clone; every clone observes the same resolution.
#[derive(Debug, Clone)]
pub struct LeaveCompletion {
    rx: watch::Receiver<bool>,
}

impl LeaveCompletion {
    /// A handle that is already resolved.
    pub fn completed() -> Self {
        let (_tx, rx) = watch::channel(true);
        Self { rx }
    }

    pub fn is_completed(&self) -> bool {
        *self.rx.borrow()
    }

    /// Waits for completion. Also returns if the node stopped without
    /// resolving the handle.
    pub async fn wait(mut self) {
        let _ = self.rx.wait_for(|done| *done).await;
    }
}

/// Owner side of the leave completion, held by the daemon.
#[derive(Debug)]
pub(crate) struct LeaveTracker {
    tx: watch::Sender<bool>,
}

impl LeaveTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn handle(&self) -> LeaveCompletion {
        if self.is_completed() {
            return LeaveCompletion::completed();
        }
        LeaveCompletion {
            rx: self.tx.subscribe(),
        }
    }

    pub fn is_completed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves all handles. Later calls are no-ops.
    pub fn complete(&self) {
        self.tx.send_if_modified(|done| {
            if *done {
                false
            } else {
                *done = true;
                true
            }
        });
    }
}

/// Ordered shutdown phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    BeforeClusterShutdown,
    ClusterLeave,
    ClusterShutdown,
    BeforeTerminate,
    Terminate,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::BeforeClusterShutdown,
        Phase::ClusterLeave,
        Phase::ClusterShutdown,
        Phase::BeforeTerminate,
        Phase::Terminate,
    ];
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::BeforeClusterShutdown => "before-cluster-shutdown",
            Phase::ClusterLeave => "cluster-leave",
            Phase::ClusterShutdown => "cluster-shutdown",
            Phase::BeforeTerminate => "before-terminate",
            Phase::Terminate => "terminate",
        };
        f.write_str(s)
    }
}

/// Why the shutdown was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The local node left the cluster and was removed.
    ClusterLeaving,
    /// The local node was downed.
    ClusterDowning,
    /// The hosting process asked to stop, e.g. on a signal.
    ProcessExit,
}

type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
type Task = Box<dyn FnOnce() -> TaskFuture + Send + 'static>;

struct Inner {
    tasks: Mutex<BTreeMap<Phase, Vec<(String, Task)>>>,
    phase_timeout: Duration,
    reason: Mutex<Option<ShutdownReason>>,
    done: watch::Sender<bool>,
}

/// Runs registered tasks phase by phase. Tasks within a phase run
/// concurrently; a phase that exceeds its timeout is abandoned and the
/// next one starts.
///
/// Running is idempotent: the first `run` executes the phases, later
/// calls wait for that run to finish.
#[derive(Clone)]
pub struct CoordinatedShutdown {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CoordinatedShutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatedShutdown")
            .field("phase_timeout", &self.inner.phase_timeout)
            .field("reason", &self.reason())
            .finish()
    }
}

impl CoordinatedShutdown {
    pub fn new(phase_timeout: Duration) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                tasks: Mutex::new(BTreeMap::new()),
                phase_timeout,
                reason: Mutex::new(None),
                done,
            }),
        }
    }

    /// Registers a task. Tasks added after the run started are ignored.
    pub fn add_task<F, Fut>(&self, phase: Phase, name: impl Into<String>, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        if self.reason().is_some() {
            debug!(%phase, name = %name, "shutdown already running, task ignored");
            return;
        }
        let boxed: Task = Box::new(move || Box::pin(task()));
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.entry(phase).or_default().push((name, boxed));
    }

    /// The reason of the run in progress or finished, if any.
    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.inner.reason.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_finished(&self) -> bool {
        *self.inner.done.borrow()
    }

    /// Runs all phases in order, or waits for the run already in progress.
    pub async fn run(&self, reason: ShutdownReason) {
        let first = {
            let mut current = self.inner.reason.lock().unwrap_or_else(|e| e.into_inner());
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        };

        if !first {
            let mut done = self.inner.done.subscribe();
            let _ = done.wait_for(|d| *d).await;
            return;
        }

        info!(?reason, "running coordinated shutdown");
        let mut tasks = {
            let mut guard = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };

        for phase in Phase::ALL {
            let Some(phase_tasks) = tasks.remove(&phase) else {
                continue;
            };
            debug!(%phase, tasks = phase_tasks.len(), "shutdown phase starting");
            let handles: Vec<_> = phase_tasks
                .into_iter()
                .map(|(name, task)| (name, tokio::spawn(task())))
                .collect();

            let phase_timeout = self.inner.phase_timeout;
            let wait_all = async {
                for (name, handle) in handles {
                    if let Err(e) = handle.await {
                        warn!(%phase, name = %name, "shutdown task failed: {e}");
                    }
                }
            };
            if tokio::time::timeout(phase_timeout, wait_all).await.is_err() {
                warn!(%phase, ?phase_timeout, "shutdown phase timed out");
            }
        }

        self.inner.done.send_replace(true);
        info!("coordinated shutdown finished");
    }
}
