//! Abstractions for deferred interrupt tasks, a companion to regular interrupt handlers.
//!
//! The interrupt handler is the short, latency-sensitive function that runs immediately when
//! the interrupt request is serviced. It does the minimum amount of work possible, then
//! notifies its *deferred task* that work is ready to be done.
//! The deferred task runs the longer operations at some time in the future,
//! ideally as soon as possible, on its own worker thread.
//!
//! Each deferred task is a loop that repeatedly invokes one action and sleeps in between
//! invocations. Waking it up is done with [`DeferredTask::schedule()`], which is idempotent:
//! however many times a task is scheduled before its worker gets around to it, the action runs once.
//! A task never runs concurrently with itself, while different tasks run fully in parallel.
//!
//! [`register_periodic_task()`] creates the same kind of task, except that it also wakes up
//! on its own once per period, which is how timers such as a NIC watchdog are built.

#[macro_use] extern crate log;

use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};


/// The errors that may occur when registering a deferred task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredTaskError {
    /// The given error occurred when spawning the deferred task's worker.
    SpawnError(&'static str),
}


/// State shared between a [`DeferredTask`] handle and its worker.
struct Shared {
    /// Set by `schedule()`, cleared by the worker right before it runs the action.
    pending: AtomicBool,
    /// Tells the worker to return instead of sleeping again.
    exit: AtomicBool,
    /// Number of completed invocations of the action.
    runs: AtomicU64,
}

/// A handle to a running deferred task.
///
/// Dropping the handle tells the worker to exit without waiting for it;
/// use [`DeferredTask::shutdown()`] to wait.
pub struct DeferredTask {
    name: String,
    shared: Arc<Shared>,
    thread: Thread,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DeferredTask {
    /// Marks the task as runnable and wakes up its worker.
    ///
    /// Returns `false` if a run was already pending, in which case nothing changes.
    pub fn schedule(&self) -> bool {
        if self.shared.pending.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.thread.unpark();
        true
    }

    /// Returns true if the task was scheduled and the worker has not started that run yet.
    pub fn is_pending(&self) -> bool {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// The number of times the action has finished running.
    pub fn runs(&self) -> u64 {
        self.shared.runs.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tells the worker to exit and waits until it has.
    /// A run that is in progress completes first; a pending run is abandoned.
    ///
    /// Must not be called from within the task's own action.
    pub fn shutdown(&self) -> Result<(), &'static str> {
        self.shared.exit.store(true, Ordering::Release);
        self.thread.unpark();
        if self.thread.id() == thread::current().id() {
            error!("deferred task {:?} tried to join itself", self.name);
            return Err("a deferred task cannot wait for its own shutdown");
        }
        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let handle = match handle {
            Some(h) => h,
            None => return Ok(()),
        };
        handle.join().map_err(|_e| {
            error!("deferred task {:?} panicked", self.name);
            "deferred task worker panicked"
        })
    }
}

impl Drop for DeferredTask {
    fn drop(&mut self) {
        self.shared.exit.store(true, Ordering::Release);
        self.thread.unpark();
    }
}


/// Spawns a deferred task that invokes `deferred_action` each time it is scheduled.
///
/// # Arguments
/// * `deferred_action`: the closure/function callback that will be invoked
///    in an asynchronous manner after [`DeferredTask::schedule()`] is called.
/// * `deferred_action_argument`: the argument that will be passed to `deferred_action`.
/// * `deferred_task_name`: the optional name that will be given to the worker thread.
///
/// The task starts out asleep. Errors returned by the action are logged and do not stop the task.
pub fn register_deferred_task<DA, Arg, Success, Failure, S>(
    deferred_action: DA,
    deferred_action_argument: Arg,
    deferred_task_name: Option<S>,
) -> Result<DeferredTask, DeferredTaskError>
    where DA: Fn(&Arg) -> Result<Success, Failure> + Send + 'static,
          Arg: Send + 'static,
          Success: 'static,
          Failure: Debug + 'static,
          S: Into<String>,
{
    spawn_task(None, deferred_action, deferred_action_argument, task_name(deferred_task_name))
}

/// Spawns a deferred task that invokes `deferred_action` once every `period`,
/// and additionally whenever it is scheduled.
///
/// The arguments are the same as for [`register_deferred_task()`].
pub fn register_periodic_task<DA, Arg, Success, Failure, S>(
    period: Duration,
    deferred_action: DA,
    deferred_action_argument: Arg,
    deferred_task_name: Option<S>,
) -> Result<DeferredTask, DeferredTaskError>
    where DA: Fn(&Arg) -> Result<Success, Failure> + Send + 'static,
          Arg: Send + 'static,
          Success: 'static,
          Failure: Debug + 'static,
          S: Into<String>,
{
    if period.is_zero() {
        return Err(DeferredTaskError::SpawnError("the period of a periodic task must be non-zero"));
    }
    spawn_task(Some(period), deferred_action, deferred_action_argument, task_name(deferred_task_name))
}

fn task_name<S: Into<String>>(deferred_task_name: Option<S>) -> String {
    deferred_task_name.map(Into::into).unwrap_or_else(|| String::from("deferred_task"))
}

fn spawn_task<DA, Arg, Success, Failure>(
    period: Option<Duration>,
    deferred_action: DA,
    deferred_action_argument: Arg,
    name: String,
) -> Result<DeferredTask, DeferredTaskError>
    where DA: Fn(&Arg) -> Result<Success, Failure> + Send + 'static,
          Arg: Send + 'static,
          Success: 'static,
          Failure: Debug + 'static,
{
    let shared = Arc::new(Shared {
        pending: AtomicBool::new(false),
        exit: AtomicBool::new(false),
        runs: AtomicU64::new(0),
    });

    let worker_shared = Arc::clone(&shared);
    let worker_name = name.clone();
    let handle = thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            deferred_task_entry_point(worker_name, worker_shared, period, deferred_action, deferred_action_argument)
        })
        .map_err(|_e| {
            error!("couldn't spawn deferred task {:?}: {}", name, _e);
            DeferredTaskError::SpawnError("couldn't spawn deferred task worker thread")
        })?;

    Ok(DeferredTask {
        name,
        shared,
        thread: handle.thread().clone(),
        handle: Mutex::new(Some(handle)),
    })
}

/// The entry point for a new deferred task's worker.
fn deferred_task_entry_point<DA, Arg, Success, Failure>(
    name: String,
    shared: Arc<Shared>,
    period: Option<Duration>,
    deferred_action: DA,
    deferred_action_argument: Arg,
)
    where DA: Fn(&Arg) -> Result<Success, Failure>,
          Failure: Debug,
{
    let mut next_deadline = period.map(|p| Instant::now() + p);

    loop {
        if shared.exit.load(Ordering::Acquire) {
            break;
        }

        let now = Instant::now();
        let due = matches!(next_deadline, Some(deadline) if now >= deadline);
        if shared.pending.swap(false, Ordering::AcqRel) || due {
            if due {
                next_deadline = period.map(|p| now + p);
            }
            if let Err(failure) = deferred_action(&deferred_action_argument) {
                error!("Deferred action of {:?} returned failure: {:?}", name, failure);
            }
            shared.runs.fetch_add(1, Ordering::AcqRel);
            continue;
        }

        match next_deadline {
            Some(deadline) => thread::park_timeout(deadline.saturating_duration_since(now)),
            None => thread::park(),
        }
    }
    trace!("deferred task {:?} exiting", name);
}
