//! Background task pool for checkpoint processing, backfill and buffer drains.
//!
//! Tasks are registered once and then woken with [`TaskHandle::notify`]. A
//! task is never run by two workers at once: a notify that lands while the
//! task runs is remembered and causes exactly one more run.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskPoolError {
    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// What a task wants after a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Sleep until notified.
    Done,
    /// Run again as soon as a worker is free.
    Reschedule,
    /// Run again after the delay, or earlier if notified.
    Snooze(Duration),
}

pub trait Task: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn run(&self) -> TaskOutcome;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EntryState {
    Idle,
    Queued,
    Running,
    RunningNotified,
    Snoozed,
}

struct Entry {
    task: Arc<dyn Task>,
    state: Mutex<EntryState>,
    cancelled: AtomicBool,
}

impl Entry {
    fn state(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum Job {
    Run(Arc<Entry>),
    Shutdown,
}

enum TimerCmd {
    Wake(Instant, Arc<Entry>),
    Shutdown,
}

/// Handle to a registered task.
#[derive(Clone)]
pub struct TaskHandle {
    entry: Arc<Entry>,
    jobs: Option<Sender<Job>>,
}

impl TaskHandle {
    /// A handle with no pool behind it; notify is a no-op and the owner
    /// drives the task by hand.
    pub fn detached(task: Arc<dyn Task>) -> Self {
        Self {
            entry: Arc::new(Entry {
                task,
                state: Mutex::new(EntryState::Idle),
                cancelled: AtomicBool::new(false),
            }),
            jobs: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.entry.task.name()
    }

    /// Wake the task. Returns false if it is cancelled or has no pool.
    pub fn notify(&self) -> bool {
        let Some(jobs) = &self.jobs else {
            return false;
        };
        if self.entry.cancelled.load(Ordering::Acquire) {
            return false;
        }
        schedule(&self.entry, jobs);
        true
    }

    /// Stop scheduling the task. A run already in progress finishes.
    pub fn cancel(&self) {
        self.entry.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.entry.cancelled.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("task", &self.name())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

fn schedule(entry: &Arc<Entry>, jobs: &Sender<Job>) {
    let mut state = entry.state();
    match *state {
        EntryState::Idle | EntryState::Snoozed => {
            *state = EntryState::Queued;
            if jobs.send(Job::Run(Arc::clone(entry))).is_err() {
                *state = EntryState::Idle;
            }
        }
        EntryState::Running => *state = EntryState::RunningNotified,
        EntryState::Queued | EntryState::RunningNotified => {}
    }
}

struct PoolInner {
    jobs: Sender<Job>,
    timer: Sender<TimerCmd>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    workers: usize,
    shut_down: AtomicBool,
}

#[derive(Clone)]
pub struct TaskPool {
    inner: Arc<PoolInner>,
}

impl TaskPool {
    pub fn start(workers: usize) -> Result<Self, TaskPoolError> {
        let workers = workers.max(1);
        let (jobs_tx, jobs_rx) = unbounded::<Job>();
        let (timer_tx, timer_rx) = unbounded::<TimerCmd>();
        let mut threads = Vec::with_capacity(workers + 1);

        for index in 0..workers {
            let name = format!("dcp-worker-{index}");
            let rx = jobs_rx.clone();
            let tx = jobs_tx.clone();
            let timer = timer_tx.clone();
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || run_worker(rx, tx, timer))
                .map_err(|source| TaskPoolError::Spawn { name, source })?;
            threads.push(handle);
        }

        let tx = jobs_tx.clone();
        let handle = thread::Builder::new()
            .name("dcp-timer".to_string())
            .spawn(move || run_timer(timer_rx, tx))
            .map_err(|source| TaskPoolError::Spawn {
                name: "dcp-timer".to_string(),
                source,
            })?;
        threads.push(handle);

        tracing::debug!(workers, "task pool started");
        Ok(Self {
            inner: Arc::new(PoolInner {
                jobs: jobs_tx,
                timer: timer_tx,
                threads: Mutex::new(threads),
                workers,
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    pub fn workers(&self) -> usize {
        self.inner.workers
    }

    /// Register a task. It does not run until notified.
    pub fn register(&self, task: Arc<dyn Task>) -> TaskHandle {
        let entry = Arc::new(Entry {
            task,
            state: Mutex::new(EntryState::Idle),
            cancelled: AtomicBool::new(false),
        });
        let shut_down = self.inner.shut_down.load(Ordering::Acquire);
        TaskHandle {
            entry,
            jobs: (!shut_down).then(|| self.inner.jobs.clone()),
        }
    }

    /// Stop every thread and wait for them. Later notifies are dropped.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for _ in 0..self.inner.workers {
            let _ = self.inner.jobs.send(Job::Shutdown);
        }
        let _ = self.inner.timer.send(TimerCmd::Shutdown);
        let threads = std::mem::take(
            &mut *self
                .inner
                .threads
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let current = thread::current().id();
        for handle in threads {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("task pool thread panicked");
            }
        }
        tracing::debug!("task pool stopped");
    }
}

fn run_worker(jobs: Receiver<Job>, requeue: Sender<Job>, timer: Sender<TimerCmd>) {
    while let Ok(job) = jobs.recv() {
        let entry = match job {
            Job::Run(entry) => entry,
            Job::Shutdown => break,
        };
        if entry.cancelled.load(Ordering::Acquire) {
            *entry.state() = EntryState::Idle;
            continue;
        }
        *entry.state() = EntryState::Running;
        tracing::trace!(task = entry.task.name(), "task run");
        let outcome = entry.task.run();

        let mut state = entry.state();
        if entry.cancelled.load(Ordering::Acquire) {
            *state = EntryState::Idle;
            continue;
        }
        let notified = *state == EntryState::RunningNotified;
        match outcome {
            TaskOutcome::Reschedule => {
                *state = EntryState::Queued;
                let _ = requeue.send(Job::Run(Arc::clone(&entry)));
            }
            TaskOutcome::Done if notified => {
                *state = EntryState::Queued;
                let _ = requeue.send(Job::Run(Arc::clone(&entry)));
            }
            TaskOutcome::Done => *state = EntryState::Idle,
            TaskOutcome::Snooze(_) if notified => {
                *state = EntryState::Queued;
                let _ = requeue.send(Job::Run(Arc::clone(&entry)));
            }
            TaskOutcome::Snooze(delay) => {
                *state = EntryState::Snoozed;
                let _ = timer.send(TimerCmd::Wake(Instant::now() + delay, Arc::clone(&entry)));
            }
        }
    }
}

fn run_timer(cmds: Receiver<TimerCmd>, jobs: Sender<Job>) {
    let mut heap: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
    let mut sleeping: HashMap<u64, Arc<Entry>> = HashMap::new();
    let next_id = AtomicU64::new(0);

    loop {
        let cmd = match heap.peek() {
            Some(Reverse((deadline, _))) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                match cmds.recv_timeout(wait) {
                    Ok(cmd) => Some(cmd),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match cmds.recv() {
                Ok(cmd) => Some(cmd),
                Err(_) => break,
            },
        };

        match cmd {
            Some(TimerCmd::Wake(deadline, entry)) => {
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                heap.push(Reverse((deadline, id)));
                sleeping.insert(id, entry);
            }
            Some(TimerCmd::Shutdown) => break,
            None => {}
        }

        let now = Instant::now();
        while let Some(Reverse((deadline, id))) = heap.peek().copied() {
            if deadline > now {
                break;
            }
            heap.pop();
            let Some(entry) = sleeping.remove(&id) else {
                continue;
            };
            if entry.cancelled.load(Ordering::Acquire) {
                continue;
            }
            let mut state = entry.state();
            if *state == EntryState::Snoozed {
                *state = EntryState::Queued;
                let _ = jobs.send(Job::Run(Arc::clone(&entry)));
            }
        }
    }
}
