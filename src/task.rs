//! Cooperative background tasks and the scheduler that owns their threads
//! (spec §5, §9), replacing the spec's "ad-hoc poll/kick objects" with one OS
//! thread per background task per the Design Notes redesign guidance.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::error::Result;

struct TaskHandle {
    stop_flag: Arc<AtomicBool>,
    wakeup: Arc<(Mutex<()>, Condvar)>,
    join: Option<JoinHandle<()>>,
}

impl TaskHandle {
    fn signal_stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
        let (lock, cv) = &*self.wakeup;
        let _guard = lock.lock();
        cv.notify_all();
    }
}

/// Owns one background OS thread per registered task (journal flusher,
/// journal copier, cleanup worker, checkpoint proposer) and stops them all
/// deterministically on drop.
#[derive(Default)]
pub struct Scheduler {
    tasks: Mutex<Vec<TaskHandle>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler { tasks: Mutex::new(Vec::new()) }
    }

    /// Spawns a thread that calls `run_one` repeatedly, sleeping
    /// `poll_interval` between iterations (or until [`Scheduler::shutdown`]
    /// wakes it early). `run_one` closes over a `Weak` reference to whatever
    /// it operates on, per spec §9's "background tasks hold a
    /// `Weak<EngineInner>`" so shutdown does not keep the engine alive.
    pub fn spawn(&self, name: &'static str, poll_interval: Duration, run_one: impl Fn() -> Result<()> + Send + Sync + 'static) {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let wakeup = Arc::new((Mutex::new(()), Condvar::new()));
        let task_stop = stop_flag.clone();
        let task_wakeup = wakeup.clone();
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while !task_stop.load(Ordering::Acquire) {
                    if let Err(err) = run_one() {
                        warn!(task = name, error = %err, "background task iteration failed");
                    }
                    let (lock, cv) = &*task_wakeup;
                    let mut guard = lock.lock();
                    if task_stop.load(Ordering::Acquire) {
                        break;
                    }
                    cv.wait_for(&mut guard, poll_interval);
                }
            })
            .expect("spawning background task thread");
        self.tasks.lock().push(TaskHandle { stop_flag, wakeup, join: Some(join) });
    }

    /// Signals every task's stop flag, wakes it, and joins its thread.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock();
        for task in tasks.iter() {
            task.signal_stop();
        }
        for task in tasks.iter_mut() {
            if let Some(join) = task.join.take() {
                let _ = join.join();
            }
        }
        tasks.clear();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
