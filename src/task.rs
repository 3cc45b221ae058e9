//! Sharded background task executor.
//!
//! `W` workers, each a single thread draining its own FIFO queue. A task
//! carries a steering id — the xxh64 of the remote path it touches — and
//! `submit` routes it to worker `id % W`. Two tasks with the same id
//! therefore land in the same FIFO and run in submission order, which is
//! what keeps per-path write-backs ordered. There is no ordering across
//! different ids.
//!
//! Each worker owns a [`WorkerCtx`] with a lazily opened SFTP session,
//! reused across tasks and closed when the worker shuts down. Task errors
//! (and panics) are logged and never kill the worker.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::sftp::{SftpError, SftpSession, SshConfig};

/// Per-worker state handed to every task the worker runs.
pub struct WorkerCtx {
    ssh: SshConfig,
    session: Option<SftpSession>,
}

impl WorkerCtx {
    fn new(ssh: SshConfig) -> Self {
        Self { ssh, session: None }
    }

    /// The worker's private SFTP session, opened on first use. Dropping
    /// the context (at worker exit) closes it.
    pub fn sftp(&mut self) -> Result<&SftpSession, SftpError> {
        match self.session {
            Some(ref session) => Ok(session),
            None => {
                let session = SftpSession::connect(&self.ssh)?;
                Ok(self.session.insert(session))
            }
        }
    }
}

type TaskFn = Box<dyn FnOnce(&mut WorkerCtx) -> Result<(), SftpError> + Send>;

pub struct Task {
    id: u64,
    run: TaskFn,
}

impl Task {
    pub fn new(
        id: u64,
        run: impl FnOnce(&mut WorkerCtx) -> Result<(), SftpError> + Send + 'static,
    ) -> Self {
        Self { id, run: Box::new(run) }
    }
}

struct QueueState {
    tasks: VecDeque<Task>,
    busy: bool,
    stopping: bool,
}

struct WorkerShared {
    state: Mutex<QueueState>,
    cond: Condvar,
}

struct Worker {
    shared: std::sync::Arc<WorkerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    fn spawn(index: usize, ssh: SshConfig) -> Self {
        let shared = std::sync::Arc::new(WorkerShared {
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                busy: false,
                stopping: false,
            }),
            cond: Condvar::new(),
        });
        let loop_shared = shared.clone();
        let thread = thread::Builder::new()
            .name(format!("sftpfs-worker-{index}"))
            .spawn(move || worker_loop(loop_shared, ssh))
            .ok();
        if thread.is_none() {
            warn!("failed to spawn worker {index}");
        }
        Self {
            shared,
            thread: Mutex::new(thread),
        }
    }
}

fn worker_loop(shared: std::sync::Arc<WorkerShared>, ssh: SshConfig) {
    let mut ctx = WorkerCtx::new(ssh);
    loop {
        let task = {
            let mut st = shared.state.lock();
            loop {
                if let Some(task) = st.tasks.pop_front() {
                    st.busy = true;
                    break Some(task);
                }
                if st.stopping {
                    break None;
                }
                shared.cond.wait(&mut st);
            }
        };
        let Some(task) = task else { break };
        let id = task.id;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (task.run)(&mut ctx)));
        match outcome {
            Ok(Ok(())) => debug!("task {id:#018x} done"),
            Ok(Err(e)) => warn!("task {id:#018x} failed: {e}"),
            Err(_) => warn!("task {id:#018x} panicked"),
        }
        let mut st = shared.state.lock();
        st.busy = false;
        shared.cond.notify_all();
    }
    // ctx drops here, closing the worker's session.
}

pub struct TaskExecutorService {
    workers: Vec<Worker>,
}

impl TaskExecutorService {
    pub fn new(workers: usize, ssh: SshConfig) -> Self {
        let workers = workers.max(1);
        Self {
            workers: (0..workers).map(|i| Worker::spawn(i, ssh.clone())).collect(),
        }
    }

    fn worker_for(&self, id: u64) -> &Worker {
        &self.workers[(id % self.workers.len() as u64) as usize]
    }

    /// Enqueue on the worker the task id steers to. Tasks submitted after
    /// shutdown are dropped.
    pub fn submit(&self, task: Task) {
        let worker = self.worker_for(task.id);
        let mut st = worker.shared.state.lock();
        if st.stopping {
            warn!("task {:#018x} submitted after shutdown, dropped", task.id);
            return;
        }
        st.tasks.push_back(task);
        worker.shared.cond.notify_all();
    }

    /// Block until the worker owning `id` has an empty queue and is idle.
    /// Afterwards the side effects of every previously submitted task with
    /// this id are visible.
    pub fn wait(&self, id: u64) {
        let worker = self.worker_for(id);
        let mut st = worker.shared.state.lock();
        while st.busy || !st.tasks.is_empty() {
            worker.shared.cond.wait(&mut st);
        }
    }

    /// Drain every queue, stop the workers and join them. Safe to call
    /// more than once.
    pub fn shutdown(&self) {
        for worker in &self.workers {
            let mut st = worker.shared.state.lock();
            st.stopping = true;
            worker.shared.cond.notify_all();
        }
        for worker in &self.workers {
            let handle = worker.thread.lock().take();
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    warn!("worker thread panicked during shutdown");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn test_ssh() -> SshConfig {
        // Never connected: test tasks do not touch ctx.sftp().
        SshConfig {
            host: "localhost".into(),
            port: 22,
            user: "nobody".into(),
            password: None,
            key_file: None,
            passphrase: None,
        }
    }

    #[test]
    fn same_id_tasks_run_in_submission_order() {
        let pool = TaskExecutorService::new(4, test_ssh());
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..32u32 {
            let order = order.clone();
            pool.submit(Task::new(7, move |_| {
                order.lock().push(n);
                Ok(())
            }));
        }
        pool.wait(7);
        assert_eq!(*order.lock(), (0..32).collect::<Vec<_>>());
        pool.shutdown();
    }

    #[test]
    fn wait_observes_prior_side_effects() {
        let pool = TaskExecutorService::new(2, test_ssh());
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        pool.submit(Task::new(42, move |_| {
            thread::sleep(Duration::from_millis(50));
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        pool.wait(42);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        pool.shutdown();
    }

    #[test]
    fn failing_task_does_not_kill_worker() {
        let pool = TaskExecutorService::new(1, test_ssh());
        let hits = Arc::new(AtomicU32::new(0));
        pool.submit(Task::new(1, |_| {
            Err(SftpError::Io(std::io::Error::other("boom")))
        }));
        let h = hits.clone();
        pool.submit(Task::new(1, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        pool.wait(1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        pool.shutdown();
    }

    #[test]
    fn shutdown_drains_pending_tasks() {
        let pool = TaskExecutorService::new(2, test_ssh());
        let hits = Arc::new(AtomicU32::new(0));
        for id in 0..16u64 {
            let h = hits.clone();
            pool.submit(Task::new(id, move |_| {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        pool.shutdown();
        assert_eq!(hits.load(Ordering::SeqCst), 16);
        // Second shutdown is a no-op.
        pool.shutdown();
    }
}
