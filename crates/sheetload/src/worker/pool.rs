use std::any::Any;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, error, info, warn};

use crate::db::{job_repo, Database};
use crate::error::{ErrorKind, WorkerError};
use crate::worker::task::{Task, TaskResult};

/// Queue slots per worker thread. Submissions beyond this are rejected.
const QUEUE_DEPTH_PER_WORKER: usize = 64;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Runs one task to completion and records its outcome on the job.
///
/// `cancel` is raised when the task overruns its time budget; long-running
/// work must check it and bail out without committing.
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, task: Task, cancel: &AtomicBool) -> TaskResult;
}

type InFlight = Arc<Mutex<HashSet<String>>>;

struct WorkerShared {
    executor: Arc<dyn TaskExecutor>,
    db: Database,
    task_timeout: Duration,
    in_flight: InFlight,
    shutdown: Arc<AtomicBool>,
}

pub struct WorkerPool {
    task_sender: Sender<Task>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    in_flight: InFlight,
}

impl WorkerPool {
    /// Starts `worker_count` worker threads (at least one).
    ///
    /// `db` is used to record timeouts and panics, which the executor cannot
    /// report itself.
    pub fn new(
        executor: Arc<dyn TaskExecutor>,
        db: Database,
        worker_count: usize,
        task_timeout: Duration,
    ) -> Result<Self, WorkerError> {
        let worker_count = worker_count.max(1);
        let capacity = worker_count * QUEUE_DEPTH_PER_WORKER;
        let (task_sender, task_receiver) = bounded::<Task>(capacity);
        let shutdown = Arc::new(AtomicBool::new(false));
        let in_flight: InFlight = Arc::new(Mutex::new(HashSet::new()));

        let shared = Arc::new(WorkerShared {
            executor,
            db,
            task_timeout,
            in_flight: Arc::clone(&in_flight),
            shutdown: Arc::clone(&shutdown),
        });

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let task_rx = task_receiver.clone();
            let worker_shared = Arc::clone(&shared);

            let handle = thread::Builder::new()
                .name(format!("sheetload-worker-{}", worker_id))
                .spawn(move || run_worker(worker_id, task_rx, worker_shared))
                .map_err(|e| {
                    shutdown.store(true, Ordering::Relaxed);
                    WorkerError::SpawnFailed(e.to_string())
                })?;
            workers.push(handle);
        }

        info!(
            "Started {} workers (task timeout {}s)",
            worker_count,
            task_timeout.as_secs_f64()
        );

        Ok(Self {
            task_sender,
            workers,
            shutdown,
            in_flight,
        })
    }

    /// Queues a task without waiting for it to run.
    ///
    /// Rejects a job id that is already queued or running, and fails fast
    /// when the queue is full.
    pub fn submit(&self, task: Task) -> Result<(), WorkerError> {
        if self.is_shutdown() {
            return Err(WorkerError::ChannelClosed);
        }

        if !lock(&self.in_flight).insert(task.job_id.clone()) {
            return Err(WorkerError::AlreadyInFlight(task.job_id));
        }

        debug!("Queueing {} task for job {}", task.label(), task.job_id);
        match self.task_sender.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(task)) => {
                lock(&self.in_flight).remove(&task.job_id);
                Err(WorkerError::QueueFull)
            }
            Err(TrySendError::Disconnected(task)) => {
                lock(&self.in_flight).remove(&task.job_id);
                Err(WorkerError::ChannelClosed)
            }
        }
    }

    pub fn is_in_flight(&self, job_id: &str) -> bool {
        lock(&self.in_flight).contains(job_id)
    }

    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn wait(self) {
        // Dropping the sender wakes idle workers with a disconnect.
        drop(self.task_sender);

        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }

        info!("All workers have stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

fn lock(in_flight: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    in_flight.lock().unwrap_or_else(PoisonError::into_inner)
}

fn run_worker(
    worker_id: usize,
    task_receiver: Receiver<Task>,
    shared: Arc<WorkerShared>,
) {
    debug!("Worker {} started", worker_id);

    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            debug!("Worker {} received shutdown signal", worker_id);
            break;
        }

        match task_receiver.recv_timeout(POLL_INTERVAL) {
            Ok(task) => {
                let job_id = task.job_id.clone();
                debug!("Worker {} running {} task for job {}", worker_id, task.label(), job_id);

                let result = run_watched(worker_id, task, &shared);
                lock(&shared.in_flight).remove(&job_id);
                log_result(worker_id, &result);
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                debug!("Worker {} task channel disconnected", worker_id);
                break;
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}

/// Runs `task` on its own thread and waits at most the task timeout.
///
/// On expiry the cancel flag is raised and the job is failed with
/// `Timeout`; the task thread is left to notice the flag and roll back.
/// A task thread that dies without reporting fails the job as well.
fn run_watched(worker_id: usize, task: Task, shared: &WorkerShared) -> TaskResult {
    let job_id = task.job_id.clone();
    let started = Instant::now();
    let cancel = Arc::new(AtomicBool::new(false));
    let (done_tx, done_rx) = bounded::<TaskResult>(1);

    let executor = Arc::clone(&shared.executor);
    let task_cancel = Arc::clone(&cancel);
    let spawned = thread::Builder::new()
        .name(format!("sheetload-task-{}", worker_id))
        .spawn(move || {
            let result = executor.execute(task, &task_cancel);
            let _ = done_tx.send(result);
        });

    let handle = match spawned {
        Ok(handle) => handle,
        Err(e) => {
            return fail_job(
                shared,
                &job_id,
                ErrorKind::Internal,
                format!("Failed to start task thread: {}", e),
                started,
            );
        }
    };

    match done_rx.recv_timeout(shared.task_timeout) {
        Ok(result) => {
            let _ = handle.join();
            result
        }
        Err(RecvTimeoutError::Timeout) => {
            cancel.store(true, Ordering::Relaxed);
            warn!(
                "Job {} exceeded its time limit of {}s, cancelling",
                job_id,
                shared.task_timeout.as_secs_f64()
            );
            fail_job(
                shared,
                &job_id,
                ErrorKind::Timeout,
                format!(
                    "Task exceeded time limit of {}s",
                    shared.task_timeout.as_secs_f64()
                ),
                started,
            )
        }
        Err(RecvTimeoutError::Disconnected) => {
            let reason = match handle.join() {
                Err(payload) => panic_message(payload.as_ref()),
                Ok(()) => "task exited without a result".to_string(),
            };
            error!("Task for job {} panicked: {}", job_id, reason);
            fail_job(
                shared,
                &job_id,
                ErrorKind::Internal,
                format!("Task panicked: {}", reason),
                started,
            )
        }
    }
}

/// The job record already holds the outcome; this is the worker's trace of it.
fn log_result(worker_id: usize, result: &TaskResult) {
    let millis = result.duration.as_millis();
    if result.success {
        info!("Worker {} finished job {} in {}ms", worker_id, result.job_id, millis);
    } else {
        warn!(
            "Worker {} finished job {} in {}ms with {}: {}",
            worker_id,
            result.job_id,
            millis,
            result.error_kind.unwrap_or(ErrorKind::Internal),
            result.error.as_deref().unwrap_or("no detail")
        );
    }
}

fn fail_job(
    shared: &WorkerShared,
    job_id: &str,
    kind: ErrorKind,
    message: String,
    started: Instant,
) -> TaskResult {
    match job_repo::mark_failed(&shared.db, job_id, kind, &message) {
        Ok(true) => {}
        Ok(false) => debug!("Job {} was already terminal", job_id),
        Err(e) => error!("Failed to record failure of job {}: {}", job_id, e),
    }
    TaskResult::failure(job_id, kind, message, started.elapsed())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{IngestionType, JobStatus};

    /// Marks the job completed straight away.
    struct CompleteExecutor {
        db: Database,
    }

    impl TaskExecutor for CompleteExecutor {
        fn execute(&self, task: Task, _cancel: &AtomicBool) -> TaskResult {
            job_repo::mark_processing(&self.db, &task.job_id).unwrap();
            job_repo::mark_completed(&self.db, &task.job_id, &Default::default()).unwrap();
            TaskResult::success(task.job_id, Duration::ZERO)
        }
    }

    /// Holds the task until it is cancelled.
    struct StallExecutor {
        db: Database,
    }

    impl TaskExecutor for StallExecutor {
        fn execute(&self, task: Task, cancel: &AtomicBool) -> TaskResult {
            job_repo::mark_processing(&self.db, &task.job_id).unwrap();
            let deadline = Instant::now() + Duration::from_secs(10);
            while !cancel.load(Ordering::Relaxed) && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            // A late completion attempt must not resurrect the job.
            job_repo::mark_completed(&self.db, &task.job_id, &Default::default()).unwrap();
            TaskResult::success(task.job_id, Duration::ZERO)
        }
    }

    struct PanicExecutor;

    impl TaskExecutor for PanicExecutor {
        fn execute(&self, _task: Task, _cancel: &AtomicBool) -> TaskResult {
            panic!("boom");
        }
    }

    fn pending_job(db: &Database) -> String {
        let job = job_repo::JobRecord::new_pending(IngestionType::AnalyticsBuild, "");
        job_repo::insert(db, &job).unwrap();
        job.id
    }

    fn status(db: &Database, id: &str) -> job_repo::JobRecord {
        job_repo::find_by_id(db, id).unwrap().unwrap()
    }

    /// Polls until the job is terminal and the pool has let go of it.
    fn wait_done(pool: &WorkerPool, db: &Database, id: &str) -> job_repo::JobRecord {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let job = status(db, id);
            if job.status.is_terminal() && !pool.is_in_flight(id) {
                return job;
            }
            assert!(Instant::now() < deadline, "job {} still {}", id, job.status);
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_worker_pool_creation() {
        let db = Database::open_in_memory().unwrap();
        let executor = Arc::new(CompleteExecutor { db: db.clone() });
        let pool = WorkerPool::new(executor, db, 2, Duration::from_secs(5)).unwrap();

        assert!(!pool.is_shutdown());
        pool.shutdown();
        assert!(pool.is_shutdown());
        assert!(matches!(
            pool.submit(Task::analytics_build("late")),
            Err(WorkerError::ChannelClosed)
        ));
        pool.wait();
    }

    #[test]
    fn test_submit_and_complete() {
        let db = Database::open_in_memory().unwrap();
        let executor = Arc::new(CompleteExecutor { db: db.clone() });
        let pool = WorkerPool::new(executor, db.clone(), 2, Duration::from_secs(5)).unwrap();

        let id = pending_job(&db);
        pool.submit(Task::analytics_build(&id)).unwrap();

        let job = wait_done(&pool, &db, &id);
        assert_eq!(job.status, JobStatus::Completed, "Task failed: {:?}", job.error);

        pool.shutdown();
        pool.wait();
    }

    #[test]
    fn test_timeout_fails_job_and_blocks_late_completion() {
        let db = Database::open_in_memory().unwrap();
        let executor = Arc::new(StallExecutor { db: db.clone() });
        let pool = WorkerPool::new(executor, db.clone(), 1, Duration::from_millis(200)).unwrap();

        let id = pending_job(&db);
        pool.submit(Task::analytics_build(&id)).unwrap();

        let job = wait_done(&pool, &db, &id);
        assert_eq!(job.error_kind, Some(ErrorKind::Timeout));

        // Give the stalled thread time to observe the flag and try to complete.
        thread::sleep(Duration::from_millis(200));
        let job = status(&db, &id);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_kind, Some(ErrorKind::Timeout));

        pool.shutdown();
        pool.wait();
    }

    #[test]
    fn test_duplicate_in_flight_submission_rejected() {
        let db = Database::open_in_memory().unwrap();
        let executor = Arc::new(StallExecutor { db: db.clone() });
        let pool = WorkerPool::new(executor, db.clone(), 1, Duration::from_millis(300)).unwrap();

        let id = pending_job(&db);
        pool.submit(Task::analytics_build(&id)).unwrap();
        assert!(pool.is_in_flight(&id));
        assert!(matches!(
            pool.submit(Task::analytics_build(&id)),
            Err(WorkerError::AlreadyInFlight(_))
        ));

        wait_done(&pool, &db, &id);
        assert_eq!(pool.in_flight_count(), 0);

        pool.shutdown();
        pool.wait();
    }

    #[test]
    fn test_panicking_task_fails_job() {
        let db = Database::open_in_memory().unwrap();
        let pool = WorkerPool::new(Arc::new(PanicExecutor), db.clone(), 1, Duration::from_secs(5))
            .unwrap();

        let id = pending_job(&db);
        pool.submit(Task::analytics_build(&id)).unwrap();

        let job = wait_done(&pool, &db, &id);
        assert!(job.error.unwrap().contains("boom"));
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_kind, Some(ErrorKind::Internal));

        pool.shutdown();
        pool.wait();
    }

    #[test]
    fn test_pool_keeps_running_past_queue_capacity() {
        let db = Database::open_in_memory().unwrap();
        let executor = Arc::new(CompleteExecutor { db: db.clone() });
        let pool = WorkerPool::new(executor, db.clone(), 1, Duration::from_secs(5)).unwrap();

        // Three queues' worth of tasks, submitted in waves nobody drains.
        let mut ids = Vec::new();
        for _ in 0..3 {
            let wave: Vec<String> = (0..QUEUE_DEPTH_PER_WORKER).map(|_| pending_job(&db)).collect();
            for id in &wave {
                pool.submit(Task::analytics_build(id)).unwrap();
            }
            for id in &wave {
                wait_done(&pool, &db, id);
            }
            ids.extend(wave);
        }

        assert!(ids
            .iter()
            .all(|id| status(&db, id).status == JobStatus::Completed));
        assert_eq!(pool.in_flight_count(), 0);

        pool.shutdown();
        pool.wait();
    }
}
