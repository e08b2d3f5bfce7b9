//! Background I/O jobs.
//!
//! Blocking system calls (closing a file, fsyncing the append log) are handed
//! to one worker thread per job kind so the command thread never waits on
//! the disk. Workers only ever see the file handle they were given; they never
//! touch the keyspace.

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fs::File;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    CloseFile,
    AofFsync,
}

impl JobKind {
    pub const ALL: [JobKind; 2] = [JobKind::CloseFile, JobKind::AofFsync];

    fn index(self) -> usize {
        match self {
            JobKind::CloseFile => 0,
            JobKind::AofFsync => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            JobKind::CloseFile => "close_file",
            JobKind::AofFsync => "aof_fsync",
        }
    }
}

#[derive(Debug)]
pub enum Job {
    /// Deferred close: the handle is dropped on the worker.
    CloseFile(File),
    /// Deferred data sync of the append log.
    AofFsync(File),
}

impl Job {
    pub fn kind(&self) -> JobKind {
        match self {
            Job::CloseFile(_) => JobKind::CloseFile,
            Job::AofFsync(_) => JobKind::AofFsync,
        }
    }

    fn run(self) {
        match self {
            Job::CloseFile(file) => drop(file),
            Job::AofFsync(file) => {
                if let Err(e) = file.sync_data() {
                    warn!("background fsync failed: {}", e);
                }
            }
        }
    }
}

/// Fire-and-forget job submission.
pub trait JobSubmitter {
    fn submit(&self, job: Job);
}

struct Pending {
    counts: [u64; 2],
    /// Creation time (unix seconds) of each queued job, oldest first.
    created: [VecDeque<u64>; 2],
}

struct Shared {
    pending: Mutex<Pending>,
    done: Condvar,
}

pub struct BackgroundJobs {
    senders: Vec<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl BackgroundJobs {
    /// Spawn one worker per job kind.
    pub fn start() -> Self {
        let shared = Arc::new(Shared {
            pending: Mutex::new(Pending {
                counts: [0; 2],
                created: [VecDeque::new(), VecDeque::new()],
            }),
            done: Condvar::new(),
        });
        let mut senders = Vec::with_capacity(JobKind::ALL.len());
        let mut workers = Vec::with_capacity(JobKind::ALL.len());
        for kind in JobKind::ALL {
            let (tx, rx) = channel::unbounded();
            let state = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("bio-{}", kind.name()))
                .spawn(move || worker_loop(kind, rx, state));
            match handle {
                Ok(h) => workers.push(h),
                Err(e) => warn!("failed to spawn bio worker {}: {}", kind.name(), e),
            }
            senders.push(tx);
            debug!("bio worker {} started", kind.name());
        }
        BackgroundJobs {
            senders,
            workers,
            shared,
        }
    }

    pub fn pending_jobs_of_type(&self, kind: JobKind) -> u64 {
        self.shared.pending.lock().counts[kind.index()]
    }

    /// Unix time in seconds of the oldest queued job of `kind`.
    pub fn oldest_job_of_type(&self, kind: JobKind) -> Option<u64> {
        self.shared.pending.lock().created[kind.index()].front().copied()
    }

    /// Block until at most `num` jobs of `kind` are pending.
    pub fn wait_pending_jobs_le(&self, kind: JobKind, num: u64) {
        let mut pending = self.shared.pending.lock();
        while pending.counts[kind.index()] > num {
            self.shared.done.wait(&mut pending);
        }
    }

    /// Close the queues and join the workers once they drain.
    pub fn kill_threads(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.senders.clear();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("bio worker panicked");
            }
        }
    }
}

impl JobSubmitter for BackgroundJobs {
    fn submit(&self, job: Job) {
        let idx = job.kind().index();
        {
            let mut pending = self.shared.pending.lock();
            pending.counts[idx] += 1;
            pending.created[idx].push_back(unix_secs());
        }
        if let Err(e) = self.senders[idx].send(job) {
            // Worker gone: run inline so the caller's intent still happens.
            complete(&self.shared, idx);
            e.into_inner().run();
        }
    }
}

impl Drop for BackgroundJobs {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Runs jobs on the calling thread. Used when worker threads are disabled.
#[derive(Debug, Default)]
pub struct InlineJobs;

impl JobSubmitter for InlineJobs {
    fn submit(&self, job: Job) {
        job.run();
    }
}

fn worker_loop(kind: JobKind, rx: Receiver<Job>, shared: Arc<Shared>) {
    for job in rx.iter() {
        job.run();
        complete(&shared, kind.index());
    }
    debug!("bio worker {} stopped", kind.name());
}

fn complete(shared: &Shared, idx: usize) {
    let mut pending = shared.pending.lock();
    pending.counts[idx] = pending.counts[idx].saturating_sub(1);
    pending.created[idx].pop_front();
    shared.done.notify_all();
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_fsync_jobs_drain() {
        let jobs = BackgroundJobs::start();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"appendonly").unwrap();
        for _ in 0..8 {
            jobs.submit(Job::AofFsync(file.try_clone().unwrap()));
        }
        jobs.wait_pending_jobs_le(JobKind::AofFsync, 0);
        assert_eq!(jobs.pending_jobs_of_type(JobKind::AofFsync), 0);
        assert_eq!(jobs.oldest_job_of_type(JobKind::AofFsync), None);
        jobs.kill_threads();
    }

    #[test]
    fn test_close_file_job() {
        let jobs = BackgroundJobs::start();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("temp.rdb");
        let file = File::create(&path).unwrap();
        jobs.submit(Job::CloseFile(file));
        jobs.wait_pending_jobs_le(JobKind::CloseFile, 0);
        assert_eq!(jobs.pending_jobs_of_type(JobKind::CloseFile), 0);
        assert!(path.exists());
    }

    #[test]
    fn test_inline_jobs() {
        let file = tempfile::tempfile().unwrap();
        InlineJobs.submit(Job::AofFsync(file.try_clone().unwrap()));
        InlineJobs.submit(Job::CloseFile(file));
    }
}
