//! Worker-thread preparation of upload data
//!
//! The main thread issues an [`UploadTicket`] per object that wants data
//! prepared in the background. Results come back tagged with the ticket's
//! id and are applied on the main thread only while the ticket is alive;
//! results for objects destroyed in the meantime are dropped.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UploadId(u64);

impl UploadId {
    pub fn get(self) -> u64 {
        self.0
    }
}

type LiveSet = Arc<Mutex<HashSet<UploadId>>>;

/// Owned by the object waiting for data; dropping it cancels delivery.
#[derive(Debug)]
pub struct UploadTicket {
    id: UploadId,
    live: LiveSet,
}

impl UploadTicket {
    pub fn id(&self) -> UploadId {
        self.id
    }
}

impl Drop for UploadTicket {
    fn drop(&mut self) {
        self.live.lock().remove(&self.id);
    }
}

type Job<T> = (UploadId, Box<dyn FnOnce() -> T + Send>);

pub struct UploadQueue<T: Send + 'static> {
    next_id: u64,
    live: LiveSet,
    jobs: Option<Sender<Job<T>>>,
    results: Receiver<(UploadId, T)>,
    worker: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> UploadQueue<T> {
    pub fn new(name: &str) -> std::io::Result<Self> {
        let (job_tx, job_rx) = mpsc::channel::<Job<T>>();
        let (result_tx, result_rx) = mpsc::channel();

        let worker = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for (id, job) in job_rx {
                    if result_tx.send((id, job())).is_err() {
                        break;
                    }
                }
            })?;

        Ok(Self {
            next_id: 1,
            live: Arc::new(Mutex::new(HashSet::new())),
            jobs: Some(job_tx),
            results: result_rx,
            worker: Some(worker),
        })
    }

    /// Issues a fresh, never reused id
    pub fn issue(&mut self) -> UploadTicket {
        let id = UploadId(self.next_id);
        self.next_id += 1;
        self.live.lock().insert(id);
        UploadTicket {
            id,
            live: self.live.clone(),
        }
    }

    /// Runs `job` on the worker thread for `ticket`'s owner
    pub fn submit(&self, ticket: &UploadTicket, job: impl FnOnce() -> T + Send + 'static) {
        if let Some(jobs) = &self.jobs {
            if jobs.send((ticket.id, Box::new(job))).is_err() {
                log::warn!("Upload worker is gone, job {:?} dropped", ticket.id);
            }
        }
    }

    pub fn is_live(&self, id: UploadId) -> bool {
        self.live.lock().contains(&id)
    }

    /// Applies finished jobs whose owners still exist.
    ///
    /// Returns the number of results applied.
    pub fn process_main_thread_tasks(&mut self, mut apply: impl FnMut(UploadId, T)) -> usize {
        let mut applied = 0;
        while let Ok((id, payload)) = self.results.try_recv() {
            if self.is_live(id) {
                apply(id, payload);
                applied += 1;
            } else {
                log::trace!("Dropping upload {id:?}, owner was destroyed");
            }
        }
        applied
    }

    /// Blocks until the next result arrives, then processes everything ready.
    ///
    /// `None` when the worker has exited and nothing more will arrive.
    pub fn wait_and_process(&mut self, mut apply: impl FnMut(UploadId, T)) -> Option<usize> {
        let Ok((id, payload)) = self.results.recv() else {
            return None;
        };
        let mut applied = 0;
        if self.is_live(id) {
            apply(id, payload);
            applied += 1;
        }
        Some(applied + self.process_main_thread_tasks(apply))
    }
}

impl<T: Send + 'static> Drop for UploadQueue<T> {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Tracks bytes written to staging memory since the GPU last caught up
#[derive(Debug)]
pub struct TransferBudget {
    threshold: u64,
    pending: u64,
}

impl TransferBudget {
    pub const DEFAULT_THRESHOLD: u64 = 64 * 1024 * 1024;

    pub fn new(threshold: u64) -> Self {
        Self {
            threshold: threshold.max(1),
            pending: 0,
        }
    }

    pub fn pending(&self) -> u64 {
        self.pending
    }

    /// Records `bytes`; true when the caller must wait for the GPU
    pub fn add(&mut self, bytes: u64) -> bool {
        self.pending += bytes;
        self.pending > self.threshold
    }

    pub fn reset(&mut self) {
        self.pending = 0;
    }
}

impl Default for TransferBudget {
    fn default() -> Self {
        Self::new(Self::DEFAULT_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn ids_are_monotonic() {
        let mut queue = UploadQueue::<u32>::new("upload-test").unwrap();
        let a = queue.issue();
        let b = queue.issue();
        assert!(b.id() > a.id());
        drop(a);
        let c = queue.issue();
        assert!(c.id() > b.id());
    }

    #[test]
    fn results_for_live_owners_are_applied() {
        init_logging();
        let mut queue = UploadQueue::new("upload-test").unwrap();
        let ticket = queue.issue();
        queue.submit(&ticket, || vec![1u8, 2, 3]);

        let mut got = Vec::new();
        let applied = queue.wait_and_process(|id, data| got.push((id, data)));
        assert_eq!(applied, Some(1));
        assert_eq!(got, vec![(ticket.id(), vec![1, 2, 3])]);
    }

    #[test]
    fn results_for_destroyed_owners_are_dropped() {
        init_logging();
        let mut queue = UploadQueue::new("upload-test").unwrap();
        let ticket = queue.issue();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        queue.submit(&ticket, move || {
            gate_rx.recv().ok();
            7u32
        });

        let id = ticket.id();
        drop(ticket);
        assert!(!queue.is_live(id));
        gate_tx.send(()).unwrap();

        let applied = queue.wait_and_process(|_, _| panic!("stale upload applied"));
        assert_eq!(applied, Some(0));
    }

    #[test]
    fn budget_trips_past_threshold() {
        let mut budget = TransferBudget::new(100);
        assert!(!budget.add(60));
        assert!(!budget.add(40));
        assert!(budget.add(1));
        budget.reset();
        assert_eq!(budget.pending(), 0);
        assert_eq!(TransferBudget::default().threshold, 64 * 1024 * 1024);
    }
}
