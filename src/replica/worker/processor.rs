use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::replica::proto::{RequestResponse, ServiceState, Status};
use crate::replica::worker::request::{
    ReplicaStore, WorkerRequest, WorkerRequestStatus, WorkerTask,
};

/// Heap entry for the new-requests queue: highest priority first, FIFO
/// by arrival among equals.
struct NewEntry {
    priority: i32,
    seq: u64,
    id: String,
}

impl PartialEq for NewEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for NewEntry {}

impl PartialOrd for NewEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NewEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

struct ProcessorState {
    service: ServiceState,
    shutdown: bool,
    seq: u64,
    /// Priority order over the new queue; entries whose id has left
    /// `queued` are stale and skipped on pop.
    heap: BinaryHeap<NewEntry>,
    queued: HashMap<String, WorkerRequest>,
    /// id -> cancellation requested. The request object itself is held
    /// by the executing thread.
    in_progress: HashMap<String, bool>,
    finished: HashMap<String, WorkerRequest>,
    finished_order: Vec<String>,
    /// Threads currently holding a request.
    active: usize,
    store: ReplicaStore,
}

struct Inner {
    state: Mutex<ProcessorState>,
    cond: Condvar,
}

/// The worker-side request processor: a priority queue of new requests,
/// a fixed pool of processing threads, and the RUNNING /
/// SUSPEND_IN_PROGRESS / SUSPENDED service state machine.
///
/// Threads pull the highest-priority new request, move it to the
/// in-progress queue and run `execute` increments until it completes;
/// cancellation is cooperative and observed between increments. While
/// the service is suspending, threads finish the request they hold and
/// park without touching the new queue; the state reaches SUSPENDED
/// once no thread holds a request.
pub struct WorkerProcessor {
    inner: Arc<Inner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    num_threads: usize,
    /// Artificial per-increment latency, emulating the data movement a
    /// real replication service would perform.
    increment_delay: Duration,
}

impl WorkerProcessor {
    /// Construct a processor sized per the replication configuration.
    pub fn from_config(worker: String, config: &crate::core::config::ReplicaConfig) -> Self {
        WorkerProcessor::new(worker, config.worker_num_processing_threads, Duration::ZERO)
    }

    pub fn new(worker: String, num_threads: usize, increment_delay: Duration) -> Self {
        assert!(num_threads > 0, "the number of processing threads can't be 0");
        WorkerProcessor {
            inner: Arc::new(Inner {
                state: Mutex::new(ProcessorState {
                    service: ServiceState::Suspended,
                    shutdown: false,
                    seq: 0,
                    heap: BinaryHeap::new(),
                    queued: HashMap::new(),
                    in_progress: HashMap::new(),
                    finished: HashMap::new(),
                    finished_order: Vec::new(),
                    active: 0,
                    store: ReplicaStore::new(worker),
                }),
                cond: Condvar::new(),
            }),
            threads: Mutex::new(Vec::new()),
            num_threads,
            increment_delay,
        }
    }

    /// Begin (or resume) processing requests.
    pub fn run(&self) {
        {
            let mut st = self.inner.state.lock();
            st.service = ServiceState::Running;
            self.inner.cond.notify_all();
        }
        let mut threads = self.threads.lock();
        if threads.is_empty() {
            for _ in 0..self.num_threads {
                let inner = self.inner.clone();
                let delay = self.increment_delay;
                threads.push(std::thread::spawn(move || process_loop(inner, delay)));
            }
        }
    }

    /// Stop dequeuing new requests. In-flight requests run to
    /// completion; the state reaches SUSPENDED once the last one ends.
    pub fn stop(&self) {
        let mut st = self.inner.state.lock();
        if st.service == ServiceState::Running {
            st.service = if st.active == 0 {
                ServiceState::Suspended
            } else {
                ServiceState::SuspendInProgress
            };
            self.inner.cond.notify_all();
        }
    }

    /// Stop the processing threads for good.
    pub fn shutdown(&self) {
        {
            let mut st = self.inner.state.lock();
            st.shutdown = true;
            self.inner.cond.notify_all();
        }
        for t in self.threads.lock().drain(..) {
            let _ = t.join();
        }
    }

    pub fn state(&self) -> ServiceState {
        self.inner.state.lock().service
    }

    /// (num_new, num_in_progress, num_finished)
    pub fn counters(&self) -> (u64, u64, u64) {
        let st = self.inner.state.lock();
        (
            st.queued.len() as u64,
            st.in_progress.len() as u64,
            st.finished.len() as u64,
        )
    }

    /// Enqueue a request; the immediate reply is always QUEUED.
    pub fn enqueue(&self, id: String, priority: i32, task: WorkerTask) -> RequestResponse {
        let mut st = self.inner.state.lock();
        if st.queued.contains_key(&id) || st.in_progress.contains_key(&id) || st.finished.contains_key(&id)
        {
            return RequestResponse::of(Status::Bad);
        }
        log::debug!("worker enqueue {} priority {}", id, priority);
        let seq = st.seq;
        st.seq += 1;
        st.heap.push(NewEntry {
            priority,
            seq,
            id: id.clone(),
        });
        st.queued
            .insert(id.clone(), WorkerRequest::new(id, priority, task));
        self.inner.cond.notify_one();
        RequestResponse::of(Status::Queued)
    }

    /// Stop a request: drop it from the new queue, ask an in-flight one
    /// to cancel, or report the final status of a finished one.
    pub fn dequeue_or_cancel(&self, id: &str) -> RequestResponse {
        let mut st = self.inner.state.lock();
        if let Some(mut req) = st.queued.remove(id) {
            req.cancel();
            st.finished_order.push(id.to_string());
            st.finished.insert(id.to_string(), req);
            return RequestResponse::of(Status::Cancelled);
        }
        if let Some(cancelling) = st.in_progress.get_mut(id) {
            *cancelling = true;
            return RequestResponse::of(Status::IsCancelling);
        }
        if let Some(req) = st.finished.get(id) {
            return Self::response_of(req);
        }
        RequestResponse::of(Status::Bad)
    }

    /// Report the current status of a request without modifying it.
    pub fn check_status(&self, id: &str) -> RequestResponse {
        let st = self.inner.state.lock();
        if st.queued.contains_key(id) {
            return RequestResponse::of(Status::Queued);
        }
        if let Some(cancelling) = st.in_progress.get(id) {
            return RequestResponse::of(if *cancelling {
                Status::IsCancelling
            } else {
                Status::InProgress
            });
        }
        if let Some(req) = st.finished.get(id) {
            return Self::response_of(req);
        }
        RequestResponse::of(Status::Bad)
    }

    fn response_of(req: &WorkerRequest) -> RequestResponse {
        RequestResponse {
            status: req.status.to_protocol(),
            replica: req.replica.clone(),
            replicas: req.replicas.clone(),
        }
    }
}

impl Drop for WorkerProcessor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Pop the highest-priority live entry from the new queue.
fn pop_ready(st: &mut ProcessorState) -> Option<String> {
    while let Some(entry) = st.heap.pop() {
        if st.queued.contains_key(&entry.id) {
            return Some(entry.id);
        }
        // stale entry: the request was cancelled while queued
    }
    None
}

fn process_loop(inner: Arc<Inner>, delay: Duration) {
    loop {
        let mut st = inner.state.lock();
        let id = loop {
            if st.shutdown {
                return;
            }
            if st.service == ServiceState::Running {
                if let Some(id) = pop_ready(&mut st) {
                    break id;
                }
            }
            inner.cond.wait(&mut st);
        };
        let mut req = st.queued.remove(&id).expect("popped id is queued");
        st.in_progress.insert(id.clone(), false);
        st.active += 1;
        drop(st);

        loop {
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            let mut st = inner.state.lock();
            if st.in_progress.get(&id).copied().unwrap_or(false) {
                req.cancel();
            }
            match req.execute(&mut st.store, true) {
                Ok(false) => continue,
                Ok(true) => {
                    finalize(&inner, &mut st, id, req);
                    break;
                }
                Err(e) => {
                    if !e.is_cancelled() {
                        log::error!("worker request {} failed: {}", id, e);
                        req.status = WorkerRequestStatus::Failed;
                    }
                    finalize(&inner, &mut st, id, req);
                    break;
                }
            }
        }
    }
}

fn finalize(inner: &Inner, st: &mut ProcessorState, id: String, req: WorkerRequest) {
    st.in_progress.remove(&id);
    st.finished_order.push(id.clone());
    st.finished.insert(id, req);
    st.active -= 1;
    if st.service == ServiceState::SuspendInProgress && st.active == 0 {
        st.service = ServiceState::Suspended;
    }
    inner.cond.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn replicate(chunk: u32) -> WorkerTask {
        WorkerTask::Replicate {
            database: "db".to_string(),
            chunk,
            source_worker: "w2".to_string(),
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_enqueue_and_complete() {
        let p = WorkerProcessor::new("w1".to_string(), 2, Duration::ZERO);
        p.run();
        let r = p.enqueue("a".to_string(), 0, replicate(1));
        assert_eq!(r.status, Status::Queued);
        wait_until(|| p.check_status("a").status == Status::Success);
        assert_eq!(p.counters(), (0, 0, 1));
        p.shutdown();
    }

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let p = WorkerProcessor::new("w1".to_string(), 1, Duration::ZERO);
        p.enqueue("a".to_string(), 0, replicate(1));
        assert_eq!(p.enqueue("a".to_string(), 0, replicate(2)).status, Status::Bad);
    }

    #[test]
    fn test_priority_order_with_fifo_ties() {
        // not running: requests stay queued while we set the order up
        let p = WorkerProcessor::new("w1".to_string(), 1, Duration::ZERO);
        p.enqueue("low".to_string(), 1, replicate(1));
        p.enqueue("high".to_string(), 5, replicate(2));
        p.enqueue("mid-a".to_string(), 3, replicate(3));
        p.enqueue("mid-b".to_string(), 3, replicate(4));
        let mut st = p.inner.state.lock();
        let order: Vec<String> = std::iter::from_fn(|| pop_ready(&mut st)).collect();
        assert_eq!(order, ["high", "mid-a", "mid-b", "low"]);
    }

    #[test]
    fn test_dequeue_or_cancel_transitions() {
        let p = WorkerProcessor::new("w1".to_string(), 1, Duration::from_millis(20));
        // queued request: removed and reported CANCELLED
        p.enqueue("q".to_string(), 0, replicate(1));
        assert_eq!(p.dequeue_or_cancel("q").status, Status::Cancelled);
        assert_eq!(p.check_status("q").status, Status::Cancelled);
        // unknown request: BAD
        assert_eq!(p.dequeue_or_cancel("nope").status, Status::Bad);

        // in-flight request: IS_CANCELLING, then CANCELLED
        p.run();
        p.enqueue("r".to_string(), 0, replicate(2));
        wait_until(|| p.check_status("r").status == Status::InProgress);
        assert_eq!(p.dequeue_or_cancel("r").status, Status::IsCancelling);
        wait_until(|| p.check_status("r").status == Status::Cancelled);
        // a finished request reports its terminal status from then on
        assert_eq!(p.dequeue_or_cancel("r").status, Status::Cancelled);
        p.shutdown();
    }

    #[test]
    fn test_suspend_finishes_in_flight_requests() {
        let p = WorkerProcessor::new("w1".to_string(), 2, Duration::from_millis(20));
        p.run();
        // one finished request
        p.enqueue("f".to_string(), 0, replicate(1));
        wait_until(|| p.counters().2 == 1);
        // two in-progress requests
        p.enqueue("a".to_string(), 0, replicate(2));
        p.enqueue("b".to_string(), 0, replicate(3));
        wait_until(|| p.counters().1 == 2);
        // three new requests behind them
        p.enqueue("c".to_string(), 0, replicate(4));
        p.enqueue("d".to_string(), 0, replicate(5));
        p.enqueue("e".to_string(), 0, replicate(6));
        p.stop();
        assert_ne!(p.state(), ServiceState::Running);
        wait_until(|| p.state() == ServiceState::Suspended);
        // in-progress requests completed; new ones were left untouched
        assert_eq!(p.counters(), (3, 0, 3));
        // resuming drains the rest
        p.run();
        wait_until(|| p.counters() == (0, 0, 6));
        p.shutdown();
    }
}
