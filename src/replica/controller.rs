use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::core::config::ReplicaConfig;
use crate::core::error::{Error, ErrorKind, Result};
use crate::replica::proto::ReplicaRequestKind;
use crate::replica::request::{self, RequestHandle, RequestKind, RequestTimeouts};

/// Completion callback, invoked exactly once on the event-loop thread.
/// Callbacks run before the request leaves the registry and must not
/// block.
pub type RequestCallback = Box<dyn FnOnce(RequestHandle) + Send + 'static>;

struct EventLoop {
    handle: tokio::runtime::Handle,
    stop_tx: Option<tokio::sync::oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

/// The replication master: owns a single background event loop and a
/// registry of active requests. Each typed factory validates its
/// arguments, registers the new request with a completion hook that
/// erases it, and starts it on the loop.
pub struct Controller {
    config: ReplicaConfig,
    registry: Arc<Mutex<HashMap<String, RequestHandle>>>,
    event_loop: Mutex<Option<EventLoop>>,
}

impl Controller {
    pub fn new(config: ReplicaConfig) -> Self {
        Controller {
            config,
            registry: Arc::new(Mutex::new(HashMap::new())),
            event_loop: Mutex::new(None),
        }
    }

    /// Start the event loop thread. A no-op when already running.
    pub fn run(&self) -> Result<()> {
        let mut el = self.event_loop.lock();
        if el.is_some() {
            return Ok(());
        }
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let handle = rt.handle().clone();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let thread = std::thread::Builder::new()
            .name("controller-io".to_string())
            .spawn(move || {
                rt.block_on(async {
                    let _ = stop_rx.await;
                });
            })?;
        *el = Some(EventLoop {
            handle,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        });
        Ok(())
    }

    /// Stop the event loop and join its thread. Unfinished requests are
    /// dropped.
    pub fn stop(&self) {
        let el = self.event_loop.lock().take();
        if let Some(mut el) = el {
            if let Some(tx) = el.stop_tx.take() {
                let _ = tx.send(());
            }
            if let Some(t) = el.thread.take() {
                let _ = t.join();
            }
        }
        self.registry.lock().clear();
    }

    /// Block until the event loop exits.
    pub fn join(&self) {
        let thread = self
            .event_loop
            .lock()
            .as_mut()
            .and_then(|el| el.thread.take());
        if let Some(t) = thread {
            let _ = t.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.event_loop.lock().is_some()
    }

    fn timeouts(&self) -> RequestTimeouts {
        RequestTimeouts {
            retry: Duration::from_secs(self.config.retry_timeout_secs.max(1)),
            expiration: (self.config.controller_request_timeout_secs > 0)
                .then(|| Duration::from_secs(self.config.controller_request_timeout_secs)),
        }
    }

    /// Register and start a request; the completion hook notifies the
    /// caller before erasing the registry entry, so callbacks may call
    /// back into the controller.
    fn submit(
        &self,
        worker: String,
        priority: i32,
        kind: RequestKind,
        on_finish: Option<RequestCallback>,
    ) -> Result<RequestHandle> {
        let address = self.config.worker_address(&worker)?.to_string();
        let el = self.event_loop.lock();
        let Some(el) = el.as_ref() else {
            return Err(Error::new(
                ErrorKind::InvalidState,
                "the controller is not running".to_string(),
            ));
        };
        let handle = RequestHandle::new(worker, priority, kind);
        self.registry
            .lock()
            .insert(handle.id().to_string(), handle.clone());
        let registry = self.registry.clone();
        let timeouts = self.timeouts();
        let request = handle.clone();
        el.handle.spawn(async move {
            request::drive(request.clone(), address, timeouts).await;
            if let Some(cb) = on_finish {
                cb(request.clone());
            }
            registry.lock().remove(request.id());
        });
        Ok(handle)
    }

    /// Replicate a chunk from one worker onto another.
    pub fn replicate(
        &self,
        database: &str,
        chunk: u32,
        source_worker: &str,
        destination_worker: &str,
        priority: i32,
        on_finish: Option<RequestCallback>,
    ) -> Result<RequestHandle> {
        if database.is_empty() {
            return Err(Error::config("empty database name"));
        }
        if source_worker == destination_worker {
            return Err(Error::config(
                "the source and destination workers must differ",
            ));
        }
        self.config.worker_address(source_worker)?;
        self.submit(
            destination_worker.to_string(),
            priority,
            RequestKind::Replicate {
                database: database.to_string(),
                chunk,
                source_worker: source_worker.to_string(),
            },
            on_finish,
        )
    }

    /// Delete a chunk replica on a worker.
    pub fn delete_replica(
        &self,
        database: &str,
        chunk: u32,
        worker: &str,
        priority: i32,
        on_finish: Option<RequestCallback>,
    ) -> Result<RequestHandle> {
        if database.is_empty() {
            return Err(Error::config("empty database name"));
        }
        self.submit(
            worker.to_string(),
            priority,
            RequestKind::Delete {
                database: database.to_string(),
                chunk,
            },
            on_finish,
        )
    }

    /// Look a single replica up on a worker.
    pub fn find_replica(
        &self,
        database: &str,
        chunk: u32,
        worker: &str,
        priority: i32,
        on_finish: Option<RequestCallback>,
    ) -> Result<RequestHandle> {
        self.submit(
            worker.to_string(),
            priority,
            RequestKind::Find {
                database: database.to_string(),
                chunk,
            },
            on_finish,
        )
    }

    /// Enumerate the replicas of a database on a worker.
    pub fn find_all_replicas(
        &self,
        database: &str,
        worker: &str,
        priority: i32,
        on_finish: Option<RequestCallback>,
    ) -> Result<RequestHandle> {
        self.submit(
            worker.to_string(),
            priority,
            RequestKind::FindAll {
                database: database.to_string(),
            },
            on_finish,
        )
    }

    /// Order a worker to stop a previously submitted request.
    pub fn stop_request(
        &self,
        worker: &str,
        target_id: &str,
        target: ReplicaRequestKind,
        on_finish: Option<RequestCallback>,
    ) -> Result<RequestHandle> {
        self.submit(
            worker.to_string(),
            0,
            RequestKind::Stop {
                target_id: target_id.to_string(),
                target,
            },
            on_finish,
        )
    }

    /// Ask a worker for the status of a previously submitted request.
    pub fn status_of_request(
        &self,
        worker: &str,
        target_id: &str,
        target: ReplicaRequestKind,
        on_finish: Option<RequestCallback>,
    ) -> Result<RequestHandle> {
        self.submit(
            worker.to_string(),
            0,
            RequestKind::StatusOf {
                target_id: target_id.to_string(),
                target,
            },
            on_finish,
        )
    }

    pub fn suspend_worker_service(
        &self,
        worker: &str,
        on_finish: Option<RequestCallback>,
    ) -> Result<RequestHandle> {
        self.submit(worker.to_string(), 0, RequestKind::ServiceSuspend, on_finish)
    }

    pub fn resume_worker_service(
        &self,
        worker: &str,
        on_finish: Option<RequestCallback>,
    ) -> Result<RequestHandle> {
        self.submit(worker.to_string(), 0, RequestKind::ServiceResume, on_finish)
    }

    pub fn worker_service_status(
        &self,
        worker: &str,
        on_finish: Option<RequestCallback>,
    ) -> Result<RequestHandle> {
        self.submit(worker.to_string(), 0, RequestKind::ServiceStatus, on_finish)
    }

    /// Snapshot of every active request.
    pub fn active_requests(&self) -> Vec<RequestHandle> {
        self.registry.lock().values().cloned().collect()
    }

    /// Snapshot of active requests of one kind.
    fn active_matching(&self, pred: impl Fn(&RequestKind) -> bool) -> Vec<RequestHandle> {
        self.registry
            .lock()
            .values()
            .filter(|h| pred(h.kind()))
            .cloned()
            .collect()
    }

    pub fn active_replications(&self) -> Vec<RequestHandle> {
        self.active_matching(|k| matches!(k, RequestKind::Replicate { .. }))
    }

    pub fn active_stop_requests(&self) -> Vec<RequestHandle> {
        self.active_matching(|k| matches!(k, RequestKind::Stop { .. }))
    }

    pub fn active_status_inquiries(&self) -> Vec<RequestHandle> {
        self.active_matching(|k| matches!(k, RequestKind::StatusOf { .. }))
    }

    pub fn num_active(&self) -> usize {
        self.registry.lock().len()
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.stop();
    }
}
