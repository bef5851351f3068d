//! Client-side request machinery.
//!
//! One driver future implements the shared lifecycle -
//! connect, send, receive, analyze, poll, retry, expire, cancel - and a
//! tagged `RequestKind` supplies the per-kind first message and response
//! analysis. All state transitions happen on the controller's event-loop
//! thread.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::core::error::{Error, ErrorKind, Result};
use crate::replica::proto::{
    self, ManagementBody, ManagementKind, ReplicaInfo, ReplicaRequestKind, RequestHeader,
    RequestResponse, ServiceKind, ServiceResponse, ServiceState, Status,
};

/// Primary public state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Constructed; no attempt to execute it has been made.
    Created,
    /// The request is in progress.
    InProgress,
    /// Terminal; see the extended state for the completion status.
    Finished,
}

/// Refined sub-state; `None` exactly while the request is unfinished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendedState {
    None,
    Success,
    ClientError,
    ServerBad,
    ServerError,
    ServerQueued,
    ServerInProgress,
    ServerIsCancelling,
    ServerCancelled,
    Expired,
    Cancelled,
}

/// The typed payload of a request.
#[derive(Debug, Clone)]
pub enum RequestKind {
    Replicate {
        database: String,
        chunk: u32,
        source_worker: String,
    },
    Delete {
        database: String,
        chunk: u32,
    },
    Find {
        database: String,
        chunk: u32,
    },
    FindAll {
        database: String,
    },
    Stop {
        target_id: String,
        target: ReplicaRequestKind,
    },
    StatusOf {
        target_id: String,
        target: ReplicaRequestKind,
    },
    ServiceSuspend,
    ServiceResume,
    ServiceStatus,
}

impl RequestKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            RequestKind::Replicate { .. } => "REPLICA_CREATE",
            RequestKind::Delete { .. } => "REPLICA_DELETE",
            RequestKind::Find { .. } => "REPLICA_FIND",
            RequestKind::FindAll { .. } => "REPLICA_FIND_ALL",
            RequestKind::Stop { .. } => "REQUEST_STOP",
            RequestKind::StatusOf { .. } => "REQUEST_STATUS",
            RequestKind::ServiceSuspend => "SERVICE_SUSPEND",
            RequestKind::ServiceResume => "SERVICE_RESUME",
            RequestKind::ServiceStatus => "SERVICE_STATUS",
        }
    }

    /// The replica sub-type used in status probes for this kind, when
    /// the kind is pollable.
    fn replica_kind(&self) -> Option<ReplicaRequestKind> {
        match self {
            RequestKind::Replicate { .. } => Some(ReplicaRequestKind::Create),
            RequestKind::Delete { .. } => Some(ReplicaRequestKind::Delete),
            RequestKind::Find { .. } => Some(ReplicaRequestKind::Find),
            RequestKind::FindAll { .. } => Some(ReplicaRequestKind::FindAll),
            _ => None,
        }
    }
}

/// Data carried by successful responses, readable once the request is
/// FINISHED::SUCCESS.
#[derive(Debug, Clone, Default)]
pub struct ResponseData {
    pub replica: Option<ReplicaInfo>,
    pub replicas: Option<Vec<ReplicaInfo>>,
    pub service_state: Option<ServiceState>,
    pub num_new: u64,
    pub num_in_progress: u64,
    pub num_finished: u64,
}

struct RequestInner {
    state: RequestState,
    extended_state: ExtendedState,
    response: ResponseData,
}

/// Shared view of one request, owned by the controller registry and
/// handed to callers and callbacks.
pub struct RequestShared {
    pub id: String,
    pub worker: String,
    pub priority: i32,
    pub kind: RequestKind,
    inner: Mutex<RequestInner>,
    cancel: Notify,
}

/// Cloneable handle to a request.
#[derive(Clone)]
pub struct RequestHandle(pub(crate) Arc<RequestShared>);

impl RequestHandle {
    pub(crate) fn new(worker: String, priority: i32, kind: RequestKind) -> Self {
        RequestHandle(Arc::new(RequestShared {
            id: uuid::Uuid::new_v4().to_string(),
            worker,
            priority,
            kind,
            inner: Mutex::new(RequestInner {
                state: RequestState::Created,
                extended_state: ExtendedState::None,
                response: ResponseData::default(),
            }),
            cancel: Notify::new(),
        }))
    }

    pub fn id(&self) -> &str {
        &self.0.id
    }

    pub fn worker(&self) -> &str {
        &self.0.worker
    }

    pub fn priority(&self) -> i32 {
        self.0.priority
    }

    pub fn kind(&self) -> &RequestKind {
        &self.0.kind
    }

    pub fn state(&self) -> RequestState {
        self.0.inner.lock().state
    }

    pub fn extended_state(&self) -> ExtendedState {
        self.0.inner.lock().extended_state
    }

    /// Debugging context string.
    pub fn context(&self) -> String {
        let inner = self.0.inner.lock();
        format!(
            "{}  {}  {:?}::{:?}  ",
            self.0.id,
            self.0.kind.type_name(),
            inner.state,
            inner.extended_state
        )
    }

    /// Response payload; only usable in FINISHED::SUCCESS.
    pub fn response_data(&self) -> Result<ResponseData> {
        let inner = self.0.inner.lock();
        if inner.state != RequestState::Finished
            || inner.extended_state != ExtendedState::Success
        {
            return Err(Error::new(
                ErrorKind::InvalidState,
                "response data is only available in FINISHED::SUCCESS".to_string(),
            ));
        }
        Ok(inner.response.clone())
    }

    /// Abort pending I/O and finish with CANCELLED. The remote side is
    /// not informed; issue a separate STOP request to terminate remote
    /// work.
    pub fn cancel(&self) {
        // notify_one stores a permit, so cancelling before the driver
        // reaches its select point still takes effect
        self.0.cancel.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.state() == RequestState::Finished
    }

    fn set_state(&self, state: RequestState, extended: ExtendedState) {
        let mut inner = self.0.inner.lock();
        if inner.state == RequestState::Finished {
            return; // late completions are ignored
        }
        log::debug!("{}setState {:?}::{:?}", self.context(), state, extended);
        inner.state = state;
        inner.extended_state = extended;
    }

    fn finish(&self, extended: ExtendedState, response: Option<ResponseData>) {
        let mut inner = self.0.inner.lock();
        if inner.state == RequestState::Finished {
            return;
        }
        inner.state = RequestState::Finished;
        inner.extended_state = extended;
        if let Some(r) = response {
            inner.response = r;
        }
    }
}

/// Timeouts driving retries and expiration.
#[derive(Debug, Clone, Copy)]
pub struct RequestTimeouts {
    /// Backoff after transport errors; also the status poll interval.
    pub retry: Duration,
    /// Total lifetime limit; None disables expiration.
    pub expiration: Option<Duration>,
}

/// Run a request against the given worker address until it reaches a
/// terminal state. Returns the extended state the request finished with.
pub(crate) async fn drive(handle: RequestHandle, address: String, timeouts: RequestTimeouts) {
    handle.set_state(RequestState::InProgress, ExtendedState::None);
    let protocol = run_protocol(&handle, &address, timeouts.retry);
    let outcome = match timeouts.expiration {
        Some(limit) => {
            tokio::select! {
                r = protocol => r,
                _ = handle.0.cancel.notified() => (ExtendedState::Cancelled, None),
                _ = tokio::time::sleep(limit) => (ExtendedState::Expired, None),
            }
        }
        None => {
            tokio::select! {
                r = protocol => r,
                _ = handle.0.cancel.notified() => (ExtendedState::Cancelled, None),
            }
        }
    };
    handle.finish(outcome.0, outcome.1);
}

/// The retry loop: any transport error resets the exchange and retries
/// after the configured backoff; protocol and logical errors are
/// terminal.
async fn run_protocol(
    handle: &RequestHandle,
    address: &str,
    retry: Duration,
) -> (ExtendedState, Option<ResponseData>) {
    loop {
        match attempt(handle, address, retry).await {
            Ok(outcome) => return outcome,
            Err(e) if e.kind == ErrorKind::Protocol => {
                log::warn!("{}protocol error: {}", handle.context(), e);
                return (ExtendedState::ServerBad, None);
            }
            Err(e) => {
                log::debug!("{}transport error, restarting: {}", handle.context(), e);
                handle.set_state(RequestState::Created, ExtendedState::None);
                tokio::time::sleep(retry).await;
                handle.set_state(RequestState::InProgress, ExtendedState::None);
            }
        }
    }
}

/// One full exchange: connect, send the opening message, then analyze
/// responses (polling with status probes for pollable kinds) until a
/// terminal status arrives.
async fn attempt(
    handle: &RequestHandle,
    address: &str,
    retry: Duration,
) -> Result<(ExtendedState, Option<ResponseData>)> {
    let shared = &handle.0;
    let mut stream = TcpStream::connect(address).await?;
    match &shared.kind {
        RequestKind::Replicate {
            database,
            chunk,
            source_worker,
        } => {
            let header = RequestHeader::Replica(ReplicaRequestKind::Create);
            proto::write_frame(&mut stream, &header).await?;
            let body = proto::ReplicateBody {
                priority: shared.priority,
                id: shared.id.clone(),
                database: database.clone(),
                chunk: *chunk,
                source_worker: source_worker.clone(),
            };
            proto::write_frame(&mut stream, &body).await?;
            poll_to_completion(handle, stream, ReplicaRequestKind::Create, retry).await
        }
        RequestKind::Delete { database, chunk } => {
            proto::write_frame(&mut stream, &RequestHeader::Replica(ReplicaRequestKind::Delete))
                .await?;
            let body = proto::DeleteBody {
                priority: shared.priority,
                id: shared.id.clone(),
                database: database.clone(),
                chunk: *chunk,
            };
            proto::write_frame(&mut stream, &body).await?;
            poll_to_completion(handle, stream, ReplicaRequestKind::Delete, retry).await
        }
        RequestKind::Find { database, chunk } => {
            proto::write_frame(&mut stream, &RequestHeader::Replica(ReplicaRequestKind::Find))
                .await?;
            let body = proto::FindBody {
                priority: shared.priority,
                id: shared.id.clone(),
                database: database.clone(),
                chunk: *chunk,
            };
            proto::write_frame(&mut stream, &body).await?;
            poll_to_completion(handle, stream, ReplicaRequestKind::Find, retry).await
        }
        RequestKind::FindAll { database } => {
            proto::write_frame(&mut stream, &RequestHeader::Replica(ReplicaRequestKind::FindAll))
                .await?;
            let body = proto::FindAllBody {
                priority: shared.priority,
                id: shared.id.clone(),
                database: database.clone(),
            };
            proto::write_frame(&mut stream, &body).await?;
            poll_to_completion(handle, stream, ReplicaRequestKind::FindAll, retry).await
        }
        RequestKind::Stop { target_id, target } => {
            let header = RequestHeader::Management {
                kind: ManagementKind::Stop,
                target: *target,
            };
            proto::write_frame(&mut stream, &header).await?;
            let body = ManagementBody {
                id: target_id.clone(),
            };
            proto::write_frame(&mut stream, &body).await?;
            let response: RequestResponse = proto::read_frame(&mut stream).await?;
            Ok(analyze_terminal(&response))
        }
        RequestKind::StatusOf { target_id, target } => {
            let header = RequestHeader::Management {
                kind: ManagementKind::Status,
                target: *target,
            };
            proto::write_frame(&mut stream, &header).await?;
            let body = ManagementBody {
                id: target_id.clone(),
            };
            proto::write_frame(&mut stream, &body).await?;
            let response: RequestResponse = proto::read_frame(&mut stream).await?;
            Ok(analyze_terminal(&response))
        }
        RequestKind::ServiceSuspend | RequestKind::ServiceResume | RequestKind::ServiceStatus => {
            let kind = match &shared.kind {
                RequestKind::ServiceSuspend => ServiceKind::Suspend,
                RequestKind::ServiceResume => ServiceKind::Resume,
                _ => ServiceKind::Status,
            };
            proto::write_frame(&mut stream, &RequestHeader::Service(kind)).await?;
            let response: ServiceResponse = proto::read_frame(&mut stream).await?;
            let data = ResponseData {
                service_state: Some(response.service_state),
                num_new: response.num_new,
                num_in_progress: response.num_in_progress,
                num_finished: response.num_finished,
                ..ResponseData::default()
            };
            let ext = match response.status {
                Status::Success => ExtendedState::Success,
                Status::Failed => ExtendedState::ServerError,
                _ => ExtendedState::ServerBad,
            };
            Ok((ext, Some(data)))
        }
    }
}

/// Read the submission response, then probe with REQUEST_STATUS on the
/// configured interval until the worker reports a terminal status.
async fn poll_to_completion(
    handle: &RequestHandle,
    mut stream: TcpStream,
    kind: ReplicaRequestKind,
    retry: Duration,
) -> Result<(ExtendedState, Option<ResponseData>)> {
    let mut response: RequestResponse = proto::read_frame(&mut stream).await?;
    loop {
        match response.status {
            Status::Success => {
                let data = ResponseData {
                    replica: response.replica.take(),
                    replicas: response.replicas.take(),
                    ..ResponseData::default()
                };
                return Ok((ExtendedState::Success, Some(data)));
            }
            Status::Queued | Status::InProgress | Status::IsCancelling => {
                let observed = match response.status {
                    Status::Queued => ExtendedState::ServerQueued,
                    Status::InProgress => ExtendedState::ServerInProgress,
                    _ => ExtendedState::ServerIsCancelling,
                };
                handle.set_state(RequestState::InProgress, ExtendedState::None);
                log::debug!("{}remote status {:?}", handle.context(), observed);
                // wait, then probe for status
                tokio::time::sleep(retry).await;
                let header = RequestHeader::Management {
                    kind: ManagementKind::Status,
                    target: kind,
                };
                proto::write_frame(&mut stream, &header).await?;
                let body = ManagementBody {
                    id: handle.0.id.clone(),
                };
                proto::write_frame(&mut stream, &body).await?;
                response = proto::read_frame(&mut stream).await?;
            }
            Status::Bad => return Ok((ExtendedState::ServerBad, None)),
            Status::Failed => return Ok((ExtendedState::ServerError, None)),
            Status::Cancelled => return Ok((ExtendedState::ServerCancelled, None)),
        }
    }
}

/// Stop and status requests finish immediately with the mapped remote
/// status.
fn analyze_terminal(response: &RequestResponse) -> (ExtendedState, Option<ResponseData>) {
    let data = ResponseData {
        replica: response.replica.clone(),
        replicas: response.replicas.clone(),
        ..ResponseData::default()
    };
    match response.status {
        Status::Success => (ExtendedState::Success, Some(data)),
        Status::Queued => (ExtendedState::ServerQueued, None),
        Status::InProgress => (ExtendedState::ServerInProgress, None),
        Status::IsCancelling => (ExtendedState::ServerIsCancelling, None),
        Status::Cancelled => (ExtendedState::ServerCancelled, None),
        Status::Failed => (ExtendedState::ServerError, None),
        Status::Bad => (ExtendedState::ServerBad, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_uuid_strings() {
        let h = RequestHandle::new(
            "w1".to_string(),
            0,
            RequestKind::FindAll {
                database: "db".to_string(),
            },
        );
        assert_eq!(h.id().len(), 36);
        assert_eq!(h.state(), RequestState::Created);
        assert_eq!(h.extended_state(), ExtendedState::None);
    }

    #[test]
    fn test_finished_state_is_immutable() {
        let h = RequestHandle::new(
            "w1".to_string(),
            0,
            RequestKind::Delete {
                database: "db".to_string(),
                chunk: 1,
            },
        );
        h.finish(ExtendedState::Success, None);
        h.set_state(RequestState::InProgress, ExtendedState::None);
        h.finish(ExtendedState::Cancelled, None);
        assert_eq!(h.state(), RequestState::Finished);
        assert_eq!(h.extended_state(), ExtendedState::Success);
    }

    #[test]
    fn test_response_data_requires_success() {
        let h = RequestHandle::new(
            "w1".to_string(),
            0,
            RequestKind::Find {
                database: "db".to_string(),
                chunk: 1,
            },
        );
        assert!(h.response_data().is_err());
        h.finish(ExtendedState::Success, Some(ResponseData::default()));
        assert!(h.response_data().is_ok());
    }
}
