use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::core::error::{Error, Result};
use crate::replica::proto::{ReplicaInfo, ReplicaStatus, Status};

/// In-memory table of the replicas a worker holds, keyed by
/// (database, chunk). Updated by completed replication and deletion
/// requests, queried by find requests.
#[derive(Default)]
pub struct ReplicaStore {
    worker: String,
    replicas: HashMap<(String, u32), ReplicaInfo>,
}

impl ReplicaStore {
    pub fn new(worker: String) -> Self {
        ReplicaStore {
            worker,
            replicas: HashMap::new(),
        }
    }

    pub fn put(&mut self, database: &str, chunk: u32, status: ReplicaStatus) {
        self.replicas.insert(
            (database.to_string(), chunk),
            ReplicaInfo {
                status,
                worker: self.worker.clone(),
                database: database.to_string(),
                chunk,
            },
        );
    }

    pub fn remove(&mut self, database: &str, chunk: u32) {
        self.replicas.remove(&(database.to_string(), chunk));
    }

    pub fn find(&self, database: &str, chunk: u32) -> ReplicaInfo {
        self.replicas
            .get(&(database.to_string(), chunk))
            .cloned()
            .unwrap_or(ReplicaInfo {
                status: ReplicaStatus::NotFound,
                worker: self.worker.clone(),
                database: database.to_string(),
                chunk,
            })
    }

    pub fn find_all(&self, database: &str) -> Vec<ReplicaInfo> {
        let mut out: Vec<ReplicaInfo> = self
            .replicas
            .values()
            .filter(|r| r.database == database)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.chunk);
        out
    }
}

/// Completion status of a worker-side request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRequestStatus {
    /// No processing has been attempted.
    None,
    InProgress,
    IsCancelling,
    Cancelled,
    Succeeded,
    Failed,
}

impl WorkerRequestStatus {
    pub fn to_protocol(self) -> Status {
        match self {
            WorkerRequestStatus::None => Status::Queued,
            WorkerRequestStatus::InProgress => Status::InProgress,
            WorkerRequestStatus::IsCancelling => Status::IsCancelling,
            WorkerRequestStatus::Cancelled => Status::Cancelled,
            WorkerRequestStatus::Succeeded => Status::Success,
            WorkerRequestStatus::Failed => Status::Failed,
        }
    }
}

/// The work a request performs once a processing thread picks it up.
#[derive(Debug, Clone)]
pub enum WorkerTask {
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
}

impl WorkerTask {
    /// Number of execute increments the task needs. Replication moves
    /// data and takes several steps; lookups are instantaneous.
    fn increments(&self) -> u32 {
        match self {
            WorkerTask::Replicate { .. } | WorkerTask::Delete { .. } => 3,
            WorkerTask::Find { .. } | WorkerTask::FindAll { .. } => 1,
        }
    }
}

/// A queued or executing request on the worker side.
///
/// `execute` performs a bounded amount of work per call and returns
/// false while more work remains; the processing thread re-checks
/// cancellation between calls. Cancellation of an in-flight request
/// surfaces as the typed Cancelled error, caught at the processing
/// thread boundary.
pub struct WorkerRequest {
    pub id: String,
    pub priority: i32,
    pub task: WorkerTask,
    pub status: WorkerRequestStatus,
    pub finished_at: Option<DateTime<Utc>>,
    pub replica: Option<ReplicaInfo>,
    pub replicas: Option<Vec<ReplicaInfo>>,
    progress: u32,
}

impl WorkerRequest {
    pub fn new(id: String, priority: i32, task: WorkerTask) -> Self {
        WorkerRequest {
            id,
            priority,
            task,
            status: WorkerRequestStatus::None,
            finished_at: None,
            replica: None,
            replicas: None,
            progress: 0,
        }
    }

    /// Run one work increment; true when the request is complete. Side
    /// effects apply on the final increment only, so a cancelled request
    /// leaves no partial state behind.
    pub fn execute(&mut self, store: &mut ReplicaStore, incremental: bool) -> Result<bool> {
        if self.status == WorkerRequestStatus::IsCancelling {
            self.status = WorkerRequestStatus::Cancelled;
            self.finished_at = Some(Utc::now());
            return Err(Error::cancelled());
        }
        self.status = WorkerRequestStatus::InProgress;
        if incremental {
            self.progress += 1;
        } else {
            self.progress = self.task.increments();
        }
        if self.progress < self.task.increments() {
            return Ok(false);
        }
        match &self.task {
            WorkerTask::Replicate { database, chunk, .. } => {
                store.put(database, *chunk, ReplicaStatus::Complete);
            }
            WorkerTask::Delete { database, chunk } => {
                store.remove(database, *chunk);
            }
            WorkerTask::Find { database, chunk } => {
                self.replica = Some(store.find(database, *chunk));
            }
            WorkerTask::FindAll { database } => {
                self.replicas = Some(store.find_all(database));
            }
        }
        self.status = WorkerRequestStatus::Succeeded;
        self.finished_at = Some(Utc::now());
        Ok(true)
    }

    /// Request cancellation. Unstarted requests cancel immediately;
    /// in-flight ones flip to IS_CANCELLING for the processing thread to
    /// observe.
    pub fn cancel(&mut self) {
        match self.status {
            WorkerRequestStatus::None | WorkerRequestStatus::Cancelled => {
                self.status = WorkerRequestStatus::Cancelled;
                self.finished_at.get_or_insert_with(Utc::now);
            }
            WorkerRequestStatus::InProgress | WorkerRequestStatus::IsCancelling => {
                self.status = WorkerRequestStatus::IsCancelling;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_is_incremental() {
        let mut store = ReplicaStore::new("w1".to_string());
        let mut req = WorkerRequest::new(
            "r1".to_string(),
            0,
            WorkerTask::Replicate {
                database: "db".to_string(),
                chunk: 7,
                source_worker: "w2".to_string(),
            },
        );
        assert!(!req.execute(&mut store, true).unwrap());
        assert_eq!(req.status, WorkerRequestStatus::InProgress);
        // no side effects until the final increment
        assert_eq!(store.find("db", 7).status, ReplicaStatus::NotFound);
        assert!(!req.execute(&mut store, true).unwrap());
        assert!(req.execute(&mut store, true).unwrap());
        assert_eq!(req.status, WorkerRequestStatus::Succeeded);
        assert_eq!(store.find("db", 7).status, ReplicaStatus::Complete);
    }

    #[test]
    fn test_non_incremental_execute_completes_at_once() {
        let mut store = ReplicaStore::new("w1".to_string());
        let mut req = WorkerRequest::new(
            "r1".to_string(),
            0,
            WorkerTask::Delete {
                database: "db".to_string(),
                chunk: 7,
            },
        );
        store.put("db", 7, ReplicaStatus::Complete);
        assert!(req.execute(&mut store, false).unwrap());
        assert_eq!(store.find("db", 7).status, ReplicaStatus::NotFound);
    }

    #[test]
    fn test_cancellation_between_increments() {
        let mut store = ReplicaStore::new("w1".to_string());
        let mut req = WorkerRequest::new(
            "r1".to_string(),
            0,
            WorkerTask::Replicate {
                database: "db".to_string(),
                chunk: 9,
                source_worker: "w2".to_string(),
            },
        );
        assert!(!req.execute(&mut store, true).unwrap());
        req.cancel();
        assert_eq!(req.status, WorkerRequestStatus::IsCancelling);
        let err = req.execute(&mut store, true).unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(req.status, WorkerRequestStatus::Cancelled);
        // cancelled replication left no replica behind
        assert_eq!(store.find("db", 9).status, ReplicaStatus::NotFound);
    }

    #[test]
    fn test_find_reports_store_contents() {
        let mut store = ReplicaStore::new("w1".to_string());
        store.put("db", 1, ReplicaStatus::Complete);
        store.put("db", 2, ReplicaStatus::Incomplete);
        store.put("other", 9, ReplicaStatus::Complete);
        let mut req = WorkerRequest::new(
            "r1".to_string(),
            0,
            WorkerTask::FindAll {
                database: "db".to_string(),
            },
        );
        assert!(req.execute(&mut store, true).unwrap());
        let replicas = req.replicas.unwrap();
        assert_eq!(replicas.len(), 2);
        assert_eq!(replicas[0].chunk, 1);
        assert_eq!(replicas[1].status, ReplicaStatus::Incomplete);
    }
}
